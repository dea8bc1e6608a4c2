use crate::emit::MissingFieldPolicy;
use crate::resolve::OrderKind;
use crate::select::SelectionSpec;
use bestrun_core::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

const NLI_TEMPLATE: &str = r#"
echo "{attention}	{artifact}";
build/esim --test \
--saved-model {artifact} \
--dataset {dataset} \
--attn {attention} \
--batch-size {batch_size} \
--sparsemap-eta {SM_eta} \
--sparsemap-max-iter {SM_maxit} \
--sparsemap-max-active-set-iter {SM_ASET_maxit} \
--sparsemap-residual-thr {SM_thr} \
--dynet-mem 1024;
"#;

const TAGGER_TEMPLATE: &str = r#"
echo "{strategy}	{artifact}";
build/tagger --test \
--saved-model {artifact} \
--dataset {dataset} \
--dim {dim} \
--batch-size {batch_size} \
--gcn-layers {gcn_layers} \
--drop 0 \
--tree {strategy} \
--budget {gcn_budget} \
--sparsemap-eta {SM_eta} \
--sparsemap-max-iter {SM_maxit} \
--sparsemap-max-active-set-iter {SM_ASET_maxit} \
--sparsemap-residual-thr 1e-4 \
--dynet-mem 1024;
"#;

/// Everything one invocation needs besides its input and output paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub group_column: String,
    pub metric_column: String,
    #[serde(default)]
    pub display_column: Option<String>,
    #[serde(default)]
    pub prefix_tag: Option<String>,
    #[serde(default)]
    pub report_columns: Vec<String>,
    pub export_columns: Vec<String>,
    pub template: String,
    pub script_name: String,
    #[serde(default = "default_separator")]
    pub separator: String,
    #[serde(default)]
    pub order: OrderKind,
    #[serde(default)]
    pub on_missing_field: MissingFieldPolicy,
}

fn default_separator() -> String {
    "\n".to_string()
}

/// Partial config read from a YAML file; present keys replace preset values.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigOverrides {
    pub group_column: Option<String>,
    pub metric_column: Option<String>,
    pub display_column: Option<String>,
    pub prefix_tag: Option<String>,
    pub report_columns: Option<Vec<String>>,
    pub export_columns: Option<Vec<String>>,
    pub template: Option<String>,
    pub script_name: Option<String>,
    pub separator: Option<String>,
    pub order: Option<OrderKind>,
    pub on_missing_field: Option<MissingFieldPolicy>,
}

impl ConfigOverrides {
    pub fn load(path: &Path) -> Result<Self> {
        let config_err = |reason: String| PipelineError::Config {
            path: path.to_path_buf(),
            reason,
        };
        let text = std::fs::read_to_string(path).map_err(|e| config_err(e.to_string()))?;
        serde_yaml::from_str(&text).map_err(|e| config_err(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    /// Sentence-pair runs grouped by attention mechanism, ranked by accuracy.
    Nli,
    /// Tagging runs grouped by run name, ranked by F1.
    Tagger,
}

impl Preset {
    pub const ALL: [Preset; 2] = [Preset::Nli, Preset::Tagger];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nli => "nli",
            Self::Tagger => "tagger",
        }
    }

    pub fn config(self) -> PipelineConfig {
        match self {
            Self::Nli => PipelineConfig {
                group_column: "attention".to_string(),
                metric_column: "best_valid_acc".to_string(),
                display_column: Some("lr".to_string()),
                prefix_tag: Some("reimp".to_string()),
                report_columns: strings(&["fn_prefix", "Run ID", "Name", "attention", "lr", "best_valid_acc"]),
                export_columns: strings(&[
                    "fn_prefix",
                    "Run ID",
                    "attention",
                    "SM_ASET_maxit",
                    "SM_eta",
                    "SM_maxit",
                    "SM_thr",
                    "batch_size",
                    "dataset",
                    "normalize_embed",
                    "update_embed",
                    "best_valid_acc",
                ]),
                template: NLI_TEMPLATE.to_string(),
                script_name: "run_test_nli.sh".to_string(),
                separator: default_separator(),
                order: OrderKind::Lexicographic,
                on_missing_field: MissingFieldPolicy::Abort,
            },
            Self::Tagger => PipelineConfig {
                group_column: "Name".to_string(),
                metric_column: "best_valid_f1".to_string(),
                display_column: Some("lr".to_string()),
                prefix_tag: None,
                report_columns: strings(&[
                    "fn_prefix",
                    "Run ID",
                    "Name",
                    "strategy",
                    "lr",
                    "best_valid_f1",
                    "gcn_budget",
                    "SM_eta",
                    "dim",
                ]),
                export_columns: strings(&[
                    "fn_prefix",
                    "Run ID",
                    "Name",
                    "strategy",
                    "SM_ASET_maxit",
                    "SM_eta",
                    "SM_maxit",
                    "SM_thr",
                    "batch_size",
                    "dataset",
                    "best_valid_f1",
                    "dim",
                    "gcn_layers",
                    "gcn_budget",
                ]),
                template: TAGGER_TEMPLATE.to_string(),
                script_name: "run_test_tag.sh".to_string(),
                separator: default_separator(),
                order: OrderKind::Lexicographic,
                on_missing_field: MissingFieldPolicy::Abort,
            },
        }
    }
}

impl std::str::FromStr for Preset {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| PipelineError::Config {
                path: "<preset>".into(),
                reason: format!("unknown preset '{}'", s),
            })
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl PipelineConfig {
    pub fn with_overrides(mut self, o: ConfigOverrides) -> Self {
        if let Some(v) = o.group_column {
            self.group_column = v;
        }
        if let Some(v) = o.metric_column {
            self.metric_column = v;
        }
        if let Some(v) = o.display_column {
            self.display_column = Some(v);
        }
        if let Some(v) = o.prefix_tag {
            self.prefix_tag = Some(v);
        }
        if let Some(v) = o.report_columns {
            self.report_columns = v;
        }
        if let Some(v) = o.export_columns {
            self.export_columns = v;
        }
        if let Some(v) = o.template {
            self.template = v;
        }
        if let Some(v) = o.script_name {
            self.script_name = v;
        }
        if let Some(v) = o.separator {
            self.separator = v;
        }
        if let Some(v) = o.order {
            self.order = v;
        }
        if let Some(v) = o.on_missing_field {
            self.on_missing_field = v;
        }
        self
    }

    pub fn selection_spec(&self) -> SelectionSpec {
        SelectionSpec {
            group_column: self.group_column.clone(),
            metric_column: self.metric_column.clone(),
            display_column: self.display_column.clone(),
            report_columns: self.report_columns.clone(),
            export_columns: self.export_columns.clone(),
            prefix_tag: self.prefix_tag.clone(),
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| PipelineError::Config {
            path: "<yaml>".into(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::Template;
    use tempfile::TempDir;

    #[test]
    fn preset_templates_parse_and_reference_known_fields() {
        for preset in Preset::ALL {
            let cfg = preset.config();
            let tpl = Template::parse(&cfg.template).expect("preset template");
            assert!(tpl.fields().any(|f| f == "artifact"), "{}", preset.as_str());
        }
    }

    #[test]
    fn both_presets_pass_the_max_active_set_flag() {
        for preset in Preset::ALL {
            let template = preset.config().template;
            assert!(
                template.contains("--sparsemap-max-active-set-iter {SM_ASET_maxit}"),
                "{}",
                preset.as_str()
            );
            assert!(!template.contains("--sparsemap-active-set-iter"), "{}", preset.as_str());
        }
    }

    #[test]
    fn tagger_exports_every_field_its_template_needs() {
        let cfg = Preset::Tagger.config();
        let tpl = Template::parse(&cfg.template).unwrap();
        for field in tpl.fields().filter(|f| *f != "artifact") {
            assert!(
                cfg.export_columns.iter().any(|c| c == field),
                "template field {} not exported",
                field
            );
        }
    }

    #[test]
    fn yaml_overrides_replace_only_present_keys() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("sweep.yaml");
        std::fs::write(
            &path,
            "group_column: Name\nprefix_tag: rerun\norder: natural\non_missing_field: skip\n",
        )
        .unwrap();
        let cfg = Preset::Nli
            .config()
            .with_overrides(ConfigOverrides::load(&path).unwrap());
        assert_eq!(cfg.group_column, "Name");
        assert_eq!(cfg.prefix_tag.as_deref(), Some("rerun"));
        assert_eq!(cfg.order, OrderKind::Natural);
        assert_eq!(cfg.on_missing_field, MissingFieldPolicy::Skip);
        assert_eq!(cfg.metric_column, "best_valid_acc");
    }

    #[test]
    fn unknown_keys_and_presets_are_config_errors() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bad.yaml");
        std::fs::write(&path, "grup_column: Name\n").unwrap();
        assert_eq!(ConfigOverrides::load(&path).unwrap_err().code(), "invalid_config");
        assert!("ner".parse::<Preset>().is_err());
        assert_eq!("tagger".parse::<Preset>().unwrap(), Preset::Tagger);
    }

    #[test]
    fn dumped_preset_loads_as_override_file() {
        let yaml = Preset::Nli.config().to_yaml().unwrap();
        let overrides: ConfigOverrides = serde_yaml::from_str(&yaml).unwrap();
        let cfg = Preset::Tagger.config().with_overrides(overrides);
        assert_eq!(cfg, Preset::Nli.config());
        assert_eq!(cfg.script_name, "run_test_nli.sh");
    }
}
