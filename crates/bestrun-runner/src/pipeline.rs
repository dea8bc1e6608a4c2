use crate::config::PipelineConfig;
use crate::emit::{MissingFieldPolicy, ScriptBuffer, Template};
use crate::resolve::{destination_for, ArtifactResolver};
use crate::select::{
    filter_by_tag, pick_winners, summary_path, DiagnosticSink, Selection, FN_PREFIX_COLUMN,
    RUN_ID_COLUMN,
};
use bestrun_core::{Dataset, OutputGuard, PipelineError, Result, RowRef};
use std::path::{Path, PathBuf};

/// Progress of one invocation. Stages only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Loaded,
    Filtered,
    Grouped,
    Selected,
    Resolved,
    Rendered,
    Flushed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Loaded => "loaded",
            Self::Filtered => "filtered",
            Self::Grouped => "grouped",
            Self::Selected => "selected",
            Self::Resolved => "resolved",
            Self::Rendered => "rendered",
            Self::Flushed => "flushed",
        }
    }
}

#[derive(Debug)]
struct StageTracker {
    current: Option<Stage>,
}

impl StageTracker {
    fn new() -> Self {
        Self { current: None }
    }

    fn advance(&mut self, next: Stage) {
        debug_assert!(self.current.map_or(true, |c| c <= next), "stage went backwards");
        if self.current != Some(next) {
            tracing::info!(stage = next.as_str(), "pipeline stage");
        }
        self.current = Some(next);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NoArtifact { pattern: String },
    MissingField { field: String },
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoArtifact { .. } => "no_artifact",
            Self::MissingField { .. } => "missing_field",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRow {
    pub index: usize,
    pub group: String,
    pub fn_prefix: String,
    pub run_id: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedArtifact {
    pub index: usize,
    pub group: String,
    pub run_id: String,
    pub source: PathBuf,
    pub destination: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SelectOutcome {
    pub selection: Selection,
    pub summary_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct StageRequest {
    pub input: PathBuf,
    /// Directory (or file-name prefix) receiving copied checkpoints.
    pub dest_prefix: String,
    pub search_root: Option<PathBuf>,
    pub script_path: PathBuf,
    pub config: PipelineConfig,
}

#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub selection: Selection,
    pub summary_path: PathBuf,
    pub script_path: PathBuf,
    pub staged: Vec<StagedArtifact>,
    pub skipped: Vec<SkippedRow>,
}

fn load_input(input: &Path, config: &PipelineConfig, tracker: &mut StageTracker) -> Result<Dataset> {
    let mut required = vec![config.group_column.as_str(), config.metric_column.as_str()];
    if config.prefix_tag.is_some() {
        required.push(FN_PREFIX_COLUMN);
    }
    let dataset = Dataset::load(input, &required)?;
    tracker.advance(Stage::Loaded);
    Ok(dataset)
}

fn select(
    dataset: &Dataset,
    config: &PipelineConfig,
    sink: &mut dyn DiagnosticSink,
    tracker: &mut StageTracker,
) -> Result<Selection> {
    let spec = config.selection_spec();
    let filtered = filter_by_tag(dataset, &spec)?;
    tracker.advance(Stage::Filtered);
    let groups = filtered.group_by(&spec.group_column)?;
    tracing::info!(groups = groups.len(), column = %spec.group_column, "grouped dataset");
    tracker.advance(Stage::Grouped);
    let selection = pick_winners(&filtered, &groups, &spec, sink)?;
    tracker.advance(Stage::Selected);
    Ok(selection)
}

fn summary_bytes(selection: &Selection, path: &Path) -> Result<Vec<u8>> {
    selection
        .summary
        .to_csv_bytes()
        .map_err(|source| PipelineError::Write {
            path: path.to_path_buf(),
            source,
        })
}

/// Select the best run per group and write `best-<input>`.
pub fn run_select(
    input: &Path,
    config: &PipelineConfig,
    sink: &mut dyn DiagnosticSink,
) -> Result<SelectOutcome> {
    let mut tracker = StageTracker::new();
    let dataset = load_input(input, config, &mut tracker)?;
    let selection = select(&dataset, config, sink, &mut tracker)?;

    let path = summary_path(input);
    let bytes = summary_bytes(&selection, &path)?;
    let mut guard = OutputGuard::new();
    guard.write(&path, &bytes)?;
    guard.commit()?;
    tracker.advance(Stage::Flushed);

    Ok(SelectOutcome {
        selection,
        summary_path: path,
    })
}

/// Full pipeline: select, resolve and copy checkpoints, render the test script.
///
/// Nothing is written until every winner has been resolved and rendered.
/// Copies, summary and script are then staged beside their destinations and
/// moved into place together; a failure at any point leaves every
/// destination as it was before the call.
pub fn run_stage(request: &StageRequest, sink: &mut dyn DiagnosticSink) -> Result<StageOutcome> {
    let config = &request.config;
    let template = Template::parse(&config.template)?;
    let resolver = ArtifactResolver::new(request.search_root.clone(), config.order.strategy());

    let mut tracker = StageTracker::new();
    let dataset = load_input(&request.input, config, &mut tracker)?;
    dataset.require(&[FN_PREFIX_COLUMN, RUN_ID_COLUMN])?;
    let selection = select(&dataset, config, sink, &mut tracker)?;

    let mut skipped = Vec::new();
    let mut resolved = Vec::new();
    for row in selection.winners.rows() {
        let fn_prefix = row.get(FN_PREFIX_COLUMN).unwrap_or_default();
        let run_id = row.get(RUN_ID_COLUMN).unwrap_or_default();
        match resolver.resolve(fn_prefix, run_id)? {
            Some(source) => resolved.push((row, source)),
            None => {
                let pattern = resolver.pattern(fn_prefix, run_id);
                tracing::warn!(run_id, pattern = %pattern, "no artifact found, skipping run");
                skipped.push(skipped_row(&row, config, SkipReason::NoArtifact { pattern }));
            }
        }
    }
    tracker.advance(Stage::Resolved);

    let mut script = ScriptBuffer::new(config.separator.clone());
    let mut staged = Vec::new();
    for (row, source) in resolved {
        let destination = destination_for(&request.dest_prefix, &source);
        match template.render(&row, &destination) {
            Ok(block) => script.push(&block),
            Err(PipelineError::MissingField { field, run_id, .. })
                if config.on_missing_field == MissingFieldPolicy::Skip =>
            {
                tracing::warn!(run_id = %run_id, field = %field, "template field missing, skipping run");
                skipped.push(skipped_row(&row, config, SkipReason::MissingField { field }));
                continue;
            }
            Err(e) => return Err(e),
        }
        staged.push(StagedArtifact {
            index: row.index(),
            group: row.get(&config.group_column).unwrap_or_default().to_string(),
            run_id: row.get(RUN_ID_COLUMN).unwrap_or_default().to_string(),
            source,
            destination,
        });
    }
    tracker.advance(Stage::Rendered);

    let summary = summary_path(&request.input);
    let summary_csv = summary_bytes(&selection, &summary)?;

    let mut guard = OutputGuard::new();
    for artifact in &staged {
        if is_same_file(&artifact.source, &artifact.destination) {
            continue;
        }
        guard.copy_file(&artifact.source, &artifact.destination)?;
        tracing::info!(
            from = %artifact.source.display(),
            to = %artifact.destination.display(),
            "staged artifact copy"
        );
    }
    guard.write(&summary, &summary_csv)?;
    script.flush(&request.script_path, &mut guard)?;
    guard.commit()?;
    tracker.advance(Stage::Flushed);

    Ok(StageOutcome {
        selection,
        summary_path: summary,
        script_path: request.script_path.clone(),
        staged,
        skipped,
    })
}

fn skipped_row(row: &RowRef<'_>, config: &PipelineConfig, reason: SkipReason) -> SkippedRow {
    SkippedRow {
        index: row.index(),
        group: row.get(&config.group_column).unwrap_or_default().to_string(),
        fn_prefix: row.get(FN_PREFIX_COLUMN).unwrap_or_default().to_string(),
        run_id: row.get(RUN_ID_COLUMN).unwrap_or_default().to_string(),
        reason,
    }
}

fn is_same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(x), Ok(y)) => x == y,
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactListing {
    pub group: String,
    pub fn_prefix: String,
    pub files: Vec<PathBuf>,
}

/// Every file starting with each row's `fn_prefix`, for a summary CSV.
pub fn list_artifacts(
    summary: &Path,
    group_column: &str,
    resolver: &ArtifactResolver,
) -> Result<Vec<ArtifactListing>> {
    let data = Dataset::load(summary, &[FN_PREFIX_COLUMN, group_column])?;
    data.rows()
        .map(|row| {
            let fn_prefix = row.get(FN_PREFIX_COLUMN).unwrap_or_default();
            Ok(ArtifactListing {
                group: row.get(group_column).unwrap_or_default().to_string(),
                fn_prefix: fn_prefix.to_string(),
                files: resolver.list_prefix(fn_prefix)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_are_ordered() {
        assert!(Stage::Loaded < Stage::Selected);
        assert!(Stage::Resolved < Stage::Rendered);
        assert!(Stage::Rendered < Stage::Flushed);
    }

    #[test]
    fn tracker_accepts_forward_moves() {
        let mut t = StageTracker::new();
        t.advance(Stage::Loaded);
        t.advance(Stage::Selected);
        t.advance(Stage::Selected);
        t.advance(Stage::Resolved);
        t.advance(Stage::Rendered);
        t.advance(Stage::Flushed);
        assert_eq!(t.current, Some(Stage::Flushed));
    }

    fn dataset(csv: &str) -> Dataset {
        Dataset::from_reader(csv.as_bytes(), Path::new("runs.csv"), &[]).unwrap()
    }

    #[test]
    fn tracker_stops_at_the_stage_that_failed() {
        let config = PipelineConfig {
            prefix_tag: Some("esim".to_string()),
            display_column: None,
            report_columns: vec![],
            export_columns: vec!["Run ID".to_string()],
            ..crate::config::Preset::Nli.config()
        };

        let mut t = StageTracker::new();
        let data = dataset("fn_prefix,Run ID,attention,best_valid_acc\nm/esim_,r1,a,n/a\n");
        let err = select(&data, &config, &mut crate::select::NullSink, &mut t).unwrap_err();
        assert_eq!(err.code(), "empty_group");
        assert_eq!(t.current, Some(Stage::Grouped));

        let mut t = StageTracker::new();
        let data = dataset("fn_prefix,Run ID,attention,best_valid_acc\nm/old_,r1,a,0.5\n");
        let err = select(&data, &config, &mut crate::select::NullSink, &mut t).unwrap_err();
        assert_eq!(err.code(), "empty_dataset");
        assert_eq!(t.current, None);
    }
}
