use anyhow::Result;
use bestrun_core::PipelineError;
use bestrun_runner::{
    ArtifactResolver, ConfigOverrides, MissingFieldPolicy, OrderKind, PipelineConfig, Preset,
    SkipReason, StageRequest, TracingSink,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "bestrun",
    version,
    about = "Pick the best training run per configuration and stage its checkpoint for testing"
)]
struct Cli {
    /// Raise log verbosity (-v info, -vv debug). RUST_LOG takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PresetArg {
    #[value(name = "nli")]
    Nli,
    #[value(name = "tagger")]
    Tagger,
}

impl From<PresetArg> for Preset {
    fn from(value: PresetArg) -> Self {
        match value {
            PresetArg::Nli => Preset::Nli,
            PresetArg::Tagger => Preset::Tagger,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OrderArg {
    #[value(name = "lexicographic")]
    Lexicographic,
    #[value(name = "natural")]
    Natural,
}

impl From<OrderArg> for OrderKind {
    fn from(value: OrderArg) -> Self {
        match value {
            OrderArg::Lexicographic => OrderKind::Lexicographic,
            OrderArg::Natural => OrderKind::Natural,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum MissingFieldArg {
    #[value(name = "abort")]
    Abort,
    #[value(name = "skip")]
    Skip,
}

impl From<MissingFieldArg> for MissingFieldPolicy {
    fn from(value: MissingFieldArg) -> Self {
        match value {
            MissingFieldArg::Abort => MissingFieldPolicy::Abort,
            MissingFieldArg::Skip => MissingFieldPolicy::Skip,
        }
    }
}

#[derive(Args, Debug, Clone)]
struct SelectionArgs {
    #[arg(long, value_enum, default_value = "nli")]
    preset: PresetArg,
    /// YAML file overriding preset fields.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    group: Option<String>,
    #[arg(long)]
    metric: Option<String>,
    /// Keep only rows whose fn_prefix contains this tag.
    #[arg(long, conflicts_with = "no_tag")]
    tag: Option<String>,
    /// Disable the preset's fn_prefix tag filter.
    #[arg(long)]
    no_tag: bool,
}

impl SelectionArgs {
    fn resolve(&self) -> Result<PipelineConfig> {
        let mut config = Preset::from(self.preset).config();
        if let Some(path) = &self.config {
            config = config.with_overrides(ConfigOverrides::load(path)?);
        }
        if let Some(g) = &self.group {
            config.group_column = g.clone();
        }
        if let Some(m) = &self.metric {
            config.metric_column = m.clone();
        }
        if let Some(t) = &self.tag {
            config.prefix_tag = Some(t.clone());
        }
        if self.no_tag {
            config.prefix_tag = None;
        }
        tracing::debug!(
            preset = Preset::from(self.preset).as_str(),
            group = %config.group_column,
            metric = %config.metric_column,
            tag = ?config.prefix_tag,
            "resolved pipeline config"
        );
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Select the best run per group and write best-<input>.
    Select {
        input: PathBuf,
        #[command(flatten)]
        selection: SelectionArgs,
        #[arg(long)]
        json: bool,
    },
    /// Select, copy the winning checkpoints into OUT_DIR and write the test script.
    Stage {
        input: PathBuf,
        /// Destination directory, or file-name prefix, for copied checkpoints.
        out_dir: String,
        #[command(flatten)]
        selection: SelectionArgs,
        /// Directory that relative fn_prefix values are resolved against.
        #[arg(long)]
        search_root: Option<PathBuf>,
        /// Output script path (defaults to the preset's script name).
        #[arg(long)]
        script: Option<PathBuf>,
        #[arg(long, value_enum)]
        order: Option<OrderArg>,
        #[arg(long, value_enum)]
        on_missing_field: Option<MissingFieldArg>,
        #[arg(long)]
        json: bool,
    },
    /// List every file matching each fn_prefix of a summary CSV.
    List {
        summary: PathBuf,
        #[arg(long, default_value = "attention")]
        group: String,
        #[arg(long)]
        search_root: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Sum parameter shapes in a model dump (stdin when no files are given).
    CountParams { files: Vec<PathBuf> },
    /// Print the built-in presets as YAML.
    Presets {
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error(&err));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Select {
            input,
            selection,
            json,
        } => {
            let config = selection.resolve()?;
            let outcome = bestrun_runner::run_select(&input, &config, &mut TracingSink)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "select",
                    "input": input.display().to_string(),
                    "summary": outcome.summary_path.display().to_string(),
                    "group_column": config.group_column,
                    "metric_column": config.metric_column,
                    "winners": outcome.selection.winners.indices(),
                })));
            }
            print!("{}", outcome.selection.report);
            println!("summary: {}", outcome.summary_path.display());
        }
        Commands::Stage {
            input,
            out_dir,
            selection,
            search_root,
            script,
            order,
            on_missing_field,
            json,
        } => {
            let mut config = selection.resolve()?;
            if let Some(o) = order {
                config.order = o.into();
            }
            if let Some(m) = on_missing_field {
                config.on_missing_field = m.into();
            }
            let script_path = script.unwrap_or_else(|| PathBuf::from(&config.script_name));
            let request = StageRequest {
                input,
                dest_prefix: out_dir,
                search_root,
                script_path,
                config,
            };
            let outcome = bestrun_runner::run_stage(&request, &mut TracingSink)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "stage",
                    "summary": outcome.summary_path.display().to_string(),
                    "script": outcome.script_path.display().to_string(),
                    "order": request.config.order.as_str(),
                    "on_missing_field": request.config.on_missing_field.as_str(),
                    "staged": outcome.staged.iter().map(staged_to_json).collect::<Vec<_>>(),
                    "skipped": outcome.skipped.iter().map(skipped_to_json).collect::<Vec<_>>(),
                })));
            }
            print!("{}", outcome.selection.report);
            for s in &outcome.staged {
                println!("staged: {}\t{} -> {}", s.group, s.source.display(), s.destination.display());
            }
            for s in &outcome.skipped {
                println!("skipped: {}\t{}\t{}", s.group, s.run_id, skip_detail(&s.reason));
            }
            println!("summary: {}", outcome.summary_path.display());
            println!("script: {}", outcome.script_path.display());
        }
        Commands::List {
            summary,
            group,
            search_root,
            json,
        } => {
            let resolver = ArtifactResolver::new(search_root, OrderKind::Lexicographic.strategy());
            let listing = bestrun_runner::list_artifacts(&summary, &group, &resolver)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "list",
                    "summary": summary.display().to_string(),
                    "groups": listing.iter().map(|l| json!({
                        "group": l.group,
                        "fn_prefix": l.fn_prefix,
                        "files": l.files.iter().map(|f| f.display().to_string()).collect::<Vec<_>>(),
                    })).collect::<Vec<_>>(),
                })));
            }
            for l in &listing {
                println!("{}", l.group);
                for f in &l.files {
                    println!("  {}", f.display());
                }
            }
        }
        Commands::CountParams { files } => {
            let total = if files.is_empty() {
                bestrun_runner::count_params(std::io::stdin().lock())?
            } else {
                files
                    .iter()
                    .map(|f| count_file(f))
                    .sum::<Result<u64>>()?
            };
            println!("{}", total);
        }
        Commands::Presets { json } => {
            if json {
                let presets: serde_json::Map<String, Value> = Preset::ALL
                    .iter()
                    .map(|p| Ok::<_, anyhow::Error>((p.as_str().to_string(), serde_json::to_value(p.config())?)))
                    .collect::<Result<_>>()?;
                return Ok(Some(json!({
                    "ok": true,
                    "command": "presets",
                    "presets": presets,
                })));
            }
            for p in Preset::ALL {
                println!("# preset: {}", p.as_str());
                println!("{}", p.config().to_yaml()?);
            }
        }
    }
    Ok(None)
}

fn count_file(path: &Path) -> Result<u64> {
    let file = std::fs::File::open(path)
        .map_err(|e| anyhow::anyhow!("failed to open {}: {}", path.display(), e))?;
    Ok(bestrun_runner::count_params(BufReader::new(file))?)
}

fn skip_detail(reason: &SkipReason) -> String {
    match reason {
        SkipReason::NoArtifact { pattern } => format!("no artifact matches {}", pattern),
        SkipReason::MissingField { field } => format!("template field '{}' missing", field),
    }
}

fn staged_to_json(s: &bestrun_runner::StagedArtifact) -> Value {
    json!({
        "row": s.index,
        "group": s.group,
        "run_id": s.run_id,
        "source": s.source.display().to_string(),
        "destination": s.destination.display().to_string(),
    })
}

fn skipped_to_json(s: &bestrun_runner::SkippedRow) -> Value {
    json!({
        "row": s.index,
        "group": s.group,
        "fn_prefix": s.fn_prefix,
        "run_id": s.run_id,
        "reason": s.reason.as_str(),
        "detail": skip_detail(&s.reason),
    })
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(err: &anyhow::Error) -> Value {
    let (code, details) = match err.downcast_ref::<PipelineError>() {
        Some(e) => (e.code(), error_details(e)),
        None => ("command_failed", json!({})),
    };
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": err.to_string(),
            "details": details
        }
    })
}

fn error_details(err: &PipelineError) -> Value {
    match err {
        PipelineError::DatasetLoad { path, .. } => json!({ "path": path.display().to_string() }),
        PipelineError::ColumnNotFound { column } => json!({ "column": column }),
        PipelineError::EmptyGroup { group, column } => json!({ "group": group, "column": column }),
        PipelineError::MissingField {
            field,
            fn_prefix,
            run_id,
        } => json!({ "field": field, "fn_prefix": fn_prefix, "run_id": run_id }),
        PipelineError::Copy { from, to, .. } => json!({
            "from": from.display().to_string(),
            "to": to.display().to_string(),
        }),
        PipelineError::Write { path, .. } | PipelineError::Config { path, .. } => {
            json!({ "path": path.display().to_string() })
        }
        _ => json!({}),
    }
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Select { json, .. }
        | Commands::Stage { json, .. }
        | Commands::List { json, .. }
        | Commands::Presets { json } => *json,
        Commands::CountParams { .. } => false,
    }
}
