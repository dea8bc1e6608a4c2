use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Every failure the selection pipeline can report.
///
/// Variants carry enough context (file, column, group, run) for an operator
/// to fix the input CSV or re-run training without reading a backtrace.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to load dataset {path}: {reason}")]
    DatasetLoad { path: PathBuf, reason: String },

    #[error("column not found: {column}")]
    ColumnNotFound { column: String },

    #[error("dataset is empty{}", tag_suffix(.tag))]
    EmptyDataset { tag: Option<String> },

    #[error("group '{group}' has no numeric value in column '{column}'")]
    EmptyGroup { group: String, column: String },

    #[error("invalid artifact pattern '{pattern}': {reason}")]
    ArtifactSearch { pattern: String, reason: String },

    #[error("failed to copy {} to {}: {source}", .from.display(), .to.display())]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid template: {reason}")]
    Template { reason: String },

    #[error("template field '{field}' missing for run {run_id} (fn_prefix {fn_prefix})")]
    MissingField {
        field: String,
        fn_prefix: String,
        run_id: String,
    },

    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {}: {reason}", .path.display())]
    Config { path: PathBuf, reason: String },

    #[error("parameter line {line}: {reason}")]
    ParamLine { line: usize, reason: String },
}

fn tag_suffix(tag: &Option<String>) -> String {
    match tag {
        Some(t) => format!(" after filtering fn_prefix by '{}'", t),
        None => String::new(),
    }
}

impl PipelineError {
    /// Stable machine-readable code, used in `--json` error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DatasetLoad { .. } => "dataset_load",
            Self::ColumnNotFound { .. } => "column_not_found",
            Self::EmptyDataset { .. } => "empty_dataset",
            Self::EmptyGroup { .. } => "empty_group",
            Self::ArtifactSearch { .. } => "artifact_search",
            Self::Copy { .. } => "copy_failed",
            Self::Template { .. } => "invalid_template",
            Self::MissingField { .. } => "missing_field",
            Self::Write { .. } => "write_failed",
            Self::Config { .. } => "invalid_config",
            Self::ParamLine { .. } => "invalid_param_line",
        }
    }

    pub fn column_not_found(column: &str) -> Self {
        Self::ColumnNotFound {
            column: column.to_string(),
        }
    }
}
