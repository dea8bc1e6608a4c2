//! Best-run selection over experiment logs and test-script staging for the
//! winning checkpoints.
//!
//! The usual entry points are [`run_select`] (summary CSV only) and
//! [`run_stage`] (summary CSV, copied checkpoints and a test script).

pub mod config;
pub mod emit;
pub mod params;
pub mod pipeline;
pub mod resolve;
pub mod select;

pub use config::{ConfigOverrides, PipelineConfig, Preset};
pub use emit::{MissingFieldPolicy, ScriptBuffer, Template, ARTIFACT_FIELD};
pub use params::count_params;
pub use pipeline::{
    list_artifacts, run_select, run_stage, ArtifactListing, SelectOutcome, SkipReason, SkippedRow,
    Stage, StageOutcome, StageRequest, StagedArtifact,
};
pub use resolve::{destination_for, ArtifactResolver, CheckpointOrder, Lexicographic, Natural, OrderKind};
pub use select::{
    filter_by_tag, pick_winners, select_best, summary_path, DiagnosticSink, NullSink, Selection, SelectionSpec, TracingSink,
    FN_PREFIX_COLUMN, RUN_ID_COLUMN,
};
