//! Tabular store, error taxonomy and output helpers shared by the
//! best-run selection pipeline.

pub mod error;
pub mod fs;
pub mod table;

pub use error::{PipelineError, Result};
pub use fs::{atomic_write_bytes, ensure_dir, OutputGuard};
pub use table::{parse_numeric, Dataset, Group, Row, RowRef};
