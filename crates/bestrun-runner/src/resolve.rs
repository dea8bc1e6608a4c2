//! Maps a winning run to the checkpoint file it left on disk.
//!
//! Checkpoints are located by name: a file belongs to a run when its path
//! starts with the run's `fn_prefix` and contains its run id. When several
//! files match, the one ordered last by the configured `CheckpointOrder` is
//! taken as the latest.

use bestrun_core::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};

/// Ordering used to pick the latest checkpoint among candidates.
pub trait CheckpointOrder {
    fn compare(&self, a: &Path, b: &Path) -> Ordering;
}

/// Plain string order. Correct only when numeric tokens in file names are
/// zero-padded to a fixed width.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lexicographic;

impl CheckpointOrder for Lexicographic {
    fn compare(&self, a: &Path, b: &Path) -> Ordering {
        a.as_os_str().cmp(b.as_os_str())
    }
}

/// Compares runs of ASCII digits by numeric value, so `step_90` sorts
/// before `step_500`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Natural;

impl CheckpointOrder for Natural {
    fn compare(&self, a: &Path, b: &Path) -> Ordering {
        natural_cmp(&a.to_string_lossy(), &b.to_string_lossy())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    #[default]
    Lexicographic,
    Natural,
}

impl OrderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lexicographic => "lexicographic",
            Self::Natural => "natural",
        }
    }

    pub fn strategy(self) -> Box<dyn CheckpointOrder> {
        match self {
            Self::Lexicographic => Box::new(Lexicographic),
            Self::Natural => Box::new(Natural),
        }
    }
}

fn natural_cmp(a: &str, b: &str) -> Ordering {
    let (mut a, mut b) = (a, b);
    loop {
        match (a.chars().next(), b.chars().next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let da = a.find(|c: char| !c.is_ascii_digit()).unwrap_or(a.len());
                let db = b.find(|c: char| !c.is_ascii_digit()).unwrap_or(b.len());
                let (na, nb) = (a[..da].trim_start_matches('0'), b[..db].trim_start_matches('0'));
                let ord = na
                    .len()
                    .cmp(&nb.len())
                    .then_with(|| na.cmp(nb))
                    .then_with(|| da.cmp(&db));
                if ord != Ordering::Equal {
                    return ord;
                }
                a = &a[da..];
                b = &b[db..];
            }
            (Some(x), Some(y)) => {
                if x != y {
                    return x.cmp(&y);
                }
                a = &a[x.len_utf8()..];
                b = &b[y.len_utf8()..];
            }
        }
    }
}

pub struct ArtifactResolver {
    search_root: Option<PathBuf>,
    order: Box<dyn CheckpointOrder>,
}

impl std::fmt::Debug for ArtifactResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactResolver")
            .field("search_root", &self.search_root)
            .finish_non_exhaustive()
    }
}

impl Default for ArtifactResolver {
    fn default() -> Self {
        Self::new(None, Box::new(Lexicographic))
    }
}

impl ArtifactResolver {
    pub fn new(search_root: Option<PathBuf>, order: Box<dyn CheckpointOrder>) -> Self {
        Self { search_root, order }
    }

    /// Glob pattern `{fn_prefix}*{run_id}*`, anchored at the search root for
    /// relative prefixes.
    pub fn pattern(&self, fn_prefix: &str, run_id: &str) -> String {
        let prefix = match &self.search_root {
            Some(root) if Path::new(fn_prefix).is_relative() => root.join(fn_prefix),
            _ => PathBuf::from(fn_prefix),
        };
        let prefix = glob::Pattern::escape(&prefix.to_string_lossy());
        if run_id.is_empty() {
            // `**` inside a path component is rejected by glob.
            format!("{}*", prefix)
        } else {
            format!("{}*{}*", prefix, glob::Pattern::escape(run_id))
        }
    }

    /// Every regular file matching the run, in checkpoint order.
    pub fn candidates(&self, fn_prefix: &str, run_id: &str) -> Result<Vec<PathBuf>> {
        let pattern = self.pattern(fn_prefix, run_id);
        let entries = glob::glob(&pattern).map_err(|e| PipelineError::ArtifactSearch {
            pattern: pattern.clone(),
            reason: e.to_string(),
        })?;
        let mut files = Vec::new();
        for entry in entries {
            match entry {
                Ok(path) if path.is_file() => files.push(path),
                Ok(_) => {}
                Err(e) => tracing::warn!(pattern = %pattern, error = %e, "skipping unreadable entry"),
            }
        }
        files.sort_by(|a, b| self.order.compare(a, b));
        Ok(files)
    }

    /// Latest checkpoint of the run, or `None` when nothing matches.
    pub fn resolve(&self, fn_prefix: &str, run_id: &str) -> Result<Option<PathBuf>> {
        Ok(self.candidates(fn_prefix, run_id)?.pop())
    }

    /// Every regular file whose path starts with `fn_prefix`, in checkpoint order.
    pub fn list_prefix(&self, fn_prefix: &str) -> Result<Vec<PathBuf>> {
        self.candidates(fn_prefix, "")
    }
}

/// Where a resolved checkpoint is copied.
///
/// A `prefix` naming a directory (trailing separator, or an existing
/// directory) receives the file under its base name; any other prefix is
/// prepended to the base name.
pub fn destination_for(prefix: &str, source: &Path) -> PathBuf {
    let base = source
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let is_dir = prefix.ends_with('/') || prefix.ends_with(MAIN_SEPARATOR) || Path::new(prefix).is_dir();
    if is_dir {
        Path::new(prefix).join(base)
    } else {
        PathBuf::from(format!("{}{}", prefix, base))
    }
}
