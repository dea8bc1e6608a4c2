use crate::error::{PipelineError, Result};
use chrono::Utc;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|source| PipelineError::Write {
        path: path.to_path_buf(),
        source,
    })
}

static SIBLING_SEQ: AtomicU64 = AtomicU64::new(0);

/// Hidden sibling of `path` used while its content is being produced.
fn sibling(path: &Path, kind: &str) -> PathBuf {
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let seq = SIBLING_SEQ.fetch_add(1, Ordering::Relaxed);
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    path.with_file_name(format!(".{}.{}.{}.{}.{}", name, kind, pid, ts, seq))
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

fn reject_dir(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "destination is a directory",
        )),
        _ => Ok(()),
    }
}

/// Write `bytes` to a sibling temp file, fsync it, then rename over `path`.
///
/// Readers never observe a half-written file: `path` either keeps its old
/// content or holds all of `bytes`.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_dir(parent)?;
        }
    }
    let tmp = sibling(path, "tmp");
    let written = write_synced(&tmp, bytes).and_then(|_| fs::rename(&tmp, path));
    if let Err(source) = written {
        let _ = fs::remove_file(&tmp);
        return Err(PipelineError::Write {
            path: path.to_path_buf(),
            source,
        });
    }
    sync_parent(path);
    Ok(())
}

#[derive(Debug)]
struct Pending {
    temp: PathBuf,
    dest: PathBuf,
}

/// Stages every output of one invocation next to its destination and moves
/// them into place only on [`OutputGuard::commit`].
///
/// Dropping an uncommitted guard removes the staged files and any directory
/// it created; destinations keep their previous content.
#[derive(Debug, Default)]
pub struct OutputGuard {
    pending: Vec<Pending>,
    dirs: Vec<PathBuf>,
    done: bool,
}

impl OutputGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `path`'s parent, remembering each directory that did not exist.
    fn create_parent(&mut self, path: &Path) -> io::Result<()> {
        let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
            return Ok(());
        };
        let mut missing = Vec::new();
        let mut cur = Some(parent);
        while let Some(dir) = cur {
            if dir.as_os_str().is_empty() || dir.exists() {
                break;
            }
            missing.push(dir.to_path_buf());
            cur = dir.parent();
        }
        fs::create_dir_all(parent)?;
        self.dirs.extend(missing.into_iter().rev());
        Ok(())
    }

    /// Register `dest` before anything touches the disk, so a failure midway
    /// still leaves the temp file tracked.
    fn stage(&mut self, dest: &Path) -> io::Result<PathBuf> {
        reject_dir(dest)?;
        self.create_parent(dest)?;
        let temp = sibling(dest, "part");
        self.pending.push(Pending {
            temp: temp.clone(),
            dest: dest.to_path_buf(),
        });
        Ok(temp)
    }

    /// Stage a copy of `from` for `to`.
    pub fn copy_file(&mut self, from: &Path, to: &Path) -> Result<()> {
        let copy_err = |source: io::Error| PipelineError::Copy {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
            source,
        };
        let temp = self.stage(to).map_err(copy_err)?;
        fs::copy(from, &temp).map_err(copy_err)?;
        fs::File::open(&temp)
            .and_then(|f| f.sync_all())
            .map_err(copy_err)?;
        Ok(())
    }

    /// Stage `bytes` for `path`.
    pub fn write(&mut self, path: &Path, bytes: &[u8]) -> Result<()> {
        let write_err = |source: io::Error| PipelineError::Write {
            path: path.to_path_buf(),
            source,
        };
        let temp = self.stage(path).map_err(write_err)?;
        write_synced(&temp, bytes).map_err(write_err)
    }

    /// Destinations staged so far, in staging order.
    pub fn staged(&self) -> impl Iterator<Item = &Path> {
        self.pending.iter().map(|p| p.dest.as_path())
    }

    /// Move every staged file into place.
    ///
    /// Existing destinations are set aside first; if any rename fails, the
    /// ones already installed are undone and the old files restored.
    pub fn commit(mut self) -> Result<Vec<PathBuf>> {
        let mut installed: Vec<(PathBuf, Option<PathBuf>)> = Vec::new();
        let mut failure = None;
        for p in &self.pending {
            match install(p) {
                Ok(backup) => installed.push((p.dest.clone(), backup)),
                Err(source) => {
                    failure = Some(PipelineError::Write {
                        path: p.dest.clone(),
                        source,
                    });
                    break;
                }
            }
        }

        if let Some(err) = failure {
            for (dest, backup) in installed.iter().rev() {
                let _ = fs::remove_file(dest);
                if let Some(b) = backup {
                    if let Err(e) = fs::rename(b, dest) {
                        tracing::error!(
                            path = %dest.display(),
                            backup = %b.display(),
                            error = %e,
                            "failed to restore previous file"
                        );
                    }
                }
            }
            return Err(err);
        }

        for (dest, backup) in &installed {
            if let Some(b) = backup {
                let _ = fs::remove_file(b);
            }
            sync_parent(dest);
        }
        self.done = true;
        Ok(installed.into_iter().map(|(dest, _)| dest).collect())
    }
}

fn install(p: &Pending) -> io::Result<Option<PathBuf>> {
    reject_dir(&p.dest)?;
    let backup = if p.dest.exists() {
        let b = sibling(&p.dest, "bak");
        fs::rename(&p.dest, &b)?;
        Some(b)
    } else {
        None
    };
    if let Err(e) = fs::rename(&p.temp, &p.dest) {
        if let Some(b) = &backup {
            let _ = fs::rename(b, &p.dest);
        }
        return Err(e);
    }
    Ok(backup)
}

impl Drop for OutputGuard {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        for p in self.pending.iter().rev() {
            if fs::remove_file(&p.temp).is_ok() {
                tracing::debug!(path = %p.dest.display(), "discarded staged output");
            }
        }
        for dir in self.dirs.iter().rev() {
            let _ = fs::remove_dir(dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn hidden_files(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n.starts_with('.'))
            .collect()
    }

    #[test]
    fn atomic_write_creates_parent_and_leaves_no_temp() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("out.txt");
        atomic_write_bytes(&path, b"hello").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "hello");
        assert!(hidden_files(path.parent().unwrap()).is_empty());
    }

    #[test]
    fn nothing_reaches_destinations_before_commit() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src.pt");
        fs::write(&src, b"weights").unwrap();
        let copied = temp.path().join("out").join("src.pt");
        let summary = temp.path().join("best.csv");

        let mut guard = OutputGuard::new();
        guard.copy_file(&src, &copied).unwrap();
        guard.write(&summary, b"a,b\n").unwrap();
        assert!(!copied.exists());
        assert!(!summary.exists());

        let kept = guard.commit().unwrap();
        assert_eq!(kept, vec![copied.clone(), summary.clone()]);
        assert_eq!(fs::read(&copied).unwrap(), b"weights");
        assert_eq!(fs::read_to_string(&summary).unwrap(), "a,b\n");
        assert!(hidden_files(temp.path()).is_empty());
        assert!(hidden_files(&temp.path().join("out")).is_empty());
    }

    #[test]
    fn uncommitted_guard_removes_staged_files_and_new_dirs() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src.pt");
        fs::write(&src, b"weights").unwrap();
        let copied = temp.path().join("out").join("deep").join("src.pt");
        {
            let mut guard = OutputGuard::new();
            guard.copy_file(&src, &copied).unwrap();
            guard.write(&temp.path().join("best.csv"), b"a,b\n").unwrap();
        }
        assert!(!temp.path().join("out").exists());
        assert!(!temp.path().join("best.csv").exists());
        assert!(hidden_files(temp.path()).is_empty());
        assert!(src.exists());
    }

    #[test]
    fn uncommitted_guard_keeps_previous_destination() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src.pt");
        fs::write(&src, b"NEW").unwrap();
        let dest = temp.path().join("dest.pt");
        fs::write(&dest, b"OLD").unwrap();
        {
            let mut guard = OutputGuard::new();
            guard.copy_file(&src, &dest).unwrap();
        }
        assert_eq!(fs::read_to_string(&dest).unwrap(), "OLD");
        assert!(hidden_files(temp.path()).is_empty());
    }

    #[test]
    fn failed_commit_restores_installed_files() {
        let temp = TempDir::new().unwrap();
        let first = temp.path().join("first.csv");
        let second = temp.path().join("second.sh");
        fs::write(&first, b"OLD").unwrap();

        let mut guard = OutputGuard::new();
        guard.write(&first, b"NEW").unwrap();
        guard.write(&second, b"script").unwrap();
        fs::create_dir(&second).unwrap();

        let err = guard.commit().unwrap_err();
        assert_eq!(err.code(), "write_failed");
        assert_eq!(fs::read_to_string(&first).unwrap(), "OLD");
        assert!(second.is_dir());
        assert!(hidden_files(temp.path()).is_empty());
    }

    #[test]
    fn directory_destination_is_rejected_when_staging() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("script.sh");
        fs::create_dir(&dir).unwrap();
        let mut guard = OutputGuard::new();
        let err = guard.write(&dir, b"x").unwrap_err();
        assert_eq!(err.code(), "write_failed");
        assert_eq!(guard.staged().count(), 0);
    }

    #[test]
    fn copy_of_missing_source_is_copy_error() {
        let temp = TempDir::new().unwrap();
        {
            let mut guard = OutputGuard::new();
            let err = guard
                .copy_file(&temp.path().join("gone.pt"), &temp.path().join("x.pt"))
                .unwrap_err();
            assert_eq!(err.code(), "copy_failed");
        }
        assert!(!temp.path().join("x.pt").exists());
        assert!(hidden_files(temp.path()).is_empty());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn copy_failing_midway_leaves_no_partial_file() {
        // Opening /proc/self/mem succeeds but reading offset 0 fails, so the
        // copy dies after its destination file was created.
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("ckpt.pt");
        std::os::unix::fs::symlink("/proc/self/mem", &src).unwrap();
        let dest = temp.path().join("out").join("ckpt.pt");
        {
            let mut guard = OutputGuard::new();
            let err = guard.copy_file(&src, &dest).unwrap_err();
            assert_eq!(err.code(), "copy_failed");
        }
        assert!(!dest.exists());
        assert!(!temp.path().join("out").exists());
    }
}
