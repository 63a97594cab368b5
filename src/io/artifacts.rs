//! Ownership of every transient file a request creates.
//!
//! Each request gets its own scratch directory. Downloaded inputs, partition
//! files, per-job working directories and partial outputs are registered as
//! they are created, and [`ArtifactRegistry::cleanup`] removes whatever is
//! still tracked. Cleanup also runs on drop, so a request that is cancelled or
//! unwinds leaves nothing behind. Artifacts that must outlive the request are
//! moved out with [`ArtifactRegistry::persist`].

use crate::error::CleanupWarning;
use serde::Serialize;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// What a tracked path holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Scratch,
    Input,
    Partition,
    JobWorkdir,
    Partial,
    Merged,
}

#[derive(Debug)]
struct Tracked {
    path: PathBuf,
    kind: ArtifactKind,
    is_dir: bool,
}

/// Outcome of a cleanup pass.
#[derive(Debug, Default, Clone)]
pub struct CleanupReport {
    pub removed: usize,
    pub warnings: Vec<CleanupWarning>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

impl fmt::Display for CleanupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} artifacts removed, {} warnings", self.removed, self.warnings.len())
    }
}

/// Per-request registry of transient artifacts.
#[derive(Debug)]
pub struct ArtifactRegistry {
    root: PathBuf,
    entries: Mutex<Vec<Tracked>>,
    finished: AtomicBool,
}

impl ArtifactRegistry {
    /// Create a fresh scratch directory for `request_id` under `base`.
    pub fn create(base: &Path, request_id: &str) -> io::Result<Self> {
        std::fs::create_dir_all(base)?;
        let root = tempfile::Builder::new()
            .prefix(&format!("{}-", request_id))
            .tempdir_in(base)?
            .keep();

        tracing::debug!("Created scratch directory {}", root.display());
        Ok(Self {
            entries: Mutex::new(vec![Tracked {
                path: root.clone(),
                kind: ArtifactKind::Scratch,
                is_dir: true,
            }]),
            root,
            finished: AtomicBool::new(false),
        })
    }

    /// The request's scratch directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entries(&self) -> MutexGuard<'_, Vec<Tracked>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track(&self, path: PathBuf, kind: ArtifactKind, is_dir: bool) {
        self.finished.store(false, Ordering::Release);
        self.entries().push(Tracked { path, kind, is_dir });
    }

    /// Reserve and track a file path inside the scratch directory.
    ///
    /// The file itself is not created.
    pub fn file_path(&self, kind: ArtifactKind, name: &str) -> PathBuf {
        let path = self.root.join(name);
        self.track(path.clone(), kind, false);
        path
    }

    /// Create and track a directory inside the scratch directory.
    pub fn create_dir(&self, kind: ArtifactKind, name: &str) -> io::Result<PathBuf> {
        let path = self.root.join(name);
        std::fs::create_dir_all(&path)?;
        self.track(path.clone(), kind, true);
        Ok(path)
    }

    /// Track a file created elsewhere.
    pub fn register_file(&self, path: impl Into<PathBuf>, kind: ArtifactKind) {
        self.track(path.into(), kind, false);
    }

    /// Stop tracking `path`. Returns false if it was not tracked.
    pub fn release(&self, path: &Path) -> bool {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|t| t.path != path);
        entries.len() != before
    }

    /// Move a tracked artifact into `dest_dir` and stop tracking it.
    pub fn persist(&self, path: &Path, dest_dir: &Path) -> io::Result<PathBuf> {
        let name = path
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "artifact has no file name"))?;
        std::fs::create_dir_all(dest_dir)?;
        let dest = dest_dir.join(name);

        if std::fs::rename(path, &dest).is_err() {
            // Cross-device moves need a copy.
            std::fs::copy(path, &dest)?;
            std::fs::remove_file(path)?;
        }
        self.release(path);
        tracing::debug!("Persisted {} to {}", path.display(), dest.display());
        Ok(dest)
    }

    /// Number of tracked artifacts of `kind`.
    pub fn count(&self, kind: ArtifactKind) -> usize {
        self.entries().iter().filter(|t| t.kind == kind).count()
    }

    /// Remove every tracked artifact.
    ///
    /// Removal runs newest first so job files go before their directories.
    /// Paths that are already gone count as removed. Failures are logged and
    /// returned as warnings; cleanup never fails the request. Calling this
    /// again after a complete pass is a no-op.
    pub fn cleanup(&self) -> CleanupReport {
        let drained: Vec<Tracked> = std::mem::take(&mut *self.entries());
        self.finished.store(true, Ordering::Release);

        let mut report = CleanupReport::default();
        for tracked in drained.into_iter().rev() {
            let result = if tracked.is_dir {
                std::fs::remove_dir_all(&tracked.path)
            } else {
                std::fs::remove_file(&tracked.path)
            };

            match result {
                Ok(()) => report.removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => report.removed += 1,
                Err(e) => {
                    tracing::warn!("Failed to remove {:?} artifact {}: {}", tracked.kind, tracked.path.display(), e);
                    report.warnings.push(CleanupWarning {
                        path: tracked.path,
                        message: e.to_string(),
                    });
                }
            }
        }

        tracing::debug!("Cleanup: {}", report);
        report
    }
}

impl Drop for ArtifactRegistry {
    fn drop(&mut self) {
        if !self.finished.load(Ordering::Acquire) {
            let report = self.cleanup();
            if report.removed > 0 {
                tracing::debug!("Cleaned up on drop: {}", report);
            }
        }
    }
}
