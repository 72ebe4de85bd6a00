//! Unique temp-file naming with delete-on-drop ownership.
//!
//! The sort engine stages its runs through temporary files. This module
//! decides where those files live and what they are called, and makes sure
//! an abandoned pipeline does not leave them behind.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};

/// Environment variable overriding the temp directory.
const TMPDIR_ENV: &str = "EXMEM_TMPDIR";

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Policy for naming temporary files.
///
/// Directory resolution order: explicit [`dir`](Self::with_dir), the
/// `EXMEM_TMPDIR` environment variable, then the OS temp directory.
#[derive(Debug, Clone)]
pub struct TempPolicy {
    dir: Option<PathBuf>,
    base: String,
    extension: String,
}

impl TempPolicy {
    /// Creates the default policy (`exmem_*.tmp` in the OS temp directory).
    #[must_use]
    pub fn new() -> Self {
        Self {
            dir: None,
            base: "exmem".to_string(),
            extension: "tmp".to_string(),
        }
    }

    /// Pins temporary files to an explicit directory.
    #[must_use]
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Overrides the base name component.
    #[must_use]
    pub fn with_base(mut self, base: impl Into<String>) -> Self {
        self.base = base.into();
        self
    }

    /// Returns the directory temporary files are created in.
    #[must_use]
    pub fn resolve_dir(&self) -> PathBuf {
        if let Some(dir) = &self.dir {
            return dir.clone();
        }
        if let Some(dir) = env::var_os(TMPDIR_ENV) {
            return PathBuf::from(dir);
        }
        env::temp_dir()
    }

    /// Produces a fresh process-unique path tagged with `tag`.
    ///
    /// The name has the shape `<base>_<tag>_<pid>-<seq>.<ext>`; the sequence
    /// number is process-wide, so two calls never collide.
    #[must_use]
    pub fn unique_path(&self, tag: &str) -> PathBuf {
        let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
        let name = format!(
            "{}_{}_{}-{}.{}",
            self.base,
            tag,
            process::id(),
            seq,
            self.extension
        );
        self.resolve_dir().join(name)
    }
}

impl Default for TempPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns a temporary path and deletes the file on drop.
///
/// Call [`keep`](Self::keep) to mark the file persistent and hand ownership
/// back to the caller. Deletion is best effort; a failure to remove the file
/// is ignored.
#[derive(Debug)]
pub struct TempFile {
    path: PathBuf,
    keep: bool,
}

impl TempFile {
    /// Creates a fresh uniquely named temp path under `policy`.
    #[must_use]
    pub fn new(policy: &TempPolicy, tag: &str) -> Self {
        Self {
            path: policy.unique_path(tag),
            keep: false,
        }
    }

    /// Wraps an existing path, taking over deletion responsibility.
    #[must_use]
    pub fn from_path(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    /// The owned path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Marks the file persistent and returns its path.
    pub fn keep(mut self) -> PathBuf {
        self.keep = true;
        self.path.clone()
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if !self.keep {
            let _ = fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_unique_paths_differ() {
        let policy = TempPolicy::new();
        let a = policy.unique_path("run");
        let b = policy.unique_path("run");
        assert_ne!(a, b);
        assert!(a.file_name().unwrap().to_str().unwrap().starts_with("exmem_run_"));
    }

    #[test]
    fn test_explicit_dir_wins() {
        let dir = tempdir().unwrap();
        let policy = TempPolicy::new().with_dir(dir.path());
        assert_eq!(policy.unique_path("x").parent().unwrap(), dir.path());
    }

    #[test]
    fn test_delete_on_drop() {
        let dir = tempdir().unwrap();
        let policy = TempPolicy::new().with_dir(dir.path());
        let path;
        {
            let tmp = TempFile::new(&policy, "drop");
            path = tmp.path().to_path_buf();
            fs::write(&path, b"scratch").unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_keep_marks_persistent() {
        let dir = tempdir().unwrap();
        let policy = TempPolicy::new().with_dir(dir.path());
        let tmp = TempFile::new(&policy, "keep");
        let path = tmp.path().to_path_buf();
        fs::write(&path, b"scratch").unwrap();
        let kept = tmp.keep();
        assert_eq!(kept, path);
        assert!(path.exists());
    }
}
