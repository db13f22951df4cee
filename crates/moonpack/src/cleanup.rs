//! Removal of runtime module stubs once a job is finished

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use log::{debug, warn};

use crate::error::JobWarning;

/// A stub file written for a runtime-provided module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubRecord {
    /// Dotted module name, e.g. `ui.button`
    pub module_name: String,
    pub file_path: PathBuf,
}

/// Scope guard owning every stub file and directory created for one job
///
/// [`StubGuard::cleanup`] removes them and returns the failures as warnings.
/// If the guard is dropped without an explicit cleanup (early return, panic),
/// the same removal runs from `Drop` with failures only logged.
#[must_use = "StubGuard must be held in scope to ensure cleanup"]
#[derive(Debug, Default)]
pub struct StubGuard {
    records: Vec<StubRecord>,
    /// Directories created for stubs, shallowest first
    created_dirs: Vec<PathBuf>,
}

impl StubGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track_file(&mut self, record: StubRecord) {
        self.records.push(record);
    }

    pub fn track_dir(&mut self, dir: PathBuf) {
        self.created_dirs.push(dir);
    }

    pub fn records(&self) -> &[StubRecord] {
        &self.records
    }

    pub fn created_dirs(&self) -> &[PathBuf] {
        &self.created_dirs
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.created_dirs.is_empty()
    }

    /// Remove every tracked stub, then every tracked directory left empty
    pub fn cleanup(mut self) -> Vec<JobWarning> {
        self.remove_all()
    }

    fn remove_all(&mut self) -> Vec<JobWarning> {
        let mut warnings = Vec::new();

        for record in self.records.drain(..) {
            match fs::remove_file(&record.file_path) {
                Ok(()) => debug!(
                    "Removed stub for '{}' at {}",
                    record.module_name,
                    record.file_path.display()
                ),
                // Already gone is the state we want
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(
                        "Failed to remove stub {}: {}",
                        record.file_path.display(),
                        e
                    );
                    warnings.push(JobWarning::Cleanup {
                        path: record.file_path,
                        reason: e.to_string(),
                    });
                }
            }
        }

        // Deepest first so parents are empty by the time they are reached
        while let Some(dir) = self.created_dirs.pop() {
            if let Err(e) = remove_dir_if_empty(&dir) {
                warn!("Failed to remove stub directory {}: {}", dir.display(), e);
                warnings.push(JobWarning::Cleanup {
                    path: dir,
                    reason: e.to_string(),
                });
            }
        }

        warnings
    }
}

impl Drop for StubGuard {
    fn drop(&mut self) {
        if self.is_empty() {
            return;
        }
        // A panic here would abort during unwinding
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            for warning in self.remove_all() {
                warn!("{warning}");
            }
        }));
    }
}

/// Remove a directory only if nothing else was put into it meanwhile
fn remove_dir_if_empty(dir: &Path) -> io::Result<()> {
    match fs::read_dir(dir) {
        Ok(mut entries) => {
            if entries.next().is_some() {
                debug!("Keeping non-empty directory {}", dir.display());
                return Ok(());
            }
            fs::remove_dir(dir)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use tempfile::TempDir;

    use super::*;

    fn stub(root: &Path, rel: &str, name: &str) -> Result<StubRecord> {
        let path = root.join(rel);
        fs::write(&path, "return {}\n")?;
        Ok(StubRecord {
            module_name: name.to_owned(),
            file_path: path,
        })
    }

    #[test]
    fn test_cleanup_removes_files_and_created_dirs() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        fs::create_dir_all(root.join("ui/widgets"))?;

        let mut guard = StubGuard::new();
        guard.track_dir(root.join("ui"));
        guard.track_dir(root.join("ui/widgets"));
        guard.track_file(stub(root, "ui/widgets/button.lua", "ui.widgets.button")?);

        let warnings = guard.cleanup();
        assert!(warnings.is_empty());
        assert!(!root.join("ui").exists());
        Ok(())
    }

    #[test]
    fn test_non_empty_directories_are_kept() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        fs::create_dir_all(root.join("ui"))?;
        fs::write(root.join("ui/user_file.lua"), "return 1")?;

        let mut guard = StubGuard::new();
        guard.track_dir(root.join("ui"));
        guard.track_file(stub(root, "ui/button.lua", "ui.button")?);

        assert!(guard.cleanup().is_empty());
        assert!(!root.join("ui/button.lua").exists());
        assert!(root.join("ui/user_file.lua").exists());
        Ok(())
    }

    #[test]
    fn test_already_removed_stub_is_not_a_warning() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let record = stub(temp_dir.path(), "net.lua", "net")?;
        fs::remove_file(&record.file_path)?;

        let mut guard = StubGuard::new();
        guard.track_file(record);
        assert!(guard.cleanup().is_empty());
        Ok(())
    }

    #[test]
    fn test_drop_removes_stubs() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let record = stub(temp_dir.path(), "net.lua", "net")?;
        let path = record.file_path.clone();

        {
            let mut guard = StubGuard::new();
            guard.track_file(record);
        }

        assert!(!path.exists());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_removal_becomes_a_warning() -> Result<()> {
        let temp_dir = TempDir::new()?;
        // A directory where a stub file is expected cannot be removed with remove_file
        let path = temp_dir.path().join("odd.lua");
        fs::create_dir(&path)?;

        let mut guard = StubGuard::new();
        guard.track_file(StubRecord {
            module_name: "odd".to_owned(),
            file_path: path.clone(),
        });
        let warnings = guard.cleanup();
        assert_eq!(warnings.len(), 1);
        assert!(matches!(&warnings[0], JobWarning::Cleanup { path: p, .. } if *p == path));
        Ok(())
    }
}
