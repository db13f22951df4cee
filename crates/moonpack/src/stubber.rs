//! Placeholder files for runtime-provided modules
//!
//! The bundling engine needs every required module to exist as a file. For
//! modules supplied by the deployment runtime a one-line stub is written into
//! the project tree for the duration of the bundle, then removed by
//! [`StubGuard`](crate::cleanup::StubGuard).

use std::{
    fs,
    path::{Path, PathBuf},
};

use indexmap::IndexSet;
use log::{debug, warn};

use crate::{
    cleanup::{StubGuard, StubRecord},
    error::JobWarning,
    resolver::{MODULE_EXTENSION, module_path_stem},
};

/// Body of every stub: a module that evaluates to an empty table
pub const STUB_BODY: &str = "return {}\n";

#[derive(Debug)]
pub struct GlobalModuleStubber {
    project_root: PathBuf,
}

impl GlobalModuleStubber {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
        }
    }

    /// Path a stub for `module_name` is written to, if the name maps to a file
    pub fn stub_path(&self, module_name: &str) -> Option<PathBuf> {
        let stem = module_path_stem(module_name)?;
        let mut path = self.project_root.join(stem).into_os_string();
        path.push(".");
        path.push(MODULE_EXTENSION);
        Some(PathBuf::from(path))
    }

    /// Write a stub for each module, tracking every created path on `guard`
    ///
    /// Failures never abort: the module is left without a stub and a
    /// [`JobWarning::StubCreation`] is returned for it.
    pub fn create_stubs(
        &self,
        modules: &IndexSet<String>,
        guard: &mut StubGuard,
    ) -> Vec<JobWarning> {
        let mut warnings = Vec::new();
        for module_name in modules {
            if let Err(reason) = self.create_stub(module_name, guard) {
                warn!("Could not create stub for runtime module '{module_name}': {reason}");
                warnings.push(JobWarning::StubCreation {
                    module: module_name.clone(),
                    reason,
                });
            }
        }
        debug!(
            "Created {} stub file(s) for {} runtime module(s)",
            guard.records().len(),
            modules.len()
        );
        warnings
    }

    // One level at a time so each created directory can be tracked
    #[allow(clippy::create_dir)]
    fn create_stub(&self, module_name: &str, guard: &mut StubGuard) -> Result<(), String> {
        let path = self
            .stub_path(module_name)
            .ok_or_else(|| "module name does not map to a file path".to_owned())?;

        if path.exists() {
            // Never overwrite user files; the engine will pick this file up as is
            warn!(
                "Not stubbing '{module_name}': {} already exists",
                path.display()
            );
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            for dir in self.missing_ancestors(parent) {
                fs::create_dir(&dir)
                    .map_err(|e| format!("failed to create directory {}: {e}", dir.display()))?;
                guard.track_dir(dir);
            }
        }

        fs::write(&path, STUB_BODY)
            .map_err(|e| format!("failed to write {}: {e}", path.display()))?;
        debug!("Stubbed '{module_name}' at {}", path.display());
        guard.track_file(StubRecord {
            module_name: module_name.to_owned(),
            file_path: path,
        });
        Ok(())
    }

    /// Directories between the project root and `dir` that do not exist yet, shallowest first
    fn missing_ancestors(&self, dir: &Path) -> Vec<PathBuf> {
        let mut missing: Vec<PathBuf> = dir
            .ancestors()
            .take_while(|ancestor| *ancestor != self.project_root && !ancestor.exists())
            .map(Path::to_path_buf)
            .collect();
        missing.reverse();
        missing
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    fn modules(names: &[&str]) -> IndexSet<String> {
        names.iter().map(|name| (*name).to_owned()).collect()
    }

    #[test]
    fn test_stub_is_written_at_module_path() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let stubber = GlobalModuleStubber::new(temp_dir.path());
        let mut guard = StubGuard::new();

        let warnings = stubber.create_stubs(&modules(&["ui.button"]), &mut guard);
        assert!(warnings.is_empty());

        let expected = temp_dir.path().join("ui").join("button.lua");
        assert_eq!(fs::read_to_string(&expected)?, STUB_BODY);
        assert_eq!(
            guard.records(),
            &[StubRecord {
                module_name: "ui.button".to_owned(),
                file_path: expected.clone(),
            }]
        );
        assert_eq!(guard.created_dirs(), &[temp_dir.path().join("ui")]);

        assert!(guard.cleanup().is_empty());
        assert!(!expected.exists());
        assert!(!temp_dir.path().join("ui").exists());
        Ok(())
    }

    #[test]
    fn test_existing_files_are_left_untouched() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let existing = temp_dir.path().join("net.lua");
        fs::write(&existing, "return { real = true }")?;

        let stubber = GlobalModuleStubber::new(temp_dir.path());
        let mut guard = StubGuard::new();
        let warnings = stubber.create_stubs(&modules(&["net"]), &mut guard);

        assert!(warnings.is_empty());
        assert!(guard.is_empty());
        drop(guard);
        assert_eq!(fs::read_to_string(&existing)?, "return { real = true }");
        Ok(())
    }

    #[test]
    fn test_failures_are_warnings() -> Result<()> {
        let temp_dir = TempDir::new()?;
        // A regular file where a directory is needed
        fs::write(temp_dir.path().join("ui"), "not a directory")?;

        let stubber = GlobalModuleStubber::new(temp_dir.path());
        let mut guard = StubGuard::new();
        let warnings = stubber.create_stubs(&modules(&["ui.button", "net"]), &mut guard);

        assert_eq!(warnings.len(), 1);
        assert!(matches!(
            &warnings[0],
            JobWarning::StubCreation { module, .. } if module == "ui.button"
        ));
        // The remaining module is still stubbed
        assert_eq!(guard.records().len(), 1);
        assert!(temp_dir.path().join("net.lua").exists());
        Ok(())
    }

    #[test]
    fn test_nested_directories_are_tracked_shallowest_first() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let stubber = GlobalModuleStubber::new(temp_dir.path());
        let mut guard = StubGuard::new();

        stubber.create_stubs(&modules(&["a.b.c"]), &mut guard);
        assert_eq!(
            guard.created_dirs(),
            &[temp_dir.path().join("a"), temp_dir.path().join("a").join("b")]
        );
        Ok(())
    }
}
