//! Syntax gate run before bundling: `luac -p` over every project file

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use anyhow::{Context, anyhow};
use log::{debug, info, warn};
use tokio::process::Command;
use walkdir::{DirEntry, WalkDir};

use crate::{
    error::BundleError, orchestrator::current_thread_runtime, resolver::MODULE_EXTENSION,
};

/// Compiler names tried on `PATH`, in order
pub const LUAC_CANDIDATES: [&str; 5] = ["luac5.4", "luac54", "luac5.5", "luac55", "luac"];

/// Directory names never descended into
pub const SKIPPED_DIRS: [&str; 2] = ["build", "node_modules"];

/// Limit for a single `luac -p` run
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LuacValidator {
    luac: PathBuf,
    timeout: Duration,
}

impl LuacValidator {
    pub fn new(luac: impl Into<PathBuf>) -> Self {
        Self {
            luac: luac.into(),
            timeout: DEFAULT_CHECK_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Find a compiler: the explicit one if usable, else the first candidate on `PATH`
    pub fn locate(explicit: Option<&Path>) -> Option<Self> {
        if let Some(explicit) = explicit {
            if explicit.is_file() {
                return Some(Self::new(explicit));
            }
            if let Ok(found) = which::which(explicit) {
                return Some(Self::new(found));
            }
            warn!("Configured Lua compiler {} not found", explicit.display());
        }

        LUAC_CANDIDATES
            .iter()
            .find_map(|candidate| which::which(candidate).ok())
            .map(|found| {
                debug!("Using Lua compiler {}", found.display());
                Self::new(found)
            })
    }

    pub fn luac(&self) -> &Path {
        &self.luac
    }

    /// Syntax-check one file; `Ok(Some(diagnostic))` when it does not compile
    ///
    /// A compiler that does not finish within the timeout is killed and reported as an error.
    pub fn check_file(&self, path: &Path) -> anyhow::Result<Option<String>> {
        current_thread_runtime()?.block_on(self.run_luac(path))
    }

    /// Check a single file, reporting it relative to `project_dir`
    pub fn validate_file(&self, path: &Path, project_dir: &Path) -> crate::error::Result<()> {
        match self.check_file(path)? {
            Some(diagnostic) => Err(validation_error(path, project_dir, diagnostic)),
            None => Ok(()),
        }
    }

    /// Check every Lua file in a project, stopping at the first invalid one
    ///
    /// Returns the number of files checked.
    pub fn validate_project(&self, project_dir: &Path) -> crate::error::Result<usize> {
        let files = lua_files(project_dir);
        let runtime = current_thread_runtime()?;
        for file in &files {
            if let Some(diagnostic) = runtime.block_on(self.run_luac(file))? {
                return Err(validation_error(file, project_dir, diagnostic));
            }
        }
        info!("Syntax check passed for {} file(s)", files.len());
        Ok(files.len())
    }

    async fn run_luac(&self, path: &Path) -> anyhow::Result<Option<String>> {
        let mut command = Command::new(&self.luac);
        command
            .arg("-p")
            .arg(path)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| {
                anyhow!(
                    "{} -p {} did not finish within {}ms",
                    self.luac.display(),
                    path.display(),
                    self.timeout.as_millis()
                )
            })?
            .with_context(|| format!("Failed to run {}", self.luac.display()))?;
        if output.status.success() {
            return Ok(None);
        }

        let mut diagnostic = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        if diagnostic.is_empty() {
            diagnostic = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        }
        Ok(Some(diagnostic))
    }
}

fn validation_error(file: &Path, project_dir: &Path, diagnostic: String) -> BundleError {
    let path = file.strip_prefix(project_dir).unwrap_or(file).to_path_buf();
    BundleError::Validation { path, diagnostic }
}

/// Every `.lua` file under `project_dir`, skipping build output and hidden directories
pub fn lua_files(project_dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(project_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_skipped_dir(entry))
        // Unreadable entries are skipped
        .filter_map(Result::ok)
        .filter(|entry| {
            entry.file_type().is_file()
                && entry
                    .path()
                    .extension()
                    .is_some_and(|ext| ext == MODULE_EXTENSION)
        })
        .map(DirEntry::into_path)
        .collect()
}

fn is_skipped_dir(entry: &DirEntry) -> bool {
    if !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || SKIPPED_DIRS.contains(&&*name)
}
