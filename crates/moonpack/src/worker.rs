//! Body of the `moonpack worker` subcommand

use std::path::Path;

use log::debug;

use crate::{
    engine::{BundleEngine, LuaBundleEngine, SEARCH_PATH_ENV},
    protocol::WorkerReport,
};

/// Bundle `entry_file` from `project_dir` with the built-in engine
///
/// The working directory is switched to the project first, so the engine's
/// relative search paths resolve inside it. Templates come from
/// `MOONPACK_SEARCH_PATH` when the parent set it. Only call this from a
/// dedicated worker process.
pub fn run_worker(project_dir: &Path, entry_file: &str) -> WorkerReport {
    if let Err(e) = std::env::set_current_dir(project_dir) {
        return WorkerReport::Failure {
            diagnostic: format!(
                "Failed to enter project directory {}: {e}",
                project_dir.display()
            ),
        };
    }
    debug!("Worker bundling {entry_file} in {}", project_dir.display());

    let engine = match std::env::var(SEARCH_PATH_ENV) {
        Ok(search_path) => LuaBundleEngine::from_search_path(&search_path),
        Err(_) => LuaBundleEngine::default(),
    };
    bundle_with(&engine, Path::new("."), entry_file)
}

/// Run an engine and fold its outcome into a report
pub fn bundle_with(engine: &dyn BundleEngine, project_dir: &Path, entry_file: &str) -> WorkerReport {
    match engine.bundle(project_dir, entry_file) {
        Ok(bundle) => WorkerReport::Success { bundle },
        Err(e) => WorkerReport::Failure {
            diagnostic: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use anyhow::Result;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_success_and_failure_reports() -> Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("Main.lua"), "return require('util')")?;

        let engine = LuaBundleEngine::default();
        let report = bundle_with(&engine, dir.path(), "Main.lua");
        assert!(matches!(
            &report,
            WorkerReport::Failure { diagnostic } if diagnostic.contains("'util'")
        ));

        fs::write(dir.path().join("util.lua"), "return {}")?;
        let report = bundle_with(&engine, dir.path(), "Main.lua");
        assert!(report.is_success());
        Ok(())
    }
}
