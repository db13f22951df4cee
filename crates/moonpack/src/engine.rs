//! The bundling engine run inside the isolated worker

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use cow_utils::CowUtils;
use indexmap::IndexSet;
use log::{debug, trace};
use thiserror::Error;

use crate::{
    bundle::{BundleDocument, BundleOutput, ROOT_MODULE_NAME},
    require_discovery::discover_requires,
};

/// Search path templates, relative to the project directory
pub const DEFAULT_SEARCH_PATHS: [&str; 2] = ["./?.lua", "./?/init.lua"];

/// Environment variable carrying the worker's search path templates
pub const SEARCH_PATH_ENV: &str = "MOONPACK_SEARCH_PATH";

/// Separator between templates in [`SEARCH_PATH_ENV`]
pub const SEARCH_PATH_SEPARATOR: &str = ";";

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Could not find module '{name}' required by '{required_by}'. Searched: {searched}")]
    ModuleNotFound {
        name: String,
        required_by: String,
        searched: String,
    },

    #[error("Failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Turns an entry file and the files it requires into one bundle
pub trait BundleEngine {
    fn bundle(&self, project_dir: &Path, entry_file: &str) -> Result<BundleOutput, EngineError>;
}

/// Engine producing the standard `__bundle_register` layout
#[derive(Debug, Clone)]
pub struct LuaBundleEngine {
    search_paths: Vec<String>,
}

impl Default for LuaBundleEngine {
    fn default() -> Self {
        Self::new(DEFAULT_SEARCH_PATHS.iter().map(|p| (*p).to_owned()).collect())
    }
}

impl LuaBundleEngine {
    pub fn new(search_paths: Vec<String>) -> Self {
        Self { search_paths }
    }

    /// Build from a `;`-separated template list; empty input keeps the defaults
    pub fn from_search_path(search_path: &str) -> Self {
        let templates: Vec<String> = search_path
            .split(SEARCH_PATH_SEPARATOR)
            .map(str::trim)
            .filter(|template| !template.is_empty())
            .map(ToOwned::to_owned)
            .collect();
        if templates.is_empty() {
            Self::default()
        } else {
            Self::new(templates)
        }
    }

    pub fn search_paths(&self) -> &[String] {
        &self.search_paths
    }

    fn locate(&self, project_dir: &Path, name: &str) -> Option<PathBuf> {
        let relative = name.cow_replace('.', "/");
        self.search_paths
            .iter()
            .map(|template| project_dir.join(&*template.cow_replace('?', &relative)))
            .find(|candidate| candidate.is_file())
    }
}

impl BundleEngine for LuaBundleEngine {
    fn bundle(&self, project_dir: &Path, entry_file: &str) -> Result<BundleOutput, EngineError> {
        let mut document = BundleDocument::new();
        let mut processed: IndexSet<String> = IndexSet::new();
        // (registration name, file, display name used in diagnostics)
        let mut pending = vec![(
            ROOT_MODULE_NAME.to_owned(),
            project_dir.join(entry_file),
            entry_file.to_owned(),
        )];
        processed.insert(ROOT_MODULE_NAME.to_owned());

        while let Some((name, path, display)) = pending.pop() {
            let bytes = fs::read(&path).map_err(|source| EngineError::Read {
                path: path.clone(),
                source,
            })?;
            let body = String::from_utf8_lossy(&bytes).into_owned();

            let mut children = Vec::new();
            for required in discover_requires(&body).literal {
                // Marked on first sight so a cycle registers each module once
                if !processed.insert(required.name.clone()) {
                    continue;
                }
                let found = self.locate(project_dir, &required.name).ok_or_else(|| {
                    EngineError::ModuleNotFound {
                        name: required.name.clone(),
                        required_by: display.clone(),
                        searched: self.search_paths.join(";"),
                    }
                })?;
                trace!("{display} requires {} ({})", required.name, found.display());
                children.push((required.name.clone(), found, required.name));
            }

            document.push(name, body);
            // Depth-first in source order
            pending.extend(children.into_iter().rev());
        }

        debug!(
            "Bundled {} module(s) from {}",
            document.modules.len(),
            entry_file
        );
        Ok(BundleOutput::Structured(document))
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    fn project(files: &[(&str, &str)]) -> Result<TempDir> {
        let dir = TempDir::new()?;
        for (rel, content) in files {
            let path = dir.path().join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, content)?;
        }
        Ok(dir)
    }

    fn module_names(output: &BundleOutput) -> Vec<String> {
        match output {
            BundleOutput::Structured(document) => {
                document.modules.iter().map(|m| m.name.clone()).collect()
            }
            BundleOutput::Text { .. } => Vec::new(),
        }
    }

    #[test]
    fn test_search_path_parsing() {
        let engine = LuaBundleEngine::from_search_path(" ./src/?.lua ;; ./?.lua ");
        assert_eq!(engine.search_paths(), ["./src/?.lua", "./?.lua"]);

        let engine = LuaBundleEngine::from_search_path(" ; ");
        assert_eq!(engine.search_paths(), DEFAULT_SEARCH_PATHS);
    }

    #[test]
    fn test_absolute_template_reaches_outside_project() -> Result<()> {
        let dir = project(&[("Main.lua", "return require('ui.theme')")])?;
        let shared = project(&[("ui/theme.lua", "return {}")])?;

        let template = format!("{}/?.lua", shared.path().display());
        let engine = LuaBundleEngine::new(vec!["./?.lua".to_owned(), template]);
        let output = engine.bundle(dir.path(), "Main.lua")?;
        assert_eq!(module_names(&output), vec!["__root", "ui.theme"]);

        let err = LuaBundleEngine::default()
            .bundle(dir.path(), "Main.lua")
            .expect_err("module outside the default templates");
        assert!(err.to_string().contains("'ui.theme'"), "{err}");
        Ok(())
    }

    #[test]
    fn test_modules_registered_in_depth_first_order() -> Result<()> {
        let dir = project(&[
            ("Main.lua", "local a = require('a')\nlocal pkg = require('pkg')"),
            ("a.lua", "return require('a.inner')"),
            ("a/inner.lua", "return 1"),
            ("pkg/init.lua", "return require('a')"),
        ])?;

        let output = LuaBundleEngine::default().bundle(dir.path(), "Main.lua")?;
        assert_eq!(module_names(&output), vec!["__root", "a", "a.inner", "pkg"]);

        let text = output.render();
        assert!(text.ends_with("return __bundle_require(\"__root\")\n"));
        Ok(())
    }

    #[test]
    fn test_cycles_register_each_module_once() -> Result<()> {
        let dir = project(&[
            ("Main.lua", "require('a')"),
            ("a.lua", "require('b')"),
            ("b.lua", "require('a')\nrequire('b')"),
        ])?;

        let output = LuaBundleEngine::default().bundle(dir.path(), "Main.lua")?;
        assert_eq!(module_names(&output), vec!["__root", "a", "b"]);
        Ok(())
    }

    #[test]
    fn test_missing_module_names_requirer() -> Result<()> {
        let dir = project(&[("Main.lua", "require('util')"), ("util.lua", "require('gone')")])?;

        let err = LuaBundleEngine::default()
            .bundle(dir.path(), "Main.lua")
            .expect_err("missing module must fail");
        assert!(matches!(
            &err,
            EngineError::ModuleNotFound { name, required_by, .. }
                if name == "gone" && required_by == "util"
        ));
        assert!(err.to_string().contains("./?.lua;./?/init.lua"));
        Ok(())
    }

    #[test]
    fn test_missing_entry_is_a_read_error() -> Result<()> {
        let dir = project(&[])?;
        let err = LuaBundleEngine::default()
            .bundle(dir.path(), "Main.lua")
            .expect_err("missing entry must fail");
        assert!(matches!(err, EngineError::Read { .. }));
        Ok(())
    }
}
