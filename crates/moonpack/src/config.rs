//! Configuration loading
//!
//! Sources, lowest to highest precedence: built-in defaults, `moonpack.toml` in
//! the project directory (or an explicit `--config` file), `MOONPACK_*`
//! environment variables, then CLI flags applied by the caller.

use std::{
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::dirs;

/// Config file looked up in the project directory
pub const CONFIG_FILE_NAME: &str = "moonpack.toml";

/// Optional file whose trimmed contents name the output artifact
pub const TITLE_FILE_NAME: &str = "title.txt";

pub const DEFAULT_OUTPUT_NAME: &str = "Main.lua";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_GRACE_MS: u64 = 2_000;

/// Entry file names tried in order when none is given
pub const ENTRY_CANDIDATES: [&str; 3] = ["Main.lua", "main.lua", "MAIN.LUA"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// Project search roots, tried in order. Empty means the project directory only.
    pub src: Vec<PathBuf>,
    /// Runtime module directory, also the deployment target
    pub deploy_dir: Option<PathBuf>,
    /// Where the bundle is written before deployment
    pub output_dir: Option<PathBuf>,
    /// File name of the bundle artifact
    pub output_name: Option<String>,
    /// Hard wall-clock limit for the bundling worker
    pub timeout_ms: u64,
    /// Time between the graceful termination request and the forced kill
    pub grace_ms: u64,
    /// Run `luac -p` over the project before bundling
    pub validate_syntax: bool,
    /// Explicit Lua compiler used for validation
    pub luac: Option<PathBuf>,
    pub worker: WorkerConfig,
}

/// The isolated bundling worker
///
/// Without a program the current executable is re-invoked with `worker`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct WorkerConfig {
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            src: Vec::new(),
            deploy_dir: None,
            output_dir: None,
            output_name: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            grace_ms: DEFAULT_GRACE_MS,
            validate_syntax: true,
            luac: None,
            worker: WorkerConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration for a project directory
    ///
    /// An explicit config path must exist; the implicit `moonpack.toml` is optional.
    pub fn load(project_dir: &Path, explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => {
                let implicit = project_dir.join(CONFIG_FILE_NAME);
                if implicit.is_file() {
                    Self::from_file(&implicit)?
                } else {
                    Self::default()
                }
            }
        };

        if config.output_name.is_none() {
            config.output_name = read_title_file(project_dir);
        }

        config.apply_env_overrides(|key| std::env::var_os(key))?;
        Ok(config)
    }

    /// Parse a config file; relative paths inside it are anchored at its directory
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        if let Some(base) = path.parent() {
            config.anchor_paths(base);
        }
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    fn anchor_paths(&mut self, base: &Path) {
        let anchor = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        self.src.iter_mut().for_each(anchor);
        for path in [&mut self.deploy_dir, &mut self.output_dir, &mut self.luac]
            .into_iter()
            .flatten()
        {
            anchor(path);
        }
        if let Some(program) = self.worker.program.as_mut()
            && program.components().count() > 1
        {
            anchor(program);
        }
    }

    /// Apply `MOONPACK_*` overrides
    ///
    /// `DEPLOY_DIR` and `BUNDLE_OUTPUT_DIR` are accepted as lower-precedence aliases
    /// for compatibility with older deploy scripts.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.is_empty());

        if let Some(dir) = non_empty("MOONPACK_DEPLOY_DIR").or_else(|| non_empty("DEPLOY_DIR")) {
            self.deploy_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) =
            non_empty("MOONPACK_OUTPUT_DIR").or_else(|| non_empty("BUNDLE_OUTPUT_DIR"))
        {
            self.output_dir = Some(PathBuf::from(dir));
        }
        if let Some(timeout) = non_empty("MOONPACK_TIMEOUT_MS") {
            let timeout = timeout.to_string_lossy();
            self.timeout_ms = timeout
                .trim()
                .parse()
                .map_err(|e| anyhow!("MOONPACK_TIMEOUT_MS must be milliseconds, got '{timeout}': {e}"))?;
        }
        Ok(())
    }

    /// Search roots for a project, in precedence order
    pub fn search_roots(&self, project_dir: &Path) -> Vec<PathBuf> {
        if self.src.is_empty() {
            vec![project_dir.to_path_buf()]
        } else {
            self.src.clone()
        }
    }

    pub fn output_dir(&self, project_dir: &Path) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| project_dir.join("build"))
    }

    pub fn output_name(&self) -> &str {
        self.output_name.as_deref().unwrap_or(DEFAULT_OUTPUT_NAME)
    }

    pub fn deploy_dir(&self) -> Result<PathBuf> {
        match &self.deploy_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::default_deploy_dir(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

/// Read the output name from `title.txt`, ignoring a missing or blank file
fn read_title_file(project_dir: &Path) -> Option<String> {
    let contents = fs::read_to_string(project_dir.join(TITLE_FILE_NAME)).ok()?;
    let title = contents.trim();
    if title.is_empty() {
        None
    } else {
        Some(title.to_owned())
    }
}

/// Find the entry module of a project: the first of [`ENTRY_CANDIDATES`] that exists
pub fn find_entry_file(project_dir: &Path) -> Result<String> {
    ENTRY_CANDIDATES
        .iter()
        .find(|candidate| project_dir.join(candidate).is_file())
        .map(|candidate| (*candidate).to_owned())
        .ok_or_else(|| {
            anyhow!(
                "No Main.lua found in project directory {}",
                project_dir.display()
            )
        })
}

/// Whether an entry file is deployed on its own instead of bundled
///
/// Only an entry named like one of [`ENTRY_CANDIDATES`] roots a require tree.
pub fn is_single_file_entry(entry_file: &str) -> bool {
    let name = Path::new(entry_file)
        .file_name()
        .map_or_else(|| entry_file.into(), |name| name.to_string_lossy());
    !ENTRY_CANDIDATES
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(&name))
}
