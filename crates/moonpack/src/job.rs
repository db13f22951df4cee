//! One bundle job from entry module to stripped bundle text
//!
//! `Created -> [Validating] -> Resolving -> Stubbing -> Bundling ->
//! PostProcessing -> CleaningUp -> Done`. A fatal error jumps straight to
//! `CleaningUp`; stubs are always removed before the outcome is returned.

use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use cow_utils::CowUtils;
use indexmap::IndexSet;
use log::{debug, info, warn};

use crate::{
    cleanup::StubGuard,
    config::{Config, find_entry_file, is_single_file_entry},
    dependency_graph::DependencyGraph,
    engine::{DEFAULT_SEARCH_PATHS, SEARCH_PATH_ENV, SEARCH_PATH_SEPARATOR},
    error::{BundleError, JobWarning, Result},
    graph_builder::build_graph,
    orchestrator::{BundleOrchestrator, BundleResult, WorkerCommand},
    post_process::{StrippedBundle, strip_global_modules},
    resolver::{ModuleResolver, normalize_path},
    stubber::GlobalModuleStubber,
    validator::LuacValidator,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Created,
    Validating,
    Resolving,
    Stubbing,
    Bundling,
    PostProcessing,
    CleaningUp,
    Done,
}

impl JobState {
    pub fn can_transition_to(self, next: Self) -> bool {
        use JobState::{
            Bundling, CleaningUp, Created, Done, PostProcessing, Resolving, Stubbing, Validating,
        };
        matches!(
            (self, next),
            (Created, Validating | Resolving)
                | (Validating, Resolving)
                | (Resolving, Stubbing)
                | (Stubbing, Bundling)
                | (Bundling, PostProcessing)
                | (CleaningUp, Done)
        ) || (next == CleaningUp && !matches!(self, CleaningUp | Done))
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Validating => "validating",
            Self::Resolving => "resolving",
            Self::Stubbing => "stubbing",
            Self::Bundling => "bundling",
            Self::PostProcessing => "post-processing",
            Self::CleaningUp => "cleaning-up",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// Records the states a job passes through
#[derive(Debug)]
struct JobProgress {
    history: Vec<JobState>,
}

impl JobProgress {
    fn new() -> Self {
        Self {
            history: vec![JobState::Created],
        }
    }

    fn current(&self) -> JobState {
        self.history.last().copied().unwrap_or(JobState::Created)
    }

    fn advance(&mut self, next: JobState) {
        let current = self.current();
        debug_assert!(
            current.can_transition_to(next),
            "invalid job transition {current} -> {next}"
        );
        debug!("Job state: {current} -> {next}");
        self.history.push(next);
    }
}

/// Result of dependency analysis, before anything is written to disk
#[derive(Debug, Clone)]
pub struct Analysis {
    pub graph: DependencyGraph,
    /// Runtime-provided modules reachable from the entry module
    pub globals: IndexSet<String>,
    pub cycle_groups: Vec<Vec<PathBuf>>,
    pub warnings: Vec<JobWarning>,
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub entry: PathBuf,
    /// Final bundle text with runtime modules stripped
    pub bundle: String,
    pub module_count: usize,
    pub stripped: Vec<String>,
    pub cycle_groups: Vec<Vec<PathBuf>>,
    pub warnings: Vec<JobWarning>,
    pub states: Vec<JobState>,
}

/// Immutable description of one bundle run
#[derive(Debug, Clone)]
pub struct BundleJob {
    /// Absolute project directory; the worker runs here
    pub project_dir: PathBuf,
    /// Entry file, relative to `project_dir`
    pub entry_file: String,
    pub search_roots: Vec<PathBuf>,
    pub runtime_dir: Option<PathBuf>,
    pub timeout: Duration,
    pub grace_period: Duration,
    pub worker: WorkerCommand,
    pub validate_syntax: bool,
    pub luac: Option<PathBuf>,
}

impl BundleJob {
    /// Build a job from configuration; the entry defaults to the project's `Main.lua`
    pub fn from_config(
        project_dir: &Path,
        entry_file: Option<&str>,
        config: &Config,
    ) -> Result<Self> {
        if !project_dir.is_dir() {
            return Err(BundleError::Config(format!(
                "project directory {} does not exist",
                project_dir.display()
            )));
        }
        let project_dir = normalize_path(project_dir);
        let entry_file = match entry_file {
            Some(entry) => entry.to_owned(),
            None => find_entry_file(&project_dir)?,
        };

        let runtime_dir = match config.deploy_dir() {
            Ok(dir) => Some(dir),
            Err(e) => {
                warn!("No runtime module directory: {e:#}");
                None
            }
        };

        Ok(Self {
            search_roots: config.search_roots(&project_dir),
            project_dir,
            entry_file,
            runtime_dir,
            timeout: config.timeout(),
            grace_period: config.grace_period(),
            worker: WorkerCommand::from_config(&config.worker)?,
            validate_syntax: config.validate_syntax,
            luac: config.luac.clone(),
        })
    }

    pub fn entry_path(&self) -> PathBuf {
        self.project_dir.join(&self.entry_file)
    }

    /// An entry other than `Main.lua` is deployed as-is, without bundling
    pub fn is_single_file(&self) -> bool {
        is_single_file_entry(&self.entry_file)
    }

    /// Syntax-check the entry file alone
    ///
    /// Used for single-file deploys, which skip dependency analysis entirely.
    pub fn check_single_file(&self) -> Result<Vec<JobWarning>> {
        let entry = self.entry_path();
        if !entry.is_file() {
            return Err(BundleError::Config(format!(
                "entry file {} does not exist",
                entry.display()
            )));
        }

        let mut warnings = Vec::new();
        if self.validate_syntax {
            match LuacValidator::locate(self.luac.as_deref()) {
                Some(validator) => {
                    validator.validate_file(&entry, &self.project_dir)?;
                    info!("Syntax check passed for {}", self.entry_file);
                }
                None => warnings.push(JobWarning::ValidatorUnavailable),
            }
        }
        Ok(warnings)
    }

    /// Search path templates handed to the worker's engine
    ///
    /// Each root contributes `<root>/?.lua` and `<root>/?/init.lua`, in root
    /// order. Roots inside the project are written relative to it; the
    /// project's own templates are appended when no root covers it, so
    /// runtime stubs stay reachable.
    pub fn engine_search_path(&self) -> Result<String> {
        let mut templates = Vec::with_capacity(self.search_roots.len() * 2 + 2);
        let mut covers_project = false;
        for root in &self.search_roots {
            let root = normalize_path(root);
            let base = match root.strip_prefix(&self.project_dir) {
                Ok(rel) if rel.as_os_str().is_empty() => {
                    covers_project = true;
                    ".".to_owned()
                }
                Ok(rel) => format!("./{}", template_text(rel)?),
                Err(_) => template_text(&root)?,
            };
            templates.push(format!("{base}/?.lua"));
            templates.push(format!("{base}/?/init.lua"));
        }
        if !covers_project {
            templates.extend(DEFAULT_SEARCH_PATHS.iter().map(|t| (*t).to_owned()));
        }
        Ok(templates.join(SEARCH_PATH_SEPARATOR))
    }

    /// Build the dependency graph and collect its warnings
    pub fn analyze(&self) -> Result<Analysis> {
        let mut resolver = ModuleResolver::new(self.search_roots.clone(), self.runtime_dir.clone());
        let built = build_graph(&mut resolver, &self.entry_path())?;
        let graph = built.graph;

        let mut warnings: Vec<JobWarning> = graph
            .cycles
            .iter()
            .map(|path| JobWarning::Cycle { path: path.clone() })
            .collect();
        warnings.extend(built.dynamic_requires.into_iter().map(|site| {
            JobWarning::DynamicRequire {
                path: site.path,
                line: site.require.line,
                column: site.require.column,
                expression: site.require.expression,
            }
        }));
        warnings.extend(
            graph
                .case_collisions()
                .into_iter()
                .map(|(first, second)| JobWarning::CaseCollision { first, second }),
        );

        let globals = graph.global_modules();
        let cycle_groups = graph.cycle_groups();
        info!(
            "Analyzed {}: {} module(s), {} runtime module(s), {} cycle group(s)",
            self.entry_file,
            graph.node_count(),
            globals.len(),
            cycle_groups.len()
        );
        Ok(Analysis {
            graph,
            globals,
            cycle_groups,
            warnings,
        })
    }

    /// Syntax gate plus dependency analysis, without touching the project tree
    pub fn check(&self) -> Result<Analysis> {
        let mut warnings = Vec::new();
        self.validate(&mut warnings)?;
        let mut analysis = self.analyze()?;
        ensure_resolved(&analysis.graph)?;
        warnings.append(&mut analysis.warnings);
        analysis.warnings = warnings;
        Ok(analysis)
    }

    /// Run the whole pipeline and return the stripped bundle
    ///
    /// Nothing is written outside the project's temporary stubs; see
    /// [`crate::deploy::publish`] for the output step.
    pub fn run(&self) -> Result<JobReport> {
        let mut progress = JobProgress::new();
        let mut warnings = Vec::new();
        let mut guard = StubGuard::new();

        let outcome = self.execute(&mut progress, &mut guard, &mut warnings);

        progress.advance(JobState::CleaningUp);
        warnings.extend(guard.cleanup());
        progress.advance(JobState::Done);

        let (analysis, stripped) = outcome?;
        warnings.extend(
            stripped
                .report
                .missing
                .iter()
                .map(|module| JobWarning::MissingRegistration {
                    module: module.clone(),
                }),
        );
        for warning in &warnings {
            warn!("{warning}");
        }

        Ok(JobReport {
            entry: self.entry_path(),
            bundle: stripped.text,
            module_count: analysis.graph.node_count(),
            stripped: stripped.report.stripped,
            cycle_groups: analysis.cycle_groups,
            warnings,
            states: progress.history,
        })
    }

    fn execute(
        &self,
        progress: &mut JobProgress,
        guard: &mut StubGuard,
        warnings: &mut Vec<JobWarning>,
    ) -> Result<(Analysis, StrippedBundle)> {
        if self.validate_syntax {
            progress.advance(JobState::Validating);
            self.validate(warnings)?;
        }

        progress.advance(JobState::Resolving);
        let mut analysis = self.analyze()?;
        warnings.append(&mut analysis.warnings);
        ensure_resolved(&analysis.graph)?;

        progress.advance(JobState::Stubbing);
        let stubber = GlobalModuleStubber::new(&self.project_dir);
        warnings.extend(stubber.create_stubs(&analysis.globals, guard));

        progress.advance(JobState::Bundling);
        let worker = self
            .worker
            .clone()
            .env(SEARCH_PATH_ENV, self.engine_search_path()?);
        let orchestrator = BundleOrchestrator::new(worker, self.timeout, self.grace_period);
        let output = match orchestrator.run_blocking(&self.project_dir, &self.entry_file)? {
            BundleResult::Success { output } => output,
            BundleResult::TimedOut { timeout, captured } => {
                return Err(BundleError::Timeout {
                    timeout,
                    project_dir: self.project_dir.clone(),
                    entry: self.entry_file.clone(),
                    captured,
                });
            }
            BundleResult::Failed { message } => {
                return Err(BundleError::Failed {
                    project_dir: self.project_dir.clone(),
                    entry: self.entry_file.clone(),
                    diagnostic: message,
                });
            }
        };

        progress.advance(JobState::PostProcessing);
        let stripped = strip_global_modules(output, &analysis.globals)?;
        Ok((analysis, stripped))
    }

    fn validate(&self, warnings: &mut Vec<JobWarning>) -> Result<()> {
        if !self.validate_syntax {
            return Ok(());
        }
        match LuacValidator::locate(self.luac.as_deref()) {
            Some(validator) => validator.validate_project(&self.project_dir).map(|_| ()),
            None => {
                warnings.push(JobWarning::ValidatorUnavailable);
                Ok(())
            }
        }
    }
}

/// A search root as template text, with `/` separators
fn template_text(path: &Path) -> Result<String> {
    let text = path.to_str().ok_or_else(|| {
        BundleError::Config(format!("search root {} is not valid UTF-8", path.display()))
    })?;
    if text.contains(SEARCH_PATH_SEPARATOR) || text.contains('?') {
        return Err(BundleError::Config(format!(
            "search root {text} contains '{SEARCH_PATH_SEPARATOR}' or '?'"
        )));
    }
    Ok(text.cow_replace('\\', "/").into_owned())
}

fn ensure_resolved(graph: &DependencyGraph) -> Result<()> {
    let unresolved = graph.unresolved();
    if unresolved.is_empty() {
        Ok(())
    } else {
        Err(BundleError::Unresolved(unresolved))
    }
}
