use std::{path::PathBuf, time::Duration};

use thiserror::Error;

use crate::post_process::PostProcessError;

pub type Result<T> = std::result::Result<T, BundleError>;

/// A `require` that could not be satisfied by any search root or the runtime directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedRequire {
    /// The module that contains the `require`
    pub from: PathBuf,
    /// The required module name, as written
    pub name: String,
}

impl std::fmt::Display for UnresolvedRequire {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "require('{}') from {}", self.name, self.from.display())
    }
}

/// Fatal job failures. Exactly one of these is surfaced per failed job.
#[derive(Error, Debug)]
pub enum BundleError {
    #[error("cannot resolve {}", format_unresolved(.0))]
    Unresolved(Vec<UnresolvedRequire>),

    #[error(
        "bundle operation timed out after {}ms (project_dir: {}, entry: {entry}).\n\
         This usually indicates:\n  \
         1. A cyclic require chain the bundling engine cannot settle\n  \
         2. A malformed module that sends the engine into a loop\n  \
         3. A worker process stuck on file I/O{}",
        .timeout.as_millis(),
        .project_dir.display(),
        format_captured(.captured)
    )]
    Timeout {
        timeout: Duration,
        project_dir: PathBuf,
        entry: String,
        captured: String,
    },

    #[error(
        "bundle failed (project_dir: {}, entry: {entry}): {diagnostic}\n\
         Common causes: a require of a module missing from the project, a syntax error \
         in a required module, or a runtime module that is not installed in the deploy directory",
        .project_dir.display()
    )]
    Failed {
        project_dir: PathBuf,
        entry: String,
        diagnostic: String,
    },

    #[error("syntax error in {}: {diagnostic}", .path.display())]
    Validation { path: PathBuf, diagnostic: String },

    #[error("post-processing failed: {0}")]
    PostProcess(#[from] PostProcessError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn format_unresolved(unresolved: &[UnresolvedRequire]) -> String {
    unresolved
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_captured(captured: &str) -> String {
    if captured.trim().is_empty() {
        String::new()
    } else {
        format!("\nCaptured worker stderr before timeout:\n{}", captured.trim_end())
    }
}

/// Non-fatal conditions accumulated over a job and reported with its result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobWarning {
    /// A re-entrant visit was detected at this module
    Cycle { path: PathBuf },
    /// A runtime module stub could not be written; the module is unresolved for this run
    StubCreation { module: String, reason: String },
    /// A stub file could not be removed after the job
    Cleanup { path: PathBuf, reason: String },
    /// A `require` whose argument is not a string literal
    DynamicRequire {
        path: PathBuf,
        line: usize,
        column: usize,
        expression: String,
    },
    /// Two graph nodes whose paths differ only by ASCII case
    CaseCollision { first: PathBuf, second: PathBuf },
    /// No Lua compiler was found, so syntax validation was skipped
    ValidatorUnavailable,
    /// A global module had no registration block in the engine output
    MissingRegistration { module: String },
}

impl std::fmt::Display for JobWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cycle { path } => write!(f, "circular require detected at {}", path.display()),
            Self::StubCreation { module, reason } => {
                write!(f, "could not create stub for runtime module '{module}': {reason}")
            }
            Self::Cleanup { path, reason } => {
                write!(f, "could not remove stub {}: {reason}", path.display())
            }
            Self::DynamicRequire {
                path,
                line,
                column,
                expression,
            } => write!(
                f,
                "non-literal require({expression}) in {} at {line}:{column}",
                path.display()
            ),
            Self::CaseCollision { first, second } => write!(
                f,
                "{} and {} differ only by case",
                first.display(),
                second.display()
            ),
            Self::ValidatorUnavailable => {
                write!(f, "Lua compiler not found, syntax validation skipped")
            }
            Self::MissingRegistration { module } => {
                write!(f, "no registration block for runtime module '{module}' in bundle")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unresolved_lists_every_reference() {
        let err = BundleError::Unresolved(vec![
            UnresolvedRequire {
                from: PathBuf::from("/p/Main.lua"),
                name: "missing.one".to_owned(),
            },
            UnresolvedRequire {
                from: PathBuf::from("/p/util.lua"),
                name: "missing.two".to_owned(),
            },
        ]);
        let message = err.to_string();
        assert!(message.contains("require('missing.one') from /p/Main.lua"));
        assert!(message.contains("require('missing.two') from /p/util.lua"));
    }

    #[test]
    fn test_timeout_message_points_at_cycles() {
        let err = BundleError::Timeout {
            timeout: Duration::from_millis(1500),
            project_dir: PathBuf::from("/p"),
            entry: "Main.lua".to_owned(),
            captured: String::new(),
        };
        let message = err.to_string();
        assert!(message.contains("1500ms"));
        assert!(message.contains("cyclic require"));
        assert!(!message.contains("Captured worker stderr"));
    }

    #[test]
    fn test_failure_keeps_engine_diagnostic() {
        let err = BundleError::Failed {
            project_dir: PathBuf::from("/p"),
            entry: "Main.lua".to_owned(),
            diagnostic: "Could not find module 'gone'".to_owned(),
        };
        assert!(err.to_string().contains("Could not find module 'gone'"));
    }
}
