//! Shared type definitions for the moonpack crate
//!
//! This module contains common types that are used across multiple components
//! of the bundler, ensuring consistency and avoiding circular dependencies.

/// Classification of a `require` target based on where it was found
///
/// Every reference discovered in a module falls into exactly one of these
/// buckets, and the classification drives whether the graph builder descends
/// into it, whether a stub is materialized for it, and whether the job fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleKind {
    /// Module found under one of the project search roots; inlined into the bundle
    Local,

    /// Module supplied by the deployment runtime; stubbed, then stripped
    Global,

    /// Module found nowhere
    Unresolved,
}

impl ModuleKind {
    /// Check if this is a project-local module
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local)
    }

    /// Check if this module is provided by the runtime
    pub fn is_global(&self) -> bool {
        matches!(self, Self::Global)
    }

    /// Check if this module could not be found
    pub fn is_unresolved(&self) -> bool {
        matches!(self, Self::Unresolved)
    }
}

impl std::fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Global => write!(f, "global"),
            Self::Unresolved => write!(f, "unresolved"),
        }
    }
}
