//! Graph builder that expands an entry module into a [`DependencyGraph`]
//!
//! The traversal state (`visited`, `stack`, collected warnings) lives on the
//! builder value and is consumed by [`GraphBuilder::build`], so independent
//! jobs never share it.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use log::{debug, trace, warn};
use rustc_hash::FxHashSet;

use crate::{
    dependency_graph::{DependencyGraph, ModuleNode, ModuleReference},
    require_discovery::{DynamicRequire, discover_requires},
    resolver::{ModuleResolver, Resolution, normalize_path},
};

/// A non-literal `require` found while building, with the module it sits in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicRequireSite {
    pub path: PathBuf,
    pub require: DynamicRequire,
}

/// Result of a graph build
#[derive(Debug)]
pub struct BuildOutput {
    pub graph: DependencyGraph,
    pub dynamic_requires: Vec<DynamicRequireSite>,
}

pub struct GraphBuilder<'a> {
    resolver: &'a mut ModuleResolver,
    /// Nodes fully or currently being processed
    visited: FxHashSet<PathBuf>,
    /// Nodes on the current path from the entry module
    stack: FxHashSet<PathBuf>,
    graph: DependencyGraph,
    dynamic_requires: Vec<DynamicRequireSite>,
}

impl std::fmt::Debug for GraphBuilder<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphBuilder")
            .field("entry", &self.graph.entry)
            .field("visited", &self.visited.len())
            .field("stack", &self.stack.len())
            .finish_non_exhaustive()
    }
}

impl<'a> GraphBuilder<'a> {
    pub fn new(resolver: &'a mut ModuleResolver, entry: &Path) -> Self {
        Self {
            resolver,
            visited: FxHashSet::default(),
            stack: FxHashSet::default(),
            graph: DependencyGraph::new(normalize_path(entry)),
            dynamic_requires: Vec::new(),
        }
    }

    /// Build the graph from the entry module
    pub fn build(mut self) -> Result<BuildOutput> {
        let entry = self.graph.entry.clone();
        debug!("Building dependency graph from {}", entry.display());
        self.visit(&entry)?;
        debug!(
            "Dependency graph complete: {} modules, {} cycle points",
            self.graph.node_count(),
            self.graph.cycles.len()
        );
        Ok(BuildOutput {
            graph: self.graph,
            dynamic_requires: self.dynamic_requires,
        })
    }

    fn visit(&mut self, path: &Path) -> Result<()> {
        let path = normalize_path(path);

        // A re-entrant visit: record it and stop descending
        if self.stack.contains(&path) {
            debug!("Circular require detected at {}", path.display());
            self.graph.cycles.insert(path);
            return Ok(());
        }
        // Diamond-shaped graphs reach a node more than once; process it once
        if self.visited.contains(&path) {
            return Ok(());
        }

        self.visited.insert(path.clone());
        self.stack.insert(path.clone());
        // Reserve the slot now so node order is discovery order
        self.graph.nodes.insert(
            path.clone(),
            ModuleNode {
                path: path.clone(),
                dependencies: Vec::new(),
            },
        );

        let bytes =
            fs::read(&path).with_context(|| format!("Failed to read module {}", path.display()))?;
        let source = String::from_utf8_lossy(&bytes);
        let discovered = discover_requires(&source);
        trace!(
            "{}: {} literal requires, {} dynamic",
            path.display(),
            discovered.literal.len(),
            discovered.dynamic.len()
        );

        self.dynamic_requires
            .extend(discovered.dynamic.into_iter().map(|require| {
                warn!(
                    "Non-literal require in '{}' at {}:{}",
                    path.display(),
                    require.line,
                    require.column
                );
                DynamicRequireSite {
                    path: path.clone(),
                    require,
                }
            }));

        let mut dependencies = Vec::with_capacity(discovered.literal.len());
        for reference in discovered.literal {
            let resolution = self.resolver.resolve(&reference.name);
            if let Resolution::Local(target) = &resolution {
                self.visit(target)?;
            }
            dependencies.push(ModuleReference {
                name: reference.name,
                resolution,
            });
        }

        if let Some(node) = self.graph.nodes.get_mut(&path) {
            node.dependencies = dependencies;
        }
        self.stack.remove(&path);
        Ok(())
    }
}

/// Build the dependency graph for an entry module
pub fn build_graph(resolver: &mut ModuleResolver, entry: &Path) -> Result<BuildOutput> {
    GraphBuilder::new(resolver, entry).build()
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::types::ModuleKind;

    struct Project {
        dir: TempDir,
    }

    impl Project {
        fn new(files: &[(&str, &str)]) -> Result<Self> {
            let dir = TempDir::new()?;
            for (rel, content) in files {
                let path = dir.path().join(rel);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(path, content)?;
            }
            Ok(Self { dir })
        }

        fn root(&self) -> &Path {
            self.dir.path()
        }

        fn path(&self, rel: &str) -> PathBuf {
            normalize_path(&self.root().join(rel))
        }

        fn build(&self, runtime: Option<PathBuf>) -> Result<BuildOutput> {
            let mut resolver = ModuleResolver::new(vec![self.root().to_path_buf()], runtime);
            build_graph(&mut resolver, &self.root().join("Main.lua"))
        }
    }

    #[test]
    fn test_diamond_visits_each_module_once() -> Result<()> {
        let project = Project::new(&[
            ("Main.lua", "local a = require('a')\nlocal b = require('b')"),
            ("a.lua", "return require('shared')"),
            ("b.lua", "return require('shared')"),
            ("shared.lua", "return {}"),
        ])?;

        let graph = project.build(None)?.graph;
        assert_eq!(graph.node_count(), 4);
        assert!(!graph.has_cycles());
        let order: Vec<PathBuf> = graph.nodes.keys().cloned().collect();
        assert_eq!(
            order,
            vec![
                project.path("Main.lua"),
                project.path("a.lua"),
                project.path("shared.lua"),
                project.path("b.lua"),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_mutual_cycle_terminates() -> Result<()> {
        let project = Project::new(&[
            ("Main.lua", "require('a')"),
            ("a.lua", "require('b')"),
            ("b.lua", "require('a')"),
        ])?;

        let graph = project.build(None)?.graph;
        assert_eq!(graph.node_count(), 3);
        assert!(graph.has_cycles());
        assert!(graph.cycles.contains(&project.path("a.lua")));
        assert_eq!(
            graph.cycle_groups(),
            vec![vec![project.path("a.lua"), project.path("b.lua")]]
        );
        Ok(())
    }

    #[test]
    fn test_self_cycle_terminates() -> Result<()> {
        let project = Project::new(&[("Main.lua", "require('Main')\nreturn 1")])?;

        let graph = project.build(None)?.graph;
        assert_eq!(graph.node_count(), 1);
        assert_eq!(
            graph.cycles.iter().cloned().collect::<Vec<_>>(),
            vec![project.path("Main.lua")]
        );
        Ok(())
    }

    #[test]
    fn test_long_cycle_terminates() -> Result<()> {
        let mut files: Vec<(String, String)> = (0..50)
            .map(|i| (format!("m{i}.lua"), format!("require('m{}')", (i + 1) % 50)))
            .collect();
        files.push(("Main.lua".to_owned(), "require('m0')".to_owned()));
        let borrowed: Vec<(&str, &str)> = files
            .iter()
            .map(|(name, body)| (name.as_str(), body.as_str()))
            .collect();
        let project = Project::new(&borrowed)?;

        let graph = project.build(None)?.graph;
        assert_eq!(graph.node_count(), 51);
        assert!(graph.cycles.contains(&project.path("m0.lua")));
        assert_eq!(graph.cycle_groups().len(), 1);
        Ok(())
    }

    #[test]
    fn test_global_and_unresolved_are_leaves() -> Result<()> {
        let project = Project::new(&[
            (
                "Main.lua",
                "require('util')\nrequire('ui.button')\nrequire('missing')",
            ),
            ("util.lua", "return {}"),
        ])?;
        let runtime = TempDir::new()?;
        fs::create_dir_all(runtime.path().join("ui"))?;
        fs::write(runtime.path().join("ui/button.lua"), "return {}")?;

        let graph = project.build(Some(runtime.path().to_path_buf()))?.graph;
        let entry = graph
            .node(&project.path("Main.lua"))
            .expect("entry node exists");
        let kinds: Vec<(&str, ModuleKind)> = entry
            .dependencies
            .iter()
            .map(|dep| (dep.name.as_str(), dep.kind()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("util", ModuleKind::Local),
                ("ui.button", ModuleKind::Global),
                ("missing", ModuleKind::Unresolved),
            ]
        );
        assert_eq!(graph.node_count(), 2);
        assert_eq!(
            graph.global_modules().into_iter().collect::<Vec<_>>(),
            vec!["ui.button"]
        );
        assert_eq!(graph.unresolved().len(), 1);
        Ok(())
    }

    #[test]
    fn test_builds_are_deterministic() -> Result<()> {
        let project = Project::new(&[
            ("Main.lua", "require('z')\nrequire('a')\nrequire('pkg')"),
            ("z.lua", "require('a')"),
            ("a.lua", "require('z')"),
            ("pkg/init.lua", "require('pkg.inner')"),
            ("pkg/inner.lua", "return 1"),
        ])?;

        let first = project.build(None)?.graph;
        let second = project.build(None)?.graph;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn test_dynamic_requires_are_collected() -> Result<()> {
        let project = Project::new(&[("Main.lua", "local n = 'x'\nrequire(n)")])?;

        let output = project.build(None)?;
        assert_eq!(output.dynamic_requires.len(), 1);
        assert_eq!(output.dynamic_requires[0].path, project.path("Main.lua"));
        assert_eq!(output.dynamic_requires[0].require.line, 2);
        Ok(())
    }

    #[test]
    fn test_missing_entry_is_an_error() -> Result<()> {
        let project = Project::new(&[])?;
        assert!(project.build(None).is_err());
        Ok(())
    }
}
