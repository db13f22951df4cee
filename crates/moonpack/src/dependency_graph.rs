//! Module-level dependency graph for a single bundle job
//!
//! Nodes are keyed by normalized absolute path, so a file maps to at most one
//! node no matter how many names or routes reach it. Node order is the
//! depth-first discovery order from the entry module, which keeps every
//! derived listing (global modules, unresolved references) deterministic.

use std::path::{Path, PathBuf};

use indexmap::{IndexMap, IndexSet};
use petgraph::{algo::tarjan_scc, graph::DiGraph};
use rustc_hash::FxHashMap;

use crate::{error::UnresolvedRequire, resolver::Resolution, types::ModuleKind};

/// A single `require` from one module, with its classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleReference {
    /// Module name as written in the `require`
    pub name: String,
    pub resolution: Resolution,
}

impl ModuleReference {
    pub fn kind(&self) -> ModuleKind {
        self.resolution.kind()
    }

    pub fn resolved_path(&self) -> Option<&Path> {
        self.resolution.local_path()
    }

    pub fn is_global(&self) -> bool {
        self.kind().is_global()
    }

    pub fn is_unresolved(&self) -> bool {
        self.kind().is_unresolved()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleNode {
    pub path: PathBuf,
    /// References in the order they appear in the source text
    pub dependencies: Vec<ModuleReference>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyGraph {
    /// Normalized path of the entry module
    pub entry: PathBuf,
    pub nodes: IndexMap<PathBuf, ModuleNode>,
    /// Paths at which a re-entrant visit was detected
    pub cycles: IndexSet<PathBuf>,
}

impl DependencyGraph {
    pub fn new(entry: PathBuf) -> Self {
        Self {
            entry,
            nodes: IndexMap::new(),
            cycles: IndexSet::new(),
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, path: &Path) -> Option<&ModuleNode> {
        self.nodes.get(path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.nodes.contains_key(path)
    }

    pub fn has_cycles(&self) -> bool {
        !self.cycles.is_empty()
    }

    /// Every reference in the graph, in node then source order
    pub fn references(&self) -> impl Iterator<Item = (&ModuleNode, &ModuleReference)> {
        self.nodes
            .values()
            .flat_map(|node| node.dependencies.iter().map(move |dep| (node, dep)))
    }

    /// Distinct global module names reachable from the entry module
    pub fn global_modules(&self) -> IndexSet<String> {
        self.references()
            .filter(|(_, dep)| dep.is_global())
            .map(|(_, dep)| dep.name.clone())
            .collect()
    }

    /// Every unresolved reference together with the module that contains it
    pub fn unresolved(&self) -> Vec<UnresolvedRequire> {
        self.references()
            .filter(|(_, dep)| dep.is_unresolved())
            .map(|(node, dep)| UnresolvedRequire {
                from: node.path.clone(),
                name: dep.name.clone(),
            })
            .collect()
    }

    /// Groups of modules that require each other
    ///
    /// Strongly connected components with more than one member, plus modules
    /// that require themselves. Members are listed in discovery order.
    pub fn cycle_groups(&self) -> Vec<Vec<PathBuf>> {
        let mut graph: DiGraph<usize, ()> = DiGraph::new();
        let indices: FxHashMap<&Path, _> = self
            .nodes
            .keys()
            .enumerate()
            .map(|(order, path)| (path.as_path(), graph.add_node(order)))
            .collect();

        let mut self_loops = Vec::new();
        for (path, node) in &self.nodes {
            let from = indices[path.as_path()];
            for target in node.dependencies.iter().filter_map(ModuleReference::resolved_path) {
                let Some(&to) = indices.get(target) else {
                    continue;
                };
                if from == to {
                    self_loops.push(from);
                }
                graph.update_edge(from, to, ());
            }
        }

        let mut groups: Vec<Vec<usize>> = tarjan_scc(&graph)
            .into_iter()
            .filter(|component| component.len() > 1 || self_loops.contains(&component[0]))
            .map(|component| {
                let mut order: Vec<usize> = component.into_iter().map(|idx| graph[idx]).collect();
                order.sort_unstable();
                order
            })
            .collect();
        groups.sort_unstable();

        groups
            .into_iter()
            .map(|group| {
                group
                    .into_iter()
                    .filter_map(|order| self.nodes.get_index(order).map(|(path, _)| path.clone()))
                    .collect()
            })
            .collect()
    }

    /// Pairs of node paths that are equal when ASCII case is ignored
    ///
    /// On a case-insensitive filesystem such a pair may be one file reached
    /// under two spellings; the graph keeps them apart and reports them.
    pub fn case_collisions(&self) -> Vec<(PathBuf, PathBuf)> {
        let mut seen: FxHashMap<String, &PathBuf> = FxHashMap::default();
        let mut collisions = Vec::new();
        for path in self.nodes.keys() {
            let folded = path.to_string_lossy().to_ascii_lowercase();
            if let Some(first) = seen.get(&folded) {
                collisions.push(((*first).clone(), path.clone()));
            } else {
                seen.insert(folded, path);
            }
        }
        collisions
    }
}
