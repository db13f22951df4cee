use std::path::{Path, PathBuf};

use cow_utils::CowUtils;
use indexmap::IndexMap;
use log::{debug, trace, warn};

use crate::types::ModuleKind;

/// Extension of script modules
pub const MODULE_EXTENSION: &str = "lua";

/// File stem of a package's entry module (`foo/init.lua`)
pub const PACKAGE_INIT_STEM: &str = "init";

/// Where a `require` target was found
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Resolution {
    /// Found under a project search root; the path is normalized
    Local(PathBuf),
    /// Found only in the runtime module directory
    Global(PathBuf),
    Unresolved,
}

impl Resolution {
    pub fn kind(&self) -> ModuleKind {
        match self {
            Self::Local(_) => ModuleKind::Local,
            Self::Global(_) => ModuleKind::Global,
            Self::Unresolved => ModuleKind::Unresolved,
        }
    }

    /// The project file this resolution points at, if it is local
    pub fn local_path(&self) -> Option<&Path> {
        match self {
            Self::Local(path) => Some(path),
            _ => None,
        }
    }
}

/// Convert a dotted module name into its relative path stem
///
/// Returns `None` for names that cannot denote a file: empty segments
/// (`a..b`, `.a`), or segments that would step outside a search root.
pub fn module_path_stem(module_name: &str) -> Option<PathBuf> {
    let valid = !module_name.is_empty()
        && module_name.split('.').all(|segment| {
            !segment.is_empty() && !segment.contains(['/', '\\']) && segment != ".."
        });
    if !valid {
        return None;
    }

    let joined = module_name.cow_replace('.', std::path::MAIN_SEPARATOR_STR);
    Some(PathBuf::from(joined.into_owned()))
}

/// The two candidate files for a module under a root, in precedence order:
/// `<root>/<name>.lua`, then `<root>/<name>/init.lua`
pub fn module_candidates(root: &Path, stem: &Path) -> [PathBuf; 2] {
    let file = root.join(stem);
    let mut file_os = file.clone().into_os_string();
    file_os.push(".");
    file_os.push(MODULE_EXTENSION);

    let init = file.join(PACKAGE_INIT_STEM).with_extension(MODULE_EXTENSION);
    [PathBuf::from(file_os), init]
}

/// Normalize a path for use as a graph key
///
/// Canonicalization collapses symlinks and `..`; if it fails the path is made
/// absolute lexically so keys stay comparable.
pub fn normalize_path(path: &Path) -> PathBuf {
    match path.canonicalize() {
        Ok(canonical) => canonical,
        Err(e) => {
            warn!("Failed to canonicalize path {}: {}", path.display(), e);
            std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
        }
    }
}

/// Maps `require` names to files on disk
///
/// Resolution only performs existence checks; it never reads file contents and
/// never fails, since absence is a normal outcome.
#[derive(Debug)]
pub struct ModuleResolver {
    /// Project search roots in precedence order
    search_roots: Vec<PathBuf>,
    /// Deployment/runtime module directory consulted after the project roots
    runtime_dir: Option<PathBuf>,
    /// Cache of resolutions by module name
    cache: IndexMap<String, Resolution>,
}

impl ModuleResolver {
    pub fn new(search_roots: Vec<PathBuf>, runtime_dir: Option<PathBuf>) -> Self {
        debug!(
            "Module resolver roots: {:?}, runtime dir: {:?}",
            search_roots, runtime_dir
        );
        Self {
            search_roots,
            runtime_dir,
            cache: IndexMap::new(),
        }
    }

    pub fn search_roots(&self) -> &[PathBuf] {
        &self.search_roots
    }

    pub fn runtime_dir(&self) -> Option<&Path> {
        self.runtime_dir.as_deref()
    }

    /// Resolve a module name
    ///
    /// Roots are tried in order and the first existing candidate wins, so the
    /// order of roots encodes precedence. Only when no project root matches is
    /// the runtime directory consulted, which classifies the module as global.
    pub fn resolve(&mut self, module_name: &str) -> Resolution {
        if let Some(cached) = self.cache.get(module_name) {
            return cached.clone();
        }

        let resolution = self.resolve_uncached(module_name);
        trace!("Resolved '{module_name}' -> {resolution:?}");
        self.cache.insert(module_name.to_owned(), resolution.clone());
        resolution
    }

    fn resolve_uncached(&self, module_name: &str) -> Resolution {
        let Some(stem) = module_path_stem(module_name) else {
            debug!("Module name '{module_name}' does not map to a path");
            return Resolution::Unresolved;
        };

        for root in &self.search_roots {
            if let Some(found) = find_in_root(root, &stem) {
                return Resolution::Local(normalize_path(&found));
            }
        }

        if let Some(runtime_dir) = &self.runtime_dir
            && let Some(found) = find_in_root(runtime_dir, &stem)
        {
            debug!(
                "Module '{module_name}' is provided by the runtime at {}",
                found.display()
            );
            return Resolution::Global(found);
        }

        Resolution::Unresolved
    }

    /// Classify a module without keeping its path
    pub fn classify(&mut self, module_name: &str) -> ModuleKind {
        self.resolve(module_name).kind()
    }
}

fn find_in_root(root: &Path, stem: &Path) -> Option<PathBuf> {
    module_candidates(root, stem)
        .into_iter()
        .find(|candidate| candidate.is_file())
}
