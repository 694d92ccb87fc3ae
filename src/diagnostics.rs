//! Dependency diagnostics for modules that failed to load.
//!
//! When a plugin refuses to load, the most common cause is an unresolved
//! dependency somewhere down its import chain. The walker opens the failed
//! module passively, enumerates its declared dependencies and tries to
//! resolve each one the same way; a dependency that exists but cannot be
//! opened is inspected recursively to localize the missing piece. Reports
//! carry their recursion depth so the log nests readably.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::PreloadError;
use crate::module::{ModuleError, ModuleHost, ModuleRef};

/// How one dependency name resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyResolution {
    Found { location: Option<PathBuf> },
    Missing { reason: String },
    /// The name was already visited on this walk; a circular chain was cut
    /// here instead of recursing forever.
    Cyclic,
}

/// One step of the dependency walk.
#[derive(Debug, Clone)]
pub struct DependencyReport {
    pub name: String,
    pub depth: usize,
    pub resolution: DependencyResolution,
}

pub struct DependencyWalker<'a> {
    host: &'a dyn ModuleHost,
}

impl<'a> DependencyWalker<'a> {
    pub fn new(host: &'a dyn ModuleHost) -> Self {
        Self { host }
    }

    /// Inspect the dependencies of the module at `path` after it failed to
    /// load. Produces one report per resolution step and logs each of them.
    pub fn inspect(&self, path: &Path) -> Vec<DependencyReport> {
        info!(module = %path.display(), "reading library dependency list");

        let mut reports = Vec::new();
        let mut visited = HashSet::new();
        self.walk(ModuleRef::Path(path), 0, &mut visited, &mut reports);
        reports
    }

    fn walk(
        &self,
        target: ModuleRef<'_>,
        depth: usize,
        visited: &mut HashSet<String>,
        reports: &mut Vec<DependencyReport>,
    ) {
        let origin = match target {
            ModuleRef::Path(path) => path.to_path_buf(),
            ModuleRef::Name(name) => PathBuf::from(name),
        };
        let metadata = match self.host.inspect(target) {
            Ok(metadata) => metadata,
            Err(error) => {
                warn!(depth, %error, "couldn't open module passively for diagnostics");
                return;
            }
        };

        for dependency in metadata.dependencies {
            if !visited.insert(dependency.to_ascii_lowercase()) {
                warn!(depth = depth + 1, name = %dependency, "circular dependency chain cut");
                reports.push(DependencyReport {
                    name: dependency,
                    depth: depth + 1,
                    resolution: DependencyResolution::Cyclic,
                });
                continue;
            }

            match self.host.inspect(ModuleRef::Name(&dependency)) {
                Ok(resolved) => {
                    let location = resolved.resolved_path;
                    info!(
                        depth = depth + 1,
                        name = %dependency,
                        location = %location.as_deref().unwrap_or_else(|| Path::new("?")).display(),
                        "dependency resolved",
                    );
                    reports.push(DependencyReport {
                        name: dependency,
                        depth: depth + 1,
                        resolution: DependencyResolution::Found { location },
                    });
                }
                Err(ModuleError::NotFound(reason)) => {
                    // The file simply does not exist; nothing deeper to find.
                    let failure = PreloadError::DependencyUnresolved {
                        path: origin.clone(),
                        name: dependency.clone(),
                    };
                    warn!(depth = depth + 1, %failure, "dependency missing");
                    reports.push(DependencyReport {
                        name: dependency,
                        depth: depth + 1,
                        resolution: DependencyResolution::Missing { reason },
                    });
                }
                Err(error) => {
                    warn!(
                        depth = depth + 1,
                        name = %dependency,
                        %error,
                        "dependency present but unloadable, inspecting it in turn",
                    );
                    reports.push(DependencyReport {
                        name: dependency.clone(),
                        depth: depth + 1,
                        resolution: DependencyResolution::Missing {
                            reason: error.to_string(),
                        },
                    });
                    self.walk(ModuleRef::Name(&dependency), depth + 1, visited, reports);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{LoadedModule, ModuleMetadata};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Mock host driven by a name table. Each name maps to a sequence of
    /// inspection results consumed in order (passive resolution is attempted
    /// once per sighting, then again when the walk recurses into the name).
    struct TableHost {
        root: ModuleMetadata,
        names: Mutex<HashMap<String, Vec<Result<ModuleMetadata, ModuleError>>>>,
    }

    impl TableHost {
        fn new(root: ModuleMetadata) -> Self {
            Self {
                root,
                names: Mutex::new(HashMap::new()),
            }
        }

        fn on(mut self, name: &str, results: Vec<Result<ModuleMetadata, ModuleError>>) -> Self {
            self.names
                .get_mut()
                .unwrap()
                .insert(name.to_string(), results);
            self
        }
    }

    impl ModuleHost for TableHost {
        fn load(&self, _path: &Path) -> Result<Box<dyn LoadedModule>, ModuleError> {
            unreachable!("diagnostics never loads modules")
        }

        fn inspect(&self, target: ModuleRef<'_>) -> Result<ModuleMetadata, ModuleError> {
            match target {
                ModuleRef::Path(_) => Ok(self.root.clone()),
                ModuleRef::Name(name) => {
                    let mut names = self.names.lock().unwrap();
                    match names.get_mut(name) {
                        Some(results) if !results.is_empty() => results.remove(0),
                        _ => Err(ModuleError::NotFound(name.to_string())),
                    }
                }
            }
        }
    }

    fn metadata(dependencies: &[&str]) -> ModuleMetadata {
        ModuleMetadata {
            resolved_path: None,
            dependencies: dependencies.iter().map(|s| s.to_string()).collect(),
            exports: Vec::new(),
        }
    }

    fn unloadable() -> Result<ModuleMetadata, ModuleError> {
        Err(ModuleError::LoadFailed("mapping rejected".to_string()))
    }

    #[test]
    fn resolved_and_missing_dependencies_are_reported() {
        let host = TableHost::new(metadata(&["present.dll", "absent.dll"]))
            .on("present.dll", vec![Ok(metadata(&[]))]);

        let reports = DependencyWalker::new(&host).inspect(Path::new("plugin.dll"));
        assert_eq!(reports.len(), 2);
        assert!(matches!(
            reports[0].resolution,
            DependencyResolution::Found { .. }
        ));
        assert!(matches!(
            reports[1].resolution,
            DependencyResolution::Missing { .. }
        ));
        assert_eq!(reports[0].depth, 1);
        assert_eq!(reports[1].depth, 1);
    }

    #[test]
    fn missing_file_stops_recursion() {
        let host = TableHost::new(metadata(&["gone.dll"]));
        let reports = DependencyWalker::new(&host).inspect(Path::new("plugin.dll"));
        assert_eq!(reports.len(), 1);
        assert!(matches!(
            reports[0].resolution,
            DependencyResolution::Missing { .. }
        ));
    }

    #[test]
    fn unloadable_dependency_is_inspected_recursively() {
        // "broken.dll" fails resolution (not a missing file), so the walk
        // recurses into it, reads its dependency table and finds the real
        // culprit one level down.
        let host = TableHost::new(metadata(&["broken.dll"]))
            .on("broken.dll", vec![unloadable(), Ok(metadata(&["culprit.dll"]))]);

        let reports = DependencyWalker::new(&host).inspect(Path::new("plugin.dll"));
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].name, "broken.dll");
        assert_eq!(reports[0].depth, 1);
        assert_eq!(reports[1].name, "culprit.dll");
        assert_eq!(reports[1].depth, 2);
        assert!(matches!(
            reports[1].resolution,
            DependencyResolution::Missing { .. }
        ));
    }

    #[test]
    fn circular_chains_terminate() {
        // plugin -> a -> b -> A (same module, different case). Without the
        // visited set this walk would never end.
        let host = TableHost::new(metadata(&["a.dll"]))
            .on("a.dll", vec![unloadable(), Ok(metadata(&["b.dll"]))])
            .on("b.dll", vec![unloadable(), Ok(metadata(&["A.DLL"]))]);

        let reports = DependencyWalker::new(&host).inspect(Path::new("plugin.dll"));
        let cyclic: Vec<_> = reports
            .iter()
            .filter(|r| r.resolution == DependencyResolution::Cyclic)
            .collect();
        assert_eq!(cyclic.len(), 1);
        assert_eq!(cyclic[0].name, "A.DLL");
        assert_eq!(cyclic[0].depth, 3);
    }
}
