//! The "open library / resolve exported symbol" seam.
//!
//! The preloader core never touches the OS loader directly; everything goes
//! through [`ModuleHost`], so the orchestration and containment logic can be
//! exercised against mock hosts. [`NativeModuleHost`] is the production
//! implementation over `libloading`; passive inspection (dependency and
//! export enumeration without executing the module) is a PE walk on Windows
//! and reported as unsupported elsewhere.

use std::path::{Path, PathBuf};

use libloading::Library;
use thiserror::Error;
use tracing::trace;

#[cfg(windows)]
mod pe;

/// Failures at the module-host boundary. `NotFound` is distinguished because
/// dependency diagnostics stop recursing when a file simply does not exist.
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("module not found: {0}")]
    NotFound(String),

    #[error("module load failed: {0}")]
    LoadFailed(String),

    #[error("passive module inspection is not supported on this platform")]
    InspectionUnsupported,
}

/// What a passive (non-executing) open of a module revealed.
#[derive(Debug, Clone, Default)]
pub struct ModuleMetadata {
    pub resolved_path: Option<PathBuf>,
    /// Declared dependency module names, in declaration order.
    pub dependencies: Vec<String>,
    /// Exported symbol names.
    pub exports: Vec<String>,
}

impl ModuleMetadata {
    pub fn has_export(&self, name: &str) -> bool {
        self.exports.iter().any(|e| e == name)
    }
}

/// Target of a passive inspection: a concrete file, or a module name to be
/// resolved through the OS search order.
#[derive(Debug, Clone, Copy)]
pub enum ModuleRef<'a> {
    Path(&'a Path),
    Name(&'a str),
}

/// Outcome of an initializer invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// The export is absent. This is success, not an error.
    Missing,
    /// The export was present and returned normally.
    Ran,
}

/// A module mapped into the process. Dropping the handle unloads it.
pub trait LoadedModule: Send {
    fn path(&self) -> &Path;

    /// Look up the named no-argument export and call it. Faults raised by
    /// the module propagate out of this call; the pipeline wraps it in a
    /// containment boundary.
    fn invoke_initializer(&self, export: &str) -> InitOutcome;
}

/// The external loader primitive.
pub trait ModuleHost: Send + Sync {
    /// Map the module at `path` into the process and run its entry point.
    fn load(&self, path: &Path) -> Result<Box<dyn LoadedModule>, ModuleError>;

    /// Open the target as a passive resource and read its metadata without
    /// executing any of its code.
    fn inspect(&self, target: ModuleRef<'_>) -> Result<ModuleMetadata, ModuleError>;
}

/// Production host backed by `libloading`.
#[derive(Default)]
pub struct NativeModuleHost;

impl NativeModuleHost {
    pub fn new() -> Self {
        Self
    }
}

impl ModuleHost for NativeModuleHost {
    fn load(&self, path: &Path) -> Result<Box<dyn LoadedModule>, ModuleError> {
        if !path.exists() {
            return Err(ModuleError::NotFound(path.display().to_string()));
        }

        trace!(path = %path.display(), "loading module");
        // Safety: executing an arbitrary module's entry point is the whole
        // point of this crate; the caller wraps us in fault containment.
        let library = unsafe { Library::new(path) }
            .map_err(|e| ModuleError::LoadFailed(e.to_string()))?;

        Ok(Box::new(NativeModule {
            path: path.to_path_buf(),
            library,
        }))
    }

    fn inspect(&self, target: ModuleRef<'_>) -> Result<ModuleMetadata, ModuleError> {
        #[cfg(windows)]
        {
            pe::inspect(target)
        }
        #[cfg(not(windows))]
        {
            if let ModuleRef::Path(path) = target {
                if !path.exists() {
                    return Err(ModuleError::NotFound(path.display().to_string()));
                }
            }
            Err(ModuleError::InspectionUnsupported)
        }
    }
}

struct NativeModule {
    path: PathBuf,
    library: Library,
}

impl LoadedModule for NativeModule {
    fn path(&self) -> &Path {
        &self.path
    }

    fn invoke_initializer(&self, export: &str) -> InitOutcome {
        // Safety: the initializer contract is a well-known no-argument
        // export; anything it raises is handled by the caller's containment.
        unsafe {
            match self
                .library
                .get::<unsafe extern "C" fn()>(export.as_bytes())
            {
                Ok(initializer) => {
                    initializer();
                    InitOutcome::Ran
                }
                Err(_) => InitOutcome::Missing,
            }
        }
    }
}
