use std::path::PathBuf;

use thiserror::Error;

use crate::fault::FaultInfo;

/// Errors produced by the preloader core.
///
/// Per-plugin failures are recovered inside the pipeline and never escape it;
/// this taxonomy exists for the diagnostic stream and for the few places that
/// report a result to the embedder (hook installation, startup validation).
#[derive(Debug, Error)]
pub enum PreloadError {
    #[error("failed to load module '{path}': {reason}")]
    ModuleLoadFailure { path: PathBuf, reason: String },

    #[error("fault raised inside the initializer of '{path}': {fault}")]
    InitializationFault { path: PathBuf, fault: FaultInfo },

    #[error("dependency '{name}' of '{path}' could not be resolved")]
    DependencyUnresolved { path: PathBuf, name: String },

    #[error("fault observer is already installed")]
    InterceptorAlreadyInstalled,

    #[error("fault observer is not installed")]
    InterceptorNotInstalled,

    #[error("load method configuration is invalid: {0}")]
    TriggerMisconfigured(String),

    #[error("original library '{path}' could not be loaded: {reason}")]
    OriginalLibraryUnavailable { path: PathBuf, reason: String },

    #[error("import hook could not be installed: {0}")]
    HookUnavailable(String),
}
