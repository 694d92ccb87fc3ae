//! shimloader - a plugin-preloading proxy library
//!
//! A `cdylib` mapped into a host process in place of a genuine system
//! library. Once resident it picks the single correct moment to load a
//! directory of third-party plugin modules, contains any fault they raise,
//! and forwards everything else to the original library untouched.
//!
//! # Modules
//!
//! - [`config`]: YAML configuration with default restoration
//! - [`trigger`]: Load strategies and the exactly-once firing state machine
//! - [`pipeline`]: Plugin discovery, loading and initialization
//! - [`fault`]: Per-call fault containment and the process-wide observer
//! - [`diagnostics`]: Recursive dependency resolution for failed loads
//! - [`module`]: The "open library / resolve symbol" seam over `libloading`
//! - [`host`]: The process-lifetime orchestrator
//! - [`logging`]: File-backed tracing setup
//! - [`error`]: Failure taxonomy

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod fault;
pub mod host;
pub mod logging;
pub mod module;
pub mod pipeline;
pub mod trigger;

/// Windows `DllMain` glue. Everything above is platform-neutral; only the
/// entry point and the OS-level fault/inspection backends are gated.
#[cfg(windows)]
mod entry;
