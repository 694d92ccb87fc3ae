//! File-backed logging.
//!
//! The shim runs inside somebody else's process, so it never touches the
//! host's stdio. All diagnostics go to a log file next to the shim itself,
//! opened fresh on every process start.

use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::FmtSubscriber;

/// Initialize the global subscriber writing to `path`. Truncates any log
/// from a previous run. Returns an error instead of panicking when the file
/// cannot be created or a subscriber is already set; the caller decides
/// whether to continue without logging.
pub fn init<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path)
        .with_context(|| format!("failed to create log file: {}", path.display()))?;

    let subscriber = FmtSubscriber::builder()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_thread_ids(true)
        .with_writer(Mutex::new(file))
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set global logging subscriber")?;
    Ok(())
}

/// One-time startup banner identifying the shim and its surroundings.
pub fn write_banner(executable_name: &str, base_dir: &Path) {
    info!(
        "{} v{} ({})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
    );
    info!(
        os = std::env::consts::OS,
        arch = std::env::consts::ARCH,
        "host environment",
    );
    info!(executable = executable_name, "host process");
    info!(base_dir = %base_dir.display(), "shim directory");
}

/// Best-effort last resort when the subscriber itself could not be set up:
/// append a single line to a sidecar file so startup failures are not
/// entirely silent.
pub fn emergency_log(base_dir: &Path, message: &str) {
    use io::Write;
    let path = base_dir.join("shimloader.startup-error.log");
    if let Ok(mut file) = File::options().create(true).append(true).open(&path) {
        let _ = writeln!(
            file,
            "[{}] {message}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        );
    }
}
