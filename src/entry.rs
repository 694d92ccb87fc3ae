//! Windows loader entry point.
//!
//! Translates `DllMain` notifications into [`LoaderEvent`]s for the
//! process-lifetime [`PreloadHandler`]. The entry point always reports
//! success to the loader: a handler that failed its own startup runs in
//! degraded passthrough mode, it never takes the host down with it.

use std::path::PathBuf;
use std::sync::Arc;

use windows::Win32::Foundation::{BOOL, HMODULE, TRUE};
use windows::Win32::System::LibraryLoader::{DisableThreadLibraryCalls, GetModuleFileNameW};
use windows::Win32::System::SystemServices::{
    DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH, DLL_THREAD_ATTACH,
};

use crate::config::PreloadConfig;
use crate::host::{self, HostEnv, NullInterceptor, ThreadNotifier};
use crate::logging;
use crate::module::NativeModuleHost;
use crate::trigger::LoaderEvent;

const LOG_FILE: &str = "shimloader.log";
const CONFIG_FILE: &str = "shimloader.yml";

/// Suppresses further thread notifications for our own module.
struct WinThreadNotifier {
    module: HMODULE,
}

// HMODULE is a plain handle value; the notifier only passes it back to the
// loader.
unsafe impl Send for WinThreadNotifier {}
unsafe impl Sync for WinThreadNotifier {}

impl ThreadNotifier for WinThreadNotifier {
    fn disable_thread_notifications(&self) -> bool {
        unsafe { DisableThreadLibraryCalls(self.module) }.is_ok()
    }
}

fn module_path(module: HMODULE) -> Option<PathBuf> {
    let mut buffer = [0u16; 1024];
    let length = unsafe { GetModuleFileNameW(module, &mut buffer) } as usize;
    if length == 0 || length >= buffer.len() {
        return None;
    }
    Some(PathBuf::from(String::from_utf16_lossy(&buffer[..length])))
}

fn executable_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_default()
}

fn on_process_attach(module: HMODULE) {
    let base_dir = module_path(module)
        .and_then(|p| p.parent().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."));
    let executable = executable_name();

    if let Err(error) = logging::init(base_dir.join(LOG_FILE)) {
        logging::emergency_log(&base_dir, &format!("logging setup failed: {error:#}"));
    }
    logging::write_banner(&executable, &base_dir);

    let config = PreloadConfig::load_or_restore(base_dir.join(CONFIG_FILE));
    let env = HostEnv {
        module_host: Arc::new(NativeModuleHost::new()),
        interceptor: Arc::new(NullInterceptor),
        notifier: Arc::new(WinThreadNotifier { module }),
        executable_name: executable,
        base_dir,
    };

    let handler = host::create_instance(config, env);
    if !handler.is_valid() {
        tracing::warn!("startup failed, running as a passthrough shell only");
    }
    handler.on_loader_event(LoaderEvent::ProcessAttach);
}

/// # Safety
/// Called by the OS loader under loader lock; must not load libraries
/// synchronously from the attach notification beyond what the configured
/// strategy demands.
#[no_mangle]
pub unsafe extern "system" fn DllMain(
    module: HMODULE,
    reason: u32,
    _reserved: *mut std::ffi::c_void,
) -> BOOL {
    match reason {
        DLL_PROCESS_ATTACH => on_process_attach(module),
        DLL_THREAD_ATTACH => {
            if let Some(handler) = host::instance() {
                handler.on_loader_event(LoaderEvent::ThreadAttach);
            }
        }
        DLL_PROCESS_DETACH => {
            if let Some(handler) = host::instance() {
                handler.on_loader_event(LoaderEvent::ProcessDetach);
            }
            host::destroy_instance();
        }
        _ => {}
    }
    TRUE
}
