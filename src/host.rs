//! The preload orchestrator.
//!
//! One [`PreloadHandler`] lives for the process lifetime: created inside the
//! process-attach callback, destroyed inside process-detach, borrowed by
//! every other callback. It owns the trigger state machine, the fault
//! observer, the plugin pipeline and the handle to the genuine library this
//! shim stands in for. When its own startup fails (bad trigger config,
//! original library missing) it degrades to pure passthrough: plugins are
//! permanently disabled but the host keeps running.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::thread;

use once_cell::sync::Lazy;
use tracing::{debug, error, info, warn};

use crate::config::PreloadConfig;
use crate::error::PreloadError;
use crate::fault::{FaultInterceptor, FaultObserver, ObserverMode, ObserverOrder};
use crate::module::{LoadedModule, ModuleHost};
use crate::pipeline::{DiscoveryRule, PluginPipeline, PluginRecord};
use crate::trigger::{AttachDirective, LoaderEvent, ThreadDirective, Trigger, TriggerStateMachine};

/// The intercepted import and its genuine implementation, reduced to an
/// opaque callable. Typed per-ABI thunks belong to the forwarding table,
/// not to the orchestration core.
pub type ImportFn = Arc<dyn Fn() + Send + Sync>;

/// External interception capability. Redirects `module!export` to `detour`
/// and hands back the genuine function for passthrough.
pub trait ImportInterceptor: Send + Sync {
    fn install(
        &self,
        module: &str,
        export: &str,
        detour: ImportFn,
    ) -> Result<ImportFn, PreloadError>;
}

/// Hooking engine absent; every installation attempt is reported
/// unavailable and the handler degrades accordingly.
pub struct NullInterceptor;

impl ImportInterceptor for NullInterceptor {
    fn install(
        &self,
        module: &str,
        export: &str,
        _detour: ImportFn,
    ) -> Result<ImportFn, PreloadError> {
        Err(PreloadError::HookUnavailable(format!(
            "no interception engine wired for {module}!{export}"
        )))
    }
}

/// OS-level control over further thread-attach notifications.
pub trait ThreadNotifier: Send + Sync {
    /// Returns whether the OS accepted the request.
    fn disable_thread_notifications(&self) -> bool;
}

/// Default for platforms/tests where the notification stream is not ours to
/// control.
pub struct NoopNotifier;

impl ThreadNotifier for NoopNotifier {
    fn disable_thread_notifications(&self) -> bool {
        true
    }
}

/// Everything the orchestrator needs from the outside world.
pub struct HostEnv {
    pub module_host: Arc<dyn ModuleHost>,
    pub interceptor: Arc<dyn ImportInterceptor>,
    pub notifier: Arc<dyn ThreadNotifier>,
    /// File name of the host process executable, for the allow-list gate.
    pub executable_name: String,
    /// Directory the shim was loaded from; relative config paths resolve
    /// against it.
    pub base_dir: PathBuf,
}

pub struct PreloadHandler {
    config: PreloadConfig,
    env: HostEnv,
    machine: Option<TriggerStateMachine>,
    observer: Mutex<FaultObserver>,
    pipeline: Mutex<PluginPipeline>,
    original_library: Mutex<Option<Box<dyn LoadedModule>>>,
    original_import: Mutex<Option<ImportFn>>,
    plugins_allowed: bool,
    valid: bool,
}

static INSTANCE: Lazy<RwLock<Option<Arc<PreloadHandler>>>> = Lazy::new(|| RwLock::new(None));

/// Create the process-lifetime instance. Idempotent: a second call returns
/// the existing handler.
pub fn create_instance(config: PreloadConfig, env: HostEnv) -> Arc<PreloadHandler> {
    let mut slot = INSTANCE.write().unwrap_or_else(|e| e.into_inner());
    if let Some(existing) = slot.as_ref() {
        return Arc::clone(existing);
    }
    let handler = Arc::new(PreloadHandler::new(config, env));
    *slot = Some(Arc::clone(&handler));
    handler
}

/// Borrow the process-lifetime instance, if it exists.
pub fn instance() -> Option<Arc<PreloadHandler>> {
    INSTANCE
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .as_ref()
        .map(Arc::clone)
}

/// Tear down the process-lifetime instance (process-detach).
pub fn destroy_instance() {
    let handler = INSTANCE
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .take();
    if let Some(handler) = handler {
        handler.teardown();
    }
}

impl PreloadHandler {
    pub fn new(config: PreloadConfig, env: HostEnv) -> Self {
        info!(
            executable = %env.executable_name,
            base_dir = %env.base_dir.display(),
            "preload handler starting",
        );

        // Resolve the trigger first; a misconfigured trigger disables plugin
        // loading but must not take the host down.
        let machine = match config.trigger() {
            Ok(trigger) => {
                info!(?trigger, "load method resolved");
                Some(TriggerStateMachine::new(trigger))
            }
            Err(error) => {
                error!(%error, "degrading to pure passthrough");
                None
            }
        };

        // Allow-list gate. Logged once; passthrough is unaffected either way.
        let plugins_allowed = config.is_process_allowed(&env.executable_name);
        if plugins_allowed {
            info!(executable = %env.executable_name, "process is allowed to preload plugins");
        } else {
            info!(
                executable = %env.executable_name,
                allowed = ?config.processes.iter().filter(|r| r.allow).map(|r| r.name.as_str()).collect::<Vec<_>>(),
                "this process is not allowed to preload plugins",
            );
        }

        // Load the genuine library we stand in for. Without it the shim has
        // nothing to forward to and is only good for degraded passthrough.
        let original_library = config
            .general
            .original_library
            .as_ref()
            .map(|p| {
                if p.is_absolute() {
                    p.clone()
                } else {
                    env.base_dir.join(p)
                }
            });
        let original = original_library.as_ref().and_then(|path| {
            info!(path = %path.display(), "loading original library");
            match env.module_host.load(path) {
                Ok(module) => {
                    info!(path = %path.display(), "original library loaded");
                    Some(module)
                }
                Err(error) => {
                    let failure = PreloadError::OriginalLibraryUnavailable {
                        path: path.clone(),
                        reason: error.to_string(),
                    };
                    error!(%failure, "can't load original library, degrading to passthrough shell");
                    None
                }
            }
        });
        if original_library.is_none() {
            warn!("no original library configured, nothing to forward to");
        }

        let plugins_dir = if config.plugins.directory.is_absolute() {
            config.plugins.directory.clone()
        } else {
            env.base_dir.join(&config.plugins.directory)
        };
        let rule = DiscoveryRule::from_config(
            config.plugins.discovery,
            &config.plugins.marker_suffix,
            &config.plugins.initializer,
        );
        let pipeline = PluginPipeline::new(
            Arc::clone(&env.module_host),
            plugins_dir,
            rule,
            config.plugins.initializer.clone(),
        );

        let valid = machine.is_some() && original.is_some();
        Self {
            config,
            env,
            machine,
            observer: Mutex::new(FaultObserver::new()),
            pipeline: Mutex::new(pipeline),
            original_library: Mutex::new(original),
            original_import: Mutex::new(None),
            plugins_allowed,
            valid,
        }
    }

    /// Cheap validity check for the detach owner: `false` means degraded
    /// passthrough with plugin loading permanently disabled.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn is_plugins_load_allowed(&self) -> bool {
        self.plugins_allowed
    }

    pub fn is_plugins_loaded(&self) -> bool {
        self.pipeline
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_finished()
    }

    pub fn trigger(&self) -> Option<Trigger> {
        self.machine.as_ref().map(|m| m.trigger().clone())
    }

    /// Run `f` over the plugin records.
    pub fn with_records<R>(&self, f: impl FnOnce(&[PluginRecord]) -> R) -> R {
        let pipeline = self.pipeline.lock().unwrap_or_else(|e| e.into_inner());
        f(pipeline.records())
    }

    /// Entry point for every OS-delivered lifecycle notification.
    pub fn on_loader_event(&self, event: LoaderEvent) {
        match event {
            LoaderEvent::ProcessAttach => self.on_process_attach(),
            LoaderEvent::ThreadAttach => self.on_thread_attach(),
            LoaderEvent::InterceptedCall => self.on_intercepted_call(),
            LoaderEvent::ProcessDetach => {
                // Teardown happens in destroy_instance; nothing else to do on
                // the notification itself.
                debug!("process detach notification");
            }
        }
    }

    fn on_process_attach(&self) {
        let Some(machine) = &self.machine else {
            return;
        };
        match machine.on_process_attach() {
            AttachDirective::DisableThreadCallsAndFire => {
                self.disable_thread_notifications();
                info!("load method OnProcessAttach, loading plugins");
                self.load_plugins();
            }
            AttachDirective::InstallHook { module, export } => {
                self.disable_thread_notifications();
                self.install_import_hook(&module, &export);
            }
            AttachDirective::WatchThreads => {}
        }
    }

    fn on_thread_attach(&self) {
        let Some(machine) = &self.machine else {
            return;
        };
        if machine.on_thread_attach() == ThreadDirective::Fire {
            self.disable_thread_notifications();
            info!(
                count = machine.thread_attach_count(),
                "load method OnThreadAttach reached its ordinal, loading plugins",
            );
            self.fire();
        }
    }

    /// Body of the intercepted import: load plugins on the first call, then
    /// always forward to the genuine function.
    fn on_intercepted_call(&self) {
        debug!("entered hooked function");

        if let Some(machine) = &self.machine {
            if machine.try_begin() {
                info!("first intercepted call, loading plugins");
                self.fire();
            } else {
                debug!("plugins are already loaded");
            }
        }

        // Forward on a best-effort basis; a fault in the genuine function is
        // contained and logged, the host decides what to do about its import
        // returning.
        let original = self
            .original_import
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(original) = original {
            debug!("calling unhooked function");
            match FaultInterceptor::contain(AssertUnwindSafe(|| original())) {
                Ok(()) => debug!("unhooked function returned"),
                Err(fault) => {
                    warn!(%fault, "fault raised while executing the unhooked function");
                }
            }
        }

        // The import-hook strategy keeps the observer alive across the load
        // and releases it when the hooked call completes.
        if !self.config.observer.keep {
            self.remove_observer();
        }
        debug!("leaving hooked function");
    }

    /// Begin loading if nothing has fired yet. Used by the ProcessAttach
    /// strategy and by embedders that drive loading directly.
    pub fn load_plugins(&self) -> bool {
        if !self.valid {
            info!("handler is degraded to passthrough, plugin loading is disabled");
            return false;
        }
        if !self.plugins_allowed {
            info!("plugin preload disabled for this process");
            return false;
        }
        let Some(machine) = &self.machine else {
            return false;
        };
        if !machine.try_begin() {
            return false;
        }
        self.fire();
        true
    }

    /// Run the pipeline. The caller must have won the firing edge.
    fn fire(&self) {
        if !self.valid {
            // Startup already failed; the win on the firing edge is consumed
            // so plugin loading stays permanently disabled.
            info!("handler is degraded to passthrough, plugin loading is disabled");
            if let Some(machine) = &self.machine {
                machine.complete();
            }
            return;
        }
        if !self.plugins_allowed {
            info!("plugin preload disabled for this process");
            if let Some(machine) = &self.machine {
                machine.complete();
            }
            return;
        }

        let delay = self.config.load_delay();
        if !delay.is_zero() {
            info!(delay_ms = delay.as_millis() as u64, "plugin loading is delayed, waiting");
            thread::sleep(delay);
        }

        self.install_observer();

        {
            let mut pipeline = self.pipeline.lock().unwrap_or_else(|e| e.into_inner());
            pipeline.run();
        }

        let keep = self.config.observer.keep
            || matches!(self.trigger(), Some(Trigger::ImportHook { .. }));
        if self.config.observer.install && !keep {
            let mut observer = self.observer.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(error) = observer.try_remove() {
                warn!(%error, "couldn't remove fault observer");
            }
        }

        if let Some(machine) = &self.machine {
            machine.complete();
        }
    }

    fn install_observer(&self) {
        if !self.config.observer.install {
            info!("fault observer disabled in configuration");
            return;
        }
        let mut observer = self.observer.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(error) = observer.try_install(ObserverMode::ExceptionObserver, ObserverOrder::First)
        {
            warn!(%error, "couldn't install fault observer");
        }
    }

    fn remove_observer(&self) {
        let mut observer = self.observer.lock().unwrap_or_else(|e| e.into_inner());
        if observer.is_installed() {
            observer.remove();
        }
    }

    fn install_import_hook(&self, module: &str, export: &str) {
        if !self.valid {
            info!("handler is degraded to passthrough, skipping hook installation");
            return;
        }
        if !self.plugins_allowed {
            info!("plugin preload disabled for this process, skipping hook installation");
            return;
        }

        let delay = self.config.hook_delay();
        if !delay.is_zero() {
            info!(delay_ms = delay.as_millis() as u64, "hooking is delayed, waiting");
            thread::sleep(delay);
        }

        info!(module, export, "hooking import table function");
        let detour: ImportFn = Arc::new(|| {
            if let Some(handler) = instance() {
                handler.on_loader_event(LoaderEvent::InterceptedCall);
            }
        });
        match self.env.interceptor.install(module, export, detour) {
            Ok(original) => {
                *self
                    .original_import
                    .lock()
                    .unwrap_or_else(|e| e.into_inner()) = Some(original);
                info!("import table function hooked");
            }
            Err(error) => {
                error!(%error, "unable to hook import table function");
            }
        }
    }

    fn disable_thread_notifications(&self) {
        if let Some(machine) = &self.machine {
            machine.stop_watching_threads();
        }
        let accepted = self.env.notifier.disable_thread_notifications();
        debug!(accepted, "disabling further thread notifications");
    }

    /// Process-detach teardown: release plugins, the original library and a
    /// persisting observer, in that order.
    fn teardown(&self) {
        self.pipeline
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .unload_all();

        let original = self
            .original_library
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if original.is_some() {
            info!("unloading original library");
        }
        drop(original);

        self.remove_observer();
        info!("preload handler shut down");
    }
}
