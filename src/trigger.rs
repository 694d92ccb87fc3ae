//! Load trigger selection and the exactly-once firing state machine.
//!
//! The OS loader delivers notifications on whichever thread caused them, so
//! several threads can race past a fire condition at once. The machine pairs
//! an atomic `NotLoaded -> Loading` compare-exchange (the hard guarantee)
//! with a watch flag that the firing thread clears before it enters the
//! pipeline, so re-entrant notification semantics cannot fire twice either.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use tracing::debug;

/// When plugin loading begins. Fixed for the process lifetime, chosen once
/// from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Fire on the first module-attach notification.
    ProcessAttach,
    /// Fire when the `ordinal`-th thread attaches to the process.
    ThreadAttach { ordinal: usize },
    /// Fire the first time the host calls the named import.
    ImportHook { module: String, export: String },
}

/// A lifecycle notification delivered by the OS loader or the interception
/// facility. Dispatching through one enum keeps trigger selection independent
/// of which OS mechanism delivered the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderEvent {
    ProcessAttach,
    ThreadAttach,
    ProcessDetach,
    InterceptedCall,
}

/// One-way loading progress. The `NotLoaded -> Loading` edge is won by at
/// most one caller; there is no way back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoadState {
    NotLoaded = 0,
    Loading = 1,
    Loaded = 2,
}

/// What the attach notification handler should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachDirective {
    /// Thread notifications are unneeded overhead; turn them off, then fire.
    DisableThreadCallsAndFire,
    /// Turn thread notifications off and install the import intercept.
    InstallHook { module: String, export: String },
    /// Start counting thread attaches.
    WatchThreads,
}

/// Outcome of a thread-attach notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadDirective {
    Ignore,
    /// This thread produced the configured ordinal and won the firing edge.
    Fire,
}

pub struct TriggerStateMachine {
    trigger: Trigger,
    state: AtomicU8,
    thread_attach_count: AtomicUsize,
    watch_thread_attach: AtomicBool,
}

impl TriggerStateMachine {
    pub fn new(trigger: Trigger) -> Self {
        Self {
            trigger,
            state: AtomicU8::new(LoadState::NotLoaded as u8),
            thread_attach_count: AtomicUsize::new(0),
            watch_thread_attach: AtomicBool::new(false),
        }
    }

    pub fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    pub fn state(&self) -> LoadState {
        match self.state.load(Ordering::Acquire) {
            0 => LoadState::NotLoaded,
            1 => LoadState::Loading,
            _ => LoadState::Loaded,
        }
    }

    /// Number of thread-attach notifications observed so far.
    pub fn thread_attach_count(&self) -> usize {
        self.thread_attach_count.load(Ordering::Relaxed)
    }

    /// Claim the `NotLoaded -> Loading` edge. Only one caller per process
    /// lifetime gets `true`; firing after that is a no-op, not an error.
    pub fn try_begin(&self) -> bool {
        self.state
            .compare_exchange(
                LoadState::NotLoaded as u8,
                LoadState::Loading as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Mark the pipeline run finished.
    pub fn complete(&self) {
        self.state.store(LoadState::Loaded as u8, Ordering::Release);
    }

    /// Module-attach notification. Selects the strategy's first move.
    pub fn on_process_attach(&self) -> AttachDirective {
        match &self.trigger {
            Trigger::ProcessAttach => AttachDirective::DisableThreadCallsAndFire,
            Trigger::ThreadAttach { ordinal } => {
                debug!(ordinal, "watching thread attach notifications");
                self.watch_thread_attach.store(true, Ordering::Release);
                AttachDirective::WatchThreads
            }
            Trigger::ImportHook { module, export } => AttachDirective::InstallHook {
                module: module.clone(),
                export: export.clone(),
            },
        }
    }

    /// Thread-attach notification. Increments the counter; only the
    /// increment that produces exactly the configured ordinal may fire, and
    /// the watch flag is cleared before the caller enters the pipeline.
    pub fn on_thread_attach(&self) -> ThreadDirective {
        if !self.watch_thread_attach.load(Ordering::Acquire) {
            return ThreadDirective::Ignore;
        }

        let Trigger::ThreadAttach { ordinal } = &self.trigger else {
            return ThreadDirective::Ignore;
        };

        let count = self.thread_attach_count.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(count, "thread attached");

        if count == *ordinal {
            // Clear the watch before firing; a re-delivered notification for
            // the same ordinal must not reach the pipeline.
            self.watch_thread_attach.store(false, Ordering::Release);
            if self.try_begin() {
                return ThreadDirective::Fire;
            }
        }
        ThreadDirective::Ignore
    }

    /// Stop reacting to thread-attach notifications. Mirrors the OS-level
    /// "disable thread library calls" that the embedder performs.
    pub fn stop_watching_threads(&self) {
        self.watch_thread_attach.store(false, Ordering::Release);
    }
}
