//! Fault containment and the process-wide fault observer.
//!
//! Two composed mechanisms keep third-party code from taking the host down:
//!
//! - [`FaultInterceptor::contain`] wraps a single call into code we do not
//!   control and converts anything raised strictly during that call into a
//!   local [`FaultInfo`]. The portable face of this is a catch-unwind at the
//!   loading boundary; the OS-level equivalent for hardware traps is an
//!   external capability and sits behind the same seam.
//! - A single process-wide observer, registered immediately before plugins
//!   load and removed right afterward (unless configured to persist). It is
//!   purely diagnostic: it records a [`FaultDump`] for every fault anywhere
//!   in the process and always tells the OS to keep searching for a real
//!   handler.

use std::fmt;
use std::panic::{self, UnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{error, info};

use crate::error::PreloadError;

#[cfg(windows)]
mod veh;

/// Synthetic status for a contained unwind; real hardware faults carry the
/// OS status code instead.
pub const FAULT_CODE_UNWIND: u32 = 0xE055_4E44;

/// A fault converted into a local failure by [`FaultInterceptor::contain`].
#[derive(Debug, Clone)]
pub struct FaultInfo {
    pub code: u32,
    pub description: String,
}

impl fmt::Display for FaultInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#010x}] {}", self.code, self.description)
    }
}

/// Per-call containment boundary around third-party code.
pub struct FaultInterceptor;

impl FaultInterceptor {
    /// Run `f` and convert a fault raised strictly during the call into a
    /// local failure. Faults originating elsewhere in the process are not
    /// affected.
    pub fn contain<T>(f: impl FnOnce() -> T + UnwindSafe) -> Result<T, FaultInfo> {
        match panic::catch_unwind(f) {
            Ok(value) => Ok(value),
            Err(payload) => {
                let description = if let Some(message) = payload.downcast_ref::<&str>() {
                    (*message).to_string()
                } else if let Some(message) = payload.downcast_ref::<String>() {
                    message.clone()
                } else {
                    "unknown fault payload".to_string()
                };
                Err(FaultInfo {
                    code: FAULT_CODE_UNWIND,
                    description,
                })
            }
        }
    }
}

/// Which fault notification chain the observer joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverMode {
    ExceptionObserver,
    ContinueObserver,
}

/// Position within the chosen chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverOrder {
    First,
    Last,
}

// One observer per process. The flag gates dump recording; the Windows
// backend additionally holds the OS registration.
static OBSERVER_ACTIVE: AtomicBool = AtomicBool::new(false);

struct Registration {
    mode: ObserverMode,
    #[cfg(windows)]
    raw: veh::RawRegistration,
}

/// Owner of the at-most-one process-wide registration.
///
/// `install` while installed and `remove` while absent both return `false`
/// and change nothing.
#[derive(Default)]
pub struct FaultObserver {
    registration: Option<Registration>,
}

impl FaultObserver {
    pub fn new() -> Self {
        Self { registration: None }
    }

    pub fn is_installed(&self) -> bool {
        self.registration.is_some()
    }

    pub fn mode(&self) -> Option<ObserverMode> {
        self.registration.as_ref().map(|r| r.mode)
    }

    pub fn install(&mut self, mode: ObserverMode, order: ObserverOrder) -> bool {
        if self.registration.is_some() {
            return false;
        }

        #[cfg(windows)]
        {
            let Some(raw) = veh::register(mode, order) else {
                return false;
            };
            self.registration = Some(Registration { mode, raw });
        }
        #[cfg(not(windows))]
        {
            let _ = order;
            self.registration = Some(Registration { mode });
        }

        OBSERVER_ACTIVE.store(true, Ordering::Release);
        info!(?mode, ?order, "fault observer installed");
        true
    }

    /// Typed face of the install contract for callers that treat misuse as
    /// a reportable error rather than a silent `false`.
    pub fn try_install(
        &mut self,
        mode: ObserverMode,
        order: ObserverOrder,
    ) -> Result<(), PreloadError> {
        if self.is_installed() {
            return Err(PreloadError::InterceptorAlreadyInstalled);
        }
        self.install(mode, order);
        Ok(())
    }

    /// Typed face of the remove contract.
    pub fn try_remove(&mut self) -> Result<(), PreloadError> {
        if !self.is_installed() {
            return Err(PreloadError::InterceptorNotInstalled);
        }
        self.remove();
        Ok(())
    }

    pub fn remove(&mut self) -> bool {
        let Some(registration) = self.registration.take() else {
            return false;
        };
        OBSERVER_ACTIVE.store(false, Ordering::Release);

        #[cfg(windows)]
        let removed = veh::unregister(registration.mode, registration.raw);
        #[cfg(not(windows))]
        let removed = {
            let _ = registration;
            true
        };

        info!(removed, "fault observer removed");
        removed
    }
}

impl Drop for FaultObserver {
    fn drop(&mut self) {
        if self.registration.is_some() {
            self.remove();
        }
    }
}

/// Record a fault dump through the observer. Called by the OS-level handler
/// on Windows and by synthetic fault delivery in tests; always "continue
/// search", never a disposition change.
pub fn record_fault(dump: &FaultDump) {
    if !OBSERVER_ACTIVE.load(Ordering::Acquire) {
        return;
    }
    error!("caught vectored fault:\n{dump}");
}

/// Forensic state captured when the observer sees a fault.
#[derive(Debug, Clone, Default)]
pub struct FaultDump {
    /// General-purpose registers at the faulting instruction.
    pub registers: Vec<(&'static str, usize)>,
    pub instruction: usize,
    pub code: u32,
    pub description: String,
    pub flags: u32,
    pub record_address: usize,
}

impl fmt::Display for FaultDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextRecord:")?;
        for (index, (name, value)) in self.registers.iter().enumerate() {
            if index > 0 {
                write!(f, ",")?;
            }
            write!(f, " [{name}: {value:#018x}]")?;
        }
        writeln!(f, ".")?;
        writeln!(f, "ExceptionRecord:")?;
        writeln!(
            f,
            "\tExceptionCode: [{:#010x}] '{}'",
            self.code, self.description
        )?;
        writeln!(f, "\tExceptionFlags: {:#010x}", self.flags)?;
        writeln!(f, "\tExceptionAddress: {:#018x}", self.instruction)?;
        write!(f, "\tExceptionRecord: {:#018x}", self.record_address)
    }
}

/// Human-readable name for a fault status code.
pub fn describe_fault_code(code: u32) -> &'static str {
    match code {
        0x8000_0003 => "breakpoint",
        0x8000_0004 => "single step",
        0xC000_0005 => "access violation",
        0xC000_001D => "illegal instruction",
        0xC000_008C => "array bounds exceeded",
        0xC000_0094 => "integer divide by zero",
        0xC000_0096 => "privileged instruction",
        0xC000_00FD => "stack overflow",
        FAULT_CODE_UNWIND => "contained unwind",
        _ => "unknown status",
    }
}

impl FaultDump {
    /// Dump for a fault that was contained in-process rather than delivered
    /// by the OS. Register state is unavailable in that case.
    pub fn from_contained(info: &FaultInfo, instruction: usize) -> Self {
        Self {
            registers: Vec::new(),
            instruction,
            code: info.code,
            description: info.description.clone(),
            flags: 0,
            record_address: 0,
        }
    }
}
