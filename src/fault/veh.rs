//! Vectored exception handler registration (Windows backend).
//!
//! The handler is diagnostic only: it builds a [`FaultDump`] from the
//! exception pointers, hands it to [`record_fault`] and always returns
//! `EXCEPTION_CONTINUE_SEARCH` so the fault disposition is decided elsewhere.

use std::ffi::c_void;

use windows::Win32::System::Diagnostics::Debug::{
    AddVectoredContinueHandler, AddVectoredExceptionHandler, RemoveVectoredContinueHandler,
    RemoveVectoredExceptionHandler, EXCEPTION_POINTERS,
};

use super::{describe_fault_code, record_fault, FaultDump, ObserverMode, ObserverOrder};

const EXCEPTION_CONTINUE_SEARCH: i32 = 0;

/// OS handle for the registration; opaque to the owner.
pub(super) struct RawRegistration(usize);

// The handle is only ever used to unregister.
unsafe impl Send for RawRegistration {}

pub(super) fn register(mode: ObserverMode, order: ObserverOrder) -> Option<RawRegistration> {
    let first = u32::from(order == ObserverOrder::First);
    let handle = unsafe {
        match mode {
            ObserverMode::ExceptionObserver => {
                AddVectoredExceptionHandler(first, Some(vectored_handler))
            }
            ObserverMode::ContinueObserver => {
                AddVectoredContinueHandler(first, Some(vectored_handler))
            }
        }
    };
    if handle.is_null() {
        None
    } else {
        Some(RawRegistration(handle as usize))
    }
}

pub(super) fn unregister(mode: ObserverMode, raw: RawRegistration) -> bool {
    let handle = raw.0 as *mut c_void;
    let result = unsafe {
        match mode {
            ObserverMode::ExceptionObserver => RemoveVectoredExceptionHandler(handle),
            ObserverMode::ContinueObserver => RemoveVectoredContinueHandler(handle),
        }
    };
    result != 0
}

unsafe extern "system" fn vectored_handler(info: *mut EXCEPTION_POINTERS) -> i32 {
    if let Some(info) = info.as_ref() {
        record_fault(&dump_from_pointers(info));
    }
    EXCEPTION_CONTINUE_SEARCH
}

unsafe fn dump_from_pointers(info: &EXCEPTION_POINTERS) -> FaultDump {
    let mut dump = FaultDump::default();

    #[cfg(target_arch = "x86_64")]
    if let Some(context) = info.ContextRecord.as_ref() {
        dump.registers = vec![
            ("RAX", context.Rax as usize),
            ("RBX", context.Rbx as usize),
            ("RCX", context.Rcx as usize),
            ("RDX", context.Rdx as usize),
            ("RBP", context.Rbp as usize),
            ("RDI", context.Rdi as usize),
            ("RSI", context.Rsi as usize),
            ("RSP", context.Rsp as usize),
            ("RIP", context.Rip as usize),
            ("R8", context.R8 as usize),
            ("R9", context.R9 as usize),
            ("R10", context.R10 as usize),
            ("R11", context.R11 as usize),
            ("R12", context.R12 as usize),
            ("R13", context.R13 as usize),
            ("R14", context.R14 as usize),
            ("R15", context.R15 as usize),
        ];
    }

    if let Some(record) = info.ExceptionRecord.as_ref() {
        let code = record.ExceptionCode.0 as u32;
        dump.code = code;
        dump.description = describe_fault_code(code).to_string();
        dump.flags = record.ExceptionFlags;
        dump.instruction = record.ExceptionAddress as usize;
        dump.record_address = record.ExceptionRecord as usize;
    }

    dump
}
