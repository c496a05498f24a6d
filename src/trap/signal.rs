//! Registration of the process-wide fault callback.

use std::ffi::c_void;
use std::sync::OnceLock;

use libc::{c_int, siginfo_t, ucontext_t};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction, signal};

use super::context::RegisterContext;
use crate::error::{LinkError, Result};

/// Hardware conditions a callback can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCondition {
    /// Load or store through an unmapped or protected address.
    InvalidAccess,
}

impl FaultCondition {
    fn signal(self) -> Signal {
        match self {
            FaultCondition::InvalidAccess => Signal::SIGSEGV,
        }
    }
}

/// What the interrupted thread does once the callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeAction {
    /// Continue with the (possibly modified) register context.
    Resume,
    /// Restore the default disposition; the re-executed instruction faults
    /// again and terminates the process.
    Escalate,
}

/// Runs on the faulting thread with the signal blocked. Must not allocate,
/// lock anything the interrupted code may hold, or do buffered I/O.
pub type FaultCallback = fn(&mut RegisterContext) -> ResumeAction;

static INVALID_ACCESS: OnceLock<FaultCallback> = OnceLock::new();

/// Installs `callback` for `condition`.
///
/// Registering the same callback again is a no-op; a different one is
/// rejected with [`LinkError::HandlerConflict`].
pub fn register_fault_handler(condition: FaultCondition, callback: FaultCallback) -> Result<()> {
    let slot = match condition {
        FaultCondition::InvalidAccess => &INVALID_ACCESS,
    };

    let installed = *slot.get_or_init(|| callback);
    if installed as usize != callback as usize {
        return Err(LinkError::HandlerConflict);
    }

    let action = SigAction::new(
        SigHandler::SigAction(on_invalid_access),
        SaFlags::SA_SIGINFO,
        SigSet::empty(),
    );
    // SAFETY: the handler only touches the delivered context and the
    // interceptor state reachable through the registered callback.
    unsafe { sigaction(condition.signal(), &action) }.map_err(LinkError::HandlerRegistration)?;

    log::debug!("Fault handler installed for {:?}", condition);
    Ok(())
}

fn escalate(signal_number: c_int) {
    if let Ok(sig) = Signal::try_from(signal_number) {
        // SAFETY: restoring the default disposition is async-signal-safe.
        let _ = unsafe { signal(sig, SigHandler::SigDfl) };
    }
}

extern "C" fn on_invalid_access(signal_number: c_int, _info: *mut siginfo_t, context: *mut c_void) {
    let Some(callback) = INVALID_ACCESS.get() else {
        escalate(signal_number);
        return;
    };

    // SAFETY: installed with SA_SIGINFO, so the kernel passes a ucontext_t.
    let uc = unsafe { &mut *(context as *mut ucontext_t) };
    let mut regs = RegisterContext::capture(uc);

    match callback(&mut regs) {
        ResumeAction::Resume => regs.apply(uc),
        ResumeAction::Escalate => escalate(signal_number),
    }
}
