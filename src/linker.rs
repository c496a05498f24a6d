//! Process-wide lazy linking on top of the fault interceptor.

use std::sync::{Mutex, MutexGuard, OnceLock};

use log::{debug, info};

use crate::arena::{CodeBuffer, ExecutableArena};
use crate::emit::{self, CallerShape, StubEmitter, TargetEmitter};
use crate::error::{LinkError, Result};
use crate::models::{SiteId, SiteReport};
use crate::trap::{
    ArmedSite, FaultCondition, FaultInterceptor, RegisterContext, ResumeAction,
    register_fault_handler,
};

/// Runtime configuration shared by the arena and the driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkerConfig {
    /// Put a breakpoint marker in front of every stub. Stubs then trap
    /// before they fault, so this is meant for runs under a debugger.
    pub diagnostics: bool,
}

static INTERCEPTOR: OnceLock<Mutex<FaultInterceptor>> = OnceLock::new();

fn on_fault(regs: &mut RegisterContext) -> ResumeAction {
    let Some(interceptor) = INTERCEPTOR.get() else {
        return ResumeAction::Escalate;
    };
    // The lock is never held while generated code runs, so the faulting
    // thread cannot be the owner.
    match interceptor.lock() {
        Ok(mut guard) => guard.intercept(regs),
        Err(_) => ResumeAction::Escalate,
    }
}

fn interceptor() -> Result<MutexGuard<'static, FaultInterceptor>> {
    INTERCEPTOR
        .get()
        .ok_or(LinkError::NotInstalled)?
        .lock()
        .map_err(|_| LinkError::Poisoned)
}

/// Installs the fault handler and links calls through faulting stubs.
#[derive(Debug, Clone, Copy)]
pub struct LazyLinker {
    arena: ExecutableArena,
}

impl LazyLinker {
    /// Verifies the caller layouts and registers the fault handler. Safe to
    /// call more than once; the handler and interceptor are shared.
    pub fn install(config: LinkerConfig) -> Result<Self> {
        emit::verify_layout()?;

        let arena = ExecutableArena::new(config.diagnostics)?;
        INTERCEPTOR.get_or_init(|| Mutex::new(FaultInterceptor::new(arena)));
        register_fault_handler(FaultCondition::InvalidAccess, on_fault)?;

        info!(
            "Lazy linker installed (page size {}, diagnostics {})",
            arena.page_size(),
            config.diagnostics
        );
        Ok(Self { arena })
    }

    pub fn arena(&self) -> &ExecutableArena {
        &self.arena
    }

    /// Emits a stub and a caller calling through it, and arms the call site
    /// so that the first call materializes `target`.
    pub fn link<T: TargetEmitter>(&self, target: &T, shape: CallerShape) -> Result<LazyCall> {
        let target_code = target.emit();
        if target_code.len() > self.arena.page_size() {
            return Err(LinkError::CodeTooLarge {
                len: target_code.len(),
                capacity: self.arena.page_size(),
            });
        }

        let stub = self.arena.allocate(&StubEmitter::emit(), true)?;
        let caller_code = shape.emit(stub.base() as u64);
        emit::verify_call_site(shape, &caller_code, stub.base() as u64)?;
        let caller = self.arena.allocate(&caller_code, false)?;

        let id = {
            let mut interceptor = interceptor()?;
            interceptor.ensure_recoverable()?;
            let id = interceptor.next_id();
            interceptor.arm(ArmedSite::new(
                id,
                stub,
                caller,
                shape.call_site_offset(),
                target_code,
            ))
        };

        debug!(
            "Armed call site {}: caller 0x{:x} ({}), stub 0x{:x}",
            id,
            caller.base(),
            shape.name(),
            stub.base()
        );

        Ok(LazyCall {
            id,
            shape,
            stub,
            caller,
        })
    }

    pub fn report(&self, call: &LazyCall) -> Result<SiteReport> {
        let interceptor = interceptor()?;
        interceptor
            .site(call.id)
            .map(ArmedSite::report)
            .ok_or(LinkError::UnknownSite(call.id))
    }

    /// Faults resolved since the handler was installed, across all sites.
    pub fn total_faults(&self) -> Result<usize> {
        Ok(interceptor()?.total_faults())
    }
}

/// A caller whose call site starts out pointing at a stub.
#[derive(Debug, Clone, Copy)]
pub struct LazyCall {
    id: SiteId,
    shape: CallerShape,
    stub: CodeBuffer,
    caller: CodeBuffer,
}

impl LazyCall {
    pub fn id(&self) -> SiteId {
        self.id
    }

    pub fn shape(&self) -> CallerShape {
        self.shape
    }

    pub fn stub(&self) -> &CodeBuffer {
        &self.stub
    }

    pub fn caller(&self) -> &CodeBuffer {
        &self.caller
    }

    /// Current value of the call site's pointer operand.
    pub fn operand(&self) -> Option<u64> {
        self.caller.read_u64(self.shape.operand_offset())
    }

    pub fn is_resolved(&self) -> bool {
        self.operand() != Some(self.stub.base() as u64)
    }

    /// Runs the caller. The first call goes through the stub and the fault
    /// handler; later calls reach the target directly.
    pub fn invoke(&self) -> i32 {
        // SAFETY: the caller is a complete function emitted by CallerShape,
        // and its stub is armed in the installed interceptor.
        let func = unsafe { self.caller.as_fn() };
        func()
    }
}
