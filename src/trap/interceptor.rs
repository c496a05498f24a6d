//! Fault-to-patch state machine.

use std::fmt;
use std::time::SystemTime;

use nix::errno::Errno;

use super::context::RegisterContext;
use super::signal::ResumeAction;
use crate::arena::{CodeBuffer, ExecutableArena};
use crate::emit::{CALL_SEQUENCE_LEN, OPERAND_OFFSET};
use crate::error::LinkError;
use crate::models::{PatchRecord, SiteId, SiteReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptorState {
    /// Waiting for the next fault.
    Armed,
    /// Resolving a fault.
    Handling,
    /// A fault did not match any armed site; everything escalates from now on.
    Unrecoverable,
}

/// Why a fault was not turned into a patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultRejection {
    /// The faulting instruction is not inside any armed stub.
    UnknownInstruction { ip: u64 },
    /// The return address on the stack does not lead back to the site's caller.
    ForeignCaller { ip: u64, return_address: u64 },
    /// The site was patched before; its stub must be unreachable.
    AlreadyPatched { site: SiteId },
    /// The operand no longer holds the stub address.
    OperandMismatch { site: SiteId, operand: u64 },
    /// The target page could not be reserved.
    TargetAllocation(Errno),
    /// An earlier fault already left the interceptor unrecoverable.
    Disabled,
}

impl fmt::Display for FaultRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultRejection::UnknownInstruction { ip } => {
                write!(f, "rip 0x{:x} is not inside an armed stub", ip)
            }
            FaultRejection::ForeignCaller { ip, return_address } => write!(
                f,
                "stub at 0x{:x} entered from unknown return address 0x{:x}",
                ip, return_address
            ),
            FaultRejection::AlreadyPatched { site } => {
                write!(f, "call site {} is already patched", site)
            }
            FaultRejection::OperandMismatch { site, operand } => write!(
                f,
                "call site {} operand 0x{:x} does not point at its stub",
                site, operand
            ),
            FaultRejection::TargetAllocation(errno) => {
                write!(f, "target allocation failed: {}", errno)
            }
            FaultRejection::Disabled => write!(f, "interceptor is unrecoverable"),
        }
    }
}

/// A call site waiting for its first fault, or already resolved.
#[derive(Debug, Clone)]
pub struct ArmedSite {
    pub id: SiteId,
    pub stub: CodeBuffer,
    pub caller: CodeBuffer,
    /// Offset of the call sequence within the caller's code.
    pub call_site_offset: usize,
    pub target_code: Vec<u8>,
    pub fault_count: u32,
    pub patch: Option<PatchRecord>,
}

impl ArmedSite {
    pub fn new(
        id: SiteId,
        stub: CodeBuffer,
        caller: CodeBuffer,
        call_site_offset: usize,
        target_code: Vec<u8>,
    ) -> Self {
        Self {
            id,
            stub,
            caller,
            call_site_offset,
            target_code,
            fault_count: 0,
            patch: None,
        }
    }

    pub fn call_site_addr(&self) -> u64 {
        self.caller.code_addr(self.call_site_offset) as u64
    }

    pub fn operand_offset(&self) -> usize {
        self.call_site_offset + OPERAND_OFFSET
    }

    pub fn operand(&self) -> Option<u64> {
        self.caller.read_u64(self.operand_offset())
    }

    pub fn report(&self) -> SiteReport {
        SiteReport {
            id: self.id,
            fault_count: self.fault_count,
            patch: self.patch,
        }
    }
}

/// Resolves stub faults into call-site patches.
///
/// [`FaultInterceptor::intercept`] runs inside the signal handler: it reads
/// the table, maps one page and writes one word, nothing else. Arming sites
/// happens outside the handler and is the only place the table grows.
#[derive(Debug)]
pub struct FaultInterceptor {
    arena: ExecutableArena,
    sites: Vec<ArmedSite>,
    state: InterceptorState,
    total_faults: usize,
    last_rejection: Option<FaultRejection>,
}

impl FaultInterceptor {
    pub fn new(arena: ExecutableArena) -> Self {
        Self {
            arena,
            sites: Vec::new(),
            state: InterceptorState::Armed,
            total_faults: 0,
            last_rejection: None,
        }
    }

    pub fn state(&self) -> InterceptorState {
        self.state
    }

    pub fn total_faults(&self) -> usize {
        self.total_faults
    }

    pub fn last_rejection(&self) -> Option<FaultRejection> {
        self.last_rejection
    }

    /// Fails once a fault was rejected; no new sites are armed after that.
    pub fn ensure_recoverable(&self) -> Result<(), LinkError> {
        if self.state != InterceptorState::Unrecoverable {
            return Ok(());
        }
        Err(LinkError::UnrecognizedFault(
            self.last_rejection.unwrap_or(FaultRejection::Disabled),
        ))
    }

    pub fn next_id(&self) -> SiteId {
        SiteId(self.sites.len())
    }

    /// Adds a site whose caller currently calls through `stub`.
    pub fn arm(&mut self, site: ArmedSite) -> SiteId {
        let id = site.id;
        self.sites.push(site);
        id
    }

    pub fn site(&self, id: SiteId) -> Option<&ArmedSite> {
        self.sites.get(id.0)
    }

    pub fn sites(&self) -> &[ArmedSite] {
        &self.sites
    }

    /// Handles one fault. On success the context resumes at the patched call
    /// site with the stale return address popped.
    pub fn intercept(&mut self, regs: &mut RegisterContext) -> ResumeAction {
        if self.state == InterceptorState::Unrecoverable {
            self.last_rejection = Some(FaultRejection::Disabled);
            return ResumeAction::Escalate;
        }

        self.state = InterceptorState::Handling;
        match self.resolve(regs) {
            Ok(()) => {
                self.total_faults += 1;
                self.state = InterceptorState::Armed;
                ResumeAction::Resume
            }
            Err(rejection) => {
                self.last_rejection = Some(rejection);
                self.state = InterceptorState::Unrecoverable;
                ResumeAction::Escalate
            }
        }
    }

    fn resolve(&mut self, regs: &mut RegisterContext) -> Result<(), FaultRejection> {
        let ip = regs.instruction_pointer();
        let index = self
            .sites
            .iter()
            .position(|s| s.stub.contains(ip as usize))
            .ok_or(FaultRejection::UnknownInstruction { ip })?;

        // SAFETY: we are inside a stub that was entered by `call`, so the
        // stack pointer addresses the pushed return address.
        let return_address = unsafe { regs.return_address() };
        let call_site = return_address.wrapping_sub(CALL_SEQUENCE_LEN as u64);

        let arena = self.arena;
        let site = &mut self.sites[index];
        if call_site != site.call_site_addr() {
            return Err(FaultRejection::ForeignCaller { ip, return_address });
        }
        if site.patch.is_some() {
            return Err(FaultRejection::AlreadyPatched { site: site.id });
        }
        let previous_operand = site.operand().ok_or(FaultRejection::OperandMismatch {
            site: site.id,
            operand: 0,
        })?;
        if previous_operand != site.stub.base() as u64 {
            return Err(FaultRejection::OperandMismatch {
                site: site.id,
                operand: previous_operand,
            });
        }

        let target = arena
            .allocate(&site.target_code, false)
            .map_err(|e| match e {
                LinkError::Allocation(errno) => FaultRejection::TargetAllocation(errno),
                _ => FaultRejection::TargetAllocation(Errno::ENOMEM),
            })?;

        // SAFETY: the only thread inside this caller is the one we interrupted,
        // and it is parked in the stub.
        unsafe { site.caller.write_u64(site.operand_offset(), target.base() as u64) };

        let stack_pointer = regs.stack_pointer();
        regs.set_instruction_pointer(call_site);
        regs.pop_word();

        site.fault_count += 1;
        site.patch = Some(PatchRecord {
            site: site.id,
            call_site,
            operand_address: site.caller.code_addr(site.operand_offset()) as u64,
            previous_operand,
            target,
            return_address,
            stack_pointer,
            frame_pointer: regs.frame_pointer(),
            patched_at: SystemTime::now(),
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::{CallerShape, ConstantTarget, StubEmitter, TargetEmitter};

    struct Fixture {
        interceptor: FaultInterceptor,
        id: SiteId,
        stack: Box<[u64; 4]>,
    }

    impl Fixture {
        fn new(shape: CallerShape) -> Self {
            let arena = ExecutableArena::new(false).unwrap();
            let mut interceptor = FaultInterceptor::new(arena);

            let stub = arena.allocate(&StubEmitter::emit(), true).unwrap();
            let caller = arena
                .allocate(&shape.emit(stub.base() as u64), false)
                .unwrap();
            let id = interceptor.next_id();
            interceptor.arm(ArmedSite::new(
                id,
                stub,
                caller,
                shape.call_site_offset(),
                ConstantTarget(4).emit(),
            ));

            Self {
                interceptor,
                id,
                stack: Box::new([0; 4]),
            }
        }

        fn site(&self) -> &ArmedSite {
            self.interceptor.site(self.id).unwrap()
        }

        /// Context as delivered when the stub faults right after `call rax`.
        fn fault_context(&mut self) -> RegisterContext {
            let site = self.site().clone();
            self.stack[1] = site.call_site_addr() + CALL_SEQUENCE_LEN as u64;
            RegisterContext::new(
                site.stub.base() as u64,
                0x7fff_0040,
                &self.stack[1] as *const u64 as u64,
            )
        }
    }

    #[test]
    fn test_intercept_patches_and_rewinds() {
        let mut fx = Fixture::new(CallerShape::Plain);
        let mut regs = fx.fault_context();
        let sp = regs.stack_pointer();

        assert_eq!(fx.interceptor.intercept(&mut regs), ResumeAction::Resume);
        assert_eq!(fx.interceptor.state(), InterceptorState::Armed);
        assert_eq!(fx.interceptor.total_faults(), 1);

        let site = fx.site();
        let patch = site.patch.expect("patch recorded");
        assert_eq!(regs.instruction_pointer(), site.call_site_addr());
        assert_eq!(regs.stack_pointer(), sp + 8);
        assert_eq!(regs.frame_pointer(), 0x7fff_0040);
        assert_eq!(site.operand(), Some(patch.target.base() as u64));
        assert_eq!(patch.previous_operand, site.stub.base() as u64);
        assert_eq!(patch.call_site, site.caller.base() as u64 + 1);
        assert_eq!(patch.operand_address, site.caller.base() as u64 + 3);
        assert_eq!(patch.stack_pointer, sp);
        assert_eq!(site.fault_count, 1);
    }

    #[test]
    fn test_patched_caller_runs_target() {
        let mut fx = Fixture::new(CallerShape::Guarded);
        let mut regs = fx.fault_context();
        assert_eq!(fx.interceptor.intercept(&mut regs), ResumeAction::Resume);

        let site = fx.site();
        let patch = site.patch.unwrap();
        assert_eq!(patch.target.bytes(), ConstantTarget(4).emit().as_slice());
        assert!(!patch.target.has_trap_marker());

        // the operand now leads to the target, so the caller no longer faults
        let caller = unsafe { site.caller.as_fn() };
        assert_eq!(caller(), 4);
        assert_eq!(caller(), 4);
    }

    #[test]
    fn test_fault_in_diagnostic_stub_body() {
        let mut fx = Fixture::new(CallerShape::Plain);
        let mut regs = fx.fault_context();
        // with a trap marker the faulting load sits one byte past the entry
        regs.set_instruction_pointer(regs.instruction_pointer() + 1);

        assert_eq!(fx.interceptor.intercept(&mut regs), ResumeAction::Resume);
    }

    #[test]
    fn test_unknown_instruction_escalates() {
        let mut fx = Fixture::new(CallerShape::Plain);
        let mut regs = fx.fault_context();
        regs.set_instruction_pointer(0x10);
        let before = regs;

        assert_eq!(fx.interceptor.intercept(&mut regs), ResumeAction::Escalate);
        assert_eq!(fx.interceptor.state(), InterceptorState::Unrecoverable);
        assert_eq!(
            fx.interceptor.last_rejection(),
            Some(FaultRejection::UnknownInstruction { ip: 0x10 })
        );
        assert_eq!(regs, before);
        assert!(fx.site().patch.is_none());
        assert_eq!(fx.site().operand(), Some(fx.site().stub.base() as u64));
    }

    #[test]
    fn test_foreign_return_address_escalates() {
        let mut fx = Fixture::new(CallerShape::Plain);
        let mut regs = fx.fault_context();
        fx.stack[1] += 4;

        assert_eq!(fx.interceptor.intercept(&mut regs), ResumeAction::Escalate);
        assert!(matches!(
            fx.interceptor.last_rejection(),
            Some(FaultRejection::ForeignCaller { .. })
        ));
        assert_eq!(fx.site().fault_count, 0);
        assert_eq!(fx.site().operand(), Some(fx.site().stub.base() as u64));
    }

    #[test]
    fn test_truncated_caller_escalates_without_panicking() {
        let arena = ExecutableArena::new(false).unwrap();
        let mut interceptor = FaultInterceptor::new(arena);
        let stub = arena.allocate(&StubEmitter::emit(), false).unwrap();
        let code = CallerShape::Plain.emit(stub.base() as u64);
        // operand bytes cut off after the opcode
        let caller = arena.allocate(&code[..5], false).unwrap();
        let id = interceptor.next_id();
        interceptor.arm(ArmedSite::new(
            id,
            stub,
            caller,
            CallerShape::Plain.call_site_offset(),
            ConstantTarget(4).emit(),
        ));

        let mut stack = [0u64; 2];
        stack[0] = interceptor.site(id).unwrap().call_site_addr() + CALL_SEQUENCE_LEN as u64;
        let mut regs = RegisterContext::new(stub.base() as u64, 0, stack.as_ptr() as u64);

        assert_eq!(interceptor.intercept(&mut regs), ResumeAction::Escalate);
        assert_eq!(
            interceptor.last_rejection(),
            Some(FaultRejection::OperandMismatch {
                site: id,
                operand: 0
            })
        );
        assert_eq!(interceptor.site(id).unwrap().operand(), None);
    }

    #[test]
    fn test_second_fault_on_patched_site_escalates() {
        let mut fx = Fixture::new(CallerShape::Plain);
        let mut regs = fx.fault_context();
        assert_eq!(fx.interceptor.intercept(&mut regs), ResumeAction::Resume);
        let operand = fx.site().operand();

        let mut again = fx.fault_context();
        assert_eq!(fx.interceptor.intercept(&mut again), ResumeAction::Escalate);
        assert_eq!(
            fx.interceptor.last_rejection(),
            Some(FaultRejection::AlreadyPatched { site: fx.id })
        );
        assert_eq!(fx.site().operand(), operand);
        assert_eq!(fx.site().fault_count, 1);
        assert!(fx.interceptor.ensure_recoverable().is_err());
    }

    #[test]
    fn test_unrecoverable_is_terminal() {
        let mut fx = Fixture::new(CallerShape::Plain);
        let mut bogus = RegisterContext::new(0x20, 0, 0);
        assert_eq!(fx.interceptor.intercept(&mut bogus), ResumeAction::Escalate);

        let mut regs = fx.fault_context();
        assert_eq!(fx.interceptor.intercept(&mut regs), ResumeAction::Escalate);
        assert_eq!(
            fx.interceptor.last_rejection(),
            Some(FaultRejection::Disabled)
        );
        assert!(fx.site().patch.is_none());
        assert!(matches!(
            fx.interceptor.ensure_recoverable(),
            Err(LinkError::UnrecognizedFault(FaultRejection::Disabled))
        ));
    }

    #[test]
    fn test_sites_patch_independently() {
        let mut fx = Fixture::new(CallerShape::Plain);
        let arena = ExecutableArena::new(false).unwrap();
        let stub = arena.allocate(&StubEmitter::emit(), false).unwrap();
        let caller = arena
            .allocate(&CallerShape::Plain.emit(stub.base() as u64), false)
            .unwrap();
        let other = fx.interceptor.next_id();
        fx.interceptor.arm(ArmedSite::new(
            other,
            stub,
            caller,
            CallerShape::Plain.call_site_offset(),
            ConstantTarget(7).emit(),
        ));

        let mut regs = fx.fault_context();
        assert_eq!(fx.interceptor.intercept(&mut regs), ResumeAction::Resume);

        let untouched = fx.interceptor.site(other).unwrap();
        assert_eq!(untouched.operand(), Some(stub.base() as u64));
        assert_eq!(untouched.fault_count, 0);
        assert!(untouched.patch.is_none());
    }
}
