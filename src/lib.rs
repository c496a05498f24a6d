//! Lazily linked calls resolved by patching the call site from a SIGSEGV handler.

#[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
compile_error!("lazypatch emits x86-64 code and relies on Linux signal contexts");

pub use arena::{CodeBuffer, ExecutableArena, GeneratedFn, TRAP_MARKER, page_size};
pub use driver::{DEMO_RESULT, DemoReport, Invocation, PreparedDemo, prepare_demo, run_demo};
pub use emit::{
    CALL_SEQUENCE_LEN, CallerShape, ConstantTarget, OPERAND_OFFSET, STACK_CANARY, StubEmitter,
    TargetEmitter, UNBALANCED_STACK,
};
pub use error::{LinkError, Result};
pub use linker::{LazyCall, LazyLinker, LinkerConfig};
pub use models::{PatchRecord, SiteId, SiteReport};
pub use trap::{
    FaultCondition, FaultInterceptor, FaultRejection, InterceptorState, RegisterContext,
    ResumeAction,
};

mod arena;
mod driver;
pub mod emit;
mod error;
mod linker;
mod models;
pub mod trap;
pub mod utils;
