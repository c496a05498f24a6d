//! Fault interception: register context, handler registration, patching.

pub mod context;
pub mod interceptor;
pub mod signal;

pub use context::RegisterContext;
pub use interceptor::{ArmedSite, FaultInterceptor, FaultRejection, InterceptorState};
pub use signal::{FaultCallback, FaultCondition, ResumeAction, register_fault_handler};
