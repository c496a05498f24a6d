use nix::errno::Errno;
use thiserror::Error;

use crate::models::SiteId;
use crate::trap::FaultRejection;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Failed to reserve executable page: {0}")]
    Allocation(#[source] Errno),

    #[error("Page size query failed: {0}")]
    PageSizeQuery(#[source] Errno),

    #[error("Page size is not reported by the platform")]
    PageSize,

    #[error("Code of {len} bytes does not fit into a {capacity} byte page")]
    CodeTooLarge { len: usize, capacity: usize },

    #[error("Failed to register fault handler: {0}")]
    HandlerRegistration(#[source] Errno),

    #[error("A different fault handler is already registered")]
    HandlerConflict,

    #[error("Caller layout mismatch in {shape} caller at byte {offset}")]
    LayoutMismatch { shape: &'static str, offset: usize },

    #[error("Unrecognized fault: {0}")]
    UnrecognizedFault(FaultRejection),

    #[error("Lazy linker is not installed")]
    NotInstalled,

    #[error("Unknown call site {0}")]
    UnknownSite(SiteId),

    #[error("Fault interceptor lock poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, LinkError>;
