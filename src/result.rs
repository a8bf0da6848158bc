use std::collections::TryReserveError;
use std::result;

use thiserror::Error;

/// Errors surfaced by the memory subsystem. Nothing is retried internally;
/// the interpreter decides whether a `PageFault` aborts execution or turns
/// into a host trap.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// An access was rejected. The engine stores the structured record in
    /// `last_violation` before returning this.
    #[error("page fault")]
    PageFault,
    #[error("out of memory")]
    OutOfMemory,
    /// The requested layout does not fit the 32-bit address space.
    #[error("memory limit exceeded")]
    MemoryLimitExceeded,
    #[error("address {0:#x} is not page aligned")]
    UnalignedAddress(u32),
    /// Page allocation would overlap pages already in the table.
    #[error("page allocation overlaps existing page at {0:#x}")]
    PageOverlap(u32),
    /// Alignment arithmetic on a value beyond the 32-bit space.
    #[error("size exceeds the 32-bit address space")]
    SizeTooLarge,
}

impl From<TryReserveError> for MemoryError {
    fn from(_: TryReserveError) -> Self {
        MemoryError::OutOfMemory
    }
}

pub type Result<T> = result::Result<T, MemoryError>;
