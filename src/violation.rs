use std::result;

use crate::page_math;

/// Reason an access was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    /// A write touched a page or region without write permission.
    WriteProtection,
    /// The access was malformed in a way neither permission nor allocation
    /// checks cover.
    AccessViolation,
    /// The access touched an address no page or region backs.
    NonAllocated,
}

/// Structured record of the most recent failing access. Retrying the same
/// access yields the same record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub kind: ViolationKind,
    /// Page-aligned address of the first page the access failed on.
    pub address: u32,
    /// Size in bytes of the attempted access.
    pub size: u32,
    /// Base address of the offending page. Diagnostic only; the flat
    /// engine has no pages and leaves it unset.
    pub page: Option<u32>,
}

impl Violation {
    /// Access touched unbacked memory. `addr` may be any address within
    /// the first missing page.
    pub fn non_allocated(addr: u32, size: u32) -> Self {
        Violation {
            kind: ViolationKind::NonAllocated,
            address: page_math::page_base(addr),
            size,
            page: None,
        }
    }

    /// Write hit a read-only page or region.
    pub fn write_protection(addr: u32, size: u32, page: Option<u32>) -> Self {
        Violation {
            kind: ViolationKind::WriteProtection,
            address: page_math::page_base(addr),
            size,
            page,
        }
    }
}

/// Outcome of a pointer-producing lookup inside an engine: either a usable
/// location or the violation the caller would observe.
pub type Lookup<T> = result::Result<T, Violation>;
