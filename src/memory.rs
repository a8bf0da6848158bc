use crate::flat::FlatMemory;
use crate::int::MemInt;
use crate::page_math::{
    self, ADDRESS_SPACE, INPUT_ZONE_SIZE, PAGE_SIZE, STACK_BASE, ZONE_SIZE,
};
use crate::paged::PagedMemory;
use crate::result::{MemoryError, Result};
use crate::slice::MemorySlice;
use crate::snapshot::MemorySnapshot;
use crate::violation::Violation;

/// Construction parameters understood by both engines.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryOptions<'a> {
    /// Initial contents of the read-only region.
    pub read_only_bytes: &'a [u8],
    /// Initial contents written at the base of the heap region.
    pub read_write_bytes: &'a [u8],
    /// Initial contents of the input region.
    pub input_bytes: &'a [u8],
    /// Stack size in bytes, rounded up to whole pages.
    pub stack_bytes: u32,
    /// Pages above the initial read-write data that complete the initial
    /// heap allotment.
    pub heap_pages: u32,
    /// Whether `sbrk` may allocate fresh pages.
    pub dynamic_allocation: bool,
    /// Testing aid: cap on the total heap bytes `sbrk` may cover.
    pub heap_allocation_limit: Option<u32>,
}

/// Concrete region placement for a set of options, shared by both engines.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MemoryLayout {
    /// Page-rounded size of the read-only region.
    pub ro_size: u32,
    pub ro_pages: u32,
    pub heap_base: u32,
    /// Initial heap allotment in pages, data pages included.
    pub heap_pages: u32,
    pub stack_pages: u32,
    pub stack_bottom: u32,
    /// Page-rounded size of the input region.
    pub input_size: u32,
    pub input_pages: u32,
}

impl MemoryLayout {
    pub(crate) fn compute(opts: &MemoryOptions<'_>) -> Result<Self> {
        let ro_len = opts.read_only_bytes.len() as u64;
        let rw_len = opts.read_write_bytes.len() as u64;
        let input_len = opts.input_bytes.len() as u64;
        if input_len > u64::from(INPUT_ZONE_SIZE) {
            return Err(MemoryError::MemoryLimitExceeded);
        }
        let heap_bytes = rw_len + u64::from(opts.heap_pages) * u64::from(PAGE_SIZE);
        // address-space sanity: all regions plus their guard zones must fit
        let mut total = 5 * u64::from(ZONE_SIZE) + u64::from(INPUT_ZONE_SIZE);
        for &section in &[ro_len, heap_bytes, u64::from(opts.stack_bytes)] {
            total += page_math::align_to_section(section)
                .map_err(|_| MemoryError::MemoryLimitExceeded)?;
        }
        if total > ADDRESS_SPACE {
            return Err(MemoryError::MemoryLimitExceeded);
        }
        let stack_pages = page_math::bytes_to_pages(u64::from(opts.stack_bytes))?;
        Ok(MemoryLayout {
            ro_size: page_math::align_to_page(ro_len)? as u32,
            ro_pages: page_math::bytes_to_pages(ro_len)?,
            heap_base: page_math::heap_base(ro_len as u32) as u32,
            heap_pages: page_math::bytes_to_pages(rw_len)? + opts.heap_pages,
            stack_pages,
            stack_bottom: (u64::from(STACK_BASE)
                - u64::from(stack_pages) * u64::from(PAGE_SIZE)) as u32,
            input_size: page_math::align_to_page(input_len)? as u32,
            input_pages: page_math::bytes_to_pages(input_len)?,
        })
    }
}

/// Memory handle the interpreter works against. Both engines expose the
/// same observable contract; the paged engine is the reference, the flat
/// engine trades sparseness for direct region access.
#[derive(Debug, Clone)]
pub enum Memory {
    Paged(PagedMemory),
    Flat(FlatMemory),
}

impl Memory {
    pub fn paged(opts: &MemoryOptions<'_>) -> Result<Self> {
        Ok(Memory::Paged(PagedMemory::with_data(opts)?))
    }

    pub fn flat(opts: &MemoryOptions<'_>) -> Result<Self> {
        Ok(Memory::Flat(FlatMemory::with_data(opts)?))
    }

    pub fn read_int<T: MemInt>(&mut self, addr: u32) -> Result<T> {
        match self {
            Memory::Paged(mem) => mem.read_int(addr),
            Memory::Flat(mem) => mem.read_int(addr),
        }
    }

    pub fn read_int_sign_extend<T: MemInt>(&mut self, addr: u32) -> Result<u64> {
        match self {
            Memory::Paged(mem) => mem.read_int_sign_extend::<T>(addr),
            Memory::Flat(mem) => mem.read_int_sign_extend::<T>(addr),
        }
    }

    pub fn write_int<T: MemInt>(&mut self, addr: u32, value: T) -> Result<()> {
        match self {
            Memory::Paged(mem) => mem.write_int(addr, value),
            Memory::Flat(mem) => mem.write_int(addr, value),
        }
    }

    pub fn read_slice(&mut self, addr: u32, len: u32) -> Result<MemorySlice<'_>> {
        match self {
            Memory::Paged(mem) => mem.read_slice(addr, len),
            Memory::Flat(mem) => mem.read_slice(addr, len),
        }
    }

    pub fn read_slice_owned(&mut self, addr: u32, len: u32) -> Result<Vec<u8>> {
        match self {
            Memory::Paged(mem) => mem.read_slice_owned(addr, len),
            Memory::Flat(mem) => mem.read_slice_owned(addr, len),
        }
    }

    pub fn write_slice(&mut self, addr: u32, bytes: &[u8]) -> Result<()> {
        match self {
            Memory::Paged(mem) => mem.write_slice(addr, bytes),
            Memory::Flat(mem) => mem.write_slice(addr, bytes),
        }
    }

    pub fn init_memory(&mut self, addr: u32, bytes: &[u8]) -> Result<()> {
        match self {
            Memory::Paged(mem) => mem.init_memory(addr, bytes),
            Memory::Flat(mem) => mem.init_memory(addr, bytes),
        }
    }

    pub fn sbrk(&mut self, n: u32) -> u32 {
        match self {
            Memory::Paged(mem) => mem.sbrk(n),
            Memory::Flat(mem) => mem.sbrk(n),
        }
    }

    pub fn is_range_valid(&self, addr: u32, len: u32) -> bool {
        match self {
            Memory::Paged(mem) => mem.is_range_valid(addr, len),
            Memory::Flat(mem) => mem.is_range_valid(addr, len),
        }
    }

    pub fn get_heap_start(&self) -> u32 {
        match self {
            Memory::Paged(mem) => mem.get_heap_start(),
            Memory::Flat(mem) => mem.get_heap_start(),
        }
    }

    pub fn get_last_violation(&self) -> Option<&Violation> {
        match self {
            Memory::Paged(mem) => mem.get_last_violation(),
            Memory::Flat(mem) => mem.get_last_violation(),
        }
    }

    pub fn heap_top(&self) -> u32 {
        match self {
            Memory::Paged(mem) => mem.heap_top(),
            Memory::Flat(mem) => mem.heap_top(),
        }
    }

    pub fn stack_bottom(&self) -> u32 {
        match self {
            Memory::Paged(mem) => mem.stack_bottom(),
            Memory::Flat(mem) => mem.stack_bottom(),
        }
    }

    pub fn deep_clone(&self) -> Self {
        match self {
            Memory::Paged(mem) => Memory::Paged(mem.deep_clone()),
            Memory::Flat(mem) => Memory::Flat(mem.deep_clone()),
        }
    }

    pub fn get_memory_snapshot(&self) -> Result<MemorySnapshot> {
        match self {
            Memory::Paged(mem) => mem.get_memory_snapshot(),
            Memory::Flat(mem) => mem.get_memory_snapshot(),
        }
    }
}
