use std::fmt;

use log::debug;

use crate::int::MemInt;
use crate::memory::{MemoryLayout, MemoryOptions};
use crate::page_math::{self, INPUT_BASE, PAGE_SIZE, RO_BASE, STACK_BASE};
use crate::result::{MemoryError, Result};
use crate::slice::MemorySlice;
use crate::snapshot::{MemoryRegion, MemorySnapshot};
use crate::violation::{Lookup, Violation};

/// Dense memory engine: one contiguous buffer per region, dispatched by
/// range checks instead of a page table. Trades the sparse engine's
/// per-page bookkeeping for direct slices into region storage.
#[derive(Clone)]
pub struct FlatMemory {
    ro: Vec<u8>,
    heap: Vec<u8>,
    stack: Vec<u8>,
    input: Vec<u8>,
    heap_base: u32,
    heap_top: u32,
    dynamic_allocation: bool,
    heap_allocation_limit: Option<u32>,
    last_violation: Option<Violation>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Region {
    ReadOnly,
    Heap,
    Stack,
    Input,
}

/// Checked in this order; the stack is the hottest region for PVM code.
const DISPATCH_ORDER: [Region; 4] = [
    Region::Stack,
    Region::Heap,
    Region::ReadOnly,
    Region::Input,
];

fn zeroed(len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)?;
    buf.resize(len, 0);
    Ok(buf)
}

impl FlatMemory {
    /// Memory with four empty regions.
    pub fn empty(dynamic_allocation: bool) -> Self {
        FlatMemory {
            ro: Vec::new(),
            heap: Vec::new(),
            stack: Vec::new(),
            input: Vec::new(),
            heap_base: page_math::heap_base(0) as u32,
            heap_top: 0,
            dynamic_allocation,
            heap_allocation_limit: None,
            last_violation: None,
        }
    }

    /// Validate the layout and allocate all four regions, zeroed. The heap
    /// top starts at the heap base.
    pub fn with_capacity(opts: &MemoryOptions<'_>) -> Result<Self> {
        let layout = MemoryLayout::compute(opts)?;
        Ok(FlatMemory {
            ro: zeroed(layout.ro_size as usize)?,
            heap: zeroed(layout.heap_pages as usize * PAGE_SIZE as usize)?,
            stack: zeroed(layout.stack_pages as usize * PAGE_SIZE as usize)?,
            input: zeroed(layout.input_size as usize)?,
            heap_base: layout.heap_base,
            heap_top: layout.heap_base,
            dynamic_allocation: opts.dynamic_allocation,
            heap_allocation_limit: opts.heap_allocation_limit,
            last_violation: None,
        })
    }

    /// Allocate all regions and fill them with the supplied payloads. The
    /// heap top ends up above the whole initial heap allotment.
    pub fn with_data(opts: &MemoryOptions<'_>) -> Result<Self> {
        let mut mem = Self::with_capacity(opts)?;
        mem.init_memory(RO_BASE, opts.read_only_bytes)?;
        mem.init_memory(mem.heap_base, opts.read_write_bytes)?;
        mem.init_memory(INPUT_BASE, opts.input_bytes)?;
        mem.heap_top = (u64::from(mem.heap_base) + mem.heap.len() as u64) as u32;
        Ok(mem)
    }

    fn region_bounds(&self, region: Region) -> (u32, usize) {
        match region {
            Region::Stack => (self.stack_bottom(), self.stack.len()),
            Region::Heap => (self.heap_base, self.heap.len()),
            Region::ReadOnly => (RO_BASE, self.ro.len()),
            Region::Input => (INPUT_BASE, self.input.len()),
        }
    }

    fn region_slice(&self, region: Region) -> &[u8] {
        match region {
            Region::Stack => &self.stack,
            Region::Heap => &self.heap,
            Region::ReadOnly => &self.ro,
            Region::Input => &self.input,
        }
    }

    fn region_slice_mut(&mut self, region: Region) -> &mut [u8] {
        match region {
            Region::Stack => &mut self.stack,
            Region::Heap => &mut self.heap,
            Region::ReadOnly => &mut self.ro,
            Region::Input => &mut self.input,
        }
    }

    /// Range-check cascade. Returns the region holding `addr` and the
    /// offset of `addr` in it; the full `len` bytes must fit the region.
    fn resolve(&self, addr: u32, len: u32, write: bool) -> Lookup<(Region, usize)> {
        for &region in DISPATCH_ORDER.iter() {
            let (base, size) = self.region_bounds(region);
            let region_end = u64::from(base) + size as u64;
            if addr < base || u64::from(addr) >= region_end {
                continue;
            }
            if write && matches!(region, Region::ReadOnly | Region::Input) {
                return Err(Violation::write_protection(addr, len, None));
            }
            if u64::from(addr) + u64::from(len) > region_end {
                // the first missing byte sits just past the region
                return Err(Violation::non_allocated(region_end as u32, len));
            }
            return Ok((region, (addr - base) as usize));
        }
        Err(Violation::non_allocated(addr, len))
    }

    fn fault<T>(&mut self, violation: Violation) -> Result<T> {
        debug!(
            "page fault: {:?} at {:#x} (size {})",
            violation.kind, violation.address, violation.size
        );
        self.last_violation = Some(violation);
        Err(MemoryError::PageFault)
    }

    /// Little-endian load. Regions are contiguous, so the access never
    /// splits; it merely must fit the region.
    pub fn read_int<T: MemInt>(&mut self, addr: u32) -> Result<T> {
        match self.resolve(addr, T::SIZE as u32, false) {
            Ok((region, offset)) => {
                let data = self.region_slice(region);
                Ok(T::from_le(&data[offset..offset + T::SIZE]))
            }
            Err(violation) => self.fault(violation),
        }
    }

    /// Like `read_int`, widening the loaded value to 64 bits: sign-extended
    /// for signed `T`, zero-extended for unsigned `T`.
    pub fn read_int_sign_extend<T: MemInt>(&mut self, addr: u32) -> Result<u64> {
        Ok(self.read_int::<T>(addr)?.widen())
    }

    /// Little-endian store into a writable region.
    pub fn write_int<T: MemInt>(&mut self, addr: u32, value: T) -> Result<()> {
        match self.resolve(addr, T::SIZE as u32, true) {
            Ok((region, offset)) => {
                let mut buf = [0u8; 8];
                value.put_le(&mut buf[..T::SIZE]);
                self.region_slice_mut(region)[offset..offset + T::SIZE]
                    .copy_from_slice(&buf[..T::SIZE]);
                Ok(())
            }
            Err(violation) => self.fault(violation),
        }
    }

    /// Read `len` bytes starting at `addr`. Region storage is contiguous,
    /// so the result always borrows straight from it.
    pub fn read_slice(&mut self, addr: u32, len: u32) -> Result<MemorySlice<'_>> {
        if len == 0 {
            return Ok(MemorySlice::Borrowed(&[]));
        }
        match self.resolve(addr, len, false) {
            Ok((region, offset)) => Ok(MemorySlice::Borrowed(
                &self.region_slice(region)[offset..offset + len as usize],
            )),
            Err(violation) => self.fault(violation),
        }
    }

    /// Read `len` bytes into a buffer the caller owns.
    pub fn read_slice_owned(&mut self, addr: u32, len: u32) -> Result<Vec<u8>> {
        match self.resolve(addr, len, false) {
            Ok((region, offset)) => {
                let mut buf = Vec::new();
                buf.try_reserve_exact(len as usize)?;
                buf.extend_from_slice(&self.region_slice(region)[offset..offset + len as usize]);
                Ok(buf)
            }
            Err(violation) => self.fault(violation),
        }
    }

    /// Write `bytes` starting at `addr` into a writable region.
    pub fn write_slice(&mut self, addr: u32, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        match self.resolve(addr, bytes.len() as u32, true) {
            Ok((region, offset)) => {
                self.region_slice_mut(region)[offset..offset + bytes.len()]
                    .copy_from_slice(bytes);
                Ok(())
            }
            Err(violation) => self.fault(violation),
        }
    }

    /// Write `bytes` ignoring write protection. Only meant for filling
    /// regions during construction.
    pub fn init_memory(&mut self, addr: u32, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        match self.resolve(addr, bytes.len() as u32, false) {
            Ok((region, offset)) => {
                self.region_slice_mut(region)[offset..offset + bytes.len()]
                    .copy_from_slice(bytes);
                Ok(())
            }
            Err(violation) => self.fault(violation),
        }
    }

    /// Advance the heap top by `n` bytes, growing the heap buffer in whole
    /// pages. Returns the previous heap top, or `0` if the heap cannot
    /// grow.
    pub fn sbrk(&mut self, n: u32) -> u32 {
        if self.heap_top == 0 {
            self.heap_top = self.heap_base;
        }
        if n == 0 {
            return self.heap_top;
        }
        let old_top = self.heap_top;
        let new_top = u64::from(old_top) + u64::from(n);
        if new_top >= u64::from(self.stack_bottom()) {
            debug!("sbrk({}) would collide with the stack", n);
            return 0;
        }
        let covered = u64::from(self.heap_base) + self.heap.len() as u64;
        if new_top > covered {
            if !self.dynamic_allocation {
                return 0;
            }
            let needed = match page_math::next_page_boundary(new_top) {
                Ok(v) => v,
                Err(_) => return 0,
            };
            if let Some(limit) = self.heap_allocation_limit {
                if needed - u64::from(self.heap_base) > u64::from(limit) {
                    return 0;
                }
            }
            let new_len = (needed - u64::from(self.heap_base)) as usize;
            if self.grow_heap(new_len).is_err() {
                return 0;
            }
        }
        self.heap_top = new_top as u32;
        old_top
    }

    fn grow_heap(&mut self, new_len: usize) -> Result<()> {
        if new_len > self.heap.capacity() {
            // over-reserve so a tight sbrk loop does not reallocate on
            // every page; the valid range is still tracked by the length
            let extra = (new_len - self.heap.len()).saturating_mul(4);
            self.heap.try_reserve(extra)?;
        }
        self.heap.resize(new_len, 0);
        Ok(())
    }

    /// True if any page overlapping `[addr, addr + len)` falls into a
    /// region.
    pub fn is_range_valid(&self, addr: u32, len: u32) -> bool {
        if len == 0 {
            return false;
        }
        let end = u64::from(addr) + u64::from(len);
        let mut page = u64::from(page_math::page_base(addr));
        while page < end && page < page_math::ADDRESS_SPACE {
            if self.resolve(page as u32, 1, false).is_ok() {
                return true;
            }
            page += u64::from(PAGE_SIZE);
        }
        false
    }

    pub fn get_heap_start(&self) -> u32 {
        self.heap_base
    }

    pub fn get_last_violation(&self) -> Option<&Violation> {
        self.last_violation.as_ref()
    }

    pub fn heap_top(&self) -> u32 {
        self.heap_top
    }

    pub fn heap_size_in_pages(&self) -> u32 {
        (self.heap.len() / PAGE_SIZE as usize) as u32
    }

    pub fn stack_bottom(&self) -> u32 {
        (u64::from(STACK_BASE) - self.stack.len() as u64) as u32
    }

    /// Independent copy of all four regions and the violation state.
    pub fn deep_clone(&self) -> Self {
        self.clone()
    }

    /// Page-sized chunks of every region, ascending by address. Matches
    /// the paged engine byte for byte on equal histories.
    pub fn get_memory_snapshot(&self) -> Result<MemorySnapshot> {
        let mut regions = Vec::new();
        let pages = (self.ro.len() + self.heap.len() + self.stack.len() + self.input.len())
            / PAGE_SIZE as usize;
        regions.try_reserve_exact(pages)?;
        // region bases ascend in exactly this order
        Self::push_chunks(&mut regions, RO_BASE, &self.ro, false)?;
        Self::push_chunks(&mut regions, self.heap_base, &self.heap, true)?;
        Self::push_chunks(&mut regions, self.stack_bottom(), &self.stack, true)?;
        Self::push_chunks(&mut regions, INPUT_BASE, &self.input, false)?;
        Ok(MemorySnapshot { regions })
    }

    fn push_chunks(
        regions: &mut Vec<MemoryRegion>,
        base: u32,
        data: &[u8],
        writable: bool,
    ) -> Result<()> {
        for (i, chunk) in data.chunks(PAGE_SIZE as usize).enumerate() {
            let mut copy = Vec::new();
            copy.try_reserve_exact(chunk.len())?;
            copy.extend_from_slice(chunk);
            regions.push(MemoryRegion {
                address: base + (i as u32) * PAGE_SIZE,
                data: copy,
                writable,
            });
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn set_heap_top(&mut self, heap_top: u32) {
        self.heap_top = heap_top;
    }
}

impl fmt::Debug for FlatMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlatMemory")
            .field("ro", &self.ro.len())
            .field("heap", &self.heap.len())
            .field("stack", &self.stack.len())
            .field("input", &self.input.len())
            .field("heap_base", &format_args!("{:#x}", self.heap_base))
            .field("heap_top", &format_args!("{:#x}", self.heap_top))
            .field("dynamic_allocation", &self.dynamic_allocation)
            .finish_non_exhaustive()
    }
}
