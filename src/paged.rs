use std::fmt;

use log::debug;

use crate::int::MemInt;
use crate::memory::{MemoryLayout, MemoryOptions};
use crate::page_math::{self, ADDRESS_SPACE, INPUT_BASE, PAGE_SIZE, RO_BASE, STACK_BASE};
use crate::page_table::{PageFlags, PageTable};
use crate::result::{MemoryError, Result};
use crate::slice::MemorySlice;
use crate::snapshot::{MemoryRegion, MemorySnapshot};
use crate::violation::Violation;

/// Sparse memory engine: a sorted table of permission-bearing pages.
///
/// This is the reference engine; the flat engine must stay observably
/// equivalent to it for any legal program.
#[derive(Clone)]
pub struct PagedMemory {
    table: PageTable,
    ro_size: u32,
    heap_base: u32,
    heap_size_pages: u32,
    heap_top: u32,
    stack_pages: u32,
    input_size: u32,
    dynamic_allocation: bool,
    heap_allocation_limit: Option<u32>,
    last_violation: Option<Violation>,
}

impl PagedMemory {
    /// Memory with no allocated pages at all.
    pub fn empty(dynamic_allocation: bool) -> Self {
        PagedMemory {
            table: PageTable::default(),
            ro_size: 0,
            heap_base: page_math::heap_base(0) as u32,
            heap_size_pages: 0,
            heap_top: 0,
            stack_pages: 0,
            input_size: 0,
            dynamic_allocation,
            heap_allocation_limit: None,
            last_violation: None,
        }
    }

    /// Validate the layout and allocate all four regions, zeroed. The heap
    /// top starts at the heap base.
    pub fn with_capacity(opts: &MemoryOptions<'_>) -> Result<Self> {
        let layout = MemoryLayout::compute(opts)?;
        let mut table = PageTable::default();
        table.allocate(RO_BASE, layout.ro_pages, PageFlags::read_only())?;
        table.allocate(layout.heap_base, layout.heap_pages, PageFlags::read_write())?;
        table.allocate(INPUT_BASE, layout.input_pages, PageFlags::read_only())?;
        table.allocate(layout.stack_bottom, layout.stack_pages, PageFlags::read_write())?;
        Ok(PagedMemory {
            table,
            ro_size: layout.ro_size,
            heap_base: layout.heap_base,
            heap_size_pages: layout.heap_pages,
            heap_top: layout.heap_base,
            stack_pages: layout.stack_pages,
            input_size: layout.input_size,
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
        mem.heap_top = (u64::from(mem.heap_base)
            + u64::from(mem.heap_size_pages) * u64::from(PAGE_SIZE)) as u32;
        Ok(mem)
    }

    fn fault<T>(&mut self, violation: Violation) -> Result<T> {
        debug!(
            "page fault: {:?} at {:#x} (size {})",
            violation.kind, violation.address, violation.size
        );
        self.last_violation = Some(violation);
        Err(MemoryError::PageFault)
    }

    /// Little-endian load. The access may cross one page boundary if the
    /// next page is allocated contiguously.
    pub fn read_int<T: MemInt>(&mut self, addr: u32) -> Result<T> {
        let mut buf = [0u8; 8];
        match self.table.load(addr, &mut buf[..T::SIZE]) {
            Ok(()) => Ok(T::from_le(&buf[..T::SIZE])),
            Err(violation) => self.fault(violation),
        }
    }

    /// Like `read_int`, widening the loaded value to 64 bits: sign-extended
    /// for signed `T`, zero-extended for unsigned `T`.
    pub fn read_int_sign_extend<T: MemInt>(&mut self, addr: u32) -> Result<u64> {
        Ok(self.read_int::<T>(addr)?.widen())
    }

    /// Little-endian store. Both pages the value may touch are checked
    /// before any byte is written.
    pub fn write_int<T: MemInt>(&mut self, addr: u32, value: T) -> Result<()> {
        let mut buf = [0u8; 8];
        value.put_le(&mut buf[..T::SIZE]);
        match self.table.store_int(addr, &buf[..T::SIZE]) {
            Ok(()) => Ok(()),
            Err(violation) => self.fault(violation),
        }
    }

    /// Read `len` bytes starting at `addr`. A range within one page is
    /// returned as a borrow into the page; a cross-page range is copied
    /// into an owned buffer.
    pub fn read_slice(&mut self, addr: u32, len: u32) -> Result<MemorySlice<'_>> {
        if len == 0 {
            return Ok(MemorySlice::Borrowed(&[]));
        }
        let index = match self.table.find_index(addr) {
            Some(i) => i,
            None => return self.fault(Violation::non_allocated(addr, len)),
        };
        let base = self.table.page(index).base();
        let end = u64::from(addr) + u64::from(len);
        if end <= u64::from(base) + u64::from(PAGE_SIZE) {
            let offset = (addr - base) as usize;
            let data = self.table.page(index).data();
            return Ok(MemorySlice::Borrowed(&data[offset..offset + len as usize]));
        }
        let mut buf = Vec::new();
        buf.try_reserve_exact(len as usize)?;
        buf.resize(len as usize, 0);
        match self.table.load(addr, &mut buf) {
            Ok(()) => Ok(MemorySlice::Owned(buf)),
            Err(violation) => self.fault(violation),
        }
    }

    /// Read `len` bytes into a buffer the caller owns.
    pub fn read_slice_owned(&mut self, addr: u32, len: u32) -> Result<Vec<u8>> {
        Ok(self.read_slice(addr, len)?.into_bytes())
    }

    /// Write `bytes` starting at `addr`, page by page. Pages already
    /// written stay written if a later page faults.
    pub fn write_slice(&mut self, addr: u32, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        match self.table.store_stream(addr, bytes, true) {
            Ok(()) => Ok(()),
            Err(violation) => self.fault(violation),
        }
    }

    /// Write `bytes` ignoring write protection. Only meant for filling
    /// regions during construction; the touched pages must exist.
    pub fn init_memory(&mut self, addr: u32, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        match self.table.store_stream(addr, bytes, false) {
            Ok(()) => Ok(()),
            Err(violation) => self.fault(violation),
        }
    }

    /// Advance the heap top by `n` bytes, allocating a zeroed read-write
    /// page for every page boundary the new top crosses. Returns the
    /// previous heap top, or `0` if the heap cannot grow.
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
        let covered = match page_math::next_page_boundary(u64::from(old_top)) {
            Ok(v) => v,
            Err(_) => return 0,
        };
        let needed = match page_math::next_page_boundary(new_top) {
            Ok(v) => v,
            Err(_) => return 0,
        };
        let mut missing = covered;
        while missing < needed && self.table.is_allocated(missing as u32) {
            missing += u64::from(PAGE_SIZE);
        }
        if missing < needed {
            // fresh pages are required
            if !self.dynamic_allocation {
                return 0;
            }
            if let Some(limit) = self.heap_allocation_limit {
                if needed - u64::from(self.heap_base) > u64::from(limit) {
                    return 0;
                }
            }
            let mut base = missing;
            while base < needed {
                if !self.table.is_allocated(base as u32) {
                    if self
                        .table
                        .allocate(base as u32, 1, PageFlags::read_write())
                        .is_err()
                    {
                        return 0;
                    }
                    self.heap_size_pages += 1;
                }
                base += u64::from(PAGE_SIZE);
            }
        }
        self.heap_top = new_top as u32;
        old_top
    }

    /// True if any page overlapping `[addr, addr + len)` is allocated.
    pub fn is_range_valid(&self, addr: u32, len: u32) -> bool {
        if len == 0 {
            return false;
        }
        let end = u64::from(addr) + u64::from(len);
        let mut page = u64::from(page_math::page_base(addr));
        while page < end && page < ADDRESS_SPACE {
            if self.table.is_allocated(page as u32) {
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
        self.heap_size_pages
    }

    pub fn stack_bottom(&self) -> u32 {
        (u64::from(STACK_BASE) - u64::from(self.stack_pages) * u64::from(PAGE_SIZE)) as u32
    }

    /// Independent copy: page data, sizing and the last violation are all
    /// duplicated.
    pub fn deep_clone(&self) -> Self {
        self.clone()
    }

    /// One region per allocated page, ascending by address.
    pub fn get_memory_snapshot(&self) -> Result<MemorySnapshot> {
        let mut regions = Vec::new();
        regions.try_reserve_exact(self.table.len())?;
        for page in self.table.pages() {
            let mut data = Vec::new();
            data.try_reserve_exact(page.data().len())?;
            data.extend_from_slice(page.data());
            regions.push(MemoryRegion {
                address: page.base(),
                data,
                writable: page.flags().is_writable(),
            });
        }
        Ok(MemorySnapshot { regions })
    }

    #[cfg(test)]
    pub(crate) fn set_heap_top(&mut self, heap_top: u32) {
        self.heap_top = heap_top;
    }
}

impl fmt::Debug for PagedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagedMemory")
            .field("pages", &self.table.len())
            .field("ro_size", &format_args!("{:#x}", self.ro_size))
            .field("heap_base", &format_args!("{:#x}", self.heap_base))
            .field("heap_top", &format_args!("{:#x}", self.heap_top))
            .field("stack_pages", &self.stack_pages)
            .field("input_size", &format_args!("{:#x}", self.input_size))
            .field("dynamic_allocation", &self.dynamic_allocation)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::PagedMemory;
    use crate::memory::MemoryOptions;
    use crate::page_math::{INPUT_BASE, PAGE_SIZE, RO_BASE, STACK_BASE};
    use crate::result::MemoryError;
    use crate::violation::ViolationKind;

    const P: u32 = PAGE_SIZE;

    fn ro_mem() -> PagedMemory {
        PagedMemory::with_data(&MemoryOptions {
            read_only_bytes: &[0xAA, 0xBB],
            stack_bytes: 0x1000,
            ..MemoryOptions::default()
        })
        .expect("construct")
    }

    fn heap_mem(heap_pages: u32, dynamic_allocation: bool) -> PagedMemory {
        PagedMemory::with_data(&MemoryOptions {
            heap_pages,
            dynamic_allocation,
            stack_bytes: 0x1000,
            ..MemoryOptions::default()
        })
        .expect("construct")
    }

    #[test]
    fn read_only_region_rejects_writes() {
        let mut mem = ro_mem();
        assert_eq!(
            mem.write_int::<u8>(RO_BASE, 0x00),
            Err(MemoryError::PageFault)
        );
        let violation = mem.get_last_violation().expect("violation").clone();
        assert_eq!(violation.kind, ViolationKind::WriteProtection);
        assert_eq!(violation.address, RO_BASE);
        assert_eq!(violation.size, 1);
        // the payload is still intact
        assert_eq!(mem.read_int::<u16>(RO_BASE).expect("read"), 0xBBAA);
    }

    #[test]
    fn cross_page_read_assembles_little_endian() {
        let mut mem = heap_mem(2, false);
        let h = mem.get_heap_start();
        mem.write_slice(h + P - 3, &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88])
            .expect("write");
        assert_eq!(
            mem.read_int::<u64>(h + P - 3).expect("read"),
            0x8877_6655_4433_2211
        );
    }

    #[test]
    fn sbrk_grows_the_heap() {
        let mut mem = heap_mem(1, true);
        let h = mem.get_heap_start();
        assert_eq!(mem.heap_top(), h + P);
        assert_eq!(mem.sbrk(P + 5), h + P);
        assert_eq!(mem.heap_top(), h + 2 * P + 5);
        assert_eq!(mem.read_int::<u8>(h + 2 * P + 4).expect("read"), 0);
        assert!(mem.is_range_valid(h + 2 * P, 1));
        assert_eq!(mem.heap_size_in_pages(), 3);
    }

    #[test]
    fn sbrk_stops_at_the_stack() {
        let mut mem = heap_mem(1, true);
        let bottom = mem.stack_bottom();
        mem.set_heap_top(bottom - 4);
        assert_eq!(mem.sbrk(8), 0);
        assert_eq!(mem.heap_top(), bottom - 4);
        // landing exactly on the stack bottom is a collision too
        mem.set_heap_top(bottom - 8);
        assert_eq!(mem.sbrk(8), 0);
        assert_eq!(mem.heap_top(), bottom - 8);
    }

    #[test]
    fn sbrk_zero_is_a_pure_query() {
        let mut mem = heap_mem(1, true);
        let pages = mem.get_memory_snapshot().expect("snapshot").regions.len();
        assert_eq!(mem.sbrk(0), mem.get_heap_start() + P);
        assert_eq!(
            mem.get_memory_snapshot().expect("snapshot").regions.len(),
            pages
        );
    }

    #[test]
    fn sbrk_without_dynamic_allocation() {
        let mut mem = PagedMemory::with_capacity(&MemoryOptions {
            heap_pages: 1,
            stack_bytes: 0x1000,
            ..MemoryOptions::default()
        })
        .expect("construct");
        let h = mem.get_heap_start();
        // growth inside the already allocated page is fine
        assert_eq!(mem.sbrk(5), h);
        assert_eq!(mem.heap_top(), h + 5);
        // growth needing a fresh page is not
        assert_eq!(mem.sbrk(P), 0);
        assert_eq!(mem.heap_top(), h + 5);
    }

    #[test]
    fn sbrk_honors_the_allocation_limit() {
        let mut mem = PagedMemory::with_data(&MemoryOptions {
            heap_pages: 1,
            dynamic_allocation: true,
            heap_allocation_limit: Some(2 * P),
            stack_bytes: 0x1000,
            ..MemoryOptions::default()
        })
        .expect("construct");
        let h = mem.get_heap_start();
        assert_eq!(mem.sbrk(P), h + P);
        assert_eq!(mem.sbrk(1), 0);
        assert_eq!(mem.heap_top(), h + 2 * P);
    }

    #[test]
    fn sbrk_from_empty_memory() {
        let mut mem = PagedMemory::empty(true);
        let start = mem.get_heap_start();
        assert_eq!(start, 0x20000);
        assert_eq!(mem.sbrk(3), start);
        assert_eq!(mem.read_int::<u8>(start).expect("read"), 0);
        // without dynamic allocation nothing can be mapped
        let mut frozen = PagedMemory::empty(false);
        assert_eq!(frozen.sbrk(3), 0);
    }

    #[test]
    fn read_past_region_end_faults() {
        let mut mem = ro_mem();
        let ro_end = RO_BASE + P;
        assert_eq!(mem.read_int::<u8>(ro_end - 1).expect("read"), 0);
        assert_eq!(mem.read_int::<u16>(ro_end - 1), Err(MemoryError::PageFault));
        let violation = mem.get_last_violation().expect("violation");
        assert_eq!(violation.kind, ViolationKind::NonAllocated);
        assert_eq!(violation.address, ro_end);
        assert_eq!(violation.size, 2);
    }

    #[test]
    fn stack_edges_are_writable() {
        let mut mem = ro_mem();
        let bottom = mem.stack_bottom();
        mem.write_int::<u8>(bottom, 0x7F).expect("write");
        mem.write_int::<u8>(STACK_BASE - 1, 0x7F).expect("write");
        assert_eq!(
            mem.write_int::<u8>(STACK_BASE, 0x7F),
            Err(MemoryError::PageFault)
        );
    }

    #[test]
    fn address_space_end_does_not_wrap() {
        let mut mem = ro_mem();
        assert_eq!(mem.read_int::<u8>(0xFFFF_FFFF), Err(MemoryError::PageFault));
        let violation = mem.get_last_violation().expect("violation");
        assert_eq!(violation.kind, ViolationKind::NonAllocated);
        assert_eq!(violation.address, 0xFFFF_F000);
        assert_eq!(mem.read_int::<u16>(0xFFFF_FFFF), Err(MemoryError::PageFault));
    }

    #[test]
    fn slice_reads_borrow_within_one_page() {
        let mut mem = heap_mem(2, false);
        let h = mem.get_heap_start();
        mem.write_slice(h + P - 2, &[1, 2, 3, 4]).expect("write");
        let slice = mem.read_slice(h + P - 2, 2).expect("read");
        assert!(slice.is_borrowed());
        assert_eq!(&slice[..], &[1, 2]);
        let slice = mem.read_slice(h + P - 2, 4).expect("read");
        assert!(!slice.is_borrowed());
        assert_eq!(&slice[..], &[1, 2, 3, 4]);
        assert_eq!(mem.read_slice_owned(h + P - 2, 4).expect("read"), vec![1, 2, 3, 4]);
        // empty reads succeed anywhere
        assert!(mem.read_slice(0, 0).expect("read").is_empty());
    }

    #[test]
    fn input_region_is_write_protected() {
        let mut mem = PagedMemory::with_data(&MemoryOptions {
            input_bytes: &[1, 2, 3],
            stack_bytes: 0x1000,
            ..MemoryOptions::default()
        })
        .expect("construct");
        assert_eq!(mem.read_int::<u8>(INPUT_BASE).expect("read"), 1);
        assert_eq!(
            mem.write_int::<u8>(INPUT_BASE, 9),
            Err(MemoryError::PageFault)
        );
        let violation = mem.get_last_violation().expect("violation");
        assert_eq!(violation.kind, ViolationKind::WriteProtection);
        assert_eq!(violation.address, INPUT_BASE);
        assert_eq!(mem.read_int::<u8>(INPUT_BASE).expect("read"), 1);
    }

    #[test]
    fn unmapped_reads_fault() {
        let mut mem = ro_mem();
        assert_eq!(mem.read_int::<u32>(0), Err(MemoryError::PageFault));
        let violation = mem.get_last_violation().expect("violation");
        assert_eq!(violation.kind, ViolationKind::NonAllocated);
        assert_eq!(violation.address, 0);
    }

    #[test]
    fn init_memory_bypasses_write_protection() {
        let mut mem = PagedMemory::with_capacity(&MemoryOptions {
            read_only_bytes: &[0; 4],
            stack_bytes: 0x1000,
            ..MemoryOptions::default()
        })
        .expect("construct");
        mem.init_memory(RO_BASE, &[0xDE, 0xAD]).expect("init");
        assert_eq!(mem.read_int::<u16>(RO_BASE).expect("read"), 0xADDE);
        // regular writes still fault
        assert_eq!(
            mem.write_int::<u16>(RO_BASE, 0),
            Err(MemoryError::PageFault)
        );
    }

    #[test]
    fn deep_clone_is_independent() {
        let mut mem = heap_mem(1, true);
        let h = mem.get_heap_start();
        mem.write_int::<u32>(h, 0xAABB_CCDD).expect("write");
        let mut copy = mem.deep_clone();
        copy.write_int::<u32>(h, 0x1122_3344).expect("write");
        assert_eq!(copy.sbrk(P), h + P);
        assert_eq!(mem.read_int::<u32>(h).expect("read"), 0xAABB_CCDD);
        assert_eq!(mem.heap_top(), h + P);
        assert!(!mem.is_range_valid(h + P, 1));
        assert!(copy.is_range_valid(h + P, 1));
    }

    #[test]
    fn range_validity_is_page_granular() {
        let mem = heap_mem(1, false);
        let h = mem.get_heap_start();
        assert!(!mem.is_range_valid(h, 0));
        assert!(mem.is_range_valid(h, 1));
        assert!(mem.is_range_valid(h + P - 1, 4096));
        // a range merely touching an allocated page counts
        assert!(mem.is_range_valid(h - 4, 8));
        assert!(!mem.is_range_valid(h + P, 1));
        assert!(!mem.is_range_valid(0xFFFF_FFFF, 1));
    }

    #[test]
    fn snapshot_lists_every_page_in_order() {
        let mem = PagedMemory::with_data(&MemoryOptions {
            read_only_bytes: &[0xAA],
            read_write_bytes: &[0xBB],
            input_bytes: &[0xCC],
            stack_bytes: 0x1000,
            heap_pages: 1,
            ..MemoryOptions::default()
        })
        .expect("construct");
        let snapshot = mem.get_memory_snapshot().expect("snapshot");
        let summary: Vec<(u32, bool, u8)> = snapshot
            .regions
            .iter()
            .map(|r| (r.address, r.writable, r.data[0]))
            .collect();
        assert_eq!(
            summary,
            vec![
                (RO_BASE, false, 0xAA),
                (0x20000, true, 0xBB),
                (0x21000, true, 0x00),
                (STACK_BASE - P, true, 0x00),
                (INPUT_BASE, false, 0xCC),
            ]
        );
        assert!(snapshot.regions.iter().all(|r| r.data.len() == P as usize));
    }

    #[test]
    fn layout_that_cannot_fit_is_rejected() {
        let big_input = vec![0u8; 0x100_0001];
        let oversized_input = PagedMemory::with_data(&MemoryOptions {
            input_bytes: &big_input,
            ..MemoryOptions::default()
        });
        assert_eq!(
            oversized_input.err(),
            Some(MemoryError::MemoryLimitExceeded)
        );
        let oversized_heap = PagedMemory::with_data(&MemoryOptions {
            heap_pages: u32::MAX,
            ..MemoryOptions::default()
        });
        assert_eq!(oversized_heap.err(), Some(MemoryError::MemoryLimitExceeded));
    }
}
