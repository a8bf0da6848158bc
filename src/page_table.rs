use std::cmp::{min, Ordering};
use std::fmt;

use bitflags::bitflags;
use log::debug;

use crate::page_math::{self, ADDRESS_SPACE, PAGE_SIZE};
use crate::result::{MemoryError, Result};
use crate::violation::{Lookup, Violation};

bitflags! {
    /// Permissions of a single page.
    pub struct PageFlags: u8 {
        const READ =  1;
        const WRITE = 1 << 1;
    }
}

impl PageFlags {
    pub fn read_only() -> Self {
        PageFlags::READ
    }

    pub fn read_write() -> Self {
        PageFlags::READ | PageFlags::WRITE
    }

    pub fn is_writable(self) -> bool {
        self.contains(PageFlags::WRITE)
    }
}

/// One page of backing storage: a zeroed buffer of `PAGE_SIZE` bytes plus
/// its base address and permissions.
#[derive(Clone)]
pub struct Page {
    base: u32,
    flags: PageFlags,
    data: Box<[u8]>,
}

impl Page {
    fn new(base: u32, flags: PageFlags) -> Self {
        Page {
            base,
            flags,
            data: vec![0u8; PAGE_SIZE as usize].into_boxed_slice(),
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn flags(&self) -> PageFlags {
        self.flags
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// One past the last address of this page, 64 bit because the last
    /// page of the address space ends at 2^32.
    fn end(&self) -> u64 {
        u64::from(self.base) + u64::from(PAGE_SIZE)
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("base", &format_args!("{:#x}", self.base))
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

/// Pages sorted strictly ascending by base address; no two pages overlap.
/// Lookup binary-searches the sequence, allocation re-sorts it.
#[derive(Debug, Clone, Default)]
pub struct PageTable {
    pages: Vec<Page>,
}

/// Position in the sorted page sequence. Only valid until the table is
/// mutated; navigation re-indexes on every step.
#[derive(Clone, Copy)]
pub struct PageCursor<'a> {
    table: &'a PageTable,
    index: usize,
}

impl<'a> PageCursor<'a> {
    pub fn page(&self) -> &'a Page {
        &self.table.pages[self.index]
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Next page in address order, if any.
    pub fn next(&self) -> Option<PageCursor<'a>> {
        if self.index + 1 < self.table.pages.len() {
            Some(PageCursor {
                table: self.table,
                index: self.index + 1,
            })
        } else {
            None
        }
    }

    /// Next page only if it starts exactly one page above the current one.
    pub fn next_contiguous(&self) -> Option<PageCursor<'a>> {
        let next = self.next()?;
        if u64::from(next.page().base) == self.page().end() {
            Some(next)
        } else {
            None
        }
    }
}

impl PageTable {
    /// Allocate `n_pages` zeroed pages starting at `start`.
    ///
    /// `start` must be page aligned and the new range must not overlap any
    /// existing page. The sequence is re-sorted afterwards; strictly
    /// ascending order is the invariant lookup relies on.
    pub fn allocate(&mut self, start: u32, n_pages: u32, flags: PageFlags) -> Result<()> {
        if !page_math::is_page_aligned(start) {
            return Err(MemoryError::UnalignedAddress(start));
        }
        if n_pages == 0 {
            return Ok(());
        }
        let end = u64::from(start) + u64::from(n_pages) * u64::from(PAGE_SIZE);
        if end > ADDRESS_SPACE {
            return Err(MemoryError::SizeTooLarge);
        }
        // first page that ends after the new range starts
        let idx = self
            .pages
            .partition_point(|p| p.end() <= u64::from(start));
        if let Some(page) = self.pages.get(idx) {
            if u64::from(page.base) < end {
                return Err(MemoryError::PageOverlap(page.base));
            }
        }
        debug!("allocate {} pages at {:#x}", n_pages, start);
        self.pages.reserve(n_pages as usize);
        for i in 0..n_pages {
            self.pages.push(Page::new(start + i * PAGE_SIZE, flags));
        }
        self.pages.sort_by_key(|p| p.base);
        Ok(())
    }

    /// Drop every page that intersects `[start, start + n_pages * PAGE_SIZE)`.
    /// Freeing a range with no allocated pages is a no-op.
    pub fn free(&mut self, start: u32, n_pages: u32) {
        if n_pages == 0 {
            return;
        }
        let end = u64::from(start) + u64::from(n_pages) * u64::from(PAGE_SIZE);
        let before = self.pages.len();
        self.pages
            .retain(|p| p.end() <= u64::from(start) || u64::from(p.base) >= end);
        if before != self.pages.len() {
            debug!("freed {} pages at {:#x}", before - self.pages.len(), start);
        }
    }

    /// Index of the page containing `addr`, if one is allocated.
    pub fn find_index(&self, addr: u32) -> Option<usize> {
        self.pages
            .binary_search_by(|p| {
                if p.end() <= u64::from(addr) {
                    Ordering::Less
                } else if p.base > addr {
                    Ordering::Greater
                } else {
                    Ordering::Equal
                }
            })
            .ok()
    }

    /// Cursor positioned on the page containing `addr`.
    pub fn find(&self, addr: u32) -> Option<PageCursor<'_>> {
        self.find_index(addr).map(|index| PageCursor { table: self, index })
    }

    pub fn is_allocated(&self, addr: u32) -> bool {
        self.find_index(addr).is_some()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    pub(crate) fn page(&self, index: usize) -> &Page {
        &self.pages[index]
    }

    /// Copy `buf.len()` bytes starting at `addr` into `buf`, following
    /// contiguous pages across boundaries.
    pub(crate) fn load(&self, addr: u32, buf: &mut [u8]) -> Lookup<()> {
        let total = buf.len() as u32;
        let mut cursor = match self.find(addr) {
            Some(c) => c,
            None => return Err(Violation::non_allocated(addr, total)),
        };
        let mut offset = (addr - cursor.page().base) as usize;
        let mut done = 0;
        loop {
            let page = cursor.page();
            let chunk = min(buf.len() - done, PAGE_SIZE as usize - offset);
            buf[done..done + chunk].copy_from_slice(&page.data[offset..offset + chunk]);
            done += chunk;
            if done == buf.len() {
                return Ok(());
            }
            cursor = match cursor.next_contiguous() {
                Some(c) => c,
                None => return Err(Violation::non_allocated(page.end() as u32, total)),
            };
            offset = 0;
        }
    }

    /// Store for integer writes: every page the write touches (at most two)
    /// is checked for presence, contiguity and writability before any byte
    /// lands.
    pub(crate) fn store_int(&mut self, addr: u32, bytes: &[u8]) -> Lookup<()> {
        let total = bytes.len() as u32;
        let first = match self.find_index(addr) {
            Some(i) => i,
            None => return Err(Violation::non_allocated(addr, total)),
        };
        let offset = (addr - self.pages[first].base) as usize;
        let in_first = min(bytes.len(), PAGE_SIZE as usize - offset);
        if !self.pages[first].flags.is_writable() {
            let base = self.pages[first].base;
            return Err(Violation::write_protection(base, total, Some(base)));
        }
        if in_first < bytes.len() {
            let expected = self.pages[first].end();
            let second = first + 1;
            let contiguous = self
                .pages
                .get(second)
                .map_or(false, |p| u64::from(p.base) == expected);
            if !contiguous {
                return Err(Violation::non_allocated(expected as u32, total));
            }
            if !self.pages[second].flags.is_writable() {
                let base = self.pages[second].base;
                return Err(Violation::write_protection(base, total, Some(base)));
            }
            let rest = bytes.len() - in_first;
            self.pages[second].data[..rest].copy_from_slice(&bytes[in_first..]);
        }
        self.pages[first].data[offset..offset + in_first].copy_from_slice(&bytes[..in_first]);
        Ok(())
    }

    /// Streaming store for slice writes: each page is checked as it is
    /// first touched and bytes land before later pages are looked at, so a
    /// fault leaves every earlier page modified.
    pub(crate) fn store_stream(&mut self, addr: u32, bytes: &[u8], check_write: bool) -> Lookup<()> {
        let total = bytes.len() as u32;
        let mut index = match self.find_index(addr) {
            Some(i) => i,
            None => return Err(Violation::non_allocated(addr, total)),
        };
        let mut offset = (addr - self.pages[index].base) as usize;
        let mut done = 0;
        loop {
            let page = &mut self.pages[index];
            if check_write && !page.flags.is_writable() {
                let base = page.base;
                return Err(Violation::write_protection(base, total, Some(base)));
            }
            let chunk = min(bytes.len() - done, PAGE_SIZE as usize - offset);
            page.data[offset..offset + chunk].copy_from_slice(&bytes[done..done + chunk]);
            done += chunk;
            if done == bytes.len() {
                return Ok(());
            }
            let expected = self.pages[index].end();
            index += 1;
            let contiguous = self
                .pages
                .get(index)
                .map_or(false, |p| u64::from(p.base) == expected);
            if !contiguous {
                return Err(Violation::non_allocated(expected as u32, total));
            }
            offset = 0;
        }
    }
}
