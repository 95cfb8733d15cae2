//! Physical page allocator, for user stacks, kernel stacks, page-table pages
//! and pages handed out by `pgalloc`. Allocates whole 4096-byte pages.
//!
//! Pages live in a fixed pool laid out contiguously from `base`. A page is
//! named by its [`PageId`]; only this module turns an id into a physical
//! address and back.

use bitflags::bitflags;
use log::info;

use crate::addr::{Addr, PAddr, PGSIZE};
use crate::page::{PageId, RawPage};
use crate::param::MAX_PAGES;
use crate::proc::Pid;

bitflags! {
    pub struct PageFlags: u8 {
        const ALLOCATED = 1 << 0;
        /// User code may read and write this page.
        const USERMEM = 1 << 1;
        /// Handed out by `pgalloc`; only these may be given back by `pgfree`.
        const PGALLOC = 1 << 2;
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PageInfo {
    pub flags: PageFlags,
    /// Process charged for the page, `None` for kernel-wide pages.
    pub owner: Option<Pid>,
    /// Who allocated the page, for debugging.
    pub site: &'static str,
}

impl PageInfo {
    const FREE: Self = Self {
        flags: PageFlags::empty(),
        owner: None,
        site: "",
    };

    pub fn is_free(&self) -> bool {
        !self.flags.contains(PageFlags::ALLOCATED)
    }
}

pub struct Kmem {
    base: PAddr,
    frames: &'static mut [RawPage],
    pages: [PageInfo; MAX_PAGES],
}

impl Kmem {
    /// Creates an allocator over `frames`, whose first frame sits at physical
    /// address `base`. Frames beyond `MAX_PAGES` are left unused.
    pub fn new(frames: &'static mut [RawPage], base: PAddr) -> Self {
        assert!(base.is_page_aligned(), "Kmem::new: unaligned pool");
        let len = frames.len().min(MAX_PAGES);
        let frames = &mut frames[..len];
        info!("paged memory: start={:?}, npages={}", base, len);
        Self {
            base,
            frames,
            pages: [PageInfo::FREE; MAX_PAGES],
        }
    }

    pub fn num_pages(&self) -> usize {
        self.frames.len()
    }

    pub fn base(&self) -> PAddr {
        self.base
    }

    /// One byte past the last pooled page.
    pub fn end(&self) -> PAddr {
        self.base + self.frames.len() * PGSIZE
    }

    /// Allocate one zeroed page. First fit.
    /// Returns `None` if the pool is exhausted.
    pub fn allocate(
        &mut self,
        site: &'static str,
        owner: Option<Pid>,
        flags: PageFlags,
    ) -> Option<PageId> {
        let num_pages = self.num_pages();
        let index = self.pages[..num_pages].iter().position(PageInfo::is_free)?;
        self.pages[index] = PageInfo {
            flags: flags | PageFlags::ALLOCATED,
            owner,
            site,
        };
        self.frames[index].write_bytes(0);
        Some(PageId::new(index as u32))
    }

    /// Shorthand for a page for kernel needs.
    pub fn kalloc(&mut self, site: &'static str, owner: Option<Pid>) -> Option<PageId> {
        self.allocate(site, owner, PageFlags::empty())
    }

    /// Free the page, which must have been returned by `allocate`.
    pub fn release(&mut self, id: PageId) {
        let num_pages = self.num_pages();
        let info = match self.pages[..num_pages].get_mut(id.index()) {
            Some(info) => info,
            None => panic!("release: no such page {:?}", id),
        };
        if info.is_free() {
            panic!("release: {:?} is not allocated", id);
        }
        *info = PageInfo::FREE;
        // Fill with junk to catch dangling refs.
        self.frames[id.index()].write_bytes(1);
    }

    /// Free the page at `pa`, which must be the start of an allocated page.
    pub fn release_addr(&mut self, pa: PAddr) {
        match self.page_at(pa) {
            Some(id) if pa.is_page_aligned() => self.release(id),
            _ => panic!("release: {:?} is not a pooled page", pa),
        }
    }

    pub fn count_free(&self) -> usize {
        self.pages[..self.num_pages()]
            .iter()
            .filter(|p| p.is_free())
            .count()
    }

    /// Number of pages charged to `pid`.
    pub fn count_owned(&self, pid: Pid) -> usize {
        self.pages[..self.num_pages()]
            .iter()
            .filter(|p| !p.is_free() && p.owner == Some(pid))
            .count()
    }

    /// Frees every page charged to `owner` that carries all of `flags`.
    /// Returns how many went back to the pool.
    pub fn release_owned(&mut self, owner: Pid, flags: PageFlags) -> usize {
        let num_pages = self.num_pages();
        let mut count = 0;
        for index in 0..num_pages {
            let info = self.pages[index];
            if !info.is_free() && info.owner == Some(owner) && info.flags.contains(flags) {
                self.release(PageId::new(index as u32));
                count += 1;
            }
        }
        count
    }

    pub fn info(&self, id: PageId) -> &PageInfo {
        &self.pages[id.index()]
    }

    pub fn addr(&self, id: PageId) -> PAddr {
        self.base + id.index() * PGSIZE
    }

    /// The pooled page containing `pa`, if any.
    pub fn page_at(&self, pa: PAddr) -> Option<PageId> {
        if pa < self.base || pa >= self.end() {
            return None;
        }
        Some(PageId::new(((pa - self.base) / PGSIZE) as u32))
    }

    pub fn frame(&self, id: PageId) -> &RawPage {
        &self.frames[id.index()]
    }

    pub fn frame_mut(&mut self, id: PageId) -> &mut RawPage {
        &mut self.frames[id.index()]
    }

    /// Copies the whole contents of `src` into `dst`.
    pub fn copy_frame(&mut self, dst: PageId, src: PageId) {
        let (dst, src) = (dst.index(), src.index());
        if dst == src {
            return;
        }
        if dst < src {
            let (lo, hi) = self.frames.split_at_mut(src);
            lo[dst].copy_from_slice(&hi[0][..]);
        } else {
            let (lo, hi) = self.frames.split_at_mut(dst);
            hi[0].copy_from_slice(&lo[src][..]);
        }
    }
}
