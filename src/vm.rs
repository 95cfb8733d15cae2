//! Sv39 page tables.
//!
//! Tables live in pooled pages and are addressed by [`PageId`]; entries are
//! read and written as little-endian words of the backing frame. A non-leaf
//! entry carries the `OWNED` software bit iff the subtree below it belongs
//! to the table being walked. Entries copied from the kernel table lack it,
//! so teardown never frees shared kernel structure.

use bitflags::bitflags;
use num_iter::range_step;

use crate::addr::{pgrounddown, pgroundup, usr_virt, Addr, PAddr, UVAddr, PGSHIFT, PLNUM, PLSHIFT, PLSIZE};
use crate::hal::MemoryLayout;
use crate::kalloc::{Kmem, PageFlags};
use crate::page::PageId;
use crate::proc::Pid;

bitflags! {
    pub struct PteFlags: u64 {
        /// valid
        const V = 1 << 0;
        /// readable
        const R = 1 << 1;
        /// writable
        const W = 1 << 2;
        /// executable
        const X = 1 << 3;
        /// user-accessible
        const U = 1 << 4;
        const G = 1 << 5;
        /// accessed
        const A = 1 << 6;
        /// dirty
        const D = 1 << 7;
        /// Software bit: the subtree below this non-leaf entry is owned by
        /// this table.
        const OWNED = 1 << 8;
    }
}

impl PteFlags {
    pub const KCODE: Self = Self::from_bits_truncate(Self::R.bits | Self::X.bits);
    pub const KRODATA: Self = Self::R;
    pub const KDATA: Self = Self::from_bits_truncate(Self::R.bits | Self::W.bits);
    pub const UCODE: Self = Self::from_bits_truncate(Self::KCODE.bits | Self::U.bits);
    pub const URODATA: Self = Self::from_bits_truncate(Self::R.bits | Self::U.bits);
    pub const UDATA: Self = Self::from_bits_truncate(Self::KDATA.bits | Self::U.bits);

    const ACCESS: Self = Self::from_bits_truncate(Self::R.bits | Self::W.bits | Self::X.bits);
}

const PPN_SHIFT: usize = 10;
const PPN_MASK: u64 = (1 << 44) - 1;

#[derive(Clone, Copy, PartialEq, Eq, Default)]
struct Pte(u64);

impl Pte {
    fn table(pa: PAddr, owned: bool) -> Self {
        let flags = if owned {
            PteFlags::V | PteFlags::OWNED
        } else {
            PteFlags::V
        };
        Self(Self::ppn(pa) | flags.bits())
    }

    fn leaf(pa: PAddr, perm: PteFlags) -> Self {
        let flags = (perm & !PteFlags::OWNED) | PteFlags::V | PteFlags::A | PteFlags::D;
        Self(Self::ppn(pa) | flags.bits())
    }

    fn ppn(pa: PAddr) -> u64 {
        ((pa.into_usize() >> PGSHIFT) as u64) << PPN_SHIFT
    }

    fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    fn addr(self) -> PAddr {
        PAddr::from((((self.0 >> PPN_SHIFT) & PPN_MASK) as usize) << PGSHIFT)
    }

    fn is_valid(self) -> bool {
        self.flags().contains(PteFlags::V)
    }

    fn is_leaf(self) -> bool {
        self.is_valid() && self.flags().intersects(PteFlags::ACCESS)
    }

    fn is_table(self) -> bool {
        self.is_valid() && !self.flags().intersects(PteFlags::ACCESS)
    }

    fn is_owned_table(self) -> bool {
        self.is_table() && self.flags().contains(PteFlags::OWNED)
    }
}

fn read_pte(kmem: &Kmem, table: PageId, index: usize) -> Pte {
    Pte(kmem.frame(table).read_word(index))
}

fn write_pte(kmem: &mut Kmem, table: PageId, index: usize, pte: Pte) {
    kmem.frame_mut(table).write_word(index, pte.0);
}

/// The pooled page a non-leaf entry points to. Anything else means the
/// table is corrupt.
fn next_table(kmem: &Kmem, pte: Pte) -> PageId {
    match kmem.page_at(pte.addr()) {
        Some(id) => id,
        None => panic!("vm: page table points outside the pool: {:?}", pte.addr()),
    }
}

/// Size of the region a leaf at `level` covers.
const fn level_size(level: usize) -> usize {
    1 << (PGSHIFT + PLSHIFT * level)
}

/// A page-table root. Copyable handle; the pages belong to [`Kmem`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageTable {
    root: PageId,
}

impl PageTable {
    /// Allocates an empty table charged to `owner`.
    pub fn new(kmem: &mut Kmem, owner: Option<Pid>) -> Option<Self> {
        let root = kmem.kalloc("pagetable", owner)?;
        Some(Self { root })
    }

    pub fn root(&self) -> PageId {
        self.root
    }

    /// Value for the satp register selecting this table in Sv39 mode.
    pub fn satp(&self, kmem: &Kmem) -> usize {
        const SATP_SV39: usize = 8 << 60;
        SATP_SV39 | (kmem.addr(self.root).into_usize() >> PGSHIFT)
    }

    /// Builds the kernel table: identity maps of the kernel image, every
    /// pooled page and every device register page.
    pub fn new_kernel(kmem: &mut Kmem, layout: &MemoryLayout) -> Option<Self> {
        let table = Self::new(kmem, None)?;
        table.map_range(kmem, &layout.kernel_text, PteFlags::KCODE, None);
        table.map_range(kmem, &layout.user_text, PteFlags::KCODE, None);
        table.map_range(kmem, &layout.user_rodata, PteFlags::KRODATA, None);
        table.map_range(kmem, &layout.kernel_data, PteFlags::KDATA, None);
        let pool = kmem.base().into_usize()..kmem.end().into_usize();
        table.map_range(kmem, &pool, PteFlags::KDATA, None);
        for &mmio in layout.mmio {
            let pa = pgrounddown(mmio);
            table.map(kmem, PAddr::from(pa), UVAddr::from(pa), PteFlags::KDATA, None);
        }
        Some(table)
    }

    /// Builds a process table: the kernel's top-level links (weak, never
    /// freed through the process) plus user views of code and rodata.
    pub fn new_user(
        kmem: &mut Kmem,
        kernel: &PageTable,
        layout: &MemoryLayout,
        pid: Pid,
    ) -> Option<Self> {
        let table = Self::new(kmem, Some(pid))?;
        for index in 0..PLSIZE {
            let pte = read_pte(kmem, kernel.root, index);
            if pte.is_table() {
                write_pte(kmem, table.root, index, Pte::table(pte.addr(), false));
            }
        }
        table.map_user_range(kmem, &layout.user_text, PteFlags::UCODE, pid);
        table.map_user_range(kmem, &layout.user_rodata, PteFlags::URODATA, pid);
        Some(table)
    }

    /// Identity-maps every page overlapping `range`.
    fn map_range(
        &self,
        kmem: &mut Kmem,
        range: &core::ops::Range<usize>,
        perm: PteFlags,
        owner: Option<Pid>,
    ) {
        let page = 1 << PGSHIFT;
        for pa in range_step(pgrounddown(range.start), pgroundup(range.end), page) {
            self.map(kmem, PAddr::from(pa), UVAddr::from(pa), perm, owner);
        }
    }

    fn map_user_range(
        &self,
        kmem: &mut Kmem,
        range: &core::ops::Range<usize>,
        perm: PteFlags,
        pid: Pid,
    ) {
        let page = 1 << PGSHIFT;
        for pa in range_step(pgrounddown(range.start), pgroundup(range.end), page) {
            self.map(kmem, PAddr::from(pa), UVAddr::from(usr_virt(pa)), perm, Some(pid));
        }
    }

    /// Installs a leaf mapping `va -> pa`, allocating intermediate tables
    /// charged to `owner`. An existing leaf at `va` is overwritten.
    ///
    /// Running out of pages mid-walk is fatal.
    pub fn map(&self, kmem: &mut Kmem, pa: PAddr, va: UVAddr, perm: PteFlags, owner: Option<Pid>) {
        let mut table = self.root;
        for level in (1..PLNUM).rev() {
            let index = va.page_table_index(level);
            let pte = read_pte(kmem, table, index);
            if pte.is_leaf() {
                panic!("map: superpage in the way of {:?}", va);
            }
            if pte.is_valid() {
                if owner.is_some() && !pte.is_owned_table() {
                    panic!("map: {:?} lands in a shared kernel table", va);
                }
                table = next_table(kmem, pte);
            } else {
                let next = match kmem.kalloc("pagetable", owner) {
                    Some(next) => next,
                    None => {
                        log::error!("map: no page for a table level at {:?}", va);
                        panic!("out of memory");
                    }
                };
                let next_pa = kmem.addr(next);
                write_pte(kmem, table, index, Pte::table(next_pa, owner.is_some()));
                table = next;
            }
        }
        write_pte(kmem, table, va.page_table_index(0), Pte::leaf(pa, perm));
    }

    /// Removes the leaf mapping for `va`, returning what it pointed to. Table
    /// pages are kept.
    pub fn unmap(&self, kmem: &mut Kmem, va: UVAddr) -> Option<PAddr> {
        let (table, index) = self.leaf_slot(kmem, va)?;
        let pte = read_pte(kmem, table, index);
        if !pte.is_leaf() {
            return None;
        }
        write_pte(kmem, table, index, Pte::default());
        Some(pte.addr())
    }

    /// Level-0 table and index holding the leaf for `va`, if that far exists.
    fn leaf_slot(&self, kmem: &Kmem, va: UVAddr) -> Option<(PageId, usize)> {
        let mut table = self.root;
        for level in (1..PLNUM).rev() {
            let pte = read_pte(kmem, table, va.page_table_index(level));
            if !pte.is_table() {
                return None;
            }
            table = kmem.page_at(pte.addr())?;
        }
        Some((table, va.page_table_index(0)))
    }

    /// Looks up `va`, stopping at the first leaf. Returns the physical
    /// address including the offset of `va` within the leaf, and the leaf's
    /// permissions.
    pub fn translate(&self, kmem: &Kmem, va: UVAddr) -> Option<(PAddr, PteFlags)> {
        let mut table = self.root;
        for level in (0..PLNUM).rev() {
            let pte = read_pte(kmem, table, va.page_table_index(level));
            if !pte.is_valid() {
                return None;
            }
            if pte.is_leaf() {
                let offset = va.into_usize() & (level_size(level) - 1);
                return Some((pte.addr() + offset, pte.flags()));
            }
            if level == 0 {
                return None;
            }
            table = kmem.page_at(pte.addr())?;
        }
        None
    }

    /// Like `translate`, but only succeeds for user-accessible leaves that
    /// also allow writing when `write` is set.
    pub fn translate_user(&self, kmem: &Kmem, va: UVAddr, write: bool) -> Option<PAddr> {
        let (pa, flags) = self.translate(kmem, va)?;
        if !flags.contains(PteFlags::U) || (write && !flags.contains(PteFlags::W)) {
            return None;
        }
        Some(pa)
    }

    /// Copies every user-accessible leaf of `self` into `dst`, sharing the
    /// frames. Pages from `pgalloc` stay private to their owner and are not
    /// copied. New intermediate tables are charged to `owner`.
    pub fn copy_user(&self, kmem: &mut Kmem, dst: &PageTable, owner: Pid) {
        copy_level(kmem, self.root, PLNUM - 1, 0, dst, owner);
    }

    /// Frees every table page in owned subtrees, then the root. Leaf frames
    /// are left alone; they belong to whoever allocated them.
    pub fn free(self, kmem: &mut Kmem) {
        free_level(kmem, self.root, PLNUM - 1);
    }
}

fn copy_level(kmem: &mut Kmem, table: PageId, level: usize, base: usize, dst: &PageTable, owner: Pid) {
    for index in 0..PLSIZE {
        let pte = read_pte(kmem, table, index);
        let va = base | (index << (PGSHIFT + PLSHIFT * level));
        if level > 0 && pte.is_owned_table() {
            let next = next_table(kmem, pte);
            copy_level(kmem, next, level - 1, va, dst, owner);
        } else if level == 0 && pte.is_leaf() && pte.flags().contains(PteFlags::U) {
            let private = kmem
                .page_at(pte.addr())
                .map_or(false, |page| kmem.info(page).flags.contains(PageFlags::PGALLOC));
            if private {
                continue;
            }
            let perm = pte.flags() & !(PteFlags::V | PteFlags::A | PteFlags::D);
            dst.map(kmem, pte.addr(), UVAddr::from(va), perm, Some(owner));
        }
    }
}

fn free_level(kmem: &mut Kmem, table: PageId, level: usize) {
    if level > 0 {
        for index in 0..PLSIZE {
            let pte = read_pte(kmem, table, index);
            if pte.is_owned_table() {
                let next = next_table(kmem, pte);
                free_level(kmem, next, level - 1);
            }
        }
    }
    kmem.release(table);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::{PGSIZE, USER_STACK_VA};
    use crate::kalloc::PageFlags;
    use crate::testutil::{leak_frames, test_layout, POOL_BASE};

    fn kmem(n: usize) -> Kmem {
        Kmem::new(leak_frames(n), PAddr::from(POOL_BASE))
    }

    #[test]
    fn map_then_translate_every_offset() {
        let mut kmem = kmem(16);
        let table = PageTable::new(&mut kmem, Some(1)).unwrap();
        let frame = kmem.allocate("test", Some(1), PageFlags::USERMEM).unwrap();
        let pa = kmem.addr(frame);
        let va = UVAddr::from(USER_STACK_VA);
        table.map(&mut kmem, pa, va, PteFlags::UDATA, Some(1));

        for offset in [0, 1, 0x123, PGSIZE - 1] {
            let (got, flags) = table.translate(&kmem, va + offset).unwrap();
            assert_eq!(got, pa + offset);
            assert!(flags.contains(PteFlags::U | PteFlags::W | PteFlags::R));
        }
        assert!(table.translate(&kmem, va + PGSIZE).is_none());
        assert!(table.translate(&kmem, UVAddr::from(USER_STACK_VA - PGSIZE)).is_none());
    }

    #[test]
    fn remap_overwrites_previous_leaf() {
        let mut kmem = kmem(16);
        let table = PageTable::new(&mut kmem, Some(1)).unwrap();
        let va = UVAddr::from(0x4000_0000);
        table.map(&mut kmem, PAddr::from(0x8000_0000), va, PteFlags::UDATA, Some(1));
        table.map(&mut kmem, PAddr::from(0x8000_5000), va, PteFlags::URODATA, Some(1));
        let (pa, flags) = table.translate(&kmem, va).unwrap();
        assert_eq!(pa, PAddr::from(0x8000_5000));
        assert!(!flags.contains(PteFlags::W));
    }

    #[test]
    fn translate_user_checks_permissions() {
        let mut kmem = kmem(16);
        let table = PageTable::new(&mut kmem, Some(1)).unwrap();
        let ro = UVAddr::from(0x1000);
        let kernel_only = UVAddr::from(0x2000);
        table.map(&mut kmem, PAddr::from(0x8000_0000), ro, PteFlags::URODATA, Some(1));
        table.map(&mut kmem, PAddr::from(0x8000_1000), kernel_only, PteFlags::KDATA, Some(1));
        assert!(table.translate_user(&kmem, ro, false).is_some());
        assert!(table.translate_user(&kmem, ro, true).is_none());
        assert!(table.translate_user(&kmem, kernel_only, false).is_none());
    }

    #[test]
    fn unmap_clears_leaf() {
        let mut kmem = kmem(16);
        let table = PageTable::new(&mut kmem, Some(1)).unwrap();
        let va = UVAddr::from(0x7000);
        table.map(&mut kmem, PAddr::from(0x8000_3000), va, PteFlags::UDATA, Some(1));
        assert_eq!(table.unmap(&mut kmem, va), Some(PAddr::from(0x8000_3000)));
        assert!(table.translate(&kmem, va).is_none());
        assert_eq!(table.unmap(&mut kmem, va), None);
    }

    #[test]
    fn user_table_shares_kernel_links_and_frees_only_its_own() {
        let layout = test_layout();
        let mut kmem = kmem(32);
        let kernel = PageTable::new_kernel(&mut kmem, &layout).unwrap();
        let kernel_pages = kmem.num_pages() - kmem.count_free();

        let user = PageTable::new_user(&mut kmem, &kernel, &layout, 5).unwrap();
        let stack = kmem.allocate("stack", Some(5), PageFlags::USERMEM).unwrap();
        let stack_pa = kmem.addr(stack);
        user.map(&mut kmem, stack_pa, UVAddr::from(USER_STACK_VA), PteFlags::UDATA, Some(5));

        // Kernel code is reachable through the shared links.
        let text = layout.kernel_text.start;
        assert_eq!(
            user.translate(&kmem, UVAddr::from(text)).map(|(pa, _)| pa),
            Some(PAddr::from(text))
        );
        // User code shows up at its translated address.
        let utext = layout.user_text.start;
        let (pa, flags) = user.translate(&kmem, UVAddr::from(usr_virt(utext))).unwrap();
        assert_eq!(pa, PAddr::from(utext));
        assert!(flags.contains(PteFlags::U | PteFlags::X));

        user.free(&mut kmem);
        kmem.release(stack);
        assert_eq!(kmem.num_pages() - kmem.count_free(), kernel_pages);
        assert_eq!(kmem.count_owned(5), 0);
        assert_eq!(
            kernel.translate(&kmem, UVAddr::from(text)).map(|(pa, _)| pa),
            Some(PAddr::from(text))
        );
    }

    #[test]
    fn copy_user_shares_frames() {
        let layout = test_layout();
        let mut kmem = kmem(32);
        let kernel = PageTable::new_kernel(&mut kmem, &layout).unwrap();
        let parent = PageTable::new_user(&mut kmem, &kernel, &layout, 1).unwrap();
        let page = kmem.allocate("user", Some(1), PageFlags::USERMEM).unwrap();
        let pa = kmem.addr(page);
        let va = UVAddr::from(usr_virt(pa.into_usize()));
        parent.map(&mut kmem, pa, va, PteFlags::UDATA, Some(1));

        let child = PageTable::new(&mut kmem, Some(2)).unwrap();
        parent.copy_user(&mut kmem, &child, 2);
        assert_eq!(child.translate_user(&kmem, va, true), Some(pa));
        let utext = layout.user_text.start;
        assert_eq!(
            child.translate_user(&kmem, UVAddr::from(usr_virt(utext)), false),
            Some(PAddr::from(utext))
        );
        // Kernel-only identity mappings are not copied.
        assert!(child
            .translate(&kmem, UVAddr::from(layout.kernel_text.start))
            .is_none());
    }

    #[test]
    fn copy_user_leaves_pgalloc_pages_behind() {
        let layout = test_layout();
        let mut kmem = kmem(32);
        let kernel = PageTable::new_kernel(&mut kmem, &layout).unwrap();
        let parent = PageTable::new_user(&mut kmem, &kernel, &layout, 1).unwrap();
        let page = kmem
            .allocate("pgalloc", Some(1), PageFlags::USERMEM | PageFlags::PGALLOC)
            .unwrap();
        let pa = kmem.addr(page);
        let va = UVAddr::from(usr_virt(pa.into_usize()));
        parent.map(&mut kmem, pa, va, PteFlags::UDATA, Some(1));

        let child = PageTable::new(&mut kmem, Some(2)).unwrap();
        parent.copy_user(&mut kmem, &child, 2);
        assert!(child.translate(&kmem, va).is_none());
        assert_eq!(parent.translate_user(&kmem, va, true), Some(pa));
    }

    #[test]
    #[should_panic(expected = "shared kernel table")]
    fn user_mapping_into_kernel_subtree_panics() {
        let layout = test_layout();
        let mut kmem = kmem(32);
        let kernel = PageTable::new_kernel(&mut kmem, &layout).unwrap();
        let user = PageTable::new_user(&mut kmem, &kernel, &layout, 1).unwrap();
        user.map(
            &mut kmem,
            PAddr::from(0x8000_0000),
            UVAddr::from(layout.kernel_text.start),
            PteFlags::UDATA,
            Some(1),
        );
    }

    #[test]
    #[should_panic(expected = "out of memory")]
    fn walk_exhaustion_is_fatal() {
        let mut kmem = kmem(2);
        let table = PageTable::new(&mut kmem, None).unwrap();
        table.map(&mut kmem, PAddr::from(0x8000_0000), UVAddr::from(0x1000), PteFlags::KDATA, None);
    }
}
