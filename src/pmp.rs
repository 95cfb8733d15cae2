//! Physical memory protection, used instead of page tables on machines
//! without an MMU.
//!
//! The top five entries are programmed once at boot as a chain of
//! top-of-range regions. Everything below them is handed out at runtime to
//! fence off single pages. Entries are matched lowest index first, so a
//! runtime entry always overrides the static ranges.

use bitflags::bitflags;
use log::debug;

use crate::addr::{pgrounddown, Addr, PAddr, PGSIZE};
use crate::hal::{Hal, MemoryLayout};
use crate::param::NUM_PMP;

bitflags! {
    pub struct PmpFlags: u8 {
        const R = 1 << 0;
        const W = 1 << 1;
        const X = 1 << 2;
        /// Address mode: top of range.
        const TOR = 1 << 3;
        /// Address mode: naturally aligned four-byte region.
        const NA4 = 2 << 3;
        /// Address mode: naturally aligned power-of-two region.
        const NAPOT = 3 << 3;
        const LOCK = 1 << 7;
    }
}

/// Entries reserved for the static layout: a zero base and four ranges.
const NUM_STATIC: usize = 5;

/// NAPOT encoding of one page at `pa`: the address shifted by two, then a
/// zero followed by ones, which gives a size of 2^(ones + 3).
pub const fn napot_page(pa: usize) -> usize {
    ((pa >> 2) | ((PGSIZE - 1) >> 3)) & !(PGSIZE >> 3)
}

#[derive(Clone, Debug)]
pub struct PmpConfig {
    addrs: [usize; NUM_PMP],
    cfgs: [u8; NUM_PMP],
    num_dynamic: usize,
}

impl PmpConfig {
    pub const fn new() -> Self {
        Self {
            addrs: [0; NUM_PMP],
            cfgs: [0; NUM_PMP],
            num_dynamic: 0,
        }
    }

    /// Splits RAM into the static ranges and programs the hardware.
    /// Returns the end of usable RAM.
    ///
    /// ```text
    /// [0 .. user text)               ---  kernel code
    /// [user text .. rodata end)      R-X  user code
    /// [rodata end .. pool start)     ---  kernel data
    /// [pool start .. RAM end)        RW-  page pool
    /// ```
    pub fn init<H: Hal>(&mut self, layout: &MemoryLayout, hal: &H) -> PAddr {
        *self = Self::new();
        let ram_end = pgrounddown(layout.ram_end);
        let top = NUM_PMP - NUM_STATIC;
        self.num_dynamic = top;

        let ranges = [
            (layout.user_text.start, PmpFlags::TOR),
            (layout.user_rodata.end, PmpFlags::TOR | PmpFlags::X | PmpFlags::R),
            (layout.pool_start, PmpFlags::TOR),
            (ram_end, PmpFlags::TOR | PmpFlags::R | PmpFlags::W),
        ];
        // Entry `top` stays OFF with address 0, the base of the first range.
        for (i, (end, flags)) in ranges.iter().enumerate() {
            self.addrs[top + 1 + i] = end >> 2;
            self.cfgs[top + 1 + i] = flags.bits();
        }
        self.apply(hal);
        PAddr::from(ram_end)
    }

    /// Number of entries available for `isolate`.
    pub fn num_dynamic(&self) -> usize {
        self.num_dynamic
    }

    pub fn entry(&self, index: usize) -> (usize, PmpFlags) {
        (self.addrs[index], PmpFlags::from_bits_truncate(self.cfgs[index]))
    }

    /// Denies all user access to the page at `page`. Returns the slot used,
    /// or `None` if every dynamic slot is taken.
    pub fn isolate<H: Hal>(&mut self, page: PAddr, hal: &H) -> Option<usize> {
        let slot = self.cfgs[..self.num_dynamic].iter().position(|&cfg| cfg == 0)?;
        self.addrs[slot] = napot_page(page.into_usize());
        self.cfgs[slot] = PmpFlags::NAPOT.bits();
        self.apply(hal);
        debug!("pmp: isolated {:?} in slot {}", page, slot);
        Some(slot)
    }

    /// Returns `slot` to the free set and flushes instruction fetch, since the
    /// page may hold code about to run.
    pub fn unisolate<H: Hal>(&mut self, slot: usize, hal: &H) {
        assert!(slot < self.num_dynamic, "unisolate: static slot {}", slot);
        self.addrs[slot] = 0;
        self.cfgs[slot] = 0;
        self.apply(hal);
        hal.fence_i();
    }

    pub fn apply<H: Hal>(&self, hal: &H) {
        hal.write_pmp(&self.addrs, &self.cfgs);
    }
}

impl Default for PmpConfig {
    fn default() -> Self {
        Self::new()
    }
}
