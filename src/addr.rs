use core::fmt;
use core::ops::{Add, Sub};

/// Bits of offset within a page.
pub const PGSHIFT: usize = 12;

/// Bytes per page.
pub const PGSIZE: usize = 1 << PGSHIFT;

/// Bits of offset for each page table level.
pub const PLSHIFT: usize = 9;

/// Bytes per page table level.
pub const PLSIZE: usize = 1 << PLSHIFT;

/// Bit mask for page table index.
pub const PLMASK: usize = PLSIZE - 1;

/// The number of page table levels.
pub const PLNUM: usize = 3;

/// One beyond the highest possible virtual address.
/// MAXVA is actually one bit less than the max allowed by
/// Sv39, to avoid having to sign-extend virtual addresses
/// that have the high bit set.
pub const MAXVA: usize = 1 << (PLSHIFT * PLNUM + PGSHIFT - 1);

/// User code, rodata and pgalloc pages are mapped at their physical address
/// with this bit set, so they never share a root-level entry with the
/// identity-mapped kernel.
pub const USR_VIRT_OFFSET: usize = 1 << 37;

/// The user stack occupies the topmost virtual page.
pub const USER_STACK_VA: usize = MAXVA - PGSIZE;

#[inline]
pub const fn pgroundup(sz: usize) -> usize {
    sz.wrapping_add(PGSIZE).wrapping_sub(1) & !PGSIZE.wrapping_sub(1)
}

#[inline]
pub const fn pgrounddown(a: usize) -> usize {
    a & !PGSIZE.wrapping_sub(1)
}

/// Translates a physical address of user-visible memory to the address the
/// process sees through its page table.
#[inline]
pub const fn usr_virt(pa: usize) -> usize {
    pa | USR_VIRT_OFFSET
}

pub trait Addr: Copy + From<usize> + Add<usize, Output = Self> {
    fn into_usize(self) -> usize;
    fn is_null(self) -> bool;
    fn is_page_aligned(self) -> bool;
    fn page_offset(self) -> usize;
    fn round_down(self) -> Self;
}

macro_rules! define_addr_type {
    ($typ:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
        pub struct $typ(usize);

        impl From<usize> for $typ {
            fn from(value: usize) -> Self {
                Self(value)
            }
        }

        impl Add<usize> for $typ {
            type Output = Self;

            fn add(self, rhs: usize) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl Sub<$typ> for $typ {
            type Output = usize;

            fn sub(self, rhs: $typ) -> usize {
                self.0 - rhs.0
            }
        }

        impl fmt::Debug for $typ {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($typ), self.0)
            }
        }

        impl Addr for $typ {
            fn into_usize(self) -> usize {
                self.0
            }

            fn is_null(self) -> bool {
                self.0 == 0
            }

            fn is_page_aligned(self) -> bool {
                self.0 % PGSIZE == 0
            }

            fn page_offset(self) -> usize {
                self.0 % PGSIZE
            }

            fn round_down(self) -> Self {
                Self(pgrounddown(self.0))
            }
        }
    };
}

define_addr_type!(PAddr);
define_addr_type!(UVAddr);

impl UVAddr {
    /// Index of this address into the page table of the given level, where
    /// level 0 is the leaf level.
    pub fn page_table_index(self, level: usize) -> usize {
        (self.0 >> (PGSHIFT + PLSHIFT * level)) & PLMASK
    }
}
