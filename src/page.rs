use core::ops::{Deref, DerefMut};
use core::{fmt, mem};

use static_assertions::const_assert_eq;

use crate::addr::PGSIZE;

const WORD: usize = mem::size_of::<u64>();

/// Page type.
#[repr(C, align(4096))]
pub struct RawPage {
    inner: [u8; PGSIZE],
}

const_assert_eq!(mem::size_of::<RawPage>(), PGSIZE);
const_assert_eq!(mem::align_of::<RawPage>(), PGSIZE);

impl RawPage {
    /// Workaround for non-const `Default::default`.
    pub const DEFAULT: Self = Self { inner: [0; PGSIZE] };

    pub fn write_bytes(&mut self, value: u8) {
        self.inner.fill(value);
    }

    /// Reads the `index`th little-endian 64-bit word of the page.
    pub fn read_word(&self, index: usize) -> u64 {
        let mut bytes = [0; WORD];
        bytes.copy_from_slice(&self.inner[index * WORD..(index + 1) * WORD]);
        u64::from_le_bytes(bytes)
    }

    pub fn write_word(&mut self, index: usize, value: u64) {
        self.inner[index * WORD..(index + 1) * WORD].copy_from_slice(&value.to_le_bytes());
    }
}

impl Deref for RawPage {
    type Target = [u8; PGSIZE];

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for RawPage {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

/// Identity of a page in the allocator pool. Only the allocator turns it into
/// a physical address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(u32);

impl PageId {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page#{}", self.0)
    }
}
