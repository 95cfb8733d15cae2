//! Contract with the code outside the core: boot glue, drivers, the timer
//! backend, the interrupt controller and the baked-in filesystem.
//!
//! A board implements every trait below on one value and gets [`Hal`] for
//! free. The kernel never touches a device except through these.

use core::ops::Range;

use crate::abi::Dirent;
use crate::addr::PAddr;
use crate::error::Errno;
use crate::param::NUM_PMP;
use crate::proc::Channel;

/// Physical memory map of the machine. All ranges are half-open.
#[derive(Clone, Debug)]
pub struct MemoryLayout {
    pub kernel_text: Range<usize>,
    pub user_text: Range<usize>,
    pub user_rodata: Range<usize>,
    /// Kernel data, bss and boot stack.
    pub kernel_data: Range<usize>,
    /// First byte of the page pool. Bytes between `kernel_data.end` and this
    /// are unclaimed.
    pub pool_start: usize,
    pub ram_end: usize,
    /// Device register pages the kernel must reach.
    pub mmio: &'static [usize],
}

pub trait TimeSource {
    /// Current value of the free-running timer, in ticks.
    fn now(&self) -> u64;

    /// Arms the timer interrupt `ticks` from now.
    fn set_timer_after(&self, ticks: u64);
}

pub trait InterruptControl {
    fn hart_id(&self) -> usize;

    fn intr_off(&self);

    /// Parks the hart until the next interrupt arrives.
    fn wait_for_interrupt(&self);

    /// Services a pending external interrupt. Drivers report which blocked
    /// readers may proceed through `wake`.
    fn route_interrupt(&self, wake: &mut dyn FnMut(Channel));
}

pub trait MemoryIsolation {
    fn layout(&self) -> &MemoryLayout;

    /// Makes the next return from trap drop to user mode.
    fn set_return_to_user(&self);

    /// Writes satp and flushes the TLB.
    fn install_page_table(&self, satp: usize);

    /// Writes every pmpaddr register (already shifted right by two) and the
    /// packed pmpcfg registers.
    fn write_pmp(&self, addrs: &[usize; NUM_PMP], cfgs: &[u8; NUM_PMP]);

    /// Instruction-fetch barrier.
    fn fence_i(&self);
}

pub trait Devices {
    fn console_write(&self, bytes: &[u8]);

    /// Drains buffered console input into `buf`; never blocks.
    fn console_read(&self, buf: &mut [u8]) -> usize;

    fn gpio(&self, pin: u32, enable: u32, value: u32) -> isize;

    fn restart(&self);
}

pub trait StaticImage {
    /// Contents of a baked-in file.
    fn find_file(&self, path: &str) -> Option<&'static [u8]>;

    /// Fills `out` with the entries of a baked-in directory.
    fn list_dir(&self, path: &str, out: &mut [Dirent]) -> Result<usize, Errno>;

    /// Physical entry point of a linked-in user program.
    fn find_program(&self, name: &str) -> Option<PAddr>;

    /// Reads kernel image memory outside the page pool, such as user
    /// rodata. Returns false if `pa` is not backed.
    fn read_image(&self, pa: PAddr, buf: &mut [u8]) -> bool;
}

pub trait Hal: TimeSource + InterruptControl + MemoryIsolation + Devices + StaticImage {}

impl<T> Hal for T where T: TimeSource + InterruptControl + MemoryIsolation + Devices + StaticImage {}
