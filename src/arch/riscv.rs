//! RISC-V supervisor-mode instructions.

use core::arch::asm;

use bitflags::bitflags;

use crate::param::NUM_PMP;

bitflags! {
    /// Supervisor Status Register, sstatus.
    pub struct Sstatus: usize {
        /// Previous mode, 1=Supervisor, 0=User
        const SPP = (1) << 8;

        /// Supervisor Previous Interrupt Enable
        const SPIE = (1) << 5;

        /// Supervisor Interrupt Enable
        const SIE = (1) << 1;
    }
}

impl Sstatus {
    #[inline]
    pub fn read() -> Self {
        let mut x;
        unsafe {
            asm!("csrr {x}, sstatus", x = out(reg) x);
        }
        Self::from_bits_truncate(x)
    }

    #[inline]
    pub unsafe fn write(self) {
        unsafe {
            asm!("csrw sstatus, {x}", x = in(reg) self.bits());
        }
    }
}

/// Supervisor trap cause.
#[inline]
pub fn r_scause() -> usize {
    let mut x;
    unsafe {
        asm!("csrr {x}, scause", x = out(reg) x);
    }
    x
}

/// Supervisor bad address or instruction.
#[inline]
pub fn r_stval() -> usize {
    let mut x;
    unsafe {
        asm!("csrr {x}, stval", x = out(reg) x);
    }
    x
}

#[inline]
pub fn r_sepc() -> usize {
    let mut x;
    unsafe {
        asm!("csrr {x}, sepc", x = out(reg) x);
    }
    x
}

/// Holds the address of the live trap frame while in user mode.
#[inline]
pub unsafe fn w_sscratch(x: usize) {
    unsafe {
        asm!("csrw sscratch, {x}", x = in(reg) x);
    }
}

/// Selects a page table and flushes stale translations.
#[inline]
pub unsafe fn w_satp(x: usize) {
    unsafe {
        asm!("csrw satp, {x}", x = in(reg) x);
        // The zero, zero means flush all TLB entries.
        asm!("sfence.vma zero, zero");
    }
}

/// The hart id, kept in tp by the boot code.
#[inline]
pub fn r_tp() -> usize {
    let mut x;
    unsafe {
        asm!("mv {x}, tp", x = out(reg) x);
    }
    x
}

/// Current value of the time CSR.
#[inline]
pub fn r_time() -> u64 {
    let mut x;
    unsafe {
        asm!("csrr {x}, time", x = out(reg) x);
    }
    x
}

/// Disable device interrupts.
#[inline]
pub fn intr_off() {
    let mut x = Sstatus::read();
    x.remove(Sstatus::SIE);
    // SAFETY: turning interrupt off is safe.
    unsafe { x.write() };
}

/// Makes the next `sret` drop to user mode with interrupts enabled.
#[inline]
pub fn set_return_to_user() {
    let mut x = Sstatus::read();
    x.remove(Sstatus::SPP);
    x.insert(Sstatus::SPIE);
    // SAFETY: only affects the next sret.
    unsafe { x.write() };
}

/// Did the trap being handled come from user mode?
#[inline]
pub fn trap_from_user() -> bool {
    !Sstatus::read().contains(Sstatus::SPP)
}

#[inline]
pub fn wait_for_interrupt() {
    unsafe {
        asm!("wfi");
    }
}

#[inline]
pub fn fence_i() {
    unsafe {
        asm!("fence.i");
    }
}

/// Writes a pmpaddr register. The index must be a literal in the
/// instruction, hence the table.
unsafe fn w_pmpaddr(index: usize, x: usize) {
    macro_rules! w {
        ($($n:literal),*) => {
            match index {
                $($n => unsafe { asm!(concat!("csrw pmpaddr", $n, ", {x}"), x = in(reg) x) },)*
                _ => panic!("pmpaddr{}", index),
            }
        };
    }
    w!(0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15);
}

/// Programs every PMP entry. On RV64 only the even pmpcfg registers exist,
/// each holding eight entries.
///
/// # Safety
///
/// Locks the caller out of whatever the new entries deny.
pub unsafe fn w_pmp(addrs: &[usize; NUM_PMP], cfgs: &[u8; NUM_PMP]) {
    for (index, &addr) in addrs.iter().enumerate() {
        unsafe { w_pmpaddr(index, addr) };
    }
    let pack = |entries: &[u8]| {
        entries
            .iter()
            .enumerate()
            .fold(0usize, |acc, (i, &cfg)| acc | (cfg as usize) << (8 * i))
    };
    let (low, high) = (pack(&cfgs[..8]), pack(&cfgs[8..]));
    unsafe {
        asm!("csrw pmpcfg0, {x}", x = in(reg) low);
        asm!("csrw pmpcfg2, {x}", x = in(reg) high);
    }
}
