//! Trap entry state machine.
//!
//! The assembly stub saves user registers into the hart's live
//! [`TrapFrame`], switches to the current process's kernel stack and calls
//! [`Kernel::handle_trap`]. That call runs to completion and hands back a
//! [`Resume`] telling the stub where to go next. Isolation for the next user
//! process is already installed by then.

use core::mem;

use log::{error, warn};
use static_assertions::const_assert_eq;

use crate::hal::Hal;
use crate::kernel::Kernel;
use crate::proc::{KernelCtx, Pid};
use crate::syscall::Outcome;

/// User registers saved on every trap. Field order is the stub's save
/// order.
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct TrapFrame {
    pub ra: usize,
    pub sp: usize,
    pub gp: usize,
    pub tp: usize,
    pub t0: usize,
    pub t1: usize,
    pub t2: usize,
    pub s0: usize,
    pub s1: usize,
    pub a0: usize,
    pub a1: usize,
    pub a2: usize,
    pub a3: usize,
    pub a4: usize,
    pub a5: usize,
    pub a6: usize,
    pub a7: usize,
    pub s2: usize,
    pub s3: usize,
    pub s4: usize,
    pub s5: usize,
    pub s6: usize,
    pub s7: usize,
    pub s8: usize,
    pub s9: usize,
    pub s10: usize,
    pub s11: usize,
    pub t3: usize,
    pub t4: usize,
    pub t5: usize,
    pub t6: usize,

    /// saved user program counter
    pub epc: usize,
}

const_assert_eq!(mem::size_of::<TrapFrame>(), 32 * mem::size_of::<usize>());

impl TrapFrame {
    pub const fn new() -> Self {
        Self {
            ra: 0,
            sp: 0,
            gp: 0,
            tp: 0,
            t0: 0,
            t1: 0,
            t2: 0,
            s0: 0,
            s1: 0,
            a0: 0,
            a1: 0,
            a2: 0,
            a3: 0,
            a4: 0,
            a5: 0,
            a6: 0,
            a7: 0,
            s2: 0,
            s3: 0,
            s4: 0,
            s5: 0,
            s6: 0,
            s7: 0,
            s8: 0,
            s9: 0,
            s10: 0,
            s11: 0,
            t3: 0,
            t4: 0,
            t5: 0,
            t6: 0,
            epc: 0,
        }
    }

    /// The nth syscall argument register.
    pub fn arg(&self, n: usize) -> usize {
        match n {
            0 => self.a0,
            1 => self.a1,
            2 => self.a2,
            3 => self.a3,
            4 => self.a4,
            5 => self.a5,
            _ => panic!("arg {}", n),
        }
    }
}

/// Saved registers for kernel context switches.
#[derive(Copy, Clone, Default, Debug)]
#[repr(C)]
pub struct Context {
    pub ra: usize,
    pub sp: usize,

    /// Callee-saved
    pub s0: usize,
    pub s1: usize,
    pub s2: usize,
    pub s3: usize,
    pub s4: usize,
    pub s5: usize,
    pub s6: usize,
    pub s7: usize,
    pub s8: usize,
    pub s9: usize,
    pub s10: usize,
    pub s11: usize,
}

impl Context {
    pub const fn new() -> Self {
        Self {
            ra: 0,
            sp: 0,
            s0: 0,
            s1: 0,
            s2: 0,
            s3: 0,
            s4: 0,
            s5: 0,
            s6: 0,
            s7: 0,
            s8: 0,
            s9: 0,
            s10: 0,
            s11: 0,
        }
    }

    /// A context whose stack starts at `sp`.
    pub const fn with_stack(sp: usize) -> Self {
        let mut context = Self::new();
        context.sp = sp;
        context
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TrapCause {
    /// `ecall` from user mode.
    Syscall,
    Timer,
    /// Device interrupt, routed through the interrupt controller.
    External,
    /// Fault or illegal instruction in user mode.
    UserException { scause: usize, stval: usize },
    /// Anything that went wrong in kernel mode.
    KernelException { scause: usize, sepc: usize, stval: usize },
}

impl TrapCause {
    const INTERRUPT: usize = 1 << (usize::BITS - 1);
    const ECALL_FROM_USER: usize = 8;

    /// Decodes scause. `from_user` is the previous privilege mode.
    pub fn classify(scause: usize, stval: usize, sepc: usize, from_user: bool) -> Self {
        if scause & Self::INTERRUPT != 0 {
            return match scause & !Self::INTERRUPT {
                // Software interrupts carry timer ticks forwarded from M mode.
                1 | 5 | 7 => TrapCause::Timer,
                _ => TrapCause::External,
            };
        }
        match (from_user, scause) {
            (true, Self::ECALL_FROM_USER) => TrapCause::Syscall,
            (true, _) => TrapCause::UserException { scause, stval },
            (false, _) => TrapCause::KernelException { scause, sepc, stval },
        }
    }
}

#[cfg(target_arch = "riscv64")]
impl TrapCause {
    /// Decodes the trap being taken right now from the S-mode CSRs. Boards
    /// running the kernel in M-mode classify from the M-mode ones instead.
    pub fn current() -> Self {
        use crate::arch::{r_scause, r_sepc, r_stval, trap_from_user};
        Self::classify(r_scause(), r_stval(), r_sepc(), trap_from_user())
    }
}

/// What the trap stub does after `handle_trap` returns.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Resume {
    /// Restore the live trap frame and return to user mode. The next trap
    /// enters on `kernel_sp`.
    User { pid: Pid, kernel_sp: usize },

    /// Nothing to run. Unmask interrupts on `kernel_sp` and wait; the
    /// interrupt that ends the wait arrives as a new trap.
    Idle { kernel_sp: usize },

    /// The machine is going down.
    Halt,
}

impl<H: Hal> Kernel<H> {
    /// Handles one trap on the calling hart.
    ///
    /// Interrupts stay off for the whole call.
    pub fn handle_trap(&self, cause: TrapCause) -> Resume {
        self.hal().intr_off();
        let hart = self.hal().hart_id();
        let current = self.cpu(hart).lock().proc;

        match cause {
            TrapCause::Syscall => {
                let slot = match current {
                    Some(slot) => slot,
                    None => panic!("syscall with no process on hart {}", hart),
                };
                match self.syscall(hart, slot) {
                    Outcome::Return => self.resume(slot),
                    Outcome::Switch => self.schedule(hart),
                    Outcome::Halt => Resume::Halt,
                }
            }
            TrapCause::Timer => {
                self.hal().set_timer_after(self.config().tick);
                self.schedule(hart)
            }
            TrapCause::External => {
                self.hal().route_interrupt(&mut |chan| self.mark_for_wakeup(chan));
                match current {
                    Some(slot) => self.resume(slot),
                    None => self.schedule(hart),
                }
            }
            TrapCause::UserException { scause, stval } => {
                let slot = match current {
                    Some(slot) => slot,
                    None => panic!("user exception with no process on hart {}", hart),
                };
                let pid = self.procs().get(slot).lock().pid;
                let epc = self.cpu(hart).lock().trap_frame.epc;
                warn!(
                    "pid {}: unexpected scause {:#x} epc={:#x} stval={:#x}, killed",
                    pid, scause, epc, stval
                );
                let ctx = KernelCtx::new(self, hart, slot, pid);
                self.procs().exit_current(-1, &ctx);
                self.schedule(hart)
            }
            TrapCause::KernelException { scause, sepc, stval } => {
                error!(
                    "kernel trap: scause {:#x}, sepc={:#x} stval={:#x}",
                    scause, sepc, stval
                );
                panic!("kernel trap");
            }
        }
    }

    /// Where the stub finds the live trap frame of `hart`, for sscratch.
    pub fn trap_frame_ptr(&self, hart: usize) -> *mut TrapFrame {
        let cpu = self.cpu(hart).get_mut_raw();
        // SAFETY: only the address is taken; no reference is formed.
        unsafe { core::ptr::addr_of_mut!((*cpu).trap_frame) }
    }

    /// Points sscratch at the live trap frame of the calling hart.
    #[cfg(target_arch = "riscv64")]
    pub fn install_trap_frame(&self) {
        let frame = self.trap_frame_ptr(self.hal().hart_id());
        // SAFETY: the stub only uses sscratch on the next trap from user.
        unsafe { crate::arch::w_sscratch(frame as usize) };
    }
}
