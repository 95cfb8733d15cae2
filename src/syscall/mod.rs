//! System call numbers and dispatch.
//!
//! `a7` holds the number and `a0`..`a2` the arguments. The result goes back
//! in `a0`; a failing call returns -1 and leaves its error in the errno word
//! of the user stack.

use core::convert::TryFrom;

use log::{error, trace, warn};

use crate::{
    error::Errno,
    hal::Hal,
    kernel::Kernel,
    proc::{Blocked, KernelCtx, STACK_SENTINEL},
};

mod file;
mod proc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Syscall {
    Restart = 0,
    Exit = 1,
    Fork = 2,
    Read = 3,
    Write = 4,
    Open = 5,
    Close = 6,
    Wait = 7,
    Execv = 11,
    Getpid = 20,
    Dup = 28,
    Pipe = 29,
    Sysinfo = 30,
    Sleep = 31,
    Plist = 32,
    Pinfo = 33,
    Pgalloc = 34,
    Pgfree = 35,
    Gpio = 36,
    Detach = 37,
    Isopen = 38,
    Pipeattch = 39,
    Lsdir = 40,
}

impl TryFrom<usize> for Syscall {
    type Error = Errno;

    fn try_from(num: usize) -> Result<Self, Self::Error> {
        Ok(match num {
            0 => Syscall::Restart,
            1 => Syscall::Exit,
            2 => Syscall::Fork,
            3 => Syscall::Read,
            4 => Syscall::Write,
            5 => Syscall::Open,
            6 => Syscall::Close,
            7 => Syscall::Wait,
            11 => Syscall::Execv,
            20 => Syscall::Getpid,
            28 => Syscall::Dup,
            29 => Syscall::Pipe,
            30 => Syscall::Sysinfo,
            31 => Syscall::Sleep,
            32 => Syscall::Plist,
            33 => Syscall::Pinfo,
            34 => Syscall::Pgalloc,
            35 => Syscall::Pgfree,
            36 => Syscall::Gpio,
            37 => Syscall::Detach,
            38 => Syscall::Isopen,
            39 => Syscall::Pipeattch,
            40 => Syscall::Lsdir,
            _ => return Err(Errno::ENOSYS),
        })
    }
}

/// What a handler did with the calling process.
#[derive(Debug)]
pub enum SysRet {
    /// Finished; the value goes to `a0`.
    Value(usize),
    /// Asleep. Its saved registers already say how the call finishes.
    Blocked(Blocked),
    /// Gone.
    Exited,
    /// The machine is going down.
    Halted,
}

/// How the trap handler continues after a syscall.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Back to the same process.
    Return,
    /// The process gave up the hart.
    Switch,
    Halt,
}

impl<H: Hal> Kernel<H> {
    /// Runs the syscall the process in `slot` trapped with. Its registers
    /// are in the live trap frame of `hart`.
    pub(crate) fn syscall(&self, hart: usize, slot: usize) -> Outcome {
        let pid = self.procs().get(slot).lock().pid;
        let ctx = KernelCtx::new(self, hart, slot, pid);
        ctx.set_errno(0);
        ctx.with_trap_frame(|tf| tf.epc += 4);

        if !ctx.user_sp_valid() {
            warn!(
                "pid {}: sp {:#x} outside of its stack page, killed",
                pid,
                ctx.trap_frame().sp
            );
            self.procs().exit_current(-1, &ctx);
            return Outcome::Switch;
        }

        let num = ctx.trap_frame().a7;
        let result = match Syscall::try_from(num) {
            Ok(call) => {
                trace!("pid {}: {:?}", pid, call);
                ctx.dispatch(call)
            }
            Err(errno) => {
                warn!("{} {}: unknown sys call {}", pid, ctx.lock_proc().name(), num);
                Err(errno)
            }
        };

        let outcome = match result {
            Ok(SysRet::Value(value)) => {
                ctx.with_trap_frame(|tf| tf.a0 = value);
                Outcome::Return
            }
            Ok(SysRet::Blocked(_)) | Ok(SysRet::Exited) => Outcome::Switch,
            Ok(SysRet::Halted) => Outcome::Halt,
            Err(errno) => {
                ctx.with_trap_frame(|tf| tf.a0 = -1isize as usize);
                ctx.set_errno(errno.code());
                Outcome::Return
            }
        };

        self.check_kstack(slot);
        outcome
    }

    /// Halts on a smashed kernel stack of the process in `slot`.
    fn check_kstack(&self, slot: usize) {
        let p = self.procs().get(slot).lock();
        if let Some(kstack) = p.kstack {
            if self.kmem().lock().frame(kstack).read_word(0) != STACK_SENTINEL {
                error!("pid {}: kernel stack sentinel overwritten", p.pid);
                panic!("kernel stack overflow");
            }
        }
    }
}

impl<H: Hal> KernelCtx<'_, H> {
    fn dispatch(&self, call: Syscall) -> Result<SysRet, Errno> {
        match call {
            Syscall::Restart => self.sys_restart(),
            Syscall::Exit => self.sys_exit(),
            Syscall::Fork => self.sys_fork(),
            Syscall::Read => self.sys_read(),
            Syscall::Write => self.sys_write(),
            Syscall::Open => self.sys_open(),
            Syscall::Close => self.sys_close(),
            Syscall::Wait => self.sys_wait(),
            Syscall::Execv => self.sys_execv(),
            Syscall::Getpid => self.sys_getpid(),
            Syscall::Dup => self.sys_dup(),
            Syscall::Pipe => self.sys_pipe(),
            Syscall::Sysinfo => self.sys_sysinfo(),
            Syscall::Sleep => self.sys_sleep(),
            Syscall::Plist => self.sys_plist(),
            Syscall::Pinfo => self.sys_pinfo(),
            Syscall::Pgalloc => self.sys_pgalloc(),
            Syscall::Pgfree => self.sys_pgfree(),
            Syscall::Gpio => self.sys_gpio(),
            Syscall::Detach => self.sys_detach(),
            Syscall::Isopen => self.sys_isopen(),
            Syscall::Pipeattch => self.sys_pipeattch(),
            Syscall::Lsdir => self.sys_lsdir(),
        }
    }
}
