use core::ops::{Deref, DerefMut};
use core::str;

use crate::{
    file::FileId,
    lock::{Spinlock, SpinlockGuard},
    page::PageId,
    param::{MAXPROCNAME, NOFILE},
    trap::{Context, TrapFrame},
    vm::PageTable,
};

mod kernel_ctx;
mod procs;
mod sched;
mod wait_channel;

pub use kernel_ctx::*;
pub use procs::*;
pub use wait_channel::*;

pub type Pid = u32;

/// Written to word 0 of every kernel stack page and checked after each
/// syscall. A changed value means the stack ran into it.
pub const STACK_SENTINEL: u64 = 0xdead_f00d;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum Procstate {
    Available = 0,
    Ready = 1,
    Running = 2,
    Sleeping = 3,
    Zombie = 4,
}

impl Procstate {
    pub fn as_str(&self) -> &'static str {
        match self {
            Procstate::Available => "unused",
            Procstate::Ready => "ready",
            Procstate::Running => "run",
            Procstate::Sleeping => "sleep",
            Procstate::Zombie => "zombie",
        }
    }
}

/// Extra condition a sleeping process checks before it is woken.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum WakeCond {
    /// Any signal on the channel.
    Any,

    /// The channel's process has been dispatched at least this many times.
    Nscheds(u64),
}

/// How a blocked syscall finishes once its process runs again.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Completion {
    /// Reissue the syscall.
    Restart,

    /// Return this value.
    Complete(usize),
}

/// Proof that the current process went to sleep. Only
/// [`ProcGuard::sleep_on`] makes one, which consumes the guard, so no
/// process lock is held across the switch.
#[must_use]
#[derive(Debug)]
pub struct Blocked {
    _private: (),
}

/// Per-process state, protected by the process lock.
pub struct ProcData {
    pub state: Procstate,
    pub pid: Pid,
    /// `None` for the first process and for orphans.
    pub parent: Option<Pid>,
    pub name: [u8; MAXPROCNAME],

    /// Kernel stack the trap stub switches to.
    pub context: Context,

    /// User registers while the process is not on the hart.
    pub trap: TrapFrame,

    /// User stack page. Freed at exit.
    pub stack: Option<PageId>,

    /// Kernel stack page. Kept until the zombie is reaped.
    pub kstack: Option<PageId>,

    /// PMP slot fencing off `kstack`.
    pub kstack_slot: Option<usize>,

    pub page_table: Option<PageTable>,

    pub files: [Option<FileId>; NOFILE],

    /// If `Some`, sleeping on this channel.
    pub chan: Option<Channel>,
    pub wake_cond: WakeCond,

    /// Absolute time to wake up at; 0 means only an explicit wakeup will
    /// do.
    pub wakeup_time: u64,

    /// Times dispatched.
    pub nscheds: u64,

    /// Exit status.
    pub xstate: i32,
}

impl ProcData {
    pub const fn new() -> Self {
        Self {
            state: Procstate::Available,
            pid: 0,
            parent: None,
            name: [0; MAXPROCNAME],
            context: Context::new(),
            trap: TrapFrame::new(),
            stack: None,
            kstack: None,
            kstack_slot: None,
            page_table: None,
            files: [None; NOFILE],
            chan: None,
            wake_cond: WakeCond::Any,
            wakeup_time: 0,
            nscheds: 0,
            xstate: 0,
        }
    }

    pub fn set_name(&mut self, name: &str) {
        let len = name.len().min(MAXPROCNAME - 1);
        self.name = [0; MAXPROCNAME];
        self.name[..len].copy_from_slice(&name.as_bytes()[..len]);
    }

    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&c| c == 0).unwrap_or(MAXPROCNAME);
        str::from_utf8(&self.name[..len]).unwrap_or("???")
    }

    /// A free file descriptor, lowest first.
    pub fn free_fd(&self) -> Option<usize> {
        self.files.iter().position(Option::is_none)
    }
}

impl Default for ProcData {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Proc {
    inner: Spinlock<ProcData>,
}

impl Proc {
    pub const fn new() -> Self {
        Self {
            inner: Spinlock::new("proc", ProcData::new()),
        }
    }

    pub fn lock(&self) -> ProcGuard<'_> {
        ProcGuard {
            guard: self.inner.lock(),
        }
    }
}

impl Default for Proc {
    fn default() -> Self {
        Self::new()
    }
}

/// A locked process.
pub struct ProcGuard<'s> {
    guard: SpinlockGuard<'s, ProcData>,
}

impl ProcGuard<'_> {
    /// Puts the process to sleep with `frame` as its saved registers and
    /// releases the lock.
    ///
    /// `frame` must already point past the trapping instruction.
    pub fn sleep_on(
        mut self,
        chan: Option<Channel>,
        deadline: u64,
        cond: WakeCond,
        mut frame: TrapFrame,
        completion: Completion,
    ) -> Blocked {
        match completion {
            Completion::Restart => frame.epc -= 4,
            Completion::Complete(value) => frame.a0 = value,
        }
        self.trap = frame;
        self.chan = chan;
        self.wake_cond = cond;
        self.wakeup_time = deadline;
        self.state = Procstate::Sleeping;
        Blocked { _private: () }
    }

    /// Makes a sleeping process runnable again.
    pub fn wakeup(&mut self) {
        if self.state == Procstate::Sleeping {
            self.state = Procstate::Ready;
            self.chan = None;
            self.wake_cond = WakeCond::Any;
            self.wakeup_time = 0;
        }
    }
}

impl Deref for ProcGuard<'_> {
    type Target = ProcData;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for ProcGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_on_restart_rewinds_pc() {
        let proc = Proc::new();
        proc.lock().state = Procstate::Running;
        let mut frame = TrapFrame::new();
        frame.epc = 0x1004;
        frame.a0 = 9;
        let _blocked = proc.lock().sleep_on(
            Some(Channel::Console),
            0,
            WakeCond::Any,
            frame,
            Completion::Restart,
        );
        let p = proc.lock();
        assert_eq!(p.state, Procstate::Sleeping);
        assert_eq!(p.trap.epc, 0x1000);
        assert_eq!(p.trap.a0, 9);
        assert_eq!(p.chan, Some(Channel::Console));
    }

    #[test]
    fn sleep_on_complete_presets_result() {
        let proc = Proc::new();
        let mut frame = TrapFrame::new();
        frame.epc = 0x2004;
        let _blocked = proc
            .lock()
            .sleep_on(None, 55, WakeCond::Any, frame, Completion::Complete(0));
        let mut p = proc.lock();
        assert_eq!(p.trap.epc, 0x2004);
        assert_eq!(p.trap.a0, 0);
        assert_eq!(p.wakeup_time, 55);
        p.wakeup();
        assert_eq!(p.state, Procstate::Ready);
        assert_eq!(p.wakeup_time, 0);
    }

    #[test]
    fn names_are_truncated() {
        let mut data = ProcData::new();
        data.set_name("a-very-long-process-name");
        assert_eq!(data.name(), "a-very-long-pro");
        data.set_name("sh");
        assert_eq!(data.name(), "sh");
    }
}
