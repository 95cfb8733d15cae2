//! Round-robin scheduler.

use log::trace;

use super::*;
use crate::{
    hal::Hal,
    kernel::{Isolation, Kernel},
    param::{NPROC, TIMEBASE_FREQ},
    trap::Resume,
};

impl<H: Hal> Kernel<H> {
    /// Per-hart scheduling pass.
    ///
    /// Takes the process that was running off the hart, then scans the
    /// table round-robin starting after the last dispatched slot. Sleepers
    /// whose deadline passed become runnable. The first runnable process
    /// found is dispatched: its saved registers become the live trap frame
    /// and its isolation is installed. With nothing to run, arms the timer
    /// and waits for an interrupt.
    pub fn schedule(&self, hart: usize) -> Resume {
        let (leaving, start) = {
            let mut cpu = self.cpu(hart).lock();
            (cpu.proc.take(), cpu.next)
        };

        if let Some(slot) = leaving {
            let mut p = self.procs().get(slot).lock();
            if p.state == Procstate::Running {
                p.state = Procstate::Ready;
                p.trap = self.cpu(hart).lock().trap_frame;
            }
        }
        self.reap_orphans(leaving);

        let now = self.hal().now();
        for i in 0..NPROC {
            let slot = (start + i) % NPROC;
            let mut p = self.procs().get(slot).lock();
            if p.state == Procstate::Sleeping && p.wakeup_time != 0 && now >= p.wakeup_time {
                p.wakeup();
            }
            if p.state != Procstate::Ready {
                continue;
            }

            p.state = Procstate::Running;
            p.nscheds += 1;
            let (pid, nscheds) = (p.pid, p.nscheds);
            {
                let mut cpu = self.cpu(hart).lock();
                cpu.trap_frame = p.trap;
                cpu.proc = Some(slot);
                cpu.next = (slot + 1) % NPROC;
            }
            drop(p);
            trace!("sched: hart {} runs pid {}", hart, pid);

            self.wake_sched_waiters(pid, nscheds);
            return self.resume(slot);
        }

        self.hal().set_timer_after(self.config().tick);
        self.hal().wait_for_interrupt();
        Resume::Idle {
            kernel_sp: self.cpu(hart).lock().context.sp,
        }
    }

    /// Installs the isolation of the process in `slot` and returns to it.
    pub(crate) fn resume(&self, slot: usize) -> Resume {
        let p = self.procs().get(slot).lock();
        match self.isolation() {
            Isolation::PageTable(kernel_table) => {
                let table = p.page_table.unwrap_or(*kernel_table);
                let satp = table.satp(&self.kmem().lock());
                self.hal().install_page_table(satp);
            }
            Isolation::Pmp(pmp) => pmp.lock().apply(self.hal()),
        }
        self.hal().set_return_to_user();
        Resume::User {
            pid: p.pid,
            kernel_sp: p.context.sp,
        }
    }

    /// Switches the hart to the kernel page table, if there is one.
    pub(crate) fn install_kernel_table(&self) {
        if let Isolation::PageTable(table) = self.isolation() {
            let satp = table.satp(&self.kmem().lock());
            self.hal().install_page_table(satp);
        }
    }

    /// Wakes up every process sleeping on `chan`.
    ///
    /// Called by drivers through the interrupt router, and by the kernel
    /// whenever a resource someone may wait for changes.
    pub fn mark_for_wakeup(&self, chan: Channel) {
        let table = self.procs().lock();
        if table.num_procs() == 0 {
            return;
        }
        for p in self.procs().iter() {
            let mut p = p.lock();
            if p.state == Procstate::Sleeping
                && p.chan == Some(chan)
                && p.wake_cond == WakeCond::Any
            {
                p.wakeup();
            }
        }
    }

    /// Wakes up processes waiting for `pid` to reach `nscheds` dispatches.
    pub(crate) fn wake_sched_waiters(&self, pid: Pid, nscheds: u64) {
        let _table = self.procs().lock();
        for p in self.procs().iter() {
            let mut p = p.lock();
            if p.state != Procstate::Sleeping || p.chan != Some(Channel::Sched(pid)) {
                continue;
            }
            if let WakeCond::Nscheds(want) = p.wake_cond {
                if nscheds >= want {
                    p.wakeup();
                }
            }
        }
    }
}

impl<H: Hal> KernelCtx<'_, H> {
    /// Sleeps on `chan` until someone calls `mark_for_wakeup` on it.
    pub fn yield_on(&self, chan: Channel, completion: Completion) -> Blocked {
        self.block(Some(chan), 0, WakeCond::Any, completion)
    }

    /// Sleeps for `ms` milliseconds. Woken only by the deadline.
    pub fn sleep(&self, ms: u64) -> Blocked {
        let ticks = ms.saturating_mul(TIMEBASE_FREQ / 1000);
        // Zero would mean "no deadline".
        let deadline = self.kernel().hal().now().saturating_add(ticks).max(1);
        self.block(None, deadline, WakeCond::Any, Completion::Complete(0))
    }
}
