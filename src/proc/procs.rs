use core::slice;

use array_macro::array;
use itertools::izip;
use log::debug;
use scopeguard::ScopeGuard;

use super::*;
use crate::{
    abi::{WaitCond, WAIT_COND_NSCHEDS},
    addr::{Addr, UVAddr, PGSIZE, USER_STACK_VA},
    error::Errno,
    exec::Args,
    hal::Hal,
    kalloc::PageFlags,
    kernel::{Isolation, Kernel},
    lock::{Spinlock, SpinlockGuard},
    param::{NOFILE, NPROC, NSTDFILE},
    syscall::SysRet,
    vm::PteFlags,
};

/// Pages a fresh user page table needs besides the root: one table per
/// level below it for the code window and for the stack.
const USER_TABLE_PAGES: usize = 4;

pub struct ProcTable {
    next_pid: Pid,
    /// Processes that have not exited yet.
    num_procs: usize,
}

/// Process system type containing & managing whole processes.
pub struct Procs {
    /// Must be acquired before any process lock.
    table: Spinlock<ProcTable>,
    pool: [Proc; NPROC],
}

/// The table lock, held for a table-wide scan or update.
pub struct ProcsGuard<'s> {
    procs: &'s Procs,
    table: SpinlockGuard<'s, ProcTable>,
}

impl Procs {
    pub fn new() -> Self {
        Self {
            table: Spinlock::new("ptable", ProcTable {
                next_pid: 1,
                num_procs: 0,
            }),
            pool: array![_ => Proc::new(); NPROC],
        }
    }

    pub fn lock(&self) -> ProcsGuard<'_> {
        ProcsGuard {
            procs: self,
            table: self.table.lock(),
        }
    }

    pub fn get(&self, slot: usize) -> &Proc {
        &self.pool[slot]
    }

    pub fn iter(&self) -> slice::Iter<'_, Proc> {
        self.pool.iter()
    }

    /// Slot of the live or zombie process `pid`.
    pub fn find(&self, pid: Pid) -> Option<usize> {
        self.pool.iter().position(|p| {
            let p = p.lock();
            p.state != Procstate::Available && p.pid == pid
        })
    }

    pub fn num_procs(&self) -> usize {
        self.table.lock().num_procs
    }

    /// Creates a parentless process running the linked-in program `name`
    /// with `argv = [name]`, bound to the console.
    pub fn spawn<H: Hal>(&self, kernel: &Kernel<H>, name: &str) -> Result<Pid, Errno> {
        let entry = kernel.hal().find_program(name).ok_or(Errno::ENOENT)?;
        let mut args = Args::new();
        args.push(name.as_bytes())?;

        let pid = self.lock().alloc_pid();
        let resources = kernel.alloc_resources(pid)?;
        let mut data = scopeguard::guard(ProcData::new(), |data| kernel.discard(data));
        resources.install_into(&mut data);
        data.pid = pid;
        data.set_name(name);
        if let Some(stack) = data.stack {
            data.trap = kernel.start_frame(entry, stack, &args);
        }
        for fd in data.files.iter_mut().take(NSTDFILE) {
            *fd = Some(kernel.ftable().dup(kernel.console()));
        }

        let slot = self.install(data)?;
        debug!("spawn: {} as pid {} in slot {}", name, pid, slot);
        Ok(pid)
    }

    /// Puts a fully built process in a free slot and makes it runnable. On
    /// failure the guard drops, releasing everything the process holds.
    fn install<F: FnOnce(ProcData)>(&self, data: ScopeGuard<ProcData, F>) -> Result<usize, Errno> {
        let mut table = self.lock();
        let slot = table.free_slot().ok_or(Errno::ENOMEM)?;
        let mut p = self.pool[slot].lock();
        *p = ScopeGuard::into_inner(data);
        p.state = Procstate::Ready;
        table.table.num_procs += 1;
        Ok(slot)
    }

    /// Create a new process, copying the parent.
    /// Returns Ok(new process id) on success.
    pub fn fork<H: Hal>(&self, ctx: &KernelCtx<'_, H>) -> Result<Pid, Errno> {
        let kernel = ctx.kernel();
        let pid = self.lock().alloc_pid();
        let resources = kernel.alloc_resources(pid)?;
        let mut child = scopeguard::guard(ProcData::new(), |data| kernel.discard(data));
        resources.install_into(&mut child);
        child.pid = pid;
        child.parent = Some(ctx.pid());

        let (parent_stack, parent_kstack, parent_table, parent_files, name) = {
            let p = ctx.lock_proc();
            (p.stack, p.kstack, p.page_table, p.files, p.name)
        };
        child.name = name;

        let (Some(parent_stack), Some(child_stack)) = (parent_stack, child.stack) else {
            return Err(Errno::EFAULT);
        };

        // Copy saved user registers, and cause fork to return 0 in the child.
        let mut frame = ctx.trap_frame();
        frame.a0 = 0;
        {
            let mut kmem = kernel.kmem().lock();
            kmem.copy_frame(child_stack, parent_stack);
            if let (Some(src), Some(dst)) = (parent_kstack, child.kstack) {
                kmem.copy_frame(dst, src);
            }
            match (parent_table, child.page_table) {
                (Some(parent), Some(table)) => {
                    parent.copy_user(&mut kmem, &table, pid);
                    // The copy shared the parent's stack; point it back at ours.
                    let stack_pa = kmem.addr(child_stack);
                    table.map(&mut kmem, stack_pa, UVAddr::from(USER_STACK_VA), PteFlags::UDATA, Some(pid));
                }
                _ => {
                    // The stack is used at its physical address.
                    let old = kmem.addr(parent_stack).into_usize();
                    let new = kmem.addr(child_stack).into_usize();
                    frame.sp = rebase(frame.sp, old, new);
                    frame.s0 = rebase(frame.s0, old, new);
                }
            }
        }
        child.trap = frame;

        // Increment reference counts on open file descriptors.
        for (nf, f) in izip!(child.files.iter_mut(), parent_files.iter()) {
            if let Some(file) = f {
                *nf = Some(kernel.ftable().dup(*file));
            }
        }

        let slot = self.install(child)?;
        debug!("fork: pid {} -> pid {} in slot {}", ctx.pid(), pid, slot);
        Ok(pid)
    }

    /// Without a condition, reaps an exited child and returns its pid, or
    /// blocks until one exits. With a condition, blocks until the target
    /// has been dispatched the requested number of further times.
    pub fn wait<H: Hal>(&self, cond: UVAddr, ctx: &KernelCtx<'_, H>) -> Result<SysRet, Errno> {
        let me = ctx.pid();
        if !cond.is_null() {
            let cond: WaitCond = ctx.copy_in_obj(cond)?;
            if cond.kind != WAIT_COND_NSCHEDS {
                return Err(Errno::ENOSYS);
            }
            if cond.target_pid == me {
                return Err(Errno::EINVAL);
            }
            let slot = self.find(cond.target_pid).ok_or(Errno::ESRCH)?;
            let want = {
                let target = self.pool[slot].lock();
                if target.state == Procstate::Zombie {
                    return Err(Errno::ESRCH);
                }
                target.nscheds.saturating_add(cond.want_nscheds)
            };
            let chan = Channel::Sched(cond.target_pid);
            let blocked = ctx.block(Some(chan), 0, WakeCond::Nscheds(want), Completion::Complete(0));
            return Ok(SysRet::Blocked(blocked));
        }

        {
            let _table = self.lock();
            let mut havekids = false;
            for p in self.pool.iter() {
                let mut np = p.lock();
                if np.state == Procstate::Available || np.parent != Some(me) {
                    continue;
                }
                havekids = true;
                if np.state == Procstate::Zombie {
                    let pid = np.pid;
                    ctx.kernel().reap(&mut np);
                    return Ok(SysRet::Value(pid as usize));
                }
            }

            // No point waiting if we don't have any children.
            if !havekids {
                return Err(Errno::ECHILD);
            }
        }

        let blocked = ctx.block(Some(Channel::Child(me)), 0, WakeCond::Any, Completion::Restart);
        Ok(SysRet::Blocked(blocked))
    }

    /// Exit the current process. It remains a zombie until its parent
    /// reaps it; an orphan is reaped by the scheduler once it is off the
    /// hart.
    pub fn exit_current<H: Hal>(&self, status: i32, ctx: &KernelCtx<'_, H>) {
        let kernel = ctx.kernel();
        let me = ctx.pid();

        // Stop running on the page table about to be freed.
        kernel.install_kernel_table();

        let mut files = core::mem::replace(&mut ctx.lock_proc().files, [None; NOFILE]);
        kernel.close_files(&mut files);

        let parent = {
            let mut table = self.lock();
            table.table.num_procs -= 1;

            let parent = {
                let mut p = ctx.lock_proc();
                kernel.release_user_memory(&mut p);
                p.xstate = status;
                p.state = Procstate::Zombie;
                p.parent
            };

            // Nobody can wait for our children any more.
            for (slot, p) in self.pool.iter().enumerate() {
                if slot == ctx.slot() {
                    continue;
                }
                let mut np = p.lock();
                if np.state != Procstate::Available && np.parent == Some(me) {
                    np.parent = None;
                    if np.state == Procstate::Zombie {
                        kernel.reap(&mut np);
                    }
                }
            }
            parent
        };

        debug!("exit: pid {} status {}", me, status);
        if let Some(parent) = parent {
            kernel.mark_for_wakeup(Channel::Child(parent));
        }
        // Whoever waits for our dispatch count would wait forever.
        kernel.wake_sched_waiters(me, u64::MAX);
    }

    /// Drops the link to the parent, so that nobody reaps us but the
    /// scheduler.
    pub fn detach<H: Hal>(&self, ctx: &KernelCtx<'_, H>) {
        let parent = {
            let _table = self.lock();
            ctx.lock_proc().parent.take()
        };
        if let Some(parent) = parent {
            ctx.kernel().mark_for_wakeup(Channel::Child(parent));
        }
    }
}

impl Default for Procs {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcsGuard<'_> {
    fn alloc_pid(&mut self) -> Pid {
        let pid = self.table.next_pid;
        self.table.next_pid += 1;
        pid
    }

    fn free_slot(&self) -> Option<usize> {
        self.procs
            .pool
            .iter()
            .position(|p| p.lock().state == Procstate::Available)
    }

    pub fn num_procs(&self) -> usize {
        self.table.num_procs
    }
}

/// Moves `reg` along with the stack page if it points into it.
fn rebase(reg: usize, old: usize, new: usize) -> usize {
    if (old..=old + PGSIZE).contains(&reg) {
        reg - old + new
    } else {
        reg
    }
}

/// Pages owned by a process before it is placed in the table.
pub(crate) struct ProcResources {
    stack: PageId,
    kstack: PageId,
    kstack_top: usize,
    kstack_slot: Option<usize>,
    page_table: Option<PageTable>,
}

impl ProcResources {
    fn install_into(self, data: &mut ProcData) {
        data.stack = Some(self.stack);
        data.kstack = Some(self.kstack);
        data.kstack_slot = self.kstack_slot;
        data.page_table = self.page_table;
        data.context = crate::trap::Context::with_stack(self.kstack_top);
    }
}

impl<H: Hal> Kernel<H> {
    pub(crate) fn alloc_page(
        &self,
        site: &'static str,
        owner: Option<Pid>,
        flags: PageFlags,
    ) -> Result<PageId, Errno> {
        self.kmem()
            .lock()
            .allocate(site, owner, flags)
            .ok_or(Errno::ENOMEM)
    }

    pub(crate) fn free_page(&self, page: PageId) {
        self.kmem().lock().release(page);
    }

    /// Allocates the user stack, the kernel stack and the page table or
    /// PMP slot of a new process. Nothing stays allocated on failure.
    fn alloc_resources(&self, pid: Pid) -> Result<ProcResources, Errno> {
        let stack = scopeguard::guard(
            self.alloc_page("stack", Some(pid), PageFlags::USERMEM)?,
            |page| self.free_page(page),
        );
        let kstack = scopeguard::guard(
            self.alloc_page("kstack", Some(pid), PageFlags::empty())?,
            |page| self.free_page(page),
        );
        let kstack_pa = {
            let mut kmem = self.kmem().lock();
            kmem.frame_mut(*kstack).write_word(0, STACK_SENTINEL);
            kmem.addr(*kstack)
        };

        let (page_table, kstack_slot) = match self.isolation() {
            Isolation::PageTable(kernel_table) => {
                let mut kmem = self.kmem().lock();
                if kmem.count_free() < USER_TABLE_PAGES + 1 {
                    return Err(Errno::ENOMEM);
                }
                let layout = self.hal().layout();
                let table = PageTable::new_user(&mut kmem, kernel_table, layout, pid)
                    .ok_or(Errno::ENOMEM)?;
                let stack_pa = kmem.addr(*stack);
                table.map(&mut kmem, stack_pa, UVAddr::from(USER_STACK_VA), PteFlags::UDATA, Some(pid));
                (Some(table), None)
            }
            Isolation::Pmp(pmp) => {
                let slot = pmp.lock().isolate(kstack_pa, self.hal()).ok_or(Errno::ENOMEM)?;
                (None, Some(slot))
            }
        };

        Ok(ProcResources {
            stack: ScopeGuard::into_inner(stack),
            kstack: ScopeGuard::into_inner(kstack),
            kstack_top: kstack_pa.into_usize() + PGSIZE,
            kstack_slot,
            page_table,
        })
    }

    /// Frees the user stack, the page table and what `pgalloc` handed out.
    fn release_user_memory(&self, p: &mut ProcData) {
        let mut kmem = self.kmem().lock();
        if let Some(table) = p.page_table.take() {
            table.free(&mut kmem);
        }
        if let Some(stack) = p.stack.take() {
            kmem.release(stack);
        }
        let freed = kmem.release_owned(p.pid, PageFlags::PGALLOC);
        if freed > 0 {
            debug!("pid {}: {} pgalloc pages back to the pool", p.pid, freed);
        }
    }

    fn release_kstack(&self, p: &mut ProcData) {
        if let Some(kstack) = p.kstack.take() {
            self.free_page(kstack);
        }
        if let (Some(slot), Isolation::Pmp(pmp)) = (p.kstack_slot.take(), self.isolation()) {
            pmp.lock().unisolate(slot, self.hal());
        }
    }

    pub(crate) fn close_files(&self, files: &mut [Option<FileId>; NOFILE]) {
        for file in files.iter_mut() {
            if let Some(file) = file.take() {
                self.close_file(file);
            }
        }
    }

    /// Throws away a process that never made it into the table.
    fn discard(&self, mut p: ProcData) {
        self.close_files(&mut p.files);
        self.release_user_memory(&mut p);
        self.release_kstack(&mut p);
    }

    /// Frees what is left of a zombie and returns its slot.
    pub(crate) fn reap(&self, p: &mut ProcData) {
        debug!("reap: pid {}", p.pid);
        self.release_kstack(p);
        *p = ProcData::new();
    }

    /// Reaps zombies nobody will wait for, except for the one in `except`,
    /// whose kernel stack may still be in use.
    pub(crate) fn reap_orphans(&self, except: Option<usize>) {
        let _table = self.procs().lock();
        for (slot, p) in self.procs().iter().enumerate() {
            if Some(slot) == except {
                continue;
            }
            let mut p = p.lock();
            if p.state == Procstate::Zombie && p.parent.is_none() {
                self.reap(&mut p);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebase_moves_only_stack_pointers() {
        assert_eq!(rebase(0x8010_0ff0, 0x8010_0000, 0x8020_0000), 0x8020_0ff0);
        assert_eq!(rebase(0x8010_1000, 0x8010_0000, 0x8020_0000), 0x8020_1000);
        assert_eq!(rebase(0x1234, 0x8010_0000, 0x8020_0000), 0x1234);
    }

    #[test]
    fn pids_are_monotonic() {
        let procs = Procs::new();
        let a = procs.lock().alloc_pid();
        let b = procs.lock().alloc_pid();
        assert_eq!(b, a + 1);
        assert_eq!(procs.lock().free_slot(), Some(0));
    }
}
