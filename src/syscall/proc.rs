use arrayvec::ArrayVec;
use zerocopy::AsBytes;

use super::SysRet;
use crate::{
    abi::{ProcInfo, SysInfo},
    addr::{usr_virt, Addr, PAddr, UVAddr},
    error::Errno,
    exec::Args,
    hal::Hal,
    kalloc::PageFlags,
    param::{MAXARG, MAXARGLEN, MAXPATH, NPROC},
    proc::{KernelCtx, Pid, Procstate},
    vm::PteFlags,
};

/// Table pages a fresh user mapping may need besides the page itself.
const MAP_TABLE_PAGES: usize = 2;

impl<H: Hal> KernelCtx<'_, H> {
    /// Power-cycle the machine. No return.
    pub fn sys_restart(&self) -> Result<SysRet, Errno> {
        self.kernel().hal().restart();
        Ok(SysRet::Halted)
    }

    /// Terminate the current process; status reported to wait(). No return.
    pub fn sys_exit(&self) -> Result<SysRet, Errno> {
        let status = self.arg_int(0);
        self.kernel().procs().exit_current(status, self);
        Ok(SysRet::Exited)
    }

    /// Create a process.
    /// Returns Ok(child’s PID) on success.
    pub fn sys_fork(&self) -> Result<SysRet, Errno> {
        Ok(SysRet::Value(self.kernel().procs().fork(self)? as _))
    }

    /// Wait for a child to exit, or for the condition at `a0`.
    /// Returns Ok(child’s PID), or Ok(0) for a condition.
    pub fn sys_wait(&self) -> Result<SysRet, Errno> {
        let cond = self.arg_addr(0);
        self.kernel().procs().wait(cond, self)
    }

    /// Load a program and execute it with arguments.
    /// Returns Ok(argc), which the new program finds in `a0`.
    pub fn sys_execv(&self) -> Result<SysRet, Errno> {
        let mut path = [0; MAXPATH];
        let name = self.fetch_str(self.arg_addr(0), &mut path)?;

        let uargv = self.arg_addr(1);
        let mut args = Args::new();
        if !uargv.is_null() {
            for i in 0..=MAXARG {
                let uarg: usize = self.copy_in_obj(uargv + i * core::mem::size_of::<usize>())?;
                if uarg == 0 {
                    break;
                }
                let mut buf = [0; MAXARGLEN];
                let arg = self.fetch_str(UVAddr::from(uarg), &mut buf)?;
                args.push(arg.as_bytes())?;
            }
        }
        self.exec(name, &args)
    }

    /// Return the current process’s PID.
    pub fn sys_getpid(&self) -> Result<SysRet, Errno> {
        Ok(SysRet::Value(self.pid() as _))
    }

    /// Memory and process counters.
    pub fn sys_sysinfo(&self) -> Result<SysRet, Errno> {
        let kernel = self.kernel();
        let layout = kernel.hal().layout();
        let mut info = SysInfo {
            procs: kernel.procs().num_procs() as u64,
            unclaimed_start: layout.kernel_data.end as u64,
            unclaimed_end: layout.pool_start as u64,
            ..SysInfo::default()
        };
        {
            let kmem = kernel.kmem().lock();
            info.totalram = kmem.num_pages() as u64;
            info.freeram = kmem.count_free() as u64;
        }
        self.copy_out_obj(self.arg_addr(0), &info)?;
        Ok(SysRet::Value(0))
    }

    /// Pause for the given number of milliseconds.
    /// Returns Ok(0) once the deadline passed.
    pub fn sys_sleep(&self) -> Result<SysRet, Errno> {
        let ms = self.arg(0) as u32;
        Ok(SysRet::Blocked(self.sleep(ms as u64)))
    }

    /// Fill the array at `a0` with the pids of every process in the table.
    /// It must have room for the whole table.
    /// Returns Ok(number of pids).
    pub fn sys_plist(&self) -> Result<SysRet, Errno> {
        let out = self.arg_addr(0);
        let size = self.arg(1) as u32 as usize;
        if size < NPROC {
            return Err(Errno::EINVAL);
        }

        let mut pids = ArrayVec::<Pid, NPROC>::new();
        {
            let _table = self.kernel().procs().lock();
            for p in self.kernel().procs().iter() {
                let p = p.lock();
                if p.state != Procstate::Available {
                    pids.push(p.pid);
                }
            }
        }
        self.copy_out(out, pids.as_slice().as_bytes())?;
        Ok(SysRet::Value(pids.len()))
    }

    pub fn sys_pinfo(&self) -> Result<SysRet, Errno> {
        let pid = self.arg(0) as Pid;
        let out = self.arg_addr(1);
        let procs = self.kernel().procs();
        let slot = procs.find(pid).ok_or(Errno::ESRCH)?;
        let info = {
            let p = procs.get(slot).lock();
            ProcInfo {
                pid: p.pid,
                state: p.state as u32,
                nscheds: p.nscheds,
                name: p.name,
            }
        };
        self.copy_out_obj(out, &info)?;
        Ok(SysRet::Value(0))
    }

    /// Hand the process one more page of memory.
    /// Returns Ok(address of the page), or Ok(0) if there is none.
    pub fn sys_pgalloc(&self) -> Result<SysRet, Errno> {
        let pid = self.pid();
        let table = self.lock_proc().page_table;
        let mut kmem = self.kernel().kmem().lock();
        if table.is_some() && kmem.count_free() < MAP_TABLE_PAGES + 1 {
            return Ok(SysRet::Value(0));
        }
        let page = match kmem.allocate("pgalloc", Some(pid), PageFlags::USERMEM | PageFlags::PGALLOC) {
            Some(page) => page,
            None => return Ok(SysRet::Value(0)),
        };
        let pa = kmem.addr(page);
        match table {
            Some(table) => {
                let va = usr_virt(pa.into_usize());
                table.map(&mut kmem, pa, UVAddr::from(va), PteFlags::UDATA, Some(pid));
                Ok(SysRet::Value(va))
            }
            None => Ok(SysRet::Value(pa.into_usize())),
        }
    }

    /// Give back a page returned by pgalloc.
    pub fn sys_pgfree(&self) -> Result<SysRet, Errno> {
        let va = self.arg_addr(0);
        if !va.is_page_aligned() {
            return Err(Errno::EINVAL);
        }
        let pid = self.pid();
        let table = self.lock_proc().page_table;
        let mut kmem = self.kernel().kmem().lock();
        let pa = match table {
            Some(table) => table.translate(&kmem, va).ok_or(Errno::EINVAL)?.0,
            None => PAddr::from(va.into_usize()),
        };
        let page = kmem.page_at(pa).ok_or(Errno::EINVAL)?;
        let info = *kmem.info(page);
        if info.is_free() || !info.flags.contains(PageFlags::PGALLOC) || info.owner != Some(pid) {
            return Err(Errno::EINVAL);
        }
        if let Some(table) = table {
            let _ = table.unmap(&mut kmem, va);
        }
        kmem.release(page);
        Ok(SysRet::Value(0))
    }

    pub fn sys_gpio(&self) -> Result<SysRet, Errno> {
        let pin = self.arg(0) as u32;
        let enable = self.arg(1) as u32;
        let value = self.arg(2) as u32;
        Ok(SysRet::Value(self.kernel().hal().gpio(pin, enable, value) as usize))
    }

    /// Stop being the parent's child; nobody will wait for us.
    pub fn sys_detach(&self) -> Result<SysRet, Errno> {
        self.kernel().procs().detach(self);
        Ok(SysRet::Value(0))
    }
}
