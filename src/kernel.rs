//! The kernel state object and boot.

use array_macro::array;
use log::{info, LevelFilter};

use crate::{
    addr::{Addr, PAddr, PGSIZE},
    cpu::Cpu,
    error::Errno,
    file::{File, FileId, FileKind, FileTable},
    hal::Hal,
    kalloc::Kmem,
    lock::Spinlock,
    page::RawPage,
    param::{NHART, SCHED_TICK},
    pipe::Pipes,
    pmp::PmpConfig,
    proc::{Pid, Procs},
    trap::{Context, Resume},
    vm::PageTable,
};

/// How processes are kept apart.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IsolationMode {
    /// Sv39 page table per process.
    PageTable,
    /// No MMU; user code runs on physical addresses fenced by PMP.
    ///
    /// PMP only fences the kernel's own ranges from a lower privilege, so
    /// the board runs the kernel in M-mode. Its trap stub must pass the
    /// M-mode trap state (`mcause`, `mtval`, `mepc` and `mstatus.MPP`) to
    /// [`TrapCause::classify`](crate::trap::TrapCause::classify).
    Pmp,
}

#[derive(Clone, Copy, Debug)]
pub struct KernelConfig {
    pub isolation: IsolationMode,
    /// Timer ticks between scheduler passes.
    pub tick: u64,
    pub log_level: LevelFilter,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            isolation: IsolationMode::PageTable,
            tick: SCHED_TICK,
            log_level: LevelFilter::Info,
        }
    }
}

/// Isolation state shared by every process.
pub enum Isolation {
    /// The kernel page table. Every process table links to its top level.
    PageTable(PageTable),
    Pmp(Spinlock<PmpConfig>),
}

/// The kernel.
///
/// Owns every registry. Boards keep one in a static and call into it from
/// the trap stub.
pub struct Kernel<H: Hal> {
    hal: H,
    config: KernelConfig,

    kmem: Spinlock<Kmem>,

    isolation: Isolation,

    /// Current process system.
    procs: Procs,

    ftable: FileTable,

    pipes: Pipes,

    cpus: [Spinlock<Cpu>; NHART],

    /// The console file every process starts with on fds 0 to 2. The kernel
    /// holds one reference of its own.
    console: FileId,
}

impl<H: Hal> Kernel<H> {
    /// Sets up the page pool over `frames`, which must be the pool region of
    /// the memory layout, and the isolation mechanism.
    pub fn new(hal: H, config: KernelConfig, frames: &'static mut [RawPage]) -> Result<Self, Errno> {
        log::set_max_level(config.log_level);
        let layout = hal.layout().clone();

        let (pmp, ram_end) = match config.isolation {
            IsolationMode::Pmp => {
                let mut pmp = PmpConfig::new();
                let ram_end = pmp.init(&layout, &hal);
                (Some(pmp), ram_end.into_usize())
            }
            IsolationMode::PageTable => (None, layout.ram_end),
        };
        let pool_pages = ram_end.saturating_sub(layout.pool_start) / PGSIZE;
        let len = frames.len().min(pool_pages);
        let frames: &'static mut [RawPage] = &mut frames[..len];
        let mut kmem = Kmem::new(frames, PAddr::from(layout.pool_start));

        let isolation = match pmp {
            Some(pmp) => Isolation::Pmp(Spinlock::new("pmp", pmp)),
            None => {
                let table = PageTable::new_kernel(&mut kmem, &layout).ok_or(Errno::ENOMEM)?;
                hal.install_page_table(table.satp(&kmem));
                Isolation::PageTable(table)
            }
        };

        let ftable = FileTable::new();
        let console = ftable.alloc(File::new(FileKind::Console, true, true))?;

        info!(
            "boot: {:?} isolation, {} of {} pages free",
            config.isolation,
            kmem.count_free(),
            kmem.num_pages()
        );

        Ok(Self {
            hal,
            config,
            kmem: Spinlock::new("kmem", kmem),
            isolation,
            procs: Procs::new(),
            ftable,
            pipes: Pipes::new(),
            cpus: array![_ => Spinlock::new("cpu", Cpu::new()); NHART],
            console,
        })
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn kmem(&self) -> &Spinlock<Kmem> {
        &self.kmem
    }

    pub fn isolation(&self) -> &Isolation {
        &self.isolation
    }

    pub fn procs(&self) -> &Procs {
        &self.procs
    }

    pub fn ftable(&self) -> &FileTable {
        &self.ftable
    }

    pub fn pipes(&self) -> &Pipes {
        &self.pipes
    }

    pub fn cpu(&self, hart: usize) -> &Spinlock<Cpu> {
        &self.cpus[hart]
    }

    pub fn console(&self) -> FileId {
        self.console
    }

    /// Creates a process running the linked-in program `name`.
    pub fn spawn(&self, name: &str) -> Result<Pid, Errno> {
        self.procs.spawn(self, name)
    }

    /// Enters the scheduler on the calling hart. `stack_top` is the hart's
    /// own kernel stack, used whenever there is nothing to run.
    pub fn start(&self, stack_top: usize) -> Resume {
        let hart = self.hal.hart_id();
        self.cpu(hart).lock().context = Context::with_stack(stack_top);
        self.hal.set_timer_after(self.config.tick);
        self.schedule(hart)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;

    #[test]
    fn boot_with_page_tables() {
        let k = boot(IsolationMode::PageTable);
        assert!(matches!(k.isolation(), Isolation::PageTable(_)));
        assert_ne!(k.hal().satp(), 0);
        let kmem = k.kmem().lock();
        assert_eq!(kmem.num_pages(), POOL_PAGES);
        assert!(kmem.count_free() < POOL_PAGES);
        assert_eq!(k.ftable().refcnt(k.console()), 1);
    }

    #[test]
    fn boot_with_pmp() {
        let k = boot(IsolationMode::Pmp);
        assert!(matches!(k.isolation(), Isolation::Pmp(_)));
        assert_eq!(k.hal().satp(), 0);
        assert_ne!(k.hal().pmp_cfgs(), [0; crate::param::NUM_PMP]);
        let kmem = k.kmem().lock();
        assert_eq!(kmem.count_free(), POOL_PAGES);
    }

    #[test]
    fn pmp_processes_get_a_kernel_stack_slot() {
        let k = boot(IsolationMode::Pmp);
        let pid = k.spawn("init").unwrap();
        let slot = k.procs().find(pid).unwrap();
        let p = k.procs().get(slot).lock();
        assert_eq!(p.kstack_slot, Some(0));
        assert!(p.page_table.is_none());
        assert_eq!(p.trap.epc, INIT_ENTRY);
    }

    #[test]
    fn spawn_unknown_program() {
        let k = boot(IsolationMode::PageTable);
        let free = k.kmem().lock().count_free();
        assert_eq!(k.spawn("nosuch"), Err(Errno::ENOENT));
        assert_eq!(k.kmem().lock().count_free(), free);
        assert_eq!(k.procs().num_procs(), 0);
    }

    #[test]
    fn spawn_fails_cleanly_when_the_table_is_full() {
        let k = boot(IsolationMode::Pmp);
        for _ in 0..crate::param::NPROC {
            k.spawn("sh").unwrap();
        }
        let free = k.kmem().lock().count_free();
        let open = k.ftable().refcnt(k.console());
        assert_eq!(k.spawn("sh"), Err(Errno::ENOMEM));
        assert_eq!(k.kmem().lock().count_free(), free);
        assert_eq!(k.ftable().refcnt(k.console()), open);
    }
}
