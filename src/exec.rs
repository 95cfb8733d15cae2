//! Starting programs: argument vectors, initial registers and execv.

use arrayvec::ArrayVec;

use crate::{
    addr::{usr_virt, Addr, PAddr, UVAddr, PGSIZE, USER_STACK_VA},
    error::Errno,
    hal::Hal,
    kalloc::PageFlags,
    kernel::{Isolation, Kernel},
    page::{PageId, RawPage},
    param::{MAXARG, MAXARGLEN},
    proc::KernelCtx,
    syscall::SysRet,
    trap::TrapFrame,
    vm::PteFlags,
};

const WORD: usize = core::mem::size_of::<u64>();

/// Argument strings, copied into the kernel so the caller's stack can go.
#[derive(Debug, Default)]
pub struct Args {
    args: ArrayVec<ArrayVec<u8, MAXARGLEN>, MAXARG>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an argument. Fails with EINVAL if there are already `MAXARG`
    /// of them, or if `arg` and its nul do not fit in `MAXARGLEN`.
    pub fn push(&mut self, arg: &[u8]) -> Result<(), Errno> {
        if self.args.is_full() || arg.len() >= MAXARGLEN {
            return Err(Errno::EINVAL);
        }
        let mut copy = ArrayVec::new();
        copy.try_extend_from_slice(arg).map_err(|_| Errno::EINVAL)?;
        self.args.push(copy);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.args.iter().map(|arg| arg.as_slice())
    }
}

/// Lays out `args` at the top of a fresh stack page that user code sees at
/// `base`. Returns the initial `sp` and `argv`.
///
/// ```text
/// PGSIZE        +----------------+
///               | errno, pad     |
/// PGSIZE - 8    +----------------+
///               | argv[argc] = 0 |
///               | argv[..]       |
/// argv          +----------------+
///               | strings        |
///               +----------------+
/// sp            16-byte aligned
/// ```
///
/// Without arguments `argv` is null.
fn push_args(frame: &mut RawPage, base: usize, args: &Args) -> (usize, usize) {
    let top = PGSIZE - WORD;
    if args.is_empty() {
        return (base + top, 0);
    }

    let argv = top - (args.len() + 1) * WORD;
    let mut cursor = argv;
    for (i, arg) in args.iter().enumerate() {
        cursor -= arg.len() + 1;
        frame[cursor..cursor + arg.len()].copy_from_slice(arg);
        frame[cursor + arg.len()] = 0;
        frame.write_word(argv / WORD + i, (base + cursor) as u64);
    }
    frame.write_word(argv / WORD + args.len(), 0);

    let sp = cursor & !0xf;
    (base + sp, base + argv)
}

impl<H: Hal> Kernel<H> {
    /// Where user code sees its stack page.
    pub(crate) fn user_stack_base(&self, stack: PageId) -> usize {
        match self.isolation() {
            Isolation::PageTable(_) => USER_STACK_VA,
            Isolation::Pmp(_) => self.kmem().lock().addr(stack).into_usize(),
        }
    }

    /// Writes `args` onto `stack` and returns the registers that start the
    /// program at `entry` with them.
    pub(crate) fn start_frame(&self, entry: PAddr, stack: PageId, args: &Args) -> TrapFrame {
        let base = self.user_stack_base(stack);
        let (sp, argv) = push_args(self.kmem().lock().frame_mut(stack), base, args);

        let mut frame = TrapFrame::new();
        frame.epc = match self.isolation() {
            Isolation::PageTable(_) => usr_virt(entry.into_usize()),
            Isolation::Pmp(_) => entry.into_usize(),
        };
        frame.ra = frame.epc;
        frame.sp = sp;
        frame.s0 = sp;
        frame.a0 = args.len();
        frame.a1 = argv;
        frame
    }
}

impl<H: Hal> KernelCtx<'_, H> {
    /// Replaces the program of the current process with the linked-in
    /// program `name`, on a fresh stack. Only the pc, the name and the stack
    /// change; open files stay.
    pub fn exec(&self, name: &str, args: &Args) -> Result<SysRet, Errno> {
        let kernel = self.kernel();
        let entry = kernel.hal().find_program(name).ok_or(Errno::ENOENT)?;
        let stack = kernel.alloc_page("stack", Some(self.pid()), PageFlags::USERMEM)?;
        let start = kernel.start_frame(entry, stack, args);

        let old = {
            let mut p = self.lock_proc();
            if let Some(table) = p.page_table {
                let mut kmem = kernel.kmem().lock();
                let stack_pa = kmem.addr(stack);
                table.map(&mut kmem, stack_pa, UVAddr::from(USER_STACK_VA), PteFlags::UDATA, Some(self.pid()));
            }
            p.set_name(name);
            p.stack.replace(stack)
        };
        if let Some(old) = old {
            kernel.free_page(old);
        }

        self.with_trap_frame(|tf| {
            tf.epc = start.epc;
            tf.ra = start.ra;
            tf.sp = start.sp;
            tf.s0 = start.s0;
            tf.a1 = start.a1;
        });
        log::debug!("exec: pid {} runs {} with {} args", self.pid(), name, args.len());
        Ok(SysRet::Value(start.a0))
    }
}
