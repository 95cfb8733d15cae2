//! Test doubles: a recording board, and a kernel booted over a leaked pool
//! that tests drive one trap at a time.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::vec::Vec;

use crate::{
    abi::{Dirent, DIRENT_DIRECTORY, DIRENT_FILE},
    addr::{Addr, PAddr, PGSIZE},
    error::Errno,
    hal::{Devices, InterruptControl, MemoryIsolation, MemoryLayout, StaticImage, TimeSource},
    kernel::{IsolationMode, Kernel, KernelConfig},
    page::RawPage,
    param::NUM_PMP,
    proc::{Channel, Pid},
    trap::{Resume, TrapCause, TrapFrame},
};

pub const POOL_BASE: usize = 0x8001_0000;
pub const POOL_PAGES: usize = 96;

pub const INIT_ENTRY: usize = 0x8000_4000;
pub const SH_ENTRY: usize = 0x8000_4400;
pub const ECHO_ENTRY: usize = 0x8000_4800;

pub const HELLO: &[u8] = b"hello, world\n";

/// Placed at the start of user rodata.
pub const RODATA_GREETING: &[u8] = b"from rodata\0";

pub fn leak_frames(n: usize) -> &'static mut [RawPage] {
    let frames: Vec<RawPage> = (0..n).map(|_| RawPage::DEFAULT).collect();
    Box::leak(frames.into_boxed_slice())
}

pub fn test_layout() -> MemoryLayout {
    MemoryLayout {
        kernel_text: 0x8000_0000..0x8000_4000,
        user_text: 0x8000_4000..0x8000_6000,
        user_rodata: 0x8000_6000..0x8000_7000,
        kernel_data: 0x8000_7000..0x8000_9000,
        pool_start: POOL_BASE,
        ram_end: POOL_BASE + POOL_PAGES * PGSIZE,
        mmio: &[0x1000_0000],
    }
}

pub struct TestHal {
    layout: MemoryLayout,
    clock: Cell<u64>,
    timer: Cell<Option<u64>>,
    satp: Cell<usize>,
    pmp_addrs: Cell<[usize; NUM_PMP]>,
    pmp_cfgs: Cell<[u8; NUM_PMP]>,
    fence_i: Cell<usize>,
    waits: Cell<usize>,
    console_out: RefCell<Vec<u8>>,
    console_in: RefCell<VecDeque<u8>>,
    pending: RefCell<Vec<Channel>>,
    gpio: RefCell<Vec<(u32, u32, u32)>>,
    restarted: Cell<bool>,
    rodata: Vec<u8>,
}

impl TestHal {
    pub fn new() -> Self {
        let mut rodata = vec![0; 0x1000];
        rodata[..RODATA_GREETING.len()].copy_from_slice(RODATA_GREETING);
        Self {
            layout: test_layout(),
            clock: Cell::new(0),
            timer: Cell::new(None),
            satp: Cell::new(0),
            pmp_addrs: Cell::new([0; NUM_PMP]),
            pmp_cfgs: Cell::new([0; NUM_PMP]),
            fence_i: Cell::new(0),
            waits: Cell::new(0),
            console_out: RefCell::new(Vec::new()),
            console_in: RefCell::new(VecDeque::new()),
            pending: RefCell::new(Vec::new()),
            gpio: RefCell::new(Vec::new()),
            restarted: Cell::new(false),
            rodata,
        }
    }

    pub fn advance(&self, ticks: u64) {
        self.clock.set(self.clock.get() + ticks);
    }

    pub fn timer_deadline(&self) -> Option<u64> {
        self.timer.get()
    }

    pub fn satp(&self) -> usize {
        self.satp.get()
    }

    pub fn pmp_addrs(&self) -> [usize; NUM_PMP] {
        self.pmp_addrs.get()
    }

    pub fn pmp_cfgs(&self) -> [u8; NUM_PMP] {
        self.pmp_cfgs.get()
    }

    pub fn fence_i_count(&self) -> usize {
        self.fence_i.get()
    }

    pub fn idle_waits(&self) -> usize {
        self.waits.get()
    }

    pub fn console_output(&self) -> String {
        String::from_utf8_lossy(&self.console_out.borrow()).into_owned()
    }

    /// Queues console input and raises its interrupt.
    pub fn type_in(&self, bytes: &[u8]) {
        self.console_in.borrow_mut().extend(bytes.iter().copied());
        self.pending.borrow_mut().push(Channel::Console);
    }

    pub fn gpio_calls(&self) -> Vec<(u32, u32, u32)> {
        self.gpio.borrow().clone()
    }

    pub fn restarted(&self) -> bool {
        self.restarted.get()
    }
}

impl TimeSource for TestHal {
    fn now(&self) -> u64 {
        self.clock.get()
    }

    fn set_timer_after(&self, ticks: u64) {
        self.timer.set(Some(self.clock.get() + ticks));
    }
}

impl InterruptControl for TestHal {
    fn hart_id(&self) -> usize {
        0
    }

    fn intr_off(&self) {}

    fn wait_for_interrupt(&self) {
        self.waits.set(self.waits.get() + 1);
    }

    fn route_interrupt(&self, wake: &mut dyn FnMut(Channel)) {
        let pending: Vec<_> = self.pending.borrow_mut().drain(..).collect();
        for chan in pending {
            wake(chan);
        }
    }
}

impl MemoryIsolation for TestHal {
    fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    fn set_return_to_user(&self) {}

    fn install_page_table(&self, satp: usize) {
        self.satp.set(satp);
    }

    fn write_pmp(&self, addrs: &[usize; NUM_PMP], cfgs: &[u8; NUM_PMP]) {
        self.pmp_addrs.set(*addrs);
        self.pmp_cfgs.set(*cfgs);
    }

    fn fence_i(&self) {
        self.fence_i.set(self.fence_i.get() + 1);
    }
}

impl Devices for TestHal {
    fn console_write(&self, bytes: &[u8]) {
        self.console_out.borrow_mut().extend_from_slice(bytes);
    }

    fn console_read(&self, buf: &mut [u8]) -> usize {
        let mut input = self.console_in.borrow_mut();
        let n = buf.len().min(input.len());
        for (dst, src) in buf.iter_mut().zip(input.drain(..n)) {
            *dst = src;
        }
        n
    }

    fn gpio(&self, pin: u32, enable: u32, value: u32) -> isize {
        self.gpio.borrow_mut().push((pin, enable, value));
        0
    }

    fn restart(&self) {
        self.restarted.set(true);
    }
}

impl StaticImage for TestHal {
    fn find_file(&self, path: &str) -> Option<&'static [u8]> {
        match path {
            "/hello.txt" => Some(HELLO),
            _ => None,
        }
    }

    fn list_dir(&self, path: &str, out: &mut [Dirent]) -> Result<usize, Errno> {
        let entries = match path {
            "/" => [
                Dirent::new(DIRENT_FILE, HELLO.len() as u32, "hello.txt"),
                Dirent::new(DIRENT_DIRECTORY, 0, "bin"),
            ],
            _ => return Err(Errno::ENOENT),
        };
        if out.len() < entries.len() {
            return Err(Errno::ENOBUFS);
        }
        out[..entries.len()].copy_from_slice(&entries);
        Ok(entries.len())
    }

    fn find_program(&self, name: &str) -> Option<PAddr> {
        let entry = match name {
            "init" => INIT_ENTRY,
            "sh" => SH_ENTRY,
            "echo" => ECHO_ENTRY,
            _ => return None,
        };
        Some(PAddr::from(entry))
    }

    fn read_image(&self, pa: PAddr, buf: &mut [u8]) -> bool {
        let pa = pa.into_usize();
        let rodata = &self.layout.user_rodata;
        if rodata.contains(&pa) && pa + buf.len() <= rodata.end {
            let start = pa - rodata.start;
            buf.copy_from_slice(&self.rodata[start..start + buf.len()]);
            return true;
        }
        let text = &self.layout.user_text;
        if text.contains(&pa) && pa + buf.len() <= text.end {
            buf.fill(0);
            return true;
        }
        false
    }
}

pub type TestKernel = Kernel<TestHal>;

pub fn boot(isolation: IsolationMode) -> TestKernel {
    let config = KernelConfig {
        isolation,
        ..KernelConfig::default()
    };
    match Kernel::new(TestHal::new(), config, leak_frames(POOL_PAGES)) {
        Ok(kernel) => kernel,
        Err(errno) => panic!("boot: {:?}", errno),
    }
}

/// Boots, spawns `init` and puts it on the hart.
pub fn boot_init(isolation: IsolationMode) -> (TestKernel, Pid) {
    let kernel = boot(isolation);
    let pid = kernel.spawn("init").unwrap();
    assert_eq!(start(&kernel), Some(pid));
    (kernel, pid)
}

const HART_STACK: usize = 0x8000_8ff0;

/// Enters the scheduler and returns who got the hart.
pub fn start(kernel: &TestKernel) -> Option<Pid> {
    user_pid(kernel.start(HART_STACK))
}

pub fn user_pid(resume: Resume) -> Option<Pid> {
    match resume {
        Resume::User { pid, .. } => Some(pid),
        _ => None,
    }
}

fn set_arg(tf: &mut TrapFrame, n: usize, value: usize) {
    match n {
        0 => tf.a0 = value,
        1 => tf.a1 = value,
        2 => tf.a2 = value,
        3 => tf.a3 = value,
        4 => tf.a4 = value,
        5 => tf.a5 = value,
        _ => panic!("arg {}", n),
    }
}

/// Traps into syscall `num` from the process on the hart.
pub fn syscall(kernel: &TestKernel, num: usize, args: &[usize]) -> Resume {
    {
        let mut cpu = kernel.cpu(0).lock();
        cpu.trap_frame.a7 = num;
        for (n, &arg) in args.iter().enumerate() {
            set_arg(&mut cpu.trap_frame, n, arg);
        }
    }
    kernel.handle_trap(TrapCause::Syscall)
}

/// Like `syscall`, for calls that return to the caller. Returns `a0` as a
/// signed value.
pub fn call(kernel: &TestKernel, num: usize, args: &[usize]) -> isize {
    let before = running(kernel);
    let resume = syscall(kernel, num, args);
    assert_eq!(user_pid(resume), before, "syscall {} switched away", num);
    a0(kernel) as isize
}

pub fn timer_tick(kernel: &TestKernel) -> Option<Pid> {
    user_pid(kernel.handle_trap(TrapCause::Timer))
}

pub fn a0(kernel: &TestKernel) -> usize {
    kernel.cpu(0).lock().trap_frame.a0
}

pub fn running(kernel: &TestKernel) -> Option<Pid> {
    let slot = kernel.cpu(0).lock().proc?;
    Some(kernel.procs().get(slot).lock().pid)
}

/// Offset into the stack page of the running process where tests keep
/// scratch buffers, well below the initial stack pointer.
pub const SCRATCH: usize = 0x100;

/// User address of byte `offset` of the running process's stack page.
pub fn stack_va(kernel: &TestKernel, offset: usize) -> usize {
    let slot = kernel.cpu(0).lock().proc.expect("nothing running");
    let stack = kernel.procs().get(slot).lock().stack.expect("no stack");
    kernel.user_stack_base(stack) + offset
}

pub fn poke(kernel: &TestKernel, offset: usize, bytes: &[u8]) {
    let slot = kernel.cpu(0).lock().proc.expect("nothing running");
    let stack = kernel.procs().get(slot).lock().stack.expect("no stack");
    kernel.kmem().lock().frame_mut(stack)[offset..offset + bytes.len()].copy_from_slice(bytes);
}

pub fn peek(kernel: &TestKernel, offset: usize, len: usize) -> Vec<u8> {
    let slot = kernel.cpu(0).lock().proc.expect("nothing running");
    let stack = kernel.procs().get(slot).lock().stack.expect("no stack");
    kernel.kmem().lock().frame(stack)[offset..offset + len].to_vec()
}

/// The errno word of the running process.
pub fn errno(kernel: &TestKernel) -> i32 {
    let bytes = peek(kernel, PGSIZE - 4, 4);
    i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
