use core::cmp;

use cstr_core::CStr;
use zerocopy::{AsBytes, FromBytes};

use super::*;
use crate::{
    addr::{Addr, PAddr, UVAddr, PGSIZE},
    error::Errno,
    hal::Hal,
    kalloc::PageFlags,
    kernel::{Isolation, Kernel},
};

/// Everything a syscall handler needs: the kernel and the process that
/// trapped into it.
///
/// The process's registers are in the hart's live trap frame while it
/// runs; its other state is behind the process lock.
pub struct KernelCtx<'k, H: Hal> {
    kernel: &'k Kernel<H>,
    hart: usize,
    slot: usize,
    pid: Pid,
}

/// Where a user address lands.
enum UserPage {
    /// In a pooled page, at this offset.
    Pool(PageId, usize),
    /// In the kernel image: user code or rodata.
    Image(PAddr),
}

impl<'k, H: Hal> KernelCtx<'k, H> {
    pub fn new(kernel: &'k Kernel<H>, hart: usize, slot: usize, pid: Pid) -> Self {
        Self {
            kernel,
            hart,
            slot,
            pid,
        }
    }

    pub fn kernel(&self) -> &'k Kernel<H> {
        self.kernel
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn proc(&self) -> &'k Proc {
        self.kernel.procs().get(self.slot)
    }

    pub fn lock_proc(&self) -> ProcGuard<'k> {
        self.proc().lock()
    }

    /// A copy of the live trap frame.
    pub fn trap_frame(&self) -> TrapFrame {
        self.kernel.cpu(self.hart).lock().trap_frame
    }

    pub fn with_trap_frame<R>(&self, f: impl FnOnce(&mut TrapFrame) -> R) -> R {
        f(&mut self.kernel.cpu(self.hart).lock().trap_frame)
    }

    /// The nth syscall argument.
    pub fn arg(&self, n: usize) -> usize {
        self.trap_frame().arg(n)
    }

    pub fn arg_addr(&self, n: usize) -> UVAddr {
        UVAddr::from(self.arg(n))
    }

    pub fn arg_int(&self, n: usize) -> i32 {
        self.arg(n) as i32
    }

    /// Puts the current process to sleep. The live trap frame, already
    /// past the `ecall`, is saved as the registers to resume with.
    pub fn block(
        &self,
        chan: Option<Channel>,
        deadline: u64,
        cond: WakeCond,
        completion: Completion,
    ) -> Blocked {
        let frame = self.trap_frame();
        self.lock_proc().sleep_on(chan, deadline, cond, frame, completion)
    }

    /// Finds the memory behind user address `va`. Reads may also reach the
    /// user code and rodata in the kernel image; writes only reach user
    /// pages in the pool.
    fn user_page(&self, va: UVAddr, write: bool) -> Result<UserPage, Errno> {
        let table = self.lock_proc().page_table;
        let kmem = self.kernel.kmem().lock();
        let pa = match (self.kernel.isolation(), table) {
            (Isolation::PageTable(_), Some(table)) => {
                table.translate_user(&kmem, va, write).ok_or(Errno::EFAULT)?
            }
            (Isolation::PageTable(_), None) => return Err(Errno::EFAULT),
            (Isolation::Pmp(_), _) => PAddr::from(va.into_usize()),
        };

        if let Some(page) = kmem.page_at(pa) {
            let info = kmem.info(page);
            if info.is_free() || !info.flags.contains(PageFlags::USERMEM) {
                return Err(Errno::EFAULT);
            }
            return Ok(UserPage::Pool(page, pa.page_offset()));
        }

        let layout = self.kernel.hal().layout();
        let pa_raw = pa.into_usize();
        if !write && (layout.user_text.contains(&pa_raw) || layout.user_rodata.contains(&pa_raw)) {
            return Ok(UserPage::Image(pa));
        }
        Err(Errno::EFAULT)
    }

    /// Fails unless all of `[va, va + len)` is accessible.
    pub fn check_user(&self, va: UVAddr, len: usize, write: bool) -> Result<(), Errno> {
        let mut done = 0;
        while done < len {
            let addr = va + done;
            match self.user_page(addr, write)? {
                UserPage::Image(_) if write => return Err(Errno::EFAULT),
                _ => (),
            }
            done += cmp::min(PGSIZE - addr.page_offset(), len - done);
        }
        Ok(())
    }

    /// Copy from user to kernel.
    pub fn copy_in(&self, dst: &mut [u8], src: UVAddr) -> Result<(), Errno> {
        let mut done = 0;
        while done < dst.len() {
            let va = src + done;
            let n = cmp::min(PGSIZE - va.page_offset(), dst.len() - done);
            let chunk = &mut dst[done..done + n];
            match self.user_page(va, false)? {
                UserPage::Pool(page, offset) => {
                    let kmem = self.kernel.kmem().lock();
                    chunk.copy_from_slice(&kmem.frame(page)[offset..offset + n]);
                }
                UserPage::Image(pa) => {
                    if !self.kernel.hal().read_image(pa, chunk) {
                        return Err(Errno::EFAULT);
                    }
                }
            }
            done += n;
        }
        Ok(())
    }

    /// Copy from kernel to user.
    pub fn copy_out(&self, dst: UVAddr, src: &[u8]) -> Result<(), Errno> {
        let mut done = 0;
        while done < src.len() {
            let va = dst + done;
            let n = cmp::min(PGSIZE - va.page_offset(), src.len() - done);
            match self.user_page(va, true)? {
                UserPage::Pool(page, offset) => {
                    let mut kmem = self.kernel.kmem().lock();
                    kmem.frame_mut(page)[offset..offset + n].copy_from_slice(&src[done..done + n]);
                }
                UserPage::Image(_) => return Err(Errno::EFAULT),
            }
            done += n;
        }
        Ok(())
    }

    pub fn copy_out_obj<T: AsBytes>(&self, dst: UVAddr, obj: &T) -> Result<(), Errno> {
        self.copy_out(dst, obj.as_bytes())
    }

    pub fn copy_in_obj<T: AsBytes + FromBytes>(&self, src: UVAddr) -> Result<T, Errno> {
        let mut obj = T::new_zeroed();
        self.copy_in(obj.as_bytes_mut(), src)?;
        Ok(obj)
    }

    /// Fetch the nul-terminated string at `src`. Fails with EINVAL if it does
    /// not fit in `buf` or is not UTF-8.
    pub fn fetch_str<'b>(&self, src: UVAddr, buf: &'b mut [u8]) -> Result<&'b str, Errno> {
        let mut len = 0;
        loop {
            if len == buf.len() {
                return Err(Errno::EINVAL);
            }
            let va = src + len;
            let n = cmp::min(PGSIZE - va.page_offset(), buf.len() - len);
            self.copy_in(&mut buf[len..len + n], va)?;
            if let Some(nul) = buf[len..len + n].iter().position(|&c| c == 0) {
                len += nul;
                break;
            }
            len += n;
        }
        let cstr = CStr::from_bytes_with_nul(&buf[..=len]).map_err(|_| Errno::EINVAL)?;
        cstr.to_str().map_err(|_| Errno::EINVAL)
    }

    /// Length of the nul-terminated string at `src`.
    pub fn user_strlen(&self, src: UVAddr) -> Result<usize, Errno> {
        let mut chunk = [0u8; 64];
        let mut len = 0;
        loop {
            let va = src + len;
            let n = cmp::min(PGSIZE - va.page_offset(), chunk.len());
            self.copy_in(&mut chunk[..n], va)?;
            if let Some(nul) = chunk[..n].iter().position(|&c| c == 0) {
                return Ok(len + nul);
            }
            len += n;
        }
    }

    /// User stack page and the address user code sees it at.
    pub fn user_stack(&self) -> Option<(PageId, usize)> {
        let p = self.lock_proc();
        let stack = p.stack?;
        let base = match self.kernel.isolation() {
            Isolation::PageTable(_) => crate::addr::USER_STACK_VA,
            Isolation::Pmp(_) => self.kernel.kmem().lock().addr(stack).into_usize(),
        };
        Some((stack, base))
    }

    /// Writes the errno word at the top of the user stack page.
    pub fn set_errno(&self, errno: i32) {
        if let Some((stack, _)) = self.user_stack() {
            let mut kmem = self.kernel.kmem().lock();
            kmem.frame_mut(stack)[PGSIZE - 4..].copy_from_slice(&errno.to_le_bytes());
        }
    }

    pub fn errno(&self) -> i32 {
        let mut bytes = [0; 4];
        if let Some((stack, _)) = self.user_stack() {
            let kmem = self.kernel.kmem().lock();
            bytes.copy_from_slice(&kmem.frame(stack)[PGSIZE - 4..]);
        }
        i32::from_le_bytes(bytes)
    }

    /// Is the user stack pointer still inside the stack page?
    pub fn user_sp_valid(&self) -> bool {
        let sp = self.trap_frame().sp;
        match self.user_stack() {
            Some((_, base)) => (base..=base + PGSIZE).contains(&sp),
            None => false,
        }
    }
}
