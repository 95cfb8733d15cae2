//! File system calls.
//! Mostly argument checking, since we don't trust
//! user code, and calls into file.rs and pipe.rs.

use scopeguard::ScopeGuard;
use zerocopy::AsBytes;

use super::SysRet;
use crate::{
    abi::Dirent,
    error::Errno,
    file::{File, FileId, FileKind, PipeEnd},
    hal::Hal,
    param::{MAXDIRENTS, MAXPATH, NOFILE},
    proc::{KernelCtx, Pid, Procstate},
};

const STDOUT: usize = 1;

impl<H: Hal> KernelCtx<'_, H> {
    /// Fetch the nth syscall argument as a file descriptor
    /// and return both the descriptor and the corresponding file.
    fn arg_fd(&self, n: usize) -> Result<(usize, FileId), Errno> {
        let fd = self.arg_int(n);
        if fd < 0 || fd as usize >= NOFILE {
            return Err(Errno::EBADF);
        }
        let fd = fd as usize;
        let file = self.lock_proc().files[fd].ok_or(Errno::EBADF)?;
        Ok((fd, file))
    }

    /// Allocate a file descriptor for the given file.
    /// Takes over the caller's reference on success.
    fn fdalloc(&self, file: FileId) -> Result<usize, Errno> {
        let mut p = self.lock_proc();
        let fd = p.free_fd().ok_or(Errno::EMFILE)?;
        p.files[fd] = Some(file);
        Ok(fd)
    }

    /// Read n bytes into buf.
    /// Returns Ok(number read) on success, Ok(0) at end of file.
    pub fn sys_read(&self) -> Result<SysRet, Errno> {
        let (_, file) = self.arg_fd(0)?;
        let n = self.arg(2) as u32 as usize;
        self.file_read(file, self.arg_addr(1), n)
    }

    /// Write n bytes from buf to given file descriptor fd.
    /// Returns Ok(n) on success.
    pub fn sys_write(&self) -> Result<SysRet, Errno> {
        let (_, file) = self.arg_fd(0)?;
        let n = self.arg(2) as u32 as usize;
        self.file_write(file, self.arg_addr(1), n)
    }

    /// Open a baked-in file read-only.
    /// Returns Ok(file descriptor) on success.
    pub fn sys_open(&self) -> Result<SysRet, Errno> {
        let kernel = self.kernel();
        let mut buf = [0; MAXPATH];
        let path = self.fetch_str(self.arg_addr(0), &mut buf)?;
        let data = kernel.hal().find_file(path).ok_or(Errno::ENOENT)?;

        let file = kernel
            .ftable()
            .alloc(File::new(FileKind::Blob { data, pos: 0 }, true, false))?;
        match self.fdalloc(file) {
            Ok(fd) => Ok(SysRet::Value(fd)),
            Err(errno) => {
                kernel.close_file(file);
                Err(errno)
            }
        }
    }

    /// Release open file fd.
    /// Returns Ok(0) on success.
    pub fn sys_close(&self) -> Result<SysRet, Errno> {
        let (fd, file) = self.arg_fd(0)?;
        self.lock_proc().files[fd] = None;
        self.kernel().close_file(file);
        Ok(SysRet::Value(0))
    }

    /// Return a new file descriptor referring to the same file as given fd.
    /// Returns Ok(new file descriptor) on success.
    pub fn sys_dup(&self) -> Result<SysRet, Errno> {
        let (_, file) = self.arg_fd(0)?;
        let fd = self.fdalloc(file)?;
        self.kernel().ftable().dup(file);
        Ok(SysRet::Value(fd))
    }

    /// Create a pipe, put read/write file descriptors in the `u32[2]` at `a0`.
    /// Returns Ok(0) on success.
    pub fn sys_pipe(&self) -> Result<SysRet, Errno> {
        let kernel = self.kernel();
        let fdarray = self.arg_addr(0);
        let id = kernel.pipes().alloc()?;

        let read_end = File::new(FileKind::Pipe { id, end: PipeEnd::Read }, true, false);
        let rf = match kernel.ftable().alloc(read_end) {
            Ok(rf) => scopeguard::guard(rf, |rf| kernel.close_file(rf)),
            Err(errno) => {
                kernel.pipes().close_read(id);
                return Err(errno);
            }
        };
        let write_end = File::new(FileKind::Pipe { id, end: PipeEnd::Write }, false, true);
        let wf = scopeguard::guard(kernel.ftable().alloc(write_end)?, |wf| kernel.close_file(wf));

        let fd0 = scopeguard::guard(self.fdalloc(*rf)?, |fd| self.lock_proc().files[fd] = None);
        let fd1 = scopeguard::guard(self.fdalloc(*wf)?, |fd| self.lock_proc().files[fd] = None);
        self.copy_out_obj(fdarray, &[*fd0 as u32, *fd1 as u32])?;

        let _ = ScopeGuard::into_inner(fd1);
        let _ = ScopeGuard::into_inner(fd0);
        let _ = ScopeGuard::into_inner(wf);
        let _ = ScopeGuard::into_inner(rf);
        Ok(SysRet::Value(0))
    }

    /// Returns Ok(1) if fd is open, Ok(0) otherwise.
    pub fn sys_isopen(&self) -> Result<SysRet, Errno> {
        Ok(SysRet::Value(self.arg_fd(0).is_ok() as usize))
    }

    /// Make the caller's file `a1` the standard output of process `a0`,
    /// whose own standard output must be closed.
    pub fn sys_pipeattch(&self) -> Result<SysRet, Errno> {
        let kernel = self.kernel();
        let pid = self.arg(0) as Pid;
        let (_, file) = self.arg_fd(1)?;
        let slot = kernel.procs().find(pid).ok_or(Errno::ESRCH)?;

        let mut target = kernel.procs().get(slot).lock();
        if target.state == Procstate::Zombie {
            return Err(Errno::ESRCH);
        }
        if target.files[STDOUT].is_some() {
            return Err(Errno::EBUSY);
        }
        target.files[STDOUT] = Some(kernel.ftable().dup(file));
        Ok(SysRet::Value(0))
    }

    /// List the baked-in directory at `a0` into the `Dirent[a2]` array at
    /// `a1`.
    /// Returns Ok(number of entries).
    pub fn sys_lsdir(&self) -> Result<SysRet, Errno> {
        let mut buf = [0; MAXPATH];
        let path = self.fetch_str(self.arg_addr(0), &mut buf)?;
        let out = self.arg_addr(1);
        let size = self.arg(2);

        let mut dirents = [Dirent::default(); MAXDIRENTS];
        let count = self.kernel().hal().list_dir(path, &mut dirents)?;
        if size < count {
            return Err(Errno::ENOBUFS);
        }
        self.copy_out(out, dirents[..count].as_bytes())?;
        Ok(SysRet::Value(count))
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        abi::DIRENT_DIRECTORY,
        error::Errno,
        kernel::IsolationMode,
        param::{MAXFILENAME, NOFILE},
        pipe::PIPESIZE,
        proc::Procstate,
        syscall::Syscall,
        testutil::*,
        trap::{Resume, TrapCause},
    };

    const READ: usize = Syscall::Read as usize;
    const WRITE: usize = Syscall::Write as usize;

    fn put_str(k: &TestKernel, offset: usize, s: &str) -> usize {
        poke(k, offset, s.as_bytes());
        poke(k, offset + s.len(), &[0]);
        stack_va(k, offset)
    }

    #[test]
    fn console_write_and_bad_fd() {
        let (k, _) = boot_init(IsolationMode::PageTable);
        poke(&k, SCRATCH, b"hi there\n");
        let va = stack_va(&k, SCRATCH);
        assert_eq!(call(&k, WRITE, &[1, va, 9]), 9);
        assert_eq!(k.hal().console_output(), "hi there\n");

        assert_eq!(call(&k, WRITE, &[7, va, 1]), -1);
        assert_eq!(errno(&k), Errno::EBADF.code());
        assert_eq!(call(&k, WRITE, &[NOFILE + 1, va, 1]), -1);
        assert_eq!(errno(&k), Errno::EBADF.code());
        assert_eq!(call(&k, WRITE, &[-1isize as usize, va, 1]), -1);
        assert_eq!(errno(&k), Errno::EBADF.code());
    }

    #[test]
    fn write_nul_terminated() {
        let (k, _) = boot_init(IsolationMode::Pmp);
        let va = put_str(&k, SCRATCH, "no length");
        assert_eq!(call(&k, WRITE, &[2, va, u32::MAX as usize]), 9);
        assert_eq!(k.hal().console_output(), "no length");
    }

    #[test]
    fn write_from_rodata() {
        let (k, _) = boot_init(IsolationMode::PageTable);
        let va = crate::addr::usr_virt(test_layout().user_rodata.start);
        assert_eq!(call(&k, WRITE, &[1, va, 11]), 11);
        assert_eq!(k.hal().console_output(), "from rodata");
        // Rodata is not a place to read into.
        assert_eq!(call(&k, Syscall::Sysinfo as usize, &[va]), -1);
        assert_eq!(errno(&k), Errno::EFAULT.code());
    }

    #[test]
    fn console_read_blocks_for_input() {
        let (k, init) = boot_init(IsolationMode::PageTable);
        let va = stack_va(&k, SCRATCH);
        assert!(matches!(syscall(&k, READ, &[0, va, 16]), Resume::Idle { .. }));

        k.hal().type_in(b"ls\n");
        // Nothing was running, so the woken reader is dispatched right away.
        assert_eq!(user_pid(k.handle_trap(TrapCause::External)), Some(init));
        assert_eq!(call(&k, READ, &[0, va, 16]), 3);
        assert_eq!(peek(&k, SCRATCH, 3), b"ls\n");
    }

    #[test]
    fn open_read_close() {
        let (k, _) = boot_init(IsolationMode::PageTable);
        let path = put_str(&k, SCRATCH, "/hello.txt");
        let fd = call(&k, Syscall::Open as usize, &[path]);
        assert_eq!(fd, 3);
        assert_eq!(call(&k, Syscall::Isopen as usize, &[3]), 1);

        let buf = stack_va(&k, SCRATCH + 0x100);
        assert_eq!(call(&k, READ, &[3, buf, 5]), 5);
        assert_eq!(call(&k, READ, &[3, buf + 5, 64]), HELLO.len() as isize - 5);
        assert_eq!(peek(&k, SCRATCH + 0x100, HELLO.len()), HELLO);
        assert_eq!(call(&k, READ, &[3, buf, 64]), 0);

        assert_eq!(call(&k, WRITE, &[3, buf, 1]), -1);
        assert_eq!(errno(&k), Errno::EBADF.code());

        assert_eq!(call(&k, Syscall::Close as usize, &[3]), 0);
        assert_eq!(call(&k, Syscall::Isopen as usize, &[3]), 0);
        assert_eq!(call(&k, Syscall::Close as usize, &[3]), -1);

        let missing = put_str(&k, SCRATCH, "/nope");
        assert_eq!(call(&k, Syscall::Open as usize, &[missing]), -1);
        assert_eq!(errno(&k), Errno::ENOENT.code());
    }

    #[test]
    fn dup_shares_the_file() {
        let (k, _) = boot_init(IsolationMode::PageTable);
        let console = k.console();
        assert_eq!(call(&k, Syscall::Dup as usize, &[1]), 3);
        assert_eq!(k.ftable().refcnt(console), 5);
        for _ in 4..NOFILE {
            call(&k, Syscall::Dup as usize, &[1]);
        }
        assert_eq!(call(&k, Syscall::Dup as usize, &[1]), -1);
        assert_eq!(errno(&k), Errno::EMFILE.code());
        assert_eq!(k.ftable().refcnt(console), 1 + NOFILE);
    }

    #[test]
    fn pipe_between_parent_and_child() {
        let (k, init) = boot_init(IsolationMode::PageTable);
        let fds = stack_va(&k, SCRATCH);
        assert_eq!(call(&k, Syscall::Pipe as usize, &[fds]), 0);
        assert_eq!(peek(&k, SCRATCH, 8), [3u32.to_le_bytes(), 4u32.to_le_bytes()].concat());

        let child = call(&k, Syscall::Fork as usize, &[]) as u32;
        let buf = stack_va(&k, SCRATCH + 0x100);
        // Empty: the reader waits and the child runs.
        assert_eq!(user_pid(syscall(&k, READ, &[3, buf, 64])), Some(child));

        poke(&k, SCRATCH + 0x100, b"pong");
        assert_eq!(call(&k, WRITE, &[4, buf, 4]), 4);
        assert_eq!(user_pid(syscall(&k, Syscall::Exit as usize, &[0])), Some(init));

        assert_eq!(call(&k, READ, &[3, buf, 64]), 4);
        assert_eq!(peek(&k, SCRATCH + 0x100, 4), b"pong");

        // The last write end goes: end of file.
        assert_eq!(call(&k, Syscall::Close as usize, &[4]), 0);
        assert_eq!(call(&k, READ, &[3, buf, 64]), 0);
    }

    #[test]
    fn full_pipe_blocks_the_writer() {
        let (k, init) = boot_init(IsolationMode::PageTable);
        let fds = stack_va(&k, SCRATCH);
        assert_eq!(call(&k, Syscall::Pipe as usize, &[fds]), 0);
        let child = call(&k, Syscall::Fork as usize, &[]) as u32;
        // Only the child reads.
        assert_eq!(call(&k, Syscall::Close as usize, &[3]), 0);

        let buf = stack_va(&k, SCRATCH + 0x100);
        assert_eq!(call(&k, WRITE, &[4, buf, PIPESIZE + 10]), PIPESIZE as isize);
        assert_eq!(user_pid(syscall(&k, WRITE, &[4, buf, 8])), Some(child));

        // Draining wakes the writer, and the reissued write goes through.
        assert_eq!(call(&k, READ, &[3, stack_va(&k, SCRATCH + 0x100), PIPESIZE]), PIPESIZE as isize);
        assert_eq!(timer_tick(&k), Some(init));
        assert_eq!(call(&k, WRITE, &[4, buf, 8]), 8);

        // Full again, and the reader goes away while the writer waits.
        assert_eq!(call(&k, WRITE, &[4, buf, PIPESIZE]), (PIPESIZE - 8) as isize);
        assert_eq!(user_pid(syscall(&k, WRITE, &[4, buf, 8])), Some(child));
        assert_eq!(call(&k, Syscall::Close as usize, &[3]), 0);
        assert_eq!(timer_tick(&k), Some(init));
        assert_eq!(call(&k, WRITE, &[4, buf, 8]), -1);
        assert_eq!(errno(&k), Errno::EPIPE.code());
    }

    #[test]
    fn write_to_closed_pipe() {
        let (k, _) = boot_init(IsolationMode::Pmp);
        let fds = stack_va(&k, SCRATCH);
        assert_eq!(call(&k, Syscall::Pipe as usize, &[fds]), 0);
        assert_eq!(call(&k, Syscall::Close as usize, &[3]), 0);
        assert_eq!(call(&k, WRITE, &[4, fds, 4]), -1);
        assert_eq!(errno(&k), Errno::EPIPE.code());
        // Reading from the write end is not allowed either.
        assert_eq!(call(&k, READ, &[4, fds, 4]), -1);
        assert_eq!(errno(&k), Errno::EBADF.code());
    }

    #[test]
    fn failed_pipe_leaks_nothing() {
        let (k, _) = boot_init(IsolationMode::PageTable);
        let open = k.ftable().num_open();
        // Rodata cannot take the descriptors.
        let va = crate::addr::usr_virt(test_layout().user_rodata.start);
        assert_eq!(call(&k, Syscall::Pipe as usize, &[va]), -1);
        assert_eq!(errno(&k), Errno::EFAULT.code());
        assert_eq!(k.ftable().num_open(), open);
        assert_eq!(call(&k, Syscall::Isopen as usize, &[3]), 0);
    }

    #[test]
    fn pipeattch_replaces_closed_stdout() {
        let (k, init) = boot_init(IsolationMode::PageTable);
        let sh = k.spawn("sh").unwrap();
        let fds = stack_va(&k, SCRATCH);
        assert_eq!(call(&k, Syscall::Pipe as usize, &[fds]), 0);

        assert_eq!(call(&k, Syscall::Pipeattch as usize, &[sh as usize, 4]), -1);
        assert_eq!(errno(&k), Errno::EBUSY.code());
        assert_eq!(call(&k, Syscall::Pipeattch as usize, &[99, 4]), -1);
        assert_eq!(errno(&k), Errno::ESRCH.code());

        assert_eq!(timer_tick(&k), Some(sh));
        assert_eq!(call(&k, Syscall::Close as usize, &[1]), 0);
        assert_eq!(timer_tick(&k), Some(init));
        assert_eq!(call(&k, Syscall::Pipeattch as usize, &[sh as usize, 4]), 0);

        assert_eq!(timer_tick(&k), Some(sh));
        let msg = put_str(&k, SCRATCH, "through the pipe");
        assert_eq!(call(&k, WRITE, &[1, msg, 16]), 16);
        assert_eq!(k.hal().console_output(), "");

        assert_eq!(timer_tick(&k), Some(init));
        let buf = stack_va(&k, SCRATCH + 0x100);
        assert_eq!(call(&k, READ, &[3, buf, 64]), 16);
        assert_eq!(peek(&k, SCRATCH + 0x100, 16), b"through the pipe");
    }

    #[test]
    fn lsdir_root() {
        let (k, _) = boot_init(IsolationMode::PageTable);
        let path = put_str(&k, SCRATCH, "/");
        let out = stack_va(&k, SCRATCH + 0x100);
        assert_eq!(call(&k, Syscall::Lsdir as usize, &[path, out, 1]), -1);
        assert_eq!(errno(&k), Errno::ENOBUFS.code());
        assert_eq!(call(&k, Syscall::Lsdir as usize, &[path, out, 4]), 2);

        let entry = 8 + MAXFILENAME;
        let second = peek(&k, SCRATCH + 0x100 + entry, entry);
        assert_eq!(&second[..4], &DIRENT_DIRECTORY.to_le_bytes());
        assert_eq!(&second[8..12], b"bin\0");

        let missing = put_str(&k, SCRATCH, "/etc");
        assert_eq!(call(&k, Syscall::Lsdir as usize, &[missing, out, 4]), -1);
        assert_eq!(errno(&k), Errno::ENOENT.code());
    }

    #[test]
    fn exit_closes_pipe_ends() {
        let (k, init) = boot_init(IsolationMode::Pmp);
        let fds = stack_va(&k, SCRATCH);
        assert_eq!(call(&k, Syscall::Pipe as usize, &[fds]), 0);
        let open = k.ftable().num_open();
        assert_eq!(open, 3);
        assert!(matches!(
            syscall(&k, Syscall::Exit as usize, &[0]),
            Resume::Idle { .. }
        ));
        assert_eq!(k.ftable().num_open(), 1);
        let slot = k.procs().find(init).unwrap();
        assert_eq!(k.procs().get(slot).lock().state, Procstate::Zombie);
    }
}
