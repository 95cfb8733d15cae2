//! Open files and their read/write paths.

use core::cmp;

use log::trace;

use crate::{
    addr::UVAddr,
    error::Errno,
    hal::Hal,
    kernel::Kernel,
    lock::Spinlock,
    param::NFILE,
    pipe::{PipeId, PipeRead, PipeWrite, PIPESIZE},
    proc::{Channel, Completion, KernelCtx},
    syscall::SysRet,
};

/// Console transfers go through a kernel buffer of this size.
const CONSOLE_CHUNK: usize = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileId(usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipeEnd {
    Read,
    Write,
}

#[derive(Clone, Copy, Debug)]
pub enum FileKind {
    /// The console byte stream.
    Console,
    /// A baked-in read-only file and the offset into it.
    Blob { data: &'static [u8], pos: usize },
    Pipe { id: PipeId, end: PipeEnd },
}

#[derive(Clone, Copy, Debug)]
pub struct File {
    refcnt: usize,
    pub readable: bool,
    pub writable: bool,
    pub kind: FileKind,
}

impl File {
    pub const fn new(kind: FileKind, readable: bool, writable: bool) -> Self {
        Self {
            refcnt: 1,
            readable,
            writable,
            kind,
        }
    }
}

pub struct FileTable {
    files: Spinlock<[Option<File>; NFILE]>,
}

impl FileTable {
    pub const fn new() -> Self {
        Self {
            files: Spinlock::new("ftable", [None; NFILE]),
        }
    }

    /// Allocate a file structure.
    pub fn alloc(&self, file: File) -> Result<FileId, Errno> {
        let mut files = self.files.lock();
        let index = files.iter().position(Option::is_none).ok_or(Errno::ENFILE)?;
        files[index] = Some(file);
        Ok(FileId(index))
    }

    /// Increment ref count for file `id`.
    pub fn dup(&self, id: FileId) -> FileId {
        match self.files.lock()[id.0].as_mut() {
            Some(file) => file.refcnt += 1,
            None => panic!("filedup: {:?} is not open", id),
        }
        id
    }

    /// Drops one reference. Returns the kind of the file if that was the
    /// last one.
    pub fn close(&self, id: FileId) -> Option<FileKind> {
        let mut files = self.files.lock();
        let slot = &mut files[id.0];
        let file = match slot.as_mut() {
            Some(file) => file,
            None => panic!("fileclose: {:?} is not open", id),
        };
        file.refcnt -= 1;
        if file.refcnt > 0 {
            return None;
        }
        slot.take().map(|file| file.kind)
    }

    pub fn get(&self, id: FileId) -> Option<File> {
        self.files.lock()[id.0]
    }

    pub fn refcnt(&self, id: FileId) -> usize {
        self.get(id).map_or(0, |file| file.refcnt)
    }

    pub fn num_open(&self) -> usize {
        self.files.lock().iter().filter(|f| f.is_some()).count()
    }

    /// Reads from a blob at its offset and advances the offset.
    fn read_blob(&self, id: FileId, dst: &mut [u8]) -> usize {
        let mut files = self.files.lock();
        match files[id.0].as_mut().map(|file| &mut file.kind) {
            Some(FileKind::Blob { data, pos }) => {
                let data: &'static [u8] = data;
                let n = cmp::min(dst.len(), data.len().saturating_sub(*pos));
                dst[..n].copy_from_slice(&data[*pos..*pos + n]);
                *pos += n;
                n
            }
            _ => 0,
        }
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Hal> Kernel<H> {
    /// Drops a reference to `id`, tearing down a pipe end on the last one.
    pub fn close_file(&self, id: FileId) {
        match self.ftable().close(id) {
            Some(FileKind::Pipe { id, end }) => {
                match end {
                    PipeEnd::Read => self.pipes().close_read(id),
                    PipeEnd::Write => self.pipes().close_write(id),
                }
                trace!("pipe {:?}: {:?} end closed", id, end);
                self.mark_for_wakeup(Channel::Pipe(id));
            }
            Some(_) | None => (),
        }
    }
}

impl<H: Hal> KernelCtx<'_, H> {
    /// Read from file `id`.
    pub fn file_read(&self, id: FileId, dst: UVAddr, n: usize) -> Result<SysRet, Errno> {
        let kernel = self.kernel();
        let file = kernel.ftable().get(id).ok_or(Errno::EBADF)?;
        if !file.readable {
            return Err(Errno::EBADF);
        }
        if n == 0 {
            return Ok(SysRet::Value(0));
        }

        match file.kind {
            FileKind::Console => {
                let mut buf = [0; CONSOLE_CHUNK];
                let len = cmp::min(n, buf.len());
                let got = kernel.hal().console_read(&mut buf[..len]);
                if got == 0 {
                    return Ok(SysRet::Blocked(self.yield_on(Channel::Console, Completion::Restart)));
                }
                self.copy_out(dst, &buf[..got])?;
                Ok(SysRet::Value(got))
            }
            FileKind::Blob { .. } => {
                let mut buf = [0; CONSOLE_CHUNK];
                let mut done = 0;
                while done < n {
                    let len = cmp::min(buf.len(), n - done);
                    let got = kernel.ftable().read_blob(id, &mut buf[..len]);
                    if got == 0 {
                        break;
                    }
                    self.copy_out(dst + done, &buf[..got])?;
                    done += got;
                }
                Ok(SysRet::Value(done))
            }
            FileKind::Pipe { id: pipe, .. } => {
                let mut buf = [0; PIPESIZE];
                let len = cmp::min(n, buf.len());
                // Bytes taken from the pipe must have somewhere to go.
                self.check_user(dst, len, true)?;
                match kernel.pipes().read(pipe, self.pid(), &mut buf[..len]) {
                    PipeRead::Data(got) => {
                        self.copy_out(dst, &buf[..got])?;
                        kernel.mark_for_wakeup(Channel::Pipe(pipe));
                        Ok(SysRet::Value(got))
                    }
                    PipeRead::Eof => Ok(SysRet::Value(0)),
                    PipeRead::Empty => {
                        kernel.mark_for_wakeup(Channel::Pipe(pipe));
                        Ok(SysRet::Blocked(self.yield_on(Channel::Pipe(pipe), Completion::Restart)))
                    }
                }
            }
        }
    }

    /// Write to file `id`. A size of `u32::MAX` writes the nul-terminated
    /// string at `src`.
    pub fn file_write(&self, id: FileId, src: UVAddr, n: usize) -> Result<SysRet, Errno> {
        let kernel = self.kernel();
        let file = kernel.ftable().get(id).ok_or(Errno::EBADF)?;
        if !file.writable {
            return Err(Errno::EBADF);
        }
        let n = if n as u32 == u32::MAX {
            self.user_strlen(src)?
        } else {
            n
        };
        if n == 0 {
            return Ok(SysRet::Value(0));
        }

        match file.kind {
            FileKind::Console => {
                let mut buf = [0; CONSOLE_CHUNK];
                let mut done = 0;
                while done < n {
                    let len = cmp::min(buf.len(), n - done);
                    self.copy_in(&mut buf[..len], src + done)?;
                    kernel.hal().console_write(&buf[..len]);
                    done += len;
                }
                Ok(SysRet::Value(n))
            }
            FileKind::Blob { .. } => Err(Errno::EBADF),
            FileKind::Pipe { id: pipe, .. } => {
                let mut buf = [0; PIPESIZE];
                let len = cmp::min(n, buf.len());
                self.copy_in(&mut buf[..len], src)?;
                match kernel.pipes().write(pipe, self.pid(), &buf[..len]) {
                    PipeWrite::Wrote(written) => {
                        kernel.mark_for_wakeup(Channel::Pipe(pipe));
                        Ok(SysRet::Value(written))
                    }
                    PipeWrite::Full => {
                        kernel.mark_for_wakeup(Channel::Pipe(pipe));
                        Ok(SysRet::Blocked(self.yield_on(Channel::Pipe(pipe), Completion::Restart)))
                    }
                    PipeWrite::Broken => Err(Errno::EPIPE),
                }
            }
        }
    }
}
