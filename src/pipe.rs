//! Pipes: bounded byte rings shared by a read file and a write file.
//!
//! Nothing here blocks. Callers turn `Empty` and `Full` into a sleep on
//! the pipe's channel and reissue the operation when woken.

use core::cmp;

use array_macro::array;

use crate::{addr::PGSIZE, error::Errno, lock::Spinlock, param::NPIPE, proc::Pid};

pub const PIPESIZE: usize = PGSIZE / 4;

/// A fixed-capacity byte ring. `full` tells a full ring from an empty
/// one when the cursors meet.
#[derive(Debug)]
pub struct PipeRing<const N: usize> {
    data: [u8; N],
    rpos: usize,
    wpos: usize,
    full: bool,
}

impl<const N: usize> PipeRing<N> {
    pub const fn new() -> Self {
        Self {
            data: [0; N],
            rpos: 0,
            wpos: 0,
            full: false,
        }
    }

    /// Bytes buffered.
    pub fn len(&self) -> usize {
        if self.full {
            N
        } else {
            (self.wpos + N - self.rpos) % N
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies out as many buffered bytes as fit in `dst`.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let n = cmp::min(dst.len(), self.len());
        for byte in dst[..n].iter_mut() {
            *byte = self.data[self.rpos];
            self.rpos = (self.rpos + 1) % N;
        }
        if n > 0 {
            self.full = false;
        }
        n
    }

    /// Copies in as much of `src` as there is room for.
    pub fn write(&mut self, src: &[u8]) -> usize {
        let n = cmp::min(src.len(), N - self.len());
        for &byte in &src[..n] {
            self.data[self.wpos] = byte;
            self.wpos = (self.wpos + 1) % N;
        }
        if n > 0 && self.wpos == self.rpos {
            self.full = true;
        }
        n
    }
}

impl<const N: usize> Default for PipeRing<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Names a pipe. The generation changes whenever the slot is freed, so a
/// stale id never reaches a later pipe in the same slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PipeId {
    index: usize,
    generation: u32,
}

struct PipeInner {
    ring: PipeRing<PIPESIZE>,
    /// Last process to read, for debugging.
    reader: Option<Pid>,
    /// Last process to write, for debugging.
    writer: Option<Pid>,
    write_closed: bool,
}

struct PipeSlot {
    generation: u32,
    pipe: Option<PipeInner>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipeRead {
    Data(usize),
    /// Empty, and the write end is closed.
    Eof,
    /// Empty, but more may come.
    Empty,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipeWrite {
    Wrote(usize),
    Full,
    /// The read end is gone.
    Broken,
}

pub struct Pipes {
    slots: [Spinlock<PipeSlot>; NPIPE],
}

impl Pipes {
    pub fn new() -> Self {
        Self {
            slots: array![_ => Spinlock::new("pipe", PipeSlot { generation: 0, pipe: None }); NPIPE],
        }
    }

    pub fn alloc(&self) -> Result<PipeId, Errno> {
        for (index, slot) in self.slots.iter().enumerate() {
            let mut slot = slot.lock();
            if slot.pipe.is_none() {
                slot.pipe = Some(PipeInner {
                    ring: PipeRing::new(),
                    reader: None,
                    writer: None,
                    write_closed: false,
                });
                return Ok(PipeId {
                    index,
                    generation: slot.generation,
                });
            }
        }
        Err(Errno::ENOMEM)
    }

    fn with_pipe<R>(&self, id: PipeId, f: impl FnOnce(&mut PipeInner) -> R) -> Option<R> {
        let mut slot = self.slots[id.index].lock();
        if slot.generation != id.generation {
            return None;
        }
        slot.pipe.as_mut().map(f)
    }

    pub fn read(&self, id: PipeId, pid: Pid, dst: &mut [u8]) -> PipeRead {
        self.with_pipe(id, |pipe| {
            pipe.reader = Some(pid);
            if !pipe.ring.is_empty() {
                PipeRead::Data(pipe.ring.read(dst))
            } else if pipe.write_closed {
                PipeRead::Eof
            } else {
                PipeRead::Empty
            }
        })
        .unwrap_or(PipeRead::Eof)
    }

    pub fn write(&self, id: PipeId, pid: Pid, src: &[u8]) -> PipeWrite {
        self.with_pipe(id, |pipe| {
            pipe.writer = Some(pid);
            match pipe.ring.write(src) {
                0 if !src.is_empty() => PipeWrite::Full,
                n => PipeWrite::Wrote(n),
            }
        })
        .unwrap_or(PipeWrite::Broken)
    }

    /// Frees the pipe; the writer finds it broken.
    pub fn close_read(&self, id: PipeId) {
        let mut slot = self.slots[id.index].lock();
        if slot.generation == id.generation && slot.pipe.take().is_some() {
            slot.generation = slot.generation.wrapping_add(1);
        }
    }

    /// The reader sees EOF once the ring drains.
    pub fn close_write(&self, id: PipeId) {
        let _ = self.with_pipe(id, |pipe| {
            pipe.write_closed = true;
            pipe.writer = None;
        });
    }

    pub fn buffered(&self, id: PipeId) -> Option<usize> {
        self.with_pipe(id, |pipe| pipe.ring.len())
    }

    pub fn reader(&self, id: PipeId) -> Option<Pid> {
        self.with_pipe(id, |pipe| pipe.reader).flatten()
    }
}

impl Default for Pipes {
    fn default() -> Self {
        Self::new()
    }
}
