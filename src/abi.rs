//! Structures shared with user space.

use zerocopy::{AsBytes, FromBytes};

use crate::param::{MAXFILENAME, MAXPROCNAME};

#[derive(Clone, Copy, Debug, Default, AsBytes, FromBytes)]
#[repr(C)]
pub struct SysInfo {
    pub procs: u64,
    pub totalram: u64,
    pub freeram: u64,
    pub unclaimed_start: u64,
    pub unclaimed_end: u64,
}

#[derive(Clone, Copy, Debug, Default, AsBytes, FromBytes)]
#[repr(C)]
pub struct ProcInfo {
    pub pid: u32,
    pub state: u32,
    pub nscheds: u64,
    pub name: [u8; MAXPROCNAME],
}

pub const DIRENT_FILE: u32 = 1 << 0;
pub const DIRENT_DIRECTORY: u32 = 1 << 1;

#[derive(Clone, Copy, Debug, Default, AsBytes, FromBytes)]
#[repr(C)]
pub struct Dirent {
    pub flags: u32,
    pub size: u32,
    pub name: [u8; MAXFILENAME],
}

impl Dirent {
    pub fn new(flags: u32, size: u32, name: &str) -> Self {
        let mut dirent = Self {
            flags,
            size,
            ..Self::default()
        };
        let len = name.len().min(MAXFILENAME - 1);
        dirent.name[..len].copy_from_slice(&name.as_bytes()[..len]);
        dirent
    }
}

/// `wait` until a child exits.
pub const WAIT_COND_CHILD: u32 = 0;
/// `wait` until `target_pid` has been scheduled `want_nscheds` more times.
pub const WAIT_COND_NSCHEDS: u32 = 1;

#[derive(Clone, Copy, Debug, Default, AsBytes, FromBytes)]
#[repr(C)]
pub struct WaitCond {
    pub kind: u32,
    pub target_pid: u32,
    pub want_nscheds: u64,
}
