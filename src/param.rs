/// maximum number of processes
pub const NPROC: usize = 8;

/// maximum number of harts
pub const NHART: usize = 4;

/// open files per process
pub const NOFILE: usize = 8;

/// open files per system
pub const NFILE: usize = 32;

/// maximum number of pipes alive at once
pub const NPIPE: usize = 4;

/// maximum number of pages the allocator can track
pub const MAX_PAGES: usize = 512;

/// number of PMP address registers
pub const NUM_PMP: usize = 16;

/// max exec arguments
pub const MAXARG: usize = 16;

/// max length of a single exec argument, including the nul
pub const MAXARGLEN: usize = 64;

/// maximum file path name
pub const MAXPATH: usize = 64;

/// maximum length of a process name, including the nul
pub const MAXPROCNAME: usize = 16;

/// maximum length of a directory entry name
pub const MAXFILENAME: usize = 32;

/// timer ticks per second
pub const TIMEBASE_FREQ: u64 = 10_000_000;

/// default length of a scheduling quantum, in timer ticks
pub const SCHED_TICK: u64 = TIMEBASE_FREQ;

/// stdin, stdout and stderr
pub const NSTDFILE: usize = 3;

/// maximum number of directory entries returned by one lsdir
pub const MAXDIRENTS: usize = 16;
