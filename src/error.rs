//! Error numbers reported to user space through the errno word.

use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[repr(i32)]
pub enum Errno {
    #[error("no such file or directory")]
    ENOENT = 2,
    #[error("no such process")]
    ESRCH = 3,
    #[error("bad file descriptor")]
    EBADF = 9,
    #[error("no child processes")]
    ECHILD = 10,
    #[error("out of memory")]
    ENOMEM = 12,
    #[error("bad address")]
    EFAULT = 14,
    #[error("resource busy")]
    EBUSY = 16,
    #[error("invalid argument")]
    EINVAL = 22,
    #[error("too many open files in system")]
    ENFILE = 23,
    #[error("too many open files")]
    EMFILE = 24,
    #[error("broken pipe")]
    EPIPE = 32,
    #[error("function not implemented")]
    ENOSYS = 38,
    #[error("file descriptor in bad state")]
    EBADFD = 77,
    #[error("no buffer space available")]
    ENOBUFS = 105,
}

impl Errno {
    pub const fn code(self) -> i32 {
        self as i32
    }
}
