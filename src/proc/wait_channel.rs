use crate::pipe::PipeId;

use super::Pid;

/// What a sleeping process is waiting for.
///
/// Wakeups are level-triggered: `mark_for_wakeup` readies every process
/// sleeping on an equal channel, and each of them re-checks the resource
/// when it runs again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Channel {
    /// Data or space in a pipe, or its teardown.
    Pipe(PipeId),

    /// A child of the given process exited or detached.
    Child(Pid),

    /// The given process was dispatched.
    Sched(Pid),

    /// Console input arrived.
    Console,

    /// Driver-defined device event.
    Device(u32),
}
