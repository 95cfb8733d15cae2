use crate::trap::{Context, TrapFrame};

/// Per-hart state.
pub struct Cpu {
    /// Slot of the process running on this hart, or `None`.
    pub proc: Option<usize>,

    /// The one live trap frame of this hart. The trap stub saves user
    /// registers here on entry and restores them on return; sscratch
    /// points at it.
    pub trap_frame: TrapFrame,

    /// The hart's own stack, used while idle.
    pub context: Context,

    /// Slot the next scheduling pass starts from.
    pub next: usize,
}

impl Cpu {
    pub const fn new() -> Self {
        Self {
            proc: None,
            trap_frame: TrapFrame::new(),
            context: Context::new(),
            next: 0,
        }
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}
