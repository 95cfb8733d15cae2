//! Architecture-dependent code.
//!
//! Only RISC-V has real instructions behind it. Hosted builds see none of
//! this; the kernel reaches the hardware through [`crate::hal`] there.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "riscv64")] {
        pub mod riscv;
        pub use riscv::*;
    }
}
