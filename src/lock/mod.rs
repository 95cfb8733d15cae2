//! The lock module.
//!
//! Contains the spin lock that guards every shared kernel registry. Guards
//! release on drop, so a lock can never outlive the scope that took it.

mod spinlock;

pub use spinlock::{RawSpinlock, Spinlock, SpinlockGuard};
