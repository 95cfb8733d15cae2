use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// Mutual exclusion lock.
pub struct RawSpinlock {
    /// Is the lock held?
    locked: AtomicBool,

    /// For debugging: name of lock.
    name: &'static str,
}

impl RawSpinlock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            locked: AtomicBool::new(false),
            name,
        }
    }

    /// Acquire the lock.
    /// Loops (spins) until the lock is acquired.
    pub fn acquire(&self) {
        // On RISC-V, this turns into an atomic swap:
        //   a5 = 1
        //   s1 = &lk->locked
        //   amoswap.w.aq a5, a5, (s1)
        while self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // Hosted tests drive the kernel from one thread, where
            // contention can only mean the lock was taken twice.
            if cfg!(test) {
                panic!("acquire {}: already held", self.name);
            }
            core::hint::spin_loop();
        }
    }

    /// Release the lock.
    pub fn release(&self) {
        if !self.holding() {
            panic!("release {}", self.name);
        }
        self.locked.store(false, Ordering::Release);
    }

    /// Check whether the lock is held by anyone.
    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

pub struct Spinlock<T> {
    lock: RawSpinlock,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for Spinlock<T> {}

pub struct SpinlockGuard<'s, T> {
    lock: &'s Spinlock<T>,
    _marker: PhantomData<*const ()>,
}

// Do not implement Send; lock must be unlocked by the hart that acquired it.
unsafe impl<'s, T: Sync> Sync for SpinlockGuard<'s, T> {}

impl<T> Spinlock<T> {
    /// Returns a new `Spinlock` with name `name` and data `data`.
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            lock: RawSpinlock::new(name),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        self.lock.acquire();

        SpinlockGuard {
            lock: self,
            _marker: PhantomData,
        }
    }

    /// Returns a mutable reference to the inner data.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn holding(&self) -> bool {
        self.lock.holding()
    }

    /// Raw pointer to the inner data, for code outside Rust (the trap entry
    /// path) that accesses it without taking the lock.
    pub fn get_mut_raw(&self) -> *mut T {
        self.data.get()
    }
}

impl<T> fmt::Debug for Spinlock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spinlock")
            .field("name", &self.lock.name())
            .field("locked", &self.lock.holding())
            .finish()
    }
}

impl<T> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}

impl<T> Deref for SpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // Safe since we hold the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // Safe since we hold the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}
