use log::error;

/// Parks the hart for good.
fn abort_impl() -> ! {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "riscv64")] {
            crate::arch::intr_off();
            loop {
                crate::arch::wait_for_interrupt();
            }
        } else {
            loop {
                core::hint::spin_loop();
            }
        }
    }
}

#[panic_handler]
fn panic_handler(info: &core::panic::PanicInfo<'_>) -> ! {
    error!("panic: {}", info);
    abort_impl()
}
