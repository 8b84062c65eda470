//! Panic handler
//!
//! Panics are reserved for unrecoverable boot-time failures; every runtime
//! error in the core propagates as a `KernResult` instead.

#[cfg(not(test))]
use core::panic::PanicInfo;

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    kernel_panic(info)
}

#[cfg(not(test))]
pub fn kernel_panic(info: &PanicInfo) -> ! {
    crate::println!("\n!!! KERNEL PANIC !!!");

    if let Some(location) = info.location() {
        crate::println!("Location: {}:{}", location.file(), location.line());
    }
    crate::println!("Message: {}", info.message());
    crate::println!("System halted.");

    crate::arch::cli();
    loop {
        crate::arch::wait_for_interrupt();
    }
}
