//! Architecture glue for the x86 protected-mode target
//!
//! Everything here is the thin layer between the portable kernel core and
//! the CPU: port I/O, the interrupt flag, descriptor table loads, and the
//! halt instruction. Test builds replace all of it with no-ops so the core
//! logic stays host-runnable.

/// Write a byte to an I/O port
#[cfg(all(any(target_arch = "x86", target_arch = "x86_64"), not(test)))]
pub fn outb(port: u16, value: u8) {
    unsafe {
        core::arch::asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack));
    }
}

/// Disable maskable interrupts
#[cfg(all(any(target_arch = "x86", target_arch = "x86_64"), not(test)))]
pub fn cli() {
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack));
    }
}

/// Enable maskable interrupts
#[cfg(all(any(target_arch = "x86", target_arch = "x86_64"), not(test)))]
pub fn sti() {
    unsafe {
        core::arch::asm!("sti", options(nomem, nostack));
    }
}

/// Halt until the next interrupt
#[cfg(all(any(target_arch = "x86", target_arch = "x86_64"), not(test)))]
pub fn wait_for_interrupt() {
    unsafe {
        core::arch::asm!("hlt", options(nomem, nostack));
    }
}

// Host/test variants: hardware touchpoints become no-ops.

#[cfg(any(test, not(any(target_arch = "x86", target_arch = "x86_64"))))]
pub fn outb(_port: u16, _value: u8) {}

#[cfg(any(test, not(any(target_arch = "x86", target_arch = "x86_64"))))]
pub fn cli() {}

#[cfg(any(test, not(any(target_arch = "x86", target_arch = "x86_64"))))]
pub fn sti() {}

#[cfg(any(test, not(any(target_arch = "x86", target_arch = "x86_64"))))]
pub fn wait_for_interrupt() {
    core::hint::spin_loop();
}

/// Pointer operand for `lgdt`/`lidt`
#[repr(C, packed)]
pub struct TablePointer {
    pub limit: u16,
    pub base: u32,
}

/// Load the global descriptor table register
///
/// # Safety
/// `ptr` must describe a live, correctly packed descriptor table.
#[cfg(all(target_arch = "x86", not(test)))]
pub unsafe fn lgdt(ptr: &TablePointer) {
    core::arch::asm!("lgdt [{0}]", in(reg) ptr, options(nostack));
}

/// Load the interrupt descriptor table register
///
/// # Safety
/// `ptr` must describe a live, correctly packed gate table.
#[cfg(all(target_arch = "x86", not(test)))]
pub unsafe fn lidt(ptr: &TablePointer) {
    core::arch::asm!("lidt [{0}]", in(reg) ptr, options(nostack));
}

/// Load the local descriptor table register with a GDT selector
///
/// # Safety
/// `selector` must index a valid LDT descriptor in the loaded GDT.
#[cfg(all(target_arch = "x86", not(test)))]
pub unsafe fn lldt(selector: u16) {
    core::arch::asm!("lldt {0:x}", in(reg) selector, options(nomem, nostack));
}

#[cfg(not(all(target_arch = "x86", not(test))))]
pub unsafe fn lgdt(_ptr: &TablePointer) {}

#[cfg(not(all(target_arch = "x86", not(test))))]
pub unsafe fn lidt(_ptr: &TablePointer) {}

#[cfg(not(all(target_arch = "x86", not(test))))]
pub unsafe fn lldt(_selector: u16) {}

/// Drop into user code through an interrupt-return frame
///
/// # Safety
/// The selectors must name live descriptors in the caller's private table
/// and `entry`/`stack` must be valid within those segments.
#[cfg(all(target_arch = "x86", not(test)))]
pub unsafe fn enter_user(code_sel: u16, entry: usize, data_sel: u16, stack: usize) -> ! {
    core::arch::asm!(
        "
        mov ds, dx
        mov es, dx
        push edx        // ss
        push {stack}    // esp
        pushfd
        push ecx        // cs
        push {entry}    // eip
        iretd
        ",
        in("cx") code_sel,
        in("dx") data_sel,
        stack = in(reg) stack,
        entry = in(reg) entry,
        options(noreturn),
    );
}

#[cfg(not(all(target_arch = "x86", not(test))))]
pub unsafe fn enter_user(_code_sel: u16, _entry: usize, _data_sel: u16, _stack: usize) -> ! {
    unreachable!("user entry is only reachable on the protected-mode target")
}
