//! Interrupt dispatch
//!
//! The sole place where asynchronous control transfer into the kernel
//! occurs. Hardware and software interrupts are routed through a 256-entry
//! handler table; the interrupt controller is acknowledged before the
//! handler runs, so handler re-entrancy can never lose the acknowledgment.

use spin::{Mutex, Once};

use crate::arch;
use crate::descriptor::GateDescriptor;
use crate::types::{Ring, KERNEL_CODE_SELECTOR};

/// Number of interrupt vectors
pub const VECTOR_COUNT: usize = 256;

/// First vector of the remapped primary controller
pub const IRQ_BASE: u8 = 32;
/// First vector of the remapped secondary controller
pub const IRQ_SECONDARY_BASE: u8 = 40;
/// Timer tick vector (IRQ 0 after remap)
pub const IRQ_TIMER: u8 = IRQ_BASE;
/// Software interrupt vector of the syscall gateway
pub const SYSCALL_VECTOR: u8 = 0x80;

/// CPU exception vectors live below this bound
pub const FAULT_LIMIT: u8 = 32;

/// Distance between consecutive per-vector entry stubs in bytes
pub const STUB_STRIDE: usize = 16;

/// CPU exception vectors that terminate an unhandled task
#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum Exception {
    DivideByZero = 0,
    InvalidOpcode = 6,
    DoubleFault = 8,
    InvalidTss = 10,
    SegmentNotPresent = 11,
    StackSegmentFault = 12,
    GeneralProtectionFault = 13,
}

/// Register block pushed on interrupt entry
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TrapFrame {
    // Pushed by the common stub (pusha order)
    pub edi: usize,
    pub esi: usize,
    pub ebp: usize,
    pub esp: usize,
    pub ebx: usize,
    pub edx: usize,
    pub ecx: usize,
    pub eax: usize,

    // Vector number and error code pushed by the per-vector stub
    pub int_no: usize,
    pub err_code: usize,

    // Pushed by the CPU
    pub eip: usize,
    pub cs: usize,
    pub eflags: usize,
}

/// Handler invoked with the trapped register frame
pub type Handler = fn(&mut TrapFrame);

/// What dispatch decided to do with a vector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// A registered handler ran
    Handled,
    /// No handler and no fault semantics; silently ignored
    Ignored,
    /// Unregistered CPU fault; the running task must be terminated
    FaultTask,
}

// ============================================================================
// Interrupt controller
// ============================================================================

const PIC1_CMD: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_CMD: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;
const PIC_EOI: u8 = 0x20;

/// The cascaded pair of interrupt controllers
pub struct Pic {
    #[cfg(test)]
    pub ack_log: heapless::Vec<u16, 32>,
}

impl Pic {
    pub const fn new() -> Self {
        Pic {
            #[cfg(test)]
            ack_log: heapless::Vec::new(),
        }
    }

    /// Remap the controllers so IRQs land on vectors 32..47 and unmask
    pub fn init(&mut self) {
        arch::outb(PIC1_CMD, 0x11);
        arch::outb(PIC2_CMD, 0x11);
        arch::outb(PIC1_DATA, IRQ_BASE);
        arch::outb(PIC2_DATA, IRQ_SECONDARY_BASE);
        arch::outb(PIC1_DATA, 0x04);
        arch::outb(PIC2_DATA, 0x02);
        arch::outb(PIC1_DATA, 0x01);
        arch::outb(PIC2_DATA, 0x01);
        arch::outb(PIC1_DATA, 0x00);
        arch::outb(PIC2_DATA, 0x00);
    }

    /// Acknowledge a delivered vector
    ///
    /// Vectors from the secondary controller need an end-of-interrupt on
    /// both chips; everything else only on the primary.
    pub fn acknowledge(&mut self, vector: u8) {
        if vector >= IRQ_SECONDARY_BASE {
            self.eoi(PIC2_CMD);
        }
        self.eoi(PIC1_CMD);
    }

    fn eoi(&mut self, port: u16) {
        #[cfg(test)]
        let _ = self.ack_log.push(port);
        arch::outb(port, PIC_EOI);
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Vector-to-handler table plus the controller it acknowledges
pub struct Dispatcher {
    handlers: [Option<Handler>; VECTOR_COUNT],
    pub pic: Pic,
    #[cfg(test)]
    pub trace: heapless::Vec<&'static str, 8>,
}

impl Dispatcher {
    pub const fn new() -> Self {
        Dispatcher {
            handlers: [None; VECTOR_COUNT],
            pic: Pic::new(),
            #[cfg(test)]
            trace: heapless::Vec::new(),
        }
    }

    /// Record a handler for a vector; re-registration overwrites
    pub fn register(&mut self, vector: u8, handler: Handler) {
        self.handlers[vector as usize] = Some(handler);
    }

    /// Route a hardware interrupt
    ///
    /// The controller is acknowledged before the handler is invoked.
    pub fn dispatch_irq(&mut self, frame: &mut TrapFrame) -> Disposition {
        let vector = frame.int_no as u8;
        self.pic.acknowledge(vector);
        #[cfg(test)]
        let _ = self.trace.push("eoi");

        match self.handlers[vector as usize] {
            Some(handler) => {
                #[cfg(test)]
                let _ = self.trace.push("handler");
                handler(frame);
                Disposition::Handled
            }
            None => Disposition::Ignored,
        }
    }

    /// Route a CPU exception
    ///
    /// An unregistered fault terminates the running task, never the
    /// kernel; the caller performs the termination.
    pub fn dispatch_fault(&mut self, frame: &mut TrapFrame) -> Disposition {
        let vector = frame.int_no as u8;
        match self.handlers[vector as usize] {
            Some(handler) => {
                handler(frame);
                Disposition::Handled
            }
            None if vector < FAULT_LIMIT => Disposition::FaultTask,
            None => Disposition::Ignored,
        }
    }
}

// ============================================================================
// Global dispatcher
// ============================================================================

static DISPATCHER: Once<Mutex<Dispatcher>> = Once::new();

fn dispatcher() -> &'static Mutex<Dispatcher> {
    DISPATCHER.call_once(|| Mutex::new(Dispatcher::new()))
}

/// Remap the interrupt controllers and reset the vector table
pub fn init() {
    dispatcher().lock().pic.init();
}

/// Record a handler for later dispatch; drivers call this directly
pub fn register_interrupt_handler(vector: u8, handler: Handler) {
    dispatcher().lock().register(vector, handler);
}

/// Entry point from the hardware-interrupt stubs
pub fn irq_entry(frame: &mut TrapFrame) {
    // The handler may need the dispatcher itself (re-registration), so the
    // lock is dropped before invoking it.
    let (handler, _) = {
        let mut disp = dispatcher().lock();
        let vector = frame.int_no as u8;
        disp.pic.acknowledge(vector);
        (disp.handlers[vector as usize], vector)
    };
    if let Some(handler) = handler {
        handler(frame);
    }
}

/// Entry point for the software-interrupt gateway vector
///
/// No controller is involved; the gate's ring-3 DPL is the only thing
/// that lets user code reach here.
pub fn software_entry(frame: &mut TrapFrame) {
    let handler = {
        let disp = dispatcher().lock();
        disp.handlers[(frame.int_no as u8) as usize]
    };
    if let Some(handler) = handler {
        handler(frame);
    }
}

/// Entry point from the CPU exception stubs
pub fn fault_entry(frame: &mut TrapFrame) {
    arch::cli();
    let disposition = {
        let mut disp = dispatcher().lock();
        let vector = frame.int_no as u8;
        match disp.handlers[vector as usize] {
            Some(handler) => {
                drop(disp);
                handler(frame);
                Disposition::Handled
            }
            None if vector < FAULT_LIMIT => Disposition::FaultTask,
            None => Disposition::Ignored,
        }
    };
    if disposition == Disposition::FaultTask {
        crate::println!("unhandled fault {}, terminating task", frame.int_no);
        crate::scheduler::exit(-1);
    }
}

// ============================================================================
// Vector stubs and gate table
// ============================================================================

/// Route one trapped frame by vector class
///
/// Called from the common assembly path with the frame assembled on the
/// kernel stack: faults below 32, the software gateway at 0x80, hardware
/// vectors for everything else.
pub extern "C" fn trap_dispatch(frame: &mut TrapFrame) {
    let vector = frame.int_no as u8;
    if vector < FAULT_LIMIT {
        fault_entry(frame);
    } else if vector == SYSCALL_VECTOR {
        software_entry(frame);
    } else {
        irq_entry(frame);
    }
}

/// Pack the full gate table for the given stub entry addresses
///
/// Every gate targets kernel code at DPL 0 except the software gateway,
/// which must be reachable from ring 3.
pub fn build_idt(stubs: &[usize; VECTOR_COUNT]) -> [[u8; 8]; VECTOR_COUNT] {
    core::array::from_fn(|vector| {
        let ring = if vector == SYSCALL_VECTOR as usize {
            Ring::User
        } else {
            Ring::Kernel
        };
        GateDescriptor::interrupt_gate(KERNEL_CODE_SELECTOR, stubs[vector], ring).encode()
    })
}

// One 16-byte stub per vector. Vectors where the CPU pushes an error code
// skip the dummy push so the frame layout stays uniform. The common path
// builds the register block `TrapFrame` describes, switches to kernel data
// segments, and hands the frame to `trap_dispatch`.
#[cfg(all(target_arch = "x86", not(test)))]
core::arch::global_asm!(
    "
    .section .text
    .altmacro
    .macro vector_stub n
        .balign 16
        .if (\\n == 8) || (\\n == 10) || (\\n == 11) || (\\n == 12) || (\\n == 13) || (\\n == 14) || (\\n == 17)
            push \\n
        .else
            push 0
            push \\n
        .endif
        jmp vector_common
    .endm

    .balign 16
    .global vector_stubs_base
vector_stubs_base:
    .set vec, 0
    .rept 256
        vector_stub %vec
        .set vec, vec + 1
    .endr

vector_common:
    pusha
    push ds
    push es
    push fs
    push gs
    mov ax, {ksel}
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax
    lea eax, [esp + 16]
    push eax
    call {dispatch}
    add esp, 4
    pop gs
    pop fs
    pop es
    pop ds
    popa
    add esp, 8
    iretd
    ",
    ksel = const crate::types::KERNEL_DATA_SELECTOR,
    dispatch = sym trap_dispatch,
);

#[cfg(all(target_arch = "x86", not(test)))]
extern "C" {
    static vector_stubs_base: u8;
}

/// Entry addresses of the 256 per-vector stubs
#[cfg(all(target_arch = "x86", not(test)))]
pub fn vector_stubs() -> [usize; VECTOR_COUNT] {
    let base = unsafe { &vector_stubs_base as *const u8 as usize };
    core::array::from_fn(|vector| base + vector * STUB_STRIDE)
}

#[cfg(not(all(target_arch = "x86", not(test))))]
pub fn vector_stubs() -> [usize; VECTOR_COUNT] {
    [0; VECTOR_COUNT]
}
