//! Common types used across SegOS
//!
//! This module defines shared identifiers, privilege rings, and the
//! kernel error taxonomy to avoid circular dependencies.

/// Task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Pid(pub u32);

/// CPU privilege level encoded in segment access rights and selectors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ring {
    /// Ring 0 - kernel
    Kernel,
    /// Ring 1 - drivers
    Driver,
    /// Ring 3 - user applications
    User,
}

impl Ring {
    /// Descriptor privilege level bits for the access byte (bits 5-6)
    pub fn dpl_bits(self) -> u16 {
        (self.level() as u16) << 5
    }

    /// Numeric privilege level
    pub fn level(self) -> u8 {
        match self {
            Ring::Kernel => 0,
            Ring::Driver => 1,
            Ring::User => 3,
        }
    }

    /// Code segment selector for this ring (global table layout)
    pub fn code_selector(self) -> u16 {
        match self {
            Ring::Kernel => KERNEL_CODE_SELECTOR,
            Ring::Driver => DRIVER_CODE_SELECTOR,
            Ring::User => USER_CODE_SELECTOR,
        }
    }

    /// Data segment selector for this ring (global table layout)
    pub fn data_selector(self) -> u16 {
        match self {
            Ring::Kernel => KERNEL_DATA_SELECTOR,
            Ring::Driver => DRIVER_DATA_SELECTOR,
            Ring::User => USER_DATA_SELECTOR,
        }
    }
}

// Global descriptor table selectors (indices 1-6, null slot 0). The
// requested privilege in bits 0-1 equals the segment's DPL; a higher RPL
// against a more privileged segment would fault on load.
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
pub const DRIVER_CODE_SELECTOR: u16 = 0x19;
pub const DRIVER_DATA_SELECTOR: u16 = 0x21;
pub const USER_CODE_SELECTOR: u16 = 0x2B;
pub const USER_DATA_SELECTOR: u16 = 0x33;

/// Kernel error taxonomy
///
/// Allocator and loader failures propagate as ordinary results to their
/// direct caller; none of these is fatal to the kernel itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernError {
    /// Heap pool exhausted, or the free-extent table itself is full
    OutOfMemory,
    /// No free slot in the fixed task table
    TaskTableFull,
    /// Malformed or missing executable image
    LoadError,
    /// Descriptor base/limit would exceed its backing allocation
    InvalidDescriptor,
    /// File descriptor out of range or not open
    BadFileDescriptor,
    /// Pid does not name a live task
    NoSuchTask,
    /// Path does not resolve to a file
    NotFound,
    /// Operation not permitted at the caller's privilege
    NotPermitted,
    /// Pointer argument outside the caller's data segment
    BadAddress,
}

impl KernError {
    /// Errno-style value returned through the syscall register frame
    pub fn to_errno(self) -> isize {
        -1
    }
}

pub type KernResult<T> = Result<T, KernError>;
