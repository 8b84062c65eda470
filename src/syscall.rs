//! Syscall gateway
//!
//! User tasks reach the kernel through one software-interrupt vector. The
//! operation number arrives in `eax`, up to three arguments in `ebx`,
//! `ecx`, `edx`, and the result goes back into the frame's saved `eax`.
//!
//! Pointer arguments are segment-relative offsets, not flat addresses.
//! Every one of them passes through [`translate`], which rebases against
//! the caller's data-segment base and rejects anything reaching past the
//! segment limit. This is the only place user-supplied addresses are ever
//! turned into kernel pointers.

use crate::exec;
use crate::fs::{FileHandle, Filesystem, OpenFile, OpenFlags, Whence};
use crate::heap::KernelHeap;
use crate::interrupt::TrapFrame;
use crate::scheduler::Scheduler;
use crate::task::TaskRecord;
use crate::types::{KernError, KernResult, Pid};

pub const OP_GETPID: usize = 0;
pub const OP_WRITE: usize = 1;
pub const OP_READ: usize = 2;
pub const OP_OPEN: usize = 3;
pub const OP_CLOSE: usize = 4;
pub const OP_LSEEK: usize = 5;
pub const OP_UNLINK: usize = 6;
pub const OP_CREATE_PROCESS: usize = 7;
pub const OP_WAIT: usize = 8;
pub const OP_EXIT: usize = 9;
pub const OP_SBRK: usize = 10;

/// Longest path accepted from a caller
pub const MAX_PATH: usize = 128;
/// Longest command line accepted from a caller
pub const MAX_CMDLINE: usize = 256;

/// Rebase a caller-relative pointer into a kernel address
///
/// Kernel-view tasks address the flat space directly, so the offset passes
/// through unchanged. For user tasks `[offset, offset + len)` must lie
/// inside the data segment the task's own descriptor defines.
pub fn translate(task: &TaskRecord, offset: usize, len: usize) -> KernResult<usize> {
    if !task.is_user {
        return Ok(offset);
    }
    let seg_size = task.ldt.data().decoded_limit() + 1;
    if offset.saturating_add(len) > seg_size {
        return Err(KernError::BadAddress);
    }
    Ok(task.ds_base + offset)
}

/// Copy a NUL-terminated string out of the caller's data segment
///
/// Bounded by both the capacity `N` and the segment limit; a string that
/// runs to either bound without a terminator is a bad address.
fn read_caller_str<const N: usize>(
    task: &TaskRecord,
    offset: usize,
) -> KernResult<heapless::String<N>> {
    let mut s = heapless::String::new();
    for i in 0..=N {
        let addr = translate(task, offset + i, 1)?;
        let byte = unsafe { (addr as *const u8).read() };
        if byte == 0 {
            return Ok(s);
        }
        s.push(byte as char).map_err(|_| KernError::BadAddress)?;
    }
    Err(KernError::BadAddress)
}

fn current<'a>(sched: &'a mut Scheduler) -> KernResult<&'a mut TaskRecord> {
    sched.current_mut().ok_or(KernError::NoSuchTask)
}

// ============================================================================
// Operations
// ============================================================================

fn op_getpid(sched: &mut Scheduler) -> KernResult<usize> {
    Ok(current(sched)?.pid.0 as usize)
}

fn op_write(
    sched: &mut Scheduler,
    fs: &dyn Filesystem,
    fd: usize,
    offset: usize,
    len: usize,
) -> KernResult<usize> {
    let addr = translate(current(sched)?, offset, len)?;
    let buf = unsafe { core::slice::from_raw_parts(addr as *const u8, len) };

    let task = current(sched)?;
    match task.fd(fd)? {
        FileHandle::Stdout | FileHandle::Stderr => {
            Ok(crate::console::with_console(|con| con.write_bytes(buf)))
        }
        FileHandle::Stdin => Err(KernError::BadFileDescriptor),
        FileHandle::File(open) => {
            if !open.flags.writable() {
                return Err(KernError::NotPermitted);
            }
            let n = fs.write(&mut open.info, open.pos, buf)?;
            open.pos += n;
            Ok(n)
        }
    }
}

fn op_read(
    sched: &mut Scheduler,
    fs: &dyn Filesystem,
    fd: usize,
    offset: usize,
    len: usize,
) -> KernResult<usize> {
    let addr = translate(current(sched)?, offset, len)?;
    let buf = unsafe { core::slice::from_raw_parts_mut(addr as *mut u8, len) };

    let task = current(sched)?;
    match task.fd(fd)? {
        // No input collaborator is wired up; reads report end of stream
        FileHandle::Stdin => Ok(0),
        FileHandle::Stdout | FileHandle::Stderr => Err(KernError::BadFileDescriptor),
        FileHandle::File(open) => {
            if !open.flags.readable() {
                return Err(KernError::NotPermitted);
            }
            let n = fs.read(&open.info, open.pos, buf)?;
            open.pos += n;
            Ok(n)
        }
    }
}

fn op_open(
    sched: &mut Scheduler,
    fs: &dyn Filesystem,
    path_off: usize,
    raw_flags: usize,
) -> KernResult<usize> {
    let task = current(sched)?;
    let path: heapless::String<MAX_PATH> = read_caller_str(task, path_off)?;
    let flags = OpenFlags(raw_flags as u32);
    let info = fs.open(path.as_str(), flags)?;
    task.bind_fd(FileHandle::File(OpenFile {
        info,
        pos: 0,
        flags,
    }))
}

fn op_close(sched: &mut Scheduler, fd: usize) -> KernResult<usize> {
    current(sched)?.close_fd(fd)?;
    Ok(0)
}

fn op_lseek(sched: &mut Scheduler, fd: usize, offset: isize, raw_whence: usize) -> KernResult<usize> {
    let whence = Whence::from_raw(raw_whence)?;
    match current(sched)?.fd(fd)? {
        FileHandle::File(open) => open.seek(offset, whence),
        _ => Err(KernError::BadFileDescriptor),
    }
}

fn op_unlink(sched: &mut Scheduler, fs: &dyn Filesystem, path_off: usize) -> KernResult<usize> {
    let path: heapless::String<MAX_PATH> = read_caller_str(current(sched)?, path_off)?;
    fs.unlink(path.as_str())?;
    Ok(0)
}

fn op_create_process(
    sched: &mut Scheduler,
    heap: &mut KernelHeap,
    fs: &dyn Filesystem,
    path_off: usize,
    cmdline_off: usize,
    cwd_off: usize,
) -> KernResult<usize> {
    let (path, cmdline, cwd) = {
        let task = current(sched)?;
        let path: heapless::String<MAX_PATH> = read_caller_str(task, path_off)?;
        let cmdline: heapless::String<MAX_CMDLINE> = if cmdline_off == 0 {
            heapless::String::new()
        } else {
            read_caller_str(task, cmdline_off)?
        };
        // A null cwd pointer means the child starts where the parent is
        let cwd: heapless::String<MAX_PATH> = if cwd_off == 0 {
            let mut inherited = heapless::String::new();
            let _ = inherited.push_str(task.cwd.as_str());
            inherited
        } else {
            read_caller_str(task, cwd_off)?
        };
        (path, cmdline, cwd)
    };
    let pid = exec::create_process(
        sched,
        heap,
        fs,
        path.as_str(),
        cmdline.as_str(),
        cwd.as_str(),
    )?;
    Ok(pid.0 as usize)
}

fn op_wait(sched: &mut Scheduler, heap: &mut KernelHeap, pid: Pid) -> KernResult<usize> {
    loop {
        if let Some(value) = sched.reap(heap, pid)? {
            return Ok(value as usize);
        }
        // Yield until the child exits; the next tick resumes the poll
        sched.switch();
    }
}

fn op_sbrk(sched: &mut Scheduler, heap: &mut KernelHeap, increment: isize) -> KernResult<usize> {
    exec::sbrk(current(sched)?, heap, increment)
}

// ============================================================================
// Dispatch
// ============================================================================

/// Decode and execute one syscall against explicit collaborators
///
/// The result (or an errno-style `-1`) is written into the frame's saved
/// `eax`, which the interrupt return restores into the caller's register.
/// Unknown operation numbers return 0.
pub fn dispatch(
    sched: &mut Scheduler,
    heap: &mut KernelHeap,
    fs: &dyn Filesystem,
    frame: &mut TrapFrame,
) {
    let (b, c, d) = (frame.ebx, frame.ecx, frame.edx);
    let result = match frame.eax {
        OP_GETPID => op_getpid(sched),
        OP_WRITE => op_write(sched, fs, b, c, d),
        OP_READ => op_read(sched, fs, b, c, d),
        OP_OPEN => op_open(sched, fs, b, c),
        OP_CLOSE => op_close(sched, b),
        OP_LSEEK => op_lseek(sched, b, c as isize, d),
        OP_UNLINK => op_unlink(sched, fs, b),
        OP_CREATE_PROCESS => op_create_process(sched, heap, fs, b, c, d),
        OP_WAIT => op_wait(sched, heap, Pid(b as u32)),
        OP_EXIT => {
            sched.exit_current(b as i32);
            Ok(0)
        }
        OP_SBRK => op_sbrk(sched, heap, b as isize),
        _ => Ok(0),
    };
    frame.eax = match result {
        Ok(value) => value,
        Err(e) => e.to_errno() as usize,
    };
}

/// Entry point hooked on the software-interrupt vector
///
/// `exit` and `wait` suspend the caller, so they go through the
/// scheduler's switching forms instead of the in-place dispatch.
pub fn syscall_entry(frame: &mut TrapFrame) {
    match frame.eax {
        OP_EXIT => crate::scheduler::exit(frame.ebx as i32),
        OP_WAIT => {
            frame.eax = match crate::scheduler::wait(Pid(frame.ebx as u32)) {
                Ok(value) => value as usize,
                Err(e) => e.to_errno() as usize,
            };
        }
        // Lock order is heap, then scheduler, matching the scheduler's
        // own create/wait paths.
        _ => crate::heap::with_heap(|heap| {
            crate::scheduler::with_scheduler(|sched| {
                dispatch(sched, heap, crate::startup::boot_filesystem(), frame);
            })
        }),
    }
}

/// Hook the gateway onto its vector
pub fn init() {
    crate::interrupt::register_interrupt_handler(crate::interrupt::SYSCALL_VECTOR, syscall_entry);
}
