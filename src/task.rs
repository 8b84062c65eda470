//! Task records and the fixed task table
//!
//! One record per task slot in a fixed-capacity table. The scheduler owns
//! the table exclusively; a task's private descriptor table is owned by
//! that task alone and never shared.

use crate::descriptor::LocalTable;
use crate::fs::FileHandle;
use crate::types::{KernError, KernResult, Pid, Ring};

/// Capacity of the task table
pub const MAX_TASKS: usize = 32;

/// Per-task file descriptor slots; 0-2 are the standard streams
pub const MAX_OPEN_FILES: usize = 32;

/// Kernel stack handed to every new task
pub const KERNEL_STACK_SIZE: usize = 64 * 1024;

/// Run states of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Eligible for the next scheduling decision
    Ready,
    /// Currently executing; exactly one task at any instant
    Running,
    /// Voluntarily blocked
    Sleeping,
    /// Terminated, exit value not yet collected
    Zombie,
    /// Administratively parked; never scheduled
    Stopped,
}

/// Saved register, segment, and stack-pointer state
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Context {
    pub eip: usize,
    pub esp: usize,
    pub eflags: usize,
    pub eax: usize,
    pub ecx: usize,
    pub edx: usize,
    pub ebx: usize,
    pub ebp: usize,
    pub esi: usize,
    pub edi: usize,
    pub cs: u16,
    pub ds: u16,
    pub es: u16,
    pub ss: u16,
    pub fs: u16,
    pub gs: u16,
}

/// Interrupts-enabled flag seeded into every new context
pub const INITIAL_EFLAGS: usize = 0x202;

/// One entry of the task table
pub struct TaskRecord {
    pub pid: Pid,
    pub state: TaskState,
    pub ring: Ring,
    pub context: Context,

    /// Private two-entry (code, data) descriptor table
    pub ldt: LocalTable,
    /// Flat base of the task's data segment; 0 for kernel-view tasks
    pub ds_base: usize,
    pub is_user: bool,

    pub fd_table: [Option<FileHandle>; MAX_OPEN_FILES],

    /// Program break: current allocation cursor, task-relative
    pub brk: usize,
    /// Current data-segment ceiling, task-relative
    pub brk_ceiling: usize,

    pub exit_value: i32,

    // Heap allocations owned by this task, reclaimed on slot release
    pub stack_alloc: usize,
    pub code_alloc: usize,
    pub data_alloc: usize,

    pub cwd: heapless::String<128>,
    pub args: heapless::String<256>,
    /// Image path handed to the loader trampoline
    pub exec_path: heapless::String<128>,
}

impl TaskRecord {
    /// Fresh record; standard streams pre-wired, everything else empty
    pub fn new(pid: Pid, ring: Ring) -> Self {
        let mut fd_table = [const { None }; MAX_OPEN_FILES];
        fd_table[0] = Some(FileHandle::Stdin);
        fd_table[1] = Some(FileHandle::Stdout);
        fd_table[2] = Some(FileHandle::Stderr);

        TaskRecord {
            pid,
            state: TaskState::Stopped,
            ring,
            context: Context::default(),
            ldt: LocalTable::new(),
            ds_base: 0,
            is_user: false,
            fd_table,
            brk: 0,
            brk_ceiling: 0,
            exit_value: 0,
            stack_alloc: 0,
            code_alloc: 0,
            data_alloc: 0,
            cwd: heapless::String::new(),
            args: heapless::String::new(),
            exec_path: heapless::String::new(),
        }
    }

    /// Bind a handle to the lowest free descriptor slot
    pub fn bind_fd(&mut self, handle: FileHandle) -> KernResult<usize> {
        for (fd, slot) in self.fd_table.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(handle);
                return Ok(fd);
            }
        }
        Err(KernError::BadFileDescriptor)
    }

    /// Borrow an open handle
    pub fn fd(&mut self, fd: usize) -> KernResult<&mut FileHandle> {
        self.fd_table
            .get_mut(fd)
            .and_then(|slot| slot.as_mut())
            .ok_or(KernError::BadFileDescriptor)
    }

    /// Close a descriptor; the standard streams cannot be closed
    pub fn close_fd(&mut self, fd: usize) -> KernResult<()> {
        if fd < 3 || fd >= MAX_OPEN_FILES {
            return Err(KernError::BadFileDescriptor);
        }
        match self.fd_table[fd].take() {
            Some(_) => Ok(()),
            None => Err(KernError::BadFileDescriptor),
        }
    }
}

/// Fixed-capacity table of task slots
pub struct TaskTable {
    slots: [Option<TaskRecord>; MAX_TASKS],
    next_pid: u32,
}

impl TaskTable {
    pub fn new() -> Self {
        TaskTable {
            slots: [const { None }; MAX_TASKS],
            next_pid: 1,
        }
    }

    /// Claim a free slot for a new task
    pub fn alloc(&mut self, ring: Ring) -> KernResult<Pid> {
        let slot = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(KernError::TaskTableFull)?;
        let pid = Pid(self.next_pid);
        self.next_pid += 1;
        self.slots[slot] = Some(TaskRecord::new(pid, ring));
        Ok(pid)
    }

    /// Index of the slot holding `pid`
    pub fn slot_of(&self, pid: Pid) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|t| t.pid == pid))
    }

    pub fn get(&self, pid: Pid) -> Option<&TaskRecord> {
        self.slots
            .iter()
            .filter_map(|s| s.as_ref())
            .find(|t| t.pid == pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut TaskRecord> {
        self.slots
            .iter_mut()
            .filter_map(|s| s.as_mut())
            .find(|t| t.pid == pid)
    }

    pub fn by_slot(&self, slot: usize) -> Option<&TaskRecord> {
        self.slots.get(slot).and_then(|s| s.as_ref())
    }

    pub fn by_slot_mut(&mut self, slot: usize) -> Option<&mut TaskRecord> {
        self.slots.get_mut(slot).and_then(|s| s.as_mut())
    }

    /// Return a slot to the pool, yielding the record for reclamation
    pub fn release(&mut self, pid: Pid) -> Option<TaskRecord> {
        let slot = self.slot_of(pid)?;
        self.slots[slot].take()
    }

    /// Live records, in slot order
    pub fn iter(&self) -> impl Iterator<Item = &TaskRecord> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        MAX_TASKS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_allocates_unique_pids() {
        let mut table = TaskTable::new();
        let a = table.alloc(Ring::Kernel).unwrap();
        let b = table.alloc(Ring::User).unwrap();
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn table_full_is_reported_not_fatal() {
        let mut table = TaskTable::new();
        for _ in 0..MAX_TASKS {
            table.alloc(Ring::Kernel).unwrap();
        }
        assert_eq!(table.alloc(Ring::Kernel), Err(KernError::TaskTableFull));
    }

    #[test]
    fn released_slot_is_reusable() {
        let mut table = TaskTable::new();
        for _ in 0..MAX_TASKS {
            table.alloc(Ring::Kernel).unwrap();
        }
        let victim = table.iter().nth(3).unwrap().pid;
        assert!(table.release(victim).is_some());
        let replacement = table.alloc(Ring::User).unwrap();
        assert!(table.get(replacement).is_some());
        assert!(table.get(victim).is_none());
    }

    #[test]
    fn standard_streams_are_prewired() {
        let task = TaskRecord::new(Pid(1), Ring::User);
        assert!(matches!(task.fd_table[0], Some(FileHandle::Stdin)));
        assert!(matches!(task.fd_table[1], Some(FileHandle::Stdout)));
        assert!(matches!(task.fd_table[2], Some(FileHandle::Stderr)));
        assert!(task.fd_table[3].is_none());
    }

    #[test]
    fn bind_fd_skips_reserved_slots() {
        let mut task = TaskRecord::new(Pid(1), Ring::User);
        let fd = task.bind_fd(FileHandle::Stdout).unwrap();
        assert_eq!(fd, 3);
    }

    #[test]
    fn reserved_streams_cannot_be_closed() {
        let mut task = TaskRecord::new(Pid(1), Ring::User);
        assert_eq!(task.close_fd(1), Err(KernError::BadFileDescriptor));
        let fd = task.bind_fd(FileHandle::Stdout).unwrap();
        assert!(task.close_fd(fd).is_ok());
        assert_eq!(task.close_fd(fd), Err(KernError::BadFileDescriptor));
    }
}
