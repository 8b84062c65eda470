//! Task scheduler
//!
//! Owns the fixed task table, performs round-robin context switches from
//! the timer interrupt, and exposes the task lifecycle: create, run,
//! switch, exit, wait. There is exactly one running task at any instant;
//! concurrency is entirely interrupt-driven preemption at the timer tick.

use spin::{Mutex, Once};

use crate::heap::KernelHeap;
use crate::interrupt::{self, TrapFrame};
use crate::task::{Context, TaskRecord, TaskState, TaskTable, INITIAL_EFLAGS, KERNEL_STACK_SIZE, MAX_TASKS};
use crate::types::{KernError, KernResult, Pid, Ring};

/// Outcome of one scheduling decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Switch {
    /// Task that was running before the decision, if any
    pub from: Option<Pid>,
    /// Task now running; equals `from` on a trivial self-switch
    pub to: Pid,
}

/// The scheduler state: task table plus the running slot
pub struct Scheduler {
    pub table: TaskTable,
    current: Option<usize>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            table: TaskTable::new(),
            current: None,
        }
    }

    /// Adopt the already-executing boot flow as task zero
    ///
    /// The boot task runs on the boot stack, so no stack is allocated.
    pub fn adopt_boot(&mut self) -> KernResult<Pid> {
        let pid = self.table.alloc(Ring::Kernel)?;
        let slot = self.table.slot_of(pid).ok_or(KernError::NoSuchTask)?;
        if let Some(task) = self.table.by_slot_mut(slot) {
            task.state = TaskState::Running;
        }
        self.current = Some(slot);
        Ok(pid)
    }

    /// Allocate a task record and private stack; the task stays parked
    /// until [`run`](Self::run) makes it schedulable.
    pub fn create(&mut self, heap: &mut KernelHeap, entry: usize, ring: Ring) -> KernResult<Pid> {
        let pid = self.table.alloc(ring)?;

        let stack = match heap.kmalloc(KERNEL_STACK_SIZE) {
            Ok(addr) => addr,
            Err(e) => {
                self.table.release(pid);
                return Err(e);
            }
        };

        let task = self.table.get_mut(pid).ok_or(KernError::NoSuchTask)?;
        task.stack_alloc = stack;
        task.context = Context {
            eip: entry,
            esp: stack + KERNEL_STACK_SIZE - core::mem::size_of::<usize>(),
            eflags: INITIAL_EFLAGS,
            cs: ring.code_selector(),
            ds: ring.data_selector(),
            es: ring.data_selector(),
            ss: ring.data_selector(),
            fs: ring.data_selector(),
            gs: ring.data_selector(),
            ..Context::default()
        };
        Ok(pid)
    }

    /// Make a task eligible for the next scheduling decision
    pub fn run(&mut self, pid: Pid) -> KernResult<()> {
        let task = self.table.get_mut(pid).ok_or(KernError::NoSuchTask)?;
        match task.state {
            TaskState::Stopped | TaskState::Sleeping => {
                task.state = TaskState::Ready;
                Ok(())
            }
            TaskState::Ready | TaskState::Running => Ok(()),
            TaskState::Zombie => Err(KernError::NoSuchTask),
        }
    }

    /// Round-robin scheduling decision
    ///
    /// Demotes the running task to ready, then scans the table starting
    /// just past it, wrapping; the previous task is considered last, so
    /// every other ready task gets a turn before it runs again. Returns
    /// `None` when nothing is ready.
    pub fn switch(&mut self) -> Option<Switch> {
        let from = self
            .current
            .and_then(|slot| self.table.by_slot(slot))
            .map(|t| t.pid);

        if let Some(slot) = self.current {
            if let Some(task) = self.table.by_slot_mut(slot) {
                if task.state == TaskState::Running {
                    task.state = TaskState::Ready;
                }
            }
        }

        let start = self.current.map(|slot| slot + 1).unwrap_or(0);
        for i in 0..MAX_TASKS {
            let slot = (start + i) % MAX_TASKS;
            let ready = self
                .table
                .by_slot(slot)
                .is_some_and(|t| t.state == TaskState::Ready);
            if ready {
                let task = self.table.by_slot_mut(slot).expect("slot checked above");
                task.state = TaskState::Running;
                let to = task.pid;
                self.current = Some(slot);
                return Some(Switch { from, to });
            }
        }
        None
    }

    /// Terminate the running task, storing its exit value
    ///
    /// The slot stays occupied (zombie) until a `wait` collects it; the
    /// caller must follow up with a switch and never resume this task.
    pub fn exit_current(&mut self, value: i32) {
        if let Some(slot) = self.current {
            if let Some(task) = self.table.by_slot_mut(slot) {
                task.exit_value = value;
                task.state = TaskState::Zombie;
            }
        }
    }

    /// Collect an exited task: returns its exit value once it is a
    /// zombie, releasing the slot and every allocation it owned.
    pub fn reap(&mut self, heap: &mut KernelHeap, pid: Pid) -> KernResult<Option<i32>> {
        let task = self.table.get(pid).ok_or(KernError::NoSuchTask)?;
        if task.state != TaskState::Zombie {
            return Ok(None);
        }
        let record = self.table.release(pid).ok_or(KernError::NoSuchTask)?;
        heap.kfree(record.stack_alloc);
        heap.kfree(record.code_alloc);
        heap.kfree(record.data_alloc);
        Ok(Some(record.exit_value))
    }

    /// The currently running task
    pub fn current(&self) -> Option<&TaskRecord> {
        self.current.and_then(|slot| self.table.by_slot(slot))
    }

    pub fn current_mut(&mut self) -> Option<&mut TaskRecord> {
        self.current.and_then(|slot| self.table.by_slot_mut(slot))
    }

    pub fn current_pid(&self) -> Option<Pid> {
        self.current().map(|t| t.pid)
    }
}

// ============================================================================
// Context switch
// ============================================================================

/// Swap saved register state; the protected-mode switch restores the
/// callee-saved registers and stack of the target context.
#[cfg(all(target_arch = "x86", not(test)))]
unsafe fn context_switch(from: *mut Context, to: *const Context) {
    core::arch::asm!(
        "
        // Save outgoing callee-saved state
        mov [{from} + 0x1C], ebx
        mov [{from} + 0x20], ebp
        mov [{from} + 0x24], esi
        mov [{from} + 0x28], edi
        mov [{from} + 0x04], esp
        lea eax, [2f]
        mov [{from} + 0x00], eax
        pushfd
        pop eax
        mov [{from} + 0x08], eax

        // Load incoming state
        mov ebx, [{to} + 0x1C]
        mov ebp, [{to} + 0x20]
        mov esi, [{to} + 0x24]
        mov edi, [{to} + 0x28]
        mov esp, [{to} + 0x04]
        push dword ptr [{to} + 0x08]
        popfd
        jmp dword ptr [{to} + 0x00]
        2:
        ",
        from = in(reg) from,
        to = in(reg) to,
        out("eax") _,
    );
}

#[cfg(not(all(target_arch = "x86", not(test))))]
unsafe fn context_switch(_from: *mut Context, _to: *const Context) {
    // Host builds only exercise the scheduling decision, not the swap
}

// ============================================================================
// Global scheduler
// ============================================================================

static SCHEDULER: Once<Mutex<Scheduler>> = Once::new();

/// Initialize the scheduler and adopt the boot flow as task zero
pub fn init() -> KernResult<Pid> {
    let sched = SCHEDULER.call_once(|| Mutex::new(Scheduler::new()));
    sched.lock().adopt_boot()
}

fn global() -> &'static Mutex<Scheduler> {
    SCHEDULER.get().expect("scheduler not initialized")
}

/// Run a closure against the global scheduler
pub fn with_scheduler<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    f(&mut global().lock())
}

/// Create a task running `entry` at the given privilege
pub fn create(entry: usize, ring: Ring) -> KernResult<Pid> {
    crate::heap::with_heap(|heap| global().lock().create(heap, entry, ring))
}

/// Move a task into the ready queue
pub fn run(pid: Pid) -> KernResult<()> {
    global().lock().run(pid)
}

/// Pid of the currently running task; drivers use this accessor
pub fn task_now() -> Option<Pid> {
    global().lock().current_pid()
}

/// Perform a scheduling decision and the register swap it calls for
pub fn switch() {
    let (pair, ldt) = {
        let mut sched = global().lock();
        match sched.switch() {
            Some(Switch { from, to }) if from != Some(to) => {
                let ldt = sched.table.get(to).filter(|t| t.is_user).map(|t| t.ldt);
                let from_ctx = from
                    .and_then(|pid| sched.table.get_mut(pid))
                    .map(|t| &mut t.context as *mut Context);
                let to_ctx = sched
                    .table
                    .get_mut(to)
                    .map(|t| &mut t.context as *mut Context);
                (from_ctx.zip(to_ctx), ldt)
            }
            _ => (None, None),
        }
    };
    // The lock is released before the swap; the next task resumes inside
    // its own earlier call to this function. A user task's private
    // descriptors must be live in the LDTR before its selectors reload.
    if let Some(ldt) = ldt {
        crate::startup::load_task_ldt(&ldt);
    }
    if let Some((from_ctx, to_ctx)) = pair {
        unsafe { context_switch(from_ctx, to_ctx) };
    }
}

/// Terminate the calling task with `value`; never returns to its caller
pub fn exit(value: i32) {
    global().lock().exit_current(value);
    switch();
    #[cfg(not(test))]
    loop {
        // A zombie is never rescheduled; park until preempted away
        crate::arch::wait_for_interrupt();
    }
}

/// Busy-poll until `pid` exits, then return its exit value and free the
/// slot. Each poll iteration yields through the scheduler so the child
/// can make progress.
pub fn wait(pid: Pid) -> KernResult<i32> {
    loop {
        let reaped =
            crate::heap::with_heap(|heap| global().lock().reap(heap, pid))?;
        if let Some(value) = reaped {
            return Ok(value);
        }
        switch();
        core::hint::spin_loop();
    }
}

// ============================================================================
// Timer integration
// ============================================================================

/// Programmable interval timer input frequency
const PIT_HZ: u32 = 1_193_180;
const PIT_CMD: u16 = 0x43;
const PIT_DATA: u16 = 0x40;

/// Timer interrupt handler: every tick is a scheduling decision
pub fn timer_handler(_frame: &mut TrapFrame) {
    switch();
}

/// Program the timer to `freq` ticks per second and hook the handler
pub fn init_timer(freq: u32) {
    interrupt::register_interrupt_handler(interrupt::IRQ_TIMER, timer_handler);

    let divisor = (PIT_HZ / freq.max(19)) as u16;
    crate::arch::outb(PIT_CMD, 0x36);
    crate::arch::outb(PIT_DATA, (divisor & 0xFF) as u8);
    crate::arch::outb(PIT_DATA, (divisor >> 8) as u8);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::KernelHeap;
    use std::vec;
    use std::vec::Vec;

    // Large enough for a full table of 64 KiB task stacks
    const TEST_HEAP_SIZE: usize = 4 * 1024 * 1024;

    fn test_heap() -> (KernelHeap, Vec<u8>) {
        let mut backing = vec![0u8; TEST_HEAP_SIZE];
        let base = (backing.as_mut_ptr() as usize + 15) & !15;
        let heap = unsafe { KernelHeap::new(base, TEST_HEAP_SIZE - 16) };
        (heap, backing)
    }

    #[test]
    fn created_task_is_seeded_with_entry_and_ring() {
        let (mut heap, _b) = test_heap();
        let mut sched = Scheduler::new();
        let pid = sched.create(&mut heap, 0x1234, Ring::User).unwrap();
        let task = sched.table.get(pid).unwrap();
        assert_eq!(task.context.eip, 0x1234);
        assert_eq!(task.context.cs, Ring::User.code_selector());
        assert_eq!(task.context.eflags, INITIAL_EFLAGS);
        assert_eq!(task.state, TaskState::Stopped);
        assert_ne!(task.stack_alloc, 0);
    }

    #[test]
    fn create_reports_table_full_without_leaking_stacks() {
        let (mut heap, _b) = test_heap();
        // Heap too small for even one stack: slot must be released again
        let mut tiny_backing = vec![0u8; 4096];
        let base = (tiny_backing.as_mut_ptr() as usize + 15) & !15;
        let mut tiny = unsafe { KernelHeap::new(base, 4096 - 16) };

        let mut sched = Scheduler::new();
        assert_eq!(
            sched.create(&mut tiny, 0x1000, Ring::Kernel),
            Err(KernError::OutOfMemory)
        );
        assert!(sched.table.is_empty());

        // Exhaust the table itself
        for _ in 0..MAX_TASKS {
            sched.create(&mut heap, 0x1000, Ring::Kernel).unwrap();
        }
        assert_eq!(
            sched.create(&mut heap, 0x1000, Ring::Kernel),
            Err(KernError::TaskTableFull)
        );
    }

    #[test]
    fn exactly_one_task_running_after_each_switch() {
        let (mut heap, _b) = test_heap();
        let mut sched = Scheduler::new();
        let mut pids = Vec::new();
        for _ in 0..3 {
            let pid = sched.create(&mut heap, 0x1000, Ring::Kernel).unwrap();
            sched.run(pid).unwrap();
            pids.push(pid);
        }
        for _ in 0..7 {
            sched.switch().unwrap();
            let running = sched
                .table
                .iter()
                .filter(|t| t.state == TaskState::Running)
                .count();
            assert_eq!(running, 1);
        }
    }

    #[test]
    fn round_robin_visits_every_ready_task_before_repeating() {
        let (mut heap, _b) = test_heap();
        let mut sched = Scheduler::new();
        let mut pids = Vec::new();
        for _ in 0..3 {
            let pid = sched.create(&mut heap, 0x1000, Ring::Kernel).unwrap();
            sched.run(pid).unwrap();
            pids.push(pid);
        }

        let mut order = Vec::new();
        for _ in 0..6 {
            order.push(sched.switch().unwrap().to);
        }
        // Two full cycles, each visiting all three tasks exactly once
        for cycle in order.chunks(3) {
            let mut seen: Vec<Pid> = cycle.to_vec();
            seen.sort();
            let mut expected = pids.clone();
            expected.sort();
            assert_eq!(seen, expected);
        }
    }

    #[test]
    fn self_switch_when_nothing_else_is_ready() {
        let (mut heap, _b) = test_heap();
        let mut sched = Scheduler::new();
        let pid = sched.create(&mut heap, 0x1000, Ring::Kernel).unwrap();
        sched.run(pid).unwrap();

        let first = sched.switch().unwrap();
        assert_eq!(first.to, pid);
        let second = sched.switch().unwrap();
        assert_eq!(second, Switch { from: Some(pid), to: pid });
        assert_eq!(sched.table.get(pid).unwrap().state, TaskState::Running);
    }

    #[test]
    fn switch_returns_none_when_nothing_ready() {
        let mut sched = Scheduler::new();
        assert_eq!(sched.switch(), None);
    }

    #[test]
    fn exit_then_reap_returns_value_and_frees_slot() {
        let (mut heap, _b) = test_heap();
        let free_before = heap.total_free();
        let mut sched = Scheduler::new();

        let parent = sched.adopt_boot().unwrap();
        let child = sched.create(&mut heap, 0x1000, Ring::Kernel).unwrap();
        sched.run(child).unwrap();

        // Run the child and let it exit with value 7
        let decision = sched.switch().unwrap();
        assert_eq!(decision.to, child);
        sched.exit_current(7);
        assert_eq!(sched.table.get(child).unwrap().state, TaskState::Zombie);

        // A zombie is never rescheduled
        let back = sched.switch().unwrap();
        assert_eq!(back.to, parent);

        // First poll sees the zombie and collects it
        assert_eq!(sched.reap(&mut heap, child), Ok(Some(7)));
        assert!(sched.table.get(child).is_none());
        // Slot and stack are reusable: table empty of the child, heap back
        // to its pre-child level
        assert_eq!(heap.total_free(), free_before);
        let replacement = sched.create(&mut heap, 0x2000, Ring::Kernel).unwrap();
        assert!(sched.table.get(replacement).is_some());
    }

    #[test]
    fn reap_on_live_task_polls_none() {
        let (mut heap, _b) = test_heap();
        let mut sched = Scheduler::new();
        let pid = sched.create(&mut heap, 0x1000, Ring::Kernel).unwrap();
        sched.run(pid).unwrap();
        assert_eq!(sched.reap(&mut heap, pid), Ok(None));
    }

    #[test]
    fn wait_on_unknown_pid_is_an_error() {
        let (mut heap, _b) = test_heap();
        let mut sched = Scheduler::new();
        assert_eq!(
            sched.reap(&mut heap, Pid(99)),
            Err(KernError::NoSuchTask)
        );
    }

    #[test]
    fn three_tasks_exit_second_wait_returns_seven() {
        let (mut heap, _b) = test_heap();
        let mut sched = Scheduler::new();
        let first = sched.adopt_boot().unwrap();
        let second = sched.create(&mut heap, 0x2000, Ring::Kernel).unwrap();
        let third = sched.create(&mut heap, 0x3000, Ring::Kernel).unwrap();
        sched.run(second).unwrap();
        sched.run(third).unwrap();

        // Schedule until the second task runs, then exit it with 7
        while sched.current_pid() != Some(second) {
            sched.switch().unwrap();
        }
        sched.exit_current(7);
        sched.switch().unwrap();

        // The first task's wait completes without blocking forever
        let mut polls = 0;
        let value = loop {
            match sched.reap(&mut heap, second).unwrap() {
                Some(v) => break v,
                None => {
                    sched.switch();
                    polls += 1;
                    assert!(polls < 10, "wait would spin forever");
                }
            }
        };
        assert_eq!(value, 7);
        assert!(sched.table.get(second).is_none());
        let _ = (first, third);
    }
}
