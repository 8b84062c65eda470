//! Process loader and program break management
//!
//! Builds a task's private code/data segments from a flat executable
//! image, seeds its stack so startup code can find the command line, and
//! grows the data segment on demand. Growing past the segment ceiling
//! reallocates the backing region and rebases the data descriptor in the
//! same critical section, so translated pointers never dangle.

use crate::descriptor::{access_for, LDT_CODE, LDT_DATA};
use crate::fs::{Filesystem, OpenFlags};
use crate::heap::{Extent, KernelHeap};
use crate::scheduler::Scheduler;
use crate::task::TaskRecord;
use crate::types::{KernError, KernResult, Pid, Ring};

/// Image magic: flat SegOS executable, version 1
pub const IMAGE_MAGIC: [u8; 4] = *b"SGX1";

/// Bytes of the image header
pub const IMAGE_HEADER_SIZE: usize = 16;

/// Region between the image data and the program break; holds the user
/// stack, which grows down from its top
pub const USER_STACK_REGION: usize = 4 * 1024 * 1024;

/// Initial program-break region beyond the stack
pub const USER_BRK_REGION: usize = 1024 * 1024;

/// Extra ceiling granted on every break-driven segment growth
pub const SBRK_SLACK: usize = 32 * 1024;

/// Local-table selectors (table-indicator bit set, slot * 8)
pub fn ldt_code_selector(ring: Ring) -> u16 {
    (LDT_CODE as u16) << 3 | 0x4 | ring.level() as u16
}

pub fn ldt_data_selector(ring: Ring) -> u16 {
    (LDT_DATA as u16) << 3 | 0x4 | ring.level() as u16
}

/// Parsed flat-image header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    pub entry: usize,
    pub code_size: usize,
    pub data_size: usize,
}

impl ImageHeader {
    /// Parse and validate the positionally-addressed header
    pub fn parse(image: &[u8]) -> KernResult<Self> {
        if image.len() < IMAGE_HEADER_SIZE || image[0..4] != IMAGE_MAGIC {
            return Err(KernError::LoadError);
        }
        let word = |at: usize| {
            u32::from_le_bytes([image[at], image[at + 1], image[at + 2], image[at + 3]]) as usize
        };
        let header = ImageHeader {
            entry: word(4),
            code_size: word(8),
            data_size: word(12),
        };
        if header.code_size == 0
            || header.entry >= header.code_size
            || IMAGE_HEADER_SIZE + header.code_size + header.data_size > image.len()
        {
            return Err(KernError::LoadError);
        }
        Ok(header)
    }

    pub fn code<'a>(&self, image: &'a [u8]) -> &'a [u8] {
        &image[IMAGE_HEADER_SIZE..IMAGE_HEADER_SIZE + self.code_size]
    }

    pub fn data<'a>(&self, image: &'a [u8]) -> &'a [u8] {
        let start = IMAGE_HEADER_SIZE + self.code_size;
        &image[start..start + self.data_size]
    }

    /// Serialize a header; used by image build tooling and tests
    pub fn to_bytes(&self) -> [u8; IMAGE_HEADER_SIZE] {
        let mut bytes = [0u8; IMAGE_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&IMAGE_MAGIC);
        bytes[4..8].copy_from_slice(&(self.entry as u32).to_le_bytes());
        bytes[8..12].copy_from_slice(&(self.code_size as u32).to_le_bytes());
        bytes[12..16].copy_from_slice(&(self.data_size as u32).to_le_bytes());
        bytes
    }
}

fn align_page(size: usize) -> usize {
    (size + 0xFFF) & !0xFFF
}

/// Advance the program break of a user task
///
/// Returns the previous break, task-relative. When the new break would
/// pass the data-segment ceiling, the backing region is reallocated with
/// `increment` plus [`SBRK_SLACK`] of headroom, existing contents are
/// copied, and the descriptor plus `ds_base` are rebased before the break
/// moves.
pub fn sbrk(task: &mut TaskRecord, heap: &mut KernelHeap, increment: isize) -> KernResult<usize> {
    if !task.is_user {
        return Err(KernError::NotPermitted);
    }

    let new_brk = task.brk as isize + increment;
    if new_brk < 0 {
        return Err(KernError::BadAddress);
    }

    if new_brk as usize > task.brk_ceiling {
        let old_base = task.ds_base;
        let old_size = task.ldt.data().decoded_limit() + 1;
        let new_size = align_page(old_size + increment as usize + SBRK_SLACK);

        let new_base = heap.kmalloc(new_size)?;
        unsafe {
            core::ptr::copy_nonoverlapping(old_base as *const u8, new_base as *mut u8, old_size);
        }

        // Descriptor and ds_base move together; a translated pointer must
        // never observe one without the other.
        let backing = Extent::new(new_base, heap.allocated_size(new_base)?);
        task.ldt.install(
            LDT_DATA,
            new_base,
            (new_size - 1) as u32,
            access_for(task.ring, false),
            backing,
        )?;
        task.ds_base = new_base;
        task.data_alloc = new_base;
        task.brk_ceiling = new_size - 1;

        heap.kfree(old_base);
    }

    let prev = task.brk;
    task.brk = new_brk as usize;
    Ok(prev)
}

/// Build `task` into a user process from the named image
///
/// Allocates the code extent and an over-provisioned data extent (stack
/// region plus initial break region beyond the image data), installs both
/// as the task's private descriptors, writes the command line through the
/// break mechanism, and seeds the initial stack with its location.
/// Returns the image entry point, code-segment relative.
pub fn load_into(
    task: &mut TaskRecord,
    heap: &mut KernelHeap,
    fs: &dyn Filesystem,
    path: &str,
    cmdline: &str,
    cwd: &str,
) -> KernResult<usize> {
    let info = fs.open(path, OpenFlags::RDONLY)?;

    // Pull the whole image through the collaborator into a kernel buffer
    let image_addr = heap.kmalloc(info.size.max(IMAGE_HEADER_SIZE))?;
    let image = unsafe { core::slice::from_raw_parts_mut(image_addr as *mut u8, info.size) };
    let mut read = 0;
    while read < info.size {
        let n = match fs.read(&info, read, &mut image[read..]) {
            Ok(0) | Err(_) => {
                heap.kfree(image_addr);
                return Err(KernError::LoadError);
            }
            Ok(n) => n,
        };
        read += n;
    }

    let header = match ImageHeader::parse(image) {
        Ok(h) => h,
        Err(e) => {
            heap.kfree(image_addr);
            return Err(e);
        }
    };

    // Code extent: exactly the image's code span
    let code_size = align_page(header.code_size);
    let code_base = match heap.kmalloc(code_size) {
        Ok(addr) => addr,
        Err(e) => {
            heap.kfree(image_addr);
            return Err(e);
        }
    };
    unsafe {
        core::ptr::copy_nonoverlapping(
            header.code(image).as_ptr(),
            code_base as *mut u8,
            header.code_size,
        );
    }

    // Data extent: image data, then the stack region, then the initial
    // break region. Deliberately over-provisioned to serve as the heap.
    let ds_size = align_page(header.data_size + USER_STACK_REGION + USER_BRK_REGION);
    let ds_base = match heap.kmalloc(ds_size) {
        Ok(addr) => addr,
        Err(e) => {
            heap.kfree(code_base);
            heap.kfree(image_addr);
            return Err(e);
        }
    };
    unsafe {
        core::ptr::copy_nonoverlapping(
            header.data(image).as_ptr(),
            ds_base as *mut u8,
            header.data_size,
        );
    }
    heap.kfree(image_addr);

    task.is_user = true;
    task.code_alloc = code_base;
    task.data_alloc = ds_base;
    task.ds_base = ds_base;
    task.brk = header.data_size + USER_STACK_REGION;
    task.brk_ceiling = ds_size - 1;
    task.cwd.clear();
    let _ = task.cwd.push_str(cwd);

    let code_backing = Extent::new(code_base, heap.allocated_size(code_base)?);
    task.ldt.install(
        LDT_CODE,
        code_base,
        (header.code_size - 1) as u32,
        access_for(task.ring, true),
        code_backing,
    )?;
    let data_backing = Extent::new(ds_base, heap.allocated_size(ds_base)?);
    task.ldt.install(
        LDT_DATA,
        ds_base,
        (ds_size - 1) as u32,
        access_for(task.ring, false),
        data_backing,
    )?;

    // The command line travels through the break mechanism, so this path
    // is identical to a running task growing its own heap.
    let cmdline_off = sbrk(task, heap, cmdline.len() as isize + 1)?;
    unsafe {
        let dst = (ds_base + cmdline_off) as *mut u8;
        core::ptr::copy_nonoverlapping(cmdline.as_ptr(), dst, cmdline.len());
        dst.add(cmdline.len()).write(0);
    }

    // Seed the stack: the word below the stack top holds the command-line
    // offset where the task's startup code expects it.
    let mut esp = header.data_size + USER_STACK_REGION - core::mem::size_of::<u32>();
    unsafe {
        ((ds_base + esp) as *mut u32).write(cmdline_off as u32);
    }
    esp -= core::mem::size_of::<u32>();

    task.context.eip = header.entry;
    task.context.esp = esp;
    task.context.cs = ldt_code_selector(task.ring);
    let data_sel = ldt_data_selector(task.ring);
    task.context.ds = data_sel;
    task.context.es = data_sel;
    task.context.ss = data_sel;
    task.context.fs = data_sel;
    task.context.gs = data_sel;

    Ok(header.entry)
}

/// Spawn a new task that loads and enters the named image
///
/// The image must at least open; the load itself happens on the new
/// task's first dispatch, inside the loader trampoline.
pub fn create_process(
    sched: &mut Scheduler,
    heap: &mut KernelHeap,
    fs: &dyn Filesystem,
    path: &str,
    cmdline: &str,
    cwd: &str,
) -> KernResult<Pid> {
    // Reject missing images before committing a task slot
    fs.open(path, OpenFlags::RDONLY)?;

    let pid = sched.create(heap, loader_trampoline as usize, Ring::User)?;
    let task = sched.table.get_mut(pid).ok_or(KernError::NoSuchTask)?;
    let _ = task.exec_path.push_str(path);
    let _ = task.args.push_str(cmdline);
    let _ = task.cwd.push_str(cwd);
    sched.run(pid)?;
    Ok(pid)
}

/// First code run by a freshly created process task: performs the load
/// against its own record, then drops to the image entry point.
///
/// The task is a user-ring record from birth, but this code still runs
/// with kernel state: the context switch restores only registers, so the
/// ring change happens at the `enter_user` frame below.
#[cfg(not(test))]
extern "C" fn loader_trampoline() {
    // Heap before scheduler, the lock order every other path uses. Both
    // are held across the whole load; a tick arriving mid-load would
    // deadlock on the scheduler lock.
    crate::arch::cli();
    let loaded = crate::heap::with_heap(|heap| {
        crate::scheduler::with_scheduler(|sched| {
            let task = sched.current_mut()?;
            let mut path = heapless::String::<128>::new();
            let mut args = heapless::String::<256>::new();
            let mut cwd = heapless::String::<128>::new();
            let _ = path.push_str(task.exec_path.as_str());
            let _ = args.push_str(task.args.as_str());
            let _ = cwd.push_str(task.cwd.as_str());

            let result = load_into(
                task,
                heap,
                crate::startup::boot_filesystem(),
                path.as_str(),
                args.as_str(),
                cwd.as_str(),
            );
            match result {
                Ok(entry) => Some((
                    task.ldt,
                    task.context.cs,
                    entry,
                    task.context.ss,
                    task.context.esp,
                )),
                Err(_) => None,
            }
        })
    });

    crate::arch::sti();
    match loaded {
        Some((ldt, cs, entry, ss, esp)) => {
            // The switch into this task found an empty private table;
            // the freshly installed descriptors go live here.
            crate::startup::load_task_ldt(&ldt);
            unsafe { crate::arch::enter_user(cs, entry, ss, esp) }
        }
        None => crate::scheduler::exit(-1),
    }
}

#[cfg(test)]
extern "C" fn loader_trampoline() {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemFs;
    use std::boxed::Box;
    use std::vec;
    use std::vec::Vec;

    const TEST_HEAP_SIZE: usize = 24 * 1024 * 1024;

    fn test_heap() -> (KernelHeap, Vec<u8>) {
        let mut backing = vec![0u8; TEST_HEAP_SIZE];
        let base = (backing.as_mut_ptr() as usize + 15) & !15;
        let heap = unsafe { KernelHeap::new(base, TEST_HEAP_SIZE - 16) };
        (heap, backing)
    }

    fn image(entry: usize, code: &[u8], data: &[u8]) -> Vec<u8> {
        let header = ImageHeader {
            entry,
            code_size: code.len(),
            data_size: data.len(),
        };
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&header.to_bytes());
        bytes.extend_from_slice(code);
        bytes.extend_from_slice(data);
        bytes
    }

    fn user_task() -> TaskRecord {
        let mut task = TaskRecord::new(Pid(7), Ring::User);
        task.is_user = false;
        task
    }

    #[test]
    fn header_round_trip_and_validation() {
        let good = image(2, &[0x90, 0x90, 0xC3, 0x00], b"data");
        let header = ImageHeader::parse(&good).unwrap();
        assert_eq!(header.entry, 2);
        assert_eq!(header.code(&good), &[0x90, 0x90, 0xC3, 0x00]);
        assert_eq!(header.data(&good), b"data");

        assert_eq!(ImageHeader::parse(b"short"), Err(KernError::LoadError));
        let mut bad_magic = good.clone();
        bad_magic[0] = b'X';
        assert_eq!(ImageHeader::parse(&bad_magic), Err(KernError::LoadError));
        // Declared sizes reaching past the file
        let mut truncated = good.clone();
        truncated.truncate(IMAGE_HEADER_SIZE + 2);
        assert_eq!(ImageHeader::parse(&truncated), Err(KernError::LoadError));
    }

    #[test]
    fn load_builds_segments_and_seeds_stack() {
        let (mut heap, _b) = test_heap();
        let fs = MemFs::new();
        let code = [0x90u8; 64];
        fs.insert("shell.sgx", &image(4, &code, b"HELLO")).unwrap();

        let mut task = user_task();
        let entry = load_into(&mut task, &mut heap, &fs, "shell.sgx", "shell -l", "/").unwrap();
        assert_eq!(entry, 4);
        assert!(task.is_user);

        // Private descriptors cover exactly the allocated extents
        assert_eq!(task.ldt.code().base(), task.code_alloc);
        assert_eq!(task.ldt.data().base(), task.ds_base);
        assert_eq!(task.context.cs, ldt_code_selector(Ring::User));
        assert_eq!(task.context.ss, ldt_data_selector(Ring::User));

        // Image data was copied to the start of the data segment
        let data = unsafe { core::slice::from_raw_parts(task.ds_base as *const u8, 5) };
        assert_eq!(data, b"HELLO");

        // The command line went through the break mechanism: it lives at
        // the old break, NUL-terminated, and the break advanced past it
        let cmdline_off = task.brk - ("shell -l".len() + 1);
        assert_eq!(cmdline_off, 5 + USER_STACK_REGION);
        let cmdline = unsafe {
            core::slice::from_raw_parts((task.ds_base + cmdline_off) as *const u8, 9)
        };
        assert_eq!(cmdline, b"shell -l\0");

        // The stack word above esp holds the command-line offset
        let stack_word_at = task.context.esp + core::mem::size_of::<u32>();
        let stored = unsafe { ((task.ds_base + stack_word_at) as *const u32).read() };
        assert_eq!(stored as usize, cmdline_off);
        assert_eq!(task.cwd.as_str(), "/");
    }

    #[test]
    fn load_rejects_malformed_image() {
        let (mut heap, _b) = test_heap();
        let fs = MemFs::new();
        fs.insert("bad.sgx", b"MZ\x00\x00garbage").unwrap();
        let free = heap.total_free();

        let mut task = user_task();
        assert_eq!(
            load_into(&mut task, &mut heap, &fs, "bad.sgx", "", "/"),
            Err(KernError::LoadError)
        );
        // The image buffer was reclaimed on the failure path
        assert_eq!(heap.total_free(), free);
    }

    #[test]
    fn load_missing_image_propagates_not_found() {
        let (mut heap, _b) = test_heap();
        let fs = MemFs::new();
        let mut task = user_task();
        assert_eq!(
            load_into(&mut task, &mut heap, &fs, "absent", "", "/"),
            Err(KernError::NotFound)
        );
    }

    #[test]
    fn sbrk_is_denied_to_kernel_tasks() {
        let (mut heap, _b) = test_heap();
        let mut task = TaskRecord::new(Pid(1), Ring::Kernel);
        assert_eq!(
            sbrk(&mut task, &mut heap, 16),
            Err(KernError::NotPermitted)
        );
    }

    #[test]
    fn sbrk_within_ceiling_moves_only_the_cursor() {
        let (mut heap, _b) = test_heap();
        let fs = MemFs::new();
        fs.insert("a.sgx", &image(0, &[0xC3], b"d")).unwrap();
        let mut task = user_task();
        load_into(&mut task, &mut heap, &fs, "a.sgx", "", "/").unwrap();

        let base_before = task.ds_base;
        let prev = task.brk;
        assert_eq!(sbrk(&mut task, &mut heap, 100).unwrap(), prev);
        assert_eq!(task.brk, prev + 100);
        assert_eq!(task.ds_base, base_before);

        // Negative increments release break space
        assert_eq!(sbrk(&mut task, &mut heap, -100).unwrap(), prev + 100);
        assert_eq!(task.brk, prev);
    }

    #[test]
    fn sbrk_past_ceiling_rebases_segment_exactly_once() {
        let (mut heap, _b) = test_heap();
        let fs = MemFs::new();
        fs.insert("a.sgx", &image(0, &[0xC3], b"xy")).unwrap();
        let mut task = user_task();
        load_into(&mut task, &mut heap, &fs, "a.sgx", "mark", "/").unwrap();

        let old_base = task.ds_base;
        // Plant a marker in the image data to prove contents move
        unsafe { (old_base as *mut u8).write(0xAB) };

        let headroom = task.brk_ceiling - task.brk;
        let prev = task.brk;
        let grown = sbrk(&mut task, &mut heap, headroom as isize + 4096).unwrap();
        assert_eq!(grown, prev);

        // Segment base changed exactly once, descriptor moved with it
        assert_ne!(task.ds_base, old_base);
        assert_eq!(task.ldt.data().base(), task.ds_base);
        assert_eq!(task.data_alloc, task.ds_base);
        assert!(task.brk <= task.brk_ceiling);

        // Existing contents were carried over to the new region
        let moved = unsafe { (task.ds_base as *const u8).read() };
        assert_eq!(moved, 0xAB);

        // A second in-ceiling growth does not rebase again
        let base_after = task.ds_base;
        sbrk(&mut task, &mut heap, 8).unwrap();
        assert_eq!(task.ds_base, base_after);
    }

    #[test]
    fn create_process_verifies_image_and_schedules_task() {
        let (mut heap, _b) = test_heap();
        let fs = MemFs::new();
        fs.insert("app.sgx", &image(0, &[0xC3], b"")).unwrap();

        // Boxed: the task table is too large for the test thread stack
        let mut sched = Box::new(Scheduler::new());
        let pid =
            create_process(&mut sched, &mut heap, &fs, "app.sgx", "app 1 2", "/bin").unwrap();
        let task = sched.table.get(pid).unwrap();
        assert_eq!(task.exec_path.as_str(), "app.sgx");
        assert_eq!(task.args.as_str(), "app 1 2");
        assert_eq!(task.cwd.as_str(), "/bin");
        assert_eq!(task.ring, Ring::User);
        assert_eq!(task.state, crate::task::TaskState::Ready);

        assert_eq!(
            create_process(&mut sched, &mut heap, &fs, "ghost", "", "/"),
            Err(KernError::NotFound)
        );
    }
}
