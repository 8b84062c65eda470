//! Fixed-pool heap allocator
//!
//! A single global free-extent pool manages one large physical range;
//! every kernel allocation (task records, stacks, per-task segments,
//! syscall buffers) flows through it.
//!
//! The pool holds an address-ordered list of free extents. Adjacent
//! extents are always merged on free, so coalescing only ever has to look
//! at the immediate neighbors. Each allocation carries a small header
//! recording the requested size plus a check value, so `kfree` can return
//! exactly the bytes that were handed out and can detect a clobbered
//! header before it poisons the pool.

use core::alloc::{GlobalAlloc, Layout};
use heapless::Vec;
use spin::{Mutex, Once};

use crate::types::{KernError, KernResult};

/// Capacity of the free-extent table
pub const MAX_EXTENTS: usize = 4096;

/// Bytes reserved in front of every payload
pub const HEADER_SIZE: usize = 16;

/// Check value written into every block header
const BLOCK_MAGIC: u32 = 0x5E60_5A11;

/// Allocation granule; keeps every extent boundary 16-byte aligned
const ALLOC_ALIGN: usize = 16;

/// One contiguous run of free bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub addr: usize,
    pub size: usize,
}

impl Extent {
    pub const fn new(addr: usize, size: usize) -> Self {
        Extent { addr, size }
    }

    /// One past the last byte of the extent
    pub fn end(&self) -> usize {
        self.addr + self.size
    }

    /// Whether `[addr, addr + len)` lies entirely inside this extent
    pub fn contains(&self, addr: usize, len: usize) -> bool {
        addr >= self.addr && addr.saturating_add(len) <= self.end()
    }
}

/// Address-ordered set of free extents
///
/// Invariants: entries are sorted by address, never overlap, and no two
/// entries touch (adjacency is merged eagerly on free).
pub struct ExtentPool {
    free: Vec<Extent, MAX_EXTENTS>,
}

impl ExtentPool {
    /// Create an empty pool
    pub const fn new() -> Self {
        ExtentPool { free: Vec::new() }
    }

    /// First-fit allocation, splitting the chosen extent
    pub fn alloc(&mut self, size: usize) -> KernResult<usize> {
        if size == 0 {
            return Err(KernError::OutOfMemory);
        }
        for i in 0..self.free.len() {
            if self.free[i].size >= size {
                let addr = self.free[i].addr;
                self.free[i].addr += size;
                self.free[i].size -= size;
                if self.free[i].size == 0 {
                    self.free.remove(i);
                }
                return Ok(addr);
            }
        }
        Err(KernError::OutOfMemory)
    }

    /// Return a range to the pool, merging with either neighbor
    pub fn free(&mut self, addr: usize, size: usize) -> KernResult<()> {
        if size == 0 {
            return Ok(());
        }

        // Position of the first free extent past the returned range
        let i = self
            .free
            .iter()
            .position(|e| e.addr > addr)
            .unwrap_or(self.free.len());

        let merges_prev = i > 0 && self.free[i - 1].end() == addr;
        let merges_next = i < self.free.len() && addr + size == self.free[i].addr;

        match (merges_prev, merges_next) {
            (true, true) => {
                self.free[i - 1].size += size + self.free[i].size;
                self.free.remove(i);
            }
            (true, false) => {
                self.free[i - 1].size += size;
            }
            (false, true) => {
                self.free[i].addr = addr;
                self.free[i].size += size;
            }
            (false, false) => {
                self.free
                    .insert(i, Extent::new(addr, size))
                    .map_err(|_| KernError::OutOfMemory)?;
            }
        }
        Ok(())
    }

    /// Sum of all free bytes
    pub fn total_free(&self) -> usize {
        self.free.iter().map(|e| e.size).sum()
    }

    /// The current free extents, sorted by address
    pub fn extents(&self) -> &[Extent] {
        &self.free
    }
}

/// Header written immediately before each payload
#[repr(C)]
struct BlockHeader {
    size: usize,
    magic: u32,
}

const _: () = assert!(core::mem::size_of::<BlockHeader>() <= HEADER_SIZE);

/// The kernel heap: an extent pool plus the block-header protocol
pub struct KernelHeap {
    pool: ExtentPool,
    pool_size: usize,
}

impl KernelHeap {
    /// Take ownership of `[base, base + size)` as the heap range
    ///
    /// # Safety
    /// The range must be usable RAM owned exclusively by the heap for the
    /// lifetime of the instance, and `base` must be 16-byte aligned.
    pub unsafe fn new(base: usize, size: usize) -> Self {
        let mut pool = ExtentPool::new();
        let size = size & !(ALLOC_ALIGN - 1);
        // A heap this small cannot hold a single block; treat as empty
        if size > HEADER_SIZE {
            let _ = pool.free(base, size);
        }
        KernelHeap {
            pool,
            pool_size: size,
        }
    }

    /// Allocate a zero-filled region of at least `size` bytes
    pub fn kmalloc(&mut self, size: usize) -> KernResult<usize> {
        let total = align_up(size + HEADER_SIZE, ALLOC_ALIGN);
        let block = self.pool.alloc(total)?;

        unsafe {
            let header = block as *mut BlockHeader;
            (*header).size = total - HEADER_SIZE;
            (*header).magic = BLOCK_MAGIC;
            core::ptr::write_bytes((block + HEADER_SIZE) as *mut u8, 0, total - HEADER_SIZE);
        }
        Ok(block + HEADER_SIZE)
    }

    /// Return a previously allocated region; no-op on a null address
    pub fn kfree(&mut self, addr: usize) {
        if addr == 0 {
            return;
        }
        let block = addr - HEADER_SIZE;
        let size = unsafe {
            let header = block as *mut BlockHeader;
            if (*header).magic != BLOCK_MAGIC {
                // Header clobbered by an overflow from the previous block,
                // or the block was already freed; refuse rather than
                // corrupt the extent list.
                crate::println!("kfree: corrupt block header at {:#x}", addr);
                return;
            }
            // Consume the header so the same block cannot free twice
            (*header).magic = 0;
            (*header).size
        };
        if self.pool.free(block, size + HEADER_SIZE).is_err() {
            crate::println!("kfree: extent table full, leaking {:#x}", addr);
        }
    }

    /// Resize a region, preserving `min(old, new)` payload bytes
    pub fn krealloc(&mut self, addr: usize, new_size: usize) -> KernResult<usize> {
        if addr == 0 {
            return self.kmalloc(new_size);
        }
        if new_size == 0 {
            self.kfree(addr);
            return Ok(0);
        }

        let old_size = unsafe {
            let header = (addr - HEADER_SIZE) as *const BlockHeader;
            if (*header).magic != BLOCK_MAGIC {
                return Err(KernError::BadAddress);
            }
            (*header).size
        };

        let new_addr = self.kmalloc(new_size)?;
        let keep = old_size.min(new_size);
        unsafe {
            core::ptr::copy_nonoverlapping(addr as *const u8, new_addr as *mut u8, keep);
        }
        self.kfree(addr);
        Ok(new_addr)
    }

    /// Size recorded for a live allocation
    pub fn allocated_size(&self, addr: usize) -> KernResult<usize> {
        if addr == 0 {
            return Err(KernError::BadAddress);
        }
        unsafe {
            let header = (addr - HEADER_SIZE) as *const BlockHeader;
            if (*header).magic != BLOCK_MAGIC {
                return Err(KernError::BadAddress);
            }
            Ok((*header).size)
        }
    }

    /// Free bytes remaining in the pool
    pub fn total_free(&self) -> usize {
        self.pool.total_free()
    }

    /// Total bytes handed to the heap at init
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// The underlying free extents (diagnostics and tests)
    pub fn extents(&self) -> &[Extent] {
        self.pool.extents()
    }
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

// ============================================================================
// Global heap
// ============================================================================

static KERNEL_HEAP: Once<Mutex<KernelHeap>> = Once::new();

/// Hand the probed memory range to the global heap
///
/// # Safety
/// See [`KernelHeap::new`]; must be called exactly once during boot.
pub unsafe fn init(base: usize, size: usize) {
    KERNEL_HEAP.call_once(|| Mutex::new(KernelHeap::new(base, size)));
}

fn global_heap() -> &'static Mutex<KernelHeap> {
    KERNEL_HEAP.get().expect("heap not initialized")
}

/// Allocate from the global heap
pub fn kmalloc(size: usize) -> KernResult<usize> {
    global_heap().lock().kmalloc(size)
}

/// Free to the global heap
pub fn kfree(addr: usize) {
    global_heap().lock().kfree(addr)
}

/// Resize within the global heap
pub fn krealloc(addr: usize, new_size: usize) -> KernResult<usize> {
    global_heap().lock().krealloc(addr, new_size)
}

/// Run a closure against the global heap
pub fn with_heap<R>(f: impl FnOnce(&mut KernelHeap) -> R) -> R {
    f(&mut global_heap().lock())
}

// ============================================================================
// Memory probe
// ============================================================================

/// Probe the upper bound of usable RAM by writing test patterns to the
/// last word of each 4 KiB page. Returns the first address that failed.
///
/// # Safety
/// Must only run during early boot, before anything else owns the range.
#[cfg(not(test))]
pub unsafe fn memtest(start: usize, end: usize) -> usize {
    const PAT0: u32 = 0xAA55_AA55;
    const PAT1: u32 = 0x55AA_55AA;

    let mut addr = start;
    while addr <= end {
        let p = (addr + 0xFFC) as *mut u32;
        let old = p.read_volatile();
        p.write_volatile(PAT0);
        p.write_volatile(p.read_volatile() ^ 0xFFFF_FFFF);
        if p.read_volatile() != PAT1 {
            p.write_volatile(old);
            break;
        }
        p.write_volatile(p.read_volatile() ^ 0xFFFF_FFFF);
        if p.read_volatile() != PAT0 {
            p.write_volatile(old);
            break;
        }
        p.write_volatile(old);
        addr += 0x1000;
    }
    addr
}

// ============================================================================
// Rust allocator bridge
// ============================================================================

/// Adapter letting `core::alloc` users draw from the kernel heap
pub struct HeapRef;

unsafe impl GlobalAlloc for HeapRef {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALLOC_ALIGN {
            return core::ptr::null_mut();
        }
        match kmalloc(layout.size()) {
            Ok(addr) => addr as *mut u8,
            Err(_) => core::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        kfree(ptr as usize);
    }
}

#[cfg(not(test))]
#[global_allocator]
static ALLOCATOR: HeapRef = HeapRef;
