//! Boot sequence
//!
//! Brings the kernel services up in dependency order: console, memory
//! probe and heap, descriptor tables, interrupt controller, syscall
//! gateway, scheduler and timer. The boot flow then becomes task zero and
//! parks in the idle loop; everything after this point is interrupt
//! driven.

use spin::Mutex;

use crate::descriptor::{GlobalTable, LocalTable, SegmentDescriptor, ACCESS_LDT, GLOBAL_SLOTS};
use crate::fs::{Filesystem, MemFs};
use crate::interrupt::VECTOR_COUNT;

/// Scheduler tick rate
pub const TIMER_HZ: u32 = 100;

/// First byte the heap may own; everything below is kernel image and
/// legacy ranges
pub const HEAP_BASE: usize = 0x0040_0000;

/// Upper bound of the boot memory probe
pub const PROBE_LIMIT: usize = 0xBFFF_FFFF;

// ============================================================================
// Boot filesystem
// ============================================================================

/// RAM filesystem holding the images handed over by the boot loader
static BOOT_FS: MemFs = MemFs::new();

/// The filesystem collaborator the syscall gateway and loader use
pub fn boot_filesystem() -> &'static dyn Filesystem {
    &BOOT_FS
}

/// Register a boot-loader-provided image under `name`
pub fn install_boot_image(name: &str, image: &[u8]) -> crate::types::KernResult<()> {
    BOOT_FS.insert(name, image)
}

// ============================================================================
// Descriptor tables
// ============================================================================

/// Packed descriptor entries in the layout the CPU reads with `lgdt`
static GDT_RAW: Mutex<[[u8; 8]; GLOBAL_SLOTS]> = Mutex::new([[0; 8]; GLOBAL_SLOTS]);

/// Packed gate entries in the layout the CPU reads with `lidt`
static IDT_RAW: Mutex<[[u8; 8]; VECTOR_COUNT]> = Mutex::new([[0; 8]; VECTOR_COUNT]);

/// Packed image of the running task's private descriptor table
///
/// One CPU, one live LDT: the image is refreshed on every switch into a
/// user task, and the GDT slot below points the LDTR at it.
static LDT_RAW: Mutex<[[u8; 8]; 2]> = Mutex::new([[0; 8]; 2]);

/// Global-table slot holding the LDT system descriptor
pub const LDT_GDT_SLOT: usize = 7;

/// Selector naming [`LDT_GDT_SLOT`] for `lldt`
pub const LDT_SELECTOR: u16 = (LDT_GDT_SLOT as u16) << 3;

/// The flat boot segments: null slot plus code/data for each ring
pub fn build_boot_tables() -> GlobalTable {
    let mut gdt = GlobalTable::new();
    gdt.install_boot_segments();
    gdt
}

/// Pack a logical table into raw entries
pub fn encode_table(gdt: &GlobalTable) -> [[u8; 8]; GLOBAL_SLOTS] {
    let mut raw = [[0u8; 8]; GLOBAL_SLOTS];
    for (i, entry) in raw.iter_mut().enumerate() {
        if let Some(desc) = gdt.entry(i) {
            *entry = desc.encode();
        }
    }
    raw
}

/// Encode the boot segments and point the CPU at them
pub fn install_descriptor_tables() {
    let gdt = build_boot_tables();
    let mut raw = GDT_RAW.lock();
    *raw = encode_table(&gdt);

    let pointer = crate::arch::TablePointer {
        limit: (GLOBAL_SLOTS * 8 - 1) as u16,
        base: raw.as_ptr() as usize as u32,
    };
    unsafe {
        crate::arch::lgdt(&pointer);
    }
}

/// Pack the gate table for the per-vector stubs and point the CPU at it
pub fn install_interrupt_table() {
    let idt = crate::interrupt::build_idt(&crate::interrupt::vector_stubs());
    let mut raw = IDT_RAW.lock();
    *raw = idt;

    let pointer = crate::arch::TablePointer {
        limit: (VECTOR_COUNT * 8 - 1) as u16,
        base: raw.as_ptr() as usize as u32,
    };
    unsafe {
        crate::arch::lidt(&pointer);
    }
}

/// Materialize `ldt` as the CPU's local descriptor table
///
/// Encodes both entries into the live image, rewrites the system
/// descriptor in the global table, and reloads the LDTR.
pub fn load_task_ldt(ldt: &LocalTable) {
    {
        let mut raw = LDT_RAW.lock();
        *raw = ldt.encode();
        let base = raw.as_ptr() as usize;
        let desc = SegmentDescriptor::new(base, (2 * 8 - 1) as u32, ACCESS_LDT);
        GDT_RAW.lock()[LDT_GDT_SLOT] = desc.encode();
    }
    unsafe {
        crate::arch::lldt(LDT_SELECTOR);
    }
}

// ============================================================================
// Boot entry
// ============================================================================

/// Full kernel bring-up; called once from the platform entry stub
///
/// # Safety
/// Must run exactly once, on the boot stack, with interrupts disabled and
/// the memory above [`HEAP_BASE`] not yet owned by anything.
#[cfg(not(test))]
pub unsafe fn boot() -> ! {
    crate::console::init();
    crate::println!("[INIT] console up");

    let mem_end = crate::heap::memtest(HEAP_BASE, PROBE_LIMIT);
    crate::heap::init(HEAP_BASE, mem_end - HEAP_BASE);
    crate::println!(
        "[INIT] heap: {} KiB at {:#x}",
        (mem_end - HEAP_BASE) / 1024,
        HEAP_BASE
    );

    install_descriptor_tables();
    install_interrupt_table();
    crate::println!("[INIT] descriptor and vector tables loaded");

    crate::interrupt::init();
    crate::syscall::init();
    crate::println!("[INIT] interrupts and gateway wired");

    let boot_pid = crate::scheduler::init().expect("task table empty at boot");
    crate::scheduler::init_timer(TIMER_HZ);
    crate::println!("[INIT] scheduler running as task {}", boot_pid.0);

    crate::arch::sti();

    // Task zero is the idle task from here on
    loop {
        crate::arch::wait_for_interrupt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::OpenFlags;
    use crate::types::{KernError, KERNEL_CODE_SELECTOR, USER_DATA_SELECTOR};

    #[test]
    fn boot_tables_carry_all_ring_segments() {
        let gdt = build_boot_tables();
        // Selector >> 3 is the table index
        let kcode = gdt.entry((KERNEL_CODE_SELECTOR >> 3) as usize).unwrap();
        assert_eq!(kcode.base(), 0);
        let udata = gdt.entry((USER_DATA_SELECTOR >> 3) as usize).unwrap();
        assert_eq!(udata.base(), 0);
    }

    #[test]
    fn encoded_boot_entries_match_cpu_layout() {
        let raw = encode_table(&build_boot_tables());
        assert_eq!(raw[0], [0u8; 8]);
        // Kernel code: flat 4 GiB, access 0x9A, page granular 32-bit
        assert_eq!(raw[1], [0xFF, 0xFF, 0x00, 0x00, 0x00, 0x9A, 0xCF, 0x00]);
        // Kernel data: same span, access 0x92
        assert_eq!(raw[2], [0xFF, 0xFF, 0x00, 0x00, 0x00, 0x92, 0xCF, 0x00]);
        // User data carries DPL 3 in the access byte
        assert_eq!(raw[6][5], 0x92 | 0x60);
    }

    #[test]
    fn task_ldt_lands_in_the_global_table() {
        use crate::descriptor::{access_for, LDT_DATA};
        use crate::heap::Extent;
        use crate::types::Ring;

        let mut ldt = LocalTable::new();
        let backing = Extent::new(0x0080_0000, 0x2000);
        ldt.install(
            LDT_DATA,
            0x0080_0000,
            0x1FFF,
            access_for(Ring::User, false),
            backing,
        )
        .unwrap();

        load_task_ldt(&ldt);

        assert_eq!(LDT_RAW.lock()[1], ldt.data().encode());
        let base = LDT_RAW.lock().as_ptr() as usize;
        let expected = SegmentDescriptor::new(base, 15, ACCESS_LDT);
        assert_eq!(GDT_RAW.lock()[LDT_GDT_SLOT], expected.encode());
    }

    #[test]
    fn interrupt_table_is_packed_with_ring_aware_gates() {
        install_interrupt_table();
        let raw = IDT_RAW.lock();
        // Only the software gateway is reachable from ring 3
        assert_eq!(raw[0x80][5], 0xEE);
        assert_eq!(raw[32][5], 0x8E);
        assert_eq!(raw[32][2], KERNEL_CODE_SELECTOR as u8);
    }

    #[test]
    fn boot_images_are_served_by_the_boot_filesystem() {
        install_boot_image("init.sgx", b"not a real image").unwrap();
        let info = boot_filesystem()
            .open("init.sgx", OpenFlags::RDONLY)
            .unwrap();
        assert_eq!(info.size, 16);
        assert_eq!(
            boot_filesystem().open("missing", OpenFlags::RDONLY),
            Err(KernError::NotFound)
        );
    }
}
