//! Segment descriptors and descriptor tables
//!
//! Per-process isolation is built entirely on segmentation: the kernel
//! shares one global table of flat ring segments, and every task owns a
//! private two-entry (code, data) table. Descriptors are modeled as a
//! value type whose constructor picks the granularity, so the bit packing
//! the CPU mandates lives in exactly one place.

use crate::heap::Extent;
use crate::types::{KernError, KernResult, Ring};

/// Largest limit expressible with byte granularity (20 bits)
pub const BYTE_GRANULAR_MAX: u32 = 0xFFFFF;

/// Granularity flag folded into the packed limit_high byte
const GRANULARITY_BIT: u16 = 0x8000;

/// 32-bit default-operation-size flag
const DEFAULT_32BIT: u16 = 0x4000;

// Base access rights; the ring's DPL bits are or-ed in by `access_for`.
const ACCESS_CODE: u16 = DEFAULT_32BIT | 0x009A;
const ACCESS_DATA: u16 = DEFAULT_32BIT | 0x0092;

/// Access rights of an LDT system descriptor (present, type 2)
///
/// System descriptors are byte granular with a 16-bit operand size, so
/// neither the G nor the D flag is set.
pub const ACCESS_LDT: u16 = 0x0082;

/// Access rights for a code or data segment at the given ring
pub fn access_for(ring: Ring, code: bool) -> u16 {
    let base = if code { ACCESS_CODE } else { ACCESS_DATA };
    base | ring.dpl_bits()
}

/// Granularity chosen at construction time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    /// Limit counts bytes (ranges up to 1 MiB)
    Byte,
    /// Limit counts 4 KiB pages (ranges above 1 MiB)
    Page,
}

/// One segment descriptor in logical form
///
/// `limit` is already scaled for the chosen granularity; `decoded_limit`
/// gives back the addressable byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptor {
    base: usize,
    limit: u32,
    access: u16,
    granularity: Granularity,
}

impl SegmentDescriptor {
    /// The null descriptor occupying slot 0 of every table
    pub const NULL: SegmentDescriptor = SegmentDescriptor {
        base: 0,
        limit: 0,
        access: 0,
        granularity: Granularity::Byte,
    };

    /// Build a descriptor over `limit_bytes` addressable bytes
    ///
    /// Limits above the 20-bit byte-addressable range switch to 4 KiB
    /// granularity, dividing the limit by 0x1000.
    pub fn new(base: usize, limit_bytes: u32, access: u16) -> Self {
        if limit_bytes > BYTE_GRANULAR_MAX {
            SegmentDescriptor {
                base,
                limit: limit_bytes / 0x1000,
                access: access | GRANULARITY_BIT,
                granularity: Granularity::Page,
            }
        } else {
            SegmentDescriptor {
                base,
                limit: limit_bytes,
                access,
                granularity: Granularity::Byte,
            }
        }
    }

    /// Like [`new`](Self::new), but refuses any descriptor whose decoded
    /// range would reach past its backing allocation.
    ///
    /// With page granularity the decoded limit rounds up to a whole page,
    /// so the check is conservative: the descriptor must fit even after
    /// rounding.
    pub fn checked_new(
        base: usize,
        limit_bytes: u32,
        access: u16,
        backing: Extent,
    ) -> KernResult<Self> {
        let desc = SegmentDescriptor::new(base, limit_bytes, access);
        let span = desc
            .decoded_limit()
            .checked_add(1)
            .ok_or(KernError::InvalidDescriptor)?;
        if !backing.contains(base, span) {
            return Err(KernError::InvalidDescriptor);
        }
        Ok(desc)
    }

    /// Addressable range in bytes, minus one (the CPU's limit semantics)
    pub fn decoded_limit(&self) -> usize {
        match self.granularity {
            Granularity::Byte => self.limit as usize,
            Granularity::Page => (self.limit as usize) * 0x1000 + 0xFFF,
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// Pack into the 8-byte layout the CPU reads
    ///
    /// The split of base and limit across the entry is architecture
    /// mandated: base in bits 16-39 and 56-63, limit in bits 0-15 plus the
    /// low nibble of byte 6, flags in the high nibble of byte 6.
    pub fn encode(&self) -> [u8; 8] {
        let base = self.base as u32;
        let limit = self.limit;
        let ar = self.access;
        [
            (limit & 0xFF) as u8,
            ((limit >> 8) & 0xFF) as u8,
            (base & 0xFF) as u8,
            ((base >> 8) & 0xFF) as u8,
            ((base >> 16) & 0xFF) as u8,
            (ar & 0xFF) as u8,
            (((limit >> 16) & 0x0F) as u8) | (((ar >> 8) & 0xF0) as u8),
            ((base >> 24) & 0xFF) as u8,
        ]
    }
}

// ============================================================================
// Interrupt gates
// ============================================================================

/// One interrupt-gate entry of the vector table
///
/// A gate names the code segment and entry offset the CPU jumps to when
/// its vector fires. `attributes` carries present/type/DPL; the DPL is
/// what lets ring-3 code raise the software-interrupt vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateDescriptor {
    selector: u16,
    offset: usize,
    attributes: u8,
}

impl GateDescriptor {
    /// A 32-bit interrupt gate callable from `ring` and below
    pub fn interrupt_gate(selector: u16, offset: usize, ring: Ring) -> Self {
        GateDescriptor {
            selector,
            offset,
            attributes: 0x8E | (ring.level() << 5),
        }
    }

    /// Pack into the 8-byte gate layout: offset split across bytes 0-1 and
    /// 6-7, selector in bytes 2-3, attributes in byte 5.
    pub fn encode(&self) -> [u8; 8] {
        let offset = self.offset as u32;
        [
            (offset & 0xFF) as u8,
            ((offset >> 8) & 0xFF) as u8,
            (self.selector & 0xFF) as u8,
            ((self.selector >> 8) & 0xFF) as u8,
            0,
            self.attributes,
            ((offset >> 16) & 0xFF) as u8,
            ((offset >> 24) & 0xFF) as u8,
        ]
    }
}

// ============================================================================
// Global table
// ============================================================================

/// Number of global descriptor slots
pub const GLOBAL_SLOTS: usize = 16;

/// The single table of shared ring-0/1/3 flat segments
pub struct GlobalTable {
    entries: [SegmentDescriptor; GLOBAL_SLOTS],
}

impl GlobalTable {
    pub const fn new() -> Self {
        GlobalTable {
            entries: [SegmentDescriptor::NULL; GLOBAL_SLOTS],
        }
    }

    /// Write one descriptor entry; slot 0 stays null
    pub fn install(&mut self, index: usize, desc: SegmentDescriptor) -> KernResult<()> {
        if index == 0 || index >= GLOBAL_SLOTS {
            return Err(KernError::InvalidDescriptor);
        }
        self.entries[index] = desc;
        Ok(())
    }

    pub fn entry(&self, index: usize) -> Option<&SegmentDescriptor> {
        self.entries.get(index)
    }

    /// Install the six flat boot segments: code/data for each ring
    pub fn install_boot_segments(&mut self) {
        let rings = [Ring::Kernel, Ring::Driver, Ring::User];
        for (i, ring) in rings.iter().enumerate() {
            let code = SegmentDescriptor::new(0, u32::MAX, access_for(*ring, true));
            let data = SegmentDescriptor::new(0, u32::MAX, access_for(*ring, false));
            self.entries[1 + i * 2] = code;
            self.entries[2 + i * 2] = data;
        }
    }
}

/// Write one global descriptor entry
pub fn install_global_segment(
    table: &mut GlobalTable,
    index: usize,
    base: usize,
    limit_bytes: u32,
    access: u16,
) -> KernResult<()> {
    table.install(index, SegmentDescriptor::new(base, limit_bytes, access))
}

// ============================================================================
// Per-task table
// ============================================================================

/// Slot of a task's code descriptor
pub const LDT_CODE: usize = 0;
/// Slot of a task's data descriptor
pub const LDT_DATA: usize = 1;

/// The private two-entry (code, data) table owned by one task
#[derive(Debug, Clone, Copy)]
pub struct LocalTable {
    entries: [SegmentDescriptor; 2],
}

impl LocalTable {
    pub const fn new() -> Self {
        LocalTable {
            entries: [SegmentDescriptor::NULL; 2],
        }
    }

    /// Write one of the two descriptor slots, validated against the
    /// backing allocation.
    pub fn install(
        &mut self,
        index: usize,
        base: usize,
        limit_bytes: u32,
        access: u16,
        backing: Extent,
    ) -> KernResult<()> {
        if index > LDT_DATA {
            return Err(KernError::InvalidDescriptor);
        }
        self.entries[index] = SegmentDescriptor::checked_new(base, limit_bytes, access, backing)?;
        Ok(())
    }

    pub fn code(&self) -> &SegmentDescriptor {
        &self.entries[LDT_CODE]
    }

    pub fn data(&self) -> &SegmentDescriptor {
        &self.entries[LDT_DATA]
    }

    /// Pack both slots into the image the CPU reads through the LDTR
    pub fn encode(&self) -> [[u8; 8]; 2] {
        [self.entries[LDT_CODE].encode(), self.entries[LDT_DATA].encode()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_limits_stay_byte_granular() {
        let d = SegmentDescriptor::new(0x4000, 0xFFFF, access_for(Ring::Kernel, false));
        assert_eq!(d.granularity(), Granularity::Byte);
        assert_eq!(d.decoded_limit(), 0xFFFF);
    }

    #[test]
    fn large_limits_switch_to_page_granularity() {
        let d = SegmentDescriptor::new(0, 0x0040_0000, access_for(Ring::Kernel, false));
        assert_eq!(d.granularity(), Granularity::Page);
        // 4 MiB / 4 KiB pages, decoded back up with page rounding
        assert_eq!(d.decoded_limit(), 0x0040_0FFF);
    }

    #[test]
    fn encode_matches_cpu_layout() {
        // base 0x00400000, limit 0xFFFF bytes, ring-0 data rights
        let d = SegmentDescriptor::new(0x0040_0000, 0xFFFF, 0x4092);
        let raw = d.encode();
        assert_eq!(raw[0], 0xFF); // limit low
        assert_eq!(raw[1], 0xFF);
        assert_eq!(raw[2], 0x00); // base low
        assert_eq!(raw[3], 0x00);
        assert_eq!(raw[4], 0x40); // base mid
        assert_eq!(raw[5], 0x92); // access byte
        assert_eq!(raw[6], 0x40); // flags nibble | limit high nibble
        assert_eq!(raw[7], 0x00); // base high
    }

    #[test]
    fn encode_sets_granularity_flag() {
        let d = SegmentDescriptor::new(0, 0xFFFF_FFFF, 0x4092);
        let raw = d.encode();
        // G and D bits in the high nibble of byte 6, limit 0xFFFFF packed
        assert_eq!(raw[6], 0xCF);
        assert_eq!(raw[0], 0xFF);
        assert_eq!(raw[1], 0xFF);
    }

    #[test]
    fn checked_new_rejects_overreach() {
        let backing = Extent::new(0x10000, 0x1000);
        // Fits exactly
        let ok = SegmentDescriptor::checked_new(0x10000, 0xFFF, 0x4092, backing);
        assert!(ok.is_ok());
        // One byte past the backing extent
        let err = SegmentDescriptor::checked_new(0x10000, 0x1000, 0x4092, backing);
        assert_eq!(err, Err(KernError::InvalidDescriptor));
        // Base outside the extent entirely
        let err = SegmentDescriptor::checked_new(0x20000, 0x10, 0x4092, backing);
        assert_eq!(err, Err(KernError::InvalidDescriptor));
    }

    #[test]
    fn checked_new_accounts_for_page_rounding() {
        // 8 MiB backing; a limit of exactly 8 MiB decodes to 8 MiB + 0xFFF
        // after page rounding and must be rejected.
        let backing = Extent::new(0x0100_0000, 0x0080_0000);
        let err = SegmentDescriptor::checked_new(0x0100_0000, 0x0080_0000, 0x4092, backing);
        assert_eq!(err, Err(KernError::InvalidDescriptor));
        let ok = SegmentDescriptor::checked_new(0x0100_0000, 0x0080_0000 - 0x1000, 0x4092, backing);
        assert!(ok.is_ok());
    }

    #[test]
    fn gate_encode_matches_cpu_layout() {
        let g = GateDescriptor::interrupt_gate(0x08, 0x0040_1234, Ring::Kernel);
        assert_eq!(g.encode(), [0x34, 0x12, 0x08, 0x00, 0x00, 0x8E, 0x40, 0x00]);
    }

    #[test]
    fn user_callable_gate_carries_ring3_dpl() {
        let g = GateDescriptor::interrupt_gate(0x08, 0x1000, Ring::User);
        assert_eq!(g.encode()[5], 0xEE);
    }

    #[test]
    fn global_table_protects_null_slot() {
        let mut gdt = GlobalTable::new();
        let d = SegmentDescriptor::new(0, 0xFFFF, 0x409A);
        assert_eq!(gdt.install(0, d), Err(KernError::InvalidDescriptor));
        assert!(gdt.install(1, d).is_ok());
    }

    #[test]
    fn boot_segments_cover_all_rings() {
        let mut gdt = GlobalTable::new();
        gdt.install_boot_segments();
        for index in 1..=6 {
            let entry = gdt.entry(index).unwrap();
            assert_eq!(entry.base(), 0);
            assert_eq!(entry.granularity(), Granularity::Page);
        }
    }

    #[test]
    fn local_table_install_and_read_back() {
        let mut ldt = LocalTable::new();
        let backing = Extent::new(0x8000, 0x2000);
        ldt.install(LDT_DATA, 0x8000, 0x1FFF, access_for(Ring::User, false), backing)
            .unwrap();
        assert_eq!(ldt.data().base(), 0x8000);
        assert_eq!(ldt.data().decoded_limit(), 0x1FFF);
        assert_eq!(
            ldt.install(2, 0x8000, 0xFF, 0x4092, backing),
            Err(KernError::InvalidDescriptor)
        );
    }
}
