//! RAID group geometry
//!
//! Capacity layout, chunk addressing, and stripe-lock range computation.
//! The per-disk address space is laid out as:
//!
//! ```text
//! ┌──────────────────────────┬───────────────────┬─────────────────┐
//! │        user data         │  paged metadata   │  write journal  │
//! │  [0, user_capacity)      │ (metadata region) │ (reserved LBAs) │
//! └──────────────────────────┴───────────────────┴─────────────────┘
//! ```
//!
//! The paged metadata region is itself tracked by the non-paged
//! ("metadata-of-metadata") table, which is always resident.

use serde::{Deserialize, Serialize};

use crate::block::{LbaRange, Opcode};

/// Stripe-aligned lock range, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StripeRange {
    pub first: u64,
    pub last: u64,
}

impl StripeRange {
    pub fn new(first: u64, last: u64) -> Self {
        debug_assert!(first <= last, "stripe range must be non-empty");
        Self { first, last }
    }

    pub fn overlaps(&self, other: &StripeRange) -> bool {
        self.first <= other.last && other.first <= self.last
    }
}

/// RAID layout variant of the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaidType {
    /// Rotating parity (single or dual)
    Parity,
    /// Two-way or three-way mirror
    Mirror,
    /// Plain striper with no redundancy
    Striper,
    /// Mirror groups beneath a striper; the mirrors serialize and mark
    /// verify themselves, the striper level does neither
    MirrorUnderStriper,
}

/// Geometry and capacity configuration for one RAID group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaidGeometry {
    pub raid_type: RaidType,
    /// Total disk positions, parity included
    pub width: u32,
    /// Positions carrying user data
    pub data_disks: u16,
    /// Blocks per stripe element on one disk
    pub element_size: u64,
    /// Blocks per metadata chunk (per disk)
    pub chunk_size: u64,
    /// Per-disk capacity in blocks, journal included
    pub disk_capacity: u64,
    /// First per-disk LBA of the paged metadata region
    pub metadata_start: u64,
    /// Blocks of paged metadata per disk
    pub metadata_capacity: u64,
    /// First per-disk LBA of the write journal
    pub journal_start: u64,
    /// Blocks of journal space per disk
    pub journal_capacity: u64,
}

impl RaidGeometry {
    /// Per-disk LBA where user data ends.
    pub fn user_capacity(&self) -> u64 {
        self.metadata_start
    }

    /// Whether a raid-relative LBA falls inside the paged metadata region
    /// (the metadata-of-metadata territory of the non-paged table).
    pub fn is_metadata_io(&self, raid_lba: u64) -> bool {
        let disk_lba = raid_lba / self.data_disks as u64;
        disk_lba >= self.metadata_start && disk_lba < self.journal_start
    }

    /// Whether a per-disk LBA falls inside the reserved journal space.
    pub fn is_journal_lba(&self, disk_lba: u64) -> bool {
        disk_lba >= self.journal_start && disk_lba < self.journal_start + self.journal_capacity
    }

    /// Mirrors and plain stripers track everything in the resident table.
    pub fn has_paged_metadata(&self) -> bool {
        !matches!(self.raid_type, RaidType::Striper)
    }

    /// Operations under a mirror-under-striper composition never take a
    /// stripe lock at this level: an ancestor or descendant already
    /// serializes the range.
    pub fn lock_taken_elsewhere(&self) -> bool {
        matches!(self.raid_type, RaidType::MirrorUnderStriper)
    }

    /// Chunk index covering a per-disk LBA.
    pub fn chunk_index(&self, disk_lba: u64) -> u64 {
        disk_lba / self.chunk_size
    }

    /// Chunk index range `(start_chunk, count)` covering a disk-relative
    /// range.
    pub fn chunk_range(&self, disk_lba: u64, blocks: u64) -> (u64, u64) {
        debug_assert!(blocks > 0);
        let start = self.chunk_index(disk_lba);
        let end = self.chunk_index(disk_lba + blocks - 1);
        (start, end - start + 1)
    }

    /// Chunk index range for a raid-relative range.
    pub fn chunk_range_for_raid_lba(&self, raid_lba: u64, blocks: u64) -> (u64, u64) {
        let disk_start = raid_lba / self.data_disks as u64;
        let disk_end = (raid_lba + blocks - 1) / self.data_disks as u64;
        let start = self.chunk_index(disk_start);
        let end = self.chunk_index(disk_end);
        (start, end - start + 1)
    }

    /// First chunk index of the paged metadata region.
    pub fn metadata_start_chunk(&self) -> u64 {
        self.chunk_index(self.metadata_start)
    }

    /// Number of chunks in the paged metadata region.
    pub fn metadata_chunks(&self) -> u64 {
        self.metadata_capacity.div_ceil(self.chunk_size)
    }

    /// Number of chunks of user data per disk.
    pub fn user_data_chunks(&self) -> u64 {
        self.user_capacity().div_ceil(self.chunk_size)
    }

    /// Compute the stripe-lock range for a request.
    ///
    /// Disk-based opcodes lock the physical per-disk span directly; logical
    /// opcodes lock the per-disk projection of the raid-relative range.
    /// Zeros are widened to chunk alignment so the clear-bits optimization
    /// stays covered by the lock.
    pub fn lock_range(&self, opcode: Opcode, lba: u64, blocks: u64) -> StripeRange {
        debug_assert!(blocks > 0);
        if opcode.is_disk_based() {
            return StripeRange::new(lba, lba + blocks - 1);
        }
        let first_disk_lba = lba / self.data_disks as u64;
        let last_disk_lba = (lba + blocks - 1) / self.data_disks as u64;
        if matches!(opcode, Opcode::Zero) {
            let first = (first_disk_lba / self.chunk_size) * self.chunk_size;
            let last = ((last_disk_lba / self.chunk_size) + 1) * self.chunk_size - 1;
            return StripeRange::new(first, last);
        }
        StripeRange::new(first_disk_lba, last_disk_lba)
    }

    /// Whether a raid-relative range is exactly stripe aligned (starts on a
    /// stripe boundary and covers whole stripes).
    pub fn is_stripe_aligned(&self, range: &LbaRange) -> bool {
        let stripe_blocks = self.element_size * self.data_disks as u64;
        range.start % stripe_blocks == 0 && range.len() % stripe_blocks == 0
    }
}

impl Default for RaidGeometry {
    fn default() -> Self {
        // 4+1 parity group, 128-block elements, 2048-block chunks.
        Self {
            raid_type: RaidType::Parity,
            width: 5,
            data_disks: 4,
            element_size: 128,
            chunk_size: 2048,
            disk_capacity: 0x10_0000,
            metadata_start: 0xF_0000,
            metadata_capacity: 0x4000,
            journal_start: 0xF_4000,
            journal_capacity: 0x2000,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
