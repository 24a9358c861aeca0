//! Block-level request types shared across the I/O path
//!
//! Defines the opcode vocabulary, the status/qualifier pair returned to the
//! block-transport front end, and the request descriptor handed to the core.
//! Opcodes are a closed enum grouped into dispatch classes; the class, not
//! the individual opcode, drives lock policy and metadata behavior.

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Sentinel for "no LBA" / invalid checkpoint.
pub const LBA_INVALID: u64 = u64::MAX;

/// One bit per disk position, position 0 in the lowest bit.
pub type PositionBitmask = u16;

// =============================================================================
// LBA Ranges
// =============================================================================

/// Logical Block Address range, end-exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LbaRange {
    /// Starting LBA (inclusive)
    pub start: u64,
    /// Ending LBA (exclusive)
    pub end: u64,
}

impl LbaRange {
    /// Create a new LBA range.
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start < end, "LBA range must be non-empty");
        Self { start, end }
    }

    /// Build a range from a start LBA and a block count.
    pub fn from_len(start: u64, blocks: u64) -> Self {
        Self::new(start, start + blocks)
    }

    /// Number of blocks in this range.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Check if the range is empty.
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Check if this range overlaps with another.
    pub fn overlaps(&self, other: &LbaRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// =============================================================================
// Verify Reasons
// =============================================================================

/// Enumerated verify reasons, OR-combinable into a chunk's verify flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum VerifyReason {
    /// User-initiated background verify
    User = 0x01,
    /// Verify after a correctable/uncorrectable error was observed
    Error = 0x02,
    /// Verify after an interrupted write left a stripe inconsistent
    IncompleteWrite = 0x04,
    /// System-scheduled verify
    System = 0x08,
    /// Read-only verify: checks without repairing
    ReadOnly = 0x10,
}

/// OR-combined set of [`VerifyReason`] bits stored per chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyFlags(pub u8);

impl VerifyFlags {
    pub const NONE: VerifyFlags = VerifyFlags(0);

    pub fn contains(&self, reason: VerifyReason) -> bool {
        self.0 & reason as u8 != 0
    }

    pub fn insert(&mut self, reason: VerifyReason) {
        self.0 |= reason as u8;
    }

    pub fn union(&self, other: VerifyFlags) -> VerifyFlags {
        VerifyFlags(self.0 | other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

// =============================================================================
// Opcodes
// =============================================================================

/// Dispatch class of an opcode.
///
/// The class decides lock policy (`may_wait`), whether the operation
/// modifies media, and how completion escalation behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    /// Host data modification: write, zero, write-log flush
    DataModify,
    /// Background integrity check
    Verify,
    /// Reconstruction of a degraded position
    Rebuild,
    /// Operations addressed at metadata or journal private space
    Metadata,
    /// Monitor-only control operations
    Monitor,
    /// Plain host read
    Read,
}

/// Closed set of block operations the core accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Opcode {
    /// Host read
    Read,
    /// Host write
    Write,
    /// Zero-fill a range; chunk-aligned zeros on degraded groups may clear
    /// needs-rebuild bits instead of writing
    Zero,
    /// Reconstruct a degraded position over a range (disk-relative LBAs)
    Rebuild,
    /// Probe whether a range is already zeroed; prerequisite for rebuild
    CheckZeroed,
    /// Background verify with a reason (disk-relative LBAs)
    Verify(VerifyReason),
    /// Read data back under the new key during a rekey
    RekeyRead,
    /// Re-write data under the new key during a rekey
    RekeyWrite,
    /// First pass of a write-log flush: read the journal slot header.
    /// Addressed at the live stripe range; the slot itself is resolved by
    /// the algorithm library inside journal private space
    WriteLogHeaderRead,
    /// Flush journaled writes to the live stripe range the request names
    WriteLogFlush,
    /// Monitor request to mark a region as needing rebuild
    MarkForRebuild,
}

impl Opcode {
    /// The dispatch class this opcode belongs to.
    pub fn class(&self) -> OpClass {
        match self {
            Opcode::Read => OpClass::Read,
            Opcode::Write | Opcode::Zero | Opcode::WriteLogFlush => OpClass::DataModify,
            Opcode::Verify(_) | Opcode::CheckZeroed => OpClass::Verify,
            Opcode::Rebuild => OpClass::Rebuild,
            Opcode::WriteLogHeaderRead | Opcode::RekeyRead | Opcode::RekeyWrite => {
                OpClass::Metadata
            }
            Opcode::MarkForRebuild => OpClass::Monitor,
        }
    }

    /// Whether this opcode modifies media and therefore participates in
    /// needs-rebuild marking.
    pub fn is_media_modify(&self) -> bool {
        matches!(
            self,
            Opcode::Write | Opcode::Zero | Opcode::RekeyWrite | Opcode::WriteLogFlush
        )
    }

    /// Verify and rebuild opcodes clear, rather than set, verify state on
    /// completion.
    pub fn is_verify_or_rebuild(&self) -> bool {
        matches!(
            self,
            Opcode::Verify(_) | Opcode::Rebuild | Opcode::CheckZeroed
        )
    }

    /// Whether the request LBA is disk-relative (per-position) rather than
    /// raid-relative. Background verify and rebuild walk individual disks.
    pub fn is_disk_based(&self) -> bool {
        matches!(
            self,
            Opcode::Verify(_) | Opcode::Rebuild | Opcode::CheckZeroed | Opcode::MarkForRebuild
        )
    }

    /// Whether a lock acquire for this opcode may wait behind a quiesce.
    ///
    /// Background, metadata, and monitor operations must fail fast to avoid
    /// deadlocking the metadata subsystem against itself; only host I/O
    /// holds.
    pub fn may_wait(&self) -> bool {
        matches!(self.class(), OpClass::Read | OpClass::DataModify)
            && !matches!(self, Opcode::WriteLogFlush)
    }

    /// Lock mode requested for this opcode.
    pub fn is_read_lock(&self) -> bool {
        matches!(self, Opcode::Read)
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Opcode::Read => write!(f, "read"),
            Opcode::Write => write!(f, "write"),
            Opcode::Zero => write!(f, "zero"),
            Opcode::Rebuild => write!(f, "rebuild"),
            Opcode::CheckZeroed => write!(f, "check-zeroed"),
            Opcode::Verify(reason) => write!(f, "verify({reason:?})"),
            Opcode::RekeyRead => write!(f, "rekey-read"),
            Opcode::RekeyWrite => write!(f, "rekey-write"),
            Opcode::WriteLogHeaderRead => write!(f, "write-log-hdr-rd"),
            Opcode::WriteLogFlush => write!(f, "write-log-flush"),
            Opcode::MarkForRebuild => write!(f, "mark-for-rebuild"),
        }
    }
}

// =============================================================================
// Status / Qualifier
// =============================================================================

/// Final block status returned to the transport front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockStatus {
    Success,
    IoFailed,
    InvalidRequest,
    RequestAborted,
    MediaError,
    Timeout,
    /// No status has been set yet
    Invalid,
}

impl BlockStatus {
    /// Whether this status is terminal and must never be overwritten by a
    /// later, unrelated completion.
    pub fn is_terminal_failure(&self) -> bool {
        !matches!(self, BlockStatus::Success | BlockStatus::Invalid)
    }
}

/// Qualifier refining a [`BlockStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockQualifier {
    None,
    RetryPossible,
    RetryNotPossible,
    ClientAborted,
    UnexpectedError,
    TooManyDeadPositions,
    NotFullStripe,
    NotPreferred,
    Zeroed,
    LockFailed,
}

// =============================================================================
// Request Descriptor
// =============================================================================

/// Flags carried on an incoming block request.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestFlags {
    /// Caller requires synchronous completion semantics
    pub synchronous: bool,
    /// Request must not be parked behind a quiesce (monitor-originated)
    pub do_not_quiesce: bool,
    /// Request must not be cancelled once metadata updates begin
    pub do_not_cancel: bool,
}

/// A validated block request as handed over by the transport collaborator.
#[derive(Debug, Clone)]
pub struct BlockRequest {
    /// Request identity, stable across quiesce/restart cycles
    pub id: Uuid,
    pub opcode: Opcode,
    /// Logical start LBA (disk-relative for disk-based opcodes)
    pub lba: u64,
    pub blocks: u64,
    pub flags: RequestFlags,
    /// Scatter-gather payload for writes; empty for reads and zeros
    pub buffer: Bytes,
    /// Optional per-request deadline override
    pub deadline: Option<Duration>,
    /// Client abort signal; a cancelled token fails the request with
    /// `RequestAborted`/`ClientAborted`
    pub cancel: CancellationToken,
}

impl BlockRequest {
    /// Build a request with default flags, no payload and no deadline.
    pub fn new(opcode: Opcode, lba: u64, blocks: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            opcode,
            lba,
            blocks,
            flags: RequestFlags::default(),
            buffer: Bytes::new(),
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Attach a write payload.
    pub fn with_buffer(mut self, buffer: Bytes) -> Self {
        self.buffer = buffer;
        self
    }

    /// Mark as monitor-originated: never quiesced, fails fast on contention.
    pub fn monitor(mut self) -> Self {
        self.flags.do_not_quiesce = true;
        self
    }

    /// The raid-relative range this request covers, given the number of
    /// data disks (disk-based opcodes address a single position's LBAs).
    pub fn raid_range(&self, data_disks: u16) -> LbaRange {
        if self.opcode.is_disk_based() {
            let start = self.lba * data_disks as u64;
            LbaRange::from_len(start, self.blocks * data_disks as u64)
        } else {
            LbaRange::from_len(self.lba, self.blocks)
        }
    }
}

/// Completion delivered back to the transport front end.
#[derive(Debug, Clone)]
pub struct IoCompletion {
    pub request_id: Uuid,
    pub status: BlockStatus,
    pub qualifier: BlockQualifier,
    /// Read payload, when the opcode returns data
    pub data: Option<Bytes>,
}

impl IoCompletion {
    pub fn success(request_id: Uuid) -> Self {
        Self {
            request_id,
            status: BlockStatus::Success,
            qualifier: BlockQualifier::None,
            data: None,
        }
    }

    pub fn failed(request_id: Uuid, status: BlockStatus, qualifier: BlockQualifier) -> Self {
        Self {
            request_id,
            status,
            qualifier,
            data: None,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_classes() {
        assert_eq!(Opcode::Write.class(), OpClass::DataModify);
        assert_eq!(Opcode::Verify(VerifyReason::User).class(), OpClass::Verify);
        assert_eq!(Opcode::Rebuild.class(), OpClass::Rebuild);
        assert_eq!(Opcode::WriteLogHeaderRead.class(), OpClass::Metadata);
        assert_eq!(Opcode::MarkForRebuild.class(), OpClass::Monitor);
    }

    #[test]
    fn test_may_wait_policy() {
        // Host I/O holds behind quiesce; background and metadata fail fast.
        assert!(Opcode::Read.may_wait());
        assert!(Opcode::Write.may_wait());
        assert!(Opcode::Zero.may_wait());
        assert!(!Opcode::Rebuild.may_wait());
        assert!(!Opcode::Verify(VerifyReason::Error).may_wait());
        assert!(!Opcode::WriteLogFlush.may_wait());
        assert!(!Opcode::WriteLogHeaderRead.may_wait());
        assert!(!Opcode::MarkForRebuild.may_wait());
    }

    #[test]
    fn test_media_modify() {
        assert!(Opcode::Write.is_media_modify());
        assert!(Opcode::Zero.is_media_modify());
        assert!(Opcode::WriteLogFlush.is_media_modify());
        assert!(!Opcode::Read.is_media_modify());
        assert!(!Opcode::Verify(VerifyReason::System).is_media_modify());
        assert!(!Opcode::Rebuild.is_media_modify());
    }

    #[test]
    fn test_lba_range_overlap() {
        let a = LbaRange::new(0, 100);
        let b = LbaRange::new(99, 200);
        let c = LbaRange::new(100, 200);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert_eq!(a.len(), 100);
    }

    #[test]
    fn test_disk_based_raid_range() {
        let req = BlockRequest::new(Opcode::Rebuild, 10, 4);
        let range = req.raid_range(4);
        assert_eq!(range.start, 40);
        assert_eq!(range.len(), 16);

        let req = BlockRequest::new(Opcode::Write, 10, 4);
        let range = req.raid_range(4);
        assert_eq!(range.start, 10);
        assert_eq!(range.len(), 4);
    }

    #[test]
    fn test_verify_flags_or_combine() {
        let mut flags = VerifyFlags::NONE;
        flags.insert(VerifyReason::Error);
        flags.insert(VerifyReason::IncompleteWrite);
        assert!(flags.contains(VerifyReason::Error));
        assert!(flags.contains(VerifyReason::IncompleteWrite));
        assert!(!flags.contains(VerifyReason::User));
    }

    #[test]
    fn test_terminal_status_detection() {
        assert!(BlockStatus::IoFailed.is_terminal_failure());
        assert!(BlockStatus::MediaError.is_terminal_failure());
        assert!(!BlockStatus::Success.is_terminal_failure());
        assert!(!BlockStatus::Invalid.is_terminal_failure());
    }
}
