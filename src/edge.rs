//! Downstream collaborator ports
//!
//! The core drives three external services through these traits:
//!
//! - [`AlgorithmLibrary`]: the parity/mirror/stripe computation engine. The
//!   core never performs XOR or reconstruction math itself; it hands the
//!   library a narrowed sub-range plus per-chunk degraded info and consumes
//!   status/qualifier (and read stamps) back.
//! - [`DiskEdge`]: per-disk functional packets addressed by position index,
//!   completed asynchronously. Used directly only by the journal recovery
//!   pass; normal I/O reaches disks through the algorithm library.
//! - [`MetadataPersistence`]: a durable, crash-atomic write primitive keyed
//!   by byte offset and length. The core does not specify its on-media
//!   layout.

use async_trait::async_trait;
use bytes::Bytes;
use once_cell::sync::Lazy;

use crate::block::{BlockQualifier, BlockStatus, Opcode, PositionBitmask};
use crate::chunk::ChunkEntry;
use crate::error::Result;

/// Blocks covered by one element of the shared zero buffer.
pub const ZERO_BUCKET_BLOCKS: u64 = 64;

/// Bytes per block on the wire to the edges.
pub const BYTES_PER_BLOCK: usize = 520;

/// Process-wide zero-filled buffer shared by all zero-fill fan-out I/O.
///
/// Every journal sub-request points its scatter-gather elements at this one
/// allocation rather than allocating per-disk zero pages.
static ZERO_BUCKET: Lazy<Bytes> =
    Lazy::new(|| Bytes::from(vec![0u8; ZERO_BUCKET_BLOCKS as usize * BYTES_PER_BLOCK]));

/// Shared zero buffer for zero-fill scatter-gather lists.
pub fn zero_bucket() -> Bytes {
    ZERO_BUCKET.clone()
}

/// Build a scatter-gather list of zero segments covering `blocks`, reusing
/// the shared zero bucket for every element.
pub fn plant_zero_sg(blocks: u64) -> Vec<Bytes> {
    let mut sg = Vec::new();
    let mut remaining = blocks;
    while remaining > 0 {
        let this = remaining.min(ZERO_BUCKET_BLOCKS);
        sg.push(ZERO_BUCKET.slice(..this as usize * BYTES_PER_BLOCK));
        remaining -= this;
    }
    sg
}

// =============================================================================
// Algorithm Library
// =============================================================================

/// A narrowed sub-request handed to the algorithm library.
///
/// The range never crosses a degraded/non-degraded chunk boundary; the
/// chunk info entries cover exactly the chunks of the range.
#[derive(Debug, Clone)]
pub struct SubRequest {
    pub opcode: Opcode,
    /// Raid-relative LBA (disk-relative for disk-based opcodes)
    pub lba: u64,
    pub blocks: u64,
    /// Per-chunk degraded/verify metadata for the range
    pub chunk_info: Vec<ChunkEntry>,
    /// Positions currently rebuild-logging, snapshotted at lock grant
    pub rebuild_logging: PositionBitmask,
    /// Write payload; empty for reads, zeros, probes
    pub buffer: Bytes,
}

/// Stamps returned with read data for positional validation.
#[derive(Debug, Clone, Copy)]
pub struct ReadStamps {
    /// Checksum verdict from the opaque sector-check service
    pub checksum_valid: bool,
    /// LBA stamped into the sector at write time
    pub lba_stamp: u64,
}

/// Completion of one algorithm dispatch.
#[derive(Debug, Clone)]
pub struct AlgorithmCompletion {
    pub status: BlockStatus,
    pub qualifier: BlockQualifier,
    /// Read payload when the opcode returns data
    pub data: Option<Bytes>,
    /// Present for read completions; validated by the fast path
    pub stamps: Option<ReadStamps>,
    /// The library observed an interrupted write on this range
    pub incomplete_write: bool,
    /// The library had to remap a journal slot while servicing the range
    pub remap_needed: bool,
    /// A prerequisite operation determined no further work is needed: the
    /// probed range is already zeroed, or the journal header shows no live
    /// slots to flush
    pub no_further_work: bool,
}

impl AlgorithmCompletion {
    pub fn success() -> Self {
        Self {
            status: BlockStatus::Success,
            qualifier: BlockQualifier::None,
            data: None,
            stamps: None,
            incomplete_write: false,
            remap_needed: false,
            no_further_work: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == BlockStatus::Success
    }
}

/// The parity/mirror/stripe computation engine.
#[async_trait]
pub trait AlgorithmLibrary: Send + Sync {
    /// Execute one sub-request against the disks. This is the only point
    /// where disk-level data I/O actually occurs for request-driven work.
    async fn execute(&self, sub: SubRequest) -> AlgorithmCompletion;
}

// =============================================================================
// Disk Edge
// =============================================================================

/// A functional packet addressed to one disk position.
#[derive(Debug, Clone)]
pub struct DiskPacket {
    pub position: u32,
    /// Per-disk LBA
    pub lba: u64,
    pub blocks: u64,
    /// Scatter-gather payload
    pub sg: Vec<Bytes>,
}

/// Per-disk downstream edge; completion is asynchronous.
#[async_trait]
pub trait DiskEdge: Send + Sync {
    /// Send a write packet to the addressed position.
    async fn send_write(&self, packet: DiskPacket) -> Result<()>;
}

// =============================================================================
// Metadata Persistence
// =============================================================================

/// Durable, crash-atomic metadata write primitive.
///
/// The core treats each `(offset, data)` update as atomic and does not
/// specify the on-media layout behind it. Reads of never-written space
/// return zero-filled bytes.
#[async_trait]
pub trait MetadataPersistence: Send + Sync {
    async fn write(&self, offset: u64, data: &[u8]) -> Result<()>;
    async fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>>;
}

/// Persist a serde record at `offset` as a length-prefixed payload.
pub async fn write_record<T: serde::Serialize>(
    persistence: &dyn MetadataPersistence,
    offset: u64,
    record: &T,
) -> Result<()> {
    let payload = serde_json::to_vec(record)
        .map_err(|e| crate::error::Error::Internal(format!("record encode: {e}")))?;
    let mut framed = Vec::with_capacity(payload.len() + 4);
    framed.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    framed.extend_from_slice(&payload);
    persistence.write(offset, &framed).await
}

/// Read back a record persisted by [`write_record`]. Returns `None` when
/// the offset was never written.
pub async fn read_record<T: serde::de::DeserializeOwned>(
    persistence: &dyn MetadataPersistence,
    offset: u64,
) -> Result<Option<T>> {
    let prefix = persistence.read(offset, 4).await?;
    let len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    if len == 0 {
        return Ok(None);
    }
    let payload = persistence.read(offset + 4, len).await?;
    let record = serde_json::from_slice(&payload)
        .map_err(|e| crate::error::Error::MetadataFatal(format!("record decode: {e}")))?;
    Ok(Some(record))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_sg_covers_block_count() {
        let sg = plant_zero_sg(ZERO_BUCKET_BLOCKS * 2 + 5);
        assert_eq!(sg.len(), 3);
        let total: usize = sg.iter().map(|b| b.len()).sum();
        assert_eq!(
            total,
            (ZERO_BUCKET_BLOCKS as usize * 2 + 5) * BYTES_PER_BLOCK
        );
        assert!(sg.iter().all(|seg| seg.iter().all(|b| *b == 0)));
    }

    #[test]
    fn test_zero_sg_shares_one_allocation() {
        let sg = plant_zero_sg(ZERO_BUCKET_BLOCKS * 4);
        let base = zero_bucket();
        // Every full-size segment aliases the shared bucket, no copies.
        for seg in &sg {
            assert_eq!(seg.as_ptr(), base.as_ptr());
        }
    }
}
