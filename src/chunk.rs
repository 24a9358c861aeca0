//! Chunk Metadata Store
//!
//! Per-chunk persistent record of needs-rebuild bits, verify flags and the
//! rekey flag, layered over two physical backing stores:
//!
//! - **non-paged**: always resident, authoritative; tracks the paged
//!   metadata region itself (metadata-of-metadata) and every chunk of raid
//!   types with no paged backing at all.
//! - **paged**: on-media, fine-grained; tracks user data chunks.
//!
//! Callers never pick the backing store — routing is automatic from the
//! chunk index range. Updates are additive (bitwise OR) unless the caller
//! is the zero-operation clear pass, the only path allowed to narrow the
//! needs-rebuild bitmask.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace};

use crate::block::{PositionBitmask, VerifyFlags};
use crate::edge::MetadataPersistence;
use crate::error::{Error, Result};
use crate::geometry::RaidGeometry;

/// Hard cap on chunks in one read/update call. Callers exceeding it split
/// the request themselves; this is a library invariant, not a wire limit.
pub const MAX_CHUNKS_PER_CALL: u64 = 16;

/// Fixed on-media record size for one paged chunk entry.
pub const PAGED_RECORD_SIZE: usize = 8;

/// Byte offset of the serialized non-paged table in the metadata store.
pub const NONPAGED_TABLE_OFFSET: u64 = 0x0;

/// Byte offset of the journal recovery checkpoint record.
pub const JOURNAL_CHECKPOINT_OFFSET: u64 = 0x1000;

/// Base byte offset of the paged chunk table.
pub const PAGED_TABLE_BASE: u64 = 0x2000;

// =============================================================================
// Chunk Entry
// =============================================================================

/// Metadata for one fixed-size chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEntry {
    /// One bit per disk position that must be reconstructed before the
    /// chunk's data on that position is trustworthy
    pub needs_rebuild: PositionBitmask,
    /// OR-combined verify reasons pending for this chunk
    pub verify: VerifyFlags,
    /// Chunk still holds data under the old key during a rekey
    pub rekey: bool,
}

impl ChunkEntry {
    /// A delta that marks the given positions for rebuild.
    pub fn rebuild_delta(bits: PositionBitmask) -> Self {
        Self {
            needs_rebuild: bits,
            ..Default::default()
        }
    }

    /// A delta that marks the given verify reasons.
    pub fn verify_delta(flags: VerifyFlags) -> Self {
        Self {
            verify: flags,
            ..Default::default()
        }
    }

    /// Apply `delta` onto this entry.
    ///
    /// Additive mode never loses a previously-set bit; clear mode removes
    /// exactly the bits named by the delta.
    pub fn apply(&mut self, delta: &ChunkEntry, clear_mode: bool) {
        if clear_mode {
            self.needs_rebuild &= !delta.needs_rebuild;
            self.verify = VerifyFlags(self.verify.0 & !delta.verify.0);
            if delta.rekey {
                self.rekey = false;
            }
        } else {
            self.needs_rebuild |= delta.needs_rebuild;
            self.verify = self.verify.union(delta.verify);
            self.rekey |= delta.rekey;
        }
    }

    /// Whether any position of this chunk is degraded.
    pub fn is_degraded(&self) -> bool {
        self.needs_rebuild != 0
    }

    fn encode(&self) -> [u8; PAGED_RECORD_SIZE] {
        let mut rec = [0u8; PAGED_RECORD_SIZE];
        rec[..2].copy_from_slice(&self.needs_rebuild.to_le_bytes());
        rec[2] = self.verify.0;
        rec[3] = self.rekey as u8;
        rec
    }

    fn decode(rec: &[u8]) -> Self {
        Self {
            needs_rebuild: PositionBitmask::from_le_bytes([rec[0], rec[1]]),
            verify: VerifyFlags(rec[2]),
            rekey: rec[3] != 0,
        }
    }
}

// =============================================================================
// Store
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backing {
    NonPaged,
    Paged,
}

/// The two-tier chunk metadata store for one RAID group.
pub struct ChunkStore {
    geometry: Arc<RaidGeometry>,
    persistence: Arc<dyn MetadataPersistence>,
    /// Always-resident table: metadata-of-metadata chunks, or the whole
    /// group when the raid type has no paged backing
    nonpaged: RwLock<Vec<ChunkEntry>>,
}

impl ChunkStore {
    /// Create a store with a zeroed table, as at group initialization.
    pub fn new(geometry: Arc<RaidGeometry>, persistence: Arc<dyn MetadataPersistence>) -> Self {
        let nonpaged_len = if geometry.has_paged_metadata() {
            geometry.metadata_chunks()
        } else {
            geometry.user_data_chunks() + geometry.metadata_chunks()
        };
        Self {
            geometry,
            persistence,
            nonpaged: RwLock::new(vec![ChunkEntry::default(); nonpaged_len as usize]),
        }
    }

    fn route(&self, start_chunk: u64, count: u64) -> Result<Backing> {
        if !self.geometry.has_paged_metadata() {
            return Ok(Backing::NonPaged);
        }
        let md_start = self.geometry.metadata_start_chunk();
        let end_chunk = start_chunk + count - 1;
        if start_chunk >= md_start {
            Ok(Backing::NonPaged)
        } else if end_chunk < md_start {
            Ok(Backing::Paged)
        } else {
            Err(Error::InvalidRequest(format!(
                "chunk range [{start_chunk}, {end_chunk}] crosses the metadata region boundary"
            )))
        }
    }

    fn nonpaged_index(&self, chunk: u64) -> usize {
        if self.geometry.has_paged_metadata() {
            (chunk - self.geometry.metadata_start_chunk()) as usize
        } else {
            chunk as usize
        }
    }

    fn check_batch(count: u64) -> Result<()> {
        if count == 0 {
            return Err(Error::InvalidRequest("empty chunk range".into()));
        }
        if count > MAX_CHUNKS_PER_CALL {
            return Err(Error::ChunkBatchTooLarge {
                count,
                max: MAX_CHUNKS_PER_CALL,
            });
        }
        Ok(())
    }

    /// Read the entries for a chunk range, routed automatically.
    #[instrument(skip(self), level = "trace")]
    pub async fn read_range(&self, start_chunk: u64, count: u64) -> Result<Vec<ChunkEntry>> {
        Self::check_batch(count)?;
        match self.route(start_chunk, count)? {
            Backing::NonPaged => {
                let table = self.nonpaged.read();
                let start = self.nonpaged_index(start_chunk);
                let end = start + count as usize;
                if end > table.len() {
                    return Err(Error::InvalidRequest(format!(
                        "chunk range [{start_chunk}, +{count}) beyond the non-paged table"
                    )));
                }
                Ok(table[start..end].to_vec())
            }
            Backing::Paged => {
                let offset = PAGED_TABLE_BASE + start_chunk * PAGED_RECORD_SIZE as u64;
                let raw = self
                    .persistence
                    .read(offset, count as usize * PAGED_RECORD_SIZE)
                    .await?;
                Ok(raw
                    .chunks_exact(PAGED_RECORD_SIZE)
                    .map(ChunkEntry::decode)
                    .collect())
            }
        }
    }

    /// Apply `delta` across a chunk range.
    ///
    /// `clear_mode` is reserved for the zero-operation optimization on
    /// fully degraded, chunk-aligned ranges; every other caller passes
    /// `false` and can only widen the stored bits.
    #[instrument(skip(self, delta), level = "debug")]
    pub async fn update_range(
        &self,
        start_chunk: u64,
        count: u64,
        delta: &ChunkEntry,
        clear_mode: bool,
    ) -> Result<()> {
        Self::check_batch(count)?;
        match self.route(start_chunk, count)? {
            Backing::NonPaged => {
                let snapshot = {
                    let mut table = self.nonpaged.write();
                    let start = self.nonpaged_index(start_chunk);
                    let end = start + count as usize;
                    if end > table.len() {
                        return Err(Error::InvalidRequest(format!(
                            "chunk range [{start_chunk}, +{count}) beyond the non-paged table"
                        )));
                    }
                    for entry in &mut table[start..end] {
                        entry.apply(delta, clear_mode);
                    }
                    table.clone()
                };
                // The resident table is authoritative; persist it whole so a
                // crash never observes a torn record.
                crate::edge::write_record(&*self.persistence, NONPAGED_TABLE_OFFSET, &snapshot)
                    .await?;
                trace!(start_chunk, count, clear_mode, "non-paged chunk update persisted");
                Ok(())
            }
            Backing::Paged => {
                let offset = PAGED_TABLE_BASE + start_chunk * PAGED_RECORD_SIZE as u64;
                let raw = self
                    .persistence
                    .read(offset, count as usize * PAGED_RECORD_SIZE)
                    .await?;
                let mut updated = Vec::with_capacity(raw.len());
                for rec in raw.chunks_exact(PAGED_RECORD_SIZE) {
                    let mut entry = ChunkEntry::decode(rec);
                    entry.apply(delta, clear_mode);
                    updated.extend_from_slice(&entry.encode());
                }
                self.persistence.write(offset, &updated).await?;
                debug!(
                    start_chunk,
                    count,
                    clear_mode,
                    nr_bits = delta.needs_rebuild,
                    "paged chunk update persisted"
                );
                Ok(())
            }
        }
    }

    /// Load the non-paged table back from persistence, as at group bring-up.
    pub async fn reload_nonpaged(&self) -> Result<()> {
        let len = self.nonpaged.read().len();
        let table: Option<Vec<ChunkEntry>> =
            crate::edge::read_record(&*self.persistence, NONPAGED_TABLE_OFFSET).await?;
        let Some(table) = table else {
            return Ok(());
        };
        if table.len() != len {
            return Err(Error::MetadataFatal(format!(
                "nonpaged table length {} does not match geometry {}",
                table.len(),
                len
            )));
        }
        *self.nonpaged.write() = table;
        Ok(())
    }

    /// Cross-check paged entries against the authoritative non-paged view.
    ///
    /// The needs-rebuild bits recorded in the fine-grained paged view must
    /// never contain a position absent from the coarse authoritative mask;
    /// a wider paged view means the metadata is corrupt and the request
    /// fails rather than silently proceeding.
    pub fn validate_against_nonpaged(
        &self,
        start_chunk: u64,
        entries: &[ChunkEntry],
        authoritative: PositionBitmask,
    ) -> Result<()> {
        for (i, entry) in entries.iter().enumerate() {
            if entry.needs_rebuild & !authoritative != 0 {
                return Err(Error::MetadataInconsistent {
                    chunk_index: start_chunk + i as u64,
                    paged_bits: entry.needs_rebuild,
                    nonpaged_bits: authoritative,
                });
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemPersistence;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    fn store() -> ChunkStore {
        ChunkStore::new(
            Arc::new(RaidGeometry::default()),
            Arc::new(MemPersistence::default()),
        )
    }

    #[tokio::test]
    async fn test_paged_update_is_additive() {
        let store = store();
        store
            .update_range(0, 4, &ChunkEntry::rebuild_delta(0b100), false)
            .await
            .unwrap();
        store
            .update_range(0, 4, &ChunkEntry::rebuild_delta(0b001), false)
            .await
            .unwrap();
        let entries = store.read_range(0, 4).await.unwrap();
        assert!(entries.iter().all(|e| e.needs_rebuild == 0b101));
    }

    #[tokio::test]
    async fn test_clear_mode_narrows_bits() {
        let store = store();
        store
            .update_range(0, 2, &ChunkEntry::rebuild_delta(0b110), false)
            .await
            .unwrap();
        store
            .update_range(0, 2, &ChunkEntry::rebuild_delta(0b010), true)
            .await
            .unwrap();
        let entries = store.read_range(0, 2).await.unwrap();
        assert!(entries.iter().all(|e| e.needs_rebuild == 0b100));
    }

    #[tokio::test]
    async fn test_routing_to_nonpaged_for_metadata_region() {
        let store = store();
        let md_chunk = store.geometry.metadata_start_chunk();
        store
            .update_range(md_chunk, 1, &ChunkEntry::rebuild_delta(0b1), false)
            .await
            .unwrap();
        // The resident table saw the update without a paged round-trip.
        let table = store.nonpaged.read();
        assert_eq!(table[0].needs_rebuild, 0b1);
    }

    #[tokio::test]
    async fn test_range_crossing_region_boundary_rejected() {
        let store = store();
        let md_chunk = store.geometry.metadata_start_chunk();
        let err = store.read_range(md_chunk - 1, 2).await.unwrap_err();
        assert_matches!(err, Error::InvalidRequest(_));
    }

    #[tokio::test]
    async fn test_batch_cap_enforced() {
        let store = store();
        let err = store.read_range(0, MAX_CHUNKS_PER_CALL + 1).await.unwrap_err();
        assert_matches!(err, Error::ChunkBatchTooLarge { .. });
    }

    #[tokio::test]
    async fn test_striper_routes_everything_nonpaged() {
        let geometry = RaidGeometry {
            raid_type: crate::geometry::RaidType::Striper,
            ..RaidGeometry::default()
        };
        let store = ChunkStore::new(
            Arc::new(geometry),
            Arc::new(MemPersistence::default()),
        );
        store
            .update_range(3, 2, &ChunkEntry::rebuild_delta(0b10), false)
            .await
            .unwrap();
        assert_eq!(store.nonpaged.read()[3].needs_rebuild, 0b10);
    }

    #[tokio::test]
    async fn test_nonpaged_survives_reload() {
        let persistence = Arc::new(MemPersistence::default());
        let geometry = Arc::new(RaidGeometry::default());
        let store = ChunkStore::new(Arc::clone(&geometry), persistence.clone());
        let md_chunk = geometry.metadata_start_chunk();
        store
            .update_range(md_chunk, 2, &ChunkEntry::rebuild_delta(0b11), false)
            .await
            .unwrap();

        let reloaded = ChunkStore::new(geometry, persistence);
        reloaded.reload_nonpaged().await.unwrap();
        assert_eq!(reloaded.nonpaged.read()[0].needs_rebuild, 0b11);
        assert_eq!(reloaded.nonpaged.read()[1].needs_rebuild, 0b11);
    }

    #[test]
    fn test_validation_rejects_wider_paged_view() {
        let store = store();
        let entries = vec![ChunkEntry::rebuild_delta(0b101)];
        // Authoritative view knows only position 0.
        let err = store
            .validate_against_nonpaged(7, &entries, 0b001)
            .unwrap_err();
        assert_matches!(
            err,
            Error::MetadataInconsistent {
                chunk_index: 7,
                paged_bits: 0b101,
                nonpaged_bits: 0b001,
            }
        );
        // Subset passes.
        store
            .validate_against_nonpaged(7, &entries, 0b111)
            .unwrap();
    }

    #[test]
    fn test_record_roundtrip() {
        let entry = ChunkEntry {
            needs_rebuild: 0b1010,
            verify: VerifyFlags(0x6),
            rekey: true,
        };
        assert_eq!(ChunkEntry::decode(&entry.encode()), entry);
    }

    proptest! {
        /// Non-clear updates are monotone: `new = old | delta`, so
        /// `old & !new == 0` always holds.
        #[test]
        fn prop_additive_update_never_loses_bits(old: u16, delta: u16) {
            let mut entry = ChunkEntry::rebuild_delta(old);
            entry.apply(&ChunkEntry::rebuild_delta(delta), false);
            prop_assert_eq!(entry.needs_rebuild, old | delta);
            prop_assert_eq!(old & !entry.needs_rebuild, 0);
        }

        /// Clear mode removes exactly the named bits and nothing else.
        #[test]
        fn prop_clear_removes_only_named_bits(old: u16, delta: u16) {
            let mut entry = ChunkEntry::rebuild_delta(old);
            entry.apply(&ChunkEntry::rebuild_delta(delta), true);
            prop_assert_eq!(entry.needs_rebuild, old & !delta);
        }
    }
}
