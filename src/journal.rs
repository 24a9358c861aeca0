//! Journal remap/init recovery operation
//!
//! A bounded background pass over the write-journal region: walks journal
//! capacity in chunk-size steps from a persisted checkpoint (or, for
//! initialization, from a supplied start LBA), zero-filling every
//! non-degraded disk position with fan-out sub-requests built over one
//! shared zero buffer.
//!
//! Not request-driven: the scheduler triggers a pass and guarantees only
//! one runs at a time. The journal-reserved LBAs are rejected at request
//! admission, so the pass bypasses chunk bitmap checks entirely — there is
//! no chunk metadata for this space.
//!
//! Crash discipline: the checkpoint advances only after every sub-request
//! of a chunk fans back in successfully; a failed pass leaves it at the
//! last completed chunk, re-startable without re-processing. Reaching
//! capacity persists the invalid sentinel.

use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::block::{PositionBitmask, LBA_INVALID};
use crate::chunk::JOURNAL_CHECKPOINT_OFFSET;
use crate::edge::{plant_zero_sg, read_record, write_record, DiskEdge, DiskPacket, MetadataPersistence};
use crate::error::{Error, Result};
use crate::geometry::RaidGeometry;

/// Persisted recovery progress marker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct CheckpointRecord {
    lba: u64,
}

/// Summary of one completed pass.
#[derive(Debug, Clone, Copy)]
pub struct JournalPassReport {
    /// First per-disk LBA the pass processed
    pub start_lba: u64,
    /// Chunks zero-filled before reaching capacity
    pub chunks_processed: u64,
}

/// The journal remap/init recovery operation for one group.
pub struct JournalRecovery {
    geometry: Arc<RaidGeometry>,
    /// One edge per disk position
    edges: Vec<Arc<dyn DiskEdge>>,
    persistence: Arc<dyn MetadataPersistence>,
}

impl JournalRecovery {
    pub fn new(
        geometry: Arc<RaidGeometry>,
        edges: Vec<Arc<dyn DiskEdge>>,
        persistence: Arc<dyn MetadataPersistence>,
    ) -> Self {
        debug_assert_eq!(edges.len(), geometry.width as usize);
        Self {
            geometry,
            edges,
            persistence,
        }
    }

    /// The persisted checkpoint, or the invalid sentinel when no pass is
    /// pending.
    pub async fn checkpoint(&self) -> Result<u64> {
        let record: Option<CheckpointRecord> =
            read_record(&*self.persistence, JOURNAL_CHECKPOINT_OFFSET).await?;
        Ok(record.map(|r| r.lba).unwrap_or(LBA_INVALID))
    }

    async fn persist_checkpoint(&self, lba: u64) -> Result<()> {
        write_record(
            &*self.persistence,
            JOURNAL_CHECKPOINT_OFFSET,
            &CheckpointRecord { lba },
        )
        .await
    }

    /// Arm a remap pass at the chunk containing `disk_lba`.
    ///
    /// An unaligned address is adjusted down to its chunk boundary. An
    /// already-armed earlier checkpoint is kept; the pass covers both.
    pub async fn mark_for_remap(&self, disk_lba: u64) -> Result<()> {
        let chunk_size = self.geometry.chunk_size;
        let mut aligned = (disk_lba / chunk_size) * chunk_size;
        if aligned != disk_lba {
            debug!(disk_lba, aligned, "remap checkpoint not chunk aligned, adjusting");
        }
        aligned = aligned.max(self.geometry.journal_start);
        let current = self.checkpoint().await?;
        if current != LBA_INVALID && current <= aligned {
            return Ok(());
        }
        info!(checkpoint = aligned, "marking journal for remap");
        self.persist_checkpoint(aligned).await
    }

    /// Run a remap pass from the persisted checkpoint. A sentinel
    /// checkpoint means no remap is pending and the pass is a no-op.
    #[instrument(skip(self))]
    pub async fn run_remap(&self, rebuild_logging: PositionBitmask) -> Result<JournalPassReport> {
        let checkpoint = self.checkpoint().await?;
        if checkpoint == LBA_INVALID {
            return Ok(JournalPassReport {
                start_lba: LBA_INVALID,
                chunks_processed: 0,
            });
        }
        self.walk(checkpoint, rebuild_logging).await
    }

    /// Zero-initialize the journal from `start_lba` (group creation, or a
    /// re-init after the layout is re-committed).
    #[instrument(skip(self))]
    pub async fn run_init(
        &self,
        start_lba: u64,
        rebuild_logging: PositionBitmask,
    ) -> Result<JournalPassReport> {
        let start = start_lba.max(self.geometry.journal_start);
        self.persist_checkpoint(start).await?;
        self.walk(start, rebuild_logging).await
    }

    async fn walk(
        &self,
        start: u64,
        rebuild_logging: PositionBitmask,
    ) -> Result<JournalPassReport> {
        let chunk_size = self.geometry.chunk_size;
        let journal_end = self.geometry.journal_start + self.geometry.journal_capacity;
        // The checkpoint is chunk-aligned by construction; a foreign value
        // read back from media is adjusted down rather than trusted.
        let start = (start / chunk_size) * chunk_size;
        let mut chunks_processed = 0;

        let mut chunk_lba = start;
        while chunk_lba < journal_end {
            self.fan_out_chunk(chunk_lba, rebuild_logging)
                .await
                .map_err(|err| {
                    warn!(chunk_lba, %err, "journal pass aborted, checkpoint not advanced");
                    Error::JournalPassAborted {
                        checkpoint: chunk_lba,
                        reason: err.to_string(),
                    }
                })?;
            chunk_lba += chunk_size;
            chunks_processed += 1;
            // Fan-in succeeded for the whole chunk: progress is durable.
            self.persist_checkpoint(chunk_lba.min(journal_end)).await?;
        }

        self.persist_checkpoint(LBA_INVALID).await?;
        info!(start, chunks_processed, "journal pass complete");
        Ok(JournalPassReport {
            start_lba: start,
            chunks_processed,
        })
    }

    /// Build one zero sub-request per non-degraded position and fan them
    /// out; each sub-request's resources are released as it completes.
    async fn fan_out_chunk(&self, chunk_lba: u64, rebuild_logging: PositionBitmask) -> Result<()> {
        let chunk_size = self.geometry.chunk_size;
        let blocks = chunk_size.min(
            self.geometry.journal_start + self.geometry.journal_capacity - chunk_lba,
        );
        let sends = self
            .edges
            .iter()
            .enumerate()
            .filter(|(position, _)| rebuild_logging & (1 << position) == 0)
            .map(|(position, edge)| {
                let packet = DiskPacket {
                    position: position as u32,
                    lba: chunk_lba,
                    blocks,
                    sg: plant_zero_sg(blocks),
                };
                edge.send_write(packet)
            });
        let results = join_all(sends).await;
        for result in results {
            result?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
