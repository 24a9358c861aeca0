//! Fast-path direct I/O
//!
//! Bypasses the full state machine for simple requests where the machine
//! would add only latency: non-degraded, non-rekeying, checksum-default
//! reads and exact-stripe-aligned writes below a size threshold, never in
//! the metadata-of-metadata region.
//!
//! Skipping chunk-info lookup is sound only because non-degraded is a
//! precondition; the lock is still taken, so ordering against overlapping
//! requests is identical to the full path. Any validation failure releases
//! the lock and falls back to the full machine from the top — the fast
//! path never surfaces a failure to the caller by itself.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::block::{BlockQualifier, BlockRequest, BlockStatus, IoCompletion, Opcode};
use crate::chunk::ChunkEntry;
use crate::edge::SubRequest;
use crate::group::RaidGroup;
use crate::iots::MAX_CHUNKS_PER_IOTS;
use crate::lock::{LockMode, LockOutcome};

/// Outcome of a fast-path attempt.
pub(crate) enum DirectOutcome {
    /// The request completed on the fast path
    Completed(IoCompletion),
    /// Run the full state machine from the top
    Fallback,
}

/// Whether the request qualifies for the direct path at all.
fn is_eligible(group: &RaidGroup, request: &BlockRequest) -> bool {
    let geometry = group.geometry();
    if group.is_degraded() || group.rekeying() || geometry.lock_taken_elsewhere() {
        return false;
    }
    if request.blocks > group.config().fast_path_max_blocks {
        return false;
    }
    let range = request.raid_range(geometry.data_disks);
    if geometry.is_metadata_io(range.start) || geometry.is_metadata_io(range.end - 1) {
        return false;
    }
    match request.opcode {
        Opcode::Read => true,
        Opcode::Write => geometry.is_stripe_aligned(&range),
        _ => false,
    }
}

/// Attempt the request on the direct path.
pub(crate) async fn try_direct(
    group: &Arc<RaidGroup>,
    request: &BlockRequest,
    deadline: Instant,
) -> DirectOutcome {
    if !is_eligible(group, request) {
        return DirectOutcome::Fallback;
    }
    if Instant::now() >= deadline {
        return DirectOutcome::Fallback;
    }

    let geometry = group.geometry();
    let range = geometry.lock_range(request.opcode, request.lba, request.blocks);
    let mode = if request.opcode.is_read_lock() {
        LockMode::Read
    } else {
        LockMode::Write
    };

    let guard = match group
        .locks()
        .acquire(range, mode, request.opcode.may_wait(), &request.cancel)
        .await
    {
        LockOutcome::Granted(guard) => guard,
        LockOutcome::Cancelled => {
            return DirectOutcome::Completed(IoCompletion::failed(
                request.id,
                BlockStatus::RequestAborted,
                BlockQualifier::ClientAborted,
            ));
        }
        LockOutcome::IllegalRange => {
            return DirectOutcome::Completed(IoCompletion::failed(
                request.id,
                BlockStatus::InvalidRequest,
                BlockQualifier::UnexpectedError,
            ));
        }
        // Contention, quiesce, or shutdown: the full path knows how to
        // park or fail these properly.
        LockOutcome::Dropped | LockOutcome::Aborted => return DirectOutcome::Fallback,
    };

    let span = geometry
        .chunk_range_for_raid_lba(request.lba, request.blocks)
        .1
        .min(MAX_CHUNKS_PER_IOTS);
    let sub = SubRequest {
        opcode: request.opcode,
        lba: request.lba,
        blocks: request.blocks,
        chunk_info: vec![ChunkEntry::default(); span as usize],
        rebuild_logging: 0,
        buffer: request.buffer.clone(),
    };
    trace!(id = %request.id, lba = request.lba, blocks = request.blocks, "direct dispatch");
    let completion = group.algorithm().execute(sub).await;

    // Validate status, qualifier, and for reads the checksum and the
    // positional lba stamp. Anything unexpected retries through the full
    // path rather than surfacing here.
    let valid = completion.is_success()
        && match request.opcode {
            Opcode::Read => completion
                .stamps
                .map(|stamps| stamps.checksum_valid && stamps.lba_stamp == request.lba)
                .unwrap_or(false),
            _ => true,
        };

    if !valid {
        debug!(
            id = %request.id,
            status = ?completion.status,
            "direct path validation failed, falling back to full path"
        );
        guard.release();
        return DirectOutcome::Fallback;
    }

    guard.release();
    let mut done = IoCompletion::success(request.id);
    done.data = completion.data;
    DirectOutcome::Completed(done)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::{AlgorithmCompletion, ReadStamps};
    use crate::geometry::RaidGeometry;
    use crate::group::GroupConfig;
    use crate::testutil::{MemPersistence, MockAlgorithm};

    fn group_with(algorithm: Arc<MockAlgorithm>) -> Arc<RaidGroup> {
        RaidGroup::new(
            RaidGeometry::default(),
            GroupConfig::default(),
            algorithm,
            Arc::new(MemPersistence::default()),
        )
    }

    fn stripe_blocks() -> u64 {
        let g = RaidGeometry::default();
        g.element_size * g.data_disks as u64
    }

    #[tokio::test]
    async fn test_read_takes_fast_path() {
        let algorithm = MockAlgorithm::new();
        let group = group_with(Arc::clone(&algorithm));
        let completion = group
            .submit(BlockRequest::new(Opcode::Read, 128, 8))
            .await;
        assert_eq!(completion.status, BlockStatus::Success);
        // One dispatch, no chunk lookups: the mock saw a default chunk map.
        assert_eq!(algorithm.dispatch_count(), 1);
        assert!(algorithm.dispatched()[0]
            .chunk_info
            .iter()
            .all(|e| !e.is_degraded()));
    }

    #[tokio::test]
    async fn test_unaligned_write_not_eligible() {
        let algorithm = MockAlgorithm::new();
        let group = group_with(Arc::clone(&algorithm));
        let completion = group
            .submit(BlockRequest::new(Opcode::Write, 1, 8))
            .await;
        // Still succeeds, via the full path.
        assert_eq!(completion.status, BlockStatus::Success);
    }

    #[tokio::test]
    async fn test_degraded_group_not_eligible() {
        let algorithm = MockAlgorithm::new();
        let group = group_with(Arc::clone(&algorithm));
        group.set_rebuild_logging(1);
        let request = BlockRequest::new(Opcode::Read, 0, 8);
        assert!(!is_eligible(&group, &request));
    }

    #[tokio::test]
    async fn test_stamp_mismatch_falls_back_and_succeeds() {
        let algorithm = MockAlgorithm::new();
        let group = group_with(Arc::clone(&algorithm));
        // First dispatch (fast path) returns a wrong lba stamp; the
        // fallback full-path dispatch uses the default good completion.
        algorithm.script(AlgorithmCompletion {
            stamps: Some(ReadStamps {
                checksum_valid: true,
                lba_stamp: 0xdead,
            }),
            ..AlgorithmCompletion::success()
        });
        let completion = group
            .submit(BlockRequest::new(Opcode::Read, 64, 4))
            .await;
        assert_eq!(completion.status, BlockStatus::Success);
        assert_eq!(algorithm.dispatch_count(), 2);
    }

    #[tokio::test]
    async fn test_aligned_write_takes_fast_path() {
        let algorithm = MockAlgorithm::new();
        let group = group_with(Arc::clone(&algorithm));
        let completion = group
            .submit(BlockRequest::new(Opcode::Write, 0, stripe_blocks()))
            .await;
        assert_eq!(completion.status, BlockStatus::Success);
        assert_eq!(algorithm.dispatch_count(), 1);
    }
}
