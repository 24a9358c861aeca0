//! End-to-end scenarios through the full I/O path

use std::sync::Arc;

use raidcore::block::{BlockQualifier, BlockRequest, BlockStatus, Opcode};
use raidcore::chunk::ChunkEntry;
use raidcore::geometry::RaidGeometry;
use raidcore::group::{GroupConfig, RaidGroup};
use raidcore::testutil::{MemPersistence, MockAlgorithm};

fn geometry() -> RaidGeometry {
    RaidGeometry::default()
}

fn build_group(
    algorithm: Arc<MockAlgorithm>,
    persistence: Arc<MemPersistence>,
    fast_path: bool,
) -> Arc<RaidGroup> {
    raidcore::init_tracing();
    RaidGroup::new(
        geometry(),
        GroupConfig {
            fast_path_enabled: fast_path,
            ..GroupConfig::default()
        },
        algorithm,
        persistence,
    )
}

/// Raid-relative blocks covering `chunks` whole chunks.
fn chunk_span_blocks(chunks: u64) -> u64 {
    let g = geometry();
    chunks * g.chunk_size * g.data_disks as u64
}

// =============================================================================
// Degraded write marks needs-rebuild
// =============================================================================

/// Group with one degraded position, rebuild-logging bitmask = {position 2}.
/// A 4-chunk write must set needs_rebuild |= 0b100 on chunks 0..3 before
/// dispatch, the write must not clear them, and the final status is
/// Success.
#[tokio::test]
async fn degraded_write_marks_needs_rebuild_before_dispatch() {
    let algorithm = MockAlgorithm::new();
    let persistence = Arc::new(MemPersistence::default());
    let group = build_group(Arc::clone(&algorithm), persistence, false);
    group.set_rebuild_logging(2);

    let completion = group
        .submit(BlockRequest::new(Opcode::Write, 0, chunk_span_blocks(4)))
        .await;
    assert_eq!(completion.status, BlockStatus::Success);

    // The dispatch saw the marks: chunk info was re-fetched after marking.
    let dispatched = algorithm.dispatched();
    assert!(!dispatched.is_empty());
    for sub in &dispatched {
        assert!(sub
            .chunk_info
            .iter()
            .all(|entry| entry.needs_rebuild & 0b100 != 0));
        assert_eq!(sub.rebuild_logging, 0b100);
    }

    // The write did not clear the rebuild bits.
    let entries = group.chunks().read_range(0, 4).await.unwrap();
    for entry in &entries {
        assert_eq!(entry.needs_rebuild & 0b100, 0b100);
    }
}

// =============================================================================
// Zero clears needs-rebuild on aligned degraded chunks
// =============================================================================

/// Zero spanning exactly 2 full chunks while degraded (mask = {position 1},
/// rebuild-logging empty): chunk-info lookup clears needs_rebuild for both
/// chunks, final status Success.
#[tokio::test]
async fn aligned_zero_clears_needs_rebuild() {
    let algorithm = MockAlgorithm::new();
    let persistence = Arc::new(MemPersistence::default());
    let group = build_group(Arc::clone(&algorithm), persistence, false);

    // Position 1 is rebuilding (degraded), not rebuild-logging.
    group.set_rebuild_checkpoint(1, 0x100);
    group
        .chunks()
        .update_range(0, 2, &ChunkEntry::rebuild_delta(0b010), false)
        .await
        .unwrap();

    let completion = group
        .submit(BlockRequest::new(Opcode::Zero, 0, chunk_span_blocks(2)))
        .await;
    assert_eq!(completion.status, BlockStatus::Success);

    let entries = group.chunks().read_range(0, 2).await.unwrap();
    for entry in &entries {
        assert_eq!(entry.needs_rebuild, 0);
    }
}

// =============================================================================
// Fast-path equivalence
// =============================================================================

/// For a non-degraded, aligned request, status/qualifier and persisted
/// metadata state are identical whether dispatched via the fast path or
/// the full state machine.
#[tokio::test]
async fn fast_path_equivalent_to_full_path() {
    let g = geometry();
    let stripe = g.element_size * g.data_disks as u64;

    let mut outcomes = Vec::new();
    for fast_path in [true, false] {
        let algorithm = MockAlgorithm::new();
        let persistence = Arc::new(MemPersistence::default());
        let group = build_group(algorithm, Arc::clone(&persistence), fast_path);

        let write = group
            .submit(BlockRequest::new(Opcode::Write, 0, stripe))
            .await;
        let read = group
            .submit(BlockRequest::new(Opcode::Read, 0, stripe))
            .await;
        outcomes.push((
            write.status,
            write.qualifier,
            read.status,
            read.qualifier,
            persistence.write_count(),
        ));
    }
    assert_eq!(outcomes[0], outcomes[1]);
    assert_eq!(outcomes[0].0, BlockStatus::Success);
    assert_eq!(outcomes[0].2, BlockStatus::Success);
}

// =============================================================================
// Piece iteration
// =============================================================================

/// A request wider than one IOTS dispatch is processed in pieces and still
/// completes with a single Success.
#[tokio::test]
async fn wide_request_processed_in_pieces() {
    let algorithm = MockAlgorithm::new();
    let persistence = Arc::new(MemPersistence::default());
    let group = build_group(Arc::clone(&algorithm), persistence, false);

    let completion = group
        .submit(BlockRequest::new(Opcode::Write, 0, chunk_span_blocks(20)))
        .await;
    assert_eq!(completion.status, BlockStatus::Success);
    assert_eq!(algorithm.dispatch_count(), 2);

    let dispatched = algorithm.dispatched();
    let total: u64 = dispatched.iter().map(|sub| sub.blocks).sum();
    assert_eq!(total, chunk_span_blocks(20));
    // Pieces are contiguous and ordered.
    assert_eq!(dispatched[1].lba, dispatched[0].lba + dispatched[0].blocks);
}

// =============================================================================
// Quiesce / restart
// =============================================================================

/// A host write parked behind a quiesce resumes on restart and completes;
/// the caller never observes the park.
#[tokio::test]
async fn quiesced_write_resumes_on_restart() {
    let algorithm = MockAlgorithm::new();
    let persistence = Arc::new(MemPersistence::default());
    let group = build_group(Arc::clone(&algorithm), persistence, false);

    group.quiesce();

    let submit_group = Arc::clone(&group);
    let handle = tokio::spawn(async move {
        submit_group
            .submit(BlockRequest::new(Opcode::Write, 0, 16))
            .await
    });

    // Wait for the request to park.
    for _ in 0..100 {
        if group.quiesced_requests() == 1 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }
    assert_eq!(group.quiesced_requests(), 1);
    assert_eq!(algorithm.dispatch_count(), 0);

    group.restart_quiesced();
    let completion = handle.await.unwrap();
    assert_eq!(completion.status, BlockStatus::Success);
    assert_eq!(group.quiesced_requests(), 0);
}

/// A monitor-originated request is never parked: it fails fast on lock
/// contention so the monitor can reschedule it.
#[tokio::test]
async fn monitor_request_fails_fast_under_quiesce() {
    let algorithm = MockAlgorithm::new();
    let persistence = Arc::new(MemPersistence::default());
    let group = build_group(algorithm, persistence, false);

    group.quiesce();
    let completion = group
        .submit(BlockRequest::new(Opcode::Write, 0, 16).monitor())
        .await;
    assert_eq!(completion.status, BlockStatus::IoFailed);
    assert_eq!(completion.qualifier, BlockQualifier::LockFailed);
    assert_eq!(group.quiesced_requests(), 0);
}

// =============================================================================
// Retry policy
// =============================================================================

/// A retryable algorithm failure re-enters locking and redrives; the
/// second attempt succeeds.
#[tokio::test]
async fn retryable_dispatch_failure_is_redriven() {
    let algorithm = MockAlgorithm::new();
    let persistence = Arc::new(MemPersistence::default());
    let group = build_group(Arc::clone(&algorithm), persistence, false);

    algorithm.script_failure(BlockStatus::IoFailed, BlockQualifier::RetryPossible);
    let completion = group
        .submit(BlockRequest::new(Opcode::Write, 0, 16))
        .await;
    assert_eq!(completion.status, BlockStatus::Success);
    assert_eq!(algorithm.dispatch_count(), 2);
}

/// Retries are bounded; exhausting them surfaces the failure as
/// non-retryable.
#[tokio::test]
async fn exhausted_retries_fail_terminal() {
    let algorithm = MockAlgorithm::new();
    let persistence = Arc::new(MemPersistence::default());
    let group = build_group(Arc::clone(&algorithm), persistence, false);

    for _ in 0..10 {
        algorithm.script_failure(BlockStatus::IoFailed, BlockQualifier::RetryPossible);
    }
    let completion = group
        .submit(BlockRequest::new(Opcode::Write, 0, 16))
        .await;
    assert_eq!(completion.status, BlockStatus::IoFailed);
    assert_eq!(completion.qualifier, BlockQualifier::RetryNotPossible);
}

// =============================================================================
// Verify escalation
// =============================================================================

/// A write whose completion reports an incomplete write marks the covered
/// chunks needs-verify; the caller still sees the write's own status.
#[tokio::test]
async fn incomplete_write_marks_needs_verify() {
    use raidcore::block::VerifyReason;
    use raidcore::edge::AlgorithmCompletion;

    let algorithm = MockAlgorithm::new();
    let persistence = Arc::new(MemPersistence::default());
    let group = build_group(Arc::clone(&algorithm), persistence, false);

    algorithm.script(AlgorithmCompletion {
        incomplete_write: true,
        ..AlgorithmCompletion::success()
    });
    let completion = group
        .submit(BlockRequest::new(Opcode::Write, 0, chunk_span_blocks(1)))
        .await;
    assert_eq!(completion.status, BlockStatus::Success);

    let entries = group.chunks().read_range(0, 1).await.unwrap();
    assert!(entries[0].verify.contains(VerifyReason::IncompleteWrite));
}

/// Splitting rule: a write spanning a degraded/non-degraded boundary is
/// dispatched as separate uniform sub-ranges.
#[tokio::test]
async fn dispatch_never_crosses_degraded_boundary() {
    let algorithm = MockAlgorithm::new();
    let persistence = Arc::new(MemPersistence::default());
    let group = build_group(Arc::clone(&algorithm), persistence, false);

    // Chunks 0..2 degraded, chunks 2..4 clean.
    group.set_rebuild_checkpoint(1, 0x100);
    group
        .chunks()
        .update_range(0, 2, &ChunkEntry::rebuild_delta(0b010), false)
        .await
        .unwrap();

    let completion = group
        .submit(BlockRequest::new(Opcode::Write, 0, chunk_span_blocks(4)))
        .await;
    assert_eq!(completion.status, BlockStatus::Success);

    let dispatched = algorithm.dispatched();
    assert_eq!(dispatched.len(), 2);
    assert!(dispatched[0]
        .chunk_info
        .iter()
        .all(|entry| entry.is_degraded()));
    assert!(dispatched[1]
        .chunk_info
        .iter()
        .all(|entry| !entry.is_degraded()));
    assert_eq!(dispatched[0].blocks, chunk_span_blocks(2));
    assert_eq!(dispatched[1].blocks, chunk_span_blocks(2));
}
