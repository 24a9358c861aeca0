//! IOTS — the per-request state machine
//!
//! One `Iots` exists per admitted block request. It owns the current phase
//! of the request, the computed degraded-chunk info, and the final
//! status/qualifier, and is exclusively owned by the task driving it;
//! ownership is handed off only at the asynchronous suspension points
//! (lock grant, metadata I/O completion, algorithm dispatch).
//!
//! The drive loop walks an explicit state enum:
//!
//! ```text
//! NEW → LOCKING → (CHUNK_INFO_LOOKUP)? → (MARK_NEEDS_REBUILD)? →
//!   DISPATCHED → (NEXT_OPERATION)? → (MARK_NEEDS_VERIFY)? → CLEANUP → DONE
//! ```
//!
//! with a QUIESCED sub-state reachable from LOCKING and CHUNK_INFO_LOOKUP
//! on retryable failure; a restarted request re-enters the state it left.

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use crate::block::{
    BlockQualifier, BlockRequest, BlockStatus, IoCompletion, Opcode, PositionBitmask,
    VerifyFlags, VerifyReason,
};
use crate::chunk::{ChunkEntry, MAX_CHUNKS_PER_CALL};
use crate::edge::{AlgorithmCompletion, SubRequest, BYTES_PER_BLOCK};
use crate::error::Error;
use crate::group::RaidGroup;
use crate::lock::{LockMode, LockOutcome, StripeLockGuard};

/// Maximum chunks one IOTS dispatch may span; requests covering more are
/// processed in pieces.
pub const MAX_CHUNKS_PER_IOTS: u64 = MAX_CHUNKS_PER_CALL;

// =============================================================================
// Control Block
// =============================================================================

/// Sticky per-request flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct IotsFlags {
    /// Request was parked at least once behind a quiesce
    pub was_quiesced: bool,
    /// chunk_info matches the current sub-range
    pub chunk_info_valid: bool,
    /// A completed dispatch left a write incomplete
    pub incomplete_write: bool,
    /// A completed dispatch needed a journal remap
    pub remap_needed: bool,
    /// Write-log header read finished; the flush pass is live
    pub write_log_flush_required: bool,
}

/// The in-flight control block for one logical request.
#[derive(Debug)]
pub struct Iots {
    pub id: Uuid,
    /// Opcode of the original request
    pub opcode: Opcode,
    /// Opcode currently being executed (prerequisite ops differ)
    pub current_opcode: Opcode,
    pub packet_lba: u64,
    pub packet_blocks: u64,
    /// Current piece
    pub current_lba: u64,
    pub current_blocks: u64,
    pub chunk_info: Vec<ChunkEntry>,
    /// Rebuild-logging bitmask snapshotted at lock grant
    pub rebuild_logging: PositionBitmask,
    pub status: BlockStatus,
    pub qualifier: BlockQualifier,
    pub flags: IotsFlags,
    pub(crate) lock: Option<StripeLockGuard>,
    /// Non-paged distributed lock held for background-verify paged reads;
    /// must be released before the stripe lock during cleanup
    pub(crate) np_lock: Option<tokio::sync::OwnedMutexGuard<()>>,
    pub buffer: Bytes,
    pub cancel: tokio_util::sync::CancellationToken,
    pub deadline: Instant,
    /// Monitor-originated: denied the wait-and-retry path
    pub monitor: bool,
    pub do_not_cancel: bool,
    /// The last dispatch reported that no further work is needed
    last_no_further_work: bool,
    retries: u32,
}

impl Iots {
    pub(crate) fn from_request(request: &BlockRequest, deadline: Instant) -> Self {
        Self {
            id: request.id,
            opcode: request.opcode,
            current_opcode: request.opcode,
            packet_lba: request.lba,
            packet_blocks: request.blocks,
            current_lba: request.lba,
            current_blocks: 0,
            chunk_info: Vec::new(),
            rebuild_logging: 0,
            status: BlockStatus::Invalid,
            qualifier: BlockQualifier::None,
            flags: IotsFlags::default(),
            lock: None,
            np_lock: None,
            buffer: request.buffer.clone(),
            cancel: request.cancel.clone(),
            deadline,
            monitor: request.flags.do_not_quiesce,
            do_not_cancel: request.flags.do_not_cancel,
            last_no_further_work: false,
            retries: 0,
        }
    }

    /// Set the final status, never overwriting an earlier terminal failure
    /// with a later, unrelated completion.
    pub fn set_status(&mut self, status: BlockStatus, qualifier: BlockQualifier) {
        if self.status.is_terminal_failure() {
            return;
        }
        self.status = status;
        self.qualifier = qualifier;
    }

    /// End of the whole request, exclusive.
    fn packet_end(&self) -> u64 {
        self.packet_lba + self.packet_blocks
    }

    /// Whether the current piece is the last one.
    fn is_request_complete(&self) -> bool {
        self.current_lba + self.current_blocks >= self.packet_end()
    }

    /// Whether cancellation is observable for this request.
    fn is_cancelled(&self) -> bool {
        !self.do_not_cancel && self.cancel.is_cancelled()
    }

    /// Slice of the write payload covering the current piece.
    fn piece_buffer(&self) -> Bytes {
        if self.buffer.is_empty() {
            return Bytes::new();
        }
        let start = (self.current_lba - self.packet_lba) as usize * BYTES_PER_BLOCK;
        let end = start + self.current_blocks as usize * BYTES_PER_BLOCK;
        if end > self.buffer.len() {
            return Bytes::new();
        }
        self.buffer.slice(start..end)
    }

    fn completion(&self) -> IoCompletion {
        IoCompletion {
            request_id: self.id,
            status: self.status,
            qualifier: self.qualifier,
            data: None,
        }
    }
}

// =============================================================================
// States
// =============================================================================

/// Phase of the request's lifecycle; drives the loop in [`drive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IotsState {
    New,
    Locking,
    ChunkInfoLookup,
    MarkNeedsRebuild,
    Dispatch,
    NextOperation,
    MarkNeedsVerify,
    Cleanup,
}

/// Where a quiesced request resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResumePoint {
    Locking,
    ChunkInfoLookup,
    MarkNeedsRebuild,
    MarkNeedsVerify,
}

impl ResumePoint {
    fn state(self) -> IotsState {
        match self {
            ResumePoint::Locking => IotsState::Locking,
            ResumePoint::ChunkInfoLookup => IotsState::ChunkInfoLookup,
            ResumePoint::MarkNeedsRebuild => IotsState::MarkNeedsRebuild,
            ResumePoint::MarkNeedsVerify => IotsState::MarkNeedsVerify,
        }
    }
}

// =============================================================================
// Drive Loop
// =============================================================================

/// Run one request through the full state machine to completion.
#[instrument(skip(group, iots), fields(id = %iots.id, opcode = %iots.opcode, lba = iots.packet_lba, blocks = iots.packet_blocks))]
pub(crate) async fn drive(group: &RaidGroup, mut iots: Iots) -> IoCompletion {
    let mut state = IotsState::New;
    loop {
        group.note_phase(iots.id, state);
        state = match state {
            IotsState::New => new_to_locking(group, &mut iots),
            IotsState::Locking => locking(group, &mut iots).await,
            IotsState::ChunkInfoLookup => chunk_info_lookup(group, &mut iots).await,
            IotsState::MarkNeedsRebuild => mark_needs_rebuild(group, &mut iots).await,
            IotsState::Dispatch => dispatch(group, &mut iots).await,
            IotsState::NextOperation => next_operation(group, &mut iots).await,
            IotsState::MarkNeedsVerify => mark_needs_verify(group, &mut iots).await,
            IotsState::Cleanup => {
                return cleanup(group, iots).await;
            }
        };
    }
}

/// Certain opcodes never take a stripe lock: an ancestor or descendant in a
/// mirror-under-striper composition already serializes, and flush header
/// reads / mark-for-rebuild are serialized by their caller.
fn lock_required(group: &RaidGroup, iots: &Iots) -> bool {
    if group.geometry().lock_taken_elsewhere() {
        return false;
    }
    !matches!(
        iots.opcode,
        Opcode::WriteLogHeaderRead | Opcode::MarkForRebuild
    )
}

fn new_to_locking(group: &RaidGroup, iots: &mut Iots) -> IotsState {
    if iots.is_cancelled() {
        iots.set_status(BlockStatus::RequestAborted, BlockQualifier::ClientAborted);
        return IotsState::Cleanup;
    }
    if lock_required(group, iots) {
        IotsState::Locking
    } else {
        iots.rebuild_logging = group.rebuild_logging();
        prepare_dispatch(group, iots)
    }
}

async fn locking(group: &RaidGroup, iots: &mut Iots) -> IotsState {
    let geometry = group.geometry();
    let range = geometry.lock_range(iots.opcode, iots.packet_lba, iots.packet_blocks);
    let mode = if iots.opcode.is_read_lock() {
        LockMode::Read
    } else {
        LockMode::Write
    };
    // Monitor and metadata class operations cannot wait for stripe locks
    // while quiescing or we deadlock the metadata subsystem against itself.
    let may_wait = iots.opcode.may_wait() && !iots.monitor;

    match group.locks().acquire(range, mode, may_wait, &iots.cancel).await {
        LockOutcome::Granted(guard) => {
            iots.lock = Some(guard);
            if iots.is_cancelled() {
                // Cancellation observed after the grant: the lock is still
                // released normally (by cleanup) and no metadata update is
                // attempted for the cancelled operation.
                iots.set_status(BlockStatus::RequestAborted, BlockQualifier::ClientAborted);
                return IotsState::Cleanup;
            }
            // Snapshot rebuild logging only while holding the lock; the
            // bitmask may have changed while we held nothing.
            iots.rebuild_logging = group.rebuild_logging();
            if needs_rebuild_marking(group, iots) {
                IotsState::MarkNeedsRebuild
            } else {
                prepare_dispatch(group, iots)
            }
        }
        LockOutcome::Dropped if may_wait => {
            quiesce(group, iots, ResumePoint::Locking).await
        }
        LockOutcome::Dropped => {
            trace!(id = %iots.id, "no-wait lock dropped, failing fast");
            iots.set_status(BlockStatus::IoFailed, BlockQualifier::LockFailed);
            IotsState::Cleanup
        }
        LockOutcome::Aborted => {
            iots.set_status(BlockStatus::IoFailed, BlockQualifier::RetryNotPossible);
            IotsState::Cleanup
        }
        LockOutcome::Cancelled => {
            iots.set_status(BlockStatus::RequestAborted, BlockQualifier::ClientAborted);
            IotsState::Cleanup
        }
        LockOutcome::IllegalRange => {
            iots.set_status(BlockStatus::InvalidRequest, BlockQualifier::UnexpectedError);
            IotsState::Cleanup
        }
    }
}

/// Whether MARK_NEEDS_REBUILD runs before dispatch: the group is rebuild
/// logging and the opcode modifies media (or is the live pass of a deferred
/// write-log flush). Requests inside the metadata-of-metadata region skip
/// the marking entirely; the non-paged table is authoritative there.
fn needs_rebuild_marking(group: &RaidGroup, iots: &Iots) -> bool {
    if iots.rebuild_logging == 0 {
        return false;
    }
    let data_modify = iots.opcode.is_media_modify()
        && !matches!(iots.opcode, Opcode::WriteLogFlush);
    let live_flush = matches!(iots.opcode, Opcode::WriteLogFlush)
        && iots.flags.write_log_flush_required;
    if !(data_modify || live_flush) {
        return false;
    }
    // Data-modify opcodes address raid-relative space directly.
    !group.geometry().is_metadata_io(iots.packet_lba)
}

async fn mark_needs_rebuild(group: &RaidGroup, iots: &mut Iots) -> IotsState {
    let geometry = group.geometry();
    let (start_chunk, count) = if iots.opcode.is_disk_based() {
        geometry.chunk_range(iots.packet_lba, iots.packet_blocks)
    } else {
        geometry.chunk_range_for_raid_lba(iots.packet_lba, iots.packet_blocks)
    };

    // The monitor's mark-for-rebuild control operation is a pure metadata
    // update: mark every rebuild position over the range and complete.
    if matches!(iots.opcode, Opcode::MarkForRebuild) {
        let bits = group.all_rebuild_positions();
        if bits == 0 {
            iots.set_status(BlockStatus::Success, BlockQualifier::None);
            return IotsState::Cleanup;
        }
        let delta = ChunkEntry::rebuild_delta(bits);
        return match update_chunks_split(group, start_chunk, count, &delta, false).await {
            Ok(()) => {
                iots.set_status(BlockStatus::Success, BlockQualifier::None);
                IotsState::Cleanup
            }
            Err(err) => metadata_error(group, iots, err, ResumePoint::MarkNeedsRebuild).await,
        };
    }

    debug!(
        id = %iots.id,
        start_chunk,
        count,
        rl_bits = iots.rebuild_logging,
        "marking needs-rebuild before dispatch"
    );

    let delta = ChunkEntry::rebuild_delta(iots.rebuild_logging);
    match update_chunks_split(group, start_chunk, count, &delta, false).await {
        Ok(()) => {}
        Err(err) => return metadata_error(group, iots, err, ResumePoint::MarkNeedsRebuild).await,
    }

    // The marking forces a fresh paged read for the dispatch.
    iots.flags.chunk_info_valid = false;

    // The bitmask may have grown while the metadata write was in flight
    // (a quiesce at the metadata service); re-mark with the new mask.
    let current = group.rebuild_logging();
    if current != iots.rebuild_logging {
        info!(
            id = %iots.id,
            old = iots.rebuild_logging,
            new = current,
            "rebuild-logging bitmask changed during marking, restarting"
        );
        iots.rebuild_logging = current;
        if current != 0 {
            return IotsState::MarkNeedsRebuild;
        }
    }
    prepare_dispatch(group, iots)
}

/// Split a chunk update into batches the metadata store accepts.
async fn update_chunks_split(
    group: &RaidGroup,
    start_chunk: u64,
    count: u64,
    delta: &ChunkEntry,
    clear_mode: bool,
) -> crate::error::Result<()> {
    let mut chunk = start_chunk;
    let mut remaining = count;
    while remaining > 0 {
        let batch = remaining.min(MAX_CHUNKS_PER_CALL);
        group.chunks().update_range(chunk, batch, delta, clear_mode).await?;
        chunk += batch;
        remaining -= batch;
    }
    Ok(())
}

/// Prepare the next dispatch: bound the piece to the IOTS chunk cap, pick
/// the first operation (prerequisites), and decide whether chunk info must
/// be read first.
fn prepare_dispatch(group: &RaidGroup, iots: &mut Iots) -> IotsState {
    if iots.is_cancelled() {
        iots.set_status(BlockStatus::RequestAborted, BlockQualifier::ClientAborted);
        return IotsState::Cleanup;
    }
    if Instant::now() >= iots.deadline {
        warn!(id = %iots.id, "request expired before dispatch");
        iots.set_status(BlockStatus::Timeout, BlockQualifier::RetryPossible);
        return IotsState::Cleanup;
    }

    limit_blocks_to_chunk_cap(group, iots);

    // Prerequisite selection: rebuilds probe for already-zeroed space
    // first; write-log flushes read the journal slot header first.
    iots.current_opcode = match iots.opcode {
        Opcode::Rebuild if iots.current_opcode == Opcode::Rebuild => Opcode::CheckZeroed,
        Opcode::WriteLogFlush if !iots.flags.write_log_flush_required => {
            Opcode::WriteLogHeaderRead
        }
        _ => iots.current_opcode,
    };

    if matches!(iots.opcode, Opcode::MarkForRebuild) {
        // Monitor control operation: no dispatch, just a metadata update.
        return IotsState::MarkNeedsRebuild;
    }

    if matches!(iots.current_opcode, Opcode::WriteLogHeaderRead) {
        // The journal private space has no chunk info; the region can
        // still be rebuilding, so synthesize entries from the group's
        // rebuild position mask.
        let entry = ChunkEntry::rebuild_delta(group.all_rebuild_positions());
        iots.chunk_info = vec![entry; chunk_span(group, iots) as usize];
        iots.flags.chunk_info_valid = true;
        return IotsState::Dispatch;
    }

    let needs_lookup = group.is_degraded()
        || iots.opcode.is_verify_or_rebuild()
        || (group.rekeying() && group.geometry().has_paged_metadata());
    if needs_lookup && !iots.flags.chunk_info_valid {
        IotsState::ChunkInfoLookup
    } else {
        if !iots.flags.chunk_info_valid {
            iots.chunk_info = vec![ChunkEntry::default(); chunk_span(group, iots) as usize];
            iots.flags.chunk_info_valid = true;
        }
        IotsState::Dispatch
    }
}

/// Number of chunks the current piece covers.
fn chunk_span(group: &RaidGroup, iots: &Iots) -> u64 {
    let geometry = group.geometry();
    if iots.opcode.is_disk_based() {
        geometry.chunk_range(iots.current_lba, iots.current_blocks).1
    } else {
        geometry
            .chunk_range_for_raid_lba(iots.current_lba, iots.current_blocks)
            .1
    }
}

/// Bound the current piece so it spans at most [`MAX_CHUNKS_PER_IOTS`]
/// chunks.
fn limit_blocks_to_chunk_cap(group: &RaidGroup, iots: &mut Iots) {
    let geometry = group.geometry();
    let remaining = iots.packet_end() - iots.current_lba;
    let per_disk_factor = if iots.opcode.is_disk_based() {
        1
    } else {
        geometry.data_disks as u64
    };
    // Blocks until the current chunk run would exceed the cap.
    let disk_lba = iots.current_lba / per_disk_factor;
    let cap_end_disk_lba =
        (disk_lba / geometry.chunk_size + MAX_CHUNKS_PER_IOTS) * geometry.chunk_size;
    let cap_blocks = cap_end_disk_lba * per_disk_factor - iots.current_lba;
    iots.current_blocks = remaining.min(cap_blocks);
}

async fn chunk_info_lookup(group: &RaidGroup, iots: &mut Iots) -> IotsState {
    let geometry = group.geometry();
    loop {
        let (start_chunk, count) = if iots.opcode.is_disk_based() {
            geometry.chunk_range(iots.current_lba, iots.current_blocks)
        } else {
            geometry.chunk_range_for_raid_lba(iots.current_lba, iots.current_blocks)
        };
        // The piece was already bounded to the cap; exceeding it here is a
        // logic error, not a retryable condition.
        if count > MAX_CHUNKS_PER_IOTS {
            warn!(id = %iots.id, count, "chunk span beyond the IOTS maximum");
            iots.set_status(BlockStatus::InvalidRequest, BlockQualifier::UnexpectedError);
            return IotsState::Cleanup;
        }

        // Background verify over the paged region reads under the
        // non-paged distributed lock; released first during cleanup.
        if iots.opcode.is_verify_or_rebuild()
            && geometry.is_metadata_io(iots.current_lba * geometry.data_disks as u64)
            && iots.np_lock.is_none()
        {
            iots.np_lock = Some(group.np_lock().lock_owned().await);
        }

        let entries = match group.chunks().read_range(start_chunk, count).await {
            Ok(entries) => entries,
            Err(err) => {
                return metadata_error(group, iots, err, ResumePoint::ChunkInfoLookup).await
            }
        };

        // Universal cross-check: the fine-grained view must stay inside
        // the authoritative non-paged view.
        let authoritative = group.all_rebuild_positions();
        if let Err(err) =
            group
                .chunks()
                .validate_against_nonpaged(start_chunk, &entries, authoritative)
        {
            warn!(id = %iots.id, %err, "chunk info failed non-paged cross-check");
            iots.set_status(BlockStatus::IoFailed, BlockQualifier::TooManyDeadPositions);
            return IotsState::Cleanup;
        }

        iots.chunk_info = entries;
        iots.flags.chunk_info_valid = true;

        // Truncate to the longest run of uniform degraded classification;
        // a dispatch never crosses a degraded/non-degraded boundary.
        let old_blocks = iots.current_blocks;
        truncate_to_uniform_run(group, iots);
        if iots.current_blocks == old_blocks {
            break;
        }
        // Shorter sub-range: chunk info must be re-fetched for it.
        trace!(
            id = %iots.id,
            old_blocks,
            new_blocks = iots.current_blocks,
            "sub-range truncated at degraded boundary, re-fetching chunk info"
        );
    }

    // Chunk-aligned zeros over degraded chunks prove the region is
    // known-zero: the one path allowed to narrow the bitmask.
    if matches!(iots.opcode, Opcode::Zero) {
        if let Some(state) = try_zero_clear(group, iots).await {
            return state;
        }
    }

    IotsState::Dispatch
}

/// Truncate the current piece so every covered chunk shares the degraded
/// classification of the first chunk.
fn truncate_to_uniform_run(group: &RaidGroup, iots: &mut Iots) {
    let geometry = group.geometry();
    let first_degraded = match iots.chunk_info.first() {
        Some(entry) => entry.is_degraded(),
        None => return,
    };
    let run_chunks = iots
        .chunk_info
        .iter()
        .take_while(|entry| entry.is_degraded() == first_degraded)
        .count() as u64;
    if run_chunks == iots.chunk_info.len() as u64 {
        return;
    }
    iots.chunk_info.truncate(run_chunks as usize);

    let per_disk_factor = if iots.opcode.is_disk_based() {
        1
    } else {
        geometry.data_disks as u64
    };
    let disk_lba = iots.current_lba / per_disk_factor;
    let run_end_disk_lba =
        (disk_lba / geometry.chunk_size + run_chunks) * geometry.chunk_size;
    let max_blocks = run_end_disk_lba * per_disk_factor - iots.current_lba;
    iots.current_blocks = iots.current_blocks.min(max_blocks);
}

/// The zero-operation clear optimization: a chunk-aligned zero over
/// degraded chunks clears their needs-rebuild bits instead of dispatching
/// writes to dead positions.
async fn try_zero_clear(group: &RaidGroup, iots: &mut Iots) -> Option<IotsState> {
    let geometry = group.geometry();
    let degraded_bits = iots
        .chunk_info
        .iter()
        .fold(0, |acc, entry| acc | entry.needs_rebuild);
    if degraded_bits == 0 {
        return None;
    }
    let disk_start = iots.current_lba / geometry.data_disks as u64;
    let disk_blocks = iots.current_blocks / geometry.data_disks as u64;
    let aligned =
        disk_start % geometry.chunk_size == 0 && disk_blocks % geometry.chunk_size == 0;
    if !aligned {
        return None;
    }
    let (start_chunk, count) =
        geometry.chunk_range_for_raid_lba(iots.current_lba, iots.current_blocks);
    debug!(
        id = %iots.id,
        start_chunk,
        count,
        bits = degraded_bits,
        "zero over degraded chunks, clearing needs-rebuild"
    );
    let delta = ChunkEntry::rebuild_delta(degraded_bits);
    if let Err(err) = update_chunks_split(group, start_chunk, count, &delta, true).await {
        return Some(metadata_error(group, iots, err, ResumePoint::ChunkInfoLookup).await);
    }
    for entry in &mut iots.chunk_info {
        entry.needs_rebuild = 0;
    }
    None
}

async fn dispatch(group: &RaidGroup, iots: &mut Iots) -> IotsState {
    let sub = SubRequest {
        opcode: iots.current_opcode,
        lba: iots.current_lba,
        blocks: iots.current_blocks,
        chunk_info: iots.chunk_info.clone(),
        rebuild_logging: iots.rebuild_logging,
        buffer: iots.piece_buffer(),
    };
    trace!(
        id = %iots.id,
        opcode = %sub.opcode,
        lba = sub.lba,
        blocks = sub.blocks,
        "dispatching to algorithm library"
    );
    let completion = group.algorithm().execute(sub).await;

    iots.flags.incomplete_write |= completion.incomplete_write;
    iots.flags.remap_needed |= completion.remap_needed;
    iots.last_no_further_work = completion.no_further_work;

    match completion.status {
        BlockStatus::Success => {
            merge_success(iots, &completion);
            IotsState::NextOperation
        }
        BlockStatus::MediaError => {
            // Media errors are sticky but do not stop the remaining pieces;
            // the caller sees MediaError with persisted partial progress.
            iots.set_status(BlockStatus::MediaError, completion.qualifier);
            IotsState::NextOperation
        }
        BlockStatus::IoFailed if completion.qualifier == BlockQualifier::RetryPossible => {
            retry_or_fail(group, iots, &completion)
        }
        _ => {
            iots.set_status(completion.status, completion.qualifier);
            IotsState::NextOperation
        }
    }
}

fn merge_success(iots: &mut Iots, completion: &AlgorithmCompletion) {
    if !iots.status.is_terminal_failure() && iots.status != BlockStatus::MediaError {
        iots.status = BlockStatus::Success;
        iots.qualifier = completion.qualifier;
    }
}

/// Transport-level and algorithm-reported retryable failures re-enter
/// LOCKING with a freshly re-evaluated rebuild-logging bitmask: the mask
/// may have changed while this request held no lock.
fn retry_or_fail(group: &RaidGroup, iots: &mut Iots, completion: &AlgorithmCompletion) -> IotsState {
    if iots.retries >= group.config().max_algorithm_retries {
        warn!(id = %iots.id, retries = iots.retries, "algorithm retries exhausted");
        iots.set_status(completion.status, BlockQualifier::RetryNotPossible);
        return IotsState::NextOperation;
    }
    iots.retries += 1;
    info!(id = %iots.id, retry = iots.retries, "retryable dispatch failure, re-entering locking");
    if let Some(guard) = iots.lock.take() {
        guard.release();
    }
    iots.flags.chunk_info_valid = false;
    IotsState::Locking
}

/// Evaluate the completion: prerequisite re-targeting, piece iteration, and
/// verify escalation.
async fn next_operation(group: &RaidGroup, iots: &mut Iots) -> IotsState {
    // Prerequisite finished: re-target the IOTS at the real opcode, or
    // short-circuit to cleanup when no further work is needed.
    if iots.current_opcode != iots.opcode {
        match iots.current_opcode {
            Opcode::CheckZeroed if iots.status == BlockStatus::Success => {
                if iots.last_no_further_work {
                    debug!(id = %iots.id, "range already zeroed, rebuild not required");
                    iots.set_status(BlockStatus::Success, BlockQualifier::Zeroed);
                    return IotsState::Cleanup;
                }
                iots.current_opcode = Opcode::Rebuild;
                return IotsState::Dispatch;
            }
            Opcode::WriteLogHeaderRead if iots.status == BlockStatus::Success => {
                if iots.last_no_further_work {
                    debug!(id = %iots.id, "journal header shows no live slots, flush not required");
                    iots.set_status(BlockStatus::Success, BlockQualifier::None);
                    return IotsState::Cleanup;
                }
                // The live flush reads chunk info for the live stripe and
                // participates in needs-rebuild marking.
                iots.flags.write_log_flush_required = true;
                iots.current_opcode = Opcode::WriteLogFlush;
                iots.flags.chunk_info_valid = false;
                if needs_rebuild_marking(group, iots) {
                    return IotsState::MarkNeedsRebuild;
                }
                return prepare_dispatch(group, iots);
            }
            _ => {}
        }
    }

    // Write-log operations that saw a remap schedule the journal remap
    // condition instead of marking chunk verify: the journal private space
    // has no chunk bitmap.
    if matches!(
        iots.opcode,
        Opcode::WriteLogHeaderRead | Opcode::WriteLogFlush
    ) && iots.flags.remap_needed
    {
        info!(id = %iots.id, "write-log remap needed, scheduling journal remap");
        group.request_journal_remap(iots.packet_lba);
        iots.flags.remap_needed = false;
        return IotsState::Cleanup;
    }

    // A completed verify clears the verify reason it serviced; verify
    // state only narrows here, never the needs-rebuild bitmask.
    if let Opcode::Verify(reason) = iots.opcode {
        if iots.status == BlockStatus::Success {
            let geometry = group.geometry();
            let (start_chunk, count) =
                geometry.chunk_range(iots.current_lba, iots.current_blocks);
            let mut flags = VerifyFlags::NONE;
            flags.insert(reason);
            let delta = ChunkEntry::verify_delta(flags);
            if let Err(err) = update_chunks_split(group, start_chunk, count, &delta, true).await
            {
                return metadata_error(group, iots, err, ResumePoint::MarkNeedsVerify).await;
            }
        }
    }

    if verify_marking_required(group, iots) {
        return IotsState::MarkNeedsVerify;
    }

    next_piece_or_cleanup(group, iots)
}

/// MARK_NEEDS_VERIFY applies when a completed data-modifying I/O needed a
/// remap or left a write incomplete — unless the opcode itself verifies or
/// rebuilds (it clears, not sets, verify state), the group is a mirror
/// member under a striper (the parent marks), or the target is
/// metadata-of-metadata for a zero operation.
fn verify_marking_required(group: &RaidGroup, iots: &Iots) -> bool {
    if !(iots.flags.remap_needed || iots.flags.incomplete_write) {
        return false;
    }
    if iots.opcode.is_verify_or_rebuild() || iots.opcode.is_disk_based() {
        return false;
    }
    if group.geometry().lock_taken_elsewhere() {
        return false;
    }
    if matches!(iots.opcode, Opcode::Zero)
        && group.geometry().is_metadata_io(iots.current_lba)
    {
        return false;
    }
    true
}

async fn mark_needs_verify(group: &RaidGroup, iots: &mut Iots) -> IotsState {
    let geometry = group.geometry();
    let (start_chunk, count) =
        geometry.chunk_range_for_raid_lba(iots.current_lba, iots.current_blocks);

    let mut flags = VerifyFlags::NONE;
    if iots.flags.incomplete_write {
        flags.insert(VerifyReason::IncompleteWrite);
    }
    if iots.flags.remap_needed {
        flags.insert(VerifyReason::Error);
    }
    debug!(id = %iots.id, start_chunk, count, bits = flags.0, "marking needs-verify");

    let delta = ChunkEntry::verify_delta(flags);
    match update_chunks_split(group, start_chunk, count, &delta, false).await {
        Ok(()) => {
            iots.flags.remap_needed = false;
            iots.flags.incomplete_write = false;
            next_piece_or_cleanup(group, iots)
        }
        Err(err) => metadata_error(group, iots, err, ResumePoint::MarkNeedsVerify).await,
    }
}

/// Advance to the next piece of the request, or finish.
fn next_piece_or_cleanup(group: &RaidGroup, iots: &mut Iots) -> IotsState {
    if iots.status.is_terminal_failure() && iots.status != BlockStatus::MediaError {
        return IotsState::Cleanup;
    }
    if iots.is_request_complete() {
        return IotsState::Cleanup;
    }
    // Verifies always finish in one IOTS; iterating one would re-walk
    // chunks the metadata update already consumed.
    if iots.opcode.is_verify_or_rebuild() && !matches!(iots.opcode, Opcode::Rebuild) {
        return IotsState::Cleanup;
    }
    iots.current_lba += iots.current_blocks;
    iots.current_blocks = 0;
    iots.flags.chunk_info_valid = false;
    iots.current_opcode = iots.opcode;
    trace!(id = %iots.id, lba = iots.current_lba, "starting next piece");
    prepare_dispatch(group, iots)
}

/// Handle a chunk metadata failure: retryable failures park the request
/// unless it is monitor-originated or targets the metadata-of-metadata
/// region, which must fail immediately.
async fn metadata_error(
    group: &RaidGroup,
    iots: &mut Iots,
    err: Error,
    resume: ResumePoint,
) -> IotsState {
    let metadata_target = group
        .geometry()
        .is_metadata_io(iots.packet_lba);
    let retryable = err.is_retryable();
    warn!(id = %iots.id, %err, retryable, "chunk metadata operation failed");

    if retryable && !iots.monitor && !metadata_target && !iots.opcode.is_disk_based() {
        return quiesce(group, iots, resume).await;
    }
    let qualifier = if retryable {
        BlockQualifier::RetryPossible
    } else {
        BlockQualifier::RetryNotPossible
    };
    iots.set_status(BlockStatus::IoFailed, qualifier);
    IotsState::Cleanup
}

/// Park the request until the group is restarted. The IOTS re-enters the
/// state it left; the deadline and cancellation stay armed while parked.
async fn quiesce(group: &RaidGroup, iots: &mut Iots, resume: ResumePoint) -> IotsState {
    iots.flags.was_quiesced = true;
    if let Some(guard) = iots.lock.take() {
        guard.release();
    }
    debug!(id = %iots.id, ?resume, "request quiesced");
    group.note_quiesced(iots.id, true);
    // A do-not-cancel request parks against a token the client cannot
    // trip; only restart or the deadline wakes it.
    let cancel = if iots.do_not_cancel {
        tokio_util::sync::CancellationToken::new()
    } else {
        iots.cancel.clone()
    };
    let outcome = group.park_until_restart(&cancel, iots.deadline).await;
    group.note_quiesced(iots.id, false);
    match outcome {
        ParkOutcome::Restarted => {
            iots.flags.chunk_info_valid = false;
            // A parked request resumes at the state it left, but a lost
            // lock means locking must run again first.
            if iots.lock.is_none() && lock_required(group, iots) {
                IotsState::Locking
            } else {
                resume.state()
            }
        }
        ParkOutcome::Cancelled => {
            iots.set_status(BlockStatus::RequestAborted, BlockQualifier::ClientAborted);
            IotsState::Cleanup
        }
        ParkOutcome::Expired => {
            iots.set_status(BlockStatus::Timeout, BlockQualifier::RetryPossible);
            IotsState::Cleanup
        }
    }
}

/// How a parked request was woken.
pub(crate) enum ParkOutcome {
    Restarted,
    Cancelled,
    Expired,
}

/// Release order is load-bearing: the non-paged distributed lock taken for
/// a background verify is dropped before the stripe lock, then final
/// status is copied back to the caller.
async fn cleanup(group: &RaidGroup, mut iots: Iots) -> IoCompletion {
    if let Some(np_guard) = iots.np_lock.take() {
        drop(np_guard);
    }
    if let Some(guard) = iots.lock.take() {
        guard.release();
    }
    if iots.status == BlockStatus::Invalid {
        // Nothing ever set a status; surface it as unexpected rather than
        // inventing success.
        iots.status = BlockStatus::IoFailed;
        iots.qualifier = BlockQualifier::UnexpectedError;
    }
    if iots.status == BlockStatus::Success {
        debug!(id = %iots.id, "request complete");
    } else {
        info!(
            id = %iots.id,
            status = ?iots.status,
            qualifier = ?iots.qualifier,
            "request finished with error"
        );
    }
    group.forget(iots.id);
    iots.completion()
}

// =============================================================================
// Tests
// =============================================================================
