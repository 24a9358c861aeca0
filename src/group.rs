//! RAID group: request admission, degraded state, quiesce and restart
//!
//! One `RaidGroup` owns the services a request needs on its way through the
//! state machine: the stripe lock coordinator, the chunk metadata store,
//! the algorithm library handle, and the group-wide degraded state
//! (rebuild-logging bitmask plus active rebuild checkpoints).
//!
//! Scheduling is cooperative and completion-driven: `submit` drives the
//! request on the caller's task, yielding only at the suspension points,
//! and a quiesced request parks on the group's restart signal until the
//! monitor calls [`RaidGroup::restart_quiesced`].

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::block::{
    BlockQualifier, BlockRequest, BlockStatus, IoCompletion, PositionBitmask, LBA_INVALID,
};
use crate::chunk::ChunkStore;
use crate::direct::{self, DirectOutcome};
use crate::edge::{AlgorithmLibrary, MetadataPersistence};
use crate::error::{Error, Result};
use crate::geometry::RaidGeometry;
use crate::iots::{drive, Iots, IotsState, ParkOutcome};
use crate::lock::StripeLockService;

// =============================================================================
// Configuration
// =============================================================================

/// Tunables for one RAID group.
#[derive(Debug, Clone)]
pub struct GroupConfig {
    /// Default deadline applied to requests without their own
    pub user_timeout: Duration,

    /// Bounded retries for retryable algorithm/transport failures
    pub max_algorithm_retries: u32,

    /// Fast-path eligibility ceiling in blocks
    pub fast_path_max_blocks: u64,

    /// Whether the direct I/O fast path is attempted at all
    pub fast_path_enabled: bool,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            user_timeout: Duration::from_secs(30),
            max_algorithm_retries: 3,
            fast_path_max_blocks: 2048,
            fast_path_enabled: true,
        }
    }
}

// =============================================================================
// Degraded State
// =============================================================================

/// An active rebuild: a position and how far reconstruction has advanced.
#[derive(Debug, Clone, Copy)]
pub struct RebuildCheckpoint {
    pub position: u32,
    pub checkpoint: u64,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Positions currently rebuild-logging (writes are being recorded
    /// against them rather than sent to them)
    rebuild_logging: PositionBitmask,
    /// Positions with reconstruction in progress
    rebuild_checkpoints: Vec<RebuildCheckpoint>,
    /// A rekey pass is walking the group
    rekeying: bool,
}

/// Registry entry for one in-flight request.
#[derive(Debug, Clone, Copy)]
pub struct RequestPhase {
    pub state: IotsState,
    pub quiesced: bool,
}

// =============================================================================
// RaidGroup
// =============================================================================

/// The I/O execution core for one RAID group.
pub struct RaidGroup {
    geometry: Arc<RaidGeometry>,
    config: GroupConfig,
    locks: Arc<StripeLockService>,
    chunks: Arc<ChunkStore>,
    algorithm: Arc<dyn AlgorithmLibrary>,
    persistence: Arc<dyn MetadataPersistence>,
    state: RwLock<GroupState>,
    /// In-flight request registry, phase-tagged for observability
    inflight: DashMap<Uuid, RequestPhase>,
    /// Wakes parked (quiesced) requests on restart
    restart: Notify,
    quiesced_count: AtomicUsize,
    /// A write-log operation observed a slot needing remap; the scheduler
    /// polls this and runs the journal recovery pass
    journal_remap_needed: AtomicBool,
    journal_remap_lba: AtomicU64,
    /// Serializes background-verify access to the paged region
    np_lock: Arc<tokio::sync::Mutex<()>>,
    shutdown: CancellationToken,
}

impl RaidGroup {
    pub fn new(
        geometry: RaidGeometry,
        config: GroupConfig,
        algorithm: Arc<dyn AlgorithmLibrary>,
        persistence: Arc<dyn MetadataPersistence>,
    ) -> Arc<Self> {
        let geometry = Arc::new(geometry);
        let locks = StripeLockService::new(geometry.disk_capacity);
        let chunks = Arc::new(ChunkStore::new(Arc::clone(&geometry), Arc::clone(&persistence)));
        Arc::new(Self {
            geometry,
            config,
            locks,
            chunks,
            algorithm,
            persistence,
            state: RwLock::new(GroupState::default()),
            inflight: DashMap::new(),
            restart: Notify::new(),
            quiesced_count: AtomicUsize::new(0),
            journal_remap_needed: AtomicBool::new(false),
            journal_remap_lba: AtomicU64::new(LBA_INVALID),
            np_lock: Arc::new(tokio::sync::Mutex::new(())),
            shutdown: CancellationToken::new(),
        })
    }

    // =========================================================================
    // Accessors used by the state machine
    // =========================================================================

    pub fn geometry(&self) -> &RaidGeometry {
        &self.geometry
    }

    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    pub fn locks(&self) -> &Arc<StripeLockService> {
        &self.locks
    }

    pub fn chunks(&self) -> &ChunkStore {
        &self.chunks
    }

    pub fn algorithm(&self) -> &Arc<dyn AlgorithmLibrary> {
        &self.algorithm
    }

    pub fn persistence(&self) -> &Arc<dyn MetadataPersistence> {
        &self.persistence
    }

    pub(crate) fn np_lock(&self) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(&self.np_lock)
    }

    /// Positions currently rebuild-logging.
    pub fn rebuild_logging(&self) -> PositionBitmask {
        self.state.read().rebuild_logging
    }

    /// Authoritative mask of every position that is not trustworthy:
    /// rebuild-logging positions plus positions with an active rebuild
    /// checkpoint. The paged chunk view must stay inside this mask.
    pub fn all_rebuild_positions(&self) -> PositionBitmask {
        let state = self.state.read();
        let mut bits = state.rebuild_logging;
        for rc in &state.rebuild_checkpoints {
            if rc.checkpoint != LBA_INVALID {
                bits |= 1 << rc.position;
            }
        }
        bits
    }

    /// Whether any position is degraded.
    pub fn is_degraded(&self) -> bool {
        self.all_rebuild_positions() != 0
    }

    pub fn rekeying(&self) -> bool {
        self.state.read().rekeying
    }

    // =========================================================================
    // Degraded-state transitions (driven by the monitor collaborator)
    // =========================================================================

    /// A position went away: start rebuild logging against it.
    pub fn set_rebuild_logging(&self, position: u32) {
        let mut state = self.state.write();
        state.rebuild_logging |= 1 << position;
        info!(position, bits = state.rebuild_logging, "rebuild logging started");
    }

    /// Rebuild logging ended for a position (it returned or was replaced
    /// and reconstruction is taking over).
    pub fn clear_rebuild_logging(&self, position: u32) {
        let mut state = self.state.write();
        state.rebuild_logging &= !(1 << position);
        info!(position, bits = state.rebuild_logging, "rebuild logging cleared");
    }

    pub fn set_rebuild_checkpoint(&self, position: u32, checkpoint: u64) {
        let mut state = self.state.write();
        state.rebuild_checkpoints.retain(|rc| rc.position != position);
        if checkpoint != LBA_INVALID {
            state.rebuild_checkpoints.push(RebuildCheckpoint {
                position,
                checkpoint,
            });
        }
    }

    pub fn set_rekeying(&self, rekeying: bool) {
        self.state.write().rekeying = rekeying;
    }

    // =========================================================================
    // Admission
    // =========================================================================

    fn validate(&self, request: &BlockRequest) -> Result<()> {
        if request.blocks == 0 {
            return Err(Error::InvalidRequest("zero-length request".into()));
        }
        let range = request.raid_range(self.geometry.data_disks);
        let disk_end = (range.end - 1) / self.geometry.data_disks as u64;
        if request.opcode.is_disk_based() {
            // Disk-based background work covers user data and the metadata
            // region; journal space is owned by the recovery operation.
            if request.lba + request.blocks > self.geometry.journal_start {
                return Err(Error::InvalidRequest(format!(
                    "disk-relative range end {} beyond metadata region end {}",
                    request.lba + request.blocks,
                    self.geometry.journal_start
                )));
            }
        } else if disk_end >= self.geometry.journal_start {
            // Ordinary requests never touch journal-reserved space.
            return Err(Error::InvalidRequest(format!(
                "range reaches journal-reserved space at disk lba {disk_end}"
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Entry Points
    // =========================================================================

    /// Admit and execute one block request to completion.
    ///
    /// The caller's task drives the state machine; the future resolves with
    /// the definitive status/qualifier pair.
    #[instrument(skip(self, request), fields(id = %request.id, opcode = %request.opcode))]
    pub async fn submit(self: &Arc<Self>, request: BlockRequest) -> IoCompletion {
        if let Err(err) = self.validate(&request) {
            warn!(%err, "request failed admission");
            return IoCompletion::failed(
                request.id,
                BlockStatus::InvalidRequest,
                BlockQualifier::UnexpectedError,
            );
        }

        let deadline =
            Instant::now() + request.deadline.unwrap_or(self.config.user_timeout);
        self.inflight.insert(
            request.id,
            RequestPhase {
                state: IotsState::New,
                quiesced: false,
            },
        );

        // Latency optimization only: behavior and metadata effects must be
        // indistinguishable from the full state machine.
        let request = if self.config.fast_path_enabled {
            match direct::try_direct(self, &request, deadline).await {
                DirectOutcome::Completed(completion) => {
                    self.forget(request.id);
                    return completion;
                }
                DirectOutcome::Fallback => request,
            }
        } else {
            request
        };

        let iots = Iots::from_request(&request, deadline);
        drive(self, iots).await
    }

    /// Resume every request parked behind a quiesce and resume lock grants.
    pub fn restart_quiesced(&self) {
        let parked = self.quiesced_count.load(Ordering::SeqCst);
        info!(parked, "restarting quiesced requests");
        self.locks.unquiesce();
        self.restart.notify_waiters();
    }

    /// Quiesce the group: waiting lock requests are dropped back to their
    /// owners and re-park on the restart signal.
    pub fn quiesce(&self) {
        info!("quiescing group");
        self.locks.quiesce();
    }

    /// Shut the group down: abort lock waiters and cancel parked requests.
    pub fn shutdown(&self) {
        info!("shutting down group");
        self.shutdown.cancel();
        self.locks.abort_all();
        self.restart.notify_waiters();
    }

    /// Number of requests currently parked behind a quiesce.
    pub fn quiesced_requests(&self) -> usize {
        self.quiesced_count.load(Ordering::SeqCst)
    }

    /// Phase of an in-flight request, if still running.
    pub fn request_phase(&self, id: Uuid) -> Option<RequestPhase> {
        self.inflight.get(&id).map(|entry| *entry.value())
    }

    // =========================================================================
    // Journal remap scheduling
    // =========================================================================

    /// Record that the journal area needs a remap pass; picked up by the
    /// scheduler that owns the recovery operation.
    pub fn request_journal_remap(&self, lba: u64) {
        self.journal_remap_lba.store(lba, Ordering::SeqCst);
        self.journal_remap_needed.store(true, Ordering::SeqCst);
    }

    /// Consume a pending journal remap trigger.
    pub fn take_journal_remap_request(&self) -> Option<u64> {
        if self.journal_remap_needed.swap(false, Ordering::SeqCst) {
            Some(self.journal_remap_lba.swap(LBA_INVALID, Ordering::SeqCst))
        } else {
            None
        }
    }

    // =========================================================================
    // State-machine support
    // =========================================================================

    pub(crate) fn note_phase(&self, id: Uuid, state: IotsState) {
        if let Some(mut entry) = self.inflight.get_mut(&id) {
            entry.state = state;
        }
    }

    pub(crate) fn note_quiesced(&self, id: Uuid, quiesced: bool) {
        if quiesced {
            self.quiesced_count.fetch_add(1, Ordering::SeqCst);
        } else {
            self.quiesced_count.fetch_sub(1, Ordering::SeqCst);
        }
        if let Some(mut entry) = self.inflight.get_mut(&id) {
            entry.quiesced = quiesced;
        }
    }

    pub(crate) fn forget(&self, id: Uuid) {
        self.inflight.remove(&id);
    }

    /// Park the caller until the group restarts, the request is cancelled,
    /// or the deadline passes.
    pub(crate) async fn park_until_restart(
        &self,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> ParkOutcome {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => ParkOutcome::Cancelled,
            _ = self.shutdown.cancelled() => ParkOutcome::Cancelled,
            _ = self.restart.notified() => ParkOutcome::Restarted,
            _ = tokio::time::sleep_until(deadline) => ParkOutcome::Expired,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Opcode;
    use crate::testutil::{MemPersistence, MockAlgorithm};
    use assert_matches::assert_matches;

    fn group_with(algorithm: Arc<MockAlgorithm>) -> Arc<RaidGroup> {
        RaidGroup::new(
            RaidGeometry::default(),
            GroupConfig {
                fast_path_enabled: false,
                ..GroupConfig::default()
            },
            algorithm,
            Arc::new(MemPersistence::default()),
        )
    }

    #[tokio::test]
    async fn test_simple_write_succeeds() {
        let algorithm = MockAlgorithm::new();
        let group = group_with(Arc::clone(&algorithm));
        let completion = group
            .submit(BlockRequest::new(Opcode::Write, 0, 16))
            .await;
        assert_eq!(completion.status, BlockStatus::Success);
        assert_eq!(algorithm.dispatch_count(), 1);
    }

    #[tokio::test]
    async fn test_zero_length_request_rejected() {
        let group = group_with(MockAlgorithm::new());
        let completion = group
            .submit(BlockRequest::new(Opcode::Read, 0, 0))
            .await;
        assert_eq!(completion.status, BlockStatus::InvalidRequest);
    }

    #[tokio::test]
    async fn test_request_into_journal_space_rejected() {
        let group = group_with(MockAlgorithm::new());
        let geometry = RaidGeometry::default();
        let journal_raid_lba = geometry.journal_start * geometry.data_disks as u64;
        let completion = group
            .submit(BlockRequest::new(Opcode::Write, journal_raid_lba, 8))
            .await;
        assert_eq!(completion.status, BlockStatus::InvalidRequest);
    }

    #[tokio::test]
    async fn test_degraded_mask_combines_logging_and_checkpoints() {
        let group = group_with(MockAlgorithm::new());
        assert!(!group.is_degraded());
        group.set_rebuild_logging(2);
        group.set_rebuild_checkpoint(0, 0x100);
        assert_eq!(group.all_rebuild_positions(), 0b101);
        group.clear_rebuild_logging(2);
        group.set_rebuild_checkpoint(0, LBA_INVALID);
        assert!(!group.is_degraded());
    }

    #[tokio::test]
    async fn test_journal_remap_trigger_roundtrip() {
        let group = group_with(MockAlgorithm::new());
        assert_matches!(group.take_journal_remap_request(), None);
        group.request_journal_remap(0x42);
        assert_matches!(group.take_journal_remap_request(), Some(0x42));
        assert_matches!(group.take_journal_remap_request(), None);
    }

    #[tokio::test]
    async fn test_cancelled_request_reports_client_abort() {
        let group = group_with(MockAlgorithm::new());
        let request = BlockRequest::new(Opcode::Write, 0, 8);
        request.cancel.cancel();
        let completion = group.submit(request).await;
        assert_eq!(completion.status, BlockStatus::RequestAborted);
        assert_eq!(completion.qualifier, BlockQualifier::ClientAborted);
    }
}
