//! In-memory collaborator doubles for unit and integration tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::block::{BlockQualifier, BlockStatus};
use crate::edge::{
    AlgorithmCompletion, AlgorithmLibrary, DiskEdge, DiskPacket, MetadataPersistence, ReadStamps,
    SubRequest,
};
use crate::error::{Error, Result};

// =============================================================================
// Metadata Persistence
// =============================================================================

/// Byte-addressed in-memory persistence. Reads of never-written space
/// return zeroes, matching the trait contract.
#[derive(Default)]
pub struct MemPersistence {
    data: Mutex<Vec<u8>>,
    /// Fail the next N operations with a retryable metadata error
    fail_next: AtomicU32,
    writes: AtomicU32,
}

impl MemPersistence {
    pub fn fail_next_ops(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn write_count(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl MetadataPersistence for MemPersistence {
    async fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        if self.take_failure() {
            return Err(Error::MetadataRetryable("injected write failure".into()));
        }
        let mut store = self.data.lock();
        let end = offset as usize + data.len();
        if store.len() < end {
            store.resize(end, 0);
        }
        store[offset as usize..end].copy_from_slice(data);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if self.take_failure() {
            return Err(Error::MetadataRetryable("injected read failure".into()));
        }
        let store = self.data.lock();
        let mut out = vec![0u8; len];
        let start = (offset as usize).min(store.len());
        let end = (offset as usize + len).min(store.len());
        if start < end {
            out[..end - start].copy_from_slice(&store[start..end]);
        }
        Ok(out)
    }
}

// =============================================================================
// Algorithm Library
// =============================================================================

/// Records every dispatched sub-request and replies from a programmable
/// completion queue, defaulting to success with valid read stamps.
#[derive(Default)]
pub struct MockAlgorithm {
    pub executed: Mutex<Vec<SubRequest>>,
    scripted: Mutex<VecDeque<AlgorithmCompletion>>,
}

impl MockAlgorithm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a completion to return for the next dispatch.
    pub fn script(&self, completion: AlgorithmCompletion) {
        self.scripted.lock().push_back(completion);
    }

    pub fn script_failure(&self, status: BlockStatus, qualifier: BlockQualifier) {
        self.script(AlgorithmCompletion {
            status,
            qualifier,
            ..AlgorithmCompletion::success()
        });
    }

    pub fn dispatch_count(&self) -> usize {
        self.executed.lock().len()
    }

    pub fn dispatched(&self) -> Vec<SubRequest> {
        self.executed.lock().clone()
    }
}

#[async_trait]
impl AlgorithmLibrary for MockAlgorithm {
    async fn execute(&self, sub: SubRequest) -> AlgorithmCompletion {
        let lba = sub.lba;
        self.executed.lock().push(sub);
        if let Some(completion) = self.scripted.lock().pop_front() {
            return completion;
        }
        AlgorithmCompletion {
            stamps: Some(ReadStamps {
                checksum_valid: true,
                lba_stamp: lba,
            }),
            ..AlgorithmCompletion::success()
        }
    }
}

// =============================================================================
// Disk Edge
// =============================================================================

/// Records packets per position; positions can be scripted to fail.
#[derive(Default)]
pub struct MockEdge {
    pub sent: Mutex<Vec<DiskPacket>>,
    failing: Mutex<Vec<u32>>,
    /// Fail everything after this many successful sends, if set
    fail_after: Mutex<Option<u32>>,
    successes: AtomicU32,
}

impl MockEdge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_position(&self, position: u32) {
        self.failing.lock().push(position);
    }

    pub fn fail_after(&self, successes: u32) {
        *self.fail_after.lock() = Some(successes);
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl DiskEdge for MockEdge {
    async fn send_write(&self, packet: DiskPacket) -> Result<()> {
        if self.failing.lock().contains(&packet.position) {
            return Err(Error::EdgeFailure {
                position: packet.position,
                reason: "injected edge failure".into(),
            });
        }
        if let Some(limit) = *self.fail_after.lock() {
            if self.successes.load(Ordering::SeqCst) >= limit {
                return Err(Error::EdgeFailure {
                    position: packet.position,
                    reason: "injected edge failure after limit".into(),
                });
            }
        }
        self.successes.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().push(packet);
        Ok(())
    }
}
