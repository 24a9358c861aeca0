//! Stripe Lock Coordinator
//!
//! Grants shared/exclusive ownership of contiguous stripe-aligned ranges so
//! that overlapping requests are strictly serialized: at most one writer, or
//! any number of readers, own an overlapping range at a time.
//!
//! The hold-or-fail-fast policy lives here. Host I/O acquires with
//! `may_wait = true` and parks behind contention or a quiesce; monitor,
//! metadata, verify, rebuild and write-log operations acquire with
//! `may_wait = false` and get an immediate `Dropped` on any conflict — a
//! waiter entry is never created for them, so they can never deadlock
//! behind a quiesce.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::geometry::StripeRange;

/// Lock mode requested for a stripe range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

/// Result of a stripe lock acquisition.
#[derive(Debug)]
pub enum LockOutcome {
    /// Ownership granted; release via the guard
    Granted(StripeLockGuard),
    /// Contention or quiesce; `may_wait` callers requeue, others fail fast
    Dropped,
    /// Shutdown aborted the request before a grant
    Aborted,
    /// External cancellation raced the grant
    Cancelled,
    /// `range.last` lies beyond the configured per-disk capacity
    IllegalRange,
}

#[derive(Debug)]
struct Owner {
    id: u64,
    range: StripeRange,
    mode: LockMode,
}

enum WaitResult {
    Granted(u64),
    Dropped,
    Aborted,
}

struct Waiter {
    waiter_id: u64,
    range: StripeRange,
    mode: LockMode,
    tx: oneshot::Sender<WaitResult>,
}

#[derive(Default)]
struct LockTable {
    next_id: u64,
    owners: Vec<Owner>,
    waiters: VecDeque<Waiter>,
    quiesced: bool,
    shutdown: bool,
}

impl LockTable {
    /// A write conflicts with any overlapping owner; a read conflicts only
    /// with overlapping writers.
    fn conflicts(&self, range: &StripeRange, mode: LockMode) -> bool {
        self.owners.iter().any(|owner| {
            owner.range.overlaps(range)
                && (mode == LockMode::Write || owner.mode == LockMode::Write)
        })
    }

    fn grant(&mut self, range: StripeRange, mode: LockMode) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.owners.push(Owner { id, range, mode });
        id
    }

    /// Promote waiters in FIFO order after a release. Granting stops at the
    /// first waiter that still conflicts, so a queued writer is not starved
    /// by later readers.
    fn promote(&mut self) {
        while let Some(waiter) = self.waiters.front() {
            if self.conflicts(&waiter.range, waiter.mode) {
                break;
            }
            let waiter = self.waiters.pop_front().expect("front checked");
            let id = self.grant(waiter.range, waiter.mode);
            if waiter.tx.send(WaitResult::Granted(id)).is_err() {
                // Receiver cancelled between promote and delivery; the
                // cancel path could not find the waiter anymore, so the
                // ownership entry is ours to retract.
                self.owners.retain(|o| o.id != id);
            }
        }
    }
}

/// Coordinator state for one RAID group.
pub struct StripeLockService {
    /// Per-disk capacity in stripe units; grants never extend past it
    capacity: u64,
    table: Mutex<LockTable>,
}

impl StripeLockService {
    pub fn new(capacity: u64) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            table: Mutex::new(LockTable::default()),
        })
    }

    /// Acquire ownership of `range` in `mode`.
    ///
    /// With `may_wait = false` this never suspends: any conflict returns
    /// `Dropped` within the same call. With `may_wait = true` the caller
    /// waits for the grant, and a quiesce or shutdown while waiting
    /// resolves the wait as `Dropped`/`Aborted` so the request can be
    /// requeued rather than failed.
    pub async fn acquire(
        self: &Arc<Self>,
        range: StripeRange,
        mode: LockMode,
        may_wait: bool,
        cancel: &CancellationToken,
    ) -> LockOutcome {
        if range.last >= self.capacity {
            warn!(
                first = range.first,
                last = range.last,
                capacity = self.capacity,
                "stripe lock range beyond configured capacity"
            );
            return LockOutcome::IllegalRange;
        }
        if cancel.is_cancelled() {
            return LockOutcome::Cancelled;
        }

        let (waiter_id, mut rx) = {
            let mut table = self.table.lock();
            if table.shutdown {
                return LockOutcome::Aborted;
            }
            if table.quiesced {
                trace!(first = range.first, last = range.last, "lock dropped: group quiesced");
                return LockOutcome::Dropped;
            }
            if !table.conflicts(&range, mode) {
                let id = table.grant(range, mode);
                trace!(id, first = range.first, last = range.last, ?mode, "stripe lock granted");
                return LockOutcome::Granted(self.guard(id, range, mode));
            }
            if !may_wait {
                trace!(first = range.first, last = range.last, "lock dropped: no-wait conflict");
                return LockOutcome::Dropped;
            }
            let (tx, rx) = oneshot::channel();
            let waiter_id = table.next_id;
            table.next_id += 1;
            table.waiters.push_back(Waiter {
                waiter_id,
                range,
                mode,
                tx,
            });
            (waiter_id, rx)
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // The grant may have raced the cancellation; if our waiter
                // entry is gone the lock is held and must be put back.
                let was_queued = {
                    let mut table = self.table.lock();
                    let before = table.waiters.len();
                    table.waiters.retain(|w| w.waiter_id != waiter_id);
                    before != table.waiters.len()
                };
                if !was_queued {
                    if let Ok(WaitResult::Granted(id)) = rx.try_recv() {
                        self.release_id(id);
                    }
                }
                LockOutcome::Cancelled
            }
            result = &mut rx => match result {
                Ok(WaitResult::Granted(id)) => {
                    if cancel.is_cancelled() {
                        // Cancellation raced the grant: release normally and
                        // report cancelled, never a generic I/O failure.
                        self.guard(id, range, mode).release();
                        return LockOutcome::Cancelled;
                    }
                    debug!(id, first = range.first, last = range.last, "stripe lock granted after wait");
                    LockOutcome::Granted(self.guard(id, range, mode))
                }
                Ok(WaitResult::Dropped) => LockOutcome::Dropped,
                Ok(WaitResult::Aborted) | Err(_) => LockOutcome::Aborted,
            }
        }
    }

    fn guard(self: &Arc<Self>, id: u64, range: StripeRange, mode: LockMode) -> StripeLockGuard {
        StripeLockGuard {
            service: Arc::clone(self),
            id,
            range,
            mode,
            released: false,
        }
    }

    fn release_id(&self, id: u64) {
        let mut table = self.table.lock();
        let before = table.owners.len();
        table.owners.retain(|o| o.id != id);
        debug_assert_ne!(before, table.owners.len(), "double release");
        table.promote();
    }

    /// Drop every waiter with `Dropped` and refuse new grants until
    /// [`Self::unquiesce`]. Owners are unaffected; they drain naturally.
    pub fn quiesce(&self) {
        let mut table = self.table.lock();
        table.quiesced = true;
        for waiter in table.waiters.drain(..) {
            let _ = waiter.tx.send(WaitResult::Dropped);
        }
    }

    /// Resume granting after a quiesce.
    pub fn unquiesce(&self) {
        let mut table = self.table.lock();
        table.quiesced = false;
        table.promote();
    }

    /// Shutdown: abort all waiters and refuse all future grants.
    pub fn abort_all(&self) {
        let mut table = self.table.lock();
        table.shutdown = true;
        for waiter in table.waiters.drain(..) {
            let _ = waiter.tx.send(WaitResult::Aborted);
        }
    }

    #[cfg(test)]
    fn owner_count(&self) -> usize {
        self.table.lock().owners.len()
    }
}

/// Ownership of one granted stripe range.
///
/// Released exactly once: explicitly via [`release`](Self::release) on every
/// path, with drop as the backstop against leaks on panic unwinds.
pub struct StripeLockGuard {
    service: Arc<StripeLockService>,
    id: u64,
    range: StripeRange,
    mode: LockMode,
    released: bool,
}

impl std::fmt::Debug for StripeLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeLockGuard")
            .field("id", &self.id)
            .field("range", &self.range)
            .field("mode", &self.mode)
            .finish()
    }
}

impl StripeLockGuard {
    pub fn range(&self) -> StripeRange {
        self.range
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Release the range and wake compatible waiters.
    pub fn release(mut self) {
        self.released = true;
        self.service.release_id(self.id);
    }
}

impl Drop for StripeLockGuard {
    fn drop(&mut self) {
        if !self.released {
            self.service.release_id(self.id);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const CAPACITY: u64 = 0x1000;

    fn service() -> Arc<StripeLockService> {
        StripeLockService::new(CAPACITY)
    }

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn test_grant_and_release() {
        let svc = service();
        let outcome = svc
            .acquire(StripeRange::new(0, 10), LockMode::Write, true, &token())
            .await;
        let guard = assert_matches!(outcome, LockOutcome::Granted(g) => g);
        assert_eq!(svc.owner_count(), 1);
        guard.release();
        assert_eq!(svc.owner_count(), 0);
    }

    #[tokio::test]
    async fn test_readers_share_overlapping_range() {
        let svc = service();
        let a = svc
            .acquire(StripeRange::new(0, 10), LockMode::Read, true, &token())
            .await;
        let b = svc
            .acquire(StripeRange::new(5, 15), LockMode::Read, true, &token())
            .await;
        assert_matches!(a, LockOutcome::Granted(_));
        assert_matches!(b, LockOutcome::Granted(_));
    }

    #[tokio::test]
    async fn test_writer_excludes_overlapping_writer() {
        let svc = service();
        let _held = assert_matches!(
            svc.acquire(StripeRange::new(0, 10), LockMode::Write, true, &token()).await,
            LockOutcome::Granted(g) => g
        );
        // A no-wait conflicting writer returns Dropped within the same call.
        let outcome = svc
            .acquire(StripeRange::new(5, 8), LockMode::Write, false, &token())
            .await;
        assert_matches!(outcome, LockOutcome::Dropped);
    }

    #[tokio::test]
    async fn test_no_wait_never_blocks() {
        let svc = service();
        let _held = assert_matches!(
            svc.acquire(StripeRange::new(0, 10), LockMode::Write, true, &token()).await,
            LockOutcome::Granted(g) => g
        );
        // Inject a held conflicting lock and assert the no-wait acquire
        // resolves on its very first poll, with no waiter state created.
        let cancel = token();
        let mut fut = tokio_test::task::spawn(svc.acquire(
            StripeRange::new(0, 0),
            LockMode::Read,
            false,
            &cancel,
        ));
        match fut.poll() {
            std::task::Poll::Ready(LockOutcome::Dropped) => {}
            other => panic!("expected immediate Dropped, got {other:?}"),
        }
        drop(fut);
        assert_eq!(svc.table.lock().waiters.len(), 0);
    }

    #[tokio::test]
    async fn test_illegal_range_beyond_capacity() {
        let svc = service();
        let outcome = svc
            .acquire(
                StripeRange::new(CAPACITY - 1, CAPACITY),
                LockMode::Write,
                true,
                &token(),
            )
            .await;
        assert_matches!(outcome, LockOutcome::IllegalRange);
        // No side effects: nothing owned, nothing queued.
        assert_eq!(svc.owner_count(), 0);
        assert_eq!(svc.table.lock().waiters.len(), 0);
    }

    #[tokio::test]
    async fn test_waiter_promoted_on_release() {
        let svc = service();
        let held = assert_matches!(
            svc.acquire(StripeRange::new(0, 10), LockMode::Write, true, &token()).await,
            LockOutcome::Granted(g) => g
        );
        let svc2 = Arc::clone(&svc);
        let waiter = tokio::spawn(async move {
            svc2.acquire(StripeRange::new(0, 10), LockMode::Write, true, &token())
                .await
        });
        tokio::task::yield_now().await;
        held.release();
        let outcome = waiter.await.unwrap();
        assert_matches!(outcome, LockOutcome::Granted(_));
    }

    #[tokio::test]
    async fn test_quiesce_drops_waiters() {
        let svc = service();
        let _held = assert_matches!(
            svc.acquire(StripeRange::new(0, 10), LockMode::Write, true, &token()).await,
            LockOutcome::Granted(g) => g
        );
        let svc2 = Arc::clone(&svc);
        let waiter = tokio::spawn(async move {
            svc2.acquire(StripeRange::new(0, 10), LockMode::Write, true, &token())
                .await
        });
        tokio::task::yield_now().await;
        svc.quiesce();
        assert_matches!(waiter.await.unwrap(), LockOutcome::Dropped);
        // While quiesced, new acquires drop immediately.
        let outcome = svc
            .acquire(StripeRange::new(100, 110), LockMode::Read, true, &token())
            .await;
        assert_matches!(outcome, LockOutcome::Dropped);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_waiters() {
        let svc = service();
        let _held = assert_matches!(
            svc.acquire(StripeRange::new(0, 10), LockMode::Write, true, &token()).await,
            LockOutcome::Granted(g) => g
        );
        let svc2 = Arc::clone(&svc);
        let waiter = tokio::spawn(async move {
            svc2.acquire(StripeRange::new(3, 4), LockMode::Read, true, &token())
                .await
        });
        tokio::task::yield_now().await;
        svc.abort_all();
        assert_matches!(waiter.await.unwrap(), LockOutcome::Aborted);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let svc = service();
        let _held = assert_matches!(
            svc.acquire(StripeRange::new(0, 10), LockMode::Write, true, &token()).await,
            LockOutcome::Granted(g) => g
        );
        let cancel = token();
        let svc2 = Arc::clone(&svc);
        let cancel2 = cancel.clone();
        let waiter = tokio::spawn(async move {
            svc2.acquire(StripeRange::new(0, 10), LockMode::Write, true, &cancel2)
                .await
        });
        tokio::task::yield_now().await;
        cancel.cancel();
        assert_matches!(waiter.await.unwrap(), LockOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_queued_writer_not_starved_by_readers() {
        let svc = service();
        let reader = assert_matches!(
            svc.acquire(StripeRange::new(0, 10), LockMode::Read, true, &token()).await,
            LockOutcome::Granted(g) => g
        );
        let svc2 = Arc::clone(&svc);
        let writer = tokio::spawn(async move {
            svc2.acquire(StripeRange::new(0, 10), LockMode::Write, true, &token())
                .await
        });
        tokio::task::yield_now().await;
        // A later no-wait reader conflicts with the queued writer only via
        // owners; it would be grantable, but FIFO promote still favors the
        // writer once the first reader releases.
        reader.release();
        assert_matches!(writer.await.unwrap(), LockOutcome::Granted(_));
    }
}
