//! The undo request manager.
//!
//! Holds the live set of background undo requests in fixed arenas, indexes
//! them three ways (oldest transaction, largest undo, soonest retry), and
//! hands them to workers with a strict round-robin across the three
//! priorities so none of them starves. A single exclusive lock covers all
//! shared state; critical sections are a handful of tree operations.
//!
//! Lifecycle, as seen by callers:
//!
//! - a transaction that is about to write undo calls [`UndoRequestManager::register`];
//! - on commit it calls [`UndoRequestManager::unregister`];
//! - on abort it calls [`UndoRequestManager::finalize`] and then
//!   [`UndoRequestManager::perform_in_background`], falling back to
//!   foreground undo when the soft limit says no;
//! - workers loop on [`UndoRequestManager::next`], then either
//!   [`UndoRequestManager::unregister`] (success) or
//!   [`UndoRequestManager::reschedule`] (failure);
//! - at shutdown [`UndoRequestManager::serialize`] captures the listed
//!   set, and [`UndoRequestManager::restore`] rebuilds it at startup.
//!
//! Operations reached from commit or abort unwind paths (`unregister`,
//! `perform_in_background`, `reschedule`) have no error returns at all;
//! the only failure they could hit is index-node exhaustion, which the
//! twice-capacity node budget rules out short of a bookkeeping bug.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, trace};
use undoq_error::UndoError;
use undoq_types::{DatabaseId, FullXid, Timestamp, UndoRequestData, UndoSpan};

use crate::arena::{IndexMembership, IndexNode, NodePool, RequestArena, RequestIdx, RequestSlot};
use crate::clock::UndoClock;
use crate::index::{RequestIndex, SortOrder};

// ---------------------------------------------------------------------------
// Retry backoff constants
// ---------------------------------------------------------------------------

/// Delay before the first retry of a request whose undo failed.
pub const FIRST_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Delay before every retry after the first.
///
/// Deliberately flat rather than per-attempt exponential: the goal is only
/// to avoid busy-looping on a request that keeps failing, and a flat
/// schedule needs no extra bookkeeping.
pub const SUBSEQUENT_RETRY_DELAY: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Sizing knobs for an [`UndoRequestManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct UndoManagerConfig {
    /// Hard upper bound on simultaneous live requests.
    pub capacity: usize,
    /// Utilization threshold above which non-forced background promotion is
    /// refused and the committer does the undo inline.
    pub soft_limit: usize,
}

impl UndoManagerConfig {
    /// Build a config, checking `soft_limit <= capacity` and `capacity > 0`.
    #[must_use]
    pub fn new(capacity: usize, soft_limit: usize) -> Self {
        assert!(capacity > 0, "undo request capacity must be non-zero");
        assert!(
            soft_limit <= capacity,
            "soft limit {soft_limit} exceeds capacity {capacity}"
        );
        Self {
            capacity,
            soft_limit,
        }
    }
}

// ---------------------------------------------------------------------------
// Handles and results
// ---------------------------------------------------------------------------

/// Exclusive handle to an UNLISTED request.
///
/// Whoever holds the handle is responsible for moving the request onward:
/// [`UndoRequestManager::unregister`], [`UndoRequestManager::reschedule`],
/// or a successful [`UndoRequestManager::perform_in_background`] consume
/// it. Dropping a handle leaks its slot until restart; the manager cannot
/// reclaim a request it no longer sees.
#[derive(Debug)]
#[must_use = "an unlisted undo request must be unregistered, backgrounded, or rescheduled"]
pub struct RequestHandle {
    idx: RequestIdx,
    fxid: FullXid,
}

impl RequestHandle {
    /// The transaction this request belongs to.
    #[must_use]
    pub fn fxid(&self) -> FullXid {
        self.fxid
    }
}

/// A request claimed by a worker, with a copy of its durable payload.
///
/// The copy is safe to read without the manager lock: the request became
/// UNLISTED when it was claimed, so nobody else can touch it.
#[derive(Debug)]
pub struct ClaimedRequest {
    pub handle: RequestHandle,
    pub data: UndoRequestData,
}

/// Point-in-time counters for observability and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerStats {
    pub capacity: usize,
    pub soft_limit: usize,
    /// Live (non-FREE) requests, listed or not.
    pub utilization: usize,
    /// Requests listed in the fxid/size indexes (never-failed population).
    pub listed_ready: usize,
    /// Requests listed in the retry-time index (failed population).
    pub listed_retrying: usize,
}

// ---------------------------------------------------------------------------
// Scheduler cursor
// ---------------------------------------------------------------------------

/// Which index [`UndoRequestManager::next`] probes first on its next call.
///
/// The three priorities pull in different directions: the oldest
/// transaction advances xid horizons and lets undo log segments go, the
/// largest transaction is the slowest to process and should start early,
/// and due retries must not be stranded. No static weighting serves all
/// three, so the cursor strictly rotates and each population gets a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestSource {
    Fxid,
    Size,
    RetryTime,
}

impl RequestSource {
    const fn next_source(self) -> Self {
        match self {
            Self::Fxid => Self::Size,
            Self::Size => Self::RetryTime,
            Self::RetryTime => Self::Fxid,
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

struct ManagerInner {
    requests: RequestArena,
    nodes: NodePool,
    by_fxid: RequestIndex,
    by_size: RequestIndex,
    by_retry_time: RequestIndex,
    source: RequestSource,
    utilization: usize,
    /// Cached minimum fxid over all live requests; `None` means no live
    /// requests. Only meaningful while `oldest_fxid_valid`.
    oldest_fxid: Option<FullXid>,
    oldest_fxid_valid: bool,
}

/// Manager for the live set of background undo requests.
///
/// One instance per process is the intended deployment, but the type is
/// plain data plus a lock, so tests create as many as they like.
pub struct UndoRequestManager {
    inner: Mutex<ManagerInner>,
    clock: Arc<dyn UndoClock>,
    capacity: usize,
    soft_limit: usize,
}

impl UndoRequestManager {
    /// Build a manager with all storage pre-reserved.
    pub fn new(config: UndoManagerConfig, clock: Arc<dyn UndoClock>) -> Self {
        assert!(config.capacity > 0, "undo request capacity must be non-zero");
        assert!(
            config.soft_limit <= config.capacity,
            "soft limit {} exceeds capacity {}",
            config.soft_limit,
            config.capacity
        );
        let inner = ManagerInner {
            requests: RequestArena::new(config.capacity),
            // A listed request is in {fxid, size} or in {retry}, never more,
            // so two nodes per request is the exact worst case.
            nodes: NodePool::new(2 * config.capacity),
            by_fxid: RequestIndex::new(SortOrder::Fxid),
            by_size: RequestIndex::new(SortOrder::SizeDesc),
            by_retry_time: RequestIndex::new(SortOrder::RetryTime),
            source: RequestSource::Fxid,
            utilization: 0,
            oldest_fxid: None,
            oldest_fxid_valid: true,
        };
        Self {
            inner: Mutex::new(inner),
            clock,
            capacity: config.capacity,
            soft_limit: config.soft_limit,
        }
    }

    /// Bytes of memory a manager of the given capacity keeps resident:
    /// the manager itself plus both fixed arenas.
    #[must_use]
    pub fn estimated_size(capacity: usize) -> usize {
        std::mem::size_of::<Self>()
            + std::mem::size_of::<ManagerInner>()
            + capacity * std::mem::size_of::<RequestSlot>()
            + 2 * capacity * std::mem::size_of::<IndexNode>()
    }

    /// Register a request for a transaction that is about to write undo.
    ///
    /// Returns `None` when the pool is exhausted; that is a capacity
    /// condition, not an error, and the caller degrades to foreground
    /// undo. The returned request is UNLISTED with zeroed payload.
    pub fn register(&self, fxid: FullXid, dbid: DatabaseId) -> Option<RequestHandle> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(idx) = inner.requests.alloc() else {
            debug!(%fxid, %dbid, "undo request pool exhausted; transaction must undo in the foreground");
            return None;
        };
        inner.utilization += 1;
        let slot = inner.requests.get_mut(idx);
        slot.fxid = Some(fxid);
        slot.dbid = dbid;
        inner.note_live_fxid(fxid);
        trace!(%fxid, %dbid, "registered undo request");
        Some(RequestHandle { idx, fxid })
    }

    /// Fill in a request's durable payload.
    ///
    /// Called at prepare time for a prepared transaction and at abort time
    /// otherwise, once the generated undo size and log ranges are known.
    /// `size` counts only logged and unlogged undo that background workers
    /// will process.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero or neither undo class has a span; a
    /// transaction that wrote no undo has nothing to finalize.
    pub fn finalize(
        &self,
        req: &RequestHandle,
        size: u64,
        logged: Option<UndoSpan>,
        unlogged: Option<UndoSpan>,
    ) {
        assert!(size > 0, "finalized undo request must have a non-zero size");
        assert!(
            logged.is_some() || unlogged.is_some(),
            "finalized undo request must carry at least one undo span"
        );
        let mut guard = self.inner.lock();
        let slot = guard.slot_mut(req);
        debug_assert_eq!(
            slot.membership,
            IndexMembership::None,
            "finalize requires an unlisted request"
        );
        slot.size = size;
        slot.logged = logged;
        slot.unlogged = unlogged;
    }

    /// Release a request: on commit, or once its undo has been fully
    /// applied. Never fails; it runs on post-commit paths that cannot
    /// unwind.
    pub fn unregister(&self, req: RequestHandle) {
        let mut guard = self.inner.lock();
        guard.release(&req);
        trace!(fxid = %req.fxid, "unregistered undo request");
    }

    /// Hand a finalized request to the background workers.
    ///
    /// Returns `Ok(())` when the request is now the manager's problem:
    /// either it was listed for the workers, or it described no undo at
    /// all and was released. Returns `Err` with the handle when the soft
    /// limit refused it; the caller must process the undo in the
    /// foreground and then call [`Self::unregister`] on success or
    /// [`Self::reschedule`] on failure.
    ///
    /// `force` overrides the soft limit and is for callers that cannot run
    /// foreground undo (for example, cleanup after a crashed backend); it
    /// spends headroom that normally keeps the pool out of the hard limit,
    /// so use it sparingly.
    ///
    /// Never fails: this runs during transaction abort.
    pub fn perform_in_background(
        &self,
        req: RequestHandle,
        force: bool,
    ) -> Result<(), RequestHandle> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        {
            let slot = inner.slot_mut(&req);
            if slot.logged.is_none() && slot.unlogged.is_none() {
                // Aborted after registering but before writing any undo:
                // there is no work, so just release the slot.
                inner.release(&req);
                trace!(fxid = %req.fxid, "released undo request that wrote no undo");
                return Ok(());
            }
        }
        if force || inner.background_admissible(self.soft_limit) {
            inner.list_ready(req.idx);
            trace!(fxid = %req.fxid, force, "undo request listed for background processing");
            Ok(())
        } else {
            debug!(
                fxid = %req.fxid,
                utilization = inner.utilization,
                soft_limit = self.soft_limit,
                "soft limit reached; undo request stays with the caller"
            );
            Err(req)
        }
    }

    /// Claim the next request a worker should process, or `None` if no
    /// eligible request exists.
    ///
    /// With a `dbid` filter, only requests from that database are
    /// returned. `minimum_runtime_reached` tells the scheduler the worker
    /// is ready to exit: when set, it takes a matching request only if one
    /// is at the head of an index, skipping the exhaustive
    /// database-affinity scan it would otherwise fall back to.
    ///
    /// The claimed request becomes UNLISTED, so no other worker can claim
    /// it; the caller must finish with [`Self::unregister`] or
    /// [`Self::reschedule`].
    pub fn next(
        &self,
        dbid: Option<DatabaseId>,
        minimum_runtime_reached: bool,
    ) -> Option<ClaimedRequest> {
        let now = self.clock.now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let mut winner: Option<RequestIdx> = None;
        let mut saw_db_mismatch = false;

        // Probe each index at most once, rotating the cursor as we go, so
        // that over successive calls every priority gets equal attention.
        for _ in 0..3 {
            let source = inner.source;
            inner.source = source.next_source();
            let index = match source {
                RequestSource::Fxid => &inner.by_fxid,
                RequestSource::Size => &inner.by_size,
                RequestSource::RetryTime => &inner.by_retry_time,
            };
            let Some(candidate) = index.leftmost(&inner.nodes) else {
                continue;
            };
            let slot = inner.requests.get(candidate);
            // A failed request is only eligible once its retry time
            // arrives; workers must not spin on it.
            if source == RequestSource::RetryTime {
                if let Some(retry_at) = slot.retry_time {
                    if retry_at > now {
                        continue;
                    }
                }
            }
            // The database check comes last so the mismatch flag is only
            // set for requests that were otherwise eligible.
            if let Some(want) = dbid {
                if slot.dbid != want {
                    saw_db_mismatch = true;
                    continue;
                }
            }
            winner = Some(candidate);
            break;
        }

        // The heads were all wrong-database, and the caller would rather
        // keep working than exit: look past the heads for any match.
        if winner.is_none() && saw_db_mismatch && !minimum_runtime_reached {
            if let Some(want) = dbid {
                winner = inner.find_for_database(want, now);
            }
        }

        let idx = winner?;
        inner.unlist(idx);
        let data = inner.request_data(idx);
        trace!(fxid = %data.fxid, "worker claimed undo request");
        Some(ClaimedRequest {
            handle: RequestHandle {
                idx,
                fxid: data.fxid,
            },
            data,
        })
    }

    /// Put a request whose undo just failed back under the manager's
    /// control, to be retried once its backoff expires.
    ///
    /// Never fails: this runs during transaction abort.
    pub fn reschedule(&self, req: RequestHandle) {
        let now = self.clock.now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let retry_at = {
            let slot = inner.slot_mut(&req);
            debug_assert_eq!(
                slot.membership,
                IndexMembership::None,
                "reschedule requires an unlisted request"
            );
            let delay = if slot.retry_time.is_none() {
                FIRST_RETRY_DELAY
            } else {
                SUBSEQUENT_RETRY_DELAY
            };
            let retry_at = now.saturating_add(delay);
            slot.retry_time = Some(retry_at);
            retry_at
        };
        inner.list_retrying(req.idx);
        debug!(
            fxid = %req.fxid,
            retry_at_micros = retry_at.as_micros(),
            "undo failed; request rescheduled"
        );
    }

    /// Take the request for a prepared transaction out of scheduler
    /// consideration.
    ///
    /// Called once per prepared transaction after [`Self::restore`] and
    /// before workers start, so that undo is not applied to a transaction
    /// that may still commit. The caller keeps the handle until the
    /// transaction resolves: [`Self::unregister`] on commit,
    /// [`Self::perform_in_background`] on abort.
    pub fn suspend_prepared(&self, fxid: FullXid) -> Result<RequestHandle, UndoError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(idx) = inner.by_fxid.find_fxid(&inner.nodes, &inner.requests, fxid) else {
            return Err(UndoError::RequestNotFound { fxid });
        };
        debug_assert!(
            inner.requests.get(idx).size > 0,
            "a restored prepared request is always finalized"
        );
        inner.unlist(idx);
        trace!(%fxid, "suspended undo request for prepared transaction");
        Ok(RequestHandle { idx, fxid })
    }

    /// Minimum fxid over all live requests, or `None` when there are none.
    ///
    /// Cached; any release of the cached minimum invalidates the cache and
    /// the next call rescans the arena.
    pub fn oldest_fxid(&self) -> Option<FullXid> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if !inner.oldest_fxid_valid {
            inner.oldest_fxid = inner
                .requests
                .iter_occupied()
                .filter_map(|(_, slot)| slot.fxid)
                .min();
            inner.oldest_fxid_valid = true;
        }
        inner.oldest_fxid
    }

    /// Serialize every LISTED request's durable payload.
    ///
    /// UNLISTED requests belong to transactions still in flight, whose
    /// payloads are not yet trustworthy, so only the listed populations
    /// are captured: the never-failed set in fxid order, then the failed
    /// set in retry order. Retry times are dropped on purpose; see
    /// [`Self::restore`].
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let guard = self.inner.lock();
        let inner = &*guard;
        let count = inner.by_fxid.len() + inner.by_retry_time.len();
        let mut buf = Vec::with_capacity(count * UndoRequestData::RECORD_BYTES);
        for idx in inner
            .by_fxid
            .iter(&inner.nodes)
            .chain(inner.by_retry_time.iter(&inner.nodes))
        {
            inner.request_data(idx).encode_into(&mut buf);
        }
        buf
    }

    /// Rebuild the listed set from bytes produced by [`Self::serialize`].
    ///
    /// Every restored request is listed as never-failed, whatever its
    /// history: the cause of an old failure may be gone after a restart,
    /// and forgetting it costs at most one early retry while remembering
    /// it wrongly could starve the request. It also keeps restored
    /// requests findable by fxid for [`Self::suspend_prepared`].
    ///
    /// The whole blob is validated before any state changes, so an error
    /// leaves the manager untouched. Returns the number of requests
    /// restored.
    ///
    /// # Panics
    ///
    /// Panics if the manager is not empty; restore is a startup-only
    /// operation.
    pub fn restore(&self, bytes: &[u8]) -> Result<usize, UndoError> {
        let record_bytes = UndoRequestData::RECORD_BYTES;
        if bytes.len() % record_bytes != 0 {
            return Err(UndoError::CorruptSaveState {
                len: bytes.len(),
                record_bytes,
            });
        }
        let count = bytes.len() / record_bytes;
        if count > self.capacity {
            return Err(UndoError::SaveStateOverCapacity {
                count,
                capacity: self.capacity,
            });
        }
        let mut records = Vec::with_capacity(count);
        for (i, chunk) in bytes.chunks_exact(record_bytes).enumerate() {
            let data = UndoRequestData::decode(chunk).map_err(|source| UndoError::CorruptRecord {
                offset: i * record_bytes,
                source,
            })?;
            records.push(data);
        }

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        assert_eq!(
            inner.utilization, 0,
            "restore requires an empty undo request manager"
        );
        for data in records {
            let idx = inner
                .requests
                .alloc()
                .expect("an empty manager holds at least capacity slots");
            inner.utilization += 1;
            let slot = inner.requests.get_mut(idx);
            slot.fxid = Some(data.fxid);
            slot.dbid = data.dbid;
            slot.size = data.size;
            slot.logged = data.logged;
            slot.unlogged = data.unlogged;
            slot.retry_time = None;
            inner.note_live_fxid(data.fxid);
            inner.list_ready(idx);
        }
        info!(restored = count, "restored undo requests from saved state");
        Ok(count)
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        let guard = self.inner.lock();
        ManagerStats {
            capacity: self.capacity,
            soft_limit: self.soft_limit,
            utilization: guard.utilization,
            listed_ready: guard.by_fxid.len(),
            listed_retrying: guard.by_retry_time.len(),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn soft_limit(&self) -> usize {
        self.soft_limit
    }

    /// Live (non-FREE) request count.
    #[must_use]
    pub fn utilization(&self) -> usize {
        self.inner.lock().utilization
    }
}

#[allow(clippy::missing_fields_in_debug)]
impl std::fmt::Debug for UndoRequestManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("UndoRequestManager")
            .field("capacity", &stats.capacity)
            .field("soft_limit", &stats.soft_limit)
            .field("utilization", &stats.utilization)
            .finish_non_exhaustive()
    }
}

impl ManagerInner {
    /// Resolve a handle to its slot, checking that the handle still names
    /// the transaction the slot holds.
    fn slot_mut(&mut self, req: &RequestHandle) -> &mut RequestSlot {
        let slot = self.requests.get_mut(req.idx);
        assert_eq!(
            slot.fxid,
            Some(req.fxid),
            "request handle does not match the slot it names"
        );
        slot
    }

    /// Fold a newly live fxid into the oldest-fxid cache.
    fn note_live_fxid(&mut self, fxid: FullXid) {
        if self.oldest_fxid_valid && self.oldest_fxid.map_or(true, |oldest| fxid < oldest) {
            self.oldest_fxid = Some(fxid);
        }
    }

    /// Whether a non-forced request may go to the background.
    fn background_admissible(&self, soft_limit: usize) -> bool {
        // TODO: size-aware admission; a huge request could justify
        // backgrounding even near the soft limit, and vice versa.
        self.utilization <= soft_limit
    }

    /// List a never-failed request in the fxid and size indexes.
    fn list_ready(&mut self, idx: RequestIdx) {
        self.by_fxid.insert(&mut self.nodes, &self.requests, idx);
        self.by_size.insert(&mut self.nodes, &self.requests, idx);
        self.requests.get_mut(idx).membership = IndexMembership::FxidAndSize;
    }

    /// List a failed request in the retry-time index.
    fn list_retrying(&mut self, idx: RequestIdx) {
        self.by_retry_time
            .insert(&mut self.nodes, &self.requests, idx);
        self.requests.get_mut(idx).membership = IndexMembership::RetryTime;
    }

    /// Remove a listed request from the indexes that contain it.
    fn unlist(&mut self, idx: RequestIdx) {
        let membership = self.requests.get(idx).membership;
        match membership {
            IndexMembership::None => panic!("cannot unlist a request that is not listed"),
            IndexMembership::FxidAndSize => {
                self.by_fxid.remove(&mut self.nodes, &self.requests, idx);
                self.by_size.remove(&mut self.nodes, &self.requests, idx);
            }
            IndexMembership::RetryTime => {
                self.by_retry_time
                    .remove(&mut self.nodes, &self.requests, idx);
            }
        }
        self.requests.get_mut(idx).membership = IndexMembership::None;
    }

    /// Return a request to the free list from any legal state.
    fn release(&mut self, req: &RequestHandle) {
        let membership = self.slot_mut(req).membership;
        if membership != IndexMembership::None {
            self.unlist(req.idx);
        }
        if self.oldest_fxid == Some(req.fxid) {
            self.oldest_fxid_valid = false;
        }
        self.requests.free(req.idx);
        self.utilization -= 1;
    }

    /// Interleaved left-to-right walk of all three indexes, returning the
    /// first eligible request for `dbid`.
    ///
    /// Stepping the walks in lockstep surfaces the highest-priority match
    /// under any of the three orderings without materializing a merged
    /// view. No bound is placed on the walk; it only runs when a worker
    /// has asked to look harder.
    fn find_for_database(&self, dbid: DatabaseId, now: Timestamp) -> Option<RequestIdx> {
        let mut walks = [
            self.by_fxid.iter(&self.nodes),
            self.by_size.iter(&self.nodes),
            self.by_retry_time.iter(&self.nodes),
        ];
        let mut done = [false; 3];
        let mut i = 0;
        loop {
            if !done[i] {
                match walks[i].next() {
                    None => {
                        done[i] = true;
                        if done == [true; 3] {
                            return None;
                        }
                    }
                    Some(req) => {
                        let slot = self.requests.get(req);
                        let retry_pending =
                            slot.retry_time.is_some_and(|retry_at| retry_at > now);
                        if slot.dbid == dbid && !retry_pending {
                            return Some(req);
                        }
                    }
                }
            }
            i = (i + 1) % 3;
        }
    }

    /// Snapshot a slot's durable payload.
    fn request_data(&self, idx: RequestIdx) -> UndoRequestData {
        let slot = self.requests.get(idx);
        UndoRequestData {
            fxid: slot.fxid.expect("live request has a valid fxid"),
            dbid: slot.dbid,
            size: slot.size,
            logged: slot.logged,
            unlogged: slot.unlogged,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use undoq_types::{RecordDecodeError, UndoRecPtr};

    use super::*;
    use crate::clock::ManualClock;

    fn manager(capacity: usize, soft_limit: usize) -> (UndoRequestManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Timestamp::ZERO));
        let mgr = UndoRequestManager::new(
            UndoManagerConfig::new(capacity, soft_limit),
            clock.clone(),
        );
        (mgr, clock)
    }

    fn fxid(raw: u64) -> FullXid {
        FullXid::new(raw).unwrap()
    }

    fn db(raw: u32) -> DatabaseId {
        DatabaseId::new(raw)
    }

    fn span(start: u64, end: u64) -> Option<UndoSpan> {
        Some(UndoSpan::new(
            UndoRecPtr::new(start).unwrap(),
            UndoRecPtr::new(end).unwrap(),
        ))
    }

    /// Register, finalize, and list a request; panics if the soft limit
    /// refuses it.
    fn listed_request(mgr: &UndoRequestManager, raw_fxid: u64, raw_dbid: u32, size: u64) {
        let handle = mgr.register(fxid(raw_fxid), db(raw_dbid)).expect("room");
        mgr.finalize(&handle, size, span(0x100, 0x200), None);
        mgr.perform_in_background(handle, false)
            .expect("under the soft limit");
    }

    #[test]
    fn register_then_commit_round_trip() {
        let (mgr, _clock) = manager(8, 6);
        let handle = mgr.register(fxid(100), db(5)).unwrap();
        assert_eq!(handle.fxid(), fxid(100));
        assert_eq!(mgr.utilization(), 1);
        assert_eq!(mgr.oldest_fxid(), Some(fxid(100)));

        mgr.unregister(handle);
        assert_eq!(mgr.utilization(), 0);
        assert_eq!(mgr.oldest_fxid(), None);
        let stats = mgr.stats();
        assert_eq!(stats.listed_ready, 0);
        assert_eq!(stats.listed_retrying, 0);
    }

    #[test]
    fn register_returns_none_when_pool_is_exhausted() {
        let (mgr, _clock) = manager(2, 2);
        let a = mgr.register(fxid(1), db(1)).unwrap();
        let b = mgr.register(fxid(2), db(1)).unwrap();
        assert!(mgr.register(fxid(3), db(1)).is_none());

        mgr.unregister(a);
        let c = mgr.register(fxid(3), db(1)).unwrap();
        mgr.unregister(b);
        mgr.unregister(c);
    }

    #[test]
    fn background_promotion_under_soft_limit_headroom() {
        let (mgr, _clock) = manager(8, 6);
        let handle = mgr.register(fxid(10), db(1)).unwrap();
        mgr.finalize(&handle, 1000, span(0x10, 0x20), None);
        assert!(mgr.perform_in_background(handle, false).is_ok());

        let stats = mgr.stats();
        assert_eq!(stats.utilization, 1);
        assert_eq!(stats.listed_ready, 1);
        assert_eq!(stats.listed_retrying, 0);
        // Listed in both the fxid and size indexes.
        let inner = mgr.inner.lock();
        assert_eq!(inner.by_fxid.len(), 1);
        assert_eq!(inner.by_size.len(), 1);
    }

    #[test]
    fn soft_limit_refuses_then_force_overrides() {
        let (mgr, _clock) = manager(8, 2);
        let a = mgr.register(fxid(1), db(1)).unwrap();
        let b = mgr.register(fxid(2), db(1)).unwrap();
        let c = mgr.register(fxid(3), db(1)).unwrap();
        for handle in [&a, &b, &c] {
            mgr.finalize(handle, 100, span(0x10, 0x20), None);
        }

        // Utilization is 3 > soft limit 2: refused without force.
        let a = mgr.perform_in_background(a, false).unwrap_err();
        assert!(mgr.perform_in_background(a, true).is_ok());

        mgr.unregister(b);
        mgr.unregister(c);
    }

    #[test]
    fn request_that_wrote_no_undo_is_released() {
        let (mgr, _clock) = manager(4, 4);
        let handle = mgr.register(fxid(1), db(1)).unwrap();
        // Never finalized: aborted before writing undo.
        assert!(mgr.perform_in_background(handle, false).is_ok());
        assert_eq!(mgr.utilization(), 0);
        assert_eq!(mgr.stats().listed_ready, 0);
    }

    #[test]
    fn round_robin_rotates_across_all_three_indexes() {
        let (mgr, _clock) = manager(8, 8);
        listed_request(&mgr, 10, 1, 100); // A
        listed_request(&mgr, 20, 1, 500); // B
        listed_request(&mgr, 30, 1, 300); // C

        // Cursor starts at the fxid index: oldest transaction first.
        let a = mgr.next(None, false).unwrap();
        assert_eq!(a.data.fxid, fxid(10));
        assert_eq!(a.data.size, 100);

        // Size index next: the largest remaining transaction.
        let b = mgr.next(None, false).unwrap();
        assert_eq!(b.data.fxid, fxid(20));
        assert_eq!(b.data.size, 500);

        // Retry index is empty; rotation falls through to fxid again.
        let c = mgr.next(None, false).unwrap();
        assert_eq!(c.data.fxid, fxid(30));

        assert!(mgr.next(None, false).is_none());

        for claimed in [a, b, c] {
            mgr.unregister(claimed.handle);
        }
    }

    #[test]
    fn rotation_consumes_from_each_populated_index_in_turn() {
        let (mgr, clock) = manager(8, 8);

        // Put one request into the retry population with its backoff spent.
        listed_request(&mgr, 3, 1, 50);
        let claimed = mgr.next(None, false).unwrap(); // cursor: fxid -> size
        mgr.reschedule(claimed.handle);
        clock.advance(Duration::from_secs(11));

        listed_request(&mgr, 1, 1, 100);
        listed_request(&mgr, 2, 1, 200);

        // Three successive claims, one per index: largest size, due retry,
        // oldest fxid.
        let from_size = mgr.next(None, false).unwrap();
        assert_eq!(from_size.data.fxid, fxid(2));
        let from_retry = mgr.next(None, false).unwrap();
        assert_eq!(from_retry.data.fxid, fxid(3));
        let from_fxid = mgr.next(None, false).unwrap();
        assert_eq!(from_fxid.data.fxid, fxid(1));

        for claimed in [from_size, from_retry, from_fxid] {
            mgr.unregister(claimed.handle);
        }
    }

    #[test]
    fn claimed_request_carries_the_durable_payload() {
        let (mgr, _clock) = manager(4, 4);
        let handle = mgr.register(fxid(77), db(9)).unwrap();
        mgr.finalize(&handle, 2048, span(0x1000, 0x2000), span(0x3000, 0x4000));
        mgr.perform_in_background(handle, false).unwrap();

        let claimed = mgr.next(None, false).unwrap();
        assert_eq!(claimed.data.fxid, fxid(77));
        assert_eq!(claimed.data.dbid, db(9));
        assert_eq!(claimed.data.size, 2048);
        assert_eq!(claimed.data.logged, span(0x1000, 0x2000));
        assert_eq!(claimed.data.unlogged, span(0x3000, 0x4000));
        mgr.unregister(claimed.handle);
    }

    #[test]
    fn retry_backoff_first_ten_seconds_then_thirty() {
        let (mgr, clock) = manager(4, 4);
        listed_request(&mgr, 1, 1, 100);

        // First failure at t=0: retry due at t=10s.
        let claimed = mgr.next(None, false).unwrap();
        mgr.reschedule(claimed.handle);
        assert_eq!(mgr.stats().listed_retrying, 1);

        clock.set(Timestamp::ZERO.saturating_add(Duration::from_secs(5)));
        assert!(mgr.next(None, false).is_none(), "retry not due yet");

        clock.set(Timestamp::ZERO.saturating_add(Duration::from_secs(11)));
        let claimed = mgr.next(None, false).unwrap();
        assert_eq!(claimed.data.fxid, fxid(1));

        // Second failure at t=11s: retry due at t=41s.
        mgr.reschedule(claimed.handle);
        clock.set(Timestamp::ZERO.saturating_add(Duration::from_secs(40)));
        assert!(mgr.next(None, false).is_none(), "second retry not due yet");
        clock.set(Timestamp::ZERO.saturating_add(Duration::from_secs(42)));
        let claimed = mgr.next(None, false).unwrap();
        mgr.unregister(claimed.handle);
    }

    #[test]
    fn pending_retry_is_invisible_even_via_affinity_scan() {
        let (mgr, clock) = manager(4, 4);
        listed_request(&mgr, 1, 7, 100);
        let claimed = mgr.next(Some(db(7)), false).unwrap();
        mgr.reschedule(claimed.handle);

        clock.set(Timestamp::ZERO.saturating_add(Duration::from_secs(1)));
        // Not due: invisible to the probe rotation and to the affinity scan.
        assert!(mgr.next(Some(db(7)), false).is_none());
        assert!(mgr.next(None, false).is_none());

        clock.set(Timestamp::ZERO.saturating_add(Duration::from_secs(10)));
        let claimed = mgr.next(Some(db(7)), false).unwrap();
        mgr.unregister(claimed.handle);
    }

    #[test]
    fn database_filter_falls_back_to_affinity_scan() {
        let (mgr, _clock) = manager(8, 8);
        // db#1 requests dominate every index head.
        listed_request(&mgr, 10, 1, 5_000);
        listed_request(&mgr, 11, 1, 4_000);
        // The db#2 request is younger and smaller: never at a head.
        listed_request(&mgr, 50, 2, 10);

        let claimed = mgr.next(Some(db(2)), false).unwrap();
        assert_eq!(claimed.data.fxid, fxid(50));
        assert_eq!(claimed.data.dbid, db(2));
        mgr.unregister(claimed.handle);
    }

    #[test]
    fn minimum_runtime_reached_skips_the_affinity_scan() {
        let (mgr, _clock) = manager(8, 8);
        listed_request(&mgr, 10, 1, 5_000);
        listed_request(&mgr, 50, 2, 10);

        // A worker ready to exit only takes what is at an index head.
        assert!(mgr.next(Some(db(2)), true).is_none());
        assert_eq!(mgr.stats().listed_ready, 2, "nothing was claimed");

        // A worker that wants to keep going finds it.
        assert!(mgr.next(Some(db(2)), false).is_some());
    }

    #[test]
    fn no_affinity_scan_when_nothing_matches_anywhere() {
        let (mgr, _clock) = manager(4, 4);
        listed_request(&mgr, 10, 1, 100);
        assert!(mgr.next(Some(db(9)), false).is_none());
        assert_eq!(mgr.stats().listed_ready, 1);
    }

    #[test]
    fn suspend_prepared_unlists_without_releasing() {
        let (mgr, _clock) = manager(4, 4);
        listed_request(&mgr, 33, 2, 640);

        let handle = mgr.suspend_prepared(fxid(33)).unwrap();
        assert_eq!(handle.fxid(), fxid(33));
        let stats = mgr.stats();
        assert_eq!(stats.utilization, 1);
        assert_eq!(stats.listed_ready, 0);
        assert!(mgr.next(None, false).is_none());

        // The prepared transaction eventually commits.
        mgr.unregister(handle);
        assert_eq!(mgr.utilization(), 0);
    }

    #[test]
    fn suspend_prepared_reports_unknown_fxid() {
        let (mgr, _clock) = manager(4, 4);
        let err = mgr.suspend_prepared(fxid(404)).unwrap_err();
        assert!(matches!(
            err,
            UndoError::RequestNotFound { fxid: f } if f == fxid(404)
        ));
    }

    #[test]
    fn oldest_fxid_tracks_the_minimum_through_churn() {
        let (mgr, _clock) = manager(8, 8);
        let h30 = mgr.register(fxid(30), db(1)).unwrap();
        let h10 = mgr.register(fxid(10), db(1)).unwrap();
        let h20 = mgr.register(fxid(20), db(1)).unwrap();
        assert_eq!(mgr.oldest_fxid(), Some(fxid(10)));

        // Releasing the oldest invalidates the cache; the rescan finds 20.
        mgr.unregister(h10);
        assert_eq!(mgr.oldest_fxid(), Some(fxid(20)));

        // Releasing a non-minimum leaves the cache alone.
        mgr.unregister(h30);
        assert_eq!(mgr.oldest_fxid(), Some(fxid(20)));

        mgr.unregister(h20);
        assert_eq!(mgr.oldest_fxid(), None);
    }

    #[test]
    fn serialize_walks_ready_then_retrying() {
        let (mgr, _clock) = manager(8, 8);
        listed_request(&mgr, 2, 1, 100);
        listed_request(&mgr, 1, 1, 50);
        listed_request(&mgr, 3, 1, 75);
        let failed = mgr.suspend_prepared(fxid(3)).unwrap();
        mgr.reschedule(failed);

        let bytes = mgr.serialize();
        assert_eq!(bytes.len(), 3 * UndoRequestData::RECORD_BYTES);
        let fxids: Vec<u64> = bytes
            .chunks_exact(UndoRequestData::RECORD_BYTES)
            .map(|chunk| UndoRequestData::decode(chunk).unwrap().fxid.get())
            .collect();
        assert_eq!(fxids, vec![1, 2, 3]);
    }

    #[test]
    fn serialize_skips_unlisted_requests() {
        let (mgr, _clock) = manager(8, 8);
        listed_request(&mgr, 1, 1, 100);
        let in_flight = mgr.register(fxid(2), db(1)).unwrap();

        let bytes = mgr.serialize();
        assert_eq!(bytes.len(), UndoRequestData::RECORD_BYTES);
        mgr.unregister(in_flight);
    }

    #[test]
    fn restart_round_trip_forgets_retry_state() {
        let (mgr, clock) = manager(8, 8);
        listed_request(&mgr, 1, 5, 200);
        listed_request(&mgr, 2, 6, 900);
        // Fail request 2 so it sits in the retry index with a future time.
        let failed = mgr.suspend_prepared(fxid(2)).unwrap();
        mgr.reschedule(failed);
        let bytes = mgr.serialize();

        let fresh = UndoRequestManager::new(
            UndoManagerConfig::new(8, 8),
            clock.clone(),
        );
        assert_eq!(fresh.restore(&bytes).unwrap(), 2);
        let stats = fresh.stats();
        assert_eq!(stats.utilization, 2);
        assert_eq!(stats.listed_ready, 2);
        assert_eq!(stats.listed_retrying, 0);
        assert_eq!(fresh.oldest_fxid(), Some(fxid(1)));

        // Both claimable immediately: failure history did not survive.
        let first = fresh.next(None, false).unwrap();
        let second = fresh.next(None, false).unwrap();
        let mut payloads = [first.data, second.data];
        payloads.sort_by_key(|d| d.fxid);
        assert_eq!(payloads[0].fxid, fxid(1));
        assert_eq!(payloads[0].dbid, db(5));
        assert_eq!(payloads[0].size, 200);
        assert_eq!(payloads[1].fxid, fxid(2));
        assert_eq!(payloads[1].dbid, db(6));
        assert_eq!(payloads[1].size, 900);
        fresh.unregister(first.handle);
        fresh.unregister(second.handle);
    }

    #[test]
    fn restore_rejects_ragged_lengths() {
        let (mgr, _clock) = manager(4, 4);
        let err = mgr.restore(&[0_u8; 53]).unwrap_err();
        assert!(matches!(
            err,
            UndoError::CorruptSaveState {
                len: 53,
                record_bytes: 52
            }
        ));
        assert_eq!(mgr.utilization(), 0);
    }

    #[test]
    fn restore_rejects_more_requests_than_capacity() {
        let (big, _clock) = manager(8, 8);
        listed_request(&big, 1, 1, 10);
        listed_request(&big, 2, 1, 10);
        listed_request(&big, 3, 1, 10);
        let bytes = big.serialize();

        let (small, _clock) = manager(2, 2);
        let err = small.restore(&bytes).unwrap_err();
        assert!(matches!(
            err,
            UndoError::SaveStateOverCapacity {
                count: 3,
                capacity: 2
            }
        ));
        assert_eq!(small.utilization(), 0);
    }

    #[test]
    fn restore_rejects_corrupt_records_without_partial_state() {
        let (mgr, _clock) = manager(8, 8);
        listed_request(&mgr, 1, 1, 10);
        listed_request(&mgr, 2, 1, 10);
        let mut bytes = mgr.serialize();
        // Corrupt the second record's size field.
        let off = UndoRequestData::RECORD_BYTES + 12;
        bytes[off..off + 8].fill(0);

        let (fresh, _clock) = manager(8, 8);
        let err = fresh.restore(&bytes).unwrap_err();
        assert!(matches!(
            err,
            UndoError::CorruptRecord {
                offset,
                source: RecordDecodeError::ZeroSize,
            } if offset == UndoRequestData::RECORD_BYTES
        ));
        // The valid first record was not admitted either.
        assert_eq!(fresh.utilization(), 0);
    }

    #[test]
    #[should_panic(expected = "empty undo request manager")]
    fn restore_into_a_non_empty_manager_panics() {
        let (mgr, _clock) = manager(8, 8);
        listed_request(&mgr, 1, 1, 10);
        let bytes = mgr.serialize();
        let _ = mgr.restore(&bytes);
    }

    #[test]
    #[should_panic(expected = "never combined")]
    fn listing_the_same_fxid_twice_panics() {
        let (mgr, _clock) = manager(4, 4);
        listed_request(&mgr, 5, 1, 10);
        listed_request(&mgr, 5, 1, 20);
    }

    #[test]
    fn estimated_size_scales_with_capacity() {
        let small = UndoRequestManager::estimated_size(16);
        let large = UndoRequestManager::estimated_size(1024);
        assert!(small > 0);
        assert!(large > small);
        let per_slot = (large - small) / (1024 - 16);
        assert!(
            per_slot >= std::mem::size_of::<RequestSlot>() + 2 * std::mem::size_of::<IndexNode>()
        );
    }

    #[test]
    #[should_panic(expected = "soft limit")]
    fn config_rejects_soft_limit_above_capacity() {
        let _ = UndoManagerConfig::new(4, 5);
    }

    #[test]
    fn random_churn_preserves_the_manager_invariants() {
        let (mgr, clock) = manager(32, 24);
        let mut rng = StdRng::seed_from_u64(0x5EED);
        let mut next_fxid = 1_u64;
        let mut live: BTreeSet<u64> = BTreeSet::new();
        // Handles we hold, split by how we got them: a request that was
        // claimed or rescheduled must not go through perform_in_background
        // again.
        let mut fresh: Vec<RequestHandle> = Vec::new();
        let mut claimed: Vec<RequestHandle> = Vec::new();

        for _ in 0..2_000 {
            match rng.gen_range(0_u8..6) {
                0 | 1 => {
                    if let Some(handle) = mgr.register(fxid(next_fxid), db(rng.gen_range(1..4))) {
                        live.insert(next_fxid);
                        mgr.finalize(&handle, rng.gen_range(1..10_000), span(0x10, 0x20), None);
                        fresh.push(handle);
                    }
                    next_fxid += 1;
                }
                2 => {
                    if !fresh.is_empty() {
                        let handle = fresh.swap_remove(rng.gen_range(0..fresh.len()));
                        if let Err(handle) = mgr.perform_in_background(handle, rng.gen_bool(0.2)) {
                            fresh.push(handle);
                        }
                    }
                }
                3 => {
                    if let Some(c) = mgr.next(None, false) {
                        claimed.push(c.handle);
                    }
                }
                4 => {
                    let pool = if rng.gen_bool(0.5) && !fresh.is_empty() {
                        &mut fresh
                    } else {
                        &mut claimed
                    };
                    if !pool.is_empty() {
                        let handle = pool.swap_remove(rng.gen_range(0..pool.len()));
                        live.remove(&handle.fxid().get());
                        mgr.unregister(handle);
                    }
                }
                _ => {
                    // Foreground or background undo failed: either way the
                    // handle goes back through reschedule.
                    let pool = if rng.gen_bool(0.5) && !fresh.is_empty() {
                        &mut fresh
                    } else {
                        &mut claimed
                    };
                    if !pool.is_empty() {
                        let handle = pool.swap_remove(rng.gen_range(0..pool.len()));
                        mgr.reschedule(handle);
                    }
                }
            }
            if rng.gen_bool(0.3) {
                clock.advance(Duration::from_secs(rng.gen_range(0..20)));
            }

            let stats = mgr.stats();
            assert_eq!(stats.utilization, live.len());
            assert!(stats.utilization <= stats.capacity);
            assert_eq!(
                mgr.oldest_fxid().map(FullXid::get),
                live.iter().next().copied()
            );
        }

        // Drain: hand everything back, let every retry come due, claim it all.
        for handle in fresh.drain(..).chain(claimed.drain(..)) {
            live.remove(&handle.fxid().get());
            mgr.unregister(handle);
        }
        clock.advance(Duration::from_secs(3600));
        while let Some(claimed) = mgr.next(None, false) {
            live.remove(&claimed.data.fxid.get());
            mgr.unregister(claimed.handle);
        }
        assert!(live.is_empty());
        assert_eq!(mgr.utilization(), 0);
        let inner = mgr.inner.lock();
        assert_eq!(inner.requests.free_count(), inner.requests.capacity());
        assert_eq!(inner.nodes.free_count(), inner.nodes.capacity());
    }
}
