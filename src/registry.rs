//! The range registry: request arena, FIFO buckets and the admission engine.
//!
//! All state lives in [`Registry`], which the manager keeps behind a single
//! `parking_lot::Mutex`. Requests are stored in a slab arena and the four
//! buckets (waiting/assigned x read/write) hold arena keys in FIFO order, so
//! promoting a request is an O(1)-ish key move rather than a record copy.
//!
//! Every mutating entry point of the manager runs [`Registry::reassign`]
//! afterwards while still holding the state mutex. `reassign` never wakes
//! anything itself; it hands the promoted requests' wakers back so the caller
//! can fire them after releasing the mutex.

use std::collections::VecDeque;
use std::task::Waker;

use slab::Slab;
use smallvec::SmallVec;
use tracing::trace;

use crate::angle::{arcs_overlap, rot_in_range};

/// Whether a request wants shared (read) or exclusive (write) access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    /// Shared access; reads never exclude other reads.
    Read,
    /// Exclusive access within the arc.
    Write,
}

/// Opaque identifier of the execution context that issued a request.
///
/// The manager only ever compares these for equality; the value is chosen by
/// the caller (a thread id, task id, connection id, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(u64);

impl OwnerId {
    /// Wraps a caller-chosen identifier.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw identifier.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One outstanding acquire call. Angle and range are fixed at creation; the
/// only mutable pieces are the `assigned` flag (flipped exactly once, by the
/// admission engine) and the parked waker.
#[derive(Debug)]
pub(crate) struct LockRequest {
    pub(crate) owner: OwnerId,
    pub(crate) degree: i32,
    pub(crate) range: i32,
    pub(crate) kind: LockKind,
    pub(crate) assigned: bool,
    pub(crate) waker: Option<Waker>,
    /// Generation id. Arena keys are reused after removal; a future holds
    /// (key, id) and treats an id mismatch as "my request is gone".
    pub(crate) id: u64,
}

/// Outcome of cancelling a request by (key, id).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CancelOutcome {
    /// No live request under that key/id; nothing to do.
    Missing,
    /// Removed from a waiting bucket.
    Waiting,
    /// Removed from an assigned bucket; the caller must re-run admission so
    /// the freed grant is handed on.
    Assigned,
}

/// What a re-poll of a pending future observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollOutcome {
    /// The request was removed out from under the future (owner cleanup).
    Gone,
    /// Promoted; the lock is held.
    Assigned,
    /// Still waiting; the waker has been refreshed.
    Waiting,
}

/// The four buckets, the request arena and the current rotation.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    rotation: i32,
    requests: Slab<LockRequest>,
    next_id: u64,
    waiting_reads: VecDeque<usize>,
    waiting_writes: VecDeque<usize>,
    assigned_reads: VecDeque<usize>,
    assigned_writes: VecDeque<usize>,
}

/// Wakers collected under the state mutex, to be fired after it is released.
pub(crate) type WakeBatch = SmallVec<[Waker; 4]>;

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn rotation(&self) -> i32 {
        self.rotation
    }

    pub(crate) fn set_rotation(&mut self, degree: i32) {
        self.rotation = degree;
    }

    /// Appends a new waiting request and returns its (key, generation id).
    pub(crate) fn insert_waiting(
        &mut self,
        owner: OwnerId,
        degree: i32,
        range: i32,
        kind: LockKind,
    ) -> (usize, u64) {
        let id = self.next_id;
        self.next_id += 1;
        let key = self.requests.insert(LockRequest {
            owner,
            degree,
            range,
            kind,
            assigned: false,
            waker: None,
            id,
        });
        match kind {
            LockKind::Read => self.waiting_reads.push_back(key),
            LockKind::Write => self.waiting_writes.push_back(key),
        }
        (key, id)
    }

    /// True if the request under `key` has been promoted. An id mismatch
    /// (request replaced) counts as not assigned.
    pub(crate) fn is_assigned(&self, key: usize, id: u64) -> bool {
        self.requests
            .get(key)
            .is_some_and(|r| r.id == id && r.assigned)
    }

    /// True if the current rotation falls inside the arc of `key`.
    pub(crate) fn covers(&self, key: usize) -> bool {
        let req = &self.requests[key];
        rot_in_range(self.rotation, req.degree, req.range)
    }

    /// Re-poll bookkeeping for a pending future: report the request state
    /// and refresh the parked waker while still waiting.
    pub(crate) fn poll_request(&mut self, key: usize, id: u64, waker: &Waker) -> PollOutcome {
        match self.requests.get_mut(key) {
            Some(req) if req.id == id => {
                if req.assigned {
                    PollOutcome::Assigned
                } else {
                    if !req.waker.as_ref().is_some_and(|w| w.will_wake(waker)) {
                        req.waker = Some(waker.clone());
                    }
                    PollOutcome::Waiting
                }
            }
            _ => PollOutcome::Gone,
        }
    }

    /// Parks a waker on a still-waiting request. No-op if the request is
    /// already assigned or gone.
    pub(crate) fn park(&mut self, key: usize, id: u64, waker: &Waker) {
        if let Some(req) = self.requests.get_mut(key) {
            if req.id == id && !req.assigned {
                req.waker = Some(waker.clone());
            }
        }
    }

    /// Removes the request under (key, id) from whichever bucket holds it.
    pub(crate) fn cancel(&mut self, key: usize, id: u64) -> CancelOutcome {
        let was_assigned = match self.requests.get(key) {
            Some(req) if req.id == id => req.assigned,
            _ => return CancelOutcome::Missing,
        };
        self.unlink(key);
        let _ = self.requests.try_remove(key);
        if was_assigned {
            CancelOutcome::Assigned
        } else {
            CancelOutcome::Waiting
        }
    }

    /// Removes the assigned request matching (owner, degree, range, kind).
    /// Returns false (registry unmodified) if there is none.
    pub(crate) fn remove_assigned(
        &mut self,
        owner: OwnerId,
        degree: i32,
        range: i32,
        kind: LockKind,
    ) -> bool {
        let (bucket, requests) = match kind {
            LockKind::Read => (&mut self.assigned_reads, &self.requests),
            LockKind::Write => (&mut self.assigned_writes, &self.requests),
        };
        let pos = bucket.iter().position(|&k| {
            let req = &requests[k];
            req.owner == owner && req.degree == degree && req.range == range
        });
        let Some(pos) = pos else { return false };
        let Some(key) = bucket.remove(pos) else {
            return false;
        };
        let _ = self.requests.try_remove(key);
        true
    }

    /// Removes every request belonging to `owner`, waiting or assigned.
    /// Returns the number removed and the wakers of any still-parked futures
    /// so they can observe the removal.
    pub(crate) fn remove_owner(&mut self, owner: OwnerId) -> (usize, WakeBatch) {
        let keys: Vec<usize> = self
            .requests
            .iter()
            .filter(|(_, req)| req.owner == owner)
            .map(|(key, _)| key)
            .collect();
        let mut wakers = WakeBatch::new();
        for key in &keys {
            self.unlink(*key);
            if let Some(mut req) = self.requests.try_remove(*key) {
                if let Some(waker) = req.waker.take() {
                    wakers.push(waker);
                }
            }
        }
        (keys.len(), wakers)
    }

    pub(crate) fn waiting_len(&self, kind: LockKind) -> usize {
        match kind {
            LockKind::Read => self.waiting_reads.len(),
            LockKind::Write => self.waiting_writes.len(),
        }
    }

    pub(crate) fn assigned_len(&self, kind: LockKind) -> usize {
        match kind {
            LockKind::Read => self.assigned_reads.len(),
            LockKind::Write => self.assigned_writes.len(),
        }
    }

    /// The admission engine. Runs with exclusive access to the registry and
    /// promotes zero or more waiting requests against the current rotation.
    ///
    /// 1. If any assigned write's arc covers the rotation, nothing can be
    ///    promoted this round.
    /// 2. Otherwise the first waiting write (FIFO) whose arc covers the
    ///    rotation is the sole candidate. It is promoted only if its arc
    ///    overlaps no assigned request; if it conflicts, it also blocks all
    ///    reader promotion behind it (writer priority).
    /// 3. With no covering waiting write, every covering waiting read that
    ///    overlaps no assigned write is promoted.
    ///
    /// Returns the promoted count and the wakers to fire once the state
    /// mutex is released.
    pub(crate) fn reassign(&mut self) -> (usize, WakeBatch) {
        let mut wakers = WakeBatch::new();

        if self.assigned_writes.iter().any(|&k| self.covers(k)) {
            return (0, wakers);
        }

        if let Some(pos) = self.waiting_writes.iter().position(|&k| self.covers(k)) {
            let key = self.waiting_writes[pos];
            if !self.writer_conflicts(key) {
                let _ = self.waiting_writes.remove(pos);
                self.assigned_writes.push_back(key);
                let req = &mut self.requests[key];
                req.assigned = true;
                if let Some(waker) = req.waker.take() {
                    wakers.push(waker);
                }
                trace!(
                    owner = %req.owner,
                    degree = req.degree,
                    range = req.range,
                    "write lock assigned"
                );
                return (1, wakers);
            }
            // Writer priority: a blocked candidate also blocks the readers
            // queued behind it.
            return (0, wakers);
        }

        let mut promoted = 0;
        let mut pos = 0;
        while pos < self.waiting_reads.len() {
            let key = self.waiting_reads[pos];
            if self.covers(key) && !self.reader_conflicts(key) {
                let _ = self.waiting_reads.remove(pos);
                self.assigned_reads.push_back(key);
                let req = &mut self.requests[key];
                req.assigned = true;
                if let Some(waker) = req.waker.take() {
                    wakers.push(waker);
                }
                trace!(
                    owner = %req.owner,
                    degree = req.degree,
                    range = req.range,
                    "read lock assigned"
                );
                promoted += 1;
            } else {
                pos += 1;
            }
        }
        (promoted, wakers)
    }

    /// True if the candidate writer's arc overlaps any assigned request.
    fn writer_conflicts(&self, key: usize) -> bool {
        let cand = &self.requests[key];
        self.assigned_reads
            .iter()
            .chain(self.assigned_writes.iter())
            .any(|&held| {
                let req = &self.requests[held];
                arcs_overlap(cand.degree, cand.range, req.degree, req.range)
            })
    }

    /// True if the candidate reader's arc overlaps any assigned write.
    fn reader_conflicts(&self, key: usize) -> bool {
        let cand = &self.requests[key];
        self.assigned_writes.iter().any(|&held| {
            let req = &self.requests[held];
            arcs_overlap(cand.degree, cand.range, req.degree, req.range)
        })
    }

    /// Detaches `key` from the one bucket its kind and assigned flag place
    /// it in. The request must be live.
    fn unlink(&mut self, key: usize) {
        let (kind, assigned) = {
            let req = &self.requests[key];
            (req.kind, req.assigned)
        };
        let bucket = match (kind, assigned) {
            (LockKind::Read, false) => &mut self.waiting_reads,
            (LockKind::Read, true) => &mut self.assigned_reads,
            (LockKind::Write, false) => &mut self.waiting_writes,
            (LockKind::Write, true) => &mut self.assigned_writes,
        };
        if let Some(pos) = bucket.iter().position(|&k| k == key) {
            let _ = bucket.remove(pos);
        }
    }
}
