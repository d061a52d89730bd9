//! The lock service: acquisition futures, release, rotation updates and
//! owner cleanup.
//!
//! [`RotationLock`] owns the registry behind a single `parking_lot::Mutex`.
//! Every operation takes the mutex, mutates the registry, runs the admission
//! engine if the mutation could change admissibility, and fires the promoted
//! requests' wakers only after the mutex has been released.
//!
//! # Cancel safety
//!
//! [`lock_read`](RotationLock::lock_read) and
//! [`lock_write`](RotationLock::lock_write) are cancel-safe. Dropping the
//! future while it is pending removes the request from its waiting bucket.
//! If a promotion raced the drop, the grant is released and admission re-run
//! so it is handed to the next eligible waiter instead of being lost. Once
//! the future has resolved, the lock is held until a matching
//! [`unlock_read`](RotationLock::unlock_read) /
//! [`unlock_write`](RotationLock::unlock_write) or
//! [`cleanup_owner`](RotationLock::cleanup_owner).

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::angle::{degree_valid, range_valid};
use crate::error::{ArgumentError, LockError, TryLockError, UnlockError};
use crate::registry::{CancelOutcome, LockKind, OwnerId, PollOutcome, Registry, WakeBatch};

fn check_args(degree: i32, range: i32) -> Result<(), ArgumentError> {
    if !degree_valid(degree) {
        return Err(ArgumentError::Degree(degree));
    }
    if !range_valid(range) {
        return Err(ArgumentError::Range(range));
    }
    Ok(())
}

/// Reader/writer lock manager over arcs of the rotation domain.
///
/// A request names an arc (center degree, half-width) and is granted only
/// while admissible against the current rotation and the other holders:
///
/// | Scenario                                   | Behavior                      |
/// |--------------------------------------------|-------------------------------|
/// | Assigned writer covers the rotation        | Nobody else is admitted       |
/// | Waiting writer covers the rotation         | Blocks readers queued behind it |
/// | Overlapping writer assigned (anywhere)     | Readers on that arc wait      |
/// | Disjoint arcs                              | Proceed independently         |
/// | Same-kind conflicting requests             | Admitted in FIFO order        |
///
/// The state is purely in-memory and process-lifetime; a fresh manager
/// starts at rotation 0 with empty buckets. Multiple independent managers
/// can coexist (useful in tests).
#[derive(Debug, Default)]
pub struct RotationLock {
    state: Mutex<Registry>,
}

impl RotationLock {
    /// Creates an empty manager at rotation 0.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Registry::new()),
        }
    }

    /// Returns the current rotation in degrees.
    #[must_use]
    pub fn rotation(&self) -> i32 {
        self.state.lock().rotation()
    }

    /// Updates the device rotation and re-runs admission against the new
    /// angle. Returns the number of requests promoted.
    pub fn set_rotation(&self, degree: i32) -> Result<usize, ArgumentError> {
        if !degree_valid(degree) {
            return Err(ArgumentError::Degree(degree));
        }
        let (promoted, wakers) = {
            let mut reg = self.state.lock();
            reg.set_rotation(degree);
            reg.reassign()
        };
        trace!(degree, promoted, "rotation updated");
        wake_all(wakers);
        Ok(promoted)
    }

    /// Acquires a read lock on the arc, waiting until it is admitted.
    pub fn lock_read(&self, owner: OwnerId, degree: i32, range: i32) -> LockFuture<'_> {
        self.lock(owner, degree, range, LockKind::Read)
    }

    /// Acquires a write lock on the arc, waiting until it is admitted.
    pub fn lock_write(&self, owner: OwnerId, degree: i32, range: i32) -> LockFuture<'_> {
        self.lock(owner, degree, range, LockKind::Write)
    }

    fn lock(&self, owner: OwnerId, degree: i32, range: i32, kind: LockKind) -> LockFuture<'_> {
        LockFuture {
            lock: self,
            owner,
            degree,
            range,
            kind,
            slot: None,
            completed: false,
        }
    }

    /// Acquires a read lock only if it is admissible right now; never
    /// enqueues or waits.
    pub fn try_lock_read(
        &self,
        owner: OwnerId,
        degree: i32,
        range: i32,
    ) -> Result<(), TryLockError> {
        self.try_lock(owner, degree, range, LockKind::Read)
    }

    /// Acquires a write lock only if it is admissible right now; never
    /// enqueues or waits.
    pub fn try_lock_write(
        &self,
        owner: OwnerId,
        degree: i32,
        range: i32,
    ) -> Result<(), TryLockError> {
        self.try_lock(owner, degree, range, LockKind::Write)
    }

    fn try_lock(
        &self,
        owner: OwnerId,
        degree: i32,
        range: i32,
        kind: LockKind,
    ) -> Result<(), TryLockError> {
        check_args(degree, range)?;
        let (granted, wakers) = {
            let mut reg = self.state.lock();
            let (key, id) = reg.insert_waiting(owner, degree, range, kind);
            let mut wakers = WakeBatch::new();
            if reg.covers(key) {
                wakers = reg.reassign().1;
            }
            let granted = reg.is_assigned(key, id);
            if !granted {
                reg.cancel(key, id);
            }
            (granted, wakers)
        };
        wake_all(wakers);
        if granted {
            Ok(())
        } else {
            Err(TryLockError::Contended)
        }
    }

    /// Releases the read lock previously granted for exactly this
    /// (owner, degree, range) triple.
    pub fn unlock_read(&self, owner: OwnerId, degree: i32, range: i32) -> Result<(), UnlockError> {
        self.unlock(owner, degree, range, LockKind::Read)
    }

    /// Releases the write lock previously granted for exactly this
    /// (owner, degree, range) triple.
    pub fn unlock_write(&self, owner: OwnerId, degree: i32, range: i32) -> Result<(), UnlockError> {
        self.unlock(owner, degree, range, LockKind::Write)
    }

    fn unlock(
        &self,
        owner: OwnerId,
        degree: i32,
        range: i32,
        kind: LockKind,
    ) -> Result<(), UnlockError> {
        check_args(degree, range)?;
        let wakers = {
            let mut reg = self.state.lock();
            if !reg.remove_assigned(owner, degree, range, kind) {
                return Err(UnlockError::NotFound);
            }
            reg.reassign().1
        };
        trace!(%owner, degree, range, ?kind, "lock released");
        wake_all(wakers);
        Ok(())
    }

    /// Forcibly removes every request belonging to `owner`, waiting or
    /// assigned, and re-runs admission if anything was removed. Returns the
    /// number of requests removed.
    ///
    /// This is the hook the surrounding runtime invokes when an owning
    /// context terminates without releasing its locks. Safe to call for an
    /// owner with nothing registered; pending futures of removed requests
    /// resolve to [`LockError::Cancelled`].
    pub fn cleanup_owner(&self, owner: OwnerId) -> usize {
        let (removed, wakers) = {
            let mut reg = self.state.lock();
            let (removed, mut wakers) = reg.remove_owner(owner);
            if removed > 0 {
                wakers.extend(reg.reassign().1);
            }
            (removed, wakers)
        };
        if removed > 0 {
            debug!(%owner, removed, "owner cleaned up");
        }
        wake_all(wakers);
        removed
    }

    /// Number of requests currently waiting for the given kind.
    #[must_use]
    pub fn waiting_len(&self, kind: LockKind) -> usize {
        self.state.lock().waiting_len(kind)
    }

    /// Number of requests currently holding a lock of the given kind.
    #[must_use]
    pub fn assigned_len(&self, kind: LockKind) -> usize {
        self.state.lock().assigned_len(kind)
    }
}

fn wake_all(wakers: WakeBatch) {
    for waker in wakers {
        waker.wake();
    }
}

/// Future returned by [`RotationLock::lock_read`] and
/// [`RotationLock::lock_write`].
///
/// The request is enqueued on first poll; subsequent polls re-check the
/// assigned flag (spurious wakeups are harmless) and refresh the parked
/// waker. Dropping the future before completion cancels the request.
#[must_use = "futures do nothing unless polled"]
pub struct LockFuture<'a> {
    lock: &'a RotationLock,
    owner: OwnerId,
    degree: i32,
    range: i32,
    kind: LockKind,
    slot: Option<(usize, u64)>,
    completed: bool,
}

impl Future for LockFuture<'_> {
    type Output = Result<(), LockError>;

    fn poll(mut self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match this.slot {
            None => {
                if let Err(e) = check_args(this.degree, this.range) {
                    this.completed = true;
                    return Poll::Ready(Err(LockError::InvalidArgument(e)));
                }
                let (granted, wakers) = {
                    let mut reg = this.lock.state.lock();
                    let (key, id) =
                        reg.insert_waiting(this.owner, this.degree, this.range, this.kind);
                    let mut wakers = WakeBatch::new();
                    if reg.covers(key) {
                        wakers = reg.reassign().1;
                    }
                    let granted = reg.is_assigned(key, id);
                    if !granted {
                        reg.park(key, id, context.waker());
                    }
                    this.slot = Some((key, id));
                    (granted, wakers)
                };
                wake_all(wakers);
                if granted {
                    this.completed = true;
                    Poll::Ready(Ok(()))
                } else {
                    Poll::Pending
                }
            }
            Some((key, id)) => {
                let outcome = this
                    .lock
                    .state
                    .lock()
                    .poll_request(key, id, context.waker());
                match outcome {
                    PollOutcome::Assigned => {
                        this.completed = true;
                        Poll::Ready(Ok(()))
                    }
                    PollOutcome::Gone => {
                        this.completed = true;
                        Poll::Ready(Err(LockError::Cancelled))
                    }
                    PollOutcome::Waiting => Poll::Pending,
                }
            }
        }
    }
}

impl Drop for LockFuture<'_> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        let Some((key, id)) = self.slot else { return };
        let wakers = {
            let mut reg = self.lock.state.lock();
            match reg.cancel(key, id) {
                // Promotion raced the drop: hand the grant on.
                CancelOutcome::Assigned => reg.reassign().1,
                CancelOutcome::Waiting | CancelOutcome::Missing => WakeBatch::new(),
            }
        };
        wake_all(wakers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::{Wake, Waker};

    const A: OwnerId = OwnerId::new(1);
    const B: OwnerId = OwnerId::new(2);
    const C: OwnerId = OwnerId::new(3);

    fn poll_once<T, F>(future: &mut F) -> Option<T>
    where
        F: Future<Output = T> + Unpin,
    {
        let waker = Waker::noop();
        let mut cx = Context::from_waker(waker);
        match Pin::new(future).poll(&mut cx) {
            Poll::Ready(v) => Some(v),
            Poll::Pending => None,
        }
    }

    fn poll_once_with_waker<T, F>(future: &mut F, waker: &Waker) -> Option<T>
    where
        F: Future<Output = T> + Unpin,
    {
        let mut cx = Context::from_waker(waker);
        match Pin::new(future).poll(&mut cx) {
            Poll::Ready(v) => Some(v),
            Poll::Pending => None,
        }
    }

    #[derive(Debug, Default)]
    struct CountingWaker(AtomicUsize);

    impl CountingWaker {
        fn count(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }

        fn wake_by_ref(self: &Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn immediate_grant_on_empty_registry() {
        let lock = RotationLock::new();
        let mut fut = lock.lock_write(A, 0, 10);
        assert_eq!(poll_once(&mut fut), Some(Ok(())));
        assert_eq!(lock.assigned_len(LockKind::Write), 1);
    }

    #[test]
    fn invalid_arguments_never_enqueue() {
        let lock = RotationLock::new();
        let mut fut = lock.lock_read(A, 360, 10);
        assert_eq!(
            poll_once(&mut fut),
            Some(Err(LockError::InvalidArgument(ArgumentError::Degree(360))))
        );
        let mut fut = lock.lock_read(A, 0, 180);
        assert_eq!(
            poll_once(&mut fut),
            Some(Err(LockError::InvalidArgument(ArgumentError::Range(180))))
        );
        assert_eq!(lock.waiting_len(LockKind::Read), 0);

        assert_eq!(lock.set_rotation(-1), Err(ArgumentError::Degree(-1)));
        assert_eq!(
            lock.unlock_read(A, 0, 0),
            Err(UnlockError::InvalidArgument(ArgumentError::Range(0)))
        );
    }

    #[test]
    fn non_covering_request_waits_without_reassign() {
        let lock = RotationLock::new();
        let mut fut = lock.lock_read(A, 180, 10);
        assert_eq!(poll_once(&mut fut), None);
        assert_eq!(lock.waiting_len(LockKind::Read), 1);
        assert_eq!(lock.set_rotation(180), Ok(1));
        assert_eq!(poll_once(&mut fut), Some(Ok(())));
    }

    #[test]
    fn overlapping_reader_waits_for_writer_release() {
        let lock = RotationLock::new();
        assert_eq!(poll_once(&mut lock.lock_write(A, 0, 10)), Some(Ok(())));

        let counter = Arc::new(CountingWaker::default());
        let waker = Waker::from(Arc::clone(&counter));
        let mut reader = lock.lock_read(B, 0, 10);
        assert_eq!(poll_once_with_waker(&mut reader, &waker), None);
        assert_eq!(counter.count(), 0);

        lock.unlock_write(A, 0, 10).unwrap();
        assert_eq!(counter.count(), 1);
        assert_eq!(poll_once(&mut reader), Some(Ok(())));
        assert_eq!(lock.assigned_len(LockKind::Read), 1);
    }

    #[test]
    fn wakeups_are_targeted_at_promoted_requests() {
        let lock = RotationLock::new();
        assert_eq!(poll_once(&mut lock.lock_write(A, 0, 10)), Some(Ok(())));

        let covering = Arc::new(CountingWaker::default());
        let far = Arc::new(CountingWaker::default());
        let mut covering_reader = lock.lock_read(B, 0, 10);
        let mut far_reader = lock.lock_read(C, 180, 10);
        assert_eq!(
            poll_once_with_waker(&mut covering_reader, &Waker::from(Arc::clone(&covering))),
            None
        );
        assert_eq!(
            poll_once_with_waker(&mut far_reader, &Waker::from(Arc::clone(&far))),
            None
        );

        lock.unlock_write(A, 0, 10).unwrap();
        assert_eq!(covering.count(), 1);
        assert_eq!(far.count(), 0);
        assert_eq!(poll_once(&mut covering_reader), Some(Ok(())));
        assert_eq!(poll_once(&mut far_reader), None);
    }

    #[test]
    fn dropping_pending_future_dequeues_request() {
        let lock = RotationLock::new();
        assert_eq!(poll_once(&mut lock.lock_write(A, 0, 10)), Some(Ok(())));

        let mut reader = lock.lock_read(B, 0, 10);
        assert_eq!(poll_once(&mut reader), None);
        assert_eq!(lock.waiting_len(LockKind::Read), 1);
        drop(reader);
        assert_eq!(lock.waiting_len(LockKind::Read), 0);
    }

    #[test]
    fn promotion_racing_drop_hands_grant_on() {
        let lock = RotationLock::new();
        assert_eq!(poll_once(&mut lock.lock_write(A, 0, 10)), Some(Ok(())));

        let mut writer = lock.lock_write(B, 0, 5);
        assert_eq!(poll_once(&mut writer), None);
        let reader_count = Arc::new(CountingWaker::default());
        let mut reader = lock.lock_read(C, 0, 5);
        assert_eq!(
            poll_once_with_waker(&mut reader, &Waker::from(Arc::clone(&reader_count))),
            None
        );

        // B is promoted by the release but its future is dropped before it
        // ever observes the grant.
        lock.unlock_write(A, 0, 10).unwrap();
        assert_eq!(lock.assigned_len(LockKind::Write), 1);
        drop(writer);

        assert_eq!(lock.assigned_len(LockKind::Write), 0);
        assert_eq!(reader_count.count(), 1);
        assert_eq!(poll_once(&mut reader), Some(Ok(())));
    }

    #[test]
    fn cleanup_cancels_pending_future() {
        let lock = RotationLock::new();
        assert_eq!(poll_once(&mut lock.lock_write(A, 0, 10)), Some(Ok(())));

        let mut reader = lock.lock_read(B, 0, 10);
        assert_eq!(poll_once(&mut reader), None);
        assert_eq!(lock.cleanup_owner(B), 1);
        assert_eq!(poll_once(&mut reader), Some(Err(LockError::Cancelled)));
        assert_eq!(lock.waiting_len(LockKind::Read), 0);
    }

    #[test]
    fn cleanup_releases_assigned_locks_and_promotes() {
        let lock = RotationLock::new();
        assert_eq!(poll_once(&mut lock.lock_write(A, 0, 10)), Some(Ok(())));

        let mut reader = lock.lock_read(B, 0, 10);
        assert_eq!(poll_once(&mut reader), None);

        assert_eq!(lock.cleanup_owner(A), 1);
        assert_eq!(poll_once(&mut reader), Some(Ok(())));
        // Cleanup of an owner with nothing registered is a no-op.
        assert_eq!(lock.cleanup_owner(A), 0);
    }

    #[test]
    fn try_lock_never_enqueues() {
        let lock = RotationLock::new();
        assert_eq!(lock.try_lock_write(A, 0, 10), Ok(()));
        assert_eq!(lock.try_lock_read(B, 0, 10), Err(TryLockError::Contended));
        assert_eq!(lock.waiting_len(LockKind::Read), 0);

        // Disjoint arc is not admissible either: it does not cover the
        // current rotation.
        assert_eq!(
            lock.try_lock_read(B, 180, 10),
            Err(TryLockError::Contended)
        );

        lock.unlock_write(A, 0, 10).unwrap();
        assert_eq!(lock.try_lock_read(B, 0, 10), Ok(()));
        assert_eq!(
            lock.try_lock_write(C, 5, 10),
            Err(TryLockError::Contended)
        );
        assert_eq!(
            lock.try_lock_write(C, 0, 0),
            Err(TryLockError::InvalidArgument(ArgumentError::Range(0)))
        );
    }

    #[test]
    fn unlock_requires_exact_triple() {
        let lock = RotationLock::new();
        assert_eq!(poll_once(&mut lock.lock_write(A, 0, 10)), Some(Ok(())));

        assert_eq!(lock.unlock_write(A, 0, 11), Err(UnlockError::NotFound));
        assert_eq!(lock.unlock_write(B, 0, 10), Err(UnlockError::NotFound));
        assert_eq!(lock.unlock_read(A, 0, 10), Err(UnlockError::NotFound));
        assert_eq!(lock.unlock_write(A, 0, 10), Ok(()));
        assert_eq!(lock.unlock_write(A, 0, 10), Err(UnlockError::NotFound));
    }

    #[test]
    fn set_rotation_reports_promoted_count() {
        let lock = RotationLock::new();
        let mut r1 = lock.lock_read(A, 90, 5);
        let mut r2 = lock.lock_read(B, 90, 10);
        let mut w = lock.lock_write(C, 270, 10);
        assert_eq!(poll_once(&mut r1), None);
        assert_eq!(poll_once(&mut r2), None);
        assert_eq!(poll_once(&mut w), None);

        assert_eq!(lock.set_rotation(90), Ok(2));
        assert_eq!(poll_once(&mut r1), Some(Ok(())));
        assert_eq!(poll_once(&mut r2), Some(Ok(())));
        assert_eq!(poll_once(&mut w), None);

        assert_eq!(lock.set_rotation(270), Ok(1));
        assert_eq!(poll_once(&mut w), Some(Ok(())));
        assert_eq!(lock.rotation(), 270);
    }

    #[test]
    fn spurious_poll_keeps_waiting() {
        let lock = RotationLock::new();
        assert_eq!(poll_once(&mut lock.lock_write(A, 0, 10)), Some(Ok(())));
        let mut reader = lock.lock_read(B, 0, 10);
        for _ in 0..3 {
            assert_eq!(poll_once(&mut reader), None);
        }
        assert_eq!(lock.waiting_len(LockKind::Read), 1);
        lock.unlock_write(A, 0, 10).unwrap();
        assert_eq!(poll_once(&mut reader), Some(Ok(())));
    }
}
