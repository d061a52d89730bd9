//! Reader/writer locks keyed on arcs of the circular rotation domain.
//!
//! A device reports an orientation angle in `[0, 360)`. Callers lock not an
//! object but an *arc* of that circle, given as a center degree and a
//! half-width; a request is granted only while the current rotation falls
//! inside its arc and the grant does not conflict with other holders. Reads
//! share, writes exclude, and exclusion is scoped to overlapping arcs: a
//! read at `0 +/- 10` and a write at `180 +/- 10` can be held concurrently.
//!
//! # Admission policy
//!
//! Admission runs after every mutation (acquire, release, rotation change,
//! owner cleanup):
//!
//! - An assigned writer whose arc covers the rotation blocks all promotion.
//! - Otherwise the first waiting writer (FIFO) covering the rotation is the
//!   sole candidate; while it conflicts with a holder it also blocks the
//!   readers queued behind it, so writers cannot starve under read load.
//! - With no covering waiting writer, every covering waiting reader that
//!   overlaps no assigned writer is promoted at once.
//!
//! # Blocking and cancellation
//!
//! Acquisition is a future: poll it from any executor, or drive it with a
//! block_on of your choice. Promotion wakes exactly the promoted requests.
//! Dropping a pending future cancels the request cleanly; a grant that
//! raced the drop is handed to the next eligible waiter. There is no
//! built-in timeout: race the future against a timer and drop it.
//!
//! Owners are opaque [`OwnerId`] values chosen by the caller. When an
//! owning context dies without releasing its locks, the surrounding runtime
//! calls [`RotationLock::cleanup_owner`], which removes everything the
//! owner had registered and re-runs admission so nothing stays wedged.
//!
//! # Example
//!
//! ```
//! use rotlock::{LockKind, OwnerId, RotationLock};
//!
//! let lock = RotationLock::new();
//! let camera = OwnerId::new(1);
//!
//! // Rotation starts at 0, inside the requested arc [345, 15].
//! futures_lite::future::block_on(lock.lock_write(camera, 0, 15)).unwrap();
//! assert_eq!(lock.assigned_len(LockKind::Write), 1);
//!
//! lock.unlock_write(camera, 0, 15).unwrap();
//! assert_eq!(lock.assigned_len(LockKind::Write), 0);
//! ```

pub mod angle;
pub mod error;
mod manager;
mod registry;

pub use error::{ArgumentError, LockError, TryLockError, UnlockError};
pub use manager::{LockFuture, RotationLock};
pub use registry::{LockKind, OwnerId};
