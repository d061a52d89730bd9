//! Circular interval arithmetic on the 0-360 degree rotation domain.
//!
//! All functions here are pure. Angles are integer degrees; arcs are given as
//! a center angle plus a half-width, so an arc `(angle, range)` spans
//! `[angle - range, angle + range]` on the circle. Differences are normalized
//! into `[0, 180]` before any comparison, which is what makes 350 degrees and
//! 10 degrees come out 20 apart rather than 340.

/// Returns true if `degree` lies in the valid rotation domain `[0, 360)`.
#[inline]
#[must_use]
pub fn degree_valid(degree: i32) -> bool {
    (0..360).contains(&degree)
}

/// Returns true if `range` is a valid arc half-width, i.e. in `(0, 180)`.
///
/// A half-width of 180 or more would wrap the arc over the whole circle, and
/// zero would make it degenerate.
#[inline]
#[must_use]
pub fn range_valid(range: i32) -> bool {
    (1..180).contains(&range)
}

/// Circular distance between two angles: the shorter of the clockwise and
/// counter-clockwise differences. Always in `[0, 180]`.
#[inline]
#[must_use]
pub fn circular_distance(a: i32, b: i32) -> i32 {
    let diff = (a - b).rem_euclid(360);
    diff.min(360 - diff)
}

/// Returns true if the current `rotation` falls inside the arc centered at
/// `angle` with half-width `range`.
#[inline]
#[must_use]
pub fn rot_in_range(rotation: i32, angle: i32, range: i32) -> bool {
    circular_distance(rotation, angle) <= range
}

/// Returns true if the two arcs share at least one point on the circle.
#[inline]
#[must_use]
pub fn arcs_overlap(angle1: i32, range1: i32, angle2: i32, range2: i32) -> bool {
    circular_distance(angle1, angle2) <= range1 + range2
}
