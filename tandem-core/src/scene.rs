//! Scene versioning.
//!
//! A scene version is a fingerprint over the `(id, version)` pairs of a set of
//! elements. Iteration order and every other element field are ignored, so
//! two scenes that hold the same elements at the same versions always agree.
//!
//! The fingerprint is a local value: it decides whether a local or received
//! scene has already been seen and is never sent over the wire.

use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::element::Element;

/// Order-independent scene fingerprint.
///
/// `sum` is the total of element versions and only grows while the element
/// store rejects regressions. `digest` is a commutative fold of per-pair
/// hashes, which tells apart scenes whose version totals happen to match.
/// Ordering is lexicographic over `(sum, digest)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct SceneVersion {
    pub sum: u64,
    pub digest: u64,
}

impl SceneVersion {
    pub const EMPTY: SceneVersion = SceneVersion { sum: 0, digest: 0 };

    /// Whether this version is newer than the last broadcast/received marker.
    /// An unset marker is superseded by anything.
    pub fn supersedes(&self, marker: Option<SceneVersion>) -> bool {
        marker.map_or(true, |m| *self > m)
    }
}

impl fmt::Display for SceneVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:016x}", self.sum, self.digest)
    }
}

/// Compute the scene version of a set of elements, tombstones included.
pub fn scene_version<'a, I>(elements: I) -> SceneVersion
where
    I: IntoIterator<Item = &'a Element>,
{
    elements
        .into_iter()
        .fold(SceneVersion::EMPTY, |acc, e| SceneVersion {
            sum: acc.sum.saturating_add(e.version),
            digest: acc.digest.wrapping_add(pair_hash(&e.id, e.version)),
        })
}

#[inline]
fn pair_hash(id: &str, version: u64) -> u64 {
    let mut hasher = FxHasher::default();
    id.hash(&mut hasher);
    version.hash(&mut hasher);
    hasher.finish()
}
