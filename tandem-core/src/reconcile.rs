//! Element-by-element reconciliation of a remote scene into the local one.
//!
//! For every id in either input exactly one copy survives:
//!
//! 1. present only locally → local copy (it has not round-tripped yet);
//! 2. present only remotely → remote copy;
//! 3. higher `version` wins;
//! 4. equal `version` → lower `version_nonce` wins;
//! 5. equal nonce → later `updated` wins, then the local copy is kept.
//!
//! Tombstones are ordinary content and are never purged. The lower-nonce rule
//! is shared by every peer so that independent replicas pick the same winner
//! without exchanging any extra metadata.

use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::element::{Element, MAX_VERSION};

/// Result of decoding a raw remote payload.
#[derive(Debug, Clone, Default)]
pub struct DecodedElements {
    pub elements: Vec<Element>,
    /// Entries dropped because they were not valid elements.
    pub dropped: usize,
}

/// Decode remote elements one by one, dropping malformed entries.
///
/// A missing or empty id, a non-numeric version, a version above
/// [`MAX_VERSION`] or any other type mismatch only discards that entry.
pub fn decode_remote_elements(raw: Vec<Value>) -> DecodedElements {
    let mut decoded = DecodedElements {
        elements: Vec::with_capacity(raw.len()),
        dropped: 0,
    };
    for value in raw {
        match serde_json::from_value::<Element>(value) {
            Ok(element) if !element.id.is_empty() && element.version <= MAX_VERSION => {
                decoded.elements.push(element)
            }
            Ok(_) => decoded.dropped += 1,
            Err(e) => {
                log::debug!("Dropping malformed remote element: {e}");
                decoded.dropped += 1;
            }
        }
    }
    if decoded.dropped > 0 {
        log::warn!("Dropped {} malformed remote elements", decoded.dropped);
    }
    decoded
}

/// Precedence between two copies of the same element.
///
/// `Greater` means `a` should win over `b`.
pub fn compare_precedence(a: &Element, b: &Element) -> Ordering {
    a.version
        .cmp(&b.version)
        .then_with(|| b.version_nonce.cmp(&a.version_nonce))
        .then_with(|| a.updated.cmp(&b.updated))
}

#[inline]
fn wins(candidate: &Element, incumbent: &Element) -> bool {
    compare_precedence(candidate, incumbent) == Ordering::Greater
}

/// Merge `remote` into `local`.
///
/// Output follows the remote ordering, with local-only elements appended in
/// their previous relative order. Neither input is modified.
pub fn reconcile(local: &[Element], remote: &[Element]) -> Vec<Element> {
    let mut best_local: HashMap<&str, &Element> = HashMap::with_capacity(local.len());
    for element in local {
        best_local
            .entry(element.id.as_str())
            .and_modify(|current| {
                if wins(element, current) {
                    *current = element;
                }
            })
            .or_insert(element);
    }

    let mut merged: Vec<Element> = Vec::with_capacity(local.len().max(remote.len()));
    let mut slots: HashMap<&str, usize> = HashMap::with_capacity(merged.capacity());

    for remote_el in remote {
        if let Some(&i) = slots.get(remote_el.id.as_str()) {
            // Repeated id inside the remote payload.
            if wins(remote_el, &merged[i]) {
                merged[i] = remote_el.clone();
            }
            continue;
        }
        let winner = match best_local.get(remote_el.id.as_str()) {
            Some(local_el) if !wins(remote_el, local_el) => *local_el,
            _ => remote_el,
        };
        slots.insert(remote_el.id.as_str(), merged.len());
        merged.push(winner.clone());
    }

    for local_el in local {
        if slots.contains_key(local_el.id.as_str()) {
            continue;
        }
        let best = best_local
            .get(local_el.id.as_str())
            .copied()
            .unwrap_or(local_el);
        slots.insert(local_el.id.as_str(), merged.len());
        merged.push(best.clone());
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::scene_version;
    use serde_json::json;

    fn el(id: &str, version: u64, nonce: i64) -> Element {
        let mut e = Element::new(id);
        e.version = version;
        e.version_nonce = nonce;
        e.updated = 1_000;
        e
    }

    fn ids(elements: &[Element]) -> Vec<&str> {
        elements.iter().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn test_equal_version_lower_nonce_wins() {
        let local = vec![el("e1", 3, 7).with_prop("side", "local")];
        let remote = vec![el("e1", 3, 5).with_prop("side", "remote")];
        let merged = reconcile(&local, &remote);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].props["side"], "remote");
        assert_eq!(merged[0].version_nonce, 5);
    }

    #[test]
    fn test_union_of_ids() {
        let local = vec![el("e1", 1, 0), el("e2", 1, 0)];
        let remote = vec![el("e1", 2, 0), el("e3", 1, 0)];
        let merged = reconcile(&local, &remote);
        assert_eq!(ids(&merged), vec!["e1", "e3", "e2"]);
        assert_eq!(merged[0].version, 2);
        assert_eq!(merged[1].version, 1);
        assert_eq!(merged[2].version, 1);
    }

    #[test]
    fn test_higher_version_wins_regardless_of_nonce() {
        let local = vec![el("a", 4, 1)];
        let remote = vec![el("a", 3, 0)];
        let merged = reconcile(&local, &remote);
        assert_eq!(merged[0].version, 4);
    }

    #[test]
    fn test_tombstone_with_higher_version_wins() {
        let local = vec![el("a", 2, 0)];
        let mut deleted = el("a", 3, 9);
        deleted.is_deleted = true;
        let merged = reconcile(&local, &[deleted]);
        assert_eq!(merged.len(), 1);
        assert!(merged[0].is_deleted);

        // Older tombstone loses to a live element.
        let mut old_tombstone = el("b", 1, 0);
        old_tombstone.is_deleted = true;
        let merged = reconcile(&[el("b", 2, 0)], &[old_tombstone]);
        assert!(!merged[0].is_deleted);
    }

    #[test]
    fn test_updated_breaks_full_tie_then_local_kept() {
        let mut local = el("a", 1, 1).with_prop("side", "local");
        let mut remote = el("a", 1, 1).with_prop("side", "remote");
        local.updated = 10;
        remote.updated = 20;
        let merged = reconcile(&[local.clone()], &[remote.clone()]);
        assert_eq!(merged[0].props["side"], "remote");

        remote.updated = 10;
        let merged = reconcile(&[local], &[remote]);
        assert_eq!(merged[0].props["side"], "local");
    }

    #[test]
    fn test_remote_order_is_base() {
        let local = vec![el("a", 1, 0), el("l1", 1, 0), el("b", 1, 0), el("l2", 1, 0)];
        let remote = vec![el("b", 1, 0), el("a", 1, 0)];
        let merged = reconcile(&local, &remote);
        assert_eq!(ids(&merged), vec!["b", "a", "l1", "l2"]);
    }

    #[test]
    fn test_repeated_ids_collapse() {
        let remote = vec![el("a", 1, 0), el("a", 5, 0), el("a", 2, 0)];
        let merged = reconcile(&[], &remote);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].version, 5);

        let local = vec![el("b", 1, 0), el("b", 3, 0)];
        let merged = reconcile(&local, &[]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].version, 3);
    }

    #[test]
    fn test_inputs_untouched() {
        let local = vec![el("a", 1, 0)];
        let remote = vec![el("a", 2, 0)];
        let _ = reconcile(&local, &remote);
        assert_eq!(local[0].version, 1);
        assert_eq!(remote[0].version, 2);
    }

    #[test]
    fn test_idempotent() {
        let local = vec![el("a", 1, 3), el("b", 2, 1), el("c", 1, 0)];
        let remote = vec![el("b", 2, 0), el("a", 2, 9), el("d", 1, 4)];
        let once = reconcile(&local, &remote);
        let twice = reconcile(&once, &remote);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_winner_is_symmetric() {
        let side_a = vec![el("a", 1, 3), el("b", 2, 1), el("c", 4, 0), el("d", 1, 8)];
        let side_b = vec![el("b", 2, 0), el("a", 2, 9), el("c", 4, 2), el("e", 1, 4)];

        let ab = reconcile(&side_a, &side_b);
        let ba = reconcile(&side_b, &side_a);

        let mut ab_sorted = ab.clone();
        let mut ba_sorted = ba.clone();
        ab_sorted.sort_by(|x, y| x.id.cmp(&y.id));
        ba_sorted.sort_by(|x, y| x.id.cmp(&y.id));
        assert_eq!(ab_sorted, ba_sorted);
        assert_eq!(scene_version(&ab), scene_version(&ba));
    }

    #[test]
    fn test_decode_drops_malformed_entries() {
        let raw = vec![
            json!({"id": "ok", "version": 2, "versionNonce": 1}),
            json!({"version": 2, "versionNonce": 1}),
            json!({"id": "bad-version", "version": "two"}),
            json!({"id": "", "version": 1}),
            json!("not an object"),
            json!({"id": "ok2", "version": 1}),
        ];
        let decoded = decode_remote_elements(raw);
        assert_eq!(ids(&decoded.elements), vec!["ok", "ok2"]);
        assert_eq!(decoded.dropped, 4);
    }

    #[test]
    fn test_decode_drops_oversized_versions() {
        let decoded = decode_remote_elements(vec![
            json!({"id": "a", "version": u64::MAX}),
            json!({"id": "b", "version": MAX_VERSION + 1}),
            json!({"id": "c", "version": MAX_VERSION}),
        ]);
        assert_eq!(ids(&decoded.elements), vec!["c"]);
        assert_eq!(decoded.dropped, 2);

        // What survives can still be edited locally.
        let mut store = crate::ElementStore::from_elements(reconcile(&[], &decoded.elements));
        store.mutate("c", |_| {}).unwrap();
        assert_eq!(store.get("c").unwrap().version, MAX_VERSION);
    }

    #[test]
    fn test_reconcile_after_partial_decode() {
        let local = vec![el("a", 1, 0)];
        let decoded = decode_remote_elements(vec![
            json!({"id": "a", "version": 3, "versionNonce": 0}),
            json!({"id": 17, "version": 1}),
        ]);
        let merged = reconcile(&local, &decoded.elements);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].version, 3);
    }
}
