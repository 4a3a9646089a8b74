//! Deterministic merge of two element collections.
//!
//! Every peer runs the same merge over the same inputs, which is what keeps
//! independently running clients converging without an arbiter. The merge is
//! pure: inputs are borrowed, nothing is logged or mutated.
//!
//! # Ordering
//!
//! Local order is the backbone. Elements where the remote side wins are
//! placed after their nearest preceding remote neighbor that is already in the
//! output, otherwise before the nearest following one, otherwise at the end.
//! The result is deterministic, but concurrent inserts at the same spot are
//! not guaranteed to land in the same visual order on every peer.

use crate::element::{Element, ElementId, pick_version};
use std::collections::{HashMap, HashSet};

/// Local state that influences the merge.
#[derive(Debug, Clone, Default)]
pub struct ReconcileContext {
    /// Elements the local user is actively editing. Remote versions of these
    /// are discarded so an in-progress drag or text edit is not yanked away.
    pub editing_element_ids: HashSet<ElementId>,
}

impl ReconcileContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn editing(ids: impl IntoIterator<Item = ElementId>) -> Self {
        Self {
            editing_element_ids: ids.into_iter().collect(),
        }
    }
}

/// Whether the local element should be kept over the remote one.
fn should_discard_remote(local: &Element, remote: &Element, ctx: &ReconcileContext) -> bool {
    if ctx.editing_element_ids.contains(&local.id) {
        return true;
    }
    std::ptr::eq(pick_version(local, remote), local)
}

/// Keep the first occurrence of every id.
fn dedupe(elements: &[Element]) -> Vec<&Element> {
    let mut seen = HashSet::new();
    elements
        .iter()
        .filter(|el| seen.insert(el.id.as_str()))
        .collect()
}

/// Merge `remote` into `local`.
///
/// Elements present on one side only are kept as-is, which is how new
/// elements and tombstones propagate. Elements present on both sides are
/// resolved per element with [`pick_version`].
pub fn reconcile(local: &[Element], remote: &[Element], ctx: &ReconcileContext) -> Vec<Element> {
    let local = dedupe(local);
    let remote = dedupe(remote);

    let local_by_id: HashMap<&str, &Element> =
        local.iter().map(|el| (el.id.as_str(), *el)).collect();

    let remote_wins: HashSet<&str> = remote
        .iter()
        .filter(|r| match local_by_id.get(r.id.as_str()) {
            Some(l) => !should_discard_remote(l, r, ctx),
            None => true,
        })
        .map(|r| r.id.as_str())
        .collect();

    let mut order: Vec<&Element> = local
        .iter()
        .copied()
        .filter(|el| !remote_wins.contains(el.id.as_str()))
        .collect();

    for (idx, element) in remote.iter().enumerate() {
        if !remote_wins.contains(element.id.as_str()) {
            continue;
        }
        let at = insertion_index(&order, &remote, idx);
        order.insert(at, element);
    }

    order.into_iter().cloned().collect()
}

/// Position for `remote[idx]` in `order`, anchored on its remote neighbors.
fn insertion_index(order: &[&Element], remote: &[&Element], idx: usize) -> usize {
    let position_of = |id: &str| order.iter().position(|el| el.id == id);

    for prev in remote[..idx].iter().rev() {
        if let Some(pos) = position_of(prev.id.as_str()) {
            return pos + 1;
        }
    }
    for next in &remote[idx + 1..] {
        if let Some(pos) = position_of(next.id.as_str()) {
            return pos;
        }
    }
    order.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn el(id: &str, version: u32, nonce: u32) -> Element {
        let mut el = Element::new("rectangle");
        el.id = id.to_string();
        el.version = version;
        el.version_nonce = nonce;
        el.updated = 1;
        el
    }

    fn ids(elements: &[Element]) -> Vec<&str> {
        elements.iter().map(|e| e.id.as_str()).collect()
    }

    fn versions(elements: &[Element]) -> Vec<(String, u32, u32, bool)> {
        let mut v: Vec<_> = elements
            .iter()
            .map(|e| (e.id.clone(), e.version, e.version_nonce, e.is_deleted))
            .collect();
        v.sort();
        v
    }

    #[test]
    fn test_disjoint_sets_are_unioned() {
        let merged = reconcile(&[el("e1", 1, 0)], &[el("e2", 1, 0)], &ReconcileContext::new());
        assert_eq!(ids(&merged), vec!["e1", "e2"]);
    }

    #[test]
    fn test_reconcile_with_self_is_identity() {
        let scene = vec![el("a", 1, 3), el("b", 4, 1), el("c", 2, 2).deleted()];
        let merged = reconcile(&scene, &scene, &ReconcileContext::new());
        assert_eq!(merged, scene);
    }

    #[test]
    fn test_winner_is_commutative() {
        let a = vec![el("x", 3, 0), el("y", 1, 0), el("z", 2, 9)];
        let b = vec![el("y", 2, 0), el("z", 2, 4), el("w", 1, 0)];
        let ctx = ReconcileContext::new();
        assert_eq!(versions(&reconcile(&a, &b, &ctx)), versions(&reconcile(&b, &a, &ctx)));
    }

    #[test]
    fn test_concurrent_edit_tie_break() {
        let from_a = el("e1", 2, 700);
        let from_b = el("e1", 2, 300);
        let ctx = ReconcileContext::new();
        let ab = reconcile(&[from_a.clone()], &[from_b.clone()], &ctx);
        let ba = reconcile(&[from_b], &[from_a], &ctx);
        assert_eq!(ab.len(), 1);
        assert_eq!(ab[0].version_nonce, 300);
        assert_eq!(ba[0].version_nonce, 300);
    }

    #[test]
    fn test_tombstone_survives_round_trips() {
        let original = el("e1", 1, 0);
        let deleted = original.deleted();
        let ctx = ReconcileContext::new();

        let merged = reconcile(&[deleted.clone()], &[original.clone(), el("e2", 1, 0)], &ctx);
        let e1 = merged.iter().find(|e| e.id == "e1").unwrap();
        assert!(e1.is_deleted);

        let again = reconcile(&[original], &merged, &ctx);
        assert!(again.iter().find(|e| e.id == "e1").unwrap().is_deleted);
    }

    #[test]
    fn test_undelete_beats_older_tombstone() {
        let mut dead = el("e1", 2, 0);
        dead.is_deleted = true;
        let revived = el("e1", 3, 0);
        let merged = reconcile(&[dead], &[revived], &ReconcileContext::new());
        assert!(!merged[0].is_deleted);
        assert_eq!(merged[0].version, 3);
    }

    #[test]
    fn test_older_snapshot_never_loses_newer_elements() {
        let newer = vec![el("a", 2, 0), el("b", 1, 0), el("c", 1, 0)];
        let older = vec![el("a", 1, 0)];
        let merged = reconcile(&newer, &older, &ReconcileContext::new());
        assert_eq!(ids(&merged), vec!["a", "b", "c"]);
        assert_eq!(merged[0].version, 2);
    }

    #[test]
    fn test_remote_insert_lands_after_its_neighbor() {
        let local = vec![el("a", 1, 0), el("b", 1, 0), el("c", 1, 0)];
        let remote = vec![el("a", 1, 0), el("new", 1, 0), el("b", 1, 0), el("c", 1, 0)];
        let merged = reconcile(&local, &remote, &ReconcileContext::new());
        assert_eq!(ids(&merged), vec!["a", "new", "b", "c"]);
    }

    #[test]
    fn test_remote_winner_keeps_position_without_predecessor() {
        let local = vec![el("a", 1, 0), el("b", 1, 0), el("c", 1, 0)];
        let remote = vec![el("a", 2, 0), el("b", 1, 0), el("c", 1, 0)];
        let merged = reconcile(&local, &remote, &ReconcileContext::new());
        assert_eq!(ids(&merged), vec!["a", "b", "c"]);
        assert_eq!(merged[0].version, 2);
    }

    #[test]
    fn test_remote_reorder_applies_for_winning_element() {
        let local = vec![el("a", 1, 0), el("b", 1, 0), el("c", 1, 0)];
        // "a" was brought to front remotely, which bumped its version.
        let remote = vec![el("b", 1, 0), el("c", 1, 0), el("a", 2, 0)];
        let merged = reconcile(&local, &remote, &ReconcileContext::new());
        assert_eq!(ids(&merged), vec!["b", "c", "a"]);
    }

    #[test]
    fn test_editing_element_is_protected() {
        let local = vec![el("a", 1, 0)];
        let remote = vec![el("a", 5, 0)];
        let ctx = ReconcileContext::editing(["a".to_string()]);
        assert_eq!(reconcile(&local, &remote, &ctx)[0].version, 1);
    }

    #[test]
    fn test_inputs_are_untouched_and_output_is_stable() {
        let local = vec![el("a", 1, 0), el("b", 2, 0)];
        let remote = vec![el("c", 1, 0), el("b", 3, 0), el("d", 1, 0)];
        let local_before = local.clone();
        let ctx = ReconcileContext::new();
        let first = reconcile(&local, &remote, &ctx);
        let second = reconcile(&local, &remote, &ctx);
        assert_eq!(first, second);
        assert_eq!(local, local_before);
        assert_eq!(ids(&first), vec!["a", "c", "b", "d"]);
    }
}
