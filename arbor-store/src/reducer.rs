//! Op Reducer.
//!
//! Applies client operations to a [`Driver`] and decides their outcome.
//! Every op is either accepted, possibly with a corrective fix the sender
//! must apply to converge, or ignored with no effect on the tree.
//!
//! ```text
//!   Op ──► apply_op ──► Driver primitives ──► ApplyResult
//!                         │                     ├─ Accepted { op, fix }
//!                         └─ TreeError ───────► └─ Ignored { ignoredOpId }
//! ```
//!
//! List conflicts are settled with positions: an insert landing on an
//! occupied slot moves just after it, and the client is told where via a
//! `SetParentKey` fix carrying the original op id.

use crate::driver::Driver;
use crate::node::{CrdtKind, Node};
use crate::op::{ApplyResult, CreateOp, Intent, Op};
use crate::position;
use crate::tree::TreeError;

/// Apply one op.
pub fn apply_op<D: Driver + ?Sized>(driver: &mut D, op: Op) -> ApplyResult {
    match op {
        Op::Create(create) => apply_create(driver, create),
        Op::SetParentKey { .. } => apply_set_parent_key(driver, op),
        Op::UpdateObject { ref id, ref data, .. } => {
            if let Err(e) = driver.set_object_data(id, data, true) {
                log::debug!("UpdateObject on {id} had no effect: {e}");
            }
            ApplyResult::accepted(op)
        }
        Op::DeleteObjectKey { ref id, ref key, .. } => {
            driver.delete_child_key(id, key);
            ApplyResult::accepted(op)
        }
        Op::DeleteNode { ref id, .. } => {
            driver.delete_node(id);
            ApplyResult::accepted(op)
        }
    }
}

/// Apply a batch in order. One result per op.
pub fn apply_ops<D: Driver + ?Sized>(
    driver: &mut D,
    ops: impl IntoIterator<Item = Op>,
) -> Vec<ApplyResult> {
    ops.into_iter().map(|op| apply_op(driver, op)).collect()
}

// ─── Create ───────────────────────────────────────────────────────────

fn apply_create<D: Driver + ?Sized>(driver: &mut D, create: CreateOp) -> ApplyResult {
    if driver.has_node(&create.id) {
        log::debug!("Ignoring create of existing node {}", create.id);
        return ignored(create);
    }
    let Some(parent_kind) = driver.get_node(&create.parent_id).map(Node::kind) else {
        log::debug!("Ignoring create of {}: parent {} not found", create.id, create.parent_id);
        return ignored(create);
    };

    match parent_kind {
        CrdtKind::Object if create.kind == CrdtKind::Register => {
            log::debug!("Ignoring Register {} under Object {}", create.id, create.parent_id);
            ignored(create)
        }
        CrdtKind::Object | CrdtKind::Map => attach(driver, create, None, true),
        CrdtKind::List => match create.intent {
            Intent::Insert => insert_into_list(driver, create),
            Intent::Set => set_into_list(driver, create),
        },
        CrdtKind::Register => {
            log::debug!("Ignoring create of {} under Register {}", create.id, create.parent_id);
            ignored(create)
        }
    }
}

/// Insert intent: never replaces a sibling.
fn insert_into_list<D: Driver + ?Sized>(driver: &mut D, mut create: CreateOp) -> ApplyResult {
    if !driver.has_child_at(&create.parent_id, &create.parent_key) {
        return attach(driver, create, None, false);
    }

    let Some(free) = free_position_after(driver, &create.parent_id, &create.parent_key) else {
        log::debug!("Ignoring create of {}: no free position in {}", create.id, create.parent_id);
        return ignored(create);
    };
    log::debug!(
        "Position {:?} under {} taken, inserting {} at {:?}",
        create.parent_key,
        create.parent_id,
        create.id,
        free
    );
    create.parent_key = free.clone();
    let fix = Op::SetParentKey {
        op_id: create.op_id.clone(),
        id: create.id.clone(),
        parent_key: free,
    };
    attach(driver, create, Some(fix), false)
}

/// A free position after the occupied `key` of a list: just before the next
/// sibling when that leaves room, otherwise after the last one.
fn free_position_after<D: Driver + ?Sized>(driver: &D, list_id: &str, key: &str) -> Option<String> {
    let next = driver.get_next_sibling(list_id, key);
    let is_free = |pos: &str| pos > key && !driver.has_child_at(list_id, pos);

    if let Some(pos) = position::try_between(Some(key), next) {
        if is_free(pos.as_str()) {
            return Some(pos);
        }
    }
    let last = driver
        .tree()
        .children_of(list_id)
        .last()
        .map(|(last, _)| last.as_str())
        .filter(|last| *last > key)
        .unwrap_or(key);
    Some(position::between(last, None)).filter(|pos| is_free(pos.as_str()))
}

/// Set intent: replaces whatever holds the slot.
fn set_into_list<D: Driver + ?Sized>(driver: &mut D, create: CreateOp) -> ApplyResult {
    if let Some(deleted_id) = create.deleted_id.as_deref() {
        let same_parent = driver
            .get_node(deleted_id)
            .and_then(Node::parent_id)
            .is_some_and(|parent| parent == create.parent_id);
        if same_parent {
            driver.delete_node(deleted_id);
        }
    }

    let fix = driver
        .get_child_at(&create.parent_id, &create.parent_key)
        .filter(|prev| create.deleted_id.as_ref() != Some(*prev))
        .map(|prev| Op::DeleteNode {
            op_id: create.op_id.clone(),
            id: prev.clone(),
        });
    attach(driver, create, fix, true)
}

fn attach<D: Driver + ?Sized>(
    driver: &mut D,
    create: CreateOp,
    fix: Option<Op>,
    allow_overwrite: bool,
) -> ApplyResult {
    match driver.set_child(&create.id, create.to_node(), allow_overwrite) {
        Ok(()) => match fix {
            Some(fix) => ApplyResult::with_fix(create.into(), fix),
            None => ApplyResult::accepted(create.into()),
        },
        Err(e) => {
            log::debug!("Ignoring create of {}: {e}", create.id);
            ignored(create)
        }
    }
}

fn ignored(create: CreateOp) -> ApplyResult {
    ApplyResult::ignored(&Op::Create(create))
}

// ─── SetParentKey ─────────────────────────────────────────────────────

fn apply_set_parent_key<D: Driver + ?Sized>(driver: &mut D, op: Op) -> ApplyResult {
    let Op::SetParentKey {
        ref op_id,
        ref id,
        ref parent_key,
    } = op
    else {
        return ApplyResult::ignored(&op);
    };

    let Some(parent) = driver.get_node(id).and_then(Node::parent).cloned() else {
        log::debug!("Ignoring SetParentKey on {id}: unknown node or no parent");
        return ApplyResult::ignored(&op);
    };
    let parent_is_list = driver
        .get_node(&parent.parent_id)
        .is_some_and(|node| node.kind() == CrdtKind::List);
    if !parent_is_list {
        log::debug!("Ignoring SetParentKey on {id}: parent is not a List");
        return ApplyResult::ignored(&op);
    }
    if parent.parent_key == *parent_key {
        return ApplyResult::accepted(op);
    }

    let target = match driver.get_child_at(&parent.parent_id, parent_key) {
        Some(occupant) if occupant != id => {
            match free_position_after(driver, &parent.parent_id, parent_key) {
                Some(free) => free,
                None => {
                    log::debug!("Ignoring SetParentKey on {id}: no free position");
                    return ApplyResult::ignored(&op);
                }
            }
        }
        _ => parent_key.clone(),
    };

    if let Err(e) = driver.move_sibling(id, &target) {
        return ignore_with(&op, e);
    }
    if target == *parent_key {
        return ApplyResult::accepted(op);
    }

    let settled = Op::SetParentKey {
        op_id: op_id.clone(),
        id: id.clone(),
        parent_key: target.clone(),
    };
    let fix = settled.clone();
    ApplyResult::with_fix(settled, fix)
}

fn ignore_with(op: &Op, error: TreeError) -> ApplyResult {
    log::debug!("Ignoring op on {}: {error}", op.id());
    ApplyResult::ignored(op)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{JsonObject, ROOT_ID};
    use crate::tree::Tree;
    use serde_json::json;

    fn create(kind: CrdtKind, id: &str, parent: &str, key: &str) -> CreateOp {
        CreateOp::new(kind, id, parent, key).with_op_id(format!("op-{id}"))
    }

    fn object(pairs: &[(&str, serde_json::Value)]) -> JsonObject {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn with_list() -> Tree {
        let mut tree = Tree::new();
        let result = apply_op(&mut tree, create(CrdtKind::List, "L", ROOT_ID, "items").into());
        assert!(result.is_accepted());
        tree
    }

    #[test]
    fn test_create_object_under_root() {
        let mut tree = Tree::new();
        let op: Op = create(CrdtKind::Object, "o1", ROOT_ID, "settings")
            .with_data(json!({"theme": "dark"}))
            .into();
        let result = apply_op(&mut tree, op.clone());
        assert_eq!(result, ApplyResult::accepted(op));
        assert_eq!(tree.to_json(), json!({"settings": {"theme": "dark"}}));
    }

    #[test]
    fn test_register_under_object_is_ignored() {
        let mut tree = Tree::new();
        let op: Op = create(CrdtKind::Register, "r", ROOT_ID, "x")
            .with_data(json!(1))
            .into();
        let result = apply_op(&mut tree, op);
        assert_eq!(
            result,
            ApplyResult::Ignored {
                ignored_op_id: Some("op-r".into())
            }
        );
        assert!(!tree.has("r"));
    }

    #[test]
    fn test_create_under_register_or_missing_parent_is_ignored() {
        let mut tree = with_list();
        apply_op(
            &mut tree,
            create(CrdtKind::Register, "r", "L", "a").with_data(json!(1)).into(),
        );

        let under_register = apply_op(&mut tree, create(CrdtKind::Map, "m", "r", "k").into());
        assert!(!under_register.is_accepted());
        let orphan = apply_op(&mut tree, create(CrdtKind::Map, "m", "ghost", "k").into());
        assert!(!orphan.is_accepted());
        assert!(!tree.has("m"));
    }

    #[test]
    fn test_duplicate_create_is_ignored() {
        let mut tree = with_list();
        let again = apply_op(&mut tree, create(CrdtKind::List, "L", ROOT_ID, "other").into());
        assert!(!again.is_accepted());
        assert_eq!(tree.get("L").and_then(Node::parent_key), Some("items"));
    }

    #[test]
    fn test_object_and_map_overwrite_existing_slot() {
        let mut tree = Tree::new();
        apply_op(&mut tree, create(CrdtKind::Object, "O1", ROOT_ID, "k").into());
        apply_op(&mut tree, create(CrdtKind::Map, "M1", "O1", "inner").into());

        let second = apply_op(&mut tree, create(CrdtKind::Object, "O2", ROOT_ID, "k").into());
        assert!(second.is_accepted());
        assert!(second.fix().is_none());
        assert!(!tree.has("O1"));
        assert!(!tree.has("M1"));
        assert_eq!(tree.child_at(ROOT_ID, "k").map(String::as_str), Some("O2"));

        apply_op(&mut tree, create(CrdtKind::Map, "M", ROOT_ID, "m").into());
        apply_op(
            &mut tree,
            create(CrdtKind::Register, "r1", "M", "a").with_data(json!(1)).into(),
        );
        let replaced = apply_op(
            &mut tree,
            create(CrdtKind::Register, "r2", "M", "a").with_data(json!(2)).into(),
        );
        assert!(replaced.is_accepted());
        assert!(!tree.has("r1"));
        assert_eq!(tree.to_json()["m"], json!({"a": 2}));
    }

    #[test]
    fn test_list_insert_conflict_emits_position_fix() {
        let mut tree = with_list();
        apply_op(
            &mut tree,
            create(CrdtKind::Register, "a", "L", "!").with_data(json!("A")).into(),
        );
        apply_op(
            &mut tree,
            create(CrdtKind::Register, "c", "L", "#").with_data(json!("C")).into(),
        );

        let result = apply_op(
            &mut tree,
            create(CrdtKind::Register, "b", "L", "!").with_data(json!("B")).into(),
        );
        let ApplyResult::Accepted {
            op: Op::Create(accepted),
            fix: Some(Op::SetParentKey { op_id, id, parent_key }),
        } = result
        else {
            panic!("expected an accepted create with a position fix");
        };

        assert_eq!(op_id.as_deref(), Some("op-b"));
        assert_eq!(id, "b");
        assert_eq!(accepted.parent_key, parent_key);
        assert!(parent_key.as_str() > "!" && parent_key.as_str() < "#");
        assert!(tree.has("a"));
        assert_eq!(tree.to_json()["items"], json!(["A", "B", "C"]));
    }

    #[test]
    fn test_list_insert_after_last_sibling() {
        let mut tree = with_list();
        apply_op(
            &mut tree,
            create(CrdtKind::Register, "a", "L", "!").with_data(json!(1)).into(),
        );
        let result = apply_op(
            &mut tree,
            create(CrdtKind::Register, "b", "L", "!").with_data(json!(2)).into(),
        );
        let fixed = match result.fix() {
            Some(Op::SetParentKey { parent_key, .. }) => parent_key.clone(),
            other => panic!("unexpected fix {other:?}"),
        };
        assert!(fixed.as_str() > "!");
        assert_eq!(tree.to_json()["items"], json!([1, 2]));
    }

    #[test]
    fn test_list_insert_never_clobbers_sibling_at_tight_bound() {
        let mut tree = with_list();
        for (id, key) in [("x", "a"), ("y", "a "), ("z", "a O")] {
            apply_op(
                &mut tree,
                create(CrdtKind::Register, id, "L", key).with_data(json!(id)).into(),
            );
        }

        let result = apply_op(
            &mut tree,
            create(CrdtKind::Register, "w", "L", "a").with_data(json!("w")).into(),
        );
        let Some(Op::SetParentKey { parent_key, .. }) = result.fix() else {
            panic!("expected a position fix, got {result:?}");
        };
        assert!(parent_key.as_str() > "a" && parent_key.as_str() < "a ", "{parent_key:?}");
        assert_eq!(tree.to_json()["items"], json!(["x", "w", "y", "z"]));
        assert!(tree.check_invariants().is_ok());
    }

    #[test]
    fn test_list_insert_without_room_goes_after_last() {
        let mut tree = with_list();
        for (id, key) in [("x", "a"), ("y", "a\0")] {
            apply_op(
                &mut tree,
                create(CrdtKind::Register, id, "L", key).with_data(json!(id)).into(),
            );
        }

        let result = apply_op(
            &mut tree,
            create(CrdtKind::Register, "w", "L", "a").with_data(json!("w")).into(),
        );
        let Some(Op::SetParentKey { parent_key, .. }) = result.fix() else {
            panic!("expected a position fix, got {result:?}");
        };
        assert!(parent_key.as_str() > "a\0", "{parent_key:?}");
        assert_eq!(tree.to_json()["items"], json!(["x", "y", "w"]));
    }

    #[test]
    fn test_list_set_replaces_previous_item() {
        let mut tree = with_list();
        apply_op(
            &mut tree,
            create(CrdtKind::Register, "a", "L", "!").with_data(json!("old")).into(),
        );

        let result = apply_op(
            &mut tree,
            create(CrdtKind::Register, "b", "L", "!")
                .with_data(json!("new"))
                .with_intent(Intent::Set)
                .into(),
        );
        assert_eq!(
            result.fix(),
            Some(&Op::DeleteNode {
                op_id: Some("op-b".into()),
                id: "a".into()
            })
        );
        assert!(!tree.has("a"));
        assert_eq!(tree.to_json()["items"], json!(["new"]));
    }

    #[test]
    fn test_list_set_with_deleted_id_needs_no_fix() {
        let mut tree = with_list();
        apply_op(
            &mut tree,
            create(CrdtKind::Register, "a", "L", "!").with_data(json!("old")).into(),
        );

        let result = apply_op(
            &mut tree,
            create(CrdtKind::Register, "b", "L", "!")
                .with_data(json!("new"))
                .with_intent(Intent::Set)
                .with_deleted_id("a")
                .into(),
        );
        assert!(result.is_accepted());
        assert!(result.fix().is_none());
        assert_eq!(tree.to_json()["items"], json!(["new"]));
    }

    #[test]
    fn test_list_set_deleted_id_elsewhere_is_kept() {
        let mut tree = with_list();
        apply_op(&mut tree, create(CrdtKind::Map, "m", ROOT_ID, "m").into());
        apply_op(
            &mut tree,
            create(CrdtKind::Register, "x", "m", "k").with_data(json!(0)).into(),
        );

        let result = apply_op(
            &mut tree,
            create(CrdtKind::Register, "b", "L", "!")
                .with_data(json!(1))
                .with_intent(Intent::Set)
                .with_deleted_id("x")
                .into(),
        );
        assert!(result.is_accepted());
        assert!(tree.has("x"));
    }

    #[test]
    fn test_set_parent_key_moves_item() {
        let mut tree = with_list();
        apply_op(
            &mut tree,
            create(CrdtKind::Register, "a", "L", "!").with_data(json!("A")).into(),
        );
        apply_op(
            &mut tree,
            create(CrdtKind::Register, "b", "L", "#").with_data(json!("B")).into(),
        );

        let op = Op::set_parent_key("a", "$").with_op_id(Some("mv".into()));
        let result = apply_op(&mut tree, op.clone());
        assert_eq!(result, ApplyResult::accepted(op));
        assert_eq!(tree.to_json()["items"], json!(["B", "A"]));
    }

    #[test]
    fn test_set_parent_key_conflict_is_fixed() {
        let mut tree = with_list();
        for (id, key) in [("a", "!"), ("b", "#"), ("c", "%")] {
            apply_op(
                &mut tree,
                create(CrdtKind::Register, id, "L", key).with_data(json!(id)).into(),
            );
        }

        let result = apply_op(&mut tree, Op::set_parent_key("c", "!").with_op_id(Some("mv".into())));
        let Some(Op::SetParentKey { op_id, parent_key, .. }) = result.fix() else {
            panic!("expected a position fix, got {result:?}");
        };
        assert_eq!(op_id.as_deref(), Some("mv"));
        assert!(parent_key.as_str() > "!" && parent_key.as_str() < "#");
        assert_eq!(tree.to_json()["items"], json!(["a", "c", "b"]));
    }

    #[test]
    fn test_set_parent_key_conflict_at_tight_bound_is_fixed() {
        let mut tree = with_list();
        for (id, key) in [("a", "a"), ("b", "a "), ("c", "b")] {
            apply_op(
                &mut tree,
                create(CrdtKind::Register, id, "L", key).with_data(json!(id)).into(),
            );
        }

        let result = apply_op(&mut tree, Op::set_parent_key("c", "a").with_op_id(Some("mv".into())));
        assert!(result.is_accepted(), "{result:?}");
        let Some(Op::SetParentKey { parent_key, .. }) = result.fix() else {
            panic!("expected a position fix, got {result:?}");
        };
        assert!(parent_key.as_str() > "a" && parent_key.as_str() < "a ", "{parent_key:?}");
        assert_eq!(tree.to_json()["items"], json!(["a", "c", "b"]));
    }

    #[test]
    fn test_set_parent_key_same_position_is_noop() {
        let mut tree = with_list();
        apply_op(
            &mut tree,
            create(CrdtKind::Register, "a", "L", "!").with_data(json!(1)).into(),
        );
        tree.take_changes();

        let result = apply_op(&mut tree, Op::set_parent_key("a", "!"));
        assert!(result.is_accepted());
        assert!(result.fix().is_none());
        assert!(tree.changes().is_empty());
    }

    #[test]
    fn test_set_parent_key_outside_list_is_ignored() {
        let mut tree = Tree::new();
        apply_op(&mut tree, create(CrdtKind::Map, "m", ROOT_ID, "m").into());
        assert!(!apply_op(&mut tree, Op::set_parent_key("m", "other")).is_accepted());
        assert!(!apply_op(&mut tree, Op::set_parent_key(ROOT_ID, "x")).is_accepted());
        assert!(!apply_op(&mut tree, Op::set_parent_key("ghost", "x")).is_accepted());
    }

    #[test]
    fn test_update_object_overwrites_child() {
        let mut tree = Tree::new();
        apply_op(&mut tree, create(CrdtKind::List, "L", ROOT_ID, "tags").into());

        let result = apply_op(
            &mut tree,
            Op::update_object(ROOT_ID, object(&[("tags", json!("none")), ("n", json!(1))])),
        );
        assert!(result.is_accepted());
        assert!(!tree.has("L"));
        assert_eq!(tree.to_json(), json!({"tags": "none", "n": 1}));
    }

    #[test]
    fn test_deletes_are_always_accepted() {
        let mut tree = Tree::new();
        apply_op(&mut tree, Op::update_object(ROOT_ID, object(&[("a", json!(1))])));
        apply_op(&mut tree, create(CrdtKind::Map, "m", ROOT_ID, "m").into());

        assert!(apply_op(&mut tree, Op::delete_object_key(ROOT_ID, "a")).is_accepted());
        assert!(apply_op(&mut tree, Op::delete_object_key(ROOT_ID, "a")).is_accepted());
        assert!(apply_op(&mut tree, Op::delete_node("m")).is_accepted());
        assert!(apply_op(&mut tree, Op::delete_node("m")).is_accepted());
        assert!(apply_op(&mut tree, Op::delete_node(ROOT_ID)).is_accepted());
        assert_eq!(tree.to_json(), json!({}));
    }

    #[test]
    fn test_apply_ops_keeps_order() {
        let mut tree = Tree::new();
        let results = apply_ops(
            &mut tree,
            vec![
                create(CrdtKind::Map, "m", ROOT_ID, "m").into(),
                create(CrdtKind::Register, "r", "m", "k").with_data(json!(true)).into(),
                create(CrdtKind::Register, "bad", ROOT_ID, "k").into(),
            ],
        );
        let accepted: Vec<bool> = results.iter().map(ApplyResult::is_accepted).collect();
        assert_eq!(accepted, vec![true, true, false]);
        assert!(tree.check_invariants().is_ok());
    }
}
