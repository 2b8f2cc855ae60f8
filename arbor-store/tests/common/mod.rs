//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;

use arbor_store::{
    CrdtKind, CreateOp, Delta, Document, Driver, Entry, Intent, JsonObject, Op, ROOT_ID,
};
use proptest::prelude::*;
use serde_json::{json, Value};

// ─── Op generation ───────────────────────────────────────────────────────────

const IDS: &[&str] = &["n0", "n1", "n2", "n3", "n4", "n5", "n6", "n7"];
/// Includes positions with no printable room next to them: a trailing
/// lowest digit, control characters and non-ASCII.
const KEYS: &[&str] = &[
    "a", "b", "!", "#", "%", "O", "~", "a ", "a\u{1}", "a\0", "\u{7f}", "é",
];

fn arb_id() -> impl Strategy<Value = String> {
    prop::sample::select(IDS).prop_map(str::to_string)
}

fn arb_parent() -> impl Strategy<Value = String> {
    prop_oneof![1 => Just(ROOT_ID.to_string()), 3 => arb_id()]
}

fn arb_key() -> impl Strategy<Value = String> {
    prop::sample::select(KEYS).prop_map(str::to_string)
}

fn arb_kind() -> impl Strategy<Value = CrdtKind> {
    prop::sample::select(vec![
        CrdtKind::Object,
        CrdtKind::Map,
        CrdtKind::List,
        CrdtKind::Register,
    ])
}

fn arb_create() -> impl Strategy<Value = Op> {
    (
        arb_kind(),
        arb_id(),
        arb_parent(),
        arb_key(),
        any::<i16>(),
        any::<bool>(),
        prop::option::of(arb_id()),
    )
        .prop_map(|(kind, id, parent, key, n, set, deleted)| {
            let mut create = CreateOp::new(kind, id.clone(), parent, key).with_op_id(format!("c-{id}"));
            match kind {
                CrdtKind::Register => create = create.with_data(json!(n)),
                CrdtKind::Object => create = create.with_data(json!({ "v": n })),
                CrdtKind::Map | CrdtKind::List => {}
            }
            if set {
                create = create.with_intent(Intent::Set);
                if let Some(deleted) = deleted {
                    create = create.with_deleted_id(deleted);
                }
            }
            create.into()
        })
}

/// A random op over a small id and key space, so ops collide often.
pub fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        5 => arb_create(),
        2 => (arb_id(), arb_key()).prop_map(|(id, key)| {
            Op::set_parent_key(id.clone(), key).with_op_id(Some(format!("m-{id}")))
        }),
        2 => (arb_parent(), arb_key(), any::<i16>()).prop_map(|(id, key, n)| {
            Op::update_object(id, object(&[(key.as_str(), json!(n))]))
        }),
        1 => (arb_parent(), arb_key()).prop_map(|(id, key)| Op::delete_object_key(id, key)),
        1 => arb_id().prop_map(Op::delete_node),
    ]
}

/// Batches of ops.
pub fn arb_batches(max_batches: usize, max_ops: usize) -> impl Strategy<Value = Vec<Vec<Op>>> {
    prop::collection::vec(prop::collection::vec(arb_op(), 1..=max_ops), 1..=max_batches)
}

pub fn object(pairs: &[(&str, Value)]) -> JsonObject {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

// ─── Client replica ──────────────────────────────────────────────────────────

/// Client copy of a document, fed only with deltas.
#[derive(Debug, Default)]
pub struct Replica {
    pub clock: u64,
    slots: BTreeMap<(String, String), Entry>,
}

impl Replica {
    /// Pull everything newer than the replica's clock, through the JSON wire
    /// format.
    pub fn catch_up<D: Driver>(&mut self, doc: &Document<D>) -> Delta {
        let wire = serde_json::to_string(&doc.delta_since(self.clock)).unwrap();
        let delta: Delta = serde_json::from_str(&wire).unwrap();

        for (node, keys) in &delta.removed {
            for key in keys {
                self.slots.remove(&(node.clone(), key.clone()));
            }
        }
        for (node, values) in &delta.values {
            for (key, value) in values {
                self.slots
                    .insert((node.clone(), key.clone()), Entry::Value(value.clone()));
            }
        }
        for (node, refs) in &delta.refs {
            for (key, child) in refs {
                self.slots
                    .insert((node.clone(), key.clone()), Entry::Ref(child.clone()));
            }
        }
        self.clock = doc.clock();
        delta
    }

    /// Render from the root. Node kinds are looked up on the server.
    pub fn to_json<D: Driver>(&self, doc: &Document<D>) -> Value {
        self.render(doc, ROOT_ID)
    }

    fn render<D: Driver>(&self, doc: &Document<D>, node: &str) -> Value {
        let entries = self
            .slots
            .range((node.to_string(), String::new())..)
            .take_while(|((owner, _), _)| owner == node)
            .map(|((_, key), entry)| {
                let value = match entry {
                    Entry::Value(value) => value.clone(),
                    Entry::Ref(child) => self.render(doc, child),
                };
                (key.clone(), value)
            });
        match doc.cache().kind_of(node) {
            Some(CrdtKind::List) => Value::Array(entries.map(|(_, value)| value).collect()),
            _ => Value::Object(entries.collect()),
        }
    }
}
