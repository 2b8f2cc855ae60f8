//! Catch-up deltas between cache versions.
//!
//! On the wire a delta is the triple `[removed, values, refs]`:
//!
//! ```text
//! [
//!   { "<node>": ["<removed key>", ...] },
//!   { "<node>": { "<key>": <json>, ... } },
//!   { "<node>": { "<key>": "<child node>", ... } }
//! ]
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use super::tables::Tables;
use super::Entry;
use crate::node::{NodeId, ROOT_ID};

/// Everything that changed after a given clock.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delta {
    /// Keys that no longer hold anything
    pub removed: BTreeMap<NodeId, Vec<String>>,
    /// Keys now holding a plain value
    pub values: BTreeMap<NodeId, BTreeMap<String, Value>>,
    /// Keys now pointing at a child node
    pub refs: BTreeMap<NodeId, BTreeMap<String, NodeId>>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.values.is_empty() && self.refs.is_empty()
    }

    /// Number of keys mentioned.
    pub fn len(&self) -> usize {
        self.removed.values().map(Vec::len).sum::<usize>()
            + self.values.values().map(BTreeMap::len).sum::<usize>()
            + self.refs.values().map(BTreeMap::len).sum::<usize>()
    }

    /// Changes with a version newer than `since`. `since == 0` yields a full
    /// snapshot of the current state.
    pub(crate) fn compute(tables: &Tables, since: u64) -> Delta {
        let mut delta = Delta::default();
        if since == 0 {
            for ((node, key), entry) in &tables.storage {
                delta.put(node, key, Some(entry));
            }
            return delta;
        }

        for ((node, key), clock) in &tables.latest {
            if *clock <= since {
                continue;
            }
            // A client at `since` either never saw this owner or drops it
            // through the tombstone on its parent key.
            let owner_gone = node != ROOT_ID
                && tables
                    .kinds
                    .get(node)
                    .map_or(true, |record| record.dereferenced.is_some_and(|at| at > since));
            if owner_gone {
                continue;
            }
            delta.put(node, key, tables.storage.get(&(node.clone(), key.clone())));
        }

        // A node id recreated after `since` may still carry keys of its
        // earlier incarnation on the client.
        for (node, record) in &tables.kinds {
            if record.created <= since || record.dereferenced.is_some() {
                continue;
            }
            let stale: BTreeSet<&String> = tables
                .versions
                .range((node.clone(), String::new(), 0)..)
                .take_while(|((owner, _, _), _)| owner == node)
                .map(|((_, key, _), _)| key)
                .filter(|key| {
                    let slot = (node.clone(), (*key).clone());
                    tables.latest.get(&slot).is_some_and(|at| *at <= since)
                })
                .collect();
            for key in stale {
                delta.put(node, key, None);
            }
        }
        delta
    }

    fn put(&mut self, node: &str, key: &str, entry: Option<&Entry>) {
        match entry {
            None => self.removed.entry(node.to_string()).or_default().push(key.to_string()),
            Some(Entry::Value(value)) => {
                self.values
                    .entry(node.to_string())
                    .or_default()
                    .insert(key.to_string(), value.clone());
            }
            Some(Entry::Ref(child)) => {
                self.refs
                    .entry(node.to_string())
                    .or_default()
                    .insert(key.to_string(), child.clone());
            }
        }
    }
}

impl Serialize for Delta {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (&self.removed, &self.values, &self.refs).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Delta {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (removed, values, refs) = Deserialize::deserialize(deserializer)?;
        Ok(Delta {
            removed,
            values,
            refs,
        })
    }
}
