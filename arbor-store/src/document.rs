//! Document engine: one node tree and its version cache, kept in step.
//!
//! ```text
//!   client ops ──► apply_ops ──► reducer ──► Driver ──► TreeChange journal
//!                                                              │ mirrored
//!                                                              ▼
//!   server code ──► mutate ──► LiveObject ──► VersionCache ──► CacheWrite log
//!                                              │                    │ mirrored
//!                                              ▼                    ▼
//!                                        delta_since(v)          Driver
//! ```
//!
//! Both entry points run inside one cache transaction, so a batch either
//! lands in both structures at the next clock or in neither. A transaction
//! that rolls back also puts the tree back as it was before the batch.

use std::collections::{BTreeSet, VecDeque};

use serde_json::Value;

use crate::cache::{CacheConfig, CacheError, CacheWrite, CacheWriter, Delta, VersionCache};
use crate::driver::{Driver, PersistentDriver};
use crate::node::{CrdtKind, JsonObject, Node, NodeId, ParentRef, ROOT_ID};
use crate::op::{ApplyResult, Op, RejectedOp};
use crate::pool::LiveObject;
use crate::reducer;
use crate::storage::{DocumentStore, StoreConfig};
use crate::tree::{Tree, TreeChange, TreeError};

/// Actor prefix of ids minted by server-side mutations.
pub const SERVER_ACTOR: &str = "server";

/// A replicated document.
pub struct Document<D: Driver = Tree> {
    driver: D,
    cache: VersionCache,
}

impl<D: Driver> std::fmt::Debug for Document<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("nodes", &self.driver.tree().len())
            .field("cache", &self.cache)
            .finish()
    }
}

impl Document<Tree> {
    /// An empty document held in memory.
    pub fn in_memory() -> Self {
        Self {
            driver: Tree::new(),
            cache: VersionCache::with_config(server_config()),
        }
    }
}

impl Default for Document<Tree> {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl Document<PersistentDriver> {
    /// Open (or create) a document stored under `config.path`.
    pub fn open(config: StoreConfig) -> Result<Self, CacheError> {
        Self::open_with(config, server_config())
    }

    pub fn open_with(config: StoreConfig, cache_config: CacheConfig) -> Result<Self, CacheError> {
        let store = std::sync::Arc::new(DocumentStore::open(config)?);
        let driver = PersistentDriver::open(store.clone())?;
        let cache = VersionCache::open(store, cache_config)?;
        Self::new(driver, cache)
    }
}

impl<D: Driver> Document<D> {
    /// Bind a driver to a cache. A cache that has never committed is seeded
    /// from the tree.
    pub fn new(driver: D, cache: VersionCache) -> Result<Self, CacheError> {
        let doc = Self { driver, cache };
        if doc.cache.clock() == 0 && doc.cache.storage().is_empty() {
            doc.seed_cache()?;
        }
        Ok(doc)
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn tree(&self) -> &Tree {
        self.driver.tree()
    }

    pub fn cache(&self) -> &VersionCache {
        &self.cache
    }

    /// Clock of the last committed change.
    pub fn clock(&self) -> u64 {
        self.cache.clock()
    }

    pub fn delta_since(&self, since: u64) -> Delta {
        self.cache.delta_since(since)
    }

    pub fn to_json(&self) -> Value {
        self.driver.tree().to_json()
    }

    /// Reduce a batch of client ops. Accepted ops are committed as one cache
    /// transaction; the tree is persisted afterwards.
    pub fn apply_ops(
        &mut self,
        ops: impl IntoIterator<Item = Op>,
    ) -> Result<Vec<ApplyResult>, CacheError> {
        let checkpoint = self.driver.tree().clone();
        let driver = &mut self.driver;
        let outcome = self.cache.transact(|writer| {
            let mut results = Vec::new();
            for op in ops {
                results.push(reducer::apply_op(driver, op));
                for change in driver.take_changes() {
                    mirror_change(writer, change)?;
                }
            }
            Ok::<_, CacheError>(results)
        });
        let results = self.settle(checkpoint, outcome)?;

        let written = self.driver.persist()?;
        log::debug!(
            "Applied {} ops at clock {} ({written} node records)",
            results.len(),
            self.cache.clock()
        );
        Ok(results)
    }

    /// Apply a batch from [`decode_ops`](crate::op::decode_ops). Records that
    /// failed to decode are answered with `Ignored` in their place; the rest
    /// go through [`apply_ops`](Self::apply_ops) as one transaction.
    pub fn apply_decoded(
        &mut self,
        decoded: Vec<Result<Op, RejectedOp>>,
    ) -> Result<Vec<ApplyResult>, CacheError> {
        let mut valid = Vec::new();
        let mut rejected = Vec::with_capacity(decoded.len());
        for record in decoded {
            match record {
                Ok(op) => {
                    valid.push(op);
                    rejected.push(None);
                }
                Err(record) => rejected.push(Some(record)),
            }
        }
        let mut applied = self.apply_ops(valid)?.into_iter();
        Ok(rejected
            .into_iter()
            .filter_map(|slot| match slot {
                None => applied.next(),
                Some(record) => Some(ApplyResult::rejected(&record)),
            })
            .collect())
    }

    /// Run `f` against the live root. Its writes are mirrored into the tree
    /// before the transaction commits.
    pub fn mutate<T, E, F>(&mut self, f: F) -> Result<T, E>
    where
        F: FnOnce(&LiveObject) -> Result<T, E>,
        E: From<CacheError>,
    {
        let checkpoint = self.driver.tree().clone();
        // Registers live only in the tree, so the cache cannot see their ids.
        let prefix = self.cache.next_mint_prefix();
        let reserved: BTreeSet<NodeId> = checkpoint.ids_with_prefix(&prefix).cloned().collect();

        let driver = &mut self.driver;
        let outcome = self
            .cache
            .mutate_then(reserved, f, |writer| mirror_writes(driver, writer));
        let value = self.settle(checkpoint, outcome)?;
        self.driver.persist().map_err(CacheError::from)?;
        Ok(value)
    }

    /// Keep the tree if the transaction committed, otherwise put it back.
    fn settle<T, E>(&mut self, checkpoint: Tree, outcome: Result<T, E>) -> Result<T, E> {
        if outcome.is_err() {
            log::warn!(
                "Transaction rolled back at clock {}, restoring {} tree nodes",
                self.cache.clock(),
                checkpoint.len()
            );
            self.driver.restore(checkpoint);
        }
        outcome
    }

    /// Write the whole tree into an empty cache.
    fn seed_cache(&self) -> Result<(), CacheError> {
        let tree = self.driver.tree();
        self.cache.transact(|writer| {
            let mut queue = VecDeque::from([ROOT_ID.to_string()]);
            while let Some(id) = queue.pop_front() {
                if let Some(data) = tree.get(&id).and_then(Node::object_data) {
                    for (key, value) in data {
                        writer.set_value(&id, key, value.clone())?;
                    }
                }
                for (key, child_id) in tree.children_of(&id) {
                    match tree.get(child_id) {
                        Some(Node::Register { data, .. }) => {
                            writer.set_value(&id, key, data.clone())?
                        }
                        Some(child) => {
                            writer.set_ref(&id, key, child_id, child.kind())?;
                            queue.push_back(child_id.clone());
                        }
                        None => {}
                    }
                }
            }
            Ok::<_, CacheError>(())
        })?;
        if self.cache.clock() > 0 {
            log::info!("Seeded version cache from {} tree nodes", tree.len());
        }
        Ok(())
    }
}

fn server_config() -> CacheConfig {
    CacheConfig {
        actor: Some(SERVER_ACTOR.to_string()),
    }
}

// ─── Tree → cache ─────────────────────────────────────────────────────

fn mirror_change(writer: &mut CacheWriter<'_>, change: TreeChange) -> Result<(), CacheError> {
    match change {
        TreeChange::Attached { id, node } => {
            let Some(parent) = node.parent() else {
                return Err(CacheError::Integrity(format!("attached node {id} has no parent")));
            };
            match &node {
                Node::Register { data, .. } => {
                    writer.set_value(&parent.parent_id, &parent.parent_key, data.clone())
                }
                _ => {
                    writer.set_ref(&parent.parent_id, &parent.parent_key, &id, node.kind())?;
                    for (key, value) in node.object_data().into_iter().flatten() {
                        writer.set_value(&id, key, value.clone())?;
                    }
                    Ok(())
                }
            }
        }
        TreeChange::Moved {
            parent_id, from, to, ..
        } => writer.move_key(&parent_id, &from, &to),
        TreeChange::Removed {
            parent_id,
            parent_key,
            ..
        } => writer.delete(&parent_id, &parent_key),
        TreeChange::DataSet { id, key, value } => writer.set_value(&id, &key, value),
        TreeChange::DataRemoved { id, key } => writer.delete(&id, &key),
    }
}

// ─── Cache → tree ─────────────────────────────────────────────────────

fn mirror_writes<D: Driver>(driver: &mut D, writer: &mut CacheWriter<'_>) -> Result<(), CacheError> {
    for write in writer.take_log() {
        let result = match write {
            CacheWrite::SetValue { node, key, value } => {
                set_value_in_tree(driver, writer, node, key, value)?
            }
            CacheWrite::SetRef {
                node,
                key,
                child,
                kind,
            } => driver.set_child(&child, Node::from_parts(kind, ParentRef::new(node, key), None), true),
            CacheWrite::Delete { node, key } => {
                driver.delete_child_key(&node, &key);
                Ok(())
            }
            CacheWrite::Move { node, from, to } => move_in_tree(driver, &node, &from, &to),
        };
        if let Err(e) = result {
            log::error!("Tree rejected a cache write: {e}");
            return Err(CacheError::Integrity(e.to_string()));
        }
    }
    driver.take_changes();
    Ok(())
}

fn set_value_in_tree<D: Driver>(
    driver: &mut D,
    writer: &mut CacheWriter<'_>,
    node: NodeId,
    key: String,
    value: Value,
) -> Result<Result<(), TreeError>, CacheError> {
    let Some(kind) = driver.get_node(&node).map(Node::kind) else {
        return Ok(Err(TreeError::NodeNotFound(node)));
    };
    Ok(match kind {
        CrdtKind::Object => {
            let mut data = JsonObject::new();
            data.insert(key, value);
            driver.set_object_data(&node, &data, true)
        }
        CrdtKind::Map | CrdtKind::List => {
            let id = loop {
                let id = writer.mint_id()?;
                if !driver.has_node(&id) {
                    break id;
                }
            };
            driver.set_child(&id, Node::register(ParentRef::new(node, key), value), true)
        }
        CrdtKind::Register => Err(TreeError::IllegalParent {
            parent_kind: kind,
            child_kind: CrdtKind::Register,
        }),
    })
}

fn move_in_tree<D: Driver>(driver: &mut D, node: &str, from: &str, to: &str) -> Result<(), TreeError> {
    let child = driver
        .get_child_at(node, from)
        .cloned()
        .ok_or_else(|| TreeError::NodeNotFound(format!("{node}[{from}]")))?;
    if let Some(occupant) = driver.get_child_at(node, to).cloned() {
        if occupant != child {
            driver.delete_node(&occupant);
        }
    }
    driver.move_sibling(&child, to)
}
