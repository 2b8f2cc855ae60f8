//! Version Cache: transactional, versioned key/value image of the tree.
//!
//! Architecture:
//! ```text
//!   mutate(|root| ..)          transact(|w| ..)
//!        │ LiveObject               │ CacheWriter
//!        ▼                          ▼
//! ┌───────────────────────────────────────────────┐
//! │ CacheState                                    │
//! │  tables: storage / versions / latest / kinds  │
//! │  txn:    pending clock, undo log, write log   │──► commit ──► DocumentStore
//! └───────────────────────────────────────────────┘        (one WriteBatch)
//!        │
//!        ▼
//!   delta_since(v) ──► Delta [removed, values, refs]
//! ```
//!
//! A transaction commits at `clock + 1` only if it wrote something. An
//! error, a panic, or a failed store write rolls it back completely.

pub mod delta;
pub mod tables;

use std::cell::{Cell, RefCell, RefMut};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::node::{CrdtKind, NodeId, ROOT_ID};
use crate::pool::{LiveObject, Pool};
use crate::storage::{DocumentStore, StoreError};

pub use delta::Delta;
pub use tables::SlotKey;
use tables::{CacheState, Tables};

/// What a cache slot holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Entry {
    /// Plain JSON value
    Value(Value),
    /// Child node id
    Ref(NodeId),
}

/// Kind and lifetime of a node known to the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub kind: CrdtKind,
    /// Clock of the transaction that created the node
    pub created: u64,
    /// Clock of the transaction that detached it, if any
    pub dereferenced: Option<u64>,
}

impl NodeRecord {
    pub fn new(kind: CrdtKind, created: u64) -> Self {
        Self {
            kind,
            created,
            dereferenced: None,
        }
    }
}

/// A top-level write, as issued by a transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheWrite {
    SetValue { node: NodeId, key: String, value: Value },
    SetRef { node: NodeId, key: String, child: NodeId, kind: CrdtKind },
    Delete { node: NodeId, key: String },
    Move { node: NodeId, from: String, to: String },
}

/// Cache configuration.
#[derive(Debug, Clone, Default)]
pub struct CacheConfig {
    /// Prefix for minted node ids (default: none, ids are `"{clock}:{n}"`)
    pub actor: Option<String>,
}

/// Cache errors. All of them abort the enclosing transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheError {
    /// A write was attempted with no transaction open
    NotInTransaction,
    /// A transaction is already open on this cache
    TransactionInProgress,
    /// The structure is already attached (at the given node)
    AlreadyAttached(String),
    /// The structure belongs to another cache instance
    ForeignStructure,
    /// List index outside `0..=len`
    IndexOutOfBounds { index: usize, len: usize },
    /// The write would break a table invariant
    Integrity(String),
    /// Persisting the commit failed
    Store(StoreError),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::NotInTransaction => write!(f, "Can only mutate within a transaction"),
            CacheError::TransactionInProgress => write!(f, "A transaction is already in progress"),
            CacheError::AlreadyAttached(at) => write!(f, "Structure is already attached: {at}"),
            CacheError::ForeignStructure => {
                write!(f, "Structure was created by a different cache instance")
            }
            CacheError::IndexOutOfBounds { index, len } => {
                write!(f, "Index {index} out of bounds for list of length {len}")
            }
            CacheError::Integrity(e) => write!(f, "Integrity violation: {e}"),
            CacheError::Store(e) => write!(f, "Store error: {e}"),
        }
    }
}

impl std::error::Error for CacheError {}

impl From<StoreError> for CacheError {
    fn from(e: StoreError) -> Self {
        CacheError::Store(e)
    }
}

/// State shared between a cache handle and its live wrappers.
#[derive(Debug)]
pub(crate) struct CacheInner {
    pub(crate) instance: Uuid,
    pub(crate) config: CacheConfig,
    pub(crate) state: RefCell<CacheState>,
    /// Clock of the last commit, readable while a transaction holds `state`
    clock: Cell<u64>,
    pub(crate) pool: Pool,
    store: Option<Arc<DocumentStore>>,
}

impl CacheInner {
    pub(crate) fn state_mut(&self) -> Result<RefMut<'_, CacheState>, CacheError> {
        self.state
            .try_borrow_mut()
            .map_err(|_| CacheError::TransactionInProgress)
    }

    fn writer<'a>(&'a self, state: &'a mut CacheState) -> CacheWriter<'a> {
        CacheWriter {
            state,
            actor: self.config.actor.as_deref(),
        }
    }

    fn begin(&self, reserved: BTreeSet<NodeId>) -> Result<(), CacheError> {
        self.state_mut()?.begin(reserved)
    }

    /// Persist and close the open transaction. Returns whether it wrote.
    fn commit(&self) -> Result<bool, CacheError> {
        let mut state = self.state_mut()?;
        let Some(commit) = state.pending_commit() else {
            state.finish();
            drop(state);
            self.pool.settle(&[]);
            return Ok(false);
        };

        if let Some(store) = &self.store {
            if let Err(err) = store.commit_cache(&commit) {
                log::error!("Cache commit at clock {} failed: {err}", commit.clock);
                state.rollback();
                drop(state);
                self.pool.restore();
                return Err(err.into());
            }
        }

        let dereferenced = state.finish();
        self.clock.set(state.tables.clock);
        drop(state);
        self.pool.settle(&dereferenced);
        log::debug!(
            "Committed clock {} ({} writes, {} dereferenced)",
            commit.clock,
            commit.writes.len(),
            dereferenced.len()
        );
        Ok(true)
    }

    fn rollback(&self) {
        match self.state.try_borrow_mut() {
            Ok(mut state) => state.rollback(),
            Err(_) => log::error!("Cache state busy during rollback"),
        }
        self.pool.restore();
    }
}

/// Rolls the open transaction back unless committed.
struct TxnGuard<'a> {
    inner: &'a CacheInner,
    armed: bool,
}

impl<'a> TxnGuard<'a> {
    fn new(inner: &'a CacheInner) -> Self {
        Self { inner, armed: true }
    }

    fn commit(mut self) -> Result<bool, CacheError> {
        self.armed = false;
        self.inner.commit()
    }
}

impl Drop for TxnGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.rollback();
        }
    }
}

/// Raw write handle for one transaction.
pub struct CacheWriter<'a> {
    state: &'a mut CacheState,
    actor: Option<&'a str>,
}

impl CacheWriter<'_> {
    /// Store a plain value. A child previously at the slot is dereferenced.
    pub fn set_value(&mut self, node: &str, key: &str, value: Value) -> Result<(), CacheError> {
        self.state.set_value(node, key, value)
    }

    /// Point a slot at a new child node.
    pub fn set_ref(&mut self, node: &str, key: &str, child: &str, kind: CrdtKind) -> Result<(), CacheError> {
        self.state.set_ref(node, key, child, kind)
    }

    /// Clear a slot, dereferencing a child subtree. No-op on empty slots.
    pub fn delete(&mut self, node: &str, key: &str) -> Result<(), CacheError> {
        self.state.delete(node, key)
    }

    /// Move a slot's entry to another key of the same node.
    pub fn move_key(&mut self, node: &str, from: &str, to: &str) -> Result<(), CacheError> {
        self.state.move_key(node, from, to)
    }

    /// A node id unused by this cache.
    pub fn mint_id(&mut self) -> Result<NodeId, CacheError> {
        self.state.mint_id(self.actor)
    }

    pub fn get(&self, node: &str, key: &str) -> Option<&Entry> {
        self.state.tables.get(node, key)
    }

    pub fn kind_of(&self, node: &str) -> Option<CrdtKind> {
        self.state.tables.live_kind(node)
    }

    /// Clock this transaction will commit at.
    pub fn clock(&self) -> u64 {
        self.state.tables.clock + 1
    }

    /// Drain the writes issued so far.
    pub fn take_log(&mut self) -> Vec<CacheWrite> {
        self.state.take_log()
    }
}

/// Versioned cache for one document.
pub struct VersionCache {
    inner: Rc<CacheInner>,
}

impl std::fmt::Debug for VersionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionCache")
            .field("instance", &self.inner.instance)
            .field("clock", &self.clock())
            .finish()
    }
}

impl Default for VersionCache {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl VersionCache {
    /// An empty cache with no persistence.
    pub fn in_memory() -> Self {
        Self::build(Tables::new(), None, CacheConfig::default())
    }

    pub fn with_config(config: CacheConfig) -> Self {
        Self::build(Tables::new(), None, config)
    }

    /// Load the cache from `store`; every commit is written back to it.
    pub fn open(store: Arc<DocumentStore>, config: CacheConfig) -> Result<Self, CacheError> {
        let image = store.load_cache()?;
        log::info!(
            "Loaded version cache at clock {} ({} entries, {} versions)",
            image.clock,
            image.storage.len(),
            image.versions.len()
        );
        Ok(Self::build(Tables::from_image(image), Some(store), config))
    }

    fn build(tables: Tables, store: Option<Arc<DocumentStore>>, config: CacheConfig) -> Self {
        Self {
            inner: Rc::new(CacheInner {
                instance: Uuid::new_v4(),
                config,
                clock: Cell::new(tables.clock),
                state: RefCell::new(CacheState::new(tables)),
                pool: Pool::default(),
                store,
            }),
        }
    }

    // ─── Reads ────────────────────────────────────────────────────────

    /// Identifies this cache instance; structures bound to another
    /// instance cannot be attached here.
    pub fn instance(&self) -> Uuid {
        self.inner.instance
    }

    /// Clock of the last committed transaction.
    pub fn clock(&self) -> u64 {
        self.inner.clock.get()
    }

    pub fn in_transaction(&self) -> bool {
        self.read(CacheState::in_transaction).unwrap_or(true)
    }

    pub fn get(&self, node: &str, key: &str) -> Option<Entry> {
        self.read(|state| state.tables.get(node, key).cloned()).flatten()
    }

    /// Kind of a node that is currently referenced.
    pub fn kind_of(&self, node: &str) -> Option<CrdtKind> {
        self.read(|state| state.tables.live_kind(node)).flatten()
    }

    /// Copy of the current-state table.
    pub fn storage(&self) -> BTreeMap<SlotKey, Entry> {
        self.read(|state| state.tables.storage.clone()).unwrap_or_default()
    }

    /// Number of rows in the versions table.
    pub fn version_count(&self) -> usize {
        self.read(|state| state.tables.versions.len()).unwrap_or_default()
    }

    /// Everything that changed after clock `since`; a full snapshot for 0.
    pub fn delta_since(&self, since: u64) -> Delta {
        self.read(|state| Delta::compute(&state.tables, since)).unwrap_or_default()
    }

    pub fn to_json(&self) -> Value {
        self.read(|state| state.tables.to_json()).unwrap_or(Value::Null)
    }

    /// Run `f` on the tables. Inside a `transact` callback the writer holds
    /// them, so this returns `None`; read through the [`CacheWriter`] there.
    fn read<R>(&self, f: impl FnOnce(&CacheState) -> R) -> Option<R> {
        match self.inner.state.try_borrow() {
            Ok(state) => Some(f(&state)),
            Err(_) => {
                log::warn!("Cache read during a raw transaction, use the CacheWriter instead");
                None
            }
        }
    }

    /// Live handle on the root object.
    pub fn root(&self) -> LiveObject {
        LiveObject::bound(self.inner.pool.wrapper(&self.inner, ROOT_ID, CrdtKind::Object))
    }

    // ─── Transactions ─────────────────────────────────────────────────

    /// Run `f` with a raw writer inside one transaction.
    ///
    /// Live wrappers of this cache must not be used from `f`.
    pub fn transact<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut CacheWriter<'_>) -> Result<T, E>,
        E: From<CacheError>,
    {
        self.inner.begin(BTreeSet::new())?;
        let guard = TxnGuard::new(&self.inner);
        let value = {
            let mut state = self.inner.state_mut()?;
            let mut writer = self.inner.writer(&mut state);
            f(&mut writer)?
        };
        guard.commit()?;
        Ok(value)
    }

    /// Run `f` against the live root inside one transaction.
    pub fn mutate<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&LiveObject) -> Result<T, E>,
        E: From<CacheError>,
    {
        self.mutate_then(BTreeSet::new(), f, |_| Ok(()))
    }

    /// Prefix shared by every id the next transaction can mint.
    pub(crate) fn next_mint_prefix(&self) -> String {
        tables::mint_prefix(self.inner.config.actor.as_deref(), self.clock() + 1)
    }

    /// `mutate`, with a final raw step that runs after `f` and before commit.
    /// Ids in `reserved` are never minted.
    pub(crate) fn mutate_then<T, E, F, G>(
        &self,
        reserved: BTreeSet<NodeId>,
        f: F,
        before_commit: G,
    ) -> Result<T, E>
    where
        F: FnOnce(&LiveObject) -> Result<T, E>,
        G: FnOnce(&mut CacheWriter<'_>) -> Result<(), CacheError>,
        E: From<CacheError>,
    {
        self.inner.begin(reserved)?;
        let guard = TxnGuard::new(&self.inner);
        let root = self.root();
        let value = f(&root)?;
        {
            let mut state = self.inner.state_mut()?;
            let mut writer = self.inner.writer(&mut state);
            before_commit(&mut writer)?;
        }
        guard.commit()?;
        Ok(value)
    }

    #[cfg(test)]
    pub(crate) fn inner_pool_len(&self) -> usize {
        self.inner.pool.len()
    }
}
