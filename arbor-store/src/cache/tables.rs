//! Version Cache tables and the open transaction.
//!
//! ```text
//! storage  : (node, key)        → Entry            current state
//! versions : (node, key, clock) → Option<Entry>    append-only, None = tombstone
//! latest   : (node, key)        → clock            newest row in `versions`
//! kinds    : node               → NodeRecord       kind + dereference clock
//! ```
//!
//! Every write inside a transaction lands in `storage`, `versions` and
//! `latest` at the pending clock and pushes the previous cell contents onto
//! an undo log, so rollback is exact.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use super::{CacheError, CacheWrite, Entry, NodeRecord};
use crate::node::{CrdtKind, NodeId, ROOT_ID};
use crate::storage::{CacheCommit, CacheImage};

/// `(node, key)` address of a cache slot.
pub type SlotKey = (NodeId, String);

/// In-memory image of the cache tables.
#[derive(Debug, Clone)]
pub struct Tables {
    pub(crate) storage: BTreeMap<SlotKey, Entry>,
    pub(crate) versions: BTreeMap<(NodeId, String, u64), Option<Entry>>,
    pub(crate) latest: BTreeMap<SlotKey, u64>,
    pub(crate) kinds: BTreeMap<NodeId, NodeRecord>,
    pub(crate) clock: u64,
}

impl Default for Tables {
    fn default() -> Self {
        Self::new()
    }
}

impl Tables {
    pub fn new() -> Self {
        let mut kinds = BTreeMap::new();
        kinds.insert(ROOT_ID.to_string(), NodeRecord::new(CrdtKind::Object, 0));
        Self {
            storage: BTreeMap::new(),
            versions: BTreeMap::new(),
            latest: BTreeMap::new(),
            kinds,
            clock: 0,
        }
    }

    /// Rebuild the tables from a persisted image.
    pub fn from_image(image: CacheImage) -> Self {
        let mut tables = Self::new();
        tables.clock = image.clock;
        for (node, key, entry) in image.storage {
            tables.storage.insert((node, key), entry);
        }
        for (node, key, clock, entry) in image.versions {
            let newest = tables.latest.entry((node.clone(), key.clone())).or_insert(clock);
            *newest = (*newest).max(clock);
            tables.versions.insert((node, key, clock), entry);
        }
        for (id, record) in image.kinds {
            tables.kinds.insert(id, record);
        }
        tables
    }

    pub fn get(&self, node: &str, key: &str) -> Option<&Entry> {
        self.storage.get(&(node.to_string(), key.to_string()))
    }

    /// Entries of one node, ordered by key.
    pub fn entries_of<'a>(&'a self, node: &'a str) -> impl Iterator<Item = (&'a String, &'a Entry)> + 'a {
        self.storage
            .range((node.to_string(), String::new())..)
            .take_while(move |((owner, _), _)| owner == node)
            .map(|((_, key), entry)| (key, entry))
    }

    /// Kind of a node that is currently referenced.
    pub fn live_kind(&self, node: &str) -> Option<CrdtKind> {
        self.kinds
            .get(node)
            .filter(|record| record.dereferenced.is_none())
            .map(|record| record.kind)
    }

    /// Plain-JSON view starting at the root.
    pub fn to_json(&self) -> Value {
        self.node_json(ROOT_ID)
    }

    pub fn node_json(&self, node: &str) -> Value {
        let entries = self.entries_of(node).map(|(key, entry)| {
            let value = match entry {
                Entry::Value(value) => value.clone(),
                Entry::Ref(child) => self.node_json(child),
            };
            (key.clone(), value)
        });
        match self.live_kind(node) {
            Some(CrdtKind::List) => Value::Array(entries.map(|(_, value)| value).collect()),
            _ => Value::Object(entries.collect()),
        }
    }
}

/// Undo record: the previous content of one table cell.
#[derive(Debug)]
enum Undo {
    Storage(SlotKey, Option<Entry>),
    Version((NodeId, String, u64), Option<Option<Entry>>),
    Latest(SlotKey, Option<u64>),
    Kind(NodeId, Option<NodeRecord>),
}

/// An open transaction.
#[derive(Debug)]
pub(crate) struct Txn {
    /// Clock this transaction commits at
    pub(crate) clock: u64,
    undo: Vec<Undo>,
    /// Top-level writes, in order
    pub(crate) log: Vec<CacheWrite>,
    touched: BTreeSet<SlotKey>,
    kinds_touched: BTreeSet<NodeId>,
    minted: u64,
    /// Ids known to be taken outside the cache tables
    reserved: BTreeSet<NodeId>,
}

/// Tables plus the transaction currently open on them.
#[derive(Debug, Default)]
pub(crate) struct CacheState {
    pub(crate) tables: Tables,
    pub(crate) txn: Option<Txn>,
}

impl CacheState {
    pub(crate) fn new(tables: Tables) -> Self {
        Self { tables, txn: None }
    }

    // ─── Transaction lifecycle ────────────────────────────────────────

    pub(crate) fn begin(&mut self, reserved: BTreeSet<NodeId>) -> Result<(), CacheError> {
        if self.txn.is_some() {
            return Err(CacheError::TransactionInProgress);
        }
        self.txn = Some(Txn {
            clock: self.tables.clock + 1,
            undo: Vec::new(),
            log: Vec::new(),
            touched: BTreeSet::new(),
            kinds_touched: BTreeSet::new(),
            minted: 0,
            reserved,
        });
        Ok(())
    }

    pub(crate) fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    pub(crate) fn pending_clock(&self) -> Result<u64, CacheError> {
        self.txn.as_ref().map(|txn| txn.clock).ok_or(CacheError::NotInTransaction)
    }

    /// The commit to persist, or `None` when nothing was written.
    pub(crate) fn pending_commit(&self) -> Option<CacheCommit> {
        let txn = self.txn.as_ref()?;
        if txn.touched.is_empty() && txn.kinds_touched.is_empty() {
            return None;
        }
        let writes = txn
            .touched
            .iter()
            .map(|(node, key)| {
                let entry = self.tables.storage.get(&(node.clone(), key.clone())).cloned();
                (node.clone(), key.clone(), entry)
            })
            .collect();
        let kinds = txn
            .kinds_touched
            .iter()
            .filter_map(|id| self.tables.kinds.get(id).map(|record| (id.clone(), record.clone())))
            .collect();
        Some(CacheCommit {
            clock: txn.clock,
            writes,
            kinds,
        })
    }

    /// Close the transaction, advancing the clock if it wrote anything.
    /// Returns the ids dereferenced by it.
    pub(crate) fn finish(&mut self) -> Vec<NodeId> {
        let Some(txn) = self.txn.take() else {
            return Vec::new();
        };
        if txn.touched.is_empty() && txn.kinds_touched.is_empty() {
            return Vec::new();
        }
        self.tables.clock = txn.clock;
        txn.kinds_touched
            .into_iter()
            .filter(|id| {
                self.tables
                    .kinds
                    .get(id)
                    .is_some_and(|record| record.dereferenced.is_some())
            })
            .collect()
    }

    /// Undo every write of the open transaction and close it.
    pub(crate) fn rollback(&mut self) {
        let Some(txn) = self.txn.take() else { return };
        for undo in txn.undo.into_iter().rev() {
            match undo {
                Undo::Storage(slot, prev) => restore(&mut self.tables.storage, slot, prev),
                Undo::Version(slot, prev) => restore(&mut self.tables.versions, slot, prev),
                Undo::Latest(slot, prev) => restore(&mut self.tables.latest, slot, prev),
                Undo::Kind(id, prev) => restore(&mut self.tables.kinds, id, prev),
            }
        }
        log::debug!("Rolled back cache transaction at clock {}", txn.clock);
    }

    pub(crate) fn take_log(&mut self) -> Vec<CacheWrite> {
        self.txn
            .as_mut()
            .map(|txn| std::mem::take(&mut txn.log))
            .unwrap_or_default()
    }

    /// A fresh node id, unique among known and reserved nodes.
    pub(crate) fn mint_id(&mut self, actor: Option<&str>) -> Result<NodeId, CacheError> {
        let txn = self.txn.as_mut().ok_or(CacheError::NotInTransaction)?;
        let prefix = mint_prefix(actor, txn.clock);
        loop {
            let id = format!("{prefix}{}", txn.minted);
            txn.minted += 1;
            if !self.tables.kinds.contains_key(&id) && !txn.reserved.contains(&id) {
                return Ok(id);
            }
        }
    }

    // ─── Writes ───────────────────────────────────────────────────────

    /// Store a plain value at `(node, key)`.
    pub(crate) fn set_value(&mut self, node: &str, key: &str, value: Value) -> Result<(), CacheError> {
        self.require_live(node)?;
        if let Some(Entry::Ref(previous)) = self.tables.get(node, key).cloned() {
            self.dereference(&previous)?;
        }
        self.record(node, key, Some(Entry::Value(value.clone())))?;
        self.log(CacheWrite::SetValue {
            node: node.to_string(),
            key: key.to_string(),
            value,
        })
    }

    /// Point `(node, key)` at a new child node of `kind`.
    pub(crate) fn set_ref(
        &mut self,
        node: &str,
        key: &str,
        child: &str,
        kind: CrdtKind,
    ) -> Result<(), CacheError> {
        self.require_live(node)?;
        if self.tables.live_kind(child).is_some() {
            return Err(CacheError::Integrity(format!("node {child} is already referenced")));
        }
        if kind == CrdtKind::Register {
            return Err(CacheError::Integrity(format!(
                "register {child} must be stored as a value"
            )));
        }
        if let Some(Entry::Ref(previous)) = self.tables.get(node, key).cloned() {
            self.dereference(&previous)?;
        }
        let clock = self.pending_clock()?;
        self.put_kind(child, NodeRecord::new(kind, clock))?;
        self.record(node, key, Some(Entry::Ref(child.to_string())))?;
        self.log(CacheWrite::SetRef {
            node: node.to_string(),
            key: key.to_string(),
            child: child.to_string(),
            kind,
        })
    }

    /// Remove `(node, key)`; a referenced child is dereferenced with its
    /// subtree. No-op when the slot is empty.
    pub(crate) fn delete(&mut self, node: &str, key: &str) -> Result<(), CacheError> {
        if self.txn.is_none() {
            return Err(CacheError::NotInTransaction);
        }
        let Some(entry) = self.tables.get(node, key).cloned() else {
            return Ok(());
        };
        if let Entry::Ref(child) = entry {
            self.dereference(&child)?;
        }
        self.record(node, key, None)?;
        self.log(CacheWrite::Delete {
            node: node.to_string(),
            key: key.to_string(),
        })
    }

    /// Move the entry at `(node, from)` to `(node, to)`, replacing any
    /// occupant of `to`.
    pub(crate) fn move_key(&mut self, node: &str, from: &str, to: &str) -> Result<(), CacheError> {
        self.require_live(node)?;
        if from == to {
            return Ok(());
        }
        let entry = self
            .tables
            .get(node, from)
            .cloned()
            .ok_or_else(|| CacheError::Integrity(format!("nothing to move at {node}[{from:?}]")))?;
        if let Some(Entry::Ref(occupant)) = self.tables.get(node, to).cloned() {
            self.dereference(&occupant)?;
        }
        self.record(node, to, Some(entry))?;
        self.record(node, from, None)?;
        self.log(CacheWrite::Move {
            node: node.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        })
    }

    /// Tombstone every key of `id` and its descendants, and mark them
    /// dereferenced at the pending clock.
    fn dereference(&mut self, id: &str) -> Result<(), CacheError> {
        let clock = self.pending_clock()?;
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            let record = match self.tables.kinds.get(&current) {
                Some(record) if record.dereferenced.is_none() => record.clone(),
                _ => continue,
            };
            self.put_kind(
                &current,
                NodeRecord {
                    dereferenced: Some(clock),
                    ..record
                },
            )?;

            let entries: Vec<(String, Entry)> = self
                .tables
                .entries_of(&current)
                .map(|(key, entry)| (key.clone(), entry.clone()))
                .collect();
            for (key, entry) in entries {
                if let Entry::Ref(child) = entry {
                    stack.push(child);
                }
                self.record(&current, &key, None)?;
            }
        }
        Ok(())
    }

    fn require_live(&self, node: &str) -> Result<(), CacheError> {
        if self.txn.is_none() {
            return Err(CacheError::NotInTransaction);
        }
        match self.tables.live_kind(node) {
            Some(_) => Ok(()),
            None => Err(CacheError::Integrity(format!("write under unknown node {node}"))),
        }
    }

    fn log(&mut self, write: CacheWrite) -> Result<(), CacheError> {
        let txn = self.txn.as_mut().ok_or(CacheError::NotInTransaction)?;
        txn.log.push(write);
        Ok(())
    }

    fn put_kind(&mut self, id: &str, record: NodeRecord) -> Result<(), CacheError> {
        let txn = self.txn.as_mut().ok_or(CacheError::NotInTransaction)?;
        let prev = self.tables.kinds.insert(id.to_string(), record);
        txn.undo.push(Undo::Kind(id.to_string(), prev));
        txn.kinds_touched.insert(id.to_string());
        Ok(())
    }

    /// Write one cell in `storage`, `versions` and `latest`.
    fn record(&mut self, node: &str, key: &str, entry: Option<Entry>) -> Result<(), CacheError> {
        let txn = self.txn.as_mut().ok_or(CacheError::NotInTransaction)?;
        log::trace!("cache write {node}[{key:?}] @{}: {entry:?}", txn.clock);

        let slot: SlotKey = (node.to_string(), key.to_string());
        let prev = match &entry {
            Some(entry) => self.tables.storage.insert(slot.clone(), entry.clone()),
            None => self.tables.storage.remove(&slot),
        };
        txn.undo.push(Undo::Storage(slot.clone(), prev));

        let version = (node.to_string(), key.to_string(), txn.clock);
        let prev = self.tables.versions.insert(version.clone(), entry);
        txn.undo.push(Undo::Version(version, prev));

        let prev = self.tables.latest.insert(slot.clone(), txn.clock);
        txn.undo.push(Undo::Latest(slot.clone(), prev));

        txn.touched.insert(slot);
        Ok(())
    }
}

fn restore<K: Ord, V>(table: &mut BTreeMap<K, V>, key: K, prev: Option<V>) {
    match prev {
        Some(value) => {
            table.insert(key, value);
        }
        None => {
            table.remove(&key);
        }
    }
}

/// `"{actor}:{clock}:"`, or `"{clock}:"` without an actor.
pub(crate) fn mint_prefix(actor: Option<&str>, clock: u64) -> String {
    match actor {
        Some(actor) => format!("{actor}:{clock}:"),
        None => format!("{clock}:"),
    }
}
