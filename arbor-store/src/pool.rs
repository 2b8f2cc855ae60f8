//! Mutation Pool: live wrappers over cache nodes.
//!
//! A wrapper (`LiveObject`, `LiveMap`, `LiveList`) is a shared handle to a
//! `LiveCell`. A cell is either detached, holding its contents in memory,
//! or bound to one node of one `VersionCache`:
//!
//! ```text
//!   LiveObject::new()          set(..) inside mutate        rollback
//!  ┌──────────────┐  attach   ┌──────────────────────┐  ┌──────────────┐
//!  │ detached     │ ────────► │ bound (cache, node)  │─►│ detached     │
//!  │ fields/items │  mint id  │ reads/writes go to   │  │ (snapshot    │
//!  └──────────────┘           │ the cache tables     │  │  restored)   │
//!                             └──────────────────────┘  └──────────────┘
//! ```
//!
//! The pool keeps one cell per bound node id, so every lookup of a node
//! yields handles that are `ptr_eq`.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};

use serde_json::Value;
use uuid::Uuid;

use crate::cache::tables::{CacheState, Tables};
use crate::cache::{CacheError, CacheInner, Entry};
use crate::node::{CrdtKind, NodeId};
use crate::position;

// ─── Registry ───────────────────────────────────────────────────────────

/// Wrapper registry of one cache instance.
#[derive(Debug, Default)]
pub(crate) struct Pool {
    /// One cell per bound node id
    wrappers: RefCell<HashMap<NodeId, Rc<LiveCell>>>,
    /// Cells bound by the open transaction, with their detached contents
    attached: RefCell<Vec<(NodeId, Rc<LiveCell>, Detached)>>,
}

impl Pool {
    /// The cell bound to `id`, created on first access.
    pub(crate) fn wrapper(&self, cache: &Rc<CacheInner>, id: &str, kind: CrdtKind) -> Rc<LiveCell> {
        self.wrappers
            .borrow_mut()
            .entry(id.to_string())
            .or_insert_with(|| {
                Rc::new(LiveCell {
                    kind,
                    binding: RefCell::new(Some(Binding::new(cache, id))),
                    detached: RefCell::new(Detached::empty(kind)),
                })
            })
            .clone()
    }

    fn adopt(&self, id: &str, cell: &Rc<LiveCell>, snapshot: Detached) {
        self.wrappers.borrow_mut().insert(id.to_string(), cell.clone());
        self.attached
            .borrow_mut()
            .push((id.to_string(), cell.clone(), snapshot));
    }

    /// The transaction committed: attachments are final, wrappers of
    /// dereferenced nodes are released.
    pub(crate) fn settle(&self, dereferenced: &[NodeId]) {
        self.attached.borrow_mut().clear();
        let mut wrappers = self.wrappers.borrow_mut();
        for id in dereferenced {
            wrappers.remove(id);
        }
    }

    /// The transaction rolled back: cells bound by it become detached again.
    pub(crate) fn restore(&self) {
        let attached = std::mem::take(&mut *self.attached.borrow_mut());
        let mut wrappers = self.wrappers.borrow_mut();
        for (id, cell, snapshot) in attached.into_iter().rev() {
            wrappers.remove(&id);
            *cell.binding.borrow_mut() = None;
            *cell.detached.borrow_mut() = snapshot;
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.wrappers.borrow().len()
    }
}

// ─── Cells ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Binding {
    cache: Weak<CacheInner>,
    instance: Uuid,
    id: NodeId,
}

impl Binding {
    fn new(cache: &Rc<CacheInner>, id: &str) -> Self {
        Self {
            cache: Rc::downgrade(cache),
            instance: cache.instance,
            id: id.to_string(),
        }
    }
}

/// Contents of a detached structure.
#[derive(Debug, Clone)]
enum Detached {
    /// Object and Map contents, in insertion order
    Fields(Vec<(String, LiveValue)>),
    /// List contents, in order
    Items(Vec<LiveValue>),
}

impl Detached {
    fn empty(kind: CrdtKind) -> Self {
        match kind {
            CrdtKind::List => Detached::Items(Vec::new()),
            _ => Detached::Fields(Vec::new()),
        }
    }

    fn children(&self) -> Vec<Rc<LiveCell>> {
        let values: Box<dyn Iterator<Item = &LiveValue>> = match self {
            Detached::Fields(fields) => Box::new(fields.iter().map(|(_, value)| value)),
            Detached::Items(items) => Box::new(items.iter()),
        };
        values.filter_map(LiveValue::cell).cloned().collect()
    }

    fn to_json(&self) -> Value {
        match self {
            Detached::Fields(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
            Detached::Items(items) => Value::Array(items.iter().map(LiveValue::to_json).collect()),
        }
    }
}

/// Shared state behind a wrapper handle.
#[derive(Debug)]
pub(crate) struct LiveCell {
    kind: CrdtKind,
    binding: RefCell<Option<Binding>>,
    detached: RefCell<Detached>,
}

impl LiveCell {
    fn detached(kind: CrdtKind) -> Rc<Self> {
        Rc::new(Self {
            kind,
            binding: RefCell::new(None),
            detached: RefCell::new(Detached::empty(kind)),
        })
    }

    fn id(&self) -> Option<NodeId> {
        self.binding.borrow().as_ref().map(|binding| binding.id.clone())
    }

    /// The cache and node this cell is bound to, if any.
    fn bound(&self) -> Result<Option<(Rc<CacheInner>, NodeId)>, CacheError> {
        match &*self.binding.borrow() {
            Some(binding) => binding
                .cache
                .upgrade()
                .map(|cache| Some((cache, binding.id.clone())))
                .ok_or_else(|| CacheError::Integrity(format!("cache of node {} was dropped", binding.id))),
            None => Ok(None),
        }
    }

    /// Run `write` against the cache of a bound cell, inside its transaction.
    fn with_txn<R>(
        cache: &Rc<CacheInner>,
        write: impl FnOnce(&mut CacheState) -> Result<R, CacheError>,
    ) -> Result<R, CacheError> {
        let mut state = cache.state_mut()?;
        if !state.in_transaction() {
            return Err(CacheError::NotInTransaction);
        }
        write(&mut state)
    }

    // ─── Keyed access (Object, Map) ───────────────────────────────────

    fn get_key(&self, key: &str) -> Option<LiveValue> {
        match self.bound().ok()? {
            Some((cache, id)) => {
                let state = cache.state.try_borrow().ok()?;
                let entry = state.tables.get(&id, key)?;
                Some(live_value(&cache, &state.tables, entry))
            }
            None => match &*self.detached.borrow() {
                Detached::Fields(fields) => fields
                    .iter()
                    .find(|(name, _)| name == key)
                    .map(|(_, value)| value.clone()),
                Detached::Items(_) => None,
            },
        }
    }

    fn set_key(&self, key: &str, value: LiveValue) -> Result<(), CacheError> {
        match self.bound()? {
            Some((cache, id)) => Self::with_txn(&cache, |state| write(&cache, state, &id, key, value)),
            None => {
                if let Detached::Fields(fields) = &mut *self.detached.borrow_mut() {
                    match fields.iter_mut().find(|(name, _)| name == key) {
                        Some((_, slot)) => *slot = value,
                        None => fields.push((key.to_string(), value)),
                    }
                }
                Ok(())
            }
        }
    }

    fn delete_key(&self, key: &str) -> Result<(), CacheError> {
        match self.bound()? {
            Some((cache, id)) => Self::with_txn(&cache, |state| state.delete(&id, key)),
            None => {
                if let Detached::Fields(fields) = &mut *self.detached.borrow_mut() {
                    fields.retain(|(name, _)| name != key);
                }
                Ok(())
            }
        }
    }

    fn keys(&self) -> Vec<String> {
        match self.bound() {
            Ok(Some((cache, id))) => {
                let keys = match cache.state.try_borrow() {
                    Ok(state) => state.tables.entries_of(&id).map(|(key, _)| key.clone()).collect(),
                    Err(_) => Vec::new(),
                };
                keys
            }
            Ok(None) => match &*self.detached.borrow() {
                Detached::Fields(fields) => fields.iter().map(|(key, _)| key.clone()).collect(),
                Detached::Items(_) => Vec::new(),
            },
            Err(_) => Vec::new(),
        }
    }

    fn to_json(&self) -> Value {
        match self.bound() {
            Ok(Some((cache, id))) => {
                let json = match cache.state.try_borrow() {
                    Ok(state) => state.tables.node_json(&id),
                    Err(_) => Value::Null,
                };
                json
            }
            Ok(None) => self.detached.borrow().to_json(),
            Err(_) => Value::Null,
        }
    }

    // ─── Positional access (List) ─────────────────────────────────────

    fn positions(tables: &Tables, id: &str) -> Vec<String> {
        tables.entries_of(id).map(|(key, _)| key.clone()).collect()
    }

    fn len(&self) -> usize {
        match self.bound() {
            Ok(Some((cache, id))) => {
                let len = match cache.state.try_borrow() {
                    Ok(state) => state.tables.entries_of(&id).count(),
                    Err(_) => 0,
                };
                len
            }
            Ok(None) => match &*self.detached.borrow() {
                Detached::Fields(fields) => fields.len(),
                Detached::Items(items) => items.len(),
            },
            Err(_) => 0,
        }
    }

    fn get_index(&self, index: usize) -> Option<LiveValue> {
        match self.bound().ok()? {
            Some((cache, id)) => {
                let state = cache.state.try_borrow().ok()?;
                let (_, entry) = state.tables.entries_of(&id).nth(index)?;
                Some(live_value(&cache, &state.tables, entry))
            }
            None => match &*self.detached.borrow() {
                Detached::Items(items) => items.get(index).cloned(),
                Detached::Fields(_) => None,
            },
        }
    }

    fn insert_index(&self, index: usize, value: LiveValue) -> Result<(), CacheError> {
        match self.bound()? {
            Some((cache, id)) => Self::with_txn(&cache, |state| {
                let positions = Self::positions(&state.tables, &id);
                if index > positions.len() {
                    return Err(CacheError::IndexOutOfBounds {
                        index,
                        len: positions.len(),
                    });
                }
                let lo = index.checked_sub(1).map(|i| positions[i].as_str());
                let hi = positions.get(index).map(String::as_str);
                let pos = position::between_opt(lo, hi);
                write(&cache, state, &id, &pos, value)
            }),
            None => {
                if let Detached::Items(items) = &mut *self.detached.borrow_mut() {
                    if index > items.len() {
                        return Err(CacheError::IndexOutOfBounds {
                            index,
                            len: items.len(),
                        });
                    }
                    items.insert(index, value);
                }
                Ok(())
            }
        }
    }

    fn delete_index(&self, index: usize) -> Result<(), CacheError> {
        match self.bound()? {
            Some((cache, id)) => Self::with_txn(&cache, |state| {
                let positions = Self::positions(&state.tables, &id);
                let pos = positions.get(index).ok_or(CacheError::IndexOutOfBounds {
                    index,
                    len: positions.len(),
                })?;
                state.delete(&id, pos)
            }),
            None => {
                if let Detached::Items(items) = &mut *self.detached.borrow_mut() {
                    if index >= items.len() {
                        return Err(CacheError::IndexOutOfBounds {
                            index,
                            len: items.len(),
                        });
                    }
                    items.remove(index);
                }
                Ok(())
            }
        }
    }

    fn move_index(&self, from: usize, to: usize) -> Result<(), CacheError> {
        match self.bound()? {
            Some((cache, id)) => Self::with_txn(&cache, |state| {
                let mut positions = Self::positions(&state.tables, &id);
                let len = positions.len();
                if from >= len || to >= len {
                    return Err(CacheError::IndexOutOfBounds {
                        index: from.max(to),
                        len,
                    });
                }
                if from == to {
                    return Ok(());
                }
                let current = positions.remove(from);
                let lo = to.checked_sub(1).map(|i| positions[i].as_str());
                let hi = positions.get(to).map(String::as_str);
                let pos = position::between_opt(lo, hi);
                state.move_key(&id, &current, &pos)
            }),
            None => {
                if let Detached::Items(items) = &mut *self.detached.borrow_mut() {
                    let len = items.len();
                    if from >= len || to >= len {
                        return Err(CacheError::IndexOutOfBounds {
                            index: from.max(to),
                            len,
                        });
                    }
                    let item = items.remove(from);
                    items.insert(to, item);
                }
                Ok(())
            }
        }
    }
}

// ─── Attachment ─────────────────────────────────────────────────────────

/// Write `value` at `(node, key)`, attaching structures recursively.
fn write(
    cache: &Rc<CacheInner>,
    state: &mut CacheState,
    node: &str,
    key: &str,
    value: LiveValue,
) -> Result<(), CacheError> {
    if let LiveValue::Json(json) = value {
        return state.set_value(node, key, json);
    }
    let Some(cell) = value.cell() else {
        return Ok(());
    };
    check_attachable(cell, cache.instance, &mut HashSet::new())?;
    attach(cache, state, node, key, cell)
}

/// Reject structures that are bound already, anywhere in the subtree.
/// Runs before any write so a rejected attach leaves no trace.
fn check_attachable(
    cell: &Rc<LiveCell>,
    instance: Uuid,
    seen: &mut HashSet<*const LiveCell>,
) -> Result<(), CacheError> {
    if let Some(binding) = &*cell.binding.borrow() {
        return Err(if binding.instance == instance {
            CacheError::AlreadyAttached(binding.id.clone())
        } else {
            CacheError::ForeignStructure
        });
    }
    if !seen.insert(Rc::as_ptr(cell)) {
        return Err(CacheError::AlreadyAttached("(detached structure used twice)".into()));
    }
    for child in cell.detached.borrow().children() {
        check_attachable(&child, instance, seen)?;
    }
    Ok(())
}

fn attach(
    cache: &Rc<CacheInner>,
    state: &mut CacheState,
    node: &str,
    key: &str,
    cell: &Rc<LiveCell>,
) -> Result<(), CacheError> {
    let id = state.mint_id(cache.config.actor.as_deref())?;
    state.set_ref(node, key, &id, cell.kind)?;

    let snapshot = cell.detached.replace(Detached::empty(cell.kind));
    *cell.binding.borrow_mut() = Some(Binding::new(cache, &id));
    cache.pool.adopt(&id, cell, snapshot.clone());

    match snapshot {
        Detached::Fields(fields) => {
            for (field, value) in fields {
                write(cache, state, &id, &field, value)?;
            }
        }
        Detached::Items(items) => {
            let mut last: Option<String> = None;
            for value in items {
                let pos = position::between_opt(last.as_deref(), None);
                write(cache, state, &id, &pos, value)?;
                last = Some(pos);
            }
        }
    }
    Ok(())
}

fn live_value(cache: &Rc<CacheInner>, tables: &Tables, entry: &Entry) -> LiveValue {
    match entry {
        Entry::Value(value) => LiveValue::Json(value.clone()),
        Entry::Ref(child) => {
            let kind = tables.live_kind(child).unwrap_or(CrdtKind::Object);
            LiveValue::wrap(cache.pool.wrapper(cache, child, kind))
        }
    }
}

// ─── Public handles ─────────────────────────────────────────────────────

/// A value read from or written to a live structure.
#[derive(Debug, Clone)]
pub enum LiveValue {
    Json(Value),
    Object(LiveObject),
    Map(LiveMap),
    List(LiveList),
}

impl LiveValue {
    fn wrap(cell: Rc<LiveCell>) -> Self {
        match cell.kind {
            CrdtKind::List => LiveValue::List(LiveList(cell)),
            CrdtKind::Map => LiveValue::Map(LiveMap(cell)),
            _ => LiveValue::Object(LiveObject(cell)),
        }
    }

    fn cell(&self) -> Option<&Rc<LiveCell>> {
        match self {
            LiveValue::Json(_) => None,
            LiveValue::Object(LiveObject(cell))
            | LiveValue::Map(LiveMap(cell))
            | LiveValue::List(LiveList(cell)) => Some(cell),
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            LiveValue::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&LiveObject> {
        match self {
            LiveValue::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&LiveMap> {
        match self {
            LiveValue::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&LiveList> {
        match self {
            LiveValue::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self.cell() {
            Some(cell) => cell.to_json(),
            None => self.as_json().cloned().unwrap_or(Value::Null),
        }
    }
}

impl From<Value> for LiveValue {
    fn from(value: Value) -> Self {
        LiveValue::Json(value)
    }
}

macro_rules! json_scalar {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for LiveValue {
                fn from(value: $ty) -> Self {
                    LiveValue::Json(Value::from(value))
                }
            }
        )*
    };
}

json_scalar!(&str, String, i32, i64, u32, u64, f64, bool);

impl From<LiveObject> for LiveValue {
    fn from(object: LiveObject) -> Self {
        LiveValue::Object(object)
    }
}

impl From<LiveMap> for LiveValue {
    fn from(map: LiveMap) -> Self {
        LiveValue::Map(map)
    }
}

impl From<LiveList> for LiveValue {
    fn from(list: LiveList) -> Self {
        LiveValue::List(list)
    }
}

/// Object with static fields and child structures.
#[derive(Debug, Clone)]
pub struct LiveObject(Rc<LiveCell>);

impl Default for LiveObject {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveObject {
    /// A detached, empty object.
    pub fn new() -> Self {
        LiveObject(LiveCell::detached(CrdtKind::Object))
    }

    pub(crate) fn bound(cell: Rc<LiveCell>) -> Self {
        LiveObject(cell)
    }

    /// Node id once attached.
    pub fn id(&self) -> Option<NodeId> {
        self.0.id()
    }

    pub fn get(&self, key: &str) -> Option<LiveValue> {
        self.0.get_key(key)
    }

    pub fn set(&self, key: &str, value: impl Into<LiveValue>) -> Result<(), CacheError> {
        self.0.set_key(key, value.into())
    }

    pub fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.0.delete_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.0.keys()
    }

    pub fn to_json(&self) -> Value {
        self.0.to_json()
    }

    /// Whether both handles wrap the same structure.
    pub fn ptr_eq(&self, other: &LiveObject) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// Map from string keys to values and child structures.
#[derive(Debug, Clone)]
pub struct LiveMap(Rc<LiveCell>);

impl Default for LiveMap {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveMap {
    pub fn new() -> Self {
        LiveMap(LiveCell::detached(CrdtKind::Map))
    }

    pub fn id(&self) -> Option<NodeId> {
        self.0.id()
    }

    pub fn get(&self, key: &str) -> Option<LiveValue> {
        self.0.get_key(key)
    }

    pub fn set(&self, key: &str, value: impl Into<LiveValue>) -> Result<(), CacheError> {
        self.0.set_key(key, value.into())
    }

    pub fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.0.delete_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_json(&self) -> Value {
        self.0.to_json()
    }

    pub fn ptr_eq(&self, other: &LiveMap) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// Ordered list; items live at fractional positions.
#[derive(Debug, Clone)]
pub struct LiveList(Rc<LiveCell>);

impl Default for LiveList {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveList {
    pub fn new() -> Self {
        LiveList(LiveCell::detached(CrdtKind::List))
    }

    pub fn id(&self) -> Option<NodeId> {
        self.0.id()
    }

    pub fn get(&self, index: usize) -> Option<LiveValue> {
        self.0.get_index(index)
    }

    pub fn push(&self, value: impl Into<LiveValue>) -> Result<(), CacheError> {
        let len = self.len();
        self.0.insert_index(len, value.into())
    }

    pub fn insert(&self, index: usize, value: impl Into<LiveValue>) -> Result<(), CacheError> {
        self.0.insert_index(index, value.into())
    }

    pub fn delete(&self, index: usize) -> Result<(), CacheError> {
        self.0.delete_index(index)
    }

    /// Move the item at `from` so that it ends up at index `to`.
    pub fn move_item(&self, from: usize, to: usize) -> Result<(), CacheError> {
        self.0.move_index(from, to)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_json(&self) -> Value {
        self.0.to_json()
    }

    pub fn ptr_eq(&self, other: &LiveList) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::VersionCache;
    use serde_json::json;

    #[test]
    fn test_detached_structures_edit_freely() {
        let list = LiveList::new();
        list.push(1).unwrap();
        list.push(3).unwrap();
        list.insert(1, 2).unwrap();
        list.move_item(0, 2).unwrap();
        assert_eq!(list.to_json(), json!([2, 3, 1]));
        assert!(list.id().is_none());

        let object = LiveObject::new();
        object.set("items", list).unwrap();
        object.set("title", "todo").unwrap();
        assert_eq!(object.to_json(), json!({"items": [2, 3, 1], "title": "todo"}));
    }

    #[test]
    fn test_write_outside_transaction_fails() {
        let cache = VersionCache::in_memory();
        let root = cache.root();
        assert_eq!(root.set("x", 1), Err(CacheError::NotInTransaction));
        assert!(root.get("x").is_none());
    }

    #[test]
    fn test_attach_mints_ids_and_binds() {
        let cache = VersionCache::in_memory();
        let list = LiveList::new();
        list.push("a").unwrap();
        list.push("b").unwrap();

        cache
            .mutate(|root| root.set("items", list.clone()))
            .unwrap();

        let id = list.id().unwrap();
        assert_eq!(id, "1:0");
        assert_eq!(cache.kind_of(&id), Some(CrdtKind::List));
        assert_eq!(cache.to_json(), json!({"items": ["a", "b"]}));

        // Same node, same handle.
        let fetched = cache.root().get("items").unwrap();
        assert!(fetched.as_list().unwrap().ptr_eq(&list));
        assert!(cache.root().ptr_eq(&cache.root()));
    }

    #[test]
    fn test_bound_list_operations() {
        let cache = VersionCache::in_memory();
        cache.mutate(|root| root.set("l", LiveList::new())).unwrap();
        let list = cache.root().get("l").unwrap().as_list().unwrap().clone();

        cache
            .mutate(|_| {
                list.push(1)?;
                list.push(2)?;
                list.insert(0, 0)?;
                list.move_item(2, 0)?;
                list.delete(1)
            })
            .unwrap();
        assert_eq!(list.to_json(), json!([2, 1]));
        assert_eq!(list.len(), 2);

        let err = cache.mutate(|_| list.insert(5, 9)).unwrap_err();
        assert_eq!(err, CacheError::IndexOutOfBounds { index: 5, len: 2 });
    }

    #[test]
    fn test_double_attach_rejected_without_partial_write() {
        let cache = VersionCache::in_memory();
        let shared = LiveMap::new();
        shared.set("k", 1).unwrap();

        let err = cache
            .mutate(|root| {
                root.set("a", shared.clone())?;
                root.set("b", shared.clone())
            })
            .unwrap_err();
        assert!(matches!(err, CacheError::AlreadyAttached(_)));
        assert_eq!(cache.clock(), 0);
        assert!(cache.storage().is_empty());
        // Rolled back: the map is detached again with its contents.
        assert!(shared.id().is_none());
        assert_eq!(shared.to_json(), json!({"k": 1}));
        assert_eq!(cache.inner_pool_len(), 1);
    }

    #[test]
    fn test_same_structure_twice_in_one_value_rejected() {
        let cache = VersionCache::in_memory();
        let inner = LiveObject::new();
        let outer = LiveList::new();
        outer.push(inner.clone()).unwrap();
        outer.push(inner).unwrap();

        let err = cache.mutate(|root| root.set("l", outer.clone())).unwrap_err();
        assert!(matches!(err, CacheError::AlreadyAttached(_)));
        assert_eq!(cache.clock(), 0);
    }

    #[test]
    fn test_foreign_structure_rejected() {
        let first = VersionCache::in_memory();
        let second = VersionCache::in_memory();
        let map = LiveMap::new();
        first.mutate(|root| root.set("m", map.clone())).unwrap();

        let err = second.mutate(|root| root.set("m", map.clone())).unwrap_err();
        assert_eq!(err, CacheError::ForeignStructure);
        assert!(second.storage().is_empty());
    }

    #[test]
    fn test_wrapper_unusable_after_failed_mutate() {
        let cache = VersionCache::in_memory();
        let mut escaped: Option<LiveObject> = None;
        let result: Result<(), CacheError> = cache.mutate(|root| {
            escaped = Some(root.clone());
            root.set("x", 1)?;
            Err(CacheError::Integrity("boom".into()))
        });
        assert!(result.is_err());

        let root = escaped.unwrap();
        assert_eq!(root.set("y", 2), Err(CacheError::NotInTransaction));
        assert!(root.get("x").is_none());
        assert_eq!(cache.clock(), 0);
    }

    #[test]
    fn test_deleted_node_wrapper_released() {
        let cache = VersionCache::in_memory();
        cache.mutate(|root| root.set("m", LiveMap::new())).unwrap();
        let map = cache.root().get("m").unwrap().as_map().unwrap().clone();
        cache.mutate(|root| root.delete("m")).unwrap();

        assert!(cache.root().get("m").is_none());
        assert!(matches!(
            cache.mutate(|_| map.set("k", 1)),
            Err(CacheError::Integrity(_))
        ));
    }
}
