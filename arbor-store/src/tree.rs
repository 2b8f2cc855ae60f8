//! In-memory node tree with a parent/key reverse index.
//!
//! Architecture:
//! ```text
//! ┌──────────────────────────────┐    ┌──────────────────────────────────┐
//! │ nodes: id → Node             │    │ children: parent_id → {key → id} │
//! │ (arena, owns parent refs)    │◄──►│ (reverse index, BTreeMap so list │
//! │                              │    │  siblings iterate by position)   │
//! └──────────────────────────────┘    └──────────────────────────────────┘
//!                 │
//!                 ▼
//!        changes: Vec<TreeChange>   (drained by the document / persistence)
//! ```
//!
//! Both containers are updated together by every mutating primitive. The
//! index is only derived from scratch in [`Tree::build`], when loading
//! persisted nodes.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde_json::Value;

use crate::node::{CrdtKind, JsonObject, Node, NodeId, ParentRef, ROOT_ID};

/// Structural failures of tree primitives.
#[derive(Debug, Clone, PartialEq)]
pub enum TreeError {
    /// Target node does not exist
    NodeNotFound(NodeId),
    /// Parent of the node being attached does not exist
    ParentNotFound(NodeId),
    /// A node with this id already exists
    DuplicateId(NodeId),
    /// Node carries no parent reference
    MissingParent(NodeId),
    /// Parent kind cannot hold a child of this kind
    IllegalParent {
        parent_kind: CrdtKind,
        child_kind: CrdtKind,
    },
    /// Slot already holds a child node or a static data field
    SlotOccupied { parent_id: NodeId, key: String },
    /// Node is not a child of a List
    NotAListChild(NodeId),
}

impl std::fmt::Display for TreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TreeError::NodeNotFound(id) => write!(f, "Node not found: {id}"),
            TreeError::ParentNotFound(id) => write!(f, "Parent not found: {id}"),
            TreeError::DuplicateId(id) => write!(f, "Node already exists: {id}"),
            TreeError::MissingParent(id) => write!(f, "Node has no parent reference: {id}"),
            TreeError::IllegalParent {
                parent_kind,
                child_kind,
            } => write!(f, "A {child_kind} cannot be a child of a {parent_kind}"),
            TreeError::SlotOccupied { parent_id, key } => {
                write!(f, "Slot already occupied: {parent_id}[{key:?}]")
            }
            TreeError::NotAListChild(id) => write!(f, "Node is not a list child: {id}"),
        }
    }
}

impl std::error::Error for TreeError {}

/// A single effect of a tree primitive, in application order.
#[derive(Debug, Clone, PartialEq)]
pub enum TreeChange {
    /// A node was created and attached at its parent ref.
    Attached { id: NodeId, node: Node },
    /// A list child moved to another position.
    Moved {
        id: NodeId,
        parent_id: NodeId,
        from: String,
        to: String,
    },
    /// The node at `(parent_id, parent_key)` and its subtree were deleted.
    /// `ids` lists every deleted node, subtree root first.
    Removed {
        parent_id: NodeId,
        parent_key: String,
        ids: Vec<NodeId>,
    },
    /// A static field was written on an Object.
    DataSet { id: NodeId, key: String, value: Value },
    /// A static field was removed from an Object.
    DataRemoved { id: NodeId, key: String },
}

/// What reconstruction had to discard.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildReport {
    /// Nodes dropped as unreachable or as losing a duplicate slot claim
    pub dropped_nodes: Vec<NodeId>,
    /// Object data fields dropped because a child node holds the same key
    pub dropped_fields: Vec<(NodeId, String)>,
    /// The persisted root was missing or malformed and was replaced
    pub root_replaced: bool,
}

impl BuildReport {
    pub fn is_clean(&self) -> bool {
        self.dropped_nodes.is_empty() && self.dropped_fields.is_empty() && !self.root_replaced
    }
}

/// The node tree.
#[derive(Debug, Clone)]
pub struct Tree {
    /// Arena: every live node by id
    nodes: BTreeMap<NodeId, Node>,
    /// Reverse index: parent id → (key → child id)
    children: HashMap<NodeId, BTreeMap<String, NodeId>>,
    /// Change journal since the last `take_changes`
    changes: Vec<TreeChange>,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    /// A tree holding only an empty root.
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(ROOT_ID.to_string(), Node::root());
        Self {
            nodes,
            children: HashMap::new(),
            changes: Vec::new(),
        }
    }

    // ─── Reads ────────────────────────────────────────────────────────

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn has(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// All nodes, ordered by id.
    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &Node)> {
        self.nodes.iter()
    }

    /// Ids starting with `prefix`, in order.
    pub fn ids_with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a NodeId> + 'a {
        self.nodes
            .range::<str, _>(prefix..)
            .map(|(id, _)| id)
            .take_while(move |id| id.starts_with(prefix))
    }

    /// Number of nodes, root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1 && self.children.is_empty()
    }

    pub fn child_at(&self, parent_id: &str, key: &str) -> Option<&NodeId> {
        self.children.get(parent_id).and_then(|kids| kids.get(key))
    }

    pub fn has_child_at(&self, parent_id: &str, key: &str) -> bool {
        self.child_at(parent_id, key).is_some()
    }

    /// Closest occupied key strictly greater than `from_pos`.
    pub fn next_sibling(&self, parent_id: &str, from_pos: &str) -> Option<&str> {
        use std::ops::Bound::{Excluded, Unbounded};
        self.children.get(parent_id).and_then(|kids| {
            kids.range::<str, _>((Excluded(from_pos), Unbounded))
                .next()
                .map(|(key, _)| key.as_str())
        })
    }

    /// Children of `parent_id`, ordered by key.
    pub fn children_of(&self, parent_id: &str) -> impl Iterator<Item = (&String, &NodeId)> {
        self.children.get(parent_id).into_iter().flat_map(|kids| kids.iter())
    }

    /// Every node paired with its id, ordered by id.
    pub fn snapshot(&self) -> Vec<(NodeId, Node)> {
        self.nodes
            .iter()
            .map(|(id, node)| (id.clone(), node.clone()))
            .collect()
    }

    // ─── Change journal ───────────────────────────────────────────────

    /// Changes recorded since the last `take_changes`.
    pub fn changes(&self) -> &[TreeChange] {
        &self.changes
    }

    /// Drain the change journal.
    pub fn take_changes(&mut self) -> Vec<TreeChange> {
        std::mem::take(&mut self.changes)
    }

    // ─── Primitives ───────────────────────────────────────────────────

    /// Attach `node` under id `id` at the slot named by its parent ref.
    ///
    /// With `allow_overwrite`, whatever occupies the slot (a child subtree or
    /// a static Object field) is deleted first.
    pub fn set_child(&mut self, id: &str, node: Node, allow_overwrite: bool) -> Result<(), TreeError> {
        if self.nodes.contains_key(id) {
            return Err(TreeError::DuplicateId(id.to_string()));
        }
        let parent = node
            .parent()
            .cloned()
            .ok_or_else(|| TreeError::MissingParent(id.to_string()))?;
        let parent_node = self
            .nodes
            .get(&parent.parent_id)
            .ok_or_else(|| TreeError::ParentNotFound(parent.parent_id.clone()))?;
        if !parent_node.kind().accepts(node.kind()) {
            return Err(TreeError::IllegalParent {
                parent_kind: parent_node.kind(),
                child_kind: node.kind(),
            });
        }

        let occupant = self.child_at(&parent.parent_id, &parent.parent_key).cloned();
        let data_taken = parent_node
            .object_data()
            .is_some_and(|data| data.contains_key(&parent.parent_key));

        if (occupant.is_some() || data_taken) && !allow_overwrite {
            return Err(TreeError::SlotOccupied {
                parent_id: parent.parent_id,
                key: parent.parent_key,
            });
        }
        if let Some(occupant) = occupant {
            self.delete_node(&occupant);
        }
        if data_taken {
            self.remove_data_field(&parent.parent_id, &parent.parent_key);
        }

        self.children
            .entry(parent.parent_id.clone())
            .or_default()
            .insert(parent.parent_key.clone(), id.to_string());
        self.nodes.insert(id.to_string(), node.clone());
        self.changes.push(TreeChange::Attached {
            id: id.to_string(),
            node,
        });
        Ok(())
    }

    /// Move a list child to `new_pos` under the same parent.
    pub fn move_sibling(&mut self, id: &str, new_pos: &str) -> Result<(), TreeError> {
        let node = self
            .nodes
            .get(id)
            .ok_or_else(|| TreeError::NodeNotFound(id.to_string()))?;
        let parent = node
            .parent()
            .cloned()
            .ok_or_else(|| TreeError::NotAListChild(id.to_string()))?;
        let parent_is_list = self
            .nodes
            .get(&parent.parent_id)
            .is_some_and(|p| p.kind() == CrdtKind::List);
        if !parent_is_list {
            return Err(TreeError::NotAListChild(id.to_string()));
        }

        match self.child_at(&parent.parent_id, new_pos) {
            Some(occupant) if occupant == id => return Ok(()),
            Some(_) => {
                return Err(TreeError::SlotOccupied {
                    parent_id: parent.parent_id,
                    key: new_pos.to_string(),
                })
            }
            None => {}
        }

        let kids = self.children.entry(parent.parent_id.clone()).or_default();
        kids.remove(&parent.parent_key);
        kids.insert(new_pos.to_string(), id.to_string());
        if let Some(node) = self.nodes.get_mut(id) {
            node.set_parent_key(new_pos);
        }
        self.changes.push(TreeChange::Moved {
            id: id.to_string(),
            parent_id: parent.parent_id,
            from: parent.parent_key,
            to: new_pos.to_string(),
        });
        Ok(())
    }

    /// Merge `data` into an Object's static fields.
    ///
    /// Keys colliding with a child node fail the whole call, or with
    /// `allow_overwrite` delete that child first. Non-Object targets are a
    /// no-op.
    pub fn set_object_data(
        &mut self,
        id: &str,
        data: &JsonObject,
        allow_overwrite: bool,
    ) -> Result<(), TreeError> {
        if !matches!(self.nodes.get(id), Some(Node::Object { .. })) {
            return Ok(());
        }

        let collisions: Vec<(String, NodeId)> = data
            .keys()
            .filter_map(|key| self.child_at(id, key).map(|child| (key.clone(), child.clone())))
            .collect();
        if let Some((key, _)) = collisions.first() {
            if !allow_overwrite {
                return Err(TreeError::SlotOccupied {
                    parent_id: id.to_string(),
                    key: key.clone(),
                });
            }
        }
        for (_, child) in collisions {
            self.delete_node(&child);
        }

        if let Some(fields) = self.nodes.get_mut(id).and_then(Node::object_data_mut) {
            for (key, value) in data {
                fields.insert(key.clone(), value.clone());
                self.changes.push(TreeChange::DataSet {
                    id: id.to_string(),
                    key: key.clone(),
                    value: value.clone(),
                });
            }
        }
        Ok(())
    }

    /// Delete a node and its whole subtree. No-op for the root and for
    /// unknown ids.
    pub fn delete_node(&mut self, id: &str) {
        if id == ROOT_ID {
            return;
        }
        let parent = match self.nodes.get(id) {
            Some(node) => node.parent().cloned(),
            None => return,
        };

        let ids = self.subtree_ids(id);
        for removed in &ids {
            self.nodes.remove(removed);
            self.children.remove(removed);
        }

        if let Some(parent) = parent {
            if let Some(kids) = self.children.get_mut(&parent.parent_id) {
                if kids.get(&parent.parent_key).is_some_and(|child| child == id) {
                    kids.remove(&parent.parent_key);
                }
                if kids.is_empty() {
                    self.children.remove(&parent.parent_id);
                }
            }
            self.changes.push(TreeChange::Removed {
                parent_id: parent.parent_id,
                parent_key: parent.parent_key,
                ids,
            });
        }
    }

    /// Remove whatever lives under `key` on `id`: a static data field or a
    /// child subtree. No-op otherwise.
    pub fn delete_child_key(&mut self, id: &str, key: &str) {
        let has_field = self
            .nodes
            .get(id)
            .and_then(Node::object_data)
            .is_some_and(|data| data.contains_key(key));
        if has_field {
            self.remove_data_field(id, key);
            return;
        }
        if let Some(child) = self.child_at(id, key).cloned() {
            self.delete_node(&child);
        }
    }

    fn remove_data_field(&mut self, id: &str, key: &str) {
        let removed = self
            .nodes
            .get_mut(id)
            .and_then(Node::object_data_mut)
            .and_then(|data| data.shift_remove(key));
        if removed.is_some() {
            self.changes.push(TreeChange::DataRemoved {
                id: id.to_string(),
                key: key.to_string(),
            });
        }
    }

    /// `id` and all its descendants, pre-order.
    fn subtree_ids(&self, id: &str) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            if let Some(kids) = self.children.get(&current) {
                stack.extend(kids.values().rev().cloned());
            }
            out.push(current);
        }
        out
    }

    // ─── Reconstruction ───────────────────────────────────────────────

    /// Rebuild a tree from persisted nodes.
    ///
    /// Duplicate claims on one `(parent_id, parent_key)` keep the highest
    /// id. Nodes unreachable from the root are dropped, as are Object data
    /// fields shadowed by a child node under the same key.
    pub fn build(nodes: impl IntoIterator<Item = (NodeId, Node)>) -> (Tree, BuildReport) {
        let mut nodes: BTreeMap<NodeId, Node> = nodes.into_iter().collect();
        let mut report = BuildReport::default();

        if !matches!(nodes.get(ROOT_ID), Some(Node::Object { parent: None, .. })) {
            nodes.insert(ROOT_ID.to_string(), Node::root());
            report.root_replaced = true;
        }

        let mut claims: HashMap<ParentRef, NodeId> = HashMap::new();
        for (id, node) in &nodes {
            if id == ROOT_ID {
                continue;
            }
            let Some(parent) = node.parent() else { continue };
            let outranked = claims.get(parent).is_some_and(|holder| holder >= id);
            if !outranked {
                claims.insert(parent.clone(), id.clone());
            }
        }

        let mut index: HashMap<NodeId, BTreeMap<String, NodeId>> = HashMap::new();
        for (parent, id) in claims {
            index
                .entry(parent.parent_id)
                .or_default()
                .insert(parent.parent_key, id);
        }

        let mut reachable: HashSet<NodeId> = HashSet::new();
        reachable.insert(ROOT_ID.to_string());
        let mut stack = vec![ROOT_ID.to_string()];
        while let Some(parent_id) = stack.pop() {
            let parent_kind = match nodes.get(&parent_id) {
                Some(node) => node.kind(),
                None => continue,
            };
            let Some(kids) = index.get(&parent_id) else { continue };
            for child_id in kids.values() {
                let legal = nodes
                    .get(child_id)
                    .is_some_and(|child| parent_kind.accepts(child.kind()));
                if legal && reachable.insert(child_id.clone()) {
                    stack.push(child_id.clone());
                }
            }
        }

        for (id, node) in nodes.iter_mut() {
            if !reachable.contains(id) {
                continue;
            }
            let Some(kids) = index.get(id) else { continue };
            if let Some(data) = node.object_data_mut() {
                let shadowed: Vec<String> = data
                    .keys()
                    .filter(|key| kids.get(*key).is_some_and(|child| reachable.contains(child)))
                    .cloned()
                    .collect();
                for key in shadowed {
                    data.shift_remove(&key);
                    report.dropped_fields.push((id.clone(), key));
                }
            }
        }

        report.dropped_nodes = nodes
            .keys()
            .filter(|id| !reachable.contains(*id))
            .cloned()
            .collect();
        for id in &report.dropped_nodes {
            nodes.remove(id);
        }

        if !report.is_clean() {
            log::warn!(
                "Tree reconstruction pruned {} nodes and {} data fields (root replaced: {})",
                report.dropped_nodes.len(),
                report.dropped_fields.len(),
                report.root_replaced
            );
        }

        // Re-derive the index from the surviving nodes.
        let mut children: HashMap<NodeId, BTreeMap<String, NodeId>> = HashMap::new();
        for (id, node) in &nodes {
            if let Some(parent) = node.parent() {
                children
                    .entry(parent.parent_id.clone())
                    .or_default()
                    .insert(parent.parent_key.clone(), id.clone());
            }
        }

        (
            Tree {
                nodes,
                children,
                changes: Vec::new(),
            },
            report,
        )
    }

    // ─── Validation & export ──────────────────────────────────────────

    /// Verify the structural invariants; returns the first violation found.
    pub fn check_invariants(&self) -> Result<(), String> {
        match self.nodes.get(ROOT_ID) {
            Some(Node::Object { parent: None, .. }) => {}
            other => return Err(format!("bad root: {other:?}")),
        }

        for (id, node) in &self.nodes {
            if id == ROOT_ID {
                continue;
            }
            let parent = node
                .parent()
                .ok_or_else(|| format!("{id} has no parent ref"))?;
            let parent_node = self
                .nodes
                .get(&parent.parent_id)
                .ok_or_else(|| format!("{id} has missing parent {}", parent.parent_id))?;
            if !parent_node.kind().accepts(node.kind()) {
                return Err(format!("{id} ({}) under a {}", node.kind(), parent_node.kind()));
            }
            if self.child_at(&parent.parent_id, &parent.parent_key) != Some(id) {
                return Err(format!("index does not point at {id}"));
            }
            if parent_node
                .object_data()
                .is_some_and(|data| data.contains_key(&parent.parent_key))
            {
                return Err(format!(
                    "{}[{:?}] is both a data field and a child",
                    parent.parent_id, parent.parent_key
                ));
            }
        }

        for (parent_id, kids) in &self.children {
            for (key, child_id) in kids {
                let matches = self
                    .nodes
                    .get(child_id)
                    .and_then(Node::parent)
                    .is_some_and(|p| &p.parent_id == parent_id && &p.parent_key == key);
                if !matches {
                    return Err(format!("stale index entry {parent_id}[{key:?}] -> {child_id}"));
                }
            }
        }
        Ok(())
    }

    /// Plain-JSON view of the document. Lists come out ordered by position.
    pub fn to_json(&self) -> Value {
        self.node_json(ROOT_ID)
    }

    fn node_json(&self, id: &str) -> Value {
        match self.nodes.get(id) {
            Some(Node::Object { data, .. }) => {
                let mut out = data.clone();
                for (key, child) in self.children_of(id) {
                    out.insert(key.clone(), self.node_json(child));
                }
                Value::Object(out)
            }
            Some(Node::Map { .. }) => Value::Object(
                self.children_of(id)
                    .map(|(key, child)| (key.clone(), self.node_json(child)))
                    .collect(),
            ),
            Some(Node::List { .. }) => Value::Array(
                self.children_of(id)
                    .map(|(_, child)| self.node_json(child))
                    .collect(),
            ),
            Some(Node::Register { data, .. }) => data.clone(),
            None => Value::Null,
        }
    }
}
