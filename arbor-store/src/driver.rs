//! Node Store drivers.
//!
//! The reducer and the document engine only talk to a [`Driver`]. Two
//! implementations exist:
//!
//! - [`Tree`] itself, purely in memory.
//! - [`PersistentDriver`], a `Tree` mirrored into the `nodes` column family
//!   of a [`DocumentStore`]. Every primitive marks the nodes it touched;
//!   `persist` writes them in one batch.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::node::{JsonObject, Node, NodeId};
use crate::storage::{DocumentStore, StoreError};
use crate::tree::{BuildReport, Tree, TreeChange, TreeError};

/// Storage backend of the node tree.
pub trait Driver {
    /// Current tree state.
    fn tree(&self) -> &Tree;

    fn set_child(&mut self, id: &str, node: Node, allow_overwrite: bool) -> Result<(), TreeError>;
    fn move_sibling(&mut self, id: &str, new_pos: &str) -> Result<(), TreeError>;
    fn delete_node(&mut self, id: &str);
    fn delete_child_key(&mut self, id: &str, key: &str);
    fn set_object_data(
        &mut self,
        id: &str,
        data: &JsonObject,
        allow_overwrite: bool,
    ) -> Result<(), TreeError>;

    /// Drain the change journal.
    fn take_changes(&mut self) -> Vec<TreeChange>;

    /// Put back an earlier state of the tree, dropping every change made
    /// since. Used when the cache transaction those changes belonged to
    /// rolls back.
    fn restore(&mut self, tree: Tree);

    /// Flush pending writes to durable storage. Returns the number of node
    /// records written or deleted.
    fn persist(&mut self) -> Result<usize, StoreError> {
        Ok(0)
    }

    fn get_node(&self, id: &str) -> Option<&Node> {
        self.tree().get(id)
    }

    fn has_node(&self, id: &str) -> bool {
        self.tree().has(id)
    }

    fn iter_nodes(&self) -> Box<dyn Iterator<Item = (&NodeId, &Node)> + '_> {
        Box::new(self.tree().iter())
    }

    fn get_child_at(&self, parent_id: &str, key: &str) -> Option<&NodeId> {
        self.tree().child_at(parent_id, key)
    }

    fn has_child_at(&self, parent_id: &str, key: &str) -> bool {
        self.tree().has_child_at(parent_id, key)
    }

    fn get_next_sibling(&self, parent_id: &str, from_pos: &str) -> Option<&str> {
        self.tree().next_sibling(parent_id, from_pos)
    }

    fn snapshot(&self) -> Vec<(NodeId, Node)> {
        self.tree().snapshot()
    }
}

impl Driver for Tree {
    fn tree(&self) -> &Tree {
        self
    }

    fn set_child(&mut self, id: &str, node: Node, allow_overwrite: bool) -> Result<(), TreeError> {
        Tree::set_child(self, id, node, allow_overwrite)
    }

    fn move_sibling(&mut self, id: &str, new_pos: &str) -> Result<(), TreeError> {
        Tree::move_sibling(self, id, new_pos)
    }

    fn delete_node(&mut self, id: &str) {
        Tree::delete_node(self, id)
    }

    fn delete_child_key(&mut self, id: &str, key: &str) {
        Tree::delete_child_key(self, id, key)
    }

    fn set_object_data(
        &mut self,
        id: &str,
        data: &JsonObject,
        allow_overwrite: bool,
    ) -> Result<(), TreeError> {
        Tree::set_object_data(self, id, data, allow_overwrite)
    }

    fn take_changes(&mut self) -> Vec<TreeChange> {
        Tree::take_changes(self)
    }

    fn restore(&mut self, tree: Tree) {
        *self = tree;
    }
}

/// A tree persisted node by node in a [`DocumentStore`].
pub struct PersistentDriver {
    tree: Tree,
    store: Arc<DocumentStore>,
    /// Nodes touched since the last `persist`
    dirty: BTreeSet<NodeId>,
}

impl PersistentDriver {
    /// Load and reconstruct the tree. Anything pruned during reconstruction
    /// is removed from the store right away.
    pub fn open(store: Arc<DocumentStore>) -> Result<Self, StoreError> {
        let nodes = store.load_nodes()?;
        let loaded = nodes.len();
        let (tree, report) = Tree::build(nodes);

        let mut driver = Self {
            tree,
            store,
            dirty: BTreeSet::new(),
        };
        driver.mark_repairs(&report);
        let repaired = driver.persist()?;
        log::info!(
            "Opened persistent tree: {loaded} stored nodes, {} live, {repaired} records repaired",
            driver.tree.len()
        );
        Ok(driver)
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    /// Number of nodes waiting for `persist`.
    pub fn pending(&self) -> usize {
        self.dirty.len()
    }

    fn mark_repairs(&mut self, report: &BuildReport) {
        self.dirty.extend(report.dropped_nodes.iter().cloned());
        self.dirty
            .extend(report.dropped_fields.iter().map(|(id, _)| id.clone()));
        if report.root_replaced {
            self.dirty.insert(crate::node::ROOT_ID.to_string());
        }
    }

    /// Run a tree primitive and mark every node its changes touched.
    fn track<R>(&mut self, op: impl FnOnce(&mut Tree) -> R) -> R {
        let mark = self.tree.changes().len();
        let result = op(&mut self.tree);
        for change in &self.tree.changes()[mark..] {
            match change {
                TreeChange::Attached { id, .. }
                | TreeChange::Moved { id, .. }
                | TreeChange::DataSet { id, .. }
                | TreeChange::DataRemoved { id, .. } => {
                    self.dirty.insert(id.clone());
                }
                TreeChange::Removed { ids, .. } => self.dirty.extend(ids.iter().cloned()),
            }
        }
        result
    }
}

impl Driver for PersistentDriver {
    fn tree(&self) -> &Tree {
        &self.tree
    }

    fn set_child(&mut self, id: &str, node: Node, allow_overwrite: bool) -> Result<(), TreeError> {
        self.track(|tree| tree.set_child(id, node, allow_overwrite))
    }

    fn move_sibling(&mut self, id: &str, new_pos: &str) -> Result<(), TreeError> {
        self.track(|tree| tree.move_sibling(id, new_pos))
    }

    fn delete_node(&mut self, id: &str) {
        self.track(|tree| tree.delete_node(id))
    }

    fn delete_child_key(&mut self, id: &str, key: &str) {
        self.track(|tree| tree.delete_child_key(id, key))
    }

    fn set_object_data(
        &mut self,
        id: &str,
        data: &JsonObject,
        allow_overwrite: bool,
    ) -> Result<(), TreeError> {
        self.track(|tree| tree.set_object_data(id, data, allow_overwrite))
    }

    fn take_changes(&mut self) -> Vec<TreeChange> {
        self.tree.take_changes()
    }

    // Dirty ids stay marked: persisting them writes the restored state.
    fn restore(&mut self, tree: Tree) {
        self.tree = tree;
    }

    fn persist(&mut self) -> Result<usize, StoreError> {
        if self.dirty.is_empty() {
            return Ok(0);
        }
        let mut puts = Vec::new();
        let mut deletes = Vec::new();
        for id in &self.dirty {
            match self.tree.get(id) {
                Some(node) => puts.push((id.clone(), node.clone())),
                None => deletes.push(id.clone()),
            }
        }
        let written = self.store.write_nodes(&puts, &deletes)?;
        self.dirty.clear();
        log::trace!("Persisted {} node puts, {} deletes", puts.len(), deletes.len());
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{ParentRef, ROOT_ID};
    use crate::storage::StoreConfig;
    use serde_json::json;

    fn open_store(dir: &tempfile::TempDir) -> Arc<DocumentStore> {
        Arc::new(DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap())
    }

    #[test]
    fn test_tree_driver_delegates() {
        let mut tree = Tree::new();
        Driver::set_child(&mut tree, "L", Node::list(ParentRef::new(ROOT_ID, "l")), false).unwrap();
        Driver::set_child(&mut tree, "r", Node::register(ParentRef::new("L", "a"), json!(1)), false)
            .unwrap();

        let driver: &dyn Driver = &tree;
        assert!(driver.has_node("r"));
        assert_eq!(driver.get_child_at("L", "a").map(String::as_str), Some("r"));
        assert_eq!(driver.get_next_sibling("L", " "), Some("a"));
        assert_eq!(driver.iter_nodes().count(), 3);
        assert_eq!(driver.snapshot().len(), 3);
    }

    #[test]
    fn test_persistent_driver_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut driver = PersistentDriver::open(open_store(&dir)).unwrap();
            driver
                .set_child("m", Node::map(ParentRef::new(ROOT_ID, "meta")), false)
                .unwrap();
            driver
                .set_child("r", Node::register(ParentRef::new("m", "owner"), json!("ana")), false)
                .unwrap();
            let mut data = JsonObject::new();
            data.insert("title".into(), json!("doc"));
            driver.set_object_data(ROOT_ID, &data, false).unwrap();
            assert_eq!(driver.pending(), 3);
            assert_eq!(driver.persist().unwrap(), 3);
            assert_eq!(driver.pending(), 0);
        }

        let driver = PersistentDriver::open(open_store(&dir)).unwrap();
        assert_eq!(
            driver.tree().to_json(),
            json!({"title": "doc", "meta": {"owner": "ana"}})
        );
    }

    #[test]
    fn test_persistent_driver_deletes_subtree_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let mut driver = PersistentDriver::open(store.clone()).unwrap();
        driver
            .set_child("m", Node::map(ParentRef::new(ROOT_ID, "meta")), false)
            .unwrap();
        driver
            .set_child("r", Node::register(ParentRef::new("m", "k"), json!(1)), false)
            .unwrap();
        driver.persist().unwrap();

        driver.delete_node("m");
        assert_eq!(driver.persist().unwrap(), 2);
        let ids: Vec<NodeId> = store.load_nodes().unwrap().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![ROOT_ID.to_string()]);
    }

    #[test]
    fn test_open_repairs_pruned_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        store
            .write_nodes(
                &[
                    (ROOT_ID.to_string(), Node::root()),
                    ("orphan".to_string(), Node::map(ParentRef::new("ghost", "k"))),
                ],
                &[],
            )
            .unwrap();

        let driver = PersistentDriver::open(store.clone()).unwrap();
        assert!(!driver.has_node("orphan"));
        assert_eq!(store.load_nodes().unwrap().len(), 1);
    }
}
