//! Node model for the replicated document tree.
//!
//! ```text
//!              root (Object)
//!             /      \
//!        "todos"     "meta"  ← parent keys
//!        (List)      (Map)
//!        /    \          \
//!     "!"     "O"       "owner"  ← list positions / map keys
//!  (Object) (Register)  (Register)
//! ```
//!
//! Nodes never point at each other directly. Every non-root node stores the
//! `ParentRef` it hangs from, and the tree keeps a reverse index from
//! `ParentRef` to child id (see [`crate::tree`]).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque node identifier, unique within a document.
pub type NodeId = String;

/// Ordered JSON object used for static Object data.
pub type JsonObject = serde_json::Map<String, Value>;

/// Reserved id of the root node. The root always exists.
pub const ROOT_ID: &str = "root";

/// Node kinds. Wire codes follow the client protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrdtKind {
    Object,
    List,
    Map,
    Register,
}

impl CrdtKind {
    /// Wire code of this kind.
    pub fn code(self) -> u8 {
        match self {
            CrdtKind::Object => 0,
            CrdtKind::List => 1,
            CrdtKind::Map => 2,
            CrdtKind::Register => 3,
        }
    }

    /// Parse a wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(CrdtKind::Object),
            1 => Some(CrdtKind::List),
            2 => Some(CrdtKind::Map),
            3 => Some(CrdtKind::Register),
            _ => None,
        }
    }

    /// Whether a node of this kind may hold a child of kind `child`.
    ///
    /// Registers hold no children; Objects keep plain values as data fields,
    /// so a Register may never hang from an Object.
    pub fn accepts(self, child: CrdtKind) -> bool {
        match self {
            CrdtKind::Object => child != CrdtKind::Register,
            CrdtKind::Map | CrdtKind::List => true,
            CrdtKind::Register => false,
        }
    }
}

impl std::fmt::Display for CrdtKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CrdtKind::Object => "object",
            CrdtKind::List => "list",
            CrdtKind::Map => "map",
            CrdtKind::Register => "register",
        };
        f.write_str(name)
    }
}

/// Where a node is attached: `(parent_id, parent_key)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentRef {
    pub parent_id: NodeId,
    pub parent_key: String,
}

impl ParentRef {
    pub fn new(parent_id: impl Into<NodeId>, parent_key: impl Into<String>) -> Self {
        Self {
            parent_id: parent_id.into(),
            parent_key: parent_key.into(),
        }
    }
}

/// A tree node, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Node {
    /// Static JSON fields plus child nodes, never both under one key.
    /// `parent` is `None` only for the root.
    Object {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<ParentRef>,
        #[serde(default)]
        data: JsonObject,
    },
    /// Children keyed by arbitrary strings.
    Map { parent: ParentRef },
    /// Children keyed by positions.
    List { parent: ParentRef },
    /// Opaque leaf value.
    Register { parent: ParentRef, data: Value },
}

impl Node {
    /// A fresh, empty root.
    pub fn root() -> Self {
        Node::Object {
            parent: None,
            data: JsonObject::new(),
        }
    }

    pub fn object(parent: ParentRef, data: JsonObject) -> Self {
        Node::Object {
            parent: Some(parent),
            data,
        }
    }

    pub fn map(parent: ParentRef) -> Self {
        Node::Map { parent }
    }

    pub fn list(parent: ParentRef) -> Self {
        Node::List { parent }
    }

    pub fn register(parent: ParentRef, data: Value) -> Self {
        Node::Register { parent, data }
    }

    /// Build a node of `kind` from wire parts.
    ///
    /// Object data that is not a JSON object is discarded; a Register
    /// without data holds `null`.
    pub fn from_parts(kind: CrdtKind, parent: ParentRef, data: Option<Value>) -> Self {
        match kind {
            CrdtKind::Object => {
                let data = match data {
                    Some(Value::Object(map)) => map,
                    _ => JsonObject::new(),
                };
                Node::object(parent, data)
            }
            CrdtKind::Map => Node::map(parent),
            CrdtKind::List => Node::list(parent),
            CrdtKind::Register => Node::register(parent, data.unwrap_or(Value::Null)),
        }
    }

    pub fn kind(&self) -> CrdtKind {
        match self {
            Node::Object { .. } => CrdtKind::Object,
            Node::Map { .. } => CrdtKind::Map,
            Node::List { .. } => CrdtKind::List,
            Node::Register { .. } => CrdtKind::Register,
        }
    }

    pub fn parent(&self) -> Option<&ParentRef> {
        match self {
            Node::Object { parent, .. } => parent.as_ref(),
            Node::Map { parent } | Node::List { parent } | Node::Register { parent, .. } => {
                Some(parent)
            }
        }
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent().map(|p| p.parent_id.as_str())
    }

    pub fn parent_key(&self) -> Option<&str> {
        self.parent().map(|p| p.parent_key.as_str())
    }

    /// Static data of an Object node.
    pub fn object_data(&self) -> Option<&JsonObject> {
        match self {
            Node::Object { data, .. } => Some(data),
            _ => None,
        }
    }

    pub(crate) fn object_data_mut(&mut self) -> Option<&mut JsonObject> {
        match self {
            Node::Object { data, .. } => Some(data),
            _ => None,
        }
    }

    pub(crate) fn set_parent_key(&mut self, key: &str) {
        let parent = match self {
            Node::Object { parent, .. } => parent.as_mut(),
            Node::Map { parent } | Node::List { parent } | Node::Register { parent, .. } => {
                Some(parent)
            }
        };
        if let Some(parent) = parent {
            parent.parent_key = key.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_codes_roundtrip() {
        for kind in [CrdtKind::Object, CrdtKind::List, CrdtKind::Map, CrdtKind::Register] {
            assert_eq!(CrdtKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(CrdtKind::from_code(9), None);
    }

    #[test]
    fn test_register_never_under_object() {
        assert!(!CrdtKind::Object.accepts(CrdtKind::Register));
        assert!(CrdtKind::Map.accepts(CrdtKind::Register));
        assert!(CrdtKind::List.accepts(CrdtKind::Register));
        assert!(!CrdtKind::Register.accepts(CrdtKind::Object));
    }

    #[test]
    fn test_from_parts_discards_non_object_data() {
        let node = Node::from_parts(CrdtKind::Object, ParentRef::new("root", "a"), Some(json!(5)));
        assert_eq!(node.object_data().map(|d| d.len()), Some(0));

        let reg = Node::from_parts(CrdtKind::Register, ParentRef::new("l", "!"), None);
        assert_eq!(reg, Node::register(ParentRef::new("l", "!"), Value::Null));
    }

    #[test]
    fn test_node_json_shape() {
        let node = Node::list(ParentRef::new("root", "items"));
        let encoded = serde_json::to_value(&node).unwrap();
        assert_eq!(
            encoded,
            json!({"kind": "list", "parent": {"parentId": "root", "parentKey": "items"}})
        );
        let decoded: Node = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, node);
    }
}
