//! Mutation operations and their JSON wire format.
//!
//! Wire ops are flat JSON records tagged by a numeric `type`:
//!
//! | code | op               | fields                                              |
//! |------|------------------|-----------------------------------------------------|
//! | 1    | SetParentKey     | id, parentKey                                       |
//! | 2    | CreateList       | id, parentId, parentKey, intent?, deletedId?        |
//! | 3    | UpdateObject     | id, data                                            |
//! | 4    | CreateObject     | id, parentId, parentKey, data?, intent?, deletedId? |
//! | 5    | DeleteNode       | id                                                  |
//! | 6    | DeleteObjectKey  | id, key                                             |
//! | 7    | CreateMap        | id, parentId, parentKey, intent?, deletedId?        |
//! | 8    | CreateRegister   | id, parentId, parentKey, data, intent?, deletedId?  |
//!
//! Every op may carry an `opId`, echoed back in fix ops and ignore verdicts.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::node::{CrdtKind, JsonObject, Node, NodeId, ParentRef};

const OP_SET_PARENT_KEY: u8 = 1;
const OP_CREATE_LIST: u8 = 2;
const OP_UPDATE_OBJECT: u8 = 3;
const OP_CREATE_OBJECT: u8 = 4;
const OP_DELETE_NODE: u8 = 5;
const OP_DELETE_OBJECT_KEY: u8 = 6;
const OP_CREATE_MAP: u8 = 7;
const OP_CREATE_REGISTER: u8 = 8;

/// How a create under a List treats the target position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    /// Find a free position at or after the requested one.
    #[default]
    Insert,
    /// Replace whatever sits at the requested position.
    Set,
}

/// Payload of a create op.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateOp {
    pub op_id: Option<String>,
    pub kind: CrdtKind,
    pub id: NodeId,
    pub parent_id: NodeId,
    pub parent_key: String,
    /// Object fields or Register value
    pub data: Option<Value>,
    pub intent: Intent,
    /// Item the client expects to replace (`Intent::Set` only)
    pub deleted_id: Option<NodeId>,
}

impl CreateOp {
    pub fn new(
        kind: CrdtKind,
        id: impl Into<NodeId>,
        parent_id: impl Into<NodeId>,
        parent_key: impl Into<String>,
    ) -> Self {
        Self {
            op_id: None,
            kind,
            id: id.into(),
            parent_id: parent_id.into(),
            parent_key: parent_key.into(),
            data: None,
            intent: Intent::Insert,
            deleted_id: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_intent(mut self, intent: Intent) -> Self {
        self.intent = intent;
        self
    }

    pub fn with_deleted_id(mut self, deleted_id: impl Into<NodeId>) -> Self {
        self.deleted_id = Some(deleted_id.into());
        self
    }

    pub fn with_op_id(mut self, op_id: impl Into<String>) -> Self {
        self.op_id = Some(op_id.into());
        self
    }

    pub fn parent_ref(&self) -> ParentRef {
        ParentRef::new(self.parent_id.clone(), self.parent_key.clone())
    }

    /// The node this op creates.
    pub fn to_node(&self) -> Node {
        Node::from_parts(self.kind, self.parent_ref(), self.data.clone())
    }
}

/// A unit of mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireOp", into = "WireOp")]
pub enum Op {
    Create(CreateOp),
    UpdateObject {
        op_id: Option<String>,
        id: NodeId,
        data: JsonObject,
    },
    SetParentKey {
        op_id: Option<String>,
        id: NodeId,
        parent_key: String,
    },
    DeleteObjectKey {
        op_id: Option<String>,
        id: NodeId,
        key: String,
    },
    DeleteNode {
        op_id: Option<String>,
        id: NodeId,
    },
}

impl Op {
    pub fn update_object(id: impl Into<NodeId>, data: JsonObject) -> Self {
        Op::UpdateObject {
            op_id: None,
            id: id.into(),
            data,
        }
    }

    pub fn set_parent_key(id: impl Into<NodeId>, parent_key: impl Into<String>) -> Self {
        Op::SetParentKey {
            op_id: None,
            id: id.into(),
            parent_key: parent_key.into(),
        }
    }

    pub fn delete_object_key(id: impl Into<NodeId>, key: impl Into<String>) -> Self {
        Op::DeleteObjectKey {
            op_id: None,
            id: id.into(),
            key: key.into(),
        }
    }

    pub fn delete_node(id: impl Into<NodeId>) -> Self {
        Op::DeleteNode {
            op_id: None,
            id: id.into(),
        }
    }

    /// Replace the op id.
    pub fn with_op_id(mut self, new_id: Option<String>) -> Self {
        match &mut self {
            Op::Create(create) => create.op_id = new_id,
            Op::UpdateObject { op_id, .. }
            | Op::SetParentKey { op_id, .. }
            | Op::DeleteObjectKey { op_id, .. }
            | Op::DeleteNode { op_id, .. } => *op_id = new_id,
        }
        self
    }

    pub fn op_id(&self) -> Option<&str> {
        match self {
            Op::Create(create) => create.op_id.as_deref(),
            Op::UpdateObject { op_id, .. }
            | Op::SetParentKey { op_id, .. }
            | Op::DeleteObjectKey { op_id, .. }
            | Op::DeleteNode { op_id, .. } => op_id.as_deref(),
        }
    }

    /// Target node id.
    pub fn id(&self) -> &str {
        match self {
            Op::Create(create) => &create.id,
            Op::UpdateObject { id, .. }
            | Op::SetParentKey { id, .. }
            | Op::DeleteObjectKey { id, .. }
            | Op::DeleteNode { id, .. } => id,
        }
    }

    /// Numeric wire tag.
    pub fn code(&self) -> u8 {
        match self {
            Op::Create(create) => match create.kind {
                CrdtKind::List => OP_CREATE_LIST,
                CrdtKind::Object => OP_CREATE_OBJECT,
                CrdtKind::Map => OP_CREATE_MAP,
                CrdtKind::Register => OP_CREATE_REGISTER,
            },
            Op::UpdateObject { .. } => OP_UPDATE_OBJECT,
            Op::SetParentKey { .. } => OP_SET_PARENT_KEY,
            Op::DeleteObjectKey { .. } => OP_DELETE_OBJECT_KEY,
            Op::DeleteNode { .. } => OP_DELETE_NODE,
        }
    }
}

impl From<CreateOp> for Op {
    fn from(create: CreateOp) -> Self {
        Op::Create(create)
    }
}

/// Reducer verdict for one op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ApplyResult {
    /// The op took effect, possibly rewritten. `fix` goes back to the
    /// originating client only.
    Accepted {
        op: Op,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fix: Option<Op>,
    },
    /// The op had no effect.
    Ignored {
        #[serde(
            rename = "ignoredOpId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        ignored_op_id: Option<String>,
    },
}

impl ApplyResult {
    pub fn accepted(op: Op) -> Self {
        ApplyResult::Accepted { op, fix: None }
    }

    pub fn with_fix(op: Op, fix: Op) -> Self {
        ApplyResult::Accepted { op, fix: Some(fix) }
    }

    pub fn ignored(op: &Op) -> Self {
        ApplyResult::Ignored {
            ignored_op_id: op.op_id().map(str::to_string),
        }
    }

    /// Verdict for a record that never decoded into an op.
    pub fn rejected(record: &RejectedOp) -> Self {
        ApplyResult::Ignored {
            ignored_op_id: record.op_id.clone(),
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, ApplyResult::Accepted { .. })
    }

    pub fn fix(&self) -> Option<&Op> {
        match self {
            ApplyResult::Accepted { fix, .. } => fix.as_ref(),
            ApplyResult::Ignored { .. } => None,
        }
    }
}

// ─── Wire codec ─────────────────────────────────────────────────────────

/// Failure to decode a wire op.
#[derive(Debug, Clone, PartialEq)]
pub enum OpDecodeError {
    UnknownOpCode(u8),
    MissingField { code: u8, field: &'static str },
    InvalidData(String),
    Json(String),
}

impl std::fmt::Display for OpDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpDecodeError::UnknownOpCode(code) => write!(f, "Unknown op code: {code}"),
            OpDecodeError::MissingField { code, field } => {
                write!(f, "Op type {code} is missing field '{field}'")
            }
            OpDecodeError::InvalidData(msg) => write!(f, "Invalid op data: {msg}"),
            OpDecodeError::Json(msg) => write!(f, "Malformed op batch: {msg}"),
        }
    }
}

impl std::error::Error for OpDecodeError {}

impl From<serde_json::Error> for OpDecodeError {
    fn from(err: serde_json::Error) -> Self {
        OpDecodeError::Json(err.to_string())
    }
}

/// Flat record as it travels on the wire.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireOp {
    #[serde(rename = "type")]
    code: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    op_id: Option<String>,
    id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    intent: Option<Intent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    deleted_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key: Option<String>,
}

impl WireOp {
    fn bare(code: u8, op_id: Option<String>, id: NodeId) -> Self {
        Self {
            code,
            op_id,
            id,
            parent_id: None,
            parent_key: None,
            data: None,
            intent: None,
            deleted_id: None,
            key: None,
        }
    }
}

fn required<T>(code: u8, field: &'static str, value: Option<T>) -> Result<T, OpDecodeError> {
    value.ok_or(OpDecodeError::MissingField { code, field })
}

impl TryFrom<WireOp> for Op {
    type Error = OpDecodeError;

    fn try_from(wire: WireOp) -> Result<Self, Self::Error> {
        let code = wire.code;
        let create_kind = match code {
            OP_CREATE_LIST => Some(CrdtKind::List),
            OP_CREATE_OBJECT => Some(CrdtKind::Object),
            OP_CREATE_MAP => Some(CrdtKind::Map),
            OP_CREATE_REGISTER => Some(CrdtKind::Register),
            _ => None,
        };

        if let Some(kind) = create_kind {
            if kind == CrdtKind::Object && !matches!(wire.data, None | Some(Value::Object(_))) {
                return Err(OpDecodeError::InvalidData(format!(
                    "object data for {} must be a JSON object",
                    wire.id
                )));
            }
            return Ok(Op::Create(CreateOp {
                op_id: wire.op_id,
                kind,
                id: wire.id,
                parent_id: required(code, "parentId", wire.parent_id)?,
                parent_key: required(code, "parentKey", wire.parent_key)?,
                data: wire.data,
                intent: wire.intent.unwrap_or_default(),
                deleted_id: wire.deleted_id,
            }));
        }

        match code {
            OP_SET_PARENT_KEY => Ok(Op::SetParentKey {
                op_id: wire.op_id,
                id: wire.id,
                parent_key: required(code, "parentKey", wire.parent_key)?,
            }),
            OP_UPDATE_OBJECT => match required(code, "data", wire.data)? {
                Value::Object(data) => Ok(Op::UpdateObject {
                    op_id: wire.op_id,
                    id: wire.id,
                    data,
                }),
                other => Err(OpDecodeError::InvalidData(format!(
                    "update data must be a JSON object, got {other}"
                ))),
            },
            OP_DELETE_OBJECT_KEY => Ok(Op::DeleteObjectKey {
                op_id: wire.op_id,
                id: wire.id,
                key: required(code, "key", wire.key)?,
            }),
            OP_DELETE_NODE => Ok(Op::DeleteNode {
                op_id: wire.op_id,
                id: wire.id,
            }),
            other => Err(OpDecodeError::UnknownOpCode(other)),
        }
    }
}

impl From<Op> for WireOp {
    fn from(op: Op) -> Self {
        let code = op.code();
        match op {
            Op::Create(create) => WireOp {
                code,
                op_id: create.op_id,
                id: create.id,
                parent_id: Some(create.parent_id),
                parent_key: Some(create.parent_key),
                data: create.data,
                intent: (create.intent == Intent::Set).then_some(Intent::Set),
                deleted_id: create.deleted_id,
                key: None,
            },
            Op::UpdateObject { op_id, id, data } => WireOp {
                data: Some(Value::Object(data)),
                ..WireOp::bare(code, op_id, id)
            },
            Op::SetParentKey {
                op_id,
                id,
                parent_key,
            } => WireOp {
                parent_key: Some(parent_key),
                ..WireOp::bare(code, op_id, id)
            },
            Op::DeleteObjectKey { op_id, id, key } => WireOp {
                key: Some(key),
                ..WireOp::bare(code, op_id, id)
            },
            Op::DeleteNode { op_id, id } => WireOp::bare(code, op_id, id),
        }
    }
}

/// Decode a JSON array of wire ops. Any malformed record fails the batch;
/// see [`decode_ops`] to keep the records around it.
pub fn decode_batch(json: &str) -> Result<Vec<Op>, OpDecodeError> {
    Ok(serde_json::from_str(json)?)
}

/// A batch record that could not be decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedOp {
    /// Position in the batch
    pub index: usize,
    /// The record's `opId`, when it had a readable one
    pub op_id: Option<String>,
    pub error: OpDecodeError,
}

/// Decode a JSON array of wire ops record by record. Only a payload that is
/// not a JSON array fails as a whole.
pub fn decode_ops(json: &str) -> Result<Vec<Result<Op, RejectedOp>>, OpDecodeError> {
    let records: Vec<Value> = serde_json::from_str(json)?;
    Ok(records
        .into_iter()
        .enumerate()
        .map(|(index, record)| {
            let op_id = record.get("opId").and_then(Value::as_str).map(str::to_string);
            serde_json::from_value(record).map_err(|e| {
                log::debug!("Rejecting batch record {index}: {e}");
                RejectedOp {
                    index,
                    op_id,
                    error: e.into(),
                }
            })
        })
        .collect())
}

/// Encode reducer verdicts as a JSON array, in batch order.
pub fn encode_results(results: &[ApplyResult]) -> serde_json::Result<String> {
    serde_json::to_string(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_create_defaults_to_insert() {
        let ops = decode_batch(
            r#"[{"type":8,"opId":"c1:0","id":"r1","parentId":"L","parentKey":"!","data":42}]"#,
        )
        .unwrap();
        match &ops[0] {
            Op::Create(create) => {
                assert_eq!(create.kind, CrdtKind::Register);
                assert_eq!(create.intent, Intent::Insert);
                assert_eq!(create.data, Some(json!(42)));
                assert_eq!(create.op_id.as_deref(), Some("c1:0"));
            }
            other => panic!("unexpected op {other:?}"),
        }
    }

    #[test]
    fn test_decode_set_intent() {
        let ops = decode_batch(
            r#"[{"type":4,"id":"o","parentId":"L","parentKey":"a","intent":"set","deletedId":"old"}]"#,
        )
        .unwrap();
        let Op::Create(create) = &ops[0] else {
            panic!("expected create");
        };
        assert_eq!(create.intent, Intent::Set);
        assert_eq!(create.deleted_id.as_deref(), Some("old"));
    }

    #[test]
    fn test_decode_rejects_unknown_code() {
        let err = decode_batch(r#"[{"type":42,"id":"x"}]"#).unwrap_err();
        assert!(matches!(err, OpDecodeError::Json(msg) if msg.contains("Unknown op code")));
    }

    #[test]
    fn test_decode_rejects_missing_parent_key() {
        let err = decode_batch(r#"[{"type":1,"id":"x"}]"#).unwrap_err();
        assert!(matches!(err, OpDecodeError::Json(msg) if msg.contains("parentKey")));
    }

    #[test]
    fn test_decode_rejects_non_object_update() {
        assert!(decode_batch(r#"[{"type":3,"id":"x","data":[1]}]"#).is_err());
    }

    #[test]
    fn test_decode_ops_keeps_valid_neighbours() {
        let decoded = decode_ops(
            r#"[
                {"type":5,"id":"a","opId":"c:1"},
                {"type":42,"id":"x","opId":"c:2"},
                {"type":6,"id":"b"},
                {"type":6,"id":"b","key":"k","opId":"c:4"}
            ]"#,
        )
        .unwrap();

        assert_eq!(decoded.len(), 4);
        assert!(matches!(&decoded[0], Ok(Op::DeleteNode { id, .. }) if id == "a"));
        let Err(unknown) = &decoded[1] else {
            panic!("unknown op code decoded: {:?}", decoded[1]);
        };
        assert_eq!(unknown.index, 1);
        assert_eq!(unknown.op_id.as_deref(), Some("c:2"));
        assert_eq!(
            ApplyResult::rejected(unknown),
            ApplyResult::Ignored {
                ignored_op_id: Some("c:2".into())
            }
        );
        assert!(matches!(&decoded[2], Err(RejectedOp { op_id: None, .. })));
        assert!(matches!(&decoded[3], Ok(Op::DeleteObjectKey { key, .. }) if key == "k"));
    }

    #[test]
    fn test_decode_ops_rejects_non_array() {
        assert!(matches!(decode_ops(r#"{"type":5}"#), Err(OpDecodeError::Json(_))));
    }

    #[test]
    fn test_encode_wire_shape() {
        let op = Op::set_parent_key("x", "b").with_op_id(Some("c:1".into()));
        assert_eq!(
            serde_json::to_value(&op).unwrap(),
            json!({"type": 1, "opId": "c:1", "id": "x", "parentKey": "b"})
        );

        let create: Op = CreateOp::new(CrdtKind::Map, "m", "root", "meta").into();
        assert_eq!(
            serde_json::to_value(&create).unwrap(),
            json!({"type": 7, "id": "m", "parentId": "root", "parentKey": "meta"})
        );
    }

    #[test]
    fn test_apply_result_shape() {
        let accepted = ApplyResult::with_fix(
            Op::delete_node("a"),
            Op::delete_node("b").with_op_id(Some("o1".into())),
        );
        let ignored = ApplyResult::Ignored {
            ignored_op_id: Some("o2".into()),
        };
        let encoded: Value =
            serde_json::from_str(&encode_results(&[accepted, ignored]).unwrap()).unwrap();
        assert_eq!(
            encoded,
            json!([
                {"action": "accepted", "op": {"type": 5, "id": "a"},
                 "fix": {"type": 5, "opId": "o1", "id": "b"}},
                {"action": "ignored", "ignoredOpId": "o2"}
            ])
        );
    }

    #[test]
    fn test_ignored_without_op_id_omits_field() {
        let encoded = serde_json::to_value(ApplyResult::ignored(&Op::delete_node("x"))).unwrap();
        assert_eq!(encoded, json!({"action": "ignored"}));
    }
}
