//! # arbor-store — Replicated tree storage engine
//!
//! Server side of a collaborative document: a tree of Objects, Maps, Lists
//! and Registers that clients mutate with small ops, plus a versioned cache
//! that lets any client catch up from the clock it last saw.
//!
//! ## Architecture
//!
//! ```text
//!  client ops (JSON)                         server code
//!        │ decode_batch                            │ LiveObject / LiveMap / LiveList
//!        ▼                                         ▼
//! ┌─────────────┐   TreeChange    ┌───────────────────────────┐
//! │ Op Reducer  │ ──────────────► │ Version Cache             │
//! │ (conflicts, │ ◄────────────── │ storage / versions / kinds│
//! │  fix ops)   │   CacheWrite    │ + Mutation Pool           │
//! └──────┬──────┘                 └─────────────┬─────────────┘
//!        │ Driver                               │ delta_since(v)
//!        ▼                                      ▼
//! ┌─────────────┐                        Delta [removed, values, refs]
//! │ Node Store  │
//! │ (Tree)      │
//! └──────┬──────┘
//!        │ PersistentDriver / CacheCommit
//!        ▼
//! ┌─────────────┐
//! │ RocksDB     │
//! └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`node`] — Node kinds and the parent relation
//! - [`position`] — Fractional list positions
//! - [`tree`] — In-memory node tree with a change journal
//! - [`driver`] — Storage backends behind the reducer
//! - [`op`] — Ops, verdicts and their JSON wire format
//! - [`reducer`] — Applies ops and settles conflicts
//! - [`cache`] — Transactional versioned cache and catch-up deltas
//! - [`pool`] — Live structures bound to cache nodes
//! - [`document`] — Tree and cache kept in step
//! - [`storage`] — RocksDB persistence

pub mod cache;
pub mod document;
pub mod driver;
pub mod node;
pub mod op;
pub mod pool;
pub mod position;
pub mod reducer;
pub mod storage;
pub mod tree;

// Re-exports for convenience
pub use cache::{
    CacheConfig, CacheError, CacheWrite, CacheWriter, Delta, Entry, NodeRecord, VersionCache,
};
pub use document::Document;
pub use driver::{Driver, PersistentDriver};
pub use node::{CrdtKind, JsonObject, Node, NodeId, ParentRef, ROOT_ID};
pub use op::{
    decode_batch, decode_ops, encode_results, ApplyResult, CreateOp, Intent, Op, OpDecodeError,
    RejectedOp,
};
pub use pool::{LiveList, LiveMap, LiveObject, LiveValue};
pub use reducer::{apply_op, apply_ops};
pub use storage::{DocumentMetadata, DocumentStore, StoreConfig, StoreError};
pub use tree::{BuildReport, Tree, TreeChange, TreeError};
