//! Persistent storage for one document.
//!
//! Architecture:
//! ```text
//! ┌──────────────────┐  node puts/deletes   ┌────────────────────────────────────┐
//! │ PersistentDriver │ ───────────────────► │ DocumentStore (RocksDB)            │
//! └──────────────────┘                      │                                    │
//! ┌──────────────────┐  CacheCommit batch   │ CF "nodes"    — tree node records  │
//! │ VersionCache     │ ───────────────────► │ CF "storage"  — (node,key) → entry │
//! └──────────────────┘                      │ CF "versions" — (node,key,clock)   │
//!          ▲                                │ CF "kinds"    — node kind + deref  │
//!          │  CacheImage on open            │ CF "metadata" — clock, timestamps  │
//!          └─────────────────────────────── └────────────────────────────────────┘
//! ```
//!
//! Every commit is a single `WriteBatch`, so a cache transaction either lands
//! completely or not at all.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 3

pub mod rocks;

pub use rocks::{CacheCommit, CacheImage, DocumentMetadata, DocumentStore, StoreConfig, StoreError};
