//! warren-bindings - binding backend contracts for the warren runtime.
//!
//! The worker runtime projects host resources into JS as `env` bindings; this
//! crate defines the contracts those backends must satisfy, plus development
//! backends used in tests and local runs:
//!
//! - [`KvStore`] / [`MemoryKvStore`] — key/value with metadata, TTLs and
//!   cursor-based listing
//! - [`ObjectStore`] / [`MemoryObjectStore`] — object storage with signed and
//!   public URLs
//! - [`QueueSender`] / [`MemoryQueue`] — message producers
//! - [`DurableStore`] / [`MemoryDurableStore`] / [`RedbDurableStore`] —
//!   per-object isolated key spaces
//! - [`SqlDatabase`] — embedded SQLite databases (in-memory or on disk)
//! - [`AssetFetcher`] / [`StaticAssetFetcher`] — static asset lookup

pub mod assets;
pub mod durable;
pub mod error;
pub mod kv;
pub mod queue;
pub mod sql;
pub mod storage;

pub use assets::{AssetFetcher, AssetResponse, StaticAssetFetcher};
pub use durable::{DurableStore, MemoryDurableStore, RedbDurableStore};
pub use error::{BindingError, BindingResult};
pub use kv::{KvEntry, KvKeyInfo, KvListOptions, KvListResult, KvPutOptions, KvStore, MemoryKvStore};
pub use queue::{MemoryQueue, QueueSender};
pub use sql::{SqlDatabase, SqlExecMeta, SqlRows, SqlValue};
pub use storage::{
    MemoryObjectStore, ObjectList, ObjectListOptions, ObjectMeta, ObjectStore, StoredObject,
};
