//! Optional SQLite-backed persistent storage adapter for cachebay
//! (`spec.md` §6 "storage"), with a journal table for cross-tab sync.

mod schema;
mod storage;

pub use storage::{
    JournalEntry, JournalOp, SqliteStorage, SqliteStorageFactory, StorageAdapter, StorageError,
    StorageFactory, StorageInspection,
};
