//! The storage contract (`spec.md` §6: `{put, remove, load, flushJournal,
//! evictJournal, evictAll, inspect, dispose}`) plus a SQLite-backed
//! implementation.

use cachebay_types::{Record, RecordId};
use cachebay_wire::{record_from_wire, record_to_wire, WireField, WireRecord};

use crate::schema;

#[derive(Debug)]
pub enum StorageError {
    Sqlite(rusqlite::Error),
    Codec(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Sqlite(e) => write!(f, "storage backend error: {e}"),
            StorageError::Codec(e) => write!(f, "storage codec error: {e}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Sqlite(e)
    }
}

/// One entry in the cross-tab journal, in the order another tab should
/// replay it.
#[derive(Debug, Clone)]
pub enum JournalOp {
    Put { id: RecordId, version: u64, record: Record },
    Remove { id: RecordId },
}

#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub seq: i64,
    pub op: JournalOp,
}

#[derive(Debug, Default, Clone)]
pub struct StorageInspection {
    pub record_count: usize,
    pub journal_len: usize,
}

/// A live connection to persistent storage, opened by a
/// [`StorageFactory`]. Mirrors the host-supplied `storage` contract from
/// `spec.md` §6.
pub trait StorageAdapter: Send {
    fn put(&mut self, id: &RecordId, version: u64, record: &Record) -> Result<(), StorageError>;
    fn remove(&mut self, id: &RecordId) -> Result<(), StorageError>;
    fn load(&mut self) -> Result<Vec<(RecordId, u64, Record)>, StorageError>;
    /// Drains journal entries (in ascending `seq` order) for another
    /// tab/process to replay.
    fn flush_journal(&mut self) -> Result<Vec<JournalEntry>, StorageError>;
    /// Deletes journal entries at or below `up_to_seq` once every reader
    /// has applied them.
    fn evict_journal(&mut self, up_to_seq: i64) -> Result<(), StorageError>;
    fn evict_all(&mut self) -> Result<(), StorageError>;
    fn inspect(&mut self) -> Result<StorageInspection, StorageError>;
    fn dispose(self: Box<Self>) -> Result<(), StorageError>;
}

/// Yields a fresh [`StorageAdapter`] connection (`spec.md` §6 `storage`
/// factory).
pub trait StorageFactory: Send + Sync {
    fn open(&self) -> Result<Box<dyn StorageAdapter>, StorageError>;
}

pub struct SqliteStorage {
    conn: rusqlite::Connection,
}

impl SqliteStorage {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let conn = rusqlite::Connection::open(path)?;
        schema::migrate(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = rusqlite::Connection::open_in_memory()?;
        schema::migrate(&conn)?;
        Ok(Self { conn })
    }

    fn record_body_json(record: &Record, id: &RecordId, version: u64) -> Result<String, StorageError> {
        let wire = record_to_wire(id, version, record).map_err(|e| StorageError::Codec(e.to_string()))?;
        Ok(encode_fields(&wire))
    }
}

/// Encodes just the field list of a [`WireRecord`] (the `records`/
/// `journal` tables key `record_id`/`version` as their own columns, so
/// only the field map needs to round-trip through `body_json`).
fn encode_fields(wire: &WireRecord) -> String {
    facet_json_fields(&wire.fields)
}

fn facet_json_fields(fields: &[WireField]) -> String {
    facet_json::to_string(&fields.to_vec()).unwrap_or_else(|_| "[]".to_string())
}

fn decode_fields(body_json: &str) -> Result<Vec<WireField>, StorageError> {
    facet_json::from_str(body_json).map_err(|e| StorageError::Codec(e.to_string()))
}

impl StorageAdapter for SqliteStorage {
    fn put(&mut self, id: &RecordId, version: u64, record: &Record) -> Result<(), StorageError> {
        let body_json = Self::record_body_json(record, id, version)?;

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO records (record_id, version, body_json) VALUES (?1, ?2, ?3)
             ON CONFLICT(record_id) DO UPDATE SET version = excluded.version, body_json = excluded.body_json",
            rusqlite::params![id.as_str(), version as i64, body_json],
        )?;
        tx.execute(
            "INSERT INTO journal (record_id, op, version, body_json) VALUES (?1, 'put', ?2, ?3)",
            rusqlite::params![id.as_str(), version as i64, body_json],
        )?;
        tx.commit()?;

        tracing::debug!(record_id = %id, version, "storage: put");
        Ok(())
    }

    fn remove(&mut self, id: &RecordId) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM records WHERE record_id = ?1", rusqlite::params![id.as_str()])?;
        tx.execute(
            "INSERT INTO journal (record_id, op, version, body_json) VALUES (?1, 'remove', NULL, NULL)",
            rusqlite::params![id.as_str()],
        )?;
        tx.commit()?;

        tracing::debug!(record_id = %id, "storage: remove");
        Ok(())
    }

    fn load(&mut self) -> Result<Vec<(RecordId, u64, Record)>, StorageError> {
        let mut stmt = self.conn.prepare("SELECT record_id, version, body_json FROM records")?;
        let rows = stmt.query_map([], |row| {
            let record_id: String = row.get(0)?;
            let version: i64 = row.get(1)?;
            let body_json: String = row.get(2)?;
            Ok((record_id, version, body_json))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (record_id, version, body_json) = row?;
            let fields = decode_fields(&body_json)?;
            let wire = WireRecord { id: record_id, version: version as u64, fields };
            let (id, version, record) = record_from_wire(&wire).map_err(|e| StorageError::Codec(e.to_string()))?;
            out.push((id, version, record));
        }
        Ok(out)
    }

    fn flush_journal(&mut self) -> Result<Vec<JournalEntry>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT seq, record_id, op, version, body_json FROM journal ORDER BY seq ASC")?;
        let rows = stmt.query_map([], |row| {
            let seq: i64 = row.get(0)?;
            let record_id: String = row.get(1)?;
            let op: String = row.get(2)?;
            let version: Option<i64> = row.get(3)?;
            let body_json: Option<String> = row.get(4)?;
            Ok((seq, record_id, op, version, body_json))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (seq, record_id, op, version, body_json) = row?;
            let entry_op = match op.as_str() {
                "remove" => JournalOp::Remove { id: RecordId::from(record_id) },
                _ => {
                    let body_json = body_json.ok_or_else(|| {
                        StorageError::Codec("put journal entry missing body_json".into())
                    })?;
                    let fields = decode_fields(&body_json)?;
                    let version = version.unwrap_or(0) as u64;
                    let wire = WireRecord { id: record_id.clone(), version, fields };
                    let (id, version, record) =
                        record_from_wire(&wire).map_err(|e| StorageError::Codec(e.to_string()))?;
                    JournalOp::Put { id, version, record }
                }
            };
            out.push(JournalEntry { seq, op: entry_op });
        }
        Ok(out)
    }

    fn evict_journal(&mut self, up_to_seq: i64) -> Result<(), StorageError> {
        self.conn
            .execute("DELETE FROM journal WHERE seq <= ?1", rusqlite::params![up_to_seq])?;
        Ok(())
    }

    fn evict_all(&mut self) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM records", [])?;
        tx.execute("DELETE FROM journal", [])?;
        tx.execute("DELETE FROM cursor_index", [])?;
        tx.execute("DELETE FROM edge_counters", [])?;
        tx.commit()?;

        tracing::info!("storage: evicted all");
        Ok(())
    }

    fn inspect(&mut self) -> Result<StorageInspection, StorageError> {
        let record_count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        let journal_len: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM journal", [], |row| row.get(0))?;
        Ok(StorageInspection {
            record_count: record_count as usize,
            journal_len: journal_len as usize,
        })
    }

    fn dispose(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }
}

pub struct SqliteStorageFactory {
    path: String,
}

impl SqliteStorageFactory {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

impl StorageFactory for SqliteStorageFactory {
    fn open(&self) -> Result<Box<dyn StorageAdapter>, StorageError> {
        Ok(Box::new(SqliteStorage::open(&self.path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachebay_types::FieldValue;
    use serde_json::json;

    fn sample_record() -> Record {
        let mut record = Record::new();
        record.insert("email", FieldValue::Scalar(json!("a@x")));
        record
    }

    #[test]
    fn put_then_load_round_trips() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let id = RecordId::entity("User", "u1");
        storage.put(&id, 1, &sample_record()).unwrap();

        let loaded = storage.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0, id);
        assert_eq!(loaded[0].1, 1);
        assert_eq!(loaded[0].2, sample_record());
    }

    #[test]
    fn remove_deletes_record_and_journals_it() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let id = RecordId::entity("User", "u1");
        storage.put(&id, 1, &sample_record()).unwrap();
        storage.remove(&id).unwrap();

        assert!(storage.load().unwrap().is_empty());

        let journal = storage.flush_journal().unwrap();
        assert_eq!(journal.len(), 2);
        assert!(matches!(journal[1].op, JournalOp::Remove { .. }));
    }

    #[test]
    fn evict_journal_drops_entries_up_to_seq() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let id = RecordId::entity("User", "u1");
        storage.put(&id, 1, &sample_record()).unwrap();
        storage.put(&id, 2, &sample_record()).unwrap();

        let journal = storage.flush_journal().unwrap();
        let last_seq = journal.last().unwrap().seq;
        storage.evict_journal(last_seq).unwrap();

        assert!(storage.flush_journal().unwrap().is_empty());
    }

    #[test]
    fn evict_all_clears_everything() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        let id = RecordId::entity("User", "u1");
        storage.put(&id, 1, &sample_record()).unwrap();
        storage.evict_all().unwrap();

        let inspection = storage.inspect().unwrap();
        assert_eq!(inspection.record_count, 0);
        assert_eq!(inspection.journal_len, 0);
    }
}
