//! Table layout for the SQLite storage adapter.
//!
//! Two tables: `records` holds one row per cache record, its arbitrary
//! field map flattened into a single `body_json` text column rather than
//! spread across typed columns. `journal` makes storage usable for
//! cross-tab sync (`spec.md` §1, §6 "storage"), giving other tabs/
//! processes an ordered log of puts/removes to replay instead of
//! re-reading the whole table.

pub const CREATE_RECORDS_TABLE: &str = "
CREATE TABLE IF NOT EXISTS records (
    record_id  TEXT PRIMARY KEY,
    version    INTEGER NOT NULL,
    body_json  TEXT NOT NULL
)";

pub const CREATE_JOURNAL_TABLE: &str = "
CREATE TABLE IF NOT EXISTS journal (
    seq        INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id  TEXT NOT NULL,
    op         TEXT NOT NULL,
    version    INTEGER,
    body_json  TEXT
)";

pub const CREATE_CURSOR_INDEX_TABLE: &str = "
CREATE TABLE IF NOT EXISTS cursor_index (
    canonical_key TEXT NOT NULL,
    cursor        TEXT NOT NULL,
    position      INTEGER NOT NULL,
    PRIMARY KEY (canonical_key, cursor)
)";

pub const CREATE_EDGE_COUNTERS_TABLE: &str = "
CREATE TABLE IF NOT EXISTS edge_counters (
    canonical_key TEXT PRIMARY KEY,
    next_index    INTEGER NOT NULL
)";

pub fn migrate(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    conn.execute(CREATE_RECORDS_TABLE, [])?;
    conn.execute(CREATE_JOURNAL_TABLE, [])?;
    conn.execute(CREATE_CURSOR_INDEX_TABLE, [])?;
    conn.execute(CREATE_EDGE_COUNTERS_TABLE, [])?;
    Ok(())
}
