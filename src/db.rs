//! SQLite access shared by the regenerators and the claim consumer.
//!
//! WAL initialization from several threads does a complicated dance and
//! can answer BUSY, so opening retries the journal-mode pragma with
//! exponential backoff before giving up.

use std::path::Path;
use std::thread;
use std::time::Duration;

use rusqlite::Connection;

/// Database file name inside the working directory.
pub const DB_FILE: &str = "db.sqlite3";

const WAL_ATTEMPTS: u32 = 7;

/// Why an asset generation was abandoned; maps onto the sysfails /
/// dbfails counters.
#[derive(Debug, thiserror::Error)]
pub enum GenError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

/// Open the store with WAL journaling and `synchronous=NORMAL`.
pub fn open(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    for attempt in 0..WAL_ATTEMPTS {
        match conn.pragma_update(None, "journal_mode", "WAL") {
            Ok(()) => break,
            Err(err) if is_busy(&err) && attempt + 1 < WAL_ATTEMPTS => {
                thread::sleep(Duration::from_millis(1 << attempt));
            }
            Err(err) => return Err(err),
        }
    }
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(conn)
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::DatabaseBusy
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_applies_wal_mode() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = open(&dir.path().join(DB_FILE)).expect("open");
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .expect("journal_mode");
        assert_eq!(mode.to_lowercase(), "wal");
        let sync: i64 = conn
            .query_row("PRAGMA synchronous", [], |row| row.get(0))
            .expect("synchronous");
        assert_eq!(sync, 1, "NORMAL");
    }
}
