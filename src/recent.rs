//! Event-driven snapshot of the 50 most recent claims.
//!
//! The claim consumer raises a signal after every committed batch; the
//! regenerator wakes, re-queries, and publishes. A pending flag makes
//! the signal durable, so a batch committed while a pass is in flight
//! is picked up by the next pass rather than lost.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use log::{info, warn};
use parking_lot::{Condvar, Mutex};
use rusqlite::{Connection, Statement};
use serde_json::{Value, json};

use crate::assets::{self, AssetContent};
use crate::clock::unix_parts;
use crate::db::{self, GenError};
use crate::lifecycle::{self, Notification};
use crate::server::Server;

const RECENT_SQL: &str = "SELECT ip, nick, created\n\
                          FROM land\n\
                          WHERE created NOT NULL\n\
                          ORDER BY created DESC\n\
                          LIMIT 50";

/// Wakeup channel from the claim consumer to the regenerator.
#[derive(Default)]
pub struct RecentSignal {
    pending: Mutex<bool>,
    cv: Condvar,
}

impl RecentSignal {
    pub fn new() -> RecentSignal {
        RecentSignal::default()
    }

    /// Record that new claims are committed and wake the regenerator.
    pub fn raise(&self) {
        let mut pending = self.pending.lock();
        *pending = true;
        self.cv.notify_one();
    }

    /// Wait for a raise; returns false once `shutdown` has fired.
    pub fn wait(&self, shutdown: &Notification) -> bool {
        let mut pending = self.pending.lock();
        loop {
            if shutdown.is_notified() {
                return false;
            }
            if *pending {
                *pending = false;
                return true;
            }
            self.cv.wait(&mut pending);
        }
    }

    /// Wake the waiter so it can observe a freshly fired shutdown.
    pub fn interrupt(&self) {
        let _pending = self.pending.lock();
        self.cv.notify_all();
    }
}

/// Build the recent document under one transaction:
/// `{"now":[s,ns],"recent":[[ip,"nick",created],...]}`.
pub fn generate(conn: &Connection, stmt: &mut Statement<'_>) -> Result<AssetContent, GenError> {
    let created = SystemTime::now();
    let (secs, nanos) = unix_parts(created);

    let tx = conn.unchecked_transaction()?;
    let mut recent = Vec::new();
    {
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let ip: i64 = row.get(0)?;
            let Ok(nick) = row.get::<_, String>(1) else {
                continue;
            };
            let claimed: i64 = row.get(2)?;
            recent.push(json!([ip, nick, claimed]));
        }
    }
    tx.commit()?;

    let doc = json!({ "now": [secs, nanos], "recent": Value::Array(recent) });
    let mut raw = serde_json::to_vec(&doc).map_err(|e| GenError::Io(e.into()))?;
    raw.push(b'\n');
    assets::json_content(raw, 0, created)
}

/// Worker loop: republish after every committed batch until shutdown.
/// Store errors reset the session and start over with a fresh handle.
pub fn run(server: Arc<Server>) {
    lifecycle::block_all_signals();
    info!("RecentWorker started");
    let db_path = server.config.db_path();
    let mut warmed = false;

    'session: loop {
        if server.lifecycle.shutdown.is_notified() && warmed {
            break;
        }
        let conn = match db::open(&db_path) {
            Ok(conn) => conn,
            Err(err) => {
                server.stats.dbfails.bump();
                warn!("RecentWorker open: {err}");
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
        };
        let mut stmt = match conn.prepare(RECENT_SQL) {
            Ok(stmt) => stmt,
            Err(err) => {
                server.stats.dbfails.bump();
                warn!("RecentWorker prepare: {err}");
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
        };
        loop {
            match generate(&conn, &mut stmt) {
                Ok(content) => {
                    server.assets.recent.publish(content);
                    if !warmed {
                        lifecycle::pin_to_cpu(1);
                        server.lifecycle.ready.arrive();
                        warmed = true;
                    }
                    if !server.recent.wait(&server.lifecycle.shutdown) {
                        break 'session;
                    }
                }
                Err(err) => {
                    server.stats.count_gen_error(&err);
                    warn!("RecentWorker: {err}");
                    continue 'session;
                }
            }
        }
    }
    info!("RecentWorker exiting");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    use super::*;

    #[test]
    fn recent_lists_newest_first_and_caps_at_fifty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = Connection::open(dir.path().join(db::DB_FILE)).expect("open");
        conn.execute_batch("CREATE TABLE land (ip INTEGER PRIMARY KEY, nick TEXT, created INTEGER);")
            .expect("schema");
        for n in 0..60i64 {
            conn.execute(
                "INSERT INTO land (ip, nick, created) VALUES (?1, ?2, ?3)",
                rusqlite::params![n, format!("player{n}"), 1_700_000_000 + n],
            )
            .expect("insert");
        }
        // NULL created rows never show up
        conn.execute(
            "INSERT INTO land (ip, nick, created) VALUES (999, 'ghost', NULL)",
            [],
        )
        .expect("insert null");

        let mut stmt = conn.prepare(RECENT_SQL).expect("prepare");
        let content = generate(&conn, &mut stmt).expect("generate");
        assert_eq!(content.cash, 0);

        let doc: Value = serde_json::from_slice(&content.raw).expect("json");
        let recent = doc["recent"].as_array().expect("recent rows");
        assert_eq!(recent.len(), 50);
        assert_eq!(recent[0], json!([59, "player59", 1_700_000_059i64]));
        assert_eq!(recent[49], json!([10, "player10", 1_700_000_010i64]));
    }

    #[test]
    fn raised_signal_survives_a_pass_in_flight() {
        let signal = RecentSignal::new();
        let shutdown = Notification::new();
        // raised while nobody waits, then observed by the next wait
        signal.raise();
        assert!(signal.wait(&shutdown));
        // and consumed exactly once
        shutdown.notify();
        assert!(!signal.wait(&shutdown));
    }

    #[test]
    fn wait_blocks_until_raised() {
        let signal = Arc::new(RecentSignal::new());
        let shutdown = Arc::new(Notification::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || {
                let start = Instant::now();
                let woke = signal.wait(&shutdown);
                (woke, start.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(30));
        signal.raise();
        let (woke, waited) = waiter.join().expect("waiter panicked");
        assert!(woke);
        assert!(waited >= Duration::from_millis(20));
    }
}
