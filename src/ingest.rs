//! The single consumer draining the claim queue into SQLite.
//!
//! Batching claims into one transaction keeps thousands of HTTP threads
//! away from the database; only this thread and the regenerators ever
//! hold a handle. Exits once the queue reads empty under termination.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use rusqlite::{Connection, Statement, params};

use crate::claims::Claim;
use crate::db;
use crate::lifecycle;
use crate::server::Server;

/// Max claims inserted per transaction.
pub const BATCH_MAX: usize = 64;

/// A /24 block changes hands when the nick differs, the previous claim
/// never committed a timestamp, or an hour has passed.
const UPSERT_SQL: &str = "INSERT INTO land (ip, nick, created)\n\
                          VALUES (?1, ?2, ?3)\n\
                          ON CONFLICT (ip) DO\n\
                          UPDATE SET (nick, created) = (?2, ?3)\n\
                           WHERE nick != ?2\n\
                              OR created IS NULL\n\
                              OR ?3 - created > 3600";

/// Worker loop: drain, commit, wake the recent regenerator, repeat.
/// Store errors finalize the session and reopen from scratch.
pub fn run(server: Arc<Server>) {
    lifecycle::block_all_signals();
    info!("ClaimWorker started");
    let db_path = server.config.db_path();
    let mut warmed = false;

    'session: loop {
        let conn = match db::open(&db_path) {
            Ok(conn) => conn,
            Err(err) => {
                server.stats.dbfails.bump();
                warn!("ClaimWorker open: {err}");
                if server.lifecycle.terminate.is_notified() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
        };
        let mut stmt = match conn.prepare(UPSERT_SQL) {
            Ok(stmt) => stmt,
            Err(err) => {
                server.stats.dbfails.bump();
                warn!("ClaimWorker prepare: {err}");
                if server.lifecycle.terminate.is_notified() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
        };
        if !warmed {
            lifecycle::pin_to_cpu(0);
            server.lifecycle.ready.arrive();
            warmed = true;
        }
        loop {
            let batch = server
                .claims
                .dequeue_batch(BATCH_MAX, None, &server.lifecycle.terminate);
            if batch.is_empty() {
                break 'session;
            }
            match commit_batch(&conn, &mut stmt, &batch) {
                Ok(()) => {
                    debug!("committed {} claims", batch.len());
                    server.recent.raise();
                }
                Err(err) => {
                    server.stats.dbfails.bump();
                    warn!("ClaimWorker commit: {err}");
                    continue 'session;
                }
            }
        }
    }
    info!("ClaimWorker exiting");
}

fn commit_batch(
    conn: &Connection,
    stmt: &mut Statement<'_>,
    batch: &[Claim],
) -> rusqlite::Result<()> {
    let tx = conn.unchecked_transaction()?;
    for claim in batch {
        stmt.execute(params![i64::from(claim.ip), claim.nick, claim.created])?;
    }
    tx.commit()
}
