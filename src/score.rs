//! Periodic leaderboard snapshots.
//!
//! Five windows share one generator (all-time plus hour/day/week/month),
//! each regenerated on its own absolute-deadline cadence so the loops
//! neither drift nor coalesce after an oversleep. A failed generation is
//! discarded; the previous snapshot keeps serving.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use log::{info, warn};
use serde_json::{Map, Value, json};

use crate::assets::{self, Asset, AssetContent, Assets};
use crate::claims::is_valid_nick;
use crate::clock::unix_parts;
use crate::db::{self, GenError};
use crate::lifecycle;
use crate::server::Server;

/// One leaderboard window: how far back it looks and how often it is
/// regenerated.
pub struct ScoreJob {
    pub name: &'static str,
    /// Window in seconds; -1 means all time.
    pub window_secs: i64,
    pub interval_ms: u64,
    pub select: fn(&Assets) -> &Asset,
}

pub static JOBS: [ScoreJob; 5] = [
    ScoreJob {
        name: "ScoreAll",
        window_secs: -1,
        interval_ms: 90_000,
        select: |a| &a.score,
    },
    ScoreJob {
        name: "ScoreHour",
        window_secs: 60 * 60,
        interval_ms: 10_000,
        select: |a| &a.score_hour,
    },
    ScoreJob {
        name: "ScoreDay",
        window_secs: 60 * 60 * 24,
        interval_ms: 15_000,
        select: |a| &a.score_day,
    },
    ScoreJob {
        name: "ScoreWeek",
        window_secs: 60 * 60 * 24 * 7,
        interval_ms: 30_000,
        select: |a| &a.score_week,
    },
    ScoreJob {
        name: "ScoreMonth",
        window_secs: 60 * 60 * 24 * 30,
        interval_ms: 60_000,
        select: |a| &a.score_month,
    },
];

const SCORE_ALL_SQL: &str = "SELECT nick, (ip >> 24), COUNT(*)\n\
                             FROM land\n\
                             GROUP BY nick, (ip >> 24)";
const SCORE_WINDOW_SQL: &str = "SELECT nick, (ip >> 24), COUNT(*)\n\
                                 FROM land\n\
                                WHERE created NOT NULL\n\
                                  AND created >= ?1\n\
                                GROUP BY nick, (ip >> 24)";

/// Cache-Control freshness derived from a regeneration interval.
pub fn cash_for_interval(interval_ms: u64) -> i32 {
    (interval_ms / 1000 / 2) as i32
}

/// Build one score document in a single transaction:
/// `{"now":[s,ns],"score":{"nick":[[octet,count],...],...}}`.
/// Rows with unregistrable nicknames are skipped.
pub fn generate(db_path: &Path, window_secs: i64, cash: i32) -> Result<AssetContent, GenError> {
    let conn = db::open(db_path)?;
    let created = SystemTime::now();
    let (secs, nanos) = unix_parts(created);

    let tx = conn.unchecked_transaction()?;
    let mut score = Map::new();
    {
        let mut stmt = if window_secs < 0 {
            conn.prepare(SCORE_ALL_SQL)?
        } else {
            conn.prepare(SCORE_WINDOW_SQL)?
        };
        let mut rows = if window_secs < 0 {
            stmt.query([])?
        } else {
            stmt.query([secs - window_secs])?
        };
        while let Some(row) = rows.next()? {
            let Ok(nick) = row.get::<_, String>(0) else {
                continue;
            };
            if !is_valid_nick(&nick) {
                continue;
            }
            let octet: i64 = row.get(1)?;
            let count: i64 = row.get(2)?;
            if let Value::Array(blocks) = score
                .entry(nick)
                .or_insert_with(|| Value::Array(Vec::new()))
            {
                blocks.push(json!([octet, count]));
            }
        }
    }
    tx.commit()?;

    let doc = json!({ "now": [secs, nanos], "score": score });
    let mut raw = serde_json::to_vec(&doc).map_err(|e| GenError::Io(e.into()))?;
    raw.push(b'\n');
    assets::json_content(raw, cash, created)
}

/// Worker loop for one leaderboard window: generate once before the
/// startup barrier, then regenerate every interval until shutdown.
pub fn run(server: Arc<Server>, job: &'static ScoreJob) {
    lifecycle::block_all_signals();
    info!("{} started", job.name);
    let cash = cash_for_interval(job.interval_ms);
    regenerate(&server, job, cash);
    server.lifecycle.ready.arrive();
    lifecycle::pin_to_cpu(0);
    let mut deadline = Instant::now();
    loop {
        regenerate(&server, job, cash);
        deadline += Duration::from_millis(job.interval_ms);
        if server.lifecycle.shutdown.wait_until(deadline) {
            break;
        }
    }
    info!("{} exiting", job.name);
}

fn regenerate(server: &Server, job: &ScoreJob, cash: i32) {
    match generate(&server.config.db_path(), job.window_secs, cash) {
        Ok(content) => (job.select)(&server.assets).publish(content),
        Err(err) => {
            server.stats.count_gen_error(&err);
            warn!("{}: {err}", job.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use rusqlite::Connection;

    use super::*;

    fn seed_db(dir: &Path) -> std::path::PathBuf {
        let path = dir.join(db::DB_FILE);
        let conn = Connection::open(&path).expect("open");
        conn.execute_batch(
            "CREATE TABLE land (ip INTEGER PRIMARY KEY, nick TEXT, created INTEGER);",
        )
        .expect("schema");
        conn.execute_batch(
            "INSERT INTO land (ip, nick, created) VALUES
                (16909060, 'Alice', 1700000000),
                (16909061, 'Alice', 1700000001),
                (33686018, 'Alice', 1700000002),
                (50462976, 'bob', 100),
                (67240192, 'bad name', 1700000003);",
        )
        .expect("rows");
        path
    }

    #[test]
    fn all_time_scores_group_by_top_octet() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = seed_db(dir.path());

        let content = generate(&path, -1, 45).expect("generate");
        assert_eq!(content.content_type, "application/json");
        assert_eq!(content.cash, 45);

        let doc: Value = serde_json::from_slice(&content.raw).expect("json");
        let now = doc["now"].as_array().expect("now pair");
        assert_eq!(now.len(), 2);
        let score = doc["score"].as_object().expect("score map");
        // Alice holds 2 blocks under 1.x and 1 block under 2.x
        assert_eq!(score["Alice"], json!([[1, 2], [2, 1]]));
        assert_eq!(score["bob"], json!([[3, 1]]));
        assert!(
            !score.contains_key("bad name"),
            "unregistrable nicks are skipped"
        );
    }

    #[test]
    fn windowed_scores_drop_stale_claims() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = seed_db(dir.path());

        let content = generate(&path, 60 * 60, 5).expect("generate");
        let doc: Value = serde_json::from_slice(&content.raw).expect("json");
        let score = doc["score"].as_object().expect("score map");
        assert!(
            !score.contains_key("bob"),
            "bob's ancient claim is outside every finite window"
        );
    }

    #[test]
    fn intervals_halve_into_cache_seconds() {
        assert_eq!(cash_for_interval(90_000), 45);
        assert_eq!(cash_for_interval(10_000), 5);
        assert_eq!(cash_for_interval(15_000), 7);
        assert_eq!(cash_for_interval(30_000), 15);
        assert_eq!(cash_for_interval(60_000), 30);
    }
}
