use crate::models::LookupStrategy;
use anyhow::Result;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::path::Path;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS lookup_outcome (
    track_id   TEXT NOT NULL,
    strategy   TEXT NOT NULL,
    outcome    TEXT NOT NULL,
    query      TEXT,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (track_id, strategy)
);
"#;

pub fn open_or_create(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    run_migrations(&conn)?;
    Ok(conn)
}

pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// Remember that `strategy` found nothing for `track_id`, so later runs can
/// move straight on to the next strategy.
pub fn record_not_found(conn: &Connection, track_id: &str, strategy: LookupStrategy, query: &str) -> Result<()> {
    let now = Utc::now().timestamp();
    conn.execute(
        "INSERT INTO lookup_outcome (track_id, strategy, outcome, query, updated_at) VALUES (?1, ?2, 'not_found', ?3, ?4)
         ON CONFLICT(track_id, strategy) DO UPDATE SET outcome = excluded.outcome, query = excluded.query, updated_at = excluded.updated_at",
        params![track_id, strategy.as_str(), query, now],
    )?;
    Ok(())
}

pub fn is_known_not_found(conn: &Connection, track_id: &str, strategy: LookupStrategy) -> Result<bool> {
    let row: Option<String> = conn
        .query_row(
            "SELECT outcome FROM lookup_outcome WHERE track_id = ?1 AND strategy = ?2",
            params![track_id, strategy.as_str()],
            |r| r.get(0),
        )
        .optional()?;
    Ok(row.as_deref() == Some("not_found"))
}

/// All (track, strategy) pairs known to fail, for the given tracks.
pub fn known_not_found(conn: &Connection, track_ids: &[String]) -> Result<HashSet<(String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT track_id, strategy FROM lookup_outcome WHERE track_id = ?1 AND outcome = 'not_found'",
    )?;
    let mut out = HashSet::new();
    for id in track_ids {
        let rows = stmt.query_map(params![id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;
        for r in rows {
            out.insert(r?);
        }
    }
    Ok(out)
}

/// Forget a track's recorded outcomes, e.g. once a lookup finally succeeded.
pub fn clear_outcomes(conn: &Connection, track_id: &str) -> Result<usize> {
    let n = conn.execute("DELETE FROM lookup_outcome WHERE track_id = ?1", params![track_id])?;
    Ok(n)
}

pub fn count_not_found(conn: &Connection) -> Result<i64> {
    let n = conn.query_row(
        "SELECT COUNT(DISTINCT track_id) FROM lookup_outcome WHERE outcome = 'not_found'",
        [],
        |r| r.get(0),
    )?;
    Ok(n)
}
