use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE transfers (
                id              TEXT PRIMARY KEY,
                file_name       TEXT NOT NULL,
                file_size       INTEGER NOT NULL,
                peer            TEXT NOT NULL,
                direction       TEXT NOT NULL,
                status          TEXT NOT NULL DEFAULT 'pending',
                started_at      TEXT NOT NULL,
                ended_at        TEXT,
                throughput_bps  REAL,
                error           TEXT
            );

            CREATE INDEX idx_transfers_started ON transfers(started_at);

            CREATE TABLE trusted_peers (
                peer_id         TEXT PRIMARY KEY,
                name            TEXT NOT NULL,
                public_key      TEXT NOT NULL,
                trusted_since   TEXT NOT NULL,
                last_seen       TEXT
            );

            CREATE TABLE trust_metrics (
                peer_id         TEXT PRIMARY KEY,
                successes       INTEGER NOT NULL DEFAULT 0,
                failures        INTEGER NOT NULL DEFAULT 0
            );

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    Ok(())
}
