use crate::Database;
use anyhow::{Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{OptionalExtension, Row};
use stork_types::{TransferRecord, TransferStatus, TrustMetrics, TrustedPeer};
use uuid::Uuid;

const TRANSFER_COLUMNS: &str = "id, file_name, file_size, peer, direction, status, started_at, ended_at, throughput_bps, error";

impl Database {
    // -- Transfer history --

    pub fn insert_transfer(&self, record: &TransferRecord) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO transfers (id, file_name, file_size, peer, direction, status, started_at, ended_at, throughput_bps, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    record.id.to_string(),
                    record.file_name,
                    record.file_size as i64,
                    record.peer,
                    record.direction.as_str(),
                    record.status.as_str(),
                    fmt_time(record.started_at),
                    record.ended_at.map(fmt_time),
                    record.throughput_bps,
                    record.error,
                ],
            )?;
            Ok(())
        })
    }

    /// Move a transfer to `status`. Terminal rows are never changed again;
    /// returns false if the row is missing or already terminal.
    pub fn update_transfer_status(
        &self,
        id: Uuid,
        status: TransferStatus,
        error: Option<&str>,
        throughput_bps: Option<f64>,
    ) -> Result<bool> {
        let ended_at = status.is_terminal().then(|| fmt_time(Utc::now()));
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE transfers
                 SET status = ?2,
                     ended_at = COALESCE(?3, ended_at),
                     error = COALESCE(?4, error),
                     throughput_bps = COALESCE(?5, throughput_bps)
                 WHERE id = ?1 AND status NOT IN ('completed', 'failed', 'cancelled')",
                rusqlite::params![id.to_string(), status.as_str(), ended_at, error, throughput_bps],
            )?;
            Ok(changed == 1)
        })
    }

    /// Put a failed or cancelled transfer back in progress for a resumed
    /// attempt. Completed rows stay closed; returns false if nothing changed.
    pub fn reopen_transfer(&self, id: Uuid) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE transfers
                 SET status = 'in_progress', ended_at = NULL, error = NULL
                 WHERE id = ?1 AND status != 'completed'",
                [id.to_string()],
            )?;
            Ok(changed == 1)
        })
    }

    pub fn get_transfer(&self, id: Uuid) -> Result<Option<TransferRecord>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {TRANSFER_COLUMNS} FROM transfers WHERE id = ?1");
            let row = conn
                .query_row(&sql, [id.to_string()], transfer_from_row)
                .optional()?;
            row.transpose()
        })
    }

    /// Most recent transfers first.
    pub fn list_transfers(&self, limit: u32) -> Result<Vec<TransferRecord>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {TRANSFER_COLUMNS} FROM transfers ORDER BY started_at DESC LIMIT ?1"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([limit], transfer_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().collect()
        })
    }

    // -- Trusted peers --

    pub fn upsert_trusted_peer(&self, peer: &TrustedPeer) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO trusted_peers (peer_id, name, public_key, trusted_since, last_seen)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(peer_id) DO UPDATE SET
                     name = excluded.name,
                     public_key = excluded.public_key,
                     trusted_since = excluded.trusted_since,
                     last_seen = excluded.last_seen",
                rusqlite::params![
                    peer.peer_id,
                    peer.name,
                    peer.public_key,
                    fmt_time(peer.trusted_since),
                    peer.last_seen.map(fmt_time),
                ],
            )?;
            Ok(())
        })
    }

    pub fn delete_trusted_peer(&self, peer_id: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let n = conn.execute("DELETE FROM trusted_peers WHERE peer_id = ?1", [peer_id])?;
            Ok(n > 0)
        })
    }

    pub fn touch_trusted_peer(&self, peer_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE trusted_peers SET last_seen = ?2 WHERE peer_id = ?1",
                (peer_id, fmt_time(at)),
            )?;
            Ok(())
        })
    }

    pub fn list_trusted_peers(&self) -> Result<Vec<TrustedPeer>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT peer_id, name, public_key, trusted_since, last_seen
                 FROM trusted_peers ORDER BY trusted_since",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(peer_id, name, public_key, since, seen)| -> Result<TrustedPeer> {
                    Ok(TrustedPeer {
                        peer_id,
                        name,
                        public_key,
                        trusted_since: parse_time(&since)?,
                        last_seen: seen.as_deref().map(parse_time).transpose()?,
                    })
                })
                .collect()
        })
    }

    // -- Trust metrics --

    pub fn record_outcome(&self, peer_id: &str, success: bool) -> Result<()> {
        let (s, f) = if success { (1, 0) } else { (0, 1) };
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO trust_metrics (peer_id, successes, failures) VALUES (?1, ?2, ?3)
                 ON CONFLICT(peer_id) DO UPDATE SET
                     successes = successes + excluded.successes,
                     failures = failures + excluded.failures",
                rusqlite::params![peer_id, s, f],
            )?;
            Ok(())
        })
    }

    pub fn metrics(&self, peer_id: &str) -> Result<TrustMetrics> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT successes, failures FROM trust_metrics WHERE peer_id = ?1",
                    [peer_id],
                    |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?)),
                )
                .optional()?;
            Ok(row
                .map(|(s, f)| TrustMetrics { successes: s as u64, failures: f as u64 })
                .unwrap_or_default())
        })
    }

    pub fn all_metrics(&self) -> Result<Vec<(String, TrustMetrics)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT peer_id, successes, failures FROM trust_metrics")?;
            let rows = stmt
                .query_map([], |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        TrustMetrics {
                            successes: r.get::<_, i64>(1)? as u64,
                            failures: r.get::<_, i64>(2)? as u64,
                        },
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

/// Fixed-width UTC timestamps so TEXT ordering matches time ordering.
fn fmt_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .map_err(|e| anyhow!("Bad timestamp {:?}: {}", s, e))?
        .with_timezone(&Utc))
}

fn transfer_from_row(row: &Row<'_>) -> rusqlite::Result<Result<TransferRecord>> {
    let id: String = row.get(0)?;
    let file_name: String = row.get(1)?;
    let file_size: i64 = row.get(2)?;
    let peer: String = row.get(3)?;
    let direction: String = row.get(4)?;
    let status: String = row.get(5)?;
    let started_at: String = row.get(6)?;
    let ended_at: Option<String> = row.get(7)?;
    let throughput_bps: Option<f64> = row.get(8)?;
    let error: Option<String> = row.get(9)?;

    let build = || -> Result<TransferRecord> {
        Ok(TransferRecord {
            id: Uuid::parse_str(&id)?,
            file_name,
            file_size: file_size as u64,
            peer,
            direction: direction.parse()?,
            status: status.parse()?,
            started_at: parse_time(&started_at)?,
            ended_at: ended_at.as_deref().map(parse_time).transpose()?,
            throughput_bps,
            error,
        })
    };
    Ok(build())
}
