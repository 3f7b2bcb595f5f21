//! SQLite metrics store.
//!
//! All access goes through the connection pool; checkout is scoped to each
//! operation so handles are released even on error paths.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Result as SqlResult, Row};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

use super::models::*;
use super::pool::ConnectionPool;

/// Database error types.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("migration error: {0}")]
    Migration(String),
    #[error("connection pool exhausted")]
    PoolExhausted,
    #[error("not found")]
    NotFound,
}

impl StoreError {
    /// Worth one more attempt before dropping the record.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::PoolExhausted)
    }
}

/// Ordered, additive schema migrations. Applied under a version guard so
/// running them again is a no-op.
const MIGRATIONS: &[(&str, &str)] = &[
    ("0001_init", include_str!("../../migrations/0001_init.sql")),
    (
        "0002_session_quality",
        include_str!("../../migrations/0002_session_quality.sql"),
    ),
    (
        "0003_identity_columns",
        include_str!("../../migrations/0003_identity_columns.sql"),
    ),
];

const METRIC_COLUMNS: &str = "firewall_name, timestamp, cpu_user, cpu_system, cpu_idle, mgmt_cpu, \
     data_plane_cpu_mean, data_plane_cpu_max, data_plane_cpu_p95, \
     throughput_mbps_mean, throughput_mbps_max, throughput_mbps_min, throughput_mbps_p95, \
     pps_mean, pps_max, pps_min, pps_p95, pbuf_util_percent, \
     session_sample_count, session_success_rate, session_sampling_period";

/// Pooled metrics store.
#[derive(Clone)]
pub struct Store {
    pool: ConnectionPool,
}

impl Store {
    /// Open the store and bring the schema up to date.
    pub fn open<P: AsRef<Path>>(path: P, pool_size: usize) -> Result<Self, StoreError> {
        let pool = ConnectionPool::open(path, pool_size)?;
        let store = Self { pool };
        store.migrate_schema()?;
        Ok(store)
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Apply pending migrations. Idempotent: the stored schema version
    /// guards each step, and each step runs inside a transaction.
    pub fn migrate_schema(&self) -> Result<(), StoreError> {
        let mut conn = self.pool.checkout()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);
             INSERT INTO schema_version (version)
                 SELECT 0 WHERE NOT EXISTS (SELECT 1 FROM schema_version);",
        )?;

        let current: i64 =
            conn.query_row("SELECT version FROM schema_version", [], |r| r.get(0))?;

        for (idx, (name, sql)) in MIGRATIONS.iter().enumerate() {
            let version = idx as i64 + 1;
            if version <= current {
                continue;
            }
            let tx = conn.transaction()?;
            tx.execute_batch(sql)
                .map_err(|e| StoreError::Migration(format!("{} failed: {}", name, e)))?;
            tx.execute("UPDATE schema_version SET version = ?1", params![version])?;
            tx.commit()?;
            tracing::info!(migration = %name, version, "applied schema migration");
        }

        Ok(())
    }

    pub fn schema_version(&self) -> Result<i64, StoreError> {
        let conn = self.pool.checkout()?;
        Ok(conn.query_row("SELECT version FROM schema_version", [], |r| r.get(0))?)
    }

    // --- Firewalls / identity ---

    /// Register a firewall by name, updating the host on re-registration.
    pub fn register_firewall(&self, name: &str, host: &str) -> Result<(), StoreError> {
        let conn = self.pool.checkout()?;
        conn.execute(
            "INSERT INTO firewalls (name, host) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET host = excluded.host, updated_at = CURRENT_TIMESTAMP",
            params![name, host],
        )?;
        Ok(())
    }

    /// Upsert detected hardware identity, keeping known fields when a
    /// re-detection comes back partial.
    pub fn write_identity(&self, name: &str, identity: &FirewallIdentity) -> Result<(), StoreError> {
        let conn = self.pool.checkout()?;
        let updated = conn.execute(
            "UPDATE firewalls SET
                model = COALESCE(?2, model),
                family = COALESCE(?3, family),
                platform_family = COALESCE(?4, platform_family),
                serial = COALESCE(?5, serial),
                hostname = COALESCE(?6, hostname),
                sw_version = COALESCE(?7, sw_version),
                updated_at = CURRENT_TIMESTAMP
             WHERE name = ?1",
            params![
                name,
                identity.model,
                identity.family,
                identity.platform_family,
                identity.serial,
                identity.hostname,
                identity.sw_version,
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// All registered firewalls with identity and activity summary.
    pub fn get_firewalls(&self) -> Result<Vec<FirewallRow>, StoreError> {
        let conn = self.pool.checkout()?;
        let mut stmt = conn.prepare(
            "SELECT f.name, f.host, f.model, f.family, f.platform_family, f.serial,
                    f.hostname, f.sw_version,
                    COUNT(m.id) AS metric_count,
                    MAX(m.timestamp) AS last_metric_time
             FROM firewalls f
             LEFT JOIN metrics m ON f.name = m.firewall_name
             GROUP BY f.name
             ORDER BY f.name",
        )?;

        let rows = stmt
            .query_map([], |row| {
                let last: Option<String> = row.get(9)?;
                Ok(FirewallRow {
                    name: row.get(0)?,
                    host: row.get(1)?,
                    identity: FirewallIdentity {
                        model: row.get(2)?,
                        family: row.get(3)?,
                        platform_family: row.get(4)?,
                        serial: row.get(5)?,
                        hostname: row.get(6)?,
                        sw_version: row.get(7)?,
                    },
                    metric_count: row.get(8)?,
                    last_metric_time: last.as_deref().and_then(parse_db_time),
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(rows)
    }

    // --- Metrics ---

    /// Insert one aggregated record. Retries once when the pool is drained;
    /// the caller decides what to do with a dropped record.
    pub fn write_record(&self, record: &MetricRecord) -> Result<(), StoreError> {
        match self.try_write_record(record) {
            Err(e) if e.is_retryable() => {
                tracing::warn!(
                    firewall = %record.firewall_name,
                    "pool exhausted writing record, retrying once"
                );
                self.try_write_record(record)
            }
            other => other,
        }
    }

    fn try_write_record(&self, record: &MetricRecord) -> Result<(), StoreError> {
        let conn = self.pool.checkout()?;
        conn.execute(
            &format!(
                "INSERT INTO metrics ({METRIC_COLUMNS}) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21)"
            ),
            params![
                record.firewall_name,
                fmt_db_time(record.timestamp),
                record.cpu_user,
                record.cpu_system,
                record.cpu_idle,
                record.mgmt_cpu,
                record.data_plane_cpu_mean,
                record.data_plane_cpu_max,
                record.data_plane_cpu_p95,
                record.throughput_mbps_mean,
                record.throughput_mbps_max,
                record.throughput_mbps_min,
                record.throughput_mbps_p95,
                record.pps_mean,
                record.pps_max,
                record.pps_min,
                record.pps_p95,
                record.pbuf_util_percent,
                record.session_sample_count,
                record.session_success_rate,
                record.session_sampling_period,
            ],
        )?;
        Ok(())
    }

    /// Records for one firewall in `[start, end)`, ascending by timestamp.
    ///
    /// `limit` keeps the newest N rows; `None` returns every matching row.
    pub fn query(
        &self,
        firewall: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<MetricRecord>, StoreError> {
        let conn = self.pool.checkout()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {METRIC_COLUMNS} FROM metrics
             WHERE firewall_name = ?1 AND timestamp >= ?2 AND timestamp < ?3
             ORDER BY timestamp DESC LIMIT ?4"
        ))?;

        let limit_param: i64 = limit.map(|l| l as i64).unwrap_or(-1);
        let mut records = stmt
            .query_map(
                params![firewall, fmt_db_time(start), fmt_db_time(end), limit_param],
                row_to_record,
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        records.reverse();
        Ok(records)
    }

    /// Records for many firewalls in one underlying pass.
    ///
    /// A single statement covers every requested name; rows are grouped in
    /// memory and the limit applies per firewall, newest rows first.
    pub fn batch_query(
        &self,
        firewalls: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<HashMap<String, Vec<MetricRecord>>, StoreError> {
        let mut out: HashMap<String, Vec<MetricRecord>> =
            firewalls.iter().map(|f| (f.clone(), Vec::new())).collect();
        if firewalls.is_empty() {
            return Ok(out);
        }

        let conn = self.pool.checkout()?;
        let placeholders = (1..=firewalls.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(",");
        let start_idx = firewalls.len() + 1;
        let end_idx = firewalls.len() + 2;
        let mut stmt = conn.prepare(&format!(
            "SELECT {METRIC_COLUMNS} FROM metrics
             WHERE firewall_name IN ({placeholders})
               AND timestamp >= ?{start_idx} AND timestamp < ?{end_idx}
             ORDER BY firewall_name ASC, timestamp DESC"
        ))?;

        let mut bind: Vec<Box<dyn rusqlite::types::ToSql>> = firewalls
            .iter()
            .map(|f| Box::new(f.clone()) as Box<dyn rusqlite::types::ToSql>)
            .collect();
        bind.push(Box::new(fmt_db_time(start)));
        bind.push(Box::new(fmt_db_time(end)));
        let bind_refs: Vec<&dyn rusqlite::types::ToSql> =
            bind.iter().map(|b| b.as_ref()).collect();

        let rows = stmt
            .query_map(bind_refs.as_slice(), row_to_record)?
            .collect::<SqlResult<Vec<_>>>()?;

        for record in rows {
            let entry = out.entry(record.firewall_name.clone()).or_default();
            if limit.map_or(true, |l| entry.len() < l) {
                entry.push(record);
            }
        }
        for records in out.values_mut() {
            records.reverse();
        }

        Ok(out)
    }

    /// Delete records older than the cutoff and report how many went.
    pub fn prune(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.pool.checkout()?;
        let deleted = conn.execute(
            "DELETE FROM metrics WHERE timestamp < ?1",
            params![fmt_db_time(older_than)],
        )?;
        Ok(deleted)
    }

    // --- Health surface ---

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let conn = self.pool.checkout()?;
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
        let total_metrics: i64 = conn.query_row("SELECT COUNT(*) FROM metrics", [], |r| r.get(0))?;
        Ok(StoreStats {
            db_size_bytes: page_count * page_size,
            total_metrics,
        })
    }
}

fn row_to_record(row: &Row) -> SqlResult<MetricRecord> {
    let time_str: String = row.get(1)?;
    Ok(MetricRecord {
        firewall_name: row.get(0)?,
        timestamp: parse_db_time(&time_str).unwrap_or_default(),
        cpu_user: row.get(2)?,
        cpu_system: row.get(3)?,
        cpu_idle: row.get(4)?,
        mgmt_cpu: row.get(5)?,
        data_plane_cpu_mean: row.get(6)?,
        data_plane_cpu_max: row.get(7)?,
        data_plane_cpu_p95: row.get(8)?,
        throughput_mbps_mean: row.get(9)?,
        throughput_mbps_max: row.get(10)?,
        throughput_mbps_min: row.get(11)?,
        throughput_mbps_p95: row.get(12)?,
        pps_mean: row.get(13)?,
        pps_max: row.get(14)?,
        pps_min: row.get(15)?,
        pps_p95: row.get(16)?,
        pbuf_util_percent: row.get(17)?,
        session_sample_count: row.get::<_, Option<i64>>(18)?.unwrap_or(0),
        session_success_rate: row.get::<_, Option<f64>>(19)?.unwrap_or(0.0),
        session_sampling_period: row.get::<_, Option<f64>>(20)?.unwrap_or(0.0),
    })
}

fn fmt_db_time(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S%.9f").to_string()
}

/// Parse a datetime string from the database, trying the formats that have
/// shown up across schema generations.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.9fZ",
        "%Y-%m-%dT%H:%M:%SZ",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}
