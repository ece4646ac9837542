//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;
use super::value::{DataType, Severity};

mod embedded {
    refinery::embed_migrations!("migrations");
}

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
    #[error("database connection lock poisoned")]
    Poisoned,
}

/// The persistence operations the polling core depends on.
///
/// Implemented by [`Store`]; the writer only talks to this trait so failure
/// handling can be exercised without a broken database.
pub trait TagPersistence: Send + Sync {
    fn get_sites(&self) -> Result<Vec<Site>, DbError>;

    fn get_active_tags(&self, site_id: Option<i64>) -> Result<Vec<PlcTag>, DbError>;

    fn upsert_tag_value(&self, tag_id: i64, value: &str, at: DateTime<Utc>) -> Result<(), DbError>;

    /// Advance `last_read_time` without touching `last_value`.
    fn touch_tag(&self, tag_id: i64, at: DateTime<Utc>) -> Result<(), DbError>;

    fn insert_history(
        &self,
        tag_id: i64,
        old_value: Option<&str>,
        new_value: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DbError>;

    /// Write a history row and the new last value atomically.
    ///
    /// Returns `false` when the tag already holds `new_value` as of `at`,
    /// in which case nothing is written.
    fn record_change(
        &self,
        tag_id: i64,
        old_value: Option<&str>,
        new_value: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, DbError>;

    fn find_open_alert(
        &self,
        tag_id: Option<i64>,
        condition_key: &str,
    ) -> Result<Option<Alert>, DbError>;

    fn insert_alert(&self, alert: &NewAlert) -> Result<i64, DbError>;

    fn resolve_alert(&self, alert_id: i64, at: DateTime<Utc>) -> Result<(), DbError>;

    /// Resolve every open alert raised for `tag_id`, whatever its condition
    /// key. Returns how many were resolved.
    fn resolve_tag_alerts(&self, tag_id: i64, at: DateTime<Utc>) -> Result<usize, DbError>;

    /// Tags with at least one open alert.
    fn open_alert_tag_ids(&self) -> Result<HashSet<i64>, DbError>;

    fn update_site_check(&self, check: &SiteCheck) -> Result<(), DbError>;
}

/// Counts reported by an IPC sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SyncReport {
    pub created: usize,
    pub removed: usize,
}

const SITE_COLUMNS: &str = "id, name, address, ams_net_id, ams_port, ipc_id, status, last_check, last_online, uptime_percent";
const IPC_COLUMNS: &str = "id, name, address, ams_net_id, ams_port, site_name";
const TAG_COLUMNS: &str = "id, site_id, tag_name, plc_address, description, data_type, is_active, poll_interval_ms, alarm_on_true, alarm_on_false, severity_level, last_value, last_read_time";
const ALERT_COLUMNS: &str = "id, site_id, tag_id, condition_key, alert_type, severity, title, message, is_read, is_resolved, metadata, created_at, resolved_at";

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let mut conn = self.conn()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        embedded::migrations::runner()
            .run(&mut *conn)
            .map_err(|e| DbError::Migration(e.to_string()))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Sites ---

    /// Add a new site and return its ID.
    pub fn add_site(&self, site: &mut Site) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sites (name, address, ams_net_id, ams_port, ipc_id, status) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                site.name,
                site.address,
                site.ams_net_id,
                i64::from(site.ams_port),
                site.ipc_id,
                site.status.as_str(),
            ],
        )?;
        site.id = conn.last_insert_rowid();
        Ok(site.id)
    }

    /// Get all sites.
    pub fn get_sites(&self) -> Result<Vec<Site>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM sites ORDER BY name", SITE_COLUMNS))?;
        let sites = stmt
            .query_map([], site_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(sites)
    }

    /// Get a site by ID.
    pub fn get_site(&self, id: i64) -> Result<Site, DbError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM sites WHERE id = ?1", SITE_COLUMNS),
            params![id],
            site_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Delete a site. Its tags and their history go with it.
    pub fn delete_site(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM sites WHERE id = ?1", params![id])?;
        if n == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Reconcile sites against the IPC inventory.
    ///
    /// Every IPC whose site name is unknown gets a site; sites created from
    /// an IPC that has since been removed are deleted.
    pub fn sync_sites_from_ipcs(&self) -> Result<SyncReport, DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let mut report = SyncReport::default();

        let ipcs = {
            let mut stmt = tx.prepare(&format!("SELECT {} FROM ipcs", IPC_COLUMNS))?;
            let rows = stmt.query_map([], ipc_from_row)?.collect::<SqlResult<Vec<_>>>()?;
            rows
        };

        for ipc in &ipcs {
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT id FROM sites WHERE name = ?1",
                    params![ipc.site_name],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_some() {
                continue;
            }
            tx.execute(
                "INSERT INTO sites (name, address, ams_net_id, ams_port, ipc_id, status) VALUES (?1, ?2, ?3, ?4, ?5, 'unknown')",
                params![
                    ipc.site_name,
                    ipc.address,
                    ipc.ams_net_id,
                    i64::from(ipc.ams_port),
                    ipc.id,
                ],
            )?;
            report.created += 1;
        }

        report.removed = tx.execute(
            "DELETE FROM sites WHERE ipc_id IS NOT NULL AND ipc_id NOT IN (SELECT id FROM ipcs)",
            [],
        )?;

        tx.commit()?;
        Ok(report)
    }

    // --- IPC inventory ---

    pub fn add_ipc(&self, ipc: &mut Ipc) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO ipcs (name, address, ams_net_id, ams_port, site_name) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                ipc.name,
                ipc.address,
                ipc.ams_net_id,
                i64::from(ipc.ams_port),
                ipc.site_name,
            ],
        )?;
        ipc.id = conn.last_insert_rowid();
        Ok(ipc.id)
    }

    pub fn get_ipcs(&self) -> Result<Vec<Ipc>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM ipcs ORDER BY name", IPC_COLUMNS))?;
        let ipcs = stmt
            .query_map([], ipc_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(ipcs)
    }

    pub fn delete_ipc(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        if conn.execute("DELETE FROM ipcs WHERE id = ?1", params![id])? == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    // --- Tags ---

    /// Insert a batch of tags for one site. Either all rows land or none.
    pub fn add_tags(&self, site_id: i64, tags: &[NewTag]) -> Result<Vec<i64>, DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        let site_exists: Option<i64> = tx
            .query_row("SELECT id FROM sites WHERE id = ?1", params![site_id], |row| row.get(0))
            .optional()?;
        if site_exists.is_none() {
            return Err(DbError::NotFound);
        }

        let mut ids = Vec::with_capacity(tags.len());
        {
            let mut stmt = tx.prepare(
                "INSERT INTO plc_tags (site_id, tag_name, plc_address, description, data_type, is_active, poll_interval_ms, alarm_on_true, alarm_on_false, severity_level)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for t in tags {
                stmt.execute(params![
                    site_id,
                    t.tag_name,
                    t.plc_address,
                    t.description,
                    t.data_type.as_str(),
                    t.is_active,
                    clamp_i64(t.poll_interval_ms),
                    t.alarm_on_true,
                    t.alarm_on_false,
                    t.severity_level.as_str(),
                ])?;
                ids.push(tx.last_insert_rowid());
            }
        }

        tx.commit()?;
        Ok(ids)
    }

    /// Update a tag's definition. Live values are left alone.
    pub fn update_tag(&self, tag: &PlcTag) -> Result<(), DbError> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE plc_tags SET tag_name=?1, plc_address=?2, description=?3, data_type=?4, is_active=?5,
             poll_interval_ms=?6, alarm_on_true=?7, alarm_on_false=?8, severity_level=?9 WHERE id=?10",
            params![
                tag.tag_name,
                tag.plc_address,
                tag.description,
                tag.data_type.as_str(),
                tag.is_active,
                clamp_i64(tag.poll_interval_ms),
                tag.alarm_on_true,
                tag.alarm_on_false,
                tag.severity_level.as_str(),
                tag.id,
            ],
        )?;
        if n == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    pub fn get_tag(&self, id: i64) -> Result<PlcTag, DbError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM plc_tags WHERE id = ?1", TAG_COLUMNS),
            params![id],
            tag_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// All tags, optionally for one site, active or not.
    pub fn get_tags(&self, site_id: Option<i64>) -> Result<Vec<PlcTag>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM plc_tags WHERE (?1 IS NULL OR site_id = ?1) ORDER BY site_id, tag_name",
            TAG_COLUMNS
        ))?;
        let tags = stmt
            .query_map(params![site_id], tag_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(tags)
    }

    pub fn delete_tag(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        if conn.execute("DELETE FROM plc_tags WHERE id = ?1", params![id])? == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// History rows for a tag, newest first.
    pub fn get_history(&self, tag_id: i64, limit: i64) -> Result<Vec<HistoryRow>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, tag_id, old_value, new_value, recorded_at FROM plc_tag_history
             WHERE tag_id = ?1 ORDER BY recorded_at DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![tag_id, limit], |row| {
                Ok(HistoryRow {
                    id: row.get(0)?,
                    tag_id: row.get(1)?,
                    old_value: row.get(2)?,
                    new_value: row.get(3)?,
                    recorded_at: time_column(row, 4)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(rows)
    }

    // --- Alerts ---

    /// Alerts ordered newest first.
    pub fn get_alerts(&self, unresolved_only: bool, limit: i64) -> Result<Vec<Alert>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM alerts WHERE (?1 = 0 OR is_resolved = 0) ORDER BY created_at DESC, id DESC LIMIT ?2",
            ALERT_COLUMNS
        ))?;
        let alerts = stmt
            .query_map(params![unresolved_only, limit], alert_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(alerts)
    }

    pub fn get_alert(&self, id: i64) -> Result<Alert, DbError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM alerts WHERE id = ?1", ALERT_COLUMNS),
            params![id],
            alert_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    pub fn mark_alert_read(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        if conn.execute("UPDATE alerts SET is_read = 1 WHERE id = ?1", params![id])? == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }
}

impl TagPersistence for Store {
    fn get_sites(&self) -> Result<Vec<Site>, DbError> {
        Store::get_sites(self)
    }

    fn get_active_tags(&self, site_id: Option<i64>) -> Result<Vec<PlcTag>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM plc_tags WHERE is_active = 1 AND (?1 IS NULL OR site_id = ?1) ORDER BY site_id, id",
            TAG_COLUMNS
        ))?;
        let tags = stmt
            .query_map(params![site_id], tag_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(tags)
    }

    fn upsert_tag_value(&self, tag_id: i64, value: &str, at: DateTime<Utc>) -> Result<(), DbError> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE plc_tags SET last_value = ?1, last_read_time = ?2 WHERE id = ?3",
            params![value, format_db_time(at), tag_id],
        )?;
        if n == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    fn touch_tag(&self, tag_id: i64, at: DateTime<Utc>) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE plc_tags SET last_read_time = ?1 WHERE id = ?2",
            params![format_db_time(at), tag_id],
        )?;
        Ok(())
    }

    fn insert_history(
        &self,
        tag_id: i64,
        old_value: Option<&str>,
        new_value: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO plc_tag_history (tag_id, old_value, new_value, recorded_at) VALUES (?1, ?2, ?3, ?4)",
            params![tag_id, old_value, new_value, format_db_time(at)],
        )?;
        Ok(())
    }

    fn record_change(
        &self,
        tag_id: i64,
        old_value: Option<&str>,
        new_value: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let at_str = format_db_time(at);

        let current: Option<(Option<String>, Option<String>)> = tx
            .query_row(
                "SELECT last_value, last_read_time FROM plc_tags WHERE id = ?1",
                params![tag_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (last_value, last_read_time) = current.ok_or(DbError::NotFound)?;

        if last_value.as_deref() == Some(new_value) && last_read_time.as_deref() == Some(at_str.as_str()) {
            return Ok(false);
        }

        tx.execute(
            "INSERT INTO plc_tag_history (tag_id, old_value, new_value, recorded_at) VALUES (?1, ?2, ?3, ?4)",
            params![tag_id, old_value, new_value, at_str],
        )?;
        tx.execute(
            "UPDATE plc_tags SET last_value = ?1, last_read_time = ?2 WHERE id = ?3",
            params![new_value, at_str, tag_id],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn find_open_alert(
        &self,
        tag_id: Option<i64>,
        condition_key: &str,
    ) -> Result<Option<Alert>, DbError> {
        let conn = self.conn()?;
        let alert = conn
            .query_row(
                &format!(
                    "SELECT {} FROM alerts WHERE tag_id IS ?1 AND condition_key = ?2 AND is_resolved = 0
                     ORDER BY id DESC LIMIT 1",
                    ALERT_COLUMNS
                ),
                params![tag_id, condition_key],
                alert_from_row,
            )
            .optional()?;
        Ok(alert)
    }

    fn insert_alert(&self, alert: &NewAlert) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO alerts (site_id, tag_id, condition_key, alert_type, severity, title, message, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                alert.site_id,
                alert.tag_id,
                alert.condition_key,
                alert.alert_type.as_str(),
                alert.severity.as_str(),
                alert.title,
                alert.message,
                alert.metadata.to_string(),
                format_db_time(alert.created_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn resolve_alert(&self, alert_id: i64, at: DateTime<Utc>) -> Result<(), DbError> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE alerts SET is_resolved = 1, resolved_at = ?1 WHERE id = ?2 AND is_resolved = 0",
            params![format_db_time(at), alert_id],
        )?;
        if n == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    fn resolve_tag_alerts(&self, tag_id: i64, at: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE alerts SET is_resolved = 1, resolved_at = ?1 WHERE tag_id = ?2 AND is_resolved = 0",
            params![format_db_time(at), tag_id],
        )?;
        Ok(n)
    }

    fn open_alert_tag_ids(&self) -> Result<HashSet<i64>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT tag_id FROM alerts WHERE tag_id IS NOT NULL AND is_resolved = 0",
        )?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<SqlResult<HashSet<i64>>>()?;
        Ok(ids)
    }

    fn update_site_check(&self, check: &SiteCheck) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE sites SET status = ?1, last_check = ?2, last_online = COALESCE(?3, last_online), uptime_percent = ?4 WHERE id = ?5",
            params![
                check.status.as_str(),
                format_db_time(check.checked_at),
                check.last_online.map(format_db_time),
                check.uptime_percent,
                check.site_id,
            ],
        )?;
        Ok(())
    }
}

fn clamp_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
}

fn time_column(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_db_time(&s).ok_or_else(|| conversion_error(idx, format!("bad timestamp: {}", s)))
}

fn opt_time_column(row: &Row<'_>, idx: usize) -> SqlResult<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    Ok(s.and_then(|s| parse_db_time(&s)))
}

fn port_column(row: &Row<'_>, idx: usize) -> SqlResult<u16> {
    let port: i64 = row.get(idx)?;
    u16::try_from(port).map_err(|_| conversion_error(idx, format!("bad port: {}", port)))
}

fn site_from_row(row: &Row<'_>) -> SqlResult<Site> {
    let status: String = row.get(6)?;
    Ok(Site {
        id: row.get(0)?,
        name: row.get(1)?,
        address: row.get(2)?,
        ams_net_id: row.get(3)?,
        ams_port: port_column(row, 4)?,
        ipc_id: row.get(5)?,
        status: status.parse().map_err(|e| conversion_error(6, e))?,
        last_check: opt_time_column(row, 7)?,
        last_online: opt_time_column(row, 8)?,
        uptime_percent: row.get(9)?,
    })
}

fn ipc_from_row(row: &Row<'_>) -> SqlResult<Ipc> {
    Ok(Ipc {
        id: row.get(0)?,
        name: row.get(1)?,
        address: row.get(2)?,
        ams_net_id: row.get(3)?,
        ams_port: port_column(row, 4)?,
        site_name: row.get(5)?,
    })
}

fn tag_from_row(row: &Row<'_>) -> SqlResult<PlcTag> {
    let data_type: String = row.get(5)?;
    let interval: i64 = row.get(7)?;
    let severity: String = row.get(10)?;
    Ok(PlcTag {
        id: row.get(0)?,
        site_id: row.get(1)?,
        tag_name: row.get(2)?,
        plc_address: row.get(3)?,
        description: row.get(4)?,
        data_type: data_type.parse::<DataType>().map_err(|e| conversion_error(5, e))?,
        is_active: row.get(6)?,
        poll_interval_ms: u64::try_from(interval).unwrap_or(0),
        alarm_on_true: row.get(8)?,
        alarm_on_false: row.get(9)?,
        severity_level: severity.parse::<Severity>().map_err(|e| conversion_error(10, e))?,
        last_value: row.get(11)?,
        last_read_time: opt_time_column(row, 12)?,
    })
}

fn alert_from_row(row: &Row<'_>) -> SqlResult<Alert> {
    let alert_type: String = row.get(4)?;
    let severity: String = row.get(5)?;
    let metadata: String = row.get(10)?;
    Ok(Alert {
        id: row.get(0)?,
        site_id: row.get(1)?,
        tag_id: row.get(2)?,
        condition_key: row.get(3)?,
        alert_type: alert_type.parse().map_err(|e| conversion_error(4, e))?,
        severity: severity.parse::<Severity>().map_err(|e| conversion_error(5, e))?,
        title: row.get(6)?,
        message: row.get(7)?,
        is_read: row.get(8)?,
        is_resolved: row.get(9)?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        created_at: time_column(row, 11)?,
        resolved_at: opt_time_column(row, 12)?,
    })
}

/// Format a timestamp the way every time column stores it.
pub fn format_db_time(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S%.9f").to_string()
}

/// Parse a datetime string from the database.
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
