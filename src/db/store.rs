//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;

mod embedded {
    refinery::embed_migrations!("migrations");
}

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
    #[error("{0} already exists")]
    Conflict(&'static str),
    #[error("store lock poisoned")]
    Poisoned,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

const ENDPOINT_COLUMNS: &str =
    "id, tenant_id, name, url, interval_secs, timeout_secs, expected_status, is_active, created_at";
const CHECK_COLUMNS: &str =
    "id, endpoint_id, tenant_id, status, latency_ms, status_code, error_message, checked_at";
const OUTAGE_COLUMNS: &str =
    "id, endpoint_id, tenant_id, started_at, ended_at, duration_secs, failure_count, status, root_cause";
const SUMMARY_COLUMNS: &str = "endpoint_id, tenant_id, period_start, granularity, total_checks, \
     successful_checks, uptime_percentage, avg_latency_ms, min_latency_ms, max_latency_ms, latency_samples";

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
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        embedded::migrations::runner()
            .run(&mut *conn)
            .map_err(|e| DbError::Migration(e.to_string()))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    /// Cheap round trip used by the service health endpoint.
    pub fn ping(&self) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))?;
        Ok(())
    }

    // --- Endpoints ---

    /// Add a new endpoint and return its ID.
    pub fn add_endpoint(&self, endpoint: &mut Endpoint) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO endpoints (tenant_id, name, url, interval_secs, timeout_secs, expected_status, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                endpoint.tenant_id,
                endpoint.name,
                endpoint.url,
                endpoint.interval_secs,
                endpoint.timeout_secs,
                endpoint.expected_status,
                endpoint.is_active,
                fmt_db_time(endpoint.created_at),
            ],
        )
        .map_err(|e| conflict_or(e, "endpoint name"))?;
        let id = conn.last_insert_rowid();
        endpoint.id = id;
        Ok(id)
    }

    /// Update an existing endpoint owned by `endpoint.tenant_id`.
    pub fn update_endpoint(&self, endpoint: &Endpoint) -> Result<(), DbError> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE endpoints SET name=?1, url=?2, interval_secs=?3, timeout_secs=?4, expected_status=?5, is_active=?6
                 WHERE id=?7 AND tenant_id=?8",
                params![
                    endpoint.name,
                    endpoint.url,
                    endpoint.interval_secs,
                    endpoint.timeout_secs,
                    endpoint.expected_status,
                    endpoint.is_active,
                    endpoint.id,
                    endpoint.tenant_id,
                ],
            )
            .map_err(|e| conflict_or(e, "endpoint name"))?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Get an endpoint by ID within a tenant.
    pub fn get_endpoint(&self, tenant_id: &str, id: i64) -> Result<Endpoint, DbError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {ENDPOINT_COLUMNS} FROM endpoints WHERE id = ?1 AND tenant_id = ?2"),
            params![id, tenant_id],
            endpoint_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// All endpoints of a tenant, ordered by name.
    pub fn list_endpoints(&self, tenant_id: &str) -> Result<Vec<Endpoint>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENDPOINT_COLUMNS} FROM endpoints WHERE tenant_id = ?1 ORDER BY name"
        ))?;
        let endpoints = stmt
            .query_map(params![tenant_id], endpoint_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(endpoints)
    }

    /// Endpoints of every tenant. Used by background workers only.
    pub fn all_endpoints(&self, active_only: bool) -> Result<Vec<Endpoint>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENDPOINT_COLUMNS} FROM endpoints WHERE is_active = 1 OR ?1 = 0 ORDER BY id"
        ))?;
        let endpoints = stmt
            .query_map(params![active_only], endpoint_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(endpoints)
    }

    /// Number of health checks and outages referencing an endpoint.
    pub fn endpoint_history_count(&self, tenant_id: &str, id: i64) -> Result<i64, DbError> {
        let conn = self.conn()?;
        let count = conn.query_row(
            "SELECT (SELECT COUNT(*) FROM health_checks WHERE endpoint_id = ?1 AND tenant_id = ?2)
                  + (SELECT COUNT(*) FROM outages WHERE endpoint_id = ?1 AND tenant_id = ?2)",
            params![id, tenant_id],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    /// Delete an endpoint together with its history, outages, summaries
    /// and status page references.
    pub fn delete_endpoint(&self, tenant_id: &str, id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let deleted = tx.execute(
            "DELETE FROM endpoints WHERE id = ?1 AND tenant_id = ?2",
            params![id, tenant_id],
        )?;
        if deleted == 0 {
            return Err(DbError::NotFound);
        }
        tx.execute(
            "DELETE FROM health_checks WHERE endpoint_id = ?1 AND tenant_id = ?2",
            params![id, tenant_id],
        )?;
        tx.execute(
            "DELETE FROM outages WHERE endpoint_id = ?1 AND tenant_id = ?2",
            params![id, tenant_id],
        )?;
        tx.execute(
            "DELETE FROM uptime_summaries WHERE endpoint_id = ?1 AND tenant_id = ?2",
            params![id, tenant_id],
        )?;
        tx.execute(
            "DELETE FROM status_page_endpoints WHERE endpoint_id = ?1
               AND page_id IN (SELECT id FROM status_pages WHERE tenant_id = ?2)",
            params![id, tenant_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    // --- Health checks ---

    /// Append one health check result and return its ID.
    ///
    /// Fails with `NotFound` once the endpoint has been deleted.
    pub fn add_health_check(&self, check: &mut HealthCheckResult) -> Result<i64, DbError> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO health_checks (endpoint_id, tenant_id, status, latency_ms, status_code, error_message, checked_at)
             SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7
             WHERE EXISTS (SELECT 1 FROM endpoints WHERE id = ?1 AND tenant_id = ?2)",
            params![
                check.endpoint_id,
                check.tenant_id,
                check.status,
                check.latency_ms,
                check.status_code,
                check.error_message,
                fmt_db_time(check.checked_at),
            ],
        )?;
        if inserted == 0 {
            return Err(DbError::NotFound);
        }
        let id = conn.last_insert_rowid();
        check.id = id;
        Ok(id)
    }

    /// The newest `limit` checks of an endpoint, oldest first.
    pub fn recent_health_checks(
        &self,
        tenant_id: &str,
        endpoint_id: i64,
        limit: u32,
    ) -> Result<Vec<HealthCheckResult>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHECK_COLUMNS} FROM health_checks
             WHERE endpoint_id = ?1 AND tenant_id = ?2
             ORDER BY checked_at DESC, id DESC LIMIT ?3"
        ))?;
        let mut checks = stmt
            .query_map(params![endpoint_id, tenant_id, limit], check_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        checks.reverse();
        Ok(checks)
    }

    /// Checks of an endpoint within `[start, end)`, oldest first.
    pub fn health_checks_between(
        &self,
        tenant_id: &str,
        endpoint_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HealthCheckResult>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHECK_COLUMNS} FROM health_checks
             WHERE endpoint_id = ?1 AND tenant_id = ?2 AND checked_at >= ?3 AND checked_at < ?4
             ORDER BY checked_at ASC, id ASC"
        ))?;
        let checks = stmt
            .query_map(
                params![endpoint_id, tenant_id, fmt_db_time(start), fmt_db_time(end)],
                check_from_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(checks)
    }

    /// Get earliest health check time for an endpoint.
    pub fn earliest_health_check_time(
        &self,
        tenant_id: &str,
        endpoint_id: i64,
    ) -> Result<Option<DateTime<Utc>>, DbError> {
        let conn = self.conn()?;
        let result: Option<String> = conn.query_row(
            "SELECT MIN(checked_at) FROM health_checks WHERE endpoint_id = ?1 AND tenant_id = ?2",
            params![endpoint_id, tenant_id],
            |row| row.get(0),
        )?;
        Ok(result.and_then(|s| parse_db_time(&s)))
    }

    /// Delete health checks older than the cutoff across all tenants.
    pub fn delete_health_checks_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM health_checks WHERE checked_at < ?1",
            params![fmt_db_time(cutoff)],
        )?;
        Ok(deleted)
    }

    // --- Outages ---

    /// Open an outage unless one is already ongoing for the endpoint.
    ///
    /// Returns the ongoing outage and whether this call created it.
    pub fn open_outage(
        &self,
        tenant_id: &str,
        endpoint_id: i64,
        started_at: DateTime<Utc>,
        failure_count: i64,
    ) -> Result<(Outage, bool), DbError> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO outages (endpoint_id, tenant_id, started_at, failure_count, status)
             SELECT ?1, ?2, ?3, ?4, ?5
             WHERE EXISTS (SELECT 1 FROM endpoints WHERE id = ?1 AND tenant_id = ?2)",
            params![
                endpoint_id,
                tenant_id,
                fmt_db_time(started_at),
                failure_count,
                OutageStatus::Ongoing,
            ],
        )?;
        let outage = query_ongoing(&conn, tenant_id, endpoint_id)?.ok_or(DbError::NotFound)?;
        Ok((outage, inserted == 1))
    }

    /// The ongoing outage of an endpoint, if any.
    pub fn ongoing_outage(&self, tenant_id: &str, endpoint_id: i64) -> Result<Option<Outage>, DbError> {
        let conn = self.conn()?;
        Ok(query_ongoing(&conn, tenant_id, endpoint_id)?)
    }

    /// Record one more failing check against an ongoing outage.
    pub fn increment_outage_failures(&self, tenant_id: &str, outage_id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE outages SET failure_count = failure_count + 1
             WHERE id = ?1 AND tenant_id = ?2 AND status = ?3",
            params![outage_id, tenant_id, OutageStatus::Ongoing],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Close an ongoing outage at `ended_at`.
    pub fn resolve_outage(
        &self,
        tenant_id: &str,
        outage_id: i64,
        ended_at: DateTime<Utc>,
    ) -> Result<Outage, DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let outage = tx
            .query_row(
                &format!("SELECT {OUTAGE_COLUMNS} FROM outages WHERE id = ?1 AND tenant_id = ?2 AND status = ?3"),
                params![outage_id, tenant_id, OutageStatus::Ongoing],
                outage_from_row,
            )
            .optional()?
            .ok_or(DbError::NotFound)?;
        let duration = (ended_at - outage.started_at).num_seconds().max(0);
        tx.execute(
            "UPDATE outages SET status = ?1, ended_at = ?2, duration_secs = ?3 WHERE id = ?4 AND tenant_id = ?5",
            params![OutageStatus::Resolved, fmt_db_time(ended_at), duration, outage_id, tenant_id],
        )?;
        tx.commit()?;
        Ok(Outage {
            ended_at: Some(ended_at),
            duration_secs: Some(duration),
            status: OutageStatus::Resolved,
            ..outage
        })
    }

    /// Outage history of a tenant, newest first, optionally for one endpoint.
    pub fn list_outages(
        &self,
        tenant_id: &str,
        endpoint_id: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Outage>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {OUTAGE_COLUMNS} FROM outages
             WHERE tenant_id = ?1 AND (?2 IS NULL OR endpoint_id = ?2)
             ORDER BY started_at DESC, id DESC LIMIT ?3"
        ))?;
        let outages = stmt
            .query_map(params![tenant_id, endpoint_id, limit], outage_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(outages)
    }

    /// Set the root-cause annotation of an outage.
    pub fn annotate_outage(&self, tenant_id: &str, outage_id: i64, root_cause: &str) -> Result<Outage, DbError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE outages SET root_cause = ?1 WHERE id = ?2 AND tenant_id = ?3",
            params![root_cause, outage_id, tenant_id],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        let outage = conn.query_row(
            &format!("SELECT {OUTAGE_COLUMNS} FROM outages WHERE id = ?1 AND tenant_id = ?2"),
            params![outage_id, tenant_id],
            outage_from_row,
        )?;
        Ok(outage)
    }

    // --- Uptime summaries ---

    /// Upsert summaries keyed by (endpoint, period_start, granularity).
    pub fn upsert_summaries(&self, summaries: &[UptimeSummary]) -> Result<(), DbError> {
        if summaries.is_empty() {
            return Ok(());
        }

        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO uptime_summaries ({SUMMARY_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(endpoint_id, period_start, granularity) DO UPDATE SET
                 total_checks=excluded.total_checks, successful_checks=excluded.successful_checks,
                 uptime_percentage=excluded.uptime_percentage, avg_latency_ms=excluded.avg_latency_ms,
                 min_latency_ms=excluded.min_latency_ms, max_latency_ms=excluded.max_latency_ms,
                 latency_samples=excluded.latency_samples"
            ))?;

            for s in summaries {
                stmt.execute(params![
                    s.endpoint_id,
                    s.tenant_id,
                    fmt_db_time(s.period_start),
                    s.granularity,
                    s.total_checks,
                    s.successful_checks,
                    s.uptime_percentage,
                    s.avg_latency_ms,
                    s.min_latency_ms,
                    s.max_latency_ms,
                    s.latency_samples,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Summaries with `period_start` in `[start, end)`, oldest first.
    pub fn get_summaries(
        &self,
        tenant_id: &str,
        endpoint_id: i64,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<UptimeSummary>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SUMMARY_COLUMNS} FROM uptime_summaries
             WHERE endpoint_id = ?1 AND tenant_id = ?2 AND granularity = ?3
               AND period_start >= ?4 AND period_start < ?5
             ORDER BY period_start ASC"
        ))?;
        let summaries = stmt
            .query_map(
                params![endpoint_id, tenant_id, granularity, fmt_db_time(start), fmt_db_time(end)],
                summary_from_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(summaries)
    }

    /// Start of the newest summary for an endpoint and granularity.
    pub fn last_summary_start(
        &self,
        tenant_id: &str,
        endpoint_id: i64,
        granularity: Granularity,
    ) -> Result<Option<DateTime<Utc>>, DbError> {
        let conn = self.conn()?;
        let result: Option<String> = conn.query_row(
            "SELECT MAX(period_start) FROM uptime_summaries
             WHERE endpoint_id = ?1 AND tenant_id = ?2 AND granularity = ?3",
            params![endpoint_id, tenant_id, granularity],
            |row| row.get(0),
        )?;
        Ok(result.and_then(|s| parse_db_time(&s)))
    }

    /// Start of the oldest summary for an endpoint and granularity.
    pub fn first_summary_start(
        &self,
        tenant_id: &str,
        endpoint_id: i64,
        granularity: Granularity,
    ) -> Result<Option<DateTime<Utc>>, DbError> {
        let conn = self.conn()?;
        let result: Option<String> = conn.query_row(
            "SELECT MIN(period_start) FROM uptime_summaries
             WHERE endpoint_id = ?1 AND tenant_id = ?2 AND granularity = ?3",
            params![endpoint_id, tenant_id, granularity],
            |row| row.get(0),
        )?;
        Ok(result.and_then(|s| parse_db_time(&s)))
    }

    // --- Status pages ---

    /// Add a status page with its ordered endpoint list.
    pub fn add_status_page(&self, page: &mut StatusPage) -> Result<i64, DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO status_pages (tenant_id, slug, title, description, is_public, password_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                page.tenant_id,
                page.slug,
                page.title,
                page.description,
                page.is_public,
                page.password_hash,
            ],
        )
        .map_err(|e| conflict_or(e, "status page slug"))?;
        let id = tx.last_insert_rowid();
        {
            let mut stmt = tx.prepare(
                "INSERT INTO status_page_endpoints (page_id, endpoint_id, position) VALUES (?1, ?2, ?3)",
            )?;
            for (position, endpoint_id) in page.endpoint_ids.iter().enumerate() {
                stmt.execute(params![id, endpoint_id, position as i64])?;
            }
        }
        tx.commit()?;
        page.id = id;
        Ok(id)
    }

    /// Look up a status page by its globally unique slug.
    pub fn get_status_page(&self, slug: &str) -> Result<Option<StatusPage>, DbError> {
        let conn = self.conn()?;
        let page = conn
            .query_row(
                "SELECT id, tenant_id, slug, title, description, is_public, password_hash
                 FROM status_pages WHERE slug = ?1",
                params![slug],
                page_from_row,
            )
            .optional()?;
        match page {
            Some(mut page) => {
                page.endpoint_ids = page_endpoint_ids(&conn, page.id)?;
                Ok(Some(page))
            }
            None => Ok(None),
        }
    }

    /// All status pages of a tenant.
    pub fn list_status_pages(&self, tenant_id: &str) -> Result<Vec<StatusPage>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, slug, title, description, is_public, password_hash
             FROM status_pages WHERE tenant_id = ?1 ORDER BY slug",
        )?;
        let mut pages = stmt
            .query_map(params![tenant_id], page_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        for page in &mut pages {
            page.endpoint_ids = page_endpoint_ids(&conn, page.id)?;
        }
        Ok(pages)
    }

    /// Delete a tenant's status page.
    pub fn delete_status_page(&self, tenant_id: &str, slug: &str) -> Result<(), DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let id: Option<i64> = tx
            .query_row(
                "SELECT id FROM status_pages WHERE slug = ?1 AND tenant_id = ?2",
                params![slug, tenant_id],
                |r| r.get(0),
            )
            .optional()?;
        let id = id.ok_or(DbError::NotFound)?;
        tx.execute("DELETE FROM status_page_endpoints WHERE page_id = ?1", params![id])?;
        tx.execute("DELETE FROM status_pages WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }
}

fn query_ongoing(conn: &Connection, tenant_id: &str, endpoint_id: i64) -> SqlResult<Option<Outage>> {
    conn.query_row(
        &format!(
            "SELECT {OUTAGE_COLUMNS} FROM outages WHERE endpoint_id = ?1 AND tenant_id = ?2 AND status = ?3"
        ),
        params![endpoint_id, tenant_id, OutageStatus::Ongoing],
        outage_from_row,
    )
    .optional()
}

fn page_endpoint_ids(conn: &Connection, page_id: i64) -> SqlResult<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT endpoint_id FROM status_page_endpoints WHERE page_id = ?1 ORDER BY position",
    )?;
    let ids = stmt
        .query_map(params![page_id], |r| r.get(0))?
        .collect::<SqlResult<Vec<i64>>>()?;
    Ok(ids)
}

fn conflict_or(err: rusqlite::Error, what: &'static str) -> DbError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
            DbError::Conflict(what)
        }
        _ => DbError::Sqlite(err),
    }
}

fn time_column(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_db_time(&s).ok_or_else(|| rusqlite::Error::InvalidColumnType(idx, s, Type::Text))
}

fn opt_time_column(row: &Row<'_>, idx: usize) -> SqlResult<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(_) => time_column(row, idx).map(Some),
        None => Ok(None),
    }
}

fn endpoint_from_row(row: &Row<'_>) -> SqlResult<Endpoint> {
    Ok(Endpoint {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        url: row.get(3)?,
        interval_secs: row.get(4)?,
        timeout_secs: row.get(5)?,
        expected_status: row.get(6)?,
        is_active: row.get(7)?,
        created_at: time_column(row, 8)?,
    })
}

fn check_from_row(row: &Row<'_>) -> SqlResult<HealthCheckResult> {
    Ok(HealthCheckResult {
        id: row.get(0)?,
        endpoint_id: row.get(1)?,
        tenant_id: row.get(2)?,
        status: row.get(3)?,
        latency_ms: row.get(4)?,
        status_code: row.get(5)?,
        error_message: row.get(6)?,
        checked_at: time_column(row, 7)?,
    })
}

fn outage_from_row(row: &Row<'_>) -> SqlResult<Outage> {
    Ok(Outage {
        id: row.get(0)?,
        endpoint_id: row.get(1)?,
        tenant_id: row.get(2)?,
        started_at: time_column(row, 3)?,
        ended_at: opt_time_column(row, 4)?,
        duration_secs: row.get(5)?,
        failure_count: row.get(6)?,
        status: row.get(7)?,
        root_cause: row.get(8)?,
    })
}

fn summary_from_row(row: &Row<'_>) -> SqlResult<UptimeSummary> {
    Ok(UptimeSummary {
        endpoint_id: row.get(0)?,
        tenant_id: row.get(1)?,
        period_start: time_column(row, 2)?,
        granularity: row.get(3)?,
        total_checks: row.get(4)?,
        successful_checks: row.get(5)?,
        uptime_percentage: row.get(6)?,
        avg_latency_ms: row.get(7)?,
        min_latency_ms: row.get(8)?,
        max_latency_ms: row.get(9)?,
        latency_samples: row.get(10)?,
    })
}

fn page_from_row(row: &Row<'_>) -> SqlResult<StatusPage> {
    Ok(StatusPage {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        slug: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        is_public: row.get(5)?,
        password_hash: row.get(6)?,
        endpoint_ids: Vec::new(),
    })
}

/// Format a timestamp as fixed-width text so lexical order is time order.
pub fn fmt_db_time(dt: DateTime<Utc>) -> String {
    dt.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
pub fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [TIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::*;
    use chrono::{Duration as ChronoDuration, TimeZone};

    #[test]
    fn test_endpoint_crud() {
        let (store, _tmp) = temp_store();

        let mut endpoint = sample_endpoint("acme", "api");
        let id = store.add_endpoint(&mut endpoint).unwrap();
        assert!(id > 0);

        let fetched = store.get_endpoint("acme", id).unwrap();
        assert_eq!(fetched, endpoint);

        let mut updated = fetched;
        updated.name = "api-v2".to_string();
        store.update_endpoint(&updated).unwrap();
        assert_eq!(store.get_endpoint("acme", id).unwrap().name, "api-v2");

        store.delete_endpoint("acme", id).unwrap();
        assert!(matches!(store.get_endpoint("acme", id), Err(DbError::NotFound)));
    }

    #[test]
    fn test_tenant_isolation() {
        let (store, _tmp) = temp_store();
        let mut endpoint = sample_endpoint("acme", "api");
        let id = store.add_endpoint(&mut endpoint).unwrap();

        assert!(matches!(store.get_endpoint("globex", id), Err(DbError::NotFound)));
        assert!(store.list_endpoints("globex").unwrap().is_empty());
        assert!(matches!(store.delete_endpoint("globex", id), Err(DbError::NotFound)));

        let mut foreign = endpoint.clone();
        foreign.tenant_id = "globex".to_string();
        assert!(matches!(store.update_endpoint(&foreign), Err(DbError::NotFound)));
    }

    #[test]
    fn test_duplicate_name_conflicts() {
        let (store, _tmp) = temp_store();
        store.add_endpoint(&mut sample_endpoint("acme", "api")).unwrap();
        let err = store.add_endpoint(&mut sample_endpoint("acme", "api")).unwrap_err();
        assert!(matches!(err, DbError::Conflict(_)));

        // Same name under another tenant is fine.
        store.add_endpoint(&mut sample_endpoint("globex", "api")).unwrap();
    }

    #[test]
    fn test_delete_cascades() {
        let (store, _tmp) = temp_store();
        let mut endpoint = sample_endpoint("acme", "api");
        store.add_endpoint(&mut endpoint).unwrap();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        store
            .add_health_check(&mut sample_check(&endpoint, CheckStatus::Down, t0, None))
            .unwrap();
        store.open_outage("acme", endpoint.id, t0, 1).unwrap();
        assert_eq!(store.endpoint_history_count("acme", endpoint.id).unwrap(), 2);

        store.delete_endpoint("acme", endpoint.id).unwrap();
        assert_eq!(store.endpoint_history_count("acme", endpoint.id).unwrap(), 0);
    }

    #[test]
    fn test_writes_for_deleted_endpoint_are_rejected() {
        let (store, _tmp) = temp_store();
        let mut endpoint = sample_endpoint("acme", "api");
        store.add_endpoint(&mut endpoint).unwrap();
        store.delete_endpoint("acme", endpoint.id).unwrap();

        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut check = sample_check(&endpoint, CheckStatus::Down, t0, None);
        assert!(matches!(store.add_health_check(&mut check), Err(DbError::NotFound)));
        assert!(matches!(store.open_outage("acme", endpoint.id, t0, 1), Err(DbError::NotFound)));
        assert!(store.list_outages("acme", None, 10).unwrap().is_empty());
    }

    #[test]
    fn test_open_outage_is_conditional() {
        let (store, _tmp) = temp_store();
        let mut endpoint = sample_endpoint("acme", "api");
        store.add_endpoint(&mut endpoint).unwrap();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let (first, created) = store.open_outage("acme", endpoint.id, t0, 1).unwrap();
        assert!(created);
        let (second, created) = store
            .open_outage("acme", endpoint.id, t0 + ChronoDuration::seconds(60), 1)
            .unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
        assert_eq!(second.started_at, t0);

        // Another tenant cannot touch it.
        assert!(matches!(
            store.increment_outage_failures("globex", first.id),
            Err(DbError::NotFound)
        ));
        assert!(matches!(
            store.resolve_outage("globex", first.id, t0 + ChronoDuration::seconds(90)),
            Err(DbError::NotFound)
        ));
        store.increment_outage_failures("acme", first.id).unwrap();

        let resolved = store
            .resolve_outage("acme", first.id, t0 + ChronoDuration::seconds(90))
            .unwrap();
        assert_eq!(resolved.failure_count, 2);
        assert_eq!(resolved.duration_secs, Some(90));

        // A resolved outage no longer blocks a new one.
        let (third, created) = store
            .open_outage("acme", endpoint.id, t0 + ChronoDuration::seconds(300), 1)
            .unwrap();
        assert!(created);
        assert_ne!(third.id, first.id);
        assert_eq!(store.list_outages("acme", Some(endpoint.id), 10).unwrap().len(), 2);
    }

    #[test]
    fn test_recent_checks_are_chronological() {
        let (store, _tmp) = temp_store();
        let mut endpoint = sample_endpoint("acme", "api");
        store.add_endpoint(&mut endpoint).unwrap();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for i in 0..5 {
            let at = t0 + ChronoDuration::seconds(i * 60);
            store
                .add_health_check(&mut sample_check(&endpoint, CheckStatus::Up, at, Some(i)))
                .unwrap();
        }

        let recent = store.recent_health_checks("acme", endpoint.id, 3).unwrap();
        let latencies: Vec<_> = recent.iter().map(|c| c.latency_ms).collect();
        assert_eq!(latencies, vec![Some(2), Some(3), Some(4)]);
    }

    #[test]
    fn test_status_page_roundtrip() {
        let (store, _tmp) = temp_store();
        let mut a = sample_endpoint("acme", "a");
        let mut b = sample_endpoint("acme", "b");
        store.add_endpoint(&mut a).unwrap();
        store.add_endpoint(&mut b).unwrap();

        let mut page = StatusPage {
            id: 0,
            tenant_id: "acme".to_string(),
            slug: "acme-status".to_string(),
            title: "Acme".to_string(),
            description: String::new(),
            is_public: true,
            password_hash: None,
            endpoint_ids: vec![b.id, a.id],
        };
        store.add_status_page(&mut page).unwrap();

        let fetched = store.get_status_page("acme-status").unwrap().unwrap();
        assert_eq!(fetched.endpoint_ids, vec![b.id, a.id]);

        let mut dup = page.clone();
        dup.tenant_id = "globex".to_string();
        assert!(matches!(store.add_status_page(&mut dup), Err(DbError::Conflict(_))));

        assert!(matches!(
            store.delete_status_page("globex", "acme-status"),
            Err(DbError::NotFound)
        ));
        store.delete_status_page("acme", "acme-status").unwrap();
        assert!(store.get_status_page("acme-status").unwrap().is_none());
    }
}
