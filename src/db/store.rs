//! SQLite database store implementation.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::{
    params, params_from_iter, Connection, OptionalExtension, Result as SqlResult, Row, Transaction,
    TransactionBehavior,
};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;
use crate::scoring::{Grade, PleskHealth, Rating};

mod embedded {
    refinery::embed_migrations!("migrations");
}

const DB_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] refinery::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("database lock poisoned")]
    Poisoned,
    #[error("Not found")]
    NotFound,
    #[error("already exists")]
    Duplicate,
    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

const SITE_COLUMNS: &str = "id, user_id, site_url, site_name, status, peanut_suite_installed, \
     peanut_suite_version, last_health, last_webvitals, last_check, created_at";

const SERVER_COLUMNS: &str = "id, user_id, name, host, port, status, plesk_version, os_info, \
     last_health, last_check, created_at";

const WEBVITALS_COLUMNS: &str = "id, site_id, source, mobile_score, desktop_score, overall_score, \
     lcp, fid, inp, cls, ttfb, fcp, ratings, opportunities, details, status, checked_at";

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

    /// Run embedded migrations.
    fn init(&self) -> Result<(), DbError> {
        let mut conn = self.conn()?;
        embedded::migrations::runner().run(&mut *conn)?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Accounts ---

    /// Create an account and return its ID.
    pub fn create_account(&self, name: &str, owner_email: Option<&str>) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO accounts (name, owner_email) VALUES (?1, ?2)",
            params![name, owner_email],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Put a user into an account, moving them out of any previous one.
    pub fn add_account_member(&self, account_id: i64, user_id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO account_members (user_id, account_id) VALUES (?1, ?2)
             ON CONFLICT(user_id) DO UPDATE SET account_id = excluded.account_id",
            params![user_id, account_id],
        )?;
        Ok(())
    }

    /// All users sharing an account with `user_id`, or just `user_id` itself.
    pub fn account_user_ids(&self, user_id: i64) -> Result<Vec<i64>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT m.user_id FROM account_members m
             WHERE m.account_id = (SELECT account_id FROM account_members WHERE user_id = ?1)
             ORDER BY m.user_id",
        )?;
        let ids = stmt
            .query_map(params![user_id], |row| row.get(0))?
            .collect::<SqlResult<Vec<i64>>>()?;

        if ids.is_empty() {
            Ok(vec![user_id])
        } else {
            Ok(ids)
        }
    }

    /// The account `user_id` belongs to, if any.
    pub fn account_for_user(&self, user_id: i64) -> Result<Option<i64>, DbError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT account_id FROM account_members WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Owner email of the account `user_id` belongs to.
    pub fn account_email_for_user(&self, user_id: i64) -> Result<Option<String>, DbError> {
        let conn = self.conn()?;
        let email: Option<Option<String>> = conn
            .query_row(
                "SELECT a.owner_email FROM accounts a
                 JOIN account_members m ON m.account_id = a.id
                 WHERE m.user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(email.flatten())
    }

    // --- Sites ---

    /// Insert a verified site together with its sealed key.
    pub fn insert_site(&self, site: &NewSite) -> Result<i64, DbError> {
        self.insert_site_in_account(site, &[site.user_id])
    }

    /// Insert a site unless one with the same `url_key` is already owned
    /// by `user_ids`. The check and the insert share one write transaction.
    pub fn insert_site_in_account(&self, site: &NewSite, user_ids: &[i64]) -> Result<i64, DbError> {
        let conn = self.conn()?;
        let tx = Transaction::new_unchecked(&conn, TransactionBehavior::Immediate)?;
        let key = vec![SqlValue::Text(site.url_key.clone())];
        if owned_row_exists(&tx, "sites", "url_key = ?", key, user_ids)? {
            return Err(DbError::Duplicate);
        }
        tx.execute(
            "INSERT INTO sites (user_id, site_url, url_key, site_name, site_key_hash, status,
                                peanut_suite_installed, peanut_suite_version, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'active', ?6, ?7, ?8)",
            params![
                site.user_id,
                site.site_url,
                site.url_key,
                site.site_name,
                site.site_key_hash,
                site.peanut_suite_installed,
                site.peanut_suite_version,
                fmt_db_time(Utc::now()),
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO site_credentials (site_id, sealed_key) VALUES (?1, ?2)",
            params![id, site.sealed_key],
        )?;
        tx.commit()?;
        Ok(id)
    }

    /// Get a site by ID.
    pub fn get_site(&self, id: i64) -> Result<MonitoredSite, DbError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM sites WHERE id = ?1", SITE_COLUMNS),
            params![id],
            site_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Find a site by URL identity among the given owners.
    pub fn find_site_by_url_key(
        &self,
        url_key: &str,
        user_ids: &[i64],
    ) -> Result<Option<MonitoredSite>, DbError> {
        if user_ids.is_empty() {
            return Ok(None);
        }
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM sites WHERE url_key = ? AND user_id IN ({}) LIMIT 1",
            SITE_COLUMNS,
            placeholders(user_ids.len())
        );
        let mut values = vec![SqlValue::Text(url_key.to_string())];
        values.extend(user_ids.iter().map(|id| SqlValue::Integer(*id)));

        Ok(conn
            .query_row(&sql, params_from_iter(values.iter()), site_from_row)
            .optional()?)
    }

    /// List sites owned by `user_ids` matching `filter`.
    pub fn list_sites(
        &self,
        user_ids: &[i64],
        filter: &SiteFilter,
    ) -> Result<Vec<MonitoredSite>, DbError> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut clauses = vec![format!("user_id IN ({})", placeholders(user_ids.len()))];
        let mut values: Vec<SqlValue> = user_ids.iter().map(|id| SqlValue::Integer(*id)).collect();

        if let Some(status) = filter.status {
            clauses.push("status = ?".to_string());
            values.push(SqlValue::Text(status.as_str().to_string()));
        }
        if let Some(health) = filter.health {
            clauses.push("json_extract(last_health, '$.status') = ?".to_string());
            values.push(SqlValue::Text(health.as_str().to_string()));
        }
        if let Some(search) = filter.search.as_deref().filter(|s| !s.is_empty()) {
            clauses.push(
                "(site_name LIKE ? ESCAPE '\\' OR site_url LIKE ? ESCAPE '\\')".to_string(),
            );
            let pattern = format!("%{}%", escape_like(search));
            values.push(SqlValue::Text(pattern.clone()));
            values.push(SqlValue::Text(pattern));
        }

        let sql = format!(
            "SELECT {} FROM sites WHERE {} ORDER BY site_name ASC",
            SITE_COLUMNS,
            clauses.join(" AND ")
        );

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let sites = stmt
            .query_map(params_from_iter(values.iter()), site_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(sites)
    }

    /// Count sites owned by `user_ids`.
    pub fn count_sites(&self, user_ids: &[i64]) -> Result<usize, DbError> {
        if user_ids.is_empty() {
            return Ok(0);
        }
        let conn = self.conn()?;
        let sql = format!(
            "SELECT COUNT(*) FROM sites WHERE user_id IN ({})",
            placeholders(user_ids.len())
        );
        let count: i64 = conn.query_row(&sql, params_from_iter(user_ids.iter()), |r| r.get(0))?;
        Ok(count.max(0) as usize)
    }

    /// Sites eligible for polling, across all accounts. Errored sites stay
    /// in rotation so they recover on the next good poll.
    pub fn pollable_sites(&self) -> Result<Vec<MonitoredSite>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sites WHERE status IN ('active', 'error') ORDER BY id ASC",
            SITE_COLUMNS
        ))?;
        let sites = stmt
            .query_map([], site_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(sites)
    }

    /// Sealed site key. Only the credential vault should call this.
    pub fn site_sealed_key(&self, site_id: i64) -> Result<Option<String>, DbError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT sealed_key FROM site_credentials WHERE site_id = ?1",
                params![site_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Store a fresh health snapshot and mark the site active.
    pub fn record_site_health(
        &self,
        site_id: i64,
        snapshot: &serde_json::Value,
        checked_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE sites SET status = 'active', last_health = ?1, last_check = ?2 WHERE id = ?3",
            params![serde_json::to_string(snapshot)?, fmt_db_time(checked_at), site_id],
        )?;
        Ok(())
    }

    /// Update the Peanut Suite installation details reported by the site.
    pub fn update_site_suite(
        &self,
        site_id: i64,
        installed: bool,
        version: Option<&str>,
    ) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE sites SET peanut_suite_installed = ?1, peanut_suite_version = ?2 WHERE id = ?3",
            params![installed, version, site_id],
        )?;
        Ok(())
    }

    /// Record a failed poll: status becomes `error` and the message is
    /// embedded in the health snapshot.
    pub fn mark_site_error(
        &self,
        site_id: i64,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let snapshot = serde_json::json!({
            "status": "error",
            "error": message,
            "checked_at": at,
        });
        let conn = self.conn()?;
        conn.execute(
            "UPDATE sites SET status = 'error', last_health = ?1, last_check = ?2 WHERE id = ?3",
            params![serde_json::to_string(&snapshot)?, fmt_db_time(at), site_id],
        )?;
        Ok(())
    }

    /// Overwrite the cached web vitals snapshot.
    pub fn set_site_webvitals(
        &self,
        site_id: i64,
        snapshot: &serde_json::Value,
    ) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE sites SET last_webvitals = ?1 WHERE id = ?2",
            params![serde_json::to_string(snapshot)?, site_id],
        )?;
        Ok(())
    }

    /// Delete everything hanging off a site, one table at a time. Safe to
    /// repeat after a partial failure.
    pub fn delete_site_data(&self, site_id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM uptime_checks WHERE site_id = ?1", params![site_id])?;
        conn.execute("DELETE FROM health_log WHERE site_id = ?1", params![site_id])?;
        conn.execute("DELETE FROM site_analytics WHERE site_id = ?1", params![site_id])?;
        conn.execute("DELETE FROM webvitals WHERE site_id = ?1", params![site_id])?;
        conn.execute("DELETE FROM site_credentials WHERE site_id = ?1", params![site_id])?;
        conn.execute(
            "DELETE FROM alert_suppressions WHERE key LIKE ?1",
            params![format!("site:{}:%", site_id)],
        )?;
        Ok(())
    }

    /// Delete the registry row. Returns whether a row was removed.
    pub fn delete_site(&self, site_id: i64) -> Result<bool, DbError> {
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM sites WHERE id = ?1", params![site_id])?;
        Ok(n > 0)
    }

    // --- Health log ---

    /// Append a health log row.
    pub fn add_health_log(
        &self,
        site_id: i64,
        status: &str,
        score: Option<u8>,
        grade: Option<Grade>,
        checks: &serde_json::Value,
        checked_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO health_log (site_id, status, score, grade, checks, checked_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                site_id,
                status,
                score,
                grade.map(|g| g.as_str()),
                serde_json::to_string(checks)?,
                fmt_db_time(checked_at),
            ],
        )?;
        Ok(())
    }

    /// Most recent health log rows, newest first.
    pub fn health_log(&self, site_id: i64, limit: u32) -> Result<Vec<HealthLogEntry>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, site_id, status, score, grade, checks, checked_at FROM health_log
             WHERE site_id = ?1 ORDER BY checked_at DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![site_id, limit], |row| {
                Ok(HealthLogEntry {
                    id: row.get(0)?,
                    site_id: row.get(1)?,
                    status: row.get(2)?,
                    score: row.get(3)?,
                    grade: row.get(4)?,
                    checks: parse_json(row.get(5)?).unwrap_or(serde_json::Value::Null),
                    checked_at: time_column(row, 6)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn delete_health_log_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn()?;
        Ok(conn.execute(
            "DELETE FROM health_log WHERE checked_at < ?1",
            params![fmt_db_time(cutoff)],
        )?)
    }

    // --- Uptime ---

    pub fn add_uptime(&self, record: &UptimeRecord) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO uptime_checks (site_id, status, response_time_ms, status_code, checked_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.site_id,
                record.status.as_str(),
                record.response_time_ms,
                record.status_code,
                fmt_db_time(record.checked_at),
            ],
        )?;
        Ok(())
    }

    /// Uptime records since `since`, oldest first.
    pub fn uptime_history(
        &self,
        site_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<UptimeRecord>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT site_id, status, response_time_ms, status_code, checked_at FROM uptime_checks
             WHERE site_id = ?1 AND checked_at >= ?2 ORDER BY checked_at ASC",
        )?;
        let rows = stmt
            .query_map(params![site_id, fmt_db_time(since)], |row| {
                let status: String = row.get(1)?;
                Ok(UptimeRecord {
                    site_id: row.get(0)?,
                    status: if status == "up" { UptimeStatus::Up } else { UptimeStatus::Down },
                    response_time_ms: row.get(2)?,
                    status_code: row.get(3)?,
                    checked_at: time_column(row, 4)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(rows)
    }

    /// Uptime percentage and average response time since `since`.
    pub fn uptime_summary(
        &self,
        site_id: i64,
        since: DateTime<Utc>,
    ) -> Result<UptimeSummary, DbError> {
        let conn = self.conn()?;
        let (checks, up, avg): (i64, Option<i64>, Option<f64>) = conn.query_row(
            "SELECT COUNT(*),
                    SUM(CASE WHEN status = 'up' THEN 1 ELSE 0 END),
                    AVG(CASE WHEN status = 'up' THEN response_time_ms END)
             FROM uptime_checks WHERE site_id = ?1 AND checked_at >= ?2",
            params![site_id, fmt_db_time(since)],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let up = up.unwrap_or(0);

        Ok(UptimeSummary {
            checks,
            up,
            uptime_percent: (checks > 0)
                .then(|| crate::scoring::round3(up as f64 * 100.0 / checks as f64)),
            avg_response_ms: avg.map(crate::scoring::round3),
        })
    }

    pub fn delete_uptime_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn()?;
        Ok(conn.execute(
            "DELETE FROM uptime_checks WHERE checked_at < ?1",
            params![fmt_db_time(cutoff)],
        )?)
    }

    // --- Analytics ---

    /// Store one analytics payload per site per day.
    pub fn upsert_analytics(
        &self,
        site_id: i64,
        day: NaiveDate,
        data: &serde_json::Value,
        recorded_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO site_analytics (site_id, day, data, recorded_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(site_id, day)
             DO UPDATE SET data = excluded.data, recorded_at = excluded.recorded_at",
            params![
                site_id,
                day.format("%Y-%m-%d").to_string(),
                serde_json::to_string(data)?,
                fmt_db_time(recorded_at),
            ],
        )?;
        Ok(())
    }

    pub fn analytics_days(
        &self,
        site_id: i64,
    ) -> Result<Vec<(NaiveDate, serde_json::Value)>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT day, data FROM site_analytics WHERE site_id = ?1 ORDER BY day ASC",
        )?;
        let rows = stmt
            .query_map(params![site_id], |row| {
                let day: String = row.get(0)?;
                let data: String = row.get(1)?;
                Ok((day, data))
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(rows
            .into_iter()
            .filter_map(|(day, data)| {
                let day = NaiveDate::parse_from_str(&day, "%Y-%m-%d").ok()?;
                Some((day, serde_json::from_str(&data).ok()?))
            })
            .collect())
    }

    pub fn delete_analytics_before(&self, cutoff: NaiveDate) -> Result<usize, DbError> {
        let conn = self.conn()?;
        Ok(conn.execute(
            "DELETE FROM site_analytics WHERE day < ?1",
            params![cutoff.format("%Y-%m-%d").to_string()],
        )?)
    }

    // --- Web vitals ---

    /// Append a web vitals row and return its ID.
    pub fn add_webvitals(&self, record: &WebVitalsRecord) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO webvitals (site_id, source, mobile_score, desktop_score, overall_score,
                                    lcp, fid, inp, cls, ttfb, fcp, ratings, opportunities, details,
                                    status, checked_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                record.site_id,
                record.source.as_str(),
                record.mobile_score,
                record.desktop_score,
                record.overall_score,
                record.lcp,
                record.fid,
                record.inp,
                record.cls,
                record.ttfb,
                record.fcp,
                serde_json::to_string(&record.ratings)?,
                serde_json::to_string(&record.opportunities)?,
                serde_json::to_string(&record.details)?,
                record.status.as_str(),
                fmt_db_time(record.checked_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent web vitals rows, newest first.
    pub fn webvitals_history(
        &self,
        site_id: i64,
        limit: u32,
    ) -> Result<Vec<WebVitalsRecord>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM webvitals WHERE site_id = ?1
             ORDER BY checked_at DESC, id DESC LIMIT ?2",
            WEBVITALS_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![site_id, limit], webvitals_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn delete_webvitals_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn()?;
        Ok(conn.execute(
            "DELETE FROM webvitals WHERE checked_at < ?1",
            params![fmt_db_time(cutoff)],
        )?)
    }

    // --- Plesk servers ---

    pub fn insert_server(&self, server: &NewServer) -> Result<i64, DbError> {
        self.insert_server_in_account(server, &[server.user_id])
    }

    /// Insert a server unless `user_ids` already own the same host and port.
    pub fn insert_server_in_account(
        &self,
        server: &NewServer,
        user_ids: &[i64],
    ) -> Result<i64, DbError> {
        let conn = self.conn()?;
        let tx = Transaction::new_unchecked(&conn, TransactionBehavior::Immediate)?;
        let key = vec![
            SqlValue::Text(server.host.clone()),
            SqlValue::Integer(i64::from(server.port)),
        ];
        if owned_row_exists(&tx, "plesk_servers", "host = ? AND port = ?", key, user_ids)? {
            return Err(DbError::Duplicate);
        }
        let now = fmt_db_time(Utc::now());
        tx.execute(
            "INSERT INTO plesk_servers (user_id, name, host, port, status, plesk_version, os_info,
                                        last_health, last_check, created_at)
             VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?6, ?7, ?8, ?8)",
            params![
                server.user_id,
                server.name,
                server.host,
                server.port,
                server.plesk_version,
                server.os_info,
                serde_json::to_string(&server.last_health)?,
                now,
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO plesk_credentials (server_id, sealed_key) VALUES (?1, ?2)",
            params![id, server.sealed_key],
        )?;
        tx.commit()?;
        Ok(id)
    }

    pub fn get_server(&self, id: i64) -> Result<PleskServer, DbError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM plesk_servers WHERE id = ?1", SERVER_COLUMNS),
            params![id],
            server_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    pub fn find_server(
        &self,
        host: &str,
        port: u16,
        user_ids: &[i64],
    ) -> Result<Option<PleskServer>, DbError> {
        if user_ids.is_empty() {
            return Ok(None);
        }
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM plesk_servers WHERE host = ? AND port = ? AND user_id IN ({}) LIMIT 1",
            SERVER_COLUMNS,
            placeholders(user_ids.len())
        );
        let mut values = vec![SqlValue::Text(host.to_string()), SqlValue::Integer(i64::from(port))];
        values.extend(user_ids.iter().map(|id| SqlValue::Integer(*id)));

        Ok(conn
            .query_row(&sql, params_from_iter(values.iter()), server_from_row)
            .optional()?)
    }

    pub fn list_servers(&self, user_ids: &[i64]) -> Result<Vec<PleskServer>, DbError> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM plesk_servers WHERE user_id IN ({}) ORDER BY name ASC",
            SERVER_COLUMNS,
            placeholders(user_ids.len())
        ))?;
        let servers = stmt
            .query_map(params_from_iter(user_ids.iter()), server_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(servers)
    }

    /// Servers eligible for polling, across all accounts.
    pub fn pollable_servers(&self) -> Result<Vec<PleskServer>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM plesk_servers WHERE status IN ('active', 'error') ORDER BY id ASC",
            SERVER_COLUMNS
        ))?;
        let servers = stmt
            .query_map([], server_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(servers)
    }

    pub fn server_sealed_key(&self, server_id: i64) -> Result<Option<String>, DbError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT sealed_key FROM plesk_credentials WHERE server_id = ?1",
                params![server_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Store a full check result on the server row and append it to the log.
    pub fn record_server_health(
        &self,
        server_id: i64,
        health: &PleskHealth,
        plesk_version: Option<&str>,
        os_info: Option<&str>,
    ) -> Result<(), DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let checked_at = fmt_db_time(health.checked_at);
        tx.execute(
            "UPDATE plesk_servers SET status = 'active', last_health = ?1, last_check = ?2,
                    plesk_version = COALESCE(?3, plesk_version), os_info = COALESCE(?4, os_info)
             WHERE id = ?5",
            params![
                serde_json::to_string(health)?,
                checked_at,
                plesk_version,
                os_info,
                server_id,
            ],
        )?;
        tx.execute(
            "INSERT INTO plesk_health_log (server_id, status, score, grade, checks, checked_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                server_id,
                health.status.as_str(),
                health.score,
                health.grade.as_str(),
                serde_json::to_string(&health.checks)?,
                checked_at,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn mark_server_error(
        &self,
        server_id: i64,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let snapshot = serde_json::json!({
            "status": "error",
            "error": message,
            "checked_at": at,
        });
        let conn = self.conn()?;
        conn.execute(
            "UPDATE plesk_servers SET status = 'error', last_health = ?1, last_check = ?2
             WHERE id = ?3",
            params![serde_json::to_string(&snapshot)?, fmt_db_time(at), server_id],
        )?;
        Ok(())
    }

    /// Delete a server with its credential and history.
    pub fn delete_server(&self, server_id: i64) -> Result<bool, DbError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM plesk_health_log WHERE server_id = ?1", params![server_id])?;
        conn.execute("DELETE FROM plesk_credentials WHERE server_id = ?1", params![server_id])?;
        let n = conn.execute("DELETE FROM plesk_servers WHERE id = ?1", params![server_id])?;
        Ok(n > 0)
    }

    pub fn plesk_history(
        &self,
        server_id: i64,
        limit: u32,
    ) -> Result<Vec<PleskHealthLogEntry>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, server_id, status, score, grade, checks, checked_at FROM plesk_health_log
             WHERE server_id = ?1 ORDER BY checked_at DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![server_id, limit], |row| {
                Ok(PleskHealthLogEntry {
                    id: row.get(0)?,
                    server_id: row.get(1)?,
                    status: row.get(2)?,
                    score: row.get(3)?,
                    grade: row.get(4)?,
                    checks: parse_json(row.get(5)?).unwrap_or(serde_json::Value::Null),
                    checked_at: time_column(row, 6)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn delete_plesk_logs_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn()?;
        Ok(conn.execute(
            "DELETE FROM plesk_health_log WHERE checked_at < ?1",
            params![fmt_db_time(cutoff)],
        )?)
    }

    // --- Alert suppression ---

    /// Claim `key` until `expires_at`. Returns false while an earlier claim
    /// is still live.
    pub fn claim_alert(
        &self,
        key: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM alert_suppressions WHERE key = ?1 AND expires_at <= ?2",
            params![key, fmt_db_time(now)],
        )?;
        let n = conn.execute(
            "INSERT OR IGNORE INTO alert_suppressions (key, expires_at) VALUES (?1, ?2)",
            params![key, fmt_db_time(expires_at)],
        )?;
        Ok(n == 1)
    }

    /// Drop a claim so the next attempt can alert.
    pub fn release_alert(&self, key: &str) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM alert_suppressions WHERE key = ?1", params![key])?;
        Ok(())
    }

    pub fn delete_expired_suppressions(&self, now: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn()?;
        Ok(conn.execute(
            "DELETE FROM alert_suppressions WHERE expires_at <= ?1",
            params![fmt_db_time(now)],
        )?)
    }
}

/// Whether `table` has a row matching `filter` owned by one of `user_ids`.
fn owned_row_exists(
    conn: &Connection,
    table: &str,
    filter: &str,
    mut values: Vec<SqlValue>,
    user_ids: &[i64],
) -> SqlResult<bool> {
    if user_ids.is_empty() {
        return Ok(false);
    }
    let sql = format!(
        "SELECT EXISTS(SELECT 1 FROM {} WHERE {} AND user_id IN ({}))",
        table,
        filter,
        placeholders(user_ids.len())
    );
    values.extend(user_ids.iter().map(|id| SqlValue::Integer(*id)));
    conn.query_row(&sql, params_from_iter(values.iter()), |row| row.get(0))
}

/// Escape LIKE wildcards so `search` matches literally.
fn escape_like(search: &str) -> String {
    let mut out = String::with_capacity(search.len());
    for c in search.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn parse_json(raw: Option<String>) -> Option<serde_json::Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

fn time_column(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_db_time(&s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            Box::new(DbError::InvalidTimestamp(s)),
        )
    })
}

fn optional_time_column(row: &Row<'_>, idx: usize) -> SqlResult<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(_) => time_column(row, idx).map(Some),
        None => Ok(None),
    }
}

fn site_from_row(row: &Row<'_>) -> SqlResult<MonitoredSite> {
    let status: String = row.get(4)?;
    Ok(MonitoredSite {
        id: row.get(0)?,
        user_id: row.get(1)?,
        site_url: row.get(2)?,
        site_name: row.get(3)?,
        status: TargetStatus::parse(&status).unwrap_or(TargetStatus::Error),
        peanut_suite_installed: row.get(5)?,
        peanut_suite_version: row.get(6)?,
        last_health: parse_json(row.get(7)?),
        last_webvitals: parse_json(row.get(8)?),
        last_check: optional_time_column(row, 9)?,
        created_at: time_column(row, 10)?,
    })
}

fn server_from_row(row: &Row<'_>) -> SqlResult<PleskServer> {
    let status: String = row.get(5)?;
    Ok(PleskServer {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        host: row.get(3)?,
        port: row.get(4)?,
        status: TargetStatus::parse(&status).unwrap_or(TargetStatus::Error),
        plesk_version: row.get(6)?,
        os_info: row.get(7)?,
        last_health: parse_json(row.get(8)?),
        last_check: optional_time_column(row, 9)?,
        created_at: time_column(row, 10)?,
    })
}

fn webvitals_from_row(row: &Row<'_>) -> SqlResult<WebVitalsRecord> {
    let source: String = row.get(2)?;
    let status: String = row.get(15)?;
    let opportunities: Option<String> = row.get(13)?;
    Ok(WebVitalsRecord {
        id: row.get(0)?,
        site_id: row.get(1)?,
        source: if source == "pagespeed" { VitalsSource::Pagespeed } else { VitalsSource::Basic },
        mobile_score: row.get(3)?,
        desktop_score: row.get(4)?,
        overall_score: row.get(5)?,
        lcp: row.get(6)?,
        fid: row.get(7)?,
        inp: row.get(8)?,
        cls: row.get(9)?,
        ttfb: row.get(10)?,
        fcp: row.get(11)?,
        ratings: parse_json(row.get(12)?).unwrap_or_else(|| serde_json::json!({})),
        opportunities: opportunities
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
        details: parse_json(row.get(14)?).unwrap_or_else(|| serde_json::json!({})),
        status: Rating::parse(&status).unwrap_or(Rating::Poor),
        checked_at: time_column(row, 16)?,
    })
}

/// Format a timestamp the way every table stores it.
pub fn fmt_db_time(dt: DateTime<Utc>) -> String {
    dt.format(DB_TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        DB_TIME_FORMAT,
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::{evaluate_full, ServerMetrics};
    use chrono::Duration as ChronoDuration;
    use tempfile::NamedTempFile;

    fn store() -> (NamedTempFile, Store) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        (tmp, store)
    }

    fn new_site(user_id: i64, url: &str) -> NewSite {
        NewSite {
            user_id,
            site_url: format!("https://{}", url),
            url_key: url.to_string(),
            site_name: url.to_string(),
            site_key_hash: "hash".to_string(),
            sealed_key: "sealed".to_string(),
            peanut_suite_installed: true,
            peanut_suite_version: Some("2.1.0".to_string()),
        }
    }

    #[test]
    fn test_site_crud() {
        let (_tmp, store) = store();
        let id = store.insert_site(&new_site(1, "example.com")).unwrap();
        assert!(id > 0);

        let site = store.get_site(id).unwrap();
        assert_eq!(site.site_url, "https://example.com");
        assert_eq!(site.status, TargetStatus::Active);
        assert_eq!(site.peanut_suite_version.as_deref(), Some("2.1.0"));
        assert!(site.last_check.is_none());
        assert_eq!(store.site_sealed_key(id).unwrap().as_deref(), Some("sealed"));

        let now = Utc::now();
        store
            .record_site_health(id, &serde_json::json!({"status": "healthy", "score": 92}), now)
            .unwrap();
        let site = store.get_site(id).unwrap();
        assert_eq!(site.last_health.unwrap()["score"], 92);
        assert!(site.last_check.is_some());

        store.mark_site_error(id, "timed out", now).unwrap();
        let site = store.get_site(id).unwrap();
        assert_eq!(site.status, TargetStatus::Error);
        assert_eq!(site.last_health.unwrap()["error"], "timed out");
        assert_eq!(store.pollable_sites().unwrap().len(), 1);

        assert!(store.delete_site(id).unwrap());
        assert!(matches!(store.get_site(id), Err(DbError::NotFound)));
        assert!(!store.delete_site(id).unwrap());
    }

    #[test]
    fn test_account_visibility() {
        let (_tmp, store) = store();
        let account = store.create_account("Agency", Some("owner@agency.test")).unwrap();
        store.add_account_member(account, 1).unwrap();
        store.add_account_member(account, 2).unwrap();

        assert_eq!(store.account_user_ids(2).unwrap(), vec![1, 2]);
        assert_eq!(store.account_user_ids(9).unwrap(), vec![9]);
        assert_eq!(
            store.account_email_for_user(1).unwrap().as_deref(),
            Some("owner@agency.test")
        );
        assert!(store.account_email_for_user(9).unwrap().is_none());
        assert_eq!(store.account_for_user(2).unwrap(), Some(account));
        assert_eq!(store.account_for_user(9).unwrap(), None);

        store.insert_site(&new_site(1, "a.test")).unwrap();
        store.insert_site(&new_site(9, "b.test")).unwrap();

        let visible = store.list_sites(&[1, 2], &SiteFilter::default()).unwrap();
        assert_eq!(visible.len(), 1);
        assert!(store.find_site_by_url_key("a.test", &[1, 2]).unwrap().is_some());
        assert!(store.find_site_by_url_key("a.test", &[9]).unwrap().is_none());
        assert_eq!(store.count_sites(&[1, 2]).unwrap(), 1);

        // User 2 shares the account, so the same URL is taken for them too.
        assert!(matches!(
            store.insert_site_in_account(&new_site(2, "a.test"), &[1, 2]),
            Err(DbError::Duplicate)
        ));
        assert!(store.insert_site_in_account(&new_site(9, "a.test"), &[9]).is_ok());
    }

    #[test]
    fn test_health_filter_uses_snapshot_status() {
        let (_tmp, store) = store();
        let a = store.insert_site(&new_site(1, "a.test")).unwrap();
        let b = store.insert_site(&new_site(1, "b.test")).unwrap();
        let now = Utc::now();
        store.record_site_health(a, &serde_json::json!({"status": "healthy"}), now).unwrap();
        store.record_site_health(b, &serde_json::json!({"status": "critical"}), now).unwrap();

        let filter = SiteFilter {
            health: Some(crate::scoring::HealthStatus::Critical),
            ..Default::default()
        };
        let sites = store.list_sites(&[1], &filter).unwrap();
        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].id, b);

        let search = SiteFilter { search: Some("a.te".to_string()), ..Default::default() };
        assert_eq!(store.list_sites(&[1], &search).unwrap().len(), 1);
    }

    #[test]
    fn test_search_matches_wildcards_literally() {
        let (_tmp, store) = store();
        store.insert_site(&new_site(1, "axb.test")).unwrap();
        store.insert_site(&new_site(1, "full.test")).unwrap();

        let search = |s: &str| SiteFilter { search: Some(s.to_string()), ..Default::default() };
        assert!(store.list_sites(&[1], &search("a_b")).unwrap().is_empty());
        assert!(store.list_sites(&[1], &search("%")).unwrap().is_empty());
        assert_eq!(store.list_sites(&[1], &search("axb")).unwrap().len(), 1);

        let id = store.insert_site(&new_site(1, "a_b.test")).unwrap();
        let sites = store.list_sites(&[1], &search("a_b")).unwrap();
        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].id, id);
        assert_eq!(escape_like(r"50%_\"), r"50\%\_\\");
    }

    #[test]
    fn test_corrupt_timestamp_is_an_error() {
        let (_tmp, store) = store();
        let id = store.insert_site(&new_site(1, "clock.test")).unwrap();
        store
            .conn()
            .unwrap()
            .execute("UPDATE sites SET created_at = 'yesterday' WHERE id = ?1", params![id])
            .unwrap();
        let err = store.get_site(id).unwrap_err();
        assert!(matches!(
            err,
            DbError::Sqlite(rusqlite::Error::FromSqlConversionFailure(10, Type::Text, _))
        ));

        store
            .conn()
            .unwrap()
            .execute(
                "UPDATE sites SET created_at = ?1, last_check = 'never' WHERE id = ?2",
                params![fmt_db_time(Utc::now()), id],
            )
            .unwrap();
        assert!(store.get_site(id).is_err());
    }

    #[test]
    fn test_delete_site_data_is_repeatable() {
        let (_tmp, store) = store();
        let id = store.insert_site(&new_site(1, "gone.test")).unwrap();
        let now = Utc::now();
        store
            .add_uptime(&UptimeRecord {
                site_id: id,
                status: UptimeStatus::Up,
                response_time_ms: Some(120),
                status_code: Some(200),
                checked_at: now,
            })
            .unwrap();
        store
            .add_health_log(id, "healthy", Some(90), Some(Grade::A), &serde_json::json!({}), now)
            .unwrap();
        store
            .upsert_analytics(id, now.date_naive(), &serde_json::json!({"visits": 3}), now)
            .unwrap();

        store.delete_site_data(id).unwrap();
        store.delete_site_data(id).unwrap();
        store.delete_site(id).unwrap();

        assert!(store.uptime_history(id, now - ChronoDuration::days(1)).unwrap().is_empty());
        assert!(store.health_log(id, 10).unwrap().is_empty());
        assert!(store.analytics_days(id).unwrap().is_empty());
        assert!(store.site_sealed_key(id).unwrap().is_none());
    }

    #[test]
    fn test_uptime_summary_and_retention() {
        let (_tmp, store) = store();
        let now = Utc::now();
        let statuses = [UptimeStatus::Up, UptimeStatus::Up, UptimeStatus::Down, UptimeStatus::Up];
        for (i, status) in statuses.into_iter().enumerate() {
            store
                .add_uptime(&UptimeRecord {
                    site_id: 7,
                    status,
                    response_time_ms: (status == UptimeStatus::Up).then_some(100 * (i as i64 + 1)),
                    status_code: None,
                    checked_at: now - ChronoDuration::minutes(5 * i as i64),
                })
                .unwrap();
        }

        let summary = store.uptime_summary(7, now - ChronoDuration::hours(1)).unwrap();
        assert_eq!(summary.checks, 4);
        assert_eq!(summary.up, 3);
        assert_eq!(summary.uptime_percent, Some(75.0));
        assert_eq!(summary.avg_response_ms, Some(233.333));

        let empty = store.uptime_summary(8, now - ChronoDuration::hours(1)).unwrap();
        assert_eq!(empty.checks, 0);
        assert!(empty.uptime_percent.is_none());

        let removed = store.delete_uptime_before(now - ChronoDuration::minutes(7)).unwrap();
        assert_eq!(removed, 2);
    }

    #[test]
    fn test_analytics_upsert_per_day() {
        let (_tmp, store) = store();
        let now = Utc::now();
        store.upsert_analytics(3, now.date_naive(), &serde_json::json!({"v": 1}), now).unwrap();
        store.upsert_analytics(3, now.date_naive(), &serde_json::json!({"v": 2}), now).unwrap();
        let days = store.analytics_days(3).unwrap();
        assert_eq!(days.len(), 1);
        assert_eq!(days[0].1["v"], 2);
    }

    #[test]
    fn test_server_health_log() {
        let (_tmp, store) = store();
        let id = store
            .insert_server(&NewServer {
                user_id: 1,
                name: "web-01".to_string(),
                host: "panel.example.com".to_string(),
                port: 8443,
                sealed_key: "sealed".to_string(),
                plesk_version: Some("18.0.60".to_string()),
                os_info: None,
                last_health: serde_json::json!({"formula": "quick"}),
            })
            .unwrap();

        assert!(store.find_server("panel.example.com", 8443, &[1]).unwrap().is_some());
        assert!(store.find_server("panel.example.com", 8880, &[1]).unwrap().is_none());
        let same_panel = NewServer {
            user_id: 2,
            name: "again".to_string(),
            host: "panel.example.com".to_string(),
            port: 8443,
            sealed_key: "sealed".to_string(),
            plesk_version: None,
            os_info: None,
            last_health: serde_json::json!({}),
        };
        assert!(matches!(
            store.insert_server_in_account(&same_panel, &[1, 2]),
            Err(DbError::Duplicate)
        ));

        let old = evaluate_full(&ServerMetrics::default(), Utc::now() - ChronoDuration::days(91));
        let fresh = evaluate_full(&ServerMetrics::default(), Utc::now());
        store.record_server_health(id, &old, None, Some("Ubuntu 22.04")).unwrap();
        store.record_server_health(id, &fresh, None, None).unwrap();

        let server = store.get_server(id).unwrap();
        assert_eq!(server.plesk_version.as_deref(), Some("18.0.60"));
        assert_eq!(server.os_info.as_deref(), Some("Ubuntu 22.04"));
        assert_eq!(server.last_health.unwrap()["score"], 100);
        assert_eq!(store.plesk_history(id, 10).unwrap().len(), 2);

        let removed = store
            .delete_plesk_logs_before(Utc::now() - ChronoDuration::days(90))
            .unwrap();
        assert_eq!(removed, 1);

        store.mark_server_error(id, "connection refused", Utc::now()).unwrap();
        assert_eq!(store.get_server(id).unwrap().status, TargetStatus::Error);

        assert!(store.delete_server(id).unwrap());
        assert!(store.plesk_history(id, 10).unwrap().is_empty());
        assert!(store.server_sealed_key(id).unwrap().is_none());
    }

    #[test]
    fn test_claim_alert_window() {
        let (_tmp, store) = store();
        let now = Utc::now();
        let later = now + ChronoDuration::hours(24);
        assert!(store.claim_alert("site:1:webvitals", now, later).unwrap());
        let retry = now + ChronoDuration::hours(23);
        assert!(!store.claim_alert("site:1:webvitals", retry, later).unwrap());
        assert!(store.claim_alert("site:2:webvitals", now, later).unwrap());
        assert!(store
            .claim_alert("site:1:webvitals", later, later + ChronoDuration::hours(24))
            .unwrap());
    }

    #[test]
    fn test_parse_db_time() {
        let now = Utc::now();
        let parsed = parse_db_time(&fmt_db_time(now)).unwrap();
        assert_eq!(parsed, now);
        assert!(parse_db_time("2024-01-01 00:00:00").is_some());
        assert!(parse_db_time("yesterday").is_none());
    }
}
