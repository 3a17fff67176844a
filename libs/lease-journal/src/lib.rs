#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # lease-journal
//!
//! Append-only SQLite history of hop outcomes. One row per successful hop
//! cycle. The pool serializes writes and allows concurrent reads, so the
//! journal can be shared between the hopper worker and any number of
//! control-plane handlers.
use std::{
    path::{Path, PathBuf},
    str::FromStr,
};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use sqlx::{
    ConnectOptions, Row,
    sqlite::{SqliteConnectOptions, SqlitePool},
};
use thiserror::Error;

/// Schema bootstrap, executed statement-by-statement on open
static SCHEMA: [&str; 3] = [
    "CREATE TABLE IF NOT EXISTS leases (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        vlan_id INTEGER NOT NULL,
        ip TEXT NOT NULL,
        mac TEXT,
        timestamp TEXT NOT NULL,
        modules_run TEXT,
        duration_sec REAL
    )",
    "CREATE INDEX IF NOT EXISTS idx_leases_vlan ON leases(vlan_id)",
    "CREATE INDEX IF NOT EXISTS idx_leases_ip ON leases(ip)",
];

#[derive(Debug, Error)]
pub enum JournalError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error("failed to encode modules_run: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One persisted hop outcome
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeaseRecord {
    pub id: i64,
    pub vlan_id: u16,
    pub ip: String,
    pub mac: String,
    pub timestamp: String,
    pub modules_run: Vec<String>,
    pub duration_sec: f64,
}

#[derive(Debug, Clone)]
pub struct LeaseJournal {
    pool: SqlitePool,
}

/// `$HOME/.chaos-bot/lease_history.db`
pub fn default_db_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| Path::new(&home).join(".chaos-bot/lease_history.db"))
}

impl LeaseJournal {
    /// Open (creating if missing) the journal at `url`, e.g.
    /// `sqlite:///var/lib/chaos-bot/leases.db` or `sqlite::memory:` for tests.
    pub async fn open(url: impl AsRef<str>) -> Result<Self, JournalError> {
        // keep statements out of the log unless someone asks for trace
        let opts = SqliteConnectOptions::from_str(url.as_ref())?
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true)
            .log_statements(tracing::log::LevelFilter::Trace);

        let pool = SqlitePool::connect_with(opts).await?;
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    /// Open the journal at the default on-disk location, creating the parent
    /// directory if needed.
    pub async fn open_default() -> Result<Self, JournalError> {
        let path = default_db_path().ok_or_else(|| {
            JournalError::Db(sqlx::Error::Configuration(
                "HOME not set, cannot locate lease journal".into(),
            ))
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
        }
        Self::open(format!("sqlite://{}", path.display())).await
    }

    /// Append one lease record; committed before return. Returns the new id.
    pub async fn append(
        &self,
        vlan_id: u16,
        ip: &str,
        mac: &str,
        modules_run: &[String],
        duration_sec: f64,
    ) -> Result<i64, JournalError> {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let modules = serde_json::to_string(modules_run)?;
        let duration = (duration_sec * 10.0).round() / 10.0;
        let done = sqlx::query(
            "INSERT INTO leases (vlan_id, ip, mac, timestamp, modules_run, duration_sec)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(vlan_id as i64)
        .bind(ip)
        .bind(mac)
        .bind(timestamp)
        .bind(modules)
        .bind(duration)
        .execute(&self.pool)
        .await?;
        Ok(done.last_insert_rowid())
    }

    /// True iff the single most recent record for `vlan_id` carries exactly
    /// this ip. Deliberately never looks further back: broader rejection
    /// livelocks against deterministic DHCP pools.
    pub async fn is_immediate_duplicate(
        &self,
        vlan_id: u16,
        ip: &str,
    ) -> Result<bool, JournalError> {
        let last: Option<String> =
            sqlx::query_scalar("SELECT ip FROM leases WHERE vlan_id = ?1 ORDER BY id DESC LIMIT 1")
                .bind(vlan_id as i64)
                .fetch_optional(&self.pool)
                .await?;
        Ok(last.as_deref() == Some(ip))
    }

    /// Most-recent-first history, optionally filtered by VLAN
    pub async fn history(
        &self,
        vlan_id: Option<u16>,
        last: u32,
    ) -> Result<Vec<LeaseRecord>, JournalError> {
        let rows = match vlan_id {
            Some(vid) => {
                sqlx::query(
                    "SELECT id, vlan_id, ip, mac, timestamp, modules_run, duration_sec
                     FROM leases WHERE vlan_id = ?1 ORDER BY id DESC LIMIT ?2",
                )
                .bind(vid as i64)
                .bind(last as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, vlan_id, ip, mac, timestamp, modules_run, duration_sec
                     FROM leases ORDER BY id DESC LIMIT ?1",
                )
                .bind(last as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.into_iter().map(into_record).collect()
    }

    /// Delete every record, returning how many were removed
    pub async fn clear(&self) -> Result<u64, JournalError> {
        let done = sqlx::query("DELETE FROM leases").execute(&self.pool).await?;
        Ok(done.rows_affected())
    }
}

fn into_record(row: sqlx::sqlite::SqliteRow) -> Result<LeaseRecord, JournalError> {
    let modules: Option<String> = row.try_get("modules_run")?;
    let modules_run = match modules {
        Some(ref json) => serde_json::from_str(json).unwrap_or_default(),
        None => Vec::new(),
    };
    Ok(LeaseRecord {
        id: row.try_get("id")?,
        vlan_id: row.try_get::<i64, _>("vlan_id")? as u16,
        ip: row.try_get("ip")?,
        mac: row.try_get::<Option<String>, _>("mac")?.unwrap_or_default(),
        timestamp: row.try_get("timestamp")?,
        modules_run,
        duration_sec: row.try_get::<Option<f64>, _>("duration_sec")?.unwrap_or(0.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn journal() -> LeaseJournal {
        LeaseJournal::open("sqlite::memory:").await.unwrap()
    }

    fn modules(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn record_and_retrieve() {
        let db = journal().await;
        let id = db
            .append(20, "10.20.0.100", "aa:bb:cc:dd:ee:ff", &modules(&["net_scanner"]), 45.23)
            .await
            .unwrap();
        assert_eq!(id, 1);

        let history = db.history(None, 50).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].vlan_id, 20);
        assert_eq!(history[0].ip, "10.20.0.100");
        assert_eq!(history[0].modules_run, modules(&["net_scanner"]));
        // rounded to 0.1s
        assert_eq!(history[0].duration_sec, 45.2);
    }

    #[tokio::test]
    async fn filter_by_vlan() {
        let db = journal().await;
        db.append(20, "10.20.0.1", "m1", &modules(&["net_scanner"]), 10.0)
            .await
            .unwrap();
        db.append(30, "10.30.0.1", "m2", &modules(&["auth_prober"]), 20.0)
            .await
            .unwrap();
        db.append(20, "10.20.0.2", "m3", &modules(&["dns_noise"]), 15.0)
            .await
            .unwrap();

        let vlan20 = db.history(Some(20), 50).await.unwrap();
        assert_eq!(vlan20.len(), 2);
        assert!(vlan20.iter().all(|r| r.vlan_id == 20));

        let vlan30 = db.history(Some(30), 50).await.unwrap();
        assert_eq!(vlan30.len(), 1);
    }

    #[tokio::test]
    async fn immediate_duplicate_looks_at_last_record_only() {
        let db = journal().await;
        db.append(20, "10.20.0.100", "m", &modules(&["m"]), 10.0)
            .await
            .unwrap();
        assert!(db.is_immediate_duplicate(20, "10.20.0.100").await.unwrap());
        assert!(!db.is_immediate_duplicate(20, "10.20.0.200").await.unwrap());
        assert!(!db.is_immediate_duplicate(30, "10.20.0.100").await.unwrap());

        // a newer lease with a different ip un-flags the older one
        db.append(20, "10.20.0.200", "m", &modules(&["m"]), 10.0)
            .await
            .unwrap();
        assert!(!db.is_immediate_duplicate(20, "10.20.0.100").await.unwrap());
        assert!(db.is_immediate_duplicate(20, "10.20.0.200").await.unwrap());
    }

    #[tokio::test]
    async fn clear_reports_count() {
        let db = journal().await;
        db.append(20, "10.20.0.1", "m", &modules(&["m"]), 1.0)
            .await
            .unwrap();
        db.append(20, "10.20.0.2", "m", &modules(&["m"]), 1.0)
            .await
            .unwrap();
        assert_eq!(db.clear().await.unwrap(), 2);
        assert!(db.history(None, 50).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn history_is_most_recent_first_and_limited() {
        let db = journal().await;
        for i in 0..10 {
            db.append(20, &format!("10.20.0.{i}"), "m", &modules(&["m"]), 1.0)
                .await
                .unwrap();
        }
        let last5 = db.history(None, 5).await.unwrap();
        assert_eq!(last5.len(), 5);
        assert_eq!(last5[0].ip, "10.20.0.9");
    }
}
