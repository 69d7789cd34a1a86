//! SQLite-backed prospect store and append-only event ledger.
//!
//! Writes that belong to one delivery (merge, ledger append, status
//! application) run against a caller-owned transaction so the unit commits
//! or rolls back as a whole; reads go straight through the pool.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lwt_core::{
    transition_for, Event, LeadFields, Prospect, ProspectStatus, Stamp, StatusTransition,
    EVENT_CONNECTION_ACCEPTED,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "lwt-storage";

pub const DEFAULT_DATABASE_URL: &str = "sqlite://prospects.db";

/// SQLite serializes writers; this is how long a connection waits for the
/// lock before the attempt surfaces as a retryable conflict.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS prospects (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        linkedin_url TEXT NOT NULL UNIQUE,
        first_name TEXT,
        last_name TEXT,
        company TEXT,
        title TEXT,
        email TEXT,
        heyreach_lead_id TEXT,
        status TEXT NOT NULL DEFAULT 'qualified',
        connection_sent_at TEXT,
        connection_accepted_at TEXT,
        blacklisted INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_prospects_status ON prospects (status)",
    "CREATE INDEX IF NOT EXISTS idx_prospects_heyreach_lead_id ON prospects (heyreach_lead_id)",
    "CREATE INDEX IF NOT EXISTS idx_prospects_linkedin_url ON prospects (linkedin_url)",
    "CREATE TABLE IF NOT EXISTS events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        prospect_id INTEGER REFERENCES prospects (id),
        event_type TEXT NOT NULL,
        heyreach_lead_id TEXT,
        raw_payload TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_events_event_type ON events (event_type)",
    "CREATE INDEX IF NOT EXISTS idx_events_prospect_id ON events (prospect_id)",
    "CREATE INDEX IF NOT EXISTS idx_events_created_at ON events (created_at)",
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("prospect {0} not found")]
    NotFound(i64),
    #[error("concurrent write conflict, safe to retry")]
    Conflict(#[source] sqlx::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if is_busy(&err) {
            StoreError::Conflict(err)
        } else {
            StoreError::Database(err)
        }
    }
}

fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            matches!(db.code().as_deref(), Some("5" | "6" | "261" | "517"))
                || db.message().contains("database is locked")
        }
        _ => false,
    }
}

/// Handle on the ledger database. Cheap to clone; constructed once by the
/// process entry point and passed into every component that needs it.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(BUSY_TIMEOUT)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Private in-memory database with the schema applied. A single pooled
    /// connection keeps every caller on the same database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub async fn init_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("database schema ready");
        Ok(())
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, StoreError> {
        Ok(self.pool.begin().await?)
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn list_prospects(
        &self,
        status: Option<ProspectStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Prospect>, i64), StoreError> {
        let (total, rows) = match status {
            Some(status) => {
                let total: i64 =
                    sqlx::query("SELECT COUNT(*) AS n FROM prospects WHERE status = ?1")
                        .bind(status.as_str())
                        .fetch_one(&self.pool)
                        .await?
                        .try_get("n")?;
                let rows = sqlx::query(
                    "SELECT * FROM prospects WHERE status = ?1
                     ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3",
                )
                .bind(status.as_str())
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?;
                (total, rows)
            }
            None => {
                let total: i64 = sqlx::query("SELECT COUNT(*) AS n FROM prospects")
                    .fetch_one(&self.pool)
                    .await?
                    .try_get("n")?;
                let rows = sqlx::query(
                    "SELECT * FROM prospects ORDER BY created_at DESC, id DESC LIMIT ?1 OFFSET ?2",
                )
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?;
                (total, rows)
            }
        };
        let prospects = rows
            .iter()
            .map(prospect_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((prospects, total))
    }

    pub async fn get_prospect(&self, id: i64) -> Result<Prospect, StoreError> {
        let row = sqlx::query("SELECT * FROM prospects WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => prospect_from_row(&row),
            None => Err(StoreError::NotFound(id)),
        }
    }

    /// Read-only status lookup used by backfill dry runs.
    pub async fn prospect_status_by_url(
        &self,
        linkedin_url: &str,
    ) -> Result<Option<(i64, ProspectStatus)>, StoreError> {
        let row = sqlx::query("SELECT id, status FROM prospects WHERE linkedin_url = ?1")
            .bind(linkedin_url)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            let id: i64 = row.try_get("id")?;
            let status: String = row.try_get("status")?;
            let status = ProspectStatus::parse(&status)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown prospect status {status:?}")))?;
            Ok((id, status))
        })
        .transpose()
    }

    /// All events for one prospect, oldest first.
    pub async fn events_for_prospect(&self, prospect_id: i64) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM events WHERE prospect_id = ?1 ORDER BY created_at ASC, id ASC",
        )
        .bind(prospect_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    pub async fn list_events(
        &self,
        event_type: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Event>, i64), StoreError> {
        let (total, rows) = match event_type {
            Some(event_type) => {
                let total: i64 =
                    sqlx::query("SELECT COUNT(*) AS n FROM events WHERE event_type = ?1")
                        .bind(event_type)
                        .fetch_one(&self.pool)
                        .await?
                        .try_get("n")?;
                let rows = sqlx::query(
                    "SELECT * FROM events WHERE event_type = ?1
                     ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3",
                )
                .bind(event_type)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?;
                (total, rows)
            }
            None => {
                let total: i64 = sqlx::query("SELECT COUNT(*) AS n FROM events")
                    .fetch_one(&self.pool)
                    .await?
                    .try_get("n")?;
                let rows = sqlx::query(
                    "SELECT * FROM events ORDER BY created_at DESC, id DESC LIMIT ?1 OFFSET ?2",
                )
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?;
                (total, rows)
            }
        };
        let events = rows.iter().map(event_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok((events, total))
    }

    pub async fn stats(&self) -> Result<LedgerStats, StoreError> {
        let total_prospects: i64 = sqlx::query("SELECT COUNT(*) AS n FROM prospects")
            .fetch_one(&self.pool)
            .await?
            .try_get("n")?;
        let total_events: i64 = sqlx::query("SELECT COUNT(*) AS n FROM events")
            .fetch_one(&self.pool)
            .await?
            .try_get("n")?;

        let mut by_status: BTreeMap<String, i64> = ProspectStatus::ALL
            .iter()
            .map(|status| (status.as_str().to_string(), 0))
            .collect();
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM prospects GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("n")?;
            by_status.insert(status, count);
        }

        let connected = by_status
            .get(ProspectStatus::Connected.as_str())
            .copied()
            .unwrap_or(0);
        let sent_or_connected = connected
            + by_status
                .get(ProspectStatus::ConnectionSent.as_str())
                .copied()
                .unwrap_or(0);
        let acceptance_rate = if sent_or_connected > 0 {
            connected as f64 / sent_or_connected as f64
        } else {
            0.0
        };

        let last_event_at = sqlx::query(
            "SELECT created_at FROM events ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?
        .map(|row| row.try_get::<DateTime<Utc>, _>("created_at"))
        .transpose()?;

        Ok(LedgerStats {
            total_prospects,
            by_status,
            total_events,
            acceptance_rate,
            last_event_at,
        })
    }
}

/// Aggregate projection over the whole ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerStats {
    pub total_prospects: i64,
    pub by_status: BTreeMap<String, i64>,
    pub total_events: i64,
    pub acceptance_rate: f64,
    pub last_event_at: Option<DateTime<Utc>>,
}

/// What to do when a prospect is already `connected` and the incoming
/// signal is itself a connected-equivalent re-observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReobservationPolicy {
    /// Skip without writing anything (backfill channel).
    Skip,
    /// Merge and record as usual (live webhook channel keeps its audit trail).
    Record,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
    /// Prospect already `connected`; nothing was written.
    AlreadySatisfied,
}

pub async fn find_prospect_by_url(
    conn: &mut SqliteConnection,
    linkedin_url: &str,
) -> Result<Option<Prospect>, StoreError> {
    let row = sqlx::query("SELECT * FROM prospects WHERE linkedin_url = ?1")
        .bind(linkedin_url)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(prospect_from_row).transpose()
}

/// Get-or-create-or-merge by external profile key. At most one write.
pub async fn upsert_prospect(
    conn: &mut SqliteConnection,
    linkedin_url: &str,
    fields: &LeadFields,
    event_type: &str,
    policy: ReobservationPolicy,
) -> Result<(Prospect, UpsertOutcome), StoreError> {
    match find_prospect_by_url(&mut *conn, linkedin_url).await? {
        None => {
            let now = Utc::now();
            let result = sqlx::query(
                "INSERT INTO prospects
                    (linkedin_url, first_name, last_name, company, title, email,
                     heyreach_lead_id, status, blacklisted, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?10)",
            )
            .bind(linkedin_url)
            .bind(fields.first_name.as_deref())
            .bind(fields.last_name.as_deref())
            .bind(fields.company.as_deref())
            .bind(fields.title.as_deref())
            .bind(fields.email.as_deref())
            .bind(fields.heyreach_lead_id.as_deref())
            .bind(ProspectStatus::Qualified.as_str())
            .bind(now)
            .bind(now)
            .execute(&mut *conn)
            .await?;
            let prospect = Prospect {
                id: result.last_insert_rowid(),
                linkedin_url: linkedin_url.to_string(),
                first_name: fields.first_name.clone(),
                last_name: fields.last_name.clone(),
                company: fields.company.clone(),
                title: fields.title.clone(),
                email: fields.email.clone(),
                heyreach_lead_id: fields.heyreach_lead_id.clone(),
                status: ProspectStatus::Qualified,
                connection_sent_at: None,
                connection_accepted_at: None,
                blacklisted: false,
                created_at: now,
                updated_at: now,
            };
            info!(linkedin_url, id = prospect.id, "created new prospect");
            Ok((prospect, UpsertOutcome::Created))
        }
        Some(mut prospect) => {
            if policy == ReobservationPolicy::Skip
                && prospect.status == ProspectStatus::Connected
                && event_type == EVENT_CONNECTION_ACCEPTED
            {
                debug!(linkedin_url, "prospect already connected, skipping re-observation");
                return Ok((prospect, UpsertOutcome::AlreadySatisfied));
            }
            if prospect.merge_fields(fields) {
                prospect.updated_at = Utc::now();
                sqlx::query(
                    "UPDATE prospects SET first_name = ?1, last_name = ?2, company = ?3,
                        title = ?4, email = ?5, heyreach_lead_id = ?6, updated_at = ?7
                     WHERE id = ?8",
                )
                .bind(prospect.first_name.as_deref())
                .bind(prospect.last_name.as_deref())
                .bind(prospect.company.as_deref())
                .bind(prospect.title.as_deref())
                .bind(prospect.email.as_deref())
                .bind(prospect.heyreach_lead_id.as_deref())
                .bind(prospect.updated_at)
                .bind(prospect.id)
                .execute(&mut *conn)
                .await?;
                info!(linkedin_url, id = prospect.id, "updated prospect fields");
                Ok((prospect, UpsertOutcome::Updated))
            } else {
                Ok((prospect, UpsertOutcome::Unchanged))
            }
        }
    }
}

/// Append one ledger row. No uniqueness constraint: duplicate deliveries
/// produce duplicate rows by design, the ledger is an audit trail.
pub async fn append_event(
    conn: &mut SqliteConnection,
    prospect_id: Option<i64>,
    event_type: &str,
    heyreach_lead_id: Option<&str>,
    raw_payload: &str,
) -> Result<Event, StoreError> {
    let now = Utc::now();
    let result = sqlx::query(
        "INSERT INTO events (prospect_id, event_type, heyreach_lead_id, raw_payload, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )
    .bind(prospect_id)
    .bind(event_type)
    .bind(heyreach_lead_id)
    .bind(raw_payload)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    debug!(event_type, ?prospect_id, "appended event");
    Ok(Event {
        id: result.last_insert_rowid(),
        prospect_id,
        event_type: event_type.to_string(),
        heyreach_lead_id: heyreach_lead_id.map(str::to_string),
        raw_payload: Some(raw_payload.to_string()),
        created_at: now,
    })
}

/// Apply the status transition table for one incoming event, stamping the
/// matching timestamp column. Returns whether the status changed.
pub async fn apply_status(
    conn: &mut SqliteConnection,
    prospect: &mut Prospect,
    event_type: &str,
) -> Result<bool, StoreError> {
    match transition_for(prospect.status, event_type) {
        StatusTransition::Unchanged => Ok(false),
        StatusTransition::To { status, stamp } => {
            let now = Utc::now();
            match stamp {
                Stamp::ConnectionSent => prospect.connection_sent_at = Some(now),
                Stamp::ConnectionAccepted => prospect.connection_accepted_at = Some(now),
            }
            prospect.status = status;
            prospect.updated_at = now;
            sqlx::query(
                "UPDATE prospects SET status = ?1, connection_sent_at = ?2,
                    connection_accepted_at = ?3, updated_at = ?4
                 WHERE id = ?5",
            )
            .bind(prospect.status.as_str())
            .bind(prospect.connection_sent_at)
            .bind(prospect.connection_accepted_at)
            .bind(prospect.updated_at)
            .bind(prospect.id)
            .execute(&mut *conn)
            .await?;
            info!(id = prospect.id, status = %prospect.status, "updated prospect status");
            Ok(true)
        }
    }
}

fn prospect_from_row(row: &SqliteRow) -> Result<Prospect, StoreError> {
    let status: String = row.try_get("status")?;
    let status = ProspectStatus::parse(&status)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown prospect status {status:?}")))?;
    Ok(Prospect {
        id: row.try_get("id")?,
        linkedin_url: row.try_get("linkedin_url")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        company: row.try_get("company")?,
        title: row.try_get("title")?,
        email: row.try_get("email")?,
        heyreach_lead_id: row.try_get("heyreach_lead_id")?,
        status,
        connection_sent_at: row.try_get("connection_sent_at")?,
        connection_accepted_at: row.try_get("connection_accepted_at")?,
        blacklisted: row.try_get("blacklisted")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn event_from_row(row: &SqliteRow) -> Result<Event, StoreError> {
    Ok(Event {
        id: row.try_get("id")?,
        prospect_id: row.try_get("prospect_id")?,
        event_type: row.try_get("event_type")?,
        heyreach_lead_id: row.try_get("heyreach_lead_id")?,
        raw_payload: row.try_get("raw_payload")?,
        created_at: row.try_get("created_at")?,
    })
}
