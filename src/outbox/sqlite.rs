//! SQLite outbox store.
//!
//! Timestamps are stored as fixed-width RFC 3339 text (microseconds, `Z`),
//! so lexical order is chronological order. `published` is an INTEGER 0/1.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sea_query::{
    Alias, ColumnDef, Cond, Expr, Func, Iden, Index, OnConflict, Order, Query, SimpleExpr,
    SqliteQueryBuilder, Table,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use super::{OutboxError, OutboxEvent, OutboxStats, OutboxStore, Result};
use crate::clock::{saturating_sub, system_clock, Clock};

/// Outbox table schema.
#[derive(Iden)]
enum OutboxEvents {
    Table,
    #[iden = "event_id"]
    EventId,
    #[iden = "event_type"]
    EventType,
    #[iden = "aggregate_id"]
    AggregateId,
    #[iden = "aggregate_type"]
    AggregateType,
    #[iden = "event_version"]
    EventVersion,
    #[iden = "occurred_at"]
    OccurredAt,
    #[iden = "payload"]
    Payload,
    #[iden = "published"]
    Published,
    #[iden = "processed_at"]
    ProcessedAt,
    #[iden = "attempts"]
    Attempts,
    #[iden = "last_attempt_at"]
    LastAttemptAt,
    #[iden = "error_message"]
    ErrorMessage,
}

const COLUMNS: [OutboxEvents; 12] = [
    OutboxEvents::EventId,
    OutboxEvents::EventType,
    OutboxEvents::AggregateId,
    OutboxEvents::AggregateType,
    OutboxEvents::EventVersion,
    OutboxEvents::OccurredAt,
    OutboxEvents::Payload,
    OutboxEvents::Published,
    OutboxEvents::ProcessedAt,
    OutboxEvents::Attempts,
    OutboxEvents::LastAttemptAt,
    OutboxEvents::ErrorMessage,
];

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(event_id: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| OutboxError::CorruptRow {
            event_id: event_id.to_string(),
            reason: format!("bad timestamp '{}': {}", value, e),
        })
}

fn row_to_event(row: &SqliteRow) -> Result<OutboxEvent> {
    let event_id: String = row.try_get("event_id")?;
    let corrupt = |reason: String| OutboxError::CorruptRow {
        event_id: event_id.clone(),
        reason,
    };

    let payload: String = row.try_get("payload")?;
    let occurred_at: String = row.try_get("occurred_at")?;
    let processed_at: Option<String> = row.try_get("processed_at")?;
    let last_attempt_at: Option<String> = row.try_get("last_attempt_at")?;
    let published: i64 = row.try_get("published")?;
    let attempts: i64 = row.try_get("attempts")?;
    let event_version: i64 = row.try_get("event_version")?;

    Ok(OutboxEvent {
        event_id: Uuid::parse_str(&event_id).map_err(|e| corrupt(e.to_string()))?,
        event_type: row.try_get("event_type")?,
        aggregate_id: row.try_get("aggregate_id")?,
        aggregate_type: row.try_get("aggregate_type")?,
        event_version: u32::try_from(event_version).map_err(|e| corrupt(e.to_string()))?,
        occurred_at: parse_ts(&event_id, &occurred_at)?,
        payload: serde_json::from_str(&payload).map_err(|e| corrupt(e.to_string()))?,
        published: published != 0,
        processed_at: processed_at
            .map(|at| parse_ts(&event_id, &at))
            .transpose()?,
        attempts: u32::try_from(attempts).map_err(|e| corrupt(e.to_string()))?,
        last_attempt_at: last_attempt_at
            .map(|at| parse_ts(&event_id, &at))
            .transpose()?,
        error_message: row.try_get("error_message")?,
    })
}

/// Outbox store backed by SQLite.
pub struct SqliteOutboxStore {
    pool: SqlitePool,
    max_attempts: u32,
    clock: Arc<dyn Clock>,
}

impl SqliteOutboxStore {
    pub fn new(pool: SqlitePool, max_attempts: u32) -> Self {
        Self::with_clock(pool, max_attempts, system_clock())
    }

    pub fn with_clock(pool: SqlitePool, max_attempts: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            max_attempts,
            clock,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the outbox table and its indexes.
    pub async fn init(&self) -> Result<()> {
        let create_table = Table::create()
            .table(OutboxEvents::Table)
            .if_not_exists()
            .col(ColumnDef::new(OutboxEvents::EventId).text().primary_key())
            .col(ColumnDef::new(OutboxEvents::EventType).text().not_null())
            .col(ColumnDef::new(OutboxEvents::AggregateId).text().not_null())
            .col(ColumnDef::new(OutboxEvents::AggregateType).text().not_null())
            .col(
                ColumnDef::new(OutboxEvents::EventVersion)
                    .integer()
                    .not_null()
                    .default(1),
            )
            .col(ColumnDef::new(OutboxEvents::OccurredAt).text().not_null())
            .col(ColumnDef::new(OutboxEvents::Payload).text().not_null())
            .col(
                ColumnDef::new(OutboxEvents::Published)
                    .integer()
                    .not_null()
                    .default(0),
            )
            .col(ColumnDef::new(OutboxEvents::ProcessedAt).text())
            .col(
                ColumnDef::new(OutboxEvents::Attempts)
                    .integer()
                    .not_null()
                    .default(0),
            )
            .col(ColumnDef::new(OutboxEvents::LastAttemptAt).text())
            .col(ColumnDef::new(OutboxEvents::ErrorMessage).text())
            .to_string(SqliteQueryBuilder);

        sqlx::query(&create_table).execute(&self.pool).await?;

        let indexes = [
            Index::create()
                .if_not_exists()
                .name("idx_outbox_published")
                .table(OutboxEvents::Table)
                .col(OutboxEvents::Published)
                .to_string(SqliteQueryBuilder),
            Index::create()
                .if_not_exists()
                .name("idx_outbox_occurred_at")
                .table(OutboxEvents::Table)
                .col(OutboxEvents::OccurredAt)
                .to_string(SqliteQueryBuilder),
            Index::create()
                .if_not_exists()
                .name("idx_outbox_aggregate_id")
                .table(OutboxEvents::Table)
                .col(OutboxEvents::AggregateId)
                .to_string(SqliteQueryBuilder),
            Index::create()
                .if_not_exists()
                .name("idx_outbox_event_type")
                .table(OutboxEvents::Table)
                .col(OutboxEvents::EventType)
                .to_string(SqliteQueryBuilder),
            Index::create()
                .if_not_exists()
                .name("idx_outbox_attempts_published")
                .table(OutboxEvents::Table)
                .col(OutboxEvents::Attempts)
                .col(OutboxEvents::Published)
                .to_string(SqliteQueryBuilder),
        ];
        for index in &indexes {
            sqlx::query(index).execute(&self.pool).await?;
        }

        info!("Outbox table initialized (SQLite)");
        Ok(())
    }

    /// Insert rows on an open connection, inside whatever transaction the
    /// caller holds. Duplicate event ids are skipped.
    pub async fn insert_rows(conn: &mut SqliteConnection, events: &[OutboxEvent]) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }

        // The statement holds `Rc` idents; render it before awaiting.
        let sql = {
            let mut insert = Query::insert();
            insert
                .into_table(OutboxEvents::Table)
                .columns(COLUMNS)
                .on_conflict(OnConflict::column(OutboxEvents::EventId).do_nothing().to_owned());

            for event in events {
                insert
                    .values([
                        event.event_id.to_string().into(),
                        event.event_type.clone().into(),
                        event.aggregate_id.clone().into(),
                        event.aggregate_type.clone().into(),
                        i64::from(event.event_version).into(),
                        ts(event.occurred_at).into(),
                        event.payload.to_string().into(),
                        i64::from(event.published).into(),
                        event.processed_at.map(ts).into(),
                        i64::from(event.attempts).into(),
                        event.last_attempt_at.map(ts).into(),
                        event.error_message.clone().into(),
                    ])
                    .map_err(|e| OutboxError::Database(e.to_string()))?;
            }
            insert.to_string(SqliteQueryBuilder)
        };
        let result = sqlx::query(&sql).execute(&mut *conn).await?;

        let inserted = result.rows_affected() as usize;
        if inserted < events.len() {
            debug!(
                staged = events.len(),
                inserted,
                "Duplicate outbox rows ignored"
            );
        }
        Ok(inserted)
    }

    async fn fetch(&self, sql: &str) -> Result<Vec<OutboxEvent>> {
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_event).collect()
    }

    fn count_sql(condition: SimpleExpr) -> String {
        Query::select()
            .expr_as(Func::count(Expr::col(OutboxEvents::EventId)), Alias::new("count"))
            .from(OutboxEvents::Table)
            .and_where(condition)
            .to_string(SqliteQueryBuilder)
    }

    async fn count(&self, sql: &str) -> Result<u64> {
        let row = sqlx::query(sql).fetch_one(&self.pool).await?;
        let count: i64 = row.try_get("count")?;
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl OutboxStore for SqliteOutboxStore {
    async fn save_many(&self, events: &[OutboxEvent]) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }

        // BEGIN IMMEDIATE takes the write lock upfront.
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        match Self::insert_rows(&mut *conn, events).await {
            Ok(inserted) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(inserted)
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }

    async fn find_unpublished(&self, limit: usize) -> Result<Vec<OutboxEvent>> {
        let query = Query::select()
            .columns(COLUMNS)
            .from(OutboxEvents::Table)
            .and_where(Expr::col(OutboxEvents::Published).eq(0))
            .and_where(Expr::col(OutboxEvents::Attempts).lt(i64::from(self.max_attempts)))
            .order_by(OutboxEvents::OccurredAt, Order::Asc)
            .limit(limit as u64)
            .to_string(SqliteQueryBuilder);

        self.fetch(&query).await
    }

    async fn find_failed_events(
        &self,
        max_attempts: u32,
        cooldown: chrono::Duration,
    ) -> Result<Vec<OutboxEvent>> {
        let cutoff = ts(saturating_sub(self.clock.now(), cooldown));
        let query = Query::select()
            .columns(COLUMNS)
            .from(OutboxEvents::Table)
            .cond_where(
                Cond::all()
                    .add(Expr::col(OutboxEvents::Published).eq(0))
                    .add(Expr::col(OutboxEvents::Attempts).gte(i64::from(max_attempts)))
                    .add(
                        Cond::any()
                            .add(Expr::col(OutboxEvents::LastAttemptAt).is_null())
                            .add(Expr::col(OutboxEvents::LastAttemptAt).lt(cutoff)),
                    ),
            )
            .order_by(OutboxEvents::OccurredAt, Order::Asc)
            .to_string(SqliteQueryBuilder);

        self.fetch(&query).await
    }

    async fn mark_as_published(&self, event_id: Uuid) -> Result<()> {
        let now = ts(self.clock.now());
        let update = Query::update()
            .table(OutboxEvents::Table)
            .value(OutboxEvents::Published, 1)
            .value(
                OutboxEvents::ProcessedAt,
                Func::coalesce([
                    Expr::col(OutboxEvents::ProcessedAt).into(),
                    Expr::val(now).into(),
                ]),
            )
            .and_where(Expr::col(OutboxEvents::EventId).eq(event_id.to_string()))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&update).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(OutboxError::NotFound(event_id));
        }
        Ok(())
    }

    async fn increment_attempts(&self, event_id: Uuid, error: &str) -> Result<()> {
        let now = ts(self.clock.now());
        let update = Query::update()
            .table(OutboxEvents::Table)
            .value(
                OutboxEvents::Attempts,
                Expr::col(OutboxEvents::Attempts).add(1),
            )
            .value(OutboxEvents::LastAttemptAt, now)
            .value(OutboxEvents::ErrorMessage, error)
            .and_where(Expr::col(OutboxEvents::EventId).eq(event_id.to_string()))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&update).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(OutboxError::NotFound(event_id));
        }
        Ok(())
    }

    async fn delete_published_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let delete = Query::delete()
            .from_table(OutboxEvents::Table)
            .and_where(Expr::col(OutboxEvents::Published).eq(1))
            .and_where(Expr::col(OutboxEvents::ProcessedAt).lt(ts(cutoff)))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&delete).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn get(&self, event_id: Uuid) -> Result<Option<OutboxEvent>> {
        let query = Query::select()
            .columns(COLUMNS)
            .from(OutboxEvents::Table)
            .and_where(Expr::col(OutboxEvents::EventId).eq(event_id.to_string()))
            .to_string(SqliteQueryBuilder);

        Ok(self.fetch(&query).await?.into_iter().next())
    }

    async fn stats(&self) -> Result<OutboxStats> {
        let max_attempts = i64::from(self.max_attempts);
        let pending_sql = Self::count_sql(
            Expr::col(OutboxEvents::Published)
                .eq(0)
                .and(Expr::col(OutboxEvents::Attempts).lt(max_attempts)),
        );
        let published_sql = Self::count_sql(Expr::col(OutboxEvents::Published).eq(1));
        let failed_sql = Self::count_sql(
            Expr::col(OutboxEvents::Published)
                .eq(0)
                .and(Expr::col(OutboxEvents::Attempts).gte(max_attempts)),
        );

        let pending = self.count(&pending_sql).await?;
        let published = self.count(&published_sql).await?;
        let failed = self.count(&failed_sql).await?;

        let oldest = Query::select()
            .column(OutboxEvents::OccurredAt)
            .from(OutboxEvents::Table)
            .and_where(Expr::col(OutboxEvents::Published).eq(0))
            .and_where(Expr::col(OutboxEvents::Attempts).lt(max_attempts))
            .order_by(OutboxEvents::OccurredAt, Order::Asc)
            .limit(1)
            .to_string(SqliteQueryBuilder);
        let oldest_pending_at = match sqlx::query(&oldest).fetch_optional(&self.pool).await? {
            Some(row) => {
                let at: String = row.try_get("occurred_at")?;
                Some(parse_ts("-", &at)?)
            }
            None => None,
        };

        Ok(OutboxStats {
            pending,
            published,
            failed,
            oldest_pending_at,
        })
    }
}
