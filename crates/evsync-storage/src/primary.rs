//! Primary store: the `events` table keyed by `(source, source_id)`.

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use evsync_core::{format_instant, CanonicalEvent, FingerprintedEvent, TagList};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("creating database directory {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("stored {column} value {value:?} is not an RFC 3339 instant")]
    BadInstant { column: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertReport {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl UpsertReport {
    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Read-side filter over stored events.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub source: Option<String>,
    pub text: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl EventQuery {
    pub const MAX_LIMIT: u32 = 200;
    pub const DEFAULT_LIMIT: u32 = 50;

    fn effective_limit(&self) -> u32 {
        self.limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredEvent {
    pub id: i64,
    #[serde(flatten)]
    pub event: CanonicalEvent,
    pub content_hash: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PrimaryStore {
    pool: SqlitePool,
}

impl PrimaryStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        if let Some(parent) = Path::new(options.get_filename()).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| StoreError::Io {
                        path: parent.display().to_string(),
                        source,
                    })?;
            }
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Single-connection in-memory database; the connection is never recycled
    /// so the data lives as long as the store.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Write every event whose fingerprint differs from the stored one, in a
    /// single transaction. Unchanged rows are not touched at all.
    pub async fn upsert(&self, batch: &[FingerprintedEvent]) -> Result<UpsertReport, StoreError> {
        let mut report = UpsertReport::default();
        if batch.is_empty() {
            return Ok(report);
        }

        let mut tx = self.pool.begin().await?;
        for item in batch {
            let event = item.event();
            let stored: Option<String> = sqlx::query_scalar(
                "SELECT content_hash FROM events WHERE source = ? AND source_id = ?",
            )
            .bind(&event.source)
            .bind(&event.source_id)
            .fetch_optional(&mut *tx)
            .await?;

            match stored.as_deref() {
                Some(hash) if hash == item.content_hash() => {
                    report.unchanged += 1;
                    continue;
                }
                Some(_) => report.updated += 1,
                None => report.inserted += 1,
            }

            sqlx::query(
                r#"
                INSERT INTO events (
                    source, source_id, title, starts_at, ends_at, venue, city, url,
                    image_url, description, price, organizer, tags, content_hash, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (source, source_id) DO UPDATE SET
                    title = excluded.title,
                    starts_at = excluded.starts_at,
                    ends_at = excluded.ends_at,
                    venue = excluded.venue,
                    city = excluded.city,
                    url = excluded.url,
                    image_url = excluded.image_url,
                    description = excluded.description,
                    price = excluded.price,
                    organizer = excluded.organizer,
                    tags = excluded.tags,
                    content_hash = excluded.content_hash,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&event.source)
            .bind(&event.source_id)
            .bind(&event.title)
            .bind(event.starts_at.as_ref().map(format_instant))
            .bind(event.ends_at.as_ref().map(format_instant))
            .bind(&event.venue)
            .bind(&event.city)
            .bind(&event.url)
            .bind(&event.image_url)
            .bind(&event.description)
            .bind(&event.price)
            .bind(&event.organizer)
            .bind(event.tags.to_delimited())
            .bind(item.content_hash())
            .bind(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        info!(
            inserted = report.inserted,
            updated = report.updated,
            unchanged = report.unchanged,
            "primary upsert committed"
        );
        Ok(report)
    }

    /// Delete every row of `source` whose `source_id` is absent from `batch`.
    /// An empty batch deletes every row of the source.
    pub async fn prune(&self, source: &str, batch: &[FingerprintedEvent]) -> Result<u64, StoreError> {
        let keep: HashSet<&str> = batch
            .iter()
            .map(FingerprintedEvent::event)
            .filter(|event| event.source == source)
            .map(|event| event.source_id.as_str())
            .collect();

        let mut tx = self.pool.begin().await?;
        let stored: Vec<String> =
            sqlx::query_scalar("SELECT source_id FROM events WHERE source = ?")
                .bind(source)
                .fetch_all(&mut *tx)
                .await?;

        let mut deleted = 0;
        for source_id in stored.iter().filter(|id| !keep.contains(id.as_str())) {
            deleted += sqlx::query("DELETE FROM events WHERE source = ? AND source_id = ?")
                .bind(source)
                .bind(source_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;

        debug!(source, kept = keep.len(), deleted, "primary prune");
        Ok(deleted)
    }

    pub async fn query(&self, filter: &EventQuery) -> Result<Vec<StoredEvent>, StoreError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, source, source_id, title, starts_at, ends_at, venue, city, url, image_url, \
             description, price, organizer, tags, content_hash, updated_at FROM events WHERE 1 = 1",
        );
        if let Some(from) = &filter.from {
            qb.push(" AND starts_at >= ").push_bind(format_instant(from));
        }
        if let Some(to) = &filter.to {
            qb.push(" AND starts_at <= ").push_bind(format_instant(to));
        }
        if let Some(source) = &filter.source {
            qb.push(" AND source = ").push_bind(source.clone());
        }
        if let Some(text) = filter.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            let pattern = format!("%{}%", text.to_lowercase());
            qb.push(" AND (lower(title) LIKE ")
                .push_bind(pattern.clone())
                .push(" OR lower(coalesce(venue, '')) LIKE ")
                .push_bind(pattern)
                .push(")");
        }
        qb.push(" ORDER BY starts_at IS NULL, starts_at, id LIMIT ")
            .push_bind(i64::from(filter.effective_limit()))
            .push(" OFFSET ")
            .push_bind(i64::from(filter.offset.unwrap_or(0)));

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_stored).collect()
    }

    pub async fn all_events(&self) -> Result<Vec<FingerprintedEvent>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, source, source_id, title, starts_at, ends_at, venue, city, url, image_url, \
             description, price, organizer, tags, content_hash, updated_at FROM events \
             ORDER BY source, source_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row_to_stored(row).map(|stored| FingerprintedEvent::new(stored.event)))
            .collect()
    }

    pub async fn count(&self, source: Option<&str>) -> Result<i64, StoreError> {
        let count = match source {
            Some(source) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE source = ?")
                    .bind(source)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM events")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count)
    }
}

fn parse_instant(column: &'static str, value: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    value
        .map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| StoreError::BadInstant { column, value: raw })
        })
        .transpose()
}

fn row_to_stored(row: &SqliteRow) -> Result<StoredEvent, StoreError> {
    let tags: String = row.try_get("tags")?;
    let event = CanonicalEvent {
        source: row.try_get("source")?,
        source_id: row.try_get("source_id")?,
        title: row.try_get("title")?,
        starts_at: parse_instant("starts_at", row.try_get("starts_at")?)?,
        ends_at: parse_instant("ends_at", row.try_get("ends_at")?)?,
        venue: row.try_get("venue")?,
        city: row.try_get("city")?,
        url: row.try_get("url")?,
        image_url: row.try_get("image_url")?,
        description: row.try_get("description")?,
        price: row.try_get("price")?,
        organizer: row.try_get("organizer")?,
        tags: TagList::parse(&tags),
    };
    let updated_at = parse_instant("updated_at", Some(row.try_get("updated_at")?))?
        .ok_or(StoreError::BadInstant {
            column: "updated_at",
            value: String::new(),
        })?;
    Ok(StoredEvent {
        id: row.try_get("id")?,
        event,
        content_hash: row.try_get("content_hash")?,
        updated_at,
    })
}
