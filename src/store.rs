use std::future::Future;
use std::time::Duration;

use chrono::{Datelike, NaiveDate, Utc};
use sqlx::postgres::{PgPool, PgPoolCopyExt, PgPoolOptions};
use tracing::{debug, info, warn};

use crate::error::{IngestError, Result};
use crate::types::{Article, EnrichedRecord, EpssDailyRow};

/// Cursor key for the vulnerability-database collector.
pub const SOURCE_NVD: &str = "NVD";
/// Cursor key for the known-exploited-catalog collector.
pub const SOURCE_KEV: &str = "CISA-KEV";

const MAX_CONNECTIONS: u32 = 25;
const MIN_CONNECTIONS: u32 = 2;
const CONN_MAX_LIFETIME: Duration = Duration::from_secs(60 * 60);
const CONN_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

const STORE_RETRY_ATTEMPTS: u32 = 3;

/// Owns the connection pool and every write primitive the collectors use.
/// All primitives are safe to retry: each either deduplicates by key or runs
/// inside a single transaction.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Open a bounded pool and verify it with a round-trip before handing it
    /// out. Pool-init failure is fatal at start-up.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .min_connections(MIN_CONNECTIONS)
            .max_lifetime(CONN_MAX_LIFETIME)
            .idle_timeout(CONN_IDLE_TIMEOUT)
            .connect(database_url)
            .await?;

        sqlx::query("SELECT 1").execute(&pool).await?;
        info!("database pool ready");

        Ok(Self { pool })
    }

    /// Wrap an existing pool. Used by tests that manage their own pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending migrations in version order. Running twice is a no-op.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("migrations up to date");
        Ok(())
    }

    /// Dual-write an article: append to archive (first observation wins) and
    /// upsert current (latest observation wins), atomically.
    pub async fn insert_article(&self, article: &Article) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO archive (
                guid, title, link, published, content, summary, author, categories,
                entry_updated, feed_url, feed_title, feed_description, feed_language,
                feed_updated, inserted_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, NOW())
            ON CONFLICT (guid) DO NOTHING
            "#,
        )
        .bind(&article.guid)
        .bind(&article.title)
        .bind(&article.link)
        .bind(article.published)
        .bind(&article.content)
        .bind(&article.summary)
        .bind(&article.author)
        .bind(&article.categories)
        .bind(article.entry_updated)
        .bind(&article.feed_url)
        .bind(&article.feed_title)
        .bind(&article.feed_description)
        .bind(&article.feed_language)
        .bind(article.feed_updated)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO current (
                guid, title, link, published, content, summary, author, categories,
                entry_updated, feed_url, feed_title, feed_description, feed_language,
                feed_updated, inserted_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, NOW())
            ON CONFLICT (guid) DO UPDATE SET
                title = EXCLUDED.title,
                link = EXCLUDED.link,
                published = EXCLUDED.published,
                content = EXCLUDED.content,
                summary = EXCLUDED.summary,
                author = EXCLUDED.author,
                categories = EXCLUDED.categories,
                entry_updated = EXCLUDED.entry_updated,
                feed_url = EXCLUDED.feed_url,
                feed_title = EXCLUDED.feed_title,
                feed_description = EXCLUDED.feed_description,
                feed_language = EXCLUDED.feed_language,
                feed_updated = EXCLUDED.feed_updated
            "#,
        )
        .bind(&article.guid)
        .bind(&article.title)
        .bind(&article.link)
        .bind(article.published)
        .bind(&article.content)
        .bind(&article.summary)
        .bind(&article.author)
        .bind(&article.categories)
        .bind(article.entry_updated)
        .bind(&article.feed_url)
        .bind(&article.feed_title)
        .bind(&article.feed_description)
        .bind(&article.feed_language)
        .bind(article.feed_updated)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Upsert a batch of vulnerability records for one source. All records
    /// succeed together or the whole batch fails, reporting the offending
    /// index.
    pub async fn upsert_enriched(&self, source: &str, records: &[EnrichedRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for (index, record) in records.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO cve_enriched (cve_id, source, json, cvss_base, epss_score, modified)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (cve_id, source)
                DO UPDATE SET
                    json = EXCLUDED.json,
                    cvss_base = EXCLUDED.cvss_base,
                    epss_score = EXCLUDED.epss_score,
                    modified = EXCLUDED.modified
                "#,
            )
            .bind(&record.cve_id)
            .bind(source)
            .bind(&record.payload)
            .bind(record.cvss_base)
            .bind(record.epss_score)
            .bind(record.modified)
            .execute(&mut *tx)
            .await
            .map_err(|source| IngestError::BatchFailed { index, source })?;
        }

        tx.commit().await?;
        debug!(count = records.len(), source, "upserted enriched batch");
        Ok(())
    }

    /// Idempotence gate for the daily EPSS snapshot: any row for the date
    /// means the date has been ingested.
    pub async fn epss_date_ingested(&self, as_of: NaiveDate) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM epss_daily WHERE as_of = $1)")
                .bind(as_of)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    /// Create (idempotently) the monthly partition covering `as_of`.
    pub async fn ensure_epss_partition(&self, as_of: NaiveDate) -> Result<()> {
        let bounds = EpssPartition::for_date(as_of);
        let stmt = format!(
            "CREATE TABLE IF NOT EXISTS {} PARTITION OF epss_daily FOR VALUES FROM ('{}') TO ('{}')",
            bounds.name, bounds.from, bounds.to,
        );
        sqlx::query(&stmt).execute(&self.pool).await?;
        debug!(partition = %bounds.name, "partition ensured");
        Ok(())
    }

    /// Stream EPSS rows into the partitioned relation over the COPY channel.
    /// Ordinary inserts would not sustain a full daily snapshot.
    pub async fn copy_epss_rows(&self, as_of: NaiveDate, rows: &[EpssDailyRow]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let inserted_at = Utc::now().to_rfc3339();
        let mut buf = String::with_capacity(rows.len() * 128);
        for row in rows {
            let raw = serde_json::to_string(&row.raw)?;
            buf.push_str(&csv_field(&as_of.to_string()));
            buf.push(',');
            buf.push_str(&csv_field(&row.cve_id));
            buf.push(',');
            buf.push_str(&row.epss.to_string());
            buf.push(',');
            buf.push_str(&row.percentile.to_string());
            buf.push(',');
            buf.push_str(&csv_field(&raw));
            buf.push(',');
            buf.push_str(&csv_field(&inserted_at));
            buf.push('\n');
        }

        let mut sink = self
            .pool
            .copy_in_raw(
                "COPY epss_daily (as_of, cve_id, epss, percentile, raw, inserted_at) \
                 FROM STDIN WITH (FORMAT csv)",
            )
            .await?;
        sink.send(buf.as_bytes()).await?;
        let copied = sink.finish().await?;
        Ok(copied)
    }

    /// Read the last-committed cursor for a source, if any.
    pub async fn get_cursor(&self, source: &str) -> Result<Option<String>> {
        let cursor: Option<String> =
            sqlx::query_scalar("SELECT cursor FROM ingest_state WHERE source = $1")
                .bind(source)
                .fetch_optional(&self.pool)
                .await?;
        Ok(cursor)
    }

    /// Persist a new cursor for a source. Called only after the corresponding
    /// window or catalog generation is durably written.
    pub async fn set_cursor(&self, source: &str, cursor: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ingest_state (source, cursor, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (source)
            DO UPDATE SET cursor = EXCLUDED.cursor, updated_at = NOW()
            "#,
        )
        .bind(source)
        .bind(cursor)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Run a store operation, retrying transient failures with a short linear
/// backoff. Three consecutive failures abandon the operation.
pub async fn with_retries<T, F, Fut>(op: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 1;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < STORE_RETRY_ATTEMPTS => {
                warn!(op, attempt, error = %err, "transient store failure, retrying");
                tokio::time::sleep(Duration::from_millis(500 * u64::from(attempt))).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Name and bounds of the monthly partition covering a date.
#[derive(Debug, PartialEq, Eq)]
pub struct EpssPartition {
    pub name: String,
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl EpssPartition {
    pub fn for_date(as_of: NaiveDate) -> Self {
        let from = as_of
            .with_day(1)
            .expect("first of month is always a valid date");
        let to = if from.month() == 12 {
            NaiveDate::from_ymd_opt(from.year() + 1, 1, 1)
        } else {
            NaiveDate::from_ymd_opt(from.year(), from.month() + 1, 1)
        }
        .expect("first of next month is always a valid date");
        let name = format!("epss_daily_y{}m{:02}", from.year(), from.month());
        Self { name, from, to }
    }
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
