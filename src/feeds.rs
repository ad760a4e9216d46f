use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feed_rs::model::{Entry, Feed};
use futures::stream::{self, StreamExt};
use reqwest::Client;
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, FeedConfig};
use crate::error::{IngestError, Result};
use crate::sanitize::Sanitizer;
use crate::store::{self, Store};
use crate::supervisor::Collector;
use crate::types::Article;

pub const USER_AGENT: &str = "vulnwatch/0.1 (+https://github.com/vulnwatch/vulnwatch)";

/// Feeds fetched concurrently within one cycle.
const FEED_CONCURRENCY: usize = 3;
const FEED_TIMEOUT: Duration = Duration::from_secs(30);

/// Fetches every configured syndicated feed, sanitises each item, and
/// dual-writes it into archive and current. Keeps no cursor: idempotence
/// comes from the GUID-keyed writes.
pub struct FeedCollector {
    store: Arc<Store>,
    client: Client,
    sanitizer: Sanitizer,
    feeds: Vec<FeedConfig>,
    poll_interval: Duration,
    max_feed_bytes: usize,
}

/// Feed-level provenance attached to every item of one fetch.
struct FeedProvenance {
    url: String,
    title: Option<String>,
    description: Option<String>,
    language: Option<String>,
    updated: Option<DateTime<Utc>>,
}

impl FeedCollector {
    pub fn new(store: Arc<Store>, cfg: &AppConfig) -> Self {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(FEED_TIMEOUT)
            .gzip(true)
            .build()
            .expect("failed to create HTTP client");

        Self {
            store,
            client,
            sanitizer: Sanitizer::ugc(),
            feeds: cfg.feeds.clone(),
            poll_interval: Duration::from_secs(cfg.ingest_interval_secs),
            max_feed_bytes: cfg.max_feed_bytes,
        }
    }

    async fn fetch_feed(&self, feed_cfg: &FeedConfig) -> Result<Feed> {
        debug!(feed = %feed_cfg.name, url = %feed_cfg.url, "fetching feed");

        let response = self.client.get(&feed_cfg.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::Status(status));
        }

        if let Some(length) = response.content_length() {
            if length as usize > self.max_feed_bytes {
                return Err(IngestError::Parse(format!(
                    "feed exceeds size cap: {} bytes",
                    length
                )));
            }
        }

        let body = response.bytes().await?;
        if body.len() > self.max_feed_bytes {
            return Err(IngestError::Parse(format!(
                "feed exceeds size cap: {} bytes",
                body.len()
            )));
        }

        feed_rs::parser::parse(&body[..])
            .map_err(|err| IngestError::Parse(format!("failed to parse feed: {err}")))
    }

    /// Normalise one entry into an Article, or reject it.
    fn build_article(&self, feed_cfg: &FeedConfig, prov: &FeedProvenance, entry: Entry) -> Result<Article> {
        let link = entry
            .links
            .first()
            .map(|l| l.href.clone())
            .unwrap_or_default();

        // Stable identity: GUID, else link. Items with neither are rejected.
        let guid = if !entry.id.is_empty() {
            entry.id.clone()
        } else if !link.is_empty() {
            link.clone()
        } else {
            return Err(IngestError::InvalidRecord(
                "item has no guid and no link".to_string(),
            ));
        };

        let published = entry
            .published
            .or(entry.updated)
            .unwrap_or_else(Utc::now);
        let entry_updated = entry.updated.unwrap_or(published);

        let summary = self.sanitizer.clean(
            entry
                .summary
                .as_ref()
                .map(|s| s.content.as_str())
                .unwrap_or_default(),
        );

        let mut content = self.sanitizer.clean(
            entry
                .content
                .as_ref()
                .and_then(|c| c.body.as_deref())
                .unwrap_or_default(),
        );
        if content.is_empty() {
            content = summary.clone();
        }

        let author = entry.authors.first().map(|a| a.name.clone());

        let mut categories: Vec<String> =
            entry.categories.into_iter().map(|c| c.term).collect();
        categories.extend(feed_cfg.tags.iter().cloned());

        Ok(Article {
            guid,
            title: entry.title.map(|t| t.content).unwrap_or_default(),
            link,
            published,
            content,
            summary,
            author,
            categories,
            entry_updated,
            feed_url: feed_cfg.url.clone(),
            feed_title: prov.title.clone(),
            feed_description: prov.description.clone(),
            feed_language: prov.language.clone(),
            feed_updated: prov.updated,
        })
    }

    /// Fetch, parse and store one feed. Item failures are logged and skipped;
    /// only feed-level failures bubble up.
    async fn process_feed(&self, feed_cfg: &FeedConfig) -> Result<usize> {
        let feed = self.fetch_feed(feed_cfg).await?;

        let prov = FeedProvenance {
            url: feed_cfg.url.clone(),
            title: feed.title.map(|t| t.content),
            description: feed.description.map(|d| d.content),
            language: feed.language,
            updated: feed.updated,
        };

        info!(
            feed = %feed_cfg.name,
            url = %prov.url,
            items = feed.entries.len(),
            "fetched feed"
        );

        let mut stored = 0;
        for entry in feed.entries {
            let entry_id = entry.id.clone();
            let article = match self.build_article(feed_cfg, &prov, entry) {
                Ok(article) => article,
                Err(err) => {
                    warn!(feed = %feed_cfg.name, entry = %entry_id, error = %err, "dropping item");
                    continue;
                }
            };

            match store::with_retries("insert_article", || self.store.insert_article(&article))
                .await
            {
                Ok(()) => stored += 1,
                Err(err) => {
                    error!(feed = %feed_cfg.name, guid = %article.guid, error = %err, "failed to store item");
                }
            }
        }

        Ok(stored)
    }
}

#[async_trait]
impl Collector for FeedCollector {
    fn name(&self) -> &'static str {
        "feeds"
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// One cycle: every enabled feed, fetched in parallel under a bounded
    /// fan-out. A per-feed failure never aborts the cycle for other feeds.
    async fn run_cycle(&self) -> Result<()> {
        let enabled_feeds: Vec<&FeedConfig> =
            self.feeds.iter().filter(|f: &&FeedConfig| f.enabled).collect();
        let results: Vec<(&FeedConfig, Result<usize>)> =
            stream::iter(0..enabled_feeds.len())
                .map(|i: usize| {
                    let feed_cfg = enabled_feeds[i];
                    async move { (feed_cfg, self.process_feed(feed_cfg).await) }
                })
                .buffer_unordered(FEED_CONCURRENCY)
                .collect()
                .await;

        let mut total = 0;
        for (feed_cfg, result) in results {
            match result {
                Ok(count) => {
                    debug!(feed = %feed_cfg.name, count, "processed feed");
                    total += count;
                }
                Err(err) => {
                    error!(feed = %feed_cfg.name, error = %err, "failed to process feed");
                }
            }
        }

        info!(total, "feed cycle complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn collector() -> FeedCollector {
        // The store is only touched on the write path; these tests stop at
        // normalisation, so a lazy (never-connected) pool is fine.
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect_lazy("postgres://localhost/unused")
            .expect("lazy pool");
        FeedCollector {
            store: Arc::new(Store::from_pool(pool)),
            client: Client::new(),
            sanitizer: Sanitizer::ugc(),
            feeds: vec![feed_cfg()],
            poll_interval: Duration::from_secs(3600),
            max_feed_bytes: 1024 * 1024,
        }
    }

    fn feed_cfg() -> FeedConfig {
        FeedConfig {
            name: "test".to_string(),
            url: "https://example.com/feed.xml".to_string(),
            feed_type: None,
            tags: vec!["security".to_string()],
            enabled: true,
        }
    }

    fn provenance() -> FeedProvenance {
        FeedProvenance {
            url: "https://example.com/feed.xml".to_string(),
            title: Some("Example".to_string()),
            description: None,
            language: Some("en".to_string()),
            updated: None,
        }
    }

    fn parse_single_item(item_xml: &str) -> Entry {
        let doc = format!(
            "<rss version=\"2.0\"><channel><title>t</title>{item_xml}</channel></rss>"
        );
        let feed = feed_rs::parser::parse(doc.as_bytes()).expect("feed should parse");
        feed.entries.into_iter().next().expect("one entry")
    }

    #[tokio::test]
    async fn identity_prefers_guid_over_link() {
        let c = collector();
        let entry = parse_single_item(
            "<item><guid>guid-1</guid><link>https://x/a</link><title>T</title></item>",
        );
        let article = c.build_article(&feed_cfg(), &provenance(), entry).unwrap();
        assert_eq!(article.guid, "guid-1");
        assert_eq!(article.link, "https://x/a");
        assert_eq!(article.title, "T");
    }

    #[tokio::test]
    async fn identity_falls_back_to_link() {
        let c = collector();
        let mut entry =
            parse_single_item("<item><link>https://x/a</link><title>T</title></item>");
        // The parser may synthesise an id for guid-less items; force the
        // fallback path.
        entry.id = String::new();
        let article = c.build_article(&feed_cfg(), &provenance(), entry).unwrap();
        assert_eq!(article.guid, "https://x/a");
    }

    #[tokio::test]
    async fn item_without_identity_is_rejected() {
        let c = collector();
        let mut entry = parse_single_item("<item><title>T</title></item>");
        // Some parsers synthesise an id from content; force the no-identity case.
        entry.id = String::new();
        entry.links.clear();
        assert!(c.build_article(&feed_cfg(), &provenance(), entry).is_err());
    }

    #[tokio::test]
    async fn body_is_sanitised_and_tags_are_appended() {
        let c = collector();
        let entry = parse_single_item(
            "<item><guid>g1</guid><link>https://x/a</link><title>T</title>\
             <description>&lt;p&gt;hi&lt;/p&gt;&lt;script&gt;x&lt;/script&gt;</description></item>",
        );
        let article = c.build_article(&feed_cfg(), &provenance(), entry).unwrap();
        assert_eq!(article.summary, "<p>hi</p>");
        // Content falls back to the sanitised summary when the entry has no body.
        assert_eq!(article.content, "<p>hi</p>");
        assert!(article.categories.contains(&"security".to_string()));
    }

    #[tokio::test]
    async fn published_is_parsed_from_pubdate() {
        let c = collector();
        let entry = parse_single_item(
            "<item><guid>g1</guid><title>T</title>\
             <pubDate>Mon, 08 Jan 2024 12:00:00 +0000</pubDate></item>",
        );
        let article = c.build_article(&feed_cfg(), &provenance(), entry).unwrap();
        assert_eq!(
            article.published,
            Utc.with_ymd_and_hms(2024, 1, 8, 12, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn published_falls_back_to_now_when_absent() {
        let c = collector();
        let before = Utc::now();
        let entry = parse_single_item("<item><guid>g2</guid><title>T</title></item>");
        let article = c.build_article(&feed_cfg(), &provenance(), entry).unwrap();
        assert!(article.published >= before);
    }
}
