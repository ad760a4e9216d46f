mod common;

use std::sync::Arc;

use sqlx::Row;
use vulnwatch::config::{AppConfig, FeedConfig};
use vulnwatch::feeds::FeedCollector;
use vulnwatch::{Collector, Store};

const GUID: &str = "vulnwatch-test-feed-g1";

fn feed_doc(title: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Mock Security Feed</title>
    <description>Advisories for testing</description>
    <item>
      <guid>{GUID}</guid>
      <title>{title}</title>
      <link>https://x/a</link>
      <pubDate>Mon, 08 Jan 2024 12:00:00 +0000</pubDate>
      <description>&lt;p&gt;hi&lt;/p&gt;&lt;script&gt;x&lt;/script&gt;</description>
    </item>
  </channel>
</rss>"#
    )
}

fn config_for(store_url: &str, feed_url: String) -> AppConfig {
    AppConfig {
        database_url: store_url.to_string(),
        server_bind: "127.0.0.1:0".to_string(),
        ingest_interval_secs: 3600,
        max_feed_bytes: 10 * 1024 * 1024,
        feeds: vec![FeedConfig {
            name: "mock".to_string(),
            url: feed_url,
            feed_type: None,
            tags: vec![],
            enabled: true,
        }],
        nvd: Default::default(),
        kev: Default::default(),
        epss: Default::default(),
    }
}

async fn clear_article(store: &Store) {
    for table in ["archive", "current"] {
        sqlx::query(&format!("DELETE FROM {table} WHERE guid = $1"))
            .bind(GUID)
            .execute(store.pool())
            .await
            .expect("cleanup failed");
    }
}

#[tokio::test]
async fn feed_dual_write_is_idempotent_and_tracks_mutations() -> anyhow::Result<()> {
    let Some(store) = common::test_store().await else {
        return Ok(());
    };
    let store = Arc::new(store);
    clear_article(&store).await;

    let body = common::shared_body(&feed_doc("T1"));
    let base = common::serve_document(body.clone()).await;

    let cfg = config_for(&std::env::var("DATABASE_URL")?, format!("{base}/feed.xml"));
    let collector = FeedCollector::new(store.clone(), &cfg);

    // Cycle 1: one archive row, one current row, body sanitised.
    collector.run_cycle().await?;

    let archive = sqlx::query("SELECT title, content, summary FROM archive WHERE guid = $1")
        .bind(GUID)
        .fetch_all(store.pool())
        .await?;
    assert_eq!(archive.len(), 1);
    assert_eq!(archive[0].get::<String, _>("title"), "T1");
    assert_eq!(archive[0].get::<String, _>("content"), "<p>hi</p>");

    let current = sqlx::query("SELECT title, content FROM current WHERE guid = $1")
        .bind(GUID)
        .fetch_all(store.pool())
        .await?;
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].get::<String, _>("title"), "T1");
    assert_eq!(current[0].get::<String, _>("content"), "<p>hi</p>");

    // Cycle 2, same document: no new archive row, current re-upserted.
    collector.run_cycle().await?;

    let archive_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM archive WHERE guid = $1")
        .bind(GUID)
        .fetch_one(store.pool())
        .await?;
    assert_eq!(archive_count, 1);

    // Cycle 3, mutated title: archive keeps the first observation, current
    // reflects the latest.
    *body.write().await = feed_doc("T2");
    collector.run_cycle().await?;

    let archive_title: String = sqlx::query_scalar("SELECT title FROM archive WHERE guid = $1")
        .bind(GUID)
        .fetch_one(store.pool())
        .await?;
    assert_eq!(archive_title, "T1");

    let current_title: String = sqlx::query_scalar("SELECT title FROM current WHERE guid = $1")
        .bind(GUID)
        .fetch_one(store.pool())
        .await?;
    assert_eq!(current_title, "T2");

    clear_article(&store).await;
    Ok(())
}

#[tokio::test]
async fn unreachable_feed_does_not_fail_the_cycle() -> anyhow::Result<()> {
    let Some(store) = common::test_store().await else {
        return Ok(());
    };
    let store = Arc::new(store);

    // Nothing listens on this port; the cycle must still complete.
    let cfg = config_for(
        &std::env::var("DATABASE_URL")?,
        "http://127.0.0.1:1/feed.xml".to_string(),
    );
    let collector = FeedCollector::new(store, &cfg);
    collector.run_cycle().await?;
    Ok(())
}
