use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::KevConfig;
use crate::error::{IngestError, Result};
use crate::store::{self, Store, SOURCE_KEV};
use crate::supervisor::Collector;
use crate::types::EnrichedRecord;

const DEFAULT_URL: &str =
    "https://www.cisa.gov/sites/default/files/feeds/known_exploited_vulnerabilities.json";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KevCatalog {
    #[serde(default)]
    catalog_version: String,
    #[serde(default)]
    date_released: String,
    #[serde(default)]
    count: u32,
    #[serde(default)]
    vulnerabilities: Vec<serde_json::Value>,
}

/// Synchronises the known-exploited catalog: one whole-catalog fetch per
/// cycle, gated on the catalog's release cursor. Every row in one cycle
/// shares the catalog release timestamp as its modified time, so consumers
/// can reason about catalog generations.
pub struct KevCollector {
    store: Arc<Store>,
    client: Client,
    cfg: KevConfig,
    url: String,
}

impl KevCollector {
    pub fn new(store: Arc<Store>, cfg: KevConfig) -> Self {
        let client = Client::builder()
            .user_agent(crate::feeds::USER_AGENT)
            .timeout(Duration::from_secs(60))
            .gzip(true)
            .build()
            .expect("failed to create HTTP client");

        let url = cfg.url.clone().unwrap_or_else(|| DEFAULT_URL.to_string());

        Self {
            store,
            client,
            cfg,
            url,
        }
    }

    async fn fetch_catalog(&self) -> Result<KevCatalog> {
        info!(url = %self.url, "fetching catalog");
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::Status(status));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl Collector for KevCollector {
    fn name(&self) -> &'static str {
        "kev"
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.cfg.poll_interval_secs)
    }

    async fn run_cycle(&self) -> Result<()> {
        let catalog = self.fetch_catalog().await?;

        let cursor = release_cursor(&catalog);
        let existing =
            store::with_retries("get_cursor", || self.store.get_cursor(SOURCE_KEV)).await?;

        if existing.as_deref() == Some(cursor.as_str()) {
            info!(cursor = %cursor, "catalog up to date");
            return Ok(());
        }

        info!(
            version = %catalog.catalog_version,
            released = %catalog.date_released,
            count = catalog.count,
            vulnerabilities = catalog.vulnerabilities.len(),
            "new catalog generation"
        );

        let modified = DateTime::parse_from_rfc3339(&catalog.date_released)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        let records: Vec<EnrichedRecord> = catalog
            .vulnerabilities
            .iter()
            .filter_map(|vuln| {
                let cve_id = match vuln.get("cveID").and_then(serde_json::Value::as_str) {
                    Some(id) if !id.is_empty() => id.to_string(),
                    _ => {
                        warn!("dropping catalog entry without cveID");
                        return None;
                    }
                };
                Some(EnrichedRecord {
                    cve_id,
                    payload: vuln.clone(),
                    cvss_base: None,
                    epss_score: None,
                    modified,
                })
            })
            .collect();

        store::with_retries("upsert_enriched", || {
            self.store.upsert_enriched(SOURCE_KEV, &records)
        })
        .await?;

        store::with_retries("set_cursor", || self.store.set_cursor(SOURCE_KEV, &cursor))
            .await?;

        info!(count = records.len(), cursor = %cursor, "catalog ingested");
        Ok(())
    }
}

/// The catalog's release timestamp, normalised to RFC 3339 where parseable;
/// falls back to the version string, compared by plain equality.
fn release_cursor(catalog: &KevCatalog) -> String {
    let raw = if catalog.date_released.is_empty() {
        catalog.catalog_version.as_str()
    } else {
        catalog.date_released.as_str()
    };

    match DateTime::parse_from_rfc3339(raw) {
        Ok(t) => t
            .with_timezone(&Utc)
            .to_rfc3339_opts(SecondsFormat::Secs, true),
        Err(_) => raw.to_string(),
    }
}
