use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::config::EpssConfig;
use crate::error::{IngestError, Result};
use crate::store::{self, Store};
use crate::supervisor::Collector;
use crate::types::EpssDailyRow;

const DEFAULT_URL: &str = "https://api.first.org/data/v1/epss";

const PAGE_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Deserialize)]
struct EpssResponse {
    #[serde(default)]
    total: u64,
    #[serde(default)]
    data: Vec<serde_json::Value>,
}

/// Ingests one full daily EPSS snapshot (~300k scored records) into the
/// range-partitioned relation. The presence of any row for the snapshot date
/// gates re-ingestion; the partition for the containing month is created on
/// demand.
pub struct EpssCollector {
    store: Arc<Store>,
    client: Client,
    cfg: EpssConfig,
    url: String,
}

impl EpssCollector {
    pub fn new(store: Arc<Store>, cfg: EpssConfig) -> Self {
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

    async fn fetch_page(&self, offset: u64) -> Result<EpssResponse> {
        let url = format!(
            "{}?limit={}&offset={}",
            self.url, self.cfg.page_size, offset
        );
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::Status(status));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl Collector for EpssCollector {
    fn name(&self) -> &'static str {
        "epss"
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.cfg.poll_interval_secs)
    }

    async fn run_cycle(&self) -> Result<()> {
        let first = self.fetch_page(0).await?;

        let Some(first_row) = first.data.first() else {
            info!("no data returned");
            return Ok(());
        };

        // Every row of one dump shares the same as-of date.
        let as_of = row_date(first_row).ok_or_else(|| {
            IngestError::Parse("first row has no parseable date".to_string())
        })?;

        let ingested =
            store::with_retries("epss_date_ingested", || self.store.epss_date_ingested(as_of))
                .await?;
        if ingested {
            info!(%as_of, "snapshot already ingested, skipping");
            return Ok(());
        }

        store::with_retries("ensure_epss_partition", || {
            self.store.ensure_epss_partition(as_of)
        })
        .await?;

        let total = first.total;
        let mut offset: u64 = 0;

        let rows = parse_rows(&first.data);
        store::with_retries("copy_epss_rows", || self.store.copy_epss_rows(as_of, &rows))
            .await?;
        offset += first.data.len() as u64;
        info!(offset, total, "ingested batch");

        while offset < total {
            let page = match self.fetch_page(offset).await {
                Ok(page) => page,
                Err(err) => {
                    // The snapshot stays partial; the existence gate treats
                    // the date as done on the next run.
                    error!(offset, error = %err, "failed to fetch page, abandoning snapshot");
                    break;
                }
            };

            if page.data.is_empty() {
                break;
            }

            let rows = parse_rows(&page.data);
            store::with_retries("copy_epss_rows", || self.store.copy_epss_rows(as_of, &rows))
                .await?;

            offset += page.data.len() as u64;
            info!(offset, total, "ingested batch");

            tokio::time::sleep(PAGE_DELAY).await;
        }

        info!(%as_of, total, "snapshot complete");
        Ok(())
    }
}

fn row_date(row: &serde_json::Value) -> Option<NaiveDate> {
    let raw = row.get("date")?.as_str()?;
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
}

/// Parse upstream rows (all-string fields) into typed rows, keeping the raw
/// row alongside. Malformed rows are dropped with a log line.
fn parse_rows(data: &[serde_json::Value]) -> Vec<EpssDailyRow> {
    data.iter()
        .filter_map(|row| match parse_row(row) {
            Some(parsed) => Some(parsed),
            None => {
                warn!(row = %row, "dropping malformed row");
                None
            }
        })
        .collect()
}

fn parse_row(row: &serde_json::Value) -> Option<EpssDailyRow> {
    let cve_id = row.get("cve")?.as_str()?.to_string();
    if cve_id.is_empty() {
        return None;
    }
    let epss: f64 = row.get("epss")?.as_str()?.parse().ok()?;
    let percentile: f64 = row.get("percentile")?.as_str()?.parse().ok()?;

    Some(EpssDailyRow {
        cve_id,
        epss,
        percentile,
        raw: row.clone(),
    })
}
