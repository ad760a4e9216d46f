use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::exponential::ExponentialBackoff;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{info, warn};
use url::Url;

use crate::config::NvdConfig;
use crate::error::{IngestError, Result};
use crate::store::{self, Store, SOURCE_NVD};
use crate::supervisor::Collector;
use crate::types::EnrichedRecord;

const DEFAULT_URL: &str = "https://services.nvd.nist.gov/rest/json/cves/2.0";

/// Upstream forbids windows wider than 120 days.
const MAX_WINDOW_DAYS: i64 = 120;

/// Inter-page delay: 5 requests per 30 s rolling window without a key,
/// 50 requests per 30 s with one.
const PAGE_DELAY_UNAUTHENTICATED: Duration = Duration::from_secs(6);
const PAGE_DELAY_AUTHENTICATED: Duration = Duration::from_millis(600);

const RETRY_INITIAL: Duration = Duration::from_secs(6);
const RETRY_MAX: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NvdResponse {
    total_results: u32,
    #[serde(default)]
    vulnerabilities: Vec<NvdItem>,
}

#[derive(Debug, Deserialize)]
struct NvdItem {
    cve: serde_json::Value,
}

/// Walks the vulnerability database forward in published-date windows from
/// the persisted cursor, paginating inside each window and upserting each
/// page as a batch.
pub struct NvdCollector {
    store: Arc<Store>,
    client: Client,
    cfg: NvdConfig,
    base_url: String,
}

impl NvdCollector {
    pub fn new(store: Arc<Store>, cfg: NvdConfig) -> Self {
        let client = Client::builder()
            .user_agent(crate::feeds::USER_AGENT)
            .timeout(Duration::from_secs(60))
            .gzip(true)
            .build()
            .expect("failed to create HTTP client");

        let base_url = cfg
            .url
            .clone()
            .unwrap_or_else(|| DEFAULT_URL.to_string());

        Self {
            store,
            client,
            cfg,
            base_url,
        }
    }

    fn page_delay(&self) -> Duration {
        if self.cfg.api_key.is_some() {
            PAGE_DELAY_AUTHENTICATED
        } else {
            PAGE_DELAY_UNAUTHENTICATED
        }
    }

    fn page_url(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        start_index: u32,
    ) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)?;
        url.query_pairs_mut()
            .append_pair("pubStartDate", &format_window_bound(start))
            .append_pair("pubEndDate", &format_window_bound(end))
            .append_pair("resultsPerPage", &self.cfg.page_size.to_string())
            .append_pair("startIndex", &start_index.to_string());
        Ok(url)
    }

    /// GET one page, retrying quota and availability failures indefinitely
    /// with exponential backoff. Any other non-2xx status fails the cycle.
    async fn fetch_page(&self, url: Url) -> Result<NvdResponse> {
        let mut backoff: ExponentialBackoff<backoff::SystemClock> = ExponentialBackoff {
            current_interval: RETRY_INITIAL,
            initial_interval: RETRY_INITIAL,
            max_interval: RETRY_MAX,
            multiplier: 2.0,
            randomization_factor: 0.0,
            max_elapsed_time: None,
            ..Default::default()
        };

        loop {
            let mut request = self.client.get(url.clone());
            if let Some(key) = &self.cfg.api_key {
                request = request.header("apiKey", key);
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    return Ok(response.json().await?);
                }
                Ok(response)
                    if response.status() == StatusCode::TOO_MANY_REQUESTS
                        || response.status() == StatusCode::SERVICE_UNAVAILABLE =>
                {
                    let delay = backoff.next_backoff().unwrap_or(RETRY_MAX);
                    warn!(
                        status = response.status().as_u16(),
                        delay_secs = delay.as_secs(),
                        "rate limited or unavailable, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Ok(response) => return Err(IngestError::Status(response.status())),
                Err(err) => {
                    let delay = backoff.next_backoff().unwrap_or(RETRY_MAX);
                    warn!(error = %err, delay_secs = delay.as_secs(), "fetch failed, backing off");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Ingest one window completely: paginate by start index until the
    /// envelope says we have everything.
    async fn process_window(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<()> {
        let mut start_index: u32 = 0;

        loop {
            let url = self.page_url(start, end, start_index)?;
            let page = self.fetch_page(url).await?;

            if page.vulnerabilities.is_empty() {
                break;
            }

            let count = page.vulnerabilities.len();
            let records: Vec<EnrichedRecord> = page
                .vulnerabilities
                .into_iter()
                .filter_map(|item| match build_record(item.cve) {
                    Ok(record) => Some(record),
                    Err(err) => {
                        warn!(error = %err, "dropping record");
                        None
                    }
                })
                .collect();

            store::with_retries("upsert_enriched", || {
                self.store.upsert_enriched(SOURCE_NVD, &records)
            })
            .await?;

            info!(
                start_index,
                count,
                total_in_window = page.total_results,
                "processed page"
            );

            start_index += count as u32;
            if start_index >= page.total_results {
                break;
            }

            tokio::time::sleep(self.page_delay()).await;
        }

        Ok(())
    }
}

#[async_trait]
impl Collector for NvdCollector {
    fn name(&self) -> &'static str {
        "nvd"
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.cfg.poll_interval_secs)
    }

    async fn run_cycle(&self) -> Result<()> {
        let cursor = store::with_retries("get_cursor", || self.store.get_cursor(SOURCE_NVD))
            .await?;

        let mut start = match cursor.as_deref() {
            Some(raw) => parse_cursor(raw).unwrap_or_else(|| {
                warn!(cursor = raw, "invalid cursor, resetting to start of history");
                initial_cursor()
            }),
            None => initial_cursor(),
        };

        let now = Utc::now();

        while start < now {
            let end = window_end(start, now);
            info!(start = %start, end = %end, "processing window");

            self.process_window(start, end).await?;

            let cursor = end.to_rfc3339_opts(SecondsFormat::Secs, true);
            store::with_retries("set_cursor", || self.store.set_cursor(SOURCE_NVD, &cursor))
                .await?;

            start = end;
        }

        info!("ingestion up to date");
        Ok(())
    }
}

fn initial_cursor() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0)
        .single()
        .expect("epoch of recorded history is a valid timestamp")
}

fn parse_cursor(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Window end: 120 days past the start, clipped to now.
fn window_end(start: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    let end = start + chrono::Duration::days(MAX_WINDOW_DAYS);
    if end > now {
        now
    } else {
        end
    }
}

fn format_window_bound(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn build_record(cve: serde_json::Value) -> Result<EnrichedRecord> {
    let cve_id = cve
        .get("id")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| IngestError::InvalidRecord("record has no id".to_string()))?
        .to_string();

    let modified = cve
        .get("lastModified")
        .and_then(serde_json::Value::as_str)
        .and_then(parse_nvd_timestamp)
        .unwrap_or_else(Utc::now);

    let cvss_base = extract_cvss_base(&cve);

    Ok(EnrichedRecord {
        cve_id,
        payload: cve,
        cvss_base,
        epss_score: None,
        modified,
    })
}

/// Upstream timestamps come with or without an offset; treat bare ones as UTC.
fn parse_nvd_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|t| t.and_utc())
}

/// Base severity score, preferring the v3.1 metric block over v3.0.
fn extract_cvss_base(cve: &serde_json::Value) -> Option<f64> {
    let metrics = cve.get("metrics")?;
    for key in ["cvssMetricV31", "cvssMetricV30"] {
        let score = metrics
            .get(key)
            .and_then(|m| m.get(0))
            .and_then(|m| m.get("cvssData"))
            .and_then(|d| d.get("baseScore"))
            .and_then(serde_json::Value::as_f64);
        if score.is_some() {
            return score;
        }
    }
    None
}
