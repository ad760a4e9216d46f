use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A normalised feed item, ready for the dual-write into archive and current.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    /// Stable identity: the item's GUID, falling back to its link.
    pub guid: String,
    pub title: String,
    pub link: String,
    pub published: DateTime<Utc>,
    /// Sanitised item body.
    pub content: String,
    /// Sanitised item summary.
    pub summary: String,
    pub author: Option<String>,
    pub categories: Vec<String>,
    pub entry_updated: DateTime<Utc>,
    pub feed_url: String,
    pub feed_title: Option<String>,
    pub feed_description: Option<String>,
    pub feed_language: Option<String>,
    pub feed_updated: Option<DateTime<Utc>>,
}

/// A vulnerability record destined for the cve_enriched relation. The payload
/// is stored verbatim; the scalar columns are derived from it at ingest time.
#[derive(Debug, Clone)]
pub struct EnrichedRecord {
    pub cve_id: String,
    pub payload: serde_json::Value,
    pub cvss_base: Option<f64>,
    pub epss_score: Option<f64>,
    pub modified: DateTime<Utc>,
}

/// One row of a daily EPSS snapshot, bound for the bulk-copy channel.
#[derive(Debug, Clone)]
pub struct EpssDailyRow {
    pub cve_id: String,
    pub epss: f64,
    pub percentile: f64,
    pub raw: serde_json::Value,
}
