use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status code: {0}")]
    Status(reqwest::StatusCode),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("record rejected: {0}")]
    InvalidRecord(String),

    #[error("batch failed at index {index}: {source}")]
    BatchFailed {
        index: usize,
        #[source]
        source: sqlx::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, IngestError>;

impl IngestError {
    /// Whether retrying the same operation has a chance of succeeding.
    /// Connection-level failures, deadlocks and serialization conflicts are
    /// transient; constraint violations and malformed input are not.
    pub fn is_transient(&self) -> bool {
        match self {
            IngestError::Database(err) => is_transient_db(err),
            IngestError::BatchFailed { source, .. } => is_transient_db(source),
            _ => false,
        }
    }
}

fn is_transient_db(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => {
            // 40001 = serialization_failure, 40P01 = deadlock_detected,
            // 57P01 = admin_shutdown (connection recycled under us)
            matches!(db.code().as_deref(), Some("40001") | Some("40P01") | Some("57P01"))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_timeout_is_transient() {
        assert!(IngestError::Database(sqlx::Error::PoolTimedOut).is_transient());
    }

    #[test]
    fn parse_error_is_not_transient() {
        assert!(!IngestError::Parse("bad feed".to_string()).is_transient());
    }

    #[test]
    fn row_not_found_is_not_transient() {
        assert!(!IngestError::Database(sqlx::Error::RowNotFound).is_transient());
    }
}
