pub mod config;
pub mod epss;
pub mod error;
pub mod feeds;
pub mod kev;
pub mod nvd;
pub mod sanitize;
pub mod server;
pub mod store;
pub mod supervisor;
pub mod types;

pub use config::AppConfig;
pub use error::{IngestError, Result};
pub use store::Store;
pub use supervisor::{Collector, Supervisor};
