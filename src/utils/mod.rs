pub mod encoding;
pub mod error;
pub mod logger;
pub mod metrics;
pub mod net;
pub mod store;

pub use error::{Result, SyncError};
pub use logger::setup_logging;
pub use metrics::MetricsCollector;
