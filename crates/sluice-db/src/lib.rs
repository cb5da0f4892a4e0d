pub mod config;
pub mod database;
pub mod metrics_store;
pub mod queue;

pub use config::DatabaseConfig;
pub use database::Database;
pub use metrics_store::PgMetricsStore;
pub use queue::PgQueue;
