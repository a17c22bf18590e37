pub mod app_config;
pub mod database;
pub mod dispatcher;
pub mod health;
pub mod observability;
pub mod performance;
pub mod pool;

pub use app_config::AppConfig;
pub use database::{DatabaseBackend, DatabaseConfig};
pub use dispatcher::{DispatcherConfig, RetryConfig};
pub use health::HealthConfig;
pub use observability::ObservabilityConfig;
pub use performance::PerformanceConfig;
pub use pool::{LocalProcessConfig, PoolConfig};
