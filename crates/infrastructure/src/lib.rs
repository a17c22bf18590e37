pub mod database;
pub mod observability;
pub mod process;
pub mod worker_client;

pub use database::*;
pub use observability::*;
pub use process::LocalProcessManager;
pub use worker_client::HttpWorkerClient;
