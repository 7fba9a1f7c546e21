pub mod cache;
pub mod common;
pub mod creds;
pub mod dispatch;
pub mod executor;
pub mod metrics;
pub mod notify;
pub mod queue;
pub mod resources;
pub mod storage;

pub use common::error::RunnerError;

pub type Result<T> = std::result::Result<T, RunnerError>;

pub const RUNNER_VERSION: &str = env!("CARGO_PKG_VERSION");
