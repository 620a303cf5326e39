pub mod artifactory;
pub mod config;
pub mod error;
pub mod executor;
pub mod log_redact;
pub mod manifest;
pub mod pipeline;
pub mod planner;
pub mod release;
pub mod storage;
pub mod workspace;

pub use error::{Error, Result};
