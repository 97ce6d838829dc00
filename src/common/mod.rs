//! Common utilities and types shared across minibulk

pub mod config;
pub mod error;
pub mod metrics;

pub use config::{Config, RouterConfig, ShardConfig};
pub use error::{Error, ErrorCode, Result, StaleInfo, Status};
pub use metrics::{Counter, Gauge, Histogram, RouterStats};
