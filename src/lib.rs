//! Library crate for lan-monitor-rs: pooled monitoring streams with
//! incremental probe and scan aggregation.
pub mod config;
pub mod controller;
pub mod error;
pub mod frames;
pub mod jobs;
pub mod logging;
pub mod pool;
pub mod ports;
pub mod probe;
pub mod scan;
pub mod socket;
pub mod targets;
pub mod types;

pub use config::{MonitorConfig, ProbeConfig, ScanConfig, ScanType};
pub use controller::{ProbeController, ScanController};
pub use error::MonitorError;
pub use pool::ConnectionPool;
