//! Background Services Module
//!
//! Provides long-running services that keep materialized tiers fresh
//! without anyone querying them.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐  tick   ┌──────────────────┐  jobs   ┌──────────────────┐
//! │ ServiceManager  │───────▶│  RefreshService  │───────▶│ RefreshWorkerPool│
//! └─────────────────┘         └──────────────────┘         └──────────────────┘
//!         │ shutdown broadcast          │ stale (metric, entity) pairs
//!         ▼                             ▼
//!   graceful stop              StalenessTracker
//! ```
//!
//! # Example
//!
//! ```rust
//! use vitals_rollup::services::{ServiceConfig, ServiceManager};
//!
//! let manager = ServiceManager::new(ServiceConfig::default());
//! assert!(manager.status().is_empty());
//! ```

pub mod framework;
pub mod refresher;

pub use framework::{Service, ServiceConfig, ServiceError, ServiceManager, ServiceStatus};
pub use refresher::{CycleSummary, RefreshService};
