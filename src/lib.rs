//! # predictive-telemetry
//!
//! Predictive-analytics telemetry core for waste-collection operations.
//!
//! This crate stores time-stamped operational metrics, decomposes them into
//! trend and seasonal components, flags statistical anomalies, records model
//! predictions with their later outcomes, and summarizes model health per period.
//! Storage is injected through async traits with in-memory and SQLite backends.

pub mod analytics;
pub mod calendar;
pub mod catalog;
pub mod config;
pub mod error;
pub mod jobs;
pub mod ledger;
pub mod logging;
pub mod metrics;
pub mod performance;
pub mod storage;

pub use analytics::{AnomalyDetector, SeasonalDecomposer};
pub use calendar::{HolidayCalendar, Period, SeasonalityTags};
pub use catalog::FeatureCatalog;
pub use config::TelemetryConfig;
pub use error::{Error, Result};
pub use jobs::BatchRunner;
pub use ledger::PredictionLedger;
pub use metrics::MetricStore;
pub use performance::PerformanceTracker;
pub use storage::{MemoryStorage, SqliteStorage};
