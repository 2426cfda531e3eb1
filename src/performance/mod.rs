//! Performance Tracker
//!
//! モデルごと・期間ごとの精度・ドリフト・健全性スナップショット

pub mod drift;
pub mod tracker;
pub mod types;

pub use drift::{DriftAnalyzer, DriftConfig, DriftInput};
pub use tracker::{ImpactConfig, PerformanceTracker, TrackerConfig};
pub use types::*;
