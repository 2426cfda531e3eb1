//! Analytics Module
//!
//! 季節分解・異常検知のバッチ計算

pub mod anomaly;
pub mod decomposition;

pub use anomaly::{Anomaly, AnomalyConfig, AnomalyDetector, AnomalyDirection, AnomalyScan};
pub use decomposition::{Decomposition, DecompositionConfig, SeasonalBucket, SeasonalDecomposer};
