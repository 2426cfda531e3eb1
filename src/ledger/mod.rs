//! Prediction Ledger
//!
//! 予測（入力特徴量・点推定・信頼区間）と後着の実績を記録する

pub mod store;
pub mod types;

pub use store::{PredictionLedger, ReconcileReport};
pub use types::*;
