//! Feature Catalog
//!
//! 予測モデルが使用する特徴量の定義・品質・統計を管理する

pub mod registry;
pub mod types;

pub use registry::{FeatureCatalog, DEFAULT_HISTORY_RETENTION};
pub use types::*;
