//! Metric Store
//!
//! ディメンション付き・時刻付きの運用メトリクス観測

pub mod query;
pub mod store;
pub mod types;

pub use query::{SeriesCursor, SeriesFilter, SeriesQuery, TimeRange, DEFAULT_PAGE_SIZE, DEFAULT_ROW_CAP};
pub use store::MetricStore;
pub use types::*;
