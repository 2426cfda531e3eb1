//! Storage Abstractions
//!
//! 各コンポーネントの永続化層。コンポーネントは `Arc<dyn ...Storage>` を
//! 受け取り、バックエンド（メモリ / SQLite）を意識しない。

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use crate::calendar::Period;
use crate::catalog::{Feature, FeatureChange, FeatureId, FeatureTransition, StatisticsRecord};
use crate::error::Result;
use crate::ledger::{Outcome, Prediction, PredictionId};
use crate::metrics::{MetricObservation, ObservationId, SeriesCursor, SeriesFilter};
use crate::performance::PerformanceSnapshot;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

/// 条件付き書き込みの結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardedWrite {
    /// 書き込んだ
    Applied,
    /// 対象はあるが条件を満たさなかった
    Rejected,
    /// 対象が存在しない
    Missing,
}

/// 観測の走査方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanOrder {
    /// 古い順
    #[default]
    Ascending,
    /// 新しい順
    Descending,
}

/// 特徴量カタログの永続化
#[async_trait]
pub trait FeatureStorage: Send + Sync + std::fmt::Debug {
    /// 新規登録（同名同バージョンが既にあれば Conflict）
    async fn insert_feature(&self, feature: &Feature) -> Result<()>;
    /// 読み取りから書き込みまでを原子的に変更を適用する（未登録なら None）
    async fn modify_feature(&self, id: FeatureId, change: &FeatureChange) -> Result<Option<FeatureTransition>>;
    async fn get_feature(&self, id: FeatureId) -> Result<Option<Feature>>;
    /// 同名の全バージョン（バージョン昇順）
    async fn feature_versions(&self, name: &str) -> Result<Vec<Feature>>;
    async fn list_features(&self, active_only: bool) -> Result<Vec<Feature>>;
    async fn append_statistics(&self, record: &StatisticsRecord) -> Result<()>;
    /// 統計履歴（記録時刻昇順）
    async fn statistics_history(&self, id: FeatureId) -> Result<Vec<StatisticsRecord>>;
    /// 新しい順に keep 件を残して削除し、削除件数を返す
    async fn prune_statistics(&self, id: FeatureId, keep: usize) -> Result<usize>;
}

/// メトリクス観測の永続化
#[async_trait]
pub trait MetricStorage: Send + Sync + std::fmt::Debug {
    async fn insert_observation(&self, observation: &MetricObservation) -> Result<()>;
    async fn get_observation(&self, id: ObservationId) -> Result<Option<MetricObservation>>;
    /// 保存済みの観測が high 品質でない場合のみ置き換える
    async fn replace_observation_if_revisable(&self, observation: &MetricObservation) -> Result<GuardedWrite>;
    /// (時刻, ID) 順にカーソルより先から最大 limit 件
    ///
    /// Descending ではカーソルより前の行を新しい順に返す。
    async fn fetch_page(
        &self,
        filter: &SeriesFilter,
        after: Option<&SeriesCursor>,
        order: ScanOrder,
        limit: usize,
    ) -> Result<Vec<MetricObservation>>;
    /// cutoff より前の観測を削除し、削除件数を返す
    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// 予測台帳の永続化
#[async_trait]
pub trait PredictionStorage: Send + Sync + std::fmt::Debug {
    async fn insert_prediction(&self, prediction: &Prediction) -> Result<()>;
    async fn get_prediction(&self, id: PredictionId) -> Result<Option<Prediction>>;
    /// 実績が未設定の場合のみ設定する（先勝ち）
    async fn attach_outcome_if_absent(&self, id: PredictionId, outcome: &Outcome) -> Result<GuardedWrite>;
    /// 対象日が期間内の予測（対象日, 予測時刻, ID 順）
    async fn predictions_for_model(&self, model_id: &str, period: &Period) -> Result<Vec<Prediction>>;
    /// 対象日が before より前で実績未着の予測
    async fn pending_outcomes(&self, model_id: &str, before: NaiveDate) -> Result<Vec<Prediction>>;
}

/// 性能スナップショットの永続化
#[async_trait]
pub trait SnapshotStorage: Send + Sync + std::fmt::Debug {
    /// (モデル, 期間) 単位で置き換え
    async fn put_snapshot(&self, snapshot: &PerformanceSnapshot) -> Result<()>;
    async fn get_snapshot(&self, model_id: &str, period: &Period) -> Result<Option<PerformanceSnapshot>>;
    /// 期間終端が最も新しいスナップショット
    async fn latest_snapshot(&self, model_id: &str) -> Result<Option<PerformanceSnapshot>>;
}
