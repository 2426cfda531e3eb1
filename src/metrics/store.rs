//! Metric Store
//!
//! 追記型の観測ストア。書き込み時に季節性タグを導出し、行単位で独立に永続化する。

use super::query::{SeriesFilter, SeriesQuery, TimeRange, DEFAULT_PAGE_SIZE, DEFAULT_ROW_CAP};
use super::types::{
    AggregationLevel, DimensionKeys, MetricObservation, MetricType, NewObservation, ObservationId,
    QualityTier,
};
use crate::calendar::HolidayCalendar;
use crate::error::{Error, Result};
use crate::storage::{GuardedWrite, MetricStorage};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

/// メトリクスストア
#[derive(Clone)]
pub struct MetricStore {
    storage: Arc<dyn MetricStorage>,
    calendar: Arc<HolidayCalendar>,
    page_size: usize,
    row_cap: usize,
}

impl MetricStore {
    pub fn new(storage: Arc<dyn MetricStorage>, calendar: HolidayCalendar) -> Self {
        Self {
            storage,
            calendar: Arc::new(calendar),
            page_size: DEFAULT_PAGE_SIZE,
            row_cap: DEFAULT_ROW_CAP,
        }
    }

    /// ページサイズと行数上限を設定
    pub fn with_limits(mut self, page_size: usize, row_cap: usize) -> Self {
        self.page_size = page_size.max(1);
        self.row_cap = row_cap;
        self
    }

    pub fn calendar(&self) -> &HolidayCalendar {
        &self.calendar
    }

    /// 観測を追記
    pub async fn append(&self, observation: NewObservation) -> Result<MetricObservation> {
        let observation = observation.validate(&self.calendar)?;
        self.storage.insert_observation(&observation).await?;
        debug!(series = %observation.series, id = %observation.id, "observation appended");
        Ok(observation)
    }

    /// 複数の観測を追記
    ///
    /// 全件を先に検証し、1件でも不正なら何も書き込まない。
    pub async fn append_batch(&self, observations: Vec<NewObservation>) -> Result<Vec<MetricObservation>> {
        let validated = observations
            .into_iter()
            .enumerate()
            .map(|(index, observation)| {
                observation.validate(&self.calendar).map_err(|e| match e {
                    Error::Validation(msg) => Error::validation(format!("observation #{}: {}", index, msg)),
                    other => other,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        for observation in &validated {
            self.storage.insert_observation(observation).await?;
        }
        info!(count = validated.len(), "observation batch appended");
        Ok(validated)
    }

    /// シリーズを検索
    pub fn query_series(
        &self,
        metric_type: MetricType,
        dimensions: DimensionKeys,
        time_range: TimeRange,
        aggregation: AggregationLevel,
        min_quality: Option<QualityTier>,
    ) -> SeriesQuery {
        let mut filter = SeriesFilter::new(metric_type, aggregation, time_range).with_dimensions(dimensions);
        filter.min_quality = min_quality;
        self.query(filter)
    }

    /// 条件を直接指定して検索
    pub fn query(&self, filter: SeriesFilter) -> SeriesQuery {
        SeriesQuery::new(self.storage.clone(), filter, self.page_size, self.row_cap)
    }

    pub async fn get(&self, id: ObservationId) -> Result<Option<MetricObservation>> {
        self.storage.get_observation(id).await
    }

    /// high 品質になる前の観測を訂正
    ///
    /// シリーズと時刻は変更できない。
    pub async fn revise(&self, id: ObservationId, revision: NewObservation) -> Result<MetricObservation> {
        let current = self
            .storage
            .get_observation(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("observation {}", id)))?;
        if current.is_frozen() {
            return Err(Error::conflict(format!("observation {} is high quality and immutable", id)));
        }
        if revision.series != current.series || revision.timestamp != current.timestamp {
            return Err(Error::validation("revision must keep the series and timestamp"));
        }

        let revised = MetricObservation {
            id,
            ..revision.validate(&self.calendar)?
        };
        match self.storage.replace_observation_if_revisable(&revised).await? {
            GuardedWrite::Applied => {
                info!(id = %id, quality = revised.quality.as_str(), "observation revised");
                Ok(revised)
            }
            GuardedWrite::Rejected => Err(Error::conflict(format!(
                "observation {} became high quality before revision",
                id
            ))),
            GuardedWrite::Missing => Err(Error::not_found(format!("observation {}", id))),
        }
    }

    /// 保持期間外の観測を削除（外部の保持ポリシーから呼ばれる）
    pub async fn apply_retention(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let deleted = self.storage.delete_before(cutoff).await?;
        info!(%cutoff, deleted, "retention applied");
        Ok(deleted)
    }
}
