//! In-memory storage backend

use super::{FeatureStorage, GuardedWrite, MetricStorage, PredictionStorage, ScanOrder, SnapshotStorage};
use crate::calendar::Period;
use crate::catalog::{Feature, FeatureChange, FeatureId, FeatureTransition, StatisticsRecord};
use crate::error::{Error, Result};
use crate::ledger::{Outcome, Prediction, PredictionId};
use crate::metrics::{MetricObservation, ObservationId, SeriesCursor, SeriesFilter};
use crate::performance::PerformanceSnapshot;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

type ObservationKey = (DateTime<Utc>, ObservationId);

#[derive(Debug, Default)]
struct ObservationTable {
    rows: BTreeMap<ObservationKey, MetricObservation>,
    by_id: HashMap<ObservationId, DateTime<Utc>>,
}

/// メモリ上のストレージ（テスト・単体実行用）
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    features: Arc<RwLock<HashMap<FeatureId, Feature>>>,
    statistics: Arc<RwLock<HashMap<FeatureId, Vec<StatisticsRecord>>>>,
    observations: Arc<RwLock<ObservationTable>>,
    predictions: Arc<RwLock<HashMap<PredictionId, Prediction>>>,
    snapshots: Arc<RwLock<BTreeMap<(String, Period), PerformanceSnapshot>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FeatureStorage for MemoryStorage {
    async fn insert_feature(&self, feature: &Feature) -> Result<()> {
        let mut features = self.features.write().await;
        if features
            .values()
            .any(|f| f.name == feature.name && f.version == feature.version)
        {
            return Err(Error::conflict(format!(
                "feature {} v{} already exists",
                feature.name, feature.version
            )));
        }
        features.insert(feature.id, feature.clone());
        Ok(())
    }

    async fn modify_feature(&self, id: FeatureId, change: &FeatureChange) -> Result<Option<FeatureTransition>> {
        // 書き込みロックを保持したまま読み取りと適用を行う
        let mut features = self.features.write().await;
        let Some(existing) = features.get_mut(&id) else {
            return Ok(None);
        };
        let before = existing.clone();
        change.apply(existing);
        Ok(Some(FeatureTransition {
            before,
            after: existing.clone(),
        }))
    }

    async fn get_feature(&self, id: FeatureId) -> Result<Option<Feature>> {
        let features = self.features.read().await;
        Ok(features.get(&id).cloned())
    }

    async fn feature_versions(&self, name: &str) -> Result<Vec<Feature>> {
        let features = self.features.read().await;
        let mut versions: Vec<Feature> = features
            .values()
            .filter(|f| f.name == name)
            .cloned()
            .collect();
        versions.sort_by_key(|f| f.version);
        Ok(versions)
    }

    async fn list_features(&self, active_only: bool) -> Result<Vec<Feature>> {
        let features = self.features.read().await;
        let mut result: Vec<Feature> = features
            .values()
            .filter(|f| !active_only || f.active)
            .cloned()
            .collect();
        result.sort_by(|a, b| a.name.cmp(&b.name).then(a.version.cmp(&b.version)));
        Ok(result)
    }

    async fn append_statistics(&self, record: &StatisticsRecord) -> Result<()> {
        let mut statistics = self.statistics.write().await;
        let history = statistics.entry(record.feature_id).or_default();
        history.push(record.clone());
        history.sort_by_key(|r| r.recorded_at);
        Ok(())
    }

    async fn statistics_history(&self, id: FeatureId) -> Result<Vec<StatisticsRecord>> {
        let statistics = self.statistics.read().await;
        Ok(statistics.get(&id).cloned().unwrap_or_default())
    }

    async fn prune_statistics(&self, id: FeatureId, keep: usize) -> Result<usize> {
        let mut statistics = self.statistics.write().await;
        let Some(history) = statistics.get_mut(&id) else {
            return Ok(0);
        };
        let excess = history.len().saturating_sub(keep);
        history.drain(..excess);
        Ok(excess)
    }
}

#[async_trait]
impl MetricStorage for MemoryStorage {
    async fn insert_observation(&self, observation: &MetricObservation) -> Result<()> {
        let mut table = self.observations.write().await;
        if table.by_id.contains_key(&observation.id) {
            return Err(Error::conflict(format!("observation {} already exists", observation.id)));
        }
        table.by_id.insert(observation.id, observation.timestamp);
        table
            .rows
            .insert((observation.timestamp, observation.id), observation.clone());
        Ok(())
    }

    async fn get_observation(&self, id: ObservationId) -> Result<Option<MetricObservation>> {
        let table = self.observations.read().await;
        Ok(table
            .by_id
            .get(&id)
            .and_then(|timestamp| table.rows.get(&(*timestamp, id)))
            .cloned())
    }

    async fn replace_observation_if_revisable(&self, observation: &MetricObservation) -> Result<GuardedWrite> {
        let mut table = self.observations.write().await;
        let Some(timestamp) = table.by_id.get(&observation.id).copied() else {
            return Ok(GuardedWrite::Missing);
        };
        let key = (timestamp, observation.id);
        if table.rows.get(&key).is_some_and(MetricObservation::is_frozen) {
            return Ok(GuardedWrite::Rejected);
        }

        table.rows.remove(&key);
        table.by_id.insert(observation.id, observation.timestamp);
        table
            .rows
            .insert((observation.timestamp, observation.id), observation.clone());
        Ok(GuardedWrite::Applied)
    }

    async fn fetch_page(
        &self,
        filter: &SeriesFilter,
        after: Option<&SeriesCursor>,
        order: ScanOrder,
        limit: usize,
    ) -> Result<Vec<MetricObservation>> {
        let range = &filter.time_range;
        let first: ObservationKey = (range.start, ObservationId(Uuid::nil()));
        let past_end: ObservationKey = (range.end, ObservationId(Uuid::nil()));
        let cursor = after.map(|c| (c.timestamp, c.id));

        // 下限は包含/除外を区別し、上限は常に除外
        let (lower, upper) = match (order, cursor) {
            (ScanOrder::Ascending, Some(key)) if key >= first => (Bound::Excluded(key), past_end),
            (ScanOrder::Descending, Some(key)) if key < past_end => (Bound::Included(first), key),
            _ => (Bound::Included(first), past_end),
        };
        let low = match lower {
            Bound::Included(key) | Bound::Excluded(key) => key,
            Bound::Unbounded => first,
        };
        // BTreeMap::range は逆転した区間で panic する
        if low >= upper {
            return Ok(Vec::new());
        }

        let table = self.observations.read().await;
        let rows = table.rows.range((lower, Bound::Excluded(upper))).map(|(_, observation)| observation);
        let page: Vec<MetricObservation> = match order {
            ScanOrder::Ascending => rows.filter(|o| filter.matches(o)).take(limit).cloned().collect(),
            ScanOrder::Descending => rows.rev().filter(|o| filter.matches(o)).take(limit).cloned().collect(),
        };
        Ok(page)
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut table = self.observations.write().await;
        let expired: Vec<ObservationKey> = table
            .rows
            .keys()
            .take_while(|(timestamp, _)| *timestamp < cutoff)
            .copied()
            .collect();
        for key in &expired {
            table.rows.remove(key);
            table.by_id.remove(&key.1);
        }
        Ok(expired.len() as u64)
    }
}

#[async_trait]
impl PredictionStorage for MemoryStorage {
    async fn insert_prediction(&self, prediction: &Prediction) -> Result<()> {
        let mut predictions = self.predictions.write().await;
        if predictions.contains_key(&prediction.id) {
            return Err(Error::conflict(format!("prediction {} already exists", prediction.id)));
        }
        predictions.insert(prediction.id, prediction.clone());
        Ok(())
    }

    async fn get_prediction(&self, id: PredictionId) -> Result<Option<Prediction>> {
        let predictions = self.predictions.read().await;
        Ok(predictions.get(&id).cloned())
    }

    async fn attach_outcome_if_absent(&self, id: PredictionId, outcome: &Outcome) -> Result<GuardedWrite> {
        let mut predictions = self.predictions.write().await;
        Ok(match predictions.get_mut(&id) {
            None => GuardedWrite::Missing,
            Some(prediction) if prediction.outcome.is_some() => GuardedWrite::Rejected,
            Some(prediction) => {
                prediction.outcome = Some(*outcome);
                GuardedWrite::Applied
            }
        })
    }

    async fn predictions_for_model(&self, model_id: &str, period: &Period) -> Result<Vec<Prediction>> {
        let predictions = self.predictions.read().await;
        let mut result: Vec<Prediction> = predictions
            .values()
            .filter(|p| p.model.model_id == model_id && period.contains(p.target_date))
            .cloned()
            .collect();
        sort_predictions(&mut result);
        Ok(result)
    }

    async fn pending_outcomes(&self, model_id: &str, before: NaiveDate) -> Result<Vec<Prediction>> {
        let predictions = self.predictions.read().await;
        let mut result: Vec<Prediction> = predictions
            .values()
            .filter(|p| p.model.model_id == model_id && p.target_date < before && p.outcome.is_none())
            .cloned()
            .collect();
        sort_predictions(&mut result);
        Ok(result)
    }
}

fn sort_predictions(predictions: &mut [Prediction]) {
    predictions.sort_by(|a, b| {
        (a.target_date, a.made_at, a.id.0).cmp(&(b.target_date, b.made_at, b.id.0))
    });
}

#[async_trait]
impl SnapshotStorage for MemoryStorage {
    async fn put_snapshot(&self, snapshot: &PerformanceSnapshot) -> Result<()> {
        let mut snapshots = self.snapshots.write().await;
        snapshots.insert((snapshot.model_id.clone(), snapshot.period), snapshot.clone());
        Ok(())
    }

    async fn get_snapshot(&self, model_id: &str, period: &Period) -> Result<Option<PerformanceSnapshot>> {
        let snapshots = self.snapshots.read().await;
        Ok(snapshots.get(&(model_id.to_string(), *period)).cloned())
    }

    async fn latest_snapshot(&self, model_id: &str) -> Result<Option<PerformanceSnapshot>> {
        let snapshots = self.snapshots.read().await;
        Ok(snapshots
            .values()
            .filter(|s| s.model_id == model_id)
            .max_by_key(|s| (s.period.end, s.period.start))
            .cloned())
    }
}
