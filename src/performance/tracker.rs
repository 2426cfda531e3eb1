//! Performance Tracker Implementation
//!
//! 期間内の予測からスナップショットを算出し、(モデル, 期間) 単位で置き換える。
//! 同じ予測・同じ入力からは常に同じスナップショットが得られる。

use super::drift::{DriftAnalyzer, DriftConfig, DriftInput};
use super::types::{
    AccuracyMetrics, AttentionThresholds, BusinessImpact, HealthBreakdown, HealthNormalization,
    PerformanceSnapshot, Recommendation,
};
use crate::calendar::Period;
use crate::config::TelemetryConfig;
use crate::error::{Error, Result};
use crate::ledger::{ErrorBase, Prediction};
use crate::storage::{PredictionStorage, SnapshotStorage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

/// ビジネスインパクトの単価
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImpactConfig {
    /// 区間内に収まった予測1件あたりの価値
    pub value_per_accurate_prediction: f64,
    /// 絶対誤差1単位あたりのコスト
    pub cost_per_unit_error: f64,
}

impl Default for ImpactConfig {
    fn default() -> Self {
        Self {
            value_per_accurate_prediction: 10.0,
            cost_per_unit_error: 1.0,
        }
    }
}

/// トラッカー設定
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub attention: AttentionThresholds,
    pub health: HealthNormalization,
    pub drift: DriftConfig,
    pub impact: ImpactConfig,
}

/// 性能トラッカー
pub struct PerformanceTracker {
    predictions: Arc<dyn PredictionStorage>,
    snapshots: Arc<dyn SnapshotStorage>,
    drift: DriftAnalyzer,
    config: TrackerConfig,
    error_base: ErrorBase,
}

impl PerformanceTracker {
    pub fn new(
        predictions: Arc<dyn PredictionStorage>,
        snapshots: Arc<dyn SnapshotStorage>,
        config: TrackerConfig,
    ) -> Self {
        Self {
            predictions,
            snapshots,
            drift: DriftAnalyzer::new(config.drift.clone()),
            config,
            error_base: ErrorBase::default(),
        }
    }

    /// 設定から作成
    ///
    /// パーセント誤差の分母は予測台帳と同じ `ledger.error_base` を使う。
    pub fn from_config(
        predictions: Arc<dyn PredictionStorage>,
        snapshots: Arc<dyn SnapshotStorage>,
        config: &TelemetryConfig,
    ) -> Self {
        Self::new(predictions, snapshots, config.tracker.clone()).with_error_base(config.ledger.error_base)
    }

    /// パーセント誤差の分母を設定
    pub fn with_error_base(mut self, base: ErrorBase) -> Self {
        self.error_base = base;
        self
    }

    pub fn error_base(&self) -> ErrorBase {
        self.error_base
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// スナップショットを計算して保存
    pub async fn compute_snapshot(
        &self,
        model_id: &str,
        period: Period,
        drift_input: &DriftInput,
    ) -> Result<PerformanceSnapshot> {
        if model_id.trim().is_empty() {
            return Err(Error::validation("model id is required"));
        }

        let predictions = self.predictions.predictions_for_model(model_id, &period).await?;
        let snapshot = self.build_snapshot(model_id, period, &predictions, drift_input);
        self.snapshots.put_snapshot(&snapshot).await?;

        if snapshot.recommendation.priority.is_some() {
            warn!(
                model = model_id,
                %period,
                priority = ?snapshot.recommendation.priority,
                reasons = ?snapshot.recommendation.reasons,
                "model needs attention"
            );
        }
        info!(
            model = model_id,
            %period,
            predictions = snapshot.accuracy.prediction_count,
            with_outcome = snapshot.accuracy.with_outcome_count,
            "performance snapshot computed"
        );
        Ok(snapshot)
    }

    /// 予測列から純粋にスナップショットを組み立てる
    pub fn build_snapshot(
        &self,
        model_id: &str,
        period: Period,
        predictions: &[Prediction],
        drift_input: &DriftInput,
    ) -> PerformanceSnapshot {
        let mut ordered: Vec<&Prediction> = predictions
            .iter()
            .filter(|p| p.model.model_id == model_id && period.contains(p.target_date))
            .collect();
        ordered.sort_by(|a, b| {
            (a.target_date, a.made_at, a.id).cmp(&(b.target_date, b.made_at, b.id))
        });

        let model_versions: Vec<String> = ordered
            .iter()
            .map(|p| p.model.version.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let accuracy = self.accuracy_metrics(&ordered);
        let business_impact = self.business_impact(&ordered);
        let drift = self.drift.analyze(drift_input);

        let mut snapshot = PerformanceSnapshot {
            model_id: model_id.to_string(),
            model_versions,
            period,
            accuracy,
            drift,
            business_impact,
            retrain_required: drift_input.retrain_required,
            recommendation: Recommendation::from_attention(&Default::default()),
        };
        snapshot.recommendation =
            Recommendation::from_attention(&snapshot.needs_attention_with(&self.config.attention));
        snapshot
    }

    /// 最新のスナップショット
    pub async fn latest_snapshot(&self, model_id: &str) -> Result<Option<PerformanceSnapshot>> {
        self.snapshots.latest_snapshot(model_id).await
    }

    /// 指定期間のスナップショット
    pub async fn snapshot(&self, model_id: &str, period: &Period) -> Result<Option<PerformanceSnapshot>> {
        self.snapshots.get_snapshot(model_id, period).await
    }

    /// 設定した正規化での健全性スコア
    pub fn health(&self, snapshot: &PerformanceSnapshot) -> HealthBreakdown {
        snapshot.health_breakdown(&self.config.health)
    }

    fn accuracy_metrics(&self, predictions: &[&Prediction]) -> AccuracyMetrics {
        let total = predictions.len();
        let evaluations: Vec<_> = predictions
            .iter()
            .filter_map(|p| p.evaluate(self.error_base))
            .collect();
        let with_outcome = evaluations.len();
        let within = evaluations.iter().filter(|e| e.within_interval).count();

        let mean_over_outcomes = |sum: f64| if with_outcome == 0 { 0.0 } else { sum / with_outcome as f64 };
        let rate_over_all = |count: usize| if total == 0 { 0.0 } else { count as f64 / total as f64 };

        AccuracyMetrics {
            prediction_count: total,
            with_outcome_count: with_outcome,
            without_outcome_count: total - with_outcome,
            within_interval_count: within,
            accuracy_rate: if with_outcome == 0 {
                0.0
            } else {
                within as f64 / with_outcome as f64
            },
            mean_absolute_error: mean_over_outcomes(evaluations.iter().map(|e| e.absolute_error).sum()),
            mean_absolute_percentage_error: mean_over_outcomes(
                evaluations.iter().map(|e| e.percentage_error).sum(),
            ),
            cache_hit_rate: rate_over_all(predictions.iter().filter(|p| p.runtime.cache_hit).count()),
            fallback_usage_rate: rate_over_all(predictions.iter().filter(|p| p.runtime.fallback_used).count()),
            mean_execution_time_ms: if total == 0 {
                0.0
            } else {
                predictions.iter().map(|p| p.runtime.execution_time_ms).sum::<f64>() / total as f64
            },
        }
    }

    fn business_impact(&self, predictions: &[&Prediction]) -> BusinessImpact {
        let impact = &self.config.impact;
        let evaluations: Vec<_> = predictions
            .iter()
            .filter_map(|p| p.evaluate(self.error_base))
            .collect();

        let realized_value =
            evaluations.iter().filter(|e| e.within_interval).count() as f64 * impact.value_per_accurate_prediction;
        let error_cost = evaluations.iter().map(|e| e.absolute_error).sum::<f64>() * impact.cost_per_unit_error;
        let net_value = realized_value - error_cost;

        let attainable = evaluations.len() as f64 * impact.value_per_accurate_prediction;
        let impact_score = if attainable > 0.0 {
            (100.0 * net_value / attainable).clamp(0.0, 100.0)
        } else {
            0.0
        };

        BusinessImpact {
            realized_value,
            error_cost,
            net_value,
            impact_score: if impact_score.is_finite() { impact_score } else { 0.0 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{ConfidenceInterval, Horizon, ModelRef, NewPrediction, Outcome, RuntimeMetrics};
    use crate::performance::types::{DriftSeverity, Priority, RecommendedAction};
    use crate::storage::MemoryStorage;
    use chrono::{NaiveDate, Utc};

    fn tracker() -> (PerformanceTracker, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let tracker = PerformanceTracker::new(storage.clone(), storage.clone(), TrackerConfig::default());
        (tracker, storage)
    }

    fn june() -> Period {
        Period::month(2024, 6).unwrap()
    }

    fn prediction(day: u32, estimate: f64, actual: Option<f64>, runtime: RuntimeMetrics) -> Prediction {
        let mut prediction = NewPrediction::new(
            ModelRef::new("churn-risk", "3.0.1"),
            Horizon::NextWeek,
            NaiveDate::from_ymd_opt(2024, 6, day).unwrap(),
            estimate,
            ConfidenceInterval::new(estimate - 10.0, estimate + 10.0, 0.8),
        )
        .with_runtime(runtime)
        .validate()
        .unwrap();
        prediction.outcome = actual.map(|actual_value| Outcome {
            actual_value,
            observed_at: Utc::now(),
        });
        prediction
    }

    #[test]
    fn test_zero_predictions_snapshot() {
        let (tracker, _) = tracker();
        let snapshot = tracker.build_snapshot("churn-risk", june(), &[], &DriftInput::none());

        assert_eq!(snapshot.accuracy.prediction_count, 0);
        assert_eq!(snapshot.accuracy.accuracy_rate, 0.0);
        assert!(!snapshot.needs_attention().needs_attention());
        assert_eq!(snapshot.recommendation.action, RecommendedAction::NoAction);
        let health = tracker.health(&snapshot).total;
        assert!((0.0..=100.0).contains(&health));
    }

    #[test]
    fn test_accuracy_partition() {
        let (tracker, _) = tracker();
        let fast = RuntimeMetrics {
            execution_time_ms: 100.0,
            cache_hit: true,
            fallback_used: false,
        };
        let predictions = vec![
            prediction(1, 100.0, Some(105.0), fast),
            prediction(2, 100.0, Some(130.0), fast),
            prediction(3, 50.0, None, RuntimeMetrics::default()),
            prediction(4, 200.0, Some(190.0), RuntimeMetrics::default()),
        ];

        let snapshot = tracker.build_snapshot("churn-risk", june(), &predictions, &DriftInput::none());
        let accuracy = &snapshot.accuracy;
        assert_eq!(accuracy.prediction_count, 4);
        assert_eq!(accuracy.with_outcome_count, 3);
        assert_eq!(accuracy.without_outcome_count, 1);
        assert_eq!(accuracy.within_interval_count, 2);
        assert!((accuracy.accuracy_rate - 2.0 / 3.0).abs() < 1e-12);
        assert!((accuracy.mean_absolute_error - 15.0).abs() < 1e-12);
        // (5% + 30% + 5%) / 3
        assert!((accuracy.mean_absolute_percentage_error - 40.0 / 3.0).abs() < 1e-9);
        assert_eq!(accuracy.cache_hit_rate, 0.5);
        assert_eq!(snapshot.model_versions, vec!["3.0.1".to_string()]);

        // 区間内率 66.7% < 70% で high
        assert_eq!(snapshot.recommendation.priority, Some(Priority::High));
    }

    #[test]
    fn test_all_fallback_health_in_range() {
        let (tracker, _) = tracker();
        let slow = RuntimeMetrics {
            execution_time_ms: 60_000.0,
            cache_hit: false,
            fallback_used: true,
        };
        let predictions: Vec<Prediction> = (1..=10).map(|d| prediction(d, 10.0, Some(1000.0), slow)).collect();
        let snapshot = tracker.build_snapshot(
            "churn-risk",
            june(),
            &predictions,
            &DriftInput::none().with_concept_drift(5.0).with_retrain_required(true),
        );

        let health = tracker.health(&snapshot);
        assert!((0.0..=100.0).contains(&health.total));
        assert_eq!(health.runtime, 0.0);
        assert_eq!(snapshot.drift.severity, DriftSeverity::Critical);
        assert_eq!(snapshot.recommendation.priority, Some(Priority::Critical));
        assert_eq!(snapshot.recommendation.action, RecommendedAction::Retrain);
    }

    #[test]
    fn test_build_ignores_other_models_and_periods() {
        let (tracker, _) = tracker();
        let mut other = prediction(5, 10.0, Some(10.0), RuntimeMetrics::default());
        other.model = ModelRef::new("other", "1");
        let mut july = prediction(5, 10.0, Some(10.0), RuntimeMetrics::default());
        july.target_date = NaiveDate::from_ymd_opt(2024, 7, 5).unwrap();

        let snapshot = tracker.build_snapshot("churn-risk", june(), &[other, july], &DriftInput::none());
        assert_eq!(snapshot.accuracy.prediction_count, 0);
    }

    #[tokio::test]
    async fn test_compute_snapshot_replaces_previous() {
        let (tracker, storage) = tracker();
        for day in 1..=3 {
            storage
                .insert_prediction(&prediction(day, 100.0, Some(100.0), RuntimeMetrics::default()))
                .await
                .unwrap();
        }

        let first = tracker.compute_snapshot("churn-risk", june(), &DriftInput::none()).await.unwrap();
        let second = tracker.compute_snapshot("churn-risk", june(), &DriftInput::none()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(tracker.snapshot("churn-risk", &june()).await.unwrap(), Some(second.clone()));

        storage
            .insert_prediction(&prediction(4, 100.0, None, RuntimeMetrics::default()))
            .await
            .unwrap();
        let third = tracker.compute_snapshot("churn-risk", june(), &DriftInput::none()).await.unwrap();
        assert_eq!(third.accuracy.prediction_count, 4);
        assert_eq!(tracker.latest_snapshot("churn-risk").await.unwrap(), Some(third));
    }

    #[tokio::test]
    async fn test_compute_snapshot_requires_model() {
        let (tracker, _) = tracker();
        let err = tracker.compute_snapshot(" ", june(), &DriftInput::none()).await.unwrap_err();
        assert!(err.is_validation());
    }
}
