//! Prediction Ledger
//!
//! 予測を記録し、後から到着する実績を一度だけ付与する

use super::types::{ErrorBase, NewPrediction, Outcome, OutcomeEvaluation, Prediction, PredictionId};
use crate::calendar::Period;
use crate::config::TelemetryConfig;
use crate::error::{Error, Result};
use crate::metrics::{MetricObservation, SeriesQuery};
use crate::storage::{GuardedWrite, PredictionStorage};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 実績突き合わせの結果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// 実績を付与した予測
    pub attached: Vec<PredictionId>,
    /// 並行して先に実績が付与されていた予測
    pub already_attached: Vec<PredictionId>,
    /// 対象日の観測がなかった予測
    pub unmatched: Vec<PredictionId>,
}

/// 予測台帳
pub struct PredictionLedger {
    storage: Arc<dyn PredictionStorage>,
    error_base: ErrorBase,
}

impl PredictionLedger {
    pub fn new(storage: Arc<dyn PredictionStorage>) -> Self {
        Self {
            storage,
            error_base: ErrorBase::default(),
        }
    }

    /// 設定から作成（`ledger.error_base` を反映）
    pub fn from_config(storage: Arc<dyn PredictionStorage>, config: &TelemetryConfig) -> Self {
        Self::new(storage).with_error_base(config.ledger.error_base)
    }

    /// パーセント誤差の分母を設定
    pub fn with_error_base(mut self, base: ErrorBase) -> Self {
        self.error_base = base;
        self
    }

    pub fn error_base(&self) -> ErrorBase {
        self.error_base
    }

    /// 予測を記録
    pub async fn record(&self, prediction: NewPrediction) -> Result<Prediction> {
        let prediction = prediction.validate()?;
        self.storage.insert_prediction(&prediction).await?;
        info!(
            id = %prediction.id,
            model = %prediction.model,
            target_date = %prediction.target_date,
            "prediction recorded"
        );
        Ok(prediction)
    }

    /// 実績を付与（先勝ち、二度目は Conflict）
    pub async fn attach_outcome(
        &self,
        id: PredictionId,
        actual_value: f64,
        observed_at: DateTime<Utc>,
    ) -> Result<OutcomeEvaluation> {
        if !actual_value.is_finite() {
            return Err(Error::validation("actual value must be finite"));
        }
        let prediction = self
            .storage
            .get_prediction(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("prediction {}", id)))?;

        let outcome = Outcome {
            actual_value,
            observed_at,
        };
        match self.storage.attach_outcome_if_absent(id, &outcome).await? {
            GuardedWrite::Applied => {
                let evaluation =
                    OutcomeEvaluation::compute(prediction.estimate, &prediction.interval, &outcome, self.error_base);
                info!(
                    id = %id,
                    absolute_error = evaluation.absolute_error,
                    within_interval = evaluation.within_interval,
                    "outcome attached"
                );
                Ok(evaluation)
            }
            GuardedWrite::Rejected => Err(Error::conflict(format!(
                "prediction {} already has an outcome",
                id
            ))),
            GuardedWrite::Missing => Err(Error::not_found(format!("prediction {}", id))),
        }
    }

    pub async fn get(&self, id: PredictionId) -> Result<Option<Prediction>> {
        self.storage.get_prediction(id).await
    }

    /// 対象日が期間内の予測
    pub async fn list_for_model(&self, model_id: &str, period: &Period) -> Result<Vec<Prediction>> {
        self.storage.predictions_for_model(model_id, period).await
    }

    /// 対象日を過ぎても実績のない予測
    pub async fn pending_outcomes(&self, model_id: &str, before: NaiveDate) -> Result<Vec<Prediction>> {
        self.storage.pending_outcomes(model_id, before).await
    }

    /// メトリクスシリーズから実績を突き合わせる
    pub async fn reconcile_from_series(
        &self,
        model_id: &str,
        before: NaiveDate,
        series: &SeriesQuery,
    ) -> Result<ReconcileReport> {
        let observations = series.collect().await?;
        series.ensure_single_series(&observations)?;
        self.reconcile_from_observations(model_id, before, &observations)
            .await
    }

    /// 観測列から実績を突き合わせる
    ///
    /// 対象日に複数の観測がある場合は時刻が最も遅いものを実績とする。
    pub async fn reconcile_from_observations(
        &self,
        model_id: &str,
        before: NaiveDate,
        observations: &[MetricObservation],
    ) -> Result<ReconcileReport> {
        let mut by_date: BTreeMap<NaiveDate, &MetricObservation> = BTreeMap::new();
        for observation in observations {
            let date = observation.timestamp.date_naive();
            match by_date.get(&date) {
                Some(existing) if existing.timestamp >= observation.timestamp => {}
                _ => {
                    by_date.insert(date, observation);
                }
            }
        }

        let mut report = ReconcileReport::default();
        for prediction in self.pending_outcomes(model_id, before).await? {
            let Some(observation) = by_date.get(&prediction.target_date) else {
                report.unmatched.push(prediction.id);
                continue;
            };
            match self
                .attach_outcome(prediction.id, observation.numeric_value(), observation.timestamp)
                .await
            {
                Ok(_) => report.attached.push(prediction.id),
                Err(Error::Conflict(_)) => {
                    debug!(id = %prediction.id, "outcome attached concurrently");
                    report.already_attached.push(prediction.id);
                }
                Err(e) => return Err(e),
            }
        }

        if !report.unmatched.is_empty() {
            warn!(model = model_id, unmatched = report.unmatched.len(), "predictions without matching observations");
        }
        info!(model = model_id, attached = report.attached.len(), "outcomes reconciled");
        Ok(report)
    }
}
