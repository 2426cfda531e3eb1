//! Prediction Ledger Types
//!
//! 予測台帳用の型定義

use crate::error::{Error, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use uuid::Uuid;

/// 予測ID
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PredictionId(pub Uuid);

impl PredictionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PredictionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PredictionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// モデル参照
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelRef {
    pub model_id: String,
    pub version: String,
}

impl ModelRef {
    pub fn new(model_id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.model_id, self.version)
    }
}

/// 予測ホライズン
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Horizon {
    NextDay,
    NextWeek,
    NextMonth,
    NextQuarter,
    NextYear,
}

/// 特徴量の値
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Boolean(bool),
    Numeric(f64),
    Categorical(String),
}

/// 予測時に使用した特徴量（名前・バージョン・値）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVectorEntry {
    pub name: String,
    pub version: u32,
    pub value: FeatureValue,
}

impl FeatureVectorEntry {
    pub fn numeric(name: impl Into<String>, version: u32, value: f64) -> Self {
        Self {
            name: name.into(),
            version,
            value: FeatureValue::Numeric(value),
        }
    }
}

/// 信頼区間
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
    /// 信頼水準（例: 0.95）
    pub level: f64,
}

impl ConfidenceInterval {
    pub fn new(lower: f64, upper: f64, level: f64) -> Self {
        Self {
            lower,
            upper,
            level,
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        self.lower <= value && value <= self.upper
    }

    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }
}

/// 値の定義域
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn non_negative() -> Self {
        Self::new(0.0, f64::MAX)
    }

    pub fn contains(&self, value: f64) -> bool {
        self.min <= value && value <= self.max
    }
}

/// 分布の分位点
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantilePoint {
    pub quantile: f64,
    pub value: f64,
}

/// 季節性の内訳
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeasonalBreakdown {
    pub trend: f64,
    pub seasonal_factor: f64,
    #[serde(default)]
    pub components: BTreeMap<String, f64>,
}

/// 実行時メトリクス
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RuntimeMetrics {
    pub execution_time_ms: f64,
    #[serde(default)]
    pub cache_hit: bool,
    #[serde(default)]
    pub fallback_used: bool,
}

/// 予測の記録リクエスト
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPrediction {
    pub model: ModelRef,
    pub horizon: Horizon,
    pub target_date: NaiveDate,
    pub made_at: DateTime<Utc>,
    pub features: Vec<FeatureVectorEntry>,
    pub estimate: f64,
    pub interval: ConfidenceInterval,
    /// 予測値が取り得る絶対的な範囲
    #[serde(default)]
    pub domain: Option<ValueRange>,
    #[serde(default)]
    pub distribution: Option<Vec<QuantilePoint>>,
    #[serde(default)]
    pub seasonal_breakdown: Option<SeasonalBreakdown>,
    #[serde(default)]
    pub runtime: RuntimeMetrics,
}

impl NewPrediction {
    pub fn new(
        model: ModelRef,
        horizon: Horizon,
        target_date: NaiveDate,
        estimate: f64,
        interval: ConfidenceInterval,
    ) -> Self {
        Self {
            model,
            horizon,
            target_date,
            made_at: Utc::now(),
            features: Vec::new(),
            estimate,
            interval,
            domain: None,
            distribution: None,
            seasonal_breakdown: None,
            runtime: RuntimeMetrics::default(),
        }
    }

    pub fn with_feature(mut self, entry: FeatureVectorEntry) -> Self {
        self.features.push(entry);
        self
    }

    pub fn with_domain(mut self, domain: ValueRange) -> Self {
        self.domain = Some(domain);
        self
    }

    pub fn with_runtime(mut self, runtime: RuntimeMetrics) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn with_made_at(mut self, made_at: DateTime<Utc>) -> Self {
        self.made_at = made_at;
        self
    }

    pub fn with_distribution(mut self, distribution: Vec<QuantilePoint>) -> Self {
        self.distribution = Some(distribution);
        self
    }

    pub fn with_seasonal_breakdown(mut self, breakdown: SeasonalBreakdown) -> Self {
        self.seasonal_breakdown = Some(breakdown);
        self
    }

    /// 検証して台帳エントリへ変換
    pub fn validate(self) -> Result<Prediction> {
        if self.model.model_id.trim().is_empty() || self.model.version.trim().is_empty() {
            return Err(Error::validation("model id and version are required"));
        }
        if !self.estimate.is_finite() {
            return Err(Error::validation("point estimate must be finite"));
        }

        let interval = self.interval;
        if !interval.lower.is_finite() || !interval.upper.is_finite() {
            return Err(Error::validation("interval bounds must be finite"));
        }
        if interval.lower > interval.upper {
            return Err(Error::validation(format!(
                "interval lower {} exceeds upper {}",
                interval.lower, interval.upper
            )));
        }
        if !(interval.level > 0.0 && interval.level < 1.0) {
            return Err(Error::validation(format!(
                "confidence level {} outside (0, 1)",
                interval.level
            )));
        }

        if let Some(domain) = self.domain {
            if domain.min > domain.max {
                return Err(Error::validation("domain min exceeds max"));
            }
            if !domain.contains(self.estimate) {
                return Err(Error::validation(format!(
                    "estimate {} outside domain [{}, {}]",
                    self.estimate, domain.min, domain.max
                )));
            }
        }

        let mut seen = HashSet::new();
        for entry in &self.features {
            if entry.name.trim().is_empty() {
                return Err(Error::validation("feature name must not be blank"));
            }
            if !seen.insert(entry.name.as_str()) {
                return Err(Error::validation(format!(
                    "feature {} appears more than once",
                    entry.name
                )));
            }
        }

        if let Some(distribution) = &self.distribution {
            let ordered = distribution.windows(2).all(|pair| {
                pair[0].quantile < pair[1].quantile && pair[0].value <= pair[1].value
            });
            let in_range = distribution
                .iter()
                .all(|p| (0.0..=1.0).contains(&p.quantile) && p.value.is_finite());
            if !ordered || !in_range {
                return Err(Error::validation(
                    "distribution quantiles must be increasing within [0, 1]",
                ));
            }
        }

        if !self.runtime.execution_time_ms.is_finite() || self.runtime.execution_time_ms < 0.0 {
            return Err(Error::validation("execution time must be non-negative"));
        }

        Ok(Prediction {
            id: PredictionId::new(),
            model: self.model,
            horizon: self.horizon,
            target_date: self.target_date,
            made_at: self.made_at,
            features: self.features,
            estimate: self.estimate,
            interval,
            domain: self.domain,
            distribution: self.distribution,
            seasonal_breakdown: self.seasonal_breakdown,
            runtime: self.runtime,
            outcome: None,
        })
    }
}

/// 実績値（一度だけ付与できる）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub actual_value: f64,
    pub observed_at: DateTime<Utc>,
}

/// パーセント誤差の分母
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorBase {
    /// 予測値で割る（既存スナップショットとの互換）
    #[default]
    Predicted,
    /// 実績値で割る（標準的なMAPE）
    Actual,
}

/// 実績に対する誤差評価（保存せず都度計算する）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutcomeEvaluation {
    pub actual_value: f64,
    pub observed_at: DateTime<Utc>,
    pub absolute_error: f64,
    pub percentage_error: f64,
    pub within_interval: bool,
}

impl OutcomeEvaluation {
    pub fn compute(
        estimate: f64,
        interval: &ConfidenceInterval,
        outcome: &Outcome,
        base: ErrorBase,
    ) -> Self {
        let absolute_error = (outcome.actual_value - estimate).abs();
        let denominator = match base {
            ErrorBase::Predicted => estimate,
            ErrorBase::Actual => outcome.actual_value,
        };
        let percentage_error = if denominator == 0.0 {
            0.0
        } else {
            absolute_error / denominator.abs() * 100.0
        };

        Self {
            actual_value: outcome.actual_value,
            observed_at: outcome.observed_at,
            absolute_error,
            percentage_error,
            within_interval: interval.contains(outcome.actual_value),
        }
    }
}

/// 台帳エントリ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub id: PredictionId,
    pub model: ModelRef,
    pub horizon: Horizon,
    pub target_date: NaiveDate,
    pub made_at: DateTime<Utc>,
    pub features: Vec<FeatureVectorEntry>,
    pub estimate: f64,
    pub interval: ConfidenceInterval,
    pub domain: Option<ValueRange>,
    pub distribution: Option<Vec<QuantilePoint>>,
    pub seasonal_breakdown: Option<SeasonalBreakdown>,
    pub runtime: RuntimeMetrics,
    pub outcome: Option<Outcome>,
}

impl Prediction {
    pub fn has_outcome(&self) -> bool {
        self.outcome.is_some()
    }

    /// 誤差評価（実績未着なら None）
    pub fn evaluate(&self, base: ErrorBase) -> Option<OutcomeEvaluation> {
        self.outcome
            .as_ref()
            .map(|outcome| OutcomeEvaluation::compute(self.estimate, &self.interval, outcome, base))
    }

    /// 既定の分母での誤差評価
    pub fn evaluation(&self) -> Option<OutcomeEvaluation> {
        self.evaluate(ErrorBase::default())
    }

    /// 特徴量名 → バージョン
    pub fn feature_versions(&self) -> BTreeMap<&str, u32> {
        self.features
            .iter()
            .map(|entry| (entry.name.as_str(), entry.version))
            .collect()
    }
}
