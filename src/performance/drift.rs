//! Drift Analysis
//!
//! 特徴量統計の直近値と基準線を比較し、標準化した平均の移動量からドリフトを判定する。
//! 基準線がない特徴量は「ドリフトなし」として扱う。

use super::types::{DriftIndicators, DriftSeverity, FeatureDrift};
use crate::catalog::{FeatureCatalog, FeatureId, FeatureStatistics};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// ドリフト判定の閾値
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    /// この移動量を超えると検知
    pub detection_shift: f64,
    /// この移動量以上で critical
    pub critical_shift: f64,
    /// 概念ドリフトの検知閾値
    pub concept_drift_threshold: f64,
    /// 概念ドリフトの critical 閾値
    pub critical_concept_drift: f64,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            detection_shift: 0.5,
            critical_shift: 2.0,
            concept_drift_threshold: 0.1,
            critical_concept_drift: 0.3,
        }
    }
}

/// ドリフト判定の入力
///
/// 特徴量名 → 統計。基準線側に存在しない特徴量は比較しない。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriftInput {
    #[serde(default)]
    pub current: BTreeMap<String, FeatureStatistics>,
    #[serde(default)]
    pub baseline: BTreeMap<String, FeatureStatistics>,
    /// 概念ドリフト（外部で計算された相対誤差の変化）
    #[serde(default)]
    pub concept_drift: Option<f64>,
    /// 明示的な再学習要求
    #[serde(default)]
    pub retrain_required: bool,
}

impl DriftInput {
    /// 入力なし（ドリフトなし）
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_feature(
        mut self,
        name: impl Into<String>,
        current: FeatureStatistics,
        baseline: Option<FeatureStatistics>,
    ) -> Self {
        let name = name.into();
        if let Some(baseline) = baseline {
            self.baseline.insert(name.clone(), baseline);
        }
        self.current.insert(name, current);
        self
    }

    pub fn with_concept_drift(mut self, drift: f64) -> Self {
        self.concept_drift = Some(drift);
        self
    }

    pub fn with_retrain_required(mut self, required: bool) -> Self {
        self.retrain_required = required;
        self
    }

    /// カタログの統計履歴から組み立てる
    ///
    /// cutoff より前の履歴を基準線、以降を直近値とする。
    pub async fn from_catalog(
        catalog: &FeatureCatalog,
        features: &[FeatureId],
        cutoff: DateTime<Utc>,
    ) -> Result<Self> {
        let mut input = Self::default();
        for id in features {
            let feature = catalog
                .get(*id)
                .await?
                .ok_or_else(|| Error::not_found(format!("feature {}", id)))?;

            if let Some(current) = catalog.recent_statistics(*id, cutoff).await? {
                input.current.insert(feature.name.clone(), current);
            }
            if let Some(baseline) = catalog.baseline_statistics(*id, cutoff).await? {
                input.baseline.insert(feature.name, baseline);
            }
        }
        Ok(input)
    }
}

/// ドリフト分析器
#[derive(Debug, Clone, Default)]
pub struct DriftAnalyzer {
    config: DriftConfig,
}

impl DriftAnalyzer {
    pub fn new(config: DriftConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DriftConfig {
        &self.config
    }

    /// ドリフト指標を計算
    pub fn analyze(&self, input: &DriftInput) -> DriftIndicators {
        let config = &self.config;

        let features: Vec<FeatureDrift> = input
            .current
            .iter()
            .filter_map(|(name, current)| {
                let baseline = input.baseline.get(name)?;
                if baseline.count == 0 || current.count == 0 {
                    return None;
                }
                let shift = self.standardized_shift(baseline, current);
                Some(FeatureDrift {
                    feature: name.clone(),
                    baseline_mean: baseline.mean,
                    current_mean: current.mean,
                    shift,
                    detected: shift > config.detection_shift,
                })
            })
            .collect();

        let max_feature_shift = features.iter().map(|f| f.shift).fold(0.0, f64::max);
        let concept = input.concept_drift.filter(|c| c.is_finite()).map(f64::abs);

        let concept_magnitude = match concept {
            Some(c) if config.critical_concept_drift > 0.0 => {
                c / config.critical_concept_drift * config.critical_shift
            }
            _ => 0.0,
        };
        let magnitude = max_feature_shift.max(concept_magnitude);

        let critical = max_feature_shift >= config.critical_shift
            || concept.is_some_and(|c| c >= config.critical_concept_drift);
        let detected = features.iter().any(|f| f.detected)
            || concept.is_some_and(|c| c > config.concept_drift_threshold);
        let severity = if critical {
            DriftSeverity::Critical
        } else if detected {
            DriftSeverity::Moderate
        } else {
            DriftSeverity::None
        };

        debug!(
            features = features.len(),
            magnitude,
            ?severity,
            "drift analyzed"
        );

        DriftIndicators {
            features,
            max_feature_shift,
            concept_drift: input.concept_drift.filter(|c| c.is_finite()),
            magnitude,
            severity,
        }
    }

    /// 平均の差をプールした標準偏差で割った値
    ///
    /// 両側とも分散0で平均が異なる場合は critical 相当とする。
    fn standardized_shift(&self, baseline: &FeatureStatistics, current: &FeatureStatistics) -> f64 {
        let delta = (current.mean - baseline.mean).abs();
        let pooled = ((baseline.std_dev.powi(2) + current.std_dev.powi(2)) / 2.0).sqrt();

        if !delta.is_finite() {
            return self.config.critical_shift;
        }
        if pooled < f64::EPSILON {
            return if delta < f64::EPSILON {
                0.0
            } else {
                self.config.critical_shift
            };
        }
        delta / pooled
    }
}
