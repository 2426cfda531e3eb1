//! Performance Types
//!
//! モデル性能スナップショット用の型定義

use crate::calendar::Period;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 精度メトリクス
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AccuracyMetrics {
    /// 期間内の予測数
    pub prediction_count: usize,
    pub with_outcome_count: usize,
    pub without_outcome_count: usize,
    pub within_interval_count: usize,
    /// 区間内率（0.0-1.0、実績なしは0）
    pub accuracy_rate: f64,
    pub mean_absolute_error: f64,
    pub mean_absolute_percentage_error: f64,
    /// キャッシュ利用率（0.0-1.0、全予測に対して）
    pub cache_hit_rate: f64,
    /// フォールバック利用率（0.0-1.0、全予測に対して）
    pub fallback_usage_rate: f64,
    pub mean_execution_time_ms: f64,
}

/// 特徴量ごとのドリフト
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureDrift {
    pub feature: String,
    pub baseline_mean: f64,
    pub current_mean: f64,
    /// 基準線の標準偏差で正規化した平均の移動量
    pub shift: f64,
    pub detected: bool,
}

/// ドリフト深刻度
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftSeverity {
    #[default]
    None,
    Moderate,
    Critical,
}

/// ドリフト指標
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DriftIndicators {
    pub features: Vec<FeatureDrift>,
    pub max_feature_shift: f64,
    /// 概念ドリフト（外部入力、相対誤差変化）
    pub concept_drift: Option<f64>,
    /// 正規化済みの総合ドリフト量
    pub magnitude: f64,
    pub severity: DriftSeverity,
}

impl DriftIndicators {
    /// 基準線なし＝ドリフトなし
    pub fn none() -> Self {
        Self::default()
    }

    pub fn detected(&self) -> bool {
        self.severity != DriftSeverity::None
    }
}

/// ビジネスインパクト推定
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BusinessImpact {
    /// 区間内予測がもたらした価値
    pub realized_value: f64,
    /// 誤差によるコスト
    pub error_cost: f64,
    pub net_value: f64,
    /// 0-100 に正規化したスコア
    pub impact_score: f64,
}

/// 優先度
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        f.write_str(label)
    }
}

/// 推奨アクション
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    NoAction,
    Monitor,
    Investigate,
    Retrain,
}

/// 構造化された推奨
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub action: RecommendedAction,
    pub priority: Option<Priority>,
    pub reasons: Vec<String>,
}

impl Recommendation {
    /// 要注意レポートから推奨を導出
    pub fn from_attention(report: &AttentionReport) -> Self {
        let action = match report.priority {
            None => RecommendedAction::NoAction,
            Some(Priority::Low) => RecommendedAction::Monitor,
            Some(Priority::Medium) => RecommendedAction::Investigate,
            Some(Priority::High) | Some(Priority::Critical) => RecommendedAction::Retrain,
        };
        Self {
            action,
            priority: report.priority,
            reasons: report.reasons.clone(),
        }
    }
}

/// 要注意判定の結果
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AttentionReport {
    /// 発火したルールの最高優先度
    pub priority: Option<Priority>,
    pub reasons: Vec<String>,
}

impl AttentionReport {
    pub fn needs_attention(&self) -> bool {
        self.priority.is_some()
    }

    fn raise(&mut self, priority: Priority, reason: String) {
        self.priority = Some(self.priority.map_or(priority, |p| p.max(priority)));
        self.reasons.push(reason);
    }
}

/// 要注意ルールの閾値
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttentionThresholds {
    /// これ未満の区間内率（%）で high
    pub min_accuracy_pct: f64,
    /// 平均実行時間（ms）超過で medium
    pub max_execution_time_ms: f64,
    /// フォールバック利用率（%）超過で medium
    pub max_fallback_rate_pct: f64,
}

impl Default for AttentionThresholds {
    fn default() -> Self {
        Self {
            min_accuracy_pct: 70.0,
            max_execution_time_ms: 5000.0,
            max_fallback_rate_pct: 20.0,
        }
    }
}

/// 健全性スコアの正規化設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthNormalization {
    /// これ以下の平均実行時間は満点
    pub target_execution_time_ms: f64,
    /// これ以上の平均実行時間は0点
    pub max_execution_time_ms: f64,
    /// この移動量で drift スコアが0点になる
    pub critical_drift_magnitude: f64,
}

impl Default for HealthNormalization {
    fn default() -> Self {
        Self {
            target_execution_time_ms: 1000.0,
            max_execution_time_ms: 10_000.0,
            critical_drift_magnitude: 2.0,
        }
    }
}

/// 健全性スコアの内訳（各 0-100）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthBreakdown {
    pub accuracy: f64,
    pub runtime: f64,
    pub drift: f64,
    pub business_impact: f64,
    pub total: f64,
}

const ACCURACY_WEIGHT: f64 = 0.4;
const RUNTIME_WEIGHT: f64 = 0.2;
const DRIFT_WEIGHT: f64 = 0.2;
const IMPACT_WEIGHT: f64 = 0.2;

/// モデル性能スナップショット
///
/// 期間内の予測から完全に再計算でき、再計算時は丸ごと置き換える。
/// 健全性スコアは保存せず都度導出する。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub model_id: String,
    /// 期間内に出現したモデルバージョン（昇順）
    pub model_versions: Vec<String>,
    pub period: Period,
    pub accuracy: AccuracyMetrics,
    pub drift: DriftIndicators,
    pub business_impact: BusinessImpact,
    /// 明示的な再学習要求
    pub retrain_required: bool,
    pub recommendation: Recommendation,
}

impl PerformanceSnapshot {
    /// 健全性スコア（0-100）
    pub fn health_score(&self) -> f64 {
        self.health_breakdown(&HealthNormalization::default()).total
    }

    pub fn health_breakdown(&self, normalization: &HealthNormalization) -> HealthBreakdown {
        let accuracy = unit_score(self.accuracy.accuracy_rate);

        let latency = latency_score(
            self.accuracy.mean_execution_time_ms,
            normalization.target_execution_time_ms,
            normalization.max_execution_time_ms,
        );
        let runtime = bounded(latency * (1.0 - self.accuracy.fallback_usage_rate.clamp(0.0, 1.0)));

        let drift = if normalization.critical_drift_magnitude > 0.0 {
            bounded(100.0 * (1.0 - self.drift.magnitude / normalization.critical_drift_magnitude))
        } else if self.drift.detected() {
            0.0
        } else {
            100.0
        };

        let business_impact = bounded(self.business_impact.impact_score);

        let total = bounded(
            ACCURACY_WEIGHT * accuracy
                + RUNTIME_WEIGHT * runtime
                + DRIFT_WEIGHT * drift
                + IMPACT_WEIGHT * business_impact,
        );

        HealthBreakdown {
            accuracy,
            runtime,
            drift,
            business_impact,
            total,
        }
    }

    /// 既定閾値での要注意判定
    pub fn needs_attention(&self) -> AttentionReport {
        self.needs_attention_with(&AttentionThresholds::default())
    }

    pub fn needs_attention_with(&self, thresholds: &AttentionThresholds) -> AttentionReport {
        let mut report = AttentionReport::default();
        let accuracy = &self.accuracy;

        // 実績がまだない期間は「データなし」であり低精度ではない
        if accuracy.with_outcome_count > 0 {
            let accuracy_pct = accuracy.accuracy_rate * 100.0;
            if accuracy_pct < thresholds.min_accuracy_pct {
                report.raise(
                    Priority::High,
                    format!(
                        "accuracy {:.1}% below {:.1}%",
                        accuracy_pct, thresholds.min_accuracy_pct
                    ),
                );
            }
        }

        match self.drift.severity {
            DriftSeverity::None => {}
            DriftSeverity::Moderate => report.raise(
                Priority::High,
                format!("drift detected (magnitude {:.2})", self.drift.magnitude),
            ),
            DriftSeverity::Critical => report.raise(
                Priority::Critical,
                format!("critical drift (magnitude {:.2})", self.drift.magnitude),
            ),
        }

        if accuracy.mean_execution_time_ms > thresholds.max_execution_time_ms {
            report.raise(
                Priority::Medium,
                format!(
                    "mean execution time {:.0}ms above {:.0}ms",
                    accuracy.mean_execution_time_ms, thresholds.max_execution_time_ms
                ),
            );
        }

        let fallback_pct = accuracy.fallback_usage_rate * 100.0;
        if fallback_pct > thresholds.max_fallback_rate_pct {
            report.raise(
                Priority::Medium,
                format!(
                    "fallback usage {:.1}% above {:.1}%",
                    fallback_pct, thresholds.max_fallback_rate_pct
                ),
            );
        }

        if self.retrain_required {
            report.raise(Priority::Critical, "retrain explicitly required".to_string());
        }

        report
    }
}

fn bounded(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

fn unit_score(rate: f64) -> f64 {
    bounded(rate * 100.0)
}

fn latency_score(mean_ms: f64, target_ms: f64, max_ms: f64) -> f64 {
    if !mean_ms.is_finite() {
        return 0.0;
    }
    if mean_ms <= target_ms {
        return 100.0;
    }
    if mean_ms >= max_ms || max_ms <= target_ms {
        return 0.0;
    }
    bounded(100.0 * (max_ms - mean_ms) / (max_ms - target_ms))
}
