//! Feature Catalog Types
//!
//! 特徴量カタログ用の型定義

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// 本番利用の品質閾値
pub const MIN_COMPLETENESS: f64 = 0.95;
pub const MIN_ACCURACY: f64 = 0.9;
pub const MIN_CONSISTENCY: f64 = 0.9;
pub const MAX_NULL_RATIO: f64 = 0.05;

/// 特徴量ID
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeatureId(pub Uuid);

impl FeatureId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FeatureId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 値の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Numeric,
    Integer,
    Categorical,
    Boolean,
    Text,
    Vector,
}

/// 更新頻度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateCadence {
    RealTime,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    OnDemand,
}

/// 特徴量の出自
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// データソース（テーブル名、パイプライン名など）
    pub source: String,
    /// 変換処理の説明
    #[serde(default)]
    pub transformation: Option<String>,
    /// 依存する上流特徴量
    #[serde(default)]
    pub upstream_features: Vec<String>,
}

impl Provenance {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            transformation: None,
            upstream_features: Vec::new(),
        }
    }

    pub fn with_transformation(mut self, transformation: impl Into<String>) -> Self {
        self.transformation = Some(transformation.into());
        self
    }

    pub fn with_upstream(mut self, feature: impl Into<String>) -> Self {
        self.upstream_features.push(feature.into());
        self
    }
}

/// 品質スコア（各値 0.0-1.0）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityScores {
    pub completeness: f64,
    pub accuracy: f64,
    pub consistency: f64,
    pub timeliness: f64,
}

impl QualityScores {
    /// 新しい品質スコアを作成（範囲外は丸める）
    pub fn new(completeness: f64, accuracy: f64, consistency: f64, timeliness: f64) -> Self {
        Self {
            completeness: clamp_unit(completeness),
            accuracy: clamp_unit(accuracy),
            consistency: clamp_unit(consistency),
            timeliness: clamp_unit(timeliness),
        }
    }

    /// 全スコアの平均
    pub fn overall(&self) -> f64 {
        (self.completeness + self.accuracy + self.consistency + self.timeliness) / 4.0
    }
}

impl Default for QualityScores {
    fn default() -> Self {
        Self::new(0.0, 0.0, 0.0, 0.0)
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// 特徴量統計
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureStatistics {
    /// 非NULLサンプル数
    pub count: u64,
    pub mean: f64,
    /// 母標準偏差
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    /// パーセンタイル（キー: 1-99）
    #[serde(default)]
    pub percentiles: BTreeMap<u8, f64>,
    pub null_count: u64,
}

impl FeatureStatistics {
    /// 観測値（NULLを含む）から統計を計算
    pub fn from_values(values: &[Option<f64>]) -> Self {
        let mut present: Vec<f64> = values
            .iter()
            .flatten()
            .copied()
            .filter(|v| v.is_finite())
            .collect();
        let null_count = (values.len() - present.len()) as u64;

        if present.is_empty() {
            return Self {
                null_count,
                ..Self::default()
            };
        }

        present.sort_by(|a, b| a.total_cmp(b));
        let n = present.len() as f64;
        let mean = present.iter().sum::<f64>() / n;
        let variance = present.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

        let percentiles = [5u8, 25, 50, 75, 95]
            .into_iter()
            .map(|p| (p, percentile(&present, p as f64 / 100.0)))
            .collect();

        Self {
            count: present.len() as u64,
            mean,
            std_dev: variance.sqrt(),
            min: present[0],
            max: present[present.len() - 1],
            percentiles,
            null_count,
        }
    }

    /// NULL比率（サンプルなしは0）
    pub fn null_ratio(&self) -> f64 {
        let total = self.count + self.null_count;
        if total == 0 {
            0.0
        } else {
            self.null_count as f64 / total as f64
        }
    }

    /// 2つの統計をプールして統合
    ///
    /// count/mean/std_dev はプール計算、min/max は範囲の和、null_count は合算。
    /// パーセンタイルはマージできないため新しい側の値を採用する。
    pub fn merge(&self, newer: &FeatureStatistics) -> FeatureStatistics {
        if self.count == 0 {
            return FeatureStatistics {
                null_count: self.null_count + newer.null_count,
                ..newer.clone()
            };
        }
        if newer.count == 0 {
            return FeatureStatistics {
                null_count: self.null_count + newer.null_count,
                ..self.clone()
            };
        }

        let n1 = self.count as f64;
        let n2 = newer.count as f64;
        let n = n1 + n2;
        let mean = (n1 * self.mean + n2 * newer.mean) / n;
        let variance = (n1 * (self.std_dev.powi(2) + (self.mean - mean).powi(2))
            + n2 * (newer.std_dev.powi(2) + (newer.mean - mean).powi(2)))
            / n;

        let percentiles = if newer.percentiles.is_empty() {
            self.percentiles.clone()
        } else {
            newer.percentiles.clone()
        };

        FeatureStatistics {
            count: self.count + newer.count,
            mean,
            std_dev: variance.max(0.0).sqrt(),
            min: self.min.min(newer.min),
            max: self.max.max(newer.max),
            percentiles,
            null_count: self.null_count + newer.null_count,
        }
    }
}

impl Default for FeatureStatistics {
    fn default() -> Self {
        Self {
            count: 0,
            mean: 0.0,
            std_dev: 0.0,
            min: 0.0,
            max: 0.0,
            percentiles: BTreeMap::new(),
            null_count: 0,
        }
    }
}

fn percentile(sorted_values: &[f64], p: f64) -> f64 {
    if sorted_values.is_empty() {
        return 0.0;
    }

    let index = (p * (sorted_values.len() - 1) as f64).round() as usize;
    sorted_values[index.min(sorted_values.len() - 1)]
}

/// 利用カウンタ
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageCounters {
    /// この特徴量を使った予測数
    pub prediction_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// 登録リクエスト
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureDefinition {
    pub name: String,
    /// 省略時は自動採番
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub description: Option<String>,
    pub value_kind: ValueKind,
    pub provenance: Provenance,
    pub cadence: UpdateCadence,
}

impl FeatureDefinition {
    pub fn new(
        name: impl Into<String>,
        value_kind: ValueKind,
        provenance: Provenance,
        cadence: UpdateCadence,
    ) -> Self {
        Self {
            name: name.into(),
            version: None,
            description: None,
            value_kind,
            provenance,
            cadence,
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// 登録済み特徴量
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: FeatureId,
    pub name: String,
    pub version: u32,
    pub description: Option<String>,
    pub value_kind: ValueKind,
    pub provenance: Provenance,
    pub cadence: UpdateCadence,
    pub quality: QualityScores,
    pub statistics: Option<FeatureStatistics>,
    pub usage: UsageCounters,
    /// 物理削除はせず非アクティブ化のみ
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub statistics_updated_at: Option<DateTime<Utc>>,
}

impl Feature {
    /// 定義から新しいバージョンを作成
    pub(crate) fn from_definition(definition: FeatureDefinition, version: u32) -> Self {
        let now = Utc::now();
        Self {
            id: FeatureId::new(),
            name: definition.name,
            version,
            description: definition.description,
            value_kind: definition.value_kind,
            provenance: definition.provenance,
            cadence: definition.cadence,
            quality: QualityScores::default(),
            statistics: None,
            usage: UsageCounters::default(),
            active: true,
            created_at: now,
            updated_at: now,
            statistics_updated_at: None,
        }
    }

    /// 意味的に同じ定義か（説明文の違いは無視）
    pub fn same_semantics(&self, definition: &FeatureDefinition) -> bool {
        self.value_kind == definition.value_kind
            && self.provenance == definition.provenance
            && self.cadence == definition.cadence
    }

    pub fn null_ratio(&self) -> Option<f64> {
        self.statistics.as_ref().map(FeatureStatistics::null_ratio)
    }

    /// 本番利用可能か
    pub fn is_production_ready(&self) -> bool {
        self.readiness_issues().is_empty()
    }

    /// 本番利用を妨げている理由の一覧
    pub fn readiness_issues(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.quality.completeness < MIN_COMPLETENESS {
            issues.push(format!(
                "completeness {:.3} < {:.2}",
                self.quality.completeness, MIN_COMPLETENESS
            ));
        }
        if self.quality.accuracy < MIN_ACCURACY {
            issues.push(format!(
                "accuracy {:.3} < {:.2}",
                self.quality.accuracy, MIN_ACCURACY
            ));
        }
        if self.quality.consistency < MIN_CONSISTENCY {
            issues.push(format!(
                "consistency {:.3} < {:.2}",
                self.quality.consistency, MIN_CONSISTENCY
            ));
        }
        match self.null_ratio() {
            Some(ratio) if ratio >= MAX_NULL_RATIO => {
                issues.push(format!("null ratio {:.3} >= {:.2}", ratio, MAX_NULL_RATIO));
            }
            Some(_) => {}
            None => issues.push("no statistics recorded".to_string()),
        }

        issues
    }
}

/// 特徴量への単一の変更
///
/// ストレージは読み取りから書き込みまでを1つの原子的な操作として適用する。
/// 変更ごとに触るフィールドが分かれているため、並行に適用しても互いを上書きしない。
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureChange {
    /// 累積統計に統合
    MergeStatistics {
        statistics: FeatureStatistics,
        at: DateTime<Utc>,
    },
    SetQuality {
        quality: QualityScores,
        at: DateTime<Utc>,
    },
    /// 利用カウンタを1増やす
    RecordUsage { at: DateTime<Utc> },
    Deactivate { at: DateTime<Utc> },
}

impl FeatureChange {
    /// 変更を適用し、内容が変わったかを返す
    pub fn apply(&self, feature: &mut Feature) -> bool {
        match self {
            Self::MergeStatistics { statistics, at } => {
                let merged = match &feature.statistics {
                    Some(existing) => existing.merge(statistics),
                    None => statistics.clone(),
                };
                feature.statistics = Some(merged);
                feature.statistics_updated_at =
                    Some(feature.statistics_updated_at.map_or(*at, |last| last.max(*at)));
            }
            Self::SetQuality { quality, .. } => {
                feature.quality = QualityScores::new(
                    quality.completeness,
                    quality.accuracy,
                    quality.consistency,
                    quality.timeliness,
                );
            }
            Self::RecordUsage { at } => {
                feature.usage.prediction_count += 1;
                feature.usage.last_used_at =
                    Some(feature.usage.last_used_at.map_or(*at, |last| last.max(*at)));
                return true;
            }
            Self::Deactivate { .. } => {
                if !feature.active {
                    return false;
                }
                feature.active = false;
            }
        }
        feature.updated_at = feature.updated_at.max(self.at());
        true
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Self::MergeStatistics { at, .. }
            | Self::SetQuality { at, .. }
            | Self::RecordUsage { at }
            | Self::Deactivate { at } => *at,
        }
    }
}

/// 原子的な変更の前後
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTransition {
    pub before: Feature,
    pub after: Feature,
}

/// 統計履歴エントリ（ドリフト基準線用）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsRecord {
    pub feature_id: FeatureId,
    pub recorded_at: DateTime<Utc>,
    pub statistics: FeatureStatistics,
}
