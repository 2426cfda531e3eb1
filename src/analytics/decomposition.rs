//! Seasonal Decomposition
//!
//! 1本のシリーズをトレンド・季節・残差に分解する。外部の予測モデルを
//! 置き換えるものではなく、説明可能な統計的ベースラインとして使う。

use crate::error::Result;
use crate::metrics::{MetricObservation, SeriesQuery};
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// 季節バケット
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeasonalBucket {
    /// 曜日（7バケット）
    #[default]
    DayOfWeek,
    /// 月（12バケット）
    Month,
    /// 四半期（4バケット）
    Quarter,
    /// 時（24バケット）
    HourOfDay,
}

impl SeasonalBucket {
    /// タイムスタンプが属するバケット
    pub fn key(&self, timestamp: DateTime<Utc>) -> u8 {
        match self {
            Self::DayOfWeek => timestamp.weekday().number_from_monday() as u8,
            Self::Month => timestamp.month() as u8,
            Self::Quarter => ((timestamp.month() - 1) / 3 + 1) as u8,
            Self::HourOfDay => timestamp.hour() as u8,
        }
    }

    pub fn bucket_count(&self) -> usize {
        match self {
            Self::DayOfWeek => 7,
            Self::Month => 12,
            Self::Quarter => 4,
            Self::HourOfDay => 24,
        }
    }
}

/// 分解設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecompositionConfig {
    /// 移動平均の窓幅
    pub window: usize,
    /// 分解に必要な最小点数
    pub min_points: usize,
    pub bucket: SeasonalBucket,
}

impl Default for DecompositionConfig {
    fn default() -> Self {
        Self {
            window: 30,
            min_points: 7,
            bucket: SeasonalBucket::DayOfWeek,
        }
    }
}

/// 分解結果
///
/// 各系列はタイムスタンプで整列している。点数不足の場合はすべて空。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decomposition {
    pub bucket: SeasonalBucket,
    pub timestamps: Vec<DateTime<Utc>>,
    pub values: Vec<f64>,
    pub trend: Vec<f64>,
    /// 各点の季節係数
    pub seasonal: Vec<f64>,
    pub residual: Vec<f64>,
    /// バケット → 季節係数
    pub factors: BTreeMap<u8, f64>,
}

impl Decomposition {
    fn empty(bucket: SeasonalBucket) -> Self {
        Self {
            bucket,
            timestamps: Vec::new(),
            values: Vec::new(),
            trend: Vec::new(),
            seasonal: Vec::new(),
            residual: Vec::new(),
            factors: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// trend × seasonal + residual
    pub fn reconstruct(&self, index: usize) -> Option<f64> {
        Some(self.trend.get(index)? * self.seasonal.get(index)? + self.residual.get(index)?)
    }

    /// 季節成分の強さ（0.0-1.0）
    ///
    /// 1 − Var(残差) / Var(季節寄与 + 残差)。季節寄与は trend × (係数 − 1)。
    pub fn seasonal_strength(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }

        let detrended: Vec<f64> = self
            .trend
            .iter()
            .zip(&self.seasonal)
            .zip(&self.residual)
            .map(|((t, s), r)| t * (s - 1.0) + r)
            .collect();

        let total = population_variance(&detrended);
        if total < f64::EPSILON {
            return 0.0;
        }
        (1.0 - population_variance(&self.residual) / total).clamp(0.0, 1.0)
    }
}

/// 季節分解エンジン
#[derive(Debug, Clone, Default)]
pub struct SeasonalDecomposer {
    config: DecompositionConfig,
}

impl SeasonalDecomposer {
    pub fn new(config: DecompositionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DecompositionConfig {
        &self.config
    }

    /// (時刻, 値) の列を分解
    pub fn decompose(&self, points: &[(DateTime<Utc>, f64)]) -> Decomposition {
        let bucket = self.config.bucket;
        if points.len() < self.config.min_points.max(1) {
            debug!(points = points.len(), min = self.config.min_points, "series too short to decompose");
            return Decomposition::empty(bucket);
        }

        let mut sorted = points.to_vec();
        sorted.sort_by_key(|(timestamp, _)| *timestamp);
        let (timestamps, values): (Vec<DateTime<Utc>>, Vec<f64>) = sorted.into_iter().unzip();

        let trend = centered_moving_average(&values, self.config.window);
        let factors = seasonal_factors(&timestamps, &values, bucket);

        let seasonal: Vec<f64> = timestamps
            .iter()
            .map(|ts| factors.get(&bucket.key(*ts)).copied().unwrap_or(1.0))
            .collect();
        let residual: Vec<f64> = values
            .iter()
            .zip(&trend)
            .zip(&seasonal)
            .map(|((v, t), s)| v - t * s)
            .collect();

        Decomposition {
            bucket,
            timestamps,
            values,
            trend,
            seasonal,
            residual,
            factors,
        }
    }

    /// 観測列を分解
    pub fn decompose_observations(&self, observations: &[MetricObservation]) -> Decomposition {
        let points: Vec<(DateTime<Utc>, f64)> = observations
            .iter()
            .map(|o| (o.timestamp, o.numeric_value()))
            .collect();
        self.decompose(&points)
    }

    /// クエリ結果（最新側から行数上限まで）を分解
    pub async fn decompose_query(&self, query: &SeriesQuery) -> Result<Decomposition> {
        let observations = query.collect().await?;
        query.ensure_single_series(&observations)?;
        Ok(self.decompose_observations(&observations))
    }
}

/// 中心移動平均（境界では窓を切り詰める）
///
/// 偶数窓では中心の右側が1点多い。
fn centered_moving_average(values: &[f64], window: usize) -> Vec<f64> {
    let n = values.len();
    let window = window.max(1);
    let before = (window - 1) / 2;
    let after = window - 1 - before;

    let mut prefix = Vec::with_capacity(n + 1);
    prefix.push(0.0);
    for value in values {
        prefix.push(prefix[prefix.len() - 1] + value);
    }

    (0..n)
        .map(|i| {
            let lo = i.saturating_sub(before);
            let hi = (i + after).min(n - 1);
            (prefix[hi + 1] - prefix[lo]) / (hi + 1 - lo) as f64
        })
        .collect()
}

/// バケットごとの季節係数（バケット平均 / 全体平均）
fn seasonal_factors(timestamps: &[DateTime<Utc>], values: &[f64], bucket: SeasonalBucket) -> BTreeMap<u8, f64> {
    let overall = values.iter().sum::<f64>() / values.len() as f64;

    let mut sums: BTreeMap<u8, (f64, usize)> = BTreeMap::new();
    for (timestamp, value) in timestamps.iter().zip(values) {
        let entry = sums.entry(bucket.key(*timestamp)).or_insert((0.0, 0));
        entry.0 += value;
        entry.1 += 1;
    }

    if overall == 0.0 || !overall.is_finite() {
        warn!(?bucket, "series mean is zero, seasonal factors fixed at 1.0");
        return sums.into_keys().map(|key| (key, 1.0)).collect();
    }

    sums.into_iter()
        .map(|(key, (sum, count))| (key, (sum / count as f64) / overall))
        .collect()
}

fn population_variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn daily(values: &[f64]) -> Vec<(DateTime<Utc>, f64)> {
        // 2024-01-01 は月曜日
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        values
            .iter()
            .enumerate()
            .map(|(i, v)| (start + Duration::days(i as i64), *v))
            .collect()
    }

    #[test]
    fn test_short_series_is_empty() {
        let result = SeasonalDecomposer::default().decompose(&daily(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]));
        assert!(result.is_empty());
        assert!(result.trend.is_empty());
        assert!(result.residual.is_empty());
        assert_eq!(result.seasonal_strength(), 0.0);
    }

    #[test]
    fn test_identity_holds() {
        let values: Vec<f64> = (0..60)
            .map(|i| 100.0 + i as f64 * 0.5 + if i % 7 >= 5 { -20.0 } else { 5.0 })
            .collect();
        let result = SeasonalDecomposer::default().decompose(&daily(&values));

        assert_eq!(result.len(), 60);
        for i in 0..result.len() {
            let rebuilt = result.reconstruct(i).unwrap();
            assert!((rebuilt - values[i]).abs() < 1e-9, "index {}", i);
        }
    }

    #[test]
    fn test_factor_shared_within_bucket() {
        let values: Vec<f64> = (0..28).map(|i| if i % 7 == 0 { 20.0 } else { 10.0 }).collect();
        let result = SeasonalDecomposer::default().decompose(&daily(&values));

        let mondays: Vec<f64> = (0..28).step_by(7).map(|i| result.seasonal[i]).collect();
        assert!(mondays.iter().all(|f| *f == mondays[0]));
        assert!(mondays[0] > 1.0);
        assert_eq!(result.factors.len(), 7);
        assert!(result.seasonal_strength() > 0.5);
    }

    #[test]
    fn test_zero_mean_uses_unit_factor() {
        let values = [-2.0, 2.0, -1.0, 1.0, -3.0, 3.0, 0.0, 0.0];
        let result = SeasonalDecomposer::default().decompose(&daily(&values));
        assert!(result.seasonal.iter().all(|f| *f == 1.0));
        for i in 0..values.len() {
            assert!((result.reconstruct(i).unwrap() - values[i]).abs() < 1e-12);
        }
    }

    #[test]
    fn test_moving_average_truncates_at_edges() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        let trend = centered_moving_average(&values, 3);
        assert_eq!(trend, vec![1.5, 2.0, 3.0, 4.0, 4.5]);

        // 偶数窓: 左1点、右2点
        let trend = centered_moving_average(&values, 4);
        assert_eq!(trend[0], 2.0);
        assert_eq!(trend[2], 3.5);
        assert_eq!(trend[4], 4.5);
    }

    #[test]
    fn test_unsorted_input_is_ordered() {
        let mut points = daily(&[5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0]);
        points.reverse();
        let result = SeasonalDecomposer::default().decompose(&points);
        assert!(result.timestamps.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(result.values[0], 5.0);
    }

    #[test]
    fn test_month_bucket() {
        let start = Utc.with_ymd_and_hms(2023, 1, 15, 0, 0, 0).unwrap();
        let points: Vec<(DateTime<Utc>, f64)> = (0..24)
            .map(|m| (start + Duration::days(30 * m), 50.0 + (m % 12) as f64))
            .collect();
        let decomposer = SeasonalDecomposer::new(DecompositionConfig {
            window: 12,
            bucket: SeasonalBucket::Month,
            ..Default::default()
        });
        let result = decomposer.decompose(&points);
        assert_eq!(result.bucket, SeasonalBucket::Month);
        assert!(result.factors.len() <= 12);
        for i in 0..result.len() {
            assert!((result.reconstruct(i).unwrap() - result.values[i]).abs() < 1e-9);
        }
    }
}
