//! Anomaly Detection
//!
//! 直近の窓内で平均 ± k×母標準偏差 の外にある点を異常とする

use crate::error::Result;
use crate::metrics::{MetricObservation, ObservationId, SeriesQuery};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// 異常検知設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// 対象とする直近の点数
    pub lookback: usize,
    /// 標準偏差の倍率
    pub k: f64,
    /// 検知に必要な最小点数
    pub min_points: usize,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            lookback: 30,
            k: 2.0,
            min_points: 7,
        }
    }
}

/// 外れの方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyDirection {
    Above,
    Below,
}

/// 検知された異常
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation_id: Option<ObservationId>,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub z_score: f64,
    pub direction: AnomalyDirection,
    /// 異常度（0.0-1.0）
    pub score: f64,
}

/// 1シリーズ分の検知結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyScan {
    /// 窓内の点数（点数不足なら0）
    pub points_examined: usize,
    pub mean: f64,
    pub std_dev: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub anomalies: Vec<Anomaly>,
}

impl AnomalyScan {
    fn empty() -> Self {
        Self {
            points_examined: 0,
            mean: 0.0,
            std_dev: 0.0,
            lower_bound: 0.0,
            upper_bound: 0.0,
            anomalies: Vec::new(),
        }
    }

    pub fn has_anomalies(&self) -> bool {
        !self.anomalies.is_empty()
    }
}

struct WindowPoint {
    id: Option<ObservationId>,
    timestamp: DateTime<Utc>,
    value: f64,
}

/// 異常検知器
#[derive(Debug, Clone, Default)]
pub struct AnomalyDetector {
    config: AnomalyConfig,
}

impl AnomalyDetector {
    /// 新しい異常検知器を作成
    pub fn new(config: AnomalyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AnomalyConfig {
        &self.config
    }

    /// (時刻, 値) の列から異常を検知
    pub fn detect(&self, points: &[(DateTime<Utc>, f64)]) -> AnomalyScan {
        self.scan(
            points
                .iter()
                .map(|(timestamp, value)| WindowPoint {
                    id: None,
                    timestamp: *timestamp,
                    value: *value,
                })
                .collect(),
        )
    }

    /// 観測列から異常を検知（結果に観測IDを含む）
    pub fn detect_observations(&self, observations: &[MetricObservation]) -> AnomalyScan {
        self.scan(
            observations
                .iter()
                .map(|o| WindowPoint {
                    id: Some(o.id),
                    timestamp: o.timestamp,
                    value: o.numeric_value(),
                })
                .collect(),
        )
    }

    /// クエリ結果の直近 lookback 件を検知
    pub async fn detect_query(&self, query: &SeriesQuery) -> Result<AnomalyScan> {
        let observations = query.tail(self.config.lookback.max(1)).await?;
        query.ensure_single_series(&observations)?;
        Ok(self.detect_observations(&observations))
    }

    fn scan(&self, mut points: Vec<WindowPoint>) -> AnomalyScan {
        points.sort_by_key(|p| p.timestamp);
        let skip = points.len().saturating_sub(self.config.lookback.max(1));
        let window = &points[skip..];

        if window.len() < self.config.min_points.max(1) {
            debug!(points = window.len(), min = self.config.min_points, "window too short for anomaly detection");
            return AnomalyScan::empty();
        }

        let n = window.len() as f64;
        let mean = window.iter().map(|p| p.value).sum::<f64>() / n;
        let variance = window.iter().map(|p| (p.value - mean).powi(2)).sum::<f64>() / n;
        let std_dev = variance.sqrt();
        let k = self.config.k;
        let lower_bound = mean - k * std_dev;
        let upper_bound = mean + k * std_dev;

        if std_dev < f64::EPSILON {
            warn!(points = window.len(), "zero variance window, no anomalies possible");
        }

        let anomalies = window
            .iter()
            .filter(|p| p.value < lower_bound || p.value > upper_bound)
            .map(|p| {
                let z_score = if std_dev > 0.0 { (p.value - mean) / std_dev } else { 0.0 };
                Anomaly {
                    observation_id: p.id,
                    timestamp: p.timestamp,
                    value: p.value,
                    z_score,
                    direction: if p.value > upper_bound {
                        AnomalyDirection::Above
                    } else {
                        AnomalyDirection::Below
                    },
                    score: anomaly_score(z_score, k),
                }
            })
            .collect();

        AnomalyScan {
            points_examined: window.len(),
            mean,
            std_dev,
            lower_bound,
            upper_bound,
            anomalies,
        }
    }
}

/// z が k で 0.5、2k 以上で 1.0
fn anomaly_score(z_score: f64, k: f64) -> f64 {
    if k <= 0.0 {
        return 1.0;
    }
    (z_score.abs() / (k * 2.0)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn series(values: &[f64]) -> Vec<(DateTime<Utc>, f64)> {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        values
            .iter()
            .enumerate()
            .map(|(i, v)| (start + Duration::days(i as i64), *v))
            .collect()
    }

    #[test]
    fn test_constant_series_with_one_spike() {
        let mut values = vec![50.0; 30];
        values.push(65.0);
        let scan = AnomalyDetector::default().detect(&series(&values));

        assert_eq!(scan.points_examined, 30);
        assert_eq!(scan.anomalies.len(), 1);
        let spike = &scan.anomalies[0];
        assert_eq!(spike.value, 65.0);
        assert_eq!(spike.direction, AnomalyDirection::Above);
        assert!(spike.z_score > 2.0);
        assert!(spike.score > 0.5 && spike.score <= 1.0);
    }

    #[test]
    fn test_three_sigma_point_flagged_alone() {
        // 平均10・標準偏差1の系列に 10 + 3σ を追加
        let mut values: Vec<f64> = (0..30).map(|i| if i % 2 == 0 { 9.0 } else { 11.0 }).collect();
        values.push(13.0);
        let detector = AnomalyDetector::new(AnomalyConfig {
            lookback: 31,
            ..Default::default()
        });

        let scan = detector.detect(&series(&values));
        assert_eq!(scan.anomalies.len(), 1);
        assert_eq!(scan.anomalies[0].value, 13.0);
    }

    #[test]
    fn test_short_window_is_empty() {
        let scan = AnomalyDetector::default().detect(&series(&[1.0, 1.0, 1.0, 1.0, 1.0, 100.0]));
        assert_eq!(scan.points_examined, 0);
        assert!(!scan.has_anomalies());
    }

    #[test]
    fn test_zero_variance_has_no_anomalies() {
        let scan = AnomalyDetector::default().detect(&series(&[7.0; 12]));
        assert_eq!(scan.std_dev, 0.0);
        assert!(scan.anomalies.is_empty());
    }

    #[test]
    fn test_lookback_ignores_old_points() {
        let mut values = vec![1000.0];
        values.extend(std::iter::repeat(5.0).take(29));
        values.push(5.5);
        // 1000 は窓外、残りは 5.0 ×29 と 5.5
        let scan = AnomalyDetector::default().detect(&series(&values));
        assert_eq!(scan.points_examined, 30);
        assert_eq!(scan.anomalies.len(), 1);
        assert_eq!(scan.anomalies[0].value, 5.5);
    }

    #[test]
    fn test_below_direction() {
        let mut values = vec![20.0; 15];
        values.push(2.0);
        let scan = AnomalyDetector::default().detect(&series(&values));
        assert_eq!(scan.anomalies.len(), 1);
        assert_eq!(scan.anomalies[0].direction, AnomalyDirection::Below);
        assert!(scan.anomalies[0].z_score < 0.0);
    }
}
