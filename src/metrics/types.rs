//! メトリクス型定義

use crate::calendar::{HolidayCalendar, SeasonalityTags};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use uuid::Uuid;

/// メトリクスの種類
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    /// 収集量（kg）
    CollectionVolume,
    /// ルート所要時間（分）
    RouteDuration,
    /// 燃料消費（L）
    FuelConsumption,
    /// サービス時間（分）
    ServiceTime,
    /// 解約リスク（%）
    CustomerChurnRisk,
    /// 顧客満足度（%）
    CustomerSatisfaction,
    /// 回収漏れ件数
    MissedPickups,
    /// 車両稼働率（%）
    VehicleUtilization,
    /// カスタムメトリクス
    Custom(String),
}

impl MetricType {
    /// メトリクス名を取得
    pub fn name(&self) -> &str {
        match self {
            Self::CollectionVolume => "collection_volume",
            Self::RouteDuration => "route_duration",
            Self::FuelConsumption => "fuel_consumption",
            Self::ServiceTime => "service_time",
            Self::CustomerChurnRisk => "customer_churn_risk",
            Self::CustomerSatisfaction => "customer_satisfaction",
            Self::MissedPickups => "missed_pickups",
            Self::VehicleUtilization => "vehicle_utilization",
            Self::Custom(name) => name,
        }
    }

    /// 単位を取得
    pub fn unit(&self) -> &str {
        match self {
            Self::CollectionVolume => "kg",
            Self::RouteDuration | Self::ServiceTime => "min",
            Self::FuelConsumption => "l",
            Self::CustomerChurnRisk | Self::CustomerSatisfaction | Self::VehicleUtilization => "%",
            Self::MissedPickups => "count",
            Self::Custom(_) => "",
        }
    }

    /// 名前から復元（未知の名前はカスタム扱い）
    pub fn from_name(name: &str) -> Self {
        match name {
            "collection_volume" => Self::CollectionVolume,
            "route_duration" => Self::RouteDuration,
            "fuel_consumption" => Self::FuelConsumption,
            "service_time" => Self::ServiceTime,
            "customer_churn_risk" => Self::CustomerChurnRisk,
            "customer_satisfaction" => Self::CustomerSatisfaction,
            "missed_pickups" => Self::MissedPickups,
            "vehicle_utilization" => Self::VehicleUtilization,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 集計粒度
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AggregationLevel {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
}

impl AggregationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Quarterly => "quarterly",
            Self::Yearly => "yearly",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "hourly" => Some(Self::Hourly),
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            "monthly" => Some(Self::Monthly),
            "quarterly" => Some(Self::Quarterly),
            "yearly" => Some(Self::Yearly),
            _ => None,
        }
    }
}

/// 品質ティア
///
/// 順序は low < medium < high。estimated は順序の外にあり、
/// 最低品質フィルタ指定時は除外される。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    Low,
    Medium,
    High,
    Estimated,
}

impl QualityTier {
    /// 順序ランク（estimated は None）
    pub fn rank(&self) -> Option<u8> {
        match self {
            Self::Low => Some(0),
            Self::Medium => Some(1),
            Self::High => Some(2),
            Self::Estimated => None,
        }
    }

    /// 要求ティア以上か
    ///
    /// estimated を要求した場合は estimated のみ一致する。
    pub fn meets(&self, minimum: QualityTier) -> bool {
        match (self.rank(), minimum.rank()) {
            (Some(actual), Some(required)) => actual >= required,
            (None, None) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Estimated => "estimated",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "estimated" => Some(Self::Estimated),
            _ => None,
        }
    }
}

/// 観測ID
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObservationId(pub Uuid);

impl ObservationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ObservationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn dimension_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:\-]{0,63}$").expect("dimension key pattern is valid")
    })
}

/// ディメンションキー
///
/// 観測ではシリーズの対象範囲、クエリでは一致条件（None は任意）として使う。
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DimensionKeys {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_id: Option<String>,
}

impl DimensionKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn customer(mut self, id: impl Into<String>) -> Self {
        self.customer_id = Some(id.into());
        self
    }

    pub fn route(mut self, id: impl Into<String>) -> Self {
        self.route_id = Some(id.into());
        self
    }

    pub fn vehicle(mut self, id: impl Into<String>) -> Self {
        self.vehicle_id = Some(id.into());
        self
    }

    pub fn driver(mut self, id: impl Into<String>) -> Self {
        self.driver_id = Some(id.into());
        self
    }

    pub fn region(mut self, id: impl Into<String>) -> Self {
        self.region_id = Some(id.into());
        self
    }

    /// (名前, 値) の組を列挙
    pub fn entries(&self) -> [(&'static str, Option<&str>); 5] {
        [
            ("customer_id", self.customer_id.as_deref()),
            ("route_id", self.route_id.as_deref()),
            ("vehicle_id", self.vehicle_id.as_deref()),
            ("driver_id", self.driver_id.as_deref()),
            ("region_id", self.region_id.as_deref()),
        ]
    }

    /// キーの形式を検証
    pub fn validate(&self) -> Result<()> {
        for (name, value) in self.entries() {
            if let Some(value) = value {
                if !dimension_pattern().is_match(value) {
                    return Err(Error::validation(format!(
                        "malformed dimension key {}={:?}",
                        name, value
                    )));
                }
            }
        }
        Ok(())
    }

    /// フィルタとして観測のキーに一致するか
    pub fn matches(&self, observed: &DimensionKeys) -> bool {
        self.entries()
            .iter()
            .zip(observed.entries().iter())
            .all(|((_, wanted), (_, actual))| match wanted {
                Some(wanted) => *actual == Some(*wanted),
                None => true,
            })
    }
}

/// 値スロット（書き込み入力）
///
/// ちょうど1つだけ設定されていなければならない。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValueSlots {
    #[serde(default)]
    pub count: Option<i64>,
    #[serde(default)]
    pub measure: Option<f64>,
    #[serde(default)]
    pub percentage: Option<f64>,
    #[serde(default)]
    pub currency: Option<f64>,
}

impl ValueSlots {
    /// 単一の値に変換
    pub fn into_value(self) -> Result<MetricValue> {
        let populated = [
            self.count.is_some(),
            self.measure.is_some(),
            self.percentage.is_some(),
            self.currency.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();

        if populated != 1 {
            return Err(Error::validation(format!(
                "exactly one value slot must be populated, found {}",
                populated
            )));
        }

        let value = match self {
            ValueSlots { count: Some(v), .. } => MetricValue::Count(v),
            ValueSlots {
                measure: Some(v), ..
            } => MetricValue::Measure(v),
            ValueSlots {
                percentage: Some(v),
                ..
            } => MetricValue::Percentage(v),
            ValueSlots {
                currency: Some(v), ..
            } => MetricValue::Currency(v),
            _ => unreachable!("populated slot count checked above"),
        };

        if !value.as_f64().is_finite() {
            return Err(Error::validation("metric value must be finite"));
        }
        if let MetricValue::Percentage(p) = value {
            if !(0.0..=100.0).contains(&p) {
                return Err(Error::validation(format!(
                    "percentage {} outside [0, 100]",
                    p
                )));
            }
        }

        Ok(value)
    }
}

/// 検証済みのメトリクス値
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MetricValue {
    Count(i64),
    Measure(f64),
    Percentage(f64),
    Currency(f64),
}

impl MetricValue {
    pub fn as_f64(&self) -> f64 {
        match *self {
            Self::Count(v) => v as f64,
            Self::Measure(v) | Self::Percentage(v) | Self::Currency(v) => v,
        }
    }
}

/// 事前計算済み集計値
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregateBundle {
    pub sample_count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
}

impl AggregateBundle {
    /// 単一値の集計
    pub fn single(value: f64) -> Self {
        Self {
            sample_count: 1,
            sum: value,
            min: value,
            max: value,
            mean: value,
            std_dev: 0.0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let fields = [self.sum, self.min, self.max, self.mean, self.std_dev];
        if fields.iter().any(|v| !v.is_finite()) {
            return Err(Error::validation("aggregate values must be finite"));
        }
        if self.sample_count == 0 {
            return Err(Error::validation("aggregate sample_count must be positive"));
        }
        if self.min > self.max || self.mean < self.min || self.mean > self.max {
            return Err(Error::validation(format!(
                "aggregate bounds inconsistent: min={} mean={} max={}",
                self.min, self.mean, self.max
            )));
        }
        if self.std_dev < 0.0 {
            return Err(Error::validation("aggregate std_dev must be non-negative"));
        }
        Ok(())
    }
}

/// シリーズ識別子
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    pub metric_type: MetricType,
    pub metric_name: String,
    #[serde(default)]
    pub dimensions: DimensionKeys,
    pub aggregation: AggregationLevel,
}

impl SeriesKey {
    pub fn new(
        metric_type: MetricType,
        metric_name: impl Into<String>,
        aggregation: AggregationLevel,
    ) -> Self {
        Self {
            metric_type,
            metric_name: metric_name.into(),
            dimensions: DimensionKeys::default(),
            aggregation,
        }
    }

    pub fn with_dimensions(mut self, dimensions: DimensionKeys) -> Self {
        self.dimensions = dimensions;
        self
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@{}",
            self.metric_type,
            self.metric_name,
            self.aggregation.as_str()
        )?;
        for (name, value) in self.dimensions.entries() {
            if let Some(value) = value {
                write!(f, "[{}={}]", name, value)?;
            }
        }
        Ok(())
    }
}

/// 書き込み用の観測
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewObservation {
    pub series: SeriesKey,
    pub timestamp: DateTime<Utc>,
    pub slots: ValueSlots,
    #[serde(default)]
    pub aggregates: Option<AggregateBundle>,
    pub quality: QualityTier,
    pub confidence: f64,
}

impl NewObservation {
    /// 計測値1件の観測を作成
    pub fn measure(series: SeriesKey, timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            series,
            timestamp,
            slots: ValueSlots {
                measure: Some(value),
                ..ValueSlots::default()
            },
            aggregates: None,
            quality: QualityTier::High,
            confidence: 1.0,
        }
    }

    pub fn with_quality(mut self, quality: QualityTier) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_aggregates(mut self, aggregates: AggregateBundle) -> Self {
        self.aggregates = Some(aggregates);
        self
    }

    /// 検証して永続化可能な観測へ変換（季節性タグはここで導出）
    pub fn validate(self, calendar: &HolidayCalendar) -> Result<MetricObservation> {
        let name = self.series.metric_name.trim();
        if name.is_empty() || name.len() > 128 {
            return Err(Error::validation(
                "metric name must be 1-128 non-blank characters",
            ));
        }
        if let MetricType::Custom(custom) = &self.series.metric_type {
            if custom.trim().is_empty() {
                return Err(Error::validation("custom metric type must be named"));
            }
        }
        self.series.dimensions.validate()?;

        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(Error::validation(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            )));
        }

        let value = self.slots.into_value()?;
        let aggregates = match self.aggregates {
            Some(bundle) => {
                bundle.validate()?;
                bundle
            }
            None => AggregateBundle::single(value.as_f64()),
        };

        Ok(MetricObservation {
            id: ObservationId::new(),
            series: self.series,
            timestamp: self.timestamp,
            value,
            aggregates,
            quality: self.quality,
            confidence: self.confidence,
            seasonality: SeasonalityTags::derive(self.timestamp, calendar),
            recorded_at: Utc::now(),
        })
    }
}

/// 永続化された観測
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricObservation {
    pub id: ObservationId,
    pub series: SeriesKey,
    pub timestamp: DateTime<Utc>,
    pub value: MetricValue,
    pub aggregates: AggregateBundle,
    pub quality: QualityTier,
    pub confidence: f64,
    pub seasonality: SeasonalityTags,
    pub recorded_at: DateTime<Utc>,
}

impl MetricObservation {
    pub fn numeric_value(&self) -> f64 {
        self.value.as_f64()
    }

    /// high 品質は変更不可
    pub fn is_frozen(&self) -> bool {
        self.quality == QualityTier::High
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn series() -> SeriesKey {
        SeriesKey::new(
            MetricType::CollectionVolume,
            "tonnage",
            AggregationLevel::Daily,
        )
        .with_dimensions(DimensionKeys::new().route("R-101").region("north"))
    }

    #[test]
    fn test_metric_type_name_round_trip() {
        assert_eq!(MetricType::RouteDuration.name(), "route_duration");
        assert_eq!(MetricType::from_name("route_duration"), MetricType::RouteDuration);
        assert_eq!(
            MetricType::from_name("bin_overflow"),
            MetricType::Custom("bin_overflow".to_string())
        );
        assert_eq!(MetricType::RouteDuration.unit(), "min");
    }

    #[test]
    fn test_quality_ordering_excludes_estimated() {
        assert!(QualityTier::High.meets(QualityTier::Medium));
        assert!(QualityTier::Medium.meets(QualityTier::Medium));
        assert!(!QualityTier::Low.meets(QualityTier::Medium));
        assert!(!QualityTier::Estimated.meets(QualityTier::Low));
        assert!(QualityTier::Estimated.meets(QualityTier::Estimated));
    }

    #[test]
    fn test_value_slots_require_exactly_one() {
        let empty = ValueSlots::default();
        assert!(empty.into_value().unwrap_err().is_validation());

        let two = ValueSlots {
            count: Some(3),
            measure: Some(1.0),
            ..ValueSlots::default()
        };
        assert!(two.into_value().unwrap_err().is_validation());

        let one = ValueSlots {
            count: Some(3),
            ..ValueSlots::default()
        };
        assert_eq!(one.into_value().unwrap(), MetricValue::Count(3));
    }

    #[test]
    fn test_percentage_range() {
        let slots = ValueSlots {
            percentage: Some(120.0),
            ..ValueSlots::default()
        };
        assert!(slots.into_value().is_err());
    }

    #[test]
    fn test_dimension_validation() {
        assert!(DimensionKeys::new().customer("C-42").validate().is_ok());
        assert!(DimensionKeys::new().customer("").validate().is_err());
        assert!(DimensionKeys::new().route("has space").validate().is_err());
        assert!(DimensionKeys::new().vehicle("x".repeat(65)).validate().is_err());
    }

    #[test]
    fn test_dimension_filter_matching() {
        let observed = DimensionKeys::new().route("R-101").region("north");
        assert!(DimensionKeys::new().matches(&observed));
        assert!(DimensionKeys::new().route("R-101").matches(&observed));
        assert!(!DimensionKeys::new().route("R-102").matches(&observed));
        assert!(!DimensionKeys::new().driver("D-1").matches(&observed));
    }

    #[test]
    fn test_validate_derives_seasonality() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 4, 6, 0, 0).unwrap();
        let observation = NewObservation::measure(series(), ts, 812.5)
            .validate(&HolidayCalendar::new())
            .unwrap();

        assert_eq!(observation.seasonality.day_of_week, 6);
        assert!(observation.seasonality.is_weekend);
        assert_eq!(observation.aggregates, AggregateBundle::single(812.5));
        assert!(observation.is_frozen());
    }

    #[test]
    fn test_validate_rejects_bad_confidence_and_aggregates() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 4, 6, 0, 0).unwrap();
        let err = NewObservation::measure(series(), ts, 1.0)
            .with_confidence(1.5)
            .validate(&HolidayCalendar::new())
            .unwrap_err();
        assert!(err.is_validation());

        let bad_bundle = AggregateBundle {
            sample_count: 4,
            sum: 10.0,
            min: 5.0,
            max: 1.0,
            mean: 2.5,
            std_dev: 1.0,
        };
        let err = NewObservation::measure(series(), ts, 1.0)
            .with_aggregates(bad_bundle)
            .validate(&HolidayCalendar::new())
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_series_key_display() {
        assert_eq!(
            series().to_string(),
            "collection_volume/tonnage@daily[route_id=R-101][region_id=north]"
        );
    }
}
