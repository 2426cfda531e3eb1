//! Series Query
//!
//! 時系列クエリ。結果は時刻順・有限・再実行可能な遅延ストリームで、
//! 行数上限によりメモリ使用量を抑える。上限に達した場合は最新側の行を残す。

use super::types::{
    AggregationLevel, DimensionKeys, MetricObservation, MetricType, ObservationId, QualityTier, SeriesKey,
};
use crate::error::{Error, Result};
use crate::storage::{MetricStorage, ScanOrder};
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// 既定の行数上限
pub const DEFAULT_ROW_CAP: usize = 10_000;
/// 既定のページサイズ
pub const DEFAULT_PAGE_SIZE: usize = 500;

/// 時間範囲 [start, end)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start >= end {
            return Err(Error::validation(format!(
                "time range start {} must precede end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// 終端から遡る範囲
    pub fn trailing(end: DateTime<Utc>, length: chrono::Duration) -> Result<Self> {
        Self::new(end - length, end)
    }

    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.start && timestamp < self.end
    }
}

/// シリーズ検索条件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesFilter {
    pub metric_type: MetricType,
    /// None は同種の全メトリクス名
    #[serde(default)]
    pub metric_name: Option<String>,
    #[serde(default)]
    pub dimensions: DimensionKeys,
    pub aggregation: AggregationLevel,
    pub time_range: TimeRange,
    /// 指定時は estimated を除外し、このティア以上のみ
    #[serde(default)]
    pub min_quality: Option<QualityTier>,
}

impl SeriesFilter {
    pub fn new(metric_type: MetricType, aggregation: AggregationLevel, time_range: TimeRange) -> Self {
        Self {
            metric_type,
            metric_name: None,
            dimensions: DimensionKeys::default(),
            aggregation,
            time_range,
            min_quality: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.metric_name = Some(name.into());
        self
    }

    pub fn with_dimensions(mut self, dimensions: DimensionKeys) -> Self {
        self.dimensions = dimensions;
        self
    }

    pub fn with_min_quality(mut self, quality: QualityTier) -> Self {
        self.min_quality = Some(quality);
        self
    }

    /// 観測が条件に一致するか
    pub fn matches(&self, observation: &MetricObservation) -> bool {
        let series = &observation.series;
        series.metric_type == self.metric_type
            && self
                .metric_name
                .as_ref()
                .map_or(true, |name| *name == series.metric_name)
            && series.aggregation == self.aggregation
            && self.dimensions.matches(&series.dimensions)
            && self.time_range.contains(observation.timestamp)
            && self
                .min_quality
                .map_or(true, |minimum| observation.quality.meets(minimum))
    }
}

/// キーセットページング用カーソル（時刻, ID）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeriesCursor {
    pub timestamp: DateTime<Utc>,
    pub id: ObservationId,
}

impl SeriesCursor {
    pub fn of(observation: &MetricObservation) -> Self {
        Self {
            timestamp: observation.timestamp,
            id: observation.id,
        }
    }

    /// 観測がこのカーソルより後ろにあるか
    pub fn precedes(&self, observation: &MetricObservation) -> bool {
        (observation.timestamp, observation.id) > (self.timestamp, self.id)
    }
}

struct PageState {
    cursor: Option<SeriesCursor>,
    buffer: VecDeque<MetricObservation>,
    emitted: usize,
    exhausted: bool,
}

/// 遅延シリーズクエリ
///
/// `stream()` を呼ぶたびに先頭から再実行する。
#[derive(Clone)]
pub struct SeriesQuery {
    storage: Arc<dyn MetricStorage>,
    filter: SeriesFilter,
    page_size: usize,
    row_cap: usize,
}

impl SeriesQuery {
    pub(crate) fn new(
        storage: Arc<dyn MetricStorage>,
        filter: SeriesFilter,
        page_size: usize,
        row_cap: usize,
    ) -> Self {
        Self {
            storage,
            filter,
            page_size: page_size.max(1),
            row_cap,
        }
    }

    pub fn filter(&self) -> &SeriesFilter {
        &self.filter
    }

    pub fn row_cap(&self) -> usize {
        self.row_cap
    }

    /// 古い順の観測ストリーム（先頭から row_cap 件まで）
    ///
    /// 上限を超える範囲では最新側が切り捨てられる。直近の行が必要な場合は
    /// `collect` か `tail` を使う。
    pub fn stream(&self) -> BoxStream<'_, Result<MetricObservation>> {
        self.scan(ScanOrder::Ascending, self.row_cap)
    }

    /// 最新の n 件（row_cap が上限）を時刻順で取得
    pub async fn tail(&self, n: usize) -> Result<Vec<MetricObservation>> {
        let wanted = n.min(self.row_cap);
        let mut rows: Vec<MetricObservation> = self.scan(ScanOrder::Descending, wanted).try_collect().await?;
        rows.reverse();
        tracing::debug!(
            metric = %self.filter.metric_type,
            rows = rows.len(),
            capped = rows.len() >= self.row_cap,
            "series query collected"
        );
        Ok(rows)
    }

    /// 最新側から row_cap 件までを時刻順で取得
    pub async fn collect(&self) -> Result<Vec<MetricObservation>> {
        self.tail(self.row_cap).await
    }

    /// (時刻, 数値) の組で取得
    pub async fn points(&self) -> Result<Vec<(DateTime<Utc>, f64)>> {
        Ok(self
            .collect()
            .await?
            .iter()
            .map(|o| (o.timestamp, o.numeric_value()))
            .collect())
    }

    /// シリーズキーごとに分けて取得
    ///
    /// ディメンションを指定しない検索は複数シリーズに一致するため、
    /// 分析に渡す前にキー単位で分ける。キーの表示順に並べる。
    pub async fn collect_by_series(&self) -> Result<Vec<(SeriesKey, Vec<MetricObservation>)>> {
        let mut index: HashMap<SeriesKey, usize> = HashMap::new();
        let mut groups: Vec<(SeriesKey, Vec<MetricObservation>)> = Vec::new();
        for observation in self.collect().await? {
            match index.get(&observation.series) {
                Some(&slot) => groups[slot].1.push(observation),
                None => {
                    index.insert(observation.series.clone(), groups.len());
                    groups.push((observation.series.clone(), vec![observation]));
                }
            }
        }
        groups.sort_by_cached_key(|(series, _)| series.to_string());
        Ok(groups)
    }

    /// 結果が単一シリーズに収まっていることを確認
    ///
    /// 分析は1本の時系列を前提にするため、複数シリーズが混ざった結果は拒否する。
    pub fn ensure_single_series(&self, rows: &[MetricObservation]) -> Result<()> {
        let Some(first) = rows.first() else {
            return Ok(());
        };
        if let Some(other) = rows.iter().find(|o| o.series != first.series) {
            return Err(Error::validation(format!(
                "query matches multiple series ({} and {}); narrow the dimensions or group by series",
                first.series, other.series
            )));
        }
        Ok(())
    }

    fn scan(&self, order: ScanOrder, cap: usize) -> BoxStream<'_, Result<MetricObservation>> {
        let storage = &self.storage;
        let filter = &self.filter;
        let page_size = self.page_size;

        let initial = PageState {
            cursor: None,
            buffer: VecDeque::new(),
            emitted: 0,
            exhausted: false,
        };

        stream::try_unfold(initial, move |mut state| async move {
            loop {
                if state.emitted >= cap {
                    return Ok::<_, Error>(None);
                }
                if let Some(observation) = state.buffer.pop_front() {
                    state.emitted += 1;
                    return Ok(Some((observation, state)));
                }
                if state.exhausted {
                    return Ok(None);
                }

                let limit = page_size.min(cap - state.emitted);
                let page = storage
                    .fetch_page(filter, state.cursor.as_ref(), order, limit)
                    .await?;
                if page.len() < limit {
                    state.exhausted = true;
                }
                if let Some(last) = page.last() {
                    state.cursor = Some(SeriesCursor::of(last));
                }
                if page.is_empty() {
                    return Ok(None);
                }
                state.buffer.extend(page);
            }
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::HolidayCalendar;
    use crate::metrics::types::{NewObservation, SeriesKey};
    use chrono::TimeZone;

    fn observation(day: u32, quality: QualityTier) -> MetricObservation {
        let series = SeriesKey::new(MetricType::RouteDuration, "total", AggregationLevel::Daily)
            .with_dimensions(DimensionKeys::new().route("R-7"));
        NewObservation::measure(series, Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap(), 90.0)
            .with_quality(quality)
            .validate(&HolidayCalendar::new())
            .unwrap()
    }

    fn january() -> TimeRange {
        TimeRange::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_time_range_rejects_inverted_bounds() {
        let now = Utc::now();
        assert!(TimeRange::new(now, now).is_err());
        assert!(TimeRange::trailing(now, chrono::Duration::days(30)).is_ok());
    }

    #[test]
    fn test_filter_matching() {
        let filter = SeriesFilter::new(MetricType::RouteDuration, AggregationLevel::Daily, january())
            .with_name("total")
            .with_min_quality(QualityTier::Medium);

        assert!(filter.matches(&observation(3, QualityTier::High)));
        assert!(!filter.matches(&observation(3, QualityTier::Low)));
        assert!(!filter.matches(&observation(3, QualityTier::Estimated)));

        let other_route = filter
            .clone()
            .with_dimensions(DimensionKeys::new().route("R-8"));
        assert!(!other_route.matches(&observation(3, QualityTier::High)));

        let weekly = SeriesFilter {
            aggregation: AggregationLevel::Weekly,
            ..filter
        };
        assert!(!weekly.matches(&observation(3, QualityTier::High)));
    }

    #[test]
    fn test_cursor_ordering() {
        let earlier = observation(2, QualityTier::High);
        let later = observation(5, QualityTier::High);
        let cursor = SeriesCursor::of(&earlier);

        assert!(cursor.precedes(&later));
        assert!(!cursor.precedes(&earlier));
    }
}
