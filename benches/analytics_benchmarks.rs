use chrono::{DateTime, Duration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use predictive_telemetry::analytics::{AnomalyDetector, DecompositionConfig, SeasonalBucket, SeasonalDecomposer};
use predictive_telemetry::metrics::{
    AggregationLevel, DimensionKeys, MetricStore, MetricType, NewObservation, SeriesKey, TimeRange,
};
use predictive_telemetry::{HolidayCalendar, MemoryStorage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 1, 2, 6, 0, 0).unwrap()
}

fn daily_series(len: usize) -> Vec<(DateTime<Utc>, f64)> {
    let mut rng = StdRng::seed_from_u64(42);
    let weekly = [1.15, 1.05, 1.0, 1.0, 0.95, 0.6, 0.4];
    (0..len)
        .map(|d| {
            let trend = 1_000.0 + d as f64 * 0.8;
            let noise: f64 = rng.gen_range(-25.0..25.0);
            (start() + Duration::days(d as i64), trend * weekly[d % 7] + noise)
        })
        .collect()
}

fn benchmark_decomposition(c: &mut Criterion) {
    let mut group = c.benchmark_group("seasonal_decomposition");
    for len in [90, 365, 3_650] {
        let points = daily_series(len);
        group.bench_with_input(BenchmarkId::new("day_of_week", len), &points, |b, points| {
            let decomposer = SeasonalDecomposer::default();
            b.iter(|| decomposer.decompose(black_box(points)))
        });
    }

    let points = daily_series(3_650);
    let monthly = SeasonalDecomposer::new(DecompositionConfig {
        bucket: SeasonalBucket::Month,
        ..DecompositionConfig::default()
    });
    group.bench_function("month_3650", |b| b.iter(|| monthly.decompose(black_box(&points))));
    group.finish();
}

fn benchmark_anomaly_detection(c: &mut Criterion) {
    let mut points = daily_series(365);
    points[200].1 *= 3.0;
    let detector = AnomalyDetector::default();

    c.bench_function("anomaly_scan_365", |b| {
        b.iter(|| detector.detect(black_box(&points)))
    });
}

fn benchmark_series_query(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let store = MetricStore::new(Arc::new(MemoryStorage::new()), HolidayCalendar::new());
    let series = SeriesKey::new(MetricType::CollectionVolume, "tonnage", AggregationLevel::Daily);

    let batch = daily_series(2_000)
        .into_iter()
        .map(|(timestamp, value)| NewObservation::measure(series.clone(), timestamp, value))
        .collect();
    runtime.block_on(store.append_batch(batch)).unwrap();

    let range = TimeRange::new(start(), start() + Duration::days(2_000)).unwrap();
    c.bench_function("memory_series_query_2000", |b| {
        b.to_async(&runtime).iter(|| async {
            let query = store.query_series(
                MetricType::CollectionVolume,
                DimensionKeys::new(),
                range,
                AggregationLevel::Daily,
                None,
            );
            black_box(query.collect().await.unwrap())
        })
    });
}

criterion_group!(
    benches,
    benchmark_decomposition,
    benchmark_anomaly_detection,
    benchmark_series_query
);
criterion_main!(benches);
