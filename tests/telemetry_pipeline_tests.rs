//! メモリストレージを使った統合テスト
//! 観測の追記から分解・異常検知・予測台帳・スナップショットまでを通して確認する

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use predictive_telemetry::analytics::{AnomalyConfig, AnomalyDetector, AnomalyDirection, SeasonalDecomposer};
use predictive_telemetry::catalog::{
    FeatureCatalog, FeatureDefinition, FeatureStatistics, Provenance, UpdateCadence, ValueKind,
};
use predictive_telemetry::ledger::{
    ConfidenceInterval, FeatureVectorEntry, Horizon, ModelRef, NewPrediction, PredictionLedger, RuntimeMetrics,
};
use predictive_telemetry::metrics::{
    AggregationLevel, DimensionKeys, MetricStore, MetricType, NewObservation, QualityTier, SeriesKey, TimeRange,
};
use predictive_telemetry::performance::{
    DriftInput, DriftSeverity, PerformanceTracker, Priority, TrackerConfig,
};
use predictive_telemetry::{Error, HolidayCalendar, MemoryStorage, Period};
use std::sync::Arc;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn day(offset: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap() + Duration::days(offset)
}

fn volume_series(region: &str) -> SeriesKey {
    SeriesKey::new(MetricType::CollectionVolume, "tonnage", AggregationLevel::Daily)
        .with_dimensions(DimensionKeys::new().region(region))
}

fn store(storage: &Arc<MemoryStorage>) -> MetricStore {
    MetricStore::new(storage.clone(), HolidayCalendar::new())
}

#[tokio::test]
async fn test_decomposition_reconstructs_every_point() -> TestResult {
    let storage = Arc::new(MemoryStorage::new());
    let store = store(&storage);

    // 週次パターン + 緩やかな上昇トレンド
    let weekly = [1.2, 1.1, 1.0, 1.0, 0.9, 0.5, 0.3];
    let batch = (0..84)
        .map(|d| {
            let value = (100.0 + d as f64) * weekly[(d % 7) as usize];
            NewObservation::measure(volume_series("north"), day(d), value)
        })
        .collect();
    store.append_batch(batch).await?;

    let query = store.query_series(
        MetricType::CollectionVolume,
        DimensionKeys::new().region("north"),
        TimeRange::new(day(0), day(84))?,
        AggregationLevel::Daily,
        None,
    );
    let decomposition = SeasonalDecomposer::default().decompose_query(&query).await?;

    assert_eq!(decomposition.len(), 84);
    for i in 0..decomposition.len() {
        let rebuilt = decomposition.reconstruct(i).unwrap();
        assert!((rebuilt - decomposition.values[i]).abs() < 1e-9);
    }
    // 7つの曜日すべてに係数がある
    assert_eq!(decomposition.factors.len(), 7);
    assert!(decomposition.seasonal_strength() > 0.5);

    Ok(())
}

#[tokio::test]
async fn test_short_series_yields_empty_decomposition() -> TestResult {
    let storage = Arc::new(MemoryStorage::new());
    let store = store(&storage);
    for d in 0..6 {
        store.append(NewObservation::measure(volume_series("east"), day(d), 10.0)).await?;
    }

    let query = store.query_series(
        MetricType::CollectionVolume,
        DimensionKeys::new().region("east"),
        TimeRange::new(day(0), day(30))?,
        AggregationLevel::Daily,
        None,
    );
    assert!(SeasonalDecomposer::default().decompose_query(&query).await?.is_empty());
    assert!(!AnomalyDetector::default().detect_query(&query).await?.has_anomalies());

    Ok(())
}

#[tokio::test]
async fn test_single_spike_is_the_only_anomaly() -> TestResult {
    let storage = Arc::new(MemoryStorage::new());
    let store = store(&storage);

    let mut batch: Vec<NewObservation> = (0..30)
        .map(|d| NewObservation::measure(volume_series("west"), day(d), 100.0))
        .collect();
    batch.push(NewObservation::measure(volume_series("west"), day(30), 400.0));
    store.append_batch(batch).await?;

    let query = store.query_series(
        MetricType::CollectionVolume,
        DimensionKeys::new().region("west"),
        TimeRange::new(day(0), day(31))?,
        AggregationLevel::Daily,
        None,
    );
    let detector = AnomalyDetector::new(AnomalyConfig {
        lookback: 31,
        ..AnomalyConfig::default()
    });
    let scan = detector.detect_query(&query).await?;

    assert_eq!(scan.points_examined, 31);
    assert_eq!(scan.anomalies.len(), 1);
    let anomaly = &scan.anomalies[0];
    assert_eq!(anomaly.value, 400.0);
    assert_eq!(anomaly.timestamp, day(30));
    assert_eq!(anomaly.direction, AnomalyDirection::Above);
    assert!(anomaly.observation_id.is_some());
    assert!((0.0..=1.0).contains(&anomaly.score));

    Ok(())
}

#[tokio::test]
async fn test_spike_found_when_range_exceeds_row_cap() -> TestResult {
    let storage = Arc::new(MemoryStorage::new());
    let store = store(&storage).with_limits(10, 40);

    let mut batch: Vec<NewObservation> = (0..99)
        .map(|d| NewObservation::measure(volume_series("west"), day(d), 100.0 + (d % 3) as f64))
        .collect();
    batch.push(NewObservation::measure(volume_series("west"), day(99), 400.0));
    store.append_batch(batch).await?;

    let query = store.query_series(
        MetricType::CollectionVolume,
        DimensionKeys::new().region("west"),
        TimeRange::new(day(0), day(100))?,
        AggregationLevel::Daily,
        None,
    );
    let scan = AnomalyDetector::default().detect_query(&query).await?;
    assert_eq!(scan.anomalies.len(), 1);
    assert_eq!(scan.anomalies[0].timestamp, day(99));

    // 分解も上限内の最新側を使う
    let decomposition = SeasonalDecomposer::default().decompose_query(&query).await?;
    assert_eq!(decomposition.len(), 40);
    assert_eq!(decomposition.timestamps.last(), Some(&day(99)));

    Ok(())
}

#[tokio::test]
async fn test_mixed_series_query_is_rejected() -> TestResult {
    let storage = Arc::new(MemoryStorage::new());
    let store = store(&storage);
    for region in ["north", "south"] {
        for d in 0..10 {
            store.append(NewObservation::measure(volume_series(region), day(d), 50.0)).await?;
        }
    }

    let query = store.query_series(
        MetricType::CollectionVolume,
        DimensionKeys::new(),
        TimeRange::new(day(0), day(10))?,
        AggregationLevel::Daily,
        None,
    );
    assert!(AnomalyDetector::default().detect_query(&query).await.unwrap_err().is_validation());
    assert!(SeasonalDecomposer::default().decompose_query(&query).await.unwrap_err().is_validation());

    let groups = query.collect_by_series().await?;
    assert_eq!(groups.len(), 2);
    assert!(groups.iter().all(|(_, rows)| rows.len() == 10));

    Ok(())
}

#[tokio::test]
async fn test_quality_filter_and_revision() -> TestResult {
    let storage = Arc::new(MemoryStorage::new());
    let store = store(&storage);

    let estimated = store
        .append(NewObservation::measure(volume_series("south"), day(0), 80.0).with_quality(QualityTier::Estimated))
        .await?;
    store
        .append(NewObservation::measure(volume_series("south"), day(1), 90.0).with_quality(QualityTier::Low))
        .await?;
    let high = store.append(NewObservation::measure(volume_series("south"), day(2), 95.0)).await?;

    let range = TimeRange::new(day(0), day(3))?;
    let medium_or_better = store
        .query_series(
            MetricType::CollectionVolume,
            DimensionKeys::new().region("south"),
            range,
            AggregationLevel::Daily,
            Some(QualityTier::Medium),
        )
        .collect()
        .await?;
    assert_eq!(medium_or_better.len(), 1);
    assert_eq!(medium_or_better[0].id, high.id);

    // estimated は訂正できる（IDは維持）
    let revised = store
        .revise(
            estimated.id,
            NewObservation::measure(volume_series("south"), day(0), 85.0).with_quality(QualityTier::High),
        )
        .await?;
    assert_eq!(revised.id, estimated.id);
    assert_eq!(store.get(estimated.id).await?.unwrap().numeric_value(), 85.0);

    // high になった観測は変更不可
    let err = store
        .revise(estimated.id, NewObservation::measure(volume_series("south"), day(0), 1.0))
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    Ok(())
}

#[tokio::test]
async fn test_outcome_attaches_exactly_once() -> TestResult {
    let storage = Arc::new(MemoryStorage::new());
    let ledger = PredictionLedger::new(storage.clone());

    let prediction = ledger
        .record(NewPrediction::new(
            ModelRef::new("tonnage-forecast", "3.1.0"),
            Horizon::NextDay,
            NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            100.0,
            ConfidenceInterval::new(90.0, 110.0, 0.95),
        ))
        .await?;

    let evaluation = ledger.attach_outcome(prediction.id, 120.0, Utc::now()).await?;
    assert_eq!(evaluation.absolute_error, 20.0);
    assert_eq!(evaluation.percentage_error, 20.0);
    assert!(!evaluation.within_interval);

    match ledger.attach_outcome(prediction.id, 100.0, Utc::now()).await {
        Err(Error::Conflict(_)) => {}
        other => panic!("expected conflict, got {:?}", other),
    }
    assert_eq!(ledger.get(prediction.id).await?.unwrap().outcome.unwrap().actual_value, 120.0);

    Ok(())
}

#[tokio::test]
async fn test_reconcile_from_metric_series() -> TestResult {
    let storage = Arc::new(MemoryStorage::new());
    let store = store(&storage);
    let ledger = PredictionLedger::new(storage.clone());

    for d in 0..5 {
        store
            .append(NewObservation::measure(volume_series("north"), day(d), 100.0 + d as f64))
            .await?;
    }
    let mut ids = Vec::new();
    for d in [1_i64, 3, 10] {
        let target = day(d).date_naive();
        let prediction = ledger
            .record(NewPrediction::new(
                ModelRef::new("tonnage-forecast", "3.1.0"),
                Horizon::NextDay,
                target,
                100.0,
                ConfidenceInterval::new(95.0, 105.0, 0.9),
            ))
            .await?;
        ids.push(prediction.id);
    }

    let query = store.query_series(
        MetricType::CollectionVolume,
        DimensionKeys::new().region("north"),
        TimeRange::new(day(0), day(20))?,
        AggregationLevel::Daily,
        None,
    );
    let report = ledger
        .reconcile_from_series("tonnage-forecast", day(20).date_naive(), &query)
        .await?;

    assert_eq!(report.attached, vec![ids[0], ids[1]]);
    assert_eq!(report.unmatched, vec![ids[2]]);
    assert_eq!(ledger.get(ids[1]).await?.unwrap().outcome.unwrap().actual_value, 103.0);

    // 再実行しても二重付与しない
    let again = ledger
        .reconcile_from_series("tonnage-forecast", day(20).date_naive(), &query)
        .await?;
    assert!(again.attached.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_snapshot_recompute_is_identical() -> TestResult {
    let storage = Arc::new(MemoryStorage::new());
    let ledger = PredictionLedger::new(storage.clone());
    let tracker = PerformanceTracker::new(storage.clone(), storage.clone(), TrackerConfig::default());

    for (d, actual) in [(3_u32, Some(104.0)), (4, Some(150.0)), (5, None)] {
        let prediction = ledger
            .record(
                NewPrediction::new(
                    ModelRef::new("tonnage-forecast", if d < 5 { "3.1.0" } else { "3.2.0" }),
                    Horizon::NextDay,
                    NaiveDate::from_ymd_opt(2024, 3, d).unwrap(),
                    100.0,
                    ConfidenceInterval::new(90.0, 110.0, 0.9),
                )
                .with_feature(FeatureVectorEntry::numeric("route_km", 1, 42.0))
                .with_runtime(RuntimeMetrics {
                    execution_time_ms: 250.0,
                    cache_hit: d == 3,
                    fallback_used: false,
                }),
            )
            .await?;
        if let Some(actual) = actual {
            ledger.attach_outcome(prediction.id, actual, Utc::now()).await?;
        }
    }

    let period = Period::month(2024, 3)?;
    let first = tracker.compute_snapshot("tonnage-forecast", period, &DriftInput::none()).await?;
    let second = tracker.compute_snapshot("tonnage-forecast", period, &DriftInput::none()).await?;
    assert_eq!(first, second);

    assert_eq!(first.model_versions, vec!["3.1.0".to_string(), "3.2.0".to_string()]);
    assert_eq!(first.accuracy.prediction_count, 3);
    assert_eq!(first.accuracy.with_outcome_count, 2);
    assert_eq!(first.accuracy.within_interval_count, 1);
    assert_eq!(first.accuracy.accuracy_rate, 0.5);
    // 50% < 70% なので high
    assert_eq!(first.recommendation.priority, Some(Priority::High));

    let health = tracker.health(&first);
    assert!((0.0..=100.0).contains(&health.total));
    assert_eq!(tracker.latest_snapshot("tonnage-forecast").await?, Some(first));

    Ok(())
}

#[tokio::test]
async fn test_drift_from_catalog_history() -> TestResult {
    let storage = Arc::new(MemoryStorage::new());
    let catalog = FeatureCatalog::new(storage.clone());
    let tracker = PerformanceTracker::new(storage.clone(), storage.clone(), TrackerConfig::default());

    let feature = catalog
        .register(FeatureDefinition::new(
            "route_km",
            ValueKind::Numeric,
            Provenance::new("telematics"),
            UpdateCadence::Daily,
        ))
        .await?;
    let baseline: Vec<Option<f64>> = (0..50).map(|i| Some(40.0 + (i % 5) as f64)).collect();
    catalog.update_statistics(feature.id, FeatureStatistics::from_values(&baseline)).await?;

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let cutoff = Utc::now();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    let shifted: Vec<Option<f64>> = (0..50).map(|i| Some(60.0 + (i % 5) as f64)).collect();
    catalog.update_statistics(feature.id, FeatureStatistics::from_values(&shifted)).await?;

    let input = DriftInput::from_catalog(&catalog, &[feature.id], cutoff).await?;
    let snapshot = tracker
        .compute_snapshot("route-model", Period::month(2024, 3)?, &input)
        .await?;

    assert_eq!(snapshot.drift.features.len(), 1);
    assert_eq!(snapshot.drift.severity, DriftSeverity::Critical);
    // 予測がなくてもスナップショットは作れる
    assert_eq!(snapshot.accuracy.prediction_count, 0);
    assert!((0.0..=100.0).contains(&tracker.health(&snapshot).total));

    Ok(())
}
