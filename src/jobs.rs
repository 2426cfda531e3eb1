//! Batch jobs
//!
//! 複数のシリーズ・モデルに対して分解、異常検知、スナップショット計算を並行実行する。
//! 1件の失敗は他の対象を中断させず、対象ごとの結果として返す。
//! シリーズ対象は一致したシリーズキーごとに分けて分析する。

use crate::analytics::{AnomalyDetector, AnomalyScan, Decomposition, SeasonalDecomposer};
use crate::calendar::Period;
use crate::catalog::FeatureCatalog;
use crate::config::TelemetryConfig;
use crate::error::Result;
use crate::ledger::PredictionLedger;
use crate::metrics::{MetricObservation, MetricStore, SeriesFilter};
use crate::performance::{DriftInput, PerformanceSnapshot, PerformanceTracker};
use crate::storage::{FeatureStorage, MetricStorage, PredictionStorage, SnapshotStorage};
use futures::future::join_all;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// シリーズ単位のジョブ対象
///
/// フィルタが複数のシリーズに一致する場合、結果はシリーズごとに分かれる。
#[derive(Debug, Clone)]
pub struct SeriesTarget {
    pub label: String,
    pub filter: SeriesFilter,
}

impl SeriesTarget {
    pub fn new(label: impl Into<String>, filter: SeriesFilter) -> Self {
        Self {
            label: label.into(),
            filter,
        }
    }
}

/// モデル単位のジョブ対象
#[derive(Debug, Clone)]
pub struct SnapshotTarget {
    pub model_id: String,
    pub period: Period,
    pub drift: DriftInput,
}

impl SnapshotTarget {
    pub fn new(model_id: impl Into<String>, period: Period) -> Self {
        Self {
            model_id: model_id.into(),
            period,
            drift: DriftInput::none(),
        }
    }

    pub fn with_drift(mut self, drift: DriftInput) -> Self {
        self.drift = drift;
        self
    }
}

/// 対象ごとの結果
#[derive(Debug, Clone, Serialize)]
pub struct TargetReport<T> {
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 失敗が再試行可能か（ストレージ障害のみ）
    pub retryable: bool,
}

impl<T> TargetReport<T> {
    fn from_result(target: String, result: Result<T>) -> Self {
        match result {
            Ok(output) => Self {
                target,
                output: Some(output),
                error: None,
                retryable: false,
            },
            Err(e) => Self {
                target,
                output: None,
                retryable: e.is_retryable(),
                error: Some(e.to_string()),
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// ジョブ全体の結果
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary<T> {
    pub job: &'static str,
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed_ms: u128,
    pub reports: Vec<TargetReport<T>>,
}

impl<T> BatchSummary<T> {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// バッチ実行器
pub struct BatchRunner {
    store: MetricStore,
    tracker: Arc<PerformanceTracker>,
    ledger: Option<Arc<PredictionLedger>>,
    catalog: Option<Arc<FeatureCatalog>>,
    decomposer: SeasonalDecomposer,
    detector: AnomalyDetector,
}

impl BatchRunner {
    pub fn new(
        store: MetricStore,
        tracker: Arc<PerformanceTracker>,
        decomposer: SeasonalDecomposer,
        detector: AnomalyDetector,
    ) -> Self {
        Self {
            store,
            tracker,
            ledger: None,
            catalog: None,
            decomposer,
            detector,
        }
    }

    /// 設定と単一のストレージから組み立てる
    pub fn from_config<S>(storage: Arc<S>, config: &TelemetryConfig) -> Self
    where
        S: MetricStorage + PredictionStorage + SnapshotStorage + FeatureStorage + 'static,
    {
        let store = MetricStore::new(storage.clone(), config.calendar.holiday_calendar())
            .with_limits(config.store.page_size, config.store.row_cap);
        let tracker = PerformanceTracker::from_config(storage.clone(), storage.clone(), config);
        let ledger = PredictionLedger::from_config(storage.clone(), config);
        let catalog = FeatureCatalog::from_config(storage, config);

        Self {
            ledger: Some(Arc::new(ledger)),
            catalog: Some(Arc::new(catalog)),
            ..Self::new(
                store,
                Arc::new(tracker),
                SeasonalDecomposer::new(config.decomposition.clone()),
                AnomalyDetector::new(config.anomaly.clone()),
            )
        }
    }

    pub fn store(&self) -> &MetricStore {
        &self.store
    }

    pub fn tracker(&self) -> &PerformanceTracker {
        &self.tracker
    }

    /// 設定から組み立てた場合のみ
    pub fn ledger(&self) -> Option<&PredictionLedger> {
        self.ledger.as_deref()
    }

    /// 設定から組み立てた場合のみ
    pub fn catalog(&self) -> Option<&FeatureCatalog> {
        self.catalog.as_deref()
    }

    /// 各シリーズを季節分解
    pub async fn decompose_all(&self, targets: &[SeriesTarget]) -> BatchSummary<Decomposition> {
        let jobs = targets.iter().map(|target| {
            self.per_series(target, |rows| self.decomposer.decompose_observations(rows))
        });
        run_batch("decompose", jobs).await
    }

    /// 各シリーズの直近窓で異常検知
    pub async fn scan_all(&self, targets: &[SeriesTarget]) -> BatchSummary<AnomalyScan> {
        let jobs = targets.iter().map(|target| {
            self.per_series(target, |rows| self.detector.detect_observations(rows))
        });
        run_batch("anomalies", jobs).await
    }

    /// 各モデルのスナップショットを計算して保存
    pub async fn snapshot_all(&self, targets: &[SnapshotTarget]) -> BatchSummary<PerformanceSnapshot> {
        let jobs = targets.iter().map(|target| async move {
            let result = self
                .tracker
                .compute_snapshot(&target.model_id, target.period, &target.drift)
                .await;
            vec![(format!("{}@{}", target.model_id, target.period), result)]
        });
        run_batch("snapshot", jobs).await
    }

    /// 対象の観測をシリーズキーごとに分けて分析する
    ///
    /// 一致するシリーズがなければ、空の入力で1件の結果を返す。
    async fn per_series<T>(
        &self,
        target: &SeriesTarget,
        analyze: impl Fn(&[MetricObservation]) -> T,
    ) -> Vec<(String, Result<T>)> {
        let query = self.store.query(target.filter.clone());
        match query.collect_by_series().await {
            Ok(groups) if groups.is_empty() => vec![(target.label.clone(), Ok(analyze(&[])))],
            Ok(groups) => groups
                .into_iter()
                .map(|(series, rows)| (format!("{} {}", target.label, series), Ok(analyze(&rows))))
                .collect(),
            Err(e) => vec![(target.label.clone(), Err(e))],
        }
    }
}

async fn run_batch<T, F>(job: &'static str, jobs: impl Iterator<Item = F>) -> BatchSummary<T>
where
    F: Future<Output = Vec<(String, Result<T>)>>,
{
    let started = Instant::now();
    let results = join_all(jobs).await;

    let reports: Vec<TargetReport<T>> = results
        .into_iter()
        .flatten()
        .map(|(target, result)| {
            if let Err(e) = &result {
                warn!(job, target = %target, error = %e, "batch target failed");
            }
            TargetReport::from_result(target, result)
        })
        .collect();

    let failed = reports.iter().filter(|r| !r.is_ok()).count();
    let summary = BatchSummary {
        job,
        succeeded: reports.len() - failed,
        failed,
        elapsed_ms: started.elapsed().as_millis(),
        reports,
    };
    info!(
        job,
        succeeded = summary.succeeded,
        failed = summary.failed,
        elapsed_ms = summary.elapsed_ms as u64,
        "batch job finished"
    );
    summary
}
