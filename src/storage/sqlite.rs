//! SQLite storage backend
//!
//! 本体は JSON 列に保存し、検索に使うキーだけを個別の列に展開する。

use super::{FeatureStorage, GuardedWrite, MetricStorage, PredictionStorage, ScanOrder, SnapshotStorage};
use crate::calendar::Period;
use crate::catalog::{Feature, FeatureChange, FeatureId, FeatureTransition, StatisticsRecord};
use crate::error::{Error, Result};
use crate::ledger::{Outcome, Prediction, PredictionId};
use crate::metrics::{MetricObservation, ObservationId, SeriesCursor, SeriesFilter};
use crate::performance::PerformanceSnapshot;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info};

/// 特徴量の楽観的更新で競合したときの再試行上限
const MAX_FEATURE_RETRIES: usize = 256;

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS features (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        version INTEGER NOT NULL,
        active INTEGER NOT NULL,
        revision INTEGER NOT NULL DEFAULT 0,
        body TEXT NOT NULL,
        UNIQUE (name, version)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS feature_statistics (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        feature_id TEXT NOT NULL,
        recorded_at INTEGER NOT NULL,
        body TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_feature_statistics_feature ON feature_statistics(feature_id, recorded_at)",
    r#"
    CREATE TABLE IF NOT EXISTS observations (
        id TEXT PRIMARY KEY,
        metric_type TEXT NOT NULL,
        metric_name TEXT NOT NULL,
        aggregation TEXT NOT NULL,
        customer_id TEXT,
        route_id TEXT,
        vehicle_id TEXT,
        driver_id TEXT,
        region_id TEXT,
        ts INTEGER NOT NULL,
        quality_rank INTEGER,
        body TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_observations_series ON observations(metric_type, aggregation, ts, id)",
    "CREATE INDEX IF NOT EXISTS idx_observations_ts ON observations(ts)",
    r#"
    CREATE TABLE IF NOT EXISTS predictions (
        id TEXT PRIMARY KEY,
        model_id TEXT NOT NULL,
        target_date TEXT NOT NULL,
        made_at INTEGER NOT NULL,
        body TEXT NOT NULL,
        outcome TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_predictions_model ON predictions(model_id, target_date)",
    r#"
    CREATE TABLE IF NOT EXISTS snapshots (
        model_id TEXT NOT NULL,
        period_start TEXT NOT NULL,
        period_end TEXT NOT NULL,
        body TEXT NOT NULL,
        PRIMARY KEY (model_id, period_start, period_end)
    )
    "#,
];

/// SQLite ストレージ
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// 接続する（ファイルがなければ作成）
    ///
    /// `sqlite::memory:` の場合は接続ごとにDBが分かれるため、接続を1本に固定する。
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let in_memory = url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { max_connections.max(1) })
            .idle_timeout(if in_memory { None } else { Some(std::time::Duration::from_secs(600)) })
            .max_lifetime(if in_memory { None } else { Some(std::time::Duration::from_secs(1800)) })
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// テーブルを作成
    pub async fn run_migrations(&self) -> Result<()> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("SQLite migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn decode<T: DeserializeOwned>(row: &SqliteRow) -> Result<T> {
    let body: String = row.get("body");
    Ok(serde_json::from_str(&body)?)
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn decode_prediction(row: &SqliteRow) -> Result<Prediction> {
    let mut prediction: Prediction = decode(row)?;
    let outcome: Option<String> = row.get("outcome");
    prediction.outcome = outcome
        .map(|json| serde_json::from_str::<Outcome>(&json))
        .transpose()?;
    Ok(prediction)
}

#[async_trait]
impl FeatureStorage for SqliteStorage {
    async fn insert_feature(&self, feature: &Feature) -> Result<()> {
        let body = serde_json::to_string(feature)?;
        let result = sqlx::query(
            "INSERT INTO features (id, name, version, active, body) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(feature.id.to_string())
        .bind(&feature.name)
        .bind(feature.version as i64)
        .bind(feature.active)
        .bind(body)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(Error::conflict(format!(
                "feature {} v{} already exists",
                feature.name, feature.version
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn modify_feature(&self, id: FeatureId, change: &FeatureChange) -> Result<Option<FeatureTransition>> {
        // revision 列による compare-and-set。他の書き込みが挟まったら読み直す
        for attempt in 0..MAX_FEATURE_RETRIES {
            let Some(row) = sqlx::query("SELECT revision, body FROM features WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?
            else {
                return Ok(None);
            };
            let revision: i64 = row.get("revision");
            let before: Feature = decode(&row)?;
            let mut after = before.clone();
            change.apply(&mut after);

            let result = sqlx::query(
                "UPDATE features SET active = ?, body = ?, revision = revision + 1 WHERE id = ? AND revision = ?",
            )
            .bind(after.active)
            .bind(serde_json::to_string(&after)?)
            .bind(id.to_string())
            .bind(revision)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                return Ok(Some(FeatureTransition { before, after }));
            }
            debug!(feature = %id, attempt, "feature revision moved, retrying");
            tokio::task::yield_now().await;
        }

        Err(Error::conflict(format!(
            "feature {} kept changing after {} attempts",
            id, MAX_FEATURE_RETRIES
        )))
    }

    async fn get_feature(&self, id: FeatureId) -> Result<Option<Feature>> {
        let row = sqlx::query("SELECT body FROM features WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode).transpose()
    }

    async fn feature_versions(&self, name: &str) -> Result<Vec<Feature>> {
        let rows = sqlx::query("SELECT body FROM features WHERE name = ? ORDER BY version")
            .bind(name)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decode).collect()
    }

    async fn list_features(&self, active_only: bool) -> Result<Vec<Feature>> {
        let rows = sqlx::query(
            "SELECT body FROM features WHERE (? = 0 OR active = 1) ORDER BY name, version",
        )
        .bind(active_only)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode).collect()
    }

    async fn append_statistics(&self, record: &StatisticsRecord) -> Result<()> {
        sqlx::query("INSERT INTO feature_statistics (feature_id, recorded_at, body) VALUES (?, ?, ?)")
            .bind(record.feature_id.to_string())
            .bind(record.recorded_at.timestamp_micros())
            .bind(serde_json::to_string(record)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn statistics_history(&self, id: FeatureId) -> Result<Vec<StatisticsRecord>> {
        let rows = sqlx::query(
            "SELECT body FROM feature_statistics WHERE feature_id = ? ORDER BY recorded_at, seq",
        )
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode).collect()
    }

    async fn prune_statistics(&self, id: FeatureId, keep: usize) -> Result<usize> {
        let result = sqlx::query(
            r#"
            DELETE FROM feature_statistics
            WHERE feature_id = ?1 AND seq NOT IN (
                SELECT seq FROM feature_statistics
                WHERE feature_id = ?1
                ORDER BY recorded_at DESC, seq DESC
                LIMIT ?2
            )
            "#,
        )
        .bind(id.to_string())
        .bind(keep as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }
}

#[async_trait]
impl MetricStorage for SqliteStorage {
    async fn insert_observation(&self, observation: &MetricObservation) -> Result<()> {
        let series = &observation.series;
        let dims = &series.dimensions;
        let result = sqlx::query(
            r#"
            INSERT INTO observations
                (id, metric_type, metric_name, aggregation, customer_id, route_id,
                 vehicle_id, driver_id, region_id, ts, quality_rank, body)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(observation.id.to_string())
        .bind(series.metric_type.name())
        .bind(&series.metric_name)
        .bind(series.aggregation.as_str())
        .bind(dims.customer_id.as_deref())
        .bind(dims.route_id.as_deref())
        .bind(dims.vehicle_id.as_deref())
        .bind(dims.driver_id.as_deref())
        .bind(dims.region_id.as_deref())
        .bind(observation.timestamp.timestamp_micros())
        .bind(observation.quality.rank().map(i64::from))
        .bind(serde_json::to_string(observation)?)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(Error::conflict(format!(
                "observation {} already exists",
                observation.id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_observation(&self, id: ObservationId) -> Result<Option<MetricObservation>> {
        let row = sqlx::query("SELECT body FROM observations WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode).transpose()
    }

    async fn replace_observation_if_revisable(&self, observation: &MetricObservation) -> Result<GuardedWrite> {
        let high_rank = i64::from(crate::metrics::QualityTier::High.rank().unwrap_or(2));
        let result = sqlx::query(
            r#"
            UPDATE observations
            SET ts = ?, quality_rank = ?, body = ?
            WHERE id = ? AND (quality_rank IS NULL OR quality_rank <> ?)
            "#,
        )
        .bind(observation.timestamp.timestamp_micros())
        .bind(observation.quality.rank().map(i64::from))
        .bind(serde_json::to_string(observation)?)
        .bind(observation.id.to_string())
        .bind(high_rank)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(GuardedWrite::Applied);
        }
        let exists: Option<String> = sqlx::query_scalar("SELECT id FROM observations WHERE id = ?")
            .bind(observation.id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(if exists.is_some() {
            GuardedWrite::Rejected
        } else {
            GuardedWrite::Missing
        })
    }

    async fn fetch_page(
        &self,
        filter: &SeriesFilter,
        after: Option<&SeriesCursor>,
        order: ScanOrder,
        limit: usize,
    ) -> Result<Vec<MetricObservation>> {
        let (beyond, direction) = match order {
            ScanOrder::Ascending => (">", "ASC"),
            ScanOrder::Descending => ("<", "DESC"),
        };
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT body FROM observations WHERE metric_type = ");
        builder.push_bind(filter.metric_type.name().to_string());
        builder.push(" AND aggregation = ");
        builder.push_bind(filter.aggregation.as_str());
        builder.push(" AND ts >= ");
        builder.push_bind(filter.time_range.start.timestamp_micros());
        builder.push(" AND ts < ");
        builder.push_bind(filter.time_range.end.timestamp_micros());

        if let Some(name) = &filter.metric_name {
            builder.push(" AND metric_name = ");
            builder.push_bind(name.clone());
        }
        for (column, value) in filter.dimensions.entries() {
            if let Some(value) = value {
                builder.push(format!(" AND {} = ", column));
                builder.push_bind(value.to_string());
            }
        }
        match filter.min_quality.map(|q| q.rank()) {
            None => {}
            Some(Some(rank)) => {
                builder.push(" AND quality_rank >= ");
                builder.push_bind(i64::from(rank));
            }
            Some(None) => {
                builder.push(" AND quality_rank IS NULL");
            }
        }
        if let Some(cursor) = after {
            let ts = cursor.timestamp.timestamp_micros();
            builder.push(format!(" AND (ts {} ", beyond));
            builder.push_bind(ts);
            builder.push(" OR (ts = ");
            builder.push_bind(ts);
            builder.push(format!(" AND id {} ", beyond));
            builder.push_bind(cursor.id.to_string());
            builder.push("))");
        }
        builder.push(format!(" ORDER BY ts {0}, id {0} LIMIT ", direction));
        builder.push_bind(limit as i64);

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(decode).collect()
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM observations WHERE ts < ?")
            .bind(cutoff.timestamp_micros())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl PredictionStorage for SqliteStorage {
    async fn insert_prediction(&self, prediction: &Prediction) -> Result<()> {
        let outcome = prediction.outcome.as_ref().map(serde_json::to_string).transpose()?;
        let body = serde_json::to_string(&Prediction {
            outcome: None,
            ..prediction.clone()
        })?;

        let result = sqlx::query(
            "INSERT INTO predictions (id, model_id, target_date, made_at, body, outcome) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(prediction.id.to_string())
        .bind(&prediction.model.model_id)
        .bind(prediction.target_date.to_string())
        .bind(prediction.made_at.timestamp_micros())
        .bind(body)
        .bind(outcome)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(Error::conflict(format!(
                "prediction {} already exists",
                prediction.id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_prediction(&self, id: PredictionId) -> Result<Option<Prediction>> {
        let row = sqlx::query("SELECT body, outcome FROM predictions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode_prediction).transpose()
    }

    async fn attach_outcome_if_absent(&self, id: PredictionId, outcome: &Outcome) -> Result<GuardedWrite> {
        let result = sqlx::query("UPDATE predictions SET outcome = ? WHERE id = ? AND outcome IS NULL")
            .bind(serde_json::to_string(outcome)?)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            return Ok(GuardedWrite::Applied);
        }
        let exists: Option<String> = sqlx::query_scalar("SELECT id FROM predictions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(if exists.is_some() {
            GuardedWrite::Rejected
        } else {
            GuardedWrite::Missing
        })
    }

    async fn predictions_for_model(&self, model_id: &str, period: &Period) -> Result<Vec<Prediction>> {
        let rows = sqlx::query(
            r#"
            SELECT body, outcome FROM predictions
            WHERE model_id = ? AND target_date >= ? AND target_date < ?
            ORDER BY target_date, made_at, id
            "#,
        )
        .bind(model_id)
        .bind(period.start.to_string())
        .bind(period.end.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_prediction).collect()
    }

    async fn pending_outcomes(&self, model_id: &str, before: NaiveDate) -> Result<Vec<Prediction>> {
        let rows = sqlx::query(
            r#"
            SELECT body, outcome FROM predictions
            WHERE model_id = ? AND target_date < ? AND outcome IS NULL
            ORDER BY target_date, made_at, id
            "#,
        )
        .bind(model_id)
        .bind(before.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_prediction).collect()
    }
}

#[async_trait]
impl SnapshotStorage for SqliteStorage {
    async fn put_snapshot(&self, snapshot: &PerformanceSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO snapshots (model_id, period_start, period_end, body)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (model_id, period_start, period_end) DO UPDATE SET body = excluded.body
            "#,
        )
        .bind(&snapshot.model_id)
        .bind(snapshot.period.start.to_string())
        .bind(snapshot.period.end.to_string())
        .bind(serde_json::to_string(snapshot)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_snapshot(&self, model_id: &str, period: &Period) -> Result<Option<PerformanceSnapshot>> {
        let row = sqlx::query(
            "SELECT body FROM snapshots WHERE model_id = ? AND period_start = ? AND period_end = ?",
        )
        .bind(model_id)
        .bind(period.start.to_string())
        .bind(period.end.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(decode).transpose()
    }

    async fn latest_snapshot(&self, model_id: &str) -> Result<Option<PerformanceSnapshot>> {
        let row = sqlx::query(
            r#"
            SELECT body FROM snapshots WHERE model_id = ?
            ORDER BY period_end DESC, period_start DESC
            LIMIT 1
            "#,
        )
        .bind(model_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(decode).transpose()
    }
}
