//! Feature Catalog Implementation
//!
//! 特徴量カタログの実装。定義は物理削除せず、非アクティブ化のみ行う。

use super::types::{
    Feature, FeatureChange, FeatureDefinition, FeatureId, FeatureStatistics, FeatureTransition, QualityScores,
    StatisticsRecord,
};
use crate::config::TelemetryConfig;
use crate::error::{Error, Result};
use crate::ledger::FeatureVectorEntry;
use crate::storage::FeatureStorage;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

/// 統計履歴の既定保持件数
pub const DEFAULT_HISTORY_RETENTION: usize = 90;

fn feature_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z][A-Za-z0-9_.\-]{0,127}$").expect("feature name pattern is valid")
    })
}

/// 特徴量カタログ
pub struct FeatureCatalog {
    storage: Arc<dyn FeatureStorage>,
    history_retention: usize,
}

impl FeatureCatalog {
    /// 新しいカタログを作成
    pub fn new(storage: Arc<dyn FeatureStorage>) -> Self {
        Self {
            storage,
            history_retention: DEFAULT_HISTORY_RETENTION,
        }
    }

    /// 設定から作成（統計履歴の保持件数を反映）
    pub fn from_config(storage: Arc<dyn FeatureStorage>, config: &TelemetryConfig) -> Self {
        Self::new(storage).with_history_retention(config.catalog.history_retention)
    }

    /// 統計履歴の保持件数を設定
    pub fn with_history_retention(mut self, retention: usize) -> Self {
        self.history_retention = retention.max(1);
        self
    }

    /// 特徴量を登録（またはバージョンを追加）
    ///
    /// バージョン指定時に同名同バージョンが異なる意味で存在すればエラー。
    /// 未指定時は最新版と意味が同じならそれを返し、異なれば次のバージョンを作る。
    pub async fn register(&self, definition: FeatureDefinition) -> Result<Feature> {
        validate_definition(&definition)?;

        let versions = self.storage.feature_versions(&definition.name).await?;
        let version = match definition.version {
            Some(version) => {
                if let Some(existing) = versions.iter().find(|f| f.version == version) {
                    return resolve_existing(existing, &definition);
                }
                version
            }
            None => match versions.iter().max_by_key(|f| f.version) {
                Some(latest) if latest.same_semantics(&definition) => {
                    debug!(feature = %latest.name, version = latest.version, "feature already registered");
                    return Ok(latest.clone());
                }
                Some(latest) => latest.version + 1,
                None => 1,
            },
        };

        let feature = Feature::from_definition(definition.clone(), version);
        match self.storage.insert_feature(&feature).await {
            Ok(()) => {
                info!(feature = %feature.name, version = feature.version, id = %feature.id, "feature registered");
                Ok(feature)
            }
            Err(Error::Conflict(_)) => {
                // 並行登録に負けた場合は勝った側の定義と比較する
                let winner = self
                    .storage
                    .feature_versions(&feature.name)
                    .await?
                    .into_iter()
                    .find(|f| f.version == version)
                    .ok_or_else(|| Error::conflict(format!("feature {} v{} vanished", feature.name, version)))?;
                resolve_existing(&winner, &definition)
            }
            Err(other) => Err(other),
        }
    }

    /// IDで取得
    pub async fn get(&self, id: FeatureId) -> Result<Option<Feature>> {
        self.storage.get_feature(id).await
    }

    /// 名前で取得（バージョン省略時は最新のアクティブ版）
    pub async fn find_by_name(&self, name: &str, version: Option<u32>) -> Result<Option<Feature>> {
        let versions = self.storage.feature_versions(name).await?;
        Ok(match version {
            Some(version) => versions.into_iter().find(|f| f.version == version),
            None => versions
                .into_iter()
                .filter(|f| f.active)
                .max_by_key(|f| f.version),
        })
    }

    /// 一覧
    pub async fn list(&self, active_only: bool) -> Result<Vec<Feature>> {
        self.storage.list_features(active_only).await
    }

    /// 統計を統合して更新
    ///
    /// 統計自体は拒否しない。結果として本番利用可否が変わることがある。
    pub async fn update_statistics(&self, id: FeatureId, statistics: FeatureStatistics) -> Result<Feature> {
        let now = Utc::now();
        let change = FeatureChange::MergeStatistics {
            statistics: statistics.clone(),
            at: now,
        };
        let transition = self.modify(id, &change).await?;

        self.storage
            .append_statistics(&StatisticsRecord {
                feature_id: id,
                recorded_at: now,
                statistics,
            })
            .await?;
        let pruned = self.storage.prune_statistics(id, self.history_retention).await?;
        if pruned > 0 {
            debug!(feature = %transition.after.name, pruned, "statistics history pruned");
        }

        log_readiness_change(&transition);
        Ok(transition.after)
    }

    /// 品質スコアを更新
    pub async fn update_quality(&self, id: FeatureId, quality: QualityScores) -> Result<Feature> {
        let change = FeatureChange::SetQuality { quality, at: Utc::now() };
        let transition = self.modify(id, &change).await?;
        log_readiness_change(&transition);
        Ok(transition.after)
    }

    /// 本番利用可能か
    pub async fn is_production_ready(&self, id: FeatureId) -> Result<bool> {
        Ok(self.require(id).await?.is_production_ready())
    }

    /// 非アクティブ化
    pub async fn deactivate(&self, id: FeatureId) -> Result<Feature> {
        let transition = self.modify(id, &FeatureChange::Deactivate { at: Utc::now() }).await?;
        if transition.before.active {
            info!(feature = %transition.after.name, version = transition.after.version, "feature deactivated");
        }
        Ok(transition.after)
    }

    /// 予測で使われた特徴量の利用カウンタを更新
    ///
    /// 未登録の特徴量は警告のみでスキップし、更新件数を返す。
    pub async fn record_usage(&self, entries: &[FeatureVectorEntry], used_at: DateTime<Utc>) -> Result<usize> {
        let mut updated = 0;
        for entry in entries {
            let Some(feature) = self.find_by_name(&entry.name, Some(entry.version)).await? else {
                warn!(feature = %entry.name, version = entry.version, "usage recorded for unknown feature");
                continue;
            };
            let change = FeatureChange::RecordUsage { at: used_at };
            if self.storage.modify_feature(feature.id, &change).await?.is_some() {
                updated += 1;
            }
        }
        Ok(updated)
    }

    /// 基準線統計（cutoff より前の履歴を統合）
    pub async fn baseline_statistics(&self, id: FeatureId, before: DateTime<Utc>) -> Result<Option<FeatureStatistics>> {
        let history = self.storage.statistics_history(id).await?;
        Ok(merge_history(history.iter().filter(|r| r.recorded_at < before)))
    }

    /// 直近統計（since 以降の履歴を統合）
    pub async fn recent_statistics(&self, id: FeatureId, since: DateTime<Utc>) -> Result<Option<FeatureStatistics>> {
        let history = self.storage.statistics_history(id).await?;
        Ok(merge_history(history.iter().filter(|r| r.recorded_at >= since)))
    }

    async fn modify(&self, id: FeatureId, change: &FeatureChange) -> Result<FeatureTransition> {
        self.storage
            .modify_feature(id, change)
            .await?
            .ok_or_else(|| Error::not_found(format!("feature {}", id)))
    }

    async fn require(&self, id: FeatureId) -> Result<Feature> {
        self.storage
            .get_feature(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("feature {}", id)))
    }
}

fn validate_definition(definition: &FeatureDefinition) -> Result<()> {
    if !feature_name_pattern().is_match(&definition.name) {
        return Err(Error::validation(format!(
            "invalid feature name {:?}",
            definition.name
        )));
    }
    if definition.version == Some(0) {
        return Err(Error::validation("feature versions start at 1"));
    }
    if definition.provenance.source.trim().is_empty() {
        return Err(Error::validation("feature provenance source is required"));
    }
    Ok(())
}

fn resolve_existing(existing: &Feature, definition: &FeatureDefinition) -> Result<Feature> {
    if existing.same_semantics(definition) {
        Ok(existing.clone())
    } else {
        Err(Error::validation(format!(
            "feature {} v{} already registered with different semantics",
            existing.name, existing.version
        )))
    }
}

fn merge_history<'a>(records: impl Iterator<Item = &'a StatisticsRecord>) -> Option<FeatureStatistics> {
    records.fold(None, |acc: Option<FeatureStatistics>, record| {
        Some(match acc {
            Some(merged) => merged.merge(&record.statistics),
            None => record.statistics.clone(),
        })
    })
}

fn log_readiness_change(transition: &FeatureTransition) {
    let feature = &transition.after;
    let ready = feature.is_production_ready();
    if ready != transition.before.is_production_ready() {
        info!(
            feature = %feature.name,
            version = feature.version,
            ready,
            issues = ?feature.readiness_issues(),
            "feature production readiness changed"
        );
    }
}
