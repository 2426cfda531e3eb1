use crate::analytics::{AnomalyConfig, DecompositionConfig};
use crate::calendar::HolidayCalendar;
use crate::catalog::DEFAULT_HISTORY_RETENTION;
use crate::error::{Error, Result};
use crate::ledger::ErrorBase;
use crate::logging::LogConfig;
use crate::metrics::{DEFAULT_PAGE_SIZE, DEFAULT_ROW_CAP};
use crate::performance::TrackerConfig;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 環境変数のプレフィックス（例: TELEMETRY__STORE__ROW_CAP=5000）
pub const ENV_PREFIX: &str = "TELEMETRY";

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub store: StoreConfig,
    pub decomposition: DecompositionConfig,
    pub anomaly: AnomalyConfig,
    pub ledger: LedgerConfig,
    pub tracker: TrackerConfig,
    pub catalog: CatalogConfig,
    pub calendar: CalendarConfig,
    pub logging: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite 接続URL
    pub database_url: String,
    pub max_connections: u32,
    /// 1クエリで返す最大行数
    pub row_cap: usize,
    pub page_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://telemetry.db".to_string(),
            max_connections: 5,
            row_cap: DEFAULT_ROW_CAP,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// パーセント誤差の分母 (predicted / actual)
    pub error_base: ErrorBase,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// 特徴量ごとの統計履歴の保持件数
    pub history_retention: usize,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            history_retention: DEFAULT_HISTORY_RETENTION,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CalendarConfig {
    /// 休日（YYYY-MM-DD）
    pub holidays: Vec<NaiveDate>,
}

impl CalendarConfig {
    pub fn holiday_calendar(&self) -> HolidayCalendar {
        HolidayCalendar::from_dates(self.holidays.iter().copied())
    }
}

impl TelemetryConfig {
    /// 既定値 → 設定ファイル → 環境変数 の順に読み込む
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = config::Config::builder();

        // デフォルト値を設定
        settings = settings.add_source(config::Config::try_from(&TelemetryConfig::default())?);

        if let Some(path) = path {
            if !path.exists() {
                return Err(Error::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            settings = settings.add_source(config::File::from(path));
        }

        // 環境変数で上書き (TELEMETRY__SECTION__KEY)
        settings = settings.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: TelemetryConfig = settings.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// 値の整合性を検証
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(Error::Config(msg.to_string()));

        if self.store.database_url.trim().is_empty() {
            return invalid("store.database_url must not be empty");
        }
        if self.store.row_cap == 0 || self.store.page_size == 0 {
            return invalid("store.row_cap and store.page_size must be positive");
        }
        if self.decomposition.window == 0 {
            return invalid("decomposition.window must be positive");
        }
        if self.anomaly.lookback == 0 {
            return invalid("anomaly.lookback must be positive");
        }
        if !(self.anomaly.k.is_finite() && self.anomaly.k > 0.0) {
            return invalid("anomaly.k must be a positive number");
        }
        let drift = &self.tracker.drift;
        if drift.detection_shift <= 0.0 || drift.critical_shift < drift.detection_shift {
            return invalid("tracker.drift.critical_shift must be at least detection_shift (> 0)");
        }
        let health = &self.tracker.health;
        if health.max_execution_time_ms <= health.target_execution_time_ms {
            return invalid("tracker.health.max_execution_time_ms must exceed target_execution_time_ms");
        }
        if self.catalog.history_retention == 0 {
            return invalid("catalog.history_retention must be positive");
        }
        Ok(())
    }

    /// サンプル設定（TOML）を生成
    pub fn sample_toml() -> Result<String> {
        let mut sample = TelemetryConfig::default();
        sample.calendar.holidays = vec![
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap_or_default(),
            NaiveDate::from_ymd_opt(2025, 12, 25).unwrap_or_default(),
        ];

        let body = toml::to_string_pretty(&sample)
            .map_err(|e| Error::Config(format!("failed to render sample config: {}", e)))?;

        Ok(format!(
            r#"# telemetry-batch configuration
#
# 環境変数での上書きも可能です (例: TELEMETRY__STORE__ROW_CAP=5000)
#
# [store]        SQLite 接続先・クエリの行数上限
# [decomposition] 移動平均の窓幅・最小点数・季節バケット
# [anomaly]      直近点数・k（標準偏差の倍率）
# [ledger]       パーセント誤差の分母 (predicted | actual)
# [tracker]      要注意閾値・健全性スコア正規化・ドリフト閾値
# [catalog]      統計履歴の保持件数
# [calendar]     休日リスト

{}"#,
            body
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let config = TelemetryConfig::default();
        config.validate().unwrap();
        assert_eq!(config.store.row_cap, 10_000);
        assert_eq!(config.decomposition.window, 30);
        assert_eq!(config.anomaly.k, 2.0);
        assert_eq!(config.ledger.error_base, ErrorBase::Predicted);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
[store]
row_cap = 250

[anomaly]
k = 3.0

[ledger]
error_base = "actual"

[calendar]
holidays = ["2024-12-25"]
"#
        )
        .unwrap();

        let config = TelemetryConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.store.row_cap, 250);
        assert_eq!(config.store.page_size, 500);
        assert_eq!(config.anomaly.k, 3.0);
        assert_eq!(config.anomaly.lookback, 30);
        assert_eq!(config.ledger.error_base, ErrorBase::Actual);
        assert!(config
            .calendar
            .holiday_calendar()
            .is_holiday(NaiveDate::from_ymd_opt(2024, 12, 25).unwrap()));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = TelemetryConfig::load(Some(Path::new("/nonexistent/telemetry.toml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = TelemetryConfig::default();
        config.anomaly.k = 0.0;
        assert!(config.validate().is_err());

        let mut config = TelemetryConfig::default();
        config.tracker.drift.critical_shift = 0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sample_toml_round_trips() {
        let sample = TelemetryConfig::sample_toml().unwrap();
        let parsed: TelemetryConfig = toml::from_str(&sample).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.calendar.holidays.len(), 2);
    }
}
