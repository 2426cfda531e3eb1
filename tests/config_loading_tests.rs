//! 設定読み込みの統合テスト
//! 環境変数を使うテストはこのファイルの1関数にまとめる（並行実行で干渉しないように）

use predictive_telemetry::analytics::SeasonalBucket;
use predictive_telemetry::logging::LogRotation;
use predictive_telemetry::{Error, TelemetryConfig};
use std::io::Write;
use tempfile::NamedTempFile;

#[test]
fn test_file_then_environment_precedence() -> Result<(), Box<dyn std::error::Error>> {
    let mut file = NamedTempFile::with_suffix(".toml")?;
    writeln!(
        file,
        r#"
[store]
database_url = "sqlite://ops.db"
row_cap = 2000

[decomposition]
window = 14
bucket = "month"

[logging]
rotation = "hourly"
"#
    )?;

    std::env::set_var("TELEMETRY__STORE__ROW_CAP", "3000");
    std::env::set_var("TELEMETRY__ANOMALY__LOOKBACK", "60");
    let loaded = TelemetryConfig::load(Some(file.path()));
    std::env::remove_var("TELEMETRY__STORE__ROW_CAP");
    std::env::remove_var("TELEMETRY__ANOMALY__LOOKBACK");
    let config = loaded?;

    assert_eq!(config.store.database_url, "sqlite://ops.db");
    // 環境変数がファイルより優先される
    assert_eq!(config.store.row_cap, 3000);
    assert_eq!(config.anomaly.lookback, 60);
    assert_eq!(config.decomposition.window, 14);
    assert_eq!(config.decomposition.min_points, 7);
    assert_eq!(config.decomposition.bucket, SeasonalBucket::Month);
    assert_eq!(config.logging.rotation, LogRotation::Hourly);

    Ok(())
}

#[test]
fn test_invalid_file_values_fail_validation() -> Result<(), Box<dyn std::error::Error>> {
    let mut file = NamedTempFile::with_suffix(".toml")?;
    writeln!(file, "[decomposition]\nwindow = 0\n")?;

    match TelemetryConfig::load(Some(file.path())) {
        Err(Error::Config(message)) => assert!(message.contains("window")),
        other => panic!("expected configuration error, got {:?}", other),
    }
    Ok(())
}

#[test]
fn test_sample_config_loads_as_file() -> Result<(), Box<dyn std::error::Error>> {
    let mut file = NamedTempFile::with_suffix(".toml")?;
    file.write_all(TelemetryConfig::sample_toml()?.as_bytes())?;

    let config = TelemetryConfig::load(Some(file.path()))?;
    assert_eq!(config.calendar.holidays.len(), 2);
    assert_eq!(config.tracker.attention.min_accuracy_pct, 70.0);

    Ok(())
}
