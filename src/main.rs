use anyhow::{bail, Context, Result};
use chrono::{Duration, NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use predictive_telemetry::analytics::SeasonalBucket;
use predictive_telemetry::jobs::{BatchRunner, BatchSummary, SeriesTarget, SnapshotTarget};
use predictive_telemetry::logging::init_logging;
use predictive_telemetry::metrics::{AggregationLevel, DimensionKeys, MetricType, SeriesFilter, TimeRange};
use predictive_telemetry::{Period, SqliteStorage, TelemetryConfig};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(
    name = "telemetry-batch",
    about = "Batch jobs for the predictive telemetry store",
    version
)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, short, global = true, env = "TELEMETRY_CONFIG")]
    config: Option<PathBuf>,

    /// Override store.database_url
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Enable debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a commented sample configuration
    SampleConfig,
    /// Create or update the SQLite schema
    Migrate,
    /// Decompose series into trend, seasonal and residual components
    Decompose {
        #[command(flatten)]
        series: SeriesArgs,
        /// Seasonal bucket (defaults to the configured one)
        #[arg(long, value_enum)]
        bucket: Option<BucketArg>,
    },
    /// Scan the most recent window of each series for anomalies
    Anomalies {
        #[command(flatten)]
        series: SeriesArgs,
        /// Override anomaly.k
        #[arg(long)]
        k: Option<f64>,
    },
    /// Compute and store performance snapshots
    Snapshot {
        /// Model ids (repeatable)
        #[arg(long = "model", required = true)]
        models: Vec<String>,
        #[command(flatten)]
        period: PeriodArgs,
    },
    /// Show the health score of the latest snapshot for each model
    Health {
        /// Model ids (repeatable)
        #[arg(long = "model", required = true)]
        models: Vec<String>,
    },
}

#[derive(clap::Args)]
struct SeriesArgs {
    /// Metric type (e.g. collection_volume, route_duration)
    #[arg(long)]
    metric: String,
    /// Metric names (repeatable; all names when omitted)
    #[arg(long = "name")]
    names: Vec<String>,
    /// Aggregation level
    #[arg(long, default_value = "daily")]
    aggregation: String,
    /// Number of days up to now
    #[arg(long, default_value_t = 90)]
    days: i64,
    /// Restrict to one customer
    #[arg(long)]
    customer: Option<String>,
    /// Restrict to one route
    #[arg(long)]
    route: Option<String>,
    /// Restrict to one vehicle
    #[arg(long)]
    vehicle: Option<String>,
    /// Restrict to one driver
    #[arg(long)]
    driver: Option<String>,
    /// Restrict to one region
    #[arg(long)]
    region: Option<String>,
}

#[derive(clap::Args)]
struct PeriodArgs {
    /// Period start (YYYY-MM-DD)
    #[arg(long, requires = "end")]
    start: Option<NaiveDate>,
    /// Last day of the period, inclusive (YYYY-MM-DD)
    #[arg(long, requires = "start")]
    end: Option<NaiveDate>,
}

#[derive(Clone, Copy, ValueEnum)]
enum BucketArg {
    DayOfWeek,
    Month,
    Quarter,
    HourOfDay,
}

impl From<BucketArg> for SeasonalBucket {
    fn from(arg: BucketArg) -> Self {
        match arg {
            BucketArg::DayOfWeek => SeasonalBucket::DayOfWeek,
            BucketArg::Month => SeasonalBucket::Month,
            BucketArg::Quarter => SeasonalBucket::Quarter,
            BucketArg::HourOfDay => SeasonalBucket::HourOfDay,
        }
    }
}

impl SeriesArgs {
    fn targets(&self) -> Result<Vec<SeriesTarget>> {
        let metric_type = MetricType::from_name(&self.metric);
        let aggregation = AggregationLevel::parse(&self.aggregation)
            .with_context(|| format!("unknown aggregation level: {}", self.aggregation))?;
        if self.days <= 0 {
            bail!("--days must be positive");
        }
        let range = TimeRange::trailing(Utc::now(), Duration::days(self.days))?;
        let filter = SeriesFilter::new(metric_type.clone(), aggregation, range).with_dimensions(self.dimensions());

        if self.names.is_empty() {
            return Ok(vec![SeriesTarget::new(metric_type.to_string(), filter)]);
        }
        Ok(self
            .names
            .iter()
            .map(|name| {
                SeriesTarget::new(
                    format!("{}/{}", metric_type, name),
                    filter.clone().with_name(name.clone()),
                )
            })
            .collect())
    }
}

impl SeriesArgs {
    /// 指定のないディメンションは全値に一致する
    fn dimensions(&self) -> DimensionKeys {
        let mut keys = DimensionKeys::new();
        if let Some(id) = &self.customer {
            keys = keys.customer(id.clone());
        }
        if let Some(id) = &self.route {
            keys = keys.route(id.clone());
        }
        if let Some(id) = &self.vehicle {
            keys = keys.vehicle(id.clone());
        }
        if let Some(id) = &self.driver {
            keys = keys.driver(id.clone());
        }
        if let Some(id) = &self.region {
            keys = keys.region(id.clone());
        }
        keys
    }
}

impl PeriodArgs {
    /// 指定がなければ前日までの30日間（当日は含まない）
    fn period(&self, today: NaiveDate) -> Result<Period> {
        match (self.start, self.end) {
            (Some(start), Some(last_day)) => Ok(Period::through(start, last_day)?),
            _ => Ok(Period::trailing_days(today, 30)?),
        }
    }
}

#[derive(Serialize)]
struct HealthReport {
    model_id: String,
    period: Option<Period>,
    health: Option<predictive_telemetry::performance::HealthBreakdown>,
    attention: Option<predictive_telemetry::performance::AttentionReport>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::SampleConfig = cli.command {
        print!("{}", TelemetryConfig::sample_toml()?);
        return Ok(());
    }

    let mut config = TelemetryConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(url) = cli.database_url {
        config.store.database_url = url;
    }
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    let _guard = init_logging(&config.logging)?;

    let storage = Arc::new(
        SqliteStorage::connect(&config.store.database_url, config.store.max_connections)
            .await
            .with_context(|| format!("failed to open {}", config.store.database_url))?,
    );

    match cli.command {
        Commands::SampleConfig => {}
        Commands::Migrate => {
            storage.run_migrations().await?;
            info!(database = %config.store.database_url, "schema is up to date");
        }
        Commands::Decompose { series, bucket } => {
            if let Some(bucket) = bucket {
                config.decomposition.bucket = bucket.into();
            }
            let runner = BatchRunner::from_config(storage, &config);
            let summary = runner.decompose_all(&series.targets()?).await;
            emit_summary(&summary)?;
        }
        Commands::Anomalies { series, k } => {
            if let Some(k) = k {
                config.anomaly.k = k;
                config.validate()?;
            }
            let runner = BatchRunner::from_config(storage, &config);
            let summary = runner.scan_all(&series.targets()?).await;
            emit_summary(&summary)?;
        }
        Commands::Snapshot { models, period } => {
            let period = period.period(Utc::now().date_naive())?;
            let targets: Vec<SnapshotTarget> = models
                .into_iter()
                .map(|model| SnapshotTarget::new(model, period))
                .collect();
            let runner = BatchRunner::from_config(storage, &config);
            let summary = runner.snapshot_all(&targets).await;
            emit_summary(&summary)?;
        }
        Commands::Health { models } => {
            let runner = BatchRunner::from_config(storage, &config);
            let mut reports = Vec::with_capacity(models.len());
            for model_id in models {
                let snapshot = runner.tracker().latest_snapshot(&model_id).await?;
                reports.push(HealthReport {
                    period: snapshot.as_ref().map(|s| s.period),
                    health: snapshot.as_ref().map(|s| runner.tracker().health(s)),
                    attention: snapshot
                        .as_ref()
                        .map(|s| s.needs_attention_with(&runner.tracker().config().attention)),
                    model_id,
                });
            }
            println!("{}", serde_json::to_string_pretty(&reports)?);
        }
    }

    Ok(())
}

fn emit_summary<T: Serialize>(summary: &BatchSummary<T>) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(summary)?);
    if !summary.all_succeeded() {
        bail!(
            "{} job: {} of {} targets failed",
            summary.job,
            summary.failed,
            summary.failed + summary.succeeded
        );
    }
    Ok(())
}
