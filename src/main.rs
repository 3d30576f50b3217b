mod aggregator;
mod alerts;
mod analysis;
mod annotations;
mod audit;
mod buffers;
mod config;
mod engine;
mod gateway;
mod liveness;
mod metrics;
mod mode;
mod rest;
mod settings;
mod simulate;
mod storage;
mod web;

use chrono::{DateTime, TimeDelta, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::audit::{AuditFilter, AuditRecorder};
use crate::config::{DashboardConfig, DEFAULT_DEVICE_ID};
use crate::engine::DashboardEngine;
use crate::gateway::RemoteDataGateway;
use crate::metrics::SensorMode;
use crate::rest::RestGateway;
use crate::simulate::SimulationPlan;
use crate::storage::SqliteGateway;
use crate::web::{start_web_server, AppState};

#[derive(Parser)]
#[command(name = "moveometer-dashboard")]
#[command(about = "Live dashboard back end for moveOmeter mmWave sensors", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dashboard engine and web server
    Serve {
        /// Local SQLite database used when no REST backend is given
        #[arg(short, long, default_value = "moveometer.db")]
        database: PathBuf,

        /// Base URL of the hosted REST backend
        #[arg(long, env = "MOVEOMETER_REST_URL")]
        rest_url: Option<String>,

        /// API key for the hosted REST backend
        #[arg(long, env = "MOVEOMETER_API_KEY", hide_env_values = true)]
        api_key: Option<String>,

        /// Device to monitor
        #[arg(long, env = "MOVEOMETER_DEVICE_ID", default_value = DEFAULT_DEVICE_ID)]
        device_id: String,

        /// Port for the web dashboard
        #[arg(short, long, default_value = "8080")]
        port: u16,

        /// Path to store log files
        #[arg(short, long, default_value = "logs")]
        log_dir: PathBuf,

        /// Seconds between polls for the newest reading
        #[arg(long, default_value = "3")]
        poll_interval: u64,

        /// Seconds between full reloads of the windows
        #[arg(long, default_value = "120")]
        reload_interval: u64,
    },
    /// Export the recent readings and timelines to JSON
    Export {
        /// Path to the database
        #[arg(short, long, default_value = "moveometer.db")]
        database: PathBuf,

        /// Output file path
        #[arg(short, long, default_value = "moveometer_export.json")]
        output: PathBuf,

        /// Hours of history to export (at most 24)
        #[arg(long, default_value = "24")]
        hours: i64,

        #[arg(long, env = "MOVEOMETER_DEVICE_ID", default_value = DEFAULT_DEVICE_ID)]
        device_id: String,
    },
    /// Analyze the last 24 hours and generate a report
    Analyze {
        /// Path to the database
        #[arg(short, long, default_value = "moveometer.db")]
        database: PathBuf,

        /// Output report file
        #[arg(short, long, default_value = "moveometer_report.txt")]
        output: PathBuf,

        #[arg(long, env = "MOVEOMETER_DEVICE_ID", default_value = DEFAULT_DEVICE_ID)]
        device_id: String,
    },
    /// Seed a local database with synthetic readings
    Simulate {
        /// Path to the database
        #[arg(short, long, default_value = "moveometer.db")]
        database: PathBuf,

        /// Hours of history to generate, ending now
        #[arg(long, default_value = "24")]
        hours: i64,

        /// Seconds between readings
        #[arg(short, long, default_value = "20")]
        interval: i64,

        /// Sensor mode of the generated readings (sleep or fall_detection)
        #[arg(short, long, default_value = "sleep")]
        mode: SensorMode,

        #[arg(long, env = "MOVEOMETER_DEVICE_ID", default_value = DEFAULT_DEVICE_ID)]
        device_id: String,
    },
    /// Export the audit log to CSV
    Audit {
        /// Path to the database
        #[arg(short, long, default_value = "moveometer.db")]
        database: PathBuf,

        /// Output file path
        #[arg(short, long, default_value = "audit_log.csv")]
        output: PathBuf,

        /// Only entries with this action
        #[arg(long)]
        action: Option<String>,

        /// Only entries from the last N hours
        #[arg(long)]
        since_hours: Option<i64>,
    },
}

fn hours_before(end: DateTime<Utc>, hours: i64) -> anyhow::Result<DateTime<Utc>> {
    TimeDelta::try_hours(hours)
        .and_then(|span| end.checked_sub_signed(span))
        .ok_or_else(|| anyhow::anyhow!("{} hours is out of range", hours))
}

fn init_console_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(fmt::layer())
        .init();
}

async fn serve<G: RemoteDataGateway>(gateway: Arc<G>, config: DashboardConfig, port: u16) -> anyhow::Result<()> {
    let (engine, handle) = DashboardEngine::new(gateway.clone(), config.clone());
    let engine_task = tokio::spawn(engine.run());

    let state = AppState {
        engine: handle.clone(),
        gateway,
        device_id: config.device_id.clone(),
        audit: AuditRecorder::new(&config.operator),
    };
    tokio::spawn(async move {
        if let Err(e) = start_web_server(state, port).await {
            error!("Web server error: {}", e);
        }
    });

    info!("Open http://localhost:{} in your browser. Press Ctrl+C to stop", port);
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    handle.shutdown();
    engine_task.await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            database,
            rest_url,
            api_key,
            device_id,
            port,
            log_dir,
            poll_interval,
            reload_interval,
        } => {
            std::fs::create_dir_all(&log_dir)?;
            let file_appender = RollingFileAppender::new(Rotation::HOURLY, &log_dir, "moveometer-dashboard.log");
            let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

            tracing_subscriber::registry()
                .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
                .with(fmt::layer().with_writer(std::io::stdout))
                .with(fmt::layer().json().with_writer(non_blocking))
                .init();

            let config = DashboardConfig {
                device_id,
                poll_interval: Duration::from_secs(poll_interval.max(1)),
                reload_interval: Duration::from_secs(reload_interval.max(1)),
                ..DashboardConfig::from_env()
            };

            info!("Starting moveOmeter dashboard");
            info!("Device: {}", config.device_id);
            info!("Poll interval: {:?}, reload interval: {:?}", config.poll_interval, config.reload_interval);
            info!("Web dashboard: http://localhost:{}", port);

            match rest_url {
                Some(url) => {
                    let Some(key) = api_key else {
                        anyhow::bail!("--api-key (or MOVEOMETER_API_KEY) is required with --rest-url");
                    };
                    info!("Backend: {}", url);
                    let gateway = Arc::new(RestGateway::new(&url, &key, config.poll_interval)?);
                    serve(gateway, config, port).await
                }
                None => {
                    info!("Database: {:?}", database);
                    let gateway = Arc::new(SqliteGateway::new(&database)?);
                    serve(gateway, config, port).await
                }
            }
        }
        Commands::Export {
            database,
            output,
            hours,
            device_id,
        } => {
            init_console_logging();
            let gateway = SqliteGateway::new(&database)?;
            let config = DashboardConfig {
                device_id,
                ..DashboardConfig::default()
            };
            let data = analysis::export_json(&gateway, &config, Utc::now(), hours).await?;
            std::fs::write(&output, data)?;
            println!("Exported data to {:?}", output);
            Ok(())
        }
        Commands::Analyze {
            database,
            output,
            device_id,
        } => {
            init_console_logging();
            let gateway = SqliteGateway::new(&database)?;
            let config = DashboardConfig {
                device_id,
                ..DashboardConfig::default()
            };
            let report = analysis::generate_report(&gateway, &config, Utc::now()).await?;
            std::fs::write(&output, &report)?;
            println!("{}", report);
            println!("\nReport saved to {:?}", output);
            Ok(())
        }
        Commands::Simulate {
            database,
            hours,
            interval,
            mode,
            device_id,
        } => {
            init_console_logging();
            let gateway = SqliteGateway::new(&database)?;
            let end = Utc::now();
            let plan = SimulationPlan {
                device_id,
                mode,
                start: hours_before(end, hours.max(0))?,
                end,
                interval: TimeDelta::try_seconds(interval)
                    .ok_or_else(|| anyhow::anyhow!("{} seconds is out of range", interval))?,
            };
            let inserted = simulate::seed(&gateway, &plan, &mut rand::thread_rng()).await?;
            println!("Seeded {} readings into {:?}", inserted, database);
            Ok(())
        }
        Commands::Audit {
            database,
            output,
            action,
            since_hours,
        } => {
            init_console_logging();
            let gateway = SqliteGateway::new(&database)?;
            let since = match since_hours {
                Some(h) => Some(hours_before(Utc::now(), h)?),
                None => None,
            };
            let filter = AuditFilter {
                action,
                since,
                ..AuditFilter::default()
            };
            let entries = audit::list(&gateway, &filter).await?;
            std::fs::write(&output, audit::to_csv(&entries))?;
            println!("Exported {} audit entries to {:?}", entries.len(), output);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_huge_hour_spans_are_rejected() {
        let now: DateTime<Utc> = "2026-10-16T12:00:00Z".parse().unwrap();
        assert_eq!(hours_before(now, 24).unwrap(), now - TimeDelta::hours(24));
        assert!(hours_before(now, i64::MAX).is_err());
        assert!(hours_before(now, 2_400_000_000).is_err());
    }
}
