mod analytics;
mod client;
mod config;
mod error;
mod locator;
mod models;
mod platform;
mod service;

use clap::{Parser, Subcommand};
use config::{ensure_initialized, load_config, AppConfig};
use error::AppError;
use locator::LocatorSettings;
use models::EnrichedSnapshot;
use service::{MonitorService, TickOutcome};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "quotawatch")]
#[command(about = "Language server quota monitor")]
struct Cli {
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init,
    Detect {
        #[arg(long, default_value_t = 3)]
        attempts: u32,
    },
    Status {
        #[arg(long, default_value = "text")]
        format: String,
        #[arg(long, default_value_t = 3)]
        attempts: u32,
    },
    Watch {
        #[arg(long, default_value = "text")]
        format: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

fn validate_format(input: &str) -> Result<OutputFormat, AppError> {
    if input.eq_ignore_ascii_case("text") {
        Ok(OutputFormat::Text)
    } else if input.eq_ignore_ascii_case("json") {
        Ok(OutputFormat::Json)
    } else {
        Err(AppError::Config(
            "Unsupported output format. Use text or json.".into(),
        ))
    }
}

fn not_found(attempts: u32) -> AppError {
    AppError::Discovery(format!(
        "language server not found after {attempts} attempt(s)"
    ))
}

fn render_text(cfg: &AppConfig, snap: &EnrichedSnapshot) -> String {
    let mut lines = vec![format!(
        "Health {}% ({})  session usage {}%  since {}",
        snap.overall_health,
        snap.health_label,
        snap.total_session_usage,
        snap.session_start_time.format("%H:%M")
    )];
    if let Some(plan) = &snap.plan_name {
        lines.push(format!("Plan: {plan}"));
    }
    if let Some(credits) = &snap.credits {
        lines.push(format!(
            "Credits: {} / {} ({}% left)",
            credits.available, credits.monthly, credits.remaining_percent
        ));
    }
    for r in snap
        .resources
        .iter()
        .filter(|r| cfg.pinned_models.is_empty() || cfg.is_pinned(&r.quota.id))
    {
        lines.push(format!(
            "{} {:<28} {:>3}%  reset {:<7} burn {:.1}%/h ({})  eta {}  [{}]",
            if r.is_active { "*" } else { " " },
            r.quota.label,
            r.quota.remaining_percent,
            r.quota.time_until_reset_label,
            r.burn_rate,
            r.burn_rate_label,
            r.predicted_exhaustion_label,
            r.trend.as_label()
        ));
    }
    lines.join("\n")
}

fn print_snapshot(
    cfg: &AppConfig,
    snap: &EnrichedSnapshot,
    format: OutputFormat,
) -> Result<(), AppError> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(snap)?),
        OutputFormat::Text => println!("{}", render_text(cfg, snap)),
    }
    Ok(())
}

fn setup_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("quotawatch=debug")
        } else {
            EnvFilter::new("quotawatch=info")
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Init => {
            ensure_initialized()?;
            println!("Initialized quotawatch config and data directories.");
        }
        Commands::Detect { attempts } => {
            let cfg = load_config()?;
            let settings = LocatorSettings {
                attempts,
                ..LocatorSettings::default()
            };
            let mut svc = MonitorService::new(&cfg, settings)?;
            let found = svc.detect().await.ok_or_else(|| not_found(attempts))?;
            println!(
                "pid={} extension_port={} connect_port={}",
                found.process_id, found.extension_port, found.connect_port
            );
        }
        Commands::Status { format, attempts } => {
            let format = validate_format(&format)?;
            let cfg = load_config()?;
            let settings = LocatorSettings {
                attempts,
                ..LocatorSettings::default()
            };
            let mut svc = MonitorService::new(&cfg, settings)?;
            match svc.tick().await? {
                TickOutcome::NotFound => return Err(not_found(attempts)),
                TickOutcome::Updated(snap) => print_snapshot(&cfg, &snap, format)?,
            }
        }
        Commands::Watch { format } => {
            let format = validate_format(&format)?;
            let cfg = load_config()?;
            if !cfg.enabled {
                println!("Monitoring is disabled in config.");
                return Ok(());
            }
            let mut svc = MonitorService::new(&cfg, LocatorSettings::default())?;
            let attempts = svc.attempts();

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    let _ = shutdown_tx.send(true);
                }
            });

            svc.watch(
                Duration::from_secs(cfg.refresh_seconds),
                shutdown_rx,
                |result| match result {
                    Ok(TickOutcome::Updated(snap)) => {
                        if let Err(e) = print_snapshot(&cfg, &snap, format) {
                            error!("Failed to print snapshot: {}", e);
                        }
                    }
                    Ok(TickOutcome::NotFound) => {
                        warn!("{}; retrying next tick", not_found(attempts));
                    }
                    Err(e) => error!("Poll failed: {}", e),
                },
            )
            .await;
        }
    }

    Ok(())
}
