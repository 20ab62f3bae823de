use std::sync::Arc;

use clap::Parser;
use recall_core::{HardwareMonitor, MaintenanceHandle, RecallConfig, SystemMonitor, VectorStore};
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use recall_server::{server, AppState};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "recall.toml")]
    config: String,

    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let config = match RecallConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level));
    fmt().with_env_filter(filter).init();

    let store = match VectorStore::open(&config).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            eprintln!("Failed to open vector store: {}", e);
            std::process::exit(1);
        }
    };

    if args.health {
        let code = match store.health().await {
            Ok(report) => {
                println!("✅ SQLite {} ({} records)", report.sqlite_version, report.records);
                println!(
                    "✅ Vector index: {} entries, dimension {}",
                    report.index_entries,
                    report
                        .index_dimension
                        .map(|d| d.to_string())
                        .unwrap_or_else(|| "unset".to_string())
                );
                0
            }
            Err(e) => {
                println!("❌ Health check failed: {}", e);
                1
            }
        };
        store.close().await?;
        std::process::exit(code);
    }

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    let monitor: Arc<dyn HardwareMonitor> = Arc::new(SystemMonitor::new(
        config.maintenance.warning_temp_celsius,
        config.maintenance.critical_temp_celsius,
    ));
    let maintenance =
        MaintenanceHandle::spawn(store.clone(), monitor.clone(), config.maintenance.clone());

    let state = AppState::new(store.clone(), monitor, &config);
    let served = server::run_unix_server(&config.service.socket_path, state, tx.subscribe()).await;

    maintenance.shutdown().await;
    if let Err(e) = store.close().await {
        tracing::error!(error = %e, "Failed to close vector store cleanly");
    }
    served
}
