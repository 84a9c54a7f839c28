//! folio-shell - stdio bridge between the desktop UI and the local model runtime

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use folio_runtime::{config::default_config_path, ModelRuntimeManager, RuntimeConfig};
use folio_shell::IpcBridge;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "folio-shell", version, about = "Local model runtime bridge for FOLIO")]
struct Args {
    /// Runtime configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Directory holding downloaded model weights
    #[arg(long, value_name = "DIR")]
    models_dir: Option<PathBuf>,

    /// Path to the llamafile executable
    #[arg(long, value_name = "PATH")]
    llamafile: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Do not reactivate the previously active model on startup
    #[arg(long)]
    no_restore: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config = load_config(&args)?;
    info!(
        models_dir = %config.models_dir.display(),
        llamafile = %config.llamafile_path.display(),
        "Starting folio-shell"
    );

    let manager = ModelRuntimeManager::new(config).context("failed to build runtime manager")?;
    manager
        .initialize()
        .await
        .context("failed to initialize runtime manager")?;

    let bridge = IpcBridge::new(manager.clone());
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();

    let result = tokio::select! {
        result = bridge.serve(stdin, stdout) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            Ok(())
        }
    };

    manager.shutdown().await;

    match result {
        Ok(()) => {
            info!("folio-shell exited");
            Ok(())
        }
        Err(e) => {
            error!("IPC error: {}", e);
            Err(e.into())
        }
    }
}

/// Logs go to stderr; stdout carries the protocol
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(args: &Args) -> Result<RuntimeConfig> {
    let path = args.config.clone().unwrap_or_else(default_config_path);
    let mut config = RuntimeConfig::load_from(&path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;

    if let Some(models_dir) = &args.models_dir {
        config.models_dir = models_dir.clone();
    }
    if let Some(llamafile) = &args.llamafile {
        config.llamafile_path = llamafile.clone();
    }
    if args.no_restore {
        config.restore_active_model = false;
    }

    config.validate().context("invalid runtime configuration")?;
    Ok(config)
}
