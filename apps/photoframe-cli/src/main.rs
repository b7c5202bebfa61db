use std::{env, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use photoframe_network::{serve_chunks, serve_registration};
use photoframe_ops::{check_bucket_dirs, ensure_cache_dir, init_tracing};
use photoframe_service::{spawn_background, PhotoService};
use photoframe_types::config::PhotoframeConfig;
use tokio::net::TcpListener;
use tracing::{error, info};

const DEFAULT_CONFIG: &str = "configs/photoframe.toml";

/// Serve random photos to small displays as RGB565 chunks.
#[derive(Debug, Parser)]
#[command(name = "photoframe", version)]
struct Args {
    /// Config file; falls back to $PHOTOFRAME_CONFIG, then configs/photoframe.toml.
    #[arg(short, long)]
    config: Option<String>,
    /// Override the HTTP chunk port.
    #[arg(long)]
    chunk_port: Option<u16>,
    /// Override the MAC registration port.
    #[arg(long)]
    registration_port: Option<u16>,
    /// Override the log filter, e.g. `debug` or `photoframe_service=trace`.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_tracing(&config.ops, args.log_level.as_deref())?;

    ensure_cache_dir(&config.library.cache_dir)?;
    check_bucket_dirs(&config.library);

    let service = Arc::new(PhotoService::from_config(&config)?);
    let changed = service.rescan().await?;
    info!(
        "Loaded {} bucket(s), {} with photos; default bucket {}",
        service.library().bucket_names().len(),
        changed,
        config.library.default_bucket
    );
    let _background = spawn_background(
        service.clone(),
        config.library.rescan_interval(),
        config.sessions.sweep_interval(),
    );

    let bind = &config.network.bind_addr;
    let chunk_listener = TcpListener::bind((bind.as_str(), config.network.chunk_port))
        .await
        .with_context(|| format!("cannot bind chunk port {bind}:{}", config.network.chunk_port))?;
    let registration_listener =
        TcpListener::bind((bind.as_str(), config.network.registration_port))
            .await
            .with_context(|| {
                format!(
                    "cannot bind registration port {bind}:{}",
                    config.network.registration_port
                )
            })?;

    let spec = service.spec();
    info!(
        "Serving {}x{} RGB565 in {} chunks of {} bytes",
        spec.width,
        spec.height,
        spec.total_chunks(),
        spec.chunk_size()
    );

    tokio::select! {
        result = serve_chunks(chunk_listener, service.clone(), config.network.require_mac) => {
            if let Err(err) = &result {
                error!("Chunk server exited: {err}");
            }
            result?;
        }
        result = serve_registration(registration_listener, service.clone()) => {
            if let Err(err) = &result {
                error!("Registration listener exited: {err}");
            }
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }
    Ok(())
}

fn load_config(args: &Args) -> Result<PhotoframeConfig> {
    let path = args
        .config
        .clone()
        .or_else(|| env::var("PHOTOFRAME_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG.into());
    let mut config = PhotoframeConfig::from_file(&path)
        .with_context(|| format!("failed to load config from {path:?}"))?;

    if let Some(port) = args.chunk_port {
        config.network.chunk_port = port;
    }
    if let Some(port) = args.registration_port {
        config.network.registration_port = port;
    }
    config
        .validate()
        .with_context(|| format!("invalid config in {path:?}"))?;
    Ok(config)
}
