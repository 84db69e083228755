//! Protocol gateway between HTTP/WebSocket clients and channel layer workers.
//!
//! Clients connect here; workers only ever see named Redis queues. Each
//! request or socket is forwarded as messages onto the channel layer and the
//! workers' replies are routed back by the process-wide reply receiver.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use clap::Parser;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use weir_channels::{ChannelLayer, ChannelLayerConfig, RedisChannelLayer};

use crate::state::AppState;

pub mod api;
pub mod receiver;
pub mod state;
#[cfg(test)]
mod testutil;

#[derive(Debug, Parser)]
#[command(name = "weir-server", about = "Redis channel layer gateway")]
struct Cli {
    /// Host to listen on
    #[arg(short = 'H', long, default_value = "localhost")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = 8000)]
    port: u16,

    /// Answer failed requests with the error instead of a generic 500
    #[arg(short, long)]
    debug: bool,

    /// Serve static files, format "urlprefix:filesystempath" (repeatable)
    #[arg(short = 's', long = "static", value_name = "PREFIX:PATH", value_parser = parse_static)]
    statics: Vec<(String, PathBuf)>,

    /// Redis host address
    #[arg(short, long, default_value = ":6379")]
    redis: String,

    /// Prefix for all Redis keys
    #[arg(long, default_value = "asgi:")]
    redis_prefix: String,

    /// Maximum number of queued messages per channel
    #[arg(long, default_value_t = 100)]
    redis_capacity: usize,

    /// Message expiry in seconds
    #[arg(long, default_value_t = 60)]
    redis_expiry: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let layer = Arc::new(RedisChannelLayer::new(ChannelLayerConfig {
        url: redis_url(&cli.redis),
        prefix: cli.redis_prefix.clone(),
        expiry: cli.redis_expiry,
        capacity: cli.redis_capacity,
    })?);
    wait_for_redis(&layer).await?;

    let channels: Arc<dyn ChannelLayer> = layer;
    let replies = receiver::ReplyRouter::spawn(channels.clone()).await?;
    let state = AppState {
        channels,
        replies,
        debug: cli.debug,
    };

    let mut app = Router::new();
    for (prefix, path) in &cli.statics {
        app = app.nest_service(prefix, ServeDir::new(path));
    }
    let app = app
        .fallback(api::dispatch)
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind((cli.host.as_str(), cli.port))
        .await
        .with_context(|| format!("cannot listen on {}:{}", cli.host, cli.port))?;
    info!(host = %cli.host, port = cli.port, "listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(signals())
    .await?;
    info!("server has shut down");
    Ok(())
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .init();
}

/// Turns the `--redis` address into a connection URL. A bare `:port` means
/// localhost, a full URL is passed through.
fn redis_url(addr: &str) -> String {
    if addr.contains("://") {
        return addr.to_string();
    }
    if let Some(port) = addr.strip_prefix(':') {
        return format!("redis://127.0.0.1:{port}");
    }
    format!("redis://{addr}")
}

fn parse_static(value: &str) -> Result<(String, PathBuf), String> {
    let Some((prefix, path)) = value.split_once(':') else {
        return Err("has to be \"urlprefix:filesystempath\"".to_string());
    };
    if !prefix.starts_with('/') || prefix == "/" {
        return Err("the url prefix has to start with / and cannot be the root".to_string());
    }
    if path.is_empty() {
        return Err("the filesystem path cannot be empty".to_string());
    }
    Ok((prefix.to_string(), PathBuf::from(path)))
}

async fn wait_for_redis(layer: &RedisChannelLayer) -> Result<()> {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match layer.ping().await {
            Ok(()) => return Ok(()),
            Err(err) if attempt < 30 => {
                warn!(%err, attempt, "redis is not reachable yet");
                tokio::time::sleep(Duration::from_millis(200 * u64::from(attempt))).await;
            }
            Err(err) => return Err(err).context("cannot reach redis"),
        }
    }
}

async fn signals() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn redis_addresses_become_urls() {
        assert_eq!(redis_url(":6379"), "redis://127.0.0.1:6379");
        assert_eq!(redis_url("redis.internal:6380"), "redis://redis.internal:6380");
        assert_eq!(redis_url("redis://user@host:6379/1"), "redis://user@host:6379/1");
    }

    #[test]
    fn static_mounts_parse() {
        assert_eq!(
            parse_static("/static:/var/www").unwrap(),
            ("/static".to_string(), PathBuf::from("/var/www"))
        );
        assert!(parse_static("static").is_err());
        assert!(parse_static("static:/var/www").is_err());
        assert!(parse_static("/:/var/www").is_err());
        assert!(parse_static("/static:").is_err());
    }

    #[test]
    fn defaults_match_the_documented_flags() {
        let cli = Cli::parse_from(["weir-server"]);
        assert_eq!(cli.host, "localhost");
        assert_eq!(cli.port, 8000);
        assert!(!cli.debug);
        assert_eq!(cli.redis, ":6379");
        assert_eq!(cli.redis_prefix, "asgi:");
        assert_eq!(cli.redis_capacity, 100);
        assert_eq!(cli.redis_expiry, 60);
    }
}
