//! cachefleet
//!
//! Runs a supervisor and a set of local cache instances sharing one memory
//! pool.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           cachefleet                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │  Supervisor  │───▶│   Instance   │◀───│    Client    │       │
//! │  │   (Market)   │    │  (RAM/Disk)  │    │    (TCP)     │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cachefleet::adapters::{LocalEndpoint, LoggingEventPublisher};
use cachefleet::instance::{CacheInstance, CacheServer, InstanceConfig};
use cachefleet::market::MarketConfig;
use cachefleet::metrics::{run_health_server, run_metrics_server, FleetMetrics, HealthState};
use cachefleet::store::{DiskConfig, StoreConfig};
use cachefleet::supervisor::{Supervisor, SupervisorConfig};

const MIB: u64 = 1024 * 1024;

// =============================================================================
// CLI Arguments
// =============================================================================

/// cachefleet - memory-elastic key/value cache fleet
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Memory pool shared by all instances, in MiB (rounded up to whole slabs)
    #[arg(long, env = "POOL_SIZE_MB", default_value = "1024")]
    pool_size_mb: u64,

    /// Market rounds per second
    #[arg(long, env = "MARKET_FREQUENCY", default_value = "1.0")]
    frequency: f64,

    /// Timeout of a supervisor request to an instance, in seconds
    #[arg(long, env = "REQUEST_TIMEOUT_SECONDS", default_value = "5")]
    request_timeout_seconds: u64,

    /// Number of cache instances to start
    #[arg(long, env = "INSTANCES", default_value = "2")]
    instances: u16,

    /// Memory each instance asks for, in MiB
    #[arg(long, env = "INSTANCE_REQUEST_MB", default_value = "512")]
    instance_request_mb: u64,

    /// Address the client servers bind to
    #[arg(long, env = "LISTEN_HOST", default_value = "127.0.0.1")]
    listen_host: IpAddr,

    /// Client port of the first instance; the others follow
    #[arg(long, env = "BASE_PORT", default_value = "7000")]
    base_port: u16,

    /// Directory holding one disk tier per instance
    #[arg(long, env = "DISK_DIR", default_value = "./.slabs")]
    disk_dir: PathBuf,

    /// Disk tier budget per instance in MiB (0 = unbounded)
    #[arg(long, env = "DISK_MAX_MB", default_value = "0")]
    disk_max_mb: u64,

    /// Slab size in KiB
    #[arg(long, env = "SLAB_SIZE_KB", default_value = "4096")]
    slab_size_kb: u32,

    /// Ticks without access before a slab is preferred for eviction (0 = off)
    #[arg(long, env = "SLAB_TTL_TICKS", default_value = "0")]
    slab_ttl: u64,

    /// Instance tick interval in milliseconds
    #[arg(long, env = "TICK_INTERVAL_MS", default_value = "1000")]
    tick_interval_ms: u64,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    info!("Starting cachefleet");
    info!("  Pool size: {} MiB", args.pool_size_mb);
    info!("  Instances: {} x {} MiB", args.instances, args.instance_request_mb);
    info!("  Round frequency: {} Hz", args.frequency);
    info!("  Disk directory: {}", args.disk_dir.display());

    let shutdown = CancellationToken::new();
    let metrics = Arc::new(FleetMetrics::new().context("failed to create metrics registry")?);
    let health = Arc::new(HealthState::new());

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_state = Arc::clone(&health);
    let token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_state, token).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let registry = Arc::clone(&metrics);
    let token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, registry, token).await {
            error!("Metrics server error: {}", e);
        }
    });

    let slab_size = args.slab_size_kb.saturating_mul(1024);
    let supervisor_config = SupervisorConfig {
        market: MarketConfig::with_pool_size(args.pool_size_mb.saturating_mul(MIB)),
        frequency: args.frequency,
        request_timeout: Duration::from_secs(args.request_timeout_seconds),
        slab_size: slab_size as u64,
    };
    let supervisor = Arc::new(
        Supervisor::new(supervisor_config, Arc::new(LoggingEventPublisher::new()))
            .context("invalid supervisor configuration")?
            .with_metrics(Arc::clone(&metrics)),
    );

    for index in 0..args.instances {
        let name = format!("cache-{}", index);
        let config = InstanceConfig {
            name: name.clone(),
            requested: args.instance_request_mb.saturating_mul(MIB),
            tick_interval: Duration::from_millis(args.tick_interval_ms),
            store: StoreConfig {
                slab_size,
                max_slabs: 0,
                slab_ttl: args.slab_ttl,
                disk: DiskConfig {
                    max_bytes: args.disk_max_mb.saturating_mul(MIB),
                    ..DiskConfig::at(args.disk_dir.join(&name))
                },
                ..Default::default()
            },
        };

        let instance = Arc::new(
            CacheInstance::open(config)
                .with_context(|| format!("failed to open instance {}", name))?
                .with_metrics(Arc::clone(&metrics)),
        );

        let port = args.base_port.saturating_add(index);
        let server = CacheServer::bind(Arc::clone(&instance), SocketAddr::new(args.listen_host, port))
            .await
            .with_context(|| format!("failed to bind client port {}", port))?;
        tokio::spawn(async move {
            if let Err(e) = server.serve().await {
                error!("Cache server error: {}", e);
            }
        });
        tokio::spawn(Arc::clone(&instance).run());

        let endpoint = Arc::new(LocalEndpoint::new(Arc::clone(&instance)));
        match supervisor
            .register(instance.config().requested, endpoint)
            .await
        {
            Ok(registration) => info!(
                name = %name,
                uid = registration.uid,
                max_size = registration.max_size,
                port,
                "Instance joined the fleet"
            ),
            Err(e) => {
                error!(name = %name, "Registration failed: {}", e);
                instance.stop();
            }
        }
    }

    // Ctrl-C cancels the token shared by every loop
    let token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupt received, shutting down"),
            Err(e) => error!("Failed to listen for interrupt: {}", e),
        }
        token.cancel();
    });

    health.set_ready(true);
    Arc::clone(&supervisor).run(shutdown.clone()).await;
    health.set_ready(false);
    shutdown.cancel();

    info!("cachefleet shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}
