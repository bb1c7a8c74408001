//! IPTV Cache
//!
//! Command-line front end for the catalog cache engine: load catalogs,
//! read windows back, inspect tier statistics, and serve Prometheus
//! metrics while the background sweeper runs.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use iptv_cache::error::{Error, Result};
use iptv_cache::selector::PeakEvent;
use iptv_cache::{
    CacheEngine, CatalogSlice, EngineConfig, Environment, LoadOptions, LoadedCatalog, WindowRequest,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// IPTV Cache - multi-tier adaptive cache for large IPTV catalogs
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, short, env = "IPTV_CACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for the durable tiers (in-memory when unset)
    #[arg(long, env = "IPTV_CACHE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Deployment environment, overriding detection
    #[arg(long)]
    environment: Option<Environment>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load a catalog through the cache and report how it was stored
    Load {
        /// Catalog URL or file path
        source: String,

        /// Drop adult channels
        #[arg(long)]
        exclude_adult: bool,

        /// Keep at most this many channels
        #[arg(long)]
        max_channels: Option<usize>,
    },

    /// Print a window of a catalog as JSON
    Window {
        /// Catalog URL or file path
        source: String,

        #[arg(long, default_value = "0")]
        offset: usize,

        #[arg(long)]
        limit: Option<usize>,

        /// Restrict to one category
        #[arg(long)]
        category: Option<String>,
    },

    /// Print tier, parse-cache and selector statistics
    Stats,

    /// Remove expired entries from every tier
    Sweep,

    /// Wipe every tier
    Clear,

    /// Run the sweeper and serve /metrics and /healthz until interrupted
    Serve {
        /// Metrics server bind address
        #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9464")]
        metrics_addr: String,

        /// Start with a peak event active (sports, news, general)
        #[arg(long)]
        peak_event: Option<PeakEvent>,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(dir) = &args.data_dir {
        config.storage.data_dir = Some(dir.clone());
    }
    if let Some(environment) = args.environment {
        config.selector.environment = Some(environment);
    }

    let engine = Arc::new(CacheEngine::open(&config).await?);
    info!(
        environment = %engine.selector().environment(),
        durable = config.storage.data_dir.is_some(),
        "Cache engine ready"
    );

    match args.command {
        Command::Load {
            source,
            exclude_adult,
            max_channels,
        } => {
            let options = LoadOptions {
                exclude_adult,
                max_channels,
            };
            let loaded = engine.get_catalog(&source, &options).await?;
            info!(channels = loaded.len(), origin = ?loaded.origin, "Catalog loaded");
            print_json(&LoadSummary {
                channels: loaded.len(),
                loaded: &loaded,
            })?;
        }
        Command::Window {
            source,
            offset,
            limit,
            category,
        } => {
            let request = WindowRequest {
                offset,
                limit,
                category,
            };
            match engine.get_window(&source, &LoadOptions::default(), &request).await? {
                CatalogSlice::Channels(channels) => print_lines(&channels)?,
                CatalogSlice::Summaries(summaries) => print_lines(&summaries)?,
            }
        }
        Command::Stats => print_json(&engine.stats())?,
        Command::Sweep => {
            let removed = engine.sweep().await;
            info!(removed, "Sweep complete");
        }
        Command::Clear => {
            engine.clear().await;
            info!("Cache cleared");
        }
        Command::Serve {
            metrics_addr,
            peak_event,
        } => {
            if let Some(event) = peak_event {
                engine.start_peak_event(event).await;
            }
            engine.spawn_sweeper();

            tokio::select! {
                result = run_metrics_server(&metrics_addr, engine.clone()) => {
                    if let Err(e) = result {
                        error!("Metrics server error: {}", e);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupt received");
                }
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}

#[derive(Serialize)]
struct LoadSummary<'a> {
    channels: usize,
    #[serde(flatten)]
    loaded: &'a LoadedCatalog,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// One JSON document per line
fn print_lines<T: Serialize>(items: &[T]) -> Result<()> {
    for item in items {
        println!("{}", serde_json::to_string(item)?);
    }
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    // Logs go to stderr so command output stays parseable
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, engine: Arc<CacheEngine>) -> Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    fn respond(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(body.into()));
        *response.status_mut() = status;
        if let Ok(value) = content_type.parse() {
            response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
        }
        response
    }

    async fn metrics_handler(
        req: Request<hyper::body::Incoming>,
        engine: Arc<CacheEngine>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/metrics" => match iptv_cache::telemetry::render_prometheus(&engine.stats()) {
                Ok(text) => respond(StatusCode::OK, "text/plain; version=0.0.4", text),
                Err(e) => {
                    error!("Failed to render metrics: {}", e);
                    respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", "metrics unavailable")
                }
            },
            "/stats" => match serde_json::to_vec(&engine.stats()) {
                Ok(body) => respond(StatusCode::OK, "application/json", body),
                Err(_) => respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", "stats unavailable"),
            },
            "/healthz" | "/livez" => respond(StatusCode::OK, "text/plain", "ok"),
            "/readyz" => {
                if engine.manager().storage_critical() {
                    respond(StatusCode::SERVICE_UNAVAILABLE, "text/plain", "storage critical")
                } else {
                    respond(StatusCode::OK, "text/plain", "ok")
                }
            }
            _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
        };
        Ok(response)
    }

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid metrics server address: {}", e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind metrics server: {}", e)))?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("Metrics server accept error: {}", e)))?;

        let io = TokioIo::new(stream);
        let engine = engine.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| metrics_handler(req, engine.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Metrics server connection error: {}", e);
            }
        });
    }
}
