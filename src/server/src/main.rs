//! kURL bundler - streams installer bundles assembled on the fly.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use bundler_core::{BundlerConfig, DEFAULT_ALLOWED_REGISTRIES};
use bundler_server::{serve, AppState, DrainController};

/// kURL bundle server
#[derive(Parser, Debug)]
#[command(name = "kurl-bundler", about = "Streams kURL installer bundles")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "BUNDLER_LISTEN", default_value = "0.0.0.0:3001")]
    listen: SocketAddr,

    /// Installer API that serves bundle manifests and receives proxied requests.
    #[arg(long, env = "UPSTREAM_URL", default_value = "http://localhost:3000")]
    upstream: String,

    /// Directory under which per-request image scratch directories are created.
    #[arg(long, env = "IMAGE_SCRATCH_DIR", default_value = "/images")]
    scratch_dir: PathBuf,

    /// Registry domain images may be pulled from (repeatable or comma separated).
    #[arg(long = "allowed-registry", env = "ALLOWED_REGISTRIES", value_delimiter = ',')]
    allowed_registries: Vec<String>,

    /// Installer lint endpoint; lint interception is off when unset.
    #[arg(long, env = "LINT_URL")]
    lint_url: Option<String>,

    /// Connect timeout for outbound HTTP requests, in seconds.
    #[arg(long, env = "CONNECT_TIMEOUT_SECS", default_value = "30")]
    connect_timeout_secs: u64,

    /// Build identifier reported by /healthz.
    #[arg(long, env = "VERSION")]
    build_version: Option<String>,

    /// Emit logs as JSON.
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn into_config(self) -> BundlerConfig {
        let allowed_registries = if self.allowed_registries.is_empty() {
            DEFAULT_ALLOWED_REGISTRIES
                .iter()
                .map(|s| s.to_string())
                .collect()
        } else {
            self.allowed_registries
        };

        BundlerConfig {
            listen: self.listen,
            upstream_url: self.upstream,
            scratch_dir: self.scratch_dir,
            allowed_registries,
            lint_url: self.lint_url.filter(|url| !url.is_empty()),
            connect_timeout_secs: self.connect_timeout_secs,
            version: self
                .build_version
                .unwrap_or_else(|| bundler_server::VERSION.to_string()),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = args.into_config();
    tracing::info!(
        version = %config.version,
        upstream = %config.upstream_url,
        scratch_dir = %config.scratch_dir.display(),
        lint = config.lint_url.is_some(),
        "Starting kURL bundler"
    );

    let listen = config.listen;
    let state = AppState::from_config(config).context("failed to initialize server state")?;
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {}", listen))?;

    let drain = DrainController::new(state.streams.clone());
    drain.spawn_signal_listener();

    serve(listener, state, drain.clone()).await?;
    drain.finish().await;

    Ok(())
}
