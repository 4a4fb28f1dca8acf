//! Gateway Daemon - Composition Root for the Routing Engine
//!
//! Loads configuration and the model catalog, builds the routing engine and
//! either keeps it running (`serve`) or answers one admin question and exits.
//!
//! # Usage
//!
//! ```bash
//! # Run with the default config (~/.config/llm-gateway/gateway.toml)
//! gateway-daemon serve
//!
//! # Explicit config and catalog
//! gateway-daemon --config /etc/llm-gateway/gateway.toml serve --catalog /etc/llm-gateway/catalog.toml
//!
//! # Show how a request would be routed
//! gateway-daemon plan gemini-1.5-flash --prefer google --streaming
//!
//! # Validate config and catalog
//! gateway-daemon check
//!
//! # Inspect a running `serve` (shared store and metrics export)
//! gateway-daemon breakers
//! gateway-daemon metrics
//!
//! # Verbose logging
//! RUST_LOG=debug gateway-daemon serve
//! ```
//!
//! # Signals
//!
//! - `SIGINT` (Ctrl-C): Graceful shutdown of `serve`

mod serve;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing::info;

use gateway_core::{
    load_catalog, load_config_from_path, BreakerStateStore, CapabilityRequirements, ConfigOverrides,
    FileStateStore, GatewayConfig, PlanRequest, ProviderRouter, SharedBreakerState,
};

/// Gateway Daemon - Provider routing and resilience for llm-gateway
#[derive(Parser, Debug)]
#[command(name = "gateway-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "GATEWAY_CONFIG", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "GATEWAY_LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    #[command(flatten)]
    overrides: OverrideArgs,

    #[command(subcommand)]
    command: Command,
}

/// Settings that take priority over file and environment
#[derive(ClapArgs, Debug, Default)]
struct OverrideArgs {
    /// Catalog file path
    #[arg(long, value_name = "FILE", global = true)]
    catalog: Option<PathBuf>,

    /// Planned attempts examined per request
    #[arg(long, value_name = "N", global = true)]
    max_retries: Option<usize>,

    /// Consecutive failures that open a breaker
    #[arg(long, value_name = "N", global = true)]
    failure_threshold: Option<u32>,

    /// Mirror breaker state through the shared store
    #[arg(long, global = true)]
    store: Option<bool>,
}

impl OverrideArgs {
    fn to_overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(ref path) = self.catalog {
            overrides = overrides.with_catalog_path(path.clone());
        }
        if let Some(retries) = self.max_retries {
            overrides = overrides.with_max_retries(retries);
        }
        if let Some(threshold) = self.failure_threshold {
            overrides = overrides.with_failure_threshold(threshold);
        }
        if let Some(enabled) = self.store {
            overrides = overrides.with_store_enabled(enabled);
        }
        overrides
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the engine until Ctrl-C
    Serve,

    /// Print the ranked provider attempts for a model
    Plan {
        /// Logical model id
        model: String,

        /// Provider to try first unless its breaker is open
        #[arg(long, value_name = "PROVIDER")]
        prefer: Option<String>,

        /// Require streaming support
        #[arg(long)]
        streaming: bool,

        /// Require function calling support
        #[arg(long)]
        tools: bool,

        /// Require image input support
        #[arg(long)]
        vision: bool,
    },

    /// Print breaker state shared by running instances as JSON
    Breakers,

    /// Print the metrics last exported by `serve` (Prometheus text format)
    Metrics,

    /// Validate configuration and catalog
    Check,
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("gateway_core={level},gateway_daemon={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

/// Load config with CLI overrides applied on top
fn resolve_config(args: &Args) -> Result<GatewayConfig> {
    let path = args.config.clone().or_else(gateway_core::default_config_path);
    let mut config = load_config_from_path(path).context("Failed to load configuration")?;
    args.overrides.to_overrides().apply(&mut config);
    config.validate().context("Invalid configuration after CLI overrides")?;

    info!(
        source = %config.source(),
        file = ?config.config_file_path,
        "Configuration resolved"
    );
    Ok(config)
}

/// Build the engine and register the catalog, if one is configured
fn build_router(config: &GatewayConfig) -> Result<Arc<ProviderRouter>> {
    let router = Arc::new(config.router_builder().build());
    if let Some(ref path) = config.catalog_path {
        let models = load_catalog(path)
            .with_context(|| format!("Failed to load catalog from {}", path.display()))?;
        router.register(models);
    }
    Ok(router)
}

/// Breaker state that running instances published to the shared store
async fn shared_breaker_states(config: &GatewayConfig) -> Result<BTreeMap<String, SharedBreakerState>> {
    let store = FileStateStore::new(config.store_path.clone());
    let states = store
        .fetch_all()
        .await
        .with_context(|| format!("Failed to read shared breaker state from {}", store.dir().display()))?;
    Ok(states.into_iter().collect())
}

fn read_metrics_export(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| {
        format!(
            "No metrics export at {}; is `gateway-daemon serve` running?",
            path.display()
        )
    })
}

fn print_plan(router: &ProviderRouter, request: &PlanRequest) -> Result<()> {
    let plan = router
        .plan(request)
        .with_context(|| format!("Cannot plan model {}", request.model_id))?;

    println!("{:<4} {:<20} {:<40} {}", "RANK", "PROVIDER", "MODEL", "BREAKER");
    for attempt in plan {
        println!(
            "{:<4} {:<20} {:<40} {}",
            attempt.rank, attempt.provider, attempt.provider_model_id, attempt.phase
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config = resolve_config(&args)?;

    match args.command {
        Command::Serve => serve::run(config).await,
        Command::Plan {
            model,
            prefer,
            streaming,
            tools,
            vision,
        } => {
            let router = build_router(&config)?;
            let mut request = PlanRequest::new(model).require(CapabilityRequirements {
                streaming,
                function_calling: tools,
                vision,
            });
            if let Some(provider) = prefer {
                request = request.prefer(provider);
            }
            print_plan(&router, &request)
        }
        Command::Breakers => {
            if !config.store_enabled {
                tracing::warn!("Breaker mirroring is disabled; running instances publish nothing");
            }
            let states = shared_breaker_states(&config).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&states).context("Failed to encode breaker states")?
            );
            Ok(())
        }
        Command::Metrics => {
            print!("{}", read_metrics_export(&config.metrics_export_path)?);
            Ok(())
        }
        Command::Check => {
            let router = build_router(&config)?;
            let snapshot = router.registry().all();
            println!("config:    {}", config.source());
            println!("models:    {}", snapshot.len());
            println!("offerings: {}", snapshot.provider_offerings());
            println!("providers: {}", router.registry().provider_names().join(", "));
            Ok(())
        }
    }
}
