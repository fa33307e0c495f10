use anthropic_facade::config::config_search_paths;
use anthropic_facade::{build_router, AppState, ProxyConfig, SharedJournal};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "anthropic-facade",
    about = "Serve the Anthropic Messages API on top of a LiteLLM routing service",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long, env = "ANTHROPIC_FACADE_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long, env = "ANTHROPIC_FACADE_PORT")]
    port: Option<u16>,

    /// Base URL of the routing service (overrides config)
    #[arg(long, env = "LITELLM_BASE_URL")]
    upstream_url: Option<String>,

    /// Log level: trace, debug, info, warn, error (overrides config; RUST_LOG wins)
    #[arg(long)]
    log_level: Option<String>,

    /// Diagnostics journal file (JSONL)
    #[arg(long, default_value = "anthropic-facade.log")]
    journal_file: PathBuf,

    /// Print config search paths and exit
    #[arg(long)]
    show_config_paths: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.show_config_paths {
        println!("Config search paths:");
        for (i, path) in config_search_paths().iter().enumerate() {
            println!("  {}. {}", i + 1, path.display());
        }
        return Ok(());
    }

    let (mut config, config_source) = ProxyConfig::find_and_load(cli.config.as_deref())?;

    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(url) = cli.upstream_url {
        config.upstream.base_url = url;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    config.validate()?;

    let default_filter = format!(
        "anthropic_facade={level},tower_http={level}",
        level = config.log_level
    );
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let journal = SharedJournal::open(&cli.journal_file)?;

    info!("anthropic-facade v{}", env!("CARGO_PKG_VERSION"));
    match config_source {
        Some(ref path) => info!("  Config:    {}", path.display()),
        None => info!("  Config:    none found, using defaults"),
    }
    info!("  Upstream:  {}", config.chat_completions_url());
    info!(
        "  API key:   {}",
        if config.resolve_api_key().is_some() {
            format!("from ${}", config.upstream.api_key_env)
        } else {
            "none".to_string()
        }
    );
    info!("  Timeout:   {}s", config.upstream.timeout_secs);
    info!("  Models:    {} aliased", config.models.len());
    info!("  Journal:   {} ({} entries)", cli.journal_file.display(), journal.len());

    let client = reqwest::Client::builder()
        .timeout(config.upstream_timeout())
        .build()?;

    let port = config.port;
    let state = Arc::new(AppState {
        config,
        client,
        journal,
    });

    let app = build_router(state);
    let bind_addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Listening on http://{}", bind_addr);
    info!("  ANTHROPIC_BASE_URL=http://localhost:{}", port);

    axum::serve(listener, app).await?;

    Ok(())
}
