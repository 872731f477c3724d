use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use qna_session::{
    build_state,
    config::Config,
    events::{EventSink, FileEventSink},
    http, store_from_config,
};

#[derive(Parser)]
#[command(name = "qna-session")]
#[command(about = "Question/answer session server", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file (overrides QNA_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Address to listen on (overrides QNA_BIND)
    #[arg(long)]
    bind: Option<SocketAddr>,
    /// Directory holding questions/, answers/ and the state documents
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load_from(cli.config.as_deref()).map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        e
    })?;
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }
    if let Some(dir) = cli.data_dir {
        config.storage.data_dir = dir;
    }

    tracing_subscriber::fmt()
        .with_env_filter(config.runtime.log_level.as_str())
        .with_ansi(false)
        .init();

    if !config.runtime.config_file_found {
        warn!(
            "Config file {} not found, using defaults",
            config.runtime.config_file.display()
        );
    }
    info!(
        "Configuration loaded: data_dir={}, delegate={}",
        config.storage.data_dir.display(),
        config.delegate.program.display()
    );

    let events: Arc<dyn EventSink> =
        Arc::new(FileEventSink::open(config.log_dir(), config.events.debug)?);

    store_from_config(&config).ensure_dirs().await?;

    let state = build_state(&config, events.clone());
    let static_dir = config.server.static_dir.clone();
    let static_dir = static_dir.is_dir().then_some(static_dir);
    let app = http::router(state, static_dir);

    let served = http::start_http_server(config.server.bind, app).await;
    events.close();
    served?;

    Ok(())
}
