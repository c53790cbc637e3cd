/// carechat - command-line chat client
///
/// Connects to a chat backend over WebSocket and keeps a local SQLite cache
/// that feeds the conversation list and unread counters.
use anyhow::Context;
use carechat_core::{
    cli, ChatConfig, ChatFacade, ConnectionState, DocumentStore, Identity, SessionIdentity,
    SqliteStore, WebSocketTransport,
};
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "carechat")]
#[command(about = "Caregiver marketplace chat client")]
struct Args {
    /// Server URL (default: http://localhost:4000)
    #[arg(long, default_value = "http://localhost:4000")]
    server: String,

    /// Auth token issued by the marketplace backend
    #[arg(long, env = "CARECHAT_TOKEN")]
    token: String,

    /// Local message cache (default: ~/.carechat/cache.db)
    #[arg(long)]
    cache: Option<PathBuf>,

    /// JSON file with session settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Your user id
    user: String,

    /// Conversation to open on start
    peer: Option<String>,

    /// Enable verbose logging (DEBUG level)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .format_timestamp_millis()
        .init();

    info!("Starting carechat");
    info!("Server: {}", args.server);
    info!("User: {}", args.user);

    let config = match &args.config {
        Some(path) => ChatConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => ChatConfig::default(),
    };

    let cache_path = match args.cache {
        Some(path) => path,
        None => {
            use directories::BaseDirs;
            let base_dirs = BaseDirs::new().context("Failed to get home directory")?;
            base_dirs.home_dir().join(".carechat").join("cache.db")
        }
    };
    info!("Cache: {}", cache_path.display());

    let cache: Arc<dyn DocumentStore> =
        Arc::new(SqliteStore::new(cache_path)?.with_poll_interval(config.poll_interval()));
    let identity = SessionIdentity::signed_in(Identity::new(&args.user, &args.token));
    let transport = Arc::new(WebSocketTransport::new(&args.server));

    let mut builder = ChatFacade::builder(identity, transport)
        .config(config)
        .store(cache.clone());
    if let Some(peer) = &args.peer {
        builder = builder.peer(peer);
    }
    let facade = builder.build()?;

    facade.on_state_change(|state| println!("\r[{}]", state));

    match facade.connect().await? {
        ConnectionState::Connected => {}
        state => anyhow::bail!("could not connect to {} (state: {})", args.server, state),
    }

    cli::run_session(&facade, cache, &args.user, args.peer.clone()).await?;

    facade.shutdown().await;
    Ok(())
}
