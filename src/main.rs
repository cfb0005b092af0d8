use anyhow::Result;
use clap::{Parser, Subcommand};
use hubd::{
    auth::{generate_token, hash_token},
    build_router,
    config::HubConfig,
    storage::Storage,
    AppContext,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "hubd",
    about = "Agent Hub — realtime sync daemon for coding-agent sessions",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// HTTP/WebSocket server port
    #[arg(long, env = "HUBD_PORT")]
    port: Option<u16>,

    /// Bind address for the server
    #[arg(long, env = "HUBD_BIND", default_value = "127.0.0.1")]
    bind: String,

    /// Data directory for the SQLite database and config
    #[arg(long, env = "HUBD_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "HUBD_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "HUBD_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the hub server (default when no subcommand given).
    Serve,
    /// Manage bearer tokens.
    ///
    /// Tokens authenticate to exactly one namespace, as either an
    /// interactive user or a CLI runner. Only a SHA-256 digest is stored;
    /// the raw token is printed once.
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
}

#[derive(Subcommand)]
enum TokenAction {
    /// Mint a token for a namespace and print it.
    Create {
        /// Namespace the token authenticates to
        #[arg(long)]
        namespace: String,
        /// Principal kind: "user" (interactive client) or "runner" (CLI agent driver)
        #[arg(long, default_value = "user")]
        kind: String,
    },
    /// List issued tokens (ids and namespaces; never the tokens themselves).
    List,
    /// Revoke a token by its user id.
    Revoke { id: String },
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = HubConfig::new(args.port, args.data_dir.clone(), args.log.clone());
    let _log_guard = init_logging(&config.log, args.log_file.as_deref());

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        match args.command.unwrap_or(Command::Serve) {
            Command::Serve => serve(config, &args.bind).await,
            Command::Token { action } => token_command(config, action).await,
        }
    })
}

async fn serve(config: HubConfig, bind: &str) -> Result<()> {
    let ctx = AppContext::new(config).await?;

    let recovered = ctx.storage.recover_stale_presence().await?;
    if recovered > 0 {
        info!(recovered, "demoted stale presence rows from a previous run");
    }

    let background = ctx.spawn_background();
    let addr = format!("{}:{}", bind, ctx.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "hub listening");

    axum::serve(listener, build_router(ctx))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for task in background {
        task.abort();
    }
    info!("hub stopped");
    Ok(())
}

async fn token_command(config: HubConfig, action: TokenAction) -> Result<()> {
    let storage = Storage::new(&config.data_dir).await?;
    match action {
        TokenAction::Create { namespace, kind } => {
            if namespace.is_empty() {
                anyhow::bail!("namespace must not be empty");
            }
            if kind != "user" && kind != "runner" {
                anyhow::bail!("kind must be 'user' or 'runner'");
            }
            let token = generate_token();
            let user = storage
                .create_user(&namespace, &hash_token(&token), &kind)
                .await?;
            println!("id:        {}", user.id);
            println!("namespace: {}", user.namespace);
            println!("kind:      {}", user.kind);
            println!("token:     {token}");
            println!();
            println!("Store the token now; it cannot be shown again.");
        }
        TokenAction::List => {
            for user in storage.list_users().await? {
                let created = chrono::DateTime::from_timestamp_millis(user.created_at)
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default();
                println!("{}  {}  {}  {}", user.id, user.namespace, user.kind, created);
            }
        }
        TokenAction::Revoke { id } => {
            if storage.delete_user(&id).await? {
                println!("revoked {id}");
            } else {
                warn!(id = %id, "no such token");
            }
        }
    }
    Ok(())
}

/// Resolves when a shutdown signal is received.
///
/// On Unix we listen for SIGTERM *and* Ctrl-C; elsewhere Ctrl-C only.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

/// Set up tracing with an env filter and an optional daily-rotated log file.
/// The returned guard must be held for the process lifetime.
fn init_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    if let Some(path) = log_file {
        let (dir, filename) = match (path.parent(), path.file_name()) {
            (Some(dir), Some(name)) if !dir.as_os_str().is_empty() => (dir.to_path_buf(), name.to_owned()),
            _ => (std::path::PathBuf::from("."), path.as_os_str().to_owned()),
        };
        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(log_level))
            .with(tracing_subscriber::fmt::layer().compact())
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(log_level)
            .compact()
            .init();
        None
    }
}
