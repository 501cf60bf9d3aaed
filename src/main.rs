mod auth;
mod config;
mod git;
mod health;
mod http;
mod identity;
mod metrics;
mod records;
mod sync;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use ed25519_dalek::SigningKey;
use tokio::signal;
use tokio_util::task::TaskTracker;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::auth::{CollaboratorAuthorizer, DidSignatureVerifier, PushAuthenticator, PushAuthorizer};
use crate::config::{AuthorizationMode, Config};
use crate::git::RepoPathResolver;
use crate::http::hooks::{PushHook, Restorer};
use crate::identity::HttpIdentityResolver;
use crate::metrics::MetricsRegistry;
use crate::records::{RecordStore, S3RecordStore};
use crate::sync::{BundleRecoveryHook, BundleRestorer, BundleSyncer, RefSyncer, SyncPushHook};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "sovgit", version, about = "Git smart HTTP server with signed pushes")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server.
    Serve(ServeArgs),
    /// Create an empty bare repository for an owner.
    Init(InitArgs),
    /// Mint a signed push credential for use as a Basic Auth password.
    Token(TokenArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/sovgit/config.yaml")]
    config: PathBuf,

    /// Override `server.listen`.
    #[arg(long, env = "SOVGIT_LISTEN")]
    listen: Option<SocketAddr>,

    /// Override `storage.repos_path`.
    #[arg(long, env = "SOVGIT_REPOS_PATH")]
    repos_path: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct InitArgs {
    #[arg(short, long, default_value = "/etc/sovgit/config.yaml")]
    config: PathBuf,

    #[arg(long)]
    owner: String,

    #[arg(long)]
    repo: String,
}

#[derive(Args, Debug)]
struct TokenArgs {
    /// File holding the hex-encoded 32-byte Ed25519 seed of the pusher.
    #[arg(long)]
    key_file: PathBuf,

    /// Identity the key belongs to.
    #[arg(long)]
    pusher: String,

    /// Identity owning the target repository.
    #[arg(long)]
    owner: String,

    /// Target repository name.
    #[arg(long)]
    repo: String,

    #[arg(long, default_value_t = auth::token::DEFAULT_TTL_SECS)]
    ttl_secs: i64,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared by every request handler.
pub struct AppState {
    pub config: Arc<Config>,
    pub resolver: RepoPathResolver,
    pub authenticator: Arc<PushAuthenticator>,
    pub restorer: Arc<dyn Restorer>,
    pub push_hook: Arc<dyn PushHook>,
    pub metrics: MetricsRegistry,
    /// Post-push work that outlives its request.
    pub tasks: TaskTracker,
}

// ---------------------------------------------------------------------------
// S3 client setup
// ---------------------------------------------------------------------------

async fn build_s3_client(config: &Config) -> aws_sdk_s3::Client {
    let s3 = &config.records.s3;
    let mut loader = aws_config::from_env();
    if let Some(region) = &s3.region {
        loader = loader.region(aws_config::Region::new(region.clone()));
    }
    if let Some(endpoint) = &s3.endpoint_url {
        loader = loader.endpoint_url(endpoint.clone());
    }
    if s3.use_fips {
        loader = loader.use_fips(true);
    }
    let aws_config = loader.load().await;

    // S3-compatible stores generally only speak path-style addressing.
    let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
        .force_path_style(s3.endpoint_url.is_some())
        .build();

    tracing::info!(
        bucket = %s3.bucket,
        prefix = %s3.prefix,
        endpoint = s3.endpoint_url.as_deref().unwrap_or("aws"),
        fips = s3.use_fips,
        "S3 client initialised"
    );
    aws_sdk_s3::Client::from_conf(s3_config)
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

async fn build_state(config: Arc<Config>) -> Result<AppState> {
    let timeout = config.git.command_timeout();
    let metrics = MetricsRegistry::new();

    let s3 = build_s3_client(&config).await;
    let store: Arc<dyn RecordStore> = Arc::new(S3RecordStore::new(
        s3,
        config.records.s3.bucket.clone(),
        config.records.s3.prefix.clone(),
    ));

    let identities = Arc::new(HttpIdentityResolver::new(&config.identity)?);
    let verifier = Arc::new(DidSignatureVerifier::new(identities));
    let authorizer: Option<Arc<dyn PushAuthorizer>> = match config.auth.authorization {
        AuthorizationMode::Open => None,
        AuthorizationMode::Collaborators => {
            Some(Arc::new(CollaboratorAuthorizer::new(Arc::clone(&store))))
        }
    };
    let authenticator = PushAuthenticator::new(&config.auth, verifier, authorizer);

    let restorer = BundleRecoveryHook::new(
        BundleRestorer::new(Arc::clone(&store), timeout),
        Arc::clone(&metrics.metrics),
    );
    let push_hook = SyncPushHook::new(
        RefSyncer::new(Arc::clone(&store), Arc::clone(&metrics.metrics), timeout),
        BundleSyncer::new(
            Arc::clone(&store),
            Arc::clone(&metrics.metrics),
            config.bundles.full_every,
            timeout,
        ),
    );

    Ok(AppState {
        resolver: RepoPathResolver::new(&config.storage.repos_path),
        authenticator: Arc::new(authenticator),
        restorer: Arc::new(restorer),
        push_hook: Arc::new(push_hook),
        metrics,
        tasks: TaskTracker::new(),
        config,
    })
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn serve(args: ServeArgs) -> Result<()> {
    let mut config = config::load_config(&args.config)?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if let Some(repos_path) = args.repos_path {
        config.storage.repos_path = repos_path;
    }
    config::validate_config(&config)?;
    let config = Arc::new(config);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = %args.config.display(), "starting sovgit");

    tokio::fs::create_dir_all(&config.storage.repos_path)
        .await
        .with_context(|| {
            format!(
                "failed to create repository directory: {}",
                config.storage.repos_path.display()
            )
        })?;

    let state = Arc::new(build_state(Arc::clone(&config)).await?);
    let tasks = state.tasks.clone();
    let app = http::handler::create_router(state);

    let listener = tokio::net::TcpListener::bind(config.server.listen)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {}", config.server.listen))?;

    tracing::info!(
        listen = %config.server.listen,
        prefix = %config.server.path_prefix,
        "HTTP server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    tracing::info!(pending = tasks.len(), "waiting for post-push work");
    tasks.close();
    tasks.wait().await;

    tracing::info!("sovgit shut down cleanly");
    Ok(())
}

async fn init_repo(args: InitArgs) -> Result<()> {
    let config = config::load_config(&args.config)?;
    let path = RepoPathResolver::new(&config.storage.repos_path)
        .resolve(&args.owner, &args.repo)
        .context("invalid repository address")?;
    git::init_bare_repo(&path, config.git.command_timeout()).await?;
    println!("{}", path.display());
    Ok(())
}

fn mint_token(args: TokenArgs) -> Result<()> {
    let seed_hex = std::fs::read_to_string(&args.key_file)
        .with_context(|| format!("failed to read key file: {}", args.key_file.display()))?;
    let seed: [u8; 32] = hex::decode(seed_hex.trim())
        .context("key file is not hex")?
        .try_into()
        .map_err(|_| anyhow::anyhow!("key file must hold a 32-byte seed"))?;
    let key = SigningKey::from_bytes(&seed);

    anyhow::ensure!(args.ttl_secs > 0, "--ttl-secs must be positive");
    let payload = auth::token::build_payload(&args.pusher, &args.owner, &args.repo, args.ttl_secs);
    let credential = auth::token::sign_credential(&key, &payload);

    println!("{}:{credential}", auth::token::SENTINEL_USER);
    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    match Cli::parse().command {
        Command::Serve(args) => serve(args).await,
        Command::Init(args) => init_repo(args).await,
        Command::Token(args) => mint_token(args),
    }
}
