use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use repowarm::config::Config;
use repowarm::host::LocalConversationHost;
use repowarm::http_api::{self, AppState};
use repowarm::pool::PoolManager;
use repowarm::registry::{GitProvider, RepoRegistry, SavedRepo};
use repowarm::store::{FileStore, LocalFileStore};

#[derive(Parser)]
#[command(name = "repowarm")]
#[command(about = "Pre-warmed agent conversation pools for saved repositories")]
#[command(version)]
struct Cli {
    /// Path to repowarm.toml config file
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pool manager and HTTP API server
    Serve {
        /// Bind address (overrides config)
        #[arg(short, long)]
        addr: Option<SocketAddr>,
    },
    /// Show pool status for all saved repositories
    Status,
    /// List saved repositories
    List,
    /// Save a repository and maintain a warm pool for it
    Add {
        /// Repository in owner/name form
        repo: String,
        /// Branch to track
        #[arg(short, long, default_value = "main")]
        branch: String,
        /// Number of conversations to keep warm (1-10)
        #[arg(short, long, default_value_t = 2)]
        pool_size: usize,
    },
    /// Remove a saved repository
    Remove {
        /// Repository in owner/name form
        repo: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("repowarm=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load_or_default(Path::new("repowarm.toml"))?,
    };

    match cli.command {
        Commands::Serve { addr } => serve(&config, addr).await,
        Commands::Status => status(&config).await,
        Commands::List => list(&config).await,
        Commands::Add {
            repo,
            branch,
            pool_size,
        } => add(&config, &repo, &branch, pool_size).await,
        Commands::Remove { repo } => remove(&config, &repo).await,
    }
}

fn registry_for(config: &Config) -> RepoRegistry {
    let store: Arc<dyn FileStore> = Arc::new(LocalFileStore::new(&config.store.root));
    RepoRegistry::new(store)
}

async fn serve(config: &Config, addr_override: Option<SocketAddr>) -> Result<()> {
    let addr: SocketAddr = match addr_override {
        Some(addr) => addr,
        None => config.server.addr.parse()?,
    };

    let store: Arc<dyn FileStore> = Arc::new(LocalFileStore::new(&config.store.root));
    let registry = RepoRegistry::new(Arc::clone(&store));
    let host = Arc::new(LocalConversationHost::new());
    let manager = PoolManager::new(registry, host, config.pool.pool_config());
    manager.initialize().await;

    let state = AppState::new(
        Arc::clone(&manager),
        store,
        config.webhook.resolved_secret(),
    );
    http_api::run_server(addr, state).await
}

async fn status(config: &Config) -> Result<()> {
    let registry = registry_for(config);
    let repos = registry.load_all().await;
    if repos.is_empty() {
        println!("No saved repositories");
        return Ok(());
    }

    for repo in repos {
        println!(
            "{} [{}]: {} ready / {} warming (pool size {})",
            repo.repo_full_name,
            repo.branch,
            repo.ready_count(),
            repo.warming_count(),
            repo.pool_size,
        );
        for conversation in &repo.prewarmed_conversations {
            let detail = conversation.error_message.as_deref().unwrap_or("");
            println!(
                "  {} {} [{}] {}",
                conversation.conversation_id,
                conversation.status,
                conversation.warming_step,
                detail,
            );
        }
    }
    Ok(())
}

async fn list(config: &Config) -> Result<()> {
    let registry = registry_for(config);
    let repos = registry.load_all().await;
    if repos.is_empty() {
        println!("No saved repositories");
        return Ok(());
    }
    for repo in repos {
        println!(
            "{} [{}] pool_size={} last_commit={}",
            repo.repo_full_name,
            repo.branch,
            repo.pool_size,
            repo.last_commit_sha.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

async fn add(config: &Config, repo: &str, branch: &str, pool_size: usize) -> Result<()> {
    if !repo.contains('/') {
        bail!("Repository must be in owner/name form: {}", repo);
    }
    let registry = registry_for(config);
    let saved = SavedRepo::new(repo, branch, GitProvider::Github).with_pool_size(pool_size);
    registry.add_repo(saved).await?;
    println!("Saved {} (branch {}, pool size {})", repo, branch, pool_size);
    println!("Run 'repowarm serve' and POST /repos/{}/prewarm to fill the pool", repo);
    Ok(())
}

async fn remove(config: &Config, repo: &str) -> Result<()> {
    let registry = registry_for(config);
    if registry.remove_repo(repo).await? {
        println!("Removed {}", repo);
    } else {
        println!("Repository not found: {}", repo);
    }
    Ok(())
}
