//! Durable registry of saved repositories and their warm pools.
//!
//! The registry persists every `SavedRepo` (including its embedded pool of
//! `PrewarmedConversation` entries) as a single JSON document through the
//! `FileStore` abstraction. It performs no locking of its own; callers
//! serialize writes through the pool manager's lock.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{error, warn};

use crate::store::FileStore;

/// Document path inside the object store.
pub const SAVED_REPOS_PATH: &str = "saved_repos.json";

/// Bounds on the number of active (ready + warming) conversations per repo.
pub const MIN_POOL_SIZE: usize = 1;
pub const MAX_POOL_SIZE: usize = 10;

const DEFAULT_POOL_SIZE: usize = 2;

/// Git hosting provider for a saved repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GitProvider {
    Github,
}

impl Default for GitProvider {
    fn default() -> Self {
        GitProvider::Github
    }
}

impl fmt::Display for GitProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GitProvider::Github => write!(f, "github"),
        }
    }
}

impl FromStr for GitProvider {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "github" => Ok(GitProvider::Github),
            _ => Err(format!("Unknown git provider '{}'. Valid options: github", s)),
        }
    }
}

/// Pool slot status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Warming,
    Ready,
    Error,
}

impl Default for ConversationStatus {
    fn default() -> Self {
        ConversationStatus::Warming
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationStatus::Warming => write!(f, "warming"),
            ConversationStatus::Ready => write!(f, "ready"),
            ConversationStatus::Error => write!(f, "error"),
        }
    }
}

/// Advisory sub-state within `status = warming`, surfaced for UI progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmingStep {
    Queued,
    Initializing,
    CreatingMetadata,
    CloningRepo,
    BuildingRuntime,
    StartingAgent,
    Ready,
    Error,
}

impl Default for WarmingStep {
    fn default() -> Self {
        WarmingStep::Queued
    }
}

impl WarmingStep {
    /// Position in the warming order. `creating_metadata` and `cloning_repo`
    /// are alternatives at the same depth, so they share a rank.
    pub fn rank(self) -> u8 {
        match self {
            WarmingStep::Queued => 0,
            WarmingStep::Initializing => 1,
            WarmingStep::CreatingMetadata | WarmingStep::CloningRepo => 2,
            WarmingStep::BuildingRuntime => 3,
            WarmingStep::StartingAgent => 4,
            WarmingStep::Ready | WarmingStep::Error => 5,
        }
    }
}

impl fmt::Display for WarmingStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WarmingStep::Queued => "queued",
            WarmingStep::Initializing => "initializing",
            WarmingStep::CreatingMetadata => "creating_metadata",
            WarmingStep::CloningRepo => "cloning_repo",
            WarmingStep::BuildingRuntime => "building_runtime",
            WarmingStep::StartingAgent => "starting_agent",
            WarmingStep::Ready => "ready",
            WarmingStep::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// One pool slot: a conversation being warmed or held ready for claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrewarmedConversation {
    pub conversation_id: String,
    #[serde(default)]
    pub status: ConversationStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub warming_step: WarmingStep,
}

impl PrewarmedConversation {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            status: ConversationStatus::Warming,
            created_at: Utc::now(),
            error_message: None,
            warming_step: WarmingStep::Queued,
        }
    }
}

/// A repository saved for quick access, owning a warm conversation pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedRepo {
    /// Canonical "owner/name" identifier; unique key.
    pub repo_full_name: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default)]
    pub git_provider: GitProvider,
    #[serde(default = "Utc::now")]
    pub added_at: DateTime<Utc>,
    /// Last known head of `branch`; updated by webhook.
    #[serde(default)]
    pub last_commit_sha: Option<String>,
    #[serde(default = "default_pool_size", deserialize_with = "clamped_pool_size")]
    pub pool_size: usize,
    #[serde(default, deserialize_with = "lenient_conversations")]
    pub prewarmed_conversations: Vec<PrewarmedConversation>,
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

fn clamped_pool_size<'de, D>(deserializer: D) -> std::result::Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    let value = usize::deserialize(deserializer)?;
    Ok(value.clamp(MIN_POOL_SIZE, MAX_POOL_SIZE))
}

/// Keep well-formed pool entries and skip the rest with a warning; a corrupt
/// slot must never make the whole repo unreadable.
fn lenient_conversations<'de, D>(
    deserializer: D,
) -> std::result::Result<Vec<PrewarmedConversation>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<serde_json::Value> = Vec::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .filter_map(|value| match serde_json::from_value(value) {
            Ok(conv) => Some(conv),
            Err(e) => {
                warn!(error = %e, "failed to parse prewarmed conversation, skipping");
                None
            }
        })
        .collect())
}

impl SavedRepo {
    pub fn new(
        repo_full_name: impl Into<String>,
        branch: impl Into<String>,
        git_provider: GitProvider,
    ) -> Self {
        Self {
            repo_full_name: repo_full_name.into(),
            branch: branch.into(),
            git_provider,
            added_at: Utc::now(),
            last_commit_sha: None,
            pool_size: DEFAULT_POOL_SIZE,
            prewarmed_conversations: Vec::new(),
        }
    }

    /// Set the pool size, clamped to the supported range.
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size.clamp(MIN_POOL_SIZE, MAX_POOL_SIZE);
        self
    }

    pub fn ready_count(&self) -> usize {
        self.prewarmed_conversations
            .iter()
            .filter(|c| c.status == ConversationStatus::Ready)
            .count()
    }

    pub fn warming_count(&self) -> usize {
        self.prewarmed_conversations
            .iter()
            .filter(|c| c.status == ConversationStatus::Warming)
            .count()
    }

    /// Ready + warming slots; `error` entries do not count toward the pool.
    pub fn active_count(&self) -> usize {
        self.ready_count() + self.warming_count()
    }

    pub fn needs_more_conversations(&self) -> bool {
        self.active_count() < self.pool_size
    }

    pub fn find_conversation_mut(
        &mut self,
        conversation_id: &str,
    ) -> Option<&mut PrewarmedConversation> {
        self.prewarmed_conversations
            .iter_mut()
            .find(|c| c.conversation_id == conversation_id)
    }
}

#[derive(Serialize, Deserialize)]
struct SavedReposDocument {
    repositories: Vec<SavedRepo>,
}

/// File-backed registry of saved repositories.
pub struct RepoRegistry {
    store: Arc<dyn FileStore>,
    path: String,
}

impl RepoRegistry {
    pub fn new(store: Arc<dyn FileStore>) -> Self {
        Self {
            store,
            path: SAVED_REPOS_PATH.to_string(),
        }
    }

    /// Load every saved repository. A missing document yields an empty list;
    /// malformed entries are skipped, never fatal.
    pub async fn load_all(&self) -> Vec<SavedRepo> {
        let content = match self.store.read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                error!(error = %e, "failed to read saved repos");
                return Vec::new();
            }
        };

        let document: serde_json::Value = match serde_json::from_str(&content) {
            Ok(value) => value,
            Err(e) => {
                error!(error = %e, "failed to parse saved repos document");
                return Vec::new();
            }
        };

        let Some(entries) = document.get("repositories").and_then(|v| v.as_array()) else {
            warn!("saved repos document has no repositories array");
            return Vec::new();
        };

        entries
            .iter()
            .filter_map(|entry| match serde_json::from_value(entry.clone()) {
                Ok(repo) => Some(repo),
                Err(e) => {
                    warn!(error = %e, "failed to parse saved repo, skipping");
                    None
                }
            })
            .collect()
    }

    /// Rewrite the whole document. Atomicity comes from the store.
    pub async fn save_all(&self, repos: &[SavedRepo]) -> Result<()> {
        let document = SavedReposDocument {
            repositories: repos.to_vec(),
        };
        let json = serde_json::to_string_pretty(&document)?;
        self.store
            .write(&self.path, &json)
            .await
            .context("failed to write saved repos")
    }

    pub async fn get_repo(&self, repo_full_name: &str) -> Option<SavedRepo> {
        self.load_all()
            .await
            .into_iter()
            .find(|r| r.repo_full_name == repo_full_name)
    }

    /// Idempotent upsert. An existing entry keeps its embedded pool and
    /// added_at; branch, provider and pool size are overwritten.
    pub async fn add_repo(&self, repo: SavedRepo) -> Result<()> {
        let mut repos = self.load_all().await;
        if let Some(existing) = repos
            .iter_mut()
            .find(|r| r.repo_full_name == repo.repo_full_name)
        {
            existing.branch = repo.branch;
            existing.git_provider = repo.git_provider;
            existing.pool_size = repo.pool_size.clamp(MIN_POOL_SIZE, MAX_POOL_SIZE);
        } else {
            repos.push(repo);
        }
        self.save_all(&repos).await
    }

    /// Replace-by-key. Returns false when the repo is not present.
    pub async fn update_repo(&self, repo: SavedRepo) -> Result<bool> {
        let mut repos = self.load_all().await;
        let Some(slot) = repos
            .iter_mut()
            .find(|r| r.repo_full_name == repo.repo_full_name)
        else {
            return Ok(false);
        };
        *slot = repo;
        self.save_all(&repos).await?;
        Ok(true)
    }

    pub async fn remove_repo(&self, repo_full_name: &str) -> Result<bool> {
        let mut repos = self.load_all().await;
        let before = repos.len();
        repos.retain(|r| r.repo_full_name != repo_full_name);
        if repos.len() == before {
            return Ok(false);
        }
        self.save_all(&repos).await?;
        Ok(true)
    }
}
