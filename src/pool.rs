//! Warm pool coordination for saved repositories.
//!
//! The pool manager keeps each saved repository stocked with pre-warmed
//! conversations, hands out ready entries on claim, and tears pools down when
//! upstream code changes. One mutex serializes registry transactions, the
//! warmer task index and the credential map; it is never held across a
//! warmer's execution or readiness polling.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::host::ConversationHost;
use crate::registry::{
    ConversationStatus, GitProvider, PrewarmedConversation, RepoRegistry, SavedRepo, WarmingStep,
};
use crate::warmer;

/// Tuning knobs for warming tasks.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Interval between readiness polls.
    pub poll_interval: Duration,
    /// Total budget for one conversation to reach ready.
    pub warm_deadline: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            warm_deadline: Duration::from_secs(600),
        }
    }
}

/// Provider credentials captured the first time a client drives a prewarm
/// for a repo. In-memory only; never persisted.
#[derive(Debug, Clone, Default)]
pub struct RepoCredentials {
    pub user_id: Option<String>,
    pub provider_tokens: HashMap<GitProvider, String>,
}

#[derive(Default)]
struct PoolState {
    /// In-flight warmers keyed by conversation id.
    tasks: HashMap<String, JoinHandle<()>>,
    /// Credentials keyed by repo_full_name.
    credentials: HashMap<String, RepoCredentials>,
    initialized: bool,
}

/// Read-only projection of all pools for observability.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub initialized: bool,
    pub repos: Vec<RepoPoolStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepoPoolStatus {
    pub repo_full_name: String,
    pub branch: String,
    pub pool_size: usize,
    pub ready_count: usize,
    pub warming_count: usize,
    pub conversations: Vec<ConversationView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationView {
    pub conversation_id: String,
    pub status: ConversationStatus,
    pub warming_step: WarmingStep,
    pub created_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

/// Coordination surface for all warm pools. Process-lifecycle-scoped with
/// explicit `initialize`/`shutdown`; construct once and share via `Arc`.
pub struct PoolManager {
    registry: RepoRegistry,
    host: Arc<dyn ConversationHost>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    /// Self-reference for handing warmers and refill tasks an owned handle.
    weak_self: Weak<PoolManager>,
}

impl PoolManager {
    pub fn new(
        registry: RepoRegistry,
        host: Arc<dyn ConversationHost>,
        config: PoolConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            registry,
            host,
            config,
            state: Mutex::new(PoolState::default()),
            weak_self: weak_self.clone(),
        })
    }

    pub(crate) fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// The injected conversation host, for collaborators that need to reach
    /// a claimed conversation (e.g. to send its first message).
    pub fn host(&self) -> Arc<dyn ConversationHost> {
        Arc::clone(&self.host)
    }

    /// Bind to the registry. Idempotent; does not eagerly prewarm since no
    /// credentials are known yet.
    pub async fn initialize(&self) {
        let mut state = self.state.lock().await;
        if state.initialized {
            return;
        }
        let repos = self.registry.load_all().await;
        info!(repos = repos.len(), "pool manager initialized");
        state.initialized = true;
    }

    /// Capture credentials for a repo, overwriting any prior binding.
    pub async fn set_credentials_for_repo(&self, repo_full_name: &str, credentials: RepoCredentials) {
        let mut state = self.state.lock().await;
        state
            .credentials
            .insert(repo_full_name.to_string(), credentials);
    }

    pub(crate) async fn credentials_for(&self, repo_full_name: &str) -> Option<RepoCredentials> {
        let state = self.state.lock().await;
        state.credentials.get(repo_full_name).cloned()
    }

    /// Start filling the pool for a repo, optionally capturing credentials
    /// first.
    pub async fn prewarm_for_repo(
        &self,
        repo_full_name: &str,
        credentials: Option<RepoCredentials>,
    ) {
        if let Some(credentials) = credentials {
            self.set_credentials_for_repo(repo_full_name, credentials).await;
        }
        info!(repo = %repo_full_name, "pre-warming conversations");
        self.ensure_pool_filled(repo_full_name).await;
    }

    /// Top the pool up to `pool_size` active conversations, spawning a
    /// warmer per new entry. The repo is re-read on every iteration so
    /// concurrent calls converge on the target without overshooting.
    async fn ensure_pool_filled(&self, repo_full_name: &str) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        let mut state = self.state.lock().await;
        loop {
            let Some(mut repo) = self.registry.get_repo(repo_full_name).await else {
                warn!(repo = %repo_full_name, "repository not found");
                return;
            };
            if !repo.needs_more_conversations() {
                return;
            }

            let conversation_id = Uuid::new_v4().simple().to_string();
            repo.prewarmed_conversations
                .push(PrewarmedConversation::new(&conversation_id));
            if let Err(e) = self.registry.update_repo(repo).await {
                warn!(repo = %repo_full_name, error = %e, "failed to persist new pool entry");
                return;
            }

            let manager = Arc::clone(&this);
            let repo_name = repo_full_name.to_string();
            let conv_id = conversation_id.clone();
            let handle = tokio::spawn(async move {
                warmer::warm_conversation(manager, repo_name, conv_id).await;
            });
            state.tasks.insert(conversation_id, handle);
        }
    }

    /// Atomically remove the oldest ready conversation and schedule a refill
    /// on a detached task. Returns `None` without blocking when no entry is
    /// ready.
    pub async fn claim_conversation(&self, repo_full_name: &str) -> Option<String> {
        let conversation_id = {
            let _state = self.state.lock().await;
            let Some(mut repo) = self.registry.get_repo(repo_full_name).await else {
                warn!(repo = %repo_full_name, "cannot claim: repository not found");
                return None;
            };

            let Some(index) = repo
                .prewarmed_conversations
                .iter()
                .position(|c| c.status == ConversationStatus::Ready)
            else {
                warn!(repo = %repo_full_name, "no ready conversations");
                return None;
            };

            let claimed = repo.prewarmed_conversations.remove(index);
            if let Err(e) = self.registry.update_repo(repo).await {
                warn!(repo = %repo_full_name, error = %e, "failed to persist claim");
            }
            info!(
                repo = %repo_full_name,
                conversation = %claimed.conversation_id,
                "claimed conversation"
            );
            claimed.conversation_id
        };

        // Refill outside the lock so the spawned task can acquire it.
        if let Some(manager) = self.weak_self.upgrade() {
            let repo_name = repo_full_name.to_string();
            tokio::spawn(async move {
                manager.ensure_pool_filled(&repo_name).await;
            });
        }

        Some(conversation_id)
    }

    /// Cancel every warmer for a repo, drop its pool, then start fresh.
    /// Called when upstream code changes invalidate the warmed clones.
    pub async fn invalidate_for_repo(&self, repo_full_name: &str) {
        info!(repo = %repo_full_name, "invalidating pre-warmed conversations");
        {
            let mut state = self.state.lock().await;
            let Some(mut repo) = self.registry.get_repo(repo_full_name).await else {
                warn!(repo = %repo_full_name, "cannot invalidate: repository not found");
                return;
            };

            for conversation in &repo.prewarmed_conversations {
                if let Some(task) = state.tasks.remove(&conversation.conversation_id) {
                    task.abort();
                }
            }

            repo.prewarmed_conversations.clear();
            if let Err(e) = self.registry.update_repo(repo).await {
                warn!(repo = %repo_full_name, error = %e, "failed to persist invalidation");
            }
        }

        self.prewarm_for_repo(repo_full_name, None).await;
    }

    /// Record the new head commit observed by the webhook.
    pub async fn record_head_commit(&self, repo_full_name: &str, commit_sha: &str) {
        let _state = self.state.lock().await;
        let Some(mut repo) = self.registry.get_repo(repo_full_name).await else {
            return;
        };
        repo.last_commit_sha = Some(commit_sha.to_string());
        if let Err(e) = self.registry.update_repo(repo).await {
            warn!(repo = %repo_full_name, error = %e, "failed to persist head commit");
        }
    }

    /// Update one pool entry's status. Serialized under the manager lock;
    /// warmers call this on every step transition.
    pub(crate) async fn update_status(
        &self,
        repo_full_name: &str,
        conversation_id: &str,
        status: ConversationStatus,
        warming_step: WarmingStep,
        error_message: Option<String>,
    ) {
        let _state = self.state.lock().await;
        let Some(mut repo) = self.registry.get_repo(repo_full_name).await else {
            return;
        };
        let Some(conversation) = repo.find_conversation_mut(conversation_id) else {
            return;
        };
        conversation.status = status;
        conversation.warming_step = warming_step;
        conversation.error_message = error_message;
        if let Err(e) = self.registry.update_repo(repo).await {
            warn!(
                repo = %repo_full_name,
                conversation = %conversation_id,
                error = %e,
                "failed to persist status update"
            );
        }
    }

    /// Drop a finished warmer from the task index.
    pub(crate) async fn finish_task(&self, conversation_id: &str) {
        let mut state = self.state.lock().await;
        state.tasks.remove(conversation_id);
    }

    /// Number of in-flight warmer tasks, for diagnostics.
    pub async fn task_count(&self) -> usize {
        self.state.lock().await.tasks.len()
    }

    /// Read-only projection of every pool.
    pub async fn get_pool_status(&self) -> PoolStatus {
        let state = self.state.lock().await;
        let repos = self.registry.load_all().await;
        PoolStatus {
            initialized: state.initialized,
            repos: repos
                .into_iter()
                .map(|repo| RepoPoolStatus {
                    ready_count: repo.ready_count(),
                    warming_count: repo.warming_count(),
                    repo_full_name: repo.repo_full_name,
                    branch: repo.branch,
                    pool_size: repo.pool_size,
                    conversations: repo
                        .prewarmed_conversations
                        .into_iter()
                        .map(|c| ConversationView {
                            conversation_id: c.conversation_id,
                            status: c.status,
                            warming_step: c.warming_step,
                            created_at: c.created_at,
                            error_message: c.error_message,
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    pub async fn list_repos(&self) -> Vec<SavedRepo> {
        let _state = self.state.lock().await;
        self.registry.load_all().await
    }

    pub async fn get_repo(&self, repo_full_name: &str) -> Option<SavedRepo> {
        let _state = self.state.lock().await;
        self.registry.get_repo(repo_full_name).await
    }

    /// Upsert a saved repo (pool preserved on update).
    pub async fn add_repo(&self, repo: SavedRepo) -> anyhow::Result<()> {
        let _state = self.state.lock().await;
        self.registry.add_repo(repo).await
    }

    /// Remove a saved repo, cancelling any of its in-flight warmers first.
    pub async fn remove_repo(&self, repo_full_name: &str) -> anyhow::Result<bool> {
        let mut state = self.state.lock().await;
        if let Some(repo) = self.registry.get_repo(repo_full_name).await {
            for conversation in &repo.prewarmed_conversations {
                if let Some(task) = state.tasks.remove(&conversation.conversation_id) {
                    task.abort();
                }
            }
        }
        self.registry.remove_repo(repo_full_name).await
    }

    /// Cancel all warmers and drop in-memory state. Idempotent.
    pub async fn shutdown(&self) {
        info!("shutting down pool manager");
        let mut state = self.state.lock().await;
        for (_, task) in state.tasks.drain() {
            task.abort();
        }
        state.credentials.clear();
        state.initialized = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.warm_deadline, Duration::from_secs(600));
    }

    #[test]
    fn test_conversation_ids_are_32_hex() {
        let id = Uuid::new_v4().simple().to_string();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
