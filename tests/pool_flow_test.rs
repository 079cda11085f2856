//! End-to-end pool lifecycle tests.
//!
//! The conversation host is faked so warming, claiming and invalidation can
//! be driven deterministically: sessions appear after the factory call and
//! progress to ready over a few polls, or get stuck, or never appear,
//! depending on the scripted behavior.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::sleep;

use repowarm::host::{
    AgentState, CmdOutput, CmdRequest, ConversationHost, HostError, NewConversation, Runtime,
    SessionSnapshot,
};
use repowarm::ideas::{self, BuildStatus, IdeasStore};
use repowarm::pool::{PoolConfig, PoolManager, RepoCredentials};
use repowarm::registry::{
    ConversationStatus, GitProvider, RepoRegistry, SavedRepo, WarmingStep,
};
use repowarm::store::{FileStore, MemoryFileStore};
use repowarm::webhook::{self, CommitRef, PushEvent, PushOutcome, PusherRef, RepositoryRef};

const REPO: &str = "acme/widget";

#[derive(Clone, Copy, PartialEq, Eq)]
enum FactoryBehavior {
    /// Sessions appear and become ready within a few polls.
    Ready,
    /// Sessions appear but the runtime never initializes.
    StuckLoading,
    /// The factory call succeeds but no session ever appears.
    NoSession,
    /// The factory reports a settings failure.
    SettingsError,
    /// The factory fails outright.
    Broken,
}

struct FakeRuntime {
    manifest: Option<String>,
    commands: Mutex<Vec<CmdRequest>>,
}

#[async_trait]
impl Runtime for FakeRuntime {
    fn workspace_path(&self) -> Option<String> {
        Some("/workspace".to_string())
    }

    async fn read_file(&self, path: &str) -> Result<String, HostError> {
        match &self.manifest {
            Some(manifest) if path == "/workspace/widget/.openhands/autostart.yaml" => {
                Ok(manifest.clone())
            }
            _ => Err(HostError::Conversation(format!("ERROR: no such file {}", path))),
        }
    }

    async fn run(&self, request: CmdRequest) -> Result<CmdOutput, HostError> {
        let content = if request.command.contains("echo CONDITION_MET") {
            "CONDITION_MET".to_string()
        } else {
            String::new()
        };
        self.commands.lock().await.push(request);
        Ok(CmdOutput {
            exit_code: 0,
            content,
        })
    }
}

struct FakeHost {
    behavior: FactoryBehavior,
    manifest: Option<String>,
    /// Poll counters per session, keyed by conversation id.
    sessions: Mutex<HashMap<String, u32>>,
    runtimes: Mutex<HashMap<String, Arc<FakeRuntime>>>,
    metadata_created: Mutex<Vec<String>>,
    factory_calls: AtomicU32,
    sent_events: Mutex<Vec<(String, serde_json::Value)>>,
}

impl FakeHost {
    fn build(behavior: FactoryBehavior, manifest: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            manifest,
            sessions: Mutex::new(HashMap::new()),
            runtimes: Mutex::new(HashMap::new()),
            metadata_created: Mutex::new(Vec::new()),
            factory_calls: AtomicU32::new(0),
            sent_events: Mutex::new(Vec::new()),
        })
    }

    fn new(behavior: FactoryBehavior) -> Arc<Self> {
        Self::build(behavior, None)
    }

    fn with_manifest(behavior: FactoryBehavior, manifest: &str) -> Arc<Self> {
        Self::build(behavior, Some(manifest.to_string()))
    }
}

#[async_trait]
impl ConversationHost for FakeHost {
    async fn create_metadata(&self, request: &NewConversation) -> Result<(), HostError> {
        self.metadata_created
            .lock()
            .await
            .push(request.conversation_id.clone());
        Ok(())
    }

    async fn create_conversation(&self, request: &NewConversation) -> Result<(), HostError> {
        self.factory_calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            FactoryBehavior::SettingsError => Err(HostError::Conversation(
                "Settings not found for user".to_string(),
            )),
            FactoryBehavior::Broken => {
                Err(HostError::Conversation("runtime exploded".to_string()))
            }
            FactoryBehavior::NoSession => Ok(()),
            FactoryBehavior::Ready | FactoryBehavior::StuckLoading => {
                self.sessions
                    .lock()
                    .await
                    .insert(request.conversation_id.clone(), 0);
                self.runtimes.lock().await.insert(
                    request.conversation_id.clone(),
                    Arc::new(FakeRuntime {
                        manifest: self.manifest.clone(),
                        commands: Mutex::new(Vec::new()),
                    }),
                );
                Ok(())
            }
        }
    }

    async fn session_snapshot(&self, conversation_id: &str) -> Option<SessionSnapshot> {
        let mut sessions = self.sessions.lock().await;
        let polls = sessions.get_mut(conversation_id)?;
        *polls += 1;
        if self.behavior == FactoryBehavior::StuckLoading {
            return Some(SessionSnapshot {
                runtime_initialized: false,
                agent_state: AgentState::Loading,
            });
        }
        Some(SessionSnapshot {
            runtime_initialized: *polls >= 2,
            agent_state: if *polls >= 3 {
                AgentState::Idle
            } else {
                AgentState::Loading
            },
        })
    }

    async fn runtime(&self, conversation_id: &str) -> Option<Arc<dyn Runtime>> {
        let runtimes = self.runtimes.lock().await;
        runtimes
            .get(conversation_id)
            .map(|runtime| Arc::clone(runtime) as Arc<dyn Runtime>)
    }

    async fn send_event(
        &self,
        conversation_id: &str,
        event: serde_json::Value,
    ) -> Result<(), HostError> {
        self.sent_events
            .lock()
            .await
            .push((conversation_id.to_string(), event));
        Ok(())
    }
}

struct TestCtx {
    manager: Arc<PoolManager>,
    store: Arc<dyn FileStore>,
}

fn fast_config() -> PoolConfig {
    PoolConfig {
        poll_interval: Duration::from_millis(10),
        warm_deadline: Duration::from_secs(5),
    }
}

async fn setup_with(host: Arc<FakeHost>, pool_size: usize, config: PoolConfig) -> TestCtx {
    let store: Arc<dyn FileStore> = Arc::new(MemoryFileStore::new());
    let registry = RepoRegistry::new(Arc::clone(&store));
    let manager = PoolManager::new(registry, host, config);
    manager.initialize().await;
    manager
        .add_repo(SavedRepo::new(REPO, "main", GitProvider::Github).with_pool_size(pool_size))
        .await
        .unwrap();
    TestCtx { manager, store }
}

async fn setup(host: Arc<FakeHost>, pool_size: usize) -> TestCtx {
    setup_with(host, pool_size, fast_config()).await
}

fn credentials() -> RepoCredentials {
    RepoCredentials {
        user_id: Some("alice".to_string()),
        provider_tokens: HashMap::from([(GitProvider::Github, "ghp_testtoken".to_string())]),
    }
}

async fn wait_until<F>(manager: &Arc<PoolManager>, mut pred: F) -> bool
where
    F: FnMut(&SavedRepo) -> bool,
{
    for _ in 0..500 {
        if let Some(repo) = manager.get_repo(REPO).await
            && pred(&repo)
        {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn wait_for_tasks_drained(manager: &Arc<PoolManager>) -> bool {
    for _ in 0..500 {
        if manager.task_count().await == 0 {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

fn push_event(git_ref: &str, head: &str) -> PushEvent {
    PushEvent {
        repository: Some(RepositoryRef {
            full_name: REPO.to_string(),
        }),
        git_ref: git_ref.to_string(),
        head_commit: Some(CommitRef {
            id: head.to_string(),
        }),
        pusher: Some(PusherRef {
            name: "alice".to_string(),
        }),
        commits: vec![serde_json::json!({"id": head})],
    }
}

// === Warming ===

#[tokio::test]
async fn test_full_warming_fills_pool() {
    let host = FakeHost::new(FactoryBehavior::Ready);
    let ctx = setup(Arc::clone(&host), 2).await;
    ctx.manager
        .prewarm_for_repo(REPO, Some(credentials()))
        .await;

    assert!(wait_until(&ctx.manager, |r| r.ready_count() == 2).await);

    let repo = ctx.manager.get_repo(REPO).await.unwrap();
    assert_eq!(repo.prewarmed_conversations.len(), 2);
    for conversation in &repo.prewarmed_conversations {
        assert_eq!(conversation.status, ConversationStatus::Ready);
        assert_eq!(conversation.warming_step, WarmingStep::Ready);
        assert!(conversation.error_message.is_none());
    }

    let ids: HashSet<&str> = repo
        .prewarmed_conversations
        .iter()
        .map(|c| c.conversation_id.as_str())
        .collect();
    assert_eq!(ids.len(), 2);

    // The on-disk registry reflects the terminal state.
    let persisted = RepoRegistry::new(Arc::clone(&ctx.store))
        .get_repo(REPO)
        .await
        .unwrap();
    assert_eq!(persisted, repo);

    assert!(wait_for_tasks_drained(&ctx.manager).await);
    assert_eq!(host.factory_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_autostart_runs_during_warming() {
    let manifest = "autostart:\n  enabled: true\n  commands:\n    - name: deps\n      command: npm ci\n";
    let host = FakeHost::with_manifest(FactoryBehavior::Ready, manifest);
    let ctx = setup(Arc::clone(&host), 1).await;
    ctx.manager
        .prewarm_for_repo(REPO, Some(credentials()))
        .await;

    assert!(wait_until(&ctx.manager, |r| r.ready_count() == 1).await);

    let runtimes = host.runtimes.lock().await;
    let runtime = runtimes.values().next().unwrap();
    let commands = runtime.commands.lock().await;
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].command, "npm ci");
    assert!(commands[0].blocking);
    assert!(commands[0].hidden);
}

#[tokio::test]
async fn test_missing_credentials_degrade_to_metadata_only() {
    let host = FakeHost::new(FactoryBehavior::Ready);
    let ctx = setup(Arc::clone(&host), 1).await;
    ctx.manager.prewarm_for_repo(REPO, None).await;

    assert!(wait_until(&ctx.manager, |r| r.ready_count() == 1).await);

    // The factory was never invoked; only metadata was allocated.
    assert_eq!(host.factory_calls.load(Ordering::SeqCst), 0);
    assert_eq!(host.metadata_created.lock().await.len(), 1);

    let repo = ctx.manager.get_repo(REPO).await.unwrap();
    assert_eq!(
        repo.prewarmed_conversations[0].warming_step,
        WarmingStep::Ready
    );
}

#[tokio::test]
async fn test_settings_error_falls_back_to_metadata_only() {
    let host = FakeHost::new(FactoryBehavior::SettingsError);
    let ctx = setup(Arc::clone(&host), 1).await;
    ctx.manager
        .prewarm_for_repo(REPO, Some(credentials()))
        .await;

    assert!(wait_until(&ctx.manager, |r| r.ready_count() == 1).await);
    assert_eq!(host.factory_calls.load(Ordering::SeqCst), 1);
    assert_eq!(host.metadata_created.lock().await.len(), 1);
}

#[tokio::test]
async fn test_factory_failure_marks_entry_error() {
    let host = FakeHost::new(FactoryBehavior::Broken);
    let ctx = setup(Arc::clone(&host), 1).await;
    ctx.manager
        .prewarm_for_repo(REPO, Some(credentials()))
        .await;

    assert!(
        wait_until(&ctx.manager, |r| {
            r.prewarmed_conversations
                .iter()
                .any(|c| c.status == ConversationStatus::Error)
        })
        .await
    );

    let repo = ctx.manager.get_repo(REPO).await.unwrap();
    let conversation = &repo.prewarmed_conversations[0];
    assert_eq!(conversation.warming_step, WarmingStep::Error);
    assert!(
        conversation
            .error_message
            .as_deref()
            .unwrap()
            .contains("runtime exploded")
    );
    // Error entries stay for observability but no longer count as active.
    assert_eq!(repo.active_count(), 0);
    assert!(wait_for_tasks_drained(&ctx.manager).await);
}

#[tokio::test]
async fn test_readiness_timeout_marks_entry_error() {
    let host = FakeHost::new(FactoryBehavior::NoSession);
    let config = PoolConfig {
        poll_interval: Duration::from_millis(10),
        warm_deadline: Duration::from_millis(80),
    };
    let ctx = setup_with(host, 1, config).await;
    ctx.manager
        .prewarm_for_repo(REPO, Some(credentials()))
        .await;

    assert!(
        wait_until(&ctx.manager, |r| {
            r.prewarmed_conversations
                .iter()
                .any(|c| c.status == ConversationStatus::Error)
        })
        .await
    );

    let repo = ctx.manager.get_repo(REPO).await.unwrap();
    let message = repo.prewarmed_conversations[0]
        .error_message
        .as_deref()
        .unwrap();
    assert!(message.starts_with("TimeoutError"), "got: {}", message);
}

#[tokio::test]
async fn test_concurrent_prewarms_converge_on_pool_size() {
    let host = FakeHost::new(FactoryBehavior::Ready);
    let ctx = setup(host, 3).await;
    ctx.manager.set_credentials_for_repo(REPO, credentials()).await;

    let first = Arc::clone(&ctx.manager);
    let second = Arc::clone(&ctx.manager);
    tokio::join!(
        async move { first.prewarm_for_repo(REPO, None).await },
        async move { second.prewarm_for_repo(REPO, None).await },
    );

    assert!(wait_until(&ctx.manager, |r| r.ready_count() == 3).await);
    let repo = ctx.manager.get_repo(REPO).await.unwrap();
    assert_eq!(repo.prewarmed_conversations.len(), 3);
}

// === Claim ===

#[tokio::test]
async fn test_claim_returns_oldest_ready_and_refills() {
    let host = FakeHost::new(FactoryBehavior::Ready);
    let ctx = setup(host, 2).await;
    ctx.manager
        .prewarm_for_repo(REPO, Some(credentials()))
        .await;
    assert!(wait_until(&ctx.manager, |r| r.ready_count() == 2).await);

    let before = ctx.manager.get_repo(REPO).await.unwrap();
    let oldest = before.prewarmed_conversations[0].conversation_id.clone();

    let claimed = ctx.manager.claim_conversation(REPO).await.unwrap();
    assert_eq!(claimed, oldest);

    let after = ctx.manager.get_repo(REPO).await.unwrap();
    assert!(
        after
            .prewarmed_conversations
            .iter()
            .all(|c| c.conversation_id != claimed)
    );

    // A replacement fills the freed slot.
    assert!(
        wait_until(&ctx.manager, |r| {
            r.ready_count() == 2 && r.prewarmed_conversations.len() == 2
        })
        .await
    );
}

#[tokio::test]
async fn test_claim_with_no_ready_entry_returns_none() {
    let host = FakeHost::new(FactoryBehavior::Ready);
    let ctx = setup(host, 2).await;

    assert!(ctx.manager.claim_conversation(REPO).await.is_none());
    assert!(ctx.manager.claim_conversation("acme/unknown").await.is_none());
}

// === Invalidation ===

#[tokio::test]
async fn test_push_invalidates_and_refills() {
    let host = FakeHost::new(FactoryBehavior::Ready);
    let ctx = setup(host, 2).await;
    ctx.manager
        .prewarm_for_repo(REPO, Some(credentials()))
        .await;
    assert!(wait_until(&ctx.manager, |r| r.ready_count() == 2).await);

    let before: HashSet<String> = ctx
        .manager
        .get_repo(REPO)
        .await
        .unwrap()
        .prewarmed_conversations
        .iter()
        .map(|c| c.conversation_id.clone())
        .collect();

    let outcome =
        webhook::handle_push_event(&ctx.manager, push_event("refs/heads/main", "abc123")).await;
    assert!(matches!(outcome, PushOutcome::Invalidated { .. }));

    assert!(
        wait_until(&ctx.manager, |r| {
            r.ready_count() == 2
                && r.prewarmed_conversations
                    .iter()
                    .all(|c| !before.contains(&c.conversation_id))
        })
        .await
    );

    let repo = ctx.manager.get_repo(REPO).await.unwrap();
    assert_eq!(repo.last_commit_sha.as_deref(), Some("abc123"));
}

#[tokio::test]
async fn test_push_to_untracked_branch_ignored() {
    let host = FakeHost::new(FactoryBehavior::Ready);
    let ctx = setup(host, 2).await;
    ctx.manager
        .prewarm_for_repo(REPO, Some(credentials()))
        .await;
    assert!(wait_until(&ctx.manager, |r| r.ready_count() == 2).await);
    let before = ctx.manager.get_repo(REPO).await.unwrap();

    let outcome =
        webhook::handle_push_event(&ctx.manager, push_event("refs/heads/feature/x", "abc123"))
            .await;
    assert_eq!(
        outcome,
        PushOutcome::BranchIgnored {
            pushed: "feature/x".to_string(),
            tracked: "main".to_string(),
        }
    );
    assert!(outcome.message().contains("ignored"));

    let after = ctx.manager.get_repo(REPO).await.unwrap();
    assert_eq!(
        after.prewarmed_conversations,
        before.prewarmed_conversations
    );
    assert!(after.last_commit_sha.is_none());
}

#[tokio::test]
async fn test_push_for_untracked_repo_ignored() {
    let host = FakeHost::new(FactoryBehavior::Ready);
    let ctx = setup(host, 1).await;

    let mut event = push_event("refs/heads/main", "abc123");
    event.repository = Some(RepositoryRef {
        full_name: "other/repo".to_string(),
    });
    let outcome = webhook::handle_push_event(&ctx.manager, event).await;
    assert_eq!(
        outcome,
        PushOutcome::Untracked {
            repo_full_name: "other/repo".to_string(),
        }
    );
}

#[tokio::test]
async fn test_invalidation_cancels_warmers_without_error_entries() {
    let host = FakeHost::new(FactoryBehavior::StuckLoading);
    let config = PoolConfig {
        poll_interval: Duration::from_millis(10),
        warm_deadline: Duration::from_secs(60),
    };
    let ctx = setup_with(host, 2, config).await;
    ctx.manager
        .prewarm_for_repo(REPO, Some(credentials()))
        .await;
    assert!(wait_until(&ctx.manager, |r| r.warming_count() == 2).await);

    let before: HashSet<String> = ctx
        .manager
        .get_repo(REPO)
        .await
        .unwrap()
        .prewarmed_conversations
        .iter()
        .map(|c| c.conversation_id.clone())
        .collect();

    ctx.manager.invalidate_for_repo(REPO).await;
    sleep(Duration::from_millis(100)).await;

    // Cancelled warmers leave nothing behind; the pool holds only the
    // replacement entries.
    let repo = ctx.manager.get_repo(REPO).await.unwrap();
    assert_eq!(repo.prewarmed_conversations.len(), 2);
    for conversation in &repo.prewarmed_conversations {
        assert_eq!(conversation.status, ConversationStatus::Warming);
        assert!(!before.contains(&conversation.conversation_id));
    }
}

#[tokio::test]
async fn test_shutdown_cancels_all_warmers() {
    let host = FakeHost::new(FactoryBehavior::StuckLoading);
    let config = PoolConfig {
        poll_interval: Duration::from_millis(10),
        warm_deadline: Duration::from_secs(60),
    };
    let ctx = setup_with(host, 2, config).await;
    ctx.manager
        .prewarm_for_repo(REPO, Some(credentials()))
        .await;
    assert!(wait_until(&ctx.manager, |r| r.warming_count() == 2).await);

    ctx.manager.shutdown().await;
    assert_eq!(ctx.manager.task_count().await, 0);
    // Idempotent.
    ctx.manager.shutdown().await;
}

// === Pool status ===

#[tokio::test]
async fn test_pool_status_projection() {
    let host = FakeHost::new(FactoryBehavior::Ready);
    let ctx = setup(host, 2).await;
    ctx.manager
        .prewarm_for_repo(REPO, Some(credentials()))
        .await;
    assert!(wait_until(&ctx.manager, |r| r.ready_count() == 2).await);

    let status = ctx.manager.get_pool_status().await;
    assert!(status.initialized);
    assert_eq!(status.repos.len(), 1);
    let repo_status = &status.repos[0];
    assert_eq!(repo_status.repo_full_name, REPO);
    assert_eq!(repo_status.pool_size, 2);
    assert_eq!(repo_status.ready_count, 2);
    assert_eq!(repo_status.warming_count, 0);
    assert_eq!(repo_status.conversations.len(), 2);
}

// === Ideas build trigger ===

#[tokio::test]
async fn test_build_idea_claims_and_sends_first_message() {
    let host = FakeHost::new(FactoryBehavior::Ready);
    let ctx = setup(Arc::clone(&host), 1).await;
    ctx.manager
        .prewarm_for_repo(REPO, Some(credentials()))
        .await;
    assert!(wait_until(&ctx.manager, |r| r.ready_count() == 1).await);

    let ideas = IdeasStore::new(Arc::clone(&ctx.store), "alice");
    let idea = ideas.create_idea(REPO, "add dark mode").await.unwrap();

    let outcome = ideas::build_idea(&ctx.manager, &ideas, idea.clone()).await;
    assert_eq!(outcome.status, BuildStatus::Running);
    let conversation_id = outcome.conversation_id.unwrap();

    let events = host.sent_events.lock().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, conversation_id);
    assert_eq!(events[0].1["args"]["content"], "add dark mode");

    let stored = ideas.get_idea(REPO, &idea.id).await.unwrap();
    assert_eq!(stored.building_status, Some(BuildStatus::Running));
    assert_eq!(
        stored.building_conversation_id.as_deref(),
        Some(conversation_id.as_str())
    );
}

#[tokio::test]
async fn test_build_idea_queues_when_pool_empty() {
    let host = FakeHost::new(FactoryBehavior::Ready);
    let ctx = setup(Arc::clone(&host), 1).await;

    let ideas = IdeasStore::new(Arc::clone(&ctx.store), "alice");
    let idea = ideas.create_idea(REPO, "fix login").await.unwrap();

    let outcome = ideas::build_idea(&ctx.manager, &ideas, idea.clone()).await;
    assert_eq!(outcome.status, BuildStatus::Queued);
    assert!(outcome.conversation_id.is_none());
    assert!(host.sent_events.lock().await.is_empty());

    let stored = ideas.get_idea(REPO, &idea.id).await.unwrap();
    assert_eq!(stored.building_status, Some(BuildStatus::Queued));
}
