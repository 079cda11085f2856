//! Per-conversation warming: factory invocation, readiness polling and
//! autostart.
//!
//! One warmer task owns exactly one conversation id. The conversation
//! factory returns before its runtime is ready, so the warmer bridges that
//! fire-and-forget call to an observable ready signal by polling the host's
//! session registry. Cancellation (pool invalidation, shutdown) aborts the
//! task at the polling sleep; no further status writes happen after that.

use std::sync::Arc;

use anyhow::{Result, bail};
use tokio::time::{Instant, sleep};
use tracing::{error, info};

use crate::autostart;
use crate::host::{ConversationTrigger, NewConversation};
use crate::pool::PoolManager;
use crate::registry::{ConversationStatus, SavedRepo, WarmingStep};

/// Drive one conversation to `ready` or `error`, then deregister its task.
pub(crate) async fn warm_conversation(
    manager: Arc<PoolManager>,
    repo_full_name: String,
    conversation_id: String,
) {
    info!(repo = %repo_full_name, conversation = %conversation_id, "warming conversation");
    match run(&manager, &repo_full_name, &conversation_id).await {
        Ok(()) => {
            info!(repo = %repo_full_name, conversation = %conversation_id, "conversation ready");
        }
        Err(e) => {
            error!(
                repo = %repo_full_name,
                conversation = %conversation_id,
                error = %e,
                "conversation warming failed"
            );
            manager
                .update_status(
                    &repo_full_name,
                    &conversation_id,
                    ConversationStatus::Error,
                    WarmingStep::Error,
                    Some(e.to_string()),
                )
                .await;
        }
    }
    manager.finish_task(&conversation_id).await;
}

async fn run(manager: &PoolManager, repo_full_name: &str, conversation_id: &str) -> Result<()> {
    manager
        .update_status(
            repo_full_name,
            conversation_id,
            ConversationStatus::Warming,
            WarmingStep::Initializing,
            None,
        )
        .await;

    let Some(repo) = manager.get_repo(repo_full_name).await else {
        bail!("repository removed during warming: {}", repo_full_name);
    };

    // Full warming needs the user's git tokens to clone private repos. With
    // no credentials captured yet, allocate metadata only; the runtime cost
    // is paid at claim time instead.
    let Some(credentials) = manager.credentials_for(repo_full_name).await else {
        info!(repo = %repo_full_name, "no credentials captured, metadata-only warming");
        return warm_metadata_only(manager, &repo, conversation_id).await;
    };

    manager
        .update_status(
            repo_full_name,
            conversation_id,
            ConversationStatus::Warming,
            WarmingStep::CloningRepo,
            None,
        )
        .await;

    let request = NewConversation {
        conversation_id: conversation_id.to_string(),
        selected_repository: Some(repo.repo_full_name.clone()),
        selected_branch: Some(repo.branch.clone()),
        initial_user_msg: None,
        user_id: credentials.user_id.clone(),
        provider_tokens: credentials.provider_tokens.clone(),
        trigger: ConversationTrigger::Gui,
    };

    match manager.host().create_conversation(&request).await {
        Ok(()) => {}
        Err(e) if e.is_settings_error() => {
            info!(
                repo = %repo_full_name,
                error = %e,
                "settings unavailable, falling back to metadata-only warming"
            );
            return warm_metadata_only(manager, &repo, conversation_id).await;
        }
        Err(e) => bail!("conversation factory failed: {}", e),
    }

    wait_until_ready(manager, repo_full_name, conversation_id).await?;

    manager
        .update_status(
            repo_full_name,
            conversation_id,
            ConversationStatus::Ready,
            WarmingStep::Ready,
            None,
        )
        .await;
    Ok(())
}

/// Degraded path: allocate the conversation id and metadata without starting
/// a runtime. The entry still ends `ready`.
async fn warm_metadata_only(
    manager: &PoolManager,
    repo: &SavedRepo,
    conversation_id: &str,
) -> Result<()> {
    manager
        .update_status(
            &repo.repo_full_name,
            conversation_id,
            ConversationStatus::Warming,
            WarmingStep::CreatingMetadata,
            None,
        )
        .await;

    let request = NewConversation {
        conversation_id: conversation_id.to_string(),
        selected_repository: Some(repo.repo_full_name.clone()),
        selected_branch: Some(repo.branch.clone()),
        initial_user_msg: None,
        user_id: None,
        provider_tokens: Default::default(),
        trigger: ConversationTrigger::Gui,
    };
    if let Err(e) = manager.host().create_metadata(&request).await {
        bail!("metadata creation failed: {}", e);
    }

    manager
        .update_status(
            &repo.repo_full_name,
            conversation_id,
            ConversationStatus::Ready,
            WarmingStep::Ready,
            None,
        )
        .await;
    Ok(())
}

/// Poll the host until the conversation's session exists, its runtime is
/// initialized and its agent leaves LOADING, advancing the warming step as
/// each gate passes. Autostart runs once the runtime is up, before the agent
/// gate. The polling is purely observational.
async fn wait_until_ready(
    manager: &PoolManager,
    repo_full_name: &str,
    conversation_id: &str,
) -> Result<()> {
    let config = manager.config();
    let deadline = Instant::now() + config.warm_deadline;
    let mut step = WarmingStep::CloningRepo;

    loop {
        if Instant::now() >= deadline {
            bail!(
                "TimeoutError: conversation {} not ready after {}s",
                conversation_id,
                config.warm_deadline.as_secs()
            );
        }
        sleep(config.poll_interval).await;

        let Some(snapshot) = manager.host().session_snapshot(conversation_id).await else {
            continue;
        };
        if step == WarmingStep::CloningRepo {
            step = WarmingStep::BuildingRuntime;
            manager
                .update_status(
                    repo_full_name,
                    conversation_id,
                    ConversationStatus::Warming,
                    step,
                    None,
                )
                .await;
        }

        if !snapshot.runtime_initialized {
            continue;
        }
        if step == WarmingStep::BuildingRuntime {
            step = WarmingStep::StartingAgent;
            manager
                .update_status(
                    repo_full_name,
                    conversation_id,
                    ConversationStatus::Warming,
                    step,
                    None,
                )
                .await;
            // Runtime up and repo cloned: run the repo's startup commands.
            if let Some(runtime) = manager.host().runtime(conversation_id).await {
                autostart::execute_autostart_commands(
                    runtime,
                    conversation_id,
                    Some(repo_full_name),
                )
                .await;
            }
        }

        if snapshot.agent_state.is_loading() {
            continue;
        }
        return Ok(());
    }
}
