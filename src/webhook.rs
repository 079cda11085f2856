//! GitHub webhook ingestion: signature verification and push handling.
//!
//! Push events on a tracked branch invalidate that repo's warm pool, since
//! the warmed clones no longer match upstream. Everything else is
//! acknowledged and ignored.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{info, warn};

use crate::pool::PoolManager;

type HmacSha256 = Hmac<Sha256>;

/// Verify a `X-Hub-Signature-256` header (`sha256=<hex>`) against the raw
/// payload. Comparison is constant-time. An empty secret skips validation
/// with a warning; permitted for local development only.
pub fn verify_signature(payload: &[u8], signature: Option<&str>, secret: &str) -> bool {
    if secret.is_empty() {
        warn!("webhook secret not configured, skipping signature validation");
        return true;
    }
    let Some(signature) = signature else {
        return false;
    };
    let Some(hex_digest) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can use any key length");
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

/// GitHub push payload, reduced to the fields the pool cares about.
#[derive(Debug, Deserialize)]
pub struct PushEvent {
    #[serde(default)]
    pub repository: Option<RepositoryRef>,
    #[serde(rename = "ref", default)]
    pub git_ref: String,
    #[serde(default)]
    pub head_commit: Option<CommitRef>,
    #[serde(default)]
    pub pusher: Option<PusherRef>,
    #[serde(default)]
    pub commits: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct RepositoryRef {
    #[serde(default)]
    pub full_name: String,
}

#[derive(Debug, Deserialize)]
pub struct CommitRef {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct PusherRef {
    #[serde(default)]
    pub name: String,
}

/// GitHub ping payload, sent when a webhook is first configured.
#[derive(Debug, Deserialize)]
pub struct PingEvent {
    #[serde(default)]
    pub zen: String,
    #[serde(default)]
    pub hook_id: Option<serde_json::Value>,
}

/// Extract the branch name from a git ref (`refs/heads/main` -> `main`).
pub fn branch_from_ref(git_ref: &str) -> &str {
    git_ref.strip_prefix("refs/heads/").unwrap_or(git_ref)
}

/// What processing a push event amounted to; surfaced as the response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    MissingRepository,
    Untracked {
        repo_full_name: String,
    },
    BranchIgnored {
        pushed: String,
        tracked: String,
    },
    Invalidated {
        repo_full_name: String,
        branch: String,
        commits: usize,
    },
}

impl PushOutcome {
    pub fn message(&self) -> String {
        match self {
            PushOutcome::MissingRepository => {
                "Push event ignored - missing repository info".to_string()
            }
            PushOutcome::Untracked { repo_full_name } => {
                format!("Repository {} not tracked", repo_full_name)
            }
            PushOutcome::BranchIgnored { pushed, tracked } => {
                format!("Push to branch {} ignored (tracking {})", pushed, tracked)
            }
            PushOutcome::Invalidated { repo_full_name, .. } => {
                format!("Conversation pool invalidated for {}", repo_full_name)
            }
        }
    }
}

/// Handle a verified push event: update the tracked head commit and
/// invalidate the repo's pool when the pushed branch is the tracked one.
pub async fn handle_push_event(manager: &Arc<PoolManager>, event: PushEvent) -> PushOutcome {
    let repo_full_name = event
        .repository
        .as_ref()
        .map(|r| r.full_name.clone())
        .unwrap_or_default();
    if repo_full_name.is_empty() {
        warn!("push event missing repository full_name");
        return PushOutcome::MissingRepository;
    }

    let branch = branch_from_ref(&event.git_ref).to_string();
    let pusher = event
        .pusher
        .map(|p| p.name)
        .unwrap_or_else(|| "unknown".to_string());
    info!(
        repo = %repo_full_name,
        branch = %branch,
        pusher = %pusher,
        commits = event.commits.len(),
        "github push event"
    );

    let Some(repo) = manager.get_repo(&repo_full_name).await else {
        info!(repo = %repo_full_name, "push event for untracked repo");
        return PushOutcome::Untracked { repo_full_name };
    };

    if repo.branch != branch {
        info!(
            pushed = %branch,
            tracked = %repo.branch,
            "push event for different branch"
        );
        return PushOutcome::BranchIgnored {
            pushed: branch,
            tracked: repo.branch,
        };
    }

    if let Some(head_commit) = &event.head_commit {
        manager
            .record_head_commit(&repo_full_name, &head_commit.id)
            .await;
    }

    manager.invalidate_for_repo(&repo_full_name).await;
    info!(repo = %repo_full_name, "invalidated conversation pool after push");

    PushOutcome::Invalidated {
        repo_full_name,
        branch,
        commits: event.commits.len(),
    }
}
