//! Per-repository idea storage and the claim-and-build trigger.
//!
//! Ideas are short prompts a user collects against a saved repo. Building an
//! idea claims a pre-warmed conversation from the pool and sends the idea
//! text as its first user message.

use std::sync::Arc;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::pool::PoolManager;
use crate::store::FileStore;

/// Encode a repo name for use in file paths (`owner/name` -> `owner__name`).
pub fn encode_repo_name(repo_full_name: &str) -> String {
    repo_full_name.replace('/', "__")
}

/// Building lifecycle of an idea.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Queued,
    Running,
    Review,
    Error,
}

/// An idea or issue associated with a repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoIdea {
    pub id: String,
    pub repo_full_name: String,
    pub user_id: String,
    pub text: String,
    /// Position in the list, for reordering.
    pub order: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub building_conversation_id: Option<String>,
    #[serde(default)]
    pub building_status: Option<BuildStatus>,
    #[serde(default)]
    pub building_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub building_error_message: Option<String>,
}

/// Per-user idea storage: one JSON document per repo at
/// `ideas/<user_id>/<encoded repo>.json`.
pub struct IdeasStore {
    store: Arc<dyn FileStore>,
    user_id: String,
}

impl IdeasStore {
    pub fn new(store: Arc<dyn FileStore>, user_id: impl Into<String>) -> Self {
        Self {
            store,
            user_id: user_id.into(),
        }
    }

    fn ideas_path(&self, repo_full_name: &str) -> String {
        format!(
            "ideas/{}/{}.json",
            self.user_id,
            encode_repo_name(repo_full_name)
        )
    }

    /// Load all ideas for a repository, sorted by order. Missing or corrupt
    /// documents yield an empty list.
    pub async fn load_ideas(&self, repo_full_name: &str) -> Vec<RepoIdea> {
        let path = self.ideas_path(repo_full_name);
        let content = match self.store.read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                error!(path = %path, error = %e, "failed to read ideas");
                return Vec::new();
            }
        };
        let mut ideas: Vec<RepoIdea> = match serde_json::from_str(&content) {
            Ok(ideas) => ideas,
            Err(e) => {
                error!(path = %path, error = %e, "failed to parse ideas file");
                return Vec::new();
            }
        };
        ideas.sort_by_key(|idea| idea.order);
        ideas
    }

    async fn save(&self, repo_full_name: &str, ideas: &[RepoIdea]) -> Result<()> {
        let json = serde_json::to_string_pretty(ideas)?;
        self.store
            .write(&self.ideas_path(repo_full_name), &json)
            .await?;
        Ok(())
    }

    pub async fn get_idea(&self, repo_full_name: &str, idea_id: &str) -> Option<RepoIdea> {
        self.load_ideas(repo_full_name)
            .await
            .into_iter()
            .find(|idea| idea.id == idea_id)
    }

    /// Create a new idea at the end of the list.
    pub async fn create_idea(&self, repo_full_name: &str, text: impl Into<String>) -> Result<RepoIdea> {
        let mut ideas = self.load_ideas(repo_full_name).await;
        let order = ideas.iter().map(|i| i.order).max().map_or(0, |max| max + 1);
        let now = Utc::now();
        let idea = RepoIdea {
            id: Uuid::new_v4().simple().to_string(),
            repo_full_name: repo_full_name.to_string(),
            user_id: self.user_id.clone(),
            text: text.into(),
            order,
            created_at: now,
            updated_at: now,
            building_conversation_id: None,
            building_status: None,
            building_started_at: None,
            building_error_message: None,
        };
        ideas.push(idea.clone());
        self.save(repo_full_name, &ideas).await?;
        info!(idea = %idea.id, repo = %repo_full_name, "created idea");
        Ok(idea)
    }

    pub async fn update_idea(&self, mut idea: RepoIdea) -> Result<RepoIdea> {
        let mut ideas = self.load_ideas(&idea.repo_full_name).await;
        let Some(slot) = ideas.iter_mut().find(|i| i.id == idea.id) else {
            bail!("idea {} not found", idea.id);
        };
        idea.updated_at = Utc::now();
        *slot = idea.clone();
        self.save(&idea.repo_full_name, &ideas).await?;
        Ok(idea)
    }

    pub async fn delete_idea(&self, repo_full_name: &str, idea_id: &str) -> Result<bool> {
        let mut ideas = self.load_ideas(repo_full_name).await;
        let before = ideas.len();
        ideas.retain(|i| i.id != idea_id);
        if ideas.len() == before {
            return Ok(false);
        }
        self.save(repo_full_name, &ideas).await?;
        Ok(true)
    }

    /// Reorder ideas to match the given id sequence; ids not listed keep
    /// their relative order at the end.
    pub async fn reorder_ideas(
        &self,
        repo_full_name: &str,
        idea_ids: &[String],
    ) -> Result<Vec<RepoIdea>> {
        let ideas = self.load_ideas(repo_full_name).await;
        let mut reordered: Vec<RepoIdea> = Vec::with_capacity(ideas.len());

        for idea_id in idea_ids {
            if let Some(mut idea) = ideas.iter().find(|i| &i.id == idea_id).cloned() {
                idea.order = reordered.len() as i64;
                idea.updated_at = Utc::now();
                reordered.push(idea);
            }
        }
        for idea in ideas {
            if !idea_ids.contains(&idea.id) {
                let mut idea = idea;
                idea.order = reordered.len() as i64;
                reordered.push(idea);
            }
        }

        self.save(repo_full_name, &reordered).await?;
        Ok(reordered)
    }

    /// Mark an idea as building with the given conversation.
    pub async fn start_building(
        &self,
        repo_full_name: &str,
        idea_id: &str,
        conversation_id: &str,
        status: BuildStatus,
    ) -> Result<RepoIdea> {
        let Some(mut idea) = self.get_idea(repo_full_name, idea_id).await else {
            bail!("idea {} not found", idea_id);
        };
        idea.building_conversation_id = Some(conversation_id.to_string());
        idea.building_status = Some(status);
        idea.building_started_at = Some(Utc::now());
        idea.building_error_message = None;
        self.update_idea(idea).await
    }

    pub async fn update_building_status(
        &self,
        repo_full_name: &str,
        idea_id: &str,
        status: BuildStatus,
        error_message: Option<String>,
    ) -> Result<RepoIdea> {
        let Some(mut idea) = self.get_idea(repo_full_name, idea_id).await else {
            bail!("idea {} not found", idea_id);
        };
        idea.building_status = Some(status);
        if error_message.is_some() {
            idea.building_error_message = error_message;
        }
        self.update_idea(idea).await
    }
}

/// Result of a build trigger.
#[derive(Debug, Clone, Serialize)]
pub struct BuildOutcome {
    pub idea_id: String,
    pub conversation_id: Option<String>,
    pub status: BuildStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Claim a pooled conversation for an idea and send its text as the first
/// user message. With no ready conversation the idea is queued instead.
pub async fn build_idea(
    manager: &Arc<PoolManager>,
    ideas: &IdeasStore,
    idea: RepoIdea,
) -> BuildOutcome {
    let repo_full_name = idea.repo_full_name.clone();

    let Some(conversation_id) = manager.claim_conversation(&repo_full_name).await else {
        warn!(repo = %repo_full_name, idea = %idea.id, "no ready conversations, queuing idea");
        if let Err(e) = ideas
            .start_building(&repo_full_name, &idea.id, "", BuildStatus::Queued)
            .await
        {
            error!(idea = %idea.id, error = %e, "failed to queue idea");
        }
        return BuildOutcome {
            idea_id: idea.id,
            conversation_id: None,
            status: BuildStatus::Queued,
            message: Some(
                "No agents available. Your request has been queued and will start when an agent is ready."
                    .to_string(),
            ),
        };
    };

    if let Err(e) = ideas
        .start_building(&repo_full_name, &idea.id, &conversation_id, BuildStatus::Running)
        .await
    {
        error!(idea = %idea.id, error = %e, "failed to record building state");
    }

    let event = serde_json::json!({
        "action": "message",
        "args": { "content": idea.text },
    });
    if let Err(e) = manager.host().send_event(&conversation_id, event).await {
        error!(
            idea = %idea.id,
            conversation = %conversation_id,
            error = %e,
            "failed to send first message"
        );
        let _ = ideas
            .update_building_status(
                &repo_full_name,
                &idea.id,
                BuildStatus::Error,
                Some(format!("Failed to send message: {}", e)),
            )
            .await;
        return BuildOutcome {
            idea_id: idea.id,
            conversation_id: Some(conversation_id.clone()),
            status: BuildStatus::Error,
            message: Some(format!("Failed to send message to agent: {}", e)),
        };
    }

    info!(idea = %idea.id, conversation = %conversation_id, "started building idea");
    BuildOutcome {
        idea_id: idea.id,
        conversation_id: Some(conversation_id),
        status: BuildStatus::Running,
        message: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryFileStore;

    fn test_store() -> IdeasStore {
        IdeasStore::new(Arc::new(MemoryFileStore::new()), "alice")
    }

    #[test]
    fn test_encode_repo_name() {
        assert_eq!(encode_repo_name("acme/widget"), "acme__widget");
    }

    #[tokio::test]
    async fn test_create_assigns_increasing_order() {
        let store = test_store();
        let first = store.create_idea("acme/widget", "add dark mode").await.unwrap();
        let second = store.create_idea("acme/widget", "fix login").await.unwrap();
        assert_eq!(first.order, 0);
        assert_eq!(second.order, 1);
        assert_eq!(first.user_id, "alice");

        let loaded = store.load_ideas("acme/widget").await;
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, first.id);
    }

    #[tokio::test]
    async fn test_reorder_ideas() {
        let store = test_store();
        let a = store.create_idea("acme/widget", "a").await.unwrap();
        let b = store.create_idea("acme/widget", "b").await.unwrap();
        let c = store.create_idea("acme/widget", "c").await.unwrap();

        let reordered = store
            .reorder_ideas("acme/widget", &[c.id.clone(), a.id.clone()])
            .await
            .unwrap();
        let ids: Vec<&str> = reordered.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec![c.id.as_str(), a.id.as_str(), b.id.as_str()]);
        assert_eq!(reordered[0].order, 0);
        assert_eq!(reordered[2].order, 2);
    }

    #[tokio::test]
    async fn test_delete_idea() {
        let store = test_store();
        let idea = store.create_idea("acme/widget", "a").await.unwrap();
        assert!(store.delete_idea("acme/widget", &idea.id).await.unwrap());
        assert!(!store.delete_idea("acme/widget", &idea.id).await.unwrap());
        assert!(store.load_ideas("acme/widget").await.is_empty());
    }

    #[tokio::test]
    async fn test_building_transitions() {
        let store = test_store();
        let idea = store.create_idea("acme/widget", "a").await.unwrap();

        let building = store
            .start_building("acme/widget", &idea.id, "conv123", BuildStatus::Running)
            .await
            .unwrap();
        assert_eq!(building.building_conversation_id.as_deref(), Some("conv123"));
        assert_eq!(building.building_status, Some(BuildStatus::Running));
        assert!(building.building_started_at.is_some());

        let errored = store
            .update_building_status(
                "acme/widget",
                &idea.id,
                BuildStatus::Error,
                Some("boom".to_string()),
            )
            .await
            .unwrap();
        assert_eq!(errored.building_status, Some(BuildStatus::Error));
        assert_eq!(errored.building_error_message.as_deref(), Some("boom"));
    }
}
