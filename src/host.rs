//! Capabilities the pool consumes from the surrounding agent host.
//!
//! The conversation factory, session registry and sandbox runtime live in the
//! embedding product. The pool only needs the narrow surface below: create a
//! conversation (or just its metadata), observe whether its session is ready,
//! reach its runtime for autostart, and deliver events. Injecting this trait
//! at construction also breaks the import cycle between the pool manager and
//! the factory.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::registry::GitProvider;

/// Lifecycle state reported by an agent controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Loading,
    Init,
    Idle,
    Running,
    AwaitingUserInput,
    Finished,
    Error,
}

impl AgentState {
    pub fn is_loading(self) -> bool {
        self == AgentState::Loading
    }
}

/// Point-in-time view of a live session.
#[derive(Debug, Clone, Copy)]
pub struct SessionSnapshot {
    pub runtime_initialized: bool,
    pub agent_state: AgentState,
}

/// What caused a conversation to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationTrigger {
    Gui,
}

/// Arguments to conversation creation.
#[derive(Debug, Clone)]
pub struct NewConversation {
    pub conversation_id: String,
    pub selected_repository: Option<String>,
    pub selected_branch: Option<String>,
    /// Always `None` for pre-warmed conversations; the first message arrives
    /// at claim time.
    pub initial_user_msg: Option<String>,
    pub user_id: Option<String>,
    pub provider_tokens: HashMap<GitProvider, String>,
    pub trigger: ConversationTrigger,
}

/// Errors surfaced by the host.
#[derive(Debug, Error)]
pub enum HostError {
    /// User settings are missing or unusable (no LLM configured, no API key).
    /// Warming degrades to metadata-only on this kind.
    #[error("settings error: {0}")]
    Settings(String),
    #[error("{0}")]
    Conversation(String),
}

const SETTINGS_MARKERS: [&str; 3] = ["Settings not found", "LLM", "API key"];

impl HostError {
    /// Whether this failure should degrade warming instead of aborting it.
    /// Hosts that only surface message strings are matched by substring
    /// against the known settings-failure markers.
    pub fn is_settings_error(&self) -> bool {
        match self {
            HostError::Settings(_) => true,
            HostError::Conversation(message) => {
                SETTINGS_MARKERS.iter().any(|marker| message.contains(marker))
            }
        }
    }
}

/// A command to run inside the sandbox.
#[derive(Debug, Clone)]
pub struct CmdRequest {
    pub command: String,
    pub timeout: Duration,
    pub blocking: bool,
    /// Hidden commands are kept out of the user-visible event stream.
    pub hidden: bool,
}

impl CmdRequest {
    pub fn blocking_hidden(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
            blocking: true,
            hidden: true,
        }
    }
}

/// Result of a sandbox command.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub exit_code: i32,
    pub content: String,
}

/// Narrow view of a conversation's sandbox runtime.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Workspace mount path inside the sandbox, when one is configured.
    fn workspace_path(&self) -> Option<String>;

    /// Read a file from the sandbox. Hosts may also signal failure in-band
    /// with content starting with `ERROR`.
    async fn read_file(&self, path: &str) -> Result<String, HostError>;

    /// Execute a shell command in the sandbox.
    async fn run(&self, request: CmdRequest) -> Result<CmdOutput, HostError>;
}

/// The conversation host capability injected into the pool manager.
#[async_trait]
pub trait ConversationHost: Send + Sync {
    /// Create conversation metadata only; no runtime is provisioned.
    async fn create_metadata(&self, request: &NewConversation) -> Result<(), HostError>;

    /// Create a conversation and schedule its runtime initialization in the
    /// background. Returns before the runtime is ready.
    async fn create_conversation(&self, request: &NewConversation) -> Result<(), HostError>;

    /// Observe the live session for a conversation, if one exists yet.
    async fn session_snapshot(&self, conversation_id: &str) -> Option<SessionSnapshot>;

    /// The conversation's runtime handle, once it exists.
    async fn runtime(&self, conversation_id: &str) -> Option<Arc<dyn Runtime>>;

    /// Deliver an event to a running conversation.
    async fn send_event(
        &self,
        conversation_id: &str,
        event: serde_json::Value,
    ) -> Result<(), HostError>;
}

/// Conversation metadata tracked by the local host.
#[derive(Debug, Clone)]
pub struct ConversationMetadata {
    pub conversation_id: String,
    pub selected_repository: Option<String>,
    pub selected_branch: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Metadata-only host used by the standalone server binary.
///
/// There is no factory or sandbox behind it, so full warming reports a
/// settings failure and the pool falls back to metadata-only entries. An
/// embedding product replaces this with a real host.
#[derive(Default)]
pub struct LocalConversationHost {
    conversations: Mutex<HashMap<String, ConversationMetadata>>,
}

impl LocalConversationHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn metadata(&self, conversation_id: &str) -> Option<ConversationMetadata> {
        self.conversations.lock().await.get(conversation_id).cloned()
    }
}

#[async_trait]
impl ConversationHost for LocalConversationHost {
    async fn create_metadata(&self, request: &NewConversation) -> Result<(), HostError> {
        let mut conversations = self.conversations.lock().await;
        conversations.insert(
            request.conversation_id.clone(),
            ConversationMetadata {
                conversation_id: request.conversation_id.clone(),
                selected_repository: request.selected_repository.clone(),
                selected_branch: request.selected_branch.clone(),
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn create_conversation(&self, _request: &NewConversation) -> Result<(), HostError> {
        Err(HostError::Settings(
            "Settings not found: no agent host attached".to_string(),
        ))
    }

    async fn session_snapshot(&self, _conversation_id: &str) -> Option<SessionSnapshot> {
        None
    }

    async fn runtime(&self, _conversation_id: &str) -> Option<Arc<dyn Runtime>> {
        None
    }

    async fn send_event(
        &self,
        conversation_id: &str,
        _event: serde_json::Value,
    ) -> Result<(), HostError> {
        let conversations = self.conversations.lock().await;
        if conversations.contains_key(conversation_id) {
            Ok(())
        } else {
            Err(HostError::Conversation(format!(
                "unknown conversation: {}",
                conversation_id
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_error_typed() {
        assert!(HostError::Settings("anything".to_string()).is_settings_error());
    }

    #[test]
    fn test_settings_error_substring_fallback() {
        for message in [
            "Settings not found for user",
            "LLM provider rejected request",
            "API key missing",
        ] {
            assert!(
                HostError::Conversation(message.to_string()).is_settings_error(),
                "expected settings error for {:?}",
                message
            );
        }
        assert!(!HostError::Conversation("runtime crashed".to_string()).is_settings_error());
    }

    #[tokio::test]
    async fn test_local_host_metadata_only() {
        let host = LocalConversationHost::new();
        let request = NewConversation {
            conversation_id: "abc123".to_string(),
            selected_repository: Some("acme/widget".to_string()),
            selected_branch: Some("main".to_string()),
            initial_user_msg: None,
            user_id: None,
            provider_tokens: HashMap::new(),
            trigger: ConversationTrigger::Gui,
        };

        host.create_metadata(&request).await.unwrap();
        let metadata = host.metadata("abc123").await.unwrap();
        assert_eq!(metadata.selected_repository.as_deref(), Some("acme/widget"));

        // Full creation reports a settings failure; warming falls back.
        let err = host.create_conversation(&request).await.unwrap_err();
        assert!(err.is_settings_error());
        assert!(host.session_snapshot("abc123").await.is_none());

        host.send_event("abc123", serde_json::json!({"action": "message"}))
            .await
            .unwrap();
        assert!(host
            .send_event("unknown", serde_json::json!({}))
            .await
            .is_err());
    }
}
