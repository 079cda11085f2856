//! HTTP API server for repowarm.
//!
//! Thin plumbing over the pool manager: repo management, pool status, claim,
//! idea CRUD and the GitHub webhook receiver.

use anyhow::Result;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::ideas::{self, IdeasStore};
use crate::pool::{PoolManager, RepoCredentials};
use crate::registry::{GitProvider, SavedRepo};
use crate::store::FileStore;
use crate::webhook::{self, PingEvent, PushEvent};

type BoxBody = http_body_util::combinators::BoxBody<bytes::Bytes, hyper::Error>;

fn full<T: Into<bytes::Bytes>>(chunk: T) -> BoxBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

const DEFAULT_USER: &str = "local";

/// Request to save a repository.
#[derive(Debug, Deserialize)]
struct AddRepoRequest {
    repo_full_name: String,
    branch: Option<String>,
    git_provider: Option<GitProvider>,
    pool_size: Option<usize>,
}

/// Request to prewarm, optionally capturing credentials.
#[derive(Debug, Default, Deserialize)]
struct PrewarmRequest {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    provider_tokens: Option<HashMap<GitProvider, String>>,
}

#[derive(Debug, Deserialize)]
struct CreateIdeaRequest {
    text: String,
    user_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BuildIdeaRequest {
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ClaimResponse {
    conversation_id: Option<String>,
}

/// API response
#[derive(Debug, Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn error(msg: impl Into<String>) -> ApiResponse<()> {
        ApiResponse {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Shared state for the HTTP server
pub struct AppState {
    manager: Arc<PoolManager>,
    store: Arc<dyn FileStore>,
    webhook_secret: String,
}

impl AppState {
    pub fn new(manager: Arc<PoolManager>, store: Arc<dyn FileStore>, webhook_secret: String) -> Self {
        Self {
            manager,
            store,
            webhook_secret,
        }
    }

    fn ideas_store(&self, user_id: &str) -> IdeasStore {
        IdeasStore::new(Arc::clone(&self.store), user_id)
    }
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(|q| q.to_string());

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let response = match (method, segments.as_slice()) {
        (Method::GET, ["health"]) => json_response(StatusCode::OK, &ApiResponse::success("ok")),

        (Method::GET, ["pool", "status"]) => {
            let status = state.manager.get_pool_status().await;
            json_response(StatusCode::OK, &ApiResponse::success(status))
        }

        (Method::GET, ["repos"]) => {
            let repos = state.manager.list_repos().await;
            json_response(StatusCode::OK, &ApiResponse::success(repos))
        }

        (Method::POST, ["repos"]) => handle_add_repo(req, state).await,

        (Method::DELETE, ["repos", owner, name]) => {
            handle_remove_repo(&format!("{}/{}", owner, name), state).await
        }

        (Method::POST, ["repos", owner, name, "prewarm"]) => {
            handle_prewarm(req, &format!("{}/{}", owner, name), state).await
        }

        (Method::POST, ["repos", owner, name, "claim"]) => {
            let repo = format!("{}/{}", owner, name);
            let conversation_id = state.manager.claim_conversation(&repo).await;
            json_response(
                StatusCode::OK,
                &ApiResponse::success(ClaimResponse { conversation_id }),
            )
        }

        (Method::GET, ["repos", owner, name, "ideas"]) => {
            let user = query_param(query.as_deref(), "user_id")
                .unwrap_or_else(|| DEFAULT_USER.to_string());
            let ideas = state
                .ideas_store(&user)
                .load_ideas(&format!("{}/{}", owner, name))
                .await;
            json_response(StatusCode::OK, &ApiResponse::success(ideas))
        }

        (Method::POST, ["repos", owner, name, "ideas"]) => {
            handle_create_idea(req, &format!("{}/{}", owner, name), state).await
        }

        (Method::POST, ["repos", owner, name, "ideas", idea_id, "build"]) => {
            handle_build_idea(req, &format!("{}/{}", owner, name), idea_id, state).await
        }

        (Method::POST, ["webhooks", "github"]) => handle_github_webhook(req, state).await,

        _ => json_response(
            StatusCode::NOT_FOUND,
            &ApiResponse::<()>::error("Not found"),
        ),
    };

    Ok(response)
}

fn json_response<T: Serialize>(status: StatusCode, data: &T) -> Response<BoxBody> {
    let body = serde_json::to_string(data).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(full(body))
        .unwrap()
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

async fn read_json_body<T: for<'de> Deserialize<'de>>(
    req: Request<Incoming>,
) -> Result<T, Response<BoxBody>> {
    let body_bytes = req
        .collect()
        .await
        .map_err(|_| {
            json_response(
                StatusCode::BAD_REQUEST,
                &ApiResponse::<()>::error("Failed to read body"),
            )
        })?
        .to_bytes();

    serde_json::from_slice(&body_bytes).map_err(|e| {
        json_response(
            StatusCode::BAD_REQUEST,
            &ApiResponse::<()>::error(format!("Invalid JSON: {}", e)),
        )
    })
}

async fn handle_add_repo(req: Request<Incoming>, state: Arc<AppState>) -> Response<BoxBody> {
    let body: AddRepoRequest = match read_json_body(req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };

    if !body.repo_full_name.contains('/') {
        return json_response(
            StatusCode::BAD_REQUEST,
            &ApiResponse::<()>::error("repo_full_name must be in owner/name form"),
        );
    }

    let mut repo = SavedRepo::new(
        body.repo_full_name.clone(),
        body.branch.unwrap_or_else(|| "main".to_string()),
        body.git_provider.unwrap_or_default(),
    );
    if let Some(pool_size) = body.pool_size {
        repo = repo.with_pool_size(pool_size);
    }

    if let Err(e) = state.manager.add_repo(repo.clone()).await {
        return json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &ApiResponse::<()>::error(e.to_string()),
        );
    }

    // Fill the pool in the background; metadata-only until credentials arrive.
    let manager = Arc::clone(&state.manager);
    let repo_full_name = body.repo_full_name;
    tokio::spawn(async move {
        manager.prewarm_for_repo(&repo_full_name, None).await;
    });

    json_response(StatusCode::CREATED, &ApiResponse::success(repo))
}

async fn handle_remove_repo(repo_full_name: &str, state: Arc<AppState>) -> Response<BoxBody> {
    match state.manager.remove_repo(repo_full_name).await {
        Ok(true) => json_response(StatusCode::OK, &ApiResponse::success("Repository removed")),
        Ok(false) => json_response(
            StatusCode::NOT_FOUND,
            &ApiResponse::<()>::error("Repository not found"),
        ),
        Err(e) => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &ApiResponse::<()>::error(e.to_string()),
        ),
    }
}

async fn handle_prewarm(
    req: Request<Incoming>,
    repo_full_name: &str,
    state: Arc<AppState>,
) -> Response<BoxBody> {
    let body: PrewarmRequest = match read_json_body(req).await {
        Ok(b) => b,
        Err(_) => PrewarmRequest::default(),
    };

    if state.manager.get_repo(repo_full_name).await.is_none() {
        return json_response(
            StatusCode::NOT_FOUND,
            &ApiResponse::<()>::error("Repository not found"),
        );
    }

    let credentials = body.provider_tokens.map(|provider_tokens| RepoCredentials {
        user_id: body.user_id,
        provider_tokens,
    });
    state
        .manager
        .prewarm_for_repo(repo_full_name, credentials)
        .await;

    json_response(StatusCode::OK, &ApiResponse::success("Prewarm started"))
}

async fn handle_create_idea(
    req: Request<Incoming>,
    repo_full_name: &str,
    state: Arc<AppState>,
) -> Response<BoxBody> {
    let body: CreateIdeaRequest = match read_json_body(req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };

    if body.text.is_empty() {
        return json_response(
            StatusCode::BAD_REQUEST,
            &ApiResponse::<()>::error("text is required"),
        );
    }

    let user = body.user_id.unwrap_or_else(|| DEFAULT_USER.to_string());
    match state
        .ideas_store(&user)
        .create_idea(repo_full_name, body.text)
        .await
    {
        Ok(idea) => json_response(StatusCode::CREATED, &ApiResponse::success(idea)),
        Err(e) => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &ApiResponse::<()>::error(e.to_string()),
        ),
    }
}

async fn handle_build_idea(
    req: Request<Incoming>,
    repo_full_name: &str,
    idea_id: &str,
    state: Arc<AppState>,
) -> Response<BoxBody> {
    let body: BuildIdeaRequest = match read_json_body(req).await {
        Ok(b) => b,
        Err(_) => BuildIdeaRequest::default(),
    };

    if state.manager.get_repo(repo_full_name).await.is_none() {
        return json_response(
            StatusCode::NOT_FOUND,
            &ApiResponse::<()>::error("Repository not found"),
        );
    }

    let user = body.user_id.unwrap_or_else(|| DEFAULT_USER.to_string());
    let ideas_store = state.ideas_store(&user);
    let Some(idea) = ideas_store.get_idea(repo_full_name, idea_id).await else {
        return json_response(
            StatusCode::NOT_FOUND,
            &ApiResponse::<()>::error("Idea not found"),
        );
    };

    let outcome = ideas::build_idea(&state.manager, &ideas_store, idea).await;
    json_response(StatusCode::OK, &ApiResponse::success(outcome))
}

/// Webhook receiver: raw-body signature verification precedes JSON parsing.
async fn handle_github_webhook(req: Request<Incoming>, state: Arc<AppState>) -> Response<BoxBody> {
    let signature = req
        .headers()
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let event_kind = req
        .headers()
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let delivery = req
        .headers()
        .get("x-github-delivery")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_default();

    let body = match req.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => {
            return json_response(
                StatusCode::BAD_REQUEST,
                &ApiResponse::<()>::error("Failed to read body"),
            );
        }
    };

    if !webhook::verify_signature(&body, signature.as_deref(), &state.webhook_secret) {
        warn!(delivery = %delivery, "invalid webhook signature");
        return json_response(
            StatusCode::UNAUTHORIZED,
            &ApiResponse::<()>::error("Invalid signature"),
        );
    }

    info!(event = ?event_kind, delivery = %delivery, "received github webhook");

    match event_kind.as_deref() {
        Some("push") => {
            let payload: PushEvent = match serde_json::from_slice(&body) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(error = %e, "failed to parse webhook payload");
                    return json_response(
                        StatusCode::BAD_REQUEST,
                        &ApiResponse::<()>::error("Invalid JSON payload"),
                    );
                }
            };
            let outcome = webhook::handle_push_event(&state.manager, payload).await;
            json_response(StatusCode::OK, &ApiResponse::success(outcome.message()))
        }
        Some("ping") => {
            let payload: PingEvent = serde_json::from_slice(&body).unwrap_or(PingEvent {
                zen: String::new(),
                hook_id: None,
            });
            info!(zen = %payload.zen, "github webhook ping received");
            json_response(StatusCode::OK, &ApiResponse::success("Pong!"))
        }
        other => json_response(
            StatusCode::OK,
            &ApiResponse::success(format!("Event type {} ignored", other.unwrap_or("unknown"))),
        ),
    }
}

/// Run the HTTP API server
pub async fn run_server(addr: SocketAddr, state: AppState) -> Result<()> {
    let state = Arc::new(state);
    let listener = TcpListener::bind(addr).await?;

    info!(addr = %addr, "repowarm HTTP API server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let state = state.clone();
                handle_request(req, state)
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                error!(error = ?err, "error serving connection");
            }
        });
    }
}
