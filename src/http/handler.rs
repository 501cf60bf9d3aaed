//! Axum router and git smart HTTP handlers.
//!
//! Routes (git routes are mounted under `server.path_prefix`):
//! - `GET  /{owner}/{repo}/info/refs?service=...` - ref advertisement
//! - `POST /{owner}/{repo}/git-upload-pack`       - clone / fetch
//! - `POST /{owner}/{repo}/git-receive-pack`      - signed push
//! - `GET  /health`                               - health check
//! - `GET  /metrics`                              - Prometheus metrics

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, instrument, warn, Instrument, Span};

use super::body::{self, BodyError};
use super::pktline::{decode_pkt_lines, service_header, PktLine, FLUSH_PKT};
use crate::auth::{AuthFailure, AuthorizedPush};
use crate::git::{validate_bare_repo, GitCommand};
use crate::health;
use crate::metrics::Outcome;
use crate::records::RepoContext;
use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    let git = Router::new()
        .route("/{owner}/{repo}/info/refs", get(handle_info_refs))
        .route("/{owner}/{repo}/git-upload-pack", post(handle_upload_pack))
        .route(
            "/{owner}/{repo}/git-receive-pack",
            post(handle_receive_pack),
        );

    let prefix = state.config.server.path_prefix.clone();
    let router = if prefix.is_empty() {
        git
    } else {
        Router::new().nest(&prefix, git)
    };

    router
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Service {
    UploadPack,
    ReceivePack,
}

impl Service {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "git-upload-pack" => Some(Service::UploadPack),
            "git-receive-pack" => Some(Service::ReceivePack),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Service::UploadPack => "git-upload-pack",
            Service::ReceivePack => "git-receive-pack",
        }
    }

    fn subcommand(self) -> &'static str {
        match self {
            Service::UploadPack => "upload-pack",
            Service::ReceivePack => "receive-pack",
        }
    }

    fn advertisement_type(self) -> String {
        format!("application/x-{}-advertisement", self.name())
    }

    fn request_type(self) -> String {
        format!("application/x-{}-request", self.name())
    }

    fn result_type(self) -> String {
        format!("application/x-{}-result", self.name())
    }
}

#[derive(Debug, Deserialize)]
struct InfoRefsQuery {
    service: Option<String>,
}

/// A validated repository address.
struct Target {
    ctx: RepoContext,
    path: PathBuf,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /{owner}/{repo}/info/refs?service=git-{upload,receive}-pack`
///
/// Reads need no credentials, including the advertisement that precedes a
/// push; the push itself is authenticated on `git-receive-pack`.
#[instrument(skip_all, fields(repo = tracing::field::Empty, service = tracing::field::Empty))]
async fn handle_info_refs(
    State(state): State<Arc<AppState>>,
    Path((owner, repo)): Path<(String, String)>,
    Query(query): Query<InfoRefsQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let service = query
        .service
        .as_deref()
        .and_then(Service::parse)
        .ok_or(AppError::BadRequest)?;
    Span::current().record("service", service.name());

    let target = locate(&state, &owner, &repo)?;
    ensure_present(&state, &target).await?;

    let protocol = git_protocol(&headers);
    let mut cmd = GitCommand::new([service.subcommand(), "--stateless-rpc", "--advertise-refs"])
        .arg(&target.path);
    if let Some(protocol) = &protocol {
        cmd = cmd.env("GIT_PROTOCOL", protocol.clone());
    }
    let output = cmd
        .run(state.config.git.command_timeout())
        .await
        .map_err(|e| {
            warn!(error = %e, "ref advertisement failed");
            AppError::Internal(e.into())
        })?;

    // Protocol v2 responses open with their own capability advertisement.
    let v2 = service == Service::UploadPack
        && protocol.as_deref().is_some_and(|p| p.contains("version=2"));
    let mut body = Vec::with_capacity(output.stdout.len() + 64);
    if !v2 {
        body.extend_from_slice(&service_header(service.name()));
    }
    body.extend_from_slice(&output.stdout);

    git_response(&service.advertisement_type(), Body::from(body))
}

/// `POST /{owner}/{repo}/git-upload-pack`
#[instrument(skip_all, fields(repo = tracing::field::Empty))]
async fn handle_upload_pack(
    State(state): State<Arc<AppState>>,
    Path((owner, repo)): Path<(String, String)>,
    headers: HeaderMap,
    request: Body,
) -> Result<Response, AppError> {
    let service = Service::UploadPack;
    require_content_type(&headers, service)?;
    let target = locate(&state, &owner, &repo)?;

    let input = read_request(&headers, request, &state).await?;
    ensure_present(&state, &target).await?;

    run_service(&state, service, target, git_protocol(&headers), input, None)
}

/// `POST /{owner}/{repo}/git-receive-pack`
///
/// The body limit is checked against `Content-Length` first, then the push
/// credential, and only then is the body read and handed to git.
#[instrument(skip_all, fields(repo = tracing::field::Empty))]
async fn handle_receive_pack(
    State(state): State<Arc<AppState>>,
    Path((owner, repo)): Path<(String, String)>,
    headers: HeaderMap,
    request: Body,
) -> Result<Response, AppError> {
    let service = Service::ReceivePack;
    require_content_type(&headers, service)?;
    let target = locate(&state, &owner, &repo)?;

    let declared = body::declared_length(&headers);
    if declared.is_some_and(|len| len > state.config.server.max_body_bytes) {
        info!(declared, "push rejected: body too large");
        return Err(AppError::PayloadTooLarge);
    }

    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    // git sends a lone flush packet before a push too large to buffer, to
    // let the credential handshake happen before the real body.
    if declared == Some(FLUSH_PKT.len() as u64) {
        let input = read_request(&headers, request, &state).await?;
        if decode_pkt_lines(&input) == [PktLine::Flush] {
            authenticate(&state, &target, authorization, true).await?;
            ensure_present(&state, &target).await?;
            debug!("answered push preflight");
            return git_response(&service.result_type(), Body::empty());
        }
        let push = authenticate(&state, &target, authorization, false).await?;
        ensure_present(&state, &target).await?;
        return run_service(&state, service, target, None, input, Some(push));
    }

    let push = authenticate(&state, &target, authorization, false).await?;
    let input = read_request(&headers, request, &state).await?;
    ensure_present(&state, &target).await?;

    run_service(&state, service, target, None, input, Some(push))
}

/// `GET /health`
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    health::health_report(state.resolver.base()).await
}

/// `GET /metrics`
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state
        .metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Validate the URL coordinates.  A trailing `.git` is accepted and ignored.
fn locate(state: &AppState, owner: &str, repo: &str) -> Result<Target, AppError> {
    let repo = repo.strip_suffix(".git").unwrap_or(repo);
    let path = state.resolver.resolve(owner, repo).map_err(|e| {
        // Attempted names are attacker-controlled; only their size is logged.
        debug!(
            error = %e,
            owner_len = owner.len(),
            repo_len = repo.len(),
            "rejected repository address"
        );
        AppError::NotFound
    })?;

    let ctx = RepoContext::new(owner, repo);
    Span::current().record("repo", tracing::field::display(&ctx));
    Ok(Target { ctx, path })
}

/// Make sure the repository exists on disk, recovering it once if not.
async fn ensure_present(state: &AppState, target: &Target) -> Result<(), AppError> {
    if validate_bare_repo(&target.path).await {
        return Ok(());
    }

    info!("repository missing on disk; attempting recovery");
    if state.restorer.restore(&target.ctx, &target.path).await
        && validate_bare_repo(&target.path).await
    {
        Ok(())
    } else {
        Err(AppError::NotFound)
    }
}

async fn authenticate(
    state: &AppState,
    target: &Target,
    authorization: Option<&str>,
    preflight: bool,
) -> Result<AuthorizedPush, AppError> {
    let (owner, repo) = (&target.ctx.owner, &target.ctx.repo);
    let result = if preflight {
        state
            .authenticator
            .authenticate_preflight(authorization, owner, repo)
            .await
    } else {
        state.authenticator.authenticate(authorization, owner, repo).await
    };

    result.map_err(|failure| {
        state.metrics.metrics.record_auth_rejection(failure.reason());
        info!(reason = failure.reason(), "push rejected");
        match failure {
            AuthFailure::MissingCredentials => AppError::Unauthorized,
            _ => AppError::Forbidden,
        }
    })
}

async fn read_request(headers: &HeaderMap, request: Body, state: &AppState) -> Result<Bytes, AppError> {
    body::read_body(headers, request, state.config.server.max_body_bytes)
        .await
        .map_err(|e| match e {
            BodyError::TooLarge => AppError::PayloadTooLarge,
            BodyError::UnsupportedEncoding => AppError::UnsupportedMediaType,
            BodyError::Read(_) | BodyError::Decode(_) => {
                debug!(error = %e, "unreadable request body");
                AppError::BadRequest
            }
        })
}

fn require_content_type(headers: &HeaderMap, service: Service) -> Result<(), AppError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if content_type != service.request_type() {
        return Err(AppError::UnsupportedMediaType);
    }
    Ok(())
}

/// `Git-Protocol` request header, passed through to git as `GIT_PROTOCOL`.
fn git_protocol(headers: &HeaderMap) -> Option<String> {
    headers
        .get("git-protocol")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

fn git_response(content_type: &str, body: Body) -> Result<Response, AppError> {
    let content_type =
        HeaderValue::from_str(content_type).map_err(|e| AppError::Internal(e.into()))?;
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type),
            (
                header::EXPIRES,
                HeaderValue::from_static("Fri, 01 Jan 1980 00:00:00 GMT"),
            ),
            (header::PRAGMA, HeaderValue::from_static("no-cache")),
            (
                header::CACHE_CONTROL,
                HeaderValue::from_static("no-cache, max-age=0, must-revalidate"),
            ),
        ],
        body,
    )
        .into_response())
}

/// Spawn `git <service> --stateless-rpc` and stream its stdout back.
///
/// Stdin is fed and stderr drained on a tracked task that also reaps the
/// child under the command timeout.  For a push, that task records the
/// outcome and runs the post-push hook after git exits successfully.
fn run_service(
    state: &Arc<AppState>,
    service: Service,
    target: Target,
    protocol: Option<String>,
    input: Bytes,
    push: Option<AuthorizedPush>,
) -> Result<Response, AppError> {
    let mut cmd = GitCommand::new([service.subcommand(), "--stateless-rpc"]).arg(&target.path);
    if let Some(protocol) = protocol {
        cmd = cmd.env("GIT_PROTOCOL", protocol);
    }
    let mut child = cmd.spawn().map_err(|e| {
        error!(error = %e, "failed to start git");
        AppError::Internal(e.into())
    })?;

    let stdin = child.stdin.take();
    let stderr = child.stderr.take();
    let stdout = child.stdout.take().ok_or_else(|| {
        AppError::Internal(anyhow::anyhow!("git {} stdout not captured", service.subcommand()))
    })?;

    let timeout = state.config.git.command_timeout();
    let task_state = Arc::clone(state);
    let reap = async move {
        // Dropping `work` on timeout drops the child, which kills it.
        let work = async move {
            let feed = async move {
                if let Some(mut pipe) = stdin {
                    if let Err(e) = pipe.write_all(&input).await {
                        debug!(error = %e, "git closed stdin early");
                    }
                }
            };
            let drain = async move {
                let mut buf = Vec::new();
                if let Some(mut pipe) = stderr {
                    let _ = pipe.read_to_end(&mut buf).await;
                }
                buf
            };
            let ((), stderr) = tokio::join!(feed, drain);
            (child.wait().await, stderr)
        };

        let succeeded = match tokio::time::timeout(timeout, work).await {
            Ok((Ok(status), _)) if status.success() => true,
            Ok((Ok(status), stderr)) => {
                warn!(
                    %status,
                    stderr = %String::from_utf8_lossy(&stderr).trim(),
                    "git {} failed",
                    service.subcommand()
                );
                false
            }
            Ok((Err(e), _)) => {
                error!(error = %e, "failed to wait on git");
                false
            }
            Err(_) => {
                warn!(?timeout, "git {} timed out; killed", service.subcommand());
                false
            }
        };

        if let Some(push) = push {
            let outcome = if succeeded { Outcome::Success } else { Outcome::Failure };
            task_state.metrics.metrics.record_push(outcome);
            if succeeded {
                info!(pusher = %push.pusher, "push accepted");
                task_state
                    .push_hook
                    .on_push_complete(&push.pusher, &target.ctx, &target.path)
                    .await;
            }
        }
    };
    state.tasks.spawn(reap.instrument(Span::current()));

    git_response(
        &service.result_type(),
        Body::from_stream(ReaderStream::new(stdout)),
    )
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
///
/// Bodies are fixed strings; details go to the log only.
#[derive(Debug)]
pub enum AppError {
    BadRequest,
    /// No credential supplied.
    Unauthorized,
    /// A credential was supplied and rejected, for whatever reason.
    Forbidden,
    NotFound,
    PayloadTooLarge,
    UnsupportedMediaType,
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest => (StatusCode::BAD_REQUEST, "bad request").into_response(),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Basic realm=\"sovgit\"")],
                "authentication required",
            )
                .into_response(),
            AppError::Forbidden => (StatusCode::FORBIDDEN, "forbidden").into_response(),
            AppError::NotFound => (StatusCode::NOT_FOUND, "repository not found").into_response(),
            AppError::PayloadTooLarge => {
                (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response()
            }
            AppError::UnsupportedMediaType => {
                (StatusCode::UNSUPPORTED_MEDIA_TYPE, "unsupported media type").into_response()
            }
            AppError::Internal(err) => {
                error!(error = %format!("{err:#}"), "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path as FsPath;
    use std::sync::Mutex;

    use axum::http::Request;
    use ed25519_dalek::SigningKey;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::auth::token::{self, DEFAULT_TTL_SECS};
    use crate::auth::{DidSignatureVerifier, PushAuthenticator};
    use crate::config::parse_config;
    use crate::git::{init_bare_repo, run_git, RepoPathResolver};
    use crate::http::hooks::{PushHook, Restorer};
    use crate::identity::fixtures::StaticIdentityResolver;
    use crate::metrics::MetricsRegistry;
    use crate::records::memory::MemoryRecordStore;
    use crate::records::{BundleMeta, RecordStore};
    use crate::sync::fixtures::{self, T};
    use crate::sync::{BundleRecoveryHook, BundleRestorer};

    const OWNER: &str = "did:plc:bob";
    const PUSHER: &str = "did:plc:alice";

    struct NoRestore;

    #[async_trait::async_trait]
    impl Restorer for NoRestore {
        async fn restore(&self, _ctx: &RepoContext, _path: &FsPath) -> bool {
            false
        }
    }

    #[derive(Default)]
    struct RecordingHook {
        calls: Mutex<Vec<(String, RepoContext)>>,
    }

    #[async_trait::async_trait]
    impl PushHook for RecordingHook {
        async fn on_push_complete(&self, pusher: &str, ctx: &RepoContext, _path: &FsPath) {
            self.calls.lock().unwrap().push((pusher.to_string(), ctx.clone()));
        }
    }

    fn signing_key() -> SigningKey {
        SigningKey::from_bytes(&[9u8; 32])
    }

    fn test_state(
        base: &FsPath,
        max_body_bytes: u64,
        restorer: Arc<dyn Restorer>,
    ) -> (Arc<AppState>, Arc<RecordingHook>) {
        let yaml = format!(
            "server:\n  max_body_bytes: {max_body_bytes}\n\
             storage:\n  repos_path: {}\n\
             records:\n  s3:\n    bucket: test\n",
            base.display()
        );
        let config = parse_config(&yaml).unwrap();

        let identities = StaticIdentityResolver::default().with_key(PUSHER, &signing_key());
        let verifier = Arc::new(DidSignatureVerifier::new(Arc::new(identities)));
        let authenticator = PushAuthenticator::new(&config.auth, verifier, None);
        let hook = Arc::new(RecordingHook::default());

        let state = Arc::new(AppState {
            resolver: RepoPathResolver::new(base),
            config: Arc::new(config),
            authenticator: Arc::new(authenticator),
            restorer,
            push_hook: hook.clone(),
            metrics: MetricsRegistry::new(),
            tasks: tokio_util::task::TaskTracker::new(),
        });
        (state, hook)
    }

    fn credential() -> String {
        let payload = token::build_payload(PUSHER, OWNER, "proj", DEFAULT_TTL_SECS);
        token::sign_credential(&signing_key(), &payload)
    }

    fn receive_pack(body: impl Into<Body>, len: usize, auth: Option<String>) -> Request<Body> {
        let mut req = Request::post(format!("/{OWNER}/proj/git-receive-pack"))
            .header(header::CONTENT_TYPE, "application/x-git-receive-pack-request")
            .header(header::CONTENT_LENGTH, len);
        if let Some(auth) = auth {
            req = req.header(header::AUTHORIZATION, auth);
        }
        req.body(body.into()).unwrap()
    }

    async fn body_bytes(resp: Response) -> Bytes {
        resp.into_body().collect().await.unwrap().to_bytes()
    }

    async fn serve(state: Arc<AppState>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = create_router(state);
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let tmp = tempfile::tempdir().unwrap();
        let (state, _) = test_state(tmp.path(), 1024, Arc::new(NoRestore));

        let resp = create_router(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body_bytes(resp).await).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn info_refs_requires_known_service() {
        let tmp = tempfile::tempdir().unwrap();
        let (state, _) = test_state(tmp.path(), 1024, Arc::new(NoRestore));
        let router = create_router(state);

        for uri in [
            format!("/{OWNER}/proj/info/refs"),
            format!("/{OWNER}/proj/info/refs?service=git-archive"),
        ] {
            let resp = router
                .clone()
                .oneshot(Request::get(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn invalid_and_unknown_repositories_are_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let (state, _) = test_state(tmp.path(), 1024, Arc::new(NoRestore));
        let router = create_router(state);

        for uri in [
            format!("/{OWNER}/.gitconfig/info/refs?service=git-upload-pack"),
            "/not-an-identity/proj/info/refs?service=git-upload-pack".to_string(),
            format!("/{OWNER}/proj/info/refs?service=git-upload-pack"),
        ] {
            let resp = router
                .clone()
                .oneshot(Request::get(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        }
        assert!(!tmp.path().join(OWNER).exists());
    }

    #[tokio::test]
    async fn advertises_refs_with_service_header() {
        let tmp = tempfile::tempdir().unwrap();
        init_bare_repo(&tmp.path().join(OWNER).join("proj"), T).await.unwrap();
        let (state, _) = test_state(tmp.path(), 1024, Arc::new(NoRestore));

        let resp = create_router(state)
            .oneshot(
                Request::get(format!("/{OWNER}/proj.git/info/refs?service=git-upload-pack"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE],
            "application/x-git-upload-pack-advertisement"
        );
        assert!(resp.headers()[header::CACHE_CONTROL]
            .to_str()
            .unwrap()
            .starts_with("no-cache"));
        let body = body_bytes(resp).await;
        assert!(body.starts_with(b"001e# service=git-upload-pack\n0000"));
    }

    #[tokio::test]
    async fn upload_pack_requires_request_content_type() {
        let tmp = tempfile::tempdir().unwrap();
        let (state, _) = test_state(tmp.path(), 1024, Arc::new(NoRestore));

        let resp = create_router(state)
            .oneshot(
                Request::post(format!("/{OWNER}/proj/git-upload-pack"))
                    .header(header::CONTENT_TYPE, "text/plain")
                    .body(Body::from("0000"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn oversized_push_is_rejected_before_git() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join(OWNER).join("proj");
        init_bare_repo(&repo, T).await.unwrap();
        let (state, hook) = test_state(tmp.path(), 1024, Arc::new(NoRestore));

        let body = vec![b'0'; 2048];
        let resp = create_router(state.clone())
            .oneshot(receive_pack(body, 2048, Some(token::basic_header(&credential()))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);

        state.tasks.close();
        state.tasks.wait().await;
        assert!(hook.calls.lock().unwrap().is_empty());
        // Rejected before the credential was even looked at.
        assert!(!state.metrics.encode().unwrap().contains("reason="));
    }

    #[tokio::test]
    async fn streamed_push_over_limit_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join(OWNER).join("proj");
        init_bare_repo(&repo, T).await.unwrap();
        let (state, hook) = test_state(tmp.path(), 1024, Arc::new(NoRestore));

        let chunks = (0..4).map(|_| Ok::<_, std::io::Error>(Bytes::from(vec![b'0'; 512])));
        let req = Request::post(format!("/{OWNER}/proj/git-receive-pack"))
            .header(header::CONTENT_TYPE, "application/x-git-receive-pack-request")
            .header(header::AUTHORIZATION, token::basic_header(&credential()))
            .body(Body::from_stream(tokio_stream::iter(chunks)))
            .unwrap();
        assert!(req.headers().get(header::CONTENT_LENGTH).is_none());

        let resp = create_router(state.clone()).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);

        state.tasks.close();
        state.tasks.wait().await;
        assert!(hook.calls.lock().unwrap().is_empty());
        let refs = run_git(["for-each-ref"], Some(&repo), T).await.unwrap();
        assert!(refs.stdout.is_empty());
    }

    #[tokio::test]
    async fn push_without_credentials_is_challenged() {
        let tmp = tempfile::tempdir().unwrap();
        let (state, _) = test_state(tmp.path(), 1024, Arc::new(NoRestore));

        let resp = create_router(state)
            .oneshot(receive_pack("0000", 4, None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            resp.headers()[header::WWW_AUTHENTICATE],
            "Basic realm=\"sovgit\""
        );
    }

    #[tokio::test]
    async fn rejected_credentials_are_opaque() {
        let tmp = tempfile::tempdir().unwrap();
        let (state, _) = test_state(tmp.path(), 1024, Arc::new(NoRestore));
        let router = create_router(state);

        let other_key = SigningKey::from_bytes(&[1u8; 32]);
        let forged = token::sign_credential(
            &other_key,
            &token::build_payload(PUSHER, OWNER, "proj", DEFAULT_TTL_SECS),
        );
        let wrong_repo = token::sign_credential(
            &signing_key(),
            &token::build_payload(PUSHER, OWNER, "other", DEFAULT_TTL_SECS),
        );

        let mut bodies = Vec::new();
        for cred in [forged, wrong_repo, "garbage".to_string()] {
            let resp = router
                .clone()
                .oneshot(receive_pack("0000", 4, Some(token::basic_header(&cred))))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::FORBIDDEN);
            bodies.push(body_bytes(resp).await);
        }
        assert!(bodies.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn preflight_leaves_credential_usable() {
        let tmp = tempfile::tempdir().unwrap();
        init_bare_repo(&tmp.path().join(OWNER).join("proj"), T).await.unwrap();
        let (state, hook) = test_state(tmp.path(), 1024, Arc::new(NoRestore));
        let router = create_router(state.clone());
        let auth = token::basic_header(&credential());

        let resp = router
            .clone()
            .oneshot(receive_pack("0000", 4, Some(auth.clone())))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_bytes(resp).await.is_empty());

        // A second preflight with the same credential is still fine.
        let resp = router
            .oneshot(receive_pack("0000", 4, Some(auth)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        state.tasks.close();
        state.tasks.wait().await;
        assert!(hook.calls.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn signed_push_lands_and_replay_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("repos");
        let repo = base.join(OWNER).join("proj");
        init_bare_repo(&repo, T).await.unwrap();
        let (state, hook) = test_state(&base, 16 * 1024 * 1024, Arc::new(NoRestore));
        let url = serve(state.clone()).await;

        let wt = fixtures::work_tree(tmp.path()).await;
        let tip = fixtures::head(&wt).await;
        let remote = url.replacen(
            "http://",
            &format!("http://{}:{}@", token::SENTINEL_USER, credential()),
            1,
        ) + &format!("/{OWNER}/proj.git");

        run_git(["push", "--quiet", remote.as_str(), "main:main"], Some(&wt), T)
            .await
            .unwrap();

        let landed = run_git(["rev-parse", "refs/heads/main"], Some(&repo), T)
            .await
            .unwrap()
            .stdout_str();
        assert_eq!(landed.trim(), tip);

        fixtures::commit(&wt, "two").await;
        assert!(run_git(["push", "--quiet", remote.as_str(), "main:main"], Some(&wt), T)
            .await
            .is_err());

        state.tasks.close();
        state.tasks.wait().await;
        let calls = hook.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, PUSHER);
        assert_eq!(calls[0].1, RepoContext::new(OWNER, "proj"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_repository_is_restored_then_cloned() {
        let tmp = tempfile::tempdir().unwrap();
        let wt = fixtures::work_tree(tmp.path()).await;
        let tip = fixtures::head(&wt).await;
        let bundle = tmp.path().join("full.bundle");
        fixtures::bundle(&wt, &bundle).await;

        let store = Arc::new(MemoryRecordStore::default());
        let meta = BundleMeta {
            is_full: true,
            tip_commit: Some(tip.clone()),
            ref_count: 1,
            size: 0,
            created_at_ms: 1,
        };
        store
            .put_bundle(&RepoContext::new(OWNER, "proj"), &meta, &bundle)
            .await
            .unwrap();

        let metrics = MetricsRegistry::new().metrics;
        let restorer = Arc::new(BundleRecoveryHook::new(
            BundleRestorer::new(store, T),
            metrics,
        ));
        let base = tmp.path().join("repos");
        let (state, _) = test_state(&base, 16 * 1024 * 1024, restorer);
        let url = serve(state).await;

        let clone = tmp.path().join("clone");
        let source = format!("{url}/{OWNER}/proj");
        let dest = clone.to_string_lossy().into_owned();
        run_git(["clone", "--quiet", source.as_str(), dest.as_str()], None, T)
            .await
            .unwrap();

        assert_eq!(fixtures::head(&clone).await, tip);
        assert!(validate_bare_repo(&base.join(OWNER).join("proj")).await);

        let missing = format!("{url}/{OWNER}/absent");
        assert!(run_git(["ls-remote", missing.as_str()], None, T).await.is_err());
    }
}
