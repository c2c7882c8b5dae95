use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::extract::{ConnectInfo, DefaultBodyLimit};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use mcpm_core::{RunAction, Session, SessionSource, Transport};
use rmcp::service::ServiceExt;
use rmcp::transport::sse_server::SseServerConfig;
use rmcp::transport::SseServer;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::app::App;
use crate::middleware::{classify_source, extract_bearer_token, new_session_id, AuthMiddleware, DebugMiddleware, TrackingMiddleware};

tokio::task_local! {
    /// The accepted TCP connection's peer address, scoped around each HTTP
    /// request so the SSE connection factory below (which takes no
    /// arguments of its own) can still classify the session's source.
    static PEER_ADDR: SocketAddr;
}

async fn capture_peer_addr(ConnectInfo(addr): ConnectInfo<SocketAddr>, request: axum::extract::Request, next: Next) -> Response {
    PEER_ADDR.scope(addr, next.run(request)).await
}

/// Builds one request's middleware chain, outermost first: Debug, then
/// Auth, then Unified Tracking wrapping the router.
///
/// The per-connection factory below has no access to request headers, so
/// bearer-token enforcement for HTTP happens once, up front, in the
/// [`enforce_bearer_auth`] axum layer — by the time a connection reaches
/// here it has already been admitted. `AuthMiddleware` therefore always
/// bypasses in this chain; it still does real per-request checks when used
/// standalone (see its own tests).
fn build_handler(app: &App, session: Session, bearer_token: Option<String>) -> DebugMiddleware<AuthMiddleware<TrackingMiddleware>> {
    let tracking = TrackingMiddleware::new(app.router.clone(), app.telemetry.clone(), session);
    let auth = AuthMiddleware::new(tracking, app.config.auth.api_key.clone(), bearer_token, true);
    DebugMiddleware::new(auth, app.config.debug_logging)
}

/// Serves one aggregator over stdio. Runs until the upstream
/// client disconnects, then returns so the caller can shut the process down.
///
/// `server_name` is the single configured downstream for `run`, so it can be
/// stamped onto `SESSION_START`; left `None` for multi-server sessions.
pub async fn serve_stdio(
    app: &App,
    action: RunAction,
    profile_name: Option<String>,
    server_name: Option<String>,
) -> Result<()> {
    let session = Session {
        session_id: new_session_id(),
        action,
        profile_name,
        server_name,
        transport: Transport::Stdio,
        source: SessionSource::LocalStdio,
        started_at: chrono::Utc::now(),
        client_info: json!({}),
        server_info: json!({}),
    };
    let handler = build_handler(app, session, None);

    let transport = (tokio::io::stdin(), tokio::io::stdout());
    let running = handler
        .serve(transport)
        .await
        .context("failed to start stdio MCP server")?;
    running.waiting().await.context("stdio MCP server exited with an error")?;
    Ok(())
}

/// The HTTP/SSE endpoint. Each new
/// connection gets its own [`TrackingMiddleware`] with a fresh session id,
/// so `SESSION_START`/`SESSION_END` are per-connection as required.
pub struct HttpEndpoint {
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    server_task: tokio::task::JoinHandle<()>,
}

impl HttpEndpoint {
    pub async fn start(
        app: std::sync::Arc<App>,
        action: RunAction,
        profile_name: Option<String>,
        server_name: Option<String>,
    ) -> Result<Self> {
        let bind_addr = format!("{}:{}", app.config.http_bind, app.config.http_port)
            .parse::<SocketAddr>()
            .with_context(|| {
                format!(
                    "invalid HTTP bind address '{}:{}'",
                    app.config.http_bind, app.config.http_port
                )
            })?;

        let listener = tokio::net::TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind HTTP endpoint at {bind_addr}"))?;
        let local_addr = listener.local_addr().context("failed to resolve local HTTP address")?;

        if !app.config.auth.enabled {
            warn!("HTTP endpoint is running without authentication");
        }

        let shutdown = CancellationToken::new();
        let (sse_server, sse_router) = SseServer::new(SseServerConfig {
            bind: local_addr,
            sse_path: app.config.mount_path().to_string(),
            post_path: format!("{}message", app.config.mount_path()),
            ct: shutdown.clone(),
            sse_keep_alive: None,
        });

        let _server_ct = sse_server.with_service_directly({
            let app = app.clone();
            let action = action;
            let profile_name = profile_name.clone();
            let server_name = server_name.clone();
            move || {
                let source = PEER_ADDR
                    .try_with(|addr| source_from_addr(Some(*addr)))
                    .unwrap_or(SessionSource::Unknown);
                let session = Session {
                    session_id: new_session_id(),
                    action,
                    profile_name: profile_name.clone(),
                    server_name: server_name.clone(),
                    transport: Transport::Http,
                    source,
                    started_at: chrono::Utc::now(),
                    client_info: json!({}),
                    server_info: json!({}),
                };
                build_handler(&app, session, None)
            }
        });

        let auth_config = app.config.auth.clone();
        let authed_router = sse_router
            .layer(middleware::from_fn(move |headers: HeaderMap, request, next: Next| {
                let auth_config = auth_config.clone();
                async move { enforce_bearer_auth(auth_config, headers, request, next).await }
            }))
            .layer(middleware::from_fn(capture_peer_addr))
            .layer(DefaultBodyLimit::max(app.config.max_request_body_bytes));

        let server_shutdown = shutdown.clone();
        let make_service = authed_router.into_make_service_with_connect_info::<SocketAddr>();
        let server_task = tokio::spawn(async move {
            if let Err(error) = axum::serve(listener, make_service)
                .with_graceful_shutdown(async move {
                    server_shutdown.cancelled().await;
                })
                .await
            {
                warn!(error = %error, "HTTP server stopped with error");
            }
        });

        info!(addr = %local_addr, path = app.config.mount_path(), "HTTP endpoint listening");

        Ok(Self {
            addr: local_addr,
            shutdown,
            server_task,
        })
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(error) = self.server_task.await {
            tracing::debug!(error = %error, "HTTP server join failed");
        }
    }
}

async fn enforce_bearer_auth(
    auth: crate::config::AuthConfig,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    if !auth.enabled {
        return next.run(request).await;
    }
    let Some(expected) = auth.api_key.as_deref() else {
        return next.run(request).await;
    };
    let provided = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(extract_bearer_token);
    match provided {
        Some(token) if token == expected => next.run(request).await,
        _ => (StatusCode::UNAUTHORIZED, "invalid or missing bearer token").into_response(),
    }
}

/// Classifies a session's source from the client's socket address, used
/// once auth has admitted the HTTP connection.
pub fn source_from_addr(addr: Option<SocketAddr>) -> SessionSource {
    classify_source(addr.map(|a| a.ip()))
}
