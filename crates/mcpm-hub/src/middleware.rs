use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use mcpm_core::{Event, EventType, RunAction, Session, SessionSource, Transport};
use mcpm_telemetry::TelemetryStore;
use rmcp::model::{
    CallToolRequestParam, CallToolResult, CompleteRequestParam, CompleteResult, GetPromptRequestParam,
    GetPromptResult, ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult, ListToolsResult,
    PaginatedRequestParam, ReadResourceRequestParam, ReadResourceResult, ServerInfo,
};
use rmcp::service::RequestContext;
use rmcp::{ErrorData as McpError, RoleServer, ServerHandler};
use serde_json::json;
use uuid::Uuid;

use crate::router::AggregatingRouter;

/// Classifies a client IP: loopback → local; RFC1918 /
/// link-local / IPv6 ULA → local_network; anything else → public_internet.
/// Grounded on `original_source/src/mcpm/fastmcp_integration/middleware.py::_classify_origin`.
pub fn classify_source(ip: Option<IpAddr>) -> SessionSource {
    let Some(ip) = ip else {
        return SessionSource::LocalStdio;
    };
    match ip {
        IpAddr::V4(v4) => {
            if v4.is_loopback() {
                SessionSource::Local
            } else if v4.is_private() || v4.is_link_local() {
                SessionSource::LocalNetwork
            } else {
                SessionSource::PublicInternet
            }
        }
        IpAddr::V6(v6) => {
            if v6.is_loopback() {
                SessionSource::Local
            } else if (v6.segments()[0] & 0xfe00) == 0xfc00 {
                // fc00::/7, the IPv6 unique local address block.
                SessionSource::LocalNetwork
            } else {
                SessionSource::PublicInternet
            }
        }
    }
}

/// Per-upstream-connection context, built once when the transport accepts
/// the connection.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub transport: Transport,
    pub client_addr: Option<IpAddr>,
    pub action: RunAction,
    pub profile_name: Option<String>,
    pub bearer_token: Option<String>,
}

/// Outermost middleware: no-op request logging unless debug logging is on.
#[derive(Clone)]
pub struct DebugMiddleware<H> {
    inner: H,
    enabled: bool,
}

impl<H> DebugMiddleware<H> {
    pub fn new(inner: H, enabled: bool) -> Self {
        Self { inner, enabled }
    }
}

impl<H: ServerHandler + Clone> ServerHandler for DebugMiddleware<H> {
    async fn list_tools(
        &self,
        request: Option<PaginatedRequestParam>,
        context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        let start = Instant::now();
        let result = self.inner.list_tools(request, context).await;
        if self.enabled {
            tracing::debug!(method = "list_tools", elapsed_ms = start.elapsed().as_millis() as u64, "handled");
        }
        result
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let name = request.name.to_string();
        let result = self.inner.call_tool(request, context).await;
        if self.enabled {
            tracing::debug!(
                method = "call_tool",
                tool = %name,
                elapsed_ms = start.elapsed().as_millis() as u64,
                ok = result.is_ok(),
                "handled"
            );
        }
        result
    }

    async fn get_prompt(
        &self,
        request: GetPromptRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<GetPromptResult, McpError> {
        self.inner.get_prompt(request, context).await
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, McpError> {
        self.inner.read_resource(request, context).await
    }

    async fn list_prompts(
        &self,
        request: Option<PaginatedRequestParam>,
        context: RequestContext<RoleServer>,
    ) -> Result<ListPromptsResult, McpError> {
        self.inner.list_prompts(request, context).await
    }

    async fn list_resources(
        &self,
        request: Option<PaginatedRequestParam>,
        context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, McpError> {
        self.inner.list_resources(request, context).await
    }

    async fn list_resource_templates(
        &self,
        request: Option<PaginatedRequestParam>,
        context: RequestContext<RoleServer>,
    ) -> Result<ListResourceTemplatesResult, McpError> {
        self.inner.list_resource_templates(request, context).await
    }

    async fn complete(
        &self,
        request: CompleteRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<CompleteResult, McpError> {
        self.inner.complete(request, context).await
    }

    fn get_info(&self) -> ServerInfo {
        self.inner.get_info()
    }
}

/// Bearer-token auth, HTTP mode only. Bypassed entirely in stdio mode;
/// `enabled = false` also bypasses it (with a warning logged once at
/// startup by the caller).
#[derive(Clone)]
pub struct AuthMiddleware<H> {
    inner: H,
    api_key: Option<String>,
    bearer_token: Option<String>,
    bypass: bool,
}

impl<H> AuthMiddleware<H> {
    pub fn new(inner: H, api_key: Option<String>, bearer_token: Option<String>, bypass: bool) -> Self {
        Self {
            inner,
            api_key,
            bearer_token,
            bypass,
        }
    }

    fn check(&self) -> Result<(), McpError> {
        if self.bypass || self.api_key.is_none() {
            return Ok(());
        }
        let expected = self.api_key.as_deref().unwrap_or_default();
        match &self.bearer_token {
            Some(token) if token == expected => Ok(()),
            _ => Err(McpError::invalid_request("invalid or missing bearer token", None)),
        }
    }
}

/// Extracts a bearer token from an `Authorization` header value, accepting
/// both `Bearer <token>` (case-insensitive scheme) and a bare token.
pub fn extract_bearer_token(header_value: &str) -> String {
    let trimmed = header_value.trim();
    if let Some(rest) = trimmed.get(0..7) {
        if rest.eq_ignore_ascii_case("bearer ") {
            return trimmed[7..].trim().to_string();
        }
    }
    trimmed.to_string()
}

impl<H: ServerHandler + Clone> ServerHandler for AuthMiddleware<H> {
    async fn list_tools(
        &self,
        request: Option<PaginatedRequestParam>,
        context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        self.check()?;
        self.inner.list_tools(request, context).await
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.check()?;
        self.inner.call_tool(request, context).await
    }

    async fn get_prompt(
        &self,
        request: GetPromptRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<GetPromptResult, McpError> {
        self.check()?;
        self.inner.get_prompt(request, context).await
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, McpError> {
        self.check()?;
        self.inner.read_resource(request, context).await
    }

    async fn list_prompts(
        &self,
        request: Option<PaginatedRequestParam>,
        context: RequestContext<RoleServer>,
    ) -> Result<ListPromptsResult, McpError> {
        self.check()?;
        self.inner.list_prompts(request, context).await
    }

    async fn list_resources(
        &self,
        request: Option<PaginatedRequestParam>,
        context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, McpError> {
        self.check()?;
        self.inner.list_resources(request, context).await
    }

    async fn list_resource_templates(
        &self,
        request: Option<PaginatedRequestParam>,
        context: RequestContext<RoleServer>,
    ) -> Result<ListResourceTemplatesResult, McpError> {
        self.check()?;
        self.inner.list_resource_templates(request, context).await
    }

    async fn complete(
        &self,
        request: CompleteRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<CompleteResult, McpError> {
        self.check()?;
        self.inner.complete(request, context).await
    }

    fn get_info(&self) -> ServerInfo {
        self.inner.get_info()
    }
}

/// Innermost middleware: emits `SESSION_START`/`SESSION_END` once per
/// upstream connection and one event per forwarded request. Wraps the
/// [`AggregatingRouter`] directly since it needs to know which downstream
/// served a request to stamp `server_name`.
#[derive(Clone)]
pub struct TrackingMiddleware {
    inner: AggregatingRouter,
    telemetry: Arc<TelemetryStore>,
    session: Session,
    session_start: Arc<tokio::sync::OnceCell<Instant>>,
    ended: Arc<std::sync::atomic::AtomicBool>,
}

impl TrackingMiddleware {
    pub fn new(inner: AggregatingRouter, telemetry: Arc<TelemetryStore>, session: Session) -> Self {
        Self {
            inner,
            telemetry,
            session,
            session_start: Arc::new(tokio::sync::OnceCell::new()),
            ended: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    async fn ensure_session_started(&self) {
        let first_time = self.session_start.get().is_none();
        let _ = self.session_start.get_or_init(|| async { Instant::now() }).await;
        if first_time {
            self.telemetry.record(Event {
                id: None,
                session_id: self.session.session_id.clone(),
                event_type: EventType::SessionStart,
                server_name: self.session.server_name.clone().unwrap_or_default(),
                resource_id: String::new(),
                timestamp: self.session.started_at,
                duration_ms: None,
                success: true,
                error_message: None,
                metadata: json!({
                    "action": action_str(self.session.action),
                    "transport": transport_str(self.session.transport),
                    "source": source_str(self.session.source),
                    "profile_name": self.session.profile_name,
                }),
            });
        }
    }

    /// Emits `SESSION_END` with total duration; called on upstream
    /// disconnect or process shutdown. Safe to call from
    /// multiple clones of the same session — guarded so it fires once.
    pub fn end_session(&self) {
        if self.ended.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        if let Some(start) = self.session_start.get() {
            self.telemetry.record(Event {
                id: None,
                session_id: self.session.session_id.clone(),
                event_type: EventType::SessionEnd,
                server_name: String::new(),
                resource_id: String::new(),
                timestamp: Utc::now(),
                duration_ms: Some(start.elapsed().as_millis() as i64),
                success: true,
                error_message: None,
                metadata: json!({}),
            });
        }
    }

    fn record(&self, event_type: EventType, server_name: &str, resource_id: &str, started: Instant, success: bool, error_message: Option<String>) {
        self.telemetry.record(Event {
            id: None,
            session_id: self.session.session_id.clone(),
            event_type,
            server_name: server_name.to_string(),
            resource_id: resource_id.to_string(),
            timestamp: Utc::now(),
            duration_ms: Some(started.elapsed().as_millis() as i64),
            success,
            error_message,
            metadata: json!({}),
        });
    }
}

impl Drop for TrackingMiddleware {
    /// Fallback disconnect hook: when the last clone of a session's
    /// middleware is dropped (rmcp drops the handler when the connection
    /// closes), emit `SESSION_END` if nothing already did.
    fn drop(&mut self) {
        if Arc::strong_count(&self.ended) == 1 {
            self.end_session();
        }
    }
}

fn action_str(action: RunAction) -> &'static str {
    match action {
        RunAction::Run => "run",
        RunAction::RunHttp => "run_http",
        RunAction::ProfileRun => "profile_run",
        RunAction::Proxy => "proxy",
    }
}

fn transport_str(transport: Transport) -> &'static str {
    match transport {
        Transport::Stdio => "stdio",
        Transport::Http => "http",
    }
}

fn source_str(source: SessionSource) -> &'static str {
    match source {
        SessionSource::Local => "local",
        SessionSource::LocalNetwork => "local_network",
        SessionSource::PublicInternet => "public_internet",
        SessionSource::LocalStdio => "local_stdio",
        SessionSource::Unknown => "unknown",
    }
}

impl ServerHandler for TrackingMiddleware {
    async fn list_tools(
        &self,
        request: Option<PaginatedRequestParam>,
        context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        self.ensure_session_started().await;
        self.inner.list_tools(request, context).await
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.ensure_session_started().await;
        let started = Instant::now();
        let tool_name = request.name.to_string();
        let server_name = self.inner.owning_downstream_for_tool(&tool_name);
        let result = self.inner.call_tool(request, context).await;
        self.record(
            EventType::ToolInvocation,
            server_name.as_deref().unwrap_or(""),
            &tool_name,
            started,
            result.is_ok(),
            result.as_ref().err().map(|e| e.message.to_string()),
        );
        result
    }

    async fn get_prompt(
        &self,
        request: GetPromptRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<GetPromptResult, McpError> {
        self.ensure_session_started().await;
        let started = Instant::now();
        let prompt_name = request.name.clone();
        let server_name = self.inner.owning_downstream_for_prompt(&prompt_name);
        let result = self.inner.get_prompt(request, context).await;
        self.record(
            EventType::PromptExecution,
            server_name.as_deref().unwrap_or(""),
            &prompt_name,
            started,
            result.is_ok(),
            result.as_ref().err().map(|e| e.message.to_string()),
        );
        result
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, McpError> {
        self.ensure_session_started().await;
        let started = Instant::now();
        let uri = request.uri.clone();
        let server_name = self.inner.owning_downstream_for_resource(&uri);
        let result = self.inner.read_resource(request, context).await;
        self.record(
            EventType::ResourceAccess,
            server_name.as_deref().unwrap_or(""),
            &uri,
            started,
            result.is_ok(),
            result.as_ref().err().map(|e| e.message.to_string()),
        );
        result
    }

    async fn list_prompts(
        &self,
        request: Option<PaginatedRequestParam>,
        context: RequestContext<RoleServer>,
    ) -> Result<ListPromptsResult, McpError> {
        self.ensure_session_started().await;
        self.inner.list_prompts(request, context).await
    }

    async fn list_resources(
        &self,
        request: Option<PaginatedRequestParam>,
        context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, McpError> {
        self.ensure_session_started().await;
        self.inner.list_resources(request, context).await
    }

    async fn list_resource_templates(
        &self,
        request: Option<PaginatedRequestParam>,
        context: RequestContext<RoleServer>,
    ) -> Result<ListResourceTemplatesResult, McpError> {
        self.ensure_session_started().await;
        self.inner.list_resource_templates(request, context).await
    }

    async fn complete(
        &self,
        request: CompleteRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<CompleteResult, McpError> {
        self.ensure_session_started().await;
        self.inner.complete(request, context).await
    }

    fn get_info(&self) -> ServerInfo {
        self.inner.get_info()
    }
}

/// Builds a fresh, unique session id for a new upstream connection.
pub fn new_session_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_source_maps_loopback_to_local() {
        assert_eq!(classify_source(Some("127.0.0.1".parse().unwrap())), SessionSource::Local);
    }

    #[test]
    fn classify_source_maps_rfc1918_to_local_network() {
        assert_eq!(classify_source(Some("10.1.2.3".parse().unwrap())), SessionSource::LocalNetwork);
        assert_eq!(classify_source(Some("192.168.1.5".parse().unwrap())), SessionSource::LocalNetwork);
        assert_eq!(classify_source(Some("172.16.0.1".parse().unwrap())), SessionSource::LocalNetwork);
        assert_eq!(classify_source(Some("169.254.1.1".parse().unwrap())), SessionSource::LocalNetwork);
    }

    #[test]
    fn classify_source_maps_other_to_public_internet() {
        assert_eq!(classify_source(Some("8.8.8.8".parse().unwrap())), SessionSource::PublicInternet);
    }

    #[test]
    fn classify_source_with_no_ip_is_local_stdio() {
        assert_eq!(classify_source(None), SessionSource::LocalStdio);
    }

    #[test]
    fn extract_bearer_token_accepts_scheme_or_bare_token() {
        assert_eq!(extract_bearer_token("Bearer abc123"), "abc123");
        assert_eq!(extract_bearer_token("bearer abc123"), "abc123");
        assert_eq!(extract_bearer_token("abc123"), "abc123");
    }

    #[test]
    fn auth_middleware_rejects_missing_or_wrong_token() {
        let auth = AuthMiddleware::new((), Some("secret".to_string()), None, false);
        assert!(auth.check().is_err());

        let auth = AuthMiddleware::new((), Some("secret".to_string()), Some("wrong".to_string()), false);
        assert!(auth.check().is_err());

        let auth = AuthMiddleware::new((), Some("secret".to_string()), Some("secret".to_string()), false);
        assert!(auth.check().is_ok());
    }

    #[test]
    fn auth_middleware_bypass_and_no_key_both_admit_every_request() {
        let bypassed = AuthMiddleware::new((), Some("secret".to_string()), None, true);
        assert!(bypassed.check().is_ok());

        let no_key_configured = AuthMiddleware::new((), None, None, false);
        assert!(no_key_configured.check().is_ok());
    }
}
