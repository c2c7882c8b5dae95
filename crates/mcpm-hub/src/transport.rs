use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use mcpm_core::ServerConfig;
use rmcp::model::InitializeResult;
use rmcp::service::{RunningService, ServiceExt};
use rmcp::RoleClient;
use tokio::process::Command;

const SHUTDOWN_GRACE_SECS: u64 = 3;

/// Environment sentinel required on every stdio downstream child, so an
/// empty `env` map still distinguishes "ran under mcpm" from a bare shell
/// and the child keeps the inherited `PATH`.
pub const STDIO_ENV_SENTINEL: (&str, &str) = ("MCPM_STDIO_SERVER", "true");

/// What a downstream declared at `initialize`, used to decide which
/// `list_*` calls are worth making.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeclaredCapabilities {
    pub tools: bool,
    pub prompts: bool,
    pub resources: bool,
}

impl DeclaredCapabilities {
    fn from_initialize(result: &InitializeResult) -> Self {
        let caps = &result.capabilities;
        Self {
            tools: caps.tools.is_some(),
            prompts: caps.prompts.is_some(),
            resources: caps.resources.is_some(),
        }
    }
}

/// One connected downstream MCP client session. Owns either a spawned
/// stdio child or a Streamable-HTTP client.
pub enum BackendTransport {
    Stdio {
        service: RunningService<RoleClient, ()>,
        child: Box<tokio::process::Child>,
    },
    Http {
        service: RunningService<RoleClient, ()>,
    },
}

impl BackendTransport {
    pub async fn connect(config: &ServerConfig) -> Result<(Self, DeclaredCapabilities)> {
        match config {
            ServerConfig::Stdio(stdio) => {
                Self::spawn_stdio(&stdio.name, &stdio.command, &stdio.args, &stdio.env).await
            }
            ServerConfig::Remote(remote) => {
                Self::connect_http(&remote.name, &remote.url, &remote.headers).await
            }
        }
    }

    pub fn service(&self) -> &RunningService<RoleClient, ()> {
        match self {
            Self::Stdio { service, .. } => service,
            Self::Http { service, .. } => service,
        }
    }

    pub async fn shutdown(self) {
        match self {
            Self::Stdio { service, mut child } => {
                let _ = service.cancel().await;
                match tokio::time::timeout(Duration::from_secs(SHUTDOWN_GRACE_SECS), child.wait())
                    .await
                {
                    Ok(Ok(_)) => {}
                    Ok(Err(error)) => {
                        tracing::debug!(error = %error, "failed to wait downstream child process");
                    }
                    Err(_) => {
                        let _ = child.kill().await;
                    }
                }
            }
            Self::Http { service } => {
                let _ = service.cancel().await;
            }
        }
    }

    async fn spawn_stdio(
        name: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<(Self, DeclaredCapabilities)> {
        let mut cmd = Command::new(command);
        cmd.args(args);
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        for (key, value) in env {
            cmd.env(key, value);
        }
        let (sentinel_key, sentinel_value) = STDIO_ENV_SENTINEL;
        cmd.env(sentinel_key, sentinel_value);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn downstream server '{name}'"))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("failed to capture stdout for downstream server '{name}'"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to capture stdin for downstream server '{name}'"))?;
        if let Some(mut stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut sink = tokio::io::sink();
                let _ = tokio::io::copy(&mut stderr, &mut sink).await;
            });
        }

        let service = ()
            .serve((stdout, stdin))
            .await
            .with_context(|| format!("failed to initialize downstream server '{name}'"))?;

        let declared = DeclaredCapabilities::from_initialize(service.peer_info().ok_or_else(|| {
            anyhow!("downstream server '{name}' did not return an initialize result")
        })?);

        Ok((
            Self::Stdio {
                service,
                child: Box::new(child),
            },
            declared,
        ))
    }

    async fn connect_http(
        name: &str,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<(Self, DeclaredCapabilities)> {
        use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
        use rmcp::transport::StreamableHttpClientTransport;

        tracing::info!(server = %name, url = %url, "connecting to remote downstream server");

        let client = reqwest::Client::builder()
            .default_headers(build_header_map(headers)?)
            .build()
            .with_context(|| format!("failed to build HTTP client for downstream server '{name}'"))?;
        let config = StreamableHttpClientTransportConfig::with_uri(url.to_string());
        let transport = StreamableHttpClientTransport::with_client(client, config);

        let service: RunningService<RoleClient, ()> = ().serve(transport).await.with_context(|| {
            format!("failed to connect to remote downstream server '{name}' at {url}")
        })?;

        let declared = DeclaredCapabilities::from_initialize(service.peer_info().ok_or_else(|| {
            anyhow!("downstream server '{name}' did not return an initialize result")
        })?);

        Ok((Self::Http { service }, declared))
    }
}

/// Builds the default-header set for a remote downstream's HTTP client from
/// its configured `headers` map (e.g. `Authorization`, API keys).
fn build_header_map(headers: &HashMap<String, String>) -> Result<reqwest::header::HeaderMap> {
    let mut map = reqwest::header::HeaderMap::new();
    for (key, value) in headers {
        let name = reqwest::header::HeaderName::from_bytes(key.as_bytes())
            .with_context(|| format!("invalid header name '{key}'"))?;
        let value = reqwest::header::HeaderValue::from_str(value)
            .with_context(|| format!("invalid header value for '{key}'"))?;
        map.insert(name, value);
    }
    Ok(map)
}
