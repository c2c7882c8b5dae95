use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mcpm_core::{Error, ServerConfig};
use rmcp::model::{
    CallToolRequestParam, CallToolResult, CompleteRequestParam, CompleteResult, GetPromptRequestParam,
    GetPromptResult, PaginatedRequestParam, Prompt, ReadResourceRequestParam, ReadResourceResult,
    Resource, ResourceTemplate, Tool,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::transport::{BackendTransport, DeclaredCapabilities};

const DEFAULT_CALL_DEADLINE: Duration = Duration::from_secs(60);
const COMMAND_QUEUE_DEPTH: usize = 64;

const STARTING: u8 = 0;
const HEALTHY: u8 = 1;
const FAILED: u8 = 2;
const SHUTTING_DOWN: u8 = 3;
const CLOSED: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Starting,
    Healthy,
    Failed,
    ShuttingDown,
    Closed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            STARTING => Self::Starting,
            HEALTHY => Self::Healthy,
            FAILED => Self::Failed,
            SHUTTING_DOWN => Self::ShuttingDown,
            _ => Self::Closed,
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, Error>>;

enum Command {
    ListTools(Reply<Vec<Tool>>),
    ListPrompts(Reply<Vec<Prompt>>),
    ListResources(Reply<Vec<Resource>>),
    ListResourceTemplates(Reply<Vec<ResourceTemplate>>),
    CallTool(CallToolRequestParam, Reply<CallToolResult>),
    GetPrompt(GetPromptRequestParam, Reply<GetPromptResult>),
    ReadResource(ReadResourceRequestParam, Reply<ReadResourceResult>),
    Complete(CompleteRequestParam, Reply<CompleteResult>),
    Shutdown(oneshot::Sender<()>),
}

/// One long-lived MCP client session to one downstream server. Every call
/// is serialized through a single actor task, since the underlying client
/// session is not safely shared across concurrent callers.
#[derive(Clone)]
pub struct DownstreamHandle {
    name: Arc<str>,
    declared: DeclaredCapabilities,
    state: Arc<AtomicU8>,
    sender: mpsc::Sender<Command>,
}

impl DownstreamHandle {
    /// Connects to the downstream and performs `initialize` synchronously;
    /// only on success does it spawn the serialized actor task. A failure
    /// here is the caller's signal to drop this downstream.
    pub async fn start(config: &ServerConfig, call_deadline: Option<Duration>) -> Result<Self, Error> {
        let name = config.name().to_string();
        let state = Arc::new(AtomicU8::new(STARTING));

        let (transport, declared) = BackendTransport::connect(config).await.map_err(|source| {
            state.store(FAILED, Ordering::SeqCst);
            Error::DownstreamStartup {
                server: name.clone(),
                source,
            }
        })?;

        state.store(HEALTHY, Ordering::SeqCst);

        let (sender, receiver) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let deadline = call_deadline.unwrap_or(DEFAULT_CALL_DEADLINE);
        let actor_name = name.clone();
        let actor_state = state.clone();
        tokio::spawn(run_actor(actor_name, transport, receiver, deadline, actor_state));

        Ok(Self {
            name: name.into(),
            declared,
            state,
            sender,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn declared(&self) -> DeclaredCapabilities {
        self.declared
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub async fn list_tools(&self) -> Result<Vec<Tool>, Error> {
        self.call(Command::ListTools).await
    }

    pub async fn list_prompts(&self) -> Result<Vec<Prompt>, Error> {
        self.call(Command::ListPrompts).await
    }

    pub async fn list_resources(&self) -> Result<Vec<Resource>, Error> {
        self.call(Command::ListResources).await
    }

    pub async fn list_resource_templates(&self) -> Result<Vec<ResourceTemplate>, Error> {
        self.call(Command::ListResourceTemplates).await
    }

    pub async fn call_tool(&self, params: CallToolRequestParam) -> Result<CallToolResult, Error> {
        self.call(|reply| Command::CallTool(params, reply)).await
    }

    pub async fn get_prompt(&self, params: GetPromptRequestParam) -> Result<GetPromptResult, Error> {
        self.call(|reply| Command::GetPrompt(params, reply)).await
    }

    pub async fn read_resource(&self, params: ReadResourceRequestParam) -> Result<ReadResourceResult, Error> {
        self.call(|reply| Command::ReadResource(params, reply)).await
    }

    pub async fn complete(&self, params: CompleteRequestParam) -> Result<CompleteResult, Error> {
        self.call(|reply| Command::Complete(params, reply)).await
    }

    /// Orderly shutdown; idempotent — a second call finds the channel
    /// already closed and returns without error.
    pub async fn shutdown(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.sender.send(Command::Shutdown(reply_tx)).await.is_ok() {
            let _ = reply_rx.await;
        }
    }

    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, Error> {
        if self.state() != ConnectionState::Healthy {
            return Err(Error::DownstreamCall {
                server: self.name.to_string(),
                source: anyhow::anyhow!("downstream is not healthy"),
            });
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(build(reply_tx))
            .await
            .map_err(|_| Error::DownstreamCall {
                server: self.name.to_string(),
                source: anyhow::anyhow!("downstream actor has shut down"),
            })?;
        reply_rx.await.map_err(|_| Error::DownstreamCall {
            server: self.name.to_string(),
            source: anyhow::anyhow!("downstream actor dropped the reply channel"),
        })?
    }
}

async fn run_actor(
    name: String,
    transport: BackendTransport,
    mut receiver: mpsc::Receiver<Command>,
    deadline: Duration,
    state: Arc<AtomicU8>,
) {
    while let Some(command) = receiver.recv().await {
        match command {
            Command::Shutdown(reply) => {
                state.store(SHUTTING_DOWN, Ordering::SeqCst);
                transport.shutdown().await;
                state.store(CLOSED, Ordering::SeqCst);
                let _ = reply.send(());
                return;
            }
            other => dispatch(&name, transport.service(), other, deadline).await,
        }
    }
    state.store(CLOSED, Ordering::SeqCst);
}

async fn dispatch(
    name: &str,
    service: &rmcp::service::RunningService<rmcp::RoleClient, ()>,
    command: Command,
    deadline: Duration,
) {
    match command {
        Command::ListTools(reply) => {
            let result = with_deadline(name, deadline, async {
                service
                    .list_tools(Some(PaginatedRequestParam::default()))
                    .await
                    .map(|r| r.tools)
                    .map_err(anyhow::Error::from)
            })
            .await;
            let _ = reply.send(result);
        }
        Command::ListPrompts(reply) => {
            let result = with_deadline(name, deadline, async {
                service
                    .list_prompts(Some(PaginatedRequestParam::default()))
                    .await
                    .map(|r| r.prompts)
                    .map_err(anyhow::Error::from)
            })
            .await;
            let _ = reply.send(result);
        }
        Command::ListResources(reply) => {
            let result = with_deadline(name, deadline, async {
                service
                    .list_resources(Some(PaginatedRequestParam::default()))
                    .await
                    .map(|r| r.resources)
                    .map_err(anyhow::Error::from)
            })
            .await;
            let _ = reply.send(result);
        }
        Command::ListResourceTemplates(reply) => {
            let result = with_deadline(name, deadline, async {
                service
                    .list_resource_templates(Some(PaginatedRequestParam::default()))
                    .await
                    .map(|r| r.resource_templates)
                    .map_err(anyhow::Error::from)
            })
            .await;
            let _ = reply.send(result);
        }
        Command::CallTool(params, reply) => {
            let result = with_deadline(name, deadline, async {
                service.call_tool(params).await.map_err(anyhow::Error::from)
            })
            .await;
            let _ = reply.send(result);
        }
        Command::GetPrompt(params, reply) => {
            let result = with_deadline(name, deadline, async {
                service.get_prompt(params).await.map_err(anyhow::Error::from)
            })
            .await;
            let _ = reply.send(result);
        }
        Command::ReadResource(params, reply) => {
            let result = with_deadline(name, deadline, async {
                service.read_resource(params).await.map_err(anyhow::Error::from)
            })
            .await;
            let _ = reply.send(result);
        }
        Command::Complete(params, reply) => {
            let result = with_deadline(name, deadline, async {
                service.complete(params).await.map_err(anyhow::Error::from)
            })
            .await;
            let _ = reply.send(result);
        }
        Command::Shutdown(_) => unreachable!("handled by caller before dispatch"),
    }
}

async fn with_deadline<T, F>(name: &str, deadline: Duration, fut: F) -> Result<T, Error>
where
    F: std::future::Future<Output = Result<T, anyhow::Error>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => {
            debug!(server = %name, error = %source, "downstream call failed");
            Err(Error::DownstreamCall {
                server: name.to_string(),
                source,
            })
        }
        Err(_) => {
            warn!(server = %name, deadline_secs = deadline.as_secs(), "downstream call timed out");
            Err(Error::DownstreamCall {
                server: name.to_string(),
                source: anyhow::anyhow!("call exceeded {:?} deadline", deadline),
            })
        }
    }
}
