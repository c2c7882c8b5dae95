use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mcpm_core::CapabilityKind;
use rmcp::model::{
    CallToolRequestParam, CallToolResult, CompleteRequestParam, CompleteResult, GetPromptRequestParam,
    GetPromptResult, ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult, ListToolsResult,
    PaginatedRequestParam, Prompt, ReadResourceRequestParam, ReadResourceResult, Reference, Resource,
    ResourceTemplate, ServerCapabilities, ServerInfo, Tool,
};
use rmcp::service::RequestContext;
use rmcp::{ErrorData as McpError, RoleServer, ServerHandler};
use tokio::time::timeout;

use crate::downstream::DownstreamHandle;
use crate::registry::CapabilityRegistry;

/// The single upstream MCP server presented to clients.
/// Capabilities are unioned from every registered downstream and every
/// request is resolved through the [`CapabilityRegistry`] before being
/// forwarded to the owning [`DownstreamHandle`]. Built once per aggregator
/// run; profile membership is frozen at construction.
#[derive(Clone)]
pub struct AggregatingRouter {
    registry: Arc<CapabilityRegistry>,
    downstreams: Arc<HashMap<String, DownstreamHandle>>,
    request_timeout: Duration,
}

impl AggregatingRouter {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        downstreams: Arc<HashMap<String, DownstreamHandle>>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            downstreams,
            request_timeout,
        }
    }

    pub fn owning_downstream_for_tool(&self, exposed_id: &str) -> Option<String> {
        self.registry
            .lookup(CapabilityKind::Tool, exposed_id)
            .map(|r| r.downstream_server_name.clone())
    }

    pub fn owning_downstream_for_prompt(&self, exposed_id: &str) -> Option<String> {
        self.registry
            .lookup(CapabilityKind::Prompt, exposed_id)
            .map(|r| r.downstream_server_name.clone())
    }

    pub fn owning_downstream_for_resource(&self, exposed_id: &str) -> Option<String> {
        self.registry
            .lookup(CapabilityKind::Resource, exposed_id)
            .map(|r| r.downstream_server_name.clone())
    }

    fn resolve(&self, kind: CapabilityKind, exposed_id: &str) -> Result<(&DownstreamHandle, String), McpError> {
        let record = self
            .registry
            .lookup(kind, exposed_id)
            .ok_or_else(|| McpError::invalid_params(format!("unknown {kind:?} '{exposed_id}'"), None))?;
        let downstream = self.downstreams.get(&record.downstream_server_name).ok_or_else(|| {
            McpError::internal_error(
                format!("downstream '{}' is no longer connected", record.downstream_server_name),
                None,
            )
        })?;
        Ok((downstream, record.original_id.clone()))
    }

    async fn with_timeout<T>(&self, fut: impl std::future::Future<Output = Result<T, mcpm_core::Error>>) -> Result<T, McpError> {
        match timeout(self.request_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(McpError::internal_error(source.to_string(), None)),
            Err(_) => Err(McpError::internal_error(
                format!("request exceeded {}s timeout", self.request_timeout.as_secs()),
                None,
            )),
        }
    }

    async fn list_tools_impl(&self) -> Result<ListToolsResult, McpError> {
        let tools: Vec<Tool> = self
            .registry
            .list(CapabilityKind::Tool)
            .filter_map(|record| {
                let mut tool: Tool = serde_json::from_value(record.descriptor.clone()).ok()?;
                tool.name = record.exposed_id.clone().into();
                Some(tool)
            })
            .collect();
        Ok(ListToolsResult::with_all_items(tools))
    }

    async fn list_prompts_impl(&self) -> Result<ListPromptsResult, McpError> {
        let prompts: Vec<Prompt> = self
            .registry
            .list(CapabilityKind::Prompt)
            .filter_map(|record| {
                let mut prompt: Prompt = serde_json::from_value(record.descriptor.clone()).ok()?;
                prompt.name = record.exposed_id.clone();
                Some(prompt)
            })
            .collect();
        Ok(ListPromptsResult::with_all_items(prompts))
    }

    async fn list_resources_impl(&self) -> Result<ListResourcesResult, McpError> {
        let resources: Vec<Resource> = self
            .registry
            .list(CapabilityKind::Resource)
            .filter_map(|record| {
                let mut resource: Resource = serde_json::from_value(record.descriptor.clone()).ok()?;
                resource.uri = record.exposed_id.clone();
                Some(resource)
            })
            .collect();
        Ok(ListResourcesResult::with_all_items(resources))
    }

    async fn list_resource_templates_impl(&self) -> Result<ListResourceTemplatesResult, McpError> {
        let templates: Vec<ResourceTemplate> = self
            .registry
            .list(CapabilityKind::ResourceTemplate)
            .filter_map(|record| {
                let mut template: ResourceTemplate = serde_json::from_value(record.descriptor.clone()).ok()?;
                template.uri_template = record.exposed_id.clone();
                Some(template)
            })
            .collect();
        Ok(ListResourceTemplatesResult::with_all_items(templates))
    }
}

impl ServerHandler for AggregatingRouter {
    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        self.list_tools_impl().await
    }

    async fn list_prompts(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListPromptsResult, McpError> {
        self.list_prompts_impl().await
    }

    async fn list_resources(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, McpError> {
        self.list_resources_impl().await
    }

    async fn list_resource_templates(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourceTemplatesResult, McpError> {
        self.list_resource_templates_impl().await
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let (downstream, original_id) = self.resolve(CapabilityKind::Tool, request.name.as_ref())?;
        let downstream = downstream.clone();
        let forwarded = CallToolRequestParam {
            name: original_id.into(),
            arguments: request.arguments,
        };
        self.with_timeout(async move { downstream.call_tool(forwarded).await }).await
    }

    async fn get_prompt(
        &self,
        request: GetPromptRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<GetPromptResult, McpError> {
        let (downstream, original_id) = self.resolve(CapabilityKind::Prompt, &request.name)?;
        let downstream = downstream.clone();
        let forwarded = GetPromptRequestParam {
            name: original_id,
            arguments: request.arguments,
        };
        self.with_timeout(async move { downstream.get_prompt(forwarded).await }).await
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, McpError> {
        let (downstream, original_id) = self.resolve(CapabilityKind::Resource, &request.uri)?;
        let downstream = downstream.clone();
        let forwarded = ReadResourceRequestParam { uri: original_id };
        self.with_timeout(async move { downstream.read_resource(forwarded).await }).await
    }

    async fn complete(
        &self,
        request: CompleteRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CompleteResult, McpError> {
        let (kind, exposed_id) = match &request.r#ref {
            Reference::Prompt(prompt_ref) => (CapabilityKind::Prompt, prompt_ref.name.clone()),
            Reference::Resource(resource_ref) => (CapabilityKind::Resource, resource_ref.uri.clone()),
        };
        let (downstream, original_id) = self.resolve(kind, &exposed_id)?;
        let downstream = downstream.clone();
        let mut forwarded = request;
        match &mut forwarded.r#ref {
            Reference::Prompt(prompt_ref) => prompt_ref.name = original_id,
            Reference::Resource(resource_ref) => resource_ref.uri = original_id,
        }
        self.with_timeout(async move { downstream.complete(forwarded).await }).await
    }

    fn get_info(&self) -> ServerInfo {
        let mut info = ServerInfo::default();
        info.server_info.name = "mcpm".to_string();
        info.server_info.version = env!("CARGO_PKG_VERSION").to_string();

        let mut builder = ServerCapabilities::builder();
        if !self.registry.is_empty(CapabilityKind::Tool) {
            builder = builder.enable_tools();
        }
        if !self.registry.is_empty(CapabilityKind::Prompt) {
            builder = builder.enable_prompts();
        }
        if !self.registry.is_empty(CapabilityKind::Resource) || !self.registry.is_empty(CapabilityKind::ResourceTemplate) {
            builder = builder.enable_resources();
        }
        info.capabilities = builder.build();
        info
    }
}
