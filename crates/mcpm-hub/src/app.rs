use std::collections::HashMap;
use std::sync::Arc;

use mcpm_core::{CapabilityKind, Error, ServerConfig};
use mcpm_telemetry::TelemetryStore;
use serde_json::to_value;
use tracing::{info, warn};

use crate::config::AggregatorConfig;
use crate::downstream::DownstreamHandle;
use crate::registry::{CapabilityRegistry, RegistryError};
use crate::router::AggregatingRouter;

/// The assembled aggregator: every healthy downstream connection, the
/// capability registry built from them, and the router that serves
/// upstream requests.
pub struct App {
    pub config: AggregatorConfig,
    pub router: AggregatingRouter,
    pub downstreams: Arc<HashMap<String, DownstreamHandle>>,
    pub telemetry: Arc<TelemetryStore>,
}

impl App {
    /// Connects to every configured server in lexicographic order by name,
    /// registering capabilities as each one comes up. A downstream that
    /// fails to start is logged and dropped; the rest of the aggregator
    /// proceeds.
    pub async fn build(
        mut servers: Vec<ServerConfig>,
        config: AggregatorConfig,
        telemetry: Arc<TelemetryStore>,
    ) -> Result<Self, Error> {
        servers.sort_by(|a, b| a.name().cmp(b.name()));

        let mut registry = CapabilityRegistry::new();
        let mut downstreams = HashMap::new();

        for server in &servers {
            let name = server.name().to_string();
            let handle = match DownstreamHandle::start(server, Some(config.request_timeout)).await {
                Ok(handle) => handle,
                Err(error) => {
                    warn!(server = %name, error = %error, "dropping downstream that failed to start");
                    continue;
                }
            };

            match register_capabilities(&mut registry, &handle, config.collision_policy).await {
                Ok(()) => {}
                Err(RegisterFailure::Collision(error)) => {
                    handle.shutdown().await;
                    for handle in downstreams.into_values() {
                        handle.shutdown().await;
                    }
                    return Err(Error::Validation(error.to_string()));
                }
                Err(RegisterFailure::Downstream(error)) => {
                    warn!(server = %name, error = %error, "dropping downstream after capability registration failure");
                    handle.shutdown().await;
                    continue;
                }
            }

            info!(server = %name, "downstream connected");
            downstreams.insert(name, handle);
        }

        let registry = Arc::new(registry);
        let downstreams = Arc::new(downstreams);
        let router = AggregatingRouter::new(registry, downstreams.clone(), config.request_timeout);

        Ok(Self {
            config,
            router,
            downstreams,
            telemetry,
        })
    }

    /// Process shutdown sequence: signal every downstream to
    /// close before the caller drains telemetry and emits `SESSION_END`s.
    pub async fn shutdown_downstreams(&self) {
        for (name, handle) in self.downstreams.iter() {
            info!(server = %name, "shutting down downstream");
            handle.shutdown().await;
        }
    }
}

/// Distinguishes a registry collision under strict policy, which must abort
/// the whole run, from every other failure while querying a downstream,
/// which only drops that one downstream.
enum RegisterFailure {
    Collision(RegistryError),
    Downstream(Error),
}

impl From<Error> for RegisterFailure {
    fn from(error: Error) -> Self {
        RegisterFailure::Downstream(error)
    }
}

async fn register_capabilities(
    registry: &mut CapabilityRegistry,
    handle: &DownstreamHandle,
    policy: crate::registry::CollisionPolicy,
) -> Result<(), RegisterFailure> {
    let declared = handle.declared();
    let name = handle.name();

    if declared.tools {
        for tool in handle.list_tools().await? {
            let descriptor = to_value(&tool).unwrap_or_default();
            register_or_fail(registry, policy, CapabilityKind::Tool, name, tool.name.as_ref(), descriptor)?;
        }
    }
    if declared.prompts {
        for prompt in handle.list_prompts().await? {
            let descriptor = to_value(&prompt).unwrap_or_default();
            register_or_fail(registry, policy, CapabilityKind::Prompt, name, &prompt.name, descriptor)?;
        }
    }
    if declared.resources {
        for resource in handle.list_resources().await? {
            let descriptor = to_value(&resource).unwrap_or_default();
            register_or_fail(registry, policy, CapabilityKind::Resource, name, &resource.uri, descriptor)?;
        }
        for template in handle.list_resource_templates().await? {
            let descriptor = to_value(&template).unwrap_or_default();
            register_or_fail(
                registry,
                policy,
                CapabilityKind::ResourceTemplate,
                name,
                &template.uri_template,
                descriptor,
            )?;
        }
    }
    Ok(())
}

fn register_or_fail(
    registry: &mut CapabilityRegistry,
    policy: crate::registry::CollisionPolicy,
    kind: CapabilityKind,
    downstream_server_name: &str,
    original_id: &str,
    descriptor: serde_json::Value,
) -> Result<(), RegisterFailure> {
    registry
        .register(policy, kind, downstream_server_name, original_id, descriptor)
        .map(|_| ())
        .map_err(RegisterFailure::Collision)
}
