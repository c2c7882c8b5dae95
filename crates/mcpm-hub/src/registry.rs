use std::collections::BTreeMap;

use mcpm_core::{CapabilityKind, CapabilityRecord};
use serde_json::Value;

/// How the registry resolves a name collision between two downstream
/// servers exposing the same capability id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionPolicy {
    /// Refuse to start; the error names both colliding downstream servers.
    Strict,
    /// Keep the first-registered server's bare id; rewrite every later one.
    Auto,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(
        "capability collision on {kind:?} '{exposed_id}': already registered by '{first}', also claimed by '{second}'"
    )]
    Collision {
        kind: CapabilityKind,
        exposed_id: String,
        first: String,
        second: String,
    },
}

/// The union of capabilities exposed by every healthy downstream
/// connection. Registration order is fixed by the caller (lexicographic
/// by downstream server name, per DESIGN.md), so the first server to claim
/// a bare id always keeps it.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    tools: BTreeMap<String, CapabilityRecord>,
    prompts: BTreeMap<String, CapabilityRecord>,
    resources: BTreeMap<String, CapabilityRecord>,
    resource_templates: BTreeMap<String, CapabilityRecord>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, kind: CapabilityKind) -> &BTreeMap<String, CapabilityRecord> {
        match kind {
            CapabilityKind::Tool => &self.tools,
            CapabilityKind::Prompt => &self.prompts,
            CapabilityKind::Resource => &self.resources,
            CapabilityKind::ResourceTemplate => &self.resource_templates,
        }
    }

    fn map_mut(&mut self, kind: CapabilityKind) -> &mut BTreeMap<String, CapabilityRecord> {
        match kind {
            CapabilityKind::Tool => &mut self.tools,
            CapabilityKind::Prompt => &mut self.prompts,
            CapabilityKind::Resource => &mut self.resources,
            CapabilityKind::ResourceTemplate => &mut self.resource_templates,
        }
    }

    /// Registers one capability from one downstream server, applying the
    /// collision policy if the bare id is already taken. Returns the id the
    /// capability is actually exposed under.
    pub fn register(
        &mut self,
        policy: CollisionPolicy,
        kind: CapabilityKind,
        downstream_server_name: &str,
        original_id: &str,
        descriptor: Value,
    ) -> Result<String, RegistryError> {
        if !self.map(kind).contains_key(original_id) {
            let exposed_id = original_id.to_string();
            self.map_mut(kind).insert(
                exposed_id.clone(),
                CapabilityRecord {
                    kind,
                    exposed_id: exposed_id.clone(),
                    downstream_server_name: downstream_server_name.to_string(),
                    original_id: original_id.to_string(),
                    descriptor,
                },
            );
            return Ok(exposed_id);
        }

        match policy {
            CollisionPolicy::Strict => {
                let first = self.map(kind)[original_id].downstream_server_name.clone();
                Err(RegistryError::Collision {
                    kind,
                    exposed_id: original_id.to_string(),
                    first,
                    second: downstream_server_name.to_string(),
                })
            }
            CollisionPolicy::Auto => {
                let exposed_id = rewrite_id(kind, downstream_server_name, original_id);
                self.map_mut(kind).insert(
                    exposed_id.clone(),
                    CapabilityRecord {
                        kind,
                        exposed_id: exposed_id.clone(),
                        downstream_server_name: downstream_server_name.to_string(),
                        original_id: original_id.to_string(),
                        descriptor,
                    },
                );
                Ok(exposed_id)
            }
        }
    }

    /// Drops every record registered by `downstream_server_name`, across all
    /// four kinds, in one pass.
    pub fn remove_downstream(&mut self, downstream_server_name: &str) {
        for map in [
            &mut self.tools,
            &mut self.prompts,
            &mut self.resources,
            &mut self.resource_templates,
        ] {
            map.retain(|_, record| record.downstream_server_name != downstream_server_name);
        }
    }

    pub fn lookup(&self, kind: CapabilityKind, exposed_id: &str) -> Option<&CapabilityRecord> {
        self.map(kind).get(exposed_id)
    }

    pub fn list(&self, kind: CapabilityKind) -> impl Iterator<Item = &CapabilityRecord> {
        self.map(kind).values()
    }

    pub fn len(&self, kind: CapabilityKind) -> usize {
        self.map(kind).len()
    }

    pub fn is_empty(&self, kind: CapabilityKind) -> bool {
        self.map(kind).is_empty()
    }
}

/// Rewrites a colliding capability id: tools/prompts get a
/// kind-specific separator between the owning server and the original id;
/// resources get their URI host prefixed with `<server>:`; resource
/// templates get the whole template prefixed with `<server>:`.
fn rewrite_id(kind: CapabilityKind, downstream_server_name: &str, original_id: &str) -> String {
    match kind {
        CapabilityKind::Tool | CapabilityKind::Prompt => {
            let sep = kind.collision_separator().expect("tool/prompt has a separator");
            format!("{downstream_server_name}{sep}{original_id}")
        }
        CapabilityKind::Resource => rewrite_resource_uri(downstream_server_name, original_id),
        CapabilityKind::ResourceTemplate => format!("{downstream_server_name}:{original_id}"),
    }
}

/// Replaces the host component of a URI with `<server>:<host>`, e.g.
/// `file:///a/b` registered again by server `y` becomes `file://y:/a/b`.
/// Strings with no `://` (not a real URI) fall back to a flat prefix.
fn rewrite_resource_uri(downstream_server_name: &str, uri: &str) -> String {
    match uri.find("://") {
        Some(idx) => {
            let scheme = &uri[..idx];
            let rest = &uri[idx + 3..];
            let host_end = rest.find('/').unwrap_or(rest.len());
            let (host, tail) = rest.split_at(host_end);
            format!("{scheme}://{downstream_server_name}:{host}{tail}")
        }
        None => format!("{downstream_server_name}:{uri}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_registration_keeps_bare_id() {
        let mut registry = CapabilityRegistry::new();
        let exposed = registry
            .register(CollisionPolicy::Auto, CapabilityKind::Tool, "a", "search", Value::Null)
            .unwrap();
        assert_eq!(exposed, "search");
        assert_eq!(
            registry.lookup(CapabilityKind::Tool, "search").unwrap().downstream_server_name,
            "a"
        );
    }

    #[test]
    fn auto_policy_rewrites_later_registration() {
        let mut registry = CapabilityRegistry::new();
        registry
            .register(CollisionPolicy::Auto, CapabilityKind::Tool, "a", "search", Value::Null)
            .unwrap();
        let exposed = registry
            .register(CollisionPolicy::Auto, CapabilityKind::Tool, "b", "search", Value::Null)
            .unwrap();
        assert_eq!(exposed, "b_t_search");
        assert_eq!(registry.lookup(CapabilityKind::Tool, "search").unwrap().downstream_server_name, "a");
        assert_eq!(
            registry.lookup(CapabilityKind::Tool, "b_t_search").unwrap().downstream_server_name,
            "b"
        );
    }

    #[test]
    fn strict_policy_rejects_second_registration() {
        let mut registry = CapabilityRegistry::new();
        registry
            .register(CollisionPolicy::Strict, CapabilityKind::Prompt, "a", "summarize", Value::Null)
            .unwrap();
        let err = registry
            .register(CollisionPolicy::Strict, CapabilityKind::Prompt, "b", "summarize", Value::Null)
            .unwrap_err();
        match err {
            RegistryError::Collision { first, second, .. } => {
                assert_eq!(first, "a");
                assert_eq!(second, "b");
            }
        }
    }

    #[test]
    fn resource_collision_rewrites_uri_host() {
        let mut registry = CapabilityRegistry::new();
        registry
            .register(
                CollisionPolicy::Auto,
                CapabilityKind::Resource,
                "x",
                "file:///a/b",
                Value::Null,
            )
            .unwrap();
        let exposed = registry
            .register(
                CollisionPolicy::Auto,
                CapabilityKind::Resource,
                "y",
                "file:///a/b",
                Value::Null,
            )
            .unwrap();
        assert_eq!(exposed, "file://y:/a/b");
    }

    #[test]
    fn resource_template_collision_prefixes_whole_template() {
        let mut registry = CapabilityRegistry::new();
        registry
            .register(
                CollisionPolicy::Auto,
                CapabilityKind::ResourceTemplate,
                "x",
                "notes://{id}",
                Value::Null,
            )
            .unwrap();
        let exposed = registry
            .register(
                CollisionPolicy::Auto,
                CapabilityKind::ResourceTemplate,
                "y",
                "notes://{id}",
                Value::Null,
            )
            .unwrap();
        assert_eq!(exposed, "y:notes://{id}");
    }

    #[test]
    fn remove_downstream_drops_all_kinds_in_one_pass() {
        let mut registry = CapabilityRegistry::new();
        registry
            .register(CollisionPolicy::Auto, CapabilityKind::Tool, "a", "search", Value::Null)
            .unwrap();
        registry
            .register(CollisionPolicy::Auto, CapabilityKind::Resource, "a", "file:///x", Value::Null)
            .unwrap();
        registry
            .register(CollisionPolicy::Auto, CapabilityKind::Tool, "b", "other", Value::Null)
            .unwrap();

        registry.remove_downstream("a");

        assert!(registry.is_empty(CapabilityKind::Resource));
        assert_eq!(registry.len(CapabilityKind::Tool), 1);
        assert!(registry.lookup(CapabilityKind::Tool, "other").is_some());
    }
}
