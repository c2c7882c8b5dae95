use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A server as declared in the global catalog.
///
/// The discriminator between the two transports is structural — presence of
/// `command` (stdio) vs `url` (remote) — rather than an explicit `type` tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ServerConfig {
    Stdio(StdioServer),
    Remote(RemoteServer),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StdioServer {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub profile_tags: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteServer {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub profile_tags: BTreeSet<String>,
}

impl ServerConfig {
    pub fn name(&self) -> &str {
        match self {
            ServerConfig::Stdio(s) => &s.name,
            ServerConfig::Remote(r) => &r.name,
        }
    }

    pub fn profile_tags(&self) -> &BTreeSet<String> {
        match self {
            ServerConfig::Stdio(s) => &s.profile_tags,
            ServerConfig::Remote(r) => &r.profile_tags,
        }
    }

    pub fn profile_tags_mut(&mut self) -> &mut BTreeSet<String> {
        match self {
            ServerConfig::Stdio(s) => &mut s.profile_tags,
            ServerConfig::Remote(r) => &mut r.profile_tags,
        }
    }

    pub fn has_profile_tag(&self, tag: &str) -> bool {
        self.profile_tags().contains(tag)
    }

    pub fn is_stdio(&self) -> bool {
        matches!(self, ServerConfig::Stdio(_))
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, ServerConfig::Remote(_))
    }

    /// Validates the name invariant: non-empty, trimmed.
    pub fn validate_name(name: &str) -> Result<(), crate::Error> {
        if name.trim().is_empty() || name.trim() != name {
            return Err(crate::Error::Validation(format!(
                "server name must be a non-empty, trimmed string, got {name:?}"
            )));
        }
        Ok(())
    }
}

/// Profile metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileMetadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ProfileMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            api_key: None,
            description: None,
        }
    }

    /// Replace the profile's bearer token with a freshly generated one.
    pub fn regenerate_api_key(&mut self) -> &str {
        self.api_key = Some(uuid::Uuid::new_v4().simple().to_string());
        self.api_key.as_deref().expect("just set")
    }
}

/// One of the four MCP capability kinds an aggregator can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Tool,
    Prompt,
    Resource,
    ResourceTemplate,
}

impl CapabilityKind {
    /// Kind-specific collision separator used by the auto rewrite policy;
    /// resources/templates rewrite the URI host instead of using a
    /// separator, so this only applies to tools/prompts.
    pub fn collision_separator(self) -> Option<&'static str> {
        match self {
            CapabilityKind::Tool => Some("_t_"),
            CapabilityKind::Prompt => Some("_p_"),
            CapabilityKind::Resource | CapabilityKind::ResourceTemplate => None,
        }
    }
}

/// A capability exposed by the aggregator, mapping back to its downstream
/// origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityRecord {
    pub kind: CapabilityKind,
    pub exposed_id: String,
    pub downstream_server_name: String,
    pub original_id: String,
    pub descriptor: Value,
}

/// In-memory session record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub action: RunAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_name: Option<String>,
    /// The single downstream server this session was started for, known
    /// only for `run`/`run_http` (one configured server); absent for
    /// `profile_run`/`proxy` sessions that span more than one downstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    pub transport: Transport,
    pub source: SessionSource,
    pub started_at: DateTime<Utc>,
    pub client_info: Value,
    pub server_info: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunAction {
    Run,
    RunHttp,
    ProfileRun,
    Proxy,
}

impl RunAction {
    /// Only these actions count toward `total_runs`.
    pub fn counts_as_run(self) -> bool {
        matches!(
            self,
            RunAction::Run | RunAction::RunHttp | RunAction::ProfileRun
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Stdio,
    Http,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionSource {
    Local,
    LocalNetwork,
    PublicInternet,
    LocalStdio,
    Unknown,
}

/// Persistent, append-only telemetry event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub session_id: String,
    pub event_type: EventType,
    pub server_name: String,
    pub resource_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "SESSION_START")]
    SessionStart,
    #[serde(rename = "SESSION_END")]
    SessionEnd,
    #[serde(rename = "TOOL_INVOCATION")]
    ToolInvocation,
    #[serde(rename = "RESOURCE_ACCESS")]
    ResourceAccess,
    #[serde(rename = "PROMPT_EXECUTION")]
    PromptExecution,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::SessionStart => "SESSION_START",
            EventType::SessionEnd => "SESSION_END",
            EventType::ToolInvocation => "TOOL_INVOCATION",
            EventType::ResourceAccess => "RESOURCE_ACCESS",
            EventType::PromptExecution => "PROMPT_EXECUTION",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "SESSION_START" => Some(EventType::SessionStart),
            "SESSION_END" => Some(EventType::SessionEnd),
            "TOOL_INVOCATION" => Some(EventType::ToolInvocation),
            "RESOURCE_ACCESS" => Some(EventType::ResourceAccess),
            "PROMPT_EXECUTION" => Some(EventType::PromptExecution),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_discriminates_on_command_vs_url() {
        let stdio: ServerConfig =
            serde_json::from_str(r#"{"name":"fs","command":"npx","args":[]}"#).unwrap();
        assert!(stdio.is_stdio());

        let remote: ServerConfig =
            serde_json::from_str(r#"{"name":"remote","url":"https://example.com/mcp"}"#).unwrap();
        assert!(remote.is_remote());
    }

    #[test]
    fn validate_name_rejects_blank_and_untrimmed() {
        assert!(ServerConfig::validate_name("  foo").is_err());
        assert!(ServerConfig::validate_name("").is_err());
        assert!(ServerConfig::validate_name("foo").is_ok());
    }

    #[test]
    fn run_action_counts_as_run_matches_spec() {
        assert!(RunAction::Run.counts_as_run());
        assert!(RunAction::RunHttp.counts_as_run());
        assert!(RunAction::ProfileRun.counts_as_run());
        assert!(!RunAction::Proxy.counts_as_run());
    }

    #[test]
    fn event_type_round_trips_through_wire_strings() {
        for (ty, s) in [
            (EventType::SessionStart, "SESSION_START"),
            (EventType::SessionEnd, "SESSION_END"),
            (EventType::ToolInvocation, "TOOL_INVOCATION"),
            (EventType::ResourceAccess, "RESOURCE_ACCESS"),
            (EventType::PromptExecution, "PROMPT_EXECUTION"),
        ] {
            assert_eq!(ty.as_str(), s);
            assert_eq!(EventType::from_str(s), Some(ty));
        }
    }
}
