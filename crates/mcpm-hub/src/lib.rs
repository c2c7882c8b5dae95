//! The MCP aggregation proxy core: connects to every configured
//! downstream, exposes one upstream MCP server that multiplexes their
//! capabilities, and wraps every request in the session/auth/telemetry
//! middleware chain.

mod app;
mod config;
mod downstream;
mod middleware;
mod registry;
mod router;
mod serve;
mod transport;

pub use app::App;
pub use config::{AggregatorConfig, AuthConfig};
pub use downstream::{ConnectionState, DownstreamHandle};
pub use middleware::{classify_source, extract_bearer_token, new_session_id};
pub use registry::{CapabilityRegistry, CollisionPolicy, RegistryError};
pub use router::AggregatingRouter;
pub use serve::{serve_stdio, source_from_addr, HttpEndpoint};
