//! Shared data model for the MCPM aggregation core.
//!
//! Every downstream crate (`mcpm-catalog`, `mcpm-telemetry`, `mcpm-hub`,
//! `mcpm-tunnel`, `mcpm-cli`) builds on the types defined here instead of
//! inventing its own.

mod error;
mod model;
mod time_window;

pub use error::Error;
pub use model::{
    CapabilityKind, CapabilityRecord, Event, EventType, ProfileMetadata, RemoteServer, RunAction,
    ServerConfig, Session, SessionSource, StdioServer, Transport,
};
pub use time_window::parse_time_window;
