use thiserror::Error;

/// Error taxonomy shared across the core.
///
/// Crate-specific error enums (`mcpm_catalog::CatalogError`,
/// `mcpm_telemetry::TelemetryError`, ...) convert into this one at crate
/// boundaries so callers outside the core see one coherent shape.
#[derive(Debug, Error)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("downstream server '{server}' failed to start: {source}")]
    DownstreamStartup {
        server: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("downstream call to '{server}' failed: {source}")]
    DownstreamCall {
        server: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("authentication failed")]
    Auth,

    #[error("catalog write failed: {0}")]
    CatalogWrite(#[source] anyhow::Error),

    #[error("telemetry store failed: {0}")]
    Telemetry(#[source] anyhow::Error),

    #[error("tunnel failed: {0}")]
    Tunnel(#[source] anyhow::Error),
}

impl Error {
    /// Exit code for the CLI wrapper.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Validation(_) => 2,
            _ => 1,
        }
    }
}
