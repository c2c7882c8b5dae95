use thiserror::Error;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("connecting to share host {addr}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tunnel protocol error: {0}")]
    Protocol(String),

    #[error("tunnel control connection closed by remote host")]
    ControlClosed,

    #[error("bridging to local port {port}")]
    LocalBridge {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<TunnelError> for mcpm_core::Error {
    fn from(err: TunnelError) -> Self {
        mcpm_core::Error::Tunnel(anyhow::anyhow!(err))
    }
}
