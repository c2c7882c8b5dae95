use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("opening telemetry database at {path}")]
    Open {
        path: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("running telemetry migrations")]
    Migrate(#[source] sqlx::Error),

    #[error("telemetry query failed")]
    Query(#[source] sqlx::Error),

    #[error("telemetry writer task is no longer running")]
    WriterGone,

    #[error(transparent)]
    Validation(#[from] mcpm_core::Error),
}

impl From<TelemetryError> for mcpm_core::Error {
    fn from(err: TelemetryError) -> Self {
        mcpm_core::Error::Telemetry(anyhow::anyhow!(err))
    }
}
