use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("could not determine a config directory for mcpm")]
    NoConfigDir,

    #[error("server {0:?} is already in the catalog")]
    ServerExists(String),

    #[error("no server named {0:?} in the catalog")]
    ServerNotFound(String),

    #[error("no profile named {0:?} in the catalog")]
    ProfileNotFound(String),

    #[error(transparent)]
    Validation(#[from] mcpm_core::Error),

    #[error("reading {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("writing {path}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing {path}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl From<CatalogError> for mcpm_core::Error {
    fn from(err: CatalogError) -> Self {
        mcpm_core::Error::CatalogWrite(anyhow::anyhow!(err))
    }
}
