#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("reserved fraction must be strictly between 0 and 1, got {0}")]
    InvalidFraction(f64),

    #[error("unknown enforcement mode '{0}' (expected 'advisory' or 'strict')")]
    InvalidEnforcement(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
