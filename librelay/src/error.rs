//! Error types for the relay job

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayError>;

/// Result of a single remote capability call, before retry policy is applied
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Remote call '{operation}' failed: {source}")]
    Remote {
        operation: String,
        #[source]
        source: RemoteError,
    },

    #[error("Rate limited, aborting run: {0}")]
    QuotaAbort(String),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Publish failed on every surface: {0}")]
    Publish(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl RelayError {
    /// Returns the process exit code for this error
    ///
    /// Only setup problems are non-zero. Every stop inside the pipeline leaves
    /// state untouched and is reported through logs alone.
    pub fn exit_code(&self) -> i32 {
        match self {
            RelayError::Config(_) => 2,
            RelayError::InvalidInput(_) => 3,
            RelayError::State(_)
            | RelayError::Remote { .. }
            | RelayError::QuotaAbort(_)
            | RelayError::Media(_)
            | RelayError::Publish(_) => 0,
        }
    }

    /// True when the run stopped because the rate-limit policy said to give up
    pub fn is_quota_abort(&self) -> bool {
        matches!(self, RelayError::QuotaAbort(_))
    }

    pub(crate) fn remote(operation: &str, source: RemoteError) -> Self {
        RelayError::Remote {
            operation: operation.to_string(),
            source,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum StateError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Failure classes of a remote call
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    /// Quota exhausted (HTTP 429 or an explicit quota signal)
    #[error("Rate limit exceeded: {diagnostics}")]
    RateLimited {
        /// Unix timestamp at which the quota window resets, if the remote said so
        reset_at: Option<i64>,
        diagnostics: String,
    },

    /// Transient transport failure
    #[error("Network error: {0}")]
    Network(String),

    /// Authentication failure, malformed request, or anything else not worth retrying
    #[error("Fatal error: {0}")]
    Fatal(String),
}

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Post {0} has no resolvable media URL")]
    MissingUrl(String),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Image conversion failed: {0}")]
    Conversion(String),

    #[error("Upload failed after all fallbacks: {0}")]
    Upload(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
