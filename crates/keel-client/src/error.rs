//! Error types for the keel client.

use thiserror::Error;

/// Result type alias for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced across the public client boundary.
///
/// Absence (a missing key, a failed compare-and-swap) is never an error;
/// it is reported as `None` or `false` by the operation itself.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No cluster member could service the request, even after a refresh.
    #[error("all cluster nodes are down")]
    AllNodesDown,

    /// The request was rejected before it reached the network.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The initial connect found no responsive seed.
    #[error("failed to connect to cluster via seeds {seeds:?}: {source}")]
    Connection {
        seeds: Vec<String>,
        #[source]
        source: Box<ClientError>,
    },
}

impl ClientError {
    /// Wrap a discovery failure with the seeds that were tried.
    pub fn connection(seeds: &[String], source: ClientError) -> Self {
        ClientError::Connection {
            seeds: seeds.to_vec(),
            source: Box::new(source),
        }
    }

    /// Whether this error means the cluster is currently unreachable.
    pub fn is_unavailable(&self) -> bool {
        match self {
            ClientError::AllNodesDown => true,
            ClientError::InvalidRequest(_) => false,
            ClientError::Connection { source, .. } => source.is_unavailable(),
        }
    }
}

/// Result type alias for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration loading errors. These happen before any cluster is
/// contacted, so they are separate from [`ClientError`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Network-level failures reported by a [`Transport`](crate::Transport).
///
/// Transient failures never leave the crate through
/// [`Client`](crate::Client): the failover router either recovers from
/// them or escalates to [`ClientError::AllNodesDown`]. An
/// [`InvalidRequest`](TransportError::InvalidRequest) is returned to the
/// caller as [`ClientError::InvalidRequest`] without any failover.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request timed out")]
    Timeout,

    #[error("i/o error: {0}")]
    Io(String),

    /// The request could not be built (bad URL or header). Nothing was
    /// sent, so this says nothing about the cluster.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl TransportError {
    /// Whether the failure may be cured by talking to another node.
    pub fn is_transient(&self) -> bool {
        !matches!(self, TransportError::InvalidRequest(_))
    }
}
