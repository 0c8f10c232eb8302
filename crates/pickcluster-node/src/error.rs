//! Node error types.

use pickcluster_network::NetworkError;
use thiserror::Error;

/// Node errors.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// The node task is no longer running.
    #[error("Node stopped")]
    Stopped,
}

/// Result type for node operations.
pub type NodeResult<T> = Result<T, NodeError>;
