/// Errors returned by coordination store operations.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("no node at {0}")]
    NoNode(String),

    #[error("node already exists at {0}")]
    NodeExists(String),

    #[error("version mismatch at {path}: expected {expected}, found {actual}")]
    BadVersion {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("connection lost")]
    ConnectionLoss,

    #[error("session expired")]
    SessionExpired,

    #[error("connection closed")]
    Closed,

    #[error("database error: {0}")]
    Database(String),
}

impl StoreError {
    /// True when the error means the calling connection can no longer talk
    /// to the store, as opposed to a problem with the node itself.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLoss | Self::SessionExpired | Self::Closed
        )
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NoNode(_) => "no_node",
            Self::NodeExists(_) => "node_exists",
            Self::BadVersion { .. } => "bad_version",
            Self::InvalidPath { .. } => "invalid_path",
            Self::ConnectionLoss => "connection_loss",
            Self::SessionExpired => "session_expired",
            Self::Closed => "closed",
            Self::Database(_) => "database",
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_error_classification() {
        assert!(StoreError::ConnectionLoss.is_connection_error());
        assert!(StoreError::SessionExpired.is_connection_error());
        assert!(StoreError::Closed.is_connection_error());
        assert!(!StoreError::NoNode("/a".into()).is_connection_error());
        assert!(!StoreError::NodeExists("/a".into()).is_connection_error());
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(StoreError::ConnectionLoss.error_kind(), "connection_loss");
        assert_eq!(StoreError::NoNode("/x".into()).error_kind(), "no_node");
        assert_eq!(
            StoreError::BadVersion {
                path: "/x".into(),
                expected: 1,
                actual: 2
            }
            .error_kind(),
            "bad_version"
        );
    }

    #[test]
    fn display_includes_path() {
        let err = StoreError::NodeExists("/agents/0".into());
        assert_eq!(err.to_string(), "node already exists at /agents/0");
    }
}
