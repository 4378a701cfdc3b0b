use vigil_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    /// The node exists but does not hold a presence record.
    #[error("{path} is not a valid presence node: {detail}")]
    Validation { path: String, detail: String },

    /// Another pinger already holds the path.
    #[error("{path} is already held by a live pinger")]
    AlreadyPinging { path: String },

    /// The node kept changing underneath a start attempt.
    #[error("{path} changed concurrently while starting a pinger")]
    Contended { path: String },

    /// Another writer replaced the record this pinger was keeping.
    #[error("{path} was taken over by another writer")]
    Superseded { path: String },

    #[error("ping period must be at least one millisecond")]
    InvalidPeriod,

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl PresenceError {
    /// True for errors caused by misuse of the protocol rather than by the
    /// store or by foreign data.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::AlreadyPinging { .. } | Self::Contended { .. } | Self::InvalidPeriod
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_message_format() {
        let err = PresenceError::Validation {
            path: "/presence".into(),
            detail: "expected value at line 1 column 1".into(),
        };
        assert_eq!(
            err.to_string(),
            "/presence is not a valid presence node: expected value at line 1 column 1"
        );
    }

    #[test]
    fn usage_classification() {
        assert!(PresenceError::InvalidPeriod.is_usage_error());
        assert!(PresenceError::AlreadyPinging { path: "/p".into() }.is_usage_error());
        assert!(!PresenceError::Store(StoreError::ConnectionLoss).is_usage_error());
        assert!(!PresenceError::Superseded { path: "/p".into() }.is_usage_error());
    }
}
