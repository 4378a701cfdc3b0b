use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PresenceError;

/// Version tag written into every record. Records carrying any other value
/// are rejected.
pub const FORMAT_VERSION: u32 = 1;

/// An alive record not rewritten for this many of its own periods is stale.
pub const STALE_AFTER_PERIODS: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Alive,
    Stopped,
}

/// The payload a pinger keeps at its presence path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PresenceRecord {
    presence: u32,
    state: Liveness,
    period_ms: u64,
    at: DateTime<Utc>,
}

impl PresenceRecord {
    /// A fresh "currently pinging" record.
    pub fn alive(period: Duration) -> Self {
        Self::new(Liveness::Alive, period)
    }

    /// A "gracefully stopped" record.
    pub fn stopped(period: Duration) -> Self {
        Self::new(Liveness::Stopped, period)
    }

    fn new(state: Liveness, period: Duration) -> Self {
        Self {
            presence: FORMAT_VERSION,
            state,
            period_ms: u64::try_from(period.as_millis()).unwrap_or(u64::MAX),
            at: Utc::now(),
        }
    }

    pub fn liveness(&self) -> Liveness {
        self.state
    }

    pub fn is_alive(&self) -> bool {
        self.state == Liveness::Alive
    }

    /// Refresh period of the pinger that wrote the record.
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    /// When the record was written.
    pub fn written_at(&self) -> DateTime<Utc> {
        self.at
    }

    /// How long after a write an alive record stays believable.
    pub fn stale_after(&self) -> Duration {
        self.period().saturating_mul(STALE_AFTER_PERIODS)
    }

    /// Whether the record has gone unrefreshed too long as of `now`.
    /// A timestamp ahead of `now` is never stale.
    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        match (now - self.at).to_std() {
            Ok(age) => age > self.stale_after(),
            Err(_) => false,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        // Plain scalar fields; serialization cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Decode a payload read from `path`. Accepts exactly what
    /// [`encode`](Self::encode) produces.
    pub fn decode(path: &str, data: &[u8]) -> Result<Self, PresenceError> {
        let invalid = |detail: String| PresenceError::Validation {
            path: path.to_string(),
            detail,
        };

        let record: Self = serde_json::from_slice(data).map_err(|e| invalid(e.to_string()))?;
        if record.presence != FORMAT_VERSION {
            return Err(invalid(format!(
                "unsupported format version {}",
                record.presence
            )));
        }
        if record.period_ms == 0 {
            return Err(invalid("period_ms must be positive".to_string()));
        }
        if record.encode() != data {
            return Err(invalid("payload is not in canonical form".to_string()));
        }
        Ok(record)
    }
}

/// What a presence path currently holds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeState {
    Absent,
    Alive(PresenceRecord),
    /// An alive record whose pinger stopped refreshing it.
    Stale(PresenceRecord),
    Stopped(PresenceRecord),
    Malformed { detail: String },
}

impl NodeState {
    /// Classify the payload at `path` (`None` when no node exists) against
    /// the current wall clock.
    pub fn classify(path: &str, data: Option<&[u8]>) -> Self {
        Self::classify_at(path, data, Utc::now())
    }

    /// Classify as of `now`.
    pub fn classify_at(path: &str, data: Option<&[u8]>, now: DateTime<Utc>) -> Self {
        let Some(data) = data else {
            return Self::Absent;
        };
        match PresenceRecord::decode(path, data) {
            Ok(record) if !record.is_alive() => Self::Stopped(record),
            Ok(record) if record.is_stale_at(now) => Self::Stale(record),
            Ok(record) => Self::Alive(record),
            Err(PresenceError::Validation { detail, .. }) => Self::Malformed { detail },
            Err(other) => Self::Malformed {
                detail: other.to_string(),
            },
        }
    }

    pub fn is_alive(&self) -> bool {
        matches!(self, Self::Alive(_))
    }

    /// Project onto the liveness boolean. Malformed nodes are an error,
    /// never `false`.
    pub fn liveness(&self, path: &str) -> Result<bool, PresenceError> {
        match self {
            Self::Absent | Self::Stale(_) | Self::Stopped(_) => Ok(false),
            Self::Alive(_) => Ok(true),
            Self::Malformed { detail } => Err(PresenceError::Validation {
                path: path.to_string(),
                detail: detail.clone(),
            }),
        }
    }

    /// The record, if the node holds one.
    pub fn record(&self) -> Option<&PresenceRecord> {
        match self {
            Self::Alive(r) | Self::Stale(r) | Self::Stopped(r) => Some(r),
            _ => None,
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => write!(f, "absent"),
            Self::Alive(r) => write!(
                f,
                "alive (last ping {}, every {}ms)",
                r.written_at().to_rfc3339(),
                r.period().as_millis()
            ),
            Self::Stale(r) => write!(
                f,
                "stale (last ping {}, every {}ms)",
                r.written_at().to_rfc3339(),
                r.period().as_millis()
            ),
            Self::Stopped(r) => write!(f, "stopped (at {})", r.written_at().to_rfc3339()),
            Self::Malformed { detail } => write!(f, "malformed: {detail}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATH: &str = "/presence";

    #[test]
    fn alive_record_decodes_as_alive() {
        let record = PresenceRecord::alive(Duration::from_millis(25));
        let decoded = PresenceRecord::decode(PATH, &record.encode()).unwrap();
        assert_eq!(decoded, record);
        assert!(decoded.is_alive());
        assert_eq!(decoded.period(), Duration::from_millis(25));
    }

    #[test]
    fn stopped_record_is_not_alive() {
        let payload = PresenceRecord::stopped(Duration::from_secs(1)).encode();
        let state = NodeState::classify(PATH, Some(&payload));
        assert!(matches!(state, NodeState::Stopped(_)));
        assert!(!state.liveness(PATH).unwrap());
    }

    #[test]
    fn absent_is_not_alive() {
        let state = NodeState::classify(PATH, None);
        assert_eq!(state, NodeState::Absent);
        assert!(!state.liveness(PATH).unwrap());
        assert!(state.record().is_none());
    }

    #[test]
    fn foreign_payloads_are_malformed() {
        let cases: [&[u8]; 7] = [
            b"roflcopter",
            b"",
            b"\xff\xfe\x00",
            b"{}",
            b"1m0s",
            br#"{"presence":1,"state":"alive","period_ms":25}"#,
            br#"{"presence":1,"state":"dozing","period_ms":25,"at":"2024-01-01T00:00:00Z"}"#,
        ];
        for payload in cases {
            let state = NodeState::classify(PATH, Some(payload));
            assert!(
                matches!(state, NodeState::Malformed { .. }),
                "{:?} classified as {state:?}",
                String::from_utf8_lossy(payload)
            );
            let err = state.liveness(PATH).unwrap_err();
            assert!(
                err.to_string().starts_with("/presence is not a valid presence node: "),
                "got: {err}"
            );
        }
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let payload = br#"{"presence":1,"state":"alive","period_ms":25,"at":"2024-01-01T00:00:00Z","owner":"x"}"#;
        assert!(PresenceRecord::decode(PATH, payload).is_err());
    }

    #[test]
    fn other_format_versions_are_rejected() {
        let payload = br#"{"presence":2,"state":"alive","period_ms":25,"at":"2024-01-01T00:00:00Z"}"#;
        let err = PresenceRecord::decode(PATH, payload).unwrap_err();
        assert!(err.to_string().contains("unsupported format version 2"), "got: {err}");
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let mut payload = PresenceRecord::alive(Duration::from_millis(25)).encode();
        payload.extend_from_slice(b" trailing");
        assert!(PresenceRecord::decode(PATH, &payload).is_err());
    }

    #[test]
    fn display_labels() {
        assert_eq!(NodeState::Absent.to_string(), "absent");
        let malformed = NodeState::Malformed {
            detail: "bad".into(),
        };
        assert_eq!(malformed.to_string(), "malformed: bad");
        let alive = NodeState::Alive(PresenceRecord::alive(Duration::from_millis(40)));
        assert!(alive.to_string().contains("every 40ms"));
    }

    #[test]
    fn alive_record_goes_stale_after_missed_periods() {
        let record = PresenceRecord::alive(Duration::from_millis(100));
        let payload = record.encode();
        let written = record.written_at();

        let fresh = written + chrono::Duration::milliseconds(300);
        assert!(NodeState::classify_at(PATH, Some(&payload), fresh).is_alive());

        let late = written + chrono::Duration::milliseconds(301);
        let state = NodeState::classify_at(PATH, Some(&payload), late);
        assert!(matches!(state, NodeState::Stale(_)), "got {state:?}");
        assert!(!state.liveness(PATH).unwrap());
        assert!(state.record().is_some());
        assert!(state.to_string().starts_with("stale"));

        // A writer clock running ahead never reads as stale.
        let early = written - chrono::Duration::seconds(60);
        assert!(NodeState::classify_at(PATH, Some(&payload), early).is_alive());
    }

    #[test]
    fn stopped_records_never_go_stale() {
        let record = PresenceRecord::stopped(Duration::from_millis(10));
        let later = record.written_at() + chrono::Duration::hours(1);
        let state = NodeState::classify_at(PATH, Some(&record.encode()), later);
        assert!(matches!(state, NodeState::Stopped(_)));
    }

    #[test]
    fn zero_period_is_rejected() {
        let payload = br#"{"presence":1,"state":"alive","period_ms":0,"at":"2024-01-01T00:00:00Z"}"#;
        let err = PresenceRecord::decode(PATH, payload).unwrap_err();
        assert!(err.to_string().contains("period_ms must be positive"), "got: {err}");
    }

    #[test]
    fn non_canonical_payloads_are_rejected() {
        let canonical = String::from_utf8(PresenceRecord::alive(Duration::from_millis(25)).encode())
            .unwrap();
        assert!(PresenceRecord::decode(PATH, canonical.as_bytes()).is_ok());

        let spaced = canonical.replace(',', ", ");
        let reordered = br#"{"state":"alive","presence":1,"period_ms":25,"at":"2024-01-01T00:00:00Z"}"#;
        let offset = br#"{"presence":1,"state":"alive","period_ms":25,"at":"2024-01-01T02:00:00+02:00"}"#;
        for payload in [spaced.as_bytes(), reordered, offset] {
            let err = PresenceRecord::decode(PATH, payload).unwrap_err();
            assert!(err.to_string().contains("canonical"), "got: {err}");
        }
    }

    #[test]
    fn huge_periods_saturate() {
        let record = PresenceRecord::alive(Duration::MAX);
        assert_eq!(record.period(), Duration::from_millis(u64::MAX));
        assert!(record.stale_after() > Duration::from_secs(3600 * 24 * 365));
        let decoded = PresenceRecord::decode(PATH, &record.encode()).unwrap();
        assert!(!decoded.is_stale_at(Utc::now()));
    }
}
