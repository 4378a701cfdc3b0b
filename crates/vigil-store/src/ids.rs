use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const PREFIX: &str = "sess_";

/// Identifies one store session.
///
/// `sess_` followed by a UUIDv7, so ids sort by the time their session was
/// opened.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("not a session id: {0:?}")]
pub struct InvalidSessionId(String);

impl SessionId {
    pub fn new() -> Self {
        Self(format!("{PREFIX}{}", Uuid::now_v7()))
    }

    /// Rebuild an id read back from the node table.
    pub(crate) fn from_stored(raw: String) -> Self {
        Self(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// When the session was opened, recovered from the id itself.
    pub fn opened_at(&self) -> Option<DateTime<Utc>> {
        let uuid = Uuid::parse_str(self.0.strip_prefix(PREFIX)?).ok()?;
        let (secs, nanos) = uuid.get_timestamp()?.to_unix();
        DateTime::from_timestamp(i64::try_from(secs).ok()?, nanos)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = InvalidSessionId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = s
            .strip_prefix(PREFIX)
            .is_some_and(|rest| Uuid::parse_str(rest).is_ok());
        if valid {
            Ok(Self(s.to_owned()))
        } else {
            Err(InvalidSessionId(s.to_owned()))
        }
    }
}

impl TryFrom<String> for SessionId {
    type Error = InvalidSessionId;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_ids_carry_the_prefix() {
        let id = SessionId::new();
        assert!(id.as_str().starts_with("sess_"), "got: {id}");
        assert_ne!(id, SessionId::new());
    }

    #[test]
    fn later_sessions_sort_after_earlier_ones() {
        let first = SessionId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = SessionId::new();
        assert!(first < second);
    }

    #[test]
    fn opened_at_is_recent() {
        let opened = SessionId::new().opened_at().unwrap();
        let age = Utc::now() - opened;
        assert!(age.num_seconds().abs() < 5, "opened {opened}");
    }

    #[test]
    fn parse_rejects_foreign_strings() {
        assert!("sess_fixed".parse::<SessionId>().is_err());
        assert!("0190b3c4-0000-7000-8000-000000000000".parse::<SessionId>().is_err());
        let id = SessionId::new();
        assert_eq!(id.as_str().parse::<SessionId>().unwrap(), id);
    }

    #[test]
    fn serde_uses_the_plain_string() {
        let id = SessionId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        assert_eq!(serde_json::from_str::<SessionId>(&json).unwrap(), id);
        assert!(serde_json::from_str::<SessionId>("\"bogus\"").is_err());
    }
}
