//! Liveness announcements over a coordination store.
//!
//! A [`Pinger`] keeps an ephemeral record at a path for as long as its
//! session lives. Anyone can ask whether the path is [`alive`] right now, or
//! follow changes with [`alive_w`].

pub mod bridge;
pub mod config;
pub mod error;
pub mod pinger;
pub mod query;
pub mod record;

pub use bridge::{alive_w, LivenessWatch};
pub use config::PresenceConfig;
pub use error::PresenceError;
pub use pinger::{start_ping, Pinger, PingerState};
pub use query::{alive, state};
pub use record::{Liveness, NodeState, PresenceRecord, FORMAT_VERSION, STALE_AFTER_PERIODS};
