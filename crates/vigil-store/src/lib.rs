pub mod client;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod database;
pub mod error;
pub mod ids;
pub mod node;
pub mod path;
pub mod schema;

pub use client::{CoordinationStore, WatchOnce};
pub use config::StoreConfig;
pub use connection::Connection;
pub use coordinator::Coordinator;
pub use database::Database;
pub use error::StoreError;
pub use ids::{InvalidSessionId, SessionId};
pub use node::{CreateMode, Node, SessionState, Stat, WatchEvent};
