use tracing::instrument;
use vigil_store::{CoordinationStore, StoreError};

use crate::error::PresenceError;
use crate::record::NodeState;

/// Whether a pinger is currently alive at `path`.
///
/// Absent, gracefully stopped and stale nodes read as `false`; a node that
/// does not hold a presence record is a validation error. Staleness is
/// judged from the record's own timestamp against this host's wall clock.
#[instrument(skip(conn), level = "debug")]
pub async fn alive<C>(conn: &C, path: &str) -> Result<bool, PresenceError>
where
    C: CoordinationStore + ?Sized,
{
    state(conn, path).await?.liveness(path)
}

/// Read and classify the node at `path` without collapsing it to a boolean.
pub async fn state<C>(conn: &C, path: &str) -> Result<NodeState, StoreError>
where
    C: CoordinationStore + ?Sized,
{
    match conn.read(path).await {
        Ok(node) => Ok(NodeState::classify(path, Some(&node.data))),
        Err(StoreError::NoNode(_)) => Ok(NodeState::Absent),
        Err(e) => Err(e),
    }
}
