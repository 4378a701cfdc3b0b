use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::client::{CoordinationStore, WatchOnce};
use crate::coordinator::Shared;
use crate::error::StoreError;
use crate::ids::SessionId;
use crate::node::{CreateMode, Node, SessionState, Stat};

/// A client handle owning one store session.
///
/// Cheap to clone; clones share the session. While any clone is alive a
/// background task keeps the session lease fresh. Dropping every clone
/// without calling [`close`](Self::close) behaves like a crashed client: the
/// session, and its ephemeral nodes, expire after the session timeout.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    shared: Arc<Shared>,
    session: SessionId,
    events: watch::Receiver<SessionState>,
    keepalive: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.keepalive.cancel();
    }
}

impl Connection {
    pub(crate) fn new(
        shared: Arc<Shared>,
        session: SessionId,
        events: watch::Receiver<SessionState>,
    ) -> Self {
        let keepalive = CancellationToken::new();
        spawn_keepalive(
            Arc::downgrade(&shared),
            session.clone(),
            keepalive.clone(),
        );
        Self {
            inner: Arc::new(Inner {
                shared,
                session,
                events,
                keepalive,
            }),
        }
    }

    /// Current session state as seen by this connection.
    pub fn state(&self) -> SessionState {
        *self.inner.events.borrow()
    }

    /// End the session gracefully. Ephemeral nodes it owns are removed at
    /// once and its pending watches resolve as disconnected.
    pub fn close(&self) {
        self.inner.keepalive.cancel();
        self.inner.shared.close_session(&self.inner.session);
    }

    /// Drop the link to the store without ending the session, as a network
    /// partition would. Operations fail with `ConnectionLoss` from now on;
    /// the store expires the session once its lease runs out.
    pub fn sever(&self) {
        self.inner.keepalive.cancel();
        self.inner.shared.sever_session(&self.inner.session);
    }

    async fn round_trip(&self) -> Result<(), StoreError> {
        if let Some(latency) = self.inner.shared.config.op_latency {
            tokio::time::sleep(latency).await;
        }
        match self.state() {
            SessionState::Connected => Ok(()),
            SessionState::Disconnected => Err(StoreError::ConnectionLoss),
            SessionState::Expired => Err(StoreError::SessionExpired),
            SessionState::Closed => Err(StoreError::Closed),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("session", &self.inner.session)
            .field("state", &self.state())
            .finish()
    }
}

#[async_trait]
impl CoordinationStore for Connection {
    fn session(&self) -> &SessionId {
        &self.inner.session
    }

    fn session_events(&self) -> watch::Receiver<SessionState> {
        self.inner.events.clone()
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<Stat, StoreError> {
        self.round_trip().await?;
        self.inner.shared.create(&self.inner.session, path, data, mode)
    }

    async fn replace(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
        expected_version: Option<u64>,
    ) -> Result<Stat, StoreError> {
        self.round_trip().await?;
        self.inner
            .shared
            .replace(&self.inner.session, path, data, mode, expected_version)
    }

    async fn read(&self, path: &str) -> Result<Node, StoreError> {
        self.round_trip().await?;
        self.inner.shared.read(&self.inner.session, path)
    }

    async fn write(
        &self,
        path: &str,
        data: &[u8],
        expected_version: Option<u64>,
    ) -> Result<Stat, StoreError> {
        self.round_trip().await?;
        self.inner
            .shared
            .write(&self.inner.session, path, data, expected_version)
    }

    async fn delete(&self, path: &str, expected_version: Option<u64>) -> Result<(), StoreError> {
        self.round_trip().await?;
        self.inner
            .shared
            .delete(&self.inner.session, path, expected_version)
    }

    async fn read_w(&self, path: &str) -> Result<(Option<Node>, WatchOnce), StoreError> {
        self.round_trip().await?;
        self.inner.shared.read_w(&self.inner.session, path)
    }
}

fn spawn_keepalive(shared: Weak<Shared>, session: SessionId, cancel: CancellationToken) {
    let Some(every) = shared.upgrade().map(|s| s.config.keepalive_interval) else {
        return;
    };
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(shared) = shared.upgrade() else { break };
                    if !shared.touch(&session) {
                        break;
                    }
                    trace!(session = %session, "keepalive");
                }
            }
        }
    });
}
