use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::sync::{oneshot, watch};

use crate::error::StoreError;
use crate::ids::SessionId;
use crate::node::{CreateMode, Node, SessionState, Stat, WatchEvent};

/// The capability set a presence participant needs from a coordination store.
///
/// Every implementation is bound to exactly one session: ephemeral nodes it
/// creates live as long as that session, and its watches resolve to
/// [`WatchEvent::Disconnected`] once the session is lost.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// The session this handle operates under.
    fn session(&self) -> &SessionId;

    /// Subscribe to this handle's session lifecycle.
    fn session_events(&self) -> watch::Receiver<SessionState>;

    /// Create a node. Fails with `NodeExists` if the path is taken.
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<Stat, StoreError>;

    /// Create or overwrite a node in one atomic step. Ownership follows
    /// `mode`, so this can turn an ephemeral node persistent and vice versa.
    /// With `expected_version`, the node must exist at that version.
    async fn replace(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
        expected_version: Option<u64>,
    ) -> Result<Stat, StoreError>;

    /// Read a node. Fails with `NoNode` if absent.
    async fn read(&self, path: &str) -> Result<Node, StoreError>;

    /// Overwrite an existing node's payload, keeping its ownership.
    async fn write(
        &self,
        path: &str,
        data: &[u8],
        expected_version: Option<u64>,
    ) -> Result<Stat, StoreError>;

    /// Delete a node. Fails with `NoNode` if absent.
    async fn delete(&self, path: &str, expected_version: Option<u64>) -> Result<(), StoreError>;

    /// Read a node (absent is not an error) and arm a one-shot watch on the
    /// path in the same atomic step, so no change between the read and the
    /// watch can be missed.
    async fn read_w(&self, path: &str) -> Result<(Option<Node>, WatchOnce), StoreError>;
}

#[async_trait]
impl<T: CoordinationStore + ?Sized> CoordinationStore for Arc<T> {
    fn session(&self) -> &SessionId {
        (**self).session()
    }

    fn session_events(&self) -> watch::Receiver<SessionState> {
        (**self).session_events()
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<Stat, StoreError> {
        (**self).create(path, data, mode).await
    }

    async fn replace(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
        expected_version: Option<u64>,
    ) -> Result<Stat, StoreError> {
        (**self).replace(path, data, mode, expected_version).await
    }

    async fn read(&self, path: &str) -> Result<Node, StoreError> {
        (**self).read(path).await
    }

    async fn write(
        &self,
        path: &str,
        data: &[u8],
        expected_version: Option<u64>,
    ) -> Result<Stat, StoreError> {
        (**self).write(path, data, expected_version).await
    }

    async fn delete(&self, path: &str, expected_version: Option<u64>) -> Result<(), StoreError> {
        (**self).delete(path, expected_version).await
    }

    async fn read_w(&self, path: &str) -> Result<(Option<Node>, WatchOnce), StoreError> {
        (**self).read_w(path).await
    }
}

/// A watch that fires once: on the next change to its path, or when the
/// watching session is lost.
///
/// If the store drops the registration without firing it, the watch resolves
/// to [`WatchEvent::Disconnected`].
#[derive(Debug)]
pub struct WatchOnce {
    rx: oneshot::Receiver<WatchEvent>,
}

impl WatchOnce {
    pub(crate) fn new(rx: oneshot::Receiver<WatchEvent>) -> Self {
        Self { rx }
    }
}

impl Future for WatchOnce {
    type Output = WatchEvent;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(WatchEvent::Disconnected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn watch_resolves_with_sent_event() {
        let (tx, rx) = oneshot::channel();
        let watch = WatchOnce::new(rx);
        tx.send(WatchEvent::DataChanged).unwrap();
        assert_eq!(watch.await, WatchEvent::DataChanged);
    }

    #[tokio::test]
    async fn dropped_registration_reads_as_disconnected() {
        let (tx, rx) = oneshot::channel::<WatchEvent>();
        let watch = WatchOnce::new(rx);
        drop(tx);
        assert_eq!(watch.await, WatchEvent::Disconnected);
    }
}
