use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::client::WatchOnce;
use crate::config::StoreConfig;
use crate::connection::Connection;
use crate::database::Database;
use crate::error::StoreError;
use crate::ids::SessionId;
use crate::node::{CreateMode, Node, SessionState, Stat, WatchEvent};
use crate::path;

/// An embedded coordination store.
///
/// Holds the node table, the live sessions and the pending one-shot watches.
/// Clients talk to it through [`Connection`]s, each of which owns one
/// session. Must be created inside a tokio runtime: a background reaper
/// expires sessions that stop sending keepalives.
#[derive(Clone)]
pub struct Coordinator {
    shared: Arc<Shared>,
}

impl Coordinator {
    /// A coordinator whose nodes live only in memory.
    pub fn in_memory(config: StoreConfig) -> Result<Self, StoreError> {
        Ok(Self::start(Database::in_memory()?, config))
    }

    /// A coordinator persisting nodes to a SQLite file. Persistent nodes
    /// survive reopening; ephemeral ones do not.
    pub fn open(path: &Path, config: StoreConfig) -> Result<Self, StoreError> {
        Ok(Self::start(Database::open(path)?, config))
    }

    fn start(db: Database, config: StoreConfig) -> Self {
        let shared = Arc::new(Shared {
            db,
            config,
            state: Mutex::new(State::default()),
        });
        spawn_reaper(Arc::downgrade(&shared), shared.config.reap_interval);
        Self { shared }
    }

    /// Open a new session.
    pub fn connect(&self) -> Connection {
        let session = SessionId::new();
        let (events_tx, events_rx) = watch::channel(SessionState::Connected);
        self.shared.state.lock().sessions.insert(
            session.clone(),
            SessionEntry {
                last_heard: Instant::now(),
                link_up: true,
                events: events_tx,
            },
        );
        debug!(session = %session, "session opened");
        Connection::new(Arc::clone(&self.shared), session, events_rx)
    }

    /// Read a node without a session, for diagnostics.
    pub fn node(&self, path: &str) -> Result<Option<Node>, StoreError> {
        path::validate(path)?;
        self.shared.db.get(path)
    }

    /// All node paths, sorted.
    pub fn paths(&self) -> Result<Vec<String>, StoreError> {
        self.shared.db.paths()
    }

    /// Number of sessions the store currently considers live.
    pub fn session_count(&self) -> usize {
        self.shared.state.lock().sessions.len()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.shared.config
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("db", &self.shared.db.path())
            .finish_non_exhaustive()
    }
}

fn spawn_reaper(shared: Weak<Shared>, every: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(shared) = shared.upgrade() else {
                break;
            };
            shared.reap();
        }
    });
}

struct SessionEntry {
    last_heard: Instant,
    link_up: bool,
    events: watch::Sender<SessionState>,
}

struct Registration {
    session: SessionId,
    tx: oneshot::Sender<WatchEvent>,
}

#[derive(Default)]
struct State {
    sessions: HashMap<SessionId, SessionEntry>,
    watches: HashMap<String, Vec<Registration>>,
}

impl State {
    /// Fire and clear every watch on `path`.
    fn fire(&mut self, path: &str, event: WatchEvent) {
        if let Some(regs) = self.watches.remove(path) {
            for reg in regs {
                let _ = reg.tx.send(event);
            }
        }
    }

    /// Resolve every watch held by `session` as disconnected.
    fn disconnect_watches(&mut self, session: &SessionId) {
        self.watches.retain(|_, regs| {
            let (mine, rest): (Vec<_>, Vec<_>) = std::mem::take(regs)
                .into_iter()
                .partition(|r| &r.session == session);
            for reg in mine {
                let _ = reg.tx.send(WatchEvent::Disconnected);
            }
            *regs = rest;
            !regs.is_empty()
        });
    }

    fn check(&self, session: &SessionId) -> Result<(), StoreError> {
        match self.sessions.get(session) {
            Some(entry) if entry.link_up => Ok(()),
            Some(_) => Err(StoreError::ConnectionLoss),
            None => Err(StoreError::SessionExpired),
        }
    }
}

/// Store internals shared between the coordinator, its connections and the
/// background tasks. Every mutation and watch registration runs under the
/// single `state` lock, and watches fire before it is released, so
/// notifications for a path arrive in mutation order.
pub(crate) struct Shared {
    db: Database,
    pub(crate) config: StoreConfig,
    state: Mutex<State>,
}

impl Shared {
    pub(crate) fn create(
        &self,
        session: &SessionId,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<Stat, StoreError> {
        path::validate(path)?;
        let mut st = self.state.lock();
        st.check(session)?;

        if self.db.get(path)?.is_some() {
            return Err(StoreError::NodeExists(path.to_string()));
        }
        self.db.insert(path, data, owner(session, mode))?;
        st.fire(path, WatchEvent::Created);
        self.stat(path)
    }

    pub(crate) fn replace(
        &self,
        session: &SessionId,
        path: &str,
        data: &[u8],
        mode: CreateMode,
        expected_version: Option<u64>,
    ) -> Result<Stat, StoreError> {
        path::validate(path)?;
        let mut st = self.state.lock();
        st.check(session)?;

        match self.db.get(path)? {
            None if expected_version.is_some() => {
                return Err(StoreError::NoNode(path.to_string()));
            }
            None => {
                self.db.insert(path, data, owner(session, mode))?;
                st.fire(path, WatchEvent::Created);
            }
            Some(node) => {
                check_version(path, &node, expected_version)?;
                self.db
                    .update(path, data, node.stat.version + 1, owner(session, mode))?;
                st.fire(path, WatchEvent::DataChanged);
            }
        }
        self.stat(path)
    }

    pub(crate) fn read(&self, session: &SessionId, path: &str) -> Result<Node, StoreError> {
        path::validate(path)?;
        let st = self.state.lock();
        st.check(session)?;
        self.db
            .get(path)?
            .ok_or_else(|| StoreError::NoNode(path.to_string()))
    }

    pub(crate) fn write(
        &self,
        session: &SessionId,
        path: &str,
        data: &[u8],
        expected_version: Option<u64>,
    ) -> Result<Stat, StoreError> {
        path::validate(path)?;
        let mut st = self.state.lock();
        st.check(session)?;

        let node = self
            .db
            .get(path)?
            .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
        check_version(path, &node, expected_version)?;
        self.db.update(
            path,
            data,
            node.stat.version + 1,
            node.stat.ephemeral_owner.as_ref(),
        )?;
        st.fire(path, WatchEvent::DataChanged);
        self.stat(path)
    }

    pub(crate) fn delete(
        &self,
        session: &SessionId,
        path: &str,
        expected_version: Option<u64>,
    ) -> Result<(), StoreError> {
        path::validate(path)?;
        let mut st = self.state.lock();
        st.check(session)?;

        let node = self
            .db
            .get(path)?
            .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
        check_version(path, &node, expected_version)?;
        self.db.delete(path)?;
        st.fire(path, WatchEvent::Deleted);
        Ok(())
    }

    pub(crate) fn read_w(
        &self,
        session: &SessionId,
        path: &str,
    ) -> Result<(Option<Node>, WatchOnce), StoreError> {
        path::validate(path)?;
        let mut st = self.state.lock();
        st.check(session)?;

        let node = self.db.get(path)?;
        let (tx, rx) = oneshot::channel();
        let regs = st.watches.entry(path.to_string()).or_default();
        regs.retain(|r| !r.tx.is_closed());
        regs.push(Registration {
            session: session.clone(),
            tx,
        });
        Ok((node, WatchOnce::new(rx)))
    }

    /// Renew a session lease. Returns false once the session is gone or its
    /// link is down, telling the keepalive loop to stop.
    pub(crate) fn touch(&self, session: &SessionId) -> bool {
        let mut st = self.state.lock();
        match st.sessions.get_mut(session) {
            Some(entry) if entry.link_up => {
                entry.last_heard = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// Graceful session end: ephemeral nodes go away immediately.
    pub(crate) fn close_session(&self, session: &SessionId) {
        let mut st = self.state.lock();
        let Some(entry) = st.sessions.remove(session) else {
            return;
        };
        entry.events.send_replace(SessionState::Closed);
        st.disconnect_watches(session);
        let removed = self.drop_ephemerals(&mut st, session);
        debug!(session = %session, removed, "session closed");
    }

    /// Take the session's link down without ending it. The session keeps
    /// its ephemeral nodes until the reaper expires it.
    pub(crate) fn sever_session(&self, session: &SessionId) {
        let mut st = self.state.lock();
        let Some(entry) = st.sessions.get_mut(session) else {
            return;
        };
        if !entry.link_up {
            return;
        }
        entry.link_up = false;
        entry.events.send_replace(SessionState::Disconnected);
        st.disconnect_watches(session);
        debug!(session = %session, "session link severed");
    }

    /// Expire every session whose lease is older than the session timeout.
    pub(crate) fn reap(&self) {
        let mut st = self.state.lock();
        let now = Instant::now();
        let timeout = self.config.session_timeout;
        let expired: Vec<SessionId> = st
            .sessions
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_heard) >= timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for session in expired {
            if let Some(entry) = st.sessions.remove(&session) {
                entry.events.send_replace(SessionState::Expired);
            }
            st.disconnect_watches(&session);
            let removed = self.drop_ephemerals(&mut st, &session);
            info!(session = %session, removed, "session expired");
        }
    }

    fn drop_ephemerals(&self, st: &mut State, session: &SessionId) -> usize {
        let paths = match self.db.owned_by(session) {
            Ok(paths) => paths,
            Err(e) => {
                warn!(session = %session, error = %e, "failed to list ephemeral nodes");
                return 0;
            }
        };

        let mut removed = 0;
        for path in paths {
            match self.db.delete(&path) {
                Ok(_) => {
                    st.fire(&path, WatchEvent::Deleted);
                    removed += 1;
                }
                Err(e) => warn!(path = %path, error = %e, "failed to remove ephemeral node"),
            }
        }
        removed
    }

    fn stat(&self, path: &str) -> Result<Stat, StoreError> {
        self.db
            .get(path)?
            .map(|n| n.stat)
            .ok_or_else(|| StoreError::NoNode(path.to_string()))
    }
}

fn owner(session: &SessionId, mode: CreateMode) -> Option<&SessionId> {
    match mode {
        CreateMode::Ephemeral => Some(session),
        CreateMode::Persistent => None,
    }
}

fn check_version(path: &str, node: &Node, expected: Option<u64>) -> Result<(), StoreError> {
    match expected {
        Some(v) if v != node.stat.version => Err(StoreError::BadVersion {
            path: path.to_string(),
            expected: v,
            actual: node.stat.version,
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::client::CoordinationStore;

    fn coordinator() -> Coordinator {
        Coordinator::in_memory(StoreConfig::with_session_timeout(Duration::from_millis(90)))
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn create_read_write_delete() {
        let store = coordinator();
        let conn = store.connect();

        let stat = conn.create("/a", b"one", CreateMode::Persistent).await.unwrap();
        assert_eq!(stat.version, 0);
        assert!(!stat.is_ephemeral());

        let stat = conn.write("/a", b"two", Some(0)).await.unwrap();
        assert_eq!(stat.version, 1);
        assert_eq!(conn.read("/a").await.unwrap().data, b"two");

        conn.delete("/a", None).await.unwrap();
        assert_eq!(
            conn.read("/a").await.unwrap_err(),
            StoreError::NoNode("/a".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn create_fails_when_taken() {
        let store = coordinator();
        let conn = store.connect();
        conn.create("/a", b"", CreateMode::Persistent).await.unwrap();
        let err = conn.create("/a", b"", CreateMode::Ephemeral).await.unwrap_err();
        assert_eq!(err, StoreError::NodeExists("/a".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn write_and_delete_require_node() {
        let store = coordinator();
        let conn = store.connect();
        assert!(matches!(
            conn.write("/none", b"", None).await,
            Err(StoreError::NoNode(_))
        ));
        assert!(matches!(
            conn.delete("/none", None).await,
            Err(StoreError::NoNode(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn versions_are_checked() {
        let store = coordinator();
        let conn = store.connect();
        conn.create("/a", b"", CreateMode::Persistent).await.unwrap();
        conn.write("/a", b"x", None).await.unwrap();

        let err = conn.write("/a", b"y", Some(0)).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::BadVersion {
                path: "/a".into(),
                expected: 0,
                actual: 1
            }
        );
        assert!(matches!(
            conn.delete("/a", Some(7)).await,
            Err(StoreError::BadVersion { .. })
        ));
        assert!(matches!(
            conn.replace("/missing", b"", CreateMode::Persistent, Some(0)).await,
            Err(StoreError::NoNode(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_paths_are_rejected() {
        let store = coordinator();
        let conn = store.connect();
        assert!(matches!(
            conn.create("relative", b"", CreateMode::Persistent).await,
            Err(StoreError::InvalidPath { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn close_removes_only_ephemeral_nodes() {
        let store = coordinator();
        let conn = store.connect();
        conn.create("/eph", b"", CreateMode::Ephemeral).await.unwrap();
        conn.create("/per", b"", CreateMode::Persistent).await.unwrap();

        conn.close();
        assert_eq!(store.paths().unwrap(), vec!["/per"]);
        assert_eq!(conn.state(), SessionState::Closed);
        assert_eq!(
            conn.read("/per").await.unwrap_err(),
            StoreError::Closed
        );
        assert_eq!(store.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn replace_transfers_ownership() {
        let store = coordinator();
        let conn = store.connect();
        conn.create("/a", b"alive", CreateMode::Ephemeral).await.unwrap();

        let stat = conn
            .replace("/a", b"stopped", CreateMode::Persistent, Some(0))
            .await
            .unwrap();
        assert_eq!(stat.version, 1);
        assert!(!stat.is_ephemeral());

        conn.close();
        let node = store.node("/a").unwrap().unwrap();
        assert_eq!(node.data, b"stopped");
    }

    #[tokio::test(start_paused = true)]
    async fn watches_fire_once_per_change() {
        let store = coordinator();
        let writer = store.connect();
        let watcher = store.connect();

        let (node, watch) = watcher.read_w("/a").await.unwrap();
        assert!(node.is_none());
        writer.create("/a", b"", CreateMode::Persistent).await.unwrap();
        assert_eq!(watch.await, WatchEvent::Created);

        let (node, watch) = watcher.read_w("/a").await.unwrap();
        assert!(node.is_some());
        writer.write("/a", b"x", None).await.unwrap();
        writer.write("/a", b"y", None).await.unwrap();
        assert_eq!(watch.await, WatchEvent::DataChanged);

        let (_, watch) = watcher.read_w("/a").await.unwrap();
        writer.delete("/a", None).await.unwrap();
        assert_eq!(watch.await, WatchEvent::Deleted);
    }

    #[tokio::test(start_paused = true)]
    async fn own_close_disconnects_watches() {
        let store = coordinator();
        let conn = store.connect();
        let (_, watch) = conn.read_w("/a").await.unwrap();
        conn.close();
        assert_eq!(watch.await, WatchEvent::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_sessions_outlive_the_timeout() {
        let store = coordinator();
        let conn = store.connect();
        conn.create("/eph", b"", CreateMode::Ephemeral).await.unwrap();

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(conn.state(), SessionState::Connected);
        assert!(store.node("/eph").unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn severed_session_expires_and_loses_ephemeral_nodes() {
        let store = coordinator();
        let pinger = store.connect();
        let observer = store.connect();
        pinger.create("/eph", b"", CreateMode::Ephemeral).await.unwrap();

        let (_, own_watch) = pinger.read_w("/eph").await.unwrap();
        let (_, other_watch) = observer.read_w("/eph").await.unwrap();

        pinger.sever();
        assert_eq!(own_watch.await, WatchEvent::Disconnected);
        assert_eq!(pinger.state(), SessionState::Disconnected);
        assert_eq!(
            pinger.read("/eph").await.unwrap_err(),
            StoreError::ConnectionLoss
        );

        // Node survives until the lease runs out.
        assert!(store.node("/eph").unwrap().is_some());

        let event = tokio::time::timeout(Duration::from_millis(500), other_watch)
            .await
            .unwrap();
        assert_eq!(event, WatchEvent::Deleted);
        assert_eq!(pinger.state(), SessionState::Expired);
        assert!(store.node("/eph").unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_connection_expires() {
        let store = coordinator();
        let observer = store.connect();
        {
            let crashed = store.connect();
            crashed.create("/eph", b"", CreateMode::Ephemeral).await.unwrap();
        }
        let (node, watch) = observer.read_w("/eph").await.unwrap();
        assert!(node.is_some());

        let event = tokio::time::timeout(Duration::from_millis(500), watch)
            .await
            .unwrap();
        assert_eq!(event, WatchEvent::Deleted);
        assert_eq!(store.session_count(), 1);
    }
}
