use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vigil_store::{CoordinationStore, CreateMode, StoreError};

use crate::error::PresenceError;
use crate::record::{NodeState, PresenceRecord};

/// Attempts at taking over a stopped record before giving up.
const START_ATTEMPTS: usize = 3;

/// Records carry their period in whole milliseconds.
const MIN_PERIOD: Duration = Duration::from_millis(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PingerState {
    NotStarted,
    Running,
    Stopped,
    Killed,
}

impl PingerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Killed)
    }
}

impl std::fmt::Display for PingerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Killed => write!(f, "killed"),
        }
    }
}

/// Announce liveness at `path` on `conn`, refreshing every `period`.
pub async fn start_ping<C>(conn: &C, path: &str, period: Duration) -> Result<Pinger<C>, PresenceError>
where
    C: CoordinationStore + Clone + 'static,
{
    Pinger::start(conn, path, period).await
}

/// Node version last written by a pinger. `None` once another writer has
/// replaced the record, after which the pinger never touches the path again.
type Held = Arc<Mutex<Option<u64>>>;

/// Keeps an ephemeral presence record alive at one path.
///
/// The record disappears on its own if the owning session is lost. A
/// graceful [`close`](Self::close) leaves a durable "stopped" record behind;
/// [`kill`](Self::kill) removes the node. Dropping a running pinger stops
/// its refresh loop but leaves the node to the session.
///
/// Every write is conditional on the version the pinger last wrote, so a
/// record some other writer put in its place is left alone.
pub struct Pinger<C: CoordinationStore + Clone + 'static> {
    conn: C,
    path: String,
    period: Duration,
    state: Mutex<PingerState>,
    cancel: CancellationToken,
    refresher: Mutex<Option<JoinHandle<()>>>,
    failures: Arc<AtomicU32>,
    held: Held,
}

impl<C: CoordinationStore + Clone + 'static> Pinger<C> {
    pub async fn start(conn: &C, path: &str, period: Duration) -> Result<Self, PresenceError> {
        if period < MIN_PERIOD {
            return Err(PresenceError::InvalidPeriod);
        }
        let pinger = Self {
            conn: conn.clone(),
            path: path.to_string(),
            period,
            state: Mutex::new(PingerState::NotStarted),
            cancel: CancellationToken::new(),
            refresher: Mutex::new(None),
            failures: Arc::new(AtomicU32::new(0)),
            held: Arc::new(Mutex::new(None)),
        };
        let version = pinger.establish().await?;
        *pinger.held.lock() = Some(version);
        pinger.spawn_refresher();
        *pinger.state.lock() = PingerState::Running;
        info!(
            path = %pinger.path,
            period_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX),
            session = %conn.session(),
            "pinger started"
        );
        Ok(pinger)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn state(&self) -> PingerState {
        *self.state.lock()
    }

    /// Consecutive refreshes that have failed. Resets on the next success.
    pub fn refresh_failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    /// True once another writer replaced this pinger's record.
    pub fn is_superseded(&self) -> bool {
        self.held.lock().is_none()
    }

    /// Stop pinging and leave a durable "stopped" record, so observers can
    /// tell a graceful shutdown from a crash.
    ///
    /// Only the first of `close`/`kill` has an effect; later calls return
    /// `Ok(())`.
    pub async fn close(&self) -> Result<(), PresenceError> {
        if !self.finish(PingerState::Stopped) {
            return Ok(());
        }
        self.stop_refresher().await;

        let held = *self.held.lock();
        let Some(version) = held else {
            return Err(self.superseded());
        };
        let payload = PresenceRecord::stopped(self.period).encode();
        match self
            .conn
            .replace(&self.path, &payload, CreateMode::Persistent, Some(version))
            .await
        {
            Ok(_) => {}
            Err(StoreError::BadVersion { .. }) => {
                *self.held.lock() = None;
                return Err(self.superseded());
            }
            Err(StoreError::NoNode(_)) => {
                match self
                    .conn
                    .create(&self.path, &payload, CreateMode::Persistent)
                    .await
                {
                    Ok(_) => {}
                    Err(StoreError::NodeExists(_)) => {
                        *self.held.lock() = None;
                        return Err(self.superseded());
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        }
        info!(path = %self.path, "pinger closed");
        Ok(())
    }

    /// Stop pinging and delete the node. Failures are logged, not returned.
    pub async fn kill(&self) {
        if !self.finish(PingerState::Killed) {
            return;
        }
        self.stop_refresher().await;

        let held = *self.held.lock();
        let Some(version) = held else {
            info!(path = %self.path, "pinger killed; record belongs to another writer");
            return;
        };
        match self.conn.delete(&self.path, Some(version)).await {
            Ok(()) | Err(StoreError::NoNode(_)) => info!(path = %self.path, "pinger killed"),
            Err(StoreError::BadVersion { .. }) => {
                *self.held.lock() = None;
                info!(path = %self.path, "pinger killed; record belongs to another writer");
            }
            Err(e) => warn!(path = %self.path, error = %e, "failed to delete presence node"),
        }
    }

    fn superseded(&self) -> PresenceError {
        PresenceError::Superseded {
            path: self.path.clone(),
        }
    }

    /// Move to a terminal state. False if one was already reached.
    fn finish(&self, to: PingerState) -> bool {
        let mut state = self.state.lock();
        if state.is_terminal() {
            return false;
        }
        *state = to;
        true
    }

    async fn stop_refresher(&self) {
        self.cancel.cancel();
        let handle = self.refresher.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    warn!(path = %self.path, "refresh loop panicked");
                }
            }
        }
    }

    /// Write the initial alive record, taking over a stopped or stale one
    /// if present. Returns the version written.
    async fn establish(&self) -> Result<u64, PresenceError> {
        for attempt in 1..=START_ATTEMPTS {
            let payload = PresenceRecord::alive(self.period).encode();
            match self
                .conn
                .create(&self.path, &payload, CreateMode::Ephemeral)
                .await
            {
                Ok(stat) => return Ok(stat.version),
                Err(StoreError::NodeExists(_)) => {}
                Err(e) => return Err(e.into()),
            }

            let node = match self.conn.read(&self.path).await {
                Ok(node) => node,
                Err(StoreError::NoNode(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            match NodeState::classify(&self.path, Some(&node.data)) {
                NodeState::Stopped(_) | NodeState::Stale(_) => {}
                NodeState::Alive(_) => {
                    return Err(PresenceError::AlreadyPinging {
                        path: self.path.clone(),
                    })
                }
                NodeState::Malformed { detail } => {
                    return Err(PresenceError::Validation {
                        path: self.path.clone(),
                        detail,
                    })
                }
                NodeState::Absent => continue,
            }

            match self
                .conn
                .replace(
                    &self.path,
                    &payload,
                    CreateMode::Ephemeral,
                    Some(node.stat.version),
                )
                .await
            {
                Ok(stat) => {
                    debug!(path = %self.path, "took over presence record");
                    return Ok(stat.version);
                }
                Err(StoreError::BadVersion { .. } | StoreError::NoNode(_)) => {
                    debug!(path = %self.path, attempt, "presence record changed during start; retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(PresenceError::Contended {
            path: self.path.clone(),
        })
    }

    fn spawn_refresher(&self) {
        let conn = self.conn.clone();
        let path = self.path.clone();
        let period = self.period;
        let cancel = self.cancel.clone();
        let failures = Arc::clone(&self.failures);
        let held = Arc::clone(&self.held);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes at once; the record was just written.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let version = *held.lock();
                        let Some(version) = version else { break };
                        match refresh(&conn, &path, period, version).await {
                            Ok(Some(written)) => {
                                *held.lock() = Some(written);
                                let failed = failures.swap(0, Ordering::Relaxed);
                                if failed > 0 {
                                    info!(path = %path, failed, "presence refresh recovered");
                                }
                            }
                            Ok(None) => {
                                *held.lock() = None;
                                warn!(path = %path, "presence record taken over by another writer; refresh stopped");
                                break;
                            }
                            Err(e) => {
                                let failed = failures.fetch_add(1, Ordering::Relaxed) + 1;
                                if failed == 1 {
                                    warn!(path = %path, error = %e, "presence refresh failed");
                                } else {
                                    debug!(path = %path, error = %e, failed, "presence refresh still failing");
                                }
                            }
                        }
                    }
                }
            }
            debug!(path = %path, "refresh loop stopped");
        });
        *self.refresher.lock() = Some(handle);
    }
}

impl<C: CoordinationStore + Clone + 'static> Drop for Pinger<C> {
    fn drop(&mut self) {
        if *self.state.get_mut() == PingerState::Running {
            debug!(path = %self.path, "pinger dropped while running");
        }
        self.cancel.cancel();
    }
}

impl<C: CoordinationStore + Clone + 'static> std::fmt::Debug for Pinger<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pinger")
            .field("path", &self.path)
            .field("period", &self.period)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Rewrite the alive record over `version`, recreating the node if it went
/// missing. `Ok(None)` means another writer holds the path now.
async fn refresh<C: CoordinationStore>(
    conn: &C,
    path: &str,
    period: Duration,
    version: u64,
) -> Result<Option<u64>, StoreError> {
    let payload = PresenceRecord::alive(period).encode();
    match conn.write(path, &payload, Some(version)).await {
        Ok(stat) => Ok(Some(stat.version)),
        Err(StoreError::BadVersion { .. }) => Ok(None),
        Err(StoreError::NoNode(_)) => {
            debug!(path, "presence node missing; recreating");
            match conn.create(path, &payload, CreateMode::Ephemeral).await {
                Ok(stat) => Ok(Some(stat.version)),
                Err(StoreError::NodeExists(_)) => Ok(None),
                Err(e) => Err(e),
            }
        }
        Err(e) => Err(e),
    }
}
