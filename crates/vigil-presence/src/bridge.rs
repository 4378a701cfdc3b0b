use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use vigil_store::{CoordinationStore, SessionState, WatchEvent, WatchOnce};

use crate::error::PresenceError;
use crate::record::NodeState;

/// Report whether `path` is alive and subscribe to later changes.
///
/// The returned watch yields a value each time the liveness of `path` flips,
/// and ends (yields `None`) once `conn`'s session is lost. No watch is set up
/// if the node does not hold a presence record.
///
/// An alive record that is not rewritten within its staleness window
/// (see [`PresenceRecord::stale_after`](crate::PresenceRecord::stale_after))
/// flips to `false` without waiting for the store to expire the pinger's
/// session. The window is measured on this process's clock from the last
/// write the watch observed.
pub async fn alive_w<C>(conn: &C, path: &str) -> Result<(bool, LivenessWatch), PresenceError>
where
    C: CoordinationStore + Clone + 'static,
{
    let (node, raw) = conn.read_w(path).await?;
    let state = NodeState::classify(path, node.as_ref().map(|n| n.data.as_slice()));
    let alive = state.liveness(path)?;

    let (tx, rx) = mpsc::channel(1);
    let bridge = WatchBridge {
        conn: conn.clone(),
        path: path.to_string(),
        last: alive,
        deadline: stale_deadline(&state),
        tx,
        session: conn.session_events(),
    };
    let task = tokio::spawn(bridge.run(raw));

    Ok((
        alive,
        LivenessWatch {
            path: path.to_string(),
            rx,
            session: conn.session_events(),
            task,
        },
    ))
}

/// A continuous feed of liveness changes for one path.
///
/// Dropping the watch stops the background task feeding it.
pub struct LivenessWatch {
    path: String,
    rx: mpsc::Receiver<bool>,
    session: watch::Receiver<SessionState>,
    task: JoinHandle<()>,
}

impl LivenessWatch {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Wait for the next liveness change. `None` means the watching
    /// connection was lost; no value pending at that moment is delivered.
    pub async fn recv(&mut self) -> Option<bool> {
        if self.session.borrow().is_lost() {
            return None;
        }
        tokio::select! {
            biased;
            _ = session_lost(&mut self.session) => None,
            alive = self.rx.recv() => alive,
        }
    }

    /// Take a pending change without waiting. `None` when nothing is
    /// pending or the watch has ended.
    pub fn try_recv(&mut self) -> Option<bool> {
        if self.session.borrow().is_lost() {
            return None;
        }
        self.rx.try_recv().ok()
    }
}

impl Stream for LivenessWatch {
    type Item = bool;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<bool>> {
        if self.session.borrow().is_lost() {
            return Poll::Ready(None);
        }
        self.rx.poll_recv(cx)
    }
}

impl Drop for LivenessWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for LivenessWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivenessWatch")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Turns the store's one-shot watches into a feed of liveness flips.
struct WatchBridge<C> {
    conn: C,
    path: String,
    last: bool,
    /// When the alive record last seen goes stale, if it is alive.
    deadline: Option<Instant>,
    tx: mpsc::Sender<bool>,
    session: watch::Receiver<SessionState>,
}

impl<C: CoordinationStore> WatchBridge<C> {
    async fn run(mut self, mut raw: WatchOnce) {
        loop {
            let deadline = self.deadline;
            let event = tokio::select! {
                biased;
                _ = self.tx.closed() => {
                    debug!(path = %self.path, "liveness watch dropped by caller");
                    return;
                }
                event = &mut raw => event,
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    // The raw watch stays armed; the next write revives the path.
                    self.deadline = None;
                    debug!(path = %self.path, "presence record went stale");
                    if self.last && !self.deliver(false).await {
                        return;
                    }
                    self.last = false;
                    continue;
                }
            };
            if event == WatchEvent::Disconnected {
                debug!(path = %self.path, "watching connection lost; closing liveness watch");
                return;
            }

            // Re-arm before classifying: every raw fire since the last arm
            // collapses into this one read of the current state.
            let (node, next) = match self.conn.read_w(&self.path).await {
                Ok(rearmed) => rearmed,
                Err(e) if e.is_connection_error() => {
                    debug!(path = %self.path, error = %e, "watching connection lost; closing liveness watch");
                    return;
                }
                Err(e) => {
                    warn!(path = %self.path, error = %e, "failed to re-arm presence watch");
                    return;
                }
            };
            raw = next;

            let mut state = NodeState::classify(&self.path, node.as_ref().map(|n| n.data.as_slice()));
            if let NodeState::Stale(record) = state {
                // The write that fired this watch is newer than the wall
                // clock suggests; trust the observation.
                state = NodeState::Alive(record);
            }
            let alive = match state.liveness(&self.path) {
                Ok(alive) => alive,
                Err(e) => {
                    warn!(path = %self.path, error = %e, "presence node became unreadable; closing liveness watch");
                    return;
                }
            };
            self.deadline = stale_deadline(&state);
            if alive == self.last {
                continue;
            }
            if !self.deliver(alive).await {
                return;
            }
            self.last = alive;
        }
    }

    /// Hand a value to the caller unless the session is lost first.
    async fn deliver(&mut self, alive: bool) -> bool {
        tokio::select! {
            biased;
            _ = session_lost(&mut self.session) => false,
            sent = self.tx.send(alive) => sent.is_ok(),
        }
    }
}

/// Staleness deadline for an alive record observed just now.
fn stale_deadline(state: &NodeState) -> Option<Instant> {
    match state {
        NodeState::Alive(record) => Instant::now().checked_add(record.stale_after()),
        _ => None,
    }
}

async fn session_lost(events: &mut watch::Receiver<SessionState>) {
    let _ = events.wait_for(SessionState::is_lost).await;
}
