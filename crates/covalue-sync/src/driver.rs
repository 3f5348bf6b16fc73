//! Async driver: runs a [`SyncManager`] over a [`Transport`].
//!
//! Each turn receives what the transport has ready into per-peer queues,
//! drains those queues round robin until the turn budget is spent, expires
//! load timers, delivers coalesced notifications, and sends everything the
//! manager queued. The manager sits behind one async mutex that only the
//! turn holds, and never across an await.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex};
use tracing::{debug, trace, warn};

use covalue_core::{CoValueId, PeerId};

use crate::error::{Result, SyncError};
use crate::manager::SyncManager;
use crate::messages::SyncMessage;
use crate::peer::PeerRole;
use crate::transport::Transport;

/// Messages pulled from the transport in one turn, at most.
const MAX_RECEIVE_PER_TURN: usize = 4096;

/// Pause between idle turns.
const IDLE_WAIT: Duration = Duration::from_millis(5);

/// What one turn did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TurnReport {
    pub received: usize,
    pub handled: usize,
    pub sent: usize,
    pub notified: usize,
}

impl TurnReport {
    pub fn is_idle(&self) -> bool {
        self.received == 0 && self.handled == 0 && self.sent == 0
    }
}

/// Runs a node over a transport.
///
/// `N` is anything that exposes a [`SyncManager`], so a higher-level node
/// can be driven directly.
pub struct SyncDriver<T: Transport, N: AsMut<SyncManager> + Send = SyncManager> {
    transport: T,
    node: Arc<Mutex<N>>,
    inbound: BTreeMap<PeerId, VecDeque<SyncMessage>>,
}

impl<T: Transport, N: AsMut<SyncManager> + Send> SyncDriver<T, N> {
    pub fn new(transport: T, node: N) -> Self {
        Self::shared(transport, Arc::new(Mutex::new(node)))
    }

    /// Drive a node that other tasks also hold.
    pub fn shared(transport: T, node: Arc<Mutex<N>>) -> Self {
        Self {
            transport,
            node,
            inbound: BTreeMap::new(),
        }
    }

    pub fn node(&self) -> Arc<Mutex<N>> {
        Arc::clone(&self.node)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Register a peer with the manager.
    pub async fn connect(&self, peer: PeerId, role: PeerRole, persistent: bool) {
        self.node
            .lock()
            .await
            .as_mut()
            .add_peer(peer, role, persistent);
    }

    /// Unregister a peer, dropping anything queued for or from it.
    pub async fn disconnect(&mut self, peer: &PeerId) {
        self.inbound.remove(peer);
        let dropped = self.node.lock().await.as_mut().remove_peer(peer);
        debug!(peer = %peer, dropped = dropped.len(), "driver disconnected peer");
    }

    /// Run one turn.
    pub async fn turn(&mut self) -> Result<TurnReport> {
        let mut report = TurnReport::default();

        while report.received < MAX_RECEIVE_PER_TURN {
            match self.transport.recv_timeout(Duration::ZERO).await {
                Ok(Some((from, message))) => {
                    self.inbound.entry(from).or_default().push_back(message);
                    report.received += 1;
                }
                Ok(None) => break,
                Err(SyncError::InvalidMessage(reason)) => {
                    warn!(reason = %reason, "dropping undecodable message");
                }
                Err(e) => return Err(e),
            }
        }

        let outgoing = {
            let mut guard = self.node.lock().await;
            let manager = guard.as_mut();
            let budget = manager.config().turn_budget;
            let started = Instant::now();

            'drain: loop {
                let mut progressed = false;
                for (peer, queue) in self.inbound.iter_mut() {
                    if started.elapsed() > budget {
                        trace!("turn budget spent, yielding");
                        break 'drain;
                    }
                    let Some(message) = queue.pop_front() else {
                        continue;
                    };
                    progressed = true;
                    report.handled += 1;
                    if let Err(e) = manager.handle_message(peer, message) {
                        warn!(peer = %peer, error = %e, "message not handled");
                    }
                }
                if !progressed {
                    break;
                }
            }
            self.inbound.retain(|_, queue| !queue.is_empty());

            manager.tick(Instant::now());
            report.notified = manager.flush_notifications();
            manager.take_outgoing()
        };

        for (peer, message) in outgoing {
            match self.transport.send(&peer, message).await {
                Ok(()) => report.sent += 1,
                Err(e) => warn!(peer = %peer, error = %e, "send failed"),
            }
        }
        Ok(report)
    }

    /// Turn until `shutdown` flips to true.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            let report = self.turn().await?;
            if report.is_idle() {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            return Ok(());
                        }
                    }
                    _ = tokio::time::sleep(IDLE_WAIT) => {}
                }
            } else {
                tokio::task::yield_now().await;
            }
        }
    }

    /// Turn until storage and every relevant peer acknowledged our state of `id`.
    pub async fn wait_for_sync(&mut self, id: &CoValueId, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let report = self.turn().await?;
            if self.node.lock().await.as_mut().is_synced(id) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(SyncError::Timeout(format!("waiting for {id} to sync")));
            }
            if report.is_idle() {
                tokio::time::sleep(IDLE_WAIT).await;
            }
        }
    }
}
