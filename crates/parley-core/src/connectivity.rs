//! Online/offline signal.
//!
//! Only the offline to online edge matters to the core.  Each edge bumps a
//! counter carried with the level, so a listener that falls behind still
//! sees that a reconnect happened even if the level flapped back and forth
//! in between.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LinkState {
    online: bool,
    reconnects: u64,
}

#[derive(Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<LinkState>>,
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(LinkState {
            online,
            reconnects: 0,
        });
        Self { tx: Arc::new(tx) }
    }

    /// Report the current link level.  Repeating the same level is a no-op.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|state| {
            if state.online == online {
                return false;
            }
            state.online = online;
            if online {
                state.reconnects += 1;
            }
            true
        });
        if changed {
            tracing::info!(online, "connectivity changed");
        }
    }

    pub fn is_online(&self) -> bool {
        self.tx.borrow().online
    }

    /// Listener for offline to online edges.
    pub fn edges(&self) -> ReconnectEdges {
        let rx = self.tx.subscribe();
        let seen = rx.borrow().reconnects;
        ReconnectEdges { rx, seen }
    }
}

pub struct ReconnectEdges {
    rx: watch::Receiver<LinkState>,
    seen: u64,
}

impl ReconnectEdges {
    /// Wait for the next reconnect.  Several edges that happened while the
    /// caller was busy are reported once.  Returns `false` once the monitor
    /// is gone.
    pub async fn next(&mut self) -> bool {
        loop {
            {
                let state = *self.rx.borrow_and_update();
                if state.reconnects != self.seen {
                    self.seen = state.reconnects;
                    return true;
                }
            }
            if self.rx.changed().await.is_err() {
                return false;
            }
        }
    }
}
