//! Edge-triggered connectivity signal

use tokio::sync::watch;

/// Network reachability as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub const fn is_online(self) -> bool {
        matches!(self, Self::Online)
    }
}

impl From<bool> for Connectivity {
    fn from(online: bool) -> Self {
        if online {
            Self::Online
        } else {
            Self::Offline
        }
    }
}

/// Publishes online/offline transitions to the sync engine
///
/// Platform code reports every reachability observation; subscribers only
/// wake when the state actually flips.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    tx: watch::Sender<Connectivity>,
}

impl ConnectivityMonitor {
    pub fn new(initial: Connectivity) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Report the current state. Returns `true` when this was an edge.
    pub fn set(&self, state: Connectivity) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            tracing::info!("Connectivity changed: {state:?}");
        }
        changed
    }

    pub fn set_online(&self, online: bool) -> bool {
        self.set(Connectivity::from(online))
    }

    pub fn current(&self) -> Connectivity {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.tx.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(Connectivity::Offline)
    }
}
