//! Network connectivity monitor.
//!
//! Holds the last known connectivity state and notifies subscribers on every
//! transition. The flag is fed by host-level connectivity events, not
//! polling — but it is advisory only: transitions can fire while the process
//! is suspended, so the engine always re-probes the server at the point of
//! use and feeds the result back here.

use tokio::sync::watch;
use tracing::info;

pub struct NetworkMonitor {
    state: watch::Sender<bool>,
}

impl NetworkMonitor {
    /// Create a monitor with the given initial state. Starting offline is
    /// the safe default until the first probe says otherwise.
    pub fn new(initially_online: bool) -> Self {
        let (state, _) = watch::channel(initially_online);
        NetworkMonitor { state }
    }

    /// Last known connectivity.
    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Record a connectivity observation. Subscribers are only woken on an
    /// actual transition.
    pub fn set_online(&self, online: bool) {
        let changed = self.state.send_if_modified(|current| {
            if *current != online {
                *current = online;
                true
            } else {
                false
            }
        });
        if changed {
            if online {
                info!("Network restored");
            } else {
                info!("Network lost; new operations will queue locally");
            }
        }
    }

    /// Subscribe to connectivity transitions.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        NetworkMonitor::new(false)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
