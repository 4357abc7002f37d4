//! Connectivity Monitor: turns reachability transitions into triggers.

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::types::Trigger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    /// True for the offline → online edge that should trigger a sync.
    pub fn is_restored(previous: Connectivity, current: Connectivity) -> bool {
        previous == Connectivity::Offline && current == Connectivity::Online
    }
}

pub struct ConnectivityMonitor {
    handle: JoinHandle<()>,
}

impl ConnectivityMonitor {
    /// Watch `signal` and send [`Trigger::ConnectivityRestored`] on every
    /// offline → online edge. Stops when either channel closes.
    pub fn spawn(mut signal: watch::Receiver<Connectivity>, triggers: mpsc::Sender<Trigger>) -> Self {
        let mut previous = *signal.borrow_and_update();
        let handle = tokio::spawn(async move {
            while signal.changed().await.is_ok() {
                let current = *signal.borrow_and_update();
                debug!(?previous, ?current, "connectivity changed");
                if Connectivity::is_restored(previous, current) {
                    info!("connectivity restored; requesting reconciliation");
                    if triggers.send(Trigger::ConnectivityRestored).await.is_err() {
                        break;
                    }
                }
                previous = current;
            }
        });
        Self { handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}
