// Connectivity monitor: turns link lifecycle events into the connectivity flag.

use crate::status::StatusSink;
use somnode_hardware::LinkControl;
use somnode_types::{LinkEvent, StatusEvent};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, trace, warn};

/// Process-wide "we have an address" flag.
///
/// Holds only the last transition. Any number of tasks can wait on it, and a
/// set that happens before a wait starts is still seen by that wait.
#[derive(Clone)]
pub struct ConnectivityFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ConnectivityFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectivityFlag {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Returns true if the flag changed.
    pub fn set(&self) -> bool {
        self.tx.send_if_modified(|connected| !std::mem::replace(connected, true))
    }

    /// Returns true if the flag changed.
    pub fn clear(&self) -> bool {
        self.tx.send_if_modified(|connected| std::mem::replace(connected, false))
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Waits, without a timeout, until the flag is set.
    pub async fn wait_set(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|connected| *connected).await;
    }
}

/// Owns the write side of the flag and (re)triggers association.
pub struct ConnectivityMonitor<L: LinkControl> {
    link: Arc<L>,
    flag: ConnectivityFlag,
    status: StatusSink,
}

impl<L: LinkControl> ConnectivityMonitor<L> {
    pub fn new(link: Arc<L>, flag: ConnectivityFlag, status: StatusSink) -> Self {
        Self { link, flag, status }
    }

    pub async fn handle_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::LinkStarted => {
                info!("Link started, requesting association.");
                self.trigger_connect().await;
            }
            LinkEvent::AddressAcquired { address } => {
                info!(%address, "Address acquired.");
                if self.flag.set() {
                    self.status.emit(StatusEvent::Connectivity { connected: true });
                }
            }
            LinkEvent::LinkLost { reason } => {
                warn!(%reason, "Link lost, reconnecting.");
                if self.flag.clear() {
                    self.status.emit(StatusEvent::Connectivity { connected: false });
                }
                self.trigger_connect().await;
            }
            LinkEvent::Other(name) => {
                trace!(event = %name, "Ignoring link event.");
            }
        }
    }

    async fn trigger_connect(&self) {
        if let Err(e) = self.link.connect().await {
            error!("Association request failed: {}", e);
        }
    }

    /// Processes link events until shutdown or until the event source closes.
    #[instrument(name = "connectivity_monitor", skip_all)]
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<LinkEvent>, mut shutdown_rx: watch::Receiver<bool>) {
        info!("Connectivity monitor started.");
        loop {
            tokio::select! {
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping connectivity monitor.");
                        break;
                    }
                }
                maybe_event = events.recv() => {
                    match maybe_event {
                        Some(event) => self.handle_event(event).await,
                        None => {
                            debug!("Link event channel closed.");
                            break;
                        }
                    }
                }
            }
        }
    }
}
