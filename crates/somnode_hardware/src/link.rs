// Simulated wireless station: association and DHCP are out of scope, so a
// connect request simply reports an address after a configurable delay.

use crate::{HardwareError, LinkControl};
use async_trait::async_trait;
use somnode_types::{LinkConfig, LinkEvent};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

const SIMULATED_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 4, 2));

/// Emits link events on an unbounded channel, the way a driver event loop would.
pub struct SimulatedLink {
    config: LinkConfig,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    associating: Arc<AtomicBool>,
}

impl SimulatedLink {
    pub fn new(config: LinkConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<LinkEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let link = Arc::new(Self {
            config,
            events_tx,
            associating: Arc::new(AtomicBool::new(false)),
        });
        (link, events_rx)
    }

    /// Brings the station interface up. The monitor answers with `connect()`.
    pub fn start(&self) -> Result<(), HardwareError> {
        info!("Starting simulated station interface.");
        self.events_tx
            .send(LinkEvent::LinkStarted)
            .map_err(|_| HardwareError::LinkError("link event channel closed".to_string()))
    }
}

#[async_trait]
impl LinkControl for SimulatedLink {
    async fn connect(&self) -> Result<(), HardwareError> {
        if self.associating.swap(true, Ordering::SeqCst) {
            debug!("Association already in progress, ignoring connect request.");
            return Ok(());
        }
        if self.events_tx.is_closed() {
            self.associating.store(false, Ordering::SeqCst);
            return Err(HardwareError::LinkError("link event channel closed".to_string()));
        }

        let events_tx = self.events_tx.clone();
        let associating = self.associating.clone();
        let association_delay = Duration::from_millis(self.config.association_delay_ms);
        let drop_after = self.config.drop_after_secs.map(Duration::from_secs);

        tokio::spawn(async move {
            sleep(association_delay).await;
            debug!(address = %SIMULATED_ADDRESS, "Simulated DHCP lease acquired.");
            if events_tx.send(LinkEvent::AddressAcquired { address: SIMULATED_ADDRESS }).is_err() {
                associating.store(false, Ordering::SeqCst);
                return;
            }

            if let Some(up_for) = drop_after {
                sleep(up_for).await;
                warn!("Simulated beacon timeout, dropping link.");
                // Clear before reporting so the monitor's reconnect is honoured.
                associating.store(false, Ordering::SeqCst);
                let _ = events_tx.send(LinkEvent::LinkLost {
                    reason: "beacon timeout".to_string(),
                });
            }
        });
        Ok(())
    }
}
