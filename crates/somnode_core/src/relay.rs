// Network relay: waits for connectivity, runs one HTTP GET exchange, backs off, repeats.

use crate::connectivity::ConnectivityFlag;
use crate::error::{CooldownClass, RelayError};
use crate::scheduler::Processor;
use crate::status::StatusSink;
use crate::{sleep_or_shutdown, wait_for_shutdown};
use bytes::Bytes;
use somnode_hardware::{NetworkStack, StreamSocket};
use somnode_types::{CooldownReason, RelayConfig, RelayState, StatusEvent};
use std::io;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

/// The request sent on every attempt. Built once, reused verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPayload(Bytes);

impl RequestPayload {
    pub fn new(config: &RelayConfig) -> Self {
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {}\r\n\r\n",
            config.path, config.host, config.user_agent
        );
        Self(Bytes::from(request))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Drives the relay state machine against a network stack.
pub struct RelayTask<N: NetworkStack> {
    config: RelayConfig,
    stack: N,
    payload: RequestPayload,
    scratch: Vec<u8>,
    status: StatusSink,
    processor: Option<(Processor, u8)>,
}

impl<N: NetworkStack> RelayTask<N> {
    pub fn new(config: RelayConfig, stack: N, status: StatusSink) -> Self {
        let payload = RequestPayload::new(&config);
        let scratch = vec![0u8; config.recv_buffer_size.max(1)];
        Self {
            config,
            stack,
            payload,
            scratch,
            status,
            processor: None,
        }
    }

    /// Runs each slice of work between suspension points on `processor` at `priority`.
    pub fn on_processor(mut self, processor: Processor, priority: u8) -> Self {
        self.processor = Some((processor, priority));
        self
    }

    async fn report(&self, event: StatusEvent) {
        let _slice = match &self.processor {
            Some((processor, priority)) => Some(processor.acquire(*priority).await),
            None => None,
        };
        self.status.emit(event);
    }

    async fn enter(&self, state: RelayState) {
        debug!(%state, "Relay state");
        self.report(StatusEvent::RelayState(state)).await;
    }

    /// One RESOLVE → CONNECT → SEND → RECEIVE pass. Returns the number of
    /// response bytes received. The socket never outlives this call.
    pub async fn run_attempt(&mut self) -> Result<usize, RelayError> {
        self.enter(RelayState::Resolve).await;
        let addr = self
            .stack
            .resolve(&self.config.host, self.config.port)
            .await
            .map_err(|source| RelayError::Resolution {
                host: self.config.host.clone(),
                source,
            })?;
        info!(%addr, "DNS lookup succeeded.");

        self.enter(RelayState::Connect).await;
        let mut socket = self.stack.allocate(&addr).map_err(RelayError::SocketAllocation)?;
        debug!("Allocated socket.");
        socket
            .connect(addr)
            .await
            .map_err(|source| RelayError::Connect { addr, source })?;
        info!(%addr, "Connected.");

        self.enter(RelayState::Send).await;
        let request = self.payload.as_bytes();
        let written = socket.write(request).await.map_err(RelayError::Write)?;
        if written < request.len() {
            return Err(RelayError::Write(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("wrote {} of {} request bytes", written, request.len()),
            )));
        }
        debug!(bytes = written, "Socket send success.");

        self.enter(RelayState::Receive).await;
        let mut received = 0;
        loop {
            let n = socket.read(&mut self.scratch).await.map_err(RelayError::Read)?;
            if n > 0 {
                let text = String::from_utf8_lossy(&self.scratch[..n]).into_owned();
                self.report(StatusEvent::ResponseChunk { text }).await;
                received += n;
            }
            // A read that does not fill the buffer is taken as the end of the response.
            if n < self.scratch.len() {
                break;
            }
        }

        if let Err(e) = socket.close().await {
            debug!("Socket shutdown failed: {}", e);
        }
        Ok(received)
    }

    fn cooldown_duration(&self, reason: CooldownReason, class: CooldownClass) -> Duration {
        match (reason, class) {
            (CooldownReason::Completed, _) => self.config.success_cooldown(),
            (_, CooldownClass::Short) => self.config.short_cooldown(),
            (_, CooldownClass::Medium) => self.config.medium_cooldown(),
        }
    }

    /// Sleeps out the cooldown. Returns true if shutdown was requested meanwhile.
    async fn cool_down(&self, reason: CooldownReason, class: CooldownClass, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
        let duration = self.cooldown_duration(reason, class);
        self.enter(RelayState::Cooldown {
            reason,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        })
        .await;

        if reason != CooldownReason::Completed {
            return sleep_or_shutdown(duration, shutdown_rx).await;
        }
        for remaining in (0..=self.config.success_countdown).rev() {
            self.report(StatusEvent::Countdown { remaining }).await;
            if sleep_or_shutdown(self.config.countdown_step(), shutdown_rx).await {
                return true;
            }
        }
        info!("Starting again!");
        false
    }

    /// Loops forever: wait for connectivity, one attempt, cooldown.
    #[instrument(name = "http_get_task", skip_all)]
    pub async fn run(mut self, flag: ConnectivityFlag, mut shutdown_rx: watch::Receiver<bool>) {
        info!(host = %self.config.host, port = self.config.port, "Relay task started.");
        loop {
            self.enter(RelayState::WaitConnectivity).await;
            tokio::select! {
                _ = flag.wait_set() => {}
                _ = wait_for_shutdown(&mut shutdown_rx) => break,
            }
            info!("Connected to AP");

            let outcome = tokio::select! {
                outcome = self.run_attempt() => outcome,
                _ = wait_for_shutdown(&mut shutdown_rx) => break,
            };
            let (reason, class) = match outcome {
                Ok(received) => {
                    info!(bytes = received, "Done reading from socket.");
                    (CooldownReason::Completed, CooldownClass::Short)
                }
                Err(e) => {
                    match &e {
                        RelayError::Resolution { .. } => error!("{}", e),
                        _ => warn!("{}", e),
                    }
                    (e.cooldown_reason(), e.cooldown_class())
                }
            };

            if self.cool_down(reason, class, &mut shutdown_rx).await {
                break;
            }
        }
        info!("Relay task stopped.");
    }
}
