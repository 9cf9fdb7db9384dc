// Output sink: fire-and-forget status lines, drained by the status writer.

use crate::logging::StatusFile;
use somnode_types::{StatusEvent, StatusLine, StatusReceiver, StatusSender};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

/// Cloneable, non-blocking handle to the output sink.
#[derive(Clone, Debug)]
pub struct StatusSink {
    tx: StatusSender,
}

impl StatusSink {
    pub fn new(tx: StatusSender) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, StatusReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Never blocks and never fails. A line sent after the writer is gone is dropped.
    pub fn emit(&self, event: StatusEvent) {
        let _ = self.tx.send(StatusLine::now(event));
    }
}

/// Logs every status line and, if `status_dir` is set, appends it to `status.jsonl`.
/// Runs until every sink handle has been dropped.
#[instrument(name = "status_writer", skip_all)]
pub async fn run_status_writer(mut rx: StatusReceiver, status_dir: Option<PathBuf>) {
    let mut file = match status_dir.as_deref().map(StatusFile::open).transpose() {
        Ok(file) => file,
        Err(e) => {
            warn!("Status lines will not be persisted: {}", e);
            None
        }
    };
    if let Some(file) = &file {
        info!("Persisting status lines to {:?}", file.path());
    }
    let mut persist_failed = false;

    while let Some(line) = rx.recv().await {
        match &line.event {
            StatusEvent::AudioBlockRead { .. } | StatusEvent::RelayState(_) | StatusEvent::Countdown { .. } => {
                debug!(target: "somnode::status", "{}", line.event)
            }
            _ => info!(target: "somnode::status", "{}", line.event),
        }

        if let Some(file) = file.as_mut() {
            let mut result = file.append(&line);
            // Flush once the backlog is drained.
            if result.is_ok() && rx.is_empty() {
                result = file.flush();
            }
            match result {
                Ok(()) => persist_failed = false,
                Err(e) if !persist_failed => {
                    warn!("Status line not persisted: {}", e);
                    persist_failed = true;
                }
                Err(_) => {}
            }
        }
    }

    if let Some(file) = file.as_mut() {
        if let Err(e) = file.flush() {
            warn!("Final status flush failed: {}", e);
        }
    }
    debug!("Status sink closed, writer exiting.");
}
