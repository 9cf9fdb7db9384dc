// Motion sampling: fixed-period poll of the accelerometer.

use crate::scheduler::Processor;
use crate::sleep_or_shutdown;
use crate::status::StatusSink;
use somnode_hardware::MotionSensor;
use somnode_types::{MotionConfig, MotionMode, StatusEvent};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, instrument};

pub struct MotionTask<M: MotionSensor> {
    sensor: M,
    mode: MotionMode,
    period: Duration,
    startup_delay: Duration,
    status: StatusSink,
}

impl<M: MotionSensor> MotionTask<M> {
    pub fn new(config: &MotionConfig, sensor: M, status: StatusSink) -> Self {
        Self {
            sensor,
            mode: config.mode,
            period: config.period(),
            startup_delay: config.startup_delay(),
            status,
        }
    }

    /// One poll. Returns how many readings were forwarded; a sensor that is
    /// not ready or fails skips the cycle.
    pub async fn poll_once(&mut self) -> usize {
        match self.sensor.data_ready().await {
            Ok(true) => {}
            Ok(false) => return 0,
            Err(e) => {
                debug!("Accelerometer data-ready check failed: {}", e);
                return 0;
            }
        }

        let readings = match self.mode {
            MotionMode::Fifo => match self.sensor.read_burst().await {
                Ok(burst) => {
                    self.status.emit(StatusEvent::MotionBatch { count: burst.len() });
                    burst
                }
                Err(e) => {
                    debug!("Accelerometer FIFO read failed: {}", e);
                    return 0;
                }
            },
            MotionMode::Single => match self.sensor.read_one().await {
                Ok(reading) => vec![reading],
                Err(e) => {
                    debug!("Accelerometer read failed: {}", e);
                    return 0;
                }
            },
        };

        let count = readings.len();
        for reading in readings {
            self.status.emit(StatusEvent::MotionReading(reading));
        }
        count
    }

    /// Polls every `period` after the startup delay. The delay between polls
    /// does not depend on how long a poll took.
    #[instrument(name = "periodic_accel_task", skip_all)]
    pub async fn run(mut self, processor: Processor, priority: u8, mut shutdown_rx: watch::Receiver<bool>) {
        info!(mode = ?self.mode, period = ?self.period, "Motion sampling started.");
        if sleep_or_shutdown(self.startup_delay, &mut shutdown_rx).await {
            return;
        }
        loop {
            {
                let _slice = processor.acquire(priority).await;
                self.poll_once().await;
            }
            if sleep_or_shutdown(self.period, &mut shutdown_rx).await {
                break;
            }
        }
        info!("Motion sampling stopped.");
    }
}
