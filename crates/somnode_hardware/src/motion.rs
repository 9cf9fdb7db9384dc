// Simulated three-axis accelerometer with a stream-mode FIFO.

use crate::{HardwareError, MotionSensor};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use somnode_types::{MotionConfig, SensorReading};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Noise amplitude in g added to every axis.
const NOISE_G: f32 = 0.02;

/// Produces readings at its output data rate into a bounded FIFO. When the FIFO
/// is full the oldest reading is discarded, like a sensor in stream mode.
pub struct SimulatedAccelerometer {
    fifo: VecDeque<SensorReading>,
    depth: usize,
    sample_interval: Duration,
    last_sample: Instant,
    rng: StdRng,
}

impl SimulatedAccelerometer {
    pub fn new(config: &MotionConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Deterministic noise for tests.
    pub fn with_seed(config: &MotionConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &MotionConfig, rng: StdRng) -> Self {
        let depth = config.fifo_depth.max(1);
        Self {
            fifo: VecDeque::with_capacity(depth),
            depth,
            sample_interval: Duration::from_secs_f64(1.0 / f64::from(config.output_data_rate_hz.max(1))),
            last_sample: Instant::now(),
            rng,
        }
    }

    /// Generates every reading that became due since the last call.
    fn refill(&mut self) {
        let now = Instant::now();
        while now.duration_since(self.last_sample) >= self.sample_interval {
            self.last_sample += self.sample_interval;
            if self.fifo.len() == self.depth {
                self.fifo.pop_front();
            }
            let reading = SensorReading::new(
                self.rng.gen_range(-NOISE_G..NOISE_G),
                self.rng.gen_range(-NOISE_G..NOISE_G),
                1.0 + self.rng.gen_range(-NOISE_G..NOISE_G),
            );
            self.fifo.push_back(reading);
        }
        trace!(buffered = self.fifo.len(), "Accelerometer FIFO refilled");
    }
}

#[async_trait]
impl MotionSensor for SimulatedAccelerometer {
    async fn data_ready(&mut self) -> Result<bool, HardwareError> {
        self.refill();
        Ok(!self.fifo.is_empty())
    }

    async fn read_one(&mut self) -> Result<SensorReading, HardwareError> {
        self.refill();
        // Single-sample mode reads the output registers: the newest value wins.
        let latest = self.fifo.pop_back().ok_or(HardwareError::NotReady)?;
        self.fifo.clear();
        Ok(latest)
    }

    async fn read_burst(&mut self) -> Result<Vec<SensorReading>, HardwareError> {
        self.refill();
        Ok(self.fifo.drain(..).collect())
    }
}
