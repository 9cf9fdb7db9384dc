// Audio sampling: drains the peripheral as fast as it fills and counts samples.

use crate::scheduler::Processor;
use crate::status::StatusSink;
use somnode_hardware::AudioSource;
use somnode_types::{AudioConfig, StatusEvent};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, instrument, trace};

/// Running sample count that rolls over once per second of audio.
#[derive(Debug, Clone)]
pub struct AudioSampler {
    channels: usize,
    bytes_per_sample: usize,
    sample_rate: u32,
    count: u32,
}

impl AudioSampler {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            channels: usize::from(config.channels.max(1)),
            bytes_per_sample: config.bytes_per_sample().max(1),
            sample_rate: config.sample_rate,
            count: 0,
        }
    }

    /// Samples per channel contained in `bytes`.
    pub fn samples_in(&self, bytes: usize) -> u32 {
        (bytes / self.channels / self.bytes_per_sample) as u32
    }

    /// Adds one block. Returns the samples in it and, when the running count
    /// reached the sample rate, the count that completed the second. The
    /// counter then restarts from zero.
    pub fn ingest(&mut self, bytes: usize) -> (u32, Option<u64>) {
        let samples = self.samples_in(bytes);
        self.count = self.count.saturating_add(samples);
        if self.count >= self.sample_rate {
            let completed = u64::from(self.count);
            self.count = 0;
            (samples, Some(completed))
        } else {
            (samples, None)
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

/// Owns the audio block and the peripheral for the life of the task.
pub struct AudioTask<S: AudioSource> {
    source: S,
    block: Vec<u8>,
    sampler: AudioSampler,
    status: StatusSink,
}

impl<S: AudioSource> AudioTask<S> {
    pub fn new(config: &AudioConfig, source: S, status: StatusSink) -> Self {
        Self {
            source,
            block: vec![0u8; config.block_bytes.max(1)],
            sampler: AudioSampler::new(config),
            status,
        }
    }

    pub fn sampler(&self) -> &AudioSampler {
        &self.sampler
    }

    /// One zero-timeout read into the block. Returns the bytes read.
    pub async fn poll_once(&mut self) -> usize {
        let n = match self.source.read(&mut self.block, Duration::ZERO).await {
            Ok(n) => n,
            Err(e) => {
                debug!("Audio read failed: {}", e);
                0
            }
        };
        if n == 0 {
            return 0;
        }

        let (samples, second) = self.sampler.ingest(n);
        trace!(bytes = n, samples, total = self.sampler.count(), "Audio block read");
        self.status.emit(StatusEvent::AudioBlockRead { bytes: n, samples });
        if let Some(samples) = second {
            self.status.emit(StatusEvent::AudioSecondCaptured { samples });
        }
        n
    }

    /// Busy-polls the peripheral. An empty read gives the processor back and
    /// retries straight away.
    #[instrument(name = "microphone_task", skip_all)]
    pub async fn run(mut self, processor: Processor, priority: u8, shutdown_rx: watch::Receiver<bool>) {
        info!(block_bytes = self.block.len(), "Audio sampling started.");
        while !*shutdown_rx.borrow() {
            let slice = processor.acquire(priority).await;
            let n = self.poll_once().await;
            drop(slice);
            if n == 0 {
                tokio::task::yield_now().await;
            }
        }
        info!("Audio sampling stopped.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use somnode_hardware::HardwareError;
    use somnode_types::StatusLine;
    use std::collections::VecDeque;
    use tokio::sync::mpsc;

    /// Returns the scripted read sizes in order, then empty reads.
    struct ScriptedSource {
        reads: VecDeque<Result<usize, ()>>,
        timeouts: Vec<Duration>,
        exhausted: Option<watch::Sender<bool>>,
    }

    impl ScriptedSource {
        fn new(reads: Vec<Result<usize, ()>>) -> Self {
            Self {
                reads: reads.into(),
                timeouts: Vec::new(),
                exhausted: None,
            }
        }
    }

    #[async_trait]
    impl AudioSource for ScriptedSource {
        async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, HardwareError> {
            self.timeouts.push(timeout);
            match self.reads.pop_front() {
                Some(Ok(n)) => Ok(n.min(buf.len())),
                Some(Err(())) => Err(HardwareError::NotReady),
                None => {
                    if let Some(tx) = self.exhausted.take() {
                        let _ = tx.send(true);
                    }
                    Ok(0)
                }
            }
        }
    }

    fn stereo_16_bit(sample_rate: u32) -> AudioConfig {
        AudioConfig {
            sample_rate,
            bits_per_sample: 16,
            channels: 2,
            block_bytes: 1024,
            ..AudioConfig::default()
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<StatusLine>) -> Vec<StatusEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).map(|l| l.event).collect()
    }

    #[tokio::test]
    async fn zero_reads_change_nothing_and_blocks_accumulate() {
        let config = stereo_16_bit(44100);
        let (sink, mut rx) = StatusSink::channel();
        let source = ScriptedSource::new(vec![Ok(0), Ok(512), Ok(0), Ok(512)]);
        let mut task = AudioTask::new(&config, source, sink);

        let mut got = Vec::new();
        for _ in 0..4 {
            got.push(task.poll_once().await);
        }
        assert_eq!(got, vec![0, 512, 0, 512]);
        assert_eq!(task.sampler().count(), 256);
        assert!(task.source.timeouts.iter().all(|t| t.is_zero()));
        assert_eq!(
            drain(&mut rx),
            vec![
                StatusEvent::AudioBlockRead { bytes: 512, samples: 128 },
                StatusEvent::AudioBlockRead { bytes: 512, samples: 128 },
            ]
        );
    }

    #[test]
    fn counter_resets_once_a_second_is_captured() {
        let mut sampler = AudioSampler::new(&stereo_16_bit(256));
        assert_eq!(sampler.ingest(512), (128, None));
        assert_eq!(sampler.ingest(512), (128, Some(256)));
        assert_eq!(sampler.count(), 0);
        assert_eq!(sampler.ingest(4), (1, None));
    }

    #[test]
    fn default_format_counts_eight_bytes_per_sample() {
        let sampler = AudioSampler::new(&AudioConfig::default());
        assert_eq!(sampler.samples_in(1024), 128);
    }

    #[tokio::test]
    async fn read_errors_are_treated_as_empty_reads() {
        let (sink, mut rx) = StatusSink::channel();
        let mut task = AudioTask::new(&stereo_16_bit(44100), ScriptedSource::new(vec![Err(()), Ok(8)]), sink);
        assert_eq!(task.poll_once().await, 0);
        assert_eq!(task.poll_once().await, 8);
        assert_eq!(drain(&mut rx), vec![StatusEvent::AudioBlockRead { bytes: 8, samples: 2 }]);
    }

    #[tokio::test]
    async fn run_reports_the_completed_second_and_stops_on_shutdown() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut source = ScriptedSource::new(vec![Ok(512), Ok(0), Ok(512), Ok(512)]);
        source.exhausted = Some(shutdown_tx);
        let (sink, mut rx) = StatusSink::channel();
        let task = AudioTask::new(&stereo_16_bit(256), source, sink);

        tokio::time::timeout(Duration::from_secs(5), task.run(Processor::new(), 6, shutdown_rx))
            .await
            .expect("audio task stops after shutdown");

        let seconds: Vec<StatusEvent> = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, StatusEvent::AudioSecondCaptured { .. }))
            .collect();
        assert_eq!(seconds, vec![StatusEvent::AudioSecondCaptured { samples: 256 }]);
    }
}
