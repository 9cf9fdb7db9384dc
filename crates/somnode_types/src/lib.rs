use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

// --- Task Scheduling Types ---

/// Static description of one long-lived unit of work.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    /// Thread name, also used as the `task` field in logs.
    pub name: String,
    /// Higher numeric priority preempts lower at every suspension point.
    pub priority: u8,
    /// Stack size in bytes for the task's worker thread.
    pub stack_size: usize,
}

impl TaskSpec {
    pub fn new(name: &str, priority: u8, stack_size: usize) -> Self {
        Self {
            name: name.to_string(),
            priority,
            stack_size,
        }
    }
}

/// Priorities and stacks for every task the node runs.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct TasksConfig {
    pub connectivity: TaskSpec,
    pub audio: TaskSpec,
    pub motion: TaskSpec,
    pub relay: TaskSpec,
}

impl Default for TasksConfig {
    fn default() -> Self {
        // Audio drains a hardware buffer and must win; the relay may block for
        // seconds on I/O and must lose. The monitor never takes the processor gate.
        Self {
            connectivity: TaskSpec::new("connectivity_monitor", 0, 256 * 1024),
            audio: TaskSpec::new("microphone_task", 6, 512 * 1024),
            motion: TaskSpec::new("periodic_accel_task", 5, 256 * 1024),
            relay: TaskSpec::new("http_get_task", 2, 512 * 1024),
        }
    }
}

// --- Audio Configuration ---

/// Which backend feeds the audio sampling task.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AudioSourceKind {
    /// Synthetic I2S peripheral filling a DMA ring at the sample rate.
    Simulated,
    /// Host microphone through cpal (requires the `host-audio` feature).
    Host,
}

/// Audio peripheral settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct AudioConfig {
    pub source: AudioSourceKind,
    /// Preferred input device name for the host backend. None uses the default device.
    pub device: Option<String>,
    /// Frames per second; one "second captured" report per this many samples.
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub channels: u16,
    /// Capacity of the task-local block, fixed at task start.
    pub block_bytes: usize,
    /// Number of DMA buffers in the peripheral ring.
    pub dma_buf_count: usize,
    /// Frames per DMA buffer.
    pub dma_buf_len: usize,
}

impl AudioConfig {
    pub fn bytes_per_sample(&self) -> usize {
        usize::from(self.bits_per_sample / 8)
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_sample() * usize::from(self.channels)
    }

    /// Capacity of the peripheral's internal ring in bytes.
    pub fn ring_capacity(&self) -> usize {
        self.dma_buf_count * self.dma_buf_len * self.bytes_per_frame()
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            source: AudioSourceKind::Simulated,
            device: None,
            sample_rate: 44_100,
            bits_per_sample: 32,
            channels: 2,
            block_bytes: 1024,
            dma_buf_count: 32,
            dma_buf_len: 64,
        }
    }
}

// --- Motion Configuration ---

/// Accelerometer read mode.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MotionMode {
    /// Drain every buffered reading per poll.
    Fifo,
    /// Fetch exactly one reading per poll.
    Single,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct MotionConfig {
    pub mode: MotionMode,
    /// Fixed delay between polls.
    pub period_ms: u64,
    /// Delay before the first poll.
    pub startup_delay_ms: u64,
    /// Hardware FIFO depth of the accelerometer.
    pub fifo_depth: usize,
    /// Output data rate of the (simulated) sensor.
    pub output_data_rate_hz: u32,
}

impl MotionConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            mode: MotionMode::Fifo,
            period_ms: 100,
            startup_delay_ms: 100,
            fifo_depth: 32,
            output_data_rate_hz: 100,
        }
    }
}

// --- Relay Configuration ---

/// Remote endpoint and pacing of the network relay.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub user_agent: String,
    /// Size of the receive scratch buffer. A read shorter than this ends the exchange.
    pub recv_buffer_size: usize,
    /// Cooldown after a resolution failure.
    pub resolve_retry_ms: u64,
    /// Cooldown after a connect, write or read failure.
    pub failure_cooldown_ms: u64,
    /// Countdown steps after a completed exchange (counts down to 0 inclusive).
    pub success_countdown: u32,
    pub countdown_step_ms: u64,
    /// Connect and read timeout applied by the TCP stack.
    pub io_timeout_ms: u64,
}

impl RelayConfig {
    pub fn short_cooldown(&self) -> Duration {
        Duration::from_millis(self.resolve_retry_ms)
    }

    pub fn medium_cooldown(&self) -> Duration {
        Duration::from_millis(self.failure_cooldown_ms)
    }

    pub fn countdown_step(&self) -> Duration {
        Duration::from_millis(self.countdown_step_ms)
    }

    /// Whole pause after a completed exchange, one step per countdown value.
    pub fn success_cooldown(&self) -> Duration {
        self.countdown_step()
            .checked_mul(self.success_countdown.saturating_add(1))
            .unwrap_or(Duration::MAX)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "heavyobjects.com".to_string(),
            port: 80,
            path: "/".to_string(),
            user_agent: "esp-idf/1.0 esp32".to_string(),
            recv_buffer_size: 64,
            resolve_retry_ms: 1000,
            failure_cooldown_ms: 4000,
            success_countdown: 5,
            countdown_step_ms: 1000,
            io_timeout_ms: 10_000,
        }
    }
}

// --- Link Configuration ---

/// Behaviour of the simulated wireless link.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct LinkConfig {
    /// Time between a connect request and the address being acquired.
    pub association_delay_ms: u64,
    /// Drop the link this long after each association. None keeps it up.
    pub drop_after_secs: Option<u64>,
}

// --- Top-level Config ---

/// Complete node configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    /// Application name (mostly for logging/identification).
    pub app_name: String,
    /// Logging level (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Directory for `status.jsonl`. None disables persistence of status lines.
    pub status_directory: Option<PathBuf>,
    pub tasks: TasksConfig,
    pub audio: AudioConfig,
    pub motion: MotionConfig,
    pub relay: RelayConfig,
    pub link: LinkConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            app_name: "somnode".to_string(),
            log_level: "info".to_string(),
            status_directory: None,
            tasks: TasksConfig::default(),
            audio: AudioConfig::default(),
            motion: MotionConfig::default(),
            relay: RelayConfig::default(),
            link: LinkConfig::default(),
        }
    }
}

// --- Peripheral Data ---

/// One accelerometer sample in g.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    pub ax: f32,
    pub ay: f32,
    pub az: f32,
    pub captured_at: DateTime<Utc>,
}

impl SensorReading {
    pub fn new(ax: f32, ay: f32, az: f32) -> Self {
        Self {
            ax,
            ay,
            az,
            captured_at: Utc::now(),
        }
    }
}

/// Lifecycle notifications from the wireless stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    LinkStarted,
    AddressAcquired { address: IpAddr },
    LinkLost { reason: String },
    /// Anything else the stack reports (scan results, auth changes...).
    Other(String),
}

// --- Relay State ---

/// Why the relay is cooling down.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CooldownReason {
    ResolutionFailure,
    ConnectFailure,
    WriteFailure,
    ReadFailure,
    Completed,
}

impl fmt::Display for CooldownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CooldownReason::ResolutionFailure => "resolution failure",
            CooldownReason::ConnectFailure => "connect failure",
            CooldownReason::WriteFailure => "write failure",
            CooldownReason::ReadFailure => "read failure",
            CooldownReason::Completed => "exchange complete",
        };
        f.write_str(s)
    }
}

/// States of the request/response cycle.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum RelayState {
    WaitConnectivity,
    Resolve,
    Connect,
    Send,
    Receive,
    Cooldown { reason: CooldownReason, duration_ms: u64 },
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayState::WaitConnectivity => f.write_str("WAIT_CONNECTIVITY"),
            RelayState::Resolve => f.write_str("RESOLVE"),
            RelayState::Connect => f.write_str("CONNECT"),
            RelayState::Send => f.write_str("SEND"),
            RelayState::Receive => f.write_str("RECEIVE"),
            RelayState::Cooldown { reason, duration_ms } => {
                write!(f, "COOLDOWN({} ms, {})", duration_ms, reason)
            }
        }
    }
}

// --- Status Output ---

/// Everything the node reports to its output sink.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum StatusEvent {
    AudioBlockRead { bytes: usize, samples: u32 },
    AudioSecondCaptured { samples: u64 },
    MotionBatch { count: usize },
    MotionReading(SensorReading),
    Connectivity { connected: bool },
    RelayState(RelayState),
    ResponseChunk { text: String },
    Countdown { remaining: u32 },
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusEvent::AudioBlockRead { bytes, samples } => {
                write!(f, "Read {} bytes ({} samples)", bytes, samples)
            }
            StatusEvent::AudioSecondCaptured { samples } => {
                write!(f, "Sample read complete ({} samples)", samples)
            }
            StatusEvent::MotionBatch { count } => write!(f, "accelerometer fifo num={}", count),
            StatusEvent::MotionReading(r) => write!(
                f,
                "{:.3} accelerometer (xyz)[g] ax={:+7.3} ay={:+7.3} az={:+7.3}",
                r.captured_at.timestamp_millis() as f64 * 1e-3,
                r.ax,
                r.ay,
                r.az
            ),
            StatusEvent::Connectivity { connected: true } => f.write_str("Connected to AP"),
            StatusEvent::Connectivity { connected: false } => f.write_str("Disconnected from AP"),
            StatusEvent::RelayState(state) => write!(f, "relay -> {}", state),
            StatusEvent::ResponseChunk { text } => f.write_str(text),
            StatusEvent::Countdown { remaining } => write!(f, "{}... ", remaining),
        }
    }
}

/// One line appended to the output sink.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StatusLine {
    pub timestamp: DateTime<Utc>,
    pub event: StatusEvent,
}

impl StatusLine {
    pub fn now(event: StatusEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
        }
    }
}

/// Sending half of the output sink.
pub type StatusSender = mpsc::UnboundedSender<StatusLine>;
/// Receiving half of the output sink.
pub type StatusReceiver = mpsc::UnboundedReceiver<StatusLine>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_priorities_rank_audio_over_motion_over_relay() {
        let tasks = TasksConfig::default();
        assert!(tasks.audio.priority > tasks.connectivity.priority);
        assert!(tasks.audio.priority > tasks.motion.priority);
        assert!(tasks.motion.priority > tasks.relay.priority);
    }

    #[test]
    fn audio_frame_math_matches_stereo_32_bit() {
        let audio = AudioConfig::default();
        assert_eq!(audio.bytes_per_sample(), 4);
        assert_eq!(audio.bytes_per_frame(), 8);
        assert_eq!(audio.ring_capacity(), 32 * 64 * 8);
    }

    #[test]
    fn success_cooldown_spans_every_countdown_step_and_saturates() {
        let relay = RelayConfig::default();
        assert_eq!(relay.success_cooldown(), Duration::from_secs(6));

        let huge = RelayConfig {
            success_countdown: u32::MAX,
            countdown_step_ms: u64::MAX,
            ..RelayConfig::default()
        };
        assert_eq!(huge.success_cooldown(), Duration::MAX);
    }

    #[test]
    fn status_line_serializes_to_single_json_object() {
        let line = StatusLine::now(StatusEvent::RelayState(RelayState::Cooldown {
            reason: CooldownReason::ConnectFailure,
            duration_ms: 4000,
        }));
        let json = serde_json::to_string(&line).expect("serialize");
        assert!(!json.contains('\n'));
        let back: StatusLine = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, line);
    }

    #[test]
    fn motion_reading_renders_signed_fixed_width_axes() {
        let reading = SensorReading::new(0.0, -0.5, 1.0);
        let text = StatusEvent::MotionReading(reading).to_string();
        assert!(text.contains("ax= +0.000"), "{}", text);
        assert!(text.contains("ay= -0.500"), "{}", text);
        assert!(text.contains("az= +1.000"), "{}", text);
    }

    #[test]
    fn partial_config_fills_in_defaults() {
        let json = r#"{ "relay": { "host": "example.org" } }"#;
        let config: Config = serde_json::from_str(json).expect("partial config");
        assert_eq!(config.relay.host, "example.org");
        assert_eq!(config.relay.port, 80);
        assert_eq!(config.audio.sample_rate, 44_100);
    }
}
