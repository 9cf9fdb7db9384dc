//! Peripheral, link and network-stack interfaces for the node, with the
//! implementations used on a development host.

use async_trait::async_trait;
use somnode_types::SensorReading;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub mod audio;
pub mod link;
pub mod motion;
pub mod net;

pub use audio::{dma_ring, spawn_simulated_i2s, DmaAudioSource, DmaWriter};
#[cfg(feature = "host-audio")]
pub use audio::host::{start_host_input, StreamControl};
pub use link::SimulatedLink;
pub use motion::SimulatedAccelerometer;
pub use net::{TcpSocketHandle, TcpStack};

#[derive(Error, Debug)]
pub enum HardwareError {
    // --- Peripheral errors ---
    #[error("Peripheral has no data ready")]
    NotReady,

    #[error("Audio device not found: {0}")]
    DeviceNotFound(String),

    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Unsupported audio sample format")]
    UnsupportedSampleFormat,

    // --- Link errors ---
    #[error("Link control error: {0}")]
    LinkError(String),
}

/// Streaming audio interface (I2S-style).
#[async_trait]
pub trait AudioSource: Send {
    /// Copies up to `buf.len()` buffered bytes into `buf`.
    ///
    /// With a zero `timeout` this returns `Ok(0)` immediately when nothing is
    /// buffered. It never blocks longer than `timeout`.
    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, HardwareError>;
}

/// Low-rate accelerometer with an optional hardware FIFO.
#[async_trait]
pub trait MotionSensor: Send {
    async fn data_ready(&mut self) -> Result<bool, HardwareError>;
    /// Latest single reading.
    async fn read_one(&mut self) -> Result<SensorReading, HardwareError>;
    /// Every buffered reading, oldest first. Never longer than the FIFO depth.
    async fn read_burst(&mut self) -> Result<Vec<SensorReading>, HardwareError>;
}

/// Link-layer control of the wireless interface.
#[async_trait]
pub trait LinkControl: Send + Sync {
    /// Starts a (re)association attempt. Completion is reported through link events.
    async fn connect(&self) -> Result<(), HardwareError>;
}

/// Byte-stream socket factory.
#[async_trait]
pub trait NetworkStack: Send + Sync {
    type Socket: StreamSocket;

    async fn resolve(&self, host: &str, port: u16) -> io::Result<SocketAddr>;

    /// Allocates an unconnected stream socket for the address family of `addr`.
    /// The socket is released when dropped.
    fn allocate(&self, addr: &SocketAddr) -> io::Result<Self::Socket>;
}

/// One stream socket. Dropping it releases the handle on every path.
#[async_trait]
pub trait StreamSocket: Send {
    async fn connect(&mut self, addr: SocketAddr) -> io::Result<()>;
    async fn write(&mut self, bytes: &[u8]) -> io::Result<usize>;
    /// Returns 0 once the peer has closed the stream.
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    /// Graceful shutdown of the write half. The handle itself is released on drop.
    async fn close(&mut self) -> io::Result<()>;
}
