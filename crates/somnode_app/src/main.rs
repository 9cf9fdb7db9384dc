use somnode_core::{
    run_status_writer, AudioTask, ConnectivityFlag, ConnectivityMonitor, MotionTask, RelayTask, Scheduler, StatusSink,
    TaskHandle,
};
use somnode_hardware::{dma_ring, spawn_simulated_i2s, DmaWriter, SimulatedAccelerometer, SimulatedLink, TcpStack};
#[cfg(feature = "host-audio")]
use somnode_hardware::{start_host_input, StreamControl};
use somnode_types::{AudioConfig, AudioSourceKind, Config as AppConfig};
use std::str::FromStr;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Whatever keeps the audio peripheral producing.
enum AudioCapture {
    Simulated(JoinHandle<()>),
    #[cfg(feature = "host-audio")]
    Host(StreamControl),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- Configuration Loading ---
    let config = match somnode_config::load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            // Tracing is not up yet.
            eprintln!("Warning: Failed to load configuration ({}), using built-in defaults.", e);
            AppConfig::default()
        }
    };

    init_tracing(&config.log_level);
    info!("{} starting...", config.app_name);
    debug!("Loaded configuration: {:?}", config);

    // --- Channels ---
    let (shutdown_tx, _shutdown_rx) = watch::channel(false);
    let (status, status_rx) = StatusSink::channel();
    let writer_handle = tokio::spawn(run_status_writer(status_rx, config.status_directory.clone()));

    // --- Peripherals ---
    let (dma_writer, audio_source) = dma_ring(config.audio.ring_capacity(), config.audio.bytes_per_frame());
    let capture = start_audio_capture(&config.audio, dma_writer, shutdown_tx.subscribe())?;
    let accelerometer = SimulatedAccelerometer::new(&config.motion);
    let (link, link_events) = SimulatedLink::new(config.link.clone());
    let flag = ConnectivityFlag::new();

    // --- Tasks ---
    info!("Spawning tasks...");
    let scheduler = Scheduler::new();
    let mut tasks: Vec<TaskHandle> = Vec::new();

    let monitor = ConnectivityMonitor::new(link.clone(), flag.clone(), status.clone());
    let shutdown_rx = shutdown_tx.subscribe();
    tasks.push(scheduler.spawn(&config.tasks.connectivity, move |_processor| {
        monitor.run(link_events, shutdown_rx)
    })?);

    let audio = AudioTask::new(&config.audio, audio_source, status.clone());
    let priority = config.tasks.audio.priority;
    let shutdown_rx = shutdown_tx.subscribe();
    tasks.push(scheduler.spawn(&config.tasks.audio, move |processor| {
        audio.run(processor, priority, shutdown_rx)
    })?);

    let motion = MotionTask::new(&config.motion, accelerometer, status.clone());
    let priority = config.tasks.motion.priority;
    let shutdown_rx = shutdown_tx.subscribe();
    tasks.push(scheduler.spawn(&config.tasks.motion, move |processor| {
        motion.run(processor, priority, shutdown_rx)
    })?);

    let relay = RelayTask::new(
        config.relay.clone(),
        TcpStack::new(config.relay.io_timeout()),
        status.clone(),
    );
    let priority = config.tasks.relay.priority;
    let relay_flag = flag.clone();
    let shutdown_rx = shutdown_tx.subscribe();
    tasks.push(scheduler.spawn(&config.tasks.relay, move |processor| {
        relay.on_processor(processor, priority).run(relay_flag, shutdown_rx)
    })?);

    // Events queue until the monitor picks them up.
    link.start()?;
    info!("All tasks running. Press Ctrl-C to stop.");

    // --- Wait for shutdown ---
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Ctrl-C received, initiating shutdown..."),
        Err(e) => error!("Failed to listen for Ctrl-C: {}. Shutting down.", e),
    }
    shutdown_tx.send_replace(true);

    info!("Waiting for tasks to finish...");
    let joined = tokio::task::spawn_blocking(move || {
        for task in tasks {
            let name = task.name().to_string();
            match task.join() {
                Ok(()) => debug!(task = %name, "Task joined."),
                Err(e) => error!("{}", e),
            }
        }
    })
    .await;
    if let Err(e) = joined {
        error!("Failed to join task threads: {}", e);
    }

    match capture {
        AudioCapture::Simulated(handle) => {
            if let Err(e) = handle.await {
                warn!("Simulated I2S peripheral did not stop cleanly: {}", e);
            }
        }
        #[cfg(feature = "host-audio")]
        AudioCapture::Host(stream) => drop(stream),
    }

    // The writer exits once the last sink handle is gone.
    drop(status);
    if let Err(e) = writer_handle.await {
        warn!("Status writer did not stop cleanly: {}", e);
    }

    info!("{} exiting.", config.app_name);
    Ok(())
}

fn init_tracing(log_level: &str) {
    let level = match Level::from_str(log_level) {
        Ok(level) => level,
        Err(_) => {
            eprintln!("Warning: Invalid log level '{}' in config, defaulting to INFO", log_level);
            Level::INFO
        }
    };

    let filter_layer = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .with_ansi(true);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}

fn start_audio_capture(
    config: &AudioConfig,
    writer: DmaWriter,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<AudioCapture> {
    match config.source {
        AudioSourceKind::Simulated => Ok(AudioCapture::Simulated(spawn_simulated_i2s(config, writer, shutdown_rx))),
        #[cfg(feature = "host-audio")]
        AudioSourceKind::Host => {
            drop(shutdown_rx);
            Ok(AudioCapture::Host(start_host_input(config, writer)?))
        }
        #[cfg(not(feature = "host-audio"))]
        AudioSourceKind::Host => {
            drop((writer, shutdown_rx));
            Err(anyhow::anyhow!("audio.source = \"host\" needs a build with the host-audio feature"))
        }
    }
}
