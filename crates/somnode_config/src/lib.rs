use somnode_types::Config as AppConfig; // Alias to avoid naming collision
use config::{Config as ConfigRs, ConfigError as RsConfigError, Environment, File};
use directories::ProjectDirs;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Relative to the working directory; required as the base layer.
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";
const USER_CONFIG_FILE: &str = "somnode_config.toml";
const ENV_PREFIX: &str = "SOMNODE";
/// Longest countdown accepted after a completed relay exchange.
const MAX_SUCCESS_COUNTDOWN: u32 = 3600;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error accessing configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration parsing error: {0}")]
    Config(#[from] RsConfigError),

    #[error("Could not determine a valid configuration directory")]
    DirectoryError,

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Full path to the user's config file in the platform config directory.
/// Linux: ~/.config/somnode/somnode_config.toml
fn get_user_config_path() -> Result<PathBuf, ConfigError> {
    match ProjectDirs::from("net", "Somnode", "Somnode") {
        Some(proj_dirs) => Ok(proj_dirs.config_dir().join(USER_CONFIG_FILE)),
        None => {
            error!("Could not determine the user configuration directory.");
            Err(ConfigError::DirectoryError)
        }
    }
}

/// Copies the default template to the user location if no user file exists yet.
/// A failed copy is not fatal: defaults and environment still apply.
fn ensure_user_config(user_config_path: &Path, default_config_path: &Path) -> Result<(), ConfigError> {
    if user_config_path.exists() {
        return Ok(());
    }
    info!("User config file not found at {:?}, attempting to create from default.", user_config_path);

    let parent_dir = user_config_path.parent().ok_or(ConfigError::DirectoryError)?;
    fs::create_dir_all(parent_dir)?;

    if !default_config_path.exists() {
        warn!(
            "Default config template not found at {:?}. Cannot create user config file.",
            default_config_path
        );
        return Ok(());
    }

    match fs::copy(default_config_path, user_config_path) {
        Ok(_) => info!("Copied default config to {:?}", user_config_path),
        Err(e) => warn!(
            "Failed to copy default config from {:?} to {:?}: {}. Proceeding without user config file.",
            default_config_path, user_config_path, e
        ),
    }
    Ok(())
}

fn environment_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__") // Double underscore for nested keys
        .try_parsing(true)
}

/// Loads the node configuration.
///
/// Sources, lowest precedence first:
/// 1. `config/default.toml` (relative to CWD, required base).
/// 2. The user's `somnode_config.toml` (optional, created from the default on first run).
/// 3. Environment variables prefixed with `SOMNODE_`, `__` separating nested keys
///    (e.g. `SOMNODE_RELAY__HOST`).
///
/// The merged result is validated before it is returned.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    let default_config_path = PathBuf::from(DEFAULT_CONFIG_PATH);
    let user_config_path = get_user_config_path()?;
    ensure_user_config(&user_config_path, &default_config_path)?;

    debug!("Building configuration sources...");
    let config_rs = ConfigRs::builder()
        .add_source(File::from(default_config_path).required(true))
        .add_source(File::from(user_config_path).required(false))
        .add_source(environment_source())
        .build()?;

    let app_config = config_rs.try_deserialize::<AppConfig>()?;
    validate(&app_config)?;

    info!("Configuration loaded successfully.");
    Ok(app_config)
}

/// Loads one explicit TOML file plus environment overrides, then validates.
/// Keys missing from the file keep their built-in defaults.
pub fn load_config_from(path: &Path) -> Result<AppConfig, ConfigError> {
    debug!("Loading configuration from {:?}", path);
    let config_rs = ConfigRs::builder()
        .add_source(File::from(path.to_path_buf()).required(true))
        .add_source(environment_source())
        .build()?;

    let app_config = config_rs.try_deserialize::<AppConfig>()?;
    validate(&app_config)?;
    Ok(app_config)
}

/// Rejects settings the node cannot run with.
///
/// Priorities are fixed configuration, so the ordering the scheduler relies on
/// (audio over motion over relay) is enforced here rather than at runtime.
pub fn validate(config: &AppConfig) -> Result<(), ConfigError> {
    let tasks = &config.tasks;
    if tasks.audio.priority <= tasks.connectivity.priority {
        return Err(ConfigError::Invalid(format!(
            "audio priority ({}) must be higher than connectivity monitor priority ({})",
            tasks.audio.priority, tasks.connectivity.priority
        )));
    }
    if tasks.audio.priority <= tasks.motion.priority {
        return Err(ConfigError::Invalid(format!(
            "audio priority ({}) must be higher than motion priority ({})",
            tasks.audio.priority, tasks.motion.priority
        )));
    }
    if tasks.motion.priority <= tasks.relay.priority {
        return Err(ConfigError::Invalid(format!(
            "motion priority ({}) must be higher than relay priority ({})",
            tasks.motion.priority, tasks.relay.priority
        )));
    }

    let audio = &config.audio;
    if !matches!(audio.bits_per_sample, 8 | 16 | 24 | 32) {
        return Err(ConfigError::Invalid(format!(
            "unsupported audio sample width: {} bits",
            audio.bits_per_sample
        )));
    }
    if audio.channels == 0 || audio.sample_rate == 0 {
        return Err(ConfigError::Invalid("audio channels and sample rate must be non-zero".to_string()));
    }
    let frame = audio.bytes_per_frame();
    if audio.block_bytes < frame || audio.block_bytes % frame != 0 {
        return Err(ConfigError::Invalid(format!(
            "audio block of {} bytes is not a whole number of {}-byte frames",
            audio.block_bytes, frame
        )));
    }
    if audio.dma_buf_count == 0 || audio.dma_buf_len == 0 {
        return Err(ConfigError::Invalid("audio DMA ring must be non-empty".to_string()));
    }

    let motion = &config.motion;
    if motion.period_ms == 0 || motion.fifo_depth == 0 || motion.output_data_rate_hz == 0 {
        return Err(ConfigError::Invalid(
            "motion period, FIFO depth and output data rate must be non-zero".to_string(),
        ));
    }

    let relay = &config.relay;
    if relay.host.trim().is_empty() {
        return Err(ConfigError::Invalid("relay host must not be empty".to_string()));
    }
    if !relay.path.starts_with('/') {
        return Err(ConfigError::Invalid(format!("relay path must start with '/': {}", relay.path)));
    }
    if relay.recv_buffer_size == 0 {
        return Err(ConfigError::Invalid("relay receive buffer must be non-empty".to_string()));
    }
    if relay.success_countdown > MAX_SUCCESS_COUNTDOWN {
        return Err(ConfigError::Invalid(format!(
            "relay success countdown ({}) must not exceed {}",
            relay.success_countdown, MAX_SUCCESS_COUNTDOWN
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use somnode_types::{AudioSourceKind, MotionMode};
    use std::fs;
    use tempfile::Builder;

    fn create_valid_toml_content() -> String {
        r#"
        app_name = "somnode-test"
        log_level = "debug"

        [tasks.audio]
        name = "mic"
        priority = 9
        stack_size = 131072

        [audio]
        source = "simulated"
        sample_rate = 16000
        bits_per_sample = 16
        channels = 2
        block_bytes = 512

        [motion]
        mode = "single"
        period_ms = 250

        [relay]
        host = "example.org"
        recv_buffer_size = 128
        "#
        .to_string()
    }

    fn write_temp_config(content: &str) -> (tempfile::TempDir, PathBuf) {
        let temp_dir = Builder::new().prefix("somnode_cfg").tempdir().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, content).expect("Failed to write temp config file");
        (temp_dir, config_path)
    }

    #[test]
    fn test_load_valid_config_from_file() {
        let (_dir, path) = write_temp_config(&create_valid_toml_content());
        let config = load_config_from(&path).expect("valid config should load");

        assert_eq!(config.app_name, "somnode-test");
        assert_eq!(config.tasks.audio.priority, 9);
        assert_eq!(config.tasks.audio.name, "mic");
        assert_eq!(config.audio.source, AudioSourceKind::Simulated);
        assert_eq!(config.audio.sample_rate, 16000);
        assert_eq!(config.motion.mode, MotionMode::Single);
        assert_eq!(config.motion.period_ms, 250);
        assert_eq!(config.relay.host, "example.org");
        assert_eq!(config.relay.recv_buffer_size, 128);
        // Untouched sections keep their defaults.
        assert_eq!(config.tasks.relay.priority, 2);
        assert_eq!(config.relay.port, 80);
    }

    #[test]
    fn test_environment_overrides_file() {
        let (_dir, path) = write_temp_config(&create_valid_toml_content());
        std::env::set_var("SOMNODE_RELAY__USER_AGENT", "env-agent/2.0");
        let result = load_config_from(&path);
        std::env::remove_var("SOMNODE_RELAY__USER_AGENT");

        let config = result.expect("config with env override should load");
        assert_eq!(config.relay.user_agent, "env-agent/2.0");
    }

    #[test]
    fn test_inverted_priorities_are_rejected() {
        let toml = r#"
        [tasks.motion]
        name = "accel"
        priority = 7
        stack_size = 65536
        "#;
        let (_dir, path) = write_temp_config(toml);
        assert_matches!(load_config_from(&path), Err(ConfigError::Invalid(msg)) if msg.contains("audio priority"));
    }

    #[test]
    fn test_relay_above_motion_is_rejected() {
        let mut config = AppConfig::default();
        config.tasks.relay.priority = config.tasks.motion.priority;
        assert_matches!(validate(&config), Err(ConfigError::Invalid(msg)) if msg.contains("relay priority"));
    }

    #[test]
    fn test_monitor_above_audio_is_rejected() {
        let mut config = AppConfig::default();
        config.tasks.connectivity.priority = config.tasks.audio.priority + 1;
        assert_matches!(validate(&config), Err(ConfigError::Invalid(msg)) if msg.contains("connectivity monitor"));
    }

    #[test]
    fn test_unsupported_sample_width_is_rejected() {
        let mut config = AppConfig::default();
        config.audio.bits_per_sample = 12;
        assert_matches!(validate(&config), Err(ConfigError::Invalid(_)));

        config.audio.bits_per_sample = 0;
        assert_matches!(validate(&config), Err(ConfigError::Invalid(_)));
    }

    #[test]
    fn test_block_must_hold_whole_frames() {
        let mut config = AppConfig::default();
        config.audio.block_bytes = 1020; // 8-byte frames
        assert_matches!(validate(&config), Err(ConfigError::Invalid(msg)) if msg.contains("frames"));
    }

    #[test]
    fn test_relay_path_must_be_absolute() {
        let mut config = AppConfig::default();
        config.relay.path = "index.html".to_string();
        assert_matches!(validate(&config), Err(ConfigError::Invalid(_)));
    }

    #[test]
    fn test_oversized_success_countdown_is_rejected() {
        let mut config = AppConfig::default();
        config.relay.success_countdown = u32::MAX;
        assert_matches!(validate(&config), Err(ConfigError::Invalid(msg)) if msg.contains("countdown"));

        config.relay.success_countdown = MAX_SUCCESS_COUNTDOWN;
        assert_matches!(validate(&config), Ok(()));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let temp_dir = Builder::new().prefix("somnode_missing").tempdir().expect("temp dir");
        let result = load_config_from(&temp_dir.path().join("nope.toml"));
        assert_matches!(result, Err(ConfigError::Config(_)));
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let (_dir, path) = write_temp_config("[relay\nhost = ");
        assert_matches!(load_config_from(&path), Err(ConfigError::Config(_)));
    }

    #[test]
    fn test_ensure_user_config_copies_template_once() {
        let temp_dir = Builder::new().prefix("somnode_user").tempdir().expect("temp dir");
        let template = temp_dir.path().join("default.toml");
        fs::write(&template, "app_name = \"from-template\"\n").expect("write template");
        let user = temp_dir.path().join("user").join(USER_CONFIG_FILE);

        ensure_user_config(&user, &template).expect("first copy");
        assert_eq!(fs::read_to_string(&user).expect("read user"), "app_name = \"from-template\"\n");

        fs::write(&user, "app_name = \"edited\"\n").expect("edit user");
        ensure_user_config(&user, &template).expect("second call");
        assert_eq!(fs::read_to_string(&user).expect("read user"), "app_name = \"edited\"\n");
    }

    #[test]
    fn test_default_config_is_valid() {
        assert_matches!(validate(&AppConfig::default()), Ok(()));
    }

    #[test]
    fn test_shipped_default_toml_matches_built_in_defaults() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..").join(DEFAULT_CONFIG_PATH);
        let config = load_config_from(&path).expect("shipped default.toml should load");
        let defaults = AppConfig::default();

        assert_eq!(config.tasks.connectivity, defaults.tasks.connectivity);
        assert_eq!(config.tasks.audio, defaults.tasks.audio);
        assert_eq!(config.tasks.relay, defaults.tasks.relay);
        assert_eq!(config.audio.block_bytes, defaults.audio.block_bytes);
        assert_eq!(config.motion.mode, MotionMode::Fifo);
        assert_eq!(config.relay.port, defaults.relay.port);
        assert_eq!(config.relay.success_countdown, 5);
        assert!(config.status_directory.is_none());
    }
}
