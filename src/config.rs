use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::consts::{BASE_IMAGE, GATEWAY_SERVER_PORT, PODMAN_MACHINE_NAME};

/// Tunables for the sandbox subsystem.
///
/// Every field can be overridden through an `ARCHESTRA_*` environment variable,
/// a `.env` file in the working directory is honoured as well.
#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub base_image: String,
    pub podman_binary: PathBuf,
    pub machine_name: String,
    /// Whether a podman machine VM has to be managed (macOS/Windows)
    pub use_podman_machine: bool,
    pub gateway_port: u16,
    pub data_dir: PathBuf,
    pub max_concurrent_starts: usize,
    pub readiness_attempts: u32,
    pub readiness_backoff: Duration,
    pub readiness_probe_timeout: Duration,
    pub health_check_interval: Duration,
    pub health_failure_threshold: u32,
    pub stop_grace_period: Duration,
    pub status_broadcast_interval: Duration,
    pub runtime_bootstrap_attempts: u32,
    pub runtime_retry_delay: Duration,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            base_image: BASE_IMAGE.to_string(),
            podman_binary: PathBuf::from("podman"),
            machine_name: PODMAN_MACHINE_NAME.to_string(),
            use_podman_machine: cfg!(not(target_os = "linux")),
            gateway_port: GATEWAY_SERVER_PORT,
            data_dir: default_data_dir(),
            max_concurrent_starts: 4,
            readiness_attempts: 10,
            readiness_backoff: Duration::from_millis(500),
            readiness_probe_timeout: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(15),
            health_failure_threshold: 3,
            stop_grace_period: Duration::from_secs(10),
            status_broadcast_interval: Duration::from_secs(1),
            runtime_bootstrap_attempts: 3,
            runtime_retry_delay: Duration::from_secs(2),
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join(".archestra")
}

impl SandboxSettings {
    /// Load settings from the environment on top of the defaults
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let mut settings = Self::default();

        if let Ok(image) = std::env::var("ARCHESTRA_BASE_IMAGE") {
            settings.base_image = image;
        }
        if let Ok(binary) = std::env::var("ARCHESTRA_PODMAN_BINARY") {
            settings.podman_binary = PathBuf::from(binary);
        }
        if let Ok(name) = std::env::var("ARCHESTRA_PODMAN_MACHINE") {
            settings.machine_name = name;
        }
        if let Ok(dir) = std::env::var("ARCHESTRA_DATA_DIR") {
            settings.data_dir = PathBuf::from(dir);
        }

        override_parsed("ARCHESTRA_USE_PODMAN_MACHINE", &mut settings.use_podman_machine);
        override_parsed("ARCHESTRA_GATEWAY_PORT", &mut settings.gateway_port);
        override_parsed("ARCHESTRA_MAX_CONCURRENT_STARTS", &mut settings.max_concurrent_starts);
        override_parsed("ARCHESTRA_READINESS_ATTEMPTS", &mut settings.readiness_attempts);
        override_parsed(
            "ARCHESTRA_HEALTH_FAILURE_THRESHOLD",
            &mut settings.health_failure_threshold,
        );
        override_parsed(
            "ARCHESTRA_RUNTIME_BOOTSTRAP_ATTEMPTS",
            &mut settings.runtime_bootstrap_attempts,
        );

        override_millis("ARCHESTRA_READINESS_BACKOFF_MS", &mut settings.readiness_backoff);
        override_millis(
            "ARCHESTRA_READINESS_PROBE_TIMEOUT_MS",
            &mut settings.readiness_probe_timeout,
        );
        override_millis(
            "ARCHESTRA_HEALTH_CHECK_INTERVAL_MS",
            &mut settings.health_check_interval,
        );
        override_millis("ARCHESTRA_STOP_GRACE_PERIOD_MS", &mut settings.stop_grace_period);
        override_millis(
            "ARCHESTRA_STATUS_BROADCAST_INTERVAL_MS",
            &mut settings.status_broadcast_interval,
        );
        override_millis("ARCHESTRA_RUNTIME_RETRY_DELAY_MS", &mut settings.runtime_retry_delay);

        settings.max_concurrent_starts = settings.max_concurrent_starts.max(1);
        settings
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("archestra.db")
    }
}

fn override_parsed<T: FromStr>(key: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => warn!("Ignoring invalid value for {key}: {raw}"),
        }
    }
}

fn override_millis(key: &str, target: &mut Duration) {
    let mut millis = target.as_millis() as u64;
    override_parsed(key, &mut millis);
    *target = Duration::from_millis(millis);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = SandboxSettings::default();
        assert_eq!(settings.base_image, BASE_IMAGE);
        assert_eq!(settings.gateway_port, GATEWAY_SERVER_PORT);
        assert_eq!(settings.status_broadcast_interval, Duration::from_secs(1));
        assert!(settings.database_path().ends_with("archestra.db"));
    }

    #[test]
    fn test_override_millis_ignores_garbage() {
        std::env::set_var("ARCHESTRA_TEST_GARBAGE_MS", "not-a-number");
        let mut value = Duration::from_millis(250);
        override_millis("ARCHESTRA_TEST_GARBAGE_MS", &mut value);
        assert_eq!(value, Duration::from_millis(250));

        std::env::set_var("ARCHESTRA_TEST_VALID_MS", "75");
        override_millis("ARCHESTRA_TEST_VALID_MS", &mut value);
        assert_eq!(value, Duration::from_millis(75));
    }
}
