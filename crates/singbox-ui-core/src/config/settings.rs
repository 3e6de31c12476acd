use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::instance::{CoordinationOptions, MutexName};
use crate::ipc::Endpoint;
use crate::retry::RetryPolicy;
use crate::supervisor::SupervisorOptions;

/// File name of the sing-box binary inside the core directory
#[cfg(windows)]
pub const CORE_EXECUTABLE: &str = "sing-box.exe";
/// File name of the sing-box binary inside the core directory
#[cfg(not(windows))]
pub const CORE_EXECUTABLE: &str = "sing-box";

/// Application settings (from config file)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// sing-box binary and its supervision
    #[serde(default)]
    pub core: CoreSettings,

    /// Single-instance coordination
    #[serde(default)]
    pub instance: InstanceSettings,

    /// Application log file
    #[serde(default)]
    pub logging: LoggingSettings,

    /// Subscription storage and fetching
    #[serde(default)]
    pub subscriptions: SubscriptionSettings,
}

/// Base directory for everything the application writes
fn app_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|p| p.join("singbox-ui"))
        .unwrap_or_else(|| PathBuf::from("singbox-ui"))
}

/// sing-box settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreSettings {
    /// Path to the sing-box executable
    #[serde(default = "default_executable")]
    pub executable: PathBuf,

    /// Working directory for every sing-box invocation
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Config passed as `-c` to `run` and `reload`
    #[serde(default = "default_config_path")]
    pub config_path: PathBuf,

    /// Start the core as soon as the primary instance is up
    #[serde(default)]
    pub autostart: bool,

    /// Kill leftover sing-box processes at startup and exit
    #[serde(default = "default_cleanup_strays")]
    pub cleanup_strays: bool,

    /// How long a freshly spawned core must survive to count as started
    #[serde(default = "default_startup_grace")]
    pub startup_grace_ms: u64,

    /// Graceful termination window before a forced kill
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_ms: u64,

    /// Liveness poll interval
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Upper bound for `reload` and `version` invocations
    #[serde(default = "default_reload_timeout")]
    pub reload_timeout_ms: u64,
}

fn default_work_dir() -> PathBuf {
    app_data_dir().join("core")
}

fn default_executable() -> PathBuf {
    default_work_dir().join(CORE_EXECUTABLE)
}

fn default_config_path() -> PathBuf {
    app_data_dir().join("config.json")
}

fn default_cleanup_strays() -> bool {
    true
}

fn default_startup_grace() -> u64 {
    1000
}

fn default_stop_timeout() -> u64 {
    3000
}

fn default_poll_interval() -> u64 {
    700
}

fn default_reload_timeout() -> u64 {
    5000
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            work_dir: default_work_dir(),
            config_path: default_config_path(),
            autostart: false,
            cleanup_strays: default_cleanup_strays(),
            startup_grace_ms: default_startup_grace(),
            stop_timeout_ms: default_stop_timeout(),
            poll_interval_ms: default_poll_interval(),
            reload_timeout_ms: default_reload_timeout(),
        }
    }
}

impl CoreSettings {
    /// Arguments for the long-running `run` invocation
    pub fn run_args(&self) -> Vec<String> {
        vec![
            "run".to_string(),
            "-c".to_string(),
            self.config_path.to_string_lossy().into_owned(),
        ]
    }

    /// Liveness poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Upper bound for one-shot invocations
    pub fn reload_timeout(&self) -> Duration {
        Duration::from_millis(self.reload_timeout_ms)
    }

    /// Executable file name, used to find stray processes
    pub fn executable_name(&self) -> String {
        self.executable
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| CORE_EXECUTABLE.to_string())
    }

    /// Options for [`SupervisedProcess::start`](crate::supervisor::SupervisedProcess::start)
    pub fn supervisor_options(&self) -> SupervisorOptions {
        SupervisorOptions {
            startup_grace: Duration::from_millis(self.startup_grace_ms),
            stop_timeout: Duration::from_millis(self.stop_timeout_ms),
        }
    }
}

/// Single-instance settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSettings {
    /// Name of the machine-wide mutex
    #[serde(default = "default_mutex_name")]
    pub mutex_name: String,

    /// Name of the local IPC endpoint (distinct from the mutex)
    #[serde(default = "default_ipc_name")]
    pub ipc_name: String,

    /// Connect attempts made by a secondary launch
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: usize,

    /// Timeout of a single connect attempt
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// How long the primary waits for a payload on a new connection
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    /// How long a restarter waits for the acknowledgement
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_ms: u64,

    /// Mutex re-acquisition attempts after a restart hand-off
    #[serde(default = "default_recapture_attempts")]
    pub recapture_attempts: usize,

    /// Delay between acknowledging a restart and tearing down
    #[serde(default = "default_shutdown_delay")]
    pub shutdown_delay_ms: u64,
}

fn default_mutex_name() -> String {
    "SingBox-UI-Instance".to_string()
}

fn default_ipc_name() -> String {
    "SingBox-UI-IPC".to_string()
}

fn default_connect_attempts() -> usize {
    3
}

fn default_connect_timeout() -> u64 {
    300
}

fn default_read_timeout() -> u64 {
    1000
}

fn default_ack_timeout() -> u64 {
    3000
}

fn default_recapture_attempts() -> usize {
    20
}

fn default_shutdown_delay() -> u64 {
    200
}

impl Default for InstanceSettings {
    fn default() -> Self {
        Self {
            mutex_name: default_mutex_name(),
            ipc_name: default_ipc_name(),
            connect_attempts: default_connect_attempts(),
            connect_timeout_ms: default_connect_timeout(),
            read_timeout_ms: default_read_timeout(),
            ack_timeout_ms: default_ack_timeout(),
            recapture_attempts: default_recapture_attempts(),
            shutdown_delay_ms: default_shutdown_delay(),
        }
    }
}

impl InstanceSettings {
    /// Mutex this configuration coordinates on
    pub fn mutex(&self) -> MutexName {
        MutexName::new(&self.mutex_name)
    }

    /// IPC endpoint this configuration listens on / connects to
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::named(&self.ipc_name)
    }

    /// Bounded policy for the secondary-launch connect loop
    pub fn connect_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.connect_attempts)
            .with_delays(Duration::from_millis(100), Duration::from_millis(400))
            .with_attempt_timeout(Duration::from_millis(self.connect_timeout_ms))
    }

    /// Bounded policy for mutex re-acquisition after a restart hand-off
    pub fn recapture_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.recapture_attempts)
            .with_delays(Duration::from_millis(100), Duration::from_millis(500))
    }

    /// Payload wait applied by the server on each connection
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Delay between acknowledging a restart and tearing down
    pub fn shutdown_delay(&self) -> Duration {
        Duration::from_millis(self.shutdown_delay_ms)
    }

    /// Everything the launch state machine needs
    pub fn coordination_options(&self) -> CoordinationOptions {
        CoordinationOptions {
            connect: self.connect_policy(),
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            recapture: self.recapture_policy(),
        }
    }
}

/// Log file settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Path of the shared application / core log file
    #[serde(default = "default_log_file")]
    pub file: PathBuf,

    /// Minimum hours between two truncations
    #[serde(default = "default_rotate_hours")]
    pub rotate_hours: u64,
}

fn default_log_file() -> PathBuf {
    app_data_dir().join("singbox-ui.log")
}

fn default_rotate_hours() -> u64 {
    24
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            file: default_log_file(),
            rotate_hours: default_rotate_hours(),
        }
    }
}

/// Subscription settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionSettings {
    /// JSON file holding the subscription list
    #[serde(default = "default_store")]
    pub store: PathBuf,

    /// Upper bound for a single config download
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_ms: u64,
}

fn default_store() -> PathBuf {
    app_data_dir().join("subscriptions.json")
}

fn default_fetch_timeout() -> u64 {
    30_000
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            store: default_store(),
            fetch_timeout_ms: default_fetch_timeout(),
        }
    }
}

impl SubscriptionSettings {
    /// Upper bound for a single config download
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

impl Settings {
    /// Load settings from config file or use defaults
    pub fn load(path: Option<&PathBuf>) -> Result<Self> {
        // Try custom path first
        if let Some(p) = path {
            if p.exists() {
                return Self::load_file(p);
            }
        }

        // Try default config locations
        let default_paths = [
            dirs::config_dir().map(|p| p.join("singbox-ui/config.toml")),
            dirs::home_dir().map(|p| p.join(".singbox-ui.toml")),
        ];

        for path in default_paths.iter().flatten() {
            if path.exists() {
                return Self::load_file(path);
            }
        }

        // Return defaults if no config file found
        Ok(Self::default())
    }

    fn load_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    /// Validate and normalize settings values
    ///
    /// Zero intervals would spin the event loop and zero attempts would
    /// make every retry loop fail without trying.
    pub fn validate(&mut self) {
        const MIN_POLL_INTERVAL: u64 = 50;
        const MIN_TIMEOUT: u64 = 10;

        if self.core.poll_interval_ms < MIN_POLL_INTERVAL {
            self.core.poll_interval_ms = MIN_POLL_INTERVAL;
        }
        if self.core.reload_timeout_ms < MIN_TIMEOUT {
            self.core.reload_timeout_ms = MIN_TIMEOUT;
        }
        if self.instance.connect_attempts == 0 {
            self.instance.connect_attempts = 1;
        }
        if self.instance.recapture_attempts == 0 {
            self.instance.recapture_attempts = 1;
        }
        if self.instance.connect_timeout_ms < MIN_TIMEOUT {
            self.instance.connect_timeout_ms = MIN_TIMEOUT;
        }
        if self.instance.read_timeout_ms < MIN_TIMEOUT {
            self.instance.read_timeout_ms = MIN_TIMEOUT;
        }
        if self.logging.rotate_hours == 0 {
            self.logging.rotate_hours = 1;
        }
    }
}
