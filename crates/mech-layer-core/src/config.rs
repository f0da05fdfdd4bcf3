use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the connection bootstrap retry policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt (0 means a single attempt)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fixed delay between attempts (in milliseconds)
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Stop retrying as soon as the server process is gone
    #[serde(default)]
    pub abort_on_process_exit: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            abort_on_process_exit: false,
        }
    }
}

impl RetryConfig {
    /// Create a RetryConfig with the reference policy (5 retries, 1 second apart)
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a RetryConfig with no retries (fail fast)
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            retry_delay_ms: 0,
            abort_on_process_exit: false,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_abort_on_process_exit(mut self, abort: bool) -> Self {
        self.abort_on_process_exit = abort;
        self
    }

    /// Validate the configuration and return errors if invalid
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_retries > 100 {
            return Err(anyhow::anyhow!(
                "max_retries should not exceed 100 to avoid excessive retries"
            ));
        }

        if self.retry_delay_ms > 60_000 {
            return Err(anyhow::anyhow!("retry_delay_ms should not exceed 60 seconds"));
        }

        Ok(())
    }

    /// Get the retry delay as Duration
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Total number of attempts the policy allows
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Network endpoint the server listens on
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Endpoint {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Loopback endpoint on the given port
    pub fn loopback(port: u16) -> Self {
        Self::new(default_host(), port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Main launcher configuration
#[derive(Default, Debug, Clone, PartialEq, Builder)]
#[builder(setter(into, strip_option))]
pub struct LauncherConfig {
    #[builder(default = "\"mech\".to_string()")]
    pub name: String,
    pub command: PathBuf,
    #[builder(default = "vec![\"serve\".to_string()]")]
    #[builder(setter(custom))]
    pub args: Vec<String>,
    #[builder(default)]
    #[builder(setter(custom))]
    pub env: HashMap<String, String>,
    #[builder(default)]
    pub working_directory: Option<PathBuf>,
    #[builder(default)]
    pub endpoint: Endpoint,
    #[builder(default)]
    pub retry_config: RetryConfig,
}

impl LauncherConfig {
    pub fn builder() -> LauncherConfigBuilder {
        LauncherConfigBuilder::default()
    }

    /// Configuration for a server built inside an installation root
    ///
    /// The executable is expected at `<root>/server/target/debug/mech`.
    pub fn for_install_root(root: impl AsRef<Path>) -> Self {
        Self {
            name: "mech".to_string(),
            command: server_executable(root.as_ref()),
            args: vec!["serve".to_string()],
            env: HashMap::new(),
            working_directory: None,
            endpoint: Endpoint::default(),
            retry_config: RetryConfig::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.command.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("command must not be empty"));
        }
        if self.endpoint.host.is_empty() {
            return Err(anyhow::anyhow!("endpoint host must not be empty"));
        }
        if self.endpoint.port == 0 {
            return Err(anyhow::anyhow!("endpoint port must not be 0"));
        }
        self.retry_config.validate()
    }
}

impl LauncherConfigBuilder {
    pub fn args<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        let args: Vec<String> = iter.into_iter().map(|s| s.to_string()).collect();
        self.args = Some(args);
        self
    }
    pub fn env<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let map = self.env.get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), value.to_string());

        self
    }

    pub fn env_multi<T: ToString, I: IntoIterator<Item = (T, T)>>(&mut self, iter: I) -> &mut Self {
        let env = self.env.get_or_insert_with(HashMap::new);
        for (key, value) in iter {
            env.insert(key.to_string(), value.to_string());
        }
        self
    }
}

/// Location of the server binary relative to an installation root
pub fn server_executable(root: &Path) -> PathBuf {
    root.join("server").join("target").join("debug").join("mech")
}

// Default value functions for serde
fn default_max_retries() -> u32 {
    5
}
fn default_retry_delay_ms() -> u64 {
    1_000
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8081
}
