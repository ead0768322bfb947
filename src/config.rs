//! Manager Configuration
//!
//! A [`ResidencyConfig`] can be built programmatically or loaded from
//! environment variables.
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `RESIDENCY_HOST_CAPACITY` | Host store capacity in bytes (0 = unlimited) | 0 |
//! | `RESIDENCY_DEVICE_CAPACITY` | Device store capacity in bytes (0 = unlimited) | 0 |
//! | `RESIDENCY_DEVICE` | Device backend (`none`/`simulated`/`wgpu`) | none |
//! | `RESIDENCY_STRICT_SYNC` | Push/pull over undeclared ranges is an error ("true"/"false") | true |
//! | `RESIDENCY_WORKER_CHUNKS` | Chunks `parallel_for` splits a loop into | CPU count |
//!
//! # Example
//!
//! ```
//! use residency::config::{DeviceBackend, ResidencyConfig};
//!
//! let config = ResidencyConfig::builder()
//!     .device(DeviceBackend::Simulated)
//!     .device_capacity(1 << 20)
//!     .strict_sync(false)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.device, DeviceBackend::Simulated);
//! ```

use std::env;
use std::fmt;

/// Which store backs the device address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceBackend {
    /// No device; device contexts cannot be created.
    #[default]
    None,
    /// In-process block arena tagged as device memory.
    Simulated,
    /// `wgpu` buffers on a real adapter (`gpu` feature).
    Wgpu,
}

impl DeviceBackend {
    /// Parses a backend name.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" | "off" => Some(DeviceBackend::None),
            "simulated" | "sim" | "arena" => Some(DeviceBackend::Simulated),
            "wgpu" | "gpu" => Some(DeviceBackend::Wgpu),
            _ => None,
        }
    }
}

/// Configuration of a [`ResidencyManager`](crate::ResidencyManager).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResidencyConfig {
    /// Host store capacity in bytes (0 = unlimited).
    pub host_capacity: usize,
    /// Device store capacity in bytes (0 = unlimited).
    pub device_capacity: usize,
    /// Device backend.
    pub device: DeviceBackend,
    /// Reject push/pull over ranges never declared dirty.
    pub strict_sync: bool,
    /// Number of chunks `parallel_for` splits a loop into.
    pub worker_chunks: usize,
}

impl Default for ResidencyConfig {
    fn default() -> Self {
        Self {
            host_capacity: 0,
            device_capacity: 0,
            device: DeviceBackend::None,
            strict_sync: true,
            worker_chunks: num_cpus(),
        }
    }
}

impl ResidencyConfig {
    /// Creates a builder.
    pub fn builder() -> ResidencyConfigBuilder {
        ResidencyConfigBuilder::default()
    }

    /// Loads configuration from environment variables.
    ///
    /// Unset or unparsable variables keep their defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_usize("RESIDENCY_HOST_CAPACITY") {
            config.host_capacity = val;
        }
        if let Some(val) = parse_env_usize("RESIDENCY_DEVICE_CAPACITY") {
            config.device_capacity = val;
        }
        if let Ok(val) = env::var("RESIDENCY_DEVICE") {
            match DeviceBackend::parse(&val) {
                Some(backend) => config.device = backend,
                None => tracing::warn!(value = %val, "ignoring unknown RESIDENCY_DEVICE"),
            }
        }
        if let Some(val) = parse_env_bool("RESIDENCY_STRICT_SYNC") {
            config.strict_sync = val;
        }
        if let Some(val) = parse_env_usize("RESIDENCY_WORKER_CHUNKS") {
            if val > 0 {
                config.worker_chunks = val;
            }
        }

        config
    }

    /// Checks the configuration for values the manager cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_chunks == 0 {
            return Err(ConfigError::InvalidValue {
                field: "worker_chunks",
                message: "must be at least 1".into(),
            });
        }
        if self.device == DeviceBackend::Wgpu && !cfg!(feature = "gpu") {
            return Err(ConfigError::InvalidValue {
                field: "device",
                message: "the wgpu backend requires the `gpu` feature".into(),
            });
        }
        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A field holds a value the manager cannot use.
    InvalidValue {
        /// Field name.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidValue { field, message } => {
                write!(f, "invalid configuration for '{field}': {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Builder for [`ResidencyConfig`].
#[derive(Debug, Clone, Default)]
pub struct ResidencyConfigBuilder {
    config: ResidencyConfig,
}

impl ResidencyConfigBuilder {
    /// Host store capacity in bytes (0 = unlimited).
    pub fn host_capacity(mut self, bytes: usize) -> Self {
        self.config.host_capacity = bytes;
        self
    }

    /// Device store capacity in bytes (0 = unlimited).
    pub fn device_capacity(mut self, bytes: usize) -> Self {
        self.config.device_capacity = bytes;
        self
    }

    /// Device backend.
    pub fn device(mut self, backend: DeviceBackend) -> Self {
        self.config.device = backend;
        self
    }

    /// Reject push/pull over ranges never declared dirty.
    pub fn strict_sync(mut self, strict: bool) -> Self {
        self.config.strict_sync = strict;
        self
    }

    /// Chunks `parallel_for` splits a loop into.
    pub fn worker_chunks(mut self, chunks: usize) -> Self {
        self.config.worker_chunks = chunks;
        self
    }

    /// Validates and returns the configuration.
    pub fn build(self) -> Result<ResidencyConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn parse_env_bool(name: &str) -> Option<bool> {
    env::var(name).ok().and_then(|s| match s.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    })
}

fn num_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}
