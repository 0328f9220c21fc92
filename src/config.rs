//! World configuration.

use crate::error::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Default size of the main shared pool (16 MiB).
pub const DEFAULT_MAIN_POOL_SIZE: usize = 16 * 1024 * 1024;

/// Smallest pool the allocator accepts.
pub const MIN_POOL_SIZE: usize = 64 * 1024;

/// Default interval at which blocked parties re-check peer liveness.
pub const DEFAULT_LIVENESS_POLL: Duration = Duration::from_millis(250);

/// Where pool memory comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryPolicy {
    /// Pools are files in [`WorldConfig::shm_dir`] mapped by every member.
    #[default]
    Shared,
    /// Pools are process-local heap segments. Only one member can exist.
    Local,
}

/// Configuration used when entering a World.
#[derive(Debug, Clone)]
pub struct WorldConfig {
    /// Which World to enter. Processes using the same index and directory
    /// share one World.
    pub world_index: u32,
    /// Directory holding the pool backing files (normally a tmpfs).
    pub shm_dir: PathBuf,
    /// Shared or process-local pool memory.
    pub policy: MemoryPolicy,
    /// Size of the main pool in bytes.
    pub main_pool_size: usize,
    /// Retain allocation manifests and report leaks when pools go away.
    pub debug_pools: bool,
    /// Require an explicit EXECUTE permission for calls from non-owners.
    pub secure_calls: bool,
    /// How often blocked parties re-check whether the peer they wait on is
    /// still a World member.
    pub liveness_poll: Duration,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            world_index: 0,
            shm_dir: PathBuf::from("/dev/shm"),
            policy: MemoryPolicy::Shared,
            main_pool_size: DEFAULT_MAIN_POOL_SIZE,
            debug_pools: false,
            secure_calls: true,
            liveness_poll: DEFAULT_LIVENESS_POLL,
        }
    }
}

impl WorldConfig {
    /// Default configuration for the given World index.
    pub fn new(world_index: u32) -> Self {
        Self {
            world_index,
            ..Default::default()
        }
    }

    /// Configuration for a single-process World backed by heap memory.
    pub fn local() -> Self {
        Self {
            policy: MemoryPolicy::Local,
            ..Default::default()
        }
    }

    /// Set the backing directory.
    pub fn with_shm_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.shm_dir = dir.into();
        self
    }

    /// Set the memory policy.
    pub fn with_policy(mut self, policy: MemoryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the main pool size.
    pub fn with_main_pool_size(mut self, size: usize) -> Self {
        self.main_pool_size = size;
        self
    }

    /// Enable or disable allocation manifests.
    pub fn with_debug_pools(mut self, debug: bool) -> Self {
        self.debug_pools = debug;
        self
    }

    /// Enable or disable call permission checks.
    pub fn with_secure_calls(mut self, secure: bool) -> Self {
        self.secure_calls = secure;
        self
    }

    /// Set the liveness poll interval.
    pub fn with_liveness_poll(mut self, poll: Duration) -> Self {
        self.liveness_poll = poll;
        self
    }

    /// Read overrides from `FUSION_*` environment variables on top of the
    /// defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) but with an arbitrary lookup function.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = lookup("FUSION_WORLD") {
            config.world_index = parse_number("FUSION_WORLD", &v)?;
        }
        if let Some(v) = lookup("FUSION_SHM_DIR") {
            config.shm_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FUSION_LOCAL") {
            if parse_flag("FUSION_LOCAL", &v)? {
                config.policy = MemoryPolicy::Local;
            }
        }
        if let Some(v) = lookup("FUSION_POOL_SIZE") {
            config.main_pool_size = parse_number("FUSION_POOL_SIZE", &v)?;
        }
        if let Some(v) = lookup("FUSION_DEBUG") {
            config.debug_pools = parse_flag("FUSION_DEBUG", &v)?;
        }
        if let Some(v) = lookup("FUSION_SECURE") {
            config.secure_calls = parse_flag("FUSION_SECURE", &v)?;
        }
        if let Some(v) = lookup("FUSION_LIVENESS_MS") {
            let ms: u64 = parse_number("FUSION_LIVENESS_MS", &v)?;
            config.liveness_poll = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.main_pool_size < MIN_POOL_SIZE {
            return Err(Error::InvalidArgument(format!(
                "main pool size {} is below the minimum of {}",
                self.main_pool_size, MIN_POOL_SIZE
            )));
        }
        if self.liveness_poll.is_zero() {
            return Err(Error::InvalidArgument(
                "liveness poll interval must be non-zero".into(),
            ));
        }
        if self.policy == MemoryPolicy::Shared && self.shm_dir.as_os_str().is_empty() {
            return Err(Error::InvalidArgument("shm_dir is empty".into()));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("{key}: not a number: {value:?}")))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::InvalidArgument(format!(
            "{key}: not a boolean: {value:?}"
        ))),
    }
}
