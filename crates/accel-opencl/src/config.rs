//! Runtime configuration.

use std::path::PathBuf;

use tracing::warn;

pub const ENV_PLATFORM: &str = "ACCEL_CL_PLATFORM";
pub const ENV_DEVICE: &str = "ACCEL_CL_DEVICE";
pub const ENV_INCLUDE_PATH: &str = "ACCEL_CL_INCLUDE_PATH";
pub const ENV_KERNEL_CACHE_DIR: &str = "ACCEL_CL_KERNEL_CACHE_DIR";
pub const ENV_DISABLE_KERNEL_CACHE: &str = "ACCEL_CL_DISABLE_KERNEL_CACHE";

/// Device selection and kernel cache settings for a
/// [`ClRuntime`](crate::runtime::ClRuntime).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Index into the platform list.
    pub platform_index: usize,
    /// Index into the selected platform's device list.
    pub device_index: usize,
    /// Passed to every build as `-I<path>`.
    pub include_path: Option<PathBuf>,
    /// Directory of the persisted kernel cache.
    pub kernel_cache_dir: Option<PathBuf>,
    /// Save the persisted cache when the runtime drops.
    pub save_kernel_cache_on_drop: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            platform_index: 0,
            device_index: 0,
            include_path: None,
            kernel_cache_dir: None,
            save_kernel_cache_on_drop: true,
        }
    }
}

impl RuntimeConfig {
    /// Defaults with `ACCEL_CL_*` overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply `ACCEL_CL_*` environment overrides. Unparsable values are
    /// ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Some(index) = env_index(ENV_PLATFORM) {
            self.platform_index = index;
        }
        if let Some(index) = env_index(ENV_DEVICE) {
            self.device_index = index;
        }
        if let Some(path) = env_path(ENV_INCLUDE_PATH) {
            self.include_path = Some(path);
        }
        if let Some(path) = env_path(ENV_KERNEL_CACHE_DIR) {
            self.kernel_cache_dir = Some(path);
        }
        if let Ok(val) = std::env::var(ENV_DISABLE_KERNEL_CACHE) {
            if matches!(val.to_lowercase().as_str(), "1" | "true" | "yes") {
                self.kernel_cache_dir = None;
                self.save_kernel_cache_on_drop = false;
            }
        }
    }

    /// Include path as a string, if set and valid UTF-8.
    pub fn include_path_str(&self) -> Option<&str> {
        self.include_path.as_deref().and_then(|p| p.to_str())
    }
}

fn env_index(key: &str) -> Option<usize> {
    let val = std::env::var(key).ok()?;
    match val.trim().parse() {
        Ok(index) => Some(index),
        Err(err) => {
            warn!(key, value = %val, %err, "ignoring invalid environment override");
            None
        }
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var_os(key).filter(|v| !v.is_empty()).map(PathBuf::from)
}
