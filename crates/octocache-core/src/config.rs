use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::buffer::{DEFAULT_MAX_BUFFER_BYTES, DEFAULT_MAX_RETAINED};
use crate::options::{
    CacheOptions, DEFAULT_EXPIRATION, DEFAULT_MAXIMUM_KEY_LENGTH, DEFAULT_MAXIMUM_PAYLOAD_BYTES,
    EntryOptions,
};

/// Longest accepted entry lifetime (one year).
pub const MAX_EXPIRATION_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheSettings {
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub local: LocalSection,
    #[serde(default)]
    pub shared: SharedSection,
    #[serde(default)]
    pub buffer_pool: BufferPoolSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl CacheSettings {
    pub fn validate(&self) -> Result<(), String> {
        if self.cache.default_expiration_secs == 0 {
            return Err("cache.default_expiration_secs must be > 0".into());
        }
        if self.cache.default_expiration_secs > MAX_EXPIRATION_SECS {
            return Err(format!(
                "cache.default_expiration_secs must be <= {MAX_EXPIRATION_SECS}"
            ));
        }
        match self.cache.local_expiration_secs {
            Some(0) => return Err("cache.local_expiration_secs must be > 0 when set".into()),
            Some(secs) if secs > MAX_EXPIRATION_SECS => {
                return Err(format!(
                    "cache.local_expiration_secs must be <= {MAX_EXPIRATION_SECS}"
                ));
            }
            _ => {}
        }
        if self.cache.maximum_payload_bytes == 0 {
            return Err("cache.maximum_payload_bytes must be > 0".into());
        }
        if self.cache.maximum_key_length == 0 {
            return Err("cache.maximum_key_length must be > 0".into());
        }
        if self.local.max_total_bytes == Some(0) {
            return Err("local.max_total_bytes must be > 0 when set".into());
        }
        if self.buffer_pool.max_buffer_bytes == 0 {
            return Err("buffer_pool.max_buffer_bytes must be > 0".into());
        }
        match self.logging.level.to_ascii_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" | "off" => {}
            other => return Err(format!("logging.level '{other}' is not a valid level")),
        }
        Ok(())
    }

    /// Orchestrator options derived from the `[cache]` section.
    pub fn cache_options(&self) -> CacheOptions {
        let mut default_entry =
            EntryOptions::new(Duration::from_secs(self.cache.default_expiration_secs));
        if let Some(secs) = self.cache.local_expiration_secs {
            default_entry = default_entry.with_local_expiration(Duration::from_secs(secs));
        }
        CacheOptions {
            default_entry,
            maximum_payload_bytes: self.cache.maximum_payload_bytes,
            maximum_key_length: self.cache.maximum_key_length,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheSection {
    #[serde(default = "default_expiration_secs")]
    pub default_expiration_secs: u64,
    /// Local tier lifetime; defaults to `default_expiration_secs`.
    #[serde(default)]
    pub local_expiration_secs: Option<u64>,
    #[serde(default = "default_maximum_payload_bytes")]
    pub maximum_payload_bytes: usize,
    #[serde(default = "default_maximum_key_length")]
    pub maximum_key_length: usize,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            default_expiration_secs: default_expiration_secs(),
            local_expiration_secs: None,
            maximum_payload_bytes: default_maximum_payload_bytes(),
            maximum_key_length: default_maximum_key_length(),
        }
    }
}

fn default_expiration_secs() -> u64 {
    DEFAULT_EXPIRATION.as_secs()
}
fn default_maximum_payload_bytes() -> usize {
    DEFAULT_MAXIMUM_PAYLOAD_BYTES
}
fn default_maximum_key_length() -> usize {
    DEFAULT_MAXIMUM_KEY_LENGTH
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalSection {
    /// Size budget for the local tier. Unbounded when absent.
    #[serde(default)]
    pub max_total_bytes: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SharedAccessMode {
    Legacy,
    #[default]
    Buffered,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SharedSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: SharedAccessMode,
    /// Whether the shared store supports native tag invalidation.
    #[serde(default)]
    pub tags: bool,
    #[serde(default)]
    pub latency_ms: Option<u64>,
}

impl Default for SharedSection {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: SharedAccessMode::default(),
            tags: false,
            latency_ms: None,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BufferPoolSection {
    #[serde(default = "default_max_retained")]
    pub max_retained: usize,
    #[serde(default = "default_max_buffer_bytes")]
    pub max_buffer_bytes: usize,
}

impl Default for BufferPoolSection {
    fn default() -> Self {
        Self {
            max_retained: default_max_retained(),
            max_buffer_bytes: default_max_buffer_bytes(),
        }
    }
}

fn default_max_retained() -> usize {
    DEFAULT_MAX_RETAINED
}
fn default_max_buffer_bytes() -> usize {
    DEFAULT_MAX_BUFFER_BYTES
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

pub mod loader {
    use super::CacheSettings;
    use config::{Config, Environment, File};
    use std::path::{Path, PathBuf};

    /// File read when no path is given.
    pub const DEFAULT_CONFIG_FILE: &str = "octocache.toml";

    pub fn load_settings(path: Option<&Path>) -> Result<CacheSettings, String> {
        let mut builder = Config::builder();
        let file = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        if file.exists() {
            builder = builder.add_source(File::from(file));
        } else if path.is_some() {
            return Err(format!("config file not found: {}", file.display()));
        }
        // Environment variable overrides, e.g., OCTOCACHE__CACHE__MAXIMUM_KEY_LENGTH=256
        builder = builder.add_source(
            Environment::with_prefix("OCTOCACHE")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: CacheSettings = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}
