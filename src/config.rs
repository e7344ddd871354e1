//! Stream delivery configuration and per-platform resolution.
//!
//! Every delivery session runs against one immutable [`StreamConfig`].
//! Configs are looked up by platform id through a [`PlatformTable`]; unknown
//! ids resolve to [`DEFAULT_STREAM_CONFIG`] instead of failing.
//!
//! ```text
//! resolve_config("telegram")  --> built-in telegram entry
//! resolve_config("carrier-x") --> DEFAULT_STREAM_CONFIG
//! PlatformTable::load(path)   --> built-ins overlaid with file entries
//! ```

use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Environment variable overriding `abort_on_delivery_error` (`true`/`false`).
pub const ABORT_ON_DELIVERY_ERROR_ENV: &str = "STREAM_ABORT_ON_DELIVERY_ERROR";

/// How a handler competes for the per-session lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockMode {
    /// Queue behind the current holder (FIFO) until `acquire_timeout_ms`.
    ExclusiveWait,
    /// Fail immediately if the session is held.
    ExclusiveReject,
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockMode::ExclusiveWait => write!(f, "exclusive-wait"),
            LockMode::ExclusiveReject => write!(f, "exclusive-reject"),
        }
    }
}

/// Tuning parameters for one delivery session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Buffer size (chars) that triggers a size flush.
    pub max_buffer_chars: usize,
    /// Buffer age that triggers an age flush.
    pub max_buffer_age_ms: u64,
    /// Minimum buffered chars before an age or sentence flush may fire.
    pub min_flush_chars: usize,
    /// Hard per-message limit of the destination platform (chars).
    pub platform_max_message_chars: usize,
    /// Regex matched against the buffer tail to detect a sentence boundary.
    pub sentence_boundary_pattern: Cow<'static, str>,
    /// Whether the destination accepts incremental messages.
    pub supports_streaming: bool,
    /// How long a handler waits for the session lock.
    pub acquire_timeout_ms: u64,
    /// How long to wait for the next provider delta.
    pub delta_read_timeout_ms: u64,
    /// Per-attempt timeout for a single chunk delivery.
    pub delivery_timeout_ms: u64,
    /// Stop delivering after the first failed chunk.
    pub abort_on_delivery_error: bool,
    /// Lock contention policy.
    pub lock_mode: LockMode,
    /// Pause between chunks of the same flush (0 disables pacing).
    pub inter_chunk_delay_ms: u64,
}

/// Configuration used for platforms missing from the table.
pub const DEFAULT_STREAM_CONFIG: StreamConfig = StreamConfig {
    max_buffer_chars: 1200,
    max_buffer_age_ms: 1500,
    min_flush_chars: 200,
    platform_max_message_chars: 4000,
    sentence_boundary_pattern: Cow::Borrowed(r#"[.!?]["')\]]*\s+$"#),
    supports_streaming: true,
    acquire_timeout_ms: 30_000,
    delta_read_timeout_ms: 60_000,
    delivery_timeout_ms: 15_000,
    abort_on_delivery_error: false,
    lock_mode: LockMode::ExclusiveWait,
    inter_chunk_delay_ms: 0,
};

impl Default for StreamConfig {
    fn default() -> Self {
        DEFAULT_STREAM_CONFIG
    }
}

impl StreamConfig {
    /// Check every field, returning the config unchanged when valid.
    pub fn validated(self) -> Result<Self, ConfigError> {
        self.validate()?;
        Ok(self)
    }

    /// Check every field. Zero thresholds and timeouts are rejected.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive_sizes = [
            ("max_buffer_chars", self.max_buffer_chars),
            ("min_flush_chars", self.min_flush_chars),
            ("platform_max_message_chars", self.platform_max_message_chars),
        ];
        for (key, value) in positive_sizes {
            if value == 0 {
                return Err(ConfigError::invalid(key, "must be greater than zero"));
            }
        }

        let positive_durations = [
            ("max_buffer_age_ms", self.max_buffer_age_ms),
            ("acquire_timeout_ms", self.acquire_timeout_ms),
            ("delta_read_timeout_ms", self.delta_read_timeout_ms),
            ("delivery_timeout_ms", self.delivery_timeout_ms),
        ];
        for (key, value) in positive_durations {
            if value == 0 {
                return Err(ConfigError::invalid(key, "must be greater than zero"));
            }
        }

        self.sentence_regex().map(|_| ())
    }

    /// Compile the sentence boundary pattern, anchored to the end of the
    /// buffer so that only a boundary at the tail can match.
    pub fn sentence_regex(&self) -> Result<Regex, ConfigError> {
        let pattern = &self.sentence_boundary_pattern;
        if pattern.trim().is_empty() {
            return Err(ConfigError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "pattern is empty".to_string(),
            });
        }
        let invalid = |e: regex::Error| ConfigError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        };
        Regex::new(pattern).map_err(invalid)?;
        Regex::new(&format!("(?:{pattern})$")).map_err(invalid)
    }

    /// Hard ceiling for a buffer held open by an unterminated code fence.
    pub fn safety_ceiling_chars(&self) -> usize {
        self.max_buffer_chars.saturating_mul(4)
    }

    /// Apply overrides from the process environment.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(value) = std::env::var(ABORT_ON_DELIVERY_ERROR_ENV) {
            match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => self.abort_on_delivery_error = true,
                "0" | "false" | "no" => self.abort_on_delivery_error = false,
                other => tracing::warn!(
                    var = ABORT_ON_DELIVERY_ERROR_ENV,
                    value = other,
                    "Ignoring unrecognised boolean override"
                ),
            }
        }
        self
    }
}

/// Platform id → stream configuration lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct PlatformTable {
    entries: HashMap<String, StreamConfig>,
    default: StreamConfig,
}

impl PlatformTable {
    /// Build a table, validating every entry and the default.
    pub fn new(
        entries: HashMap<String, StreamConfig>,
        default: StreamConfig,
    ) -> Result<Self, ConfigError> {
        default.validate()?;
        let mut table = Self {
            entries: HashMap::with_capacity(entries.len()),
            default,
        };
        for (id, config) in entries {
            table.insert(&id, config)?;
        }
        Ok(table)
    }

    /// The built-in table of known chat platforms.
    pub fn builtin() -> Self {
        BUILTIN_TABLE.clone()
    }

    /// Add or replace a platform entry.
    pub fn insert(&mut self, platform_id: &str, config: StreamConfig) -> Result<(), ConfigError> {
        config.validate().map_err(|e| match e {
            ConfigError::InvalidValue { key, message } => ConfigError::InvalidValue {
                key: format!("{}.{}", platform_id, key),
                message,
            },
            other => other,
        })?;
        self.entries.insert(normalize_id(platform_id), config);
        Ok(())
    }

    /// Resolve a platform id. Unknown ids yield the table default.
    pub fn resolve(&self, platform_id: &str) -> StreamConfig {
        self.entries
            .get(&normalize_id(platform_id))
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }

    /// The configuration returned for unknown platforms.
    pub fn default_config(&self) -> &StreamConfig {
        &self.default
    }

    /// Known platform ids, sorted.
    pub fn platform_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Load a table file and overlay it on the built-ins.
    ///
    /// The format is chosen by extension: `.json`, `.yaml`/`.yml`, `.json5`.
    /// A top-level `default` key replaces the fallback configuration.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let format = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let overrides = parse_table(&contents, &format)?;

        let mut table = Self::builtin();
        table.apply(overrides)?;
        tracing::debug!(path = %path.display(), platforms = table.entries.len(), "Loaded platform table");
        Ok(table)
    }

    fn apply(&mut self, mut overrides: HashMap<String, StreamConfig>) -> Result<(), ConfigError> {
        if let Some(default) = overrides.remove("default") {
            self.default = default.validated()?;
        }
        for (id, config) in overrides {
            self.insert(&id, config)?;
        }
        Ok(())
    }
}

impl Default for PlatformTable {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Resolve a platform id against the built-in table.
///
/// Pure: repeated calls with the same id return equal values.
pub fn resolve_config(platform_id: &str) -> StreamConfig {
    BUILTIN_TABLE.resolve(platform_id)
}

fn normalize_id(platform_id: &str) -> String {
    platform_id.trim().to_ascii_lowercase()
}

fn parse_table(contents: &str, format: &str) -> Result<HashMap<String, StreamConfig>, ConfigError> {
    match format {
        "json" => serde_json::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string())),
        "yaml" | "yml" => {
            serde_yaml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))
        }
        "json5" => json5::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string())),
        other => Err(ConfigError::UnsupportedFormat(other.to_string())),
    }
}

fn platform(max_chars: usize) -> StreamConfig {
    StreamConfig {
        platform_max_message_chars: max_chars,
        ..DEFAULT_STREAM_CONFIG
    }
}

fn batch_only(max_chars: usize) -> StreamConfig {
    StreamConfig {
        platform_max_message_chars: max_chars,
        supports_streaming: false,
        ..DEFAULT_STREAM_CONFIG
    }
}

static BUILTIN_TABLE: LazyLock<PlatformTable> = LazyLock::new(|| {
    let entries = [
        ("telegram", platform(4000)),
        ("discord", platform(2000)),
        ("slack", platform(4000)),
        ("lark", platform(2000)),
        ("feishu", platform(2000)),
        ("whatsapp", platform(4000)),
        ("signal", platform(4000)),
        ("imessage", platform(4000)),
        (
            "max",
            StreamConfig {
                min_flush_chars: 1500,
                max_buffer_chars: 3000,
                max_buffer_age_ms: 1000,
                ..platform(4000)
            },
        ),
        ("clawtell", platform(50_000)),
        ("webchat", platform(8000)),
        ("sms", batch_only(1600)),
        ("email", batch_only(50_000)),
    ];

    PlatformTable {
        entries: entries
            .into_iter()
            .map(|(id, config)| (id.to_string(), config))
            .collect(),
        default: DEFAULT_STREAM_CONFIG,
    }
});
