//! TOML configuration for a log's retention and fetch behaviour.
//!
//! ```toml
//! [trim]
//! type = "length"
//! to = 1000
//! from = 1200
//!
//! [fetch]
//! length = -1        # negative: unbounded
//! concurrency = 32
//! timeout_ms = 10000
//! cache_bytes = 0    # zero: no block cache
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use reef_store::BlockCache;
use serde::Deserialize;

use crate::error::LogError;
use crate::fetch::{DEFAULT_CONCURRENCY, DEFAULT_TIMEOUT, FetchOptions};
use crate::trim::TrimPolicy;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Retention policy. No trimming when absent.
    pub trim: Option<TrimSection>,
    /// Defaults for loading history.
    pub fetch: FetchSection,
}

/// `[trim]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct TrimSection {
    /// `"length"` or `"bytelength"`.
    #[serde(rename = "type")]
    pub kind: TrimKind,
    pub to: usize,
    /// Trimming starts only once the log grows past this. Defaults to `to`.
    #[serde(default)]
    pub from: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrimKind {
    Length,
    ByteLength,
}

/// `[fetch]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchSection {
    /// Maximum entries to load; negative loads everything.
    pub length: i64,
    /// Concurrent store reads.
    pub concurrency: usize,
    /// Per-hash read timeout in milliseconds.
    pub timeout_ms: u64,
    /// Size of the block cache shared by fetches built from this config.
    pub cache_bytes: u64,
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            length: -1,
            concurrency: DEFAULT_CONCURRENCY,
            timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
            cache_bytes: 0,
        }
    }
}

impl LogConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self, LogError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| LogError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// Parse config from a TOML string.
    pub fn from_toml(s: &str) -> Result<Self, LogError> {
        let config: LogConfig = toml::from_str(s).map_err(|e| LogError::Config(e.to_string()))?;

        if config.fetch.concurrency == 0 {
            return Err(LogError::Config("fetch.concurrency must be at least 1".into()));
        }

        Ok(config)
    }

    pub fn trim_policy(&self) -> Option<TrimPolicy> {
        self.trim.as_ref().map(|t| match t.kind {
            TrimKind::Length => TrimPolicy::Length {
                to: t.to,
                from: t.from,
            },
            TrimKind::ByteLength => TrimPolicy::ByteLength {
                to: t.to,
                from: t.from,
            },
        })
    }

    pub fn fetch_options<T>(&self) -> FetchOptions<T> {
        let mut options = FetchOptions::new()
            .concurrency(self.fetch.concurrency)
            .timeout(Duration::from_millis(self.fetch.timeout_ms));
        if self.fetch.cache_bytes > 0 {
            options = options.cache(Arc::new(BlockCache::new(self.fetch.cache_bytes)));
        }

        match usize::try_from(self.fetch.length) {
            Ok(length) => options.length(length),
            Err(_) => options.unbounded(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config = LogConfig::from_toml(
            r#"
            [trim]
            type = "bytelength"
            to = 4096
            from = 8192

            [fetch]
            length = 50
            concurrency = 4
            timeout_ms = 250
            cache_bytes = 65536
            "#,
        )
        .unwrap();

        assert_eq!(
            config.trim_policy(),
            Some(TrimPolicy::ByteLength {
                to: 4096,
                from: Some(8192)
            })
        );

        let fetch = config.fetch_options::<String>();
        assert_eq!(fetch.length, Some(50));
        assert_eq!(fetch.concurrency, 4);
        assert_eq!(fetch.timeout, Duration::from_millis(250));
        assert_eq!(fetch.block_cache().map(|c| c.capacity()), Some(65536));
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = LogConfig::from_toml("").unwrap();
        assert!(config.trim_policy().is_none());

        let fetch = config.fetch_options::<String>();
        assert_eq!(fetch.length, None);
        assert_eq!(fetch.concurrency, 32);
        assert_eq!(fetch.timeout, Duration::from_secs(10));
        assert!(fetch.block_cache().is_none());
    }

    #[test]
    fn test_length_trim_without_from() {
        let config = LogConfig::from_toml(
            r#"
            [trim]
            type = "length"
            to = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.trim_policy(), Some(TrimPolicy::length(10)));
    }

    #[test]
    fn test_rejects_unknown_trim_type() {
        let err = LogConfig::from_toml(
            r#"
            [trim]
            type = "age"
            to = 10
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, LogError::Config(_)));
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let err = LogConfig::from_toml("[fetch]\nconcurrency = 0\n").unwrap_err();
        assert!(matches!(err, LogError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[fetch]\nlength = 7").unwrap();

        let config = LogConfig::load(file.path()).unwrap();
        assert_eq!(config.fetch.length, 7);
        assert_eq!(config.fetch.timeout_ms, 10_000);
    }

    #[test]
    fn test_load_missing_file() {
        let err = LogConfig::load(Path::new("/nonexistent/reef.toml")).unwrap_err();
        assert!(matches!(err, LogError::Config(_)));
    }
}
