//! ISR configuration types

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// ISR engine configuration
#[derive(Debug, Clone)]
pub struct IsrConfig {
    /// Revalidation period for pages that don't declare their own
    pub default_revalidate: Duration,

    /// Storage backend
    pub storage: StorageBackend,

    pub cache_control: CacheControlPolicy,

    /// Include error messages in 500 responses
    pub debug: bool,

    /// Emit `x-isr-*` diagnostic headers
    pub debug_headers: bool,

    /// Shared secret for the revalidation webhook. `None` rejects every call.
    pub revalidation_secret: Option<String>,

    /// Upper bound on a single render call
    pub render_timeout: Duration,

    pub retry: RetryPolicy,

    /// Document served to the first visitor of a `static` fallback path
    pub placeholder_html: Option<String>,

    pub locales: LocaleConfig,

    /// On-disk build output; `None` keeps the build in the cache only
    pub output: Option<OutputConfig>,

    /// Number of revalidation records kept for inspection
    pub history_capacity: usize,

    /// Renders running at once during static generation
    pub build_concurrency: usize,

    /// Buffered lifecycle events per subscriber
    pub event_capacity: usize,
}

impl Default for IsrConfig {
    fn default() -> Self {
        Self {
            default_revalidate: Duration::from_secs(60),
            storage: StorageBackend::Memory(MemoryConfig::default()),
            cache_control: CacheControlPolicy::default(),
            debug: false,
            debug_headers: false,
            revalidation_secret: None,
            render_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            placeholder_html: None,
            locales: LocaleConfig::default(),
            output: None,
            history_capacity: 100,
            build_concurrency: 8,
            event_capacity: 256,
        }
    }
}

/// Storage backend configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageBackend {
    /// In-process LRU store; single instance only
    Memory(MemoryConfig),

    /// Redis-compatible key-value store shared between instances
    Kv(KvConfig),
}

/// Memory adapter bounds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Estimated bytes, see [`crate::cache::estimate_size`]
    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: usize,
}

fn default_max_entries() -> usize {
    1000
}

fn default_max_size_bytes() -> usize {
    50 * 1024 * 1024
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            max_size_bytes: default_max_size_bytes(),
        }
    }
}

/// Key-value (Dragonfly/Redis) storage configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvConfig {
    /// Redis/Dragonfly connection URL
    #[serde(default = "default_kv_url")]
    pub url: String,

    /// Key prefix for ISR cache entries
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Seconds the store keeps an entry past its revalidation interval
    #[serde(default = "default_ttl_grace_secs")]
    pub ttl_grace_secs: u64,
}

fn default_kv_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_key_prefix() -> String {
    "silcrow:isr:".to_string()
}

fn default_ttl_grace_secs() -> u64 {
    3600
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            url: default_kv_url(),
            key_prefix: default_key_prefix(),
            ttl_grace_secs: default_ttl_grace_secs(),
        }
    }
}

/// Bounds the `stale-while-revalidate` window advertised to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheControlPolicy {
    pub swr_ceiling: Duration,
}

impl Default for CacheControlPolicy {
    fn default() -> Self {
        Self {
            swr_ceiling: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl CacheControlPolicy {
    /// Stale window in seconds: the interval itself, capped at the ceiling
    pub fn stale_window(&self, revalidate_secs: u64) -> u64 {
        revalidate_secs.min(self.swr_ceiling.as_secs())
    }
}

/// Exponential backoff for paths whose regeneration keeps failing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            max: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Wait before the next attempt after `failures` consecutive failures.
    ///
    /// `base * 2^(failures - 1)`, capped at `max`; zero when nothing failed.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Locales every collected path is expanded into
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocaleConfig {
    pub locales: Vec<String>,

    /// Locale served from the bare path; the others get a `/{locale}` prefix
    pub default_locale: Option<String>,
}

impl LocaleConfig {
    pub fn is_enabled(&self) -> bool {
        !self.locales.is_empty()
    }

    /// The configured default, or the first locale
    pub fn default_locale(&self) -> Option<&str> {
        self.default_locale
            .as_deref()
            .or_else(|| self.locales.first().map(String::as_str))
    }

    /// Split a leading `/{locale}` segment off `path`
    pub fn strip_locale<'a>(&self, path: &'a str) -> (Option<&str>, &'a str) {
        let Some(trimmed) = path.strip_prefix('/') else {
            return (None, path);
        };
        let (first, rest_start) = match trimmed.find('/') {
            Some(i) => (&trimmed[..i], i + 1),
            None => (trimmed, path.len()),
        };

        match self.locales.iter().find(|l| !first.is_empty() && l.as_str() == first) {
            Some(locale) => {
                let rest = &path[rest_start..];
                (Some(locale.as_str()), if rest.is_empty() { "/" } else { rest })
            }
            None => (None, path),
        }
    }

    /// `path` as served for `locale`
    pub fn localize(&self, path: &str, locale: &str) -> String {
        if self.default_locale() == Some(locale) {
            path.to_string()
        } else if path == "/" {
            format!("/{}", locale)
        } else {
            format!("/{}{}", locale, path)
        }
    }
}

/// Build output written to disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,

    /// `/about` → `about/index.html` instead of `about.html`
    #[serde(default)]
    pub trailing_slash: bool,

    /// Write per-route shell metadata into the manifest
    #[serde(default)]
    pub ppr: bool,

    /// Attribute marking a dynamic boundary inside a shell
    #[serde(default = "default_boundary_marker")]
    pub boundary_marker: String,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("dist")
}

fn default_boundary_marker() -> String {
    "data-silcrow-boundary".to_string()
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            trailing_slash: false,
            ppr: false,
            boundary_marker: default_boundary_marker(),
        }
    }
}

/// Top level of `silcrow.toml`; only the `[isr]` table is read here
#[derive(Debug, Clone, Default, Deserialize)]
struct SilcrowToml {
    #[serde(default)]
    isr: IsrTomlConfig,
}

/// TOML configuration for the `[isr]` table of silcrow.toml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsrTomlConfig {
    /// Default revalidation period in seconds
    #[serde(default = "default_revalidate_secs")]
    pub default_revalidate: u64,

    #[serde(default)]
    pub storage: StorageTomlConfig,

    #[serde(default = "default_swr_ceiling_secs")]
    pub swr_ceiling_secs: u64,

    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub debug_headers: bool,

    #[serde(default)]
    pub revalidation_secret: Option<String>,

    #[serde(default = "default_render_timeout_secs")]
    pub render_timeout_secs: u64,

    #[serde(default)]
    pub retry: RetryTomlConfig,

    #[serde(default)]
    pub placeholder_html: Option<String>,

    #[serde(default)]
    pub locales: Vec<String>,

    #[serde(default)]
    pub default_locale: Option<String>,

    #[serde(default)]
    pub output: Option<OutputConfig>,

    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    #[serde(default = "default_build_concurrency")]
    pub build_concurrency: usize,
}

fn default_revalidate_secs() -> u64 {
    60
}

fn default_swr_ceiling_secs() -> u64 {
    24 * 60 * 60
}

fn default_render_timeout_secs() -> u64 {
    30
}

fn default_history_capacity() -> usize {
    100
}

fn default_build_concurrency() -> usize {
    8
}

impl Default for IsrTomlConfig {
    fn default() -> Self {
        Self {
            default_revalidate: default_revalidate_secs(),
            storage: StorageTomlConfig::default(),
            swr_ceiling_secs: default_swr_ceiling_secs(),
            debug: false,
            debug_headers: false,
            revalidation_secret: None,
            render_timeout_secs: default_render_timeout_secs(),
            retry: RetryTomlConfig::default(),
            placeholder_html: None,
            locales: Vec::new(),
            default_locale: None,
            output: None,
            history_capacity: default_history_capacity(),
            build_concurrency: default_build_concurrency(),
        }
    }
}

/// Storage configuration in TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageTomlConfig {
    /// Storage backend: "memory", or "kv" (alias "dragonfly")
    #[serde(default = "default_primary")]
    pub primary: String,

    /// Memory-specific config
    #[serde(default)]
    pub memory: Option<MemoryConfig>,

    /// KV-specific config
    #[serde(default)]
    pub kv: Option<KvConfig>,
}

fn default_primary() -> String {
    "memory".to_string()
}

impl Default for StorageTomlConfig {
    fn default() -> Self {
        Self {
            primary: default_primary(),
            memory: None,
            kv: None,
        }
    }
}

/// Retry backoff in TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryTomlConfig {
    #[serde(default = "default_retry_base_secs")]
    pub base_secs: u64,

    #[serde(default = "default_retry_max_secs")]
    pub max_secs: u64,
}

fn default_retry_base_secs() -> u64 {
    5
}

fn default_retry_max_secs() -> u64 {
    300
}

impl Default for RetryTomlConfig {
    fn default() -> Self {
        Self {
            base_secs: default_retry_base_secs(),
            max_secs: default_retry_max_secs(),
        }
    }
}

impl IsrTomlConfig {
    /// Parse the `[isr]` table out of a whole silcrow.toml document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let doc: SilcrowToml = toml::from_str(content).context("Failed to parse ISR config")?;
        Ok(doc.isr)
    }

    /// Load from a silcrow.toml file; a missing or empty file yields defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        Self::from_toml_str(&content).with_context(|| format!("Invalid config file: {:?}", path))
    }

    /// Convert TOML config to runtime config
    pub fn to_runtime_config(&self) -> Result<IsrConfig> {
        let storage = self.parse_storage_backend(&self.storage.primary)?;

        if self.retry.base_secs > self.retry.max_secs {
            anyhow::bail!(
                "retry.base_secs ({}) must not exceed retry.max_secs ({})",
                self.retry.base_secs,
                self.retry.max_secs
            );
        }
        if self.build_concurrency == 0 {
            anyhow::bail!("build_concurrency must be at least 1");
        }
        if self.render_timeout_secs == 0 {
            anyhow::bail!("render_timeout_secs must be at least 1");
        }
        if let Some(ref default_locale) = self.default_locale {
            if !self.locales.contains(default_locale) {
                anyhow::bail!("default_locale {:?} is not listed in locales", default_locale);
            }
        }

        Ok(IsrConfig {
            default_revalidate: Duration::from_secs(self.default_revalidate),
            storage,
            cache_control: CacheControlPolicy {
                swr_ceiling: Duration::from_secs(self.swr_ceiling_secs),
            },
            debug: self.debug,
            debug_headers: self.debug_headers,
            revalidation_secret: self.revalidation_secret.clone().filter(|s| !s.is_empty()),
            render_timeout: Duration::from_secs(self.render_timeout_secs),
            retry: RetryPolicy {
                base: Duration::from_secs(self.retry.base_secs),
                max: Duration::from_secs(self.retry.max_secs),
            },
            placeholder_html: self.placeholder_html.clone(),
            locales: LocaleConfig {
                locales: self.locales.clone(),
                default_locale: self.default_locale.clone(),
            },
            output: self.output.clone(),
            history_capacity: self.history_capacity,
            build_concurrency: self.build_concurrency,
            ..IsrConfig::default()
        })
    }

    fn parse_storage_backend(&self, backend_type: &str) -> Result<StorageBackend> {
        match backend_type {
            "memory" => Ok(StorageBackend::Memory(
                self.storage.memory.clone().unwrap_or_default(),
            )),
            "kv" | "dragonfly" => {
                let config = self.storage.kv.clone().ok_or_else(|| {
                    anyhow::anyhow!("KV storage requires [isr.storage.kv] configuration")
                })?;
                Ok(StorageBackend::Kv(config))
            }
            _ => Err(anyhow::anyhow!("Unknown storage backend: {}", backend_type)),
        }
    }
}
