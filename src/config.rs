//! Cache configuration
//!
//! The engine is configured by a single YAML document with a `cache` object.
//! Durations use humantime strings (`100ms`, `1h`). After deserialization
//! [`Config::finish`] must run once: it validates the document, compiles the
//! per-prefix rules into their byte-level form, and precomputes the derived
//! `min_stale` values used by the probabilistic refresher.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Environment
// =============================================================================

/// Deployment environment tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Env {
    Prod,
    Dev,
    Test,
}

impl Default for Env {
    fn default() -> Self {
        Env::Dev
    }
}

// =============================================================================
// Sections
// =============================================================================

/// Logging verbosity and stats printing
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogsSection {
    /// Log level filter (`trace` .. `error`)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit periodic stats lines from background workers
    #[serde(default)]
    pub stats: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogsSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            stats: true,
        }
    }
}

/// Request lifetime limits applied at the HTTP boundary
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LifetimeSection {
    /// Request-scoped timeout for cache lookups
    #[serde(default, with = "humantime_serde")]
    pub max_req_dur: Duration,
    /// Requests carrying this header bypass the timeout above
    #[serde(default)]
    pub escape_max_req_dur_header: String,
}

/// Upstream origin parameters
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamSection {
    /// Origin base URL
    #[serde(default)]
    pub url: String,
    /// Cap on miss-path requests to the origin, per second
    #[serde(default = "default_upstream_rate")]
    pub rate: u32,
    /// Per-request timeout for origin fetches
    #[serde(default = "default_upstream_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_upstream_rate() -> u32 {
    1000
}

fn default_upstream_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for UpstreamSection {
    fn default() -> Self {
        Self {
            url: String::new(),
            rate: default_upstream_rate(),
            timeout: default_upstream_timeout(),
        }
    }
}

/// Initial allocation hints
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PreallocateSection {
    /// Initial map capacity per shard
    #[serde(default = "default_per_shard")]
    pub per_shard: usize,
}

fn default_per_shard() -> usize {
    8
}

impl Default for PreallocateSection {
    fn default() -> Self {
        Self {
            per_shard: default_per_shard(),
        }
    }
}

/// Eviction trigger
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EvictionSection {
    /// Fraction of `storage.size` at which eviction starts, in (0, 1]
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

fn default_threshold() -> f64 {
    0.9
}

impl Default for EvictionSection {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
        }
    }
}

/// Storage allocator and byte budget
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageSection {
    /// Allocator kind (only `malloc` today)
    #[serde(rename = "type", default = "default_storage_type")]
    pub kind: String,
    /// Byte budget for all cached entries
    #[serde(default = "default_storage_size")]
    pub size: u64,
}

fn default_storage_type() -> String {
    "malloc".to_string()
}

fn default_storage_size() -> u64 {
    1024 * 1024 * 1024 // 1 GiB
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            kind: default_storage_type(),
            size: default_storage_size(),
        }
    }
}

/// Global refresh (XFetch) parameters; rules may override TTL and beta
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RefreshSection {
    /// Max lifetime of a 2xx entry without revalidation
    #[serde(default = "default_refresh_ttl", with = "humantime_serde")]
    pub ttl: Duration,
    /// Declared max lifetime of a non-2xx entry. The refresher times error
    /// responses at a tenth of the TTL regardless.
    #[serde(default, with = "humantime_serde")]
    pub error_ttl: Duration,
    /// Upstream revalidations per second
    #[serde(default = "default_refresh_rate")]
    pub rate: u32,
    /// Entry samples per second
    #[serde(default = "default_scan_rate")]
    pub scan_rate: u32,
    /// Eagerness of early expiration, in [0, 1]; 0 disables refresh
    #[serde(default = "default_beta")]
    pub beta: f64,
    /// Computed: `ttl * beta`
    #[serde(skip)]
    pub min_stale: Duration,
}

fn default_refresh_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_refresh_rate() -> u32 {
    100
}

fn default_scan_rate() -> u32 {
    1000
}

fn default_beta() -> f64 {
    0.4
}

impl Default for RefreshSection {
    fn default() -> Self {
        let mut s = Self {
            ttl: default_refresh_ttl(),
            error_ttl: Duration::ZERO,
            rate: default_refresh_rate(),
            scan_rate: default_scan_rate(),
            beta: default_beta(),
            min_stale: Duration::ZERO,
        };
        s.min_stale = s.ttl.mul_f64(s.beta);
        s
    }
}

/// On-disk dump format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DumpFormat {
    Raw,
    Gzip,
}

impl Default for DumpFormat {
    fn default() -> Self {
        DumpFormat::Raw
    }
}

/// Dump file rotation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RotatePolicy {
    /// A single timestamped generation, overwritten in place
    Fixed,
    /// Keep up to `max_files` timestamped generations, dropping the oldest
    Ring,
}

impl Default for RotatePolicy {
    fn default() -> Self {
        RotatePolicy::Ring
    }
}

/// Durable dump settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DumpSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub format: DumpFormat,
    /// Directory the shard files are written to
    #[serde(default = "default_dump_dir")]
    pub dir: String,
    /// Base name for shard files
    #[serde(default = "default_dump_name")]
    pub name: String,
    /// Max number of timestamp generations kept by the ring policy
    #[serde(default = "default_max_files")]
    pub max_files: usize,
    #[serde(default)]
    pub rotate_policy: RotatePolicy,
}

fn default_dump_dir() -> String {
    "dump".to_string()
}

fn default_dump_name() -> String {
    "cache".to_string()
}

fn default_max_files() -> usize {
    3
}

impl Default for DumpSection {
    fn default() -> Self {
        Self {
            enabled: false,
            format: DumpFormat::default(),
            dir: default_dump_dir(),
            name: default_dump_name(),
            max_files: default_max_files(),
            rotate_policy: RotatePolicy::default(),
        }
    }
}

/// Persistence settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PersistenceSection {
    #[serde(default)]
    pub dump: DumpSection,
}

// =============================================================================
// Rules
// =============================================================================

/// Per-prefix rule as it appears in the document
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuleConfig {
    /// Path prefix this rule applies to
    pub path: String,
    /// TTL override for 2xx entries (0 = global)
    #[serde(default, with = "humantime_serde")]
    pub ttl: Duration,
    /// Declared max lifetime of non-2xx entries; refresh timing for errors
    /// comes from TTL/10
    #[serde(default, with = "humantime_serde")]
    pub error_ttl: Duration,
    /// Beta override (0 = global)
    #[serde(default)]
    pub beta: f64,
    #[serde(default)]
    pub cache_key: CacheKeySection,
    #[serde(default)]
    pub cache_value: CacheValueSection,
}

/// Which request parts participate in the cache key
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CacheKeySection {
    /// Allowed query-parameter name prefixes
    #[serde(default)]
    pub query: Vec<String>,
    /// Allowed request-header names (case-insensitive)
    #[serde(default)]
    pub headers: Vec<String>,
}

/// Which response parts are stored alongside the body
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CacheValueSection {
    /// Allowed response-header names (case-insensitive)
    #[serde(default)]
    pub headers: Vec<String>,
}

/// Compiled rule. Immutable after [`Config::finish`]; requests hold an `Arc`
/// to the rule that matched them.
#[derive(Debug)]
pub struct Rule {
    /// Path prefix, byte form
    pub path: Vec<u8>,
    pub ttl: Duration,
    pub error_ttl: Duration,
    pub beta: f64,
    /// `ttl * beta`; below this age an entry is never refreshed
    pub min_stale: Duration,
    /// Allowed query-parameter name prefixes, byte form
    pub key_query: Vec<Vec<u8>>,
    /// Allowed request-header names, byte form
    pub key_headers: Vec<Vec<u8>>,
    /// Allowed response-header names, byte form
    pub value_headers: Vec<Vec<u8>>,
}

impl Rule {
    fn compile(rc: &RuleConfig) -> Self {
        Self {
            path: rc.path.clone().into_bytes(),
            ttl: rc.ttl,
            error_ttl: rc.error_ttl,
            beta: rc.beta,
            min_stale: rc.ttl.mul_f64(rc.beta),
            key_query: rc.cache_key.query.iter().map(|s| s.clone().into_bytes()).collect(),
            key_headers: rc.cache_key.headers.iter().map(|s| s.clone().into_bytes()).collect(),
            value_headers: rc
                .cache_value
                .headers
                .iter()
                .map(|s| s.clone().into_bytes())
                .collect(),
        }
    }
}

// =============================================================================
// Document root
// =============================================================================

/// The `cache` object of the configuration document
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CacheSection {
    #[serde(default)]
    pub env: Env,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub logs: LogsSection,
    #[serde(default)]
    pub lifetime: LifetimeSection,
    #[serde(default)]
    pub upstream: UpstreamSection,
    #[serde(default)]
    pub preallocate: PreallocateSection,
    #[serde(default)]
    pub eviction: EvictionSection,
    #[serde(default)]
    pub refresh: RefreshSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub persistence: PersistenceSection,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// Engine configuration: the deserialized document plus compiled rules
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    pub cache: CacheSection,
    /// Compiled rules in declaration order; filled by [`Config::finish`]
    #[serde(skip)]
    pub rules: Vec<Arc<Rule>>,
}

impl Config {
    /// Parse a YAML document and compile it.
    pub fn from_yaml(doc: &str) -> Result<Self> {
        let mut cfg: Config =
            serde_yaml::from_str(doc).map_err(|e| Error::Config(e.to_string()))?;
        cfg.finish()?;
        Ok(cfg)
    }

    /// Read and parse a YAML document from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let doc = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("read {}: {e}", path.as_ref().display())))?;
        Self::from_yaml(&doc)
    }

    /// Validate the document and compile rules and derived fields.
    /// Must run once before the config is handed to the engine.
    pub fn finish(&mut self) -> Result<()> {
        self.validate()?;
        self.cache.refresh.min_stale = self.cache.refresh.ttl.mul_f64(self.cache.refresh.beta);
        self.rules = self.cache.rules.iter().map(|rc| Arc::new(Rule::compile(rc))).collect();
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let c = &self.cache;
        if !(c.eviction.threshold > 0.0 && c.eviction.threshold <= 1.0) {
            return Err(Error::Config(format!(
                "eviction.threshold must be in (0, 1], got {}",
                c.eviction.threshold
            )));
        }
        if c.storage.size == 0 {
            return Err(Error::Config("storage.size must be positive".into()));
        }
        if !(0.0..=1.0).contains(&c.refresh.beta) {
            return Err(Error::Config(format!(
                "refresh.beta must be in [0, 1], got {}",
                c.refresh.beta
            )));
        }
        for (i, rule) in c.rules.iter().enumerate() {
            if rule.path.is_empty() {
                return Err(Error::Config(format!("rules[{i}].path must not be empty")));
            }
            if !(0.0..=1.0).contains(&rule.beta) {
                return Err(Error::Config(format!(
                    "rules[{i}].beta must be in [0, 1], got {}",
                    rule.beta
                )));
            }
        }
        let dump = &c.persistence.dump;
        if dump.enabled {
            if dump.dir.is_empty() || dump.name.is_empty() {
                return Err(Error::Config(
                    "persistence.dump.dir and .name must be set when dump is enabled".into(),
                ));
            }
            if dump.max_files == 0 {
                return Err(Error::Config("persistence.dump.max_files must be >= 1".into()));
            }
        }
        Ok(())
    }

    /// First rule (declaration order) whose path prefix matches.
    pub fn match_rule(&self, path: &[u8]) -> Option<Arc<Rule>> {
        self.rules.iter().find(|r| path.starts_with(&r.path)).cloned()
    }

    /// Byte level at which the evictor starts working.
    pub fn memory_threshold(&self) -> i64 {
        (self.cache.storage.size as f64 * self.cache.eviction.threshold) as i64
    }

    pub fn is_prod(&self) -> bool {
        self.cache.env == Env::Prod
    }

    pub fn is_dev(&self) -> bool {
        self.cache.env == Env::Dev
    }

    pub fn is_test(&self) -> bool {
        self.cache.env == Env::Test
    }
}

// =============================================================================
// Tests
// =============================================================================
