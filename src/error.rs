//! Error types for the cache engine

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the cache engine
#[derive(Error, Debug)]
pub enum Error {
    /// No configured rule prefix-matches the request path; the caller should
    /// pass the request through uncached.
    #[error("no cache rule matches path")]
    RuleNotFound,

    /// The upstream fetch (initial or revalidation) failed.
    #[error("upstream fetch failed: {0}")]
    Upstream(String),

    /// The upstream token bucket had no token for a miss fetch.
    #[error("upstream rate limit exhausted")]
    UpstreamRateExhausted,

    /// Persistence is disabled but dump/load was called. Benign sentinel.
    #[error("persistence is not enabled")]
    DumpDisabled,

    /// Filesystem error during dump or load.
    #[error("dump I/O error: {0}")]
    DumpIo(#[from] std::io::Error),

    /// A dump record could not be decoded.
    #[error("dump record decode error: {0}")]
    DumpDecode(String),

    /// A loaded record's recomputed key does not match the stored value.
    #[error("dump record integrity mismatch: stored key {stored}, recomputed {recomputed}")]
    DumpIntegrity { stored: u64, recomputed: u64 },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}
