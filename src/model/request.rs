//! Canonical request and cache key derivation
//!
//! The key contract: two requests that agree on the matched rule's allowed
//! query parameters (name-prefix match) and allowed headers (case-insensitive
//! name match) hash to the same 64-bit key, regardless of parameter order,
//! header order, header name casing, or any disallowed noise. The key must
//! stay stable across rebuilds and dump/restore, so the canonical byte forms
//! are fixed here and nowhere else:
//!
//! - query:   `?k1=v1&k2=v2` (sorted by key bytes, no trailing `&`, empty
//!   when nothing matches)
//! - headers: `k1:v1\nk2:v2` (sorted by key bytes, no trailing `\n`)
//! - key:     `xxh3_64(query ++ "\n" ++ headers)`, or the hash of the empty
//!   buffer when both parts are empty
//!
//! The path is not mixed into the key: the rule already partitions the key
//! space by path prefix.

use std::sync::Arc;

use xxhash_rust::xxh3::xxh3_64;

use crate::config::{Config, Rule};
use crate::error::{Error, Result};
use crate::SHARD_COUNT;

/// A key/value byte pair (query parameter or header)
pub type KvPair = (Vec<u8>, Vec<u8>);

/// Canonicalized request: the cache-key view of an inbound HTTP request
#[derive(Debug)]
pub struct Request {
    rule: Option<Arc<Rule>>,
    key: u64,
    shard: u64,
    path: Vec<u8>,
    /// Canonical query form, `?k=v&…`
    query: Vec<u8>,
    /// Filtered and sorted request headers
    headers: Vec<KvPair>,
}

impl Request {
    /// Canonicalize a request from its raw parts. Fails with
    /// [`Error::RuleNotFound`] when no rule prefix-matches the path; the
    /// caller passes such requests through uncached.
    pub fn new(cfg: &Config, path: &[u8], query: &[KvPair], headers: &[KvPair]) -> Result<Self> {
        let rule = cfg.match_rule(path).ok_or(Error::RuleNotFound)?;

        let queries = filter_queries(query, &rule.key_query);
        let headers = filter_headers(headers, &rule.key_headers);
        let query = canonical_query(&queries);
        let key = derive_key(&query, &headers);

        Ok(Self {
            rule: Some(rule),
            key,
            shard: key % SHARD_COUNT,
            path: path.to_vec(),
            query,
            headers,
        })
    }

    /// Rebuild a request from stored parts, reusing the stored keys so that
    /// entries survive a dump/restore even if key derivation evolves.
    pub fn from_raw(
        cfg: &Config,
        key: u64,
        shard: u64,
        query: Vec<u8>,
        path: Vec<u8>,
        headers: Vec<KvPair>,
    ) -> Self {
        Self {
            rule: cfg.match_rule(&path),
            key,
            shard,
            path,
            query,
            headers,
        }
    }

    #[inline]
    pub fn rule(&self) -> Option<&Arc<Rule>> {
        self.rule.as_ref()
    }

    /// 64-bit cache key
    #[inline]
    pub fn map_key(&self) -> u64 {
        self.key
    }

    /// Shard index, `key % SHARD_COUNT`
    #[inline]
    pub fn shard_key(&self) -> u64 {
        self.shard
    }

    #[inline]
    pub fn path(&self) -> &[u8] {
        &self.path
    }

    /// Canonical query form (`?k=v&…`, empty when no allowed params matched)
    #[inline]
    pub fn query(&self) -> &[u8] {
        &self.query
    }

    #[inline]
    pub fn headers(&self) -> &[KvPair] {
        &self.headers
    }

    /// Approximate in-memory cost of the canonical request
    pub fn weight(&self) -> i64 {
        let mut size = std::mem::size_of::<Self>() + self.query.len() + self.path.len();
        for (k, v) in &self.headers {
            size += std::mem::size_of::<KvPair>() + k.len() + v.len();
        }
        size as i64
    }
}

/// Hash the canonical forms into the cache key.
pub fn derive_key(query: &[u8], headers: &[KvPair]) -> u64 {
    let header_bytes = canonical_headers(headers);
    if query.is_empty() && header_bytes.is_empty() {
        return xxh3_64(&[]);
    }
    let mut buf = Vec::with_capacity(query.len() + 1 + header_bytes.len());
    buf.extend_from_slice(query);
    buf.push(b'\n');
    buf.extend_from_slice(&header_bytes);
    xxh3_64(&buf)
}

/// `?k=v&…` with no trailing separator; empty for an empty pair list.
fn canonical_query(pairs: &[KvPair]) -> Vec<u8> {
    if pairs.is_empty() {
        return Vec::new();
    }
    let mut len = 1;
    for (k, v) in pairs {
        len += k.len() + v.len() + 2;
    }
    let mut buf = Vec::with_capacity(len);
    buf.push(b'?');
    for (i, (k, v)) in pairs.iter().enumerate() {
        if i > 0 {
            buf.push(b'&');
        }
        buf.extend_from_slice(k);
        buf.push(b'=');
        buf.extend_from_slice(v);
    }
    buf
}

/// `k:v\n…` with no trailing newline; empty for an empty pair list.
fn canonical_headers(pairs: &[KvPair]) -> Vec<u8> {
    let mut buf = Vec::new();
    for (i, (k, v)) in pairs.iter().enumerate() {
        if i > 0 {
            buf.push(b'\n');
        }
        buf.extend_from_slice(k);
        buf.push(b':');
        buf.extend_from_slice(v);
    }
    buf
}

/// Keep query parameters whose name starts with any allowed prefix, sorted
/// lexicographically by name bytes. Prefix matching covers indexed families
/// like `choice[choice][name]` under the single allowed prefix `choice`.
fn filter_queries(pairs: &[KvPair], allowed: &[Vec<u8>]) -> Vec<KvPair> {
    if allowed.is_empty() {
        return Vec::new();
    }
    let mut filtered: Vec<KvPair> = pairs
        .iter()
        .filter(|(name, _)| allowed.iter().any(|a| name.starts_with(a.as_slice())))
        .cloned()
        .collect();
    filtered.sort_by(|a, b| a.0.cmp(&b.0));
    filtered
}

/// Keep headers whose name case-insensitively equals any allowed name,
/// sorted lexicographically by name bytes. The canonical form carries the
/// rule's spelling of the name, so requests differing only in header-name
/// case hash identically.
fn filter_headers(pairs: &[KvPair], allowed: &[Vec<u8>]) -> Vec<KvPair> {
    if allowed.is_empty() {
        return Vec::new();
    }
    let mut filtered: Vec<KvPair> = pairs
        .iter()
        .filter_map(|(name, value)| {
            allowed
                .iter()
                .find(|a| a.eq_ignore_ascii_case(name))
                .map(|canonical| (canonical.clone(), value.clone()))
        })
        .collect();
    filtered.sort_by(|a, b| a.0.cmp(&b.0));
    filtered
}

/// Split a raw query string (`k=v&k2=v2`, no leading `?`) into byte pairs.
/// Pairs without `=` are skipped.
pub fn parse_query(raw: &[u8]) -> Vec<KvPair> {
    let mut pairs = Vec::new();
    for piece in raw.split(|&b| b == b'&') {
        if let Some(eq) = piece.iter().position(|&b| b == b'=') {
            pairs.push((piece[..eq].to_vec(), piece[eq + 1..].to_vec()));
        }
    }
    pairs
}

// =============================================================================
// Tests
// =============================================================================
