//! Cached payload
//!
//! `Data` is the immutable unit the cache stores per entry: HTTP status, the
//! response headers the matched rule allows, and the body. Bodies above the
//! compression threshold are gzip-compressed at the fastest level and marked
//! with `Content-Encoding: gzip`; a failing encoder falls back to the raw
//! body so a compression problem can never lose a response.

use std::io::Write;

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::config::Rule;

/// Minimum body size for gzip to be worth the CPU
pub const GZIP_THRESHOLD: usize = 1024;

/// The cached payload: status, filtered headers, body
#[derive(Debug, Clone)]
pub struct Data {
    status: u16,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl Data {
    /// Build a payload from an upstream response: filter headers to the
    /// rule's allowed set, compress the body when it is large enough.
    pub fn new(rule: &Rule, status: u16, headers: Vec<(String, String)>, body: Vec<u8>) -> Self {
        let mut headers = filter_headers(headers, &rule.value_headers);
        let body = if body.len() > GZIP_THRESHOLD {
            match gzip(&body) {
                Ok(compressed) => {
                    headers.push(("Content-Encoding".to_string(), "gzip".to_string()));
                    Bytes::from(compressed)
                }
                Err(_) => Bytes::from(body),
            }
        } else {
            Bytes::from(body)
        };

        Self { status, headers, body }
    }

    /// Rebuild a payload from stored parts. Headers are already filtered and
    /// the body is already in its on-wire (possibly compressed) form.
    pub fn from_stored(status: u16, headers: Vec<(String, String)>, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body: Bytes::from(body),
        }
    }

    #[inline]
    pub fn status(&self) -> u16 {
        self.status
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    #[inline]
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Body bytes as stored (compressed when `Content-Encoding: gzip` is set)
    #[inline]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Approximate in-memory cost: structural overhead plus header and body
    /// byte sums.
    pub fn weight(&self) -> i64 {
        let mut size = std::mem::size_of::<Self>();
        for (k, v) in &self.headers {
            size += k.len() + v.len();
        }
        size += self.body.len();
        size as i64
    }
}

fn filter_headers(headers: Vec<(String, String)>, allowed: &[Vec<u8>]) -> Vec<(String, String)> {
    headers
        .into_iter()
        .filter(|(name, _)| {
            allowed
                .iter()
                .any(|a| a.eq_ignore_ascii_case(name.as_bytes()))
        })
        .collect()
}

fn gzip(body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 2), Compression::fast());
    encoder.write_all(body)?;
    encoder.finish()
}

// =============================================================================
// Tests
// =============================================================================
