//! Request, payload, and cache-entry models
//!
//! Everything the cache stores or keys by lives here: the canonicalized
//! [`Request`] (key derivation), the immutable [`Data`] payload (filtered
//! headers + optionally compressed body), and the [`Response`] entry that
//! ties the two together with revalidation bookkeeping.

mod data;
mod request;
mod response;

pub use data::{Data, GZIP_THRESHOLD};
pub use request::{derive_key, parse_query, KvPair, Request};
pub use response::{DataFuture, Response, Revalidator, RECENCY_NONE};
