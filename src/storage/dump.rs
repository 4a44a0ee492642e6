//! Durable dump and restore
//!
//! Dump writes one file per non-empty shard, named
//! `{name}-shard-{idx}-{YYYYMMDDTHHMMSS}.dump`, each a sequence of
//! length-framed bincode records (whole file optionally gzip-wrapped).
//! Files are written to a `.tmp` sibling and renamed into place, so a crash
//! mid-dump never leaves a torn file behind. Shards are dumped and loaded in
//! parallel.
//!
//! Restore picks the generation with the lexicographically greatest
//! timestamp, rebuilds each request through the raw constructor (the stored
//! keys are reused, so entries survive even if key derivation evolves), and
//! verifies that the stored canonical bytes still hash to the stored key;
//! a mismatched record is dropped and counted, never fatal.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, info, instrument, warn};

use crate::config::{Config, DumpFormat, RotatePolicy};
use crate::error::{Error, Result};
use crate::model::{derive_key, Data, Request, Response};
use crate::shutdown::Shutdown;
use crate::storage::Storage;
use crate::upstream::{self, Upstream};
use crate::SHARD_COUNT;

/// One cache entry in its on-disk form
#[derive(Debug, Clone, PartialEq, bincode::Encode, bincode::Decode)]
struct DumpRecord {
    status: u16,
    headers: Vec<(String, String)>,
    /// Body as stored (already gzip-compressed when applicable)
    body: Vec<u8>,
    /// Canonical query bytes
    query: Vec<u8>,
    /// Canonical request headers
    req_headers: Vec<(Vec<u8>, Vec<u8>)>,
    path: Vec<u8>,
    map_key: u64,
    shard_key: u64,
}

/// Outcome of a dump or load pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DumpStats {
    pub records: u64,
    pub errors: u64,
}

/// Persists and restores cache state across shards in parallel
pub struct Dumper {
    cfg: Arc<Config>,
    storage: Arc<Storage>,
    upstream: Arc<dyn Upstream>,
    shutdown: Shutdown,
}

impl Dumper {
    pub fn new(
        cfg: Arc<Config>,
        storage: Arc<Storage>,
        upstream: Arc<dyn Upstream>,
        shutdown: Shutdown,
    ) -> Self {
        Self { cfg, storage, upstream, shutdown }
    }

    /// Write every shard's entries to disk. Per-record failures are counted,
    /// never fatal; the pass only errors on filesystem-level problems.
    #[instrument(skip(self))]
    pub async fn dump(&self) -> Result<DumpStats> {
        let dump_cfg = &self.cfg.cache.persistence.dump;
        if !dump_cfg.enabled {
            return Err(Error::DumpDisabled);
        }
        let started = std::time::Instant::now();
        let dir = PathBuf::from(&dump_cfg.dir);
        tokio::fs::create_dir_all(&dir).await?;

        rotate(&dir, &dump_cfg.name, dump_cfg.rotate_policy, dump_cfg.max_files)?;

        let timestamp = Utc::now().format("%Y%m%dT%H%M%S").to_string();
        let gzip = dump_cfg.format == DumpFormat::Gzip;

        let mut tasks = tokio::task::JoinSet::new();
        for shard_id in 0..SHARD_COUNT {
            let shard = Arc::clone(self.storage.map().shard(shard_id));
            if shard.is_empty() {
                continue;
            }

            // Snapshot under the read lock, encode and write outside it.
            let mut entries: Vec<Arc<Response>> = Vec::with_capacity(shard.len() as usize);
            shard.walk(&self.shutdown, false, |_, entry| {
                entries.push(Arc::clone(entry));
                true
            });

            let path = dir.join(file_name(&dump_cfg.name, shard_id, &timestamp));
            tasks.spawn_blocking(move || write_shard_file(&path, &entries, gzip));
        }

        let mut stats = DumpStats::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(shard_stats)) => {
                    stats.records += shard_stats.records;
                    stats.errors += shard_stats.errors;
                }
                Ok(Err(err)) => {
                    warn!(%err, "shard dump failed");
                    stats.errors += 1;
                }
                Err(err) => {
                    warn!(%err, "shard dump task panicked");
                    stats.errors += 1;
                }
            }
        }

        self.storage.metrics().record_dump_written(stats.records);
        for _ in 0..stats.errors {
            self.storage.metrics().record_dump_error();
        }
        info!(
            records = stats.records,
            errors = stats.errors,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "dump finished"
        );
        Ok(stats)
    }

    /// Restore the newest dump generation through [`Storage::set`].
    #[instrument(skip(self))]
    pub async fn load(&self) -> Result<DumpStats> {
        let dump_cfg = &self.cfg.cache.persistence.dump;
        if !dump_cfg.enabled {
            return Err(Error::DumpDisabled);
        }
        let started = std::time::Instant::now();
        let dir = PathBuf::from(&dump_cfg.dir);

        let files = dump_files(&dir, &dump_cfg.name)?;
        let Some(newest) = files.iter().map(|f| f.timestamp.clone()).max() else {
            info!("no dump files found, nothing to restore");
            return Ok(DumpStats::default());
        };

        let mut tasks = tokio::task::JoinSet::new();
        for file in files.into_iter().filter(|f| f.timestamp == newest) {
            tasks.spawn_blocking(move || read_shard_file(&file.path));
        }

        let mut stats = DumpStats::default();
        while let Some(joined) = tasks.join_next().await {
            let (records, errors) = match joined {
                Ok(Ok(decoded)) => decoded,
                Ok(Err(err)) => {
                    warn!(%err, "shard load failed");
                    stats.errors += 1;
                    continue;
                }
                Err(err) => {
                    warn!(%err, "shard load task panicked");
                    stats.errors += 1;
                    continue;
                }
            };
            stats.errors += errors;

            for record in records {
                if self.shutdown.is_triggered() {
                    break;
                }
                match self.restore_record(record) {
                    Ok(()) => stats.records += 1,
                    Err(err) => {
                        debug!(%err, "dump record dropped");
                        stats.errors += 1;
                    }
                }
            }
        }

        self.storage.metrics().record_dump_restored(stats.records);
        for _ in 0..stats.errors {
            self.storage.metrics().record_dump_error();
        }
        info!(
            records = stats.records,
            errors = stats.errors,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "load finished"
        );
        Ok(stats)
    }

    /// Rebuild one entry. The stored canonical bytes must re-hash to the
    /// stored map key, and the shard key must still be `key % SHARD_COUNT`.
    fn restore_record(&self, record: DumpRecord) -> Result<()> {
        let recomputed = derive_key(&record.query, &record.req_headers);
        if recomputed != record.map_key {
            return Err(Error::DumpIntegrity {
                stored: record.map_key,
                recomputed,
            });
        }
        if record.shard_key != record.map_key % SHARD_COUNT {
            return Err(Error::DumpIntegrity {
                stored: record.shard_key,
                recomputed: record.map_key % SHARD_COUNT,
            });
        }

        let request = Arc::new(Request::from_raw(
            &self.cfg,
            record.map_key,
            record.shard_key,
            record.query,
            record.path,
            record.req_headers,
        ));
        let data = Data::from_stored(record.status, record.headers, record.body);
        let revalidator = upstream::revalidator(
            Arc::clone(&self.upstream),
            Arc::clone(&request),
            self.cfg.cache.upstream.timeout,
        );
        self.storage
            .set(Response::new(Arc::clone(&self.cfg), data, request, revalidator));
        Ok(())
    }
}

// =============================================================================
// Files on disk
// =============================================================================

struct DumpFile {
    path: PathBuf,
    timestamp: String,
    modified: SystemTime,
}

fn file_name(base: &str, shard: u64, timestamp: &str) -> String {
    format!("{base}-shard-{shard}-{timestamp}.dump")
}

/// Parse `{base}-shard-{idx}-{ts}.dump`; returns the trailing timestamp.
fn parse_file_name(name: &str, base: &str) -> Option<String> {
    let rest = name.strip_prefix(base)?.strip_prefix("-shard-")?;
    let rest = rest.strip_suffix(".dump")?;
    let (_idx, timestamp) = rest.rsplit_once('-')?;
    Some(timestamp.to_string())
}

fn dump_files(dir: &Path, base: &str) -> Result<Vec<DumpFile>> {
    let mut files = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(err) => return Err(err.into()),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(timestamp) = parse_file_name(name, base) else {
            continue;
        };
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        files.push(DumpFile { path: entry.path(), timestamp, modified });
    }
    Ok(files)
}

/// Apply the rotation policy before writing a new generation. `Ring` keeps
/// the newest `max_files - 1` timestamp groups (oldest by modification time
/// go first); `Fixed` clears every previous generation.
fn rotate(dir: &Path, base: &str, policy: RotatePolicy, max_files: usize) -> Result<()> {
    let files = dump_files(dir, base)?;
    if files.is_empty() {
        return Ok(());
    }

    match policy {
        RotatePolicy::Fixed => {
            for file in files {
                if let Err(err) = std::fs::remove_file(&file.path) {
                    warn!(%err, path = %file.path.display(), "failed to remove old dump file");
                }
            }
        }
        RotatePolicy::Ring => {
            use std::collections::HashMap;
            let mut groups: HashMap<String, (SystemTime, Vec<PathBuf>)> = HashMap::new();
            for file in files {
                let group = groups
                    .entry(file.timestamp)
                    .or_insert((file.modified, Vec::new()));
                group.0 = group.0.min(file.modified);
                group.1.push(file.path);
            }

            let mut ordered: Vec<_> = groups.into_values().collect();
            ordered.sort_by_key(|(modified, _)| *modified);

            while ordered.len() >= max_files {
                let (_, paths) = ordered.remove(0);
                for path in paths {
                    if let Err(err) = std::fs::remove_file(&path) {
                        warn!(%err, path = %path.display(), "failed to remove old dump file");
                    }
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Record framing
// =============================================================================

fn write_shard_file(path: &Path, entries: &[Arc<Response>], gzip: bool) -> Result<DumpStats> {
    let mut stats = DumpStats::default();
    let mut payload = Vec::new();
    for entry in entries {
        let data = entry.data();
        let request = entry.request();
        let record = DumpRecord {
            status: data.status(),
            headers: data.headers().to_vec(),
            body: data.body().to_vec(),
            query: request.query().to_vec(),
            req_headers: request.headers().to_vec(),
            path: request.path().to_vec(),
            map_key: request.map_key(),
            shard_key: request.shard_key(),
        };
        match bincode::encode_to_vec(&record, bincode::config::standard()) {
            Ok(frame) => {
                payload.extend_from_slice(&(frame.len() as u32).to_le_bytes());
                payload.extend_from_slice(&frame);
                stats.records += 1;
            }
            Err(err) => {
                debug!(%err, key = record.map_key, "dump record encode failed");
                stats.errors += 1;
            }
        }
    }

    let tmp = path.with_extension("dump.tmp");
    let file = std::fs::File::create(&tmp)?;
    let mut buffered = std::io::BufWriter::new(file);
    if gzip {
        let mut encoder = GzEncoder::new(&mut buffered, Compression::fast());
        encoder.write_all(&payload)?;
        encoder.finish()?;
    } else {
        buffered.write_all(&payload)?;
    }
    buffered.flush()?;
    drop(buffered);
    std::fs::rename(&tmp, path)?;
    Ok(stats)
}

/// Decode one shard file into records. Returns (records, per-record error
/// count); a torn tail frame counts as one error and ends the file.
fn read_shard_file(path: &Path) -> Result<(Vec<DumpRecord>, u64)> {
    let raw = std::fs::read(path)?;
    let bytes = if raw.starts_with(&[0x1f, 0x8b]) {
        let mut decoder = GzDecoder::new(raw.as_slice());
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        out
    } else {
        raw
    };

    let mut records = Vec::new();
    let mut errors = 0u64;
    let mut pos = 0usize;
    let mut torn = false;
    while pos + 4 <= bytes.len() {
        let frame_len =
            u32::from_le_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]])
                as usize;
        pos += 4;
        if pos + frame_len > bytes.len() {
            errors += 1;
            torn = true;
            break;
        }
        match bincode::decode_from_slice::<DumpRecord, _>(
            &bytes[pos..pos + frame_len],
            bincode::config::standard(),
        ) {
            Ok((record, _)) => records.push(record),
            Err(err) => {
                let err = Error::DumpDecode(err.to_string());
                debug!(%err, "dump record dropped");
                errors += 1;
            }
        }
        pos += frame_len;
    }
    // Trailing garbage shorter than a length prefix.
    if !torn && pos != bytes.len() {
        errors += 1;
    }

    Ok((records, errors))
}

// =============================================================================
// Tests
// =============================================================================
