//! Disk-backed offline queue of envelopes.
//!
//! One file per envelope. Files are written to a temp file in the same
//! directory and renamed into place, so a reader never sees a half-written
//! entry. File names encode creation order:
//!
//! ```text
//! <created micros, 20 digits>-<sequence, 10 digits>-<event id>.envelope
//! ```
//!
//! Sorting names therefore sorts entries oldest first; the per-process
//! sequence and then the event id break ties between equal timestamps.
//!
//! Each file holds one JSON line with the persisted hint flags followed by
//! the envelope in wire format.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::envelope::{Envelope, EventId};
use crate::error::{EnvelopeError, PostboxError, PostboxResult};
use crate::hint::{Hint, HintFlags};
use crate::report::{DiscardReason, DiscardTracker};

/// Suffix of every cached envelope file
pub const ENVELOPE_FILE_SUFFIX: &str = ".envelope";

/// Directory, relative to the cache directory, holding crash-time signals
pub const OUTBOX_DIR: &str = "outbox";

/// Name of the startup crash marker inside the outbox
pub const STARTUP_CRASH_MARKER_FILE: &str = "startup_crash";

const RECORD_VERSION: u32 = 1;

/// Cache settings
#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub directory: PathBuf,
    pub max_items: usize,
    /// A crash-time flush this soon after init counts as a startup crash
    pub startup_crash_threshold: Duration,
}

impl CacheOptions {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            max_items: 30,
            startup_crash_threshold: Duration::milliseconds(2000),
        }
    }
}

/// First line of a cache file
#[derive(Debug, Serialize, Deserialize)]
struct RecordHeader {
    v: u32,
    #[serde(default)]
    hint: HintFlags,
}

/// An envelope loaded back from disk
#[derive(Debug, Clone)]
pub struct CachedEnvelope {
    pub envelope: Envelope,
    /// Persisted flags with `cached` set
    pub hint: Hint,
}

/// Capacity-bounded, crash-safe envelope store
pub struct EnvelopeCache {
    directory: PathBuf,
    max_items: usize,
    startup_crash_threshold: Duration,
    init_time: DateTime<Utc>,
    clock: Arc<dyn Clock>,
    discards: Arc<DiscardTracker>,
    // Serializes rotate+write within this process
    write_lock: Mutex<()>,
    sequence: AtomicU64,
}

impl EnvelopeCache {
    /// Open (creating if needed) the cache directory. Init time is "now".
    pub fn open(
        options: CacheOptions,
        clock: Arc<dyn Clock>,
        discards: Arc<DiscardTracker>,
    ) -> PostboxResult<Self> {
        fs::create_dir_all(&options.directory).map_err(|source| PostboxError::CacheDir {
            path: options.directory.display().to_string(),
            source,
        })?;

        let init_time = clock.now();
        Ok(Self {
            directory: options.directory,
            max_items: options.max_items,
            startup_crash_threshold: options.startup_crash_threshold,
            init_time,
            clock,
            discards,
            write_lock: Mutex::new(()),
            sequence: AtomicU64::new(0),
        })
    }

    /// Override the SDK init time used for startup crash detection.
    pub fn with_init_time(mut self, init_time: DateTime<Utc>) -> Self {
        self.init_time = init_time;
        self
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn outbox_dir(&self) -> PathBuf {
        self.directory.join(OUTBOX_DIR)
    }

    pub fn max_items(&self) -> usize {
        self.max_items
    }

    /// Persist `envelope`.
    ///
    /// Returns whether the envelope is on disk afterwards. Oldest entries are
    /// evicted first so the entry count never exceeds `max_items`.
    pub fn store(&self, envelope: &Envelope, hint: &Hint) -> bool {
        let stored = self.store_entry(envelope, hint);

        if hint.is_disk_flush() {
            self.write_startup_crash_marker_if_needed();
        }

        stored
    }

    fn store_entry(&self, envelope: &Envelope, hint: &Hint) -> bool {
        let event_id = envelope.event_id();
        if self.max_items == 0 {
            debug!(event_id = %event_id, "Cache capacity is zero, not storing envelope");
            return false;
        }

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let entries = match self.entries() {
            Ok(entries) => entries,
            Err(e) => {
                warn!(
                    directory = %self.directory.display(),
                    error = %e,
                    "Cache directory is not readable"
                );
                return false;
            }
        };

        if find_entry(&entries, event_id).is_some() {
            debug!(event_id = %event_id, "Envelope already in offline storage");
            return true;
        }

        self.rotate_if_needed(&entries);

        let path = self.entry_path(event_id);
        match self.write_entry(&path, envelope, hint) {
            Ok(()) => {
                debug!(event_id = %event_id, path = %path.display(), "Envelope added to offline storage");
                self.trim_after_write(&path);
                true
            }
            Err(e) => {
                warn!(
                    event_id = %event_id,
                    path = %path.display(),
                    error = %e,
                    "Failed to write envelope to offline storage"
                );
                false
            }
        }
    }

    /// Remove the entry for `envelope`; absent entries are fine.
    pub fn discard(&self, envelope: &Envelope) {
        self.discard_id(envelope.event_id());
    }

    pub fn discard_id(&self, event_id: EventId) {
        let entries = match self.entries() {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Cache directory is not readable");
                return;
            }
        };

        let Some(path) = find_entry(&entries, event_id) else {
            debug!(event_id = %event_id, "Envelope was not cached");
            return;
        };

        match fs::remove_file(path) {
            Ok(()) => debug!(event_id = %event_id, "Discarded envelope from cache"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(event_id = %event_id, "Envelope already removed from cache")
            }
            Err(e) => warn!(event_id = %event_id, error = %e, "Failed to discard cached envelope"),
        }
    }

    /// Lazy iterator over the entries on disk right now, oldest first.
    ///
    /// Corrupt entries are deleted and skipped. Call again to start over.
    pub fn pending(&self) -> PendingEnvelopes {
        let paths = self.entries().unwrap_or_else(|e| {
            warn!(
                directory = %self.directory.display(),
                error = %e,
                "Cache directory is not readable"
            );
            Vec::new()
        });
        PendingEnvelopes {
            paths: paths.into_iter(),
        }
    }

    /// Check for the startup crash marker and consume it.
    ///
    /// Returns true only for the call that actually removed the marker.
    pub fn has_startup_crash_marker(&self) -> bool {
        let marker = self.outbox_dir().join(STARTUP_CRASH_MARKER_FILE);
        match fs::remove_file(&marker) {
            Ok(()) => {
                info!("Startup crash marker found");
                true
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => {
                warn!(path = %marker.display(), error = %e, "Failed to remove startup crash marker");
                false
            }
        }
    }

    /// Number of envelope entries on disk.
    pub fn len(&self) -> usize {
        self.entries().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Envelope files sorted oldest first.
    fn entries(&self) -> io::Result<Vec<PathBuf>> {
        let mut names: Vec<String> = fs::read_dir(&self.directory)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.ends_with(ENVELOPE_FILE_SUFFIX) && !name.starts_with('.'))
            .collect();
        names.sort();
        Ok(names.into_iter().map(|name| self.directory.join(name)).collect())
    }

    fn entry_path(&self, event_id: EventId) -> PathBuf {
        let micros = self.clock.now().timestamp_micros().max(0) as u64;
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) % 10_000_000_000;
        self.directory.join(format!(
            "{:020}-{:010}-{}{}",
            micros, sequence, event_id, ENVELOPE_FILE_SUFFIX
        ))
    }

    fn rotate_if_needed(&self, entries: &[PathBuf]) {
        if entries.len() < self.max_items {
            return;
        }

        let excess = entries.len() - self.max_items + 1;
        warn!(
            entries = entries.len(),
            max_items = self.max_items,
            evicting = excess,
            "Cache is full, evicting oldest entries"
        );
        self.evict(&entries[..excess]);
    }

    /// Another process may have written between our listing and our rename.
    fn trim_after_write(&self, written: &Path) {
        let Ok(entries) = self.entries() else {
            return;
        };
        if entries.len() <= self.max_items {
            return;
        }

        let excess = entries.len() - self.max_items;
        let oldest: Vec<PathBuf> = entries
            .into_iter()
            .filter(|path| path != written)
            .take(excess)
            .collect();
        debug!(evicting = oldest.len(), "Cache over capacity after write");
        self.evict(&oldest);
    }

    fn evict(&self, paths: &[PathBuf]) {
        for path in paths {
            if let Ok(cached) = read_entry(path) {
                self.discards
                    .record_envelope(DiscardReason::CacheOverflow, &cached.envelope);
            }
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Cache entry can't be deleted"),
            }
        }
    }

    fn write_entry(&self, path: &Path, envelope: &Envelope, hint: &Hint) -> Result<(), EnvelopeError> {
        let mut tmp = tempfile::Builder::new()
            .prefix(".tmp-")
            .suffix(".partial")
            .tempfile_in(&self.directory)?;

        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            let header = RecordHeader {
                v: RECORD_VERSION,
                hint: hint.persisted_flags(),
            };
            serde_json::to_writer(&mut writer, &header)?;
            writer.write_all(b"\n")?;
            envelope.write_to(&mut writer)?;
        }
        tmp.as_file().sync_all()?;

        tmp.persist(path).map_err(|e| EnvelopeError::Io(e.error))?;
        Ok(())
    }

    fn write_startup_crash_marker_if_needed(&self) {
        let since_init = self.clock.now() - self.init_time;
        if since_init > self.startup_crash_threshold {
            return;
        }

        let outbox = self.outbox_dir();
        let marker = outbox.join(STARTUP_CRASH_MARKER_FILE);
        let result = fs::create_dir_all(&outbox).and_then(|_| File::create(&marker).map(drop));
        match result {
            Ok(()) => info!(
                since_init_ms = since_init.num_milliseconds(),
                "Crash shortly after startup, writing startup crash marker"
            ),
            Err(e) => warn!(path = %marker.display(), error = %e, "Failed to write startup crash marker"),
        }
    }
}

fn find_entry(entries: &[PathBuf], event_id: EventId) -> Option<&PathBuf> {
    let suffix = format!("-{}{}", event_id, ENVELOPE_FILE_SUFFIX);
    entries.iter().find(|path| {
        path.file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(&suffix))
    })
}

fn read_entry(path: &Path) -> Result<CachedEnvelope, EnvelopeError> {
    let mut reader = BufReader::new(File::open(path)?);

    let mut line = Vec::new();
    if reader.read_until(b'\n', &mut line)? == 0 {
        return Err(EnvelopeError::corrupt("empty cache file"));
    }
    let header: RecordHeader = serde_json::from_slice(&line)
        .map_err(|e| EnvelopeError::corrupt(format!("cache record header: {}", e)))?;
    if header.v != RECORD_VERSION {
        return Err(EnvelopeError::corrupt(format!(
            "unsupported cache record version {}",
            header.v
        )));
    }

    let envelope = Envelope::from_reader(reader)?;
    Ok(CachedEnvelope {
        envelope,
        hint: Hint::from_cache(header.hint),
    })
}

/// Iterator returned by [`EnvelopeCache::pending`]
pub struct PendingEnvelopes {
    paths: std::vec::IntoIter<PathBuf>,
}

impl Iterator for PendingEnvelopes {
    type Item = CachedEnvelope;

    fn next(&mut self) -> Option<Self::Item> {
        for path in self.paths.by_ref() {
            match read_entry(&path) {
                Ok(cached) => return Some(cached),
                Err(EnvelopeError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "Cached envelope disappeared before it was read");
                }
                Err(e) if !e.is_corrupt() => {
                    warn!(path = %path.display(), error = %e, "Error reading cached envelope");
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Deleting corrupt cached envelope");
                    if let Err(e) = fs::remove_file(&path) {
                        if e.kind() != io::ErrorKind::NotFound {
                            warn!(path = %path.display(), error = %e, "Failed to delete corrupt cached envelope");
                        }
                    }
                }
            }
        }
        None
    }
}
