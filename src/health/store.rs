//! Durable health-record store with a TTL-bounded read cache.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;

use crate::health::record::HealthRecord;
use crate::sensor::SensorKind;

/// Health store error types.
#[derive(Debug, Error)]
pub enum HealthStoreError {
    /// Failed to access record storage.
    #[error("failed to access record storage: {0}")]
    Io(#[from] io::Error),

    /// A record file holds something other than a health record.
    #[error("malformed health record: {0}")]
    Json(#[from] serde_json::Error),
}

/// Clone-shareable handle to the on-disk health records.
///
/// Writes land atomically (serialize to a sibling temp file, then
/// rename), so a concurrent reader never observes a half-written
/// record. Reads go through a per-sensor freshness cache: the key set
/// is the registered sensor kinds, which bounds the map's size on its
/// own, and eviction is pure time-based expiry: a slot older than the
/// TTL is re-read from disk. A zero TTL disables caching entirely.
///
/// Sensor tasks each write only their own kind's record and the probe
/// handlers only read, so no further coordination is needed beyond the
/// cache mutex.
#[derive(Clone)]
pub struct HealthStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    dir: PathBuf,
    ttl: Duration,
    cache: Mutex<HashMap<SensorKind, CacheSlot>>,
}

#[derive(Debug, Clone, Copy)]
struct CacheSlot {
    fetched_at: Instant,
    /// `None` caches "no record on disk"; missing files are the hot
    /// path before the first cycle completes and deserve the same
    /// probe-storm protection.
    record: Option<HealthRecord>,
}

impl HealthStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>, ttl: Duration) -> Result<Self, HealthStoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            inner: Arc::new(StoreInner {
                dir,
                ttl,
                cache: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Path of one sensor's record file.
    pub fn record_path(&self, kind: SensorKind) -> PathBuf {
        self.inner.dir.join(format!("{kind}.json"))
    }

    /// Atomically persist `record` for `kind`.
    pub fn write(&self, kind: SensorKind, record: HealthRecord) -> Result<(), HealthStoreError> {
        let path = self.record_path(kind);
        let temp_path = path.with_extension("json.tmp");
        let payload = serde_json::to_vec(&record)?;
        fs::write(&temp_path, payload)?;
        fs::rename(&temp_path, &path)?;
        tracing::debug!(sensor = %kind, path = %path.display(), "Persisted health record");
        Ok(())
    }

    /// Read `kind`'s record straight from disk.
    ///
    /// A missing record is the zero-value record, not an error: "never
    /// completed a cycle" is a representable state.
    pub fn read(&self, kind: SensorKind) -> Result<HealthRecord, HealthStoreError> {
        Ok(self.load(kind)?.unwrap_or_default())
    }

    /// Read through the freshness cache.
    ///
    /// Returns `None` when no record exists on disk (distinguishing
    /// "never completed a cycle" for the readiness evaluator, which
    /// counts present records against the registry).
    pub fn cached_read(
        &self,
        kind: SensorKind,
    ) -> Result<Option<HealthRecord>, HealthStoreError> {
        let mut cache = self.inner.cache.lock();
        let now = Instant::now();
        if let Some(slot) = cache.get(&kind)
            && now.duration_since(slot.fetched_at) < self.inner.ttl
        {
            return Ok(slot.record);
        }
        let record = self.load(kind)?;
        cache.insert(
            kind,
            CacheSlot {
                fetched_at: now,
                record,
            },
        );
        Ok(record)
    }

    /// Cached snapshot of the records present for `kinds`.
    ///
    /// Absent records are simply not in the map; the evaluator treats a
    /// short map as "not fully initialized".
    pub fn snapshot(
        &self,
        kinds: &[SensorKind],
    ) -> Result<BTreeMap<SensorKind, HealthRecord>, HealthStoreError> {
        let mut records = BTreeMap::new();
        for &kind in kinds {
            if let Some(record) = self.cached_read(kind)? {
                records.insert(kind, record);
            }
        }
        Ok(records)
    }

    fn load(&self, kind: SensorKind) -> Result<Option<HealthRecord>, HealthStoreError> {
        match fs::read(self.record_path(kind)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

impl fmt::Debug for HealthStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthStore")
            .field("dir", &self.inner.dir)
            .field("ttl", &self.inner.ttl)
            .finish_non_exhaustive()
    }
}
