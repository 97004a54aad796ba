//! Typed adapter over the embedded redb engine.
//!
//! All maps live in one database file. Mutations accumulate in a single
//! open write transaction (the "batch"); `commit` makes the batch durable
//! and `rollback` discards it. Readers go through the open batch when one
//! exists so a read issued after a write on the same instance observes it.

use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use redb::{Database, ReadTransaction, ReadableTable, TableDefinition, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::StorageConfig;
use crate::error::StoreError;

pub type Map = TableDefinition<'static, &'static [u8], &'static [u8]>;

pub const SYSTEMS: Map = TableDefinition::new("systems");
pub const SYSTEMS_BY_UID: Map = TableDefinition::new("systems_by_uid");
pub const FOIS: Map = TableDefinition::new("fois");
pub const FOIS_BY_UID: Map = TableDefinition::new("fois_by_uid");
pub const DATASTREAMS: Map = TableDefinition::new("datastreams");
pub const DATASTREAMS_BY_SOURCE: Map = TableDefinition::new("datastreams_by_source");
pub const SERIES: Map = TableDefinition::new("series");
pub const SERIES_BY_DS: Map = TableDefinition::new("series_by_ds");
pub const OBS: Map = TableDefinition::new("obs");
pub const OBS_BY_DS: Map = TableDefinition::new("obs_by_ds");
pub const META: Map = TableDefinition::new("meta");

const ALL_MAPS: [Map; 11] = [
    SYSTEMS,
    SYSTEMS_BY_UID,
    FOIS,
    FOIS_BY_UID,
    DATASTREAMS,
    DATASTREAMS_BY_SOURCE,
    SERIES,
    SERIES_BY_DS,
    OBS,
    OBS_BY_DS,
    META,
];

// ── value envelope ──

/// Current schema version written in front of every stored value.
pub const VALUE_VERSION: u8 = 1;

const FLAG_ZSTD: u8 = 0b0000_0001;
const COMPRESS_THRESHOLD: usize = 64;

/// Decodes a value envelope written by any version up to [`VALUE_VERSION`].
/// Newer versions are rejected with a clear error so an old binary never
/// misreads a newer file.
pub fn decode_value<T: DeserializeOwned>(raw: &[u8]) -> Result<T, StoreError> {
    let [version, flags, body @ ..] = raw else {
        return Err(StoreError::Parse("value envelope too short".into()));
    };
    match *version {
        1 => {
            if *flags & FLAG_ZSTD != 0 {
                let body = zstd::decode_all(body)?;
                Ok(rmp_serde::from_slice(&body)?)
            } else {
                Ok(rmp_serde::from_slice(body)?)
            }
        }
        v => Err(StoreError::VersionMismatch {
            found: v,
            supported: VALUE_VERSION,
        }),
    }
}

// ── key encoding ──

/// Big-endian, sign-flipped so negative instants sort before positive ones.
pub fn ts_bytes(ms: i64) -> [u8; 8] {
    ((ms as u64) ^ (1 << 63)).to_be_bytes()
}

pub fn ts_from_bytes(b: &[u8]) -> i64 {
    let mut a = [0u8; 8];
    a.copy_from_slice(&b[..8]);
    (u64::from_be_bytes(a) ^ (1 << 63)) as i64
}

/// Internal IDs are positive, so plain big-endian bytes preserve order.
pub fn id_bytes(id: i64) -> [u8; 8] {
    (id as u64).to_be_bytes()
}

pub fn id_from_bytes(b: &[u8]) -> i64 {
    let mut a = [0u8; 8];
    a.copy_from_slice(&b[..8]);
    u64::from_be_bytes(a) as i64
}

pub fn key2(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut k = Vec::with_capacity(a.len() + b.len());
    k.extend_from_slice(a);
    k.extend_from_slice(b);
    k
}

pub fn key3(a: &[u8], b: &[u8], c: &[u8]) -> Vec<u8> {
    let mut k = Vec::with_capacity(a.len() + b.len() + c.len());
    k.extend_from_slice(a);
    k.extend_from_slice(b);
    k.extend_from_slice(c);
    k
}

/// Smallest key strictly greater than every key starting with `prefix`,
/// or `None` when no such key exists (all-0xFF prefix).
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < 0xFF {
            *last += 1;
            return Some(end);
        }
        end.pop();
    }
    None
}

// ── read access ──

/// Non-generic read surface shared by batch reads and snapshot reads.
pub trait MapRead {
    fn get(&self, map: Map, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Entries with `lo <= key < hi` (`hi = None` means unbounded),
    /// in key order.
    fn scan(
        &self,
        map: Map,
        lo: &[u8],
        hi: Option<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;
}

fn table_get(
    t: &impl ReadableTable<&'static [u8], &'static [u8]>,
    key: &[u8],
) -> Result<Option<Vec<u8>>, StoreError> {
    Ok(t.get(key)?.map(|g| g.value().to_vec()))
}

fn table_scan(
    t: &impl ReadableTable<&'static [u8], &'static [u8]>,
    lo: &[u8],
    hi: Option<&[u8]>,
) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
    use std::ops::Bound;
    let upper = match hi {
        Some(hi) => Bound::Excluded(hi),
        None => Bound::Unbounded,
    };
    let mut out = Vec::new();
    for item in t.range::<&[u8]>((Bound::Included(lo), upper))? {
        let (k, v) = item?;
        out.push((k.value().to_vec(), v.value().to_vec()));
    }
    Ok(out)
}

struct BatchRead<'a>(&'a WriteTransaction);

impl MapRead for BatchRead<'_> {
    fn get(&self, map: Map, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        table_get(&self.0.open_table(map)?, key)
    }

    fn scan(
        &self,
        map: Map,
        lo: &[u8],
        hi: Option<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        table_scan(&self.0.open_table(map)?, lo, hi)
    }
}

struct SnapshotRead(ReadTransaction);

impl MapRead for SnapshotRead {
    fn get(&self, map: Map, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        table_get(&self.0.open_table(map)?, key)
    }

    fn scan(
        &self,
        map: Map,
        lo: &[u8],
        hi: Option<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        table_scan(&self.0.open_table(map)?, lo, hi)
    }
}

// ── write access ──

enum WriteOp {
    Put(Map, Vec<u8>, Vec<u8>),
    Delete(Map, Vec<u8>),
}

/// Write handle passed to `update` closures.
///
/// Writes are buffered and applied to the batch transaction only when the
/// closure returns `Ok`, so a failed operation leaves the batch untouched.
/// Reads see the batch as of the start of the closure, not buffered writes.
pub struct Writer<'a> {
    txn: &'a WriteTransaction,
    compression: bool,
    ops: Vec<WriteOp>,
    dirty: u64,
}

impl Writer<'_> {
    pub fn put(&mut self, map: Map, key: Vec<u8>, value: Vec<u8>) {
        self.dirty += (key.len() + value.len()) as u64;
        self.ops.push(WriteOp::Put(map, key, value));
    }

    pub fn put_value<T: Serialize>(
        &mut self,
        map: Map,
        key: Vec<u8>,
        value: &T,
    ) -> Result<(), StoreError> {
        let body = rmp_serde::to_vec(value)?;
        let (flags, body) = if self.compression && body.len() > COMPRESS_THRESHOLD {
            (FLAG_ZSTD, zstd::encode_all(&body[..], 0)?)
        } else {
            (0, body)
        };
        let mut raw = Vec::with_capacity(2 + body.len());
        raw.push(VALUE_VERSION);
        raw.push(flags);
        raw.extend_from_slice(&body);
        self.put(map, key, raw);
        Ok(())
    }

    pub fn delete(&mut self, map: Map, key: Vec<u8>) {
        self.dirty += key.len() as u64;
        self.ops.push(WriteOp::Delete(map, key));
    }
}

impl MapRead for Writer<'_> {
    fn get(&self, map: Map, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        BatchRead(self.txn).get(map, key)
    }

    fn scan(
        &self,
        map: Map,
        lo: &[u8],
        hi: Option<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        BatchRead(self.txn).scan(map, lo, hi)
    }
}

// ── engine ──

struct BatchState {
    txn: Option<WriteTransaction>,
    dirty_bytes: u64,
    last_commit: Instant,
}

pub struct KvEngine {
    db: Database,
    state: Mutex<BatchState>,
    compression: bool,
    read_only: bool,
    auto_commit_buffer: u64,
}

impl KvEngine {
    pub fn open(cfg: &StorageConfig) -> Result<Self, StoreError> {
        let path = Path::new(&cfg.path);
        let builder = {
            let mut b = Database::builder();
            b.set_cache_size(cfg.memory_cache_bytes);
            b
        };
        let db = if cfg.read_only {
            builder.open(path)?
        } else {
            builder.create(path)?
        };

        let engine = Self {
            db,
            state: Mutex::new(BatchState {
                txn: None,
                dirty_bytes: 0,
                last_commit: Instant::now(),
            }),
            compression: cfg.compression,
            read_only: cfg.read_only,
            auto_commit_buffer: cfg.auto_commit_buffer_bytes,
        };

        if !cfg.read_only {
            // Create every map up front so read snapshots never hit a
            // missing table.
            let txn = engine.db.begin_write()?;
            for map in ALL_MAPS {
                txn.open_table(map)?;
            }
            txn.commit()?;
        }
        Ok(engine)
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Runs `f` against the open batch when one exists (read-your-writes),
    /// otherwise against a fresh read snapshot.
    pub fn view<R>(
        &self,
        f: impl FnOnce(&dyn MapRead) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let state = self.state.lock().unwrap();
        if state.txn.is_some() {
            return f(&BatchRead(state.txn.as_ref().unwrap()));
        }
        drop(state);
        f(&SnapshotRead(self.db.begin_read()?))
    }

    /// Runs `f` with a write handle. Buffered writes apply to the batch only
    /// when `f` succeeds. When applying the buffer itself fails the whole
    /// batch is aborted, since it may be partially written.
    pub fn update<R>(
        &self,
        f: impl FnOnce(&mut Writer<'_>) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        let mut state = self.state.lock().unwrap();
        if state.txn.is_none() {
            state.txn = Some(self.db.begin_write()?);
        }
        let txn = state.txn.as_ref().unwrap();
        let mut writer = Writer {
            txn,
            compression: self.compression,
            ops: Vec::new(),
            dirty: 0,
        };
        let result = f(&mut writer)?;

        let Writer { ops, dirty, .. } = writer;
        if let Err(e) = Self::apply(txn, ops) {
            tracing::error!("write batch left inconsistent, rolling back: {e}");
            if let Some(txn) = state.txn.take() {
                let _ = txn.abort();
            }
            state.dirty_bytes = 0;
            return Err(e);
        }
        state.dirty_bytes += dirty;

        if state.dirty_bytes >= self.auto_commit_buffer {
            Self::commit_locked(&mut state)?;
        }
        Ok(result)
    }

    fn apply(txn: &WriteTransaction, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        for op in ops {
            match op {
                WriteOp::Put(map, k, v) => {
                    txn.open_table(map)?.insert(k.as_slice(), v.as_slice())?;
                }
                WriteOp::Delete(map, k) => {
                    txn.open_table(map)?.remove(k.as_slice())?;
                }
            }
        }
        Ok(())
    }

    fn commit_locked(state: &mut BatchState) -> Result<(), StoreError> {
        if let Some(txn) = state.txn.take() {
            txn.commit()?;
            tracing::debug!(bytes = state.dirty_bytes, "committed write batch");
        }
        state.dirty_bytes = 0;
        state.last_commit = Instant::now();
        Ok(())
    }

    /// Makes the open batch durable. No-op when nothing is pending.
    pub fn commit(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        Self::commit_locked(&mut state)
    }

    /// Discards the open batch, restoring the last committed version.
    pub fn rollback(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some(txn) = state.txn.take() {
            txn.abort()?;
            tracing::debug!(bytes = state.dirty_bytes, "rolled back write batch");
        }
        state.dirty_bytes = 0;
        Ok(())
    }

    /// Commits when the batch is older than `period` or larger than the
    /// configured buffer. Called by the facade's auto-commit task.
    pub fn commit_if_due(&self, period: Duration) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.txn.is_none() {
            return Ok(());
        }
        if state.last_commit.elapsed() >= period || state.dirty_bytes >= self.auto_commit_buffer {
            Self::commit_locked(&mut state)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_engine(dir: &std::path::Path) -> KvEngine {
        let cfg = StorageConfig {
            path: dir.join("test.db").to_string_lossy().into_owned(),
            ..StorageConfig::default()
        };
        KvEngine::open(&cfg).unwrap()
    }

    #[test]
    fn test_put_get_round_trip() {
        let dir = tempdir().unwrap();
        let engine = test_engine(dir.path());
        engine
            .update(|w| {
                w.put(META, b"k".to_vec(), b"v".to_vec());
                Ok(())
            })
            .unwrap();
        // Uncommitted batch is visible to reads on the same engine.
        let v = engine.view(|r| r.get(META, b"k")).unwrap();
        assert_eq!(v.as_deref(), Some(b"v".as_slice()));
    }

    #[test]
    fn test_rollback_discards_batch() {
        let dir = tempdir().unwrap();
        let engine = test_engine(dir.path());
        engine
            .update(|w| {
                w.put(META, b"a".to_vec(), b"1".to_vec());
                Ok(())
            })
            .unwrap();
        engine.commit().unwrap();
        engine
            .update(|w| {
                w.put(META, b"a".to_vec(), b"2".to_vec());
                w.put(META, b"b".to_vec(), b"2".to_vec());
                Ok(())
            })
            .unwrap();
        engine.rollback().unwrap();
        let a = engine.view(|r| r.get(META, b"a")).unwrap();
        let b = engine.view(|r| r.get(META, b"b")).unwrap();
        assert_eq!(a.as_deref(), Some(b"1".as_slice()));
        assert_eq!(b, None);
    }

    #[test]
    fn test_failed_update_leaves_batch_untouched() {
        let dir = tempdir().unwrap();
        let engine = test_engine(dir.path());
        let err = engine.update(|w| {
            w.put(META, b"x".to_vec(), b"1".to_vec());
            Err::<(), _>(StoreError::InvalidRequest("nope".into()))
        });
        assert!(err.is_err());
        assert_eq!(engine.view(|r| r.get(META, b"x")).unwrap(), None);
    }

    #[test]
    fn test_scan_is_key_ordered_and_hi_exclusive() {
        let dir = tempdir().unwrap();
        let engine = test_engine(dir.path());
        engine
            .update(|w| {
                for k in [b"a2", b"a1", b"a3", b"b1"] {
                    w.put(META, k.to_vec(), k.to_vec());
                }
                Ok(())
            })
            .unwrap();
        let rows = engine
            .view(|r| r.scan(META, b"a1", Some(b"a3")))
            .unwrap();
        let keys: Vec<_> = rows.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![b"a1".as_slice(), b"a2".as_slice()]);
    }

    #[test]
    fn test_value_envelope_version_gate() {
        let raw = [VALUE_VERSION + 1, 0, 0xc0];
        match decode_value::<Option<u8>>(&raw) {
            Err(StoreError::VersionMismatch { found, supported }) => {
                assert_eq!(found, VALUE_VERSION + 1);
                assert_eq!(supported, VALUE_VERSION);
            }
            other => panic!("expected version mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_compressed_values_round_trip() {
        let dir = tempdir().unwrap();
        let cfg = StorageConfig {
            path: dir.path().join("z.db").to_string_lossy().into_owned(),
            compression: true,
            ..StorageConfig::default()
        };
        let engine = KvEngine::open(&cfg).unwrap();
        let value: Vec<String> = (0..100).map(|i| format!("row-{i}")).collect();
        engine
            .update(|w| w.put_value(META, b"big".to_vec(), &value))
            .unwrap();
        let raw = engine.view(|r| r.get(META, b"big")).unwrap().unwrap();
        assert_eq!(raw[1] & 1, 1, "large value should carry the zstd flag");
        let decoded: Vec<String> = decode_value(&raw).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_ts_bytes_order_preserving() {
        let times = [i64::MIN, -5, 0, 5, i64::MAX];
        for pair in times.windows(2) {
            assert!(ts_bytes(pair[0]) < ts_bytes(pair[1]));
        }
        assert_eq!(ts_from_bytes(&ts_bytes(-12345)), -12345);
    }

    #[test]
    fn test_prefix_end() {
        assert_eq!(prefix_end(b"ab").as_deref(), Some(b"ac".as_slice()));
        assert_eq!(prefix_end(&[0x01, 0xFF]).as_deref(), Some([0x02].as_slice()));
        assert_eq!(prefix_end(&[0xFF, 0xFF]), None);
    }
}
