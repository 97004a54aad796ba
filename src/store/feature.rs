use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::StoreError;
use crate::filter::FeatureFilter;
use crate::ids::IdAllocator;
use crate::kv::{self, KvEngine, Map, MapRead};
use crate::models::feature::{FeatureKey, FeatureRecord};

use super::{current_index, now_ms, select_version_indexes};

/// Versioned feature store over a `(internalID, validTime)` keyed map plus
/// a UID index. One generic store serves both systems and FOIs; the two
/// instances differ only in their maps and ID sequence.
pub struct FeatureStore {
    engine: Arc<KvEngine>,
    map: Map,
    uid_map: Map,
    allocator: IdAllocator,
    kind: &'static str,
}

fn entry_key(id: i64, valid_time_ms: i64) -> Vec<u8> {
    kv::key2(&kv::id_bytes(id), &kv::ts_bytes(valid_time_ms))
}

impl FeatureStore {
    pub(crate) fn new(
        engine: Arc<KvEngine>,
        map: Map,
        uid_map: Map,
        seq_key: &'static [u8],
        kind: &'static str,
    ) -> Self {
        Self {
            engine,
            map,
            uid_map,
            allocator: IdAllocator::new(seq_key),
            kind,
        }
    }

    /// Version entries of one feature in valid-time order.
    fn versions(
        &self,
        r: &dyn MapRead,
        id: i64,
    ) -> Result<Vec<(i64, Vec<u8>)>, StoreError> {
        let prefix = kv::id_bytes(id);
        let rows = r.scan(self.map, &prefix, kv::prefix_end(&prefix).as_deref())?;
        Ok(rows
            .into_iter()
            .map(|(k, v)| (kv::ts_from_bytes(&k[8..]), v))
            .collect())
    }

    /// Adds a new feature. Fails with `AlreadyExists` when the UID already
    /// has a version whose validity interval overlaps the new one; the only
    /// permitted overlap-free add on an existing UID is a back-dated entry
    /// ending where the stored history begins.
    pub fn add(
        &self,
        record: &FeatureRecord,
        valid_time_ms: Option<i64>,
    ) -> Result<FeatureKey, StoreError> {
        record.validate()?;
        let valid_time_ms = valid_time_ms.unwrap_or_else(now_ms);
        self.engine.update(|w| {
            let key = match w.get(self.uid_map, record.uid.as_bytes())? {
                Some(raw) => {
                    let id = kv::id_from_bytes(&raw);
                    let first = self
                        .versions(w, id)?
                        .first()
                        .map(|(t, _)| *t)
                        .unwrap_or(i64::MAX);
                    if valid_time_ms >= first {
                        return Err(StoreError::AlreadyExists(record.uid.clone()));
                    }
                    FeatureKey { id, valid_time_ms }
                }
                None => {
                    let id = self.allocator.next(w)?;
                    w.put(self.uid_map, record.uid.clone().into_bytes(), kv::id_bytes(id).to_vec());
                    FeatureKey { id, valid_time_ms }
                }
            };
            w.put_value(self.map, entry_key(key.id, key.valid_time_ms), record)?;
            tracing::debug!(kind = self.kind, uid = %record.uid, id = key.id, "added feature");
            Ok(key)
        })
    }

    /// Appends a version to an existing UID. The new version begins at
    /// `valid_time_ms` (default now) and implicitly truncates its
    /// predecessor.
    pub fn add_version(
        &self,
        record: &FeatureRecord,
        valid_time_ms: Option<i64>,
    ) -> Result<FeatureKey, StoreError> {
        record.validate()?;
        let valid_time_ms = valid_time_ms.unwrap_or_else(now_ms);
        self.engine.update(|w| {
            let raw = w
                .get(self.uid_map, record.uid.as_bytes())?
                .ok_or(StoreError::NotFound)?;
            let id = kv::id_from_bytes(&raw);
            w.put_value(self.map, entry_key(id, valid_time_ms), record)?;
            Ok(FeatureKey { id, valid_time_ms })
        })
    }

    /// Overwrites an existing version in place, preserving its UID.
    /// Returns the previous record.
    pub fn put(&self, key: FeatureKey, record: &FeatureRecord) -> Result<FeatureRecord, StoreError> {
        record.validate()?;
        self.engine.update(|w| {
            let k = entry_key(key.id, key.valid_time_ms);
            let prev_raw = w.get(self.map, &k)?.ok_or(StoreError::NotFound)?;
            let prev: FeatureRecord = kv::decode_value(&prev_raw)?;
            if prev.uid != record.uid {
                return Err(StoreError::InvalidRequest(
                    "uid of a stored version cannot change".into(),
                ));
            }
            w.put_value(self.map, k, record)?;
            Ok(prev)
        })
    }

    pub fn get(&self, key: FeatureKey) -> Result<Option<FeatureRecord>, StoreError> {
        self.engine.view(|r| {
            r.get(self.map, &entry_key(key.id, key.valid_time_ms))?
                .map(|raw| kv::decode_value(&raw))
                .transpose()
        })
    }

    pub fn id_of_uid(&self, uid: &str) -> Result<Option<i64>, StoreError> {
        self.engine
            .view(|r| Ok(r.get(self.uid_map, uid.as_bytes())?.map(|raw| kv::id_from_bytes(&raw))))
    }

    /// The version whose validity interval contains the wall clock; when
    /// none does, the nearest version (earlier preferred).
    pub fn current_version(&self, id: i64) -> Result<Option<(FeatureKey, FeatureRecord)>, StoreError> {
        self.engine.view(|r| {
            let versions = self.versions(r, id)?;
            let begins: Vec<i64> = versions.iter().map(|(t, _)| *t).collect();
            match current_index(&begins, now_ms()) {
                Some(i) => {
                    let record = kv::decode_value(&versions[i].1)?;
                    Ok(Some((
                        FeatureKey { id, valid_time_ms: begins[i] },
                        record,
                    )))
                }
                None => Ok(None),
            }
        })
    }

    pub fn current_version_key(&self, id: i64) -> Result<Option<FeatureKey>, StoreError> {
        Ok(self.current_version(id)?.map(|(k, _)| k))
    }

    pub fn current_version_by_uid(
        &self,
        uid: &str,
    ) -> Result<Option<(FeatureKey, FeatureRecord)>, StoreError> {
        match self.id_of_uid(uid)? {
            Some(id) => self.current_version(id),
            None => Ok(None),
        }
    }

    /// Matching entries in internal-ID-ascending, valid-time-ascending
    /// order. `extra` lets the facade layer add resolved cross-store
    /// constraints on top of the filter.
    pub fn select_entries_where(
        &self,
        filter: &FeatureFilter,
        extra: &dyn Fn(i64, &FeatureRecord) -> bool,
    ) -> Result<Vec<(FeatureKey, FeatureRecord)>, StoreError> {
        self.engine.view(|r| self.select_in(r, filter, extra))
    }

    pub fn select_entries(
        &self,
        filter: &FeatureFilter,
    ) -> Result<Vec<(FeatureKey, FeatureRecord)>, StoreError> {
        self.select_entries_where(filter, &|_, _| true)
    }

    fn select_in(
        &self,
        r: &dyn MapRead,
        filter: &FeatureFilter,
        extra: &dyn Fn(i64, &FeatureRecord) -> bool,
    ) -> Result<Vec<(FeatureKey, FeatureRecord)>, StoreError> {
        let now = now_ms();
        let mut out = Vec::new();

        // Index pushdown on internal IDs and UIDs; everything else is
        // re-checked by `test` on the candidates.
        let candidates: Option<BTreeSet<i64>> = match (&filter.internal_ids, &filter.unique_ids) {
            (None, None) => None,
            (ids, uids) => {
                let mut set: Option<BTreeSet<i64>> = ids.clone();
                if let Some(uids) = uids {
                    let mut resolved = BTreeSet::new();
                    for uid in uids {
                        if let Some(raw) = r.get(self.uid_map, uid.as_bytes())? {
                            resolved.insert(kv::id_from_bytes(&raw));
                        }
                    }
                    set = Some(match set {
                        Some(s) => s.intersection(&resolved).copied().collect(),
                        None => resolved,
                    });
                }
                set
            }
        };

        match candidates {
            Some(ids) => {
                for id in ids {
                    let versions = self.versions(r, id)?;
                    self.collect_versions(id, &versions, filter, extra, now, &mut out)?;
                }
            }
            None => {
                let rows = r.scan(self.map, &[], None)?;
                let mut i = 0;
                while i < rows.len() {
                    let id = kv::id_from_bytes(&rows[i].0);
                    let mut versions = Vec::new();
                    while i < rows.len() && kv::id_from_bytes(&rows[i].0) == id {
                        versions.push((kv::ts_from_bytes(&rows[i].0[8..]), rows[i].1.clone()));
                        i += 1;
                    }
                    self.collect_versions(id, &versions, filter, extra, now, &mut out)?;
                }
            }
        }

        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    fn collect_versions(
        &self,
        id: i64,
        versions: &[(i64, Vec<u8>)],
        filter: &FeatureFilter,
        extra: &dyn Fn(i64, &FeatureRecord) -> bool,
        now: i64,
        out: &mut Vec<(FeatureKey, FeatureRecord)>,
    ) -> Result<(), StoreError> {
        let begins: Vec<i64> = versions.iter().map(|(t, _)| *t).collect();
        for i in select_version_indexes(&begins, &filter.valid_time, now) {
            let record: FeatureRecord = kv::decode_value(&versions[i].1)?;
            if filter.test(id, &record) && extra(id, &record) {
                out.push((FeatureKey { id, valid_time_ms: begins[i] }, record));
            }
        }
        Ok(())
    }

    pub fn count_matching(&self, filter: &FeatureFilter) -> Result<u64, StoreError> {
        Ok(self.select_entries(filter)?.len() as u64)
    }

    /// Removes every matching version; drops the UID index entry once the
    /// last version of a feature is gone. Returns the removed entry count.
    pub fn remove_entries_where(
        &self,
        filter: &FeatureFilter,
        extra: &dyn Fn(i64, &FeatureRecord) -> bool,
    ) -> Result<u64, StoreError> {
        self.engine.update(|w| {
            let matches = self.select_in(w, filter, extra)?;
            let mut removed_per_id: std::collections::BTreeMap<i64, (usize, String)> =
                Default::default();
            for (key, record) in &matches {
                w.delete(self.map, entry_key(key.id, key.valid_time_ms));
                let e = removed_per_id.entry(key.id).or_insert((0, record.uid.clone()));
                e.0 += 1;
            }
            for (id, (removed, uid)) in removed_per_id {
                if self.versions(w, id)?.len() == removed {
                    w.delete(self.uid_map, uid.into_bytes());
                }
            }
            tracing::debug!(kind = self.kind, count = matches.len(), "removed features");
            Ok(matches.len() as u64)
        })
    }

    pub fn remove_entries(&self, filter: &FeatureFilter) -> Result<u64, StoreError> {
        self.remove_entries_where(filter, &|_, _| true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::filter::TemporalFilter;
    use crate::kv::{SYSTEMS, SYSTEMS_BY_UID};
    use tempfile::tempdir;

    fn store(dir: &std::path::Path) -> FeatureStore {
        let cfg = StorageConfig {
            path: dir.join("features.db").to_string_lossy().into_owned(),
            ..StorageConfig::default()
        };
        let engine = Arc::new(KvEngine::open(&cfg).unwrap());
        FeatureStore::new(engine, SYSTEMS, SYSTEMS_BY_UID, b"seq:system", "system")
    }

    fn record(uid: &str, name: &str) -> FeatureRecord {
        FeatureRecord {
            uid: uid.into(),
            name: name.into(),
            description: None,
            feature_type: None,
            geometry: None,
            properties: Default::default(),
            parent_id: 0,
        }
    }

    #[test]
    fn test_add_assigns_monotonic_ids() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        let a = s.add(&record("urn:x:sys:0001", "one"), None).unwrap();
        let b = s.add(&record("urn:x:sys:0002", "two"), None).unwrap();
        assert!(a.id > 0);
        assert_eq!(b.id, a.id + 1);
    }

    #[test]
    fn test_add_duplicate_uid_conflicts() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        s.add(&record("urn:x:sys:0001", "one"), Some(1000)).unwrap();
        let err = s.add(&record("urn:x:sys:0001", "one again"), Some(2000));
        assert!(matches!(err, Err(StoreError::AlreadyExists(_))));
        // A back-dated entry ending where the history begins is allowed.
        let key = s.add(&record("urn:x:sys:0001", "prehistory"), Some(500)).unwrap();
        assert_eq!(key.valid_time_ms, 500);
    }

    #[test]
    fn test_add_rejects_short_uid_and_empty_name() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        assert!(matches!(
            s.add(&record("short", "name"), None),
            Err(StoreError::InvalidRequest(_))
        ));
        assert!(matches!(
            s.add(&record("urn:x:sys:0001", "  "), None),
            Err(StoreError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_current_version_picks_containing_interval() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        let t0 = now_ms() - 10_000;
        let t1 = now_ms() - 1_000;
        let key0 = s.add(&record("urn:x:sys:0001", "v0"), Some(t0)).unwrap();
        let key1 = s.add_version(&record("urn:x:sys:0001", "v1"), Some(t1)).unwrap();
        assert_eq!(key0.id, key1.id);

        let (key, rec) = s.current_version(key0.id).unwrap().unwrap();
        assert_eq!(key.valid_time_ms, t1);
        assert_eq!(rec.name, "v1");
    }

    #[test]
    fn test_current_version_nearest_when_all_later() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        let future = now_ms() + 60_000;
        let key = s.add(&record("urn:x:sys:0001", "future"), Some(future)).unwrap();
        let (k, _) = s.current_version(key.id).unwrap().unwrap();
        assert_eq!(k.valid_time_ms, future);
    }

    #[test]
    fn test_add_version_requires_existing_uid() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        assert!(matches!(
            s.add_version(&record("urn:x:sys:0009", "v"), None),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn test_put_preserves_uid_and_returns_previous() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        let key = s.add(&record("urn:x:sys:0001", "before"), Some(1000)).unwrap();
        let prev = s.put(key, &record("urn:x:sys:0001", "after")).unwrap();
        assert_eq!(prev.name, "before");
        assert_eq!(s.get(key).unwrap().unwrap().name, "after");

        assert!(matches!(
            s.put(key, &record("urn:x:sys:other-01", "after")),
            Err(StoreError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_select_orders_by_id_then_valid_time() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        s.add(&record("urn:x:sys:0002", "b"), Some(1000)).unwrap();
        s.add(&record("urn:x:sys:0001", "a"), Some(1000)).unwrap();
        s.add_version(&record("urn:x:sys:0002", "b2"), Some(2000)).unwrap();

        let rows = s.select_entries(&FeatureFilter::new()).unwrap();
        let keys: Vec<(i64, i64)> = rows.iter().map(|(k, _)| (k.id, k.valid_time_ms)).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn test_select_latest_version_only() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        s.add(&record("urn:x:sys:0001", "v0"), Some(1000)).unwrap();
        s.add_version(&record("urn:x:sys:0001", "v1"), Some(2000)).unwrap();

        let filter = FeatureFilter::new().with_valid_time(TemporalFilter::LatestVersion);
        let rows = s.select_entries(&filter).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1.name, "v1");
    }

    #[test]
    fn test_select_count_agree() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        for i in 0..5 {
            s.add(&record(&format!("urn:x:sys:{i:04}"), "x"), Some(1000)).unwrap();
        }
        let filter = FeatureFilter::new().with_limit(3);
        assert_eq!(
            s.select_entries(&filter).unwrap().len() as u64,
            s.count_matching(&filter).unwrap()
        );
    }

    #[test]
    fn test_remove_entries_drops_uid_index() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        s.add(&record("urn:x:sys:0001", "x"), Some(1000)).unwrap();
        let removed = s
            .remove_entries(&FeatureFilter::new().with_unique_ids(["urn:x:sys:0001"]))
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(s.id_of_uid("urn:x:sys:0001").unwrap(), None);
        // The UID can be registered again from scratch.
        s.add(&record("urn:x:sys:0001", "again"), Some(1000)).unwrap();
    }
}
