//! The observation database: four stores behind one transactional boundary.

pub mod datastream;
pub mod feature;
pub mod obs;

pub use datastream::{DataStreamStore, RegisterOutcome};
pub use feature::FeatureStore;
pub use obs::{ObsOrder, ObsStore};

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::StorageConfig;
use crate::error::StoreError;
use crate::filter::{DataStreamFilter, FoiFilter, ObsFilter, SystemFilter, TemporalFilter};
use crate::kv::{self, FOIS, FOIS_BY_UID, KvEngine, MapRead, META, SYSTEMS, SYSTEMS_BY_UID};
use crate::models::datastream::{DataStreamKey, DataStreamRecord};
use crate::models::feature::{FeatureKey, FeatureRecord};
use crate::models::obs::{ObsData, ObsKey, SeriesRecord};

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Positions of versions (begin times ascending) whose implicit validity
/// interval `[begin_i, begin_{i+1})` intersects the temporal filter. The
/// last version extends to the end of time.
pub(crate) fn select_version_indexes(
    begins: &[i64],
    t: &TemporalFilter,
    now_ms: i64,
) -> Vec<usize> {
    match t {
        TemporalFilter::AllTimes => (0..begins.len()).collect(),
        TemporalFilter::LatestVersion => begins.len().checked_sub(1).into_iter().collect(),
        t => {
            let Some((lo, hi)) = t.resolved_range(now_ms) else {
                return (0..begins.len()).collect();
            };
            (0..begins.len())
                .filter(|&i| {
                    let begin = begins[i];
                    let end = begins.get(i + 1).copied().unwrap_or(i64::MAX);
                    begin <= hi && end > lo
                })
                .collect()
        }
    }
}

/// Index of the version valid at `now_ms`; when none contains it (the whole
/// history lies in the future), the nearest version, earlier preferred.
pub(crate) fn current_index(begins: &[i64], now_ms: i64) -> Option<usize> {
    if begins.is_empty() {
        return None;
    }
    match begins.iter().rposition(|&b| b <= now_ms) {
        Some(i) => Some(i),
        None => Some(0),
    }
}

const DATABASE_NUM_KEY: &[u8] = b"database_num";

/// The database facade. Owns exactly one embedded engine; the sub-stores
/// share it and all mutations serialize through its write lock.
pub struct Db {
    engine: Arc<KvEngine>,
    txn_lock: Mutex<()>,
    pub systems: FeatureStore,
    pub fois: FeatureStore,
    pub datastreams: DataStreamStore,
    pub obs: ObsStore,
}

impl Db {
    pub fn open(cfg: &StorageConfig) -> Result<Self, StoreError> {
        let engine = Arc::new(KvEngine::open(cfg)?);

        if !engine.read_only() {
            engine.update(|w| {
                let stored = w.get(META, DATABASE_NUM_KEY)?.map(|raw| kv::id_from_bytes(&raw));
                match stored {
                    Some(num) if num != cfg.database_num as i64 => {
                        Err(StoreError::InvalidRequest(format!(
                            "database file is registered as #{num}, configured as #{}",
                            cfg.database_num
                        )))
                    }
                    Some(_) => Ok(()),
                    None => {
                        w.put(
                            META,
                            DATABASE_NUM_KEY.to_vec(),
                            kv::id_bytes(cfg.database_num as i64).to_vec(),
                        );
                        Ok(())
                    }
                }
            })?;
            engine.commit()?;
        }

        Ok(Self {
            systems: FeatureStore::new(
                engine.clone(),
                SYSTEMS,
                SYSTEMS_BY_UID,
                b"seq:system",
                "system",
            ),
            fois: FeatureStore::new(engine.clone(), FOIS, FOIS_BY_UID, b"seq:foi", "foi"),
            datastreams: DataStreamStore::new(engine.clone()),
            obs: ObsStore::new(engine.clone()),
            txn_lock: Mutex::new(()),
            engine,
        })
    }

    pub fn commit(&self) -> Result<(), StoreError> {
        self.engine.commit()
    }

    pub fn rollback(&self) -> Result<(), StoreError> {
        self.engine.rollback()
    }

    /// Runs `f` as one transaction: the pre-call version is committed on
    /// entry and any failure rolls the store back to it. Concurrent
    /// transactions serialize on the facade lock.
    pub fn execute_transaction<R>(
        &self,
        f: impl FnOnce(&Db) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let _guard = self.txn_lock.lock().unwrap();
        self.engine.commit()?;
        match f(self) {
            Ok(r) => Ok(r),
            Err(e) => {
                if let Err(rb) = self.engine.rollback() {
                    tracing::error!("rollback after failed transaction also failed: {rb}");
                }
                Err(e)
            }
        }
    }

    /// Periodic commit with two triggers: elapsed wall time since the last
    /// commit, or the dirty-byte buffer exceeding its threshold.
    pub fn spawn_auto_commit(db: Arc<Db>, period_secs: u64) {
        let period = Duration::from_secs(period_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                if let Err(e) = db.engine.commit_if_due(period) {
                    tracing::error!("auto-commit failed: {e}");
                }
            }
        });
    }

    /// Atomic append: resolves the series, stores the observation and
    /// widens the owning stream's time ranges in one write batch.
    pub fn add_observation(
        &self,
        datastream_id: i64,
        foi_id: i64,
        obs: &ObsData,
    ) -> Result<ObsKey, StoreError> {
        self.engine.update(|w| {
            let key = self.obs.add_in(w, datastream_id, foi_id, obs)?;
            self.datastreams.extend_time_range_in(
                w,
                datastream_id,
                obs.phenomenon_time_ms,
                obs.result_time_ms,
            )?;
            Ok(key)
        })
    }

    // ── cross-store filter resolution ──
    //
    // Nested filters resolve against their own stores into internal-ID
    // sets before the target store scans. An unsatisfiable nested filter
    // yields an empty result, never an error.

    /// Data-stream IDs passing `filter`, with system UIDs and nested FOI
    /// filters resolved.
    fn resolve_datastream_ids(
        &self,
        filter: &DataStreamFilter,
    ) -> Result<BTreeSet<i64>, StoreError> {
        Ok(self
            .select_datastreams(filter)?
            .into_iter()
            .map(|(k, _)| k.id)
            .collect())
    }

    fn resolve_foi_ids(&self, filter: &FoiFilter) -> Result<BTreeSet<i64>, StoreError> {
        Ok(self
            .fois
            .select_entries(filter)?
            .into_iter()
            .map(|(k, _)| k.id)
            .collect())
    }

    pub fn select_systems(
        &self,
        filter: &SystemFilter,
    ) -> Result<Vec<(FeatureKey, FeatureRecord)>, StoreError> {
        let allowed: Option<BTreeSet<i64>> = match &filter.datastreams {
            Some(dsf) => Some(
                self.select_datastreams(dsf)?
                    .into_iter()
                    .map(|(_, rec)| rec.system_id)
                    .collect(),
            ),
            None => None,
        };
        self.systems.select_entries_where(&filter.feature, &|id, rec| {
            filter.parents.as_ref().is_none_or(|p| p.contains(&rec.parent_id))
                && allowed.as_ref().is_none_or(|a| a.contains(&id))
        })
    }

    pub fn count_systems(&self, filter: &SystemFilter) -> Result<u64, StoreError> {
        Ok(self.select_systems(filter)?.len() as u64)
    }

    pub fn remove_systems(&self, filter: &SystemFilter) -> Result<u64, StoreError> {
        let ids: BTreeSet<i64> = self
            .select_systems(filter)?
            .into_iter()
            .map(|(k, _)| k.id)
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }
        self.systems
            .remove_entries_where(&filter.feature, &|id, _| ids.contains(&id))
    }

    pub fn select_fois(
        &self,
        filter: &FoiFilter,
    ) -> Result<Vec<(FeatureKey, FeatureRecord)>, StoreError> {
        self.fois.select_entries(filter)
    }

    pub fn select_datastreams(
        &self,
        filter: &DataStreamFilter,
    ) -> Result<Vec<(DataStreamKey, DataStreamRecord)>, StoreError> {
        // System UIDs resolve through the system store's UID index.
        let uid_systems: Option<BTreeSet<i64>> = match &filter.system_uids {
            Some(uids) => {
                let mut set = BTreeSet::new();
                for uid in uids {
                    if let Some(id) = self.systems.id_of_uid(uid)? {
                        set.insert(id);
                    }
                }
                Some(set)
            }
            None => None,
        };
        let observing: Option<BTreeSet<i64>> = match &filter.fois {
            Some(foi_filter) => {
                let fois = self.resolve_foi_ids(foi_filter)?;
                Some(self.obs.datastreams_of_fois(&fois)?)
            }
            None => None,
        };
        self.datastreams.select_entries_where(filter, &|id, rec| {
            uid_systems.as_ref().is_none_or(|s| s.contains(&rec.system_id))
                && observing.as_ref().is_none_or(|o| o.contains(&id))
        })
    }

    pub fn count_datastreams(&self, filter: &DataStreamFilter) -> Result<u64, StoreError> {
        Ok(self.select_datastreams(filter)?.len() as u64)
    }

    pub fn select_observations(
        &self,
        filter: &ObsFilter,
        order: ObsOrder,
    ) -> Result<Vec<(ObsKey, SeriesRecord, ObsData)>, StoreError> {
        let ds_ids = match &filter.datastreams {
            Some(dsf) => Some(self.resolve_datastream_ids(dsf)?),
            None => None,
        };
        let foi_ids = match &filter.fois {
            Some(f) => Some(self.resolve_foi_ids(f)?),
            None => None,
        };
        self.obs.select(filter, ds_ids.as_ref(), foi_ids.as_ref(), order)
    }

    pub fn count_observations(&self, filter: &ObsFilter) -> Result<u64, StoreError> {
        Ok(self
            .select_observations(filter, ObsOrder::SeriesThenTime)?
            .len() as u64)
    }

    pub fn remove_observations(&self, filter: &ObsFilter) -> Result<u64, StoreError> {
        let ds_ids = match &filter.datastreams {
            Some(dsf) => Some(self.resolve_datastream_ids(dsf)?),
            None => None,
        };
        let foi_ids = match &filter.fois {
            Some(f) => Some(self.resolve_foi_ids(f)?),
            None => None,
        };
        self.obs.remove(filter, ds_ids.as_ref(), foi_ids.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FeatureFilter;
    use crate::models::swe::{DataComponent, Field};
    use tempfile::tempdir;

    fn open_db(dir: &std::path::Path) -> Db {
        let cfg = StorageConfig {
            path: dir.join("hub.db").to_string_lossy().into_owned(),
            ..StorageConfig::default()
        };
        Db::open(&cfg).unwrap()
    }

    fn system(uid: &str) -> FeatureRecord {
        FeatureRecord {
            uid: uid.into(),
            name: "test system".into(),
            description: None,
            feature_type: None,
            geometry: None,
            properties: Default::default(),
            parent_id: 0,
        }
    }

    fn schema() -> DataComponent {
        DataComponent::Record {
            label: None,
            fields: vec![Field {
                name: "value".into(),
                component: DataComponent::Quantity { label: None, unit: "1".into() },
            }],
        }
    }

    fn obs(t: i64, v: f64) -> ObsData {
        ObsData {
            phenomenon_time_ms: t,
            result_time_ms: t,
            result: serde_json::json!({ "value": v }),
            parameters: None,
        }
    }

    #[test]
    fn test_register_system_and_scan_its_observations() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());

        let sys = db.systems.add(&system("urn:x:sys:0042"), Some(1000)).unwrap();
        let (ds, _) = db.datastreams.register(sys.id, "out", &schema(), "json").unwrap();
        db.add_observation(ds, 0, &obs(5000, 3.14)).unwrap();

        let filter = ObsFilter::new()
            .with_datastreams(DataStreamFilter::new().with_systems([sys.id]))
            .with_limit(10);
        let rows = db.select_observations(&filter, ObsOrder::SeriesThenTime).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].2.result["value"], 3.14);

        // The append widened the stream's observed range.
        let (_, rec) = db.datastreams.get_latest(ds).unwrap().unwrap();
        assert_eq!(rec.observed_time_range, Some((5000, 5000)));
    }

    #[test]
    fn test_time_range_scan_ascending() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        let sys = db.systems.add(&system("urn:x:sys:0001"), Some(1000)).unwrap();
        let (ds, _) = db.datastreams.register(sys.id, "out", &schema(), "json").unwrap();
        db.add_observation(ds, 0, &obs(2000, 2.0)).unwrap();
        db.add_observation(ds, 0, &obs(1000, 1.0)).unwrap();

        let filter = ObsFilter::new().with_phenomenon_time(TemporalFilter::range(1000, 2000));
        let rows = db.select_observations(&filter, ObsOrder::TimeAscending).unwrap();
        let times: Vec<i64> = rows.iter().map(|(k, _, _)| k.phenomenon_time_ms).collect();
        assert_eq!(times, vec![1000, 2000]);
    }

    #[test]
    fn test_nested_system_filter_by_datastream_output() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        let a = db.systems.add(&system("urn:x:sys:000a"), Some(1000)).unwrap();
        let b = db.systems.add(&system("urn:x:sys:000b"), Some(1000)).unwrap();
        db.datastreams.register(a.id, "temp", &schema(), "json").unwrap();
        db.datastreams.register(b.id, "wind", &schema(), "json").unwrap();

        let filter = SystemFilter::new()
            .with_datastreams(DataStreamFilter::new().with_output_names(["temp"]));
        let rows = db.select_systems(&filter).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1.uid, "urn:x:sys:000a");
    }

    #[test]
    fn test_nested_foi_filter_on_datastreams() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        let sys = db.systems.add(&system("urn:x:sys:0001"), Some(1000)).unwrap();
        let foi = db.fois.add(&system("urn:x:foi:0001"), Some(1000)).unwrap();
        let (with_foi, _) = db.datastreams.register(sys.id, "a", &schema(), "json").unwrap();
        let (without, _) = db.datastreams.register(sys.id, "b", &schema(), "json").unwrap();
        db.add_observation(with_foi, foi.id, &obs(1000, 1.0)).unwrap();
        db.add_observation(without, 0, &obs(1000, 1.0)).unwrap();

        let filter = DataStreamFilter::new()
            .with_fois(FeatureFilter::new().with_unique_ids(["urn:x:foi:0001"]));
        let rows = db.select_datastreams(&filter).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0.id, with_foi);
    }

    #[test]
    fn test_old_stream_observations_survive_incompatible_update() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        let sys = db.systems.add(&system("urn:x:sys:0001"), Some(1000)).unwrap();
        let (old_ds, _) = db.datastreams.register(sys.id, "out", &schema(), "json").unwrap();
        db.add_observation(old_ds, 0, &obs(1000, 1.0)).unwrap();

        let incompatible = DataComponent::Record {
            label: None,
            fields: vec![Field {
                name: "status".into(),
                component: DataComponent::Text { label: None },
            }],
        };
        let (new_ds, outcome) = db
            .datastreams
            .register(sys.id, "out", &incompatible, "json")
            .unwrap();
        assert_eq!(outcome, RegisterOutcome::NewVersion);
        assert_ne!(new_ds, old_ds);
        db.add_observation(new_ds, 0, &obs(2000, 2.0)).unwrap();

        // Each stream's observations stay addressable under its own ID.
        let old_rows = db
            .select_observations(
                &ObsFilter::new().with_datastream_ids([old_ds]),
                ObsOrder::SeriesThenTime,
            )
            .unwrap();
        assert_eq!(old_rows.len(), 1);
        assert_eq!(old_rows[0].2.phenomenon_time_ms, 1000);

        let new_rows = db
            .select_observations(
                &ObsFilter::new().with_datastream_ids([new_ds]),
                ObsOrder::SeriesThenTime,
            )
            .unwrap();
        assert_eq!(new_rows.len(), 1);
        assert_eq!(new_rows[0].2.phenomenon_time_ms, 2000);
    }

    #[test]
    fn test_unsatisfiable_nested_filter_yields_empty_not_error() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        db.systems.add(&system("urn:x:sys:0001"), Some(1000)).unwrap();

        let filter = SystemFilter::new()
            .with_datastreams(DataStreamFilter::new().with_output_names(["does-not-exist"]));
        assert_eq!(db.select_systems(&filter).unwrap().len(), 0);
        assert_eq!(db.count_systems(&filter).unwrap(), 0);
    }

    #[test]
    fn test_execute_transaction_rolls_back_on_failure() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        db.systems.add(&system("urn:x:sys:0001"), Some(1000)).unwrap();

        let result: Result<(), StoreError> = db.execute_transaction(|db| {
            db.systems.add(&system("urn:x:sys:0002"), Some(1000))?;
            Err(StoreError::InvalidRequest("boom".into()))
        });
        assert!(result.is_err());
        assert!(db.systems.id_of_uid("urn:x:sys:0001").unwrap().is_some());
        assert!(db.systems.id_of_uid("urn:x:sys:0002").unwrap().is_none());
    }

    #[test]
    fn test_read_your_writes_before_commit() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        db.systems.add(&system("urn:x:sys:0001"), Some(1000)).unwrap();
        // No commit yet; the write must still be visible.
        assert_eq!(db.count_systems(&SystemFilter::new()).unwrap(), 1);
    }

    #[test]
    fn test_database_num_mismatch_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hub.db").to_string_lossy().into_owned();
        let cfg = StorageConfig { path: path.clone(), database_num: 1, ..StorageConfig::default() };
        drop(Db::open(&cfg).unwrap());

        let other = StorageConfig { path, database_num: 2, ..StorageConfig::default() };
        assert!(matches!(Db::open(&other), Err(StoreError::InvalidRequest(_))));
    }
}
