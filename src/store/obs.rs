use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::StoreError;
use crate::filter::{ObsFilter, TemporalFilter};
use crate::ids::IdAllocator;
use crate::kv::{self, KvEngine, MapRead, OBS, OBS_BY_DS, SERIES, SERIES_BY_DS, Writer};
use crate::models::obs::{ObsData, ObsKey, SeriesRecord};

use super::now_ms;

const ALLOCATOR: IdAllocator = IdAllocator::new(b"seq:series");

/// Ordering of scan results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObsOrder {
    /// Natural index order: series ID ascending, phenomenon time ascending.
    SeriesThenTime,
    /// Phenomenon time ascending across all matched series.
    TimeAscending,
}

/// Observation store over three maps: the series table, the
/// `(seriesID, phenomenonTime)` primary index and a `(dataStreamID,
/// phenomenonTime)` secondary index for stream-wide scans.
pub struct ObsStore {
    engine: Arc<KvEngine>,
}

fn obs_key_bytes(series_id: i64, phenomenon_time_ms: i64) -> Vec<u8> {
    kv::key2(&kv::id_bytes(series_id), &kv::ts_bytes(phenomenon_time_ms))
}

fn series_key_bytes(s: &SeriesRecord) -> Vec<u8> {
    kv::key3(
        &kv::id_bytes(s.datastream_id),
        &kv::ts_bytes(s.result_time_ms),
        &kv::id_bytes(s.foi_id),
    )
}

impl ObsStore {
    pub(crate) fn new(engine: Arc<KvEngine>) -> Self {
        Self { engine }
    }

    /// Appends one observation inside an open write batch, resolving or
    /// lazily creating its series. The caller extends the owning stream's
    /// time ranges in the same batch.
    pub(crate) fn add_in(
        &self,
        w: &mut Writer<'_>,
        datastream_id: i64,
        foi_id: i64,
        obs: &ObsData,
    ) -> Result<ObsKey, StoreError> {
        let series = SeriesRecord {
            datastream_id,
            foi_id,
            result_time_ms: obs.result_time_ms,
        };
        let sk = series_key_bytes(&series);
        let series_id = match w.get(SERIES_BY_DS, &sk)? {
            Some(raw) => kv::id_from_bytes(&raw),
            None => {
                let id = ALLOCATOR.next(w)?;
                w.put_value(SERIES, kv::id_bytes(id).to_vec(), &series)?;
                w.put(SERIES_BY_DS, sk, kv::id_bytes(id).to_vec());
                id
            }
        };
        let key = ObsKey {
            series_id,
            phenomenon_time_ms: obs.phenomenon_time_ms,
        };
        w.put_value(OBS, obs_key_bytes(series_id, obs.phenomenon_time_ms), obs)?;
        w.put(
            OBS_BY_DS,
            kv::key3(
                &kv::id_bytes(datastream_id),
                &kv::ts_bytes(obs.phenomenon_time_ms),
                &kv::id_bytes(series_id),
            ),
            Vec::new(),
        );
        Ok(key)
    }

    /// Standalone append; the facade's `add_observation` composes this with
    /// the stream time-range extension in one batch.
    pub fn add(
        &self,
        datastream_id: i64,
        foi_id: i64,
        obs: &ObsData,
    ) -> Result<ObsKey, StoreError> {
        self.engine.update(|w| self.add_in(w, datastream_id, foi_id, obs))
    }

    pub fn get(&self, key: ObsKey) -> Result<Option<ObsData>, StoreError> {
        self.engine.view(|r| {
            r.get(OBS, &obs_key_bytes(key.series_id, key.phenomenon_time_ms))?
                .map(|raw| kv::decode_value(&raw))
                .transpose()
        })
    }

    pub fn series(&self, series_id: i64) -> Result<Option<SeriesRecord>, StoreError> {
        self.engine.view(|r| {
            r.get(SERIES, &kv::id_bytes(series_id))?
                .map(|raw| kv::decode_value(&raw))
                .transpose()
        })
    }

    /// Overwrites the observation at `key`; last write wins within a
    /// series. The series must already exist.
    pub fn put(&self, key: ObsKey, obs: &ObsData) -> Result<(), StoreError> {
        if obs.phenomenon_time_ms != key.phenomenon_time_ms {
            return Err(StoreError::InvalidRequest(
                "phenomenon time of a stored observation cannot change".into(),
            ));
        }
        self.engine.update(|w| {
            let raw = w
                .get(SERIES, &kv::id_bytes(key.series_id))?
                .ok_or(StoreError::NotFound)?;
            let series: SeriesRecord = kv::decode_value(&raw)?;
            w.put_value(OBS, obs_key_bytes(key.series_id, key.phenomenon_time_ms), obs)?;
            w.put(
                OBS_BY_DS,
                kv::key3(
                    &kv::id_bytes(series.datastream_id),
                    &kv::ts_bytes(key.phenomenon_time_ms),
                    &kv::id_bytes(key.series_id),
                ),
                Vec::new(),
            );
            Ok(())
        })
    }

    /// Data streams owning at least one series about one of the given FOIs.
    pub fn datastreams_of_fois(
        &self,
        foi_ids: &BTreeSet<i64>,
    ) -> Result<BTreeSet<i64>, StoreError> {
        self.engine.view(|r| {
            let mut out = BTreeSet::new();
            for (_, v) in r.scan(SERIES, &[], None)? {
                let series: SeriesRecord = kv::decode_value(&v)?;
                if foi_ids.contains(&series.foi_id) {
                    out.insert(series.datastream_id);
                }
            }
            Ok(out)
        })
    }

    /// Series matching the resolved data-stream / FOI constraints and the
    /// filter's series-level fields, ascending by series ID.
    fn matching_series(
        &self,
        r: &dyn MapRead,
        filter: &ObsFilter,
        ds_ids: Option<&BTreeSet<i64>>,
        foi_ids: Option<&BTreeSet<i64>>,
        now: i64,
    ) -> Result<Vec<(i64, SeriesRecord)>, StoreError> {
        let mut out = Vec::new();
        let mut consider = |series_id: i64, series: SeriesRecord| {
            let ds_ok = ds_ids.is_none_or(|s| s.contains(&series.datastream_id))
                && filter
                    .datastream_ids
                    .as_ref()
                    .is_none_or(|s| s.contains(&series.datastream_id));
            let foi_ok = foi_ids.is_none_or(|s| s.contains(&series.foi_id))
                && filter
                    .foi_ids
                    .as_ref()
                    .is_none_or(|s| s.contains(&series.foi_id));
            if ds_ok && foi_ok && filter.result_time.test(series.result_time_ms, now) {
                out.push((series_id, series));
            }
        };

        // Prefer walking the per-stream index when streams are constrained.
        let constrained: Option<BTreeSet<i64>> = match (ds_ids, &filter.datastream_ids) {
            (Some(a), Some(b)) => Some(a.intersection(b).copied().collect()),
            (Some(a), None) => Some(a.clone()),
            (None, Some(b)) => Some(b.clone()),
            (None, None) => None,
        };

        match constrained {
            Some(ds) => {
                for ds_id in ds {
                    let prefix = kv::id_bytes(ds_id);
                    for (_, v) in
                        r.scan(SERIES_BY_DS, &prefix, kv::prefix_end(&prefix).as_deref())?
                    {
                        let series_id = kv::id_from_bytes(&v);
                        if let Some(raw) = r.get(SERIES, &kv::id_bytes(series_id))? {
                            consider(series_id, kv::decode_value(&raw)?);
                        }
                    }
                }
            }
            None => {
                for (k, v) in r.scan(SERIES, &[], None)? {
                    consider(kv::id_from_bytes(&k), kv::decode_value(&v)?);
                }
            }
        }

        out.sort_by_key(|(id, _)| *id);
        Ok(out)
    }

    /// Scans observations matching the filter. The filter is translated
    /// into a set of series prefixes which are range-scanned over
    /// phenomenon time; the value predicate is applied lazily on decoded
    /// candidates.
    pub fn select(
        &self,
        filter: &ObsFilter,
        ds_ids: Option<&BTreeSet<i64>>,
        foi_ids: Option<&BTreeSet<i64>>,
        order: ObsOrder,
    ) -> Result<Vec<(ObsKey, SeriesRecord, ObsData)>, StoreError> {
        self.engine
            .view(|r| self.select_in(r, filter, ds_ids, foi_ids, order))
    }

    fn select_in(
        &self,
        r: &dyn MapRead,
        filter: &ObsFilter,
        ds_ids: Option<&BTreeSet<i64>>,
        foi_ids: Option<&BTreeSet<i64>>,
        order: ObsOrder,
    ) -> Result<Vec<(ObsKey, SeriesRecord, ObsData)>, StoreError> {
        let now = now_ms();
        let mut out = Vec::new();

        for (series_id, series) in self.matching_series(r, filter, ds_ids, foi_ids, now)? {
            let prefix = kv::id_bytes(series_id);
            let rows = match &filter.phenomenon_time {
                TemporalFilter::LatestVersion => {
                    // Latest observation of each series.
                    let all = r.scan(OBS, &prefix, kv::prefix_end(&prefix).as_deref())?;
                    all.into_iter().next_back().into_iter().collect()
                }
                t => {
                    let (lo, hi) = match t.resolved_range(now) {
                        Some((b, e)) => (
                            obs_key_bytes(series_id, b),
                            if e == i64::MAX {
                                kv::prefix_end(&prefix)
                            } else {
                                Some(obs_key_bytes(series_id, e + 1))
                            },
                        ),
                        None => (prefix.to_vec(), kv::prefix_end(&prefix)),
                    };
                    r.scan(OBS, &lo, hi.as_deref())?
                }
            };

            for (k, v) in rows {
                let key = ObsKey {
                    series_id,
                    phenomenon_time_ms: kv::ts_from_bytes(&k[8..]),
                };
                let obs: ObsData = kv::decode_value(&v)?;
                let mut obs_filter_ok = filter.test(&series, &obs, now);
                if filter.phenomenon_time.is_latest() {
                    // The latest entry is selected positionally; the
                    // pointwise sentinel test does not apply to it.
                    obs_filter_ok = filter
                        .value_predicate
                        .as_ref()
                        .is_none_or(|(f, p)| obs.result.get(f).is_some_and(|v| p.matches(v)))
                        && filter.result_time.test(series.result_time_ms, now);
                }
                if obs_filter_ok {
                    out.push((key, series.clone(), obs));
                }
            }
        }

        if order == ObsOrder::TimeAscending {
            out.sort_by_key(|(k, _, _)| (k.phenomenon_time_ms, k.series_id));
        }
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    pub fn count(
        &self,
        filter: &ObsFilter,
        ds_ids: Option<&BTreeSet<i64>>,
        foi_ids: Option<&BTreeSet<i64>>,
    ) -> Result<u64, StoreError> {
        Ok(self
            .select(filter, ds_ids, foi_ids, ObsOrder::SeriesThenTime)?
            .len() as u64)
    }

    /// Deletes one observation by key; returns `false` when absent.
    /// A series left empty is cleaned up with its index entry.
    pub fn delete(&self, key: ObsKey) -> Result<bool, StoreError> {
        self.engine.update(|w| {
            let kb = obs_key_bytes(key.series_id, key.phenomenon_time_ms);
            if w.get(OBS, &kb)?.is_none() {
                return Ok(false);
            }
            let raw = w
                .get(SERIES, &kv::id_bytes(key.series_id))?
                .ok_or(StoreError::NotFound)?;
            let series: SeriesRecord = kv::decode_value(&raw)?;
            w.delete(OBS, kb);
            w.delete(
                OBS_BY_DS,
                kv::key3(
                    &kv::id_bytes(series.datastream_id),
                    &kv::ts_bytes(key.phenomenon_time_ms),
                    &kv::id_bytes(key.series_id),
                ),
            );
            let prefix = kv::id_bytes(key.series_id);
            if w.scan(OBS, &prefix, kv::prefix_end(&prefix).as_deref())?.len() == 1 {
                w.delete(SERIES, kv::id_bytes(key.series_id).to_vec());
                w.delete(SERIES_BY_DS, series_key_bytes(&series));
            }
            Ok(true)
        })
    }

    /// Removes matching observations; empty series are cleaned up with
    /// their index entries. Returns the removed observation count.
    pub fn remove(
        &self,
        filter: &ObsFilter,
        ds_ids: Option<&BTreeSet<i64>>,
        foi_ids: Option<&BTreeSet<i64>>,
    ) -> Result<u64, StoreError> {
        self.engine.update(|w| {
            let matches = self.select_in(w, filter, ds_ids, foi_ids, ObsOrder::SeriesThenTime)?;
            let mut removed_per_series: std::collections::BTreeMap<i64, (usize, SeriesRecord)> =
                Default::default();
            for (key, series, _) in &matches {
                w.delete(OBS, obs_key_bytes(key.series_id, key.phenomenon_time_ms));
                w.delete(
                    OBS_BY_DS,
                    kv::key3(
                        &kv::id_bytes(series.datastream_id),
                        &kv::ts_bytes(key.phenomenon_time_ms),
                        &kv::id_bytes(key.series_id),
                    ),
                );
                let e = removed_per_series
                    .entry(key.series_id)
                    .or_insert((0, series.clone()));
                e.0 += 1;
            }
            for (series_id, (removed, series)) in removed_per_series {
                let prefix = kv::id_bytes(series_id);
                let remaining = w
                    .scan(OBS, &prefix, kv::prefix_end(&prefix).as_deref())?
                    .len();
                if remaining == removed {
                    w.delete(SERIES, kv::id_bytes(series_id).to_vec());
                    w.delete(SERIES_BY_DS, series_key_bytes(&series));
                }
            }
            Ok(matches.len() as u64)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use tempfile::tempdir;

    fn store(dir: &std::path::Path) -> ObsStore {
        let cfg = StorageConfig {
            path: dir.join("obs.db").to_string_lossy().into_owned(),
            ..StorageConfig::default()
        };
        ObsStore::new(Arc::new(KvEngine::open(&cfg).unwrap()))
    }

    fn obs(phenomenon_time_ms: i64, value: f64) -> ObsData {
        ObsData {
            phenomenon_time_ms,
            result_time_ms: phenomenon_time_ms,
            result: serde_json::json!({ "value": value }),
            parameters: None,
        }
    }

    #[test]
    fn test_series_created_lazily_and_reused() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        let mut o1 = obs(1000, 1.0);
        let mut o2 = obs(2000, 2.0);
        o1.result_time_ms = 5000;
        o2.result_time_ms = 5000;
        let k1 = s.add(1, 0, &o1).unwrap();
        let k2 = s.add(1, 0, &o2).unwrap();
        assert_eq!(k1.series_id, k2.series_id);

        // Different FOI, different series.
        let k3 = s.add(1, 7, &o1).unwrap();
        assert_ne!(k3.series_id, k1.series_id);

        let series = s.series(k1.series_id).unwrap().unwrap();
        assert_eq!(series.datastream_id, 1);
        assert_eq!(series.result_time_ms, 5000);
    }

    #[test]
    fn test_scan_range_returns_ascending_order() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        // Out-of-order appends are accepted and re-sorted on scan.
        s.add(1, 0, &obs(2000, 2.0)).unwrap();
        s.add(1, 0, &obs(1000, 1.0)).unwrap();
        s.add(1, 0, &obs(3000, 3.0)).unwrap();

        let f = ObsFilter::new().with_phenomenon_time(TemporalFilter::range(1000, 2000));
        let rows = s.select(&f, None, None, ObsOrder::SeriesThenTime).unwrap();
        let times: Vec<i64> = rows.iter().map(|(k, _, _)| k.phenomenon_time_ms).collect();
        assert_eq!(times, vec![1000, 2000]);
    }

    #[test]
    fn test_last_write_wins_within_series() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        let key = s.add(1, 0, &obs(1000, 1.0)).unwrap();
        s.put(key, &obs(1000, 9.5)).unwrap();

        let rows = s.select(&ObsFilter::new(), None, None, ObsOrder::SeriesThenTime).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].2.result["value"], 9.5);
    }

    #[test]
    fn test_foi_scan_via_series_resolution() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        s.add(1, 7, &obs(1000, 1.0)).unwrap();
        s.add(1, 8, &obs(1100, 2.0)).unwrap();
        s.add(2, 7, &obs(1200, 3.0)).unwrap();

        let foi7: BTreeSet<i64> = [7].into();
        let rows = s
            .select(&ObsFilter::new(), None, Some(&foi7), ObsOrder::SeriesThenTime)
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|(_, series, _)| series.foi_id == 7));
    }

    #[test]
    fn test_time_global_merge_order() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        s.add(1, 0, &obs(1000, 1.0)).unwrap();
        s.add(1, 0, &obs(3000, 3.0)).unwrap();
        s.add(2, 0, &obs(2000, 2.0)).unwrap();

        let rows = s
            .select(&ObsFilter::new(), None, None, ObsOrder::TimeAscending)
            .unwrap();
        let times: Vec<i64> = rows.iter().map(|(k, _, _)| k.phenomenon_time_ms).collect();
        assert_eq!(times, vec![1000, 2000, 3000]);
    }

    #[test]
    fn test_select_count_agree_with_value_predicate() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        for i in 0..6 {
            s.add(1, 0, &obs(1000 + i, if i % 2 == 0 { 1.0 } else { 2.0 })).unwrap();
        }
        let f = ObsFilter::new()
            .with_value_predicate("value", crate::filter::PropPredicate::number(1.0));
        let rows = s.select(&f, None, None, ObsOrder::SeriesThenTime).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(s.count(&f, None, None).unwrap(), 3);
    }

    #[test]
    fn test_latest_observation_per_series() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        s.add(1, 0, &obs(1000, 1.0)).unwrap();
        s.add(1, 0, &obs(2000, 2.0)).unwrap();
        s.add(2, 0, &obs(1500, 5.0)).unwrap();

        let f = ObsFilter::new().with_phenomenon_time(TemporalFilter::LatestVersion);
        let rows = s.select(&f, None, None, ObsOrder::SeriesThenTime).unwrap();
        let times: Vec<i64> = rows.iter().map(|(k, _, _)| k.phenomenon_time_ms).collect();
        assert_eq!(times, vec![2000, 1500]);
    }

    #[test]
    fn test_remove_cleans_up_empty_series() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        let key = s.add(1, 0, &obs(1000, 1.0)).unwrap();
        s.add(1, 0, &obs(2000, 2.0)).unwrap();

        let f = ObsFilter::new().with_phenomenon_time(TemporalFilter::single(1000));
        assert_eq!(s.remove(&f, None, None).unwrap(), 1);
        assert!(s.series(key.series_id).unwrap().is_some());

        assert_eq!(s.remove(&ObsFilter::new(), None, None).unwrap(), 1);
        assert!(s.series(key.series_id).unwrap().is_none());
    }
}
