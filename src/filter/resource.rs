use std::collections::BTreeSet;

use super::{EmptyIntersection, PropPredicate, SpatialFilter, TemporalFilter, intersect_sets};
use crate::models::datastream::DataStreamRecord;
use crate::models::feature::FeatureRecord;
use crate::models::obs::{ObsData, SeriesRecord};

fn in_set<T: Ord>(set: &Option<BTreeSet<T>>, value: &T) -> bool {
    set.as_ref().is_none_or(|s| s.contains(value))
}

fn merge_props(
    a: &[(String, PropPredicate)],
    b: &[(String, PropPredicate)],
) -> Vec<(String, PropPredicate)> {
    let mut out = a.to_vec();
    for p in b {
        if !out.contains(p) {
            out.push(p.clone());
        }
    }
    out
}

fn intersect_nested<T>(
    a: &Option<Box<T>>,
    b: &Option<Box<T>>,
    f: impl FnOnce(&T, &T) -> Result<T, EmptyIntersection>,
) -> Result<Option<Box<T>>, EmptyIntersection>
where
    T: Clone,
{
    match (a, b) {
        (None, None) => Ok(None),
        (Some(x), None) | (None, Some(x)) => Ok(Some(x.clone())),
        (Some(x), Some(y)) => Ok(Some(Box::new(f(x, y)?))),
    }
}

fn min_limit(a: Option<usize>, b: Option<usize>) -> Option<usize> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (x, None) | (None, x) => x,
    }
}

// ── features ──

/// Filter over versioned features (systems, FOIs). The valid-time part
/// applies to version keys; everything else applies to the stored value.
#[derive(Debug, Clone, Default)]
pub struct FeatureFilter {
    pub internal_ids: Option<BTreeSet<i64>>,
    pub unique_ids: Option<BTreeSet<String>>,
    pub valid_time: TemporalFilter,
    pub spatial: Option<SpatialFilter>,
    pub feature_type: Option<String>,
    pub props: Vec<(String, PropPredicate)>,
    pub limit: Option<usize>,
}

/// Features of interest share the feature filter shape.
pub type FoiFilter = FeatureFilter;

impl FeatureFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_internal_ids(mut self, ids: impl IntoIterator<Item = i64>) -> Self {
        self.internal_ids = Some(ids.into_iter().collect());
        self
    }

    pub fn with_unique_ids<S: Into<String>>(mut self, uids: impl IntoIterator<Item = S>) -> Self {
        self.unique_ids = Some(uids.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_valid_time(mut self, t: TemporalFilter) -> Self {
        self.valid_time = t;
        self
    }

    pub fn with_spatial(mut self, s: SpatialFilter) -> Self {
        self.spatial = Some(s);
        self
    }

    pub fn with_feature_type(mut self, t: impl Into<String>) -> Self {
        self.feature_type = Some(t.into());
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, p: PropPredicate) -> Self {
        self.props.push((name.into(), p));
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Value-level predicate; valid time is tested against version keys by
    /// the store.
    pub fn test(&self, id: i64, f: &FeatureRecord) -> bool {
        in_set(&self.internal_ids, &id)
            && in_set(&self.unique_ids, &f.uid)
            && self
                .feature_type
                .as_ref()
                .is_none_or(|t| f.feature_type.as_deref() == Some(t.as_str()))
            && self
                .spatial
                .as_ref()
                .is_none_or(|s| f.geometry.as_ref().is_some_and(|g| s.test(g)))
            && self.props.iter().all(|(name, p)| {
                f.properties.get(name).is_some_and(|v| p.matches(v))
            })
    }

    pub fn intersect(&self, other: &Self, now_ms: i64) -> Result<Self, EmptyIntersection> {
        let feature_type = match (&self.feature_type, &other.feature_type) {
            (Some(a), Some(b)) if a != b => return Err(EmptyIntersection),
            (a, b) => a.clone().or_else(|| b.clone()),
        };
        let spatial = match (&self.spatial, &other.spatial) {
            (None, None) => None,
            (Some(s), None) | (None, Some(s)) => Some(s.clone()),
            (Some(a), Some(b)) => Some(a.intersect(b)?),
        };
        Ok(Self {
            internal_ids: intersect_sets(&self.internal_ids, &other.internal_ids)?,
            unique_ids: intersect_sets(&self.unique_ids, &other.unique_ids)?,
            valid_time: self.valid_time.intersect(&other.valid_time, now_ms)?,
            spatial,
            feature_type,
            props: merge_props(&self.props, &other.props),
            limit: min_limit(self.limit, other.limit),
        })
    }
}

// ── systems ──

#[derive(Debug, Clone, Default)]
pub struct SystemFilter {
    pub feature: FeatureFilter,
    /// Accepted parent internal IDs; 0 selects root systems.
    pub parents: Option<BTreeSet<i64>>,
    /// Matched systems must have at least one data stream passing this.
    pub datastreams: Option<Box<DataStreamFilter>>,
}

impl SystemFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_internal_ids(mut self, ids: impl IntoIterator<Item = i64>) -> Self {
        self.feature = self.feature.with_internal_ids(ids);
        self
    }

    pub fn with_unique_ids<S: Into<String>>(mut self, uids: impl IntoIterator<Item = S>) -> Self {
        self.feature = self.feature.with_unique_ids(uids);
        self
    }

    pub fn with_valid_time(mut self, t: TemporalFilter) -> Self {
        self.feature = self.feature.with_valid_time(t);
        self
    }

    pub fn with_parents(mut self, ids: impl IntoIterator<Item = i64>) -> Self {
        self.parents = Some(ids.into_iter().collect());
        self
    }

    pub fn with_datastreams(mut self, f: DataStreamFilter) -> Self {
        self.datastreams = Some(Box::new(f));
        self
    }

    /// Systems observing at least one FOI passing `f`; shorthand for a
    /// nested data-stream filter carrying the FOI filter.
    pub fn with_fois(self, f: FoiFilter) -> Self {
        self.with_datastreams(DataStreamFilter::new().with_fois(f))
    }

    pub fn test(&self, id: i64, rec: &FeatureRecord) -> bool {
        self.feature.test(id, rec) && in_set(&self.parents, &rec.parent_id)
    }

    pub fn intersect(&self, other: &Self, now_ms: i64) -> Result<Self, EmptyIntersection> {
        Ok(Self {
            feature: self.feature.intersect(&other.feature, now_ms)?,
            parents: intersect_sets(&self.parents, &other.parents)?,
            datastreams: intersect_nested(&self.datastreams, &other.datastreams, |a, b| {
                a.intersect(b, now_ms)
            })?,
        })
    }
}

// ── data streams ──

#[derive(Debug, Clone, Default)]
pub struct DataStreamFilter {
    pub internal_ids: Option<BTreeSet<i64>>,
    pub system_ids: Option<BTreeSet<i64>>,
    pub system_uids: Option<BTreeSet<String>>,
    pub output_names: Option<BTreeSet<String>>,
    pub valid_time: TemporalFilter,
    /// Matched streams must have at least one series about an FOI passing
    /// this.
    pub fois: Option<Box<FoiFilter>>,
    pub limit: Option<usize>,
}

impl DataStreamFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_internal_ids(mut self, ids: impl IntoIterator<Item = i64>) -> Self {
        self.internal_ids = Some(ids.into_iter().collect());
        self
    }

    pub fn with_systems(mut self, ids: impl IntoIterator<Item = i64>) -> Self {
        self.system_ids = Some(ids.into_iter().collect());
        self
    }

    pub fn with_system_uids<S: Into<String>>(mut self, uids: impl IntoIterator<Item = S>) -> Self {
        self.system_uids = Some(uids.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_output_names<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.output_names = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_valid_time(mut self, t: TemporalFilter) -> Self {
        self.valid_time = t;
        self
    }

    pub fn with_fois(mut self, f: FoiFilter) -> Self {
        self.fois = Some(Box::new(f));
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Value-level predicate; system UIDs and nested FOI filters are
    /// resolved against the other stores by the database facade.
    pub fn test(&self, id: i64, rec: &DataStreamRecord) -> bool {
        in_set(&self.internal_ids, &id)
            && in_set(&self.system_ids, &rec.system_id)
            && in_set(&self.output_names, &rec.output_name)
    }

    pub fn intersect(&self, other: &Self, now_ms: i64) -> Result<Self, EmptyIntersection> {
        Ok(Self {
            internal_ids: intersect_sets(&self.internal_ids, &other.internal_ids)?,
            system_ids: intersect_sets(&self.system_ids, &other.system_ids)?,
            system_uids: intersect_sets(&self.system_uids, &other.system_uids)?,
            output_names: intersect_sets(&self.output_names, &other.output_names)?,
            valid_time: self.valid_time.intersect(&other.valid_time, now_ms)?,
            fois: intersect_nested(&self.fois, &other.fois, |a, b| a.intersect(b, now_ms))?,
            limit: min_limit(self.limit, other.limit),
        })
    }
}

// ── observations ──

#[derive(Debug, Clone, Default)]
pub struct ObsFilter {
    pub datastream_ids: Option<BTreeSet<i64>>,
    pub foi_ids: Option<BTreeSet<i64>>,
    pub datastreams: Option<Box<DataStreamFilter>>,
    pub fois: Option<Box<FoiFilter>>,
    pub phenomenon_time: TemporalFilter,
    pub result_time: TemporalFilter,
    /// Lazily applied predicate on a field of the result block.
    pub value_predicate: Option<(String, PropPredicate)>,
    pub limit: Option<usize>,
}

impl ObsFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_datastream_ids(mut self, ids: impl IntoIterator<Item = i64>) -> Self {
        self.datastream_ids = Some(ids.into_iter().collect());
        self
    }

    pub fn with_foi_ids(mut self, ids: impl IntoIterator<Item = i64>) -> Self {
        self.foi_ids = Some(ids.into_iter().collect());
        self
    }

    pub fn with_datastreams(mut self, f: DataStreamFilter) -> Self {
        self.datastreams = Some(Box::new(f));
        self
    }

    pub fn with_fois(mut self, f: FoiFilter) -> Self {
        self.fois = Some(Box::new(f));
        self
    }

    pub fn with_phenomenon_time(mut self, t: TemporalFilter) -> Self {
        self.phenomenon_time = t;
        self
    }

    pub fn with_result_time(mut self, t: TemporalFilter) -> Self {
        self.result_time = t;
        self
    }

    pub fn with_value_predicate(mut self, field: impl Into<String>, p: PropPredicate) -> Self {
        self.value_predicate = Some((field.into(), p));
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn test(&self, series: &SeriesRecord, obs: &ObsData, now_ms: i64) -> bool {
        in_set(&self.datastream_ids, &series.datastream_id)
            && in_set(&self.foi_ids, &series.foi_id)
            && self.phenomenon_time.test(obs.phenomenon_time_ms, now_ms)
            && self.result_time.test(series.result_time_ms, now_ms)
            && self.value_predicate.as_ref().is_none_or(|(field, p)| {
                obs.result.get(field).is_some_and(|v| p.matches(v))
            })
    }

    pub fn intersect(&self, other: &Self, now_ms: i64) -> Result<Self, EmptyIntersection> {
        let value_predicate = match (&self.value_predicate, &other.value_predicate) {
            (Some(a), Some(b)) if a != b => {
                // Two different predicates on the same result cannot be
                // expressed as one; keep provable-empty detection out of it.
                return Err(EmptyIntersection);
            }
            (a, b) => a.clone().or_else(|| b.clone()),
        };
        Ok(Self {
            datastream_ids: intersect_sets(&self.datastream_ids, &other.datastream_ids)?,
            foi_ids: intersect_sets(&self.foi_ids, &other.foi_ids)?,
            datastreams: intersect_nested(&self.datastreams, &other.datastreams, |a, b| {
                a.intersect(b, now_ms)
            })?,
            fois: intersect_nested(&self.fois, &other.fois, |a, b| a.intersect(b, now_ms))?,
            phenomenon_time: self.phenomenon_time.intersect(&other.phenomenon_time, now_ms)?,
            result_time: self.result_time.intersect(&other.result_time, now_ms)?,
            value_predicate,
            limit: min_limit(self.limit, other.limit),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    fn feature(uid: &str) -> FeatureRecord {
        FeatureRecord {
            uid: uid.to_string(),
            name: "test feature".into(),
            description: None,
            feature_type: None,
            geometry: None,
            properties: Default::default(),
            parent_id: 0,
        }
    }

    #[test]
    fn test_uid_set_intersection_narrows_to_common() {
        let a = SystemFilter::new().with_unique_ids(["urn:x:sys:a", "urn:x:sys:b"]);
        let b = SystemFilter::new().with_unique_ids(["urn:x:sys:b", "urn:x:sys:c"]);
        let c = a.intersect(&b, NOW).unwrap();
        assert!(c.test(1, &feature("urn:x:sys:b")));
        assert!(!c.test(1, &feature("urn:x:sys:a")));
        assert!(!c.test(1, &feature("urn:x:sys:c")));

        let z = SystemFilter::new().with_unique_ids(["urn:x:sys:z"]);
        assert!(c.intersect(&z, NOW).is_err());
    }

    #[test]
    fn test_intersect_equals_conjunction() {
        let a = FeatureFilter::new()
            .with_unique_ids(["urn:x:foi:river-1", "urn:x:foi:river-2"])
            .with_property("basin", PropPredicate::pattern("rhine*").unwrap());
        let b = FeatureFilter::new().with_internal_ids([7, 8]);
        let c = a.intersect(&b, NOW).unwrap();

        let mut f = feature("urn:x:foi:river-1");
        f.properties.insert("basin".into(), serde_json::json!("rhine-lower"));
        for (id, rec) in [(7, &f), (9, &f), (7, &feature("urn:x:foi:other-1"))] {
            assert_eq!(c.test(id, rec), a.test(id, rec) && b.test(id, rec));
        }
    }

    #[test]
    fn test_parent_filter() {
        let f = SystemFilter::new().with_parents([3]);
        let mut rec = feature("urn:x:sys:child-1");
        rec.parent_id = 3;
        assert!(f.test(1, &rec));
        rec.parent_id = 4;
        assert!(!f.test(1, &rec));
    }

    #[test]
    fn test_with_fois_builds_nested_datastream_filter() {
        let f = SystemFilter::new().with_fois(FoiFilter::new().with_unique_ids(["urn:x:foi:abc"]));
        let nested = f.datastreams.as_ref().expect("nested datastream filter");
        let fois = nested.fois.as_ref().expect("nested foi filter");
        assert!(fois.unique_ids.as_ref().unwrap().contains("urn:x:foi:abc"));
    }

    #[test]
    fn test_obs_filter_value_predicate_and_times() {
        let f = ObsFilter::new()
            .with_phenomenon_time(TemporalFilter::range(100, 200))
            .with_value_predicate("status", PropPredicate::pattern("ok*").unwrap());
        let series = SeriesRecord { datastream_id: 1, foi_id: 0, result_time_ms: 150 };
        let obs_ok = ObsData {
            phenomenon_time_ms: 150,
            result_time_ms: 150,
            result: serde_json::json!({"status": "ok-nominal", "v": 3.1}),
            parameters: None,
        };
        assert!(f.test(&series, &obs_ok, NOW));

        let mut late = obs_ok.clone();
        late.phenomenon_time_ms = 300;
        assert!(!f.test(&series, &late, NOW));

        let mut bad = obs_ok.clone();
        bad.result = serde_json::json!({"status": "degraded"});
        assert!(!f.test(&series, &bad, NOW));
    }

    #[test]
    fn test_disjoint_time_ranges_signal_empty() {
        let a = ObsFilter::new().with_phenomenon_time(TemporalFilter::range(0, 10));
        let b = ObsFilter::new().with_phenomenon_time(TemporalFilter::range(20, 30));
        assert!(a.intersect(&b, NOW).is_err());
    }
}
