use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::StoreError;
use crate::filter::DataStreamFilter;
use crate::ids::IdAllocator;
use crate::kv::{
    self, DATASTREAMS, DATASTREAMS_BY_SOURCE, KvEngine, MapRead, Writer,
};
use crate::models::datastream::{DataStreamKey, DataStreamRecord};
use crate::models::swe::DataComponent;

use super::{now_ms, select_version_indexes};

const ALLOCATOR: IdAllocator = IdAllocator::new(b"seq:datastream");

/// What `register` did with a producer output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// First sighting of `(system, output)`; a fresh stream was created.
    Created,
    /// Structure compatible with the stored one; updated in place with an
    /// advanced valid time.
    Updated,
    /// Structure incompatible; a new stream took over the source while the
    /// old one keeps its identity and its observations.
    NewVersion,
    /// Byte-identical registration; nothing written.
    Unchanged,
}

pub struct DataStreamStore {
    engine: Arc<KvEngine>,
}

fn entry_key(id: i64, valid_time_ms: i64) -> Vec<u8> {
    kv::key2(&kv::id_bytes(id), &kv::ts_bytes(valid_time_ms))
}

fn source_key(system_id: i64, output_name: &str) -> Vec<u8> {
    kv::key2(&kv::id_bytes(system_id), output_name.as_bytes())
}

impl DataStreamStore {
    pub(crate) fn new(engine: Arc<KvEngine>) -> Self {
        Self { engine }
    }

    fn latest_in(
        &self,
        r: &dyn MapRead,
        id: i64,
    ) -> Result<Option<(DataStreamKey, DataStreamRecord)>, StoreError> {
        let prefix = kv::id_bytes(id);
        let rows = r.scan(DATASTREAMS, &prefix, kv::prefix_end(&prefix).as_deref())?;
        match rows.last() {
            Some((k, v)) => Ok(Some((
                DataStreamKey { id, valid_time_ms: kv::ts_from_bytes(&k[8..]) },
                kv::decode_value(v)?,
            ))),
            None => Ok(None),
        }
    }

    /// Registers a producer output, deciding between create, in-place
    /// update, new stream version and no-op by comparing record structures.
    pub fn register(
        &self,
        system_id: i64,
        output_name: &str,
        schema: &DataComponent,
        encoding: &str,
    ) -> Result<(i64, RegisterOutcome), StoreError> {
        self.engine.update(|w| {
            let src = source_key(system_id, output_name);
            let existing = match w.get(DATASTREAMS_BY_SOURCE, &src)? {
                Some(raw) => self.latest_in(w, kv::id_from_bytes(&raw))?,
                None => None,
            };

            match existing {
                None => {
                    let id = ALLOCATOR.next(w)?;
                    let record = DataStreamRecord {
                        system_id,
                        output_name: output_name.to_string(),
                        record_schema: schema.clone(),
                        record_encoding: encoding.to_string(),
                        observed_time_range: None,
                        result_time_range: None,
                    };
                    w.put_value(DATASTREAMS, entry_key(id, now_ms()), &record)?;
                    w.put(DATASTREAMS_BY_SOURCE, src, kv::id_bytes(id).to_vec());
                    tracing::debug!(system_id, output_name, id, "created data stream");
                    Ok((id, RegisterOutcome::Created))
                }
                Some((key, stored)) => {
                    if stored.record_schema == *schema && stored.record_encoding == encoding {
                        return Ok((key.id, RegisterOutcome::Unchanged));
                    }
                    if stored.record_schema.compatible_with(schema) {
                        // Same structure, relaxed details: advance the valid
                        // time in place and keep accumulated time ranges.
                        let record = DataStreamRecord {
                            record_schema: schema.clone(),
                            record_encoding: encoding.to_string(),
                            ..stored
                        };
                        w.delete(DATASTREAMS, entry_key(key.id, key.valid_time_ms));
                        w.put_value(DATASTREAMS, entry_key(key.id, now_ms()), &record)?;
                        tracing::debug!(id = key.id, output_name, "updated data stream in place");
                        Ok((key.id, RegisterOutcome::Updated))
                    } else {
                        // Incompatible structure: the source moves to a new
                        // stream; the old one stays addressable.
                        let id = ALLOCATOR.next(w)?;
                        let record = DataStreamRecord {
                            system_id,
                            output_name: output_name.to_string(),
                            record_schema: schema.clone(),
                            record_encoding: encoding.to_string(),
                            observed_time_range: None,
                            result_time_range: None,
                        };
                        w.put_value(DATASTREAMS, entry_key(id, now_ms()), &record)?;
                        w.put(DATASTREAMS_BY_SOURCE, src, kv::id_bytes(id).to_vec());
                        tracing::info!(
                            old = key.id,
                            new = id,
                            output_name,
                            "incompatible record structure, new stream version"
                        );
                        Ok((id, RegisterOutcome::NewVersion))
                    }
                }
            }
        })
    }

    pub fn get_latest(
        &self,
        id: i64,
    ) -> Result<Option<(DataStreamKey, DataStreamRecord)>, StoreError> {
        self.engine.view(|r| self.latest_in(r, id))
    }

    pub fn get_version(&self, key: DataStreamKey) -> Result<Option<DataStreamRecord>, StoreError> {
        self.engine.view(|r| {
            r.get(DATASTREAMS, &entry_key(key.id, key.valid_time_ms))?
                .map(|raw| kv::decode_value(&raw))
                .transpose()
        })
    }

    /// Stream currently registered for `(system, output)`.
    pub fn latest_by_source(
        &self,
        system_id: i64,
        output_name: &str,
    ) -> Result<Option<(i64, DataStreamRecord)>, StoreError> {
        self.engine.view(|r| {
            match r.get(DATASTREAMS_BY_SOURCE, &source_key(system_id, output_name))? {
                Some(raw) => {
                    let id = kv::id_from_bytes(&raw);
                    Ok(self.latest_in(r, id)?.map(|(_, rec)| (id, rec)))
                }
                None => Ok(None),
            }
        })
    }

    pub fn select_entries_where(
        &self,
        filter: &DataStreamFilter,
        extra: &dyn Fn(i64, &DataStreamRecord) -> bool,
    ) -> Result<Vec<(DataStreamKey, DataStreamRecord)>, StoreError> {
        self.engine.view(|r| self.select_in(r, filter, extra))
    }

    pub fn select_entries(
        &self,
        filter: &DataStreamFilter,
    ) -> Result<Vec<(DataStreamKey, DataStreamRecord)>, StoreError> {
        self.select_entries_where(filter, &|_, _| true)
    }

    fn select_in(
        &self,
        r: &dyn MapRead,
        filter: &DataStreamFilter,
        extra: &dyn Fn(i64, &DataStreamRecord) -> bool,
    ) -> Result<Vec<(DataStreamKey, DataStreamRecord)>, StoreError> {
        let now = now_ms();
        let mut out = Vec::new();

        let candidates: Option<BTreeSet<i64>> = match (&filter.internal_ids, &filter.system_ids) {
            (Some(ids), _) => Some(ids.clone()),
            (None, Some(system_ids)) => {
                let mut set = BTreeSet::new();
                for sys in system_ids {
                    let prefix = kv::id_bytes(*sys);
                    for (_, v) in
                        r.scan(DATASTREAMS_BY_SOURCE, &prefix, kv::prefix_end(&prefix).as_deref())?
                    {
                        set.insert(kv::id_from_bytes(&v));
                    }
                }
                Some(set)
            }
            (None, None) => None,
        };

        match candidates {
            Some(ids) => {
                for id in ids {
                    let prefix = kv::id_bytes(id);
                    let rows = r.scan(DATASTREAMS, &prefix, kv::prefix_end(&prefix).as_deref())?;
                    let versions: Vec<(i64, Vec<u8>)> = rows
                        .into_iter()
                        .map(|(k, v)| (kv::ts_from_bytes(&k[8..]), v))
                        .collect();
                    self.collect_versions(id, &versions, filter, extra, now, &mut out)?;
                }
            }
            None => {
                let rows = r.scan(DATASTREAMS, &[], None)?;
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
        filter: &DataStreamFilter,
        extra: &dyn Fn(i64, &DataStreamRecord) -> bool,
        now: i64,
        out: &mut Vec<(DataStreamKey, DataStreamRecord)>,
    ) -> Result<(), StoreError> {
        let begins: Vec<i64> = versions.iter().map(|(t, _)| *t).collect();
        for i in select_version_indexes(&begins, &filter.valid_time, now) {
            let record: DataStreamRecord = kv::decode_value(&versions[i].1)?;
            if filter.test(id, &record) && extra(id, &record) {
                out.push((DataStreamKey { id, valid_time_ms: begins[i] }, record));
            }
        }
        Ok(())
    }

    pub fn count_matching(&self, filter: &DataStreamFilter) -> Result<u64, StoreError> {
        Ok(self.select_entries(filter)?.len() as u64)
    }

    pub fn remove_entries_where(
        &self,
        filter: &DataStreamFilter,
        extra: &dyn Fn(i64, &DataStreamRecord) -> bool,
    ) -> Result<u64, StoreError> {
        self.engine.update(|w| {
            let matches = self.select_in(w, filter, extra)?;
            for (key, record) in &matches {
                w.delete(DATASTREAMS, entry_key(key.id, key.valid_time_ms));
                let src = source_key(record.system_id, &record.output_name);
                if let Some(raw) = w.get(DATASTREAMS_BY_SOURCE, &src)? {
                    if kv::id_from_bytes(&raw) == key.id {
                        w.delete(DATASTREAMS_BY_SOURCE, src);
                    }
                }
            }
            Ok(matches.len() as u64)
        })
    }

    pub fn remove_entries(&self, filter: &DataStreamFilter) -> Result<u64, StoreError> {
        self.remove_entries_where(filter, &|_, _| true)
    }

    /// Widens the latest version's observed/result time ranges. Called from
    /// the same write batch as the observation append so the two are atomic.
    pub(crate) fn extend_time_range_in(
        &self,
        w: &mut Writer<'_>,
        id: i64,
        phenomenon_time_ms: i64,
        result_time_ms: i64,
    ) -> Result<(), StoreError> {
        let (key, mut record) = self.latest_in(w, id)?.ok_or(StoreError::NotFound)?;
        let widen = |range: Option<(i64, i64)>, t: i64| match range {
            Some((b, e)) => Some((b.min(t), e.max(t))),
            None => Some((t, t)),
        };
        record.observed_time_range = widen(record.observed_time_range, phenomenon_time_ms);
        record.result_time_range = widen(record.result_time_range, result_time_ms);
        w.put_value(DATASTREAMS, entry_key(key.id, key.valid_time_ms), &record)
    }
}
