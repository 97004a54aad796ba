//! Bridge between the event bus and the observation database.
//!
//! Registered producers publish data and FOI events on their topics; the
//! bridge materialises systems, streams, series and observations on first
//! sighting. A bad event is rejected and logged on its own; it never tears
//! down the subscription.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use crate::bus::{self, DataEvent, Event, EventBus, EventKind, SubscriptionHandle};
use crate::error::StoreError;
use crate::models::feature::{FeatureRecord, parse_instant};
use crate::models::obs::{NO_FOI, ObsData};
use crate::store::{Db, RegisterOutcome};

/// Demand window per bridge subscription; replenished one-for-one as
/// events are handled.
const DEMAND_WINDOW: u64 = 256;

#[derive(Default)]
struct Caches {
    /// system UID → internal ID
    system_ids: HashMap<String, i64>,
    /// system internal ID → FOI internal ID currently being observed
    current_foi: HashMap<i64, i64>,
    /// data stream ID → name of the schema's time field
    time_fields: HashMap<i64, Option<String>>,
}

pub struct Bridge {
    db: Arc<Db>,
    bus: Arc<EventBus>,
    caches: Mutex<Caches>,
}

/// Producer registration owned by the caller. Stopping it cancels the
/// bridge's subscriptions and waits for in-flight deliveries to drain.
pub struct ProducerRegistration {
    system_uid: String,
    subscriptions: Vec<SubscriptionHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl ProducerRegistration {
    pub async fn stop(self) {
        for sub in &self.subscriptions {
            sub.cancel();
        }
        for task in self.tasks {
            let _ = task.await;
        }
        tracing::info!(uid = %self.system_uid, "producer unregistered");
    }
}

impl Bridge {
    pub fn new(db: Arc<Db>, bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            db,
            bus,
            caches: Mutex::new(Caches::default()),
        })
    }

    /// Subscribes to a producer's system topic and its per-output stream
    /// topics and persists everything the producer publishes there.
    pub fn register_producer(
        self: &Arc<Self>,
        system_uid: &str,
        outputs: &[String],
    ) -> ProducerRegistration {
        let mut topics = vec![(
            bus::system_topic(system_uid),
            vec![EventKind::System, EventKind::Foi, EventKind::Data],
        )];
        for output in outputs {
            topics.push((bus::stream_topic(system_uid, output), vec![EventKind::Data]));
        }

        let mut subscriptions = Vec::new();
        let mut tasks = Vec::new();
        for (topic, kinds) in topics {
            let mut sub = self.bus.subscribe(topic, kinds, DEMAND_WINDOW);
            subscriptions.push(sub.handle());
            let bridge = self.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(event) = sub.recv().await {
                    bridge.handle_event(&event);
                    sub.request(1);
                }
            }));
        }
        tracing::info!(uid = %system_uid, outputs = outputs.len(), "producer registered");
        ProducerRegistration {
            system_uid: system_uid.to_string(),
            subscriptions,
            tasks,
        }
    }

    fn handle_event(&self, event: &Event) {
        let result = match event {
            Event::Data(data) => self.handle_data(data),
            Event::FoiChanged { system_uid, foi } => self.handle_foi(system_uid, foi),
            Event::SystemUpdated { uid, record } => self.handle_system_update(uid, record),
            Event::SystemAdded { .. } | Event::SystemRemoved { .. } => Ok(()),
        };
        if let Err(e) = result {
            tracing::warn!("event rejected: {e}");
        }
    }

    /// Internal ID of the producing system, creating a minimal system
    /// entity on first sighting.
    fn resolve_system(&self, uid: &str) -> Result<i64, StoreError> {
        if let Some(id) = self.caches.lock().unwrap().system_ids.get(uid) {
            return Ok(*id);
        }
        let id = match self.db.systems.current_version_by_uid(uid)? {
            Some((key, _)) => key.id,
            None => {
                let record = FeatureRecord {
                    uid: uid.to_string(),
                    name: uid.to_string(),
                    description: None,
                    feature_type: None,
                    geometry: None,
                    properties: Default::default(),
                    parent_id: 0,
                };
                let key = self.db.systems.add(&record, None)?;
                self.bus.publish(
                    bus::REGISTRY_TOPIC,
                    Event::SystemAdded { uid: uid.to_string() },
                );
                key.id
            }
        };
        self.caches.lock().unwrap().system_ids.insert(uid.to_string(), id);
        Ok(id)
    }

    fn handle_data(&self, event: &DataEvent) -> Result<(), StoreError> {
        let system_id = self.resolve_system(&event.system_uid)?;

        let (ds_id, outcome) = self.db.datastreams.register(
            system_id,
            &event.output_name,
            &event.record_schema,
            "json",
        )?;
        if outcome != RegisterOutcome::Unchanged {
            self.caches.lock().unwrap().time_fields.remove(&ds_id);
        }

        let foi_id = match &event.foi_uid {
            Some(uid) => match self.db.fois.id_of_uid(uid)? {
                Some(id) => id,
                None => {
                    return Err(StoreError::InvalidRequest(format!(
                        "unknown FOI {uid:?} referenced by {}/{}",
                        event.system_uid, event.output_name
                    )));
                }
            },
            None => self
                .caches
                .lock()
                .unwrap()
                .current_foi
                .get(&system_id)
                .copied()
                .unwrap_or(NO_FOI),
        };

        let time_field = {
            let mut caches = self.caches.lock().unwrap();
            caches
                .time_fields
                .entry(ds_id)
                .or_insert_with(|| event.record_schema.time_field().map(String::from))
                .clone()
        };

        for record in &event.records {
            let phenomenon_time_ms = time_field
                .as_deref()
                .and_then(|f| extract_time(record, f))
                .unwrap_or(event.timestamp_ms);
            let obs = ObsData {
                phenomenon_time_ms,
                result_time_ms: event.timestamp_ms,
                result: record.clone(),
                parameters: None,
            };
            self.db.add_observation(ds_id, foi_id, &obs)?;
        }
        tracing::debug!(
            system = %event.system_uid,
            output = %event.output_name,
            count = event.records.len(),
            "stored observations"
        );
        Ok(())
    }

    /// Upserts the feature and makes it the system's current FOI, inherited
    /// by subsequent observations until the next FOI event.
    fn handle_foi(&self, system_uid: &str, foi: &FeatureRecord) -> Result<(), StoreError> {
        let foi_id = match self.db.fois.current_version_by_uid(&foi.uid)? {
            Some((key, stored)) => {
                if stored != *foi {
                    self.db.fois.add_version(foi, None)?;
                }
                key.id
            }
            None => self.db.fois.add(foi, None)?.id,
        };
        let system_id = self.resolve_system(system_uid)?;
        self.caches.lock().unwrap().current_foi.insert(system_id, foi_id);
        Ok(())
    }

    /// Stores a new description version only when the content differs from
    /// the stored latest.
    fn handle_system_update(&self, uid: &str, record: &FeatureRecord) -> Result<(), StoreError> {
        match self.db.systems.current_version_by_uid(uid)? {
            Some((_, stored)) => {
                if stored != *record {
                    self.db.systems.add_version(record, None)?;
                    self.bus
                        .publish(bus::REGISTRY_TOPIC, Event::SystemAdded { uid: uid.to_string() });
                }
                Ok(())
            }
            None => {
                self.db.systems.add(record, None)?;
                Ok(())
            }
        }
    }
}

/// Phenomenon time from a record field: RFC 3339 strings or epoch
/// milliseconds.
fn extract_time(record: &serde_json::Value, field: &str) -> Option<i64> {
    match record.get(field)? {
        serde_json::Value::String(s) => parse_instant(s).ok(),
        serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::filter::ObsFilter;
    use crate::models::swe::{DataComponent, Field};
    use crate::store::ObsOrder;
    use tempfile::tempdir;

    fn open_db(dir: &std::path::Path) -> Arc<Db> {
        let cfg = StorageConfig {
            path: dir.join("bridge.db").to_string_lossy().into_owned(),
            ..StorageConfig::default()
        };
        Arc::new(Db::open(&cfg).unwrap())
    }

    fn schema() -> DataComponent {
        DataComponent::Record {
            label: None,
            fields: vec![
                Field {
                    name: "time".into(),
                    component: DataComponent::Time { label: None, unit: None },
                },
                Field {
                    name: "value".into(),
                    component: DataComponent::Quantity { label: None, unit: "1".into() },
                },
            ],
        }
    }

    fn data_event(records: Vec<serde_json::Value>) -> Event {
        Event::Data(Arc::new(DataEvent {
            system_uid: "urn:x:sys:bridge-01".into(),
            output_name: "out".into(),
            foi_uid: None,
            timestamp_ms: 10_000,
            record_schema: schema(),
            records,
        }))
    }

    #[tokio::test]
    async fn test_data_event_materialises_everything() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        let bridge = Bridge::new(db.clone(), EventBus::new());

        bridge.handle_event(&data_event(vec![
            serde_json::json!({ "time": 5000, "value": 3.14 }),
        ]));

        // System auto-created on first sighting.
        let (_, sys) = db.systems.current_version_by_uid("urn:x:sys:bridge-01").unwrap().unwrap();
        assert_eq!(sys.uid, "urn:x:sys:bridge-01");

        let rows = db
            .select_observations(&ObsFilter::new(), ObsOrder::SeriesThenTime)
            .unwrap();
        assert_eq!(rows.len(), 1);
        // Phenomenon time came from the record's time field.
        assert_eq!(rows[0].0.phenomenon_time_ms, 5000);
        assert_eq!(rows[0].2.result["value"], 3.14);
    }

    #[tokio::test]
    async fn test_missing_time_column_falls_back_to_event_timestamp() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        let bridge = Bridge::new(db.clone(), EventBus::new());

        bridge.handle_event(&data_event(vec![serde_json::json!({ "value": 1.0 })]));

        let rows = db
            .select_observations(&ObsFilter::new(), ObsOrder::SeriesThenTime)
            .unwrap();
        assert_eq!(rows[0].0.phenomenon_time_ms, 10_000);
    }

    #[tokio::test]
    async fn test_unknown_foi_rejects_event_only() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        let bridge = Bridge::new(db.clone(), EventBus::new());

        let mut bad = DataEvent {
            system_uid: "urn:x:sys:bridge-01".into(),
            output_name: "out".into(),
            foi_uid: Some("urn:x:foi:nobody".into()),
            timestamp_ms: 10_000,
            record_schema: schema(),
            records: vec![serde_json::json!({ "time": 1000, "value": 1.0 })],
        };
        bridge.handle_event(&Event::Data(Arc::new(bad.clone())));
        assert_eq!(
            db.select_observations(&ObsFilter::new(), ObsOrder::SeriesThenTime).unwrap().len(),
            0
        );

        // The same producer keeps working after the rejected event.
        bad.foi_uid = None;
        bridge.handle_event(&Event::Data(Arc::new(bad)));
        assert_eq!(
            db.select_observations(&ObsFilter::new(), ObsOrder::SeriesThenTime).unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_foi_event_sets_current_foi_for_system() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        let bridge = Bridge::new(db.clone(), EventBus::new());

        let foi = FeatureRecord {
            uid: "urn:x:foi:river-001".into(),
            name: "river".into(),
            description: None,
            feature_type: None,
            geometry: None,
            properties: Default::default(),
            parent_id: 0,
        };
        bridge.handle_event(&Event::FoiChanged {
            system_uid: "urn:x:sys:bridge-01".into(),
            foi: foi.clone(),
        });
        bridge.handle_event(&data_event(vec![serde_json::json!({ "time": 1, "value": 1.0 })]));

        let foi_id = db.fois.id_of_uid("urn:x:foi:river-001").unwrap().unwrap();
        let rows = db
            .select_observations(&ObsFilter::new(), ObsOrder::SeriesThenTime)
            .unwrap();
        assert_eq!(rows[0].1.foi_id, foi_id);

        // Re-sending the identical FOI does not create a new version.
        bridge.handle_event(&Event::FoiChanged {
            system_uid: "urn:x:sys:bridge-01".into(),
            foi,
        });
        let versions = db
            .fois
            .select_entries(&crate::filter::FeatureFilter::new().with_unique_ids(["urn:x:foi:river-001"]))
            .unwrap();
        assert_eq!(versions.len(), 1);
    }

    #[tokio::test]
    async fn test_description_versioned_only_on_change() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        let bridge = Bridge::new(db.clone(), EventBus::new());

        let mut record = FeatureRecord {
            uid: "urn:x:sys:bridge-01".into(),
            name: "station".into(),
            description: Some("v1".into()),
            feature_type: None,
            geometry: None,
            properties: Default::default(),
            parent_id: 0,
        };
        let uid = record.uid.clone();
        bridge.handle_event(&Event::SystemUpdated { uid: uid.clone(), record: record.clone() });
        bridge.handle_event(&Event::SystemUpdated { uid: uid.clone(), record: record.clone() });
        record.description = Some("v2".into());
        bridge.handle_event(&Event::SystemUpdated { uid: uid.clone(), record });

        let versions = db
            .systems
            .select_entries(&crate::filter::FeatureFilter::new().with_unique_ids([uid]))
            .unwrap();
        assert_eq!(versions.len(), 2);
    }

    #[tokio::test]
    async fn test_registered_producer_roundtrip_and_stop() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        let bus = EventBus::new();
        let bridge = Bridge::new(db.clone(), bus.clone());

        let registration =
            bridge.register_producer("urn:x:sys:bridge-01", &["out".to_string()]);
        bus.publish(
            &bus::stream_topic("urn:x:sys:bridge-01", "out"),
            data_event(vec![serde_json::json!({ "time": 1000, "value": 2.5 })]),
        );

        // The bridge consumes asynchronously; poll until the write lands.
        let mut stored = 0;
        for _ in 0..200 {
            stored = db
                .select_observations(&ObsFilter::new(), ObsOrder::SeriesThenTime)
                .unwrap()
                .len();
            if stored == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(stored, 1);

        registration.stop().await;
        bus.publish(
            &bus::stream_topic("urn:x:sys:bridge-01", "out"),
            data_event(vec![serde_json::json!({ "time": 2000, "value": 9.9 })]),
        );
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(
            db.select_observations(&ObsFilter::new(), ObsOrder::SeriesThenTime).unwrap().len(),
            1
        );
    }
}
