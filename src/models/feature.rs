use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::filter::Geometry;
use crate::ids::IdCodec;

/// Minimum length of a feature's unique textual ID.
pub const MIN_UID_LEN: usize = 12;

/// Internal ID of a system's parent when it has none.
pub const ROOT_PARENT: i64 = 0;

/// Stored form of a system/procedure or feature of interest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecord {
    pub uid: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub feature_type: Option<String>,
    #[serde(default)]
    pub geometry: Option<Geometry>,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub parent_id: i64,
}

impl FeatureRecord {
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.uid.len() < MIN_UID_LEN {
            return Err(StoreError::InvalidRequest(format!(
                "uid must be at least {MIN_UID_LEN} characters, got {:?}",
                self.uid
            )));
        }
        if self.name.trim().is_empty() {
            return Err(StoreError::InvalidRequest("name must not be empty".into()));
        }
        Ok(())
    }
}

/// Key of one stored feature version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FeatureKey {
    pub id: i64,
    pub valid_time_ms: i64,
}

pub fn format_instant(ms: i64) -> String {
    match DateTime::<Utc>::from_timestamp_millis(ms) {
        Some(t) => t.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        None => ms.to_string(),
    }
}

pub fn parse_instant(s: &str) -> Result<i64, StoreError> {
    if s == "now" {
        return Ok(Utc::now().timestamp_millis());
    }
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.timestamp_millis())
        .map_err(|e| StoreError::InvalidRequest(format!("bad instant {s:?}: {e}")))
}

// ── REST shapes ──

#[derive(Debug, Deserialize)]
pub struct CreateFeatureRequest {
    pub uid: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub feature_type: Option<String>,
    #[serde(default)]
    pub geometry: Option<Geometry>,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
    /// External ID of the parent system; absent means root.
    #[serde(default)]
    pub parent: Option<String>,
    /// RFC 3339 instant or `now` (the default).
    #[serde(default)]
    pub valid_time: Option<String>,
}

impl CreateFeatureRequest {
    pub fn into_record(self, codec: &IdCodec) -> Result<(FeatureRecord, Option<i64>), StoreError> {
        let parent_id = match &self.parent {
            Some(ext) => {
                let id = codec.decode(ext);
                if id <= 0 {
                    return Err(StoreError::NotFound);
                }
                id
            }
            None => ROOT_PARENT,
        };
        let valid_time_ms = self.valid_time.as_deref().map(parse_instant).transpose()?;
        let record = FeatureRecord {
            uid: self.uid,
            name: self.name,
            description: self.description,
            feature_type: self.feature_type,
            geometry: self.geometry,
            properties: self.properties,
            parent_id,
        };
        record.validate()?;
        Ok((record, valid_time_ms))
    }
}

#[derive(Debug, Serialize)]
pub struct FeatureResponse {
    pub id: String,
    pub uid: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geometry: Option<Geometry>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub valid_time: String,
}

impl FeatureResponse {
    pub fn from_entry(codec: &IdCodec, key: FeatureKey, record: FeatureRecord) -> Self {
        Self {
            id: codec.encode(key.id),
            uid: record.uid,
            name: record.name,
            description: record.description,
            feature_type: record.feature_type,
            geometry: record.geometry,
            properties: record.properties,
            parent: (record.parent_id != ROOT_PARENT).then(|| codec.encode(record.parent_id)),
            valid_time: format_instant(key.valid_time_ms),
        }
    }
}
