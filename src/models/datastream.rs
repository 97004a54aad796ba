use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::ids::IdCodec;
use crate::models::feature::format_instant;
use crate::models::swe::DataComponent;

/// Stored form of one output channel of a system. Valid time lives in the
/// entry key, like feature versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataStreamRecord {
    pub system_id: i64,
    pub output_name: String,
    pub record_schema: DataComponent,
    pub record_encoding: String,
    /// Widened monotonically as observations arrive; never shrinks.
    #[serde(default)]
    pub observed_time_range: Option<(i64, i64)>,
    #[serde(default)]
    pub result_time_range: Option<(i64, i64)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DataStreamKey {
    pub id: i64,
    pub valid_time_ms: i64,
}

// ── REST shapes ──

#[derive(Debug, Deserialize)]
pub struct CreateDataStreamRequest {
    pub output_name: String,
    pub record_schema: DataComponent,
    #[serde(default = "default_encoding")]
    pub record_encoding: String,
}

fn default_encoding() -> String {
    "json".to_string()
}

impl CreateDataStreamRequest {
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.output_name.trim().is_empty() {
            return Err(StoreError::InvalidRequest("output_name must not be empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub struct DataStreamResponse {
    pub id: String,
    pub system: String,
    pub output_name: String,
    pub record_schema: DataComponent,
    pub record_encoding: String,
    pub valid_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phenomenon_time_range: Option<[String; 2]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_time_range: Option<[String; 2]>,
}

impl DataStreamResponse {
    pub fn from_entry(codec: &IdCodec, key: DataStreamKey, record: DataStreamRecord) -> Self {
        let fmt_range = |r: Option<(i64, i64)>| r.map(|(b, e)| [format_instant(b), format_instant(e)]);
        Self {
            id: codec.encode(key.id),
            system: codec.encode(record.system_id),
            output_name: record.output_name,
            record_schema: record.record_schema,
            record_encoding: record.record_encoding,
            valid_time: format_instant(key.valid_time_ms),
            phenomenon_time_range: fmt_range(record.observed_time_range),
            result_time_range: fmt_range(record.result_time_range),
        }
    }
}
