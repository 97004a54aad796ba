use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::ids::IdCodec;
use crate::models::feature::{format_instant, parse_instant};

/// Internal FOI ID used for observations that are not about any feature.
pub const NO_FOI: i64 = 0;

/// One stored observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObsData {
    pub phenomenon_time_ms: i64,
    pub result_time_ms: i64,
    pub result: serde_json::Value,
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
}

/// Key of one observation: its series plus the phenomenon time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObsKey {
    pub series_id: i64,
    pub phenomenon_time_ms: i64,
}

/// Series under which observations accumulate. Uniquely identified by its
/// three fields; created lazily on first matching observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesRecord {
    pub datastream_id: i64,
    pub foi_id: i64,
    pub result_time_ms: i64,
}

/// External observation IDs combine the scrambled series ID with the
/// phenomenon time, so a single path segment addresses one observation.
pub fn encode_obs_id(codec: &IdCodec, key: ObsKey) -> String {
    format!("{}.{}", codec.encode(key.series_id), key.phenomenon_time_ms)
}

pub fn decode_obs_id(codec: &IdCodec, s: &str) -> Option<ObsKey> {
    let (series, ts) = s.split_once('.')?;
    let series_id = codec.decode(series);
    if series_id <= 0 {
        return None;
    }
    let phenomenon_time_ms = ts.parse().ok()?;
    Some(ObsKey {
        series_id,
        phenomenon_time_ms,
    })
}

// ── REST shapes ──

#[derive(Debug, Deserialize)]
pub struct CreateObservationRequest {
    /// External ID of the owning data stream.
    pub datastream: String,
    /// External ID of the observed feature of interest, if any.
    #[serde(default)]
    pub foi: Option<String>,
    /// RFC 3339 instant or `now`.
    pub phenomenon_time: String,
    /// Defaults to the phenomenon time.
    #[serde(default)]
    pub result_time: Option<String>,
    pub result: serde_json::Value,
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
}

impl CreateObservationRequest {
    pub fn decode(self, codec: &IdCodec) -> Result<(i64, i64, ObsData), StoreError> {
        let ds_id = codec.decode(&self.datastream);
        if ds_id <= 0 {
            return Err(StoreError::NotFound);
        }
        let foi_id = match &self.foi {
            Some(ext) => {
                let id = codec.decode(ext);
                if id <= 0 {
                    return Err(StoreError::NotFound);
                }
                id
            }
            None => NO_FOI,
        };
        let phenomenon_time_ms = parse_instant(&self.phenomenon_time)?;
        let result_time_ms = match &self.result_time {
            Some(s) => parse_instant(s)?,
            None => phenomenon_time_ms,
        };
        Ok((
            ds_id,
            foi_id,
            ObsData {
                phenomenon_time_ms,
                result_time_ms,
                result: self.result,
                parameters: self.parameters,
            },
        ))
    }
}

#[derive(Debug, Serialize)]
pub struct ObservationResponse {
    pub id: String,
    pub datastream: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub foi: Option<String>,
    pub phenomenon_time: String,
    pub result_time: String,
    pub result: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

impl ObservationResponse {
    pub fn from_entry(codec: &IdCodec, key: ObsKey, series: &SeriesRecord, obs: ObsData) -> Self {
        Self {
            id: encode_obs_id(codec, key),
            datastream: codec.encode(series.datastream_id),
            foi: (series.foi_id != NO_FOI).then(|| codec.encode(series.foi_id)),
            phenomenon_time: format_instant(obs.phenomenon_time_ms),
            result_time: format_instant(obs.result_time_ms),
            result: obs.result,
            parameters: obs.parameters,
        }
    }
}
