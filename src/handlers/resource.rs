//! Generic pieces shared by every resource handler: query-param parsing
//! into filters, paging, error mapping and the live-stream response.

use std::convert::Infallible;

use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures_util::Stream;

use crate::bus::{Event, Subscription};
use crate::error::StoreError;
use crate::filter::{Geometry, PropPredicate, SpatialFilter, TemporalFilter};
use crate::ids::IdCodec;
use crate::models::feature::parse_instant;

pub const DEFAULT_LIMIT: usize = 100;
pub const MAX_LIMIT: usize = 10_000;

/// Raw query string as ordered pairs; several params are multi-valued.
pub type RawQuery = Vec<(String, String)>;

pub fn err(e: StoreError) -> (StatusCode, String) {
    let status = e.http_status();
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("request failed: {e}");
    }
    (status, e.to_string())
}

/// Decodes an external resource ID; tampered or unknown encodings read as
/// not-found, never as an error.
pub fn decode_id(ext: &str) -> Result<i64, StoreError> {
    let id = IdCodec::process().decode(ext);
    if id <= 0 {
        return Err(StoreError::NotFound);
    }
    Ok(id)
}

/// `<instant>`, `<instant>/<instant>`, `now` or `latest`.
pub fn parse_temporal(s: &str) -> Result<TemporalFilter, StoreError> {
    match s {
        "now" => Ok(TemporalFilter::current()),
        "latest" => Ok(TemporalFilter::LatestVersion),
        _ => match s.split_once('/') {
            Some((begin, end)) => {
                let begin_ms = parse_instant(begin)?;
                let end_ms = parse_instant(end)?;
                if begin_ms > end_ms {
                    return Err(StoreError::InvalidRequest(format!(
                        "time range begins after it ends: {s}"
                    )));
                }
                Ok(TemporalFilter::range(begin_ms, end_ms))
            }
            None => Ok(TemporalFilter::single(parse_instant(s)?)),
        },
    }
}

fn parse_bbox(s: &str) -> Result<SpatialFilter, StoreError> {
    let parts: Vec<f64> = s
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .map_err(|e| StoreError::InvalidRequest(format!("bad bbox {s:?}: {e}")))?;
    let [min_lon, min_lat, max_lon, max_lat] = parts[..] else {
        return Err(StoreError::InvalidRequest(format!(
            "bbox needs minLon,minLat,maxLon,maxLat, got {s:?}"
        )));
    };
    Ok(SpatialFilter::intersects(Geometry::from_bbox(
        min_lon, min_lat, max_lon, max_lat,
    )))
}

/// Query params common to the collection endpoints (§6 of the API docs).
#[derive(Debug, Default)]
pub struct CommonParams {
    pub offset: usize,
    pub limit: usize,
    pub uids: Vec<String>,
    pub valid_time: Option<TemporalFilter>,
    pub spatial: Option<SpatialFilter>,
    pub feature_type: Option<String>,
    pub props: Vec<(String, PropPredicate)>,
    pub phenomenon_time: Option<TemporalFilter>,
    pub result_time: Option<TemporalFilter>,
    pub foi_ids: Vec<i64>,
    pub datastream_ids: Vec<i64>,
    pub select: Vec<String>,
    pub stream: bool,
}

impl CommonParams {
    pub fn parse(raw: &RawQuery) -> Result<Self, StoreError> {
        let mut p = CommonParams {
            limit: DEFAULT_LIMIT,
            ..Default::default()
        };
        for (name, value) in raw {
            match name.as_str() {
                "offset" => {
                    p.offset = value
                        .parse()
                        .map_err(|_| StoreError::InvalidRequest(format!("bad offset {value:?}")))?;
                }
                "limit" => {
                    let limit: i64 = value
                        .parse()
                        .map_err(|_| StoreError::InvalidRequest(format!("bad limit {value:?}")))?;
                    p.limit = limit.clamp(0, MAX_LIMIT as i64) as usize;
                }
                "uid" => p.uids.push(value.clone()),
                "validTime" => p.valid_time = Some(parse_temporal(value)?),
                "phenomenonTime" => p.phenomenon_time = Some(parse_temporal(value)?),
                "resultTime" => p.result_time = Some(parse_temporal(value)?),
                "bbox" => p.spatial = Some(parse_bbox(value)?),
                "geom" => {
                    p.spatial = Some(SpatialFilter::intersects(Geometry::from_wkt(value)?));
                }
                "featureType" => p.feature_type = Some(value.clone()),
                "foi" => p.foi_ids.push(decode_id(value)?),
                "datastream" => p.datastream_ids.push(decode_id(value)?),
                "select" => p.select.extend(value.split(',').map(|f| f.trim().to_string())),
                "format" => {
                    if value != "json" && value != "application/json" {
                        return Err(StoreError::InvalidRequest(format!(
                            "unsupported format {value:?}"
                        )));
                    }
                }
                "stream" => p.stream = value == "true" || value == "1",
                other => {
                    // `p:<name>` carries a property predicate; unknown
                    // params are rejected rather than silently ignored.
                    if let Some(prop) = other.strip_prefix("p:") {
                        let predicate = match value.parse::<f64>() {
                            Ok(n) => PropPredicate::number(n),
                            Err(_) => PropPredicate::pattern(value.clone())?,
                        };
                        p.props.push((prop.to_string(), predicate));
                    } else {
                        return Err(StoreError::InvalidRequest(format!(
                            "unknown query parameter {other:?}"
                        )));
                    }
                }
            }
        }
        Ok(p)
    }

    /// How many entries a store scan must yield to fill this page and
    /// prove whether a next page exists.
    pub fn scan_limit(&self) -> usize {
        self.offset + self.limit + 1
    }
}

/// POST/PUT bodies must be JSON; a missing or foreign content type is 415.
pub fn require_json(headers: &HeaderMap) -> Result<(), (StatusCode, String)> {
    let ok = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"));
    if ok {
        Ok(())
    } else {
        Err((
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "content type must be application/json".to_string(),
        ))
    }
}

/// Keeps only the selected top-level fields of each serialized item,
/// always retaining `id`.
pub fn apply_select(item: &mut serde_json::Value, select: &[String]) {
    if select.is_empty() {
        return;
    }
    if let serde_json::Value::Object(map) = item {
        map.retain(|k, _| k == "id" || select.iter().any(|s| s == k));
    }
}

/// Paged collection body: drops `offset` leading entries, keeps `limit`,
/// and links to the next page iff a surplus entry was fetched.
pub fn page_response(
    mut items: Vec<serde_json::Value>,
    params: &CommonParams,
    base_path: &str,
) -> serde_json::Value {
    let has_next = params.limit > 0 && items.len() > params.offset + params.limit;
    let items: Vec<serde_json::Value> = if params.offset >= items.len() {
        Vec::new()
    } else {
        items.drain(params.offset..).take(params.limit).collect()
    };
    let mut body = serde_json::json!({ "items": items });
    if has_next {
        body["links"] = serde_json::json!([{
            "rel": "next",
            "href": format!(
                "{base_path}?offset={}&limit={}",
                params.offset + params.limit,
                params.limit
            ),
        }]);
    }
    body
}

fn event_json(event: &Event) -> serde_json::Value {
    match event {
        Event::SystemAdded { uid } => serde_json::json!({ "type": "systemAdded", "uid": uid }),
        Event::SystemUpdated { uid, .. } => {
            serde_json::json!({ "type": "systemUpdated", "uid": uid })
        }
        Event::SystemRemoved { uid } => serde_json::json!({ "type": "systemRemoved", "uid": uid }),
        Event::FoiChanged { system_uid, foi } => serde_json::json!({
            "type": "foiChanged",
            "system": system_uid,
            "foi": foi.uid,
        }),
        Event::Data(data) => serde_json::json!({
            "type": "data",
            "system": data.system_uid,
            "output": data.output_name,
            "timestamp": data.timestamp_ms,
            "records": data.records,
        }),
    }
}

/// Server-sent event stream over a bus subscription. Dropping the client
/// connection drops the subscription, which unregisters it.
pub fn stream_response(
    subscription: Subscription,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let stream = futures_util::stream::unfold(subscription, |mut sub| async move {
        let event = sub.recv().await?;
        sub.request(1);
        let sse = SseEvent::default()
            .json_data(event_json(&event))
            .unwrap_or_else(|_| SseEvent::default());
        Some((Ok(sse), sub))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(pairs: &[(&str, &str)]) -> RawQuery {
        pairs.iter().map(|(a, b)| (a.to_string(), b.to_string())).collect()
    }

    #[test]
    fn test_limit_clamped_and_defaulted() {
        let p = CommonParams::parse(&raw(&[])).unwrap();
        assert_eq!(p.limit, DEFAULT_LIMIT);

        let p = CommonParams::parse(&raw(&[("limit", "999999")])).unwrap();
        assert_eq!(p.limit, MAX_LIMIT);

        let p = CommonParams::parse(&raw(&[("limit", "-5")])).unwrap();
        assert_eq!(p.limit, 0);
    }

    #[test]
    fn test_multi_valued_uid_param() {
        let p = CommonParams::parse(&raw(&[("uid", "urn:x:a"), ("uid", "urn:x:b")])).unwrap();
        assert_eq!(p.uids, vec!["urn:x:a", "urn:x:b"]);
    }

    #[test]
    fn test_property_predicate_params() {
        let p = CommonParams::parse(&raw(&[("p:serial", "SN-*"), ("p:channel", "3")])).unwrap();
        assert_eq!(p.props.len(), 2);
        assert!(matches!(p.props[0].1, PropPredicate::Pattern { .. }));
        assert!(matches!(p.props[1].1, PropPredicate::Number(n) if n == 3.0));
    }

    #[test]
    fn test_unknown_param_rejected() {
        assert!(CommonParams::parse(&raw(&[("bogus", "1")])).is_err());
    }

    #[test]
    fn test_temporal_forms() {
        assert_eq!(parse_temporal("latest").unwrap(), TemporalFilter::LatestVersion);
        assert!(matches!(
            parse_temporal("now").unwrap(),
            TemporalFilter::CurrentTime { tolerance_ms: 0 }
        ));
        let range = parse_temporal("2024-01-01T00:00:00Z/2024-01-02T00:00:00Z").unwrap();
        assert!(matches!(range, TemporalFilter::Range { .. }));
        assert!(parse_temporal("2024-01-02T00:00:00Z/2024-01-01T00:00:00Z").is_err());
    }

    #[test]
    fn test_bbox_parsing() {
        let p = CommonParams::parse(&raw(&[("bbox", "4.0,51.0,5.0,52.0")])).unwrap();
        let spatial = p.spatial.unwrap();
        assert!(spatial.test(&Geometry::Point { x: 4.5, y: 51.5 }));
        assert!(!spatial.test(&Geometry::Point { x: 6.0, y: 51.5 }));
        assert!(CommonParams::parse(&raw(&[("bbox", "1,2,3")])).is_err());
    }

    #[test]
    fn test_paging_window_and_next_link() {
        let items: Vec<serde_json::Value> = (0..7).map(|i| serde_json::json!(i)).collect();
        let params = CommonParams {
            offset: 2,
            limit: 3,
            ..Default::default()
        };
        // 7 fetched with scan_limit 6 means a surplus exists.
        let body = page_response(items, &params, "/api/v1/systems");
        let paged: Vec<i64> = body["items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_i64().unwrap())
            .collect();
        assert_eq!(paged, vec![2, 3, 4]);
        assert_eq!(
            body["links"][0]["href"],
            "/api/v1/systems?offset=5&limit=3"
        );
    }

    #[test]
    fn test_paging_no_next_link_on_final_page() {
        let items: Vec<serde_json::Value> = (0..4).map(|i| serde_json::json!(i)).collect();
        let params = CommonParams {
            offset: 2,
            limit: 3,
            ..Default::default()
        };
        let body = page_response(items, &params, "/x");
        assert_eq!(body["items"].as_array().unwrap().len(), 2);
        assert!(body.get("links").is_none());
    }

    #[test]
    fn test_adjacent_pages_compose() {
        let all: Vec<serde_json::Value> = (0..10).map(|i| serde_json::json!(i)).collect();
        let fetch = |offset: usize, limit: usize| {
            let params = CommonParams { offset, limit, ..Default::default() };
            let fetched: Vec<serde_json::Value> =
                all.iter().take(params.scan_limit()).cloned().collect();
            page_response(fetched, &params, "/x")["items"].as_array().unwrap().clone()
        };
        let mut combined = fetch(0, 3);
        combined.extend(fetch(3, 3));
        assert_eq!(combined, fetch(0, 6));
    }

    #[test]
    fn test_select_projection_keeps_id() {
        let mut item = serde_json::json!({ "id": "abc", "name": "n", "uid": "u", "extra": 1 });
        apply_select(&mut item, &["name".to_string()]);
        assert_eq!(item, serde_json::json!({ "id": "abc", "name": "n" }));
    }
}
