use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};

use crate::AppState;
use crate::bus::{self, DataEvent, Event};
use crate::error::StoreError;
use crate::filter::{DataStreamFilter, FoiFilter, ObsFilter};
use crate::handlers::resource::*;
use crate::handlers::systems::parse_one_or_many;
use crate::ids::IdCodec;
use crate::models::obs::{
    CreateObservationRequest, ObsData, ObsKey, ObservationResponse, decode_obs_id, encode_obs_id,
};
use crate::store::ObsOrder;

pub(crate) fn build_filter(params: &CommonParams) -> ObsFilter {
    let mut filter = ObsFilter::new();
    if !params.datastream_ids.is_empty() {
        filter = filter.with_datastream_ids(params.datastream_ids.iter().copied());
    }
    if !params.foi_ids.is_empty() {
        filter = filter.with_foi_ids(params.foi_ids.iter().copied());
    }
    if !params.uids.is_empty() {
        filter = filter.with_datastreams(
            DataStreamFilter::new().with_system_uids(params.uids.iter().cloned()),
        );
    }
    if let Some(spatial) = &params.spatial {
        filter = filter.with_fois({
            let mut f = FoiFilter::new();
            f.spatial = Some(spatial.clone());
            f
        });
    }
    if let Some(t) = &params.phenomenon_time {
        filter = filter.with_phenomenon_time(t.clone());
    }
    if let Some(t) = &params.result_time {
        filter = filter.with_result_time(t.clone());
    }
    for (name, predicate) in &params.props {
        filter = filter.with_value_predicate(name.clone(), predicate.clone());
    }
    filter
}

pub(crate) fn render(
    rows: Vec<(ObsKey, crate::models::obs::SeriesRecord, ObsData)>,
    params: &CommonParams,
) -> Vec<serde_json::Value> {
    let codec = IdCodec::process();
    rows.into_iter()
        .map(|(key, series, obs)| {
            let mut item =
                serde_json::to_value(ObservationResponse::from_entry(codec, key, &series, obs))
                    .unwrap_or(serde_json::Value::Null);
            apply_select(&mut item, &params.select);
            item
        })
        .collect()
}

pub async fn list_observations(
    State(state): State<AppState>,
    Query(raw): Query<RawQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let params = CommonParams::parse(&raw).map_err(err)?;
    let filter = build_filter(&params).with_limit(params.scan_limit());
    let rows = state
        .db
        .select_observations(&filter, ObsOrder::TimeAscending)
        .map_err(err)?;
    let items = render(rows, &params);
    Ok(Json(page_response(items, &params, "/api/v1/observations")))
}

pub async fn count_observations(
    State(state): State<AppState>,
    Query(raw): Query<RawQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let params = CommonParams::parse(&raw).map_err(err)?;
    let count = state
        .db
        .count_observations(&build_filter(&params))
        .map_err(err)?;
    Ok(Json(serde_json::json!({ "count": count })))
}

pub async fn create_observations(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    require_json(&headers)?;
    let requests = parse_one_or_many::<CreateObservationRequest>(&body).map_err(err)?;

    let codec = IdCodec::process();
    let mut decoded = Vec::with_capacity(requests.len());
    for request in requests {
        decoded.push(request.decode(codec).map_err(err)?);
    }

    let mut created = Vec::with_capacity(decoded.len());
    for (ds_id, foi_id, obs) in decoded {
        let (_, stream) = state
            .db
            .datastreams
            .get_latest(ds_id)
            .map_err(err)?
            .ok_or_else(|| err(StoreError::NotFound))?;
        let key = state.db.add_observation(ds_id, foi_id, &obs).map_err(err)?;

        // Fan the stored observation out to live stream subscribers.
        if let Some((_, system)) = state.db.systems.current_version(stream.system_id).map_err(err)? {
            state.bus.publish(
                &bus::stream_topic(&system.uid, &stream.output_name),
                Event::Data(Arc::new(DataEvent {
                    system_uid: system.uid.clone(),
                    output_name: stream.output_name.clone(),
                    foi_uid: None,
                    timestamp_ms: obs.result_time_ms,
                    record_schema: stream.record_schema.clone(),
                    records: vec![obs.result.clone()],
                })),
            );
        }
        created.push(format!("/api/v1/observations/{}", encode_obs_id(codec, key)));
    }
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "created": created }))))
}

fn decode_key(ext_id: &str) -> Result<ObsKey, (StatusCode, String)> {
    decode_obs_id(IdCodec::process(), ext_id).ok_or_else(|| err(StoreError::NotFound))
}

pub async fn get_observation(
    State(state): State<AppState>,
    Path(ext_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let key = decode_key(&ext_id)?;
    let obs = state
        .db
        .obs
        .get(key)
        .map_err(err)?
        .ok_or_else(|| err(StoreError::NotFound))?;
    let series = state
        .db
        .obs
        .series(key.series_id)
        .map_err(err)?
        .ok_or_else(|| err(StoreError::NotFound))?;
    let codec = IdCodec::process();
    Ok(Json(
        serde_json::to_value(ObservationResponse::from_entry(codec, key, &series, obs))
            .unwrap_or(serde_json::Value::Null),
    ))
}

pub async fn update_observation(
    State(state): State<AppState>,
    Path(ext_id): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    require_json(&headers)?;
    let key = decode_key(&ext_id)?;
    let request: CreateObservationRequest =
        serde_json::from_str(&body).map_err(|e| err(StoreError::Parse(e.to_string())))?;
    let (_, _, obs) = request.decode(IdCodec::process()).map_err(err)?;
    state.db.obs.put(key, &obs).map_err(err)?;

    let series = state
        .db
        .obs
        .series(key.series_id)
        .map_err(err)?
        .ok_or_else(|| err(StoreError::NotFound))?;
    let codec = IdCodec::process();
    Ok(Json(
        serde_json::to_value(ObservationResponse::from_entry(codec, key, &series, obs))
            .unwrap_or(serde_json::Value::Null),
    ))
}

pub async fn delete_observation(
    State(state): State<AppState>,
    Path(ext_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let key = decode_key(&ext_id)?;
    if !state.db.obs.delete(key).map_err(err)? {
        return Err(err(StoreError::NotFound));
    }
    Ok(StatusCode::NO_CONTENT)
}
