use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};

use crate::AppState;
use crate::bus::{self, EventKind};
use crate::error::StoreError;
use crate::filter::{DataStreamFilter, FoiFilter, TemporalFilter};
use crate::handlers::resource::*;
use crate::ids::IdCodec;
use crate::models::datastream::{CreateDataStreamRequest, DataStreamResponse};

pub(crate) fn build_filter(params: &CommonParams) -> DataStreamFilter {
    let mut filter = DataStreamFilter::new();
    if !params.uids.is_empty() {
        filter = filter.with_system_uids(params.uids.iter().cloned());
    }
    if !params.datastream_ids.is_empty() {
        filter = filter.with_internal_ids(params.datastream_ids.iter().copied());
    }
    if !params.foi_ids.is_empty() {
        filter = filter.with_fois(FoiFilter::new().with_internal_ids(params.foi_ids.iter().copied()));
    }
    filter.valid_time = params
        .valid_time
        .clone()
        .unwrap_or(TemporalFilter::LatestVersion);
    filter
}

pub(crate) fn render(
    state: &AppState,
    filter: &DataStreamFilter,
    params: &CommonParams,
) -> Result<Vec<serde_json::Value>, StoreError> {
    let codec = IdCodec::process();
    Ok(state
        .db
        .select_datastreams(filter)?
        .into_iter()
        .map(|(key, record)| {
            let mut item =
                serde_json::to_value(DataStreamResponse::from_entry(codec, key, record))
                    .unwrap_or(serde_json::Value::Null);
            apply_select(&mut item, &params.select);
            item
        })
        .collect())
}

pub async fn list_datastreams(
    State(state): State<AppState>,
    Query(raw): Query<RawQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let params = CommonParams::parse(&raw).map_err(err)?;
    let filter = build_filter(&params).with_limit(params.scan_limit());
    let items = render(&state, &filter, &params).map_err(err)?;
    Ok(Json(page_response(items, &params, "/api/v1/datastreams")))
}

pub async fn count_datastreams(
    State(state): State<AppState>,
    Query(raw): Query<RawQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let params = CommonParams::parse(&raw).map_err(err)?;
    let count = state.db.count_datastreams(&build_filter(&params)).map_err(err)?;
    Ok(Json(serde_json::json!({ "count": count })))
}

/// Registers an output on a system; shared by the nested POST route.
pub(crate) async fn register(
    state: &AppState,
    system_id: i64,
    body: &str,
) -> Result<(StatusCode, Json<serde_json::Value>), (StatusCode, String)> {
    let request: CreateDataStreamRequest =
        serde_json::from_str(body).map_err(|e| err(StoreError::Parse(e.to_string())))?;
    request.validate().map_err(err)?;

    let (id, _) = state
        .db
        .datastreams
        .register(system_id, &request.output_name, &request.record_schema, &request.record_encoding)
        .map_err(err)?;
    let (key, record) = state
        .db
        .datastreams
        .get_latest(id)
        .map_err(err)?
        .ok_or_else(|| err(StoreError::NotFound))?;
    let codec = IdCodec::process();
    Ok((
        StatusCode::CREATED,
        Json(
            serde_json::to_value(DataStreamResponse::from_entry(codec, key, record))
                .unwrap_or(serde_json::Value::Null),
        ),
    ))
}

pub async fn get_datastream(
    State(state): State<AppState>,
    Path(ext_id): Path<String>,
    Query(raw): Query<RawQuery>,
) -> Result<Response, (StatusCode, String)> {
    let params = CommonParams::parse(&raw).map_err(err)?;
    let id = decode_id(&ext_id).map_err(err)?;
    let (key, record) = state
        .db
        .datastreams
        .get_latest(id)
        .map_err(err)?
        .ok_or_else(|| err(StoreError::NotFound))?;

    if params.stream {
        let system = state
            .db
            .systems
            .current_version(record.system_id)
            .map_err(err)?
            .ok_or_else(|| err(StoreError::NotFound))?;
        let sub = state.bus.subscribe(
            bus::stream_topic(&system.1.uid, &record.output_name),
            [EventKind::Data],
            1024,
        );
        return Ok(stream_response(sub).into_response());
    }
    let codec = IdCodec::process();
    let mut item = serde_json::to_value(DataStreamResponse::from_entry(codec, key, record))
        .unwrap_or(serde_json::Value::Null);
    apply_select(&mut item, &params.select);
    Ok(Json(item).into_response())
}

/// Re-registers the stream's source with a new description. Compatible
/// structures update in place; incompatible ones allocate a new stream and
/// the response points at it.
pub async fn update_datastream(
    State(state): State<AppState>,
    Path(ext_id): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    require_json(&headers)?;
    let id = decode_id(&ext_id).map_err(err)?;
    let (_, record) = state
        .db
        .datastreams
        .get_latest(id)
        .map_err(err)?
        .ok_or_else(|| err(StoreError::NotFound))?;

    let request: CreateDataStreamRequest =
        serde_json::from_str(&body).map_err(|e| err(StoreError::Parse(e.to_string())))?;
    request.validate().map_err(err)?;
    if request.output_name != record.output_name {
        return Err(err(StoreError::InvalidRequest(
            "output_name of a stream cannot change".into(),
        )));
    }

    let (new_id, _) = state
        .db
        .datastreams
        .register(record.system_id, &request.output_name, &request.record_schema, &request.record_encoding)
        .map_err(err)?;
    let (key, updated) = state
        .db
        .datastreams
        .get_latest(new_id)
        .map_err(err)?
        .ok_or_else(|| err(StoreError::NotFound))?;
    let codec = IdCodec::process();
    Ok(Json(
        serde_json::to_value(DataStreamResponse::from_entry(codec, key, updated))
            .unwrap_or(serde_json::Value::Null),
    ))
}

pub async fn delete_datastream(
    State(state): State<AppState>,
    Path(ext_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let id = decode_id(&ext_id).map_err(err)?;
    let removed = state
        .db
        .datastreams
        .remove_entries(
            &DataStreamFilter::new()
                .with_internal_ids([id])
                .with_valid_time(TemporalFilter::AllTimes),
        )
        .map_err(err)?;
    if removed == 0 {
        return Err(err(StoreError::NotFound));
    }
    Ok(StatusCode::NO_CONTENT)
}
