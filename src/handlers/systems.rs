use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};

use crate::AppState;
use crate::bus::{self, Event, EventKind};
use crate::error::StoreError;
use crate::filter::{DataStreamFilter, FoiFilter, ObsFilter, SystemFilter, TemporalFilter};
use crate::handlers::resource::*;
use crate::handlers::{datastreams, observations};
use crate::ids::IdCodec;
use crate::models::feature::{CreateFeatureRequest, FeatureResponse};
use crate::store::ObsOrder;

fn build_filter(params: &CommonParams) -> SystemFilter {
    let mut filter = SystemFilter::new();
    if !params.uids.is_empty() {
        filter = filter.with_unique_ids(params.uids.iter().cloned());
    }
    // Without an explicit validTime, collections list current descriptions.
    filter.feature.valid_time = params
        .valid_time
        .clone()
        .unwrap_or(TemporalFilter::LatestVersion);
    filter.feature.spatial = params.spatial.clone();
    filter.feature.feature_type = params.feature_type.clone();
    filter.feature.props = params.props.clone();
    if !params.datastream_ids.is_empty() {
        filter = filter.with_datastreams(
            DataStreamFilter::new().with_internal_ids(params.datastream_ids.iter().copied()),
        );
    }
    if !params.foi_ids.is_empty() {
        filter = filter.with_fois(FoiFilter::new().with_internal_ids(params.foi_ids.iter().copied()));
    }
    filter
}

pub async fn list_systems(
    State(state): State<AppState>,
    Query(raw): Query<RawQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let params = CommonParams::parse(&raw).map_err(err)?;
    let mut filter = build_filter(&params);
    filter.feature.limit = Some(params.scan_limit());

    let codec = IdCodec::process();
    let rows = state.db.select_systems(&filter).map_err(err)?;
    let items = rows
        .into_iter()
        .map(|(key, record)| {
            let mut item = serde_json::to_value(FeatureResponse::from_entry(codec, key, record))
                .unwrap_or(serde_json::Value::Null);
            apply_select(&mut item, &params.select);
            item
        })
        .collect();
    Ok(Json(page_response(items, &params, "/api/v1/systems")))
}

pub async fn count_systems(
    State(state): State<AppState>,
    Query(raw): Query<RawQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let params = CommonParams::parse(&raw).map_err(err)?;
    let count = state.db.count_systems(&build_filter(&params)).map_err(err)?;
    Ok(Json(serde_json::json!({ "count": count })))
}

pub async fn create_systems(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    require_json(&headers)?;
    let requests = parse_one_or_many::<CreateFeatureRequest>(&body).map_err(err)?;

    let codec = IdCodec::process();
    let mut decoded = Vec::with_capacity(requests.len());
    for request in requests {
        decoded.push(request.into_record(codec).map_err(err)?);
    }

    let mut created = Vec::with_capacity(decoded.len());
    for (record, valid_time_ms) in decoded {
        let uid = record.uid.clone();
        let key = state.db.systems.add(&record, valid_time_ms).map_err(err)?;
        state.bus.publish(bus::REGISTRY_TOPIC, Event::SystemAdded { uid });
        created.push(format!("/api/v1/systems/{}", codec.encode(key.id)));
    }
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "created": created }))))
}

/// Bodies may carry one record or an array of records.
pub(crate) fn parse_one_or_many<T: serde::de::DeserializeOwned>(
    body: &str,
) -> Result<Vec<T>, StoreError> {
    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| StoreError::Parse(e.to_string()))?;
    let many = match value {
        serde_json::Value::Array(items) => items,
        one => vec![one],
    };
    if many.is_empty() {
        return Err(StoreError::InvalidRequest("empty record list".into()));
    }
    many.into_iter()
        .map(|v| serde_json::from_value(v).map_err(|e| StoreError::Parse(e.to_string())))
        .collect()
}

pub async fn get_system(
    State(state): State<AppState>,
    Path(ext_id): Path<String>,
    Query(raw): Query<RawQuery>,
) -> Result<Response, (StatusCode, String)> {
    let params = CommonParams::parse(&raw).map_err(err)?;
    let id = decode_id(&ext_id).map_err(err)?;
    let (key, record) = state
        .db
        .systems
        .current_version(id)
        .map_err(err)?
        .ok_or_else(|| err(StoreError::NotFound))?;

    if params.stream {
        let sub = state.bus.subscribe(
            bus::system_topic(&record.uid),
            [EventKind::System, EventKind::Foi, EventKind::Data],
            1024,
        );
        return Ok(stream_response(sub).into_response());
    }
    let codec = IdCodec::process();
    let mut item = serde_json::to_value(FeatureResponse::from_entry(codec, key, record))
        .unwrap_or(serde_json::Value::Null);
    apply_select(&mut item, &params.select);
    Ok(Json(item).into_response())
}

pub async fn update_system(
    State(state): State<AppState>,
    Path(ext_id): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    require_json(&headers)?;
    let id = decode_id(&ext_id).map_err(err)?;
    let request: CreateFeatureRequest =
        serde_json::from_str(&body).map_err(|e| err(StoreError::Parse(e.to_string())))?;
    let (record, _) = request.into_record(IdCodec::process()).map_err(err)?;

    let key = state
        .db
        .systems
        .current_version_key(id)
        .map_err(err)?
        .ok_or_else(|| err(StoreError::NotFound))?;
    state.db.systems.put(key, &record).map_err(err)?;
    state.bus.publish(
        &bus::system_topic(&record.uid),
        Event::SystemUpdated { uid: record.uid.clone(), record: record.clone() },
    );

    let codec = IdCodec::process();
    Ok(Json(serde_json::to_value(FeatureResponse::from_entry(codec, key, record))
        .unwrap_or(serde_json::Value::Null)))
}

pub async fn delete_system(
    State(state): State<AppState>,
    Path(ext_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let id = decode_id(&ext_id).map_err(err)?;
    let uid = state
        .db
        .systems
        .current_version(id)
        .map_err(err)?
        .map(|(_, r)| r.uid);
    let removed = state
        .db
        .remove_systems(&SystemFilter::new().with_internal_ids([id]))
        .map_err(err)?;
    if removed == 0 {
        return Err(err(StoreError::NotFound));
    }
    if let Some(uid) = uid {
        state.bus.publish(bus::REGISTRY_TOPIC, Event::SystemRemoved { uid });
    }
    Ok(StatusCode::NO_CONTENT)
}

// ── nested collections ──

async fn require_system(state: &AppState, ext_id: &str) -> Result<i64, (StatusCode, String)> {
    let id = decode_id(ext_id).map_err(err)?;
    state
        .db
        .systems
        .current_version(id)
        .map_err(err)?
        .ok_or_else(|| err(StoreError::NotFound))?;
    Ok(id)
}

pub async fn list_system_datastreams(
    State(state): State<AppState>,
    Path(ext_id): Path<String>,
    Query(raw): Query<RawQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let system_id = require_system(&state, &ext_id).await?;
    let params = CommonParams::parse(&raw).map_err(err)?;
    let filter = datastreams::build_filter(&params)
        .with_systems([system_id])
        .with_limit(params.scan_limit());
    let items = datastreams::render(&state, &filter, &params).map_err(err)?;
    let base = format!("/api/v1/systems/{ext_id}/datastreams");
    Ok(Json(page_response(items, &params, &base)))
}

pub async fn create_system_datastream(
    State(state): State<AppState>,
    Path(ext_id): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let system_id = require_system(&state, &ext_id).await?;
    require_json(&headers)?;
    datastreams::register(&state, system_id, &body).await
}

pub async fn list_system_observations(
    State(state): State<AppState>,
    Path(ext_id): Path<String>,
    Query(raw): Query<RawQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let system_id = require_system(&state, &ext_id).await?;
    let params = CommonParams::parse(&raw).map_err(err)?;
    let base = observations::build_filter(&params);
    let scoped = ObsFilter::new()
        .with_datastreams(DataStreamFilter::new().with_systems([system_id]));

    // An unsatisfiable combination is an empty page, not an error.
    let filter = match base.intersect(&scoped, chrono::Utc::now().timestamp_millis()) {
        Ok(filter) => filter.with_limit(params.scan_limit()),
        Err(_) => {
            return Ok(Json(page_response(Vec::new(), &params, "")));
        }
    };
    let rows = state
        .db
        .select_observations(&filter, ObsOrder::TimeAscending)
        .map_err(err)?;
    let items = observations::render(rows, &params);
    let base_path = format!("/api/v1/systems/{ext_id}/observations");
    Ok(Json(page_response(items, &params, &base_path)))
}
