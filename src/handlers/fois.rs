use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};

use crate::AppState;
use crate::error::StoreError;
use crate::filter::{FoiFilter, TemporalFilter};
use crate::handlers::resource::*;
use crate::handlers::systems::parse_one_or_many;
use crate::ids::IdCodec;
use crate::models::feature::{CreateFeatureRequest, FeatureResponse};

fn build_filter(params: &CommonParams) -> FoiFilter {
    let mut filter = FoiFilter::new();
    if !params.uids.is_empty() {
        filter = filter.with_unique_ids(params.uids.iter().cloned());
    }
    filter.valid_time = params
        .valid_time
        .clone()
        .unwrap_or(TemporalFilter::LatestVersion);
    filter.spatial = params.spatial.clone();
    filter.feature_type = params.feature_type.clone();
    filter.props = params.props.clone();
    filter
}

pub async fn list_fois(
    State(state): State<AppState>,
    Query(raw): Query<RawQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let params = CommonParams::parse(&raw).map_err(err)?;
    let filter = build_filter(&params).with_limit(params.scan_limit());

    let codec = IdCodec::process();
    let rows = state.db.select_fois(&filter).map_err(err)?;
    let items = rows
        .into_iter()
        .map(|(key, record)| {
            let mut item = serde_json::to_value(FeatureResponse::from_entry(codec, key, record))
                .unwrap_or(serde_json::Value::Null);
            apply_select(&mut item, &params.select);
            item
        })
        .collect();
    Ok(Json(page_response(items, &params, "/api/v1/fois")))
}

pub async fn count_fois(
    State(state): State<AppState>,
    Query(raw): Query<RawQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let params = CommonParams::parse(&raw).map_err(err)?;
    let count = state.db.fois.count_matching(&build_filter(&params)).map_err(err)?;
    Ok(Json(serde_json::json!({ "count": count })))
}

pub async fn create_fois(
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
        let key = state.db.fois.add(&record, valid_time_ms).map_err(err)?;
        created.push(format!("/api/v1/fois/{}", codec.encode(key.id)));
    }
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "created": created }))))
}

pub async fn get_foi(
    State(state): State<AppState>,
    Path(ext_id): Path<String>,
    Query(raw): Query<RawQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let params = CommonParams::parse(&raw).map_err(err)?;
    let id = decode_id(&ext_id).map_err(err)?;
    let (key, record) = state
        .db
        .fois
        .current_version(id)
        .map_err(err)?
        .ok_or_else(|| err(StoreError::NotFound))?;
    let mut item = serde_json::to_value(FeatureResponse::from_entry(IdCodec::process(), key, record))
        .unwrap_or(serde_json::Value::Null);
    apply_select(&mut item, &params.select);
    Ok(Json(item))
}

pub async fn update_foi(
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
        .fois
        .current_version_key(id)
        .map_err(err)?
        .ok_or_else(|| err(StoreError::NotFound))?;
    state.db.fois.put(key, &record).map_err(err)?;
    Ok(Json(serde_json::to_value(FeatureResponse::from_entry(IdCodec::process(), key, record))
        .unwrap_or(serde_json::Value::Null)))
}

pub async fn delete_foi(
    State(state): State<AppState>,
    Path(ext_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let id = decode_id(&ext_id).map_err(err)?;
    let removed = state
        .db
        .fois
        .remove_entries(&FoiFilter::new().with_internal_ids([id]))
        .map_err(err)?;
    if removed == 0 {
        return Err(err(StoreError::NotFound));
    }
    Ok(StatusCode::NO_CONTENT)
}
