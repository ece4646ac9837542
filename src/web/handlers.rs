//! HTTP request handlers.

use super::{ApiError, AppState};
use crate::ads::AmsNetId;
use crate::db::{
    Alert, DataType, HistoryRow, Ipc, NewTag, PlcTag, Severity, Site, SiteStatus, TagPersistence,
    DEFAULT_AMS_PORT,
};
use crate::scheduler::MIN_POLL_INTERVAL_MS;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// A tag is stale once its last read is older than this many intervals.
const STALE_AFTER_INTERVALS: f64 = 3.0;

// ============================================================================
// API: PLC tags
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteFilter {
    pub site_id: Option<i64>,
}

/// A tag plus how fresh its last value is.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TagView {
    #[serde(flatten)]
    pub tag: PlcTag,
    pub age_seconds: Option<f64>,
    pub stale: bool,
}

impl TagView {
    pub fn new(tag: PlcTag, now: DateTime<Utc>) -> Self {
        let age_seconds = tag
            .last_read_time
            .map(|t| (now - t).num_milliseconds().max(0) as f64 / 1000.0);
        let interval_secs = tag.poll_interval_ms as f64 / 1000.0;
        // Never read counts as stale.
        let stale = age_seconds
            .map(|age| age > STALE_AFTER_INTERVALS * interval_secs)
            .unwrap_or(true);
        Self {
            tag,
            age_seconds,
            stale,
        }
    }
}

pub async fn handle_get_tags(
    State(state): State<AppState>,
    Query(filter): Query<SiteFilter>,
) -> Result<Json<Vec<TagView>>, ApiError> {
    let now = Utc::now();
    let tags = state.store.get_tags(filter.site_id)?;
    Ok(Json(tags.into_iter().map(|t| TagView::new(t, now)).collect()))
}

pub async fn handle_create_tag(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let site_id = body
        .get("siteId")
        .and_then(Value::as_i64)
        .ok_or_else(|| ApiError::BadRequest("siteId is required".to_string()))?;
    let new_tag = parse_tag_row(&body).map_err(ApiError::BadRequest)?;

    let ids = state.store.add_tags(site_id, &[new_tag])?;
    let id = ids
        .first()
        .copied()
        .ok_or_else(|| ApiError::BadRequest("nothing created".to_string()))?;
    let tag = state.store.get_tag(id)?;
    state.scheduler.registry().request_refresh();

    Ok((StatusCode::CREATED, Json(TagView::new(tag, Utc::now()))))
}

pub async fn handle_update_tag(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<Value>,
) -> Result<Json<TagView>, ApiError> {
    let existing = state.store.get_tag(id)?;
    let row = parse_tag_row(&body).map_err(ApiError::BadRequest)?;

    let updated = PlcTag {
        tag_name: row.tag_name,
        plc_address: row.plc_address,
        description: row.description,
        data_type: row.data_type,
        is_active: row.is_active,
        poll_interval_ms: row.poll_interval_ms,
        alarm_on_true: row.alarm_on_true,
        alarm_on_false: row.alarm_on_false,
        severity_level: row.severity_level,
        ..existing
    };
    state.store.update_tag(&updated)?;
    state.scheduler.registry().request_refresh();

    let tag = state.store.get_tag(id)?;
    Ok(Json(TagView::new(tag, Utc::now())))
}

pub async fn handle_delete_tag(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.store.delete_tag(id)?;
    state.scheduler.remove_tag(id).await;
    state.scheduler.registry().request_refresh();
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

pub async fn handle_get_history(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<Vec<HistoryRow>>, ApiError> {
    state.store.get_tag(id)?;
    let rows = state.store.get_history(id, clamp_limit(q.limit))?;
    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkQuery {
    pub site_id: i64,
}

/// Create a batch of tags. The first malformed row rejects the whole batch.
pub async fn handle_bulk_create_tags(
    State(state): State<AppState>,
    Query(q): Query<BulkQuery>,
    Json(rows): Json<Vec<Value>>,
) -> Result<impl IntoResponse, ApiError> {
    let mut tags = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        let tag = parse_tag_row(row).map_err(|message| ApiError::BadRow { row: i + 1, message })?;
        tags.push(tag);
    }

    let ids = state.store.add_tags(q.site_id, &tags)?;
    tracing::info!("Bulk upload created {} tags on site {}", ids.len(), q.site_id);
    state.scheduler.registry().request_refresh();

    Ok((
        StatusCode::CREATED,
        Json(json!({ "created": ids.len(), "ids": ids })),
    ))
}

/// Validate one tag row. Accepts CSV-style strings for flags and numbers.
pub fn parse_tag_row(value: &Value) -> Result<NewTag, String> {
    let row = value
        .as_object()
        .ok_or_else(|| "expected an object".to_string())?;

    let tag_name = required_str(row, "tagName")?;
    let plc_address = required_str(row, "plcAddress")?;
    let data_type: DataType = required_str(row, "dataType")?.parse()?;
    let severity_level: Severity = match optional_str(row, "severityLevel")? {
        Some(s) => s.parse()?,
        None => Severity::Warning,
    };
    let poll_interval_ms = optional_u64(row, "pollIntervalMs")?.unwrap_or(DEFAULT_POLL_INTERVAL_MS);
    if poll_interval_ms < MIN_POLL_INTERVAL_MS {
        return Err(format!(
            "pollIntervalMs must be at least {}",
            MIN_POLL_INTERVAL_MS
        ));
    }

    Ok(NewTag {
        tag_name,
        plc_address,
        description: optional_str(row, "description")?.unwrap_or_default(),
        data_type,
        is_active: optional_bool(row, "isActive")?.unwrap_or(true),
        poll_interval_ms,
        alarm_on_true: optional_bool(row, "alarmOnTrue")?.unwrap_or(false),
        alarm_on_false: optional_bool(row, "alarmOnFalse")?.unwrap_or(false),
        severity_level,
    })
}

/// A field, treating null and blank strings as absent.
fn field<'a>(row: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    match row.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.trim().is_empty() => None,
        Some(v) => Some(v),
    }
}

fn required_str(row: &Map<String, Value>, key: &str) -> Result<String, String> {
    optional_str(row, key)?.ok_or_else(|| format!("{} is required", key))
}

fn optional_str(row: &Map<String, Value>, key: &str) -> Result<Option<String>, String> {
    match field(row, key) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(_) => Err(format!("{} must be a string", key)),
    }
}

fn optional_bool(row: &Map<String, Value>, key: &str) -> Result<Option<bool>, String> {
    match field(row, key) {
        None => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(Value::Number(n)) if n.as_u64() == Some(0) => Ok(Some(false)),
        Some(Value::Number(n)) if n.as_u64() == Some(1) => Ok(Some(true)),
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(Some(true)),
            "false" | "no" | "0" => Ok(Some(false)),
            _ => Err(format!("{} must be true or false", key)),
        },
        Some(_) => Err(format!("{} must be true or false", key)),
    }
}

fn optional_u64(row: &Map<String, Value>, key: &str) -> Result<Option<u64>, String> {
    match field(row, key) {
        None => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| format!("{} must be a positive integer", key)),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| format!("{} must be a positive integer", key)),
        Some(_) => Err(format!("{} must be a positive integer", key)),
    }
}

// ============================================================================
// API: Sites and IPCs
// ============================================================================

pub async fn handle_get_sites(State(state): State<AppState>) -> Result<Json<Vec<Site>>, ApiError> {
    Ok(Json(state.store.get_sites()?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSiteRequest {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub ams_net_id: Option<String>,
    #[serde(default)]
    pub ams_port: Option<u16>,
}

pub async fn handle_create_site(
    State(state): State<AppState>,
    Json(req): Json<CreateSiteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.name.trim().is_empty() || req.address.trim().is_empty() {
        return Err(ApiError::BadRequest("name and address are required".to_string()));
    }
    let ams_net_id = match req.ams_net_id.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(s) => Some(s.parse::<AmsNetId>().map_err(ApiError::BadRequest)?.to_string()),
    };
    let ams_port = req.ams_port.unwrap_or(DEFAULT_AMS_PORT);
    if ams_port == 0 {
        return Err(ApiError::BadRequest("amsPort must be non-zero".to_string()));
    }

    let mut site = Site {
        name: req.name.trim().to_string(),
        address: req.address.trim().to_string(),
        ams_net_id,
        ams_port,
        ..Default::default()
    };
    state.store.add_site(&mut site)?;
    state.scheduler.registry().request_refresh();

    Ok((StatusCode::CREATED, Json(site)))
}

pub async fn handle_delete_site(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.store.delete_site(id)?;
    state.scheduler.registry().request_refresh();
    Ok(StatusCode::NO_CONTENT)
}

pub async fn handle_sync_from_ipc(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let report = state.store.sync_sites_from_ipcs()?;
    tracing::info!(
        "IPC sync: {} sites created, {} removed",
        report.created,
        report.removed
    );
    state.scheduler.registry().request_refresh();
    Ok(Json(report))
}

pub async fn handle_get_ipcs(State(state): State<AppState>) -> Result<Json<Vec<Ipc>>, ApiError> {
    Ok(Json(state.store.get_ipcs()?))
}

pub async fn handle_create_ipc(
    State(state): State<AppState>,
    Json(mut ipc): Json<Ipc>,
) -> Result<impl IntoResponse, ApiError> {
    if ipc.name.trim().is_empty() || ipc.address.trim().is_empty() || ipc.site_name.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "name, address and siteName are required".to_string(),
        ));
    }
    ipc.ams_net_id = ipc
        .ams_net_id
        .parse::<AmsNetId>()
        .map_err(ApiError::BadRequest)?
        .to_string();
    state.store.add_ipc(&mut ipc)?;
    Ok((StatusCode::CREATED, Json(ipc)))
}

pub async fn handle_delete_ipc(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.store.delete_ipc(id)?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// API: Alerts
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AlertQuery {
    #[serde(default)]
    pub unresolved: bool,
    pub limit: Option<i64>,
}

pub async fn handle_get_alerts(
    State(state): State<AppState>,
    Query(q): Query<AlertQuery>,
) -> Result<Json<Vec<Alert>>, ApiError> {
    Ok(Json(state.store.get_alerts(q.unresolved, clamp_limit(q.limit))?))
}

pub async fn handle_mark_alert_read(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.store.mark_alert_read(id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Resolve an alert by hand. Resolving twice is a no-op.
pub async fn handle_resolve_alert(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Alert>, ApiError> {
    let alert = state.store.get_alert(id)?;
    if !alert.is_resolved {
        state.store.resolve_alert(id, Utc::now())?;
    }
    Ok(Json(state.store.get_alert(id)?))
}

fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(100).clamp(1, 1000)
}

// ============================================================================
// Health
// ============================================================================

pub async fn handle_healthz(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.scheduler.registry().snapshot();
    let health = state.scheduler.health();
    let offline = snapshot
        .active_tags_by_site()
        .keys()
        .filter(|id| health.status(**id) == Some(SiteStatus::Offline))
        .count();
    Json(json!({
        "status": "ok",
        "tags": snapshot.tag_count(),
        "sitesOffline": offline,
        "registryLoadedAt": snapshot.loaded_at(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn test_parse_tag_row_defaults() {
        let row = json!({
            "tagName": "Pump1",
            "plcAddress": "MAIN.bPump1",
            "dataType": "bool",
            "alarmOnTrue": "yes",
        });
        let tag = parse_tag_row(&row).unwrap();
        assert_eq!(tag.data_type, DataType::Bool);
        assert!(tag.alarm_on_true);
        assert!(!tag.alarm_on_false);
        assert!(tag.is_active);
        assert_eq!(tag.poll_interval_ms, 1000);
        assert_eq!(tag.severity_level, Severity::Warning);
    }

    #[test]
    fn test_parse_tag_row_rejects_bad_rows() {
        let missing = json!({ "plcAddress": "MAIN.x", "dataType": "INT" });
        assert_eq!(parse_tag_row(&missing).unwrap_err(), "tagName is required");

        let bad_type = json!({ "tagName": "x", "plcAddress": "MAIN.x", "dataType": "WORD" });
        assert!(parse_tag_row(&bad_type).is_err());

        let fast = json!({ "tagName": "x", "plcAddress": "MAIN.x", "dataType": "INT", "pollIntervalMs": 10 });
        assert!(parse_tag_row(&fast).is_err());

        let flag = json!({ "tagName": "x", "plcAddress": "MAIN.x", "dataType": "INT", "alarmOnTrue": "maybe" });
        assert!(parse_tag_row(&flag).is_err());

        assert!(parse_tag_row(&json!(["T1", "MAIN.x"])).is_err());
    }

    #[test]
    fn test_tag_view_staleness() {
        let now = Utc::now();
        let mut tag = PlcTag {
            id: 1,
            site_id: 1,
            tag_name: "T1".to_string(),
            plc_address: "MAIN.x".to_string(),
            description: String::new(),
            data_type: DataType::Int,
            is_active: true,
            poll_interval_ms: 1000,
            alarm_on_true: false,
            alarm_on_false: false,
            severity_level: Severity::Info,
            last_value: Some("1".to_string()),
            last_read_time: None,
        };
        assert!(TagView::new(tag.clone(), now).stale);

        tag.last_read_time = Some(now - Duration::seconds(2));
        let view = TagView::new(tag.clone(), now);
        assert!(!view.stale);
        assert_eq!(view.age_seconds, Some(2.0));

        tag.last_read_time = Some(now - Duration::seconds(4));
        assert!(TagView::new(tag, now).stale);
    }
}
