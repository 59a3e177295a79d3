use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::AppError;
use crate::state::AppState;
use vodsync_collector::health::{circuit_state, CircuitState};
use vodsync_collector::orchestrator::TaskConfig;
use vodsync_collector::validator;
use vodsync_core::error::ApiError;
use vodsync_core::types::{ErrorClass, Reporter, TaskMode};
use vodsync_db::repo::{cache, catalog, health, logs, schedules, sources, tasks};

const PER_PAGE: i64 = 20;
const LIST_CACHE_TTL_SECS: i64 = 600;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", api_router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn api_router() -> Router<AppState> {
    Router::new()
        // Collection tasks
        .route("/collect", post(start_collect))
        .route("/tasks", get(list_tasks))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/cancel", post(cancel_task))
        .route("/tasks/{id}/pause", post(pause_task))
        .route("/tasks/{id}/resume", post(resume_task))
        // Sources
        .route("/sources", post(create_source).get(list_sources))
        .route(
            "/sources/{id}",
            axum::routing::delete(delete_source).patch(update_source),
        )
        .route("/sources/health", get(sources_health))
        // Reports
        .route("/reports/invalid-url", post(report_invalid_url))
        // Catalog
        .route("/vods", get(list_vods))
        .route("/vods/{id}", get(get_vod))
        .route("/search", get(search_vods))
        // Scheduler
        .route("/jobs", get(list_jobs))
        .route("/jobs/{name}", patch(patch_job))
        .route("/jobs/{name}/run", post(run_job))
        .route("/jobs/{name}/reset", post(reset_job))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

async fn health_check(State(state): State<AppState>) -> Result<Json<HealthResponse>, AppError> {
    sqlx::query("SELECT 1")
        .execute(&state.db)
        .await
        .map_err(|e| ApiError::Internal(format!("database check failed: {e}")))?;

    Ok(Json(HealthResponse {
        status: "ok".to_string(),
    }))
}

// ---------------------------------------------------------------------------
// Collection tasks
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CollectRequest {
    mode: String,
    #[serde(default)]
    source_id: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    max_pages: Option<u32>,
    #[serde(default)]
    max_items: Option<i64>,
}

#[derive(Serialize)]
struct CollectResponse {
    task_id: String,
}

async fn start_collect(
    State(state): State<AppState>,
    Json(body): Json<CollectRequest>,
) -> Result<(StatusCode, Json<CollectResponse>), AppError> {
    let mode = TaskMode::parse(&body.mode)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown mode: {}", body.mode)))?;
    if mode == TaskMode::Category && body.category.as_deref().map_or(true, str::is_empty) {
        return Err(ApiError::BadRequest("category mode requires a category".into()).into());
    }
    if mode == TaskMode::Source && body.source_id.is_none() {
        return Err(ApiError::BadRequest("source mode requires a source_id".into()).into());
    }

    let active = sources::list_active(&state.db)
        .await
        .map_err(|e| ApiError::Internal(format!("db error: {e}")))?;
    if active.is_empty() {
        return Err(ApiError::BadRequest("no active sources configured".into()).into());
    }
    if let Some(sid) = &body.source_id {
        if !active.iter().any(|s| &s.id == sid) {
            return Err(ApiError::BadRequest(format!("source not active: {sid}")).into());
        }
    }

    let config = TaskConfig {
        source_id: body.source_id,
        category: body.category,
        max_pages: body.max_pages,
        max_items: body.max_items,
    };
    let config_json = serde_json::to_string(&config)
        .map_err(|e| ApiError::Internal(format!("config encode failed: {e}")))?;

    let task = tasks::create(&state.db, mode.as_str(), &config_json)
        .await
        .map_err(|e| ApiError::Internal(format!("db error: {e}")))?;

    crate::runner::spawn_collect(state.db.clone(), state.spider.clone(), task.id.clone());

    Ok((
        StatusCode::ACCEPTED,
        Json(CollectResponse { task_id: task.id }),
    ))
}

#[derive(Serialize)]
struct TaskResponse {
    id: String,
    mode: String,
    status: String,
    processed: i64,
    new_items: i64,
    updated_items: i64,
    skipped: i64,
    errors: i64,
    checkpoint: Option<Value>,
    error: Option<String>,
    created_ts: i64,
    started_ts: Option<i64>,
    finished_ts: Option<i64>,
}

fn task_response(t: tasks::TaskRow) -> TaskResponse {
    let checkpoint = t
        .checkpoint
        .as_deref()
        .and_then(|c| serde_json::from_str(c).ok());
    TaskResponse {
        id: t.id,
        mode: t.mode,
        status: t.status,
        processed: t.processed,
        new_items: t.new_items,
        updated_items: t.updated_items,
        skipped: t.skipped,
        errors: t.errors,
        checkpoint,
        error: t.error,
        created_ts: t.created_ts,
        started_ts: t.started_ts,
        finished_ts: t.finished_ts,
    }
}

#[derive(Deserialize)]
struct PageQuery {
    #[serde(default = "default_page")]
    page: i64,
}

fn default_page() -> i64 {
    1
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(q): Query<PageQuery>,
) -> Result<Json<Value>, AppError> {
    let rows = tasks::list(&state.db, q.page, PER_PAGE)
        .await
        .map_err(|e| ApiError::Internal(format!("db error: {e}")))?;
    let items: Vec<TaskResponse> = rows.into_iter().map(task_response).collect();
    Ok(Json(json!({ "items": items, "page": q.page })))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let task = tasks::get(&state.db, &id)
        .await
        .map_err(|e| ApiError::Internal(format!("db error: {e}")))?
        .ok_or_else(|| ApiError::NotFound(format!("task not found: {id}")))?;
    let log_rows = logs::list_for_task(&state.db, &id, 100)
        .await
        .map_err(|e| ApiError::Internal(format!("db error: {e}")))?;
    let log_items: Vec<Value> = log_rows
        .into_iter()
        .map(|l| {
            json!({
                "level": l.level,
                "source_id": l.source_id,
                "action": l.action,
                "message": l.message,
                "created_ts": l.created_ts,
            })
        })
        .collect();
    Ok(Json(json!({
        "task": task_response(task),
        "logs": log_items,
    })))
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    signal_task(&state, &id, "cancelled", tasks::request_cancel(&state.db, &id).await).await
}

async fn pause_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    signal_task(&state, &id, "paused", tasks::request_pause(&state.db, &id).await).await
}

async fn resume_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let applied = tasks::request_resume(&state.db, &id).await;
    let response = signal_task(&state, &id, "pending", applied).await?;
    // A resumed task goes straight back to a runner.
    crate::runner::spawn_collect(state.db.clone(), state.spider.clone(), id);
    Ok(response)
}

async fn signal_task(
    state: &AppState,
    id: &str,
    new_status: &str,
    applied: Result<bool, sqlx::Error>,
) -> Result<Json<Value>, AppError> {
    let applied = applied.map_err(|e| ApiError::Internal(format!("db error: {e}")))?;
    if applied {
        return Ok(Json(json!({ "status": new_status })));
    }
    let exists = tasks::get(&state.db, id)
        .await
        .map_err(|e| ApiError::Internal(format!("db error: {e}")))?
        .is_some();
    if exists {
        Err(ApiError::Conflict(format!("task state does not allow {new_status}")).into())
    } else {
        Err(ApiError::NotFound(format!("task not found: {id}")).into())
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CreateSourceRequest {
    name: String,
    base_url: String,
    #[serde(default = "default_weight")]
    weight: i64,
}

fn default_weight() -> i64 {
    50
}

#[derive(Serialize)]
struct SourceResponse {
    id: String,
    name: String,
    base_url: String,
    weight: i64,
    active: bool,
    created_ts: i64,
    updated_ts: i64,
}

fn source_response(s: sources::SourceRow) -> SourceResponse {
    SourceResponse {
        id: s.id,
        name: s.name,
        base_url: s.base_url,
        weight: s.weight,
        active: s.active,
        created_ts: s.created_ts,
        updated_ts: s.updated_ts,
    }
}

fn validate_base_url(raw: &str) -> Result<(), AppError> {
    let uri: axum::http::Uri = raw
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid base_url: {raw}")))?;
    match uri.scheme_str() {
        Some("http") | Some("https") => Ok(()),
        _ => Err(ApiError::BadRequest("base_url must be http or https".into()).into()),
    }
}

async fn create_source(
    State(state): State<AppState>,
    Json(body): Json<CreateSourceRequest>,
) -> Result<(StatusCode, Json<SourceResponse>), AppError> {
    if body.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name must not be empty".into()).into());
    }
    validate_base_url(&body.base_url)?;

    let source = sources::create(&state.db, body.name.trim(), &body.base_url, body.weight)
        .await
        .map_err(|e| ApiError::Internal(format!("db error: {e}")))?;
    Ok((StatusCode::CREATED, Json(source_response(source))))
}

async fn list_sources(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let rows = sources::list_all(&state.db)
        .await
        .map_err(|e| ApiError::Internal(format!("db error: {e}")))?;
    let items: Vec<SourceResponse> = rows.into_iter().map(source_response).collect();
    Ok(Json(json!({ "items": items })))
}

#[derive(Deserialize)]
struct UpdateSourceRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    weight: Option<i64>,
    #[serde(default)]
    active: Option<bool>,
}

async fn update_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateSourceRequest>,
) -> Result<Json<SourceResponse>, AppError> {
    if let Some(url) = &body.base_url {
        validate_base_url(url)?;
    }
    let updated = sources::update(
        &state.db,
        &id,
        body.name.as_deref(),
        body.base_url.as_deref(),
        body.weight,
        body.active,
    )
    .await
    .map_err(|e| ApiError::Internal(format!("db error: {e}")))?;
    if !updated {
        return Err(ApiError::NotFound(format!("source not found: {id}")).into());
    }
    let source = sources::get(&state.db, &id)
        .await
        .map_err(|e| ApiError::Internal(format!("db error: {e}")))?
        .ok_or_else(|| ApiError::NotFound(format!("source not found: {id}")))?;
    Ok(Json(source_response(source)))
}

async fn delete_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let deleted = sources::delete(&state.db, &id)
        .await
        .map_err(|e| ApiError::Internal(format!("db error: {e}")))?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("source not found: {id}")).into())
    }
}

fn circuit_label(state: CircuitState) -> &'static str {
    match state {
        CircuitState::Closed => "closed",
        CircuitState::Open => "open",
        CircuitState::HalfOpen => "half_open",
    }
}

async fn sources_health(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let rows = sources::list_all(&state.db)
        .await
        .map_err(|e| ApiError::Internal(format!("db error: {e}")))?;
    let mut items = Vec::with_capacity(rows.len());
    for source in rows {
        let h = health::get(&state.db, &source.id)
            .await
            .map_err(|e| ApiError::Internal(format!("db error: {e}")))?;
        items.push(json!({
            "source_id": source.id,
            "name": source.name,
            "active": source.active,
            "status": h.status,
            "latency_ms": h.latency_ms,
            "success_rate": h.success_rate,
            "consecutive_failures": h.consecutive_failures,
            "circuit": circuit_label(circuit_state(&h)),
            "probed_ts": h.probed_ts,
        }));
    }
    Ok(Json(json!({ "items": items })))
}

// ---------------------------------------------------------------------------
// Invalid-URL reports
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct InvalidUrlReport {
    vod_id: String,
    url: String,
    error_class: String,
}

async fn report_invalid_url(
    State(state): State<AppState>,
    Json(body): Json<InvalidUrlReport>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let class = ErrorClass::parse(&body.error_class)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown error_class: {}", body.error_class)))?;
    let exists = catalog::get(&state.db, &body.vod_id)
        .await
        .map_err(|e| ApiError::Internal(format!("db error: {e}")))?
        .is_some();
    if !exists {
        return Err(ApiError::NotFound(format!("vod not found: {}", body.vod_id)).into());
    }

    validator::report_invalid_url(&state.db, &body.vod_id, &body.url, class, Reporter::User)
        .await
        .map_err(|e| ApiError::Internal(format!("report failed: {e}")))?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "recorded" }))))
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// Cache key for one page of the public list endpoint. Shared with the
/// warmup job so pre-filled entries actually get hit.
pub fn list_cache_key(
    category: Option<&str>,
    year: Option<i64>,
    region: Option<&str>,
    page: i64,
) -> String {
    format!(
        "list:{}:{}:{}:p{page}",
        category.unwrap_or("-"),
        year.map(|y| y.to_string()).unwrap_or_else(|| "-".into()),
        region.unwrap_or("-"),
    )
}

/// The JSON body served for a list page; also what the warmup job caches.
pub fn vod_list_payload(rows: &[catalog::VodRow]) -> Value {
    let items: Vec<Value> = rows
        .iter()
        .map(|r| {
            json!({
                "id": r.id,
                "title": r.title,
                "category": r.category,
                "year": r.year,
                "region": r.region,
                "remark": r.remark,
                "rating": r.rating,
                "quality_score": r.quality_score,
                "is_valid": r.is_valid != 0,
                "updated_ts": r.updated_ts,
            })
        })
        .collect();
    json!({ "items": items })
}

fn vod_detail(r: &catalog::VodRow) -> Value {
    let play = r.play_index();
    let groups: Vec<Value> = play
        .groups
        .iter()
        .map(|g| {
            json!({
                "label": g.label,
                "episodes": g.episodes.iter().map(|e| {
                    json!({ "label": e.label, "url": e.url })
                }).collect::<Vec<Value>>(),
            })
        })
        .collect();
    json!({
        "id": r.id,
        "title": r.title,
        "category": r.category,
        "year": r.year,
        "region": r.region,
        "genres": r.genres_vec(),
        "cast": r.cast_vec(),
        "synopsis": r.synopsis,
        "remark": r.remark,
        "rating": r.rating,
        "quality_score": r.quality_score,
        "is_valid": r.is_valid != 0,
        "play_groups": groups,
        "last_checked_ts": r.last_checked_ts,
        "created_ts": r.created_ts,
        "updated_ts": r.updated_ts,
    })
}

async fn get_vod(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let row = catalog::get(&state.db, &id)
        .await
        .map_err(|e| ApiError::Internal(format!("db error: {e}")))?
        .ok_or_else(|| ApiError::NotFound(format!("vod not found: {id}")))?;
    Ok(Json(vod_detail(&row)))
}

#[derive(Deserialize)]
struct ListVodsQuery {
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    year: Option<i64>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default = "default_page")]
    page: i64,
}

async fn list_vods(
    State(state): State<AppState>,
    Query(q): Query<ListVodsQuery>,
) -> Result<Json<Value>, AppError> {
    let key = list_cache_key(q.category.as_deref(), q.year, q.region.as_deref(), q.page);
    if let Some(cached) = cache::get(&state.db, &key)
        .await
        .map_err(|e| ApiError::Internal(format!("db error: {e}")))?
    {
        if let Ok(payload) = serde_json::from_str::<Value>(&cached) {
            return Ok(Json(payload));
        }
    }

    let rows = catalog::list(
        &state.db,
        q.category.as_deref(),
        q.year,
        q.region.as_deref(),
        q.page,
        PER_PAGE,
    )
    .await
    .map_err(|e| ApiError::Internal(format!("db error: {e}")))?;

    let payload = vod_list_payload(&rows);
    if !rows.is_empty() {
        cache::put(&state.db, &key, &payload.to_string(), LIST_CACHE_TTL_SECS)
            .await
            .map_err(|e| ApiError::Internal(format!("db error: {e}")))?;
    }
    Ok(Json(payload))
}

#[derive(Deserialize)]
struct SearchQuery {
    q: String,
    #[serde(default = "default_page")]
    page: i64,
}

async fn search_vods(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Value>, AppError> {
    let term = query.q.trim();
    if term.is_empty() {
        return Err(ApiError::BadRequest("search term must not be empty".into()).into());
    }
    let rows = catalog::search(&state.db, term, query.page, PER_PAGE)
        .await
        .map_err(|e| ApiError::Internal(format!("db error: {e}")))?;
    Ok(Json(vod_list_payload(&rows)))
}

// ---------------------------------------------------------------------------
// Scheduler jobs
// ---------------------------------------------------------------------------

async fn job_response(state: &AppState, row: schedules::ScheduleRow) -> Result<Value, AppError> {
    let runs = schedules::recent_runs(&state.db, &row.name, 5)
        .await
        .map_err(|e| ApiError::Internal(format!("db error: {e}")))?;
    let run_items: Vec<Value> = runs
        .into_iter()
        .map(|r| {
            json!({
                "status": r.status,
                "duration_ms": r.duration_ms,
                "message": r.message,
                "started_ts": r.started_ts,
            })
        })
        .collect();
    Ok(json!({
        "name": row.name,
        "cadence": row.cadence,
        "builtin": row.builtin,
        "enabled": row.enabled,
        "updated_ts": row.updated_ts,
        "recent_runs": run_items,
    }))
}

async fn list_jobs(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let rows = schedules::list(&state.db)
        .await
        .map_err(|e| ApiError::Internal(format!("db error: {e}")))?;
    let mut items = Vec::with_capacity(rows.len());
    for row in rows {
        items.push(job_response(&state, row).await?);
    }
    Ok(Json(json!({ "items": items })))
}

#[derive(Deserialize)]
struct PatchJobRequest {
    #[serde(default)]
    cadence: Option<String>,
    #[serde(default)]
    enabled: Option<bool>,
}

async fn patch_job(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<PatchJobRequest>,
) -> Result<Json<Value>, AppError> {
    let row = schedules::get(&state.db, &name)
        .await
        .map_err(|e| ApiError::Internal(format!("db error: {e}")))?
        .ok_or_else(|| ApiError::NotFound(format!("job not found: {name}")))?;

    if let Some(cadence) = &body.cadence {
        if !crate::scheduler::is_valid_cadence(cadence) {
            return Err(ApiError::BadRequest(format!("invalid cron cadence: {cadence}")).into());
        }
        schedules::set_cadence(&state.db, &row.name, cadence)
            .await
            .map_err(|e| ApiError::Internal(format!("db error: {e}")))?;
    }
    if let Some(enabled) = body.enabled {
        schedules::set_enabled(&state.db, &row.name, enabled)
            .await
            .map_err(|e| ApiError::Internal(format!("db error: {e}")))?;
    }

    state
        .scheduler
        .reload(&row.name)
        .await
        .map_err(|e| ApiError::Internal(format!("scheduler reload failed: {e}")))?;

    let updated = schedules::get(&state.db, &name)
        .await
        .map_err(|e| ApiError::Internal(format!("db error: {e}")))?
        .ok_or_else(|| ApiError::NotFound(format!("job not found: {name}")))?;
    Ok(Json(job_response(&state, updated).await?))
}

async fn run_job(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let row = schedules::get(&state.db, &name)
        .await
        .map_err(|e| ApiError::Internal(format!("db error: {e}")))?
        .ok_or_else(|| ApiError::NotFound(format!("job not found: {name}")))?;

    state.scheduler.trigger(&row.name);
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "started" }))))
}

async fn reset_job(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, AppError> {
    let default = crate::scheduler::default_cadence(&name)
        .ok_or_else(|| ApiError::NotFound(format!("job not found: {name}")))?;

    schedules::set_cadence(&state.db, &name, default)
        .await
        .map_err(|e| ApiError::Internal(format!("db error: {e}")))?;
    schedules::set_enabled(&state.db, &name, true)
        .await
        .map_err(|e| ApiError::Internal(format!("db error: {e}")))?;
    state
        .scheduler
        .reload(&name)
        .await
        .map_err(|e| ApiError::Internal(format!("scheduler reload failed: {e}")))?;

    let row = schedules::get(&state.db, &name)
        .await
        .map_err(|e| ApiError::Internal(format!("db error: {e}")))?
        .ok_or_else(|| ApiError::NotFound(format!("job not found: {name}")))?;
    Ok(Json(job_response(&state, row).await?))
}
