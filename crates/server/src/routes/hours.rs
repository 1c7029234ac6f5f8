//! Work-hour entries.
//!
//! Every write here runs in one transaction together with
//! [`aggregation::recompute_task_hours`], so a task's real hours and its
//! project's real cost are never observed stale after the request returns.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{
    db::models::WorkHourEntry,
    error::{AppError, Result, ValidationErrors},
    middleware::auth::AuthUser,
    routes::{ensure_exists, nullable, today, ApiJson, ApiQuery, Table},
    services::{
        access::{self, Capability, Target},
        aggregation::{self, round_hours},
        filters::{fetch_page, HourFilter, Page, Pagination},
        validation,
    },
    AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_hours).post(create_hours))
        .route("/mine", get(my_hours))
        .route(
            "/:id",
            get(get_hours).patch(update_hours).delete(delete_hours),
        )
        .route("/:id/validate", post(validate_hours))
}

#[derive(Debug, Deserialize)]
pub struct LogHoursRequest {
    pub member_id: Option<String>,
    pub date: Option<NaiveDate>,
    pub hours: f64,
    #[serde(default)]
    pub description: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateHoursRequest {
    pub task_id: String,
    #[serde(flatten)]
    pub entry: LogHoursRequest,
}

#[derive(Debug, Deserialize)]
pub struct UpdateHoursRequest {
    pub task_id: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub member_id: Option<Option<String>>,
    pub date: Option<NaiveDate>,
    pub hours: Option<f64>,
    pub description: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub latitude: Option<Option<f64>>,
    #[serde(default, deserialize_with = "nullable")]
    pub longitude: Option<Option<f64>>,
}

#[derive(Debug, Serialize)]
pub struct HourResponse {
    #[serde(flatten)]
    pub entry: WorkHourEntry,
    pub member_name: Option<String>,
    pub task_real_hours: f64,
}

#[derive(Debug, Serialize)]
pub struct MonthlyHours {
    pub month: String,
    pub total_hours: f64,
    pub entries: Vec<HourResponse>,
}

pub(crate) async fn hour_response(pool: &SqlitePool, entry: WorkHourEntry) -> Result<HourResponse> {
    let member_name = match &entry.member_id {
        Some(member_id) => sqlx::query_scalar::<_, String>(
            "SELECT first_name || ' ' || last_name FROM members WHERE id = ?",
        )
        .bind(member_id)
        .fetch_optional(pool)
        .await?,
        None => None,
    };
    let task_real_hours = sqlx::query_scalar::<_, f64>("SELECT real_hours FROM tasks WHERE id = ?")
        .bind(&entry.task_id)
        .fetch_optional(pool)
        .await?
        .unwrap_or_default();

    Ok(HourResponse {
        entry,
        member_name,
        task_real_hours,
    })
}

async fn load_entry(pool: &SqlitePool, id: &str) -> Result<WorkHourEntry> {
    sqlx::query_as::<_, WorkHourEntry>("SELECT * FROM work_hours WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound("Work hour entry not found".to_string()))
}

fn validate_entry(entry: &WorkHourEntry) -> ValidationErrors {
    let mut errors = ValidationErrors::new();
    validation::work_hours(&mut errors, "hours", entry.hours);
    validation::max_length(&mut errors, "description", &entry.description, 255);
    validation::coordinates(&mut errors, entry.latitude, entry.longitude);
    errors
}

async fn member_of(pool: &SqlitePool, user_id: &str) -> Result<Option<String>> {
    let id = sqlx::query_scalar::<_, String>("SELECT id FROM members WHERE user_id = ?")
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    Ok(id)
}

/// Records an entry under a task and rolls it up to the task and project.
pub(crate) async fn log_hours(
    state: &AppState,
    user: &AuthUser,
    task_id: &str,
    body: LogHoursRequest,
) -> Result<HourResponse> {
    let pool = &state.db.pool;
    ensure_exists(pool, Table::Tasks, task_id).await?;
    access::authorize(pool, &user.principal(), Capability::FieldWrite, Target::Task(task_id)).await?;

    let member_id = match body.member_id {
        Some(member_id) => Some(member_id),
        None => member_of(pool, &user.id).await?,
    };

    let now = Utc::now();
    let entry = WorkHourEntry {
        id: Uuid::new_v4().to_string(),
        task_id: task_id.to_string(),
        member_id,
        date: body.date.unwrap_or_else(today),
        hours: body.hours,
        description: body.description,
        latitude: body.latitude,
        longitude: body.longitude,
        validated: false,
        validated_by: None,
        created_at: now,
        updated_at: now,
    };
    validate_entry(&entry).into_result()?;
    if let Some(member_id) = &entry.member_id {
        ensure_exists(pool, Table::Members, member_id).await?;
    }

    let mut tx = pool.begin().await?;
    sqlx::query(
        r#"
        INSERT INTO work_hours (id, task_id, member_id, date, hours, description, latitude,
                                longitude, validated, validated_by, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, NULL, ?, ?)
        "#,
    )
    .bind(&entry.id)
    .bind(&entry.task_id)
    .bind(&entry.member_id)
    .bind(entry.date)
    .bind(entry.hours)
    .bind(&entry.description)
    .bind(entry.latitude)
    .bind(entry.longitude)
    .bind(entry.created_at)
    .bind(entry.updated_at)
    .execute(&mut *tx)
    .await?;
    let recomputed = aggregation::recompute_task_hours(&mut tx, task_id).await?;
    tx.commit().await?;

    tracing::info!(
        entry_id = %entry.id,
        task_id,
        hours = entry.hours,
        task_real_hours = recomputed.task_real_hours,
        "hours logged"
    );

    hour_response(pool, entry).await
}

async fn list_hours(
    State(state): State<AppState>,
    _user: AuthUser,
    ApiQuery(filter): ApiQuery<HourFilter>,
) -> Result<Json<Page<HourResponse>>> {
    let pool = &state.db.pool;
    let order = filter.order();
    let page = fetch_page::<WorkHourEntry, _>(
        pool,
        HourFilter::SELECT,
        HourFilter::COUNT,
        |qb| filter.push_conditions(qb),
        &order,
        Pagination::new(filter.page, state.config.page_size),
    )
    .await?;

    let mut results = Vec::with_capacity(page.results.len());
    for entry in page.results {
        results.push(hour_response(pool, entry).await?);
    }
    Ok(Json(Page {
        count: page.count,
        page: page.page,
        page_size: page.page_size,
        results,
    }))
}

async fn create_hours(
    State(state): State<AppState>,
    user: AuthUser,
    ApiJson(body): ApiJson<CreateHoursRequest>,
) -> Result<(StatusCode, Json<HourResponse>)> {
    let response = log_hours(&state, &user, &body.task_id, body.entry).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

async fn get_hours(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<HourResponse>> {
    let pool = &state.db.pool;
    let entry = load_entry(pool, &id).await?;
    Ok(Json(hour_response(pool, entry).await?))
}

async fn update_hours(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<UpdateHoursRequest>,
) -> Result<Json<HourResponse>> {
    let pool = &state.db.pool;
    let principal = user.principal();
    let mut entry = load_entry(pool, &id).await?;
    access::authorize(pool, &principal, Capability::FieldWrite, Target::WorkHours(&id)).await?;

    let previous_task = entry.task_id.clone();
    let previous = (entry.date, entry.hours);
    if let Some(task_id) = body.task_id {
        if task_id != previous_task {
            ensure_exists(pool, Table::Tasks, &task_id).await?;
            access::authorize(pool, &principal, Capability::FieldWrite, Target::Task(&task_id)).await?;
        }
        entry.task_id = task_id;
    }
    if let Some(member_id) = body.member_id {
        entry.member_id = member_id;
    }
    if let Some(date) = body.date {
        entry.date = date;
    }
    if let Some(hours) = body.hours {
        entry.hours = hours;
    }
    if let Some(description) = body.description {
        entry.description = description;
    }
    if let Some(latitude) = body.latitude {
        entry.latitude = latitude;
    }
    if let Some(longitude) = body.longitude {
        entry.longitude = longitude;
    }
    validate_entry(&entry).into_result()?;
    if let Some(member_id) = &entry.member_id {
        ensure_exists(pool, Table::Members, member_id).await?;
    }

    // A validated total must be validated again once it changes
    if previous_task != entry.task_id || previous != (entry.date, entry.hours) {
        entry.validated = false;
        entry.validated_by = None;
    }

    entry.updated_at = Utc::now();
    let mut tx = pool.begin().await?;
    sqlx::query(
        r#"
        UPDATE work_hours
        SET task_id = ?, member_id = ?, date = ?, hours = ?, description = ?, latitude = ?,
            longitude = ?, validated = ?, validated_by = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&entry.task_id)
    .bind(&entry.member_id)
    .bind(entry.date)
    .bind(entry.hours)
    .bind(&entry.description)
    .bind(entry.latitude)
    .bind(entry.longitude)
    .bind(entry.validated)
    .bind(&entry.validated_by)
    .bind(entry.updated_at)
    .bind(&id)
    .execute(&mut *tx)
    .await?;
    if previous_task != entry.task_id {
        aggregation::recompute_task_hours(&mut tx, &previous_task).await?;
    }
    aggregation::recompute_task_hours(&mut tx, &entry.task_id).await?;
    tx.commit().await?;

    tracing::info!(entry_id = %id, task_id = %entry.task_id, hours = entry.hours, "hours updated");

    Ok(Json(hour_response(pool, entry).await?))
}

async fn delete_hours(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    let pool = &state.db.pool;
    let entry = load_entry(pool, &id).await?;
    access::authorize(pool, &user.principal(), Capability::FieldWrite, Target::WorkHours(&id)).await?;

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM work_hours WHERE id = ?")
        .bind(&id)
        .execute(&mut *tx)
        .await?;
    let recomputed = aggregation::recompute_task_hours(&mut tx, &entry.task_id).await?;
    tx.commit().await?;

    tracing::info!(
        entry_id = %id,
        task_id = %entry.task_id,
        task_real_hours = recomputed.task_real_hours,
        "hours deleted"
    );

    Ok(StatusCode::NO_CONTENT)
}

async fn validate_hours(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<HourResponse>> {
    let pool = &state.db.pool;
    let mut entry = load_entry(pool, &id).await?;
    access::authorize(pool, &user.principal(), Capability::ProjectWrite, Target::WorkHours(&id)).await?;

    entry.validated = true;
    entry.validated_by = Some(user.id.clone());
    entry.updated_at = Utc::now();
    sqlx::query("UPDATE work_hours SET validated = 1, validated_by = ?, updated_at = ? WHERE id = ?")
        .bind(&user.id)
        .bind(entry.updated_at)
        .bind(&id)
        .execute(pool)
        .await?;

    tracing::info!(entry_id = %id, validated_by = %user.id, "hours validated");

    Ok(Json(hour_response(pool, entry).await?))
}

async fn my_hours(State(state): State<AppState>, user: AuthUser) -> Result<Json<MonthlyHours>> {
    let pool = &state.db.pool;
    let member_id = member_of(pool, &user.id)
        .await?
        .ok_or_else(|| AppError::NotFound("No member record for this user".to_string()))?;
    let month = today().format("%Y-%m").to_string();

    let entries = sqlx::query_as::<_, WorkHourEntry>(
        r#"
        SELECT * FROM work_hours
        WHERE member_id = ? AND strftime('%Y-%m', date) = ?
        ORDER BY date DESC, created_at DESC
        "#,
    )
    .bind(&member_id)
    .bind(&month)
    .fetch_all(pool)
    .await?;

    let total_hours = round_hours(entries.iter().map(|e| e.hours).sum());
    let mut responses = Vec::with_capacity(entries.len());
    for entry in entries {
        responses.push(hour_response(pool, entry).await?);
    }

    Ok(Json(MonthlyHours {
        month,
        total_hours,
        entries: responses,
    }))
}
