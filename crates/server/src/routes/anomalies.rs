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
    db::models::{Anomaly, AnomalyStatus, Severity},
    error::{AppError, Result, ValidationErrors},
    middleware::auth::AuthUser,
    routes::{ensure_exists, nullable, today, user_summary, ApiJson, ApiQuery, Table, UserSummary},
    services::{
        access::{self, Capability, Target},
        filters::{fetch_page, AnomalyFilter, Page, Pagination},
        validation,
    },
    AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_anomalies))
        .route(
            "/:id",
            get(get_anomaly)
                .patch(update_anomaly)
                .delete(delete_anomaly),
        )
        .route("/:id/assign", post(assign_anomaly))
        .route("/:id/close", post(close_anomaly))
}

#[derive(Debug, Deserialize)]
pub struct ReportAnomalyRequest {
    pub title: String,
    pub description: String,
    pub severity: Severity,
    pub planned_resolution_date: Option<NaiveDate>,
    pub photo_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateAnomalyRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub severity: Option<Severity>,
    pub status: Option<AnomalyStatus>,
    #[serde(default, deserialize_with = "nullable")]
    pub planned_resolution_date: Option<Option<NaiveDate>>,
    #[serde(default, deserialize_with = "nullable")]
    pub photo_id: Option<Option<String>>,
}

#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    pub corrector_id: String,
    pub planned_resolution_date: Option<NaiveDate>,
}

#[derive(Debug, Serialize)]
pub struct AnomalyResponse {
    #[serde(flatten)]
    pub anomaly: Anomaly,
    pub is_late: bool,
    pub reporter: Option<UserSummary>,
    pub corrector: Option<UserSummary>,
}

pub(crate) async fn anomaly_response(pool: &SqlitePool, anomaly: Anomaly) -> Result<AnomalyResponse> {
    let reporter = user_summary(pool, anomaly.reporter_id.as_deref()).await?;
    let corrector = user_summary(pool, anomaly.corrector_id.as_deref()).await?;

    Ok(AnomalyResponse {
        is_late: anomaly.is_late(today()),
        reporter,
        corrector,
        anomaly,
    })
}

async fn load_anomaly(pool: &SqlitePool, id: &str) -> Result<Anomaly> {
    sqlx::query_as::<_, Anomaly>("SELECT * FROM anomalies WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound("Anomaly not found".to_string()))
}

fn validate_anomaly(anomaly: &Anomaly) -> ValidationErrors {
    let mut errors = ValidationErrors::new();
    validation::require_text(&mut errors, "title", &anomaly.title, 200);
    validation::require_text(&mut errors, "description", &anomaly.description, 5000);
    errors
}

async fn save(pool: &SqlitePool, anomaly: &Anomaly) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE anomalies
        SET title = ?, description = ?, severity = ?, status = ?, corrector_id = ?,
            planned_resolution_date = ?, actual_resolution_date = ?, photo_id = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&anomaly.title)
    .bind(&anomaly.description)
    .bind(anomaly.severity)
    .bind(anomaly.status)
    .bind(&anomaly.corrector_id)
    .bind(anomaly.planned_resolution_date)
    .bind(anomaly.actual_resolution_date)
    .bind(&anomaly.photo_id)
    .bind(anomaly.updated_at)
    .bind(&anomaly.id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Opens an anomaly under a task on behalf of the reporting principal.
pub(crate) async fn report_anomaly(
    state: &AppState,
    user: &AuthUser,
    task_id: &str,
    body: ReportAnomalyRequest,
) -> Result<AnomalyResponse> {
    let pool = &state.db.pool;
    ensure_exists(pool, Table::Tasks, task_id).await?;
    access::authorize(pool, &user.principal(), Capability::FieldWrite, Target::Task(task_id)).await?;

    let now = Utc::now();
    let anomaly = Anomaly {
        id: Uuid::new_v4().to_string(),
        task_id: task_id.to_string(),
        title: body.title,
        description: body.description,
        severity: body.severity,
        status: AnomalyStatus::Open,
        reporter_id: Some(user.id.clone()),
        corrector_id: None,
        planned_resolution_date: body.planned_resolution_date,
        actual_resolution_date: None,
        photo_id: body.photo_id,
        created_at: now,
        updated_at: now,
    };
    validate_anomaly(&anomaly).into_result()?;
    if let Some(photo_id) = &anomaly.photo_id {
        ensure_exists(pool, Table::Photos, photo_id).await?;
    }

    sqlx::query(
        r#"
        INSERT INTO anomalies (id, task_id, title, description, severity, status, reporter_id,
                               corrector_id, planned_resolution_date, actual_resolution_date,
                               photo_id, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, NULL, ?, NULL, ?, ?, ?)
        "#,
    )
    .bind(&anomaly.id)
    .bind(&anomaly.task_id)
    .bind(&anomaly.title)
    .bind(&anomaly.description)
    .bind(anomaly.severity)
    .bind(anomaly.status)
    .bind(&anomaly.reporter_id)
    .bind(anomaly.planned_resolution_date)
    .bind(&anomaly.photo_id)
    .bind(anomaly.created_at)
    .bind(anomaly.updated_at)
    .execute(pool)
    .await?;

    tracing::warn!(
        anomaly_id = %anomaly.id,
        task_id,
        severity = ?anomaly.severity,
        reporter_id = %user.id,
        "anomaly reported"
    );

    anomaly_response(pool, anomaly).await
}

async fn list_anomalies(
    State(state): State<AppState>,
    _user: AuthUser,
    ApiQuery(filter): ApiQuery<AnomalyFilter>,
) -> Result<Json<Page<AnomalyResponse>>> {
    let pool = &state.db.pool;
    let order = filter.order();
    let page = fetch_page::<Anomaly, _>(
        pool,
        AnomalyFilter::SELECT,
        AnomalyFilter::COUNT,
        |qb| filter.push_conditions(qb),
        &order,
        Pagination::new(filter.page, state.config.page_size),
    )
    .await?;

    let mut results = Vec::with_capacity(page.results.len());
    for anomaly in page.results {
        results.push(anomaly_response(pool, anomaly).await?);
    }
    Ok(Json(Page {
        count: page.count,
        page: page.page,
        page_size: page.page_size,
        results,
    }))
}

async fn get_anomaly(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<AnomalyResponse>> {
    let pool = &state.db.pool;
    let anomaly = load_anomaly(pool, &id).await?;
    Ok(Json(anomaly_response(pool, anomaly).await?))
}

async fn update_anomaly(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<UpdateAnomalyRequest>,
) -> Result<Json<AnomalyResponse>> {
    let pool = &state.db.pool;
    let mut anomaly = load_anomaly(pool, &id).await?;
    access::authorize(pool, &user.principal(), Capability::FieldWrite, Target::Anomaly(&id)).await?;

    if let Some(title) = body.title {
        anomaly.title = title;
    }
    if let Some(description) = body.description {
        anomaly.description = description;
    }
    if let Some(severity) = body.severity {
        anomaly.severity = severity;
    }
    if let Some(status) = body.status.filter(|s| *s != anomaly.status) {
        match status {
            AnomalyStatus::Open | AnomalyStatus::Deferred => {
                anomaly.status = status;
                anomaly.actual_resolution_date = None;
            }
            // Assignment and closure carry their own permissions and side effects
            AnomalyStatus::InProgress | AnomalyStatus::Closed => {
                return Err(AppError::invalid(
                    "status",
                    "Use the assign or close action for this status",
                ));
            }
        }
    }
    if let Some(planned) = body.planned_resolution_date {
        anomaly.planned_resolution_date = planned;
    }
    if let Some(photo_id) = body.photo_id {
        anomaly.photo_id = photo_id;
    }
    validate_anomaly(&anomaly).into_result()?;
    if let Some(photo_id) = &anomaly.photo_id {
        ensure_exists(pool, Table::Photos, photo_id).await?;
    }

    anomaly.updated_at = Utc::now();
    save(pool, &anomaly).await?;

    Ok(Json(anomaly_response(pool, anomaly).await?))
}

async fn delete_anomaly(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    let pool = &state.db.pool;
    load_anomaly(pool, &id).await?;
    access::authorize(pool, &user.principal(), Capability::ProjectWrite, Target::Anomaly(&id)).await?;

    sqlx::query("DELETE FROM anomalies WHERE id = ?")
        .bind(&id)
        .execute(pool)
        .await?;

    tracing::info!(anomaly_id = %id, user_id = %user.id, "anomaly deleted");

    Ok(StatusCode::NO_CONTENT)
}

async fn assign_anomaly(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<AssignRequest>,
) -> Result<Json<AnomalyResponse>> {
    let pool = &state.db.pool;
    let mut anomaly = load_anomaly(pool, &id).await?;
    access::authorize(pool, &user.principal(), Capability::ProjectWrite, Target::Anomaly(&id)).await?;
    ensure_exists(pool, Table::Users, &body.corrector_id).await?;

    anomaly.corrector_id = Some(body.corrector_id);
    anomaly.status = AnomalyStatus::InProgress;
    if let Some(planned) = body.planned_resolution_date {
        anomaly.planned_resolution_date = Some(planned);
    }
    anomaly.updated_at = Utc::now();
    save(pool, &anomaly).await?;

    tracing::info!(anomaly_id = %id, corrector_id = ?anomaly.corrector_id, "anomaly assigned");

    Ok(Json(anomaly_response(pool, anomaly).await?))
}

async fn close_anomaly(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<AnomalyResponse>> {
    let pool = &state.db.pool;
    let mut anomaly = load_anomaly(pool, &id).await?;

    // The assigned corrector may close what they fixed
    if anomaly.corrector_id.as_deref() != Some(user.id.as_str()) {
        access::authorize(pool, &user.principal(), Capability::ProjectWrite, Target::Anomaly(&id))
            .await?;
    }

    anomaly.status = AnomalyStatus::Closed;
    anomaly.actual_resolution_date = Some(today());
    anomaly.updated_at = Utc::now();
    save(pool, &anomaly).await?;

    tracing::info!(anomaly_id = %id, closed_by = %user.id, "anomaly closed");

    Ok(Json(anomaly_response(pool, anomaly).await?))
}
