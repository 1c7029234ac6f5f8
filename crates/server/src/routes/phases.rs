use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{
    db::models::{Phase, ProjectStatus},
    error::{AppError, Result, ValidationErrors},
    middleware::auth::AuthUser,
    routes::{
        ensure_exists, nullable, projects::load_project, user_summary, ApiJson, ApiQuery, Table,
        UserSummary,
    },
    services::{
        access::{self, Capability, Target},
        aggregation,
        filters::{fetch_page, Page, Pagination, PhaseFilter},
        validation,
    },
    AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_phases).post(create_phase))
        .route(
            "/:id",
            get(get_phase).patch(update_phase).delete(delete_phase),
        )
}

#[derive(Debug, Deserialize)]
pub struct CreatePhaseRequest {
    pub project_id: String,
    pub number: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub planned_start: NaiveDate,
    pub planned_end: NaiveDate,
    pub responsible_id: Option<String>,
    pub budget: f64,
    #[serde(default)]
    pub status: ProjectStatus,
}

#[derive(Debug, Deserialize)]
pub struct UpdatePhaseRequest {
    pub number: Option<i64>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub planned_start: Option<NaiveDate>,
    pub planned_end: Option<NaiveDate>,
    #[serde(default, deserialize_with = "nullable")]
    pub responsible_id: Option<Option<String>>,
    pub budget: Option<f64>,
    pub status: Option<ProjectStatus>,
}

#[derive(Debug, Serialize)]
pub struct PhaseResponse {
    #[serde(flatten)]
    pub phase: Phase,
    pub responsible: Option<UserSummary>,
    pub progress: f64,
    pub task_count: i64,
}

pub(crate) async fn phase_response(pool: &SqlitePool, phase: Phase) -> Result<PhaseResponse> {
    let counts = aggregation::phase_task_counts(pool, &phase.id).await?;
    let responsible = user_summary(pool, phase.responsible_id.as_deref()).await?;

    Ok(PhaseResponse {
        responsible,
        progress: counts.progress(),
        task_count: counts.total,
        phase,
    })
}

pub(crate) async fn load_phase(pool: &SqlitePool, id: &str) -> Result<Phase> {
    sqlx::query_as::<_, Phase>("SELECT * FROM phases WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound("Phase not found".to_string()))
}

fn validate_phase(phase: &Phase) -> ValidationErrors {
    let mut errors = ValidationErrors::new();
    if phase.number < 1 {
        errors.add("number", "Phase number must be at least 1");
    }
    validation::require_text(&mut errors, "name", &phase.name, 200);
    validation::end_not_before(&mut errors, "planned_end", phase.planned_start, phase.planned_end);
    validation::non_negative(&mut errors, "budget", phase.budget);
    errors
}

async fn number_taken(pool: &SqlitePool, phase: &Phase) -> Result<bool> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM phases WHERE project_id = ? AND number = ? AND id != ?",
    )
    .bind(&phase.project_id)
    .bind(phase.number)
    .bind(&phase.id)
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}

async fn check_phase(pool: &SqlitePool, phase: &Phase) -> Result<()> {
    let mut errors = validate_phase(phase);
    if number_taken(pool, phase).await? {
        errors.add("number", "This number is already used in the project");
    }
    errors.into_result()?;

    if let Some(responsible_id) = &phase.responsible_id {
        ensure_exists(pool, Table::Users, responsible_id).await?;
    }
    Ok(())
}

async fn list_phases(
    State(state): State<AppState>,
    _user: AuthUser,
    ApiQuery(filter): ApiQuery<PhaseFilter>,
) -> Result<Json<Page<PhaseResponse>>> {
    let pool = &state.db.pool;
    let order = filter.order();
    let page = fetch_page::<Phase, _>(
        pool,
        PhaseFilter::SELECT,
        PhaseFilter::COUNT,
        |qb| filter.push_conditions(qb),
        &order,
        Pagination::new(filter.page, state.config.page_size),
    )
    .await?;

    let mut results = Vec::with_capacity(page.results.len());
    for phase in page.results {
        results.push(phase_response(pool, phase).await?);
    }
    Ok(Json(Page {
        count: page.count,
        page: page.page,
        page_size: page.page_size,
        results,
    }))
}

async fn create_phase(
    State(state): State<AppState>,
    user: AuthUser,
    ApiJson(body): ApiJson<CreatePhaseRequest>,
) -> Result<(StatusCode, Json<PhaseResponse>)> {
    let pool = &state.db.pool;
    load_project(pool, &body.project_id).await?;
    access::authorize(
        pool,
        &user.principal(),
        Capability::ProjectWrite,
        Target::Project(&body.project_id),
    )
    .await?;

    let now = Utc::now();
    let phase = Phase {
        id: Uuid::new_v4().to_string(),
        project_id: body.project_id,
        number: body.number,
        name: body.name,
        description: body.description,
        planned_start: body.planned_start,
        planned_end: body.planned_end,
        responsible_id: body.responsible_id,
        budget: body.budget,
        status: body.status,
        created_at: now,
        updated_at: now,
    };
    check_phase(pool, &phase).await?;

    sqlx::query(
        r#"
        INSERT INTO phases (id, project_id, number, name, description, planned_start, planned_end,
                            responsible_id, budget, status, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&phase.id)
    .bind(&phase.project_id)
    .bind(phase.number)
    .bind(&phase.name)
    .bind(&phase.description)
    .bind(phase.planned_start)
    .bind(phase.planned_end)
    .bind(&phase.responsible_id)
    .bind(phase.budget)
    .bind(phase.status)
    .bind(phase.created_at)
    .bind(phase.updated_at)
    .execute(pool)
    .await?;

    tracing::info!(phase_id = %phase.id, project_id = %phase.project_id, "phase created");

    Ok((StatusCode::CREATED, Json(phase_response(pool, phase).await?)))
}

async fn get_phase(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<PhaseResponse>> {
    let pool = &state.db.pool;
    let phase = load_phase(pool, &id).await?;
    Ok(Json(phase_response(pool, phase).await?))
}

async fn update_phase(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<UpdatePhaseRequest>,
) -> Result<Json<PhaseResponse>> {
    let pool = &state.db.pool;
    let mut phase = load_phase(pool, &id).await?;
    access::authorize(pool, &user.principal(), Capability::ProjectWrite, Target::Phase(&id)).await?;

    if let Some(number) = body.number {
        phase.number = number;
    }
    if let Some(name) = body.name {
        phase.name = name;
    }
    if let Some(description) = body.description {
        phase.description = description;
    }
    if let Some(planned_start) = body.planned_start {
        phase.planned_start = planned_start;
    }
    if let Some(planned_end) = body.planned_end {
        phase.planned_end = planned_end;
    }
    if let Some(responsible_id) = body.responsible_id {
        phase.responsible_id = responsible_id;
    }
    if let Some(budget) = body.budget {
        phase.budget = budget;
    }
    if let Some(status) = body.status {
        phase.status = status;
    }
    check_phase(pool, &phase).await?;

    phase.updated_at = Utc::now();
    sqlx::query(
        r#"
        UPDATE phases
        SET number = ?, name = ?, description = ?, planned_start = ?, planned_end = ?,
            responsible_id = ?, budget = ?, status = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(phase.number)
    .bind(&phase.name)
    .bind(&phase.description)
    .bind(phase.planned_start)
    .bind(phase.planned_end)
    .bind(&phase.responsible_id)
    .bind(phase.budget)
    .bind(phase.status)
    .bind(phase.updated_at)
    .bind(&id)
    .execute(pool)
    .await?;

    Ok(Json(phase_response(pool, phase).await?))
}

async fn delete_phase(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    let pool = &state.db.pool;
    let phase = load_phase(pool, &id).await?;
    access::authorize(pool, &user.principal(), Capability::ProjectWrite, Target::Phase(&id)).await?;

    let images = sqlx::query_scalar::<_, String>(
        "SELECT p.image_ref FROM photos p JOIN tasks t ON t.id = p.task_id WHERE t.phase_id = ?",
    )
    .bind(&id)
    .fetch_all(pool)
    .await?;

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM phases WHERE id = ?")
        .bind(&id)
        .execute(&mut *tx)
        .await?;
    aggregation::recompute_project_cost(&mut tx, &phase.project_id).await?;
    tx.commit().await?;

    for reference in images {
        if let Err(e) = state.images.remove(&reference).await {
            tracing::warn!("Failed to remove image {reference}: {e}");
        }
    }

    tracing::info!(phase_id = %id, project_id = %phase.project_id, "phase deleted");

    Ok(StatusCode::NO_CONTENT)
}
