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
    db::models::{Anomaly, AnomalyStatus, Phase, Project, ProjectStatus, Team},
    error::{AppError, Result, ValidationErrors},
    middleware::auth::AuthUser,
    routes::{
        anomalies::{anomaly_response, AnomalyResponse},
        ensure_exists, nullable,
        phases::{phase_response, PhaseResponse},
        teams::{team_response, TeamResponse},
        today, user_summary, ApiJson, ApiQuery, Table, UserSummary,
    },
    services::{
        access::{self, Capability, Target},
        aggregation::{self, round_hours},
        filters::{fetch_page, Page, Pagination, ProjectFilter},
        validation,
    },
    AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_projects).post(create_project))
        .route(
            "/:id",
            get(get_project)
                .patch(update_project)
                .delete(delete_project),
        )
        .route("/:id/report", get(project_report))
        .route("/:id/teams", get(project_teams))
        .route("/:id/anomalies", get(project_anomalies))
}

#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub postal_code: String,
    #[serde(default)]
    pub city: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub start_date: NaiveDate,
    pub planned_end_date: NaiveDate,
    pub actual_end_date: Option<NaiveDate>,
    #[serde(default)]
    pub status: ProjectStatus,
    pub chief_id: Option<String>,
    pub budget_total: f64,
    #[serde(default)]
    pub internal_notes: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateProjectRequest {
    pub code: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub address: Option<String>,
    pub postal_code: Option<String>,
    pub city: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub latitude: Option<Option<f64>>,
    #[serde(default, deserialize_with = "nullable")]
    pub longitude: Option<Option<f64>>,
    pub start_date: Option<NaiveDate>,
    pub planned_end_date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "nullable")]
    pub actual_end_date: Option<Option<NaiveDate>>,
    pub status: Option<ProjectStatus>,
    #[serde(default, deserialize_with = "nullable")]
    pub chief_id: Option<Option<String>>,
    pub budget_total: Option<f64>,
    pub internal_notes: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ProjectResponse {
    #[serde(flatten)]
    pub project: Project,
    pub chief: Option<UserSummary>,
    pub progress: f64,
    pub days_remaining: i64,
    pub task_count: i64,
}

#[derive(Debug, Serialize)]
pub struct ProjectDetailResponse {
    #[serde(flatten)]
    pub project: ProjectResponse,
    pub phases: Vec<PhaseResponse>,
}

#[derive(Debug, Serialize)]
pub struct ProjectReport {
    pub project: ProjectResponse,
    pub phases: Vec<PhaseResponse>,
    pub total_tasks: i64,
    pub completed_tasks: i64,
    pub progress: f64,
    pub estimated_hours: f64,
    pub real_hours: f64,
    pub projected_cost: f64,
    pub real_cost: f64,
    pub open_anomalies: i64,
    pub active_members: i64,
}

#[derive(Debug, Deserialize)]
pub struct AnomalyStatusQuery {
    pub status: Option<AnomalyStatus>,
}

pub(crate) async fn load_project(pool: &SqlitePool, id: &str) -> Result<Project> {
    sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = ? AND active = 1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound("Project not found".to_string()))
}

pub(crate) async fn project_response(pool: &SqlitePool, project: Project) -> Result<ProjectResponse> {
    let counts = aggregation::project_task_counts(pool, &project.id).await?;
    let chief = user_summary(pool, project.chief_id.as_deref()).await?;

    Ok(ProjectResponse {
        chief,
        progress: counts.progress(),
        days_remaining: project.days_remaining(today()),
        task_count: counts.total,
        project,
    })
}

async fn load_phases(pool: &SqlitePool, project_id: &str) -> Result<Vec<PhaseResponse>> {
    let phases = sqlx::query_as::<_, Phase>(
        "SELECT * FROM phases WHERE project_id = ? ORDER BY number ASC",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;

    let mut responses = Vec::with_capacity(phases.len());
    for phase in phases {
        responses.push(phase_response(pool, phase).await?);
    }
    Ok(responses)
}

async fn code_taken(pool: &SqlitePool, code: &str, except_id: Option<&str>) -> Result<bool> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM projects WHERE code = ? AND id != COALESCE(?, '')",
    )
    .bind(code)
    .bind(except_id)
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}

fn validate_project(project: &Project) -> ValidationErrors {
    let mut errors = ValidationErrors::new();
    validation::require_text(&mut errors, "code", &project.code, 50);
    validation::require_text(&mut errors, "name", &project.name, 200);
    validation::max_length(&mut errors, "address", &project.address, 255);
    validation::max_length(&mut errors, "postal_code", &project.postal_code, 10);
    validation::max_length(&mut errors, "city", &project.city, 100);
    validation::coordinates(&mut errors, project.latitude, project.longitude);
    if project.planned_end_date <= project.start_date {
        errors.add(
            "planned_end_date",
            "Planned end date must be after the start date",
        );
    }
    if let Some(actual_end) = project.actual_end_date {
        validation::end_not_before(&mut errors, "actual_end_date", project.start_date, actual_end);
    }
    validation::positive(&mut errors, "budget_total", project.budget_total);
    errors
}

async fn list_projects(
    State(state): State<AppState>,
    _user: AuthUser,
    ApiQuery(filter): ApiQuery<ProjectFilter>,
) -> Result<Json<Page<ProjectResponse>>> {
    let pool = &state.db.pool;
    let today = today();
    let order = filter.order();

    let page = fetch_page::<Project, _>(
        pool,
        ProjectFilter::SELECT,
        ProjectFilter::COUNT,
        |qb| filter.push_conditions(qb, today),
        &order,
        Pagination::new(filter.page, state.config.page_size),
    )
    .await?;

    let mut results = Vec::with_capacity(page.results.len());
    for project in page.results {
        results.push(project_response(pool, project).await?);
    }

    Ok(Json(Page {
        count: page.count,
        page: page.page,
        page_size: page.page_size,
        results,
    }))
}

async fn create_project(
    State(state): State<AppState>,
    user: AuthUser,
    ApiJson(body): ApiJson<CreateProjectRequest>,
) -> Result<(StatusCode, Json<ProjectResponse>)> {
    let pool = &state.db.pool;
    let now = Utc::now();

    let project = Project {
        id: Uuid::new_v4().to_string(),
        code: body.code.trim().to_string(),
        name: body.name,
        description: body.description,
        address: body.address,
        postal_code: body.postal_code,
        city: body.city,
        latitude: body.latitude,
        longitude: body.longitude,
        start_date: body.start_date,
        planned_end_date: body.planned_end_date,
        actual_end_date: body.actual_end_date,
        status: body.status,
        chief_id: Some(body.chief_id.unwrap_or_else(|| user.id.clone())),
        budget_total: body.budget_total,
        real_cost: 0.0,
        internal_notes: body.internal_notes,
        created_by: Some(user.id.clone()),
        active: true,
        created_at: now,
        updated_at: now,
    };

    let mut errors = validate_project(&project);
    if !project.code.is_empty() && code_taken(pool, &project.code, None).await? {
        errors.add("code", "A project with this code already exists");
    }
    errors.into_result()?;

    if let Some(chief_id) = &project.chief_id {
        ensure_exists(pool, Table::Users, chief_id).await?;
    }

    sqlx::query(
        r#"
        INSERT INTO projects (id, code, name, description, address, postal_code, city, latitude,
                              longitude, start_date, planned_end_date, actual_end_date, status,
                              chief_id, budget_total, real_cost, internal_notes, created_by,
                              active, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, 1, ?, ?)
        "#,
    )
    .bind(&project.id)
    .bind(&project.code)
    .bind(&project.name)
    .bind(&project.description)
    .bind(&project.address)
    .bind(&project.postal_code)
    .bind(&project.city)
    .bind(project.latitude)
    .bind(project.longitude)
    .bind(project.start_date)
    .bind(project.planned_end_date)
    .bind(project.actual_end_date)
    .bind(project.status)
    .bind(&project.chief_id)
    .bind(project.budget_total)
    .bind(&project.internal_notes)
    .bind(&project.created_by)
    .bind(project.created_at)
    .bind(project.updated_at)
    .execute(pool)
    .await?;

    tracing::info!(code = %project.code, user_id = %user.id, "project created");

    Ok((StatusCode::CREATED, Json(project_response(pool, project).await?)))
}

async fn get_project(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<ProjectDetailResponse>> {
    let pool = &state.db.pool;
    let project = load_project(pool, &id).await?;
    let phases = load_phases(pool, &id).await?;

    Ok(Json(ProjectDetailResponse {
        project: project_response(pool, project).await?,
        phases,
    }))
}

async fn update_project(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<UpdateProjectRequest>,
) -> Result<Json<ProjectResponse>> {
    let pool = &state.db.pool;
    let mut project = load_project(pool, &id).await?;
    access::authorize(pool, &user.principal(), Capability::ProjectWrite, Target::Project(&id)).await?;

    if let Some(code) = body.code {
        project.code = code.trim().to_string();
    }
    if let Some(name) = body.name {
        project.name = name;
    }
    if let Some(description) = body.description {
        project.description = description;
    }
    if let Some(address) = body.address {
        project.address = address;
    }
    if let Some(postal_code) = body.postal_code {
        project.postal_code = postal_code;
    }
    if let Some(city) = body.city {
        project.city = city;
    }
    if let Some(latitude) = body.latitude {
        project.latitude = latitude;
    }
    if let Some(longitude) = body.longitude {
        project.longitude = longitude;
    }
    if let Some(start_date) = body.start_date {
        project.start_date = start_date;
    }
    if let Some(planned_end_date) = body.planned_end_date {
        project.planned_end_date = planned_end_date;
    }
    if let Some(actual_end_date) = body.actual_end_date {
        project.actual_end_date = actual_end_date;
    }
    if let Some(status) = body.status {
        project.status = status;
    }
    if let Some(chief_id) = body.chief_id {
        project.chief_id = chief_id;
    }
    if let Some(budget_total) = body.budget_total {
        project.budget_total = budget_total;
    }
    if let Some(internal_notes) = body.internal_notes {
        project.internal_notes = internal_notes;
    }

    let mut errors = validate_project(&project);
    if !project.code.is_empty() && code_taken(pool, &project.code, Some(&id)).await? {
        errors.add("code", "A project with this code already exists");
    }
    errors.into_result()?;

    if let Some(chief_id) = &project.chief_id {
        ensure_exists(pool, Table::Users, chief_id).await?;
    }

    project.updated_at = Utc::now();
    sqlx::query(
        r#"
        UPDATE projects
        SET code = ?, name = ?, description = ?, address = ?, postal_code = ?, city = ?,
            latitude = ?, longitude = ?, start_date = ?, planned_end_date = ?,
            actual_end_date = ?, status = ?, chief_id = ?, budget_total = ?,
            internal_notes = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&project.code)
    .bind(&project.name)
    .bind(&project.description)
    .bind(&project.address)
    .bind(&project.postal_code)
    .bind(&project.city)
    .bind(project.latitude)
    .bind(project.longitude)
    .bind(project.start_date)
    .bind(project.planned_end_date)
    .bind(project.actual_end_date)
    .bind(project.status)
    .bind(&project.chief_id)
    .bind(project.budget_total)
    .bind(&project.internal_notes)
    .bind(project.updated_at)
    .bind(&id)
    .execute(pool)
    .await?;

    tracing::info!(code = %project.code, user_id = %user.id, "project updated");

    Ok(Json(project_response(pool, project).await?))
}

async fn delete_project(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    let pool = &state.db.pool;
    let project = load_project(pool, &id).await?;
    access::authorize(pool, &user.principal(), Capability::ProjectWrite, Target::Project(&id)).await?;

    let images = sqlx::query_scalar::<_, String>(
        r#"
        SELECT p.image_ref
        FROM photos p
        JOIN tasks t ON t.id = p.task_id
        JOIN phases ph ON ph.id = t.phase_id
        WHERE ph.project_id = ?
        "#,
    )
    .bind(&id)
    .fetch_all(pool)
    .await?;

    // Cascades to phases, tasks and everything logged under them
    sqlx::query("DELETE FROM projects WHERE id = ?")
        .bind(&id)
        .execute(pool)
        .await?;

    for reference in images {
        if let Err(e) = state.images.remove(&reference).await {
            tracing::warn!("Failed to remove image {reference}: {e}");
        }
    }

    tracing::info!(code = %project.code, user_id = %user.id, "project deleted");

    Ok(StatusCode::NO_CONTENT)
}

async fn project_report(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<ProjectReport>> {
    let pool = &state.db.pool;
    let project = load_project(pool, &id).await?;
    let phases = load_phases(pool, &id).await?;
    let counts = aggregation::project_task_counts(pool, &id).await?;

    let (estimated_hours, real_hours) = sqlx::query_as::<_, (f64, f64)>(
        r#"
        SELECT COALESCE(SUM(t.estimated_hours), 0.0), COALESCE(SUM(t.real_hours), 0.0)
        FROM tasks t
        JOIN phases ph ON ph.id = t.phase_id
        WHERE ph.project_id = ?
        "#,
    )
    .bind(&id)
    .fetch_one(pool)
    .await?;

    let open_anomalies = sqlx::query_scalar::<_, i64>(
        r#"
        SELECT COUNT(*)
        FROM anomalies a
        JOIN tasks t ON t.id = a.task_id
        JOIN phases ph ON ph.id = t.phase_id
        WHERE ph.project_id = ? AND a.status IN (?, ?)
        "#,
    )
    .bind(&id)
    .bind(AnomalyStatus::Open)
    .bind(AnomalyStatus::InProgress)
    .fetch_one(pool)
    .await?;

    let active_members = sqlx::query_scalar::<_, i64>(
        r#"
        SELECT COUNT(DISTINCT m.id)
        FROM members m
        JOIN tasks t ON t.team_id = m.team_id
        JOIN phases ph ON ph.id = t.phase_id
        WHERE ph.project_id = ? AND m.active = 1
        "#,
    )
    .bind(&id)
    .fetch_one(pool)
    .await?;

    let projected_cost = project.budget_total;
    let real_cost = project.real_cost;

    Ok(Json(ProjectReport {
        project: project_response(pool, project).await?,
        phases,
        total_tasks: counts.total,
        completed_tasks: counts.done,
        progress: counts.progress(),
        estimated_hours: round_hours(estimated_hours),
        real_hours: round_hours(real_hours),
        projected_cost,
        real_cost,
        open_anomalies,
        active_members,
    }))
}

async fn project_teams(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Vec<TeamResponse>>> {
    let pool = &state.db.pool;
    load_project(pool, &id).await?;

    let teams = sqlx::query_as::<_, Team>(
        r#"
        SELECT DISTINCT te.*
        FROM teams te
        JOIN tasks t ON t.team_id = te.id
        JOIN phases ph ON ph.id = t.phase_id
        WHERE ph.project_id = ?
        ORDER BY te.name ASC
        "#,
    )
    .bind(&id)
    .fetch_all(pool)
    .await?;

    let mut responses = Vec::with_capacity(teams.len());
    for team in teams {
        responses.push(team_response(pool, team).await?);
    }
    Ok(Json(responses))
}

async fn project_anomalies(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(id): Path<String>,
    ApiQuery(query): ApiQuery<AnomalyStatusQuery>,
) -> Result<Json<Vec<AnomalyResponse>>> {
    let pool = &state.db.pool;
    load_project(pool, &id).await?;

    let anomalies = sqlx::query_as::<_, Anomaly>(
        r#"
        SELECT a.*
        FROM anomalies a
        JOIN tasks t ON t.id = a.task_id
        JOIN phases ph ON ph.id = t.phase_id
        WHERE ph.project_id = ? AND (? IS NULL OR a.status = ?)
        ORDER BY a.created_at DESC
        "#,
    )
    .bind(&id)
    .bind(query.status)
    .bind(query.status)
    .fetch_all(pool)
    .await?;

    let mut responses = Vec::with_capacity(anomalies.len());
    for anomaly in anomalies {
        responses.push(anomaly_response(pool, anomaly).await?);
    }
    Ok(Json(responses))
}
