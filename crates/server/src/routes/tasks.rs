use std::collections::BTreeSet;

use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::{
    db::models::{Anomaly, AnomalyStatus, PhotoReport, Task, TaskStatus, WorkHourEntry},
    error::{AppError, Result, ValidationErrors},
    middleware::auth::AuthUser,
    routes::{
        anomalies::{self, anomaly_response, AnomalyResponse, ReportAnomalyRequest},
        ensure_exists,
        hours::{self, hour_response, HourResponse, LogHoursRequest},
        nullable,
        phases::load_phase,
        photos::{self, photo_response, PhotoResponse},
        today, ApiJson, ApiQuery, Table,
    },
    services::{
        access::{self, Capability, Target},
        aggregation,
        filters::{fetch_page, Page, Pagination, TaskFilter},
        validation,
    },
    AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_tasks).post(create_task))
        .route(
            "/:id",
            get(get_task).patch(update_task).delete(delete_task),
        )
        .route("/:id/hours", get(task_hours).post(log_task_hours))
        .route("/:id/photo", post(upload_task_photo))
        .route("/:id/photos", get(task_photos))
        .route("/:id/anomalies", get(task_anomalies))
        .route("/:id/report-anomaly", post(report_task_anomaly))
}

fn default_hourly_rate() -> f64 {
    50.0
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub phase_id: String,
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub position: i64,
    pub planned_start: NaiveDate,
    pub planned_end: NaiveDate,
    pub actual_start: Option<NaiveDate>,
    pub actual_end: Option<NaiveDate>,
    #[serde(default)]
    pub status: TaskStatus,
    pub team_id: Option<String>,
    #[serde(default)]
    pub estimated_hours: f64,
    #[serde(default = "default_hourly_rate")]
    pub hourly_rate: f64,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub subcontractor_ids: Vec<String>,
    #[serde(default)]
    pub blocked_by: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateTaskRequest {
    pub phase_id: Option<String>,
    pub code: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub position: Option<i64>,
    pub planned_start: Option<NaiveDate>,
    pub planned_end: Option<NaiveDate>,
    #[serde(default, deserialize_with = "nullable")]
    pub actual_start: Option<Option<NaiveDate>>,
    #[serde(default, deserialize_with = "nullable")]
    pub actual_end: Option<Option<NaiveDate>>,
    pub status: Option<TaskStatus>,
    #[serde(default, deserialize_with = "nullable")]
    pub team_id: Option<Option<String>>,
    pub estimated_hours: Option<f64>,
    pub hourly_rate: Option<f64>,
    pub notes: Option<String>,
    pub subcontractor_ids: Option<Vec<String>>,
    pub blocked_by: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct TaskResponse {
    #[serde(flatten)]
    pub task: Task,
    pub cost: f64,
    pub is_late: bool,
    pub team_name: Option<String>,
    pub subcontractor_ids: Vec<String>,
    pub blocked_by: Vec<String>,
    pub blocks: Vec<String>,
    pub hours_count: i64,
    pub photos_count: i64,
    pub anomalies_count: i64,
    pub open_anomalies: i64,
}

pub(crate) async fn load_task(pool: &SqlitePool, id: &str) -> Result<Task> {
    sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound("Task not found".to_string()))
}

async fn ids(pool: &SqlitePool, sql: &str, id: &str) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar::<_, String>(sql)
        .bind(id)
        .fetch_all(pool)
        .await?;
    Ok(ids)
}

pub(crate) async fn task_response(pool: &SqlitePool, task: Task) -> Result<TaskResponse> {
    let team_name = match &task.team_id {
        Some(team_id) => sqlx::query_scalar::<_, String>("SELECT name FROM teams WHERE id = ?")
            .bind(team_id)
            .fetch_optional(pool)
            .await?,
        None => None,
    };

    let (hours_count, photos_count, anomalies_count, open_anomalies) =
        sqlx::query_as::<_, (i64, i64, i64, i64)>(
            r#"
            SELECT
                (SELECT COUNT(*) FROM work_hours WHERE task_id = ?1),
                (SELECT COUNT(*) FROM photos WHERE task_id = ?1),
                (SELECT COUNT(*) FROM anomalies WHERE task_id = ?1),
                (SELECT COUNT(*) FROM anomalies WHERE task_id = ?1 AND status IN (?2, ?3))
            "#,
        )
        .bind(&task.id)
        .bind(AnomalyStatus::Open)
        .bind(AnomalyStatus::InProgress)
        .fetch_one(pool)
        .await?;

    let subcontractor_ids = ids(
        pool,
        "SELECT subcontractor_id FROM task_subcontractors WHERE task_id = ? ORDER BY subcontractor_id",
        &task.id,
    )
    .await?;
    let blocked_by = ids(
        pool,
        "SELECT blocker_id FROM task_blockers WHERE task_id = ? ORDER BY blocker_id",
        &task.id,
    )
    .await?;
    let blocks = ids(
        pool,
        "SELECT task_id FROM task_blockers WHERE blocker_id = ? ORDER BY task_id",
        &task.id,
    )
    .await?;

    Ok(TaskResponse {
        cost: task.cost(),
        is_late: task.is_late(today()),
        team_name,
        subcontractor_ids,
        blocked_by,
        blocks,
        hours_count,
        photos_count,
        anomalies_count,
        open_anomalies,
        task,
    })
}

fn validate_task(task: &Task) -> ValidationErrors {
    let mut errors = ValidationErrors::new();
    validation::require_text(&mut errors, "code", &task.code, 20);
    validation::require_text(&mut errors, "name", &task.name, 200);
    validation::end_not_before(&mut errors, "planned_end", task.planned_start, task.planned_end);
    if let (Some(start), Some(end)) = (task.actual_start, task.actual_end) {
        validation::end_not_before(&mut errors, "actual_end", start, end);
    }
    validation::non_negative(&mut errors, "estimated_hours", task.estimated_hours);
    validation::non_negative(&mut errors, "hourly_rate", task.hourly_rate);
    errors
}

/// Validates a task together with the references it points at.
async fn check_task(
    pool: &SqlitePool,
    task: &Task,
    subcontractor_ids: &BTreeSet<String>,
    blocked_by: &BTreeSet<String>,
) -> Result<()> {
    let mut errors = validate_task(task);
    if blocked_by.contains(&task.id) {
        errors.add("blocked_by", "A task cannot block itself");
    }
    errors.into_result()?;

    if let Some(team_id) = &task.team_id {
        ensure_exists(pool, Table::Teams, team_id).await?;
    }
    for id in subcontractor_ids {
        ensure_exists(pool, Table::Subcontractors, id).await?;
    }
    for id in blocked_by {
        ensure_exists(pool, Table::Tasks, id).await?;
    }
    Ok(())
}

async fn replace_links(
    conn: &mut SqliteConnection,
    task_id: &str,
    subcontractor_ids: Option<&BTreeSet<String>>,
    blocked_by: Option<&BTreeSet<String>>,
) -> Result<()> {
    if let Some(subcontractor_ids) = subcontractor_ids {
        sqlx::query("DELETE FROM task_subcontractors WHERE task_id = ?")
            .bind(task_id)
            .execute(&mut *conn)
            .await?;
        for id in subcontractor_ids {
            sqlx::query("INSERT INTO task_subcontractors (task_id, subcontractor_id) VALUES (?, ?)")
                .bind(task_id)
                .bind(id)
                .execute(&mut *conn)
                .await?;
        }
    }
    if let Some(blocked_by) = blocked_by {
        sqlx::query("DELETE FROM task_blockers WHERE task_id = ?")
            .bind(task_id)
            .execute(&mut *conn)
            .await?;
        for id in blocked_by {
            sqlx::query("INSERT INTO task_blockers (task_id, blocker_id) VALUES (?, ?)")
                .bind(task_id)
                .bind(id)
                .execute(&mut *conn)
                .await?;
        }
    }
    Ok(())
}

async fn project_of_phase(pool: &SqlitePool, phase_id: &str) -> Result<String> {
    Ok(load_phase(pool, phase_id).await?.project_id)
}

async fn list_tasks(
    State(state): State<AppState>,
    _user: AuthUser,
    ApiQuery(filter): ApiQuery<TaskFilter>,
) -> Result<Json<Page<TaskResponse>>> {
    let pool = &state.db.pool;
    let today = today();
    let order = filter.order();
    let page = fetch_page::<Task, _>(
        pool,
        TaskFilter::SELECT,
        TaskFilter::COUNT,
        |qb| filter.push_conditions(qb, today),
        &order,
        Pagination::new(filter.page, state.config.page_size),
    )
    .await?;

    let mut results = Vec::with_capacity(page.results.len());
    for task in page.results {
        results.push(task_response(pool, task).await?);
    }
    Ok(Json(Page {
        count: page.count,
        page: page.page,
        page_size: page.page_size,
        results,
    }))
}

async fn create_task(
    State(state): State<AppState>,
    user: AuthUser,
    ApiJson(body): ApiJson<CreateTaskRequest>,
) -> Result<(StatusCode, Json<TaskResponse>)> {
    let pool = &state.db.pool;
    load_phase(pool, &body.phase_id).await?;
    access::authorize(
        pool,
        &user.principal(),
        Capability::ProjectWrite,
        Target::Phase(&body.phase_id),
    )
    .await?;

    let now = Utc::now();
    let task = Task {
        id: Uuid::new_v4().to_string(),
        phase_id: body.phase_id,
        code: body.code.trim().to_string(),
        name: body.name,
        description: body.description,
        position: body.position,
        planned_start: body.planned_start,
        planned_end: body.planned_end,
        actual_start: body.actual_start,
        actual_end: body.actual_end,
        status: body.status,
        team_id: body.team_id,
        estimated_hours: body.estimated_hours,
        real_hours: 0.0,
        hourly_rate: body.hourly_rate,
        notes: body.notes,
        created_at: now,
        updated_at: now,
    };
    let subcontractor_ids: BTreeSet<String> = body.subcontractor_ids.into_iter().collect();
    let blocked_by: BTreeSet<String> = body.blocked_by.into_iter().collect();
    check_task(pool, &task, &subcontractor_ids, &blocked_by).await?;

    let mut tx = pool.begin().await?;
    sqlx::query(
        r#"
        INSERT INTO tasks (id, phase_id, code, name, description, position, planned_start,
                           planned_end, actual_start, actual_end, status, team_id,
                           estimated_hours, real_hours, hourly_rate, notes, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?)
        "#,
    )
    .bind(&task.id)
    .bind(&task.phase_id)
    .bind(&task.code)
    .bind(&task.name)
    .bind(&task.description)
    .bind(task.position)
    .bind(task.planned_start)
    .bind(task.planned_end)
    .bind(task.actual_start)
    .bind(task.actual_end)
    .bind(task.status)
    .bind(&task.team_id)
    .bind(task.estimated_hours)
    .bind(task.hourly_rate)
    .bind(&task.notes)
    .bind(task.created_at)
    .bind(task.updated_at)
    .execute(&mut *tx)
    .await?;
    replace_links(&mut tx, &task.id, Some(&subcontractor_ids), Some(&blocked_by)).await?;
    tx.commit().await?;

    tracing::info!(task_id = %task.id, code = %task.code, phase_id = %task.phase_id, "task created");

    Ok((StatusCode::CREATED, Json(task_response(pool, task).await?)))
}

async fn get_task(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<TaskResponse>> {
    let pool = &state.db.pool;
    let task = load_task(pool, &id).await?;
    Ok(Json(task_response(pool, task).await?))
}

async fn update_task(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<UpdateTaskRequest>,
) -> Result<Json<TaskResponse>> {
    let pool = &state.db.pool;
    let principal = user.principal();
    let mut task = load_task(pool, &id).await?;
    access::authorize(pool, &principal, Capability::FieldWrite, Target::Task(&id)).await?;

    let previous_phase = task.phase_id.clone();
    let previous_rate = task.hourly_rate;
    if let Some(phase_id) = body.phase_id {
        if phase_id != previous_phase {
            load_phase(pool, &phase_id).await?;
            access::authorize(pool, &principal, Capability::ProjectWrite, Target::Task(&id)).await?;
            access::authorize(pool, &principal, Capability::ProjectWrite, Target::Phase(&phase_id))
                .await?;
        }
        task.phase_id = phase_id;
    }
    if let Some(code) = body.code {
        task.code = code.trim().to_string();
    }
    if let Some(name) = body.name {
        task.name = name;
    }
    if let Some(description) = body.description {
        task.description = description;
    }
    if let Some(position) = body.position {
        task.position = position;
    }
    if let Some(planned_start) = body.planned_start {
        task.planned_start = planned_start;
    }
    if let Some(planned_end) = body.planned_end {
        task.planned_end = planned_end;
    }
    if let Some(actual_start) = body.actual_start {
        task.actual_start = actual_start;
    }
    if let Some(actual_end) = body.actual_end {
        task.actual_end = actual_end;
    }
    if let Some(status) = body.status {
        task.status = status;
    }
    if let Some(team_id) = body.team_id {
        task.team_id = team_id;
    }
    if let Some(estimated_hours) = body.estimated_hours {
        task.estimated_hours = estimated_hours;
    }
    if let Some(hourly_rate) = body.hourly_rate {
        task.hourly_rate = hourly_rate;
    }
    if let Some(notes) = body.notes {
        task.notes = notes;
    }

    let subcontractor_ids: Option<BTreeSet<String>> =
        body.subcontractor_ids.map(|ids| ids.into_iter().collect());
    let blocked_by: Option<BTreeSet<String>> = body.blocked_by.map(|ids| ids.into_iter().collect());
    check_task(
        pool,
        &task,
        subcontractor_ids.as_ref().unwrap_or(&BTreeSet::new()),
        blocked_by.as_ref().unwrap_or(&BTreeSet::new()),
    )
    .await?;

    let previous_project = project_of_phase(pool, &previous_phase).await?;
    let project = project_of_phase(pool, &task.phase_id).await?;

    task.updated_at = Utc::now();
    let mut tx = pool.begin().await?;
    sqlx::query(
        r#"
        UPDATE tasks
        SET phase_id = ?, code = ?, name = ?, description = ?, position = ?, planned_start = ?,
            planned_end = ?, actual_start = ?, actual_end = ?, status = ?, team_id = ?,
            estimated_hours = ?, hourly_rate = ?, notes = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&task.phase_id)
    .bind(&task.code)
    .bind(&task.name)
    .bind(&task.description)
    .bind(task.position)
    .bind(task.planned_start)
    .bind(task.planned_end)
    .bind(task.actual_start)
    .bind(task.actual_end)
    .bind(task.status)
    .bind(&task.team_id)
    .bind(task.estimated_hours)
    .bind(task.hourly_rate)
    .bind(&task.notes)
    .bind(task.updated_at)
    .bind(&id)
    .execute(&mut *tx)
    .await?;
    replace_links(&mut tx, &id, subcontractor_ids.as_ref(), blocked_by.as_ref()).await?;

    if previous_project != project {
        aggregation::recompute_project_cost(&mut tx, &previous_project).await?;
        aggregation::recompute_project_cost(&mut tx, &project).await?;
    } else if previous_rate != task.hourly_rate {
        aggregation::recompute_project_cost(&mut tx, &project).await?;
    }
    tx.commit().await?;

    tracing::info!(task_id = %id, status = ?task.status, user_id = %user.id, "task updated");

    Ok(Json(task_response(pool, task).await?))
}

async fn delete_task(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    let pool = &state.db.pool;
    let task = load_task(pool, &id).await?;
    access::authorize(pool, &user.principal(), Capability::ProjectWrite, Target::Task(&id)).await?;
    let project = project_of_phase(pool, &task.phase_id).await?;

    let images = sqlx::query_scalar::<_, String>("SELECT image_ref FROM photos WHERE task_id = ?")
        .bind(&id)
        .fetch_all(pool)
        .await?;

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM tasks WHERE id = ?")
        .bind(&id)
        .execute(&mut *tx)
        .await?;
    aggregation::recompute_project_cost(&mut tx, &project).await?;
    tx.commit().await?;

    for reference in images {
        if let Err(e) = state.images.remove(&reference).await {
            tracing::warn!("Failed to remove image {reference}: {e}");
        }
    }

    tracing::info!(task_id = %id, code = %task.code, "task deleted");

    Ok(StatusCode::NO_CONTENT)
}

async fn task_hours(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Vec<HourResponse>>> {
    let pool = &state.db.pool;
    load_task(pool, &id).await?;
    let entries = sqlx::query_as::<_, WorkHourEntry>(
        "SELECT * FROM work_hours WHERE task_id = ? ORDER BY date DESC, created_at DESC",
    )
    .bind(&id)
    .fetch_all(pool)
    .await?;

    let mut responses = Vec::with_capacity(entries.len());
    for entry in entries {
        responses.push(hour_response(pool, entry).await?);
    }
    Ok(Json(responses))
}

async fn log_task_hours(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<LogHoursRequest>,
) -> Result<(StatusCode, Json<HourResponse>)> {
    let response = hours::log_hours(&state, &user, &id, body).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

async fn upload_task_photo(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<PhotoResponse>)> {
    let response = photos::upload_photo(&state, &user, &id, multipart).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

async fn task_photos(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Vec<PhotoResponse>>> {
    let pool = &state.db.pool;
    load_task(pool, &id).await?;
    let photos = sqlx::query_as::<_, PhotoReport>(
        "SELECT * FROM photos WHERE task_id = ? ORDER BY taken_at DESC",
    )
    .bind(&id)
    .fetch_all(pool)
    .await?;

    Ok(Json(
        photos
            .into_iter()
            .map(|photo| photo_response(&state, photo))
            .collect(),
    ))
}

async fn task_anomalies(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Vec<AnomalyResponse>>> {
    let pool = &state.db.pool;
    load_task(pool, &id).await?;
    let anomalies = sqlx::query_as::<_, Anomaly>(
        "SELECT * FROM anomalies WHERE task_id = ? ORDER BY created_at DESC",
    )
    .bind(&id)
    .fetch_all(pool)
    .await?;

    let mut responses = Vec::with_capacity(anomalies.len());
    for anomaly in anomalies {
        responses.push(anomaly_response(pool, anomaly).await?);
    }
    Ok(Json(responses))
}

async fn report_task_anomaly(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<ReportAnomalyRequest>,
) -> Result<(StatusCode, Json<AnomalyResponse>)> {
    let response = anomalies::report_anomaly(&state, &user, &id, body).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    use crate::{
        db::models::TaskStatus,
        test_support::{self, TestApp},
    };

    #[tokio::test]
    async fn create_with_links_and_blockers() {
        let app = TestApp::new().await;
        let chief = app.user("chief@example.com", false).await;
        let admin = app.user("admin@example.com", true).await;
        let project = test_support::insert_project(&app.state, "CH-0001", Some(chief.id.as_str())).await;
        let phase = test_support::insert_phase(&app.state, &project, 1).await;
        let blocker = test_support::insert_task(&app.state, &phase, "T-001", TaskStatus::Todo, 50.0).await;
        let token = app.token(&chief);

        let (_, sub) = app
            .request(
                Method::POST,
                "/api/subcontractors",
                Some(&app.token(&admin)),
                Some(json!({
                    "company_name": "Toitures Martin",
                    "email": "contact@martin.fr",
                    "phone": "0476000000",
                    "specialty": "ROOFING",
                    "hourly_rate": 65.0
                })),
            )
            .await;
        let sub_id = sub["id"].as_str().unwrap();

        let (status, body) = app
            .request(
                Method::POST,
                "/api/tasks",
                Some(&token),
                Some(json!({
                    "phase_id": phase,
                    "code": "T-002",
                    "name": "Charpente",
                    "planned_start": "2025-02-01",
                    "planned_end": "2025-02-15",
                    "estimated_hours": 35.0,
                    "subcontractor_ids": [sub_id],
                    "blocked_by": [blocker]
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["hourly_rate"], 50.0);
        assert_eq!(body["status"], "TODO");
        assert_eq!(body["cost"], 0.0);
        assert_eq!(body["subcontractor_ids"][0], sub_id);
        assert_eq!(body["blocked_by"][0], blocker.as_str());

        let (_, blocker_body) = app
            .request(Method::GET, &format!("/api/tasks/{blocker}"), Some(&token), None)
            .await;
        assert_eq!(blocker_body["blocks"][0], body["id"]);
        assert!(blocker_body["blocked_by"].as_array().unwrap().is_empty());

        let (status, _) = app
            .request(
                Method::POST,
                "/api/tasks",
                Some(&token),
                Some(json!({
                    "phase_id": phase,
                    "code": "T-003",
                    "name": "Couverture",
                    "planned_start": "2025-02-01",
                    "planned_end": "2025-02-15",
                    "blocked_by": ["unknown"]
                })),
            )
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn a_task_cannot_block_itself() {
        let app = TestApp::new().await;
        let chief = app.user("chief@example.com", false).await;
        let project = test_support::insert_project(&app.state, "CH-0001", Some(chief.id.as_str())).await;
        let phase = test_support::insert_phase(&app.state, &project, 1).await;
        let task = test_support::insert_task(&app.state, &phase, "T-001", TaskStatus::Todo, 50.0).await;

        let (status, body) = app
            .request(
                Method::PATCH,
                &format!("/api/tasks/{task}"),
                Some(&app.token(&chief)),
                Some(json!({"blocked_by": [task]})),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["fields"]["blocked_by"].is_array());
    }

    #[tokio::test]
    async fn rate_change_recomputes_project_cost() {
        let app = TestApp::new().await;
        let chief = app.user("chief@example.com", false).await;
        let project = test_support::insert_project(&app.state, "CH-0001", Some(chief.id.as_str())).await;
        let phase = test_support::insert_phase(&app.state, &project, 1).await;
        let task = test_support::insert_task(&app.state, &phase, "T-001", TaskStatus::InProgress, 50.0).await;
        let token = app.token(&chief);

        app.request(
            Method::POST,
            &format!("/api/tasks/{task}/hours"),
            Some(&token),
            Some(json!({"hours": 8.0})),
        )
        .await;
        assert_eq!(test_support::project(&app.state, &project).await.real_cost, 400.0);

        let (status, body) = app
            .request(
                Method::PATCH,
                &format!("/api/tasks/{task}"),
                Some(&token),
                Some(json!({"hourly_rate": 60.0, "real_hours": 1000.0})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["real_hours"], 8.0);
        assert_eq!(body["cost"], 480.0);
        assert_eq!(test_support::project(&app.state, &project).await.real_cost, 480.0);

        let (status, _) = app
            .request(Method::DELETE, &format!("/api/tasks/{task}"), Some(&token), None)
            .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(test_support::project(&app.state, &project).await.real_cost, 0.0);
    }

    #[tokio::test]
    async fn team_members_update_but_cannot_delete() {
        let app = TestApp::new().await;
        let chief = app.user("chief@example.com", false).await;
        let worker = app.user("worker@example.com", false).await;
        let project = test_support::insert_project(&app.state, "CH-0001", Some(chief.id.as_str())).await;
        let phase = test_support::insert_phase(&app.state, &project, 1).await;
        let task = test_support::insert_task(&app.state, &phase, "T-001", TaskStatus::Todo, 50.0).await;
        let team = test_support::insert_team(&app.state, "Charpentiers").await;
        test_support::assign_team(&app.state, &task, &team).await;
        test_support::insert_member(&app.state, "worker@example.com", Some(team.as_str()), Some(worker.id.as_str())).await;
        let token = app.token(&worker);

        let (status, body) = app
            .request(
                Method::PATCH,
                &format!("/api/tasks/{task}"),
                Some(&token),
                Some(json!({"status": "IN_PROGRESS"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "IN_PROGRESS");
        assert_eq!(body["team_name"], "Charpentiers");

        let (status, _) = app
            .request(Method::DELETE, &format!("/api/tasks/{task}"), Some(&token), None)
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn late_filter_matches_overdue_open_tasks() {
        let app = TestApp::new().await;
        let user = app.user("someone@example.com", false).await;
        let project = test_support::insert_project(&app.state, "CH-0001", None).await;
        let phase = test_support::insert_phase(&app.state, &project, 1).await;
        let late = test_support::insert_task(&app.state, &phase, "T-001", TaskStatus::Blocked, 50.0).await;
        let done = test_support::insert_task(&app.state, &phase, "T-002", TaskStatus::Done, 50.0).await;
        test_support::insert_task(&app.state, &phase, "T-003", TaskStatus::Todo, 50.0).await;
        for id in [&late, &done] {
            sqlx::query("UPDATE tasks SET planned_start = '2020-01-01', planned_end = '2020-02-01' WHERE id = ?")
                .bind(id)
                .execute(&app.state.db.pool)
                .await
                .unwrap();
        }
        let token = app.token(&user);

        let (status, body) = app
            .request(Method::GET, "/api/tasks?late=true", Some(&token), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["results"][0]["id"], late.as_str());
        assert_eq!(body["results"][0]["is_late"], true);

        let (_, body) = app
            .request(
                Method::GET,
                &format!("/api/tasks?project_id={project}&late=false"),
                Some(&token),
                None,
            )
            .await;
        assert_eq!(body["count"], 3);
    }
}
