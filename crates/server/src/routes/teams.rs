use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{
    db::models::{Member, Specialty, Team},
    error::{AppError, Result, ValidationErrors},
    middleware::auth::AuthUser,
    routes::{
        ensure_exists,
        members::{member_response, MemberResponse},
        nullable, ApiJson, ApiQuery, Table,
    },
    services::{
        access::{self, Capability, Target},
        filters::{fetch_page, Page, Pagination, TeamFilter},
        validation,
    },
    AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_teams).post(create_team))
        .route("/:id", get(get_team).patch(update_team).delete(delete_team))
        .route("/:id/members", get(team_members))
}

#[derive(Debug, Deserialize)]
pub struct CreateTeamRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub chief_id: Option<String>,
    pub specialty: Specialty,
    #[serde(default)]
    pub external_contract: bool,
}

#[derive(Debug, Deserialize)]
pub struct UpdateTeamRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub chief_id: Option<Option<String>>,
    pub specialty: Option<Specialty>,
    pub external_contract: Option<bool>,
    pub active: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct TeamResponse {
    #[serde(flatten)]
    pub team: Team,
    pub member_count: i64,
}

pub(crate) async fn team_response(pool: &SqlitePool, team: Team) -> Result<TeamResponse> {
    let member_count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM members WHERE team_id = ? AND active = 1",
    )
    .bind(&team.id)
    .fetch_one(pool)
    .await?;

    Ok(TeamResponse { team, member_count })
}

async fn load_team(pool: &SqlitePool, id: &str) -> Result<Team> {
    sqlx::query_as::<_, Team>("SELECT * FROM teams WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound("Team not found".to_string()))
}

async fn check_team(pool: &SqlitePool, team: &Team) -> Result<()> {
    let mut errors = ValidationErrors::new();
    validation::require_text(&mut errors, "name", &team.name, 100);

    if let Some(chief_id) = &team.chief_id {
        let leading = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM teams WHERE chief_id = ? AND id != ?",
        )
        .bind(chief_id)
        .bind(&team.id)
        .fetch_one(pool)
        .await?;
        if leading > 0 {
            errors.add("chief_id", "This member already leads another team");
        }
    }
    errors.into_result()?;

    if let Some(chief_id) = &team.chief_id {
        ensure_exists(pool, Table::Members, chief_id).await?;
    }
    Ok(())
}

async fn list_teams(
    State(state): State<AppState>,
    _user: AuthUser,
    ApiQuery(filter): ApiQuery<TeamFilter>,
) -> Result<Json<Page<TeamResponse>>> {
    let pool = &state.db.pool;
    let page = fetch_page::<Team, _>(
        pool,
        TeamFilter::SELECT,
        TeamFilter::COUNT,
        |qb| filter.push_conditions(qb),
        "name ASC",
        Pagination::new(filter.page, state.config.page_size),
    )
    .await?;

    let mut results = Vec::with_capacity(page.results.len());
    for team in page.results {
        results.push(team_response(pool, team).await?);
    }
    Ok(Json(Page {
        count: page.count,
        page: page.page,
        page_size: page.page_size,
        results,
    }))
}

async fn create_team(
    State(state): State<AppState>,
    user: AuthUser,
    ApiJson(body): ApiJson<CreateTeamRequest>,
) -> Result<(StatusCode, Json<TeamResponse>)> {
    let pool = &state.db.pool;
    access::require_admin(&user.principal())?;

    let team = Team {
        id: Uuid::new_v4().to_string(),
        name: body.name,
        description: body.description,
        chief_id: body.chief_id,
        specialty: body.specialty,
        external_contract: body.external_contract,
        active: true,
        created_at: Utc::now(),
    };
    check_team(pool, &team).await?;

    sqlx::query(
        r#"
        INSERT INTO teams (id, name, description, chief_id, specialty, external_contract, active, created_at)
        VALUES (?, ?, ?, ?, ?, ?, 1, ?)
        "#,
    )
    .bind(&team.id)
    .bind(&team.name)
    .bind(&team.description)
    .bind(&team.chief_id)
    .bind(team.specialty)
    .bind(team.external_contract)
    .bind(team.created_at)
    .execute(pool)
    .await?;

    tracing::info!(team_id = %team.id, name = %team.name, "team created");

    Ok((StatusCode::CREATED, Json(team_response(pool, team).await?)))
}

async fn get_team(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<TeamResponse>> {
    let pool = &state.db.pool;
    let team = load_team(pool, &id).await?;
    Ok(Json(team_response(pool, team).await?))
}

async fn update_team(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<UpdateTeamRequest>,
) -> Result<Json<TeamResponse>> {
    let pool = &state.db.pool;
    let mut team = load_team(pool, &id).await?;
    access::authorize(pool, &user.principal(), Capability::TeamWrite, Target::Team(&id)).await?;

    if let Some(name) = body.name {
        team.name = name;
    }
    if let Some(description) = body.description {
        team.description = description;
    }
    if let Some(chief_id) = body.chief_id {
        team.chief_id = chief_id;
    }
    if let Some(specialty) = body.specialty {
        team.specialty = specialty;
    }
    if let Some(external_contract) = body.external_contract {
        team.external_contract = external_contract;
    }
    if let Some(active) = body.active {
        team.active = active;
    }
    check_team(pool, &team).await?;

    sqlx::query(
        r#"
        UPDATE teams
        SET name = ?, description = ?, chief_id = ?, specialty = ?, external_contract = ?, active = ?
        WHERE id = ?
        "#,
    )
    .bind(&team.name)
    .bind(&team.description)
    .bind(&team.chief_id)
    .bind(team.specialty)
    .bind(team.external_contract)
    .bind(team.active)
    .bind(&id)
    .execute(pool)
    .await?;

    Ok(Json(team_response(pool, team).await?))
}

async fn delete_team(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    let pool = &state.db.pool;
    access::require_admin(&user.principal())?;
    load_team(pool, &id).await?;

    sqlx::query("DELETE FROM teams WHERE id = ?")
        .bind(&id)
        .execute(pool)
        .await?;

    tracing::info!(team_id = %id, "team deleted");

    Ok(StatusCode::NO_CONTENT)
}

async fn team_members(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Vec<MemberResponse>>> {
    let pool = &state.db.pool;
    load_team(pool, &id).await?;
    let members = sqlx::query_as::<_, Member>(
        "SELECT * FROM members WHERE team_id = ? AND active = 1 ORDER BY last_name, first_name",
    )
    .bind(&id)
    .fetch_all(pool)
    .await?;

    let mut responses = Vec::with_capacity(members.len());
    for member in members {
        responses.push(member_response(pool, member).await?);
    }
    Ok(Json(responses))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    use crate::test_support::{self, TestApp};

    #[tokio::test]
    async fn only_admins_create_teams() {
        let app = TestApp::new().await;
        let user = app.user("user@example.com", false).await;
        let admin = app.user("admin@example.com", true).await;
        let body = json!({"name": "Électriciens", "specialty": "ELECTRICAL"});

        let (status, _) = app
            .request(Method::POST, "/api/teams", Some(&app.token(&user)), Some(body.clone()))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = app
            .request(Method::POST, "/api/teams", Some(&app.token(&admin)), Some(body))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["member_count"], 0);
        assert_eq!(body["active"], true);
    }

    #[tokio::test]
    async fn members_update_their_own_team() {
        let app = TestApp::new().await;
        let insider = app.user("insider@example.com", false).await;
        let outsider = app.user("outsider@example.com", false).await;
        let team = test_support::insert_team(&app.state, "Maçons").await;
        let other = test_support::insert_team(&app.state, "Plâtriers").await;
        let chief = test_support::insert_member(&app.state, "insider@example.com", Some(team.as_str()), Some(insider.id.as_str())).await;
        test_support::insert_member(&app.state, "outsider@example.com", Some(other.as_str()), Some(outsider.id.as_str())).await;
        let uri = format!("/api/teams/{team}");

        let (status, _) = app
            .request(Method::PATCH, &uri, Some(&app.token(&outsider)), Some(json!({"description": "x"})))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = app
            .request(
                Method::PATCH,
                &uri,
                Some(&app.token(&insider)),
                Some(json!({"description": "Gros oeuvre", "chief_id": chief})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["member_count"], 1);
        assert_eq!(body["chief_id"], chief.as_str());

        // A member leads at most one team
        let (status, body) = app
            .request(
                Method::PATCH,
                &format!("/api/teams/{other}"),
                Some(&app.token(&outsider)),
                Some(json!({"chief_id": chief})),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["fields"]["chief_id"].is_array());

        let (_, body) = app
            .request(Method::GET, &format!("{uri}/members"), Some(&app.token(&outsider)), None)
            .await;
        assert_eq!(body[0]["full_name"], "Jean Dupont");
    }

    #[tokio::test]
    async fn project_teams_lists_assigned_teams() {
        let app = TestApp::new().await;
        let user = app.user("user@example.com", false).await;
        let project = test_support::insert_project(&app.state, "CH-0001", None).await;
        let phase = test_support::insert_phase(&app.state, &project, 1).await;
        let team = test_support::insert_team(&app.state, "Couvreurs").await;
        test_support::insert_team(&app.state, "Inutilisée").await;
        for code in ["T-001", "T-002"] {
            let task = test_support::insert_task(
                &app.state,
                &phase,
                code,
                crate::db::models::TaskStatus::Todo,
                50.0,
            )
            .await;
            test_support::assign_team(&app.state, &task, &team).await;
        }
        test_support::insert_member(&app.state, "w1@example.com", Some(team.as_str()), None).await;

        let (status, body) = app
            .request(Method::GET, &format!("/api/projects/{project}/teams"), Some(&app.token(&user)), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["name"], "Couvreurs");

        let (_, report) = app
            .request(Method::GET, &format!("/api/projects/{project}/report"), Some(&app.token(&user)), None)
            .await;
        assert_eq!(report["active_members"], 1);
    }
}
