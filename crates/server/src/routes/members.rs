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
    db::models::{Member, MemberRole},
    error::{AppError, Result, ValidationErrors},
    middleware::auth::AuthUser,
    routes::{ensure_exists, nullable, today, ApiJson, ApiQuery, Table},
    services::{
        access,
        aggregation::round_hours,
        filters::{fetch_page, MemberFilter, Page, Pagination},
        validation,
    },
    AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_members).post(create_member))
        .route(
            "/:id",
            get(get_member).patch(update_member).delete(delete_member),
        )
}

fn default_hourly_rate() -> f64 {
    50.0
}

#[derive(Debug, Deserialize)]
pub struct CreateMemberRequest {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(default)]
    pub phone: String,
    pub team_id: Option<String>,
    #[serde(default)]
    pub role: MemberRole,
    #[serde(default)]
    pub qualifications: String,
    #[serde(default = "default_hourly_rate")]
    pub hourly_rate: f64,
    pub hire_date: NaiveDate,
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateMemberRequest {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub team_id: Option<Option<String>>,
    pub role: Option<MemberRole>,
    pub qualifications: Option<String>,
    pub hourly_rate: Option<f64>,
    pub hire_date: Option<NaiveDate>,
    pub active: Option<bool>,
    #[serde(default, deserialize_with = "nullable")]
    pub user_id: Option<Option<String>>,
}

#[derive(Debug, Serialize)]
pub struct MemberResponse {
    #[serde(flatten)]
    pub member: Member,
    pub full_name: String,
    pub hours_this_month: f64,
}

pub(crate) async fn member_response(pool: &SqlitePool, member: Member) -> Result<MemberResponse> {
    let hours = sqlx::query_scalar::<_, f64>(
        "SELECT COALESCE(SUM(hours), 0.0) FROM work_hours WHERE member_id = ? AND strftime('%Y-%m', date) = ?",
    )
    .bind(&member.id)
    .bind(today().format("%Y-%m").to_string())
    .fetch_one(pool)
    .await?;

    Ok(MemberResponse {
        full_name: member.full_name(),
        hours_this_month: round_hours(hours),
        member,
    })
}

async fn load_member(pool: &SqlitePool, id: &str) -> Result<Member> {
    sqlx::query_as::<_, Member>("SELECT * FROM members WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound("Member not found".to_string()))
}

async fn check_member(pool: &SqlitePool, member: &Member) -> Result<()> {
    let mut errors = ValidationErrors::new();
    validation::require_text(&mut errors, "first_name", &member.first_name, 100);
    validation::require_text(&mut errors, "last_name", &member.last_name, 100);
    validation::email(&mut errors, "email", &member.email);
    validation::max_length(&mut errors, "phone", &member.phone, 20);
    validation::non_negative(&mut errors, "hourly_rate", member.hourly_rate);

    let email_taken = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM members WHERE email = ? AND id != ?",
    )
    .bind(&member.email)
    .bind(&member.id)
    .fetch_one(pool)
    .await?;
    if email_taken > 0 {
        errors.add("email", "A member with this email already exists");
    }

    if let Some(user_id) = &member.user_id {
        let linked = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM members WHERE user_id = ? AND id != ?",
        )
        .bind(user_id)
        .bind(&member.id)
        .fetch_one(pool)
        .await?;
        if linked > 0 {
            errors.add("user_id", "This account is already linked to another member");
        }
    }
    errors.into_result()?;

    if let Some(team_id) = &member.team_id {
        ensure_exists(pool, Table::Teams, team_id).await?;
    }
    if let Some(user_id) = &member.user_id {
        ensure_exists(pool, Table::Users, user_id).await?;
    }
    Ok(())
}

async fn list_members(
    State(state): State<AppState>,
    _user: AuthUser,
    ApiQuery(filter): ApiQuery<MemberFilter>,
) -> Result<Json<Page<MemberResponse>>> {
    let pool = &state.db.pool;
    let order = filter.order();
    let page = fetch_page::<Member, _>(
        pool,
        MemberFilter::SELECT,
        MemberFilter::COUNT,
        |qb| filter.push_conditions(qb),
        &order,
        Pagination::new(filter.page, state.config.page_size),
    )
    .await?;

    let mut results = Vec::with_capacity(page.results.len());
    for member in page.results {
        results.push(member_response(pool, member).await?);
    }
    Ok(Json(Page {
        count: page.count,
        page: page.page,
        page_size: page.page_size,
        results,
    }))
}

async fn create_member(
    State(state): State<AppState>,
    user: AuthUser,
    ApiJson(body): ApiJson<CreateMemberRequest>,
) -> Result<(StatusCode, Json<MemberResponse>)> {
    let pool = &state.db.pool;
    access::require_admin(&user.principal())?;

    let member = Member {
        id: Uuid::new_v4().to_string(),
        first_name: body.first_name,
        last_name: body.last_name,
        email: body.email.trim().to_lowercase(),
        phone: body.phone,
        team_id: body.team_id,
        role: body.role,
        qualifications: body.qualifications,
        hourly_rate: body.hourly_rate,
        hire_date: body.hire_date,
        active: true,
        user_id: body.user_id,
        created_at: Utc::now(),
    };
    check_member(pool, &member).await?;

    sqlx::query(
        r#"
        INSERT INTO members (id, first_name, last_name, email, phone, team_id, role,
                             qualifications, hourly_rate, hire_date, active, user_id, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
        "#,
    )
    .bind(&member.id)
    .bind(&member.first_name)
    .bind(&member.last_name)
    .bind(&member.email)
    .bind(&member.phone)
    .bind(&member.team_id)
    .bind(member.role)
    .bind(&member.qualifications)
    .bind(member.hourly_rate)
    .bind(member.hire_date)
    .bind(&member.user_id)
    .bind(member.created_at)
    .execute(pool)
    .await?;

    tracing::info!(member_id = %member.id, email = %member.email, "member created");

    Ok((StatusCode::CREATED, Json(member_response(pool, member).await?)))
}

async fn get_member(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<MemberResponse>> {
    let pool = &state.db.pool;
    let member = load_member(pool, &id).await?;
    Ok(Json(member_response(pool, member).await?))
}

async fn update_member(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<UpdateMemberRequest>,
) -> Result<Json<MemberResponse>> {
    let pool = &state.db.pool;
    access::require_admin(&user.principal())?;
    let mut member = load_member(pool, &id).await?;

    if let Some(first_name) = body.first_name {
        member.first_name = first_name;
    }
    if let Some(last_name) = body.last_name {
        member.last_name = last_name;
    }
    if let Some(email) = body.email {
        member.email = email.trim().to_lowercase();
    }
    if let Some(phone) = body.phone {
        member.phone = phone;
    }
    if let Some(team_id) = body.team_id {
        member.team_id = team_id;
    }
    if let Some(role) = body.role {
        member.role = role;
    }
    if let Some(qualifications) = body.qualifications {
        member.qualifications = qualifications;
    }
    if let Some(hourly_rate) = body.hourly_rate {
        member.hourly_rate = hourly_rate;
    }
    if let Some(hire_date) = body.hire_date {
        member.hire_date = hire_date;
    }
    if let Some(active) = body.active {
        member.active = active;
    }
    if let Some(user_id) = body.user_id {
        member.user_id = user_id;
    }
    check_member(pool, &member).await?;

    sqlx::query(
        r#"
        UPDATE members
        SET first_name = ?, last_name = ?, email = ?, phone = ?, team_id = ?, role = ?,
            qualifications = ?, hourly_rate = ?, hire_date = ?, active = ?, user_id = ?
        WHERE id = ?
        "#,
    )
    .bind(&member.first_name)
    .bind(&member.last_name)
    .bind(&member.email)
    .bind(&member.phone)
    .bind(&member.team_id)
    .bind(member.role)
    .bind(&member.qualifications)
    .bind(member.hourly_rate)
    .bind(member.hire_date)
    .bind(member.active)
    .bind(&member.user_id)
    .bind(&id)
    .execute(pool)
    .await?;

    Ok(Json(member_response(pool, member).await?))
}

async fn delete_member(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    let pool = &state.db.pool;
    access::require_admin(&user.principal())?;
    load_member(pool, &id).await?;

    // Entries keep their hours; only the member reference is cleared
    sqlx::query("DELETE FROM members WHERE id = ?")
        .bind(&id)
        .execute(pool)
        .await?;

    tracing::info!(member_id = %id, "member deleted");

    Ok(StatusCode::NO_CONTENT)
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
    async fn admin_manages_members() {
        let app = TestApp::new().await;
        let admin = app.user("admin@example.com", true).await;
        let user = app.user("user@example.com", false).await;
        let team = test_support::insert_team(&app.state, "Maçons").await;
        let body = json!({
            "first_name": "Marie",
            "last_name": "Curie",
            "email": "Marie@Example.com",
            "team_id": team,
            "hire_date": "2024-09-01"
        });

        let (status, _) = app
            .request(Method::POST, "/api/members", Some(&app.token(&user)), Some(body.clone()))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let token = app.token(&admin);
        let (status, created) = app
            .request(Method::POST, "/api/members", Some(&token), Some(body.clone()))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["email"], "marie@example.com");
        assert_eq!(created["role"], "WORKER");
        assert_eq!(created["hourly_rate"], 50.0);
        assert_eq!(created["full_name"], "Marie Curie");

        let (status, errors) = app
            .request(Method::POST, "/api/members", Some(&token), Some(body))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(errors["fields"]["email"].is_array());

        let (_, page) = app
            .request(Method::GET, "/api/members?search=curie", Some(&token), None)
            .await;
        assert_eq!(page["count"], 1);
    }

    #[tokio::test]
    async fn hours_this_month_sums_member_entries() {
        let app = TestApp::new().await;
        let admin = app.user("admin@example.com", true).await;
        let project = test_support::insert_project(&app.state, "CH-0001", None).await;
        let phase = test_support::insert_phase(&app.state, &project, 1).await;
        let task = test_support::insert_task(&app.state, &phase, "T-001", TaskStatus::Todo, 50.0).await;
        let member = test_support::insert_member(&app.state, "w@example.com", None, None).await;
        let token = app.token(&admin);

        for hours in [3.5, 4.0] {
            app.request(
                Method::POST,
                &format!("/api/tasks/{task}/hours"),
                Some(&token),
                Some(json!({"hours": hours, "member_id": member})),
            )
            .await;
        }
        app.request(
            Method::POST,
            &format!("/api/tasks/{task}/hours"),
            Some(&token),
            Some(json!({"hours": 8.0, "member_id": member, "date": "2001-01-01"})),
        )
        .await;

        let (status, body) = app
            .request(Method::GET, &format!("/api/members/{member}"), Some(&token), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["hours_this_month"], 7.5);
    }
}
