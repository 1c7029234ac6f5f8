use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use chrono::{Duration, Utc};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;

use crate::{
    config::Config,
    db::{
        models::{Project, Specialty, Task, TaskStatus},
        Database,
    },
    middleware::auth::AuthUser,
    routes::auth::create_token,
    services::storage::LocalImageStore,
    AppState,
};

pub struct TestApp {
    pub state: AppState,
    router: Router,
    _dir: TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let database_url = format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("test.db").to_string_lossy()
        );
        let db = Database::connect(&database_url).await.unwrap();
        db.run_migrations().await.unwrap();

        let media_path = dir.path().join("media");
        let images = LocalImageStore::new(&media_path, "/media");
        images.init().await.unwrap();

        let config = Config {
            port: 0,
            database_url,
            media_path: media_path.to_string_lossy().to_string(),
            media_url: "/media".to_string(),
            jwt_secret: "test-secret".to_string(),
            token_ttl_days: 1,
            page_size: 20,
            max_image_bytes: 5 * 1024 * 1024,
            max_request_bytes: 20 * 1024 * 1024,
        };

        let state = AppState {
            db,
            config,
            images: Arc::new(images),
        };
        let router = crate::app(state.clone());

        Self {
            state,
            router,
            _dir: dir,
        }
    }

    pub async fn user(&self, email: &str, is_admin: bool) -> AuthUser {
        let id = Uuid::new_v4().to_string();
        let name = email.split('@').next().unwrap_or(email).to_string();
        sqlx::query(
            "INSERT INTO users (id, email, name, password_hash, is_admin, created_at) VALUES (?, ?, ?, '!', ?, ?)",
        )
        .bind(&id)
        .bind(email)
        .bind(&name)
        .bind(is_admin)
        .bind(Utc::now())
        .execute(&self.state.db.pool)
        .await
        .unwrap();

        AuthUser {
            id,
            email: email.to_string(),
            name,
            is_admin,
        }
    }

    pub fn token(&self, user: &AuthUser) -> String {
        create_token(user, &self.state.config.jwt_secret, 1).unwrap()
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&json).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        self.send(request).await
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }
}

pub async fn insert_project(state: &AppState, code: &str, chief_id: Option<&str>) -> String {
    let id = Uuid::new_v4().to_string();
    let today = Utc::now().date_naive();
    sqlx::query(
        r#"
        INSERT INTO projects (id, code, name, city, start_date, planned_end_date, status, chief_id,
                              budget_total, created_at, updated_at)
        VALUES (?, ?, ?, 'Lyon', ?, ?, 'IN_PROGRESS', ?, 50000, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(code)
    .bind(format!("Project {code}"))
    .bind(today - Duration::days(30))
    .bind(today + Duration::days(60))
    .bind(chief_id)
    .bind(Utc::now())
    .bind(Utc::now())
    .execute(&state.db.pool)
    .await
    .unwrap();
    id
}

pub async fn insert_phase(state: &AppState, project_id: &str, number: i64) -> String {
    let id = Uuid::new_v4().to_string();
    let today = Utc::now().date_naive();
    sqlx::query(
        r#"
        INSERT INTO phases (id, project_id, number, name, planned_start, planned_end, budget,
                            status, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, 10000, 'IN_PROGRESS', ?, ?)
        "#,
    )
    .bind(&id)
    .bind(project_id)
    .bind(number)
    .bind(format!("Phase {number}"))
    .bind(today - Duration::days(30))
    .bind(today + Duration::days(30))
    .bind(Utc::now())
    .bind(Utc::now())
    .execute(&state.db.pool)
    .await
    .unwrap();
    id
}

pub async fn insert_task(
    state: &AppState,
    phase_id: &str,
    code: &str,
    status: TaskStatus,
    hourly_rate: f64,
) -> String {
    let id = Uuid::new_v4().to_string();
    let today = Utc::now().date_naive();
    sqlx::query(
        r#"
        INSERT INTO tasks (id, phase_id, code, name, planned_start, planned_end, status,
                           estimated_hours, hourly_rate, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, 40, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(phase_id)
    .bind(code)
    .bind(format!("Task {code}"))
    .bind(today - Duration::days(10))
    .bind(today + Duration::days(10))
    .bind(status)
    .bind(hourly_rate)
    .bind(Utc::now())
    .bind(Utc::now())
    .execute(&state.db.pool)
    .await
    .unwrap();
    id
}

/// Inserts a raw entry without running the cascade.
pub async fn insert_hours(state: &AppState, task_id: &str, hours: f64) -> String {
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO work_hours (id, task_id, date, hours, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(task_id)
    .bind(Utc::now().date_naive())
    .bind(hours)
    .bind(Utc::now())
    .bind(Utc::now())
    .execute(&state.db.pool)
    .await
    .unwrap();
    id
}

pub async fn insert_team(state: &AppState, name: &str) -> String {
    let id = Uuid::new_v4().to_string();
    sqlx::query("INSERT INTO teams (id, name, specialty, created_at) VALUES (?, ?, ?, ?)")
        .bind(&id)
        .bind(name)
        .bind(Specialty::Masonry)
        .bind(Utc::now())
        .execute(&state.db.pool)
        .await
        .unwrap();
    id
}

pub async fn insert_member(
    state: &AppState,
    email: &str,
    team_id: Option<&str>,
    user_id: Option<&str>,
) -> String {
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO members (id, first_name, last_name, email, team_id, hire_date, user_id, created_at)
        VALUES (?, 'Jean', 'Dupont', ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(email)
    .bind(team_id)
    .bind(Utc::now().date_naive() - Duration::days(365))
    .bind(user_id)
    .bind(Utc::now())
    .execute(&state.db.pool)
    .await
    .unwrap();
    id
}

pub async fn assign_team(state: &AppState, task_id: &str, team_id: &str) {
    sqlx::query("UPDATE tasks SET team_id = ? WHERE id = ?")
        .bind(team_id)
        .bind(task_id)
        .execute(&state.db.pool)
        .await
        .unwrap();
}

pub async fn task(state: &AppState, id: &str) -> Task {
    sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = ?")
        .bind(id)
        .fetch_one(&state.db.pool)
        .await
        .unwrap()
}

pub async fn project(state: &AppState, id: &str) -> Project {
    sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = ?")
        .bind(id)
        .fetch_one(&state.db.pool)
        .await
        .unwrap()
}
