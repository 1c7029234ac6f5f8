use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{
    db::models::PhotoReport,
    error::{AppError, Result, ValidationErrors},
    middleware::auth::AuthUser,
    routes::{ensure_exists, Table},
    services::{
        access::{self, Capability, Target},
        validation,
    },
    AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/:id", get(get_photo).delete(delete_photo))
        .route("/:id/approve", post(approve_photo))
}

#[derive(Debug, Serialize)]
pub struct PhotoResponse {
    #[serde(flatten)]
    pub photo: PhotoReport,
    pub url: String,
}

pub(crate) fn photo_response(state: &AppState, photo: PhotoReport) -> PhotoResponse {
    PhotoResponse {
        url: state.images.resolve(&photo.image_ref),
        photo,
    }
}

async fn load_photo(pool: &SqlitePool, id: &str) -> Result<PhotoReport> {
    sqlx::query_as::<_, PhotoReport>("SELECT * FROM photos WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound("Photo not found".to_string()))
}

#[derive(Debug, Default)]
struct PhotoUpload {
    file_name: Option<String>,
    bytes: Vec<u8>,
    title: String,
    description: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
    taken_at: Option<DateTime<Utc>>,
}

async fn read_upload(mut multipart: Multipart) -> Result<PhotoUpload> {
    let mut upload = PhotoUpload::default();
    let mut errors = ValidationErrors::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("Failed to read multipart field: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" => {
                upload.file_name = Some(field.file_name().unwrap_or_default().to_string());
                upload.bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::BadRequest(format!("Failed to read image: {e}")))?
                    .to_vec();
            }
            "title" | "description" | "latitude" | "longitude" | "taken_at" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| AppError::BadRequest(format!("Failed to read {name}: {e}")))?;
                let value = value.trim().to_string();
                match name.as_str() {
                    "title" => upload.title = value,
                    "description" => upload.description = value,
                    "latitude" | "longitude" if value.is_empty() => {}
                    "latitude" => match value.parse() {
                        Ok(lat) => upload.latitude = Some(lat),
                        Err(_) => errors.add("latitude", "Must be a number"),
                    },
                    "longitude" => match value.parse() {
                        Ok(lon) => upload.longitude = Some(lon),
                        Err(_) => errors.add("longitude", "Must be a number"),
                    },
                    _ if value.is_empty() => {}
                    _ => match DateTime::parse_from_rfc3339(&value) {
                        Ok(taken_at) => upload.taken_at = Some(taken_at.with_timezone(&Utc)),
                        Err(_) => errors.add("taken_at", "Must be an RFC 3339 timestamp"),
                    },
                }
            }
            _ => {}
        }
    }

    if upload.file_name.is_none() {
        errors.add("image", "No image was provided");
    }
    validation::max_length(&mut errors, "title", &upload.title, 200);
    validation::coordinates(&mut errors, upload.latitude, upload.longitude);
    errors.into_result()?;

    Ok(upload)
}

/// Stores an uploaded image and records it as a photo report of the task.
pub(crate) async fn upload_photo(
    state: &AppState,
    user: &AuthUser,
    task_id: &str,
    multipart: Multipart,
) -> Result<PhotoResponse> {
    let pool = &state.db.pool;
    ensure_exists(pool, Table::Tasks, task_id).await?;
    access::authorize(pool, &user.principal(), Capability::FieldWrite, Target::Task(task_id)).await?;

    let upload = read_upload(multipart).await?;
    let file_name = upload.file_name.unwrap_or_default();
    let image_ref = state
        .images
        .store(&file_name, &upload.bytes, &state.image_constraints())
        .await?;

    let now = Utc::now();
    let photo = PhotoReport {
        id: Uuid::new_v4().to_string(),
        task_id: task_id.to_string(),
        title: upload.title,
        description: upload.description,
        image_ref,
        latitude: upload.latitude,
        longitude: upload.longitude,
        taken_at: upload.taken_at.unwrap_or(now),
        approved: false,
        approved_by: None,
        uploaded_by: Some(user.id.clone()),
        uploaded_at: now,
    };

    let inserted = sqlx::query(
        r#"
        INSERT INTO photos (id, task_id, title, description, image_ref, latitude, longitude,
                            taken_at, approved, approved_by, uploaded_by, uploaded_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, NULL, ?, ?)
        "#,
    )
    .bind(&photo.id)
    .bind(&photo.task_id)
    .bind(&photo.title)
    .bind(&photo.description)
    .bind(&photo.image_ref)
    .bind(photo.latitude)
    .bind(photo.longitude)
    .bind(photo.taken_at)
    .bind(&photo.uploaded_by)
    .bind(photo.uploaded_at)
    .execute(pool)
    .await;

    if let Err(e) = inserted {
        // Don't leave an orphaned file behind
        if let Err(cleanup) = state.images.remove(&photo.image_ref).await {
            tracing::warn!("Failed to remove image {}: {cleanup}", photo.image_ref);
        }
        return Err(e.into());
    }

    tracing::info!(
        photo_id = %photo.id,
        task_id,
        size = upload.bytes.len(),
        uploaded_by = %user.id,
        "photo uploaded"
    );

    Ok(photo_response(state, photo))
}

async fn get_photo(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<PhotoResponse>> {
    let photo = load_photo(&state.db.pool, &id).await?;
    Ok(Json(photo_response(&state, photo)))
}

async fn delete_photo(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    let pool = &state.db.pool;
    let photo = load_photo(pool, &id).await?;
    access::authorize(pool, &user.principal(), Capability::FieldWrite, Target::Photo(&id)).await?;

    sqlx::query("DELETE FROM photos WHERE id = ?")
        .bind(&id)
        .execute(pool)
        .await?;
    if let Err(e) = state.images.remove(&photo.image_ref).await {
        tracing::warn!("Failed to remove image {}: {e}", photo.image_ref);
    }

    tracing::info!(photo_id = %id, user_id = %user.id, "photo deleted");

    Ok(StatusCode::NO_CONTENT)
}

async fn approve_photo(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<PhotoResponse>> {
    let pool = &state.db.pool;
    let mut photo = load_photo(pool, &id).await?;
    access::authorize(pool, &user.principal(), Capability::ProjectWrite, Target::Photo(&id)).await?;

    sqlx::query("UPDATE photos SET approved = 1, approved_by = ? WHERE id = ?")
        .bind(&user.id)
        .bind(&id)
        .execute(pool)
        .await?;
    photo.approved = true;
    photo.approved_by = Some(user.id.clone());

    tracing::info!(photo_id = %id, approved_by = %user.id, "photo approved");

    Ok(Json(photo_response(&state, photo)))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{header, Method, Request, StatusCode},
    };

    use crate::{
        db::models::TaskStatus,
        test_support::{self, TestApp},
    };

    const MB: usize = 1024 * 1024;
    const BOUNDARY: &str = "chantier-boundary";

    fn multipart_body(file_name: &str, size: usize, title: &str) -> Vec<u8> {
        let mut body = Vec::with_capacity(size + 512);
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"title\"\r\n\r\n{title}\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"image\"; filename=\"{file_name}\"\r\nContent-Type: image/jpeg\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend(std::iter::repeat(0xAB).take(size));
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload(uri: &str, token: &str, body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn task_with_chief(app: &TestApp) -> (String, String) {
        let chief = app.user("chief@example.com", false).await;
        let project = test_support::insert_project(&app.state, "CH-0001", Some(chief.id.as_str())).await;
        let phase = test_support::insert_phase(&app.state, &project, 1).await;
        let task = test_support::insert_task(&app.state, &phase, "T-001", TaskStatus::InProgress, 50.0).await;
        (task, app.token(&chief))
    }

    #[tokio::test]
    async fn size_limit_applies_to_uploads() {
        let app = TestApp::new().await;
        let (task, token) = task_with_chief(&app).await;
        let uri = format!("/api/tasks/{task}/photo");

        let (status, body) = app
            .send(upload(&uri, &token, multipart_body("facade.jpg", 6 * MB, "Façade")))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["fields"]["image"][0].as_str().unwrap().contains("5 MB"));

        let (status, body) = app
            .send(upload(&uri, &token, multipart_body("facade.jpg", 4 * MB, "Façade")))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["title"], "Façade");
        assert_eq!(body["approved"], false);
        assert!(body["url"].as_str().unwrap().starts_with("/media/photos/"));

        let image_ref = body["image_ref"].as_str().unwrap();
        assert!(std::path::Path::new(&app.state.config.media_path)
            .join(image_ref)
            .exists());
    }

    #[tokio::test]
    async fn rejects_disallowed_formats() {
        let app = TestApp::new().await;
        let (task, token) = task_with_chief(&app).await;

        let (status, body) = app
            .send(upload(
                &format!("/api/tasks/{task}/photo"),
                &token,
                multipart_body("plan.gif", 1024, "Plan"),
            ))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["fields"]["image"].is_array());
    }

    #[tokio::test]
    async fn approval_and_deletion() {
        let app = TestApp::new().await;
        let (task, token) = task_with_chief(&app).await;
        let worker = app.user("worker@example.com", false).await;

        let (_, body) = app
            .send(upload(
                &format!("/api/tasks/{task}/photo"),
                &token,
                multipart_body("toit.png", 2048, "Toiture"),
            ))
            .await;
        let id = body["id"].as_str().unwrap().to_string();
        let image_ref = body["image_ref"].as_str().unwrap().to_string();

        let (status, _) = app
            .request(
                Method::POST,
                &format!("/api/photos/{id}/approve"),
                Some(&app.token(&worker)),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = app
            .request(Method::POST, &format!("/api/photos/{id}/approve"), Some(&token), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["approved"], true);

        let (status, _) = app
            .request(Method::DELETE, &format!("/api/photos/{id}"), Some(&token), None)
            .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(!std::path::Path::new(&app.state.config.media_path)
            .join(image_ref)
            .exists());

        let (status, _) = app
            .request(Method::GET, &format!("/api/photos/{id}"), Some(&token), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
