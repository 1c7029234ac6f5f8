use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{
    extract::State,
    http::StatusCode,
    routing::post,
    Json, Router,
};
use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{AppError, Result, ValidationErrors},
    middleware::auth::AuthUser,
    routes::ApiJson,
    AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub name: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub user: UserResponse,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: String,
    pub email: String,
    pub name: String,
    pub is_admin: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user id
    pub email: String,
    pub name: String,
    #[serde(default)]
    pub is_admin: bool,
    pub exp: usize,
}

fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|_| AppError::Internal("Failed to hash password".to_string()))
}

fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed_hash = PasswordHash::new(hash)
        .map_err(|_| AppError::Internal("Invalid password hash".to_string()))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

pub fn create_token(user: &AuthUser, secret: &str, ttl_days: i64) -> Result<String> {
    let expiration = Utc::now()
        .checked_add_signed(chrono::Duration::days(ttl_days))
        .ok_or_else(|| AppError::Internal("Token expiry out of range".to_string()))?
        .timestamp() as usize;

    let claims = Claims {
        sub: user.id.clone(),
        email: user.email.clone(),
        name: user.name.clone(),
        is_admin: user.is_admin,
        exp: expiration,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|_| AppError::Internal("Failed to create token".to_string()))
}

fn auth_response(user: AuthUser, state: &AppState) -> Result<AuthResponse> {
    let token = create_token(&user, &state.config.jwt_secret, state.config.token_ttl_days)?;
    Ok(AuthResponse {
        token,
        user: UserResponse {
            id: user.id,
            email: user.email,
            name: user.name,
            is_admin: user.is_admin,
        },
    })
}

async fn register(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<RegisterRequest>,
) -> Result<(StatusCode, Json<AuthResponse>)> {
    let mut errors = ValidationErrors::new();
    if body.email.is_empty() || !body.email.contains('@') {
        errors.add("email", "Invalid email address");
    }
    if body.name.trim().is_empty() {
        errors.add("name", "Name is required");
    }
    if body.password.len() < 8 {
        errors.add("password", "Password must be at least 8 characters");
    }
    errors.into_result()?;

    let existing = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users WHERE email = ?")
        .bind(&body.email)
        .fetch_one(&state.db.pool)
        .await?;

    if existing > 0 {
        return Err(AppError::invalid("email", "Email already registered"));
    }

    let password_hash = hash_password(&body.password)?;

    let user_id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO users (id, email, name, password_hash, is_admin, created_at) VALUES (?, ?, ?, ?, 0, ?)",
    )
    .bind(&user_id)
    .bind(&body.email)
    .bind(&body.name)
    .bind(&password_hash)
    .bind(Utc::now())
    .execute(&state.db.pool)
    .await?;

    tracing::info!(user_id = %user_id, "user registered");

    let user = AuthUser {
        id: user_id,
        email: body.email,
        name: body.name,
        is_admin: false,
    };
    Ok((StatusCode::CREATED, Json(auth_response(user, &state)?)))
}

async fn login(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<LoginRequest>,
) -> Result<Json<AuthResponse>> {
    let user = sqlx::query_as::<_, crate::db::models::User>("SELECT * FROM users WHERE email = ?")
        .bind(&body.email)
        .fetch_optional(&state.db.pool)
        .await?
        .ok_or(AppError::Unauthorized)?;

    if !verify_password(&body.password, &user.password_hash)? {
        return Err(AppError::Unauthorized);
    }

    let user = AuthUser {
        id: user.id,
        email: user.email,
        name: user.name,
        is_admin: user.is_admin,
    };
    Ok(Json(auth_response(user, &state)?))
}

pub async fn me(user: AuthUser) -> Json<UserResponse> {
    Json(UserResponse {
        id: user.id,
        email: user.email,
        name: user.name,
        is_admin: user.is_admin,
    })
}
