pub mod anomalies;
pub mod auth;
pub mod hours;
pub mod members;
pub mod phases;
pub mod photos;
pub mod projects;
pub mod subcontractors;
pub mod tasks;
pub mod teams;

use axum::{
    async_trait,
    extract::{
        rejection::{JsonRejection, QueryRejection},
        FromRequest, FromRequestParts, Query, Request,
    },
    http::request::Parts,
    Json,
};
use chrono::{NaiveDate, Utc};
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use sqlx::SqlitePool;

use crate::error::{AppError, Result};

/// JSON body extractor whose rejections render as 400 like other validation failures.
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> std::result::Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|e: JsonRejection| AppError::BadRequest(e.body_text()))?;
        Ok(Self(value))
    }
}

/// Query string extractor with the same error shape as [`ApiJson`].
pub struct ApiQuery<T>(pub T);

#[async_trait]
impl<T, S> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state)
            .await
            .map_err(|e: QueryRejection| AppError::BadRequest(e.body_text()))?;
        Ok(Self(value))
    }
}

/// Distinguishes an absent field (`None`) from an explicit `null` (`Some(None)`).
pub fn nullable<'de, D, T>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct UserSummary {
    pub id: String,
    pub name: String,
    pub email: String,
}

pub async fn user_summary(pool: &SqlitePool, id: Option<&str>) -> Result<Option<UserSummary>> {
    let Some(id) = id else {
        return Ok(None);
    };
    let user = sqlx::query_as::<_, UserSummary>("SELECT id, name, email FROM users WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(user)
}

/// Fails with 404 when a referenced row is missing.
pub async fn ensure_exists(pool: &SqlitePool, table: Table, id: &str) -> Result<()> {
    let sql = format!("SELECT COUNT(*) FROM {} WHERE id = ?", table.name());
    let count = sqlx::query_scalar::<_, i64>(&sql)
        .bind(id)
        .fetch_one(pool)
        .await?;

    if count == 0 {
        return Err(AppError::NotFound(format!("{} not found", table.label())));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub enum Table {
    Users,
    Teams,
    Members,
    Subcontractors,
    Tasks,
    Photos,
}

impl Table {
    fn name(self) -> &'static str {
        match self {
            Table::Users => "users",
            Table::Teams => "teams",
            Table::Members => "members",
            Table::Subcontractors => "subcontractors",
            Table::Tasks => "tasks",
            Table::Photos => "photos",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Table::Users => "User",
            Table::Teams => "Team",
            Table::Members => "Member",
            Table::Subcontractors => "Subcontractor",
            Table::Tasks => "Task",
            Table::Photos => "Photo",
        }
    }
}
