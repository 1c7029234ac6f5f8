use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{
    db::models::{Specialty, Subcontractor},
    error::{AppError, Result, ValidationErrors},
    middleware::auth::AuthUser,
    routes::{ApiJson, ApiQuery},
    services::{
        access,
        filters::{fetch_page, Page, Pagination, SubcontractorFilter},
        validation,
    },
    AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_subcontractors).post(create_subcontractor))
        .route(
            "/:id",
            get(get_subcontractor)
                .patch(update_subcontractor)
                .delete(delete_subcontractor),
        )
}

/// The rating is maintained outside the API and is never accepted here.
#[derive(Debug, Deserialize)]
pub struct CreateSubcontractorRequest {
    pub company_name: String,
    #[serde(default)]
    pub contact_name: String,
    pub email: String,
    pub phone: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub postal_code: String,
    #[serde(default)]
    pub city: String,
    pub specialty: Specialty,
    pub hourly_rate: f64,
    #[serde(default)]
    pub payment_terms: String,
    #[serde(default)]
    pub reference_code: String,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateSubcontractorRequest {
    pub company_name: Option<String>,
    pub contact_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub postal_code: Option<String>,
    pub city: Option<String>,
    pub specialty: Option<Specialty>,
    pub hourly_rate: Option<f64>,
    pub payment_terms: Option<String>,
    pub reference_code: Option<String>,
    pub active: Option<bool>,
    pub notes: Option<String>,
}

async fn load_subcontractor(pool: &SqlitePool, id: &str) -> Result<Subcontractor> {
    sqlx::query_as::<_, Subcontractor>("SELECT * FROM subcontractors WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound("Subcontractor not found".to_string()))
}

fn validate_subcontractor(sub: &Subcontractor) -> ValidationErrors {
    let mut errors = ValidationErrors::new();
    validation::require_text(&mut errors, "company_name", &sub.company_name, 200);
    validation::email(&mut errors, "email", &sub.email);
    validation::require_text(&mut errors, "phone", &sub.phone, 20);
    validation::non_negative(&mut errors, "hourly_rate", sub.hourly_rate);
    validation::max_length(&mut errors, "reference_code", &sub.reference_code, 50);
    errors
}

async fn list_subcontractors(
    State(state): State<AppState>,
    _user: AuthUser,
    ApiQuery(filter): ApiQuery<SubcontractorFilter>,
) -> Result<Json<Page<Subcontractor>>> {
    let order = filter.order();
    let page = fetch_page::<Subcontractor, _>(
        &state.db.pool,
        SubcontractorFilter::SELECT,
        SubcontractorFilter::COUNT,
        |qb| filter.push_conditions(qb),
        &order,
        Pagination::new(filter.page, state.config.page_size),
    )
    .await?;
    Ok(Json(page))
}

async fn create_subcontractor(
    State(state): State<AppState>,
    user: AuthUser,
    ApiJson(body): ApiJson<CreateSubcontractorRequest>,
) -> Result<(StatusCode, Json<Subcontractor>)> {
    let pool = &state.db.pool;
    access::require_admin(&user.principal())?;

    let sub = Subcontractor {
        id: Uuid::new_v4().to_string(),
        company_name: body.company_name,
        contact_name: body.contact_name,
        email: body.email.trim().to_string(),
        phone: body.phone,
        address: body.address,
        postal_code: body.postal_code,
        city: body.city,
        specialty: body.specialty,
        hourly_rate: body.hourly_rate,
        payment_terms: body.payment_terms,
        reference_code: body.reference_code,
        rating: 5.0,
        active: true,
        notes: body.notes,
        created_at: Utc::now(),
    };
    validate_subcontractor(&sub).into_result()?;

    sqlx::query(
        r#"
        INSERT INTO subcontractors (id, company_name, contact_name, email, phone, address,
                                    postal_code, city, specialty, hourly_rate, payment_terms,
                                    reference_code, rating, active, notes, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
        "#,
    )
    .bind(&sub.id)
    .bind(&sub.company_name)
    .bind(&sub.contact_name)
    .bind(&sub.email)
    .bind(&sub.phone)
    .bind(&sub.address)
    .bind(&sub.postal_code)
    .bind(&sub.city)
    .bind(sub.specialty)
    .bind(sub.hourly_rate)
    .bind(&sub.payment_terms)
    .bind(&sub.reference_code)
    .bind(sub.rating)
    .bind(&sub.notes)
    .bind(sub.created_at)
    .execute(pool)
    .await?;

    tracing::info!(subcontractor_id = %sub.id, company = %sub.company_name, "subcontractor created");

    Ok((StatusCode::CREATED, Json(sub)))
}

async fn get_subcontractor(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Subcontractor>> {
    Ok(Json(load_subcontractor(&state.db.pool, &id).await?))
}

async fn update_subcontractor(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<UpdateSubcontractorRequest>,
) -> Result<Json<Subcontractor>> {
    let pool = &state.db.pool;
    access::require_admin(&user.principal())?;
    let mut sub = load_subcontractor(pool, &id).await?;

    if let Some(company_name) = body.company_name {
        sub.company_name = company_name;
    }
    if let Some(contact_name) = body.contact_name {
        sub.contact_name = contact_name;
    }
    if let Some(email) = body.email {
        sub.email = email.trim().to_string();
    }
    if let Some(phone) = body.phone {
        sub.phone = phone;
    }
    if let Some(address) = body.address {
        sub.address = address;
    }
    if let Some(postal_code) = body.postal_code {
        sub.postal_code = postal_code;
    }
    if let Some(city) = body.city {
        sub.city = city;
    }
    if let Some(specialty) = body.specialty {
        sub.specialty = specialty;
    }
    if let Some(hourly_rate) = body.hourly_rate {
        sub.hourly_rate = hourly_rate;
    }
    if let Some(payment_terms) = body.payment_terms {
        sub.payment_terms = payment_terms;
    }
    if let Some(reference_code) = body.reference_code {
        sub.reference_code = reference_code;
    }
    if let Some(active) = body.active {
        sub.active = active;
    }
    if let Some(notes) = body.notes {
        sub.notes = notes;
    }
    validate_subcontractor(&sub).into_result()?;

    sqlx::query(
        r#"
        UPDATE subcontractors
        SET company_name = ?, contact_name = ?, email = ?, phone = ?, address = ?,
            postal_code = ?, city = ?, specialty = ?, hourly_rate = ?, payment_terms = ?,
            reference_code = ?, active = ?, notes = ?
        WHERE id = ?
        "#,
    )
    .bind(&sub.company_name)
    .bind(&sub.contact_name)
    .bind(&sub.email)
    .bind(&sub.phone)
    .bind(&sub.address)
    .bind(&sub.postal_code)
    .bind(&sub.city)
    .bind(sub.specialty)
    .bind(sub.hourly_rate)
    .bind(&sub.payment_terms)
    .bind(&sub.reference_code)
    .bind(sub.active)
    .bind(&sub.notes)
    .bind(&id)
    .execute(pool)
    .await?;

    Ok(Json(sub))
}

async fn delete_subcontractor(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    let pool = &state.db.pool;
    access::require_admin(&user.principal())?;
    load_subcontractor(pool, &id).await?;

    sqlx::query("DELETE FROM subcontractors WHERE id = ?")
        .bind(&id)
        .execute(pool)
        .await?;

    tracing::info!(subcontractor_id = %id, "subcontractor deleted");

    Ok(StatusCode::NO_CONTENT)
}
