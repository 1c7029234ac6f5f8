use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::services::aggregation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectStatus {
    Pending,
    InProgress,
    Paused,
    Done,
    Invoiced,
    Cancelled,
}

impl Default for ProjectStatus {
    fn default() -> Self {
        Self::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Blocked,
    Done,
    Revised,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Todo
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberRole {
    Chief,
    TeamChief,
    Worker,
    Apprentice,
    Other,
}

impl Default for MemberRole {
    fn default() -> Self {
        Self::Worker
    }
}

/// Trade of a team or subcontractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Specialty {
    Roofing,
    Plumbing,
    Electrical,
    Carpentry,
    Painting,
    Tiling,
    Partitions,
    Masonry,
    Excavation,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Critical,
    Major,
    Minor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalyStatus {
    Open,
    InProgress,
    Closed,
    Deferred,
}

impl Default for AnomalyStatus {
    fn default() -> Self {
        Self::Open
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Project {
    pub id: String,
    pub code: String,
    pub name: String,
    pub description: String,
    pub address: String,
    pub postal_code: String,
    pub city: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub start_date: NaiveDate,
    pub planned_end_date: NaiveDate,
    pub actual_end_date: Option<NaiveDate>,
    pub status: ProjectStatus,
    pub chief_id: Option<String>,
    pub budget_total: f64,
    pub real_cost: f64,
    pub internal_notes: String,
    pub created_by: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn days_remaining(&self, today: NaiveDate) -> i64 {
        aggregation::days_remaining(self.planned_end_date, today)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Phase {
    pub id: String,
    pub project_id: String,
    pub number: i64,
    pub name: String,
    pub description: String,
    pub planned_start: NaiveDate,
    pub planned_end: NaiveDate,
    pub responsible_id: Option<String>,
    pub budget: f64,
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Task {
    pub id: String,
    pub phase_id: String,
    pub code: String,
    pub name: String,
    pub description: String,
    pub position: i64,
    pub planned_start: NaiveDate,
    pub planned_end: NaiveDate,
    pub actual_start: Option<NaiveDate>,
    pub actual_end: Option<NaiveDate>,
    pub status: TaskStatus,
    pub team_id: Option<String>,
    pub estimated_hours: f64,
    pub real_hours: f64,
    pub hourly_rate: f64,
    pub notes: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Live cost of the logged hours; never stored.
    pub fn cost(&self) -> f64 {
        aggregation::task_cost(self.real_hours, self.hourly_rate)
    }

    pub fn is_late(&self, today: NaiveDate) -> bool {
        aggregation::is_task_late(self.status, self.planned_end, self.actual_end, today)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkHourEntry {
    pub id: String,
    pub task_id: String,
    pub member_id: Option<String>,
    pub date: NaiveDate,
    pub hours: f64,
    pub description: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub validated: bool,
    pub validated_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PhotoReport {
    pub id: String,
    pub task_id: String,
    pub title: String,
    pub description: String,
    pub image_ref: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub taken_at: DateTime<Utc>,
    pub approved: bool,
    pub approved_by: Option<String>,
    pub uploaded_by: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Team {
    pub id: String,
    pub name: String,
    pub description: String,
    pub chief_id: Option<String>,
    pub specialty: Specialty,
    pub external_contract: bool,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Member {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub team_id: Option<String>,
    pub role: MemberRole,
    pub qualifications: String,
    pub hourly_rate: f64,
    pub hire_date: NaiveDate,
    pub active: bool,
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Member {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subcontractor {
    pub id: String,
    pub company_name: String,
    pub contact_name: String,
    pub email: String,
    pub phone: String,
    pub address: String,
    pub postal_code: String,
    pub city: String,
    pub specialty: Specialty,
    pub hourly_rate: f64,
    pub payment_terms: String,
    pub reference_code: String,
    pub rating: f64,
    pub active: bool,
    pub notes: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Anomaly {
    pub id: String,
    pub task_id: String,
    pub title: String,
    pub description: String,
    pub severity: Severity,
    pub status: AnomalyStatus,
    pub reporter_id: Option<String>,
    pub corrector_id: Option<String>,
    pub planned_resolution_date: Option<NaiveDate>,
    pub actual_resolution_date: Option<NaiveDate>,
    pub photo_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Anomaly {
    pub fn is_late(&self, today: NaiveDate) -> bool {
        match self.planned_resolution_date {
            Some(planned) if self.status != AnomalyStatus::Closed => today > planned,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn anomaly(status: AnomalyStatus, planned: Option<&str>) -> Anomaly {
        Anomaly {
            id: "a".to_string(),
            task_id: "t".to_string(),
            title: "Crack".to_string(),
            description: "Crack in slab".to_string(),
            severity: Severity::Major,
            status,
            reporter_id: None,
            corrector_id: None,
            planned_resolution_date: planned.map(date),
            actual_resolution_date: None,
            photo_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn anomaly_lateness() {
        let today = date("2025-03-10");
        assert!(anomaly(AnomalyStatus::Open, Some("2025-03-01")).is_late(today));
        assert!(!anomaly(AnomalyStatus::Closed, Some("2025-03-01")).is_late(today));
        assert!(!anomaly(AnomalyStatus::Open, Some("2025-03-10")).is_late(today));
        assert!(!anomaly(AnomalyStatus::Open, None).is_late(today));
    }

    #[test]
    fn enums_use_screaming_snake_case_on_the_wire() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::InProgress).unwrap(),
            "\"IN_PROGRESS\""
        );
        assert_eq!(
            serde_json::from_str::<MemberRole>("\"TEAM_CHIEF\"").unwrap(),
            MemberRole::TeamChief
        );
    }
}
