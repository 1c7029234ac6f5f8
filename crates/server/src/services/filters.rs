//! Parameterized list filters.
//!
//! Filters append `AND ...` clauses to a base query that already ends in a
//! `WHERE`. Derived conditions such as lateness are expressed as direct
//! comparisons on stored columns so they run in SQL.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, FromRow, QueryBuilder, Sqlite, SqlitePool};

use crate::{
    db::models::{AnomalyStatus, MemberRole, ProjectStatus, Severity, Specialty, TaskStatus},
    error::Result,
};

pub const LATE_PROJECT_STATUSES: &[ProjectStatus] =
    &[ProjectStatus::InProgress, ProjectStatus::Pending];

pub const LATE_TASK_STATUSES: &[TaskStatus] =
    &[TaskStatus::Todo, TaskStatus::InProgress, TaskStatus::Blocked];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub page: u32,
    pub page_size: u32,
}

impl Pagination {
    pub fn new(page: Option<u32>, page_size: u32) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            page_size: page_size.max(1),
        }
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.page - 1) * i64::from(self.page_size)
    }
}

#[derive(Debug, Serialize)]
pub struct Page<T> {
    pub count: i64,
    pub page: u32,
    pub page_size: u32,
    pub results: Vec<T>,
}

/// `%term%` with LIKE wildcards escaped (use with `ESCAPE '\'`).
pub fn like_pattern(term: &str) -> String {
    let escaped = term
        .trim()
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

/// Appends `AND (a LIKE ? OR b LIKE ? ...)` for a non-blank search term.
pub fn push_search(qb: &mut QueryBuilder<'_, Sqlite>, columns: &[&str], term: Option<&str>) {
    let Some(term) = term.filter(|t| !t.trim().is_empty()) else {
        return;
    };
    let pattern = like_pattern(term);

    qb.push(" AND (");
    for (i, column) in columns.iter().enumerate() {
        if i > 0 {
            qb.push(" OR ");
        }
        qb.push(*column)
            .push(" LIKE ")
            .push_bind(pattern.clone())
            .push(" ESCAPE '\\'");
    }
    qb.push(")");
}

/// Resolves an `ordering` parameter (`field` or `-field`) against a whitelist
/// of `(parameter, column)` pairs, falling back to `default`.
pub fn order_clause(ordering: Option<&str>, allowed: &[(&str, &str)], default: &str) -> String {
    let Some(ordering) = ordering.map(str::trim).filter(|o| !o.is_empty()) else {
        return default.to_string();
    };
    let (field, direction) = match ordering.strip_prefix('-') {
        Some(field) => (field, "DESC"),
        None => (ordering, "ASC"),
    };

    allowed
        .iter()
        .find(|(name, _)| *name == field)
        .map(|(_, column)| format!("{column} {direction}"))
        .unwrap_or_else(|| default.to_string())
}

/// Runs a count and a paginated select sharing the same filter clauses.
pub async fn fetch_page<T, F>(
    pool: &SqlitePool,
    select_sql: &str,
    count_sql: &str,
    apply: F,
    order: &str,
    pagination: Pagination,
) -> Result<Page<T>>
where
    T: for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
    F: Fn(&mut QueryBuilder<'_, Sqlite>),
{
    let mut count_qb = QueryBuilder::<Sqlite>::new(count_sql);
    apply(&mut count_qb);
    let count: i64 = count_qb.build_query_scalar().fetch_one(pool).await?;

    let mut qb = QueryBuilder::<Sqlite>::new(select_sql);
    apply(&mut qb);
    qb.push(" ORDER BY ")
        .push(order)
        .push(" LIMIT ")
        .push_bind(i64::from(pagination.page_size))
        .push(" OFFSET ")
        .push_bind(pagination.offset());
    let results = qb.build_query_as::<T>().fetch_all(pool).await?;

    Ok(Page {
        count,
        page: pagination.page,
        page_size: pagination.page_size,
        results,
    })
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct ProjectFilter {
    pub status: Option<ProjectStatus>,
    pub city: Option<String>,
    pub start_after: Option<NaiveDate>,
    pub start_before: Option<NaiveDate>,
    pub end_before: Option<NaiveDate>,
    pub budget_min: Option<f64>,
    pub budget_max: Option<f64>,
    pub late: Option<bool>,
    pub search: Option<String>,
    pub ordering: Option<String>,
    pub page: Option<u32>,
}

impl ProjectFilter {
    pub const SELECT: &'static str = "SELECT * FROM projects WHERE active = 1";
    pub const COUNT: &'static str = "SELECT COUNT(*) FROM projects WHERE active = 1";

    pub fn push_conditions(&self, qb: &mut QueryBuilder<'_, Sqlite>, today: NaiveDate) {
        if let Some(status) = self.status {
            qb.push(" AND status = ").push_bind(status);
        }
        if let Some(city) = self.city.as_deref().filter(|c| !c.trim().is_empty()) {
            qb.push(" AND city LIKE ")
                .push_bind(like_pattern(city))
                .push(" ESCAPE '\\'");
        }
        if let Some(date) = self.start_after {
            qb.push(" AND start_date >= ").push_bind(date);
        }
        if let Some(date) = self.start_before {
            qb.push(" AND start_date <= ").push_bind(date);
        }
        if let Some(date) = self.end_before {
            qb.push(" AND planned_end_date <= ").push_bind(date);
        }
        if let Some(min) = self.budget_min {
            qb.push(" AND budget_total >= ").push_bind(min);
        }
        if let Some(max) = self.budget_max {
            qb.push(" AND budget_total <= ").push_bind(max);
        }
        if self.late == Some(true) {
            qb.push(" AND planned_end_date < ").push_bind(today);
            push_status_in(qb, "status", LATE_PROJECT_STATUSES);
        }
        push_search(
            qb,
            &["code", "name", "address", "city"],
            self.search.as_deref(),
        );
    }

    pub fn order(&self) -> String {
        order_clause(
            self.ordering.as_deref(),
            &[
                ("created_at", "created_at"),
                ("start_date", "start_date"),
                ("status", "status"),
            ],
            "created_at DESC",
        )
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct TaskFilter {
    pub phase_id: Option<String>,
    pub project_id: Option<String>,
    pub team_id: Option<String>,
    pub status: Option<TaskStatus>,
    pub end_after: Option<NaiveDate>,
    pub end_before: Option<NaiveDate>,
    pub late: Option<bool>,
    pub search: Option<String>,
    pub ordering: Option<String>,
    pub page: Option<u32>,
}

impl TaskFilter {
    pub const SELECT: &'static str =
        "SELECT t.* FROM tasks t JOIN phases ph ON ph.id = t.phase_id WHERE 1 = 1";
    pub const COUNT: &'static str =
        "SELECT COUNT(*) FROM tasks t JOIN phases ph ON ph.id = t.phase_id WHERE 1 = 1";

    pub fn push_conditions(&self, qb: &mut QueryBuilder<'_, Sqlite>, today: NaiveDate) {
        if let Some(phase_id) = &self.phase_id {
            qb.push(" AND t.phase_id = ").push_bind(phase_id.clone());
        }
        if let Some(project_id) = &self.project_id {
            qb.push(" AND ph.project_id = ").push_bind(project_id.clone());
        }
        if let Some(team_id) = &self.team_id {
            qb.push(" AND t.team_id = ").push_bind(team_id.clone());
        }
        if let Some(status) = self.status {
            qb.push(" AND t.status = ").push_bind(status);
        }
        if let Some(date) = self.end_after {
            qb.push(" AND t.planned_end >= ").push_bind(date);
        }
        if let Some(date) = self.end_before {
            qb.push(" AND t.planned_end <= ").push_bind(date);
        }
        if self.late == Some(true) {
            qb.push(" AND t.planned_end < ").push_bind(today);
            push_status_in(qb, "t.status", LATE_TASK_STATUSES);
        }
        push_search(
            qb,
            &["t.code", "t.name", "t.description"],
            self.search.as_deref(),
        );
    }

    pub fn order(&self) -> String {
        order_clause(
            self.ordering.as_deref(),
            &[
                ("planned_end", "t.planned_end"),
                ("planned_start", "t.planned_start"),
                ("status", "t.status"),
            ],
            "t.planned_end ASC",
        )
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct PhaseFilter {
    pub project_id: Option<String>,
    pub status: Option<ProjectStatus>,
    pub ordering: Option<String>,
    pub page: Option<u32>,
}

impl PhaseFilter {
    pub const SELECT: &'static str = "SELECT * FROM phases WHERE 1 = 1";
    pub const COUNT: &'static str = "SELECT COUNT(*) FROM phases WHERE 1 = 1";

    pub fn push_conditions(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        if let Some(project_id) = &self.project_id {
            qb.push(" AND project_id = ").push_bind(project_id.clone());
        }
        if let Some(status) = self.status {
            qb.push(" AND status = ").push_bind(status);
        }
    }

    pub fn order(&self) -> String {
        order_clause(
            self.ordering.as_deref(),
            &[("number", "number"), ("planned_start", "planned_start")],
            "project_id ASC, number ASC",
        )
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct HourFilter {
    pub task_id: Option<String>,
    pub member_id: Option<String>,
    pub date: Option<NaiveDate>,
    pub validated: Option<bool>,
    pub ordering: Option<String>,
    pub page: Option<u32>,
}

impl HourFilter {
    pub const SELECT: &'static str = "SELECT * FROM work_hours WHERE 1 = 1";
    pub const COUNT: &'static str = "SELECT COUNT(*) FROM work_hours WHERE 1 = 1";

    pub fn push_conditions(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        if let Some(task_id) = &self.task_id {
            qb.push(" AND task_id = ").push_bind(task_id.clone());
        }
        if let Some(member_id) = &self.member_id {
            qb.push(" AND member_id = ").push_bind(member_id.clone());
        }
        if let Some(date) = self.date {
            qb.push(" AND date = ").push_bind(date);
        }
        if let Some(validated) = self.validated {
            qb.push(" AND validated = ").push_bind(validated);
        }
    }

    pub fn order(&self) -> String {
        order_clause(
            self.ordering.as_deref(),
            &[("date", "date"), ("hours", "hours")],
            "date DESC, created_at DESC",
        )
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct AnomalyFilter {
    pub project_id: Option<String>,
    pub task_id: Option<String>,
    pub status: Option<AnomalyStatus>,
    pub severity: Option<Severity>,
    pub ordering: Option<String>,
    pub page: Option<u32>,
}

impl AnomalyFilter {
    pub const SELECT: &'static str = r#"SELECT a.* FROM anomalies a
        JOIN tasks t ON t.id = a.task_id
        JOIN phases ph ON ph.id = t.phase_id WHERE 1 = 1"#;
    pub const COUNT: &'static str = r#"SELECT COUNT(*) FROM anomalies a
        JOIN tasks t ON t.id = a.task_id
        JOIN phases ph ON ph.id = t.phase_id WHERE 1 = 1"#;

    pub fn push_conditions(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        if let Some(project_id) = &self.project_id {
            qb.push(" AND ph.project_id = ").push_bind(project_id.clone());
        }
        if let Some(task_id) = &self.task_id {
            qb.push(" AND a.task_id = ").push_bind(task_id.clone());
        }
        if let Some(status) = self.status {
            qb.push(" AND a.status = ").push_bind(status);
        }
        if let Some(severity) = self.severity {
            qb.push(" AND a.severity = ").push_bind(severity);
        }
    }

    pub fn order(&self) -> String {
        order_clause(
            self.ordering.as_deref(),
            &[
                ("created_at", "a.created_at"),
                ("severity", "a.severity"),
                ("status", "a.status"),
            ],
            "a.created_at DESC",
        )
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct MemberFilter {
    pub team_id: Option<String>,
    pub role: Option<MemberRole>,
    pub search: Option<String>,
    pub ordering: Option<String>,
    pub page: Option<u32>,
}

impl MemberFilter {
    pub const SELECT: &'static str = "SELECT * FROM members WHERE active = 1";
    pub const COUNT: &'static str = "SELECT COUNT(*) FROM members WHERE active = 1";

    pub fn push_conditions(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        if let Some(team_id) = &self.team_id {
            qb.push(" AND team_id = ").push_bind(team_id.clone());
        }
        if let Some(role) = self.role {
            qb.push(" AND role = ").push_bind(role);
        }
        push_search(
            qb,
            &["first_name", "last_name", "email"],
            self.search.as_deref(),
        );
    }

    pub fn order(&self) -> String {
        order_clause(
            self.ordering.as_deref(),
            &[
                ("last_name", "last_name"),
                ("hire_date", "hire_date"),
                ("hourly_rate", "hourly_rate"),
            ],
            "last_name ASC, first_name ASC",
        )
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct TeamFilter {
    pub search: Option<String>,
    pub page: Option<u32>,
}

impl TeamFilter {
    pub const SELECT: &'static str = "SELECT * FROM teams WHERE active = 1";
    pub const COUNT: &'static str = "SELECT COUNT(*) FROM teams WHERE active = 1";

    pub fn push_conditions(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        push_search(qb, &["name"], self.search.as_deref());
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct SubcontractorFilter {
    pub specialty: Option<Specialty>,
    pub search: Option<String>,
    pub ordering: Option<String>,
    pub page: Option<u32>,
}

impl SubcontractorFilter {
    pub const SELECT: &'static str = "SELECT * FROM subcontractors WHERE active = 1";
    pub const COUNT: &'static str = "SELECT COUNT(*) FROM subcontractors WHERE active = 1";

    pub fn push_conditions(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        if let Some(specialty) = self.specialty {
            qb.push(" AND specialty = ").push_bind(specialty);
        }
        push_search(
            qb,
            &["company_name", "contact_name", "email"],
            self.search.as_deref(),
        );
    }

    pub fn order(&self) -> String {
        order_clause(
            self.ordering.as_deref(),
            &[
                ("company_name", "company_name"),
                ("rating", "rating"),
                ("hourly_rate", "hourly_rate"),
            ],
            "company_name ASC",
        )
    }
}

fn push_status_in<S>(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, statuses: &[S])
where
    S: Copy + Send + 'static + for<'q> sqlx::Encode<'q, Sqlite> + sqlx::Type<Sqlite>,
{
    qb.push(" AND ").push(column).push(" IN (");
    let mut separated = qb.separated(", ");
    for status in statuses {
        separated.push_bind(*status);
    }
    separated.push_unseparated(")");
}
