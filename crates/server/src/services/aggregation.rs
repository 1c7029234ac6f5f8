//! Derived values of the project tree.
//!
//! The pure functions compute hours, costs, progress and lateness from plain
//! values. The `recompute_*` functions run them against a connection that the
//! caller has already opened a transaction on, so the rollup commits together
//! with the work-hour mutation that triggered it.

use chrono::NaiveDate;
use sqlx::{SqliteConnection, SqlitePool};

use crate::{
    db::models::TaskStatus,
    error::{AppError, Result},
};

pub fn round_hours(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn round_money(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn round_percentage(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Sum of logged hours; an empty set yields zero.
pub fn real_hours<I>(entries: I) -> f64
where
    I: IntoIterator<Item = f64>,
{
    round_hours(entries.into_iter().sum())
}

pub fn task_cost(real_hours: f64, hourly_rate: f64) -> f64 {
    round_money(real_hours * hourly_rate)
}

/// Sum of task costs over `(real_hours, hourly_rate)` pairs.
pub fn project_cost<I>(tasks: I) -> f64
where
    I: IntoIterator<Item = (f64, f64)>,
{
    round_money(
        tasks
            .into_iter()
            .map(|(hours, rate)| task_cost(hours, rate))
            .sum(),
    )
}

pub fn progress_percentage(done: i64, total: i64) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    done as f64 / total as f64 * 100.0
}

pub fn days_remaining(planned_end: NaiveDate, today: NaiveDate) -> i64 {
    (planned_end - today).num_days().max(0)
}

pub fn is_task_late(
    status: TaskStatus,
    planned_end: NaiveDate,
    actual_end: Option<NaiveDate>,
    today: NaiveDate,
) -> bool {
    match status {
        TaskStatus::Done => actual_end.is_some_and(|end| end > planned_end),
        _ => today > planned_end,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskCounts {
    pub total: i64,
    pub done: i64,
}

impl TaskCounts {
    pub fn progress(&self) -> f64 {
        round_percentage(progress_percentage(self.done, self.total))
    }
}

pub async fn project_task_counts(pool: &SqlitePool, project_id: &str) -> Result<TaskCounts> {
    let (total, done) = sqlx::query_as::<_, (i64, i64)>(
        r#"
        SELECT COUNT(t.id), COALESCE(SUM(CASE WHEN t.status = ? THEN 1 ELSE 0 END), 0)
        FROM tasks t
        JOIN phases ph ON ph.id = t.phase_id
        WHERE ph.project_id = ?
        "#,
    )
    .bind(TaskStatus::Done)
    .bind(project_id)
    .fetch_one(pool)
    .await?;

    Ok(TaskCounts { total, done })
}

pub async fn phase_task_counts(pool: &SqlitePool, phase_id: &str) -> Result<TaskCounts> {
    let (total, done) = sqlx::query_as::<_, (i64, i64)>(
        r#"
        SELECT COUNT(id), COALESCE(SUM(CASE WHEN status = ? THEN 1 ELSE 0 END), 0)
        FROM tasks
        WHERE phase_id = ?
        "#,
    )
    .bind(TaskStatus::Done)
    .bind(phase_id)
    .fetch_one(pool)
    .await?;

    Ok(TaskCounts { total, done })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Recomputed {
    pub task_real_hours: f64,
    pub project_real_cost: f64,
}

/// Recomputes a task's real hours from its entries, then its project's cost.
pub async fn recompute_task_hours(conn: &mut SqliteConnection, task_id: &str) -> Result<Recomputed> {
    let project_id = sqlx::query_scalar::<_, String>(
        "SELECT ph.project_id FROM tasks t JOIN phases ph ON ph.id = t.phase_id WHERE t.id = ?",
    )
    .bind(task_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| {
        AppError::Consistency(format!("Task {task_id} cannot be resolved to a project"))
    })?;

    let hours = sqlx::query_scalar::<_, f64>("SELECT hours FROM work_hours WHERE task_id = ?")
        .bind(task_id)
        .fetch_all(&mut *conn)
        .await?;
    let total = real_hours(hours);

    sqlx::query("UPDATE tasks SET real_hours = ? WHERE id = ?")
        .bind(total)
        .bind(task_id)
        .execute(&mut *conn)
        .await?;

    let cost = recompute_project_cost(conn, &project_id).await?;

    tracing::debug!(
        task_id,
        real_hours = total,
        project_id = %project_id,
        real_cost = cost,
        "recomputed task hours"
    );

    Ok(Recomputed {
        task_real_hours: total,
        project_real_cost: cost,
    })
}

pub async fn recompute_project_cost(conn: &mut SqliteConnection, project_id: &str) -> Result<f64> {
    let tasks = sqlx::query_as::<_, (f64, f64)>(
        r#"
        SELECT t.real_hours, t.hourly_rate
        FROM tasks t
        JOIN phases ph ON ph.id = t.phase_id
        WHERE ph.project_id = ?
        "#,
    )
    .bind(project_id)
    .fetch_all(&mut *conn)
    .await?;
    let total = project_cost(tasks);

    let updated = sqlx::query("UPDATE projects SET real_cost = ? WHERE id = ?")
        .bind(total)
        .bind(project_id)
        .execute(&mut *conn)
        .await?;

    if updated.rows_affected() == 0 {
        return Err(AppError::Consistency(format!(
            "Project {project_id} no longer exists"
        )));
    }

    Ok(total)
}
