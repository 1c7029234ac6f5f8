//! Object-level authorization.
//!
//! Reads are open to any authenticated principal. Writes are decided by
//! [`decide`], a pure function over the principal, the requested capability
//! and the [`Scope`] resolved by walking from the target up the project tree.
//! An unresolvable chain or a missing member record denies, except for
//! administrators.

use sqlx::SqlitePool;

use crate::{
    error::{AppError, Result},
    middleware::auth::AuthUser,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub is_admin: bool,
}

impl From<&AuthUser> for Principal {
    fn from(user: &AuthUser) -> Self {
        Self {
            user_id: user.id.clone(),
            is_admin: user.is_admin,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Modify a project or anything structural under it.
    ProjectWrite,
    /// Modify a team's own data.
    TeamWrite,
    /// Record field work under a task: project chief or task team member.
    FieldWrite,
}

#[derive(Debug, Clone, Copy)]
pub enum Target<'a> {
    Project(&'a str),
    Phase(&'a str),
    Task(&'a str),
    WorkHours(&'a str),
    Photo(&'a str),
    Anomaly(&'a str),
    Team(&'a str),
}

/// Chief and team reached from a target object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope {
    pub chief_id: Option<String>,
    pub team_id: Option<String>,
}

/// The principal's member record, reduced to its team.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Membership {
    pub team_id: Option<String>,
}

pub fn decide(
    principal: &Principal,
    capability: Capability,
    scope: Option<&Scope>,
    membership: Option<&Membership>,
) -> bool {
    if principal.is_admin {
        return true;
    }
    let Some(scope) = scope else {
        return false;
    };

    let is_chief = scope.chief_id.as_deref() == Some(principal.user_id.as_str());
    let in_team = match (membership.and_then(|m| m.team_id.as_deref()), scope.team_id.as_deref()) {
        (Some(mine), Some(target)) => mine == target,
        _ => false,
    };

    match capability {
        Capability::ProjectWrite => is_chief,
        Capability::TeamWrite => in_team,
        Capability::FieldWrite => is_chief || in_team,
    }
}

pub async fn resolve_scope(pool: &SqlitePool, target: Target<'_>) -> Result<Option<Scope>> {
    let (sql, id) = match target {
        Target::Project(id) => ("SELECT chief_id, NULL FROM projects WHERE id = ?", id),
        Target::Phase(id) => (
            r#"
            SELECT p.chief_id, NULL
            FROM phases ph
            JOIN projects p ON p.id = ph.project_id
            WHERE ph.id = ?
            "#,
            id,
        ),
        Target::Task(id) => (
            r#"
            SELECT p.chief_id, t.team_id
            FROM tasks t
            JOIN phases ph ON ph.id = t.phase_id
            JOIN projects p ON p.id = ph.project_id
            WHERE t.id = ?
            "#,
            id,
        ),
        Target::WorkHours(id) => (
            r#"
            SELECT p.chief_id, t.team_id
            FROM work_hours w
            JOIN tasks t ON t.id = w.task_id
            JOIN phases ph ON ph.id = t.phase_id
            JOIN projects p ON p.id = ph.project_id
            WHERE w.id = ?
            "#,
            id,
        ),
        Target::Photo(id) => (
            r#"
            SELECT p.chief_id, t.team_id
            FROM photos ph_r
            JOIN tasks t ON t.id = ph_r.task_id
            JOIN phases ph ON ph.id = t.phase_id
            JOIN projects p ON p.id = ph.project_id
            WHERE ph_r.id = ?
            "#,
            id,
        ),
        Target::Anomaly(id) => (
            r#"
            SELECT p.chief_id, t.team_id
            FROM anomalies a
            JOIN tasks t ON t.id = a.task_id
            JOIN phases ph ON ph.id = t.phase_id
            JOIN projects p ON p.id = ph.project_id
            WHERE a.id = ?
            "#,
            id,
        ),
        Target::Team(id) => ("SELECT NULL, id FROM teams WHERE id = ?", id),
    };

    let row = sqlx::query_as::<_, (Option<String>, Option<String>)>(sql)
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(row.map(|(chief_id, team_id)| Scope { chief_id, team_id }))
}

pub async fn membership(pool: &SqlitePool, principal: &Principal) -> Result<Option<Membership>> {
    let row = sqlx::query_as::<_, (Option<String>,)>("SELECT team_id FROM members WHERE user_id = ?")
        .bind(&principal.user_id)
        .fetch_optional(pool)
        .await?;

    Ok(row.map(|(team_id,)| Membership { team_id }))
}

/// Fails with [`AppError::Forbidden`] unless the principal holds `capability` on `target`.
pub async fn authorize(
    pool: &SqlitePool,
    principal: &Principal,
    capability: Capability,
    target: Target<'_>,
) -> Result<()> {
    if principal.is_admin {
        return Ok(());
    }

    let scope = resolve_scope(pool, target).await?;
    let membership = match capability {
        Capability::ProjectWrite => None,
        Capability::TeamWrite | Capability::FieldWrite => membership(pool, principal).await?,
    };

    if decide(principal, capability, scope.as_ref(), membership.as_ref()) {
        Ok(())
    } else {
        tracing::debug!(
            user_id = %principal.user_id,
            ?capability,
            ?target,
            resolved = scope.is_some(),
            "access denied"
        );
        Err(AppError::Forbidden)
    }
}

pub fn require_admin(principal: &Principal) -> Result<()> {
    if principal.is_admin {
        Ok(())
    } else {
        Err(AppError::Forbidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::models::TaskStatus,
        test_support::{self, TestApp},
    };

    fn principal(id: &str, is_admin: bool) -> Principal {
        Principal {
            user_id: id.to_string(),
            is_admin,
        }
    }

    fn scope(chief: Option<&str>, team: Option<&str>) -> Scope {
        Scope {
            chief_id: chief.map(str::to_string),
            team_id: team.map(str::to_string),
        }
    }

    fn member_of(team: Option<&str>) -> Membership {
        Membership {
            team_id: team.map(str::to_string),
        }
    }

    #[test]
    fn administrators_always_pass() {
        let admin = principal("root", true);
        assert!(decide(&admin, Capability::ProjectWrite, None, None));
        assert!(decide(&admin, Capability::TeamWrite, None, None));
    }

    #[test]
    fn only_the_chief_writes_a_project() {
        let target = scope(Some("chief"), None);
        assert!(decide(&principal("chief", false), Capability::ProjectWrite, Some(&target), None));
        assert!(!decide(&principal("other", false), Capability::ProjectWrite, Some(&target), None));
        assert!(!decide(
            &principal("chief", false),
            Capability::ProjectWrite,
            Some(&scope(None, None)),
            None
        ));
    }

    #[test]
    fn unresolved_chain_fails_closed() {
        let user = principal("chief", false);
        assert!(!decide(&user, Capability::ProjectWrite, None, None));
        assert!(!decide(&user, Capability::FieldWrite, None, Some(&member_of(Some("t1")))));
    }

    #[test]
    fn team_rules_need_a_member_record() {
        let target = scope(Some("chief"), Some("t1"));
        let worker = principal("worker", false);

        assert!(decide(&worker, Capability::TeamWrite, Some(&target), Some(&member_of(Some("t1")))));
        assert!(!decide(&worker, Capability::TeamWrite, Some(&target), Some(&member_of(Some("t2")))));
        assert!(!decide(&worker, Capability::TeamWrite, Some(&target), Some(&member_of(None))));
        assert!(!decide(&worker, Capability::TeamWrite, Some(&target), None));
        assert!(!decide(
            &worker,
            Capability::TeamWrite,
            Some(&scope(Some("chief"), None)),
            Some(&member_of(Some("t1")))
        ));
    }

    #[test]
    fn field_work_accepts_chief_or_team_member() {
        let target = scope(Some("chief"), Some("t1"));
        assert!(decide(&principal("chief", false), Capability::FieldWrite, Some(&target), None));
        assert!(decide(
            &principal("worker", false),
            Capability::FieldWrite,
            Some(&target),
            Some(&member_of(Some("t1")))
        ));
        assert!(!decide(&principal("stranger", false), Capability::FieldWrite, Some(&target), None));
    }

    #[tokio::test]
    async fn scope_walks_up_from_a_task() {
        let app = TestApp::new().await;
        let chief = app.user("chief@example.com", false).await;
        let worker = app.user("worker@example.com", false).await;
        let team = test_support::insert_team(&app.state, "Masonry").await;
        test_support::insert_member(&app.state, "worker@example.com", Some(team.as_str()), Some(worker.id.as_str())).await;

        let project = test_support::insert_project(&app.state, "CH-0001", Some(chief.id.as_str())).await;
        let phase = test_support::insert_phase(&app.state, &project, 1).await;
        let task = test_support::insert_task(&app.state, &phase, "T-001", TaskStatus::Todo, 50.0).await;
        test_support::assign_team(&app.state, &task, &team).await;

        let resolved = resolve_scope(&app.state.db.pool, Target::Task(&task)).await.unwrap();
        assert_eq!(resolved, Some(scope(Some(chief.id.as_str()), Some(team.as_str()))));

        let pool = &app.state.db.pool;
        let chief_p = Principal::from(&chief);
        let worker_p = Principal::from(&worker);
        authorize(pool, &chief_p, Capability::ProjectWrite, Target::Phase(&phase)).await.unwrap();
        authorize(pool, &worker_p, Capability::FieldWrite, Target::Task(&task)).await.unwrap();
        assert!(matches!(
            authorize(pool, &worker_p, Capability::ProjectWrite, Target::Task(&task)).await,
            Err(AppError::Forbidden)
        ));
        assert!(matches!(
            authorize(pool, &chief_p, Capability::ProjectWrite, Target::Task("missing")).await,
            Err(AppError::Forbidden)
        ));
    }
}
