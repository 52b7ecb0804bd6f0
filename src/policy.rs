//! Access policy evaluator.
//!
//! Every mutating handler runs one of these predicates before touching
//! storage. Roles are scoped to their containing team or project; a role in
//! one collection confers nothing elsewhere. Denials collapse into
//! [`ServerError::NotFoundOrDenied`] so callers cannot probe for entities
//! they are not allowed to see.

use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter};

use crate::db::entities::{comment, project_member, task, team_member};
use crate::error::{Result, ServerError};

/// Role within a team
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TeamRole {
    Admin,
    Manager,
    Developer,
}

impl TeamRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TeamRole::Admin => "ADMIN",
            TeamRole::Manager => "MANAGER",
            TeamRole::Developer => "DEVELOPER",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ADMIN" => Some(TeamRole::Admin),
            "MANAGER" => Some(TeamRole::Manager),
            "DEVELOPER" => Some(TeamRole::Developer),
            _ => None,
        }
    }

    /// Project role a team member inherits when creating a project
    pub fn as_project_role(&self) -> ProjectRole {
        match self {
            TeamRole::Admin => ProjectRole::Admin,
            TeamRole::Manager => ProjectRole::Manager,
            TeamRole::Developer => ProjectRole::Developer,
        }
    }
}

/// Role within a project
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProjectRole {
    Admin,
    Lead,
    Manager,
    Developer,
}

impl ProjectRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectRole::Admin => "ADMIN",
            ProjectRole::Lead => "LEAD",
            ProjectRole::Manager => "MANAGER",
            ProjectRole::Developer => "DEVELOPER",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ADMIN" => Some(ProjectRole::Admin),
            "LEAD" => Some(ProjectRole::Lead),
            "MANAGER" => Some(ProjectRole::Manager),
            "DEVELOPER" => Some(ProjectRole::Developer),
            _ => None,
        }
    }
}

/// Roles allowed to manage a project (update, membership, labels)
pub const PROJECT_MANAGERS: &[ProjectRole] = &[ProjectRole::Admin, ProjectRole::Manager];

/// Roles allowed to delete a project outright
pub const PROJECT_DELETERS: &[ProjectRole] = &[ProjectRole::Admin, ProjectRole::Lead];

/// Look up the actor's role in a team, if any
pub async fn team_role(
    db: &DatabaseConnection,
    team_id: i32,
    user_id: i32,
) -> Result<Option<TeamRole>> {
    let row = team_member::Entity::find()
        .filter(team_member::Column::TeamId.eq(team_id))
        .filter(team_member::Column::UserId.eq(user_id))
        .one(db)
        .await?;

    Ok(row.and_then(|m| TeamRole::parse(&m.role)))
}

/// Look up the actor's role in a project, if any
pub async fn project_role(
    db: &DatabaseConnection,
    project_id: i32,
    user_id: i32,
) -> Result<Option<ProjectRole>> {
    let row = project_member::Entity::find()
        .filter(project_member::Column::ProjectId.eq(project_id))
        .filter(project_member::Column::UserId.eq(user_id))
        .one(db)
        .await?;

    Ok(row.and_then(|m| ProjectRole::parse(&m.role)))
}

/// Require any membership in a team
pub async fn require_team_member(
    db: &DatabaseConnection,
    team_id: i32,
    user_id: i32,
) -> Result<TeamRole> {
    team_role(db, team_id, user_id)
        .await?
        .ok_or(ServerError::NotFoundOrDenied)
}

/// Require one of the given roles in a team
pub async fn require_team_role(
    db: &DatabaseConnection,
    team_id: i32,
    user_id: i32,
    allowed: &[TeamRole],
) -> Result<TeamRole> {
    match team_role(db, team_id, user_id).await? {
        Some(role) if allowed.contains(&role) => Ok(role),
        _ => Err(ServerError::NotFoundOrDenied),
    }
}

/// Require any membership in a project
pub async fn require_project_member(
    db: &DatabaseConnection,
    project_id: i32,
    user_id: i32,
) -> Result<ProjectRole> {
    project_role(db, project_id, user_id)
        .await?
        .ok_or(ServerError::NotFoundOrDenied)
}

/// Require one of the given roles in a project
pub async fn require_project_role(
    db: &DatabaseConnection,
    project_id: i32,
    user_id: i32,
    allowed: &[ProjectRole],
) -> Result<ProjectRole> {
    match project_role(db, project_id, user_id).await? {
        Some(role) if allowed.contains(&role) => Ok(role),
        _ => Err(ServerError::NotFoundOrDenied),
    }
}

/// Project ADMIN/LEAD, or ADMIN of the owning team, may delete a project
pub async fn require_project_deleter(
    db: &DatabaseConnection,
    project_id: i32,
    team_id: i32,
    user_id: i32,
) -> Result<()> {
    if let Some(role) = project_role(db, project_id, user_id).await? {
        if PROJECT_DELETERS.contains(&role) {
            return Ok(());
        }
    }
    if team_role(db, team_id, user_id).await? == Some(TeamRole::Admin) {
        return Ok(());
    }
    Err(ServerError::NotFoundOrDenied)
}

/// A project is deletable only while it has no TODO / IN_PROGRESS tasks
pub async fn ensure_project_deletable(db: &DatabaseConnection, project_id: i32) -> Result<()> {
    let active = task::Entity::find()
        .filter(task::Column::ProjectId.eq(project_id))
        .filter(task::Column::Status.is_in(["TODO", "IN_PROGRESS"]))
        .count(db)
        .await?;

    if active > 0 {
        return Err(ServerError::Conflict(format!(
            "Project has {} active task(s); complete or delete them first",
            active
        )));
    }
    Ok(())
}

/// Task creator, or project ADMIN/MANAGER, may delete a task
pub async fn require_task_deleter(
    db: &DatabaseConnection,
    task: &task::Model,
    user_id: i32,
) -> Result<()> {
    if task.created_by_id == user_id {
        return Ok(());
    }
    require_project_role(db, task.project_id, user_id, PROJECT_MANAGERS)
        .await
        .map(|_| ())
}

/// Comment author, or project ADMIN/MANAGER, may delete a comment
pub async fn require_comment_deleter(
    db: &DatabaseConnection,
    comment: &comment::Model,
    project_id: i32,
    user_id: i32,
) -> Result<()> {
    if comment.user_id == user_id {
        return Ok(());
    }
    require_project_role(db, project_id, user_id, PROJECT_MANAGERS)
        .await
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{self, now_ts};
    use sea_orm::{ActiveModelTrait, Set};

    use crate::db::entities::{project, team, user};

    async fn test_db() -> DatabaseConnection {
        db::open("sqlite::memory:").await.unwrap()
    }

    async fn seed_user(db: &DatabaseConnection, name: &str) -> user::Model {
        user::ActiveModel {
            username: Set(name.to_string()),
            password_hash: Set(String::new()),
            display_name: Set(None),
            email: Set(None),
            created_at: Set(now_ts()),
            ..Default::default()
        }
        .insert(db)
        .await
        .unwrap()
    }

    async fn seed_team(db: &DatabaseConnection, name: &str) -> team::Model {
        team::ActiveModel {
            name: Set(name.to_string()),
            created_at: Set(now_ts()),
            ..Default::default()
        }
        .insert(db)
        .await
        .unwrap()
    }

    async fn seed_team_member(db: &DatabaseConnection, team_id: i32, user_id: i32, role: &str) {
        team_member::ActiveModel {
            team_id: Set(team_id),
            user_id: Set(user_id),
            role: Set(role.to_string()),
            created_at: Set(now_ts()),
            ..Default::default()
        }
        .insert(db)
        .await
        .unwrap();
    }

    async fn seed_project(db: &DatabaseConnection, team_id: i32, name: &str) -> project::Model {
        project::ActiveModel {
            team_id: Set(team_id),
            name: Set(name.to_string()),
            description: Set(None),
            is_active: Set(true),
            created_at: Set(now_ts()),
            ..Default::default()
        }
        .insert(db)
        .await
        .unwrap()
    }

    async fn seed_project_member(
        db: &DatabaseConnection,
        project_id: i32,
        user_id: i32,
        role: &str,
    ) {
        project_member::ActiveModel {
            project_id: Set(project_id),
            user_id: Set(user_id),
            role: Set(role.to_string()),
            created_at: Set(now_ts()),
            ..Default::default()
        }
        .insert(db)
        .await
        .unwrap();
    }

    async fn seed_task(
        db: &DatabaseConnection,
        project_id: i32,
        creator: i32,
        status: &str,
    ) -> task::Model {
        task::ActiveModel {
            project_id: Set(project_id),
            title: Set("t".to_string()),
            description: Set(None),
            status: Set(status.to_string()),
            priority: Set("MEDIUM".to_string()),
            assignee_id: Set(None),
            created_by_id: Set(creator),
            due_date: Set(None),
            created_at: Set(now_ts()),
            updated_at: Set(now_ts()),
            ..Default::default()
        }
        .insert(db)
        .await
        .unwrap()
    }

    #[test]
    fn role_round_trip() {
        for r in [TeamRole::Admin, TeamRole::Manager, TeamRole::Developer] {
            assert_eq!(TeamRole::parse(r.as_str()), Some(r));
        }
        for r in [
            ProjectRole::Admin,
            ProjectRole::Lead,
            ProjectRole::Manager,
            ProjectRole::Developer,
        ] {
            assert_eq!(ProjectRole::parse(r.as_str()), Some(r));
        }
        assert_eq!(TeamRole::parse("admin"), None);
        assert_eq!(ProjectRole::parse(""), None);
    }

    #[test]
    fn team_role_maps_to_project_role() {
        assert_eq!(TeamRole::Admin.as_project_role(), ProjectRole::Admin);
        assert_eq!(TeamRole::Manager.as_project_role(), ProjectRole::Manager);
        assert_eq!(
            TeamRole::Developer.as_project_role(),
            ProjectRole::Developer
        );
    }

    #[tokio::test]
    async fn non_member_is_denied_uniformly() {
        let db = test_db().await;
        let alice = seed_user(&db, "alice").await;
        let mallory = seed_user(&db, "mallory").await;
        let team = seed_team(&db, "core").await;
        seed_team_member(&db, team.id, alice.id, "ADMIN").await;
        let project = seed_project(&db, team.id, "site").await;
        seed_project_member(&db, project.id, alice.id, "ADMIN").await;

        // Mallory has no membership row anywhere; denial must look like not-found.
        let err = require_project_member(&db, project.id, mallory.id)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::NotFoundOrDenied));

        let err = require_team_role(&db, team.id, mallory.id, &[TeamRole::Admin])
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::NotFoundOrDenied));

        // A nonexistent project denies the same way.
        let err = require_project_member(&db, 9999, mallory.id)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::NotFoundOrDenied));
    }

    #[tokio::test]
    async fn role_allow_lists() {
        let db = test_db().await;
        let alice = seed_user(&db, "alice").await;
        let bob = seed_user(&db, "bob").await;
        let team = seed_team(&db, "core").await;
        seed_team_member(&db, team.id, alice.id, "ADMIN").await;
        seed_team_member(&db, team.id, bob.id, "DEVELOPER").await;
        let project = seed_project(&db, team.id, "site").await;
        seed_project_member(&db, project.id, alice.id, "ADMIN").await;
        seed_project_member(&db, project.id, bob.id, "DEVELOPER").await;

        assert!(
            require_project_role(&db, project.id, alice.id, PROJECT_MANAGERS)
                .await
                .is_ok()
        );
        assert!(
            require_project_role(&db, project.id, bob.id, PROJECT_MANAGERS)
                .await
                .is_err()
        );
        // Any member passes the bare membership check.
        assert!(require_project_member(&db, project.id, bob.id).await.is_ok());
    }

    #[tokio::test]
    async fn project_delete_requires_lead_or_team_admin() {
        let db = test_db().await;
        let lead = seed_user(&db, "lead").await;
        let dev = seed_user(&db, "dev").await;
        let team_admin = seed_user(&db, "boss").await;
        let team = seed_team(&db, "core").await;
        seed_team_member(&db, team.id, team_admin.id, "ADMIN").await;
        seed_team_member(&db, team.id, lead.id, "DEVELOPER").await;
        seed_team_member(&db, team.id, dev.id, "DEVELOPER").await;
        let project = seed_project(&db, team.id, "site").await;
        seed_project_member(&db, project.id, lead.id, "LEAD").await;
        seed_project_member(&db, project.id, dev.id, "DEVELOPER").await;

        assert!(require_project_deleter(&db, project.id, team.id, lead.id)
            .await
            .is_ok());
        // Team admin without a project membership row still qualifies.
        assert!(
            require_project_deleter(&db, project.id, team.id, team_admin.id)
                .await
                .is_ok()
        );
        assert!(require_project_deleter(&db, project.id, team.id, dev.id)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn project_deletable_only_without_active_tasks() {
        let db = test_db().await;
        let alice = seed_user(&db, "alice").await;
        let team = seed_team(&db, "core").await;
        let project = seed_project(&db, team.id, "site").await;

        assert!(ensure_project_deletable(&db, project.id).await.is_ok());

        let t = seed_task(&db, project.id, alice.id, "TODO").await;
        let err = ensure_project_deletable(&db, project.id).await.unwrap_err();
        assert!(matches!(err, ServerError::Conflict(_)));

        // Flip the task to DONE and the guard clears.
        let mut am: task::ActiveModel = t.into();
        am.status = Set("DONE".to_string());
        am.update(&db).await.unwrap();
        assert!(ensure_project_deletable(&db, project.id).await.is_ok());
    }

    #[tokio::test]
    async fn task_delete_by_creator_or_manager() {
        let db = test_db().await;
        let creator = seed_user(&db, "creator").await;
        let manager = seed_user(&db, "manager").await;
        let dev = seed_user(&db, "dev").await;
        let team = seed_team(&db, "core").await;
        let project = seed_project(&db, team.id, "site").await;
        seed_project_member(&db, project.id, creator.id, "DEVELOPER").await;
        seed_project_member(&db, project.id, manager.id, "MANAGER").await;
        seed_project_member(&db, project.id, dev.id, "DEVELOPER").await;

        let task = seed_task(&db, project.id, creator.id, "TODO").await;

        assert!(require_task_deleter(&db, &task, creator.id).await.is_ok());
        assert!(require_task_deleter(&db, &task, manager.id).await.is_ok());
        assert!(require_task_deleter(&db, &task, dev.id).await.is_err());
    }
}
