//! Project and project-membership handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::Response,
    Json,
};
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use serde::Deserialize;
use serde_json::json;

use super::auth::require_auth;
use super::AppState;
use crate::db::entities::{project, project_member, team_member, user};
use crate::db::now_ts;
use crate::error::{Result, ServerError};
use crate::events::{Actor, DomainEvent};
use crate::policy::{self, ProjectRole, TeamRole, PROJECT_MANAGERS};

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    pub team_id: i32,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateProjectRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Deserialize)]
pub struct AddMemberRequest {
    pub user_id: i32,
    pub role: String,
}

/// Create a project and its creator membership row. The creator's team
/// role carries over as their initial project role.
pub(crate) async fn create_project_record(
    db: &DatabaseConnection,
    actor_id: i32,
    team_id: i32,
    name: &str,
    description: Option<String>,
) -> Result<(project::Model, project_member::Model)> {
    let team_role =
        policy::require_team_role(db, team_id, actor_id, &[TeamRole::Admin, TeamRole::Manager])
            .await?;

    let name = name.trim();
    if name.is_empty() {
        return Err(ServerError::Validation("Name cannot be empty".to_string()));
    }

    let new_project = project::ActiveModel {
        team_id: Set(team_id),
        name: Set(name.to_string()),
        description: Set(description),
        is_active: Set(true),
        created_at: Set(now_ts()),
        ..Default::default()
    }
    .insert(db)
    .await?;

    let membership = project_member::ActiveModel {
        project_id: Set(new_project.id),
        user_id: Set(actor_id),
        role: Set(team_role.as_project_role().as_str().to_string()),
        created_at: Set(now_ts()),
        ..Default::default()
    }
    .insert(db)
    .await?;

    Ok((new_project, membership))
}

/// Add a user to a project. The target must currently belong to the owning
/// team; that link is not re-checked afterwards.
pub(crate) async fn add_member_record(
    db: &DatabaseConnection,
    project: &project::Model,
    user_id: i32,
    role: ProjectRole,
) -> Result<project_member::Model> {
    let in_team = team_member::Entity::find()
        .filter(team_member::Column::TeamId.eq(project.team_id))
        .filter(team_member::Column::UserId.eq(user_id))
        .one(db)
        .await?;
    if in_team.is_none() {
        return Err(ServerError::Validation(
            "User is not a member of the owning team".to_string(),
        ));
    }

    let existing = project_member::Entity::find()
        .filter(project_member::Column::ProjectId.eq(project.id))
        .filter(project_member::Column::UserId.eq(user_id))
        .one(db)
        .await?;
    if existing.is_some() {
        return Err(ServerError::Conflict(
            "User is already a member of this project".to_string(),
        ));
    }

    let membership = project_member::ActiveModel {
        project_id: Set(project.id),
        user_id: Set(user_id),
        role: Set(role.as_str().to_string()),
        created_at: Set(now_ts()),
        ..Default::default()
    }
    .insert(db)
    .await?;

    Ok(membership)
}

/// POST /api/projects - team ADMIN/MANAGER only
pub async fn create_project(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateProjectRequest>,
) -> Result<Response> {
    let token = require_auth(&headers, &state.auth)?;

    let (new_project, membership) = create_project_record(
        &state.db,
        token.user_id,
        req.team_id,
        &req.name,
        req.description,
    )
    .await?;

    tracing::info!(
        project_id = new_project.id,
        team_id = req.team_id,
        user_id = token.user_id,
        "project created"
    );

    Ok(super::created(
        "Project created",
        json!({ "project": new_project, "membership": membership }),
    ))
}

/// GET /api/projects - the caller's projects
pub async fn list_projects(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response> {
    let token = require_auth(&headers, &state.auth)?;

    let memberships = project_member::Entity::find()
        .filter(project_member::Column::UserId.eq(token.user_id))
        .all(&state.db)
        .await?;

    let project_ids: Vec<i32> = memberships.iter().map(|m| m.project_id).collect();
    let projects = project::Entity::find()
        .filter(project::Column::Id.is_in(project_ids))
        .all(&state.db)
        .await?;

    Ok(super::ok(
        "Projects",
        json!({ "projects": projects, "memberships": memberships }),
    ))
}

/// GET /api/projects/:id - any member
pub async fn get_project(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<i32>,
    headers: HeaderMap,
) -> Result<Response> {
    let token = require_auth(&headers, &state.auth)?;
    policy::require_project_member(&state.db, project_id, token.user_id).await?;

    let found = project::Entity::find_by_id(project_id)
        .one(&state.db)
        .await?
        .ok_or(ServerError::NotFoundOrDenied)?;

    let members = project_member::Entity::find()
        .filter(project_member::Column::ProjectId.eq(project_id))
        .all(&state.db)
        .await?;

    Ok(super::ok(
        "Project",
        json!({ "project": found, "members": members }),
    ))
}

/// PUT /api/projects/:id - project ADMIN/MANAGER only
pub async fn update_project(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<i32>,
    headers: HeaderMap,
    Json(req): Json<UpdateProjectRequest>,
) -> Result<Response> {
    let token = require_auth(&headers, &state.auth)?;
    policy::require_project_role(&state.db, project_id, token.user_id, PROJECT_MANAGERS).await?;

    let found = project::Entity::find_by_id(project_id)
        .one(&state.db)
        .await?
        .ok_or(ServerError::NotFoundOrDenied)?;

    let mut am: project::ActiveModel = found.into();
    if let Some(name) = req.name {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(ServerError::Validation("Name cannot be empty".to_string()));
        }
        am.name = Set(name);
    }
    if let Some(description) = req.description {
        am.description = Set(Some(description));
    }
    if let Some(is_active) = req.is_active {
        am.is_active = Set(is_active);
    }
    let updated = am.update(&state.db).await?;

    Ok(super::ok("Project updated", json!({ "project": updated })))
}

/// DELETE /api/projects/:id - project ADMIN/LEAD or team ADMIN, and only
/// once no TODO/IN_PROGRESS tasks remain
pub async fn delete_project(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<i32>,
    headers: HeaderMap,
) -> Result<Response> {
    let token = require_auth(&headers, &state.auth)?;

    let found = project::Entity::find_by_id(project_id)
        .one(&state.db)
        .await?
        .ok_or(ServerError::NotFoundOrDenied)?;

    policy::require_project_deleter(&state.db, project_id, found.team_id, token.user_id).await?;
    policy::ensure_project_deletable(&state.db, project_id).await?;

    project::Entity::delete_by_id(project_id)
        .exec(&state.db)
        .await?;
    tracing::info!(project_id, user_id = token.user_id, "project deleted");

    Ok(super::ok("Project deleted", json!({})))
}

/// POST /api/projects/:id/members - project ADMIN/MANAGER only
pub async fn add_member(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<i32>,
    headers: HeaderMap,
    Json(req): Json<AddMemberRequest>,
) -> Result<Response> {
    let token = require_auth(&headers, &state.auth)?;
    policy::require_project_role(&state.db, project_id, token.user_id, PROJECT_MANAGERS).await?;

    let role = ProjectRole::parse(&req.role)
        .ok_or_else(|| ServerError::Validation(format!("Unknown project role: {}", req.role)))?;

    let found = project::Entity::find_by_id(project_id)
        .one(&state.db)
        .await?
        .ok_or(ServerError::NotFoundOrDenied)?;

    let added_user = user::Entity::find_by_id(req.user_id)
        .one(&state.db)
        .await?
        .ok_or(ServerError::NotFound("User"))?;

    let membership = add_member_record(&state.db, &found, added_user.id, role).await?;

    state
        .bus
        .publish(&DomainEvent::ProjectMemberAdded {
            project: found,
            user_id: added_user.id,
            actor: Actor {
                id: token.user_id,
                username: token.username,
            },
        })
        .await;

    Ok(super::created(
        "Member added",
        json!({ "membership": membership }),
    ))
}

/// DELETE /api/projects/:id/members/:user_id - project ADMIN/MANAGER only
pub async fn remove_member(
    State(state): State<Arc<AppState>>,
    Path((project_id, user_id)): Path<(i32, i32)>,
    headers: HeaderMap,
) -> Result<Response> {
    let token = require_auth(&headers, &state.auth)?;
    policy::require_project_role(&state.db, project_id, token.user_id, PROJECT_MANAGERS).await?;

    let result = project_member::Entity::delete_many()
        .filter(project_member::Column::ProjectId.eq(project_id))
        .filter(project_member::Column::UserId.eq(user_id))
        .exec(&state.db)
        .await?;

    if result.rows_affected == 0 {
        return Err(ServerError::NotFound("Membership"));
    }

    Ok(super::ok("Member removed", json!({})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::db::entities::{team, user};

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

    async fn seed_team_with_member(
        db: &DatabaseConnection,
        user_id: i32,
        role: &str,
    ) -> team::Model {
        let t = team::ActiveModel {
            name: Set("core".to_string()),
            created_at: Set(now_ts()),
            ..Default::default()
        }
        .insert(db)
        .await
        .unwrap();
        team_member::ActiveModel {
            team_id: Set(t.id),
            user_id: Set(user_id),
            role: Set(role.to_string()),
            created_at: Set(now_ts()),
            ..Default::default()
        }
        .insert(db)
        .await
        .unwrap();
        t
    }

    #[tokio::test]
    async fn creator_membership_inherits_team_role() {
        let db = test_db().await;
        let manager = seed_user(&db, "manager").await;
        let team = seed_team_with_member(&db, manager.id, "MANAGER").await;

        let (p, m) = create_project_record(&db, manager.id, team.id, "site", None)
            .await
            .unwrap();
        assert_eq!(p.team_id, team.id);
        assert_eq!(m.project_id, p.id);
        assert_eq!(m.user_id, manager.id);
        assert_eq!(m.role, "MANAGER");

        // Exactly one membership row exists.
        let count = project_member::Entity::find()
            .filter(project_member::Column::ProjectId.eq(p.id))
            .all(&db)
            .await
            .unwrap()
            .len();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn developer_cannot_create_project() {
        let db = test_db().await;
        let dev = seed_user(&db, "dev").await;
        let team = seed_team_with_member(&db, dev.id, "DEVELOPER").await;

        let err = create_project_record(&db, dev.id, team.id, "site", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::NotFoundOrDenied));
    }

    #[tokio::test]
    async fn project_members_must_come_from_the_owning_team() {
        let db = test_db().await;
        let admin = seed_user(&db, "admin").await;
        let outsider = seed_user(&db, "outsider").await;
        let team = seed_team_with_member(&db, admin.id, "ADMIN").await;
        let (p, _) = create_project_record(&db, admin.id, team.id, "site", None)
            .await
            .unwrap();

        let err = add_member_record(&db, &p, outsider.id, ProjectRole::Developer)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Validation(_)));

        // Once in the team, the add succeeds; a second add conflicts.
        team_member::ActiveModel {
            team_id: Set(team.id),
            user_id: Set(outsider.id),
            role: Set("DEVELOPER".to_string()),
            created_at: Set(now_ts()),
            ..Default::default()
        }
        .insert(&db)
        .await
        .unwrap();

        add_member_record(&db, &p, outsider.id, ProjectRole::Developer)
            .await
            .unwrap();
        let err = add_member_record(&db, &p, outsider.id, ProjectRole::Developer)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Conflict(_)));
    }
}
