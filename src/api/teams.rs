//! Team and team-membership handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::Response,
    Json,
};
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use serde::Deserialize;
use serde_json::json;

use super::auth::require_auth;
use super::AppState;
use crate::db::entities::{team, team_member, user};
use crate::db::now_ts;
use crate::error::{Result, ServerError};
use crate::events::{Actor, DomainEvent};
use crate::policy::{self, TeamRole};

#[derive(Deserialize)]
pub struct CreateTeamRequest {
    pub name: String,
}

#[derive(Deserialize)]
pub struct UpdateTeamRequest {
    pub name: String,
}

#[derive(Deserialize)]
pub struct AddMemberRequest {
    pub user_id: i32,
    pub role: String,
}

fn validate_name(name: &str) -> Result<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ServerError::Validation("Name cannot be empty".to_string()));
    }
    if name.len() > 100 {
        return Err(ServerError::Validation(
            "Name must be at most 100 characters".to_string(),
        ));
    }
    Ok(name)
}

/// POST /api/teams - any authenticated user; creator becomes ADMIN
pub async fn create_team(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateTeamRequest>,
) -> Result<Response> {
    let token = require_auth(&headers, &state.auth)?;
    let name = validate_name(&req.name)?;

    let new_team = team::ActiveModel {
        name: Set(name.to_string()),
        created_at: Set(now_ts()),
        ..Default::default()
    }
    .insert(&state.db)
    .await?;

    let membership = team_member::ActiveModel {
        team_id: Set(new_team.id),
        user_id: Set(token.user_id),
        role: Set(TeamRole::Admin.as_str().to_string()),
        created_at: Set(now_ts()),
        ..Default::default()
    }
    .insert(&state.db)
    .await?;

    tracing::info!(team_id = new_team.id, user_id = token.user_id, "team created");

    Ok(super::created(
        "Team created",
        json!({ "team": new_team, "membership": membership }),
    ))
}

/// GET /api/teams - the caller's teams
pub async fn list_teams(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response> {
    let token = require_auth(&headers, &state.auth)?;

    let memberships = team_member::Entity::find()
        .filter(team_member::Column::UserId.eq(token.user_id))
        .all(&state.db)
        .await?;

    let team_ids: Vec<i32> = memberships.iter().map(|m| m.team_id).collect();
    let teams = team::Entity::find()
        .filter(team::Column::Id.is_in(team_ids))
        .all(&state.db)
        .await?;

    Ok(super::ok(
        "Teams",
        json!({ "teams": teams, "memberships": memberships }),
    ))
}

/// GET /api/teams/:id - any member
pub async fn get_team(
    State(state): State<Arc<AppState>>,
    Path(team_id): Path<i32>,
    headers: HeaderMap,
) -> Result<Response> {
    let token = require_auth(&headers, &state.auth)?;
    policy::require_team_member(&state.db, team_id, token.user_id).await?;

    let found = team::Entity::find_by_id(team_id)
        .one(&state.db)
        .await?
        .ok_or(ServerError::NotFoundOrDenied)?;

    let members = team_member::Entity::find()
        .filter(team_member::Column::TeamId.eq(team_id))
        .all(&state.db)
        .await?;

    Ok(super::ok(
        "Team",
        json!({ "team": found, "members": members }),
    ))
}

/// PUT /api/teams/:id - team ADMIN only
pub async fn update_team(
    State(state): State<Arc<AppState>>,
    Path(team_id): Path<i32>,
    headers: HeaderMap,
    Json(req): Json<UpdateTeamRequest>,
) -> Result<Response> {
    let token = require_auth(&headers, &state.auth)?;
    policy::require_team_role(&state.db, team_id, token.user_id, &[TeamRole::Admin]).await?;
    let name = validate_name(&req.name)?;

    let found = team::Entity::find_by_id(team_id)
        .one(&state.db)
        .await?
        .ok_or(ServerError::NotFoundOrDenied)?;

    let mut am: team::ActiveModel = found.into();
    am.name = Set(name.to_string());
    let updated = am.update(&state.db).await?;

    Ok(super::ok("Team updated", json!({ "team": updated })))
}

/// DELETE /api/teams/:id - team ADMIN only
pub async fn delete_team(
    State(state): State<Arc<AppState>>,
    Path(team_id): Path<i32>,
    headers: HeaderMap,
) -> Result<Response> {
    let token = require_auth(&headers, &state.auth)?;
    policy::require_team_role(&state.db, team_id, token.user_id, &[TeamRole::Admin]).await?;

    team::Entity::delete_by_id(team_id).exec(&state.db).await?;
    tracing::info!(team_id, user_id = token.user_id, "team deleted");

    Ok(super::ok("Team deleted", json!({})))
}

/// POST /api/teams/:id/members - team ADMIN only
pub async fn add_member(
    State(state): State<Arc<AppState>>,
    Path(team_id): Path<i32>,
    headers: HeaderMap,
    Json(req): Json<AddMemberRequest>,
) -> Result<Response> {
    let token = require_auth(&headers, &state.auth)?;
    policy::require_team_role(&state.db, team_id, token.user_id, &[TeamRole::Admin]).await?;

    let role = TeamRole::parse(&req.role)
        .ok_or_else(|| ServerError::Validation(format!("Unknown team role: {}", req.role)))?;

    let found = team::Entity::find_by_id(team_id)
        .one(&state.db)
        .await?
        .ok_or(ServerError::NotFoundOrDenied)?;

    let added_user = user::Entity::find_by_id(req.user_id)
        .one(&state.db)
        .await?
        .ok_or(ServerError::NotFound("User"))?;

    let existing = team_member::Entity::find()
        .filter(team_member::Column::TeamId.eq(team_id))
        .filter(team_member::Column::UserId.eq(added_user.id))
        .one(&state.db)
        .await?;
    if existing.is_some() {
        return Err(ServerError::Conflict(
            "User is already a member of this team".to_string(),
        ));
    }

    let membership = team_member::ActiveModel {
        team_id: Set(team_id),
        user_id: Set(added_user.id),
        role: Set(role.as_str().to_string()),
        created_at: Set(now_ts()),
        ..Default::default()
    }
    .insert(&state.db)
    .await?;

    state
        .bus
        .publish(&DomainEvent::TeamMemberAdded {
            team: found,
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

/// DELETE /api/teams/:id/members/:user_id - team ADMIN only
pub async fn remove_member(
    State(state): State<Arc<AppState>>,
    Path((team_id, user_id)): Path<(i32, i32)>,
    headers: HeaderMap,
) -> Result<Response> {
    let token = require_auth(&headers, &state.auth)?;
    policy::require_team_role(&state.db, team_id, token.user_id, &[TeamRole::Admin]).await?;

    let result = team_member::Entity::delete_many()
        .filter(team_member::Column::TeamId.eq(team_id))
        .filter(team_member::Column::UserId.eq(user_id))
        .exec(&state.db)
        .await?;

    if result.rows_affected == 0 {
        return Err(ServerError::NotFound("Membership"));
    }

    // Project memberships under this team are left alone; they were only
    // checked against team membership at add time.
    Ok(super::ok("Member removed", json!({})))
}
