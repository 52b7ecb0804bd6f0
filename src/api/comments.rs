//! Comment handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::Response,
    Json,
};
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set};
use serde::Deserialize;
use serde_json::json;

use super::auth::require_auth;
use super::AppState;
use crate::db::entities::{comment, task};
use crate::db::now_ts;
use crate::error::{Result, ServerError};
use crate::events::{Actor, DomainEvent};
use crate::policy;

#[derive(Deserialize)]
pub struct CommentRequest {
    pub content: String,
}

fn validate_content(content: &str) -> Result<&str> {
    let content = content.trim();
    if content.is_empty() {
        return Err(ServerError::Validation(
            "Comment cannot be empty".to_string(),
        ));
    }
    Ok(content)
}

/// GET /api/tasks/:id/comments - any member of the task's project
pub async fn list_comments(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<i32>,
    headers: HeaderMap,
) -> Result<Response> {
    let token = require_auth(&headers, &state.auth)?;

    let parent = task::Entity::find_by_id(task_id)
        .one(&state.db)
        .await?
        .ok_or(ServerError::NotFoundOrDenied)?;
    policy::require_project_member(&state.db, parent.project_id, token.user_id).await?;

    let comments = comment::Entity::find()
        .filter(comment::Column::TaskId.eq(task_id))
        .order_by_asc(comment::Column::CreatedAt)
        .all(&state.db)
        .await?;

    Ok(super::ok("Comments", json!({ "comments": comments })))
}

/// POST /api/tasks/:id/comments - any member of the task's project
pub async fn create_comment(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<i32>,
    headers: HeaderMap,
    Json(req): Json<CommentRequest>,
) -> Result<Response> {
    let token = require_auth(&headers, &state.auth)?;

    let parent = task::Entity::find_by_id(task_id)
        .one(&state.db)
        .await?
        .ok_or(ServerError::NotFoundOrDenied)?;
    policy::require_project_member(&state.db, parent.project_id, token.user_id).await?;

    let content = validate_content(&req.content)?;

    let new_comment = comment::ActiveModel {
        task_id: Set(task_id),
        user_id: Set(token.user_id),
        content: Set(content.to_string()),
        created_at: Set(now_ts()),
        updated_at: Set(now_ts()),
        ..Default::default()
    }
    .insert(&state.db)
    .await?;

    state
        .bus
        .publish(&DomainEvent::CommentAdded {
            comment: new_comment.clone(),
            task: parent,
            actor: Actor {
                id: token.user_id,
                username: token.username,
            },
        })
        .await;

    Ok(super::created(
        "Comment added",
        json!({ "comment": new_comment }),
    ))
}

/// PUT /api/comments/:id - author only
pub async fn update_comment(
    State(state): State<Arc<AppState>>,
    Path(comment_id): Path<i32>,
    headers: HeaderMap,
    Json(req): Json<CommentRequest>,
) -> Result<Response> {
    let token = require_auth(&headers, &state.auth)?;

    let found = comment::Entity::find_by_id(comment_id)
        .one(&state.db)
        .await?
        .ok_or(ServerError::NotFoundOrDenied)?;

    let parent = task::Entity::find_by_id(found.task_id)
        .one(&state.db)
        .await?
        .ok_or(ServerError::NotFoundOrDenied)?;
    policy::require_project_member(&state.db, parent.project_id, token.user_id).await?;

    if found.user_id != token.user_id {
        return Err(ServerError::NotFoundOrDenied);
    }

    let content = validate_content(&req.content)?;

    let mut am: comment::ActiveModel = found.into();
    am.content = Set(content.to_string());
    am.updated_at = Set(now_ts());
    let updated = am.update(&state.db).await?;

    state
        .bus
        .publish(&DomainEvent::CommentUpdated {
            comment: updated.clone(),
            project_id: parent.project_id,
            actor: Actor {
                id: token.user_id,
                username: token.username,
            },
        })
        .await;

    Ok(super::ok("Comment updated", json!({ "comment": updated })))
}

/// DELETE /api/comments/:id - author or project ADMIN/MANAGER
pub async fn delete_comment(
    State(state): State<Arc<AppState>>,
    Path(comment_id): Path<i32>,
    headers: HeaderMap,
) -> Result<Response> {
    let token = require_auth(&headers, &state.auth)?;

    let found = comment::Entity::find_by_id(comment_id)
        .one(&state.db)
        .await?
        .ok_or(ServerError::NotFoundOrDenied)?;

    let parent = task::Entity::find_by_id(found.task_id)
        .one(&state.db)
        .await?
        .ok_or(ServerError::NotFoundOrDenied)?;

    policy::require_comment_deleter(&state.db, &found, parent.project_id, token.user_id).await?;

    comment::Entity::delete_by_id(comment_id)
        .exec(&state.db)
        .await?;

    state
        .bus
        .publish(&DomainEvent::CommentDeleted {
            comment_id,
            task_id: parent.id,
            project_id: parent.project_id,
            actor: Actor {
                id: token.user_id,
                username: token.username,
            },
        })
        .await;

    Ok(super::ok("Comment deleted", json!({})))
}
