//! Task and task-label handlers.

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
use crate::db::entities::{label, project_member, task, task_label};
use crate::db::now_ts;
use crate::error::{Result, ServerError};
use crate::events::{Actor, DomainEvent};
use crate::policy;

/// Task workflow state. Transitions are unconstrained: any status may be
/// set from any other, DONE back to TODO included.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    Todo,
    InProgress,
    Done,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "TODO",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Done => "DONE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TODO" => Some(TaskStatus::Todo),
            "IN_PROGRESS" => Some(TaskStatus::InProgress),
            "DONE" => Some(TaskStatus::Done),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskPriority {
    Low,
    Medium,
    High,
    Urgent,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "LOW",
            TaskPriority::Medium => "MEDIUM",
            TaskPriority::High => "HIGH",
            TaskPriority::Urgent => "URGENT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LOW" => Some(TaskPriority::Low),
            "MEDIUM" => Some(TaskPriority::Medium),
            "HIGH" => Some(TaskPriority::High),
            "URGENT" => Some(TaskPriority::Urgent),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
pub struct CreateTaskRequest {
    pub project_id: i32,
    pub title: String,
    pub description: Option<String>,
    pub status: Option<String>,
    pub priority: Option<String>,
    pub assignee_id: Option<i32>,
    pub due_date: Option<i64>,
}

#[derive(Deserialize, Default)]
pub struct UpdateTaskRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<String>,
    pub priority: Option<String>,
    // Double option: absent leaves the assignee alone, null clears it.
    #[serde(default)]
    pub assignee_id: Option<Option<i32>>,
    pub due_date: Option<i64>,
}

fn parse_status(s: &str) -> Result<TaskStatus> {
    TaskStatus::parse(s).ok_or_else(|| ServerError::Validation(format!("Unknown status: {}", s)))
}

fn parse_priority(s: &str) -> Result<TaskPriority> {
    TaskPriority::parse(s)
        .ok_or_else(|| ServerError::Validation(format!("Unknown priority: {}", s)))
}

/// An assignee must hold a membership row in the task's project
async fn ensure_assignee_is_member(
    db: &DatabaseConnection,
    project_id: i32,
    assignee_id: i32,
) -> Result<()> {
    let membership = project_member::Entity::find()
        .filter(project_member::Column::ProjectId.eq(project_id))
        .filter(project_member::Column::UserId.eq(assignee_id))
        .one(db)
        .await?;

    if membership.is_none() {
        return Err(ServerError::Validation(
            "Assignee is not a member of this project".to_string(),
        ));
    }
    Ok(())
}

/// Attach a label to a task. The label must belong to the task's project,
/// whoever is asking.
pub(crate) async fn assign_label_record(
    db: &DatabaseConnection,
    task: &task::Model,
    label_id: i32,
) -> Result<label::Model> {
    let found = label::Entity::find_by_id(label_id)
        .one(db)
        .await?
        .ok_or(ServerError::NotFound("Label"))?;

    if found.project_id != task.project_id {
        return Err(ServerError::Validation(
            "Label does not belong to this task's project".to_string(),
        ));
    }

    let existing = task_label::Entity::find()
        .filter(task_label::Column::TaskId.eq(task.id))
        .filter(task_label::Column::LabelId.eq(label_id))
        .one(db)
        .await?;
    if existing.is_some() {
        return Err(ServerError::Conflict(
            "Label is already assigned to this task".to_string(),
        ));
    }

    task_label::ActiveModel {
        task_id: Set(task.id),
        label_id: Set(label_id),
        ..Default::default()
    }
    .insert(db)
    .await?;

    Ok(found)
}

/// Detach a label from a task
pub(crate) async fn remove_label_record(
    db: &DatabaseConnection,
    task_id: i32,
    label_id: i32,
) -> Result<()> {
    let result = task_label::Entity::delete_many()
        .filter(task_label::Column::TaskId.eq(task_id))
        .filter(task_label::Column::LabelId.eq(label_id))
        .exec(db)
        .await?;

    if result.rows_affected == 0 {
        return Err(ServerError::NotFound("Label assignment"));
    }
    Ok(())
}

/// Label ids currently attached to a task
pub(crate) async fn task_label_ids(db: &DatabaseConnection, task_id: i32) -> Result<Vec<i32>> {
    Ok(task_label::Entity::find()
        .filter(task_label::Column::TaskId.eq(task_id))
        .all(db)
        .await?
        .into_iter()
        .map(|tl| tl.label_id)
        .collect())
}

/// POST /api/tasks - any project member
pub async fn create_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateTaskRequest>,
) -> Result<Response> {
    let token = require_auth(&headers, &state.auth)?;
    policy::require_project_member(&state.db, req.project_id, token.user_id).await?;

    let title = req.title.trim();
    if title.is_empty() {
        return Err(ServerError::Validation("Title cannot be empty".to_string()));
    }

    let status = parse_status(req.status.as_deref().unwrap_or("TODO"))?;
    let priority = parse_priority(req.priority.as_deref().unwrap_or("MEDIUM"))?;

    if let Some(assignee_id) = req.assignee_id {
        ensure_assignee_is_member(&state.db, req.project_id, assignee_id).await?;
    }

    let new_task = task::ActiveModel {
        project_id: Set(req.project_id),
        title: Set(title.to_string()),
        description: Set(req.description),
        status: Set(status.as_str().to_string()),
        priority: Set(priority.as_str().to_string()),
        assignee_id: Set(req.assignee_id),
        created_by_id: Set(token.user_id),
        due_date: Set(req.due_date),
        created_at: Set(now_ts()),
        updated_at: Set(now_ts()),
        ..Default::default()
    }
    .insert(&state.db)
    .await?;

    state
        .bus
        .publish(&DomainEvent::TaskCreated {
            task: new_task.clone(),
            actor: Actor {
                id: token.user_id,
                username: token.username,
            },
        })
        .await;

    Ok(super::created("Task created", json!({ "task": new_task })))
}

/// GET /api/projects/:id/tasks - any project member
pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<i32>,
    headers: HeaderMap,
) -> Result<Response> {
    let token = require_auth(&headers, &state.auth)?;
    policy::require_project_member(&state.db, project_id, token.user_id).await?;

    let tasks = task::Entity::find()
        .filter(task::Column::ProjectId.eq(project_id))
        .all(&state.db)
        .await?;

    Ok(super::ok("Tasks", json!({ "tasks": tasks })))
}

/// GET /api/tasks/:id - any member of the task's project
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<i32>,
    headers: HeaderMap,
) -> Result<Response> {
    let token = require_auth(&headers, &state.auth)?;

    let found = task::Entity::find_by_id(task_id)
        .one(&state.db)
        .await?
        .ok_or(ServerError::NotFoundOrDenied)?;
    policy::require_project_member(&state.db, found.project_id, token.user_id).await?;

    let label_ids = task_label_ids(&state.db, found.id).await?;
    let labels = label::Entity::find()
        .filter(label::Column::Id.is_in(label_ids))
        .all(&state.db)
        .await?;

    Ok(super::ok(
        "Task",
        json!({ "task": found, "labels": labels }),
    ))
}

/// PUT /api/tasks/:id - any member of the task's project
pub async fn update_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<i32>,
    headers: HeaderMap,
    Json(req): Json<UpdateTaskRequest>,
) -> Result<Response> {
    let token = require_auth(&headers, &state.auth)?;

    let found = task::Entity::find_by_id(task_id)
        .one(&state.db)
        .await?
        .ok_or(ServerError::NotFoundOrDenied)?;
    policy::require_project_member(&state.db, found.project_id, token.user_id).await?;

    let project_id = found.project_id;
    let old_assignee = found.assignee_id;

    let mut am: task::ActiveModel = found.into();

    if let Some(title) = req.title {
        let title = title.trim().to_string();
        if title.is_empty() {
            return Err(ServerError::Validation("Title cannot be empty".to_string()));
        }
        am.title = Set(title);
    }
    if let Some(description) = req.description {
        am.description = Set(Some(description));
    }
    if let Some(status) = req.status.as_deref() {
        am.status = Set(parse_status(status)?.as_str().to_string());
    }
    if let Some(priority) = req.priority.as_deref() {
        am.priority = Set(parse_priority(priority)?.as_str().to_string());
    }
    if let Some(due_date) = req.due_date {
        am.due_date = Set(Some(due_date));
    }

    let mut assignee_changed = false;
    if let Some(new_assignee) = req.assignee_id {
        if let Some(assignee_id) = new_assignee {
            ensure_assignee_is_member(&state.db, project_id, assignee_id).await?;
        }
        assignee_changed = new_assignee != old_assignee && new_assignee.is_some();
        am.assignee_id = Set(new_assignee);
    }

    am.updated_at = Set(now_ts());
    let updated = am.update(&state.db).await?;

    state
        .bus
        .publish(&DomainEvent::TaskUpdated {
            task: updated.clone(),
            actor: Actor {
                id: token.user_id,
                username: token.username,
            },
            assignee_changed,
        })
        .await;

    Ok(super::ok("Task updated", json!({ "task": updated })))
}

/// DELETE /api/tasks/:id - creator or project ADMIN/MANAGER
pub async fn delete_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<i32>,
    headers: HeaderMap,
) -> Result<Response> {
    let token = require_auth(&headers, &state.auth)?;

    let found = task::Entity::find_by_id(task_id)
        .one(&state.db)
        .await?
        .ok_or(ServerError::NotFoundOrDenied)?;
    policy::require_task_deleter(&state.db, &found, token.user_id).await?;

    let project_id = found.project_id;
    task::Entity::delete_by_id(task_id).exec(&state.db).await?;
    tracing::info!(task_id, project_id, user_id = token.user_id, "task deleted");

    state
        .bus
        .publish(&DomainEvent::TaskDeleted {
            task_id,
            project_id,
            actor: Actor {
                id: token.user_id,
                username: token.username,
            },
        })
        .await;

    Ok(super::ok("Task deleted", json!({})))
}

/// PUT /api/tasks/:id/labels/:label_id - any project member
pub async fn assign_label(
    State(state): State<Arc<AppState>>,
    Path((task_id, label_id)): Path<(i32, i32)>,
    headers: HeaderMap,
) -> Result<Response> {
    let token = require_auth(&headers, &state.auth)?;

    let found = task::Entity::find_by_id(task_id)
        .one(&state.db)
        .await?
        .ok_or(ServerError::NotFoundOrDenied)?;
    policy::require_project_member(&state.db, found.project_id, token.user_id).await?;

    let assigned = assign_label_record(&state.db, &found, label_id).await?;

    state
        .bus
        .publish(&DomainEvent::TaskLabelAssigned {
            task: found,
            label: assigned.clone(),
            actor: Actor {
                id: token.user_id,
                username: token.username,
            },
        })
        .await;

    Ok(super::ok("Label assigned", json!({ "label": assigned })))
}

/// DELETE /api/tasks/:id/labels/:label_id - any project member
pub async fn remove_label(
    State(state): State<Arc<AppState>>,
    Path((task_id, label_id)): Path<(i32, i32)>,
    headers: HeaderMap,
) -> Result<Response> {
    let token = require_auth(&headers, &state.auth)?;

    let found = task::Entity::find_by_id(task_id)
        .one(&state.db)
        .await?
        .ok_or(ServerError::NotFoundOrDenied)?;
    policy::require_project_member(&state.db, found.project_id, token.user_id).await?;

    remove_label_record(&state.db, task_id, label_id).await?;

    state
        .bus
        .publish(&DomainEvent::TaskLabelRemoved {
            task: found,
            label_id,
            actor: Actor {
                id: token.user_id,
                username: token.username,
            },
        })
        .await;

    Ok(super::ok("Label removed", json!({})))
}
