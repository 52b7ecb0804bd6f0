//! Label handlers. Labels are project-scoped; only project ADMIN/MANAGER
//! may create or delete them.

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
use crate::db::entities::label;
use crate::db::now_ts;
use crate::error::{Result, ServerError};
use crate::events::{Actor, DomainEvent};
use crate::policy::{self, PROJECT_MANAGERS};

#[derive(Deserialize)]
pub struct CreateLabelRequest {
    pub name: String,
    pub color: String,
}

fn validate_color(color: &str) -> Result<&str> {
    let valid = color.len() == 7
        && color.starts_with('#')
        && color[1..].chars().all(|c| c.is_ascii_hexdigit());
    if !valid {
        return Err(ServerError::Validation(
            "Color must be a #RRGGBB hex value".to_string(),
        ));
    }
    Ok(color)
}

/// Create a label; names are unique within a project
pub(crate) async fn create_label_record(
    db: &DatabaseConnection,
    project_id: i32,
    name: &str,
    color: &str,
) -> Result<label::Model> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ServerError::Validation("Name cannot be empty".to_string()));
    }
    let color = validate_color(color)?;

    let existing = label::Entity::find()
        .filter(label::Column::ProjectId.eq(project_id))
        .filter(label::Column::Name.eq(name))
        .one(db)
        .await?;
    if existing.is_some() {
        return Err(ServerError::Conflict(format!(
            "Label \"{}\" already exists in this project",
            name
        )));
    }

    let row = label::ActiveModel {
        project_id: Set(project_id),
        name: Set(name.to_string()),
        color: Set(color.to_string()),
        created_at: Set(now_ts()),
        ..Default::default()
    }
    .insert(db)
    .await?;

    Ok(row)
}

/// GET /api/projects/:id/labels - any project member
pub async fn list_labels(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<i32>,
    headers: HeaderMap,
) -> Result<Response> {
    let token = require_auth(&headers, &state.auth)?;
    policy::require_project_member(&state.db, project_id, token.user_id).await?;

    let labels = label::Entity::find()
        .filter(label::Column::ProjectId.eq(project_id))
        .all(&state.db)
        .await?;

    Ok(super::ok("Labels", json!({ "labels": labels })))
}

/// POST /api/projects/:id/labels - project ADMIN/MANAGER only
pub async fn create_label(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<i32>,
    headers: HeaderMap,
    Json(req): Json<CreateLabelRequest>,
) -> Result<Response> {
    let token = require_auth(&headers, &state.auth)?;
    policy::require_project_role(&state.db, project_id, token.user_id, PROJECT_MANAGERS).await?;

    let created = create_label_record(&state.db, project_id, &req.name, &req.color).await?;

    state
        .bus
        .publish(&DomainEvent::LabelCreated {
            label: created.clone(),
            actor: Actor {
                id: token.user_id,
                username: token.username,
            },
        })
        .await;

    Ok(super::created("Label created", json!({ "label": created })))
}

/// DELETE /api/projects/:id/labels/:label_id - project ADMIN/MANAGER only
pub async fn delete_label(
    State(state): State<Arc<AppState>>,
    Path((project_id, label_id)): Path<(i32, i32)>,
    headers: HeaderMap,
) -> Result<Response> {
    let token = require_auth(&headers, &state.auth)?;
    policy::require_project_role(&state.db, project_id, token.user_id, PROJECT_MANAGERS).await?;

    let found = label::Entity::find_by_id(label_id)
        .one(&state.db)
        .await?
        .filter(|l| l.project_id == project_id)
        .ok_or(ServerError::NotFound("Label"))?;

    // Cascade clears any task_labels rows pointing at it.
    label::Entity::delete_by_id(found.id).exec(&state.db).await?;

    state
        .bus
        .publish(&DomainEvent::LabelDeleted {
            label_id: found.id,
            project_id,
            actor: Actor {
                id: token.user_id,
                username: token.username,
            },
        })
        .await;

    Ok(super::ok("Label deleted", json!({})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::db::entities::{project, team};

    async fn seed_project(db: &DatabaseConnection) -> project::Model {
        let t = team::ActiveModel {
            name: Set("core".to_string()),
            created_at: Set(now_ts()),
            ..Default::default()
        }
        .insert(db)
        .await
        .unwrap();
        project::ActiveModel {
            team_id: Set(t.id),
            name: Set("site".to_string()),
            description: Set(None),
            is_active: Set(true),
            created_at: Set(now_ts()),
            ..Default::default()
        }
        .insert(db)
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn label_names_unique_per_project() {
        let db = db::open("sqlite::memory:").await.unwrap();
        let p1 = seed_project(&db).await;
        let p2 = seed_project(&db).await;

        create_label_record(&db, p1.id, "bug", "#FF0000")
            .await
            .unwrap();
        let err = create_label_record(&db, p1.id, "bug", "#00FF00")
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Conflict(_)));

        // Same name in another project is fine.
        create_label_record(&db, p2.id, "bug", "#FF0000")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn color_validation() {
        let db = db::open("sqlite::memory:").await.unwrap();
        let p = seed_project(&db).await;

        for bad in ["red", "#12345", "#GGGGGG", "FF0000"] {
            let err = create_label_record(&db, p.id, "x", bad).await.unwrap_err();
            assert!(matches!(err, ServerError::Validation(_)), "{}", bad);
        }
        assert!(create_label_record(&db, p.id, "x", "#1a2B3c").await.is_ok());
    }
}
