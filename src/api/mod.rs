pub mod auth;
pub mod comments;
pub mod labels;
pub mod notifications;
pub mod projects;
pub mod tasks;
pub mod teams;

use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use sea_orm::DatabaseConnection;
use serde_json::{json, Value};

use crate::events::EventBus;
use crate::notify::NotificationPipeline;
use crate::realtime::{RealtimeBroadcaster, RoomRegistry};
use auth::AuthManager;

/// Application state shared across handlers
pub struct AppState {
    pub db: DatabaseConnection,
    pub auth: AuthManager,
    pub registry: Arc<RoomRegistry>,
    pub bus: EventBus,
}

impl AppState {
    pub fn new(db: DatabaseConnection) -> Self {
        let registry = Arc::new(RoomRegistry::new());
        let bus = EventBus::new()
            .with_subscriber(Arc::new(RealtimeBroadcaster::new(registry.clone())))
            .with_subscriber(Arc::new(NotificationPipeline::new(
                db.clone(),
                registry.clone(),
            )));

        Self {
            db,
            auth: AuthManager::new(),
            registry,
            bus,
        }
    }
}

/// Success envelope: `{success: true, message, data}`
pub fn ok(message: &str, data: Value) -> Response {
    Json(json!({ "success": true, "message": message, "data": data })).into_response()
}

/// Success envelope with 201 status
pub fn created(message: &str, data: Value) -> Response {
    (
        StatusCode::CREATED,
        Json(json!({ "success": true, "message": message, "data": data })),
    )
        .into_response()
}

/// REST surface under /api
pub fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        // Auth
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::login))
        // Teams
        .route("/api/teams", post(teams::create_team).get(teams::list_teams))
        .route(
            "/api/teams/:id",
            get(teams::get_team)
                .put(teams::update_team)
                .delete(teams::delete_team),
        )
        .route("/api/teams/:id/members", post(teams::add_member))
        .route(
            "/api/teams/:id/members/:user_id",
            delete(teams::remove_member),
        )
        // Projects
        .route(
            "/api/projects",
            post(projects::create_project).get(projects::list_projects),
        )
        .route(
            "/api/projects/:id",
            get(projects::get_project)
                .put(projects::update_project)
                .delete(projects::delete_project),
        )
        .route("/api/projects/:id/members", post(projects::add_member))
        .route(
            "/api/projects/:id/members/:user_id",
            delete(projects::remove_member),
        )
        .route("/api/projects/:id/tasks", get(tasks::list_tasks))
        .route(
            "/api/projects/:id/labels",
            post(labels::create_label).get(labels::list_labels),
        )
        .route(
            "/api/projects/:id/labels/:label_id",
            delete(labels::delete_label),
        )
        // Tasks
        .route("/api/tasks", post(tasks::create_task))
        .route(
            "/api/tasks/:id",
            get(tasks::get_task)
                .put(tasks::update_task)
                .delete(tasks::delete_task),
        )
        .route(
            "/api/tasks/:id/labels/:label_id",
            put(tasks::assign_label).delete(tasks::remove_label),
        )
        .route(
            "/api/tasks/:id/comments",
            post(comments::create_comment).get(comments::list_comments),
        )
        // Comments
        .route(
            "/api/comments/:id",
            put(comments::update_comment).delete(comments::delete_comment),
        )
        // Notifications
        .route("/api/notifications", get(notifications::list_notifications))
        .route(
            "/api/notifications/unread-count",
            get(notifications::get_unread_count),
        )
        .route(
            "/api/notifications/:id/read",
            put(notifications::mark_notification_read),
        )
        .route(
            "/api/notifications/read-all",
            put(notifications::mark_all_notifications_read),
        )
}

/// Health check endpoint
pub async fn health() -> Response {
    ok(
        "healthy",
        json!({ "version": env!("CARGO_PKG_VERSION") }),
    )
}
