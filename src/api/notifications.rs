//! Notification read APIs. Rows are created only by the notification
//! pipeline; these endpoints let the recipient page through and
//! acknowledge them.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::Response,
};
use serde::Deserialize;
use serde_json::json;

use super::auth::require_auth;
use super::AppState;
use crate::error::Result;
use crate::notify;

const DEFAULT_PAGE_SIZE: u64 = 20;
const MAX_PAGE_SIZE: u64 = 100;

#[derive(Deserialize, Default)]
pub struct NotificationQuery {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    #[serde(rename = "unreadOnly")]
    pub unread_only: Option<bool>,
}

/// GET /api/notifications?limit&offset&unreadOnly
pub async fn list_notifications(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NotificationQuery>,
    headers: HeaderMap,
) -> Result<Response> {
    let token = require_auth(&headers, &state.auth)?;

    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0);
    let unread_only = query.unread_only.unwrap_or(false);

    let notifications =
        notify::list_for_user(&state.db, token.user_id, limit, offset, unread_only).await?;

    Ok(super::ok(
        "Notifications",
        json!({ "notifications": notifications, "limit": limit, "offset": offset }),
    ))
}

/// GET /api/notifications/unread-count
pub async fn get_unread_count(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response> {
    let token = require_auth(&headers, &state.auth)?;
    let count = notify::unread_count(&state.db, token.user_id).await?;

    Ok(super::ok("Unread count", json!({ "count": count })))
}

/// PUT /api/notifications/:id/read
pub async fn mark_notification_read(
    State(state): State<Arc<AppState>>,
    Path(notification_id): Path<i32>,
    headers: HeaderMap,
) -> Result<Response> {
    let token = require_auth(&headers, &state.auth)?;
    let updated = notify::mark_read(&state.db, token.user_id, notification_id).await?;

    Ok(super::ok(
        "Notification marked read",
        json!({ "notification": updated }),
    ))
}

/// PUT /api/notifications/read-all
pub async fn mark_all_notifications_read(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response> {
    let token = require_auth(&headers, &state.auth)?;
    let count = notify::mark_all_read(&state.db, token.user_id).await?;

    Ok(super::ok("All notifications marked read", json!({ "count": count })))
}
