//! Client-side reconciliation of pushed events.
//!
//! Every push is treated as "something changed, re-sync": task and
//! task-label events invalidate the affected project's task list, comment
//! events invalidate the open comment thread, and the client refetches
//! rather than patching entities by id (a pushed payload is advisory, not
//! authoritative, under write-write races). Label catalog changes only
//! surface a toast. Toasts are suppressed for self-originated events; the
//! state invalidation still applies.

#![allow(dead_code)] // Consumed by realtime clients; the server binary only ships it

use std::collections::HashSet;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Result, ServerError};
use crate::realtime::project_channel;

/// A server push as it arrives on the wire
#[derive(Debug, Clone, Deserialize)]
pub struct ServerPush {
    pub event: String,
    pub payload: Value,
}

impl ServerPush {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|err| ServerError::Validation(format!("bad push frame: {}", err)))
    }
}

/// A user-visible alert accompanying a push
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toast {
    pub message: String,
}

/// Local cache state for one connected client.
pub struct ClientCache {
    user_id: i32,
    joined_projects: HashSet<i32>,
    stale_projects: HashSet<i32>,
    open_task: Option<i32>,
    comments_stale: bool,
    notifications: Vec<Value>,
    unread: u64,
}

impl ClientCache {
    pub fn new(user_id: i32) -> Self {
        Self {
            user_id,
            joined_projects: HashSet::new(),
            stale_projects: HashSet::new(),
            open_task: None,
            comments_stale: false,
            notifications: Vec::new(),
            unread: 0,
        }
    }

    pub fn join_project(&mut self, project_id: i32) {
        self.joined_projects.insert(project_id);
    }

    pub fn leave_project(&mut self, project_id: i32) {
        self.joined_projects.remove(&project_id);
        self.stale_projects.remove(&project_id);
    }

    /// Channels to re-join after a reconnect. Room membership is lost with
    /// the transport; without replaying these joins, updates stop arriving.
    pub fn channels_to_rejoin(&self) -> Vec<String> {
        self.joined_projects.iter().map(|id| project_channel(*id)).collect()
    }

    pub fn open_task_comments(&mut self, task_id: i32) {
        self.open_task = Some(task_id);
        self.comments_stale = false;
    }

    pub fn close_task_comments(&mut self) {
        self.open_task = None;
        self.comments_stale = false;
    }

    pub fn project_needs_refetch(&self, project_id: i32) -> bool {
        self.stale_projects.contains(&project_id)
    }

    pub fn mark_project_refreshed(&mut self, project_id: i32) {
        self.stale_projects.remove(&project_id);
    }

    pub fn comments_need_refetch(&self) -> bool {
        self.comments_stale
    }

    pub fn unread(&self) -> u64 {
        self.unread
    }

    pub fn set_unread(&mut self, count: u64) {
        self.unread = count;
    }

    pub fn notifications(&self) -> &[Value] {
        &self.notifications
    }

    /// Apply one push to local state, returning a toast unless the event
    /// originated from this client's own user.
    pub fn apply(&mut self, push: &ServerPush) -> Option<Toast> {
        let self_originated = actor_id(&push.payload) == Some(self.user_id);

        match push.event.as_str() {
            "task-created" | "task-updated" | "task-label-assigned" | "task-label-removed" => {
                if let Some(project_id) = push.payload["task"]["project_id"].as_i64() {
                    self.stale_projects.insert(project_id as i32);
                }
            }
            "task-deleted" => {
                if let Some(project_id) = push.payload["projectId"].as_i64() {
                    self.stale_projects.insert(project_id as i32);
                }
            }
            "comment-added" | "comment-updated" | "comment-deleted" => {
                if let Some(task_id) = push.payload["taskId"].as_i64() {
                    if self.open_task == Some(task_id as i32) {
                        self.comments_stale = true;
                    }
                }
            }
            "label-created" | "label-deleted" => {
                // Informational only; the label catalog is refetched lazily.
            }
            "notification" => {
                self.notifications.insert(0, push.payload.clone());
                if push.payload["is_read"] != Value::Bool(true) {
                    self.unread += 1;
                }
                if let Some(title) = push.payload["title"].as_str() {
                    return Some(Toast {
                        message: title.to_string(),
                    });
                }
                return None;
            }
            other => {
                tracing::debug!(event = other, "ignoring unknown push event");
                return None;
            }
        }

        if self_originated {
            None
        } else {
            Some(Toast {
                message: toast_message(&push.event, &push.payload),
            })
        }
    }
}

fn actor_id(payload: &Value) -> Option<i32> {
    for key in ["createdBy", "updatedBy", "deletedBy", "actor"] {
        if let Some(id) = payload[key]["id"].as_i64() {
            return Some(id as i32);
        }
    }
    None
}

fn actor_name(payload: &Value) -> &str {
    for key in ["createdBy", "updatedBy", "deletedBy", "actor"] {
        if let Some(name) = payload[key]["username"].as_str() {
            return name;
        }
    }
    "someone"
}

fn toast_message(event: &str, payload: &Value) -> String {
    let who = actor_name(payload);
    match event {
        "task-created" => format!(
            "{} created task \"{}\"",
            who,
            payload["task"]["title"].as_str().unwrap_or("?")
        ),
        "task-updated" => format!(
            "{} updated task \"{}\"",
            who,
            payload["task"]["title"].as_str().unwrap_or("?")
        ),
        "task-deleted" => format!("{} deleted a task", who),
        "comment-added" => format!("{} added a comment", who),
        "comment-updated" => format!("{} edited a comment", who),
        "comment-deleted" => format!("{} deleted a comment", who),
        "label-created" => format!(
            "{} created label \"{}\"",
            who,
            payload["label"]["name"].as_str().unwrap_or("?")
        ),
        "label-deleted" => format!("{} deleted a label", who),
        "task-label-assigned" => format!(
            "{} labeled task \"{}\"",
            who,
            payload["task"]["title"].as_str().unwrap_or("?")
        ),
        "task-label-removed" => format!(
            "{} unlabeled task \"{}\"",
            who,
            payload["task"]["title"].as_str().unwrap_or("?")
        ),
        _ => format!("{} changed something", who),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn push(event: &str, payload: Value) -> ServerPush {
        ServerPush {
            event: event.to_string(),
            payload,
        }
    }

    fn task_payload(project_id: i32, actor_id: i32) -> Value {
        json!({
            "task": {
                "id": 11,
                "project_id": project_id,
                "title": "Fix bug",
                "status": "DONE",
            },
            "updatedBy": { "id": actor_id, "username": "alice" },
        })
    }

    #[test]
    fn parse_round_trips_wire_frames() {
        let frame = r#"{"event":"task-updated","payload":{"task":{"id":1}}}"#;
        let push = ServerPush::parse(frame).unwrap();
        assert_eq!(push.event, "task-updated");
        assert_eq!(push.payload["task"]["id"], 1);

        assert!(ServerPush::parse("not json").is_err());
    }

    #[test]
    fn task_update_invalidates_and_toasts() {
        let mut cache = ClientCache::new(2);
        cache.join_project(3);

        let toast = cache.apply(&push("task-updated", task_payload(3, 1)));
        assert!(cache.project_needs_refetch(3));
        assert_eq!(
            toast.unwrap().message,
            "alice updated task \"Fix bug\""
        );

        cache.mark_project_refreshed(3);
        assert!(!cache.project_needs_refetch(3));
    }

    #[test]
    fn self_originated_events_update_state_without_toast() {
        let mut cache = ClientCache::new(1);
        cache.join_project(3);

        let toast = cache.apply(&push("task-updated", task_payload(3, 1)));
        assert!(toast.is_none());
        // State update still applies.
        assert!(cache.project_needs_refetch(3));
    }

    #[test]
    fn task_deleted_uses_payload_project_id() {
        let mut cache = ClientCache::new(2);
        let toast = cache.apply(&push(
            "task-deleted",
            json!({
                "taskId": 11,
                "projectId": 4,
                "deletedBy": { "id": 9, "username": "carol" },
            }),
        ));
        assert!(cache.project_needs_refetch(4));
        assert_eq!(toast.unwrap().message, "carol deleted a task");
    }

    #[test]
    fn comment_events_only_touch_the_open_thread() {
        let mut cache = ClientCache::new(2);
        cache.open_task_comments(11);

        let _ = cache.apply(&push(
            "comment-added",
            json!({
                "comment": { "id": 5, "task_id": 12 },
                "taskId": 12,
                "actor": { "id": 9, "username": "carol" },
            }),
        ));
        assert!(!cache.comments_need_refetch());

        let _ = cache.apply(&push(
            "comment-added",
            json!({
                "comment": { "id": 6, "task_id": 11 },
                "taskId": 11,
                "actor": { "id": 9, "username": "carol" },
            }),
        ));
        assert!(cache.comments_need_refetch());
    }

    #[test]
    fn label_events_toast_without_invalidation() {
        let mut cache = ClientCache::new(2);
        cache.join_project(3);

        let toast = cache.apply(&push(
            "label-created",
            json!({
                "label": { "id": 1, "project_id": 3, "name": "bug" },
                "createdBy": { "id": 9, "username": "carol" },
            }),
        ));
        assert_eq!(toast.unwrap().message, "carol created label \"bug\"");
        assert!(!cache.project_needs_refetch(3));
    }

    #[test]
    fn notifications_prepend_and_count() {
        let mut cache = ClientCache::new(2);

        let toast = cache.apply(&push(
            "notification",
            json!({
                "id": 1,
                "user_id": 2,
                "ntype": "TASK_ASSIGNED",
                "title": "New task assignment",
                "is_read": false,
            }),
        ));
        assert_eq!(toast.unwrap().message, "New task assignment");
        assert_eq!(cache.unread(), 1);

        let _ = cache.apply(&push(
            "notification",
            json!({
                "id": 2,
                "user_id": 2,
                "ntype": "COMMENT_ADDED",
                "title": "New comment",
                "is_read": false,
            }),
        ));
        assert_eq!(cache.unread(), 2);
        // Newest first.
        assert_eq!(cache.notifications()[0]["id"], 2);
    }

    #[test]
    fn reconnect_replays_joined_project_channels() {
        let mut cache = ClientCache::new(2);
        cache.join_project(3);
        cache.join_project(8);
        cache.leave_project(3);

        let channels = cache.channels_to_rejoin();
        assert_eq!(channels, vec!["project:8".to_string()]);
    }

    #[test]
    fn unknown_events_are_ignored() {
        let mut cache = ClientCache::new(2);
        let toast = cache.apply(&push("mystery-event", json!({})));
        assert!(toast.is_none());
        assert_eq!(cache.unread(), 0);
    }
}
