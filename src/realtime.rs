//! Realtime broadcast layer.
//!
//! A single in-process room registry multicasts named events to websocket
//! connections. Two channel kinds exist: `project:<id>`, joined and left
//! explicitly by the client as it navigates, and `user:<id>`, joined
//! automatically when a connection authenticates. Delivery is
//! fire-and-forget: no persistence, no replay, no acknowledgment. A client
//! that reconnects must re-join its project rooms or updates silently stop
//! arriving.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
};
use parking_lot::RwLock;
use sea_orm::DatabaseConnection;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

use crate::api::AppState;
use crate::error::Result;
use crate::events::{DomainEvent, EventSubscriber};
use crate::policy;

pub type ConnId = u64;

pub fn user_channel(user_id: i32) -> String {
    format!("user:{}", user_id)
}

pub fn project_channel(project_id: i32) -> String {
    format!("project:{}", project_id)
}

struct Connection {
    user_id: i32,
    sender: mpsc::UnboundedSender<String>,
    channels: HashSet<String>,
}

#[derive(Default)]
struct Inner {
    rooms: HashMap<String, HashSet<ConnId>>,
    conns: HashMap<ConnId, Connection>,
}

/// Registry of live connections and their room memberships.
///
/// Injectable (held in `AppState` behind an `Arc`) rather than a process
/// global, so tests can stand one up with fake connections and a
/// distributed backend can replace it later.
#[derive(Default)]
pub struct RoomRegistry {
    inner: RwLock<Inner>,
    next_id: AtomicU64,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and auto-join its personal channel.
    pub fn connect(&self, user_id: i32, sender: mpsc::UnboundedSender<String>) -> ConnId {
        let conn_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let channel = user_channel(user_id);

        let mut inner = self.inner.write();
        inner.conns.insert(
            conn_id,
            Connection {
                user_id,
                sender,
                channels: HashSet::from([channel.clone()]),
            },
        );
        inner.rooms.entry(channel).or_default().insert(conn_id);

        tracing::debug!(conn_id, user_id, "realtime connection registered");
        conn_id
    }

    /// Drop a connection from every channel it joined.
    pub fn disconnect(&self, conn_id: ConnId) {
        let mut inner = self.inner.write();
        if let Some(conn) = inner.conns.remove(&conn_id) {
            for channel in conn.channels {
                if let Some(members) = inner.rooms.get_mut(&channel) {
                    members.remove(&conn_id);
                    if members.is_empty() {
                        inner.rooms.remove(&channel);
                    }
                }
            }
            tracing::debug!(conn_id, user_id = conn.user_id, "realtime connection closed");
        }
    }

    pub fn join(&self, conn_id: ConnId, channel: &str) {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        if let Some(conn) = inner.conns.get_mut(&conn_id) {
            conn.channels.insert(channel.to_string());
            inner
                .rooms
                .entry(channel.to_string())
                .or_default()
                .insert(conn_id);
        }
    }

    pub fn leave(&self, conn_id: ConnId, channel: &str) {
        let mut inner = self.inner.write();
        if let Some(conn) = inner.conns.get_mut(&conn_id) {
            conn.channels.remove(channel);
        }
        if let Some(members) = inner.rooms.get_mut(channel) {
            members.remove(&conn_id);
            if members.is_empty() {
                inner.rooms.remove(channel);
            }
        }
    }

    /// Whether the user has at least one live connection.
    pub fn is_connected(&self, user_id: i32) -> bool {
        self.inner
            .read()
            .rooms
            .get(&user_channel(user_id))
            .is_some_and(|m| !m.is_empty())
    }

    /// Multicast a named event to every connection in a channel. Send
    /// failures (a socket mid-teardown) are ignored; returns the number of
    /// connections the message was handed to.
    pub fn broadcast(&self, channel: &str, event: &str, payload: serde_json::Value) -> usize {
        let message = json!({ "event": event, "payload": payload }).to_string();

        let inner = self.inner.read();
        let Some(members) = inner.rooms.get(channel) else {
            return 0;
        };

        let mut delivered = 0;
        for conn_id in members {
            if let Some(conn) = inner.conns.get(conn_id) {
                if conn.sender.send(message.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }

        tracing::debug!(channel, event, delivered, "broadcast");
        delivered
    }
}

/// Client-to-server messages over the websocket
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum ClientMessage {
    JoinProject {
        #[serde(rename = "projectId")]
        project_id: i32,
    },
    LeaveProject {
        #[serde(rename = "projectId")]
        project_id: i32,
    },
    // Compatibility: connects already auto-join the caller's own channel,
    // so this only ever re-joins it. The userId field is ignored.
    JoinUserRoom {
        #[serde(rename = "userId")]
        #[allow(dead_code)]
        user_id: Option<i32>,
    },
}

#[derive(Deserialize)]
pub struct WsQuery {
    pub token: String,
}

/// GET /ws?token=... - websocket endpoint
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    match state.auth.validate_token(&query.token) {
        Ok(token) => ws.on_upgrade(move |socket| handle_socket(state, socket, token.user_id)),
        Err(err) => err.into_response(),
    }
}

async fn handle_socket(state: Arc<AppState>, mut socket: WebSocket, user_id: i32) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let conn_id = state.registry.connect(user_id, tx);

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(msg) => {
                        if socket.send(Message::Text(msg)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(&state.db, &state.registry, conn_id, user_id, &text)
                            .await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    // Transport close is the only disconnect signal; no heartbeat.
    state.registry.disconnect(conn_id);
}

async fn handle_client_message(
    db: &DatabaseConnection,
    registry: &RoomRegistry,
    conn_id: ConnId,
    user_id: i32,
    text: &str,
) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(err) => {
            tracing::debug!(conn_id, error = %err, "unparseable client message");
            return;
        }
    };

    match message {
        ClientMessage::JoinProject { project_id } => {
            // Room joins honor the same membership gate as mutations.
            match policy::require_project_member(db, project_id, user_id).await {
                Ok(_) => registry.join(conn_id, &project_channel(project_id)),
                Err(_) => {
                    tracing::debug!(conn_id, user_id, project_id, "join-project denied");
                }
            }
        }
        ClientMessage::LeaveProject { project_id } => {
            registry.leave(conn_id, &project_channel(project_id));
        }
        ClientMessage::JoinUserRoom { .. } => {
            registry.join(conn_id, &user_channel(user_id));
        }
    }
}

/// Event-bus subscriber that maps domain events onto the project-channel
/// wire catalog.
pub struct RealtimeBroadcaster {
    registry: Arc<RoomRegistry>,
}

impl RealtimeBroadcaster {
    pub fn new(registry: Arc<RoomRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl EventSubscriber for RealtimeBroadcaster {
    fn name(&self) -> &'static str {
        "realtime-broadcaster"
    }

    async fn handle(&self, event: &DomainEvent) -> Result<()> {
        let (channel, payload) = match event {
            DomainEvent::TaskCreated { task, actor } => (
                project_channel(task.project_id),
                json!({ "task": task, "createdBy": actor }),
            ),
            DomainEvent::TaskUpdated { task, actor, .. } => (
                project_channel(task.project_id),
                json!({ "task": task, "updatedBy": actor }),
            ),
            DomainEvent::TaskDeleted {
                task_id,
                project_id,
                actor,
            } => (
                project_channel(*project_id),
                json!({ "taskId": task_id, "projectId": project_id, "deletedBy": actor }),
            ),
            DomainEvent::CommentAdded {
                comment,
                task,
                actor,
            } => (
                project_channel(task.project_id),
                json!({ "comment": comment, "taskId": task.id, "actor": actor }),
            ),
            DomainEvent::CommentUpdated {
                comment,
                project_id,
                actor,
            } => (
                project_channel(*project_id),
                json!({ "comment": comment, "taskId": comment.task_id, "actor": actor }),
            ),
            DomainEvent::CommentDeleted {
                comment_id,
                task_id,
                project_id,
                actor,
            } => (
                project_channel(*project_id),
                json!({ "commentId": comment_id, "taskId": task_id, "actor": actor }),
            ),
            DomainEvent::LabelCreated { label, actor } => (
                project_channel(label.project_id),
                json!({ "label": label, "createdBy": actor }),
            ),
            DomainEvent::LabelDeleted {
                label_id,
                project_id,
                actor,
            } => (
                project_channel(*project_id),
                json!({ "labelId": label_id, "deletedBy": actor }),
            ),
            DomainEvent::TaskLabelAssigned { task, label, actor } => (
                project_channel(task.project_id),
                json!({ "task": task, "label": label, "actor": actor }),
            ),
            DomainEvent::TaskLabelRemoved {
                task,
                label_id,
                actor,
            } => (
                project_channel(task.project_id),
                json!({ "task": task, "labelId": label_id, "actor": actor }),
            ),
            // Membership additions reach the affected user through the
            // notification pipeline, not a project room.
            DomainEvent::ProjectMemberAdded { .. } | DomainEvent::TeamMemberAdded { .. } => {
                return Ok(())
            }
        };

        self.registry.broadcast(&channel, event.name(), payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::entities::task;
    use crate::events::Actor;

    fn recv_json(rx: &mut mpsc::UnboundedReceiver<String>) -> serde_json::Value {
        let raw = rx.try_recv().expect("expected a delivered message");
        serde_json::from_str(&raw).unwrap()
    }

    #[test]
    fn connect_auto_joins_user_channel() {
        let registry = RoomRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.connect(42, tx);

        assert!(registry.is_connected(42));
        assert!(!registry.is_connected(7));

        let delivered = registry.broadcast(&user_channel(42), "notification", json!({"id": 1}));
        assert_eq!(delivered, 1);
        let msg = recv_json(&mut rx);
        assert_eq!(msg["event"], "notification");
        assert_eq!(msg["payload"]["id"], 1);
    }

    #[test]
    fn broadcast_reaches_only_the_target_room() {
        let registry = RoomRegistry::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = registry.connect(1, tx_a);
        let b = registry.connect(2, tx_b);

        registry.join(a, &project_channel(10));
        registry.join(b, &project_channel(20));

        let delivered = registry.broadcast(&project_channel(10), "task-updated", json!({}));
        assert_eq!(delivered, 1);
        assert_eq!(recv_json(&mut rx_a)["event"], "task-updated");
        assert!(rx_b.try_recv().is_err());

        // Unknown room delivers to no one.
        assert_eq!(registry.broadcast("project:999", "task-updated", json!({})), 0);
    }

    #[test]
    fn leave_and_disconnect_stop_delivery() {
        let registry = RoomRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = registry.connect(1, tx);
        registry.join(conn, &project_channel(5));

        registry.leave(conn, &project_channel(5));
        assert_eq!(registry.broadcast(&project_channel(5), "task-created", json!({})), 0);

        // Still reachable on the personal channel until disconnect.
        assert_eq!(registry.broadcast(&user_channel(1), "notification", json!({})), 1);
        let _ = recv_json(&mut rx);

        registry.disconnect(conn);
        assert!(!registry.is_connected(1));
        assert_eq!(registry.broadcast(&user_channel(1), "notification", json!({})), 0);
    }

    #[test]
    fn rejoining_same_room_is_idempotent() {
        let registry = RoomRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = registry.connect(1, tx);
        registry.join(conn, &project_channel(5));
        registry.join(conn, &project_channel(5));

        assert_eq!(registry.broadcast(&project_channel(5), "task-created", json!({})), 1);
        let _ = recv_json(&mut rx);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcaster_routes_task_events_to_project_room() {
        let registry = Arc::new(RoomRegistry::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = registry.connect(9, tx);
        registry.join(conn, &project_channel(3));

        let broadcaster = RealtimeBroadcaster::new(registry.clone());
        let task = task::Model {
            id: 11,
            project_id: 3,
            title: "Fix bug".to_string(),
            description: None,
            status: "TODO".to_string(),
            priority: "HIGH".to_string(),
            assignee_id: Some(9),
            created_by_id: 1,
            due_date: None,
            created_at: 0,
            updated_at: 0,
        };
        broadcaster
            .handle(&DomainEvent::TaskCreated {
                task,
                actor: Actor {
                    id: 1,
                    username: "alice".to_string(),
                },
            })
            .await
            .unwrap();

        let msg = recv_json(&mut rx);
        assert_eq!(msg["event"], "task-created");
        assert_eq!(msg["payload"]["task"]["id"], 11);
        assert_eq!(msg["payload"]["createdBy"]["id"], 1);
    }

    #[tokio::test]
    async fn membership_events_do_not_hit_project_rooms() {
        let registry = Arc::new(RoomRegistry::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = registry.connect(9, tx);
        registry.join(conn, &project_channel(3));

        let broadcaster = RealtimeBroadcaster::new(registry.clone());
        broadcaster
            .handle(&DomainEvent::ProjectMemberAdded {
                project: crate::db::entities::project::Model {
                    id: 3,
                    team_id: 1,
                    name: "site".to_string(),
                    description: None,
                    is_active: true,
                    created_at: 0,
                },
                user_id: 9,
                actor: Actor {
                    id: 1,
                    username: "alice".to_string(),
                },
            })
            .await
            .unwrap();

        assert!(rx.try_recv().is_err());
    }
}
