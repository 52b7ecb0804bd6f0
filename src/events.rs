//! Domain events and the in-process event bus.
//!
//! Mutation handlers emit one [`DomainEvent`] after a successful persistence
//! write. The bus dispatches to its subscribers (realtime broadcast,
//! notification pipeline) inline with the request; a failing subscriber is
//! logged and skipped so delivery problems never fail the mutation that
//! triggered them.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::db::entities::{comment, label, project, task, team};
use crate::error::Result;

/// Identity of the user who performed a mutation. Rides in every event
/// payload so receiving clients can suppress their own echoes.
#[derive(Clone, Debug, Serialize)]
pub struct Actor {
    pub id: i32,
    pub username: String,
}

#[derive(Clone, Debug)]
pub enum DomainEvent {
    TaskCreated {
        task: task::Model,
        actor: Actor,
    },
    TaskUpdated {
        task: task::Model,
        actor: Actor,
        assignee_changed: bool,
    },
    TaskDeleted {
        task_id: i32,
        project_id: i32,
        actor: Actor,
    },
    CommentAdded {
        comment: comment::Model,
        task: task::Model,
        actor: Actor,
    },
    CommentUpdated {
        comment: comment::Model,
        project_id: i32,
        actor: Actor,
    },
    CommentDeleted {
        comment_id: i32,
        task_id: i32,
        project_id: i32,
        actor: Actor,
    },
    LabelCreated {
        label: label::Model,
        actor: Actor,
    },
    LabelDeleted {
        label_id: i32,
        project_id: i32,
        actor: Actor,
    },
    TaskLabelAssigned {
        task: task::Model,
        label: label::Model,
        actor: Actor,
    },
    TaskLabelRemoved {
        task: task::Model,
        label_id: i32,
        actor: Actor,
    },
    ProjectMemberAdded {
        project: project::Model,
        user_id: i32,
        actor: Actor,
    },
    TeamMemberAdded {
        team: team::Model,
        user_id: i32,
        actor: Actor,
    },
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::TaskCreated { .. } => "task-created",
            DomainEvent::TaskUpdated { .. } => "task-updated",
            DomainEvent::TaskDeleted { .. } => "task-deleted",
            DomainEvent::CommentAdded { .. } => "comment-added",
            DomainEvent::CommentUpdated { .. } => "comment-updated",
            DomainEvent::CommentDeleted { .. } => "comment-deleted",
            DomainEvent::LabelCreated { .. } => "label-created",
            DomainEvent::LabelDeleted { .. } => "label-deleted",
            DomainEvent::TaskLabelAssigned { .. } => "task-label-assigned",
            DomainEvent::TaskLabelRemoved { .. } => "task-label-removed",
            DomainEvent::ProjectMemberAdded { .. } => "project-member-added",
            DomainEvent::TeamMemberAdded { .. } => "team-member-added",
        }
    }
}

/// A consumer of domain events
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &DomainEvent) -> Result<()>;
}

/// Dispatches each published event to every registered subscriber, in
/// registration order, inline with the publishing request.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Vec<Arc<dyn EventSubscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subscriber(mut self, subscriber: Arc<dyn EventSubscriber>) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    /// Fan an event out to all subscribers. Subscriber failures are logged
    /// and swallowed; the publishing mutation has already committed.
    pub async fn publish(&self, event: &DomainEvent) {
        for subscriber in &self.subscribers {
            if let Err(err) = subscriber.handle(event).await {
                tracing::warn!(
                    subscriber = subscriber.name(),
                    event = event.name(),
                    error = %err,
                    "event subscriber failed"
                );
            }
        }
    }
}
