//! Notification pipeline.
//!
//! Persists one notification row per relevant recipient when a triggering
//! domain event occurs, then pushes the same payload to the recipient's
//! personal channel if they are connected. The row is written
//! unconditionally; the live push is best-effort and an absent connection
//! is not an error.

use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use serde_json::json;

use crate::db::entities::{notification, task};
use crate::db::now_ts;
use crate::error::{Result, ServerError};
use crate::events::{DomainEvent, EventSubscriber};
use crate::realtime::{user_channel, RoomRegistry};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotificationKind {
    TaskAssigned,
    TaskUpdated,
    CommentAdded,
    ProjectAssigned,
    TeamInvite,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::TaskAssigned => "TASK_ASSIGNED",
            NotificationKind::TaskUpdated => "TASK_UPDATED",
            NotificationKind::CommentAdded => "COMMENT_ADDED",
            NotificationKind::ProjectAssigned => "PROJECT_ASSIGNED",
            NotificationKind::TeamInvite => "TEAM_INVITE",
        }
    }
}

/// Persist a notification and push it live to the recipient if connected.
pub async fn notify(
    db: &DatabaseConnection,
    registry: &RoomRegistry,
    recipient: i32,
    kind: NotificationKind,
    title: &str,
    message: &str,
    project_id: Option<i32>,
) -> Result<notification::Model> {
    let row = notification::ActiveModel {
        user_id: Set(recipient),
        ntype: Set(kind.as_str().to_string()),
        title: Set(title.to_string()),
        message: Set(message.to_string()),
        project_id: Set(project_id),
        is_read: Set(false),
        created_at: Set(now_ts()),
        ..Default::default()
    }
    .insert(db)
    .await?;

    registry.broadcast(&user_channel(recipient), "notification", json!(row));

    Ok(row)
}

/// Comment recipients: the task's assignee and creator, deduplicated,
/// excluding the commenter.
pub fn comment_recipients(task: &task::Model, actor_id: i32) -> Vec<i32> {
    let mut recipients = Vec::new();
    for candidate in [Some(task.created_by_id), task.assignee_id].into_iter().flatten() {
        if candidate != actor_id && !recipients.contains(&candidate) {
            recipients.push(candidate);
        }
    }
    recipients
}

/// Event-bus subscriber implementing the trigger rules.
pub struct NotificationPipeline {
    db: DatabaseConnection,
    registry: Arc<RoomRegistry>,
}

impl NotificationPipeline {
    pub fn new(db: DatabaseConnection, registry: Arc<RoomRegistry>) -> Self {
        Self { db, registry }
    }
}

#[async_trait]
impl EventSubscriber for NotificationPipeline {
    fn name(&self) -> &'static str {
        "notification-pipeline"
    }

    async fn handle(&self, event: &DomainEvent) -> Result<()> {
        match event {
            DomainEvent::TaskCreated { task, actor } => {
                if let Some(assignee) = task.assignee_id {
                    if assignee != actor.id {
                        notify(
                            &self.db,
                            &self.registry,
                            assignee,
                            NotificationKind::TaskAssigned,
                            "New task assignment",
                            &format!("{} assigned you the task \"{}\"", actor.username, task.title),
                            Some(task.project_id),
                        )
                        .await?;
                    }
                }
            }
            DomainEvent::TaskUpdated {
                task,
                actor,
                assignee_changed,
            } => {
                if let Some(assignee) = task.assignee_id {
                    if assignee != actor.id {
                        if *assignee_changed {
                            notify(
                                &self.db,
                                &self.registry,
                                assignee,
                                NotificationKind::TaskAssigned,
                                "New task assignment",
                                &format!(
                                    "{} assigned you the task \"{}\"",
                                    actor.username, task.title
                                ),
                                Some(task.project_id),
                            )
                            .await?;
                        } else {
                            notify(
                                &self.db,
                                &self.registry,
                                assignee,
                                NotificationKind::TaskUpdated,
                                "Task updated",
                                &format!("{} updated the task \"{}\"", actor.username, task.title),
                                Some(task.project_id),
                            )
                            .await?;
                        }
                    }
                }
            }
            DomainEvent::CommentAdded { task, actor, .. } => {
                for recipient in comment_recipients(task, actor.id) {
                    notify(
                        &self.db,
                        &self.registry,
                        recipient,
                        NotificationKind::CommentAdded,
                        "New comment",
                        &format!("{} commented on \"{}\"", actor.username, task.title),
                        Some(task.project_id),
                    )
                    .await?;
                }
            }
            DomainEvent::ProjectMemberAdded {
                project,
                user_id,
                actor,
            } => {
                if user_id != &actor.id {
                    notify(
                        &self.db,
                        &self.registry,
                        *user_id,
                        NotificationKind::ProjectAssigned,
                        "Added to project",
                        &format!("{} added you to the project \"{}\"", actor.username, project.name),
                        Some(project.id),
                    )
                    .await?;
                }
            }
            DomainEvent::TeamMemberAdded {
                team,
                user_id,
                actor,
            } => {
                if user_id != &actor.id {
                    notify(
                        &self.db,
                        &self.registry,
                        *user_id,
                        NotificationKind::TeamInvite,
                        "Added to team",
                        &format!("{} added you to the team \"{}\"", actor.username, team.name),
                        None,
                    )
                    .await?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// List the caller's notifications, newest first
pub async fn list_for_user(
    db: &DatabaseConnection,
    user_id: i32,
    limit: u64,
    offset: u64,
    unread_only: bool,
) -> Result<Vec<notification::Model>> {
    let mut query = notification::Entity::find()
        .filter(notification::Column::UserId.eq(user_id))
        .order_by_desc(notification::Column::CreatedAt)
        .order_by_desc(notification::Column::Id)
        .limit(limit)
        .offset(offset);

    if unread_only {
        query = query.filter(notification::Column::IsRead.eq(false));
    }

    Ok(query.all(db).await?)
}

pub async fn unread_count(db: &DatabaseConnection, user_id: i32) -> Result<u64> {
    Ok(notification::Entity::find()
        .filter(notification::Column::UserId.eq(user_id))
        .filter(notification::Column::IsRead.eq(false))
        .count(db)
        .await?)
}

/// Mark one notification read. A notification owned by someone else is
/// reported as missing, not as forbidden.
pub async fn mark_read(
    db: &DatabaseConnection,
    user_id: i32,
    notification_id: i32,
) -> Result<notification::Model> {
    let row = notification::Entity::find_by_id(notification_id)
        .filter(notification::Column::UserId.eq(user_id))
        .one(db)
        .await?
        .ok_or(ServerError::NotFound("Notification"))?;

    let mut am: notification::ActiveModel = row.into();
    am.is_read = Set(true);
    Ok(am.update(db).await?)
}

/// Flip every unread notification for the caller; returns how many changed
pub async fn mark_all_read(db: &DatabaseConnection, user_id: i32) -> Result<u64> {
    let result = notification::Entity::update_many()
        .col_expr(notification::Column::IsRead, Expr::value(true))
        .filter(notification::Column::UserId.eq(user_id))
        .filter(notification::Column::IsRead.eq(false))
        .exec(db)
        .await?;

    Ok(result.rows_affected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::events::Actor;
    use tokio::sync::mpsc;

    async fn test_db() -> DatabaseConnection {
        db::open("sqlite::memory:").await.unwrap()
    }

    fn actor(id: i32, name: &str) -> Actor {
        Actor {
            id,
            username: name.to_string(),
        }
    }

    fn sample_task(project_id: i32, creator: i32, assignee: Option<i32>) -> task::Model {
        task::Model {
            id: 1,
            project_id,
            title: "Fix bug".to_string(),
            description: None,
            status: "TODO".to_string(),
            priority: "HIGH".to_string(),
            assignee_id: assignee,
            created_by_id: creator,
            due_date: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn comment_recipients_dedup_and_exclude_commenter() {
        // Assignee == creator: one recipient, not two.
        let task = sample_task(1, 5, Some(5));
        assert_eq!(comment_recipients(&task, 9), vec![5]);

        // Commenter is the creator: only the assignee is notified.
        let task = sample_task(1, 5, Some(7));
        assert_eq!(comment_recipients(&task, 5), vec![7]);

        // Commenter is both: nobody left.
        let task = sample_task(1, 5, Some(5));
        assert!(comment_recipients(&task, 5).is_empty());

        // No assignee: just the creator.
        let task = sample_task(1, 5, None);
        assert_eq!(comment_recipients(&task, 9), vec![5]);
    }

    #[tokio::test]
    async fn task_assignment_persists_and_pushes() {
        let db = test_db().await;
        let registry = Arc::new(RoomRegistry::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.connect(7, tx);

        let pipeline = NotificationPipeline::new(db.clone(), registry.clone());
        pipeline
            .handle(&DomainEvent::TaskCreated {
                task: sample_task(3, 1, Some(7)),
                actor: actor(1, "alice"),
            })
            .await
            .unwrap();

        let rows = list_for_user(&db, 7, 20, 0, false).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].ntype, "TASK_ASSIGNED");
        assert_eq!(rows[0].project_id, Some(3));
        assert!(!rows[0].is_read);

        let raw = rx.try_recv().unwrap();
        let msg: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(msg["event"], "notification");
        assert_eq!(msg["payload"]["ntype"], "TASK_ASSIGNED");
    }

    #[tokio::test]
    async fn self_assignment_is_skipped() {
        let db = test_db().await;
        let registry = Arc::new(RoomRegistry::new());

        let pipeline = NotificationPipeline::new(db.clone(), registry);
        pipeline
            .handle(&DomainEvent::TaskCreated {
                task: sample_task(3, 7, Some(7)),
                actor: actor(7, "bob"),
            })
            .await
            .unwrap();

        assert_eq!(unread_count(&db, 7).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn disconnected_recipient_still_gets_a_row() {
        let db = test_db().await;
        let registry = Arc::new(RoomRegistry::new());

        let pipeline = NotificationPipeline::new(db.clone(), registry);
        pipeline
            .handle(&DomainEvent::TaskUpdated {
                task: sample_task(3, 1, Some(7)),
                actor: actor(1, "alice"),
                assignee_changed: false,
            })
            .await
            .unwrap();

        let rows = list_for_user(&db, 7, 20, 0, true).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].ntype, "TASK_UPDATED");
    }

    #[tokio::test]
    async fn reassignment_produces_task_assigned() {
        let db = test_db().await;
        let registry = Arc::new(RoomRegistry::new());

        let pipeline = NotificationPipeline::new(db.clone(), registry);
        pipeline
            .handle(&DomainEvent::TaskUpdated {
                task: sample_task(3, 1, Some(7)),
                actor: actor(1, "alice"),
                assignee_changed: true,
            })
            .await
            .unwrap();

        let rows = list_for_user(&db, 7, 20, 0, false).await.unwrap();
        assert_eq!(rows[0].ntype, "TASK_ASSIGNED");
    }

    #[tokio::test]
    async fn mark_read_asserts_ownership() {
        let db = test_db().await;
        let registry = RoomRegistry::new();

        let row = notify(
            &db,
            &registry,
            7,
            NotificationKind::TeamInvite,
            "Added to team",
            "alice added you to the team \"core\"",
            None,
        )
        .await
        .unwrap();

        // Another user flipping it sees not-found, even though the id exists.
        let err = mark_read(&db, 8, row.id).await.unwrap_err();
        assert!(matches!(err, ServerError::NotFound(_)));

        let updated = mark_read(&db, 7, row.id).await.unwrap();
        assert!(updated.is_read);
    }

    #[tokio::test]
    async fn mark_all_read_returns_flip_count_once() {
        let db = test_db().await;
        let registry = RoomRegistry::new();

        for i in 0..3 {
            notify(
                &db,
                &registry,
                7,
                NotificationKind::CommentAdded,
                "New comment",
                &format!("comment {}", i),
                Some(1),
            )
            .await
            .unwrap();
        }
        // A different user's row must not be counted.
        notify(
            &db,
            &registry,
            8,
            NotificationKind::CommentAdded,
            "New comment",
            "other",
            Some(1),
        )
        .await
        .unwrap();

        assert_eq!(mark_all_read(&db, 7).await.unwrap(), 3);
        assert_eq!(mark_all_read(&db, 7).await.unwrap(), 0);
        assert_eq!(unread_count(&db, 7).await.unwrap(), 0);
        assert_eq!(unread_count(&db, 8).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn listing_pages_newest_first() {
        let db = test_db().await;
        let registry = RoomRegistry::new();

        for i in 0..5 {
            notify(
                &db,
                &registry,
                7,
                NotificationKind::TaskUpdated,
                "Task updated",
                &format!("update {}", i),
                Some(1),
            )
            .await
            .unwrap();
        }
        mark_read(&db, 7, 1).await.unwrap();

        let page = list_for_user(&db, 7, 2, 0, false).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].message, "update 4");
        assert_eq!(page[1].message, "update 3");

        let next = list_for_user(&db, 7, 2, 2, false).await.unwrap();
        assert_eq!(next[0].message, "update 2");

        let unread = list_for_user(&db, 7, 20, 0, true).await.unwrap();
        assert_eq!(unread.len(), 4);
        assert!(unread.iter().all(|n| !n.is_read));
    }
}
