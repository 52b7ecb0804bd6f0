//! Database module for SQLite persistence using SeaORM

pub mod entities;

use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr, Statement};
use std::path::Path;

/// Initialize database connection and create tables
pub async fn init_database(db_path: &Path) -> Result<DatabaseConnection, DbErr> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }

    let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
    tracing::info!("Connecting to database: {}", db_url);

    open(&db_url).await
}

/// Connect to an arbitrary database URL and create tables
pub async fn open(db_url: &str) -> Result<DatabaseConnection, DbErr> {
    let mut options = ConnectOptions::new(db_url.to_string());
    if db_url.contains(":memory:") {
        // Each pooled connection to :memory: is its own database; a single
        // connection keeps one schema visible.
        options.max_connections(1);
    }

    let db = Database::connect(options).await?;
    create_tables(&db).await?;
    Ok(db)
}

/// Create all tables if they don't exist
async fn create_tables(db: &DatabaseConnection) -> Result<(), DbErr> {
    // Users table
    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL DEFAULT '',
            display_name TEXT,
            email TEXT,
            created_at INTEGER NOT NULL
        )
        "#
        .to_string(),
    ))
    .await?;

    // Teams table
    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"
        CREATE TABLE IF NOT EXISTS teams (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#
        .to_string(),
    ))
    .await?;

    // Team members table (links users to teams with a role)
    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"
        CREATE TABLE IF NOT EXISTS team_members (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            team_id INTEGER NOT NULL,
            user_id INTEGER NOT NULL,
            role TEXT NOT NULL DEFAULT 'DEVELOPER',
            created_at INTEGER NOT NULL,
            FOREIGN KEY (team_id) REFERENCES teams(id) ON DELETE CASCADE,
            FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
            UNIQUE(team_id, user_id)
        )
        "#
        .to_string(),
    ))
    .await?;

    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"CREATE INDEX IF NOT EXISTS idx_team_members_team ON team_members(team_id)"#.to_string(),
    ))
    .await?;
    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"CREATE INDEX IF NOT EXISTS idx_team_members_user ON team_members(user_id)"#.to_string(),
    ))
    .await?;

    // Projects table
    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            team_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            description TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (team_id) REFERENCES teams(id) ON DELETE CASCADE
        )
        "#
        .to_string(),
    ))
    .await?;

    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"CREATE INDEX IF NOT EXISTS idx_projects_team ON projects(team_id)"#.to_string(),
    ))
    .await?;

    // Project members table
    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"
        CREATE TABLE IF NOT EXISTS project_members (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id INTEGER NOT NULL,
            user_id INTEGER NOT NULL,
            role TEXT NOT NULL DEFAULT 'DEVELOPER',
            created_at INTEGER NOT NULL,
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE,
            FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
            UNIQUE(project_id, user_id)
        )
        "#
        .to_string(),
    ))
    .await?;

    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"CREATE INDEX IF NOT EXISTS idx_project_members_project ON project_members(project_id)"#
            .to_string(),
    ))
    .await?;
    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"CREATE INDEX IF NOT EXISTS idx_project_members_user ON project_members(user_id)"#
            .to_string(),
    ))
    .await?;

    // Tasks table
    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id INTEGER NOT NULL,
            title TEXT NOT NULL,
            description TEXT,
            status TEXT NOT NULL DEFAULT 'TODO',
            priority TEXT NOT NULL DEFAULT 'MEDIUM',
            assignee_id INTEGER,
            created_by_id INTEGER NOT NULL,
            due_date INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE,
            FOREIGN KEY (assignee_id) REFERENCES users(id) ON DELETE SET NULL,
            FOREIGN KEY (created_by_id) REFERENCES users(id) ON DELETE CASCADE
        )
        "#
        .to_string(),
    ))
    .await?;

    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_id)"#.to_string(),
    ))
    .await?;
    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"CREATE INDEX IF NOT EXISTS idx_tasks_assignee ON tasks(assignee_id)"#.to_string(),
    ))
    .await?;

    // Comments table
    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"
        CREATE TABLE IF NOT EXISTS comments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id INTEGER NOT NULL,
            user_id INTEGER NOT NULL,
            content TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE,
            FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
        )
        "#
        .to_string(),
    ))
    .await?;

    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"CREATE INDEX IF NOT EXISTS idx_comments_task ON comments(task_id)"#.to_string(),
    ))
    .await?;

    // Labels table (unique name per project)
    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"
        CREATE TABLE IF NOT EXISTS labels (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            color TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE,
            UNIQUE(project_id, name)
        )
        "#
        .to_string(),
    ))
    .await?;

    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"CREATE INDEX IF NOT EXISTS idx_labels_project ON labels(project_id)"#.to_string(),
    ))
    .await?;

    // Task-label associations
    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"
        CREATE TABLE IF NOT EXISTS task_labels (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id INTEGER NOT NULL,
            label_id INTEGER NOT NULL,
            FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE,
            FOREIGN KEY (label_id) REFERENCES labels(id) ON DELETE CASCADE,
            UNIQUE(task_id, label_id)
        )
        "#
        .to_string(),
    ))
    .await?;

    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"CREATE INDEX IF NOT EXISTS idx_task_labels_task ON task_labels(task_id)"#.to_string(),
    ))
    .await?;
    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"CREATE INDEX IF NOT EXISTS idx_task_labels_label ON task_labels(label_id)"#.to_string(),
    ))
    .await?;

    // Notifications table
    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"
        CREATE TABLE IF NOT EXISTS notifications (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            ntype TEXT NOT NULL,
            title TEXT NOT NULL,
            message TEXT NOT NULL,
            project_id INTEGER,
            is_read INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
        )
        "#
        .to_string(),
    ))
    .await?;

    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications(user_id)"#
            .to_string(),
    ))
    .await?;
    db.execute(Statement::from_string(
        db.get_database_backend(),
        r#"CREATE INDEX IF NOT EXISTS idx_notifications_unread ON notifications(user_id, is_read)"#
            .to_string(),
    ))
    .await?;

    tracing::info!("Database tables initialized");
    Ok(())
}

/// Current unix timestamp in seconds
pub fn now_ts() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
