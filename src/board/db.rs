use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use super::models::*;
use super::reconcile::BoardSnapshot;
use crate::errors::BoardError;

/// Async-safe handle to the board database.
///
/// Wraps `BoardDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<BoardDb>>,
}

impl DbHandle {
    pub fn new(db: BoardDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&BoardDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| BoardError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Used where blocking is
    /// acceptable: startup initialization and tests. Callers must ensure
    /// this is NOT called from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, BoardDb>> {
        self.inner.lock().map_err(|_| BoardError::LockPoisoned.into())
    }
}

pub struct BoardDb {
    conn: Connection,
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

impl BoardDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS boards (
                    id TEXT PRIMARY KEY,
                    title TEXT NOT NULL,
                    description TEXT,
                    background_url TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS board_members (
                    board_id TEXT NOT NULL REFERENCES boards(id) ON DELETE CASCADE,
                    user_id TEXT NOT NULL,
                    role TEXT NOT NULL DEFAULT 'member',
                    PRIMARY KEY (board_id, user_id)
                );

                CREATE TABLE IF NOT EXISTS columns (
                    id TEXT PRIMARY KEY,
                    board_id TEXT NOT NULL REFERENCES boards(id) ON DELETE CASCADE,
                    title TEXT NOT NULL,
                    position INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS tasks (
                    id TEXT PRIMARY KEY,
                    column_id TEXT NOT NULL REFERENCES columns(id) ON DELETE CASCADE,
                    title TEXT NOT NULL,
                    description TEXT,
                    position INTEGER NOT NULL DEFAULT 0,
                    start_date TEXT,
                    due_date TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS labels (
                    id TEXT PRIMARY KEY,
                    board_id TEXT NOT NULL REFERENCES boards(id) ON DELETE CASCADE,
                    title TEXT,
                    color TEXT NOT NULL,
                    is_default INTEGER NOT NULL DEFAULT 0,
                    created_by TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS task_labels (
                    task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                    label_id TEXT NOT NULL REFERENCES labels(id) ON DELETE CASCADE,
                    PRIMARY KEY (task_id, label_id)
                );

                CREATE TABLE IF NOT EXISTS checklists (
                    id TEXT PRIMARY KEY,
                    task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                    title TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS checklist_items (
                    id TEXT PRIMARY KEY,
                    checklist_id TEXT NOT NULL REFERENCES checklists(id) ON DELETE CASCADE,
                    content TEXT NOT NULL,
                    is_checked INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS activities (
                    id TEXT PRIMARY KEY,
                    type TEXT NOT NULL,
                    content TEXT,
                    user_id TEXT NOT NULL,
                    task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                    board_id TEXT NOT NULL,
                    old_column_id TEXT,
                    new_column_id TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS favorites (
                    user_id TEXT NOT NULL,
                    board_id TEXT NOT NULL REFERENCES boards(id) ON DELETE CASCADE,
                    PRIMARY KEY (user_id, board_id)
                );

                CREATE INDEX IF NOT EXISTS idx_columns_board ON columns(board_id, position);
                CREATE INDEX IF NOT EXISTS idx_tasks_column ON tasks(column_id, position);
                CREATE INDEX IF NOT EXISTS idx_labels_board ON labels(board_id);
                CREATE INDEX IF NOT EXISTS idx_task_labels_task ON task_labels(task_id);
                CREATE INDEX IF NOT EXISTS idx_checklists_task ON checklists(task_id);
                CREATE INDEX IF NOT EXISTS idx_activities_task ON activities(task_id);
                CREATE INDEX IF NOT EXISTS idx_board_members_user ON board_members(user_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Board CRUD ────────────────────────────────────────────────────

    /// Create a board, its owner membership, and the six default labels
    /// in one transaction.
    pub fn create_board(
        &self,
        user_id: &str,
        title: &str,
        description: Option<&str>,
    ) -> Result<Board> {
        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let created_at = now();
        let board = Board {
            id: new_id(),
            title: title.to_string(),
            description: description.map(str::to_string),
            background_url: None,
            created_at: created_at.clone(),
            updated_at: created_at,
        };
        tx.execute(
            "INSERT INTO boards (id, title, description, background_url, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                board.id,
                board.title,
                board.description,
                board.background_url,
                board.created_at,
                board.updated_at
            ],
        )
        .context("Failed to insert board")?;

        tx.execute(
            "INSERT INTO board_members (board_id, user_id, role) VALUES (?1, ?2, ?3)",
            params![board.id, user_id, MemberRole::Owner.as_str()],
        )
        .context("Failed to insert board owner")?;

        for color in &DEFAULT_LABEL_COLORS {
            tx.execute(
                "INSERT INTO labels (id, board_id, title, color, is_default, created_by)
                 VALUES (?1, ?2, NULL, ?3, 1, ?4)",
                params![new_id(), board.id, color.as_str(), user_id],
            )
            .context("Failed to insert default label")?;
        }

        tx.commit().context("Failed to commit board creation")?;
        Ok(board)
    }

    pub fn get_board(&self, id: &str) -> Result<Option<Board>> {
        self.conn
            .query_row(
                "SELECT id, title, description, background_url, created_at, updated_at
                 FROM boards WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Board {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        description: row.get(2)?,
                        background_url: row.get(3)?,
                        created_at: row.get(4)?,
                        updated_at: row.get(5)?,
                    })
                },
            )
            .optional()
            .context("Failed to query board")
    }

    pub fn update_board(
        &self,
        id: &str,
        title: Option<&str>,
        description: Option<&str>,
    ) -> Result<Board> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        if let Some(t) = title {
            tx.execute(
                "UPDATE boards SET title = ?1, updated_at = ?2 WHERE id = ?3",
                params![t, now(), id],
            )
            .context("Failed to update board title")?;
        }
        if let Some(d) = description {
            let value = if d.is_empty() { None } else { Some(d) };
            tx.execute(
                "UPDATE boards SET description = ?1, updated_at = ?2 WHERE id = ?3",
                params![value, now(), id],
            )
            .context("Failed to update board description")?;
        }

        tx.commit().context("Failed to commit board update")?;
        self.get_board(id)?
            .ok_or_else(|| BoardError::BoardNotFound { id: id.to_string() }.into())
    }

    /// Set or clear the board's background image URL.
    pub fn set_board_background(&self, id: &str, url: Option<&str>) -> Result<Board> {
        self.conn
            .execute(
                "UPDATE boards SET background_url = ?1, updated_at = ?2 WHERE id = ?3",
                params![url, now(), id],
            )
            .context("Failed to update board background")?;
        self.get_board(id)?
            .ok_or_else(|| BoardError::BoardNotFound { id: id.to_string() }.into())
    }

    /// Delete a board and its memberships. Only the board owner may do this;
    /// the role check runs inside the same transaction as the deletes.
    pub fn delete_board(&self, id: &str, user_id: &str) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let exists: bool = tx
            .query_row(
                "SELECT COUNT(*) > 0 FROM boards WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .context("Failed to check board existence")?;
        if !exists {
            return Err(BoardError::BoardNotFound { id: id.to_string() }.into());
        }

        let role: Option<String> = tx
            .query_row(
                "SELECT role FROM board_members WHERE board_id = ?1 AND user_id = ?2",
                params![id, user_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query membership")?;
        if role.as_deref() != Some(MemberRole::Owner.as_str()) {
            return Err(BoardError::NotBoardOwner {
                board_id: id.to_string(),
                user_id: user_id.to_string(),
            }
            .into());
        }

        tx.execute(
            "DELETE FROM board_members WHERE board_id = ?1",
            params![id],
        )
        .context("Failed to delete board members")?;
        tx.execute("DELETE FROM boards WHERE id = ?1", params![id])
            .context("Failed to delete board")?;

        tx.commit().context("Failed to commit board deletion")?;
        Ok(())
    }

    /// Summaries of every board the user is a member of.
    pub fn list_board_summaries(&self, user_id: &str) -> Result<Vec<BoardSummary>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT b.id, b.title, b.background_url,
                        (SELECT COUNT(*) FROM tasks t
                         JOIN columns c ON t.column_id = c.id
                         WHERE c.board_id = b.id),
                        EXISTS(SELECT 1 FROM favorites f
                               WHERE f.board_id = b.id AND f.user_id = ?1)
                 FROM boards b
                 JOIN board_members m ON m.board_id = b.id AND m.user_id = ?1
                 ORDER BY b.created_at",
            )
            .context("Failed to prepare list_board_summaries")?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok(BoardSummary {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    background_url: row.get(2)?,
                    tasks_count: row.get(3)?,
                    is_favorited: row.get(4)?,
                })
            })
            .context("Failed to query board summaries")?;
        let mut summaries = Vec::new();
        for row in rows {
            summaries.push(row.context("Failed to read board summary row")?);
        }
        Ok(summaries)
    }

    /// Full board view: columns ordered by position, each with its tasks
    /// ordered by position, each task carrying its labels.
    pub fn get_board_details(&self, id: &str) -> Result<Option<BoardDetails>> {
        let board = match self.get_board(id)? {
            Some(b) => b,
            None => return Ok(None),
        };

        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, title, position FROM columns
                 WHERE board_id = ?1 ORDER BY position",
            )
            .context("Failed to prepare column query")?;
        let column_rows = stmt
            .query_map(params![id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })
            .context("Failed to query columns")?;

        let mut columns = Vec::new();
        for row in column_rows {
            let (column_id, title, position) = row.context("Failed to read column row")?;
            let tasks = self.list_task_summaries(&column_id)?;
            columns.push(ColumnWithTasks {
                id: column_id,
                title,
                position,
                tasks,
            });
        }

        Ok(Some(BoardDetails {
            id: board.id,
            title: board.title,
            description: board.description,
            background_url: board.background_url,
            columns,
        }))
    }

    fn list_task_summaries(&self, column_id: &str) -> Result<Vec<TaskSummary>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, column_id, title, description, position, start_date, due_date
                 FROM tasks WHERE column_id = ?1 ORDER BY position",
            )
            .context("Failed to prepare task query")?;
        let rows = stmt
            .query_map(params![column_id], |row| {
                Ok(TaskSummary {
                    id: row.get(0)?,
                    column_id: row.get(1)?,
                    title: row.get(2)?,
                    description: row.get(3)?,
                    position: row.get(4)?,
                    start_date: row.get(5)?,
                    due_date: row.get(6)?,
                    labels: Vec::new(),
                })
            })
            .context("Failed to query tasks")?;

        let mut tasks = Vec::new();
        for row in rows {
            let mut task = row.context("Failed to read task row")?;
            task.labels = self.list_task_labels(&task.id)?;
            tasks.push(task);
        }
        Ok(tasks)
    }

    // ── Column CRUD ───────────────────────────────────────────────────

    pub fn create_column(&self, board_id: &str, title: &str) -> Result<Column> {
        let exists: bool = self
            .conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM boards WHERE id = ?1",
                params![board_id],
                |row| row.get(0),
            )
            .context("Failed to check board existence")?;
        if !exists {
            return Err(BoardError::BoardNotFound {
                id: board_id.to_string(),
            }
            .into());
        }

        // Next position at the right edge of the board.
        let max_pos: i64 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(position), -1) FROM columns WHERE board_id = ?1",
                params![board_id],
                |row| row.get(0),
            )
            .context("Failed to get max column position")?;

        let column = Column {
            id: new_id(),
            board_id: board_id.to_string(),
            title: title.to_string(),
            position: max_pos + 1,
            created_at: now(),
        };
        self.conn
            .execute(
                "INSERT INTO columns (id, board_id, title, position, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    column.id,
                    column.board_id,
                    column.title,
                    column.position,
                    column.created_at
                ],
            )
            .context("Failed to insert column")?;
        Ok(column)
    }

    pub fn get_column(&self, id: &str) -> Result<Option<Column>> {
        self.conn
            .query_row(
                "SELECT id, board_id, title, position, created_at FROM columns WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Column {
                        id: row.get(0)?,
                        board_id: row.get(1)?,
                        title: row.get(2)?,
                        position: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()
            .context("Failed to query column")
    }

    pub fn rename_column(&self, id: &str, title: &str) -> Result<Column> {
        self.conn
            .execute(
                "UPDATE columns SET title = ?1 WHERE id = ?2",
                params![title, id],
            )
            .context("Failed to rename column")?;
        self.get_column(id)?
            .ok_or_else(|| BoardError::ColumnNotFound { id: id.to_string() }.into())
    }

    pub fn delete_column(&self, id: &str) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM columns WHERE id = ?1", params![id])
            .context("Failed to delete column")?;
        Ok(count > 0)
    }

    // ── Task CRUD ─────────────────────────────────────────────────────

    /// Create a task at the bottom of its column and record a task_created
    /// activity, in one transaction.
    pub fn create_task(
        &self,
        user_id: &str,
        column_id: &str,
        title: &str,
        description: Option<&str>,
    ) -> Result<Task> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let board_id: String = tx
            .query_row(
                "SELECT board_id FROM columns WHERE id = ?1",
                params![column_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query column")?
            .ok_or_else(|| BoardError::ColumnNotFound {
                id: column_id.to_string(),
            })?;

        let max_pos: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(position), -1) FROM tasks WHERE column_id = ?1",
                params![column_id],
                |row| row.get(0),
            )
            .context("Failed to get max task position")?;

        let created_at = now();
        let task = Task {
            id: new_id(),
            column_id: column_id.to_string(),
            title: title.to_string(),
            description: description.map(str::to_string),
            position: max_pos + 1,
            start_date: None,
            due_date: None,
            created_at: created_at.clone(),
            updated_at: created_at,
        };
        tx.execute(
            "INSERT INTO tasks (id, column_id, title, description, position, start_date, due_date, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                task.id,
                task.column_id,
                task.title,
                task.description,
                task.position,
                task.start_date,
                task.due_date,
                task.created_at,
                task.updated_at
            ],
        )
        .context("Failed to insert task")?;

        insert_activity(
            &tx,
            &Activity {
                id: new_id(),
                activity_type: ActivityType::TaskCreated,
                content: None,
                user_id: user_id.to_string(),
                task_id: task.id.clone(),
                board_id,
                old_column_id: None,
                new_column_id: Some(column_id.to_string()),
                created_at: now(),
            },
        )?;

        tx.commit().context("Failed to commit task creation")?;
        Ok(task)
    }

    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        self.conn
            .query_row(
                "SELECT id, column_id, title, description, position, start_date, due_date, created_at, updated_at
                 FROM tasks WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Task {
                        id: row.get(0)?,
                        column_id: row.get(1)?,
                        title: row.get(2)?,
                        description: row.get(3)?,
                        position: row.get(4)?,
                        start_date: row.get(5)?,
                        due_date: row.get(6)?,
                        created_at: row.get(7)?,
                        updated_at: row.get(8)?,
                    })
                },
            )
            .optional()
            .context("Failed to query task")
    }

    pub fn update_task(
        &self,
        id: &str,
        title: Option<&str>,
        description: Option<&str>,
        start_date: Option<&str>,
        due_date: Option<&str>,
    ) -> Result<Task> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        if let Some(t) = title {
            tx.execute(
                "UPDATE tasks SET title = ?1, updated_at = ?2 WHERE id = ?3",
                params![t, now(), id],
            )
            .context("Failed to update task title")?;
        }
        // An empty string clears the optional fields.
        if let Some(d) = description {
            let value = if d.is_empty() { None } else { Some(d) };
            tx.execute(
                "UPDATE tasks SET description = ?1, updated_at = ?2 WHERE id = ?3",
                params![value, now(), id],
            )
            .context("Failed to update task description")?;
        }
        if let Some(s) = start_date {
            let value = if s.is_empty() { None } else { Some(s) };
            tx.execute(
                "UPDATE tasks SET start_date = ?1, updated_at = ?2 WHERE id = ?3",
                params![value, now(), id],
            )
            .context("Failed to update task start date")?;
        }
        if let Some(d) = due_date {
            let value = if d.is_empty() { None } else { Some(d) };
            tx.execute(
                "UPDATE tasks SET due_date = ?1, updated_at = ?2 WHERE id = ?3",
                params![value, now(), id],
            )
            .context("Failed to update task due date")?;
        }

        tx.commit().context("Failed to commit task update")?;
        self.get_task(id)?
            .ok_or_else(|| BoardError::TaskNotFound { id: id.to_string() }.into())
    }

    pub fn delete_task(&self, id: &str) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM tasks WHERE id = ?1", params![id])
            .context("Failed to delete task")?;
        Ok(count > 0)
    }

    /// Expanded task view: labels, checklists with items, and the activity
    /// feed (newest first).
    pub fn get_task_detail(&self, id: &str) -> Result<Option<TaskDetail>> {
        let task = match self.get_task(id)? {
            Some(t) => t,
            None => return Ok(None),
        };

        let (board_id, column_title): (String, String) = self
            .conn
            .query_row(
                "SELECT board_id, title FROM columns WHERE id = ?1",
                params![task.column_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("Failed to query task's column")?;

        let labels = self.list_task_labels(&task.id)?;

        let mut stmt = self
            .conn
            .prepare("SELECT id, task_id, title FROM checklists WHERE task_id = ?1")
            .context("Failed to prepare checklist query")?;
        let checklist_rows = stmt
            .query_map(params![id], |row| {
                Ok(Checklist {
                    id: row.get(0)?,
                    task_id: row.get(1)?,
                    title: row.get(2)?,
                })
            })
            .context("Failed to query checklists")?;
        let mut checklists = Vec::new();
        for row in checklist_rows {
            let checklist = row.context("Failed to read checklist row")?;
            let items = self.list_checklist_items(&checklist.id)?;
            checklists.push(ChecklistWithItems { checklist, items });
        }

        let activities = self.list_activities(id)?;

        Ok(Some(TaskDetail {
            task,
            board_id,
            column_title,
            labels,
            checklists,
            activities,
        }))
    }

    // ── Labels ────────────────────────────────────────────────────────

    pub fn create_label(
        &self,
        board_id: &str,
        user_id: &str,
        title: Option<&str>,
        color: &LabelColor,
    ) -> Result<Label> {
        let exists: bool = self
            .conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM boards WHERE id = ?1",
                params![board_id],
                |row| row.get(0),
            )
            .context("Failed to check board existence")?;
        if !exists {
            return Err(BoardError::BoardNotFound {
                id: board_id.to_string(),
            }
            .into());
        }

        let label = Label {
            id: new_id(),
            board_id: board_id.to_string(),
            title: title.map(str::to_string),
            color: *color,
            is_default: false,
            created_by: user_id.to_string(),
        };
        self.conn
            .execute(
                "INSERT INTO labels (id, board_id, title, color, is_default, created_by)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                params![
                    label.id,
                    label.board_id,
                    label.title,
                    label.color.as_str(),
                    label.created_by
                ],
            )
            .context("Failed to insert label")?;
        Ok(label)
    }

    pub fn list_labels(&self, board_id: &str) -> Result<Vec<Label>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, board_id, title, color, is_default, created_by
                 FROM labels WHERE board_id = ?1 ORDER BY is_default DESC, color",
            )
            .context("Failed to prepare list_labels")?;
        let rows = stmt
            .query_map(params![board_id], label_row)
            .context("Failed to query labels")?;
        let mut labels = Vec::new();
        for row in rows {
            labels.push(row.context("Failed to read label row")?.into_label()?);
        }
        Ok(labels)
    }

    fn list_task_labels(&self, task_id: &str) -> Result<Vec<Label>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT l.id, l.board_id, l.title, l.color, l.is_default, l.created_by
                 FROM labels l
                 JOIN task_labels tl ON tl.label_id = l.id
                 WHERE tl.task_id = ?1
                 ORDER BY l.color",
            )
            .context("Failed to prepare task label query")?;
        let rows = stmt
            .query_map(params![task_id], label_row)
            .context("Failed to query task labels")?;
        let mut labels = Vec::new();
        for row in rows {
            labels.push(row.context("Failed to read label row")?.into_label()?);
        }
        Ok(labels)
    }

    pub fn delete_label(&self, id: &str) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM labels WHERE id = ?1", params![id])
            .context("Failed to delete label")?;
        Ok(count > 0)
    }

    pub fn add_label_to_task(&self, task_id: &str, label_id: &str) -> Result<()> {
        let task_exists: bool = self
            .conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM tasks WHERE id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .context("Failed to check task existence")?;
        if !task_exists {
            return Err(BoardError::TaskNotFound {
                id: task_id.to_string(),
            }
            .into());
        }
        let label_exists: bool = self
            .conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM labels WHERE id = ?1",
                params![label_id],
                |row| row.get(0),
            )
            .context("Failed to check label existence")?;
        if !label_exists {
            return Err(BoardError::LabelNotFound {
                id: label_id.to_string(),
            }
            .into());
        }

        self.conn
            .execute(
                "INSERT OR IGNORE INTO task_labels (task_id, label_id) VALUES (?1, ?2)",
                params![task_id, label_id],
            )
            .context("Failed to attach label")?;
        Ok(())
    }

    pub fn remove_label_from_task(&self, task_id: &str, label_id: &str) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "DELETE FROM task_labels WHERE task_id = ?1 AND label_id = ?2",
                params![task_id, label_id],
            )
            .context("Failed to detach label")?;
        Ok(count > 0)
    }

    // ── Checklists ────────────────────────────────────────────────────

    pub fn create_checklist(&self, task_id: &str, title: &str) -> Result<Checklist> {
        let exists: bool = self
            .conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM tasks WHERE id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .context("Failed to check task existence")?;
        if !exists {
            return Err(BoardError::TaskNotFound {
                id: task_id.to_string(),
            }
            .into());
        }

        let checklist = Checklist {
            id: new_id(),
            task_id: task_id.to_string(),
            title: title.to_string(),
        };
        self.conn
            .execute(
                "INSERT INTO checklists (id, task_id, title) VALUES (?1, ?2, ?3)",
                params![checklist.id, checklist.task_id, checklist.title],
            )
            .context("Failed to insert checklist")?;
        Ok(checklist)
    }

    pub fn delete_checklist(&self, id: &str) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM checklists WHERE id = ?1", params![id])
            .context("Failed to delete checklist")?;
        Ok(count > 0)
    }

    pub fn add_checklist_item(&self, checklist_id: &str, content: &str) -> Result<ChecklistItem> {
        let exists: bool = self
            .conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM checklists WHERE id = ?1",
                params![checklist_id],
                |row| row.get(0),
            )
            .context("Failed to check checklist existence")?;
        if !exists {
            return Err(BoardError::ChecklistNotFound {
                id: checklist_id.to_string(),
            }
            .into());
        }

        let item = ChecklistItem {
            id: new_id(),
            checklist_id: checklist_id.to_string(),
            content: content.to_string(),
            is_checked: false,
            created_at: now(),
        };
        self.conn
            .execute(
                "INSERT INTO checklist_items (id, checklist_id, content, is_checked, created_at)
                 VALUES (?1, ?2, ?3, 0, ?4)",
                params![item.id, item.checklist_id, item.content, item.created_at],
            )
            .context("Failed to insert checklist item")?;
        Ok(item)
    }

    pub fn set_checklist_item_checked(&self, id: &str, is_checked: bool) -> Result<ChecklistItem> {
        self.conn
            .execute(
                "UPDATE checklist_items SET is_checked = ?1 WHERE id = ?2",
                params![is_checked, id],
            )
            .context("Failed to update checklist item")?;
        self.conn
            .query_row(
                "SELECT id, checklist_id, content, is_checked, created_at
                 FROM checklist_items WHERE id = ?1",
                params![id],
                |row| {
                    Ok(ChecklistItem {
                        id: row.get(0)?,
                        checklist_id: row.get(1)?,
                        content: row.get(2)?,
                        is_checked: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()
            .context("Failed to query checklist item")?
            .ok_or_else(|| {
                BoardError::ChecklistNotFound { id: id.to_string() }.into()
            })
    }

    pub fn delete_checklist_item(&self, id: &str) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM checklist_items WHERE id = ?1", params![id])
            .context("Failed to delete checklist item")?;
        Ok(count > 0)
    }

    fn list_checklist_items(&self, checklist_id: &str) -> Result<Vec<ChecklistItem>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, checklist_id, content, is_checked, created_at
                 FROM checklist_items WHERE checklist_id = ?1 ORDER BY created_at",
            )
            .context("Failed to prepare checklist item query")?;
        let rows = stmt
            .query_map(params![checklist_id], |row| {
                Ok(ChecklistItem {
                    id: row.get(0)?,
                    checklist_id: row.get(1)?,
                    content: row.get(2)?,
                    is_checked: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })
            .context("Failed to query checklist items")?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row.context("Failed to read checklist item row")?);
        }
        Ok(items)
    }

    // ── Activities ────────────────────────────────────────────────────

    pub fn add_comment(&self, user_id: &str, task_id: &str, content: &str) -> Result<Activity> {
        let board_id: String = self
            .conn
            .query_row(
                "SELECT c.board_id FROM tasks t
                 JOIN columns c ON t.column_id = c.id
                 WHERE t.id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query task")?
            .ok_or_else(|| BoardError::TaskNotFound {
                id: task_id.to_string(),
            })?;

        let activity = Activity {
            id: new_id(),
            activity_type: ActivityType::CommentAdded,
            content: Some(content.to_string()),
            user_id: user_id.to_string(),
            task_id: task_id.to_string(),
            board_id,
            old_column_id: None,
            new_column_id: None,
            created_at: now(),
        };
        insert_activity(&self.conn, &activity)?;
        Ok(activity)
    }

    pub fn list_activities(&self, task_id: &str) -> Result<Vec<Activity>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, type, content, user_id, task_id, board_id, old_column_id, new_column_id, created_at
                 FROM activities WHERE task_id = ?1 ORDER BY created_at DESC, id",
            )
            .context("Failed to prepare activity query")?;
        let rows = stmt
            .query_map(params![task_id], activity_row)
            .context("Failed to query activities")?;
        let mut activities = Vec::new();
        for row in rows {
            activities.push(row.context("Failed to read activity row")?.into_activity()?);
        }
        Ok(activities)
    }

    /// Moderation delete. Activities are otherwise append-only.
    pub fn delete_activity(&self, id: &str) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM activities WHERE id = ?1", params![id])
            .context("Failed to delete activity")?;
        Ok(count > 0)
    }

    // ── Favorites ─────────────────────────────────────────────────────

    /// Flip the favorite flag for (user, board). Returns the new state.
    pub fn toggle_favorite(&self, user_id: &str, board_id: &str) -> Result<bool> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM favorites WHERE user_id = ?1 AND board_id = ?2",
                params![user_id, board_id],
            )
            .context("Failed to remove favorite")?;
        if removed > 0 {
            return Ok(false);
        }

        let exists: bool = self
            .conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM boards WHERE id = ?1",
                params![board_id],
                |row| row.get(0),
            )
            .context("Failed to check board existence")?;
        if !exists {
            return Err(BoardError::BoardNotFound {
                id: board_id.to_string(),
            }
            .into());
        }

        self.conn
            .execute(
                "INSERT INTO favorites (user_id, board_id) VALUES (?1, ?2)",
                params![user_id, board_id],
            )
            .context("Failed to insert favorite")?;
        Ok(true)
    }

    // ── Board snapshot ────────────────────────────────────────────────

    /// Apply a full position snapshot for one board: column positions first,
    /// then task positions and column membership, recording a task_moved
    /// activity for every task whose column changed. All writes and the
    /// read-before-update of each task's current column happen inside one
    /// transaction, so a failure anywhere rolls back the whole batch.
    ///
    /// Entries with an empty id are client-side rows not yet persisted and
    /// are skipped without error. A non-empty task id that matches no stored
    /// task aborts the batch.
    ///
    /// Returns the task_moved activities that were recorded.
    pub fn apply_snapshot(
        &self,
        user_id: &str,
        board_id: &str,
        snapshot: &BoardSnapshot,
    ) -> Result<Vec<Activity>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        for column in &snapshot.columns {
            if column.id.is_empty() {
                continue;
            }
            tx.execute(
                "UPDATE columns SET position = ?1 WHERE id = ?2",
                params![column.position, column.id],
            )
            .context("Failed to update column position")?;
        }

        let mut moves = Vec::new();
        for column in &snapshot.columns {
            if column.id.is_empty() {
                continue;
            }
            for task in &column.tasks {
                if task.id.is_empty() {
                    continue;
                }

                let previous_column: String = tx
                    .query_row(
                        "SELECT column_id FROM tasks WHERE id = ?1",
                        params![task.id],
                        |row| row.get(0),
                    )
                    .optional()
                    .context("Failed to query task")?
                    .ok_or_else(|| BoardError::TaskNotFound {
                        id: task.id.clone(),
                    })?;

                tx.execute(
                    "UPDATE tasks SET position = ?1, column_id = ?2, updated_at = ?3 WHERE id = ?4",
                    params![task.position, column.id, now(), task.id],
                )
                .context("Failed to update task position")?;

                if previous_column != column.id {
                    let activity = Activity {
                        id: new_id(),
                        activity_type: ActivityType::TaskMoved,
                        content: None,
                        user_id: user_id.to_string(),
                        task_id: task.id.clone(),
                        board_id: board_id.to_string(),
                        old_column_id: Some(previous_column),
                        new_column_id: Some(column.id.clone()),
                        created_at: now(),
                    };
                    insert_activity(&tx, &activity)?;
                    moves.push(activity);
                }
            }
        }

        tx.commit().context("Failed to commit board snapshot")?;
        Ok(moves)
    }
}

fn insert_activity(conn: &Connection, activity: &Activity) -> Result<()> {
    conn.execute(
        "INSERT INTO activities (id, type, content, user_id, task_id, board_id, old_column_id, new_column_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            activity.id,
            activity.activity_type.as_str(),
            activity.content,
            activity.user_id,
            activity.task_id,
            activity.board_id,
            activity.old_column_id,
            activity.new_column_id,
            activity.created_at
        ],
    )
    .context("Failed to insert activity")?;
    Ok(())
}

// Raw rows for entities whose columns need parsing after the fact.

struct LabelRow {
    id: String,
    board_id: String,
    title: Option<String>,
    color: String,
    is_default: bool,
    created_by: String,
}

fn label_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LabelRow> {
    Ok(LabelRow {
        id: row.get(0)?,
        board_id: row.get(1)?,
        title: row.get(2)?,
        color: row.get(3)?,
        is_default: row.get(4)?,
        created_by: row.get(5)?,
    })
}

impl LabelRow {
    fn into_label(self) -> Result<Label> {
        let color = self
            .color
            .parse::<LabelColor>()
            .map_err(|e| anyhow::anyhow!(e))?;
        Ok(Label {
            id: self.id,
            board_id: self.board_id,
            title: self.title,
            color,
            is_default: self.is_default,
            created_by: self.created_by,
        })
    }
}

struct ActivityRow {
    id: String,
    activity_type: String,
    content: Option<String>,
    user_id: String,
    task_id: String,
    board_id: String,
    old_column_id: Option<String>,
    new_column_id: Option<String>,
    created_at: String,
}

fn activity_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ActivityRow> {
    Ok(ActivityRow {
        id: row.get(0)?,
        activity_type: row.get(1)?,
        content: row.get(2)?,
        user_id: row.get(3)?,
        task_id: row.get(4)?,
        board_id: row.get(5)?,
        old_column_id: row.get(6)?,
        new_column_id: row.get(7)?,
        created_at: row.get(8)?,
    })
}

impl ActivityRow {
    fn into_activity(self) -> Result<Activity> {
        let activity_type = self
            .activity_type
            .parse::<ActivityType>()
            .map_err(|e| anyhow::anyhow!(e))?;
        Ok(Activity {
            id: self.id,
            activity_type,
            content: self.content,
            user_id: self.user_id,
            task_id: self.task_id,
            board_id: self.board_id,
            old_column_id: self.old_column_id,
            new_column_id: self.new_column_id,
            created_at: self.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> BoardDb {
        BoardDb::new_in_memory().unwrap()
    }

    #[test]
    fn create_board_sets_up_owner_and_default_labels() {
        let db = db();
        let board = db.create_board("alice", "Roadmap", Some("Q3 work")).unwrap();

        let role: String = db
            .conn
            .query_row(
                "SELECT role FROM board_members WHERE board_id = ?1 AND user_id = 'alice'",
                params![board.id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(role, "owner");

        let labels = db.list_labels(&board.id).unwrap();
        assert_eq!(labels.len(), 6);
        assert!(labels.iter().all(|l| l.is_default && l.title.is_none()));
    }

    #[test]
    fn update_board_changes_title_and_clears_description() {
        let db = db();
        let board = db.create_board("alice", "Old", Some("desc")).unwrap();
        let updated = db.update_board(&board.id, Some("New"), Some("")).unwrap();
        assert_eq!(updated.title, "New");
        assert!(updated.description.is_none());
    }

    #[test]
    fn delete_board_requires_owner_role() {
        let db = db();
        let board = db.create_board("alice", "Mine", None).unwrap();

        let err = db.delete_board(&board.id, "bob").unwrap_err();
        let typed = err.downcast_ref::<BoardError>().unwrap();
        assert!(matches!(typed, BoardError::NotBoardOwner { .. }));
        assert!(db.get_board(&board.id).unwrap().is_some());

        db.delete_board(&board.id, "alice").unwrap();
        assert!(db.get_board(&board.id).unwrap().is_none());
    }

    #[test]
    fn delete_board_cascades_columns_and_tasks() {
        let db = db();
        let board = db.create_board("alice", "B", None).unwrap();
        let column = db.create_column(&board.id, "Todo").unwrap();
        let task = db.create_task("alice", &column.id, "T", None).unwrap();

        db.delete_board(&board.id, "alice").unwrap();
        assert!(db.get_column(&column.id).unwrap().is_none());
        assert!(db.get_task(&task.id).unwrap().is_none());
    }

    #[test]
    fn columns_get_increasing_positions() {
        let db = db();
        let board = db.create_board("alice", "B", None).unwrap();
        let first = db.create_column(&board.id, "Todo").unwrap();
        let second = db.create_column(&board.id, "Doing").unwrap();
        assert_eq!(first.position, 0);
        assert_eq!(second.position, 1);
    }

    #[test]
    fn create_column_on_unknown_board_fails() {
        let db = db();
        let err = db.create_column("missing", "Todo").unwrap_err();
        let typed = err.downcast_ref::<BoardError>().unwrap();
        assert!(matches!(typed, BoardError::BoardNotFound { .. }));
    }

    #[test]
    fn create_task_records_task_created_activity() {
        let db = db();
        let board = db.create_board("alice", "B", None).unwrap();
        let column = db.create_column(&board.id, "Todo").unwrap();
        let task = db.create_task("alice", &column.id, "Ship it", None).unwrap();
        assert_eq!(task.position, 0);

        let activities = db.list_activities(&task.id).unwrap();
        assert_eq!(activities.len(), 1);
        assert_eq!(activities[0].activity_type, ActivityType::TaskCreated);
        assert_eq!(activities[0].user_id, "alice");
        assert_eq!(activities[0].board_id, board.id);
        assert_eq!(activities[0].new_column_id.as_deref(), Some(column.id.as_str()));
    }

    #[test]
    fn tasks_get_increasing_positions_within_column() {
        let db = db();
        let board = db.create_board("alice", "B", None).unwrap();
        let column = db.create_column(&board.id, "Todo").unwrap();
        let first = db.create_task("alice", &column.id, "one", None).unwrap();
        let second = db.create_task("alice", &column.id, "two", None).unwrap();
        assert_eq!(first.position, 0);
        assert_eq!(second.position, 1);
    }

    #[test]
    fn update_task_sets_and_clears_dates() {
        let db = db();
        let board = db.create_board("alice", "B", None).unwrap();
        let column = db.create_column(&board.id, "Todo").unwrap();
        let task = db.create_task("alice", &column.id, "T", None).unwrap();

        let updated = db
            .update_task(&task.id, None, None, Some("2026-08-01"), Some("2026-08-15"))
            .unwrap();
        assert_eq!(updated.start_date.as_deref(), Some("2026-08-01"));
        assert_eq!(updated.due_date.as_deref(), Some("2026-08-15"));

        let cleared = db.update_task(&task.id, None, None, None, Some("")).unwrap();
        assert!(cleared.due_date.is_none());
        assert_eq!(cleared.start_date.as_deref(), Some("2026-08-01"));
    }

    #[test]
    fn label_attach_and_detach() {
        let db = db();
        let board = db.create_board("alice", "B", None).unwrap();
        let column = db.create_column(&board.id, "Todo").unwrap();
        let task = db.create_task("alice", &column.id, "T", None).unwrap();
        let label = db
            .create_label(&board.id, "alice", Some("bug"), &LabelColor::Red)
            .unwrap();

        db.add_label_to_task(&task.id, &label.id).unwrap();
        // Attaching twice is a no-op, not an error.
        db.add_label_to_task(&task.id, &label.id).unwrap();

        let detail = db.get_task_detail(&task.id).unwrap().unwrap();
        assert_eq!(detail.labels.len(), 1);
        assert_eq!(detail.labels[0].title.as_deref(), Some("bug"));

        assert!(db.remove_label_from_task(&task.id, &label.id).unwrap());
        assert!(!db.remove_label_from_task(&task.id, &label.id).unwrap());
    }

    #[test]
    fn checklist_flow() {
        let db = db();
        let board = db.create_board("alice", "B", None).unwrap();
        let column = db.create_column(&board.id, "Todo").unwrap();
        let task = db.create_task("alice", &column.id, "T", None).unwrap();

        let checklist = db.create_checklist(&task.id, "Release steps").unwrap();
        let item = db.add_checklist_item(&checklist.id, "tag the build").unwrap();
        assert!(!item.is_checked);

        let checked = db.set_checklist_item_checked(&item.id, true).unwrap();
        assert!(checked.is_checked);

        let detail = db.get_task_detail(&task.id).unwrap().unwrap();
        assert_eq!(detail.checklists.len(), 1);
        assert_eq!(detail.checklists[0].items.len(), 1);

        assert!(db.delete_checklist(&checklist.id).unwrap());
        let detail = db.get_task_detail(&task.id).unwrap().unwrap();
        assert!(detail.checklists.is_empty());
    }

    #[test]
    fn comments_append_to_feed_and_can_be_moderated_away() {
        let db = db();
        let board = db.create_board("alice", "B", None).unwrap();
        let column = db.create_column(&board.id, "Todo").unwrap();
        let task = db.create_task("alice", &column.id, "T", None).unwrap();

        let comment = db.add_comment("bob", &task.id, "looks good").unwrap();
        assert_eq!(comment.activity_type, ActivityType::CommentAdded);

        let activities = db.list_activities(&task.id).unwrap();
        assert_eq!(activities.len(), 2);

        assert!(db.delete_activity(&comment.id).unwrap());
        assert_eq!(db.list_activities(&task.id).unwrap().len(), 1);
    }

    #[test]
    fn toggle_favorite_flips_state() {
        let db = db();
        let board = db.create_board("alice", "B", None).unwrap();
        assert!(db.toggle_favorite("alice", &board.id).unwrap());
        assert!(!db.toggle_favorite("alice", &board.id).unwrap());
        assert!(db.toggle_favorite("alice", &board.id).unwrap());
    }

    #[test]
    fn board_summaries_count_tasks_and_favorites() {
        let db = db();
        let board = db.create_board("alice", "B", None).unwrap();
        let column = db.create_column(&board.id, "Todo").unwrap();
        db.create_task("alice", &column.id, "one", None).unwrap();
        db.create_task("alice", &column.id, "two", None).unwrap();
        db.toggle_favorite("alice", &board.id).unwrap();

        let summaries = db.list_board_summaries("alice").unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].tasks_count, 2);
        assert!(summaries[0].is_favorited);

        // Non-members see nothing.
        assert!(db.list_board_summaries("mallory").unwrap().is_empty());
    }

    #[test]
    fn board_details_order_columns_and_tasks_by_position() {
        let db = db();
        let board = db.create_board("alice", "B", None).unwrap();
        let todo = db.create_column(&board.id, "Todo").unwrap();
        let doing = db.create_column(&board.id, "Doing").unwrap();
        db.create_task("alice", &todo.id, "a", None).unwrap();
        db.create_task("alice", &doing.id, "b", None).unwrap();

        let details = db.get_board_details(&board.id).unwrap().unwrap();
        assert_eq!(details.columns.len(), 2);
        assert_eq!(details.columns[0].title, "Todo");
        assert_eq!(details.columns[1].title, "Doing");
        assert_eq!(details.columns[0].tasks.len(), 1);
        assert_eq!(details.columns[0].tasks[0].title, "a");
    }
}
