//! Applies client-submitted board layout snapshots.
//!
//! After a drag-and-drop session the client sends the full desired ordering
//! of a board's columns and tasks. `reconcile_board` persists the new
//! positions, reassigns tasks that changed columns, and derives a
//! `task_moved` activity for each such task, all inside one transaction.
//!
//! Concurrent submissions for the same board are not serialized against
//! each other: the last transaction to commit wins, and two near-simultaneous
//! drags can produce a layout neither client intended. That lost-update
//! hazard is accepted; callers simply resubmit.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::db::DbHandle;
use super::ws::{BoardEvent, broadcast_event};

// ── Snapshot payload ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPlacement {
    pub id: String,
    pub position: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnPlacement {
    pub id: String,
    pub position: i64,
    #[serde(default)]
    pub tasks: Vec<TaskPlacement>,
}

/// Desired ordering for a whole board. Ordering values are trusted as
/// submitted; the service persists them without re-deriving or validating
/// contiguity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardSnapshot {
    pub columns: Vec<ColumnPlacement>,
}

/// Outcome reported back to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub message: String,
}

impl ActionResult {
    pub fn ok(message: &str) -> Self {
        Self {
            success: true,
            message: message.to_string(),
        }
    }

    pub fn failed(message: &str) -> Self {
        Self {
            success: false,
            message: message.to_string(),
        }
    }
}

// ── Reconciler ────────────────────────────────────────────────────────

/// Persist a layout snapshot for a board.
///
/// The caller identity is an explicit precondition: with no identity the
/// operation is rejected before any persistence is attempted. On success a
/// single `BoardChanged` event is emitted so cached views of the board get
/// refreshed. On persistence failure the transaction has already rolled
/// back; the cause is logged and the caller sees a generic message.
pub async fn reconcile_board(
    db: &DbHandle,
    events: &broadcast::Sender<String>,
    identity: Option<&str>,
    board_id: &str,
    snapshot: BoardSnapshot,
) -> ActionResult {
    let Some(user_id) = identity.map(str::trim).filter(|s| !s.is_empty()) else {
        return ActionResult::failed("User not authenticated");
    };

    let user_id = user_id.to_string();
    let board = board_id.to_string();
    let outcome = db
        .call(move |db| db.apply_snapshot(&user_id, &board, &snapshot))
        .await;

    match outcome {
        Ok(moves) => {
            tracing::debug!(board_id, moved = moves.len(), "Saved board layout");
            broadcast_event(
                events,
                &BoardEvent::BoardChanged {
                    board_id: board_id.to_string(),
                },
            );
            ActionResult::ok("Saved changes")
        }
        Err(e) => {
            tracing::error!(board_id, "Error saving board layout: {e:#}");
            ActionResult::failed("Error saving changes")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::db::BoardDb;
    use crate::board::models::{ActivityType, Board, Column, Task};

    struct Fixture {
        db: DbHandle,
        events: broadcast::Sender<String>,
        board: Board,
        todo: Column,
        doing: Column,
        task: Task,
    }

    /// Board with two columns (positions 0 and 1) and one task in the first.
    fn fixture() -> Fixture {
        let db = DbHandle::new(BoardDb::new_in_memory().unwrap());
        let (events, _) = broadcast::channel(16);
        let (board, todo, doing, task) = {
            let guard = db.lock_sync().unwrap();
            let board = guard.create_board("alice", "Board", None).unwrap();
            let todo = guard.create_column(&board.id, "Todo").unwrap();
            let doing = guard.create_column(&board.id, "Doing").unwrap();
            let task = guard.create_task("alice", &todo.id, "Task", None).unwrap();
            (board, todo, doing, task)
        };
        Fixture {
            db,
            events,
            board,
            todo,
            doing,
            task,
        }
    }

    fn column(id: &str, position: i64, tasks: Vec<TaskPlacement>) -> ColumnPlacement {
        ColumnPlacement {
            id: id.to_string(),
            position,
            tasks,
        }
    }

    fn task(id: &str, position: i64) -> TaskPlacement {
        TaskPlacement {
            id: id.to_string(),
            position,
        }
    }

    fn moved_activities(fx: &Fixture, task_id: &str) -> Vec<crate::board::models::Activity> {
        fx.db
            .lock_sync()
            .unwrap()
            .list_activities(task_id)
            .unwrap()
            .into_iter()
            .filter(|a| a.activity_type == ActivityType::TaskMoved)
            .collect()
    }

    #[tokio::test]
    async fn positions_land_exactly_as_submitted() {
        let fx = fixture();
        let snapshot = BoardSnapshot {
            columns: vec![
                column(&fx.todo.id, 5, vec![task(&fx.task.id, 3)]),
                column(&fx.doing.id, 2, vec![]),
            ],
        };

        let result = reconcile_board(
            &fx.db,
            &fx.events,
            Some("alice"),
            &fx.board.id,
            snapshot,
        )
        .await;
        assert!(result.success);
        assert_eq!(result.message, "Saved changes");

        let guard = fx.db.lock_sync().unwrap();
        assert_eq!(guard.get_column(&fx.todo.id).unwrap().unwrap().position, 5);
        assert_eq!(guard.get_column(&fx.doing.id).unwrap().unwrap().position, 2);
        let stored = guard.get_task(&fx.task.id).unwrap().unwrap();
        assert_eq!(stored.position, 3);
        assert_eq!(stored.column_id, fx.todo.id);
    }

    #[tokio::test]
    async fn cross_column_move_records_one_activity_with_old_and_new() {
        // Column swap plus a task move, as one batch.
        let fx = fixture();
        let snapshot = BoardSnapshot {
            columns: vec![
                column(&fx.todo.id, 1, vec![]),
                column(&fx.doing.id, 0, vec![task(&fx.task.id, 0)]),
            ],
        };

        let result = reconcile_board(
            &fx.db,
            &fx.events,
            Some("alice"),
            &fx.board.id,
            snapshot,
        )
        .await;
        assert!(result.success);

        {
            let guard = fx.db.lock_sync().unwrap();
            assert_eq!(guard.get_column(&fx.todo.id).unwrap().unwrap().position, 1);
            assert_eq!(guard.get_column(&fx.doing.id).unwrap().unwrap().position, 0);
            let stored = guard.get_task(&fx.task.id).unwrap().unwrap();
            assert_eq!(stored.position, 0);
            assert_eq!(stored.column_id, fx.doing.id);
        }

        let moves = moved_activities(&fx, &fx.task.id);
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].old_column_id.as_deref(), Some(fx.todo.id.as_str()));
        assert_eq!(moves[0].new_column_id.as_deref(), Some(fx.doing.id.as_str()));
        assert_eq!(moves[0].user_id, "alice");
        assert_eq!(moves[0].board_id, fx.board.id);
    }

    #[tokio::test]
    async fn reorder_within_column_records_no_activity() {
        let fx = fixture();
        let other = {
            let guard = fx.db.lock_sync().unwrap();
            guard.create_task("alice", &fx.todo.id, "Other", None).unwrap()
        };

        let snapshot = BoardSnapshot {
            columns: vec![
                column(
                    &fx.todo.id,
                    0,
                    vec![task(&other.id, 0), task(&fx.task.id, 1)],
                ),
                column(&fx.doing.id, 1, vec![]),
            ],
        };

        let result = reconcile_board(
            &fx.db,
            &fx.events,
            Some("alice"),
            &fx.board.id,
            snapshot,
        )
        .await;
        assert!(result.success);

        assert!(moved_activities(&fx, &fx.task.id).is_empty());
        assert!(moved_activities(&fx, &other.id).is_empty());
        let guard = fx.db.lock_sync().unwrap();
        assert_eq!(guard.get_task(&fx.task.id).unwrap().unwrap().position, 1);
        assert_eq!(guard.get_task(&other.id).unwrap().unwrap().position, 0);
    }

    #[tokio::test]
    async fn applying_the_same_snapshot_twice_is_idempotent() {
        let fx = fixture();
        let snapshot = BoardSnapshot {
            columns: vec![
                column(&fx.todo.id, 1, vec![]),
                column(&fx.doing.id, 0, vec![task(&fx.task.id, 0)]),
            ],
        };

        let first = reconcile_board(
            &fx.db,
            &fx.events,
            Some("alice"),
            &fx.board.id,
            snapshot.clone(),
        )
        .await;
        assert!(first.success);
        assert_eq!(moved_activities(&fx, &fx.task.id).len(), 1);

        // Second pass: old == new everywhere, so no further activities.
        let second = reconcile_board(
            &fx.db,
            &fx.events,
            Some("alice"),
            &fx.board.id,
            snapshot,
        )
        .await;
        assert!(second.success);
        assert_eq!(moved_activities(&fx, &fx.task.id).len(), 1);

        let guard = fx.db.lock_sync().unwrap();
        let stored = guard.get_task(&fx.task.id).unwrap().unwrap();
        assert_eq!(stored.column_id, fx.doing.id);
        assert_eq!(stored.position, 0);
    }

    #[tokio::test]
    async fn unknown_task_id_rolls_back_the_whole_batch() {
        let fx = fixture();
        let snapshot = BoardSnapshot {
            columns: vec![
                column(&fx.todo.id, 9, vec![]),
                column(
                    &fx.doing.id,
                    0,
                    vec![task(&fx.task.id, 0), task("no-such-task", 1)],
                ),
            ],
        };

        let result = reconcile_board(
            &fx.db,
            &fx.events,
            Some("alice"),
            &fx.board.id,
            snapshot,
        )
        .await;
        assert!(!result.success);
        assert_eq!(result.message, "Error saving changes");

        // Nothing from the batch is observable: not the column reorder, not
        // the task move that preceded the failing entry, and no activities.
        let guard = fx.db.lock_sync().unwrap();
        assert_eq!(guard.get_column(&fx.todo.id).unwrap().unwrap().position, 0);
        let stored = guard.get_task(&fx.task.id).unwrap().unwrap();
        assert_eq!(stored.column_id, fx.todo.id);
        assert_eq!(stored.position, 0);
        drop(guard);
        assert!(moved_activities(&fx, &fx.task.id).is_empty());
    }

    #[tokio::test]
    async fn missing_identity_is_rejected_before_any_write() {
        let fx = fixture();
        let snapshot = BoardSnapshot {
            columns: vec![column(&fx.doing.id, 0, vec![task(&fx.task.id, 0)])],
        };

        for identity in [None, Some(""), Some("   ")] {
            let result = reconcile_board(
                &fx.db,
                &fx.events,
                identity,
                &fx.board.id,
                snapshot.clone(),
            )
            .await;
            assert!(!result.success);
            assert_eq!(result.message, "User not authenticated");
        }

        let guard = fx.db.lock_sync().unwrap();
        let stored = guard.get_task(&fx.task.id).unwrap().unwrap();
        assert_eq!(stored.column_id, fx.todo.id);
        drop(guard);
        assert!(moved_activities(&fx, &fx.task.id).is_empty());
    }

    #[tokio::test]
    async fn entries_with_empty_ids_are_skipped_without_error() {
        let fx = fixture();
        let snapshot = BoardSnapshot {
            columns: vec![
                // Client-side column that has not been persisted yet.
                column("", 7, vec![task(&fx.task.id, 9)]),
                // Persisted column carrying an unpersisted task row.
                column(&fx.doing.id, 0, vec![task("", 0)]),
                column(&fx.todo.id, 1, vec![]),
            ],
        };

        let result = reconcile_board(
            &fx.db,
            &fx.events,
            Some("alice"),
            &fx.board.id,
            snapshot,
        )
        .await;
        assert!(result.success);

        let guard = fx.db.lock_sync().unwrap();
        // The rest of the batch still applied.
        assert_eq!(guard.get_column(&fx.doing.id).unwrap().unwrap().position, 0);
        assert_eq!(guard.get_column(&fx.todo.id).unwrap().unwrap().position, 1);
        // The task under the unpersisted column was left untouched.
        let stored = guard.get_task(&fx.task.id).unwrap().unwrap();
        assert_eq!(stored.column_id, fx.todo.id);
        assert_eq!(stored.position, 0);
    }

    #[tokio::test]
    async fn success_emits_one_board_changed_event() {
        let fx = fixture();
        let mut rx = fx.events.subscribe();
        let snapshot = BoardSnapshot {
            columns: vec![column(&fx.todo.id, 0, vec![])],
        };

        let result = reconcile_board(
            &fx.db,
            &fx.events,
            Some("alice"),
            &fx.board.id,
            snapshot,
        )
        .await;
        assert!(result.success);

        let msg = rx.try_recv().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(parsed["type"], "BoardChanged");
        assert_eq!(parsed["data"]["board_id"], fx.board.id.as_str());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failure_emits_no_event() {
        let fx = fixture();
        let mut rx = fx.events.subscribe();
        let snapshot = BoardSnapshot {
            columns: vec![column(&fx.todo.id, 0, vec![task("ghost", 0)])],
        };

        let result = reconcile_board(
            &fx.db,
            &fx.events,
            Some("alice"),
            &fx.board.id,
            snapshot,
        )
        .await;
        assert!(!result.success);
        assert!(rx.try_recv().is_err());
    }
}
