//! Kanban board back-end.
//!
//! ## Overview
//!
//! Boards hold ordered columns, columns hold ordered tasks, and every task
//! carries labels, checklists, and an activity feed. Clients read and mutate
//! all of it over the HTTP API; after a drag-and-drop session they submit a
//! full layout snapshot which `reconcile::reconcile_board` persists
//! atomically, deriving a `task_moved` activity for every task that changed
//! columns. Successful commits emit a `BoardEvent` over the broadcast
//! channel, which `/ws` fans out to connected clients so they can refresh
//! cached board views.
//!
//! ## Module Map
//!
//! | Module      | Responsibility                                          |
//! |-------------|---------------------------------------------------------|
//! | `models`    | Shared types: `Board`, `Column`, `Task`, `Activity`     |
//! | `db`        | SQLite access via `DbHandle` (thin `Arc<Mutex<_>>`)     |
//! | `reconcile` | Layout snapshot application + activity derivation       |
//! | `api`       | axum route handlers, `AppState`, caller identity        |
//! | `server`    | `ServerConfig`, router assembly, graceful shutdown      |
//! | `ws`        | `BoardEvent` enum + `broadcast_event()` helper          |
//!
//! ## Typical Request Flow (drag a task to another column)
//!
//! 1. `PUT /api/boards/{id}/layout` → `api::update_board_layout()`
//! 2. `reconcile_board()` checks the caller identity, then applies the whole
//!    snapshot inside one transaction via `db::BoardDb::apply_snapshot()`:
//!    column positions first, then task positions and column membership,
//!    inserting a `task_moved` activity wherever the stored column differs
//!    from the submitted one.
//! 3. On commit, a `BoardEvent::BoardChanged` is broadcast and the client
//!    receives `{"success": true, "message": "Saved changes"}`.
//!
//! Concurrent snapshot submissions for the same board are not coordinated;
//! the last commit wins.

pub mod api;
pub mod db;
pub mod models;
pub mod reconcile;
pub mod server;
pub mod ws;
