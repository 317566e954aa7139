//! Typed error hierarchy for the board service.
//!
//! `BoardError` covers the domain-level failures the HTTP layer needs to
//! distinguish (missing entities, permission failures). Everything else is
//! carried as `anyhow::Error` context from the persistence layer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BoardError {
    #[error("Board {id} not found")]
    BoardNotFound { id: String },

    #[error("Column {id} not found")]
    ColumnNotFound { id: String },

    #[error("Task {id} not found")]
    TaskNotFound { id: String },

    #[error("Label {id} not found")]
    LabelNotFound { id: String },

    #[error("Checklist {id} not found")]
    ChecklistNotFound { id: String },

    #[error("Only board owners can delete the board")]
    NotBoardOwner { board_id: String, user_id: String },

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn board_not_found_carries_id() {
        let err = BoardError::BoardNotFound { id: "b42".into() };
        match &err {
            BoardError::BoardNotFound { id } => assert_eq!(id, "b42"),
            _ => panic!("Expected BoardNotFound"),
        }
        assert!(err.to_string().contains("b42"));
    }

    #[test]
    fn not_board_owner_is_matchable() {
        let err = BoardError::NotBoardOwner {
            board_id: "b1".into(),
            user_id: "u1".into(),
        };
        assert!(matches!(err, BoardError::NotBoardOwner { .. }));
    }

    #[test]
    fn variants_are_distinct() {
        let board_err = BoardError::BoardNotFound { id: "x".into() };
        let task_err = BoardError::TaskNotFound { id: "x".into() };
        assert!(matches!(board_err, BoardError::BoardNotFound { .. }));
        assert!(!matches!(board_err, BoardError::TaskNotFound { .. }));
        assert!(matches!(task_err, BoardError::TaskNotFound { .. }));
    }

    #[test]
    fn all_variants_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&BoardError::LockPoisoned);
        assert_std_error(&BoardError::BadRequest("bad".into()));
    }

    #[test]
    fn downcasts_from_anyhow() {
        let err: anyhow::Error = BoardError::TaskNotFound { id: "t9".into() }.into();
        let typed = err.downcast_ref::<BoardError>().unwrap();
        assert!(matches!(typed, BoardError::TaskNotFound { .. }));
    }
}
