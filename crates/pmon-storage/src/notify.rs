//! Operator notification transport.

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

/// SQLSTATE raised by PostgreSQL on serialization failures.
const SERIALIZATION_FAILURE: &str = "40001";
const SERIALIZATION_MESSAGE: &str = "could not serialize access";

#[derive(Debug, Error)]
pub enum NotifyError {
    /// Concurrent writers collided; the same message may succeed on retry.
    #[error("write conflict while posting message: {0}")]
    WriteConflict(String),
    #[error("unknown recipient `{0}`")]
    UnknownRecipient(String),
    #[error("notification transport failed: {0}")]
    Transport(String),
}

impl NotifyError {
    pub fn is_write_conflict(&self) -> bool {
        matches!(self, NotifyError::WriteConflict(_))
    }
}

impl From<sqlx::Error> for NotifyError {
    fn from(err: sqlx::Error) -> Self {
        let conflict = match &err {
            sqlx::Error::Database(db) => {
                db.code().as_deref() == Some(SERIALIZATION_FAILURE)
                    || db.message().contains(SERIALIZATION_MESSAGE)
            }
            other => other.to_string().contains(SERIALIZATION_MESSAGE),
        };
        if conflict {
            NotifyError::WriteConflict(err.to_string())
        } else {
            NotifyError::Transport(err.to_string())
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_message(&self, recipient: &str, subject: &str, body: &str) -> Result<(), NotifyError>;
}

/// Writes notifications to the log only; used when no inbox is wired.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_message(&self, recipient: &str, subject: &str, body: &str) -> Result<(), NotifyError> {
        warn!(recipient, subject, body, "operator notification");
        Ok(())
    }
}
