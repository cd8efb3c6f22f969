//! Task reconcilers: mirror task records onto an external task service.

pub mod google_tasks;
pub mod quota;

pub use google_tasks::GoogleTasksReconciler;
pub use quota::QuotaTracker;

use async_trait::async_trait;
use chrono::NaiveDate;
use secrecy::SecretString;

use crate::error::ReconcilerError;
use crate::pipeline::types::{Priority, TaskRecord};

/// What to create remotely.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    pub title: String,
    pub notes: Option<String>,
    pub due: Option<NaiveDate>,
    pub priority: Priority,
}

impl From<&TaskRecord> for TaskSpec {
    fn from(record: &TaskRecord) -> Self {
        Self {
            title: record.title.clone(),
            notes: record.description.clone(),
            due: record.due_date,
            priority: record.priority,
        }
    }
}

/// Remote completion state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStatus {
    NeedsAction,
    Completed,
}

/// Snapshot of one remote task.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteTask {
    pub external_id: String,
    pub title: String,
    pub status: RemoteStatus,
    /// Idempotency key recovered from the remote task, if it carries one.
    pub idempotency_key: Option<String>,
}

/// External task service.
#[async_trait]
pub trait TaskReconciler: Send + Sync {
    fn name(&self) -> &str;

    /// List that `create_task` writes to.
    fn default_list_id(&self) -> &str;

    /// Create a task. Calling twice with the same key returns the same
    /// external id instead of creating a second task.
    async fn create_task(&self, idempotency_key: &str, spec: &TaskSpec)
    -> Result<String, ReconcilerError>;

    /// Rewrite an existing task's fields. `idempotency_key` is the key it
    /// was created with and stays attached to it.
    async fn update_task(
        &self,
        external_id: &str,
        idempotency_key: &str,
        spec: &TaskSpec,
    ) -> Result<(), ReconcilerError>;

    async fn complete_task(&self, external_id: &str) -> Result<(), ReconcilerError>;

    async fn list_tasks(&self, list_id: &str) -> Result<Vec<RemoteTask>, ReconcilerError>;

    async fn health_check(&self) -> Result<(), ReconcilerError>;
}

/// Supplies bearer tokens to a reconciler.
///
/// Renewal is owned by whoever implements this; the reconciler only asks
/// for the current token and reports `AuthExpired` when it is refused.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self) -> Result<SecretString, ReconcilerError>;
}

/// A token fixed at construction.
pub struct StaticToken(SecretString);

impl StaticToken {
    pub fn new(token: SecretString) -> Self {
        Self(token)
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn access_token(&self) -> Result<SecretString, ReconcilerError> {
        Ok(self.0.clone())
    }
}
