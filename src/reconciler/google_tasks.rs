//! Google Tasks REST reconciler.
//!
//! Google Tasks has no native idempotency keys, so each created task carries
//! an `[idem:<key>]` marker at the end of its notes. `create_task` looks the
//! key up in an index built from one full listing, reloaded once it is older
//! than the index TTL, before inserting.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::NaiveDate;
use regex::Regex;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::TasksConfig;
use crate::error::ReconcilerError;
use crate::reconciler::{
    QuotaTracker, RemoteStatus, RemoteTask, StaticToken, TaskReconciler, TaskSpec, TokenSource,
};

static IDEM_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[idem:([^\]\s]+)\]").unwrap());

const PAGE_SIZE: u32 = 100;

/// Must stay below the stale sync-claim threshold, so a record taken over
/// from a crashed worker is checked against a listing made after the crash.
const DEFAULT_INDEX_TTL: Duration = Duration::from_secs(60);

/// Idempotency key to external id, from one listing of the list.
struct KeyIndex {
    loaded_at: Instant,
    keys: HashMap<String, String>,
}

pub struct GoogleTasksReconciler {
    http: reqwest::Client,
    base_url: String,
    list_id: String,
    tokens: Arc<dyn TokenSource>,
    quota: Arc<QuotaTracker>,
    index: Mutex<Option<KeyIndex>>,
    index_ttl: Duration,
}

impl GoogleTasksReconciler {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        list_id: impl Into<String>,
        tokens: Arc<dyn TokenSource>,
        quota: Arc<QuotaTracker>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            list_id: list_id.into(),
            tokens,
            quota,
            index: Mutex::new(None),
            index_ttl: DEFAULT_INDEX_TTL,
        }
    }

    pub fn with_index_ttl(mut self, ttl: Duration) -> Self {
        self.index_ttl = ttl;
        self
    }

    pub fn from_config(config: &TasksConfig, http: reqwest::Client) -> Self {
        Self::new(
            http,
            &config.base_url,
            &config.list_id,
            Arc::new(StaticToken::new(config.access_token.clone())),
            Arc::new(QuotaTracker::daily(config.daily_quota)),
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url.trim_end_matches('/'))
    }

    fn spend_quota(&self) -> Result<(), ReconcilerError> {
        if self.quota.try_acquire() {
            Ok(())
        } else {
            Err(ReconcilerError::QuotaExceeded {
                reason: "daily Google Tasks request budget spent".to_string(),
            })
        }
    }

    /// Send a request with auth and quota, mapping failures by status.
    async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, ReconcilerError> {
        self.spend_quota()?;
        let token = self.tokens.access_token().await?;
        let response = request.bearer_auth(token.expose_secret()).send().await?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(classify_response(status, &body))
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<String>, ReconcilerError> {
        let mut index = self.index.lock().await;
        let fresh = index
            .as_ref()
            .is_some_and(|i| i.loaded_at.elapsed() < self.index_ttl);
        if !fresh {
            let tasks = self.list_tasks(&self.list_id).await?;
            let keys: HashMap<String, String> = tasks
                .into_iter()
                .filter_map(|t| t.idempotency_key.map(|k| (k, t.external_id)))
                .collect();
            debug!(tasks = keys.len(), "Reloaded Google task key index");
            *index = Some(KeyIndex {
                loaded_at: Instant::now(),
                keys,
            });
        }
        Ok(index.as_ref().and_then(|i| i.keys.get(key).cloned()))
    }

    async fn remember(&self, key: &str, external_id: &str) {
        if let Some(index) = self.index.lock().await.as_mut() {
            index.keys.insert(key.to_string(), external_id.to_string());
        }
    }
}

#[async_trait]
impl TaskReconciler for GoogleTasksReconciler {
    fn name(&self) -> &str {
        "google_tasks"
    }

    fn default_list_id(&self) -> &str {
        &self.list_id
    }

    async fn create_task(
        &self,
        idempotency_key: &str,
        spec: &TaskSpec,
    ) -> Result<String, ReconcilerError> {
        if let Some(existing) = self.find_by_key(idempotency_key).await? {
            info!(key = idempotency_key, external_id = %existing, "Task already exists remotely");
            return Ok(existing);
        }

        let body = NewTask {
            title: &spec.title,
            notes: build_notes(spec, idempotency_key),
            due: spec.due.map(due_timestamp),
        };
        let url = self.url(&format!("lists/{}/tasks", self.list_id));
        let response = self.send(self.http.post(url).json(&body)).await?;
        let created: ApiTask = response.json().await.map_err(|e| ReconcilerError::Transient {
            reason: format!("unreadable insert response: {e}"),
        })?;
        debug!(key = idempotency_key, external_id = %created.id, "Created Google task");
        self.remember(idempotency_key, &created.id).await;
        Ok(created.id)
    }

    async fn update_task(
        &self,
        external_id: &str,
        idempotency_key: &str,
        spec: &TaskSpec,
    ) -> Result<(), ReconcilerError> {
        let url = self.url(&format!("lists/{}/tasks/{external_id}", self.list_id));
        let patch = TaskPatch {
            title: &spec.title,
            notes: build_notes(spec, idempotency_key),
            due: spec.due.map(due_timestamp),
        };
        match self.send(self.http.patch(url).json(&patch)).await {
            Ok(_) => {
                debug!(external_id, "Updated Google task");
                Ok(())
            }
            Err(ReconcilerError::Rejected { status: 404, .. }) => Err(ReconcilerError::NotFound {
                external_id: external_id.to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    async fn complete_task(&self, external_id: &str) -> Result<(), ReconcilerError> {
        let url = self.url(&format!("lists/{}/tasks/{external_id}", self.list_id));
        let patch = serde_json::json!({ "status": "completed" });
        match self.send(self.http.patch(url).json(&patch)).await {
            Ok(_) => Ok(()),
            Err(ReconcilerError::Rejected { status: 404, .. }) => Err(ReconcilerError::NotFound {
                external_id: external_id.to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    async fn list_tasks(&self, list_id: &str) -> Result<Vec<RemoteTask>, ReconcilerError> {
        let url = self.url(&format!("lists/{list_id}/tasks"));
        let mut tasks = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![
                ("showCompleted", "true".to_string()),
                ("showHidden", "true".to_string()),
                ("maxResults", PAGE_SIZE.to_string()),
            ];
            if let Some(token) = page_token.take() {
                query.push(("pageToken", token));
            }
            let response = self.send(self.http.get(&url).query(&query)).await?;
            let page: ApiTaskPage = response.json().await.map_err(|e| {
                ReconcilerError::Transient {
                    reason: format!("unreadable list response: {e}"),
                }
            })?;
            tasks.extend(page.items.into_iter().map(RemoteTask::from));
            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }
        Ok(tasks)
    }

    async fn health_check(&self) -> Result<(), ReconcilerError> {
        let url = self.url("users/@me/lists");
        self.send(self.http.get(url).query(&[("maxResults", "1")]))
            .await
            .map(|_| ())
    }
}

#[derive(Serialize)]
struct NewTask<'a> {
    title: &'a str,
    notes: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    due: Option<String>,
}

/// PATCH body. `due` is always sent so a cleared date clears remotely.
#[derive(Serialize)]
struct TaskPatch<'a> {
    title: &'a str,
    notes: String,
    due: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiTask {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiTaskPage {
    #[serde(default)]
    items: Vec<ApiTask>,
    #[serde(default)]
    next_page_token: Option<String>,
}

impl From<ApiTask> for RemoteTask {
    fn from(task: ApiTask) -> Self {
        Self {
            idempotency_key: task.notes.as_deref().and_then(extract_key),
            status: match task.status.as_deref() {
                Some("completed") => RemoteStatus::Completed,
                _ => RemoteStatus::NeedsAction,
            },
            external_id: task.id,
            title: task.title,
        }
    }
}

/// Google stores due dates as midnight UTC timestamps.
fn due_timestamp(day: NaiveDate) -> String {
    format!("{}T00:00:00.000Z", day.format("%Y-%m-%d"))
}

fn build_notes(spec: &TaskSpec, key: &str) -> String {
    let mut notes = String::new();
    if let Some(detail) = &spec.notes {
        notes.push_str(detail);
        notes.push_str("\n\n");
    }
    notes.push_str(&format!("Priority: {}\n", spec.priority.as_str()));
    notes.push_str(&format!("[idem:{key}]"));
    notes
}

fn extract_key(notes: &str) -> Option<String> {
    IDEM_MARKER
        .captures_iter(notes)
        .last()
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Map a failed Google API response onto a reconciler error.
fn classify_response(status: u16, body: &str) -> ReconcilerError {
    match status {
        401 => ReconcilerError::AuthExpired {
            reason: "access token rejected".to_string(),
        },
        403 if body.contains("rateLimitExceeded") || body.contains("userRateLimitExceeded") => {
            ReconcilerError::Transient {
                reason: "rate limited".to_string(),
            }
        }
        403 if body.contains("quotaExceeded") || body.contains("dailyLimitExceeded") => {
            ReconcilerError::QuotaExceeded {
                reason: "Google API quota exceeded".to_string(),
            }
        }
        403 => {
            warn!(body = %body, "Google Tasks refused the request");
            ReconcilerError::AuthExpired {
                reason: "insufficient permission".to_string(),
            }
        }
        409 => ReconcilerError::Conflict {
            reason: body.to_string(),
        },
        408 | 429 | 500..=599 => ReconcilerError::Transient {
            reason: format!("HTTP {status}"),
        },
        _ => ReconcilerError::Rejected {
            status,
            body: body.to_string(),
        },
    }
}
