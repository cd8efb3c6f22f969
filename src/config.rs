//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Tunables for a processing cycle.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum items selected per cycle.
    pub batch_limit: usize,
    /// Extra attempts after the first for transient analysis failures.
    pub max_retries: u32,
    /// First backoff delay; doubles per attempt.
    pub retry_base_delay: Duration,
    /// Ceiling for a single backoff delay.
    pub retry_max_delay: Duration,
    /// Candidates below this confidence never become task records.
    pub confidence_threshold: f64,
    /// Items analyzed concurrently.
    pub analysis_workers: usize,
    /// Items whose task records sync concurrently.
    pub sync_workers: usize,
    /// Create attempts per task record before it stops being retried.
    pub max_sync_attempts: u32,
    /// Analyzing claims older than this are returned to Unprocessed.
    pub stale_claim_threshold: Duration,
    /// Upper bound for one collaborator call.
    pub call_timeout: Duration,
    /// Minimum spacing between two analysis calls, process-wide.
    pub min_call_spacing: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_limit: 50,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(1000),
            retry_max_delay: Duration::from_millis(30_000),
            confidence_threshold: 0.6,
            analysis_workers: 4,
            sync_workers: 4,
            max_sync_attempts: 5,
            stale_claim_threshold: Duration::from_secs(900), // 15 minutes
            call_timeout: Duration::from_secs(60),
            min_call_spacing: Duration::from_millis(1000),
        }
    }
}

impl PipelineConfig {
    /// Build from `EMAIL_AGENT_*` environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let config = Self {
            batch_limit: env_or("EMAIL_AGENT_BATCH_LIMIT", d.batch_limit)?,
            max_retries: env_or("EMAIL_AGENT_MAX_RETRIES", d.max_retries)?,
            retry_base_delay: Duration::from_millis(env_or(
                "EMAIL_AGENT_RETRY_BASE_MS",
                millis(d.retry_base_delay),
            )?),
            retry_max_delay: Duration::from_millis(env_or(
                "EMAIL_AGENT_RETRY_MAX_MS",
                millis(d.retry_max_delay),
            )?),
            confidence_threshold: env_or(
                "EMAIL_AGENT_CONFIDENCE_THRESHOLD",
                d.confidence_threshold,
            )?,
            analysis_workers: env_or("EMAIL_AGENT_ANALYSIS_WORKERS", d.analysis_workers)?,
            sync_workers: env_or("EMAIL_AGENT_SYNC_WORKERS", d.sync_workers)?,
            max_sync_attempts: env_or("EMAIL_AGENT_MAX_SYNC_ATTEMPTS", d.max_sync_attempts)?,
            stale_claim_threshold: Duration::from_secs(env_or(
                "EMAIL_AGENT_STALE_CLAIM_SECS",
                d.stale_claim_threshold.as_secs(),
            )?),
            call_timeout: Duration::from_secs(env_or(
                "EMAIL_AGENT_CALL_TIMEOUT_SECS",
                d.call_timeout.as_secs(),
            )?),
            min_call_spacing: Duration::from_millis(env_or(
                "EMAIL_AGENT_MIN_CALL_SPACING_MS",
                millis(d.min_call_spacing),
            )?),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(invalid(
                "EMAIL_AGENT_CONFIDENCE_THRESHOLD",
                "must be within [0, 1]",
            ));
        }
        if self.analysis_workers == 0 {
            return Err(invalid("EMAIL_AGENT_ANALYSIS_WORKERS", "must be at least 1"));
        }
        if self.sync_workers == 0 {
            return Err(invalid("EMAIL_AGENT_SYNC_WORKERS", "must be at least 1"));
        }
        if self.max_sync_attempts == 0 {
            return Err(invalid("EMAIL_AGENT_MAX_SYNC_ATTEMPTS", "must be at least 1"));
        }
        if self.retry_max_delay < self.retry_base_delay {
            return Err(invalid(
                "EMAIL_AGENT_RETRY_MAX_MS",
                "must not be below EMAIL_AGENT_RETRY_BASE_MS",
            ));
        }
        Ok(())
    }
}

/// Configuration for the analysis model.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: SecretString,
    pub model: String,
    pub base_url: String,
}

impl LlmConfig {
    /// Read `OPENAI_API_KEY`, `EMAIL_AGENT_MODEL` and `OPENAI_BASE_URL`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingRequired {
                key: "OPENAI_API_KEY".to_string(),
                hint: "Set it to an API key for an OpenAI-compatible endpoint.".to_string(),
            })?;
        let model =
            std::env::var("EMAIL_AGENT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let base_url = std::env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        Ok(Self {
            api_key: SecretString::from(api_key),
            model,
            base_url,
        })
    }
}

/// IMAP mailbox configuration.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub mailbox: String,
    /// Upper bound on messages pulled per fetch.
    pub fetch_max: usize,
    /// Empty list denies every sender.
    pub allowed_senders: Vec<String>,
}

impl ImapConfig {
    /// Returns `Ok(None)` if `EMAIL_IMAP_HOST` is not set (ingest disabled).
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let Ok(host) = std::env::var("EMAIL_IMAP_HOST") else {
            return Ok(None);
        };

        let allowed_senders: Vec<String> = std::env::var("EMAIL_ALLOWED_SENDERS")
            .unwrap_or_else(|_| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Some(Self {
            host,
            port: env_or("EMAIL_IMAP_PORT", 993)?,
            username: std::env::var("EMAIL_IMAP_USERNAME").unwrap_or_default(),
            password: SecretString::from(
                std::env::var("EMAIL_IMAP_PASSWORD").unwrap_or_default(),
            ),
            mailbox: std::env::var("EMAIL_IMAP_MAILBOX").unwrap_or_else(|_| "INBOX".to_string()),
            fetch_max: env_or("EMAIL_FETCH_MAX", 50)?,
            allowed_senders,
        }))
    }
}

/// Google Tasks reconciler configuration.
#[derive(Debug, Clone)]
pub struct TasksConfig {
    /// OAuth access token. Renewal happens outside this process.
    pub access_token: SecretString,
    pub list_id: String,
    pub base_url: String,
    /// Requests allowed per rolling day.
    pub daily_quota: u32,
}

impl TasksConfig {
    /// Returns `Ok(None)` if `GOOGLE_TASKS_ACCESS_TOKEN` is not set.
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let Some(token) = std::env::var("GOOGLE_TASKS_ACCESS_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty())
        else {
            return Ok(None);
        };
        Ok(Some(Self {
            access_token: SecretString::from(token),
            list_id: std::env::var("GOOGLE_TASKS_LIST_ID").unwrap_or_else(|_| "@default".to_string()),
            base_url: std::env::var("GOOGLE_TASKS_BASE_URL")
                .unwrap_or_else(|_| "https://tasks.googleapis.com/tasks/v1".to_string()),
            daily_quota: env_or("GOOGLE_TASKS_DAILY_QUOTA", 50_000)?,
        }))
    }
}

/// Path of the libsql database file.
pub fn database_path() -> String {
    std::env::var("EMAIL_AGENT_DB_PATH").unwrap_or_else(|_| "./data/email_agent.db".to_string())
}

/// Read and parse an environment variable, using `default` when it is unset
/// or blank.
pub(crate) fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|e: T::Err| {
            ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }
        }),
        _ => Ok(default),
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
