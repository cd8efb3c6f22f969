//! Source connectors: where Items come from.

pub mod imap;
pub mod mail;

pub use imap::ImapSource;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::SourceError;

/// A message as fetched from a mailbox, before it becomes an Item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawItem {
    pub external_id: String,
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

/// What to fetch.
#[derive(Debug, Clone)]
pub struct FetchFilter {
    /// Only messages not yet marked read on the server.
    pub unread_only: bool,
    /// Only messages received on or after this instant.
    pub since: Option<DateTime<Utc>>,
}

impl Default for FetchFilter {
    fn default() -> Self {
        Self {
            unread_only: true,
            since: None,
        }
    }
}

/// A mailbox that can be polled for new items.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch up to `max_count` items, oldest first.
    ///
    /// Never returns the same external id twice within one call. Items
    /// returned by earlier calls may come back again.
    async fn fetch_new(
        &self,
        filter: &FetchFilter,
        max_count: usize,
    ) -> Result<Vec<RawItem>, SourceError>;

    async fn health_check(&self) -> Result<(), SourceError>;
}
