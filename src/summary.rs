//! Daily roll-up of terminal items and their tasks.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::analysis::AnalysisEngine;
use crate::error::{DatabaseError, PipelineError};
use crate::llm::CallUsage;
use crate::pipeline::types::{Item, ItemState, TaskRecord, TaskStatus};
use crate::store::{CallPurpose, Database, LlmCallRecord, ProcessingLogEntry};

/// Items above this importance count as important.
const IMPORTANT_THRESHOLD: f64 = 0.7;

const TOP_SENDERS: usize = 5;

const TOP_TOPICS: usize = 5;

/// Item summaries included in the digest prompt.
const DIGEST_ITEMS: usize = 10;

const STOP_WORDS: &[&str] = &[
    "about", "after", "again", "also", "been", "before", "from", "have", "here", "into",
    "just", "more", "need", "next", "only", "please", "some", "that", "their",
    "them", "then", "there", "these", "they", "this", "today", "were", "what", "when", "will",
    "with", "your", "you're", "update", "reminder",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderCount {
    pub sender: String,
    pub count: u32,
}

/// Roll-up of one UTC calendar day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySummary {
    pub day: NaiveDate,
    /// Items that reached `Done`.
    pub items_processed: u32,
    pub items_failed: u32,
    pub important_items: u32,
    pub tasks_created: u32,
    pub tasks_completed: u32,
    pub high_priority_tasks: u32,
    pub total_tokens: u64,
    pub total_cost: Decimal,
    pub average_importance: f64,
    pub top_senders: Vec<SenderCount>,
    pub key_topics: Vec<String>,
    pub digest: String,
    pub processing_time_ms: u64,
    pub generated_at: DateTime<Utc>,
}

impl DailySummary {
    /// Equal counts, spend, senders and topics. Digest text and timing may
    /// differ between two runs over the same data.
    pub fn same_aggregates(&self, other: &DailySummary) -> bool {
        self.day == other.day
            && self.items_processed == other.items_processed
            && self.items_failed == other.items_failed
            && self.important_items == other.important_items
            && self.tasks_created == other.tasks_created
            && self.tasks_completed == other.tasks_completed
            && self.high_priority_tasks == other.high_priority_tasks
            && self.total_tokens == other.total_tokens
            && self.total_cost == other.total_cost
            && (self.average_importance - other.average_importance).abs() < f64::EPSILON
            && self.top_senders == other.top_senders
            && self.key_topics == other.key_topics
    }
}

/// Builds and stores daily summaries. Never mutates items or tasks.
pub struct Aggregator {
    store: Arc<dyn Database>,
    digest_engine: Option<Arc<dyn AnalysisEngine>>,
    call_timeout: Duration,
}

impl Aggregator {
    pub fn new(store: Arc<dyn Database>, call_timeout: Duration) -> Self {
        Self {
            store,
            digest_engine: None,
            call_timeout,
        }
    }

    /// Use a model for the digest text instead of the fixed template.
    pub fn with_digest_engine(mut self, engine: Arc<dyn AnalysisEngine>) -> Self {
        self.digest_engine = Some(engine);
        self
    }

    /// Summarize terminal items received on `day` and replace any stored
    /// summary for that day.
    pub async fn summarize(&self, day: NaiveDate) -> Result<DailySummary, PipelineError> {
        let clock = Instant::now();
        let start = day.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc();
        let end = start + chrono::Duration::days(1);

        let items: Vec<Item> = self
            .store
            .list_items_received_between(start, end)
            .await?
            .into_iter()
            .filter(|item| item.state.is_terminal())
            .collect();
        let terminal: HashSet<Uuid> = items.iter().map(|item| item.id).collect();
        let tasks: Vec<TaskRecord> = self
            .store
            .list_tasks_for_items_received_between(start, end)
            .await?
            .into_iter()
            .filter(|task| terminal.contains(&task.item_id))
            .collect();

        let mut summary = aggregate(day, &items, &tasks);
        summary.digest = if items.is_empty() {
            format!("No emails were processed on {day}.")
        } else {
            match self.generate_digest(&summary, &items).await? {
                Some(text) => text,
                None => fallback_digest(&summary),
            }
        };
        summary.processing_time_ms = clock.elapsed().as_millis() as u64;
        summary.generated_at = Utc::now();

        self.store.upsert_daily_summary(&summary).await?;
        self.log_summary(&summary).await;

        info!(
            day = %day,
            processed = summary.items_processed,
            failed = summary.items_failed,
            tasks = summary.tasks_created,
            cost = %summary.total_cost,
            "Daily summary generated"
        );
        Ok(summary)
    }

    /// Ask the model for a digest. `None` means use the template instead.
    async fn generate_digest(
        &self,
        summary: &DailySummary,
        items: &[Item],
    ) -> Result<Option<String>, DatabaseError> {
        let Some(engine) = &self.digest_engine else {
            return Ok(None);
        };

        let prompt = build_digest_prompt(summary, items);
        let call = tokio::time::timeout(self.call_timeout, engine.digest(&prompt)).await;
        match call {
            Ok(Ok((text, usage))) => {
                self.record_digest_call(engine.as_ref(), usage, true).await?;
                let text = text.trim();
                if text.is_empty() {
                    warn!(day = %summary.day, "Empty digest from model, using template");
                    return Ok(None);
                }
                Ok(Some(text.to_string()))
            }
            Ok(Err(e)) => {
                if let Some(usage) = e.usage() {
                    self.record_digest_call(engine.as_ref(), *usage, false)
                        .await?;
                }
                warn!(day = %summary.day, error = %e, "Digest generation failed, using template");
                Ok(None)
            }
            Err(_) => {
                warn!(day = %summary.day, "Digest generation timed out, using template");
                Ok(None)
            }
        }
    }

    async fn record_digest_call(
        &self,
        engine: &dyn AnalysisEngine,
        usage: CallUsage,
        succeeded: bool,
    ) -> Result<(), DatabaseError> {
        self.store
            .record_llm_call(&LlmCallRecord {
                id: Uuid::new_v4(),
                item_id: None,
                provider: engine.provider().to_string(),
                model: engine.model().to_string(),
                purpose: CallPurpose::Digest,
                usage,
                succeeded,
                created_at: Utc::now(),
            })
            .await
    }

    async fn log_summary(&self, summary: &DailySummary) {
        let entry = ProcessingLogEntry {
            id: Uuid::new_v4(),
            operation: "summary".to_string(),
            status: "success".to_string(),
            message: format!(
                "day={} processed={} failed={}",
                summary.day, summary.items_processed, summary.items_failed
            ),
            duration_ms: summary.processing_time_ms,
            tokens_used: 0,
            cost: Decimal::ZERO,
            created_at: summary.generated_at,
        };
        if let Err(e) = self.store.append_processing_log(&entry).await {
            warn!(error = %e, "Failed to write processing log");
        }
    }
}

/// Pure roll-up over terminal items and their task records.
fn aggregate(day: NaiveDate, items: &[Item], tasks: &[TaskRecord]) -> DailySummary {
    let count = |pred: &dyn Fn(&Item) -> bool| items.iter().filter(|i| pred(i)).count() as u32;

    let scores: Vec<f64> = items
        .iter()
        .filter_map(|i| i.analysis.as_ref().map(|a| a.importance_score))
        .collect();
    let average_importance = if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    };

    DailySummary {
        day,
        items_processed: count(&|i| i.state == ItemState::Done),
        items_failed: count(&|i| i.state == ItemState::Failed),
        important_items: scores.iter().filter(|s| **s > IMPORTANT_THRESHOLD).count() as u32,
        tasks_created: tasks.len() as u32,
        tasks_completed: tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count() as u32,
        high_priority_tasks: tasks.iter().filter(|t| t.priority.is_high()).count() as u32,
        total_tokens: items.iter().map(|i| i.tokens_used).sum(),
        total_cost: items.iter().map(|i| i.cost).sum(),
        average_importance,
        top_senders: top_senders(items),
        key_topics: key_topics(items),
        digest: String::new(),
        processing_time_ms: 0,
        generated_at: Utc::now(),
    }
}

fn top_senders(items: &[Item]) -> Vec<SenderCount> {
    let mut counts: HashMap<&str, u32> = HashMap::new();
    for item in items {
        *counts.entry(item.sender.as_str()).or_default() += 1;
    }
    let mut ranked: Vec<SenderCount> = counts
        .into_iter()
        .map(|(sender, count)| SenderCount {
            sender: sender.to_string(),
            count,
        })
        .collect();
    ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.sender.cmp(&b.sender)));
    ranked.truncate(TOP_SENDERS);
    ranked
}

/// Most frequent subject words, minus stop words.
fn key_topics(items: &[Item]) -> Vec<String> {
    let mut counts: HashMap<String, u32> = HashMap::new();
    for item in items {
        // Each subject counts a word once.
        let words: HashSet<String> = item
            .subject
            .split(|c: char| !c.is_alphanumeric())
            .map(str::to_lowercase)
            .filter(|w| w.chars().count() >= 4 && !w.chars().all(|c| c.is_ascii_digit()))
            .filter(|w| !STOP_WORDS.contains(&w.as_str()))
            .collect();
        for word in words {
            *counts.entry(word).or_default() += 1;
        }
    }
    let mut ranked: Vec<(String, u32)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(TOP_TOPICS).map(|(w, _)| w).collect()
}

fn build_digest_prompt(summary: &DailySummary, items: &[Item]) -> String {
    let mut ranked: Vec<&Item> = items.iter().filter(|i| i.analysis.is_some()).collect();
    ranked.sort_by(|a, b| {
        let score = |i: &Item| i.analysis.as_ref().map_or(0.0, |a| a.importance_score);
        score(b).total_cmp(&score(a))
    });

    let mut prompt = format!(
        "Date: {}\nEmails processed: {}\nFailed: {}\nImportant: {}\nTasks created: {} ({} high priority)\n",
        summary.day,
        summary.items_processed,
        summary.items_failed,
        summary.important_items,
        summary.tasks_created,
        summary.high_priority_tasks,
    );
    if !summary.key_topics.is_empty() {
        prompt.push_str(&format!("Topics: {}\n", summary.key_topics.join(", ")));
    }
    prompt.push_str("\nMost important emails:\n");
    for item in ranked.into_iter().take(DIGEST_ITEMS) {
        if let Some(analysis) = &item.analysis {
            prompt.push_str(&format!(
                "- [{:.2}] {} from {}: {}\n",
                analysis.importance_score, item.subject, item.sender, analysis.summary
            ));
        }
    }
    debug!(chars = prompt.len(), "Digest prompt built");
    prompt
}

fn fallback_digest(summary: &DailySummary) -> String {
    let mut text = format!(
        "{} emails processed, {} failed, {} important. {} tasks created ({} high priority, {} completed).",
        summary.items_processed,
        summary.items_failed,
        summary.important_items,
        summary.tasks_created,
        summary.high_priority_tasks,
        summary.tasks_completed,
    );
    if !summary.top_senders.is_empty() {
        let senders: Vec<&str> = summary.top_senders.iter().map(|s| s.sender.as_str()).collect();
        text.push_str(&format!(" Top senders: {}.", senders.join(", ")));
    }
    if !summary.key_topics.is_empty() {
        text.push_str(&format!(" Topics: {}.", summary.key_topics.join(", ")));
    }
    text
}
