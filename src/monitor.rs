//! Read-only health and spend observer. Never touches pipeline state.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::analysis::AnalysisEngine;
use crate::error::DatabaseError;
use crate::pipeline::types::ItemState;
use crate::reconciler::TaskReconciler;
use crate::source::SourceConnector;
use crate::store::{CostSummary, Database, ProcessingLogEntry};

/// Probes slower than this report `Degraded`.
pub const DEFAULT_DEGRADED_AFTER: Duration = Duration::from_secs(2);

/// Ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Down,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Degraded => "degraded",
            Self::Down => "down",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub component: String,
    pub status: HealthStatus,
    pub detail: String,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Worst component status.
    pub overall: HealthStatus,
    pub components: Vec<ComponentHealth>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn component(&self, name: &str) -> Option<&ComponentHealth> {
        self.components.iter().find(|c| c.component == name)
    }
}

pub struct HealthMonitor {
    store: Arc<dyn Database>,
    analyzer: Option<Arc<dyn AnalysisEngine>>,
    reconciler: Option<Arc<dyn TaskReconciler>>,
    source: Option<Arc<dyn SourceConnector>>,
    call_timeout: Duration,
    degraded_after: Duration,
}

impl HealthMonitor {
    pub fn new(store: Arc<dyn Database>, call_timeout: Duration) -> Self {
        Self {
            store,
            analyzer: None,
            reconciler: None,
            source: None,
            call_timeout,
            degraded_after: DEFAULT_DEGRADED_AFTER,
        }
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn AnalysisEngine>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn with_reconciler(mut self, reconciler: Arc<dyn TaskReconciler>) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    pub fn with_source(mut self, source: Arc<dyn SourceConnector>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_degraded_after(mut self, degraded_after: Duration) -> Self {
        self.degraded_after = degraded_after;
        self
    }

    /// Probe every component concurrently.
    pub async fn check(&self) -> HealthReport {
        let (storage, source, analysis, reconciler) = tokio::join!(
            self.probe("storage", self.store.ping()),
            self.probe_optional("source", self.source.as_ref().map(|s| s.health_check())),
            self.probe_optional(
                "analysis",
                self.analyzer.as_ref().map(|a| a.health_check())
            ),
            self.probe_optional(
                "reconciler",
                self.reconciler.as_ref().map(|r| r.health_check())
            ),
        );

        let components = vec![storage, source, analysis, reconciler];
        let overall = components
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Ok);
        if overall != HealthStatus::Ok {
            warn!(overall = %overall, "Health check not ok");
        }
        HealthReport {
            overall,
            components,
            checked_at: Utc::now(),
        }
    }

    /// Spend recorded in the cost ledger over `[since, until)`.
    pub async fn cumulative_cost(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<CostSummary, DatabaseError> {
        self.store.cost_summary(since, until).await
    }

    /// Item count per state. States with no items are omitted.
    pub async fn backlog(&self) -> Result<Vec<(ItemState, u64)>, DatabaseError> {
        self.store.count_items_by_state().await
    }

    /// Latest cycle, sync and summary runs, newest first.
    pub async fn recent_runs(&self, limit: usize) -> Result<Vec<ProcessingLogEntry>, DatabaseError> {
        self.store.recent_processing_log(limit).await
    }

    async fn probe_optional<F, E>(&self, component: &str, probe: Option<F>) -> ComponentHealth
    where
        F: Future<Output = Result<(), E>>,
        E: Display,
    {
        match probe {
            Some(probe) => self.probe(component, probe).await,
            None => ComponentHealth {
                component: component.to_string(),
                status: HealthStatus::Degraded,
                detail: "not configured".to_string(),
                latency_ms: 0,
            },
        }
    }

    async fn probe<F, E>(&self, component: &str, probe: F) -> ComponentHealth
    where
        F: Future<Output = Result<(), E>>,
        E: Display,
    {
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.call_timeout, probe).await;
        let elapsed = started.elapsed();

        let (status, detail) = match outcome {
            Ok(Ok(())) if elapsed > self.degraded_after => (
                HealthStatus::Degraded,
                format!("slow response ({}ms)", elapsed.as_millis()),
            ),
            Ok(Ok(())) => (HealthStatus::Ok, "reachable".to_string()),
            Ok(Err(e)) => (HealthStatus::Down, e.to_string()),
            Err(_) => (
                HealthStatus::Down,
                format!("timed out after {:?}", self.call_timeout),
            ),
        };
        debug!(component, status = %status, latency_ms = elapsed.as_millis() as u64, "Probe finished");
        ComponentHealth {
            component: component.to_string(),
            status,
            detail,
            latency_ms: elapsed.as_millis() as u64,
        }
    }
}
