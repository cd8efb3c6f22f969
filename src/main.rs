//! `email-agent` -- command-line triggers for the email pipeline.
//!
//! - `email-agent run` -- run one processing cycle.
//! - `email-agent sync` -- retry unsynced tasks and mirror remote status.
//! - `email-agent ingest` -- pull new mail into the store.
//! - `email-agent summarize` -- build the daily summary for a day.
//! - `email-agent health` -- probe every component.
//! - `email-agent status` -- backlog per state and recent runs.
//! - `email-agent cost` -- spend recorded over recent days.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use email_agent::analysis::{AnalysisEngine, LlmAnalyzer, MinIntervalLimiter};
use email_agent::config::{self, ImapConfig, LlmConfig, PipelineConfig, TasksConfig};
use email_agent::llm::create_provider;
use email_agent::monitor::HealthMonitor;
use email_agent::pipeline::{ItemFilter, Orchestrator};
use email_agent::reconciler::{GoogleTasksReconciler, TaskReconciler};
use email_agent::source::{FetchFilter, ImapSource, SourceConnector};
use email_agent::store::{Database, LibSqlBackend};
use email_agent::summary::Aggregator;

/// Email triage agent.
#[derive(Parser)]
#[command(name = "email-agent", about = "Analyze email and keep a task list in step", version)]
struct Cli {
    /// Enable verbose (debug-level) logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one processing cycle.
    Run {
        /// Maximum items to select (defaults to EMAIL_AGENT_BATCH_LIMIT).
        #[arg(long)]
        batch_limit: Option<usize>,
        /// Only process items whose sender contains this text.
        #[arg(long)]
        sender: Option<String>,
        /// Ingest new mail before the cycle.
        #[arg(long)]
        ingest: bool,
    },

    /// Retry unsynced tasks and mirror remote completion.
    Sync,

    /// Fetch new mail from the configured mailbox.
    Ingest {
        /// Maximum messages to fetch (defaults to EMAIL_FETCH_MAX).
        #[arg(long)]
        max: Option<usize>,
        /// Include messages already marked read.
        #[arg(long)]
        all: bool,
    },

    /// Build (or rebuild) the daily summary.
    Summarize {
        /// UTC day as YYYY-MM-DD. Defaults to today.
        date: Option<NaiveDate>,
    },

    /// Analyze an item again.
    Reanalyze {
        item_id: Uuid,
    },

    /// Mark a synced task completed, remotely and locally.
    Complete {
        task_id: Uuid,
    },

    /// Probe storage, mailbox, model and task service.
    Health,

    /// Item backlog per state and the latest runs.
    Status {
        /// Number of recent runs to show.
        #[arg(long, default_value_t = 10)]
        runs: usize,
    },

    /// Model spend recorded in the ledger.
    Cost {
        /// Look back this many days.
        #[arg(long, default_value_t = 1)]
        days: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.verbose);

    let pipeline_config = PipelineConfig::from_env()?;
    let db_path = config::database_path();
    let store: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(Path::new(&db_path))
            .await
            .with_context(|| format!("failed to open database at {db_path}"))?,
    );
    let http = reqwest::Client::new();

    match cli.command {
        Commands::Run {
            batch_limit,
            sender,
            ingest,
        } => {
            let orchestrator = orchestrator(&pipeline_config, store, &http)?;
            if ingest {
                let max = ImapConfig::from_env()?.map_or(50, |c| c.fetch_max);
                print_json(&orchestrator.ingest(&FetchFilter::default(), max).await?)?;
            }
            let filter = ItemFilter {
                sender,
                ..Default::default()
            };
            let limit = batch_limit.unwrap_or(pipeline_config.batch_limit);
            print_json(&orchestrator.run_cycle(limit, &filter).await?)?;
        }
        Commands::Sync => {
            let orchestrator = orchestrator(&pipeline_config, store, &http)?;
            print_json(&orchestrator.sync_pending_tasks().await?)?;
        }
        Commands::Ingest { max, all } => {
            let orchestrator = orchestrator(&pipeline_config, store, &http)?;
            let max = match max {
                Some(max) => max,
                None => ImapConfig::from_env()?.map_or(50, |c| c.fetch_max),
            };
            let filter = FetchFilter {
                unread_only: !all,
                ..Default::default()
            };
            print_json(&orchestrator.ingest(&filter, max).await?)?;
        }
        Commands::Summarize { date } => {
            let day = date.unwrap_or_else(|| Utc::now().date_naive());
            let mut aggregator = Aggregator::new(store, pipeline_config.call_timeout);
            if let Some(engine) = analyzer(&pipeline_config)? {
                aggregator = aggregator.with_digest_engine(engine);
            }
            print_json(&aggregator.summarize(day).await?)?;
        }
        Commands::Reanalyze { item_id } => {
            let orchestrator = orchestrator(&pipeline_config, store, &http)?;
            print_json(&orchestrator.reanalyze(item_id).await?)?;
        }
        Commands::Complete { task_id } => {
            let orchestrator = orchestrator(&pipeline_config, store, &http)?;
            let task = orchestrator.complete_task(task_id).await?;
            println!("Completed {} ({})", task.title, task.id);
        }
        Commands::Health => {
            let mut monitor = HealthMonitor::new(store, pipeline_config.call_timeout);
            if let Some(engine) = analyzer(&pipeline_config)? {
                monitor = monitor.with_analyzer(engine);
            }
            if let Some(reconciler) = reconciler(&http)? {
                monitor = monitor.with_reconciler(reconciler);
            }
            if let Some(source) = source()? {
                monitor = monitor.with_source(source);
            }
            print_json(&monitor.check().await)?;
        }
        Commands::Status { runs } => {
            let monitor = HealthMonitor::new(store, pipeline_config.call_timeout);
            let backlog: serde_json::Map<String, serde_json::Value> = monitor
                .backlog()
                .await?
                .into_iter()
                .map(|(state, count)| (state.to_string(), count.into()))
                .collect();
            print_json(&serde_json::json!({
                "backlog": backlog,
                "recent_runs": monitor.recent_runs(runs).await?,
            }))?;
        }
        Commands::Cost { days } => {
            let until = Utc::now();
            let since = until - chrono::Duration::days(days.max(0));
            let monitor = HealthMonitor::new(store, pipeline_config.call_timeout);
            print_json(&monitor.cumulative_cost(since, until).await?)?;
        }
    }

    Ok(())
}

/// Console logging, plus daily rolling files under `EMAIL_AGENT_LOG_DIR`
/// when it is set. The returned guard flushes the file writer on drop.
fn init_tracing(verbose: bool) -> Option<WorkerGuard> {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    match std::env::var("EMAIL_AGENT_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "email-agent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
            None
        }
    }
}

fn orchestrator(
    config: &PipelineConfig,
    store: Arc<dyn Database>,
    http: &reqwest::Client,
) -> anyhow::Result<Orchestrator> {
    let analyzer = analyzer(config)?.context("OPENAI_API_KEY is not set")?;
    let reconciler = reconciler(http)?.context("GOOGLE_TASKS_ACCESS_TOKEN is not set")?;
    let mut orchestrator = Orchestrator::new(config.clone(), store, analyzer, reconciler);
    if let Some(source) = source()? {
        orchestrator = orchestrator.with_source(source);
    }
    Ok(orchestrator)
}

fn analyzer(config: &PipelineConfig) -> anyhow::Result<Option<Arc<dyn AnalysisEngine>>> {
    if std::env::var("OPENAI_API_KEY").is_err() {
        return Ok(None);
    }
    let llm_config = LlmConfig::from_env()?;
    let llm = create_provider(&llm_config, config.call_timeout)?;
    let limiter = Arc::new(MinIntervalLimiter::new(config.min_call_spacing));
    Ok(Some(Arc::new(LlmAnalyzer::new(llm, limiter)) as Arc<dyn AnalysisEngine>))
}

fn reconciler(http: &reqwest::Client) -> anyhow::Result<Option<Arc<dyn TaskReconciler>>> {
    Ok(TasksConfig::from_env()?.map(|cfg| {
        Arc::new(GoogleTasksReconciler::from_config(&cfg, http.clone())) as Arc<dyn TaskReconciler>
    }))
}

fn source() -> anyhow::Result<Option<Arc<dyn SourceConnector>>> {
    Ok(ImapConfig::from_env()?
        .map(|cfg| Arc::new(ImapSource::new(cfg)) as Arc<dyn SourceConnector>))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
