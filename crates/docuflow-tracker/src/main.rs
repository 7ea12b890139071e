/*
[INPUT]:  CLI arguments, YAML configuration file, OS shutdown signals
[OUTPUT]: Resumed + newly attached tasks followed to their terminal states
[POS]:    Binary entry point
[UPDATE]: When changing CLI flags, startup flow, or shutdown handling
*/

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use docuflow_tracker::{
    BatchContext, DurableTaskStore, ProgressRegistry, SharedPushChannel, TaskInfo, TaskOutcome,
    TaskTracker, TrackerConfig, restore_pending_tasks,
};

#[derive(Parser, Debug)]
#[command(name = "docuflow-tracker", version, about = "Docuflow task progress tracker")]
struct Cli {
    #[arg(long = "config", value_name = "PATH")]
    config_path: Option<PathBuf>,
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    log_level: String,
    /// Begin tracking a fresh task, as TASK_ID=FILE_NAME (repeatable)
    #[arg(long = "attach", value_name = "TASK_ID=FILE_NAME")]
    attach: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(&args.log_level)?;

    let config = load_config(args.config_path.as_deref())?;
    info!(ws_url = %config.ws_url, "starting docuflow-tracker");

    let store_path = match &config.store_path {
        Some(path) => path.clone(),
        None => DurableTaskStore::default_path().context("resolve task store path")?,
    };

    let registry = Arc::new(ProgressRegistry::new());
    let store = Arc::new(DurableTaskStore::open(store_path).await);
    let channel = SharedPushChannel::new(config.ws_url.clone());
    let tracker = Arc::new(TaskTracker::new(
        registry.clone(),
        store,
        Arc::new(channel.clone()),
    ));

    let restored = restore_pending_tasks(tracker.clone()).await;
    if restored.is_empty() {
        info!("no persisted tasks to resume");
    } else {
        info!(count = restored.tasks.len(), "resumed persisted tasks");
    }

    let attachments = parse_attachments(&args.attach)?;
    let attach_batch = Arc::new(BatchContext::new(attachments.len()));
    let mut tracked = restored.tasks;
    for info in attachments {
        let tracker = tracker.clone();
        let batch = attach_batch.clone();
        tracked.push(tokio::spawn(async move {
            tracker.track_task(info, batch, false).await
        }));
    }

    if tracked.is_empty() {
        info!("nothing to track; exiting");
        channel.shutdown().await;
        return Ok(());
    }

    let follow_all = async {
        let mut outcomes = Vec::new();
        for task in tracked {
            match task.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => warn!(error = %err, "tracking task aborted"),
            }
        }
        outcomes
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            // Durable handles stay on disk; the next run resumes them.
            info!("interrupted; pending tasks will resume on next start");
        }
        outcomes = follow_all => {
            report_outcomes(&outcomes);
        }
    }

    channel.shutdown().await;
    Ok(())
}

fn init_tracing(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level).context("invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|err| anyhow!(err))
        .context("initialize tracing subscriber")?;
    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<TrackerConfig> {
    match path {
        Some(path) => {
            let path_str = path.to_str().context("config path must be valid utf-8")?;
            TrackerConfig::from_file(path_str).context("load config")
        }
        None => Ok(TrackerConfig::default()),
    }
}

fn parse_attachments(entries: &[String]) -> Result<Vec<TaskInfo>> {
    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let (task_id, file_name) = entry
                .split_once('=')
                .ok_or_else(|| anyhow!("--attach expects TASK_ID=FILE_NAME, got {entry:?}"))?;
            if task_id.is_empty() || file_name.is_empty() {
                return Err(anyhow!("--attach expects TASK_ID=FILE_NAME, got {entry:?}"));
            }
            Ok(TaskInfo {
                task_id: task_id.to_string(),
                document_id: None,
                file_name: file_name.to_string(),
                batch_index: index as u32 + 1,
            })
        })
        .collect()
}

fn report_outcomes(outcomes: &[TaskOutcome]) {
    let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
    for outcome in outcomes {
        match outcome {
            TaskOutcome::Completed {
                document_id,
                file_name,
                ..
            } => {
                info!(
                    file_name = %file_name,
                    document_id = document_id.as_deref().unwrap_or("-"),
                    "✓ uploaded"
                );
            }
            TaskOutcome::Failed {
                error, file_name, ..
            } => {
                warn!(file_name = %file_name, %error, "✗ failed");
            }
        }
    }
    info!(
        succeeded,
        failed = outcomes.len() - succeeded,
        total = outcomes.len(),
        "tracking finished"
    );
}
