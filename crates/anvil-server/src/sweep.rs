//! Background timeout sweep.
//!
//! Workers can disappear mid-action, so the server watches the clock on
//! their behalf: an action that has been RUNNING longer than its timeout
//! gets a self-generated Timeout report through the normal report path
//! (so fallback splicing and event append behave exactly as if a worker
//! had reported it), and a workflow past its global timeout is terminated
//! outright.

use crate::db::Db;
use anvil_common::models::{ActionReport, ActionState, WorkflowState};
use anvil_common::{Error, Result};
use chrono::Utc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Spawn the sweep loop. It runs until the shutdown channel fires.
pub fn start(
    db: Db,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!("starting timeout sweep with interval of {:?}", interval);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = sweep_once(&db).await {
                        error!("timeout sweep failed: {}", e);
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("shutdown signal received, stopping timeout sweep");
                    break;
                }
            }
        }
    })
}

/// One pass over every non-terminal workflow.
pub async fn sweep_once(db: &Db) -> Result<()> {
    let now = Utc::now();
    for candidate in db.sweep_candidates().await? {
        // Global timeout counts from creation and fires regardless of
        // action progress.
        if candidate.global_timeout > 0 {
            let elapsed = (now - candidate.created_at).num_seconds();
            if elapsed > candidate.global_timeout as i64 {
                info!(
                    workflow = %candidate.id,
                    elapsed,
                    "workflow exceeded its global timeout"
                );
                db.expire_workflow(
                    candidate.id,
                    elapsed,
                    "workflow global timeout exceeded",
                )
                .await?;
                continue;
            }
        }

        // Per-action timeout applies only while an action is in flight;
        // a timeout of zero means the action may run forever.
        if candidate.state != WorkflowState::Running
            || candidate.action_state != ActionState::Running
            || candidate.action_timeout == 0
        {
            continue;
        }

        let started_at = match db.last_running_event_at(candidate.id).await? {
            Some(ts) => ts,
            None => continue,
        };
        let elapsed = (now - started_at).num_seconds();
        if elapsed <= candidate.action_timeout as i64 {
            continue;
        }

        debug!(
            workflow = %candidate.id,
            action = %candidate.current_action,
            elapsed,
            timeout = candidate.action_timeout,
            "action exceeded its timeout, self-reporting"
        );
        let report = ActionReport {
            worker_id: candidate.current_worker.clone(),
            task_name: candidate.current_task.clone(),
            action_name: candidate.current_action.clone(),
            action_status: ActionState::Timeout,
            seconds: elapsed,
            message: format!(
                "action timed out after {}s (timeout {}s)",
                elapsed, candidate.action_timeout
            ),
            task_index: candidate.cursor_task,
            action_index: candidate.cursor_action,
        };
        match db.report_action_status(candidate.id, &report).await {
            Ok(_) => {}
            // A worker report can race the sweep; losing that race is
            // not an error.
            Err(Error::OutOfOrder(_)) | Err(Error::AlreadyTerminal(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
