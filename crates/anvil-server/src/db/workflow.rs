//! Workflow store: creation, dispatch projections, report transactions,
//! the event log and the per-workflow data blob.

use super::{db_err, is_busy, now, parse_opt_ts, parse_ts, uuid_from_bytes, Db};
use crate::engine::{runtime_plan, EngineState};
use anvil_common::models::{
    ActionReport, ActionState, PlanTask, Workflow, WorkflowActionEntry, WorkflowContext,
    WorkflowEvent, WorkflowState,
};
use anvil_common::net::normalize_worker_addr;
use anvil_common::{Error, Result};
use anvil_template::TemplateError;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

/// A Running workflow as the timeout sweep sees it.
#[derive(Debug, Clone)]
pub struct SweepCandidate {
    pub id: Uuid,
    pub state: WorkflowState,
    pub action_state: ActionState,
    pub created_at: DateTime<Utc>,
    pub global_timeout: u64,
    pub current_worker: String,
    pub current_task: String,
    pub current_action: String,
    pub cursor_task: usize,
    pub cursor_action: usize,
    pub action_timeout: u64,
}

impl Db {
    /// Create a workflow: render the template against the hardware
    /// record, then persist the plan, the initial state and the worker
    /// index rows in a single transaction.
    pub async fn create_workflow(&self, template_id: Uuid, hardware_id: &str) -> Result<Workflow> {
        let template = self.get_template(&template_id.to_string(), false).await?;
        let hardware = self.hardware_by_id(hardware_id).await?;
        if hardware.deleted_at.is_some() {
            return Err(Error::NotFound(format!("hardware {}", hardware_id)));
        }

        let (parsed, rendered_yaml) =
            anvil_template::render(&template.id.to_string(), &template.data, &hardware.data)
                .map_err(template_err)?;
        let global_timeout = parsed.global_timeout.unwrap_or(0);
        let plan = runtime_plan(&parsed);

        let workers: BTreeSet<String> = plan
            .iter()
            .map(|t| normalize_worker_addr(&t.worker_addr))
            .collect();

        let id = Uuid::new_v4();
        let engine = EngineState::new(plan);

        let mut attempt = 0;
        let mut delay = RETRY_BASE_DELAY;
        loop {
            let result = self
                .try_insert_workflow(id, template_id, hardware_id, &engine, &rendered_yaml,
                    global_timeout, &workers)
                .await;
            match result {
                Err(e) if is_busy(&e) && attempt < RETRY_ATTEMPTS => {
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
                Ok(()) => return self.get_workflow(id).await,
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn try_insert_workflow(
        &self,
        id: Uuid,
        template_id: Uuid,
        hardware_id: &str,
        engine: &EngineState,
        rendered_yaml: &str,
        global_timeout: u64,
        workers: &BTreeSet<String>,
    ) -> Result<()> {
        let plan_json = serde_json::to_string(&engine.plan)
            .map_err(|e| Error::Internal(format!("serializing plan: {}", e)))?;
        let ts = now();

        let mut tx = self.pool().begin().await.map_err(db_err)?;
        sqlx::query(
            "INSERT INTO workflows (id, template_id, hardware_id, state, rendered_yaml, plan, \
             global_timeout, current_worker, current_task, current_action, \
             current_action_state, cursor_task, cursor_action, current_action_index, \
             total_actions, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0, 0, ?, ?, ?)",
        )
        .bind(id.as_bytes().to_vec())
        .bind(template_id.as_bytes().to_vec())
        .bind(hardware_id)
        .bind(engine.state.as_str())
        .bind(rendered_yaml)
        .bind(&plan_json)
        .bind(global_timeout as i64)
        .bind(&engine.current_task().worker_addr)
        .bind(&engine.current_task().name)
        .bind(&engine.current_action().name)
        .bind(engine.action_state.as_str())
        .bind(engine.total_actions)
        .bind(&ts)
        .bind(&ts)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        for worker in workers {
            sqlx::query(
                "INSERT INTO workflow_workers (worker_addr, workflow_id) VALUES (?, ?)",
            )
            .bind(worker)
            .bind(id.as_bytes().to_vec())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    pub async fn get_workflow(&self, id: Uuid) -> Result<Workflow> {
        let row = sqlx::query("SELECT * FROM workflows WHERE id = ?")
            .bind(id.as_bytes().to_vec())
            .fetch_optional(self.pool())
            .await
            .map_err(db_err)?;
        row.map(row_to_workflow)
            .transpose()?
            .ok_or_else(|| Error::NotFound(format!("workflow {}", id)))
    }

    /// Non-deleted workflows ordered by creation time.
    pub async fn list_workflows(&self) -> Result<Vec<Workflow>> {
        let rows = sqlx::query(
            "SELECT * FROM workflows WHERE deleted_at IS NULL ORDER BY created_at, id",
        )
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;
        rows.into_iter().map(row_to_workflow).collect()
    }

    /// Soft-delete a workflow and prune its worker index rows.
    pub async fn delete_workflow(&self, id: Uuid) -> Result<()> {
        let ts = now();
        let mut tx = self.pool().begin().await.map_err(db_err)?;
        let result = sqlx::query(
            "UPDATE workflows SET deleted_at = ?, updated_at = ? \
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(&ts)
        .bind(&ts)
        .bind(id.as_bytes().to_vec())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("workflow {}", id)));
        }
        sqlx::query("DELETE FROM workflow_workers WHERE workflow_id = ?")
            .bind(id.as_bytes().to_vec())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    /// Non-terminal workflows a worker participates in, by its own
    /// MAC or IP.
    pub async fn workflows_for_worker(&self, worker: &str) -> Result<Vec<Uuid>> {
        let addr = normalize_worker_addr(worker);
        let rows = sqlx::query(
            "SELECT w.id FROM workflows w \
             JOIN workflow_workers ww ON ww.workflow_id = w.id \
             WHERE ww.worker_addr = ? AND w.deleted_at IS NULL \
               AND w.state IN ('PENDING', 'RUNNING') \
             ORDER BY w.created_at",
        )
        .bind(&addr)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;
        rows.iter()
            .map(|r| {
                let id: Vec<u8> = r.get("id");
                uuid_from_bytes(&id)
            })
            .collect()
    }

    pub async fn workflow_context(&self, id: Uuid) -> Result<WorkflowContext> {
        let wf = self.get_workflow(id).await?;
        Ok(WorkflowContext {
            workflow_id: wf.id,
            current_worker: wf.current_worker,
            current_task: wf.current_task,
            current_action: wf.current_action,
            current_action_index: wf.current_action_index,
            current_action_state: wf.current_action_state,
            total_number_of_actions: wf.total_number_of_actions,
        })
    }

    /// The full ordered action list a worker needs to execute its share
    /// of the workflow.
    pub async fn workflow_actions(&self, id: Uuid) -> Result<Vec<WorkflowActionEntry>> {
        let plan = self.load_plan(id).await?;
        let mut entries = Vec::new();
        for (task_index, task) in plan.iter().enumerate() {
            for (action_index, action) in task.actions.iter().enumerate() {
                entries.push(WorkflowActionEntry {
                    task_name: task.name.clone(),
                    worker_addr: task.worker_addr.clone(),
                    task_index,
                    action_index,
                    action: action.clone(),
                });
            }
        }
        Ok(entries)
    }

    /// Apply a worker report: state transition, event append and row
    /// update commit atomically, with bounded backoff on lock conflicts.
    pub async fn report_action_status(
        &self,
        id: Uuid,
        report: &ActionReport,
    ) -> Result<WorkflowContext> {
        let mut attempt = 0;
        let mut delay = RETRY_BASE_DELAY;
        loop {
            match self.try_report(id, report).await {
                Err(e) if is_busy(&e) && attempt < RETRY_ATTEMPTS => {
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                other => return other,
            }
        }
    }

    async fn try_report(&self, id: Uuid, report: &ActionReport) -> Result<WorkflowContext> {
        let mut tx = self.pool().begin().await.map_err(db_err)?;
        let row = sqlx::query("SELECT * FROM workflows WHERE id = ? AND deleted_at IS NULL")
            .bind(id.as_bytes().to_vec())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| Error::NotFound(format!("workflow {}", id)))?;

        let mut engine = engine_from_row(&row)?;
        // A rejected report rolls the transaction back: no state change,
        // no event.
        engine.apply(report)?;

        let plan_json = serde_json::to_string(&engine.plan)
            .map_err(|e| Error::Internal(format!("serializing plan: {}", e)))?;
        let ts = now();
        sqlx::query(
            "UPDATE workflows SET state = ?, plan = ?, current_worker = ?, current_task = ?, \
             current_action = ?, current_action_state = ?, cursor_task = ?, cursor_action = ?, \
             current_action_index = ?, total_actions = ?, updated_at = ? WHERE id = ?",
        )
        .bind(engine.state.as_str())
        .bind(&plan_json)
        .bind(&engine.current_task().worker_addr)
        .bind(&engine.current_task().name)
        .bind(&engine.current_action().name)
        .bind(engine.action_state.as_str())
        .bind(engine.cursor_task as i64)
        .bind(engine.cursor_action as i64)
        .bind(engine.current_action_index)
        .bind(engine.total_actions)
        .bind(&ts)
        .bind(id.as_bytes().to_vec())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "INSERT INTO workflow_events (workflow_id, worker_id, task_name, action_name, \
             action_status, seconds, message, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.as_bytes().to_vec())
        .bind(&report.worker_id)
        .bind(&report.task_name)
        .bind(&report.action_name)
        .bind(report.action_status.as_str())
        .bind(report.seconds)
        .bind(&report.message)
        .bind(&ts)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        Ok(WorkflowContext {
            workflow_id: id,
            current_worker: engine.current_task().worker_addr.clone(),
            current_task: engine.current_task().name.clone(),
            current_action: engine.current_action().name.clone(),
            current_action_index: engine.current_action_index,
            current_action_state: engine.action_state,
            total_number_of_actions: engine.total_actions,
        })
    }

    /// Event log in insertion order.
    pub async fn workflow_events(&self, id: Uuid) -> Result<Vec<WorkflowEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_events WHERE workflow_id = ? ORDER BY id",
        )
        .bind(id.as_bytes().to_vec())
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;
        rows.into_iter().map(row_to_event).collect()
    }

    pub async fn workflow_data(&self, id: Uuid) -> Result<(Vec<u8>, i64)> {
        let row = sqlx::query(
            "SELECT data_blob, data_version FROM workflows WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(id.as_bytes().to_vec())
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)?
        .ok_or_else(|| Error::NotFound(format!("workflow {}", id)))?;
        Ok((row.get("data_blob"), row.get("data_version")))
    }

    /// Compare-and-swap write of the workflow data blob. The version
    /// bumps by exactly one on success; a stale expected version fails
    /// without writing.
    pub async fn put_workflow_data(
        &self,
        id: Uuid,
        data: Vec<u8>,
        expected_version: i64,
    ) -> Result<i64> {
        let result = sqlx::query(
            "UPDATE workflows SET data_blob = ?, data_version = data_version + 1, \
             updated_at = ? WHERE id = ? AND deleted_at IS NULL AND data_version = ?",
        )
        .bind(&data)
        .bind(now())
        .bind(id.as_bytes().to_vec())
        .bind(expected_version)
        .execute(self.pool())
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            let (_, found) = self.workflow_data(id).await?;
            return Err(Error::VersionConflict {
                expected: expected_version,
                found,
            });
        }
        Ok(expected_version + 1)
    }

    /// Workflows the timeout sweep needs to look at: every non-terminal,
    /// non-deleted workflow, with the current action's timeout resolved
    /// from the plan.
    pub async fn sweep_candidates(&self) -> Result<Vec<SweepCandidate>> {
        let rows = sqlx::query(
            "SELECT * FROM workflows \
             WHERE deleted_at IS NULL AND state IN ('PENDING', 'RUNNING')",
        )
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in rows {
            let id: Vec<u8> = row.get("id");
            let state: String = row.get("state");
            let action_state: String = row.get("current_action_state");
            let created_at: String = row.get("created_at");
            let plan_json: String = row.get("plan");
            let plan: Vec<PlanTask> = serde_json::from_str(&plan_json)
                .map_err(|e| Error::Internal(format!("bad plan json: {}", e)))?;
            let cursor_task: i64 = row.get("cursor_task");
            let cursor_action: i64 = row.get("cursor_action");
            let action_timeout = plan
                .get(cursor_task as usize)
                .and_then(|t| t.actions.get(cursor_action as usize))
                .map(|a| a.timeout)
                .unwrap_or(0);
            let global_timeout: i64 = row.get("global_timeout");

            candidates.push(SweepCandidate {
                id: uuid_from_bytes(&id)?,
                state: WorkflowState::parse(&state)
                    .ok_or_else(|| Error::Internal(format!("bad workflow state: {}", state)))?,
                action_state: ActionState::parse(&action_state)
                    .ok_or_else(|| Error::Internal(format!("bad action state: {}", action_state)))?,
                created_at: parse_ts(&created_at)?,
                global_timeout: global_timeout as u64,
                current_worker: row.get("current_worker"),
                current_task: row.get("current_task"),
                current_action: row.get("current_action"),
                cursor_task: cursor_task as usize,
                cursor_action: cursor_action as usize,
                action_timeout,
            });
        }
        Ok(candidates)
    }

    /// Timestamp of the newest RUNNING event, i.e. when the in-flight
    /// action last (re)started.
    pub async fn last_running_event_at(&self, id: Uuid) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT created_at FROM workflow_events \
             WHERE workflow_id = ? AND action_status = 'RUNNING' \
             ORDER BY id DESC LIMIT 1",
        )
        .bind(id.as_bytes().to_vec())
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)?;
        match row {
            Some(row) => {
                let ts: String = row.get("created_at");
                Ok(Some(parse_ts(&ts)?))
            }
            None => Ok(None),
        }
    }

    /// Terminate a workflow whose global timeout expired, regardless of
    /// action progress. A no-op when the workflow already terminated.
    pub async fn expire_workflow(&self, id: Uuid, seconds: i64, message: &str) -> Result<()> {
        let mut tx = self.pool().begin().await.map_err(db_err)?;
        let row = sqlx::query(
            "SELECT state, current_worker, current_task, current_action FROM workflows \
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(id.as_bytes().to_vec())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| Error::NotFound(format!("workflow {}", id)))?;

        let state: String = row.get("state");
        let state = WorkflowState::parse(&state)
            .ok_or_else(|| Error::Internal(format!("bad workflow state: {}", state)))?;
        if state.is_terminal() {
            return Ok(());
        }
        let worker: String = row.get("current_worker");
        let task: String = row.get("current_task");
        let action: String = row.get("current_action");

        let ts = now();
        sqlx::query(
            "UPDATE workflows SET state = 'TIMEOUT', current_action_state = 'TIMEOUT', \
             updated_at = ? WHERE id = ?",
        )
        .bind(&ts)
        .bind(id.as_bytes().to_vec())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "INSERT INTO workflow_events (workflow_id, worker_id, task_name, action_name, \
             action_status, seconds, message, created_at) VALUES (?, ?, ?, ?, 'TIMEOUT', ?, ?, ?)",
        )
        .bind(id.as_bytes().to_vec())
        .bind(&worker)
        .bind(&task)
        .bind(&action)
        .bind(seconds)
        .bind(message)
        .bind(&ts)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn load_plan(&self, id: Uuid) -> Result<Vec<PlanTask>> {
        let row = sqlx::query("SELECT plan FROM workflows WHERE id = ? AND deleted_at IS NULL")
            .bind(id.as_bytes().to_vec())
            .fetch_optional(self.pool())
            .await
            .map_err(db_err)?
            .ok_or_else(|| Error::NotFound(format!("workflow {}", id)))?;
        let plan: String = row.get("plan");
        serde_json::from_str(&plan).map_err(|e| Error::Internal(format!("bad plan json: {}", e)))
    }
}

fn template_err(e: TemplateError) -> Error {
    match e {
        TemplateError::Render {
            template_id,
            reason,
        } => Error::Render {
            template_id,
            reason,
        },
        TemplateError::EmptyWorkerAddr { template_id, task } => Error::Render {
            template_id,
            reason: format!("empty worker address for task {}", task),
        },
        other => Error::Parse(other.to_string()),
    }
}

fn engine_from_row(row: &SqliteRow) -> Result<EngineState> {
    let state: String = row.get("state");
    let action_state: String = row.get("current_action_state");
    let plan_json: String = row.get("plan");
    let cursor_task: i64 = row.get("cursor_task");
    let cursor_action: i64 = row.get("cursor_action");
    Ok(EngineState {
        state: WorkflowState::parse(&state)
            .ok_or_else(|| Error::Internal(format!("bad workflow state: {}", state)))?,
        action_state: ActionState::parse(&action_state)
            .ok_or_else(|| Error::Internal(format!("bad action state: {}", action_state)))?,
        cursor_task: cursor_task as usize,
        cursor_action: cursor_action as usize,
        current_action_index: row.get("current_action_index"),
        total_actions: row.get("total_actions"),
        plan: serde_json::from_str(&plan_json)
            .map_err(|e| Error::Internal(format!("bad plan json: {}", e)))?,
    })
}

fn row_to_workflow(row: SqliteRow) -> Result<Workflow> {
    let id: Vec<u8> = row.get("id");
    let template_id: Vec<u8> = row.get("template_id");
    let state: String = row.get("state");
    let action_state: String = row.get("current_action_state");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");
    let deleted_at: Option<String> = row.get("deleted_at");
    Ok(Workflow {
        id: uuid_from_bytes(&id)?,
        template_id: uuid_from_bytes(&template_id)?,
        hardware_id: row.get("hardware_id"),
        state: WorkflowState::parse(&state)
            .ok_or_else(|| Error::Internal(format!("bad workflow state: {}", state)))?,
        current_worker: row.get("current_worker"),
        current_task: row.get("current_task"),
        current_action: row.get("current_action"),
        current_action_state: ActionState::parse(&action_state)
            .ok_or_else(|| Error::Internal(format!("bad action state: {}", action_state)))?,
        current_action_index: row.get("current_action_index"),
        total_number_of_actions: row.get("total_actions"),
        data_version: row.get("data_version"),
        rendered_yaml: row.get("rendered_yaml"),
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
        deleted_at: parse_opt_ts(deleted_at)?,
    })
}

fn row_to_event(row: SqliteRow) -> Result<WorkflowEvent> {
    let id: Vec<u8> = row.get("workflow_id");
    let status: String = row.get("action_status");
    let created_at: String = row.get("created_at");
    Ok(WorkflowEvent {
        workflow_id: uuid_from_bytes(&id)?,
        worker_id: row.get("worker_id"),
        task_name: row.get("task_name"),
        action_name: row.get("action_name"),
        action_status: ActionState::parse(&status)
            .ok_or_else(|| Error::Internal(format!("bad action status: {}", status)))?,
        seconds: row.get("seconds"),
        message: row.get("message"),
        created_at: parse_ts(&created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TEMPLATE: &str = r#"
version: "0.1"
name: provision
tasks:
  - name: install
    worker: "{{ device_1 }}"
    actions:
      - name: stream-image
        image: quay.io/anvil/image2disk:v1
        timeout: 600
      - name: kexec
        image: quay.io/anvil/kexec:v1
"#;

    fn hardware_doc() -> serde_json::Value {
        json!({
            "id": "hw-1",
            "device_1": "aa:bb:cc:00:11:22",
            "network": {
                "interfaces": [
                    {"dhcp": {"mac": "aa:bb:cc:00:11:22", "ip": {"address": "10.0.0.7"}}}
                ]
            }
        })
    }

    async fn setup() -> (Db, Workflow) {
        let db = Db::open_in_memory().await.unwrap();
        let tmpl = db.create_template("provision", TEMPLATE).await.unwrap();
        db.push_hardware(hardware_doc()).await.unwrap();
        let wf = db.create_workflow(tmpl.id, "hw-1").await.unwrap();
        (db, wf)
    }

    fn report_at(
        task_index: usize,
        action_index: usize,
        action_name: &str,
        status: ActionState,
    ) -> ActionReport {
        ActionReport {
            worker_id: "aa:bb:cc:00:11:22".into(),
            task_name: "install".into(),
            action_name: action_name.into(),
            action_status: status,
            seconds: 1,
            message: String::new(),
            task_index,
            action_index,
        }
    }

    #[tokio::test]
    async fn test_create_workflow_initial_state() {
        let (db, wf) = setup().await;
        assert_eq!(wf.state, WorkflowState::Pending);
        assert_eq!(wf.current_action, "stream-image");
        assert_eq!(wf.current_action_index, 0);
        assert_eq!(wf.total_number_of_actions, 2);
        assert_eq!(wf.data_version, 0);

        // The persisted rendered yaml re-parses and is fully grounded.
        let plan = anvil_template::parse(&wf.rendered_yaml).unwrap();
        assert!(plan.tasks.iter().all(|t| !t.worker.is_empty()));

        // Worker index rows were seeded in the same transaction.
        let assigned = db
            .workflows_for_worker("AA:BB:CC:00:11:22")
            .await
            .unwrap();
        assert_eq!(assigned, vec![wf.id]);
    }

    #[tokio::test]
    async fn test_create_workflow_render_failure_creates_nothing() {
        let db = Db::open_in_memory().await.unwrap();
        let body = TEMPLATE.replace("{{ device_1 }}", "{{ network.unknown }}");
        let tmpl = db.create_template("broken", &body).await.unwrap();
        db.push_hardware(hardware_doc()).await.unwrap();

        let err = db.create_workflow(tmpl.id, "hw-1").await.unwrap_err();
        match err {
            Error::Render { template_id, .. } => {
                assert_eq!(template_id, tmpl.id.to_string());
            }
            other => panic!("expected render error, got {other:?}"),
        }
        assert!(db.list_workflows().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_report_advances_and_logs_events() {
        let (db, wf) = setup().await;

        db.report_action_status(wf.id, &report_at(0, 0, "stream-image", ActionState::Running))
            .await
            .unwrap();
        let ctx = db
            .report_action_status(wf.id, &report_at(0, 0, "stream-image", ActionState::Success))
            .await
            .unwrap();
        assert_eq!(ctx.current_action, "kexec");
        assert_eq!(ctx.current_action_index, 1);

        db.report_action_status(wf.id, &report_at(0, 1, "kexec", ActionState::Running))
            .await
            .unwrap();
        db.report_action_status(wf.id, &report_at(0, 1, "kexec", ActionState::Success))
            .await
            .unwrap();

        let wf = db.get_workflow(wf.id).await.unwrap();
        assert_eq!(wf.state, WorkflowState::Success);
        assert_eq!(wf.current_action_index, 2);

        let events = db.workflow_events(wf.id).await.unwrap();
        assert_eq!(events.len(), 4);
        assert_eq!(events[0].action_status, ActionState::Running);
        assert_eq!(events[3].action_status, ActionState::Success);
        assert_eq!(events[3].action_name, "kexec");
    }

    #[tokio::test]
    async fn test_rejected_report_leaves_no_event() {
        let (db, wf) = setup().await;
        db.report_action_status(wf.id, &report_at(0, 0, "stream-image", ActionState::Running))
            .await
            .unwrap();

        // Cursor is (0, 0); a report at (0, 1) is out of order.
        let err = db
            .report_action_status(wf.id, &report_at(0, 1, "kexec", ActionState::Running))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OutOfOrder(_)));

        assert_eq!(db.workflow_events(wf.id).await.unwrap().len(), 1);
        let ctx = db.workflow_context(wf.id).await.unwrap();
        assert_eq!(ctx.current_action, "stream-image");
    }

    #[tokio::test]
    async fn test_terminal_workflow_rejects_reports() {
        let (db, wf) = setup().await;
        db.report_action_status(wf.id, &report_at(0, 0, "stream-image", ActionState::Running))
            .await
            .unwrap();
        db.report_action_status(wf.id, &report_at(0, 0, "stream-image", ActionState::Failed))
            .await
            .unwrap();

        let err = db
            .report_action_status(wf.id, &report_at(0, 0, "stream-image", ActionState::Running))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyTerminal(_)));

        // Terminal workflows no longer show up for their workers.
        assert!(db
            .workflows_for_worker("aa:bb:cc:00:11:22")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_workflow_actions_lists_full_plan() {
        let (db, wf) = setup().await;
        let actions = db.workflow_actions(wf.id).await.unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].action.name, "stream-image");
        assert_eq!(actions[0].worker_addr, "aa:bb:cc:00:11:22");
        assert_eq!(actions[1].action_index, 1);
        assert_eq!(actions[1].action.timeout, 0);
    }

    #[tokio::test]
    async fn test_data_blob_cas() {
        let (db, wf) = setup().await;

        let v1 = db
            .put_workflow_data(wf.id, b"facts-1".to_vec(), 0)
            .await
            .unwrap();
        assert_eq!(v1, 1);

        let err = db
            .put_workflow_data(wf.id, b"facts-2".to_vec(), 0)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::VersionConflict { expected: 0, found: 1 }
        ));

        let (data, version) = db.workflow_data(wf.id).await.unwrap();
        assert_eq!(data, b"facts-1");
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn test_delete_workflow_prunes_worker_index() {
        let (db, wf) = setup().await;
        db.delete_workflow(wf.id).await.unwrap();

        assert!(db
            .workflows_for_worker("aa:bb:cc:00:11:22")
            .await
            .unwrap()
            .is_empty());
        assert!(db.list_workflows().await.unwrap().is_empty());
        // The record itself survives for auditing.
        assert!(db.get_workflow(wf.id).await.unwrap().deleted_at.is_some());
    }
}
