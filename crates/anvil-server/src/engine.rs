//! Workflow state machine.
//!
//! The engine is a pure transition function over the runtime plan and the
//! cursor; the database layer commits whatever it produces atomically
//! together with the event append. Keeping it free of I/O makes every
//! ordering and fallback rule directly testable.

use anvil_common::models::{ActionReport, ActionState, PlanAction, PlanTask, WorkflowState};
use anvil_common::{Error, Result};

/// The mutable execution state of one workflow. `cursor_task` and
/// `cursor_action` index into `plan`, which starts as the flattened
/// rendered plan and grows when a failure or timeout splices follow-up
/// actions in.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineState {
    pub state: WorkflowState,
    pub action_state: ActionState,
    pub cursor_task: usize,
    pub cursor_action: usize,
    pub current_action_index: i64,
    pub total_actions: i64,
    pub plan: Vec<PlanTask>,
}

enum Fallback {
    Failure,
    Timeout,
}

impl EngineState {
    /// Initial state for a freshly created workflow.
    pub fn new(plan: Vec<PlanTask>) -> Self {
        let total_actions = plan.iter().map(|t| t.actions.len() as i64).sum();
        Self {
            state: WorkflowState::Pending,
            action_state: ActionState::Pending,
            cursor_task: 0,
            cursor_action: 0,
            current_action_index: 0,
            total_actions,
            plan,
        }
    }

    pub fn current_task(&self) -> &PlanTask {
        &self.plan[self.cursor_task]
    }

    pub fn current_action(&self) -> &PlanAction {
        &self.plan[self.cursor_task].actions[self.cursor_action]
    }

    /// Apply a worker report. On error the state is unchanged and no
    /// event must be written.
    pub fn apply(&mut self, report: &ActionReport) -> Result<()> {
        if self.state.is_terminal() {
            return Err(Error::AlreadyTerminal(self.describe_cursor()));
        }

        let cursor_matches =
            report.task_index == self.cursor_task && report.action_index == self.cursor_action;

        match self.state {
            WorkflowState::Pending => {
                // The only way out of Pending is the first action of the
                // first task starting to run.
                if report.action_status == ActionState::Running && cursor_matches {
                    self.check_names(report)?;
                    self.state = WorkflowState::Running;
                    self.action_state = ActionState::Running;
                    Ok(())
                } else {
                    Err(Error::OutOfOrder(format!(
                        "workflow is pending, expected ({}, {}) RUNNING, got ({}, {}) {}",
                        self.cursor_task,
                        self.cursor_action,
                        report.task_index,
                        report.action_index,
                        report.action_status
                    )))
                }
            }
            WorkflowState::Running => {
                if !cursor_matches {
                    return Err(Error::OutOfOrder(format!(
                        "expected cursor ({}, {}), got ({}, {})",
                        self.cursor_task,
                        self.cursor_action,
                        report.task_index,
                        report.action_index
                    )));
                }
                self.check_names(report)?;

                match report.action_status {
                    ActionState::Pending => Err(Error::InvalidArgument(
                        "a worker cannot report an action as pending".to_string(),
                    )),
                    ActionState::Running => match self.action_state {
                        ActionState::Pending => {
                            self.action_state = ActionState::Running;
                            Ok(())
                        }
                        // Idempotent duplicate from a retrying worker.
                        ActionState::Running => Ok(()),
                        _ => Err(Error::OutOfOrder(self.describe_cursor())),
                    },
                    ActionState::Success => {
                        self.advance();
                        Ok(())
                    }
                    ActionState::Failed => self.fall_back(Fallback::Failure),
                    ActionState::Timeout => self.fall_back(Fallback::Timeout),
                }
            }
            _ => unreachable!("terminal states handled above"),
        }
    }

    fn check_names(&self, report: &ActionReport) -> Result<()> {
        let task = self.current_task();
        let action = self.current_action();
        if report.task_name != task.name || report.action_name != action.name {
            return Err(Error::InvalidArgument(format!(
                "report names ({}, {}) do not match the plan at the cursor ({}, {})",
                report.task_name, report.action_name, task.name, action.name
            )));
        }
        Ok(())
    }

    /// Move past a successfully completed action: either to the next
    /// action (next task when the current one is exhausted) or to the
    /// terminal Success state.
    fn advance(&mut self) {
        let last_action = self.cursor_action + 1 >= self.current_task().actions.len();
        let last_task = self.cursor_task + 1 >= self.plan.len();

        if last_action && last_task {
            self.state = WorkflowState::Success;
            self.action_state = ActionState::Success;
            self.current_action_index = self.total_actions;
            return;
        }

        if last_action {
            self.cursor_task += 1;
            self.cursor_action = 0;
        } else {
            self.cursor_action += 1;
        }
        self.action_state = ActionState::Pending;
        self.current_action_index += 1;
    }

    /// A failed or timed-out action either splices its follow-up actions
    /// in after the cursor or terminates the workflow, preserving the
    /// failing cursor for diagnostics.
    fn fall_back(&mut self, kind: Fallback) -> Result<()> {
        let follow_ups = match kind {
            Fallback::Failure => self.current_action().on_failure.clone(),
            Fallback::Timeout => self.current_action().on_timeout.clone(),
        };

        if follow_ups.is_empty() {
            match kind {
                Fallback::Failure => {
                    self.state = WorkflowState::Failed;
                    self.action_state = ActionState::Failed;
                }
                Fallback::Timeout => {
                    self.state = WorkflowState::Timeout;
                    self.action_state = ActionState::Timeout;
                }
            }
            return Ok(());
        }

        // Follow-up names are validated at parse time to resolve within
        // the task; a miss here means the persisted plan is corrupt.
        let task = &self.plan[self.cursor_task];
        let mut spliced = Vec::with_capacity(follow_ups.len());
        for name in &follow_ups {
            let def = task
                .actions
                .iter()
                .find(|a| &a.name == name)
                .ok_or_else(|| {
                    Error::Internal(format!(
                        "follow-up action {} not found in task {}",
                        name, task.name
                    ))
                })?;
            spliced.push(def.clone());
        }

        let count = spliced.len() as i64;
        let insert_at = self.cursor_action + 1;
        self.plan[self.cursor_task]
            .actions
            .splice(insert_at..insert_at, spliced);
        self.total_actions += count;
        self.cursor_action += 1;
        self.current_action_index += 1;
        self.action_state = ActionState::Pending;
        Ok(())
    }

    fn describe_cursor(&self) -> String {
        format!(
            "{}/{} at ({}, {})",
            self.current_task().name,
            self.current_action().name,
            self.cursor_task,
            self.cursor_action
        )
    }
}

/// Flatten a rendered template plan into the runtime form: task-level
/// volumes and environment are folded into every contained action, with
/// action-level values taking precedence.
pub fn runtime_plan(plan: &anvil_template::WorkflowPlan) -> Vec<PlanTask> {
    plan.tasks
        .iter()
        .map(|task| PlanTask {
            name: task.name.clone(),
            worker_addr: task.worker.clone(),
            actions: task
                .actions
                .iter()
                .map(|action| {
                    let mut environment = task.environment.clone();
                    environment.extend(action.environment.clone());

                    let mut volumes = task.volumes.clone();
                    volumes.extend(action.volumes.iter().cloned());

                    PlanAction {
                        name: action.name.clone(),
                        image: action.image.clone(),
                        timeout: action.timeout.unwrap_or(0),
                        command: action.command.clone(),
                        volumes,
                        environment,
                        pid: action.pid.clone(),
                        on_timeout: action.on_timeout.clone(),
                        on_failure: action.on_failure.clone(),
                    }
                })
                .collect(),
        })
        .collect()
}
