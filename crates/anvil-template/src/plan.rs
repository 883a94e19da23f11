//! Workflow plan document: structure and validation.
//!
//! Parsing is strict: unknown fields are rejected so that a typoed key
//! fails at template creation instead of silently changing execution.

use crate::error::{TemplateError, MAX_NAME_LEN, REQUIRED_VERSION};
use crate::image;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// A workflow plan: ordered tasks, each an ordered list of actions bound
/// to a single worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WorkflowPlan {
    pub version: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_timeout: Option<u64>,
    pub tasks: Vec<Task>,
}

/// An ordered group of actions executed by one worker. Volumes and
/// environment declared here are inherited by every contained action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Task {
    pub name: String,
    pub worker: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    pub actions: Vec<Action>,
}

/// A container image invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Action {
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_timeout: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_failure: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<String>,
}

/// Parse a template YAML document into a validated plan.
pub fn parse(yaml: &str) -> crate::Result<WorkflowPlan> {
    let plan: WorkflowPlan = serde_yaml::from_str(yaml)?;
    validate(&plan)?;
    Ok(plan)
}

/// Serialize a plan back to YAML.
pub fn to_yaml(plan: &WorkflowPlan) -> crate::Result<String> {
    Ok(serde_yaml::to_string(plan)?)
}

fn check_name(field: &str, name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(TemplateError::EmptyName {
            field: field.to_string(),
        });
    }
    if name.len() >= MAX_NAME_LEN {
        return Err(TemplateError::NameTooLong {
            field: field.to_string(),
            name: name.to_string(),
        });
    }
    Ok(())
}

fn validate(plan: &WorkflowPlan) -> crate::Result<()> {
    check_name("name", &plan.name)?;

    if plan.version != REQUIRED_VERSION {
        return Err(TemplateError::InvalidVersion(plan.version.clone()));
    }

    if plan.tasks.is_empty() {
        return Err(TemplateError::NoTasks);
    }

    let mut task_names = HashSet::new();
    for task in &plan.tasks {
        check_name("task name", &task.name)?;
        if !task_names.insert(task.name.as_str()) {
            return Err(TemplateError::DuplicateTaskName(task.name.clone()));
        }

        if task.actions.is_empty() {
            return Err(TemplateError::NoActions(task.name.clone()));
        }

        let mut action_names = HashSet::new();
        for action in &task.actions {
            check_name("action name", &action.name)?;
            if !action_names.insert(action.name.as_str()) {
                return Err(TemplateError::DuplicateActionName(action.name.clone()));
            }

            image::parse_normalized(&action.image).map_err(|reason| {
                TemplateError::InvalidImage {
                    image: action.image.clone(),
                    reason,
                }
            })?;

            if let Some(pid) = &action.pid {
                if pid != "host" && pid != "container" {
                    return Err(TemplateError::InvalidPid {
                        action: action.name.clone(),
                        pid: pid.clone(),
                    });
                }
            }
        }

        // Follow-up lists must resolve within the task so that a
        // failure fallback can never dangle at runtime.
        for action in &task.actions {
            for name in action.on_timeout.iter().chain(action.on_failure.iter()) {
                if !action_names.contains(name.as_str()) {
                    return Err(TemplateError::UnknownFollowUp {
                        task: task.name.clone(),
                        action: action.name.clone(),
                        name: name.clone(),
                    });
                }
            }
        }
    }

    Ok(())
}
