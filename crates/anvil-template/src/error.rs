use thiserror::Error;

/// Maximum length of workflow, task and action names.
pub const MAX_NAME_LEN: usize = 200;

/// Template version every document must declare.
pub const REQUIRED_VERSION: &str = "0.1";

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("parsing yaml data: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{field} cannot be empty")]
    EmptyName { field: String },

    #[error("{field} cannot have more than {MAX_NAME_LEN} characters: {name}")]
    NameTooLong { field: String, name: String },

    #[error("invalid template version: {0}")]
    InvalidVersion(String),

    #[error("template must have at least one task defined")]
    NoTasks,

    #[error("task {0} must have at least one action defined")]
    NoActions(String),

    #[error("two tasks in a template cannot have the same name: {0}")]
    DuplicateTaskName(String),

    #[error("two actions in a task cannot have the same name: {0}")]
    DuplicateActionName(String),

    #[error("invalid action image: {image}: {reason}")]
    InvalidImage { image: String, reason: String },

    #[error("invalid pid namespace mode for action {action}: {pid}")]
    InvalidPid { action: String, pid: String },

    #[error("action {action} references an action not defined in task {task}: {name}")]
    UnknownFollowUp {
        task: String,
        action: String,
        name: String,
    },

    #[error("rendering template {template_id}: {reason}")]
    Render { template_id: String, reason: String },

    #[error("template {template_id} resolved an empty worker address for task {task}")]
    EmptyWorkerAddr { template_id: String, task: String },
}

impl TemplateError {
    /// Whether the failure happened while (or after) substituting a
    /// hardware record, as opposed to structural parsing or validation.
    pub fn is_render(&self) -> bool {
        matches!(
            self,
            TemplateError::Render { .. } | TemplateError::EmptyWorkerAddr { .. }
        )
    }
}
