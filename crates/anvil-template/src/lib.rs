//! Template language for provisioning workflows.
//!
//! A template is a parameterized YAML document. [`plan::parse`] turns raw
//! YAML into a validated [`plan::WorkflowPlan`]; [`render::render`]
//! substitutes a hardware record into the template text first, then
//! re-parses the result into a fully-grounded plan.

pub mod error;
pub mod image;
pub mod plan;
pub mod render;

pub use error::TemplateError;
pub use plan::{parse, Action, Task, WorkflowPlan};
pub use render::render;

pub type Result<T> = std::result::Result<T, TemplateError>;
