use thiserror::Error;

/// Server-wide error taxonomy. Every RPC maps one of these onto a
/// canonical status code; database causes are kept in the message for
/// logs but never leak driver details to clients.
#[derive(Debug, Error)]
pub enum Error {
    #[error("parsing template: {0}")]
    Parse(String),

    #[error("rendering template {template_id}: {reason}")]
    Render { template_id: String, reason: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("report does not match the current workflow cursor: {0}")]
    OutOfOrder(String),

    #[error("workflow {0} is in a terminal state")]
    AlreadyTerminal(String),

    #[error("workflow data version mismatch: expected {expected}, found {found}")]
    VersionConflict { expected: i64, found: i64 },

    #[error("database error: {0}")]
    Database(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Short machine-readable label, stable across message rewording.
    pub fn label(&self) -> &'static str {
        match self {
            Error::Parse(_) => "ParseError",
            Error::Render { .. } => "RenderError",
            Error::NotFound(_) => "NotFound",
            Error::AlreadyExists(_) => "AlreadyExists",
            Error::InvalidArgument(_) => "InvalidArgument",
            Error::OutOfOrder(_) => "OutOfOrder",
            Error::AlreadyTerminal(_) => "AlreadyTerminal",
            Error::VersionConflict { .. } => "VersionConflict",
            Error::Database(_) => "DatabaseError",
            Error::Internal(_) => "Internal",
        }
    }
}
