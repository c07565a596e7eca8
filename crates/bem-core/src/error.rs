//! Error taxonomy shared by all BEM crates.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BemError>;

#[derive(Debug, Error)]
pub enum BemError {
    /// A record was asked for a field its schema does not declare.
    #[error("unknown field '{field}' on {record}")]
    UnknownField { record: &'static str, field: String },

    /// Two logical objects map to one identity, or a stored row disagrees
    /// with the identity computed for it.
    #[error("identity conflict: {0}")]
    IdentityConflict(String),

    /// State database failure (insert/update/delete/select).
    #[error("store error: {0}")]
    Store(String),

    /// The external notifier could not be started.
    #[error("process dispatch error: {0}")]
    ProcessDispatch(String),

    /// Custom variable enrichment failed.
    #[error("enrichment query error: {0}")]
    Enrichment(String),

    /// Monitoring (IDO) database failure.
    #[error("IDO error: {0}")]
    Ido(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl BemError {
    /// Whether the failed operation may succeed when simply repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BemError::Store(_) | BemError::Ido(_) | BemError::Io(_))
    }
}
