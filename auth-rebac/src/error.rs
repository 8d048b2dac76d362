use thiserror::Error;

#[derive(Error, Debug)]
pub enum RebacError {
    /// The tuple store could not be reached. The only error `check` and
    /// `list_objects` ever return; callers must treat it as a deny.
    #[error("Tuple store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Conflicting write: {0}")]
    Conflict(String),

    #[error("Invalid relation: {0}")]
    InvalidRelation(String),

    #[error("Invalid tuple: {0}")]
    InvalidTuple(String),

    #[error("Invalid entity reference: {0}")]
    InvalidEntity(String),

    #[error("Schema load failed: {0}")]
    SchemaLoad(String),

    #[error("Parent cycle: {0}")]
    ParentCycle(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Raised inside the evaluator when the depth cap or the dispatch budget
    /// is hit. Converted to a deny before it reaches a caller.
    #[error("Maximum recursion depth exceeded")]
    MaxRecursionDepthExceeded,

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl RebacError {
    /// Whether the error reflects an infrastructure failure rather than a
    /// rejected request.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, RebacError::StoreUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, RebacError>;
