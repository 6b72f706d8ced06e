use thiserror::Error;

/// Stable error kind identifiers shared across the control API, the loader,
/// and the expression engine. These map 1:1 onto the `kind` field of the
/// error envelope returned from the RPC surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    PathError,
    ExpressionError,
    Timeout,
    ToolError,
    ValidationRejected,
    LoopBound,
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// `ValidationError` and `Internal` never enter a step's retry/fallback
    /// pipeline; everything else does.
    pub fn is_terminal(self) -> bool {
        matches!(self, ErrorKind::ValidationError | ErrorKind::Internal)
    }
}

/// Top-level error type for the workflow-core library.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Load-time schema or semantic validation failure. Carries every
    /// violation found, not just the first.
    #[error("validation error: {0}")]
    Validation(ValidationFailure),

    /// Write to an undeclared or read-only path, or read of an undeclared path.
    #[error("path error: {0}")]
    Path(String),

    /// Expression or template evaluation failure.
    #[error("expression error: {0}")]
    Expression(String),

    /// Step, sub-agent, or workflow deadline exceeded.
    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    /// Client-reported tool/process failure.
    #[error("tool error: {0}")]
    Tool(String),

    /// Schema/pattern validation of a client-supplied response was rejected.
    #[error("validation rejected: {0}")]
    ValidationRejected(String),

    /// `max_iterations` exceeded in a loop.
    #[error("loop bound exceeded: {0}")]
    LoopBound(String),

    /// Workflow was cancelled externally.
    #[error("cancelled")]
    Cancelled,

    /// Engine bug; always fatal, never retried.
    #[error("internal error: {0}")]
    Internal(String),

    /// Unknown workflow id, or no such instance.
    #[error("workflow instance not found: {0}")]
    NotFound(String),

    /// Wraps `std::io::Error` encountered during load or shell execution.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) => ErrorKind::ValidationError,
            EngineError::Path(_) => ErrorKind::PathError,
            EngineError::Expression(_) => ErrorKind::ExpressionError,
            EngineError::Timeout(_) => ErrorKind::Timeout,
            EngineError::Tool(_) => ErrorKind::ToolError,
            EngineError::ValidationRejected(_) => ErrorKind::ValidationRejected,
            EngineError::LoopBound(_) => ErrorKind::LoopBound,
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::Internal(_) | EngineError::NotFound(_) | EngineError::Io(_) => {
                ErrorKind::Internal
            }
        }
    }
}

/// A single location-tagged validation violation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ValidationIssue {
    /// JSON-pointer-like location, e.g. `/steps/2/condition`.
    pub location: String,
    pub message: String,
}

/// All violations discovered while loading a workflow; loads never
/// partially succeed, so every issue is collected before returning.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ValidationFailure {
    pub issues: Vec<ValidationIssue>,
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, issue) in self.issues.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}: {}", issue.location, issue.message)?;
        }
        Ok(())
    }
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, EngineError>;
