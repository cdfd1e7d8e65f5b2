use thiserror::Error;

/// Failure of a `;;!pre-parsing:` filter.
#[derive(Debug, Error)]
pub enum PreProcessingError {
    #[error("invalid pre-parsing meta-instruction: {0}")]
    InvalidMeta(#[from] serde_json::Error),

    #[error("pre-processor type '{0}' is not supported")]
    Unsupported(String),

    #[error("{0} pre-processor is not configured")]
    NotConfigured(&'static str),

    #[error("failed to run '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
        line: Option<u32>,
    },
}

impl PreProcessingError {
    /// Zero-based line the filter blamed, if it reported one.
    pub fn line(&self) -> Option<u32> {
        match self {
            PreProcessingError::Failed { line, .. } => *line,
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("no validator is configured")]
    NotConfigured,

    #[error("failed to prepare validator input: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to run validator '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid validator output pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("validation request to {url} failed: {message}")]
    Http { url: String, message: String },

    #[error("unexpected validation service response: {0}")]
    InvalidResponse(#[from] serde_json::Error),

    #[error("validator did not finish within {0} seconds")]
    Timeout(u64),

    #[error("validation task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum PlanningError {
    #[error("no planner is configured")]
    NotConfigured,

    #[error("planning was cancelled")]
    Cancelled,

    #[error("failed to prepare planner input: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to run planner '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("planner exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("planning request to {url} failed: {message}")]
    Http { url: String, message: String },

    #[error("unexpected planning service response: {0}")]
    InvalidResponse(String),

    #[error("planning service did not finish within {0} seconds")]
    Timeout(u64),

    #[error("planning task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
