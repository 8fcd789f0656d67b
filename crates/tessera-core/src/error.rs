use thiserror::Error;

#[derive(Debug, Error)]
pub enum TesseraError {
    // Capability errors
    #[error("Capability invocation failed: {capability}: {message}")]
    Capability { capability: String, message: String },

    #[error("Capability unavailable: {0}")]
    CapabilityUnavailable(String),

    // Action errors
    #[error("Action not found: {0}")]
    ActionNotFound(String),

    #[error("Action execution failed: {action}: {message}")]
    ActionExecution { action: String, message: String },

    #[error("Action timeout after {timeout_secs}s: {action}")]
    ActionTimeout { action: String, timeout_secs: u64 },

    // Stage errors
    #[error("Stage failed: {stage}: {message}")]
    Stage { stage: String, message: String },

    #[error("Stage panicked: {0}")]
    StagePanicked(String),

    // Graph misconfiguration
    #[error("Node '{0}' not found in graph")]
    UnknownNode(String),

    #[error("Node '{0}' declared more than once")]
    DuplicateNode(String),

    #[error("Graph has no entry node")]
    MissingEntry,

    #[error("Router on '{from}' returned undeclared target '{target}'")]
    UndeclaredTarget { from: String, target: String },

    #[error("Graph contains a cycle through '{0}'")]
    Cycle(String),

    #[error("Conditional target '{target}' has more than one in-edge declaration ({first} and {second})")]
    AmbiguousInEdge {
        target: String,
        first: String,
        second: String,
    },

    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    // Run store errors
    #[error("Run store closed")]
    StoreClosed,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TesseraError {
    /// Build a stage failure from any displayable message.
    pub fn stage(stage: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Stage {
            stage: stage.into(),
            message: message.to_string(),
        }
    }

    /// Build a capability failure from any displayable message.
    pub fn capability(capability: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Capability {
            capability: capability.into(),
            message: message.to_string(),
        }
    }

    /// Whether this error is a graph misconfiguration that must abort the run.
    pub fn is_misconfiguration(&self) -> bool {
        matches!(
            self,
            Self::UnknownNode(_)
                | Self::DuplicateNode(_)
                | Self::MissingEntry
                | Self::UndeclaredTarget { .. }
                | Self::Cycle(_)
                | Self::AmbiguousInEdge { .. }
                | Self::InvalidGraph(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TesseraError>;
