#![doc = r#"
aw-error — workspace-wide error types, severity classification, and a
policy-driven emission seam.

Library crates in this workspace return `aw_error::Result<T>` and build
errors with the constructors below. They never log, print, or otherwise
emit side effects on the error path themselves — that is left to an
`ErrorPolicy` chosen by whatever boundary owns a `World` (a CLI, a test
harness, ...), kept out of scope here.
"#]

mod domain;
pub mod policy;
mod severity;

pub use domain::DomainError;
pub use severity::Severity;

pub type Result<T> = std::result::Result<T, Error>;

/// The single error type shared across the agent-world crates.
///
/// Boundaries between runtime components (WorldRuntime, EventBus,
/// LLMQueue, MCPRegistry, StorageAPI) each contribute a typed leaf variant
/// here instead of stringly-typed errors, so callers can match on a
/// fixed taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("world not found: {0}")]
    WorldNotFound(String),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("chat not found: {0}")]
    ChatNotFound(String),

    #[error("world is processing; mutation rejected")]
    WorldProcessing,

    #[error("duplicate {kind}: {id}")]
    Duplicate { kind: &'static str, id: String },

    #[error("LLM queue is full")]
    QueueFull,

    #[error("LLM queue was cleared")]
    QueueCleared,

    #[error("LLM call timed out after {0:?}")]
    LLMTimeout(std::time::Duration),

    #[error("provider error ({status:?}): {message}")]
    ProviderError {
        status: Option<u16>,
        message: String,
    },

    #[error("unsupported LLM provider: {0}")]
    UnsupportedProvider(String),

    #[error("MCP tool error: {0}")]
    MCPToolError(String),

    #[error("MCP transport error: {0}")]
    MCPTransportError(String),

    #[error("invalid MCP configuration: {0}")]
    ConfigParseError(String),

    #[error("storage backend unavailable: {0}")]
    StorageUnavailable(String),

    #[error("processing was cancelled")]
    Cancelled,

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl Error {
    pub fn severity(&self) -> Severity {
        match self {
            Error::WorldNotFound(_)
            | Error::AgentNotFound(_)
            | Error::ChatNotFound(_)
            | Error::Duplicate { .. }
            | Error::WorldProcessing
            | Error::UnsupportedProvider(_) => Severity::Warning,

            Error::QueueFull | Error::QueueCleared | Error::LLMTimeout(_) | Error::Cancelled => {
                Severity::Warning
            }

            Error::ProviderError { .. }
            | Error::MCPToolError(_)
            | Error::MCPTransportError(_)
            | Error::ConfigParseError(_) => Severity::Error,

            Error::StorageUnavailable(_) | Error::Internal(_) => Severity::Fatal,

            Error::Domain(d) => d.severity(),
        }
    }

    /// Best-effort failures are logged, not
    /// surfaced, by the caller that chooses to swallow them. This helper
    /// keeps that one call site honest about what it is doing.
    pub fn log_and_swallow(self, context: &str) {
        tracing::warn!(error = %self, context, "non-fatal failure swallowed");
    }
}

/// Emit errors at a boundary without interleaving side effects into core
/// logic. Library code stays pure; applications choose a policy.
pub trait ErrorPolicy: Send + Sync {
    fn emit(&self, error: &Error);
}

pub trait ResultExt<T> {
    fn emit_event(self, policy: &dyn ErrorPolicy) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn emit_event(self, policy: &dyn ErrorPolicy) -> Result<T> {
        if let Err(ref e) = self {
            policy.emit(e);
        }
        self
    }
}
