use crate::Severity;

/// Structured, non-fatal domain failures that don't map cleanly onto one of
/// the top-level `Error` variants. Kept as its own enum (rather than more
/// `Error` variants) so call sites can group "this request was semantically
/// invalid" failures without growing the main taxonomy indefinitely.
#[derive(Debug, thiserror::Error)]
pub enum DomainError {
    #[error("identifier could not be resolved: {0}")]
    UnresolvedIdentifier(String),

    #[error("archive of agent memory failed: {0}")]
    ArchiveFailure(String),

    #[error("edit target message not found: {0}")]
    EditTargetNotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),
}

impl DomainError {
    pub fn severity(&self) -> Severity {
        match self {
            DomainError::ArchiveFailure(_) => Severity::Warning,
            DomainError::UnresolvedIdentifier(_) | DomainError::EditTargetNotFound(_) => {
                Severity::Warning
            }
            DomainError::Validation(_) => Severity::Error,
        }
    }
}
