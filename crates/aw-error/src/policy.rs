//! Ready-made `ErrorPolicy` implementations. Applications pick one (or
//! compose several); library code never depends on this module's contents
//! being active.

use crate::{Error, ErrorPolicy};

/// Emits nothing. Useful for tests that want `ResultExt::emit_event` call
/// sites to compile without pulling in a real sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPolicy;

impl ErrorPolicy for NoopPolicy {
    fn emit(&self, _error: &Error) {}
}

/// Routes every error through `tracing`, at a level derived from severity.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingPolicy;

impl ErrorPolicy for TracingPolicy {
    fn emit(&self, error: &Error) {
        use crate::Severity::*;
        match error.severity() {
            Warning => tracing::warn!(%error, "warning"),
            Error => tracing::error!(%error, "error"),
            Fatal => tracing::error!(%error, "fatal"),
        }
    }
}

/// Runs multiple policies in order.
#[derive(Default)]
pub struct CombinedPolicy {
    policies: Vec<Box<dyn ErrorPolicy>>,
}

impl CombinedPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, policy: impl ErrorPolicy + 'static) -> Self {
        self.policies.push(Box::new(policy));
        self
    }
}

impl ErrorPolicy for CombinedPolicy {
    fn emit(&self, error: &Error) {
        for policy in &self.policies {
            policy.emit(error);
        }
    }
}
