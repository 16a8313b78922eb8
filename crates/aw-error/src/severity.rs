/// Coarse severity classification used for programmatic handling and for
/// deciding which `ErrorPolicy` reactions apply (log vs. abort vs. ignore).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Recoverable, expected in normal operation (not-found, duplicate, ...).
    Warning,
    /// Recoverable but noteworthy (provider/transport failures).
    Error,
    /// Unrecoverable for the current operation; the caller should stop.
    Fatal,
}
