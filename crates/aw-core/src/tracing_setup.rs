/// Installs a basic `tracing` subscriber honoring `RUST_LOG`, if none is set
/// yet. Library code never calls this itself; binaries and tests opt in at
/// their own entry point. Returns `true` if this call installed the
/// subscriber, `false` if one was already active.
pub fn init_tracing_once() -> bool {
    use tracing_subscriber::{fmt, EnvFilter};
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init()
        .is_ok()
}
