//! Telemetry helpers for structured logging and tracing.

/// Initialize tracing for the work-queue service. Hosts that install their own
/// subscriber keep it; otherwise an `EnvFilter`-driven fmt subscriber is set up
/// (`RUST_LOG=pacs_workqueue=debug` for claim/command level detail).
pub fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_thread_names(true)
        .try_init();
}
