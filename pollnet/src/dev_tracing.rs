//! Development helper for demos and tests.

/// Install a `fmt` subscriber filtered by `RUST_LOG`.
///
/// No-op when `RUST_LOG` is unset or a global subscriber already exists, so
/// every test can call it.
pub fn init_tracing() {
    if std::env::var_os("RUST_LOG").is_none() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_thread_names(true)
        .try_init();
}
