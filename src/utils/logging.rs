use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` overrides the default filter,
/// which keeps onnxruntime's own logging quiet.
pub fn init() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,ort=warn".to_string());
    let fmt = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .with_ansi(false);
    // a subscriber may already be installed by an embedding test harness
    let _ = fmt.try_init();
}
