use tracing_subscriber::EnvFilter;

/// Install the process-wide tracing subscriber. Filtering is controlled
/// through `RUST_LOG`; defaults to `info` when unset.
pub fn init() {
	tracing_subscriber::FmtSubscriber::builder()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
		)
		.try_init()
		.expect("setting default subscriber failed");
}
