use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Noisy dependencies that only log at warn and above.
const QUIET_CRATES: [&str; 5] = ["hickory_proto", "hickory_resolver", "reqwest", "rustls", "h2"];

/// Setup logging for the probe.
///
/// `level` is the default level (e.g. `info`); the RUST_LOG environment
/// variable overrides it:
///   RUST_LOG=dnscheck_probe=debug
pub fn init_logging(level: &str) {
	tracing_subscriber::fmt()
		.with_env_filter(build_filter(level, std::env::var("RUST_LOG").ok().as_deref()))
		.with_target(false)
		.try_init()
		.ok();
}

fn build_filter(level: &str, env: Option<&str>) -> EnvFilter {
	if let Some(directives) = env.filter(|d| !d.is_empty()) {
		return EnvFilter::new(directives);
	}
	let default = level.parse::<LevelFilter>().unwrap_or(LevelFilter::INFO);
	let mut filter = EnvFilter::builder()
		.with_default_directive(default.into())
		.parse_lossy("");
	for name in QUIET_CRATES {
		if let Ok(directive) = format!("{}=warn", name).parse() {
			filter = filter.add_directive(directive);
		}
	}
	filter
}
