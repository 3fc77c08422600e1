use std::path::PathBuf;

use clap::Parser;

/// DNS resolver censorship check
#[derive(Parser, Debug)]
#[command(name = "dnscheck-probe")]
#[command(about = "Resolve a domain through DNS resolvers over UDP, TCP, DoT and DoH and record what they return")]
pub struct Cli {
	/// Test group to run
	#[arg(default_value = "dnscheck")]
	pub group: String,

	/// Resolver URL to test (repeatable, e.g. dot://dns.google or udp://8.8.8.8:53)
	#[arg(short = 'i', long = "input")]
	pub inputs: Vec<String>,

	/// File containing resolver URLs (one per line, repeatable)
	#[arg(short = 'f', long = "input-file")]
	pub input_files: Vec<String>,

	/// Domain to resolve [default: example.org]
	#[arg(long = "domain")]
	pub domain: Option<String>,

	/// Space-separated addresses to probe in addition to the bootstrap ones
	#[arg(long = "default-addrs")]
	pub default_addrs: Option<String>,

	/// Use HTTP/3 for DoH resolvers
	#[arg(long = "http3")]
	pub http3: bool,

	/// Force a specific HTTP Host header
	#[arg(long = "http-host")]
	pub http_host: Option<String>,

	/// Force a specific TLS server name (SNI)
	#[arg(long = "tls-server-name")]
	pub tls_server_name: Option<String>,

	/// Force a specific TLS version (TLSv1.2 or TLSv1.3)
	#[arg(long = "tls-version")]
	pub tls_version: Option<String>,

	/// Wait this many seconds before probing the same resolver URL again (0 = 180)
	#[arg(long = "residual-wait")]
	pub residual_wait: Option<u64>,

	/// Directory holding stored results
	#[arg(long = "home", default_value = ".dnscheck-probe")]
	pub home: PathBuf,

	/// JSON settings file
	#[arg(short = 'c', long = "config")]
	pub config: Option<PathBuf>,

	/// Default log level; RUST_LOG takes precedence
	#[arg(long = "log-level", default_value = "info")]
	pub log_level: String,

	/// Output CSV file path
	#[arg(short = 'o', long = "output")]
	pub output: Option<String>,

	/// Deprecated: use --websites-max-runtime
	#[arg(long = "websites-url-limit")]
	pub websites_url_limit: Option<i64>,

	/// Maximum runtime of website tests, in seconds
	#[arg(long = "websites-max-runtime")]
	pub websites_max_runtime: Option<i64>,
}
