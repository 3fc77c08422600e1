//! The dnscheck experiment.
//!
//! Resolves a domain through every address a resolver URL may point to
//! and records, per rewritten resolver URL, what each lookup returned.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bootstrap::{build_candidate_set, BootstrapResolver};
use crate::collect::{collect, Multi, MAX_PARALLELISM};
use crate::error::ExperimentError;
use crate::exchange::Fetcher;
use crate::experiment::{ExperimentArgs, ExperimentTarget, Measurer};
use crate::resolver::ResolverUrl;
use crate::throttle::Throttle;
use crate::transport::{FetchConfig, ProbeInput, ProbeKeys};

pub const TEST_NAME: &str = "dnscheck";
pub const TEST_VERSION: &str = "0.9.2";
pub const DEFAULT_DOMAIN: &str = "example.org";

/// Per-probe timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Experiment options. Empty strings mean "not set".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
	/// Space-separated addresses probed in addition to the bootstrap ones.
	pub default_addrs: String,
	pub domain: String,
	pub http3_enabled: bool,
	pub http_host: String,
	pub tls_server_name: String,
	pub tls_version: String,
}

impl Config {
	pub fn domain(&self) -> &str {
		if self.domain.is_empty() { DEFAULT_DOMAIN } else { &self.domain }
	}

	/// The configured Host header, or `default` when unset.
	pub fn http_host(&self, default: &str) -> String {
		if self.http_host.is_empty() { default.to_string() } else { self.http_host.clone() }
	}

	/// The configured SNI, or `default` when unset.
	pub fn tls_server_name(&self, default: &str) -> String {
		if self.tls_server_name.is_empty() { default.to_string() } else { self.tls_server_name.clone() }
	}
}

/// A resolver URL to test and the options to test it with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Target {
	pub url: String,
	pub options: Config,
}

impl Target {
	pub fn new(url: impl Into<String>, options: Config) -> Self {
		Target { url: url.into(), options }
	}
}

/// Results of a dnscheck measurement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestKeys {
	pub x_default_addrs: String,
	pub domain: String,
	#[serde(skip_serializing_if = "std::ops::Not::not")]
	pub x_http3_enabled: bool,
	#[serde(skip_serializing_if = "String::is_empty")]
	pub x_http_host: String,
	#[serde(skip_serializing_if = "String::is_empty")]
	pub x_tls_server_name: String,
	#[serde(skip_serializing_if = "String::is_empty")]
	pub x_tls_version: String,
	pub x_residual: bool,
	/// Present only when the bootstrap lookup emitted query events.
	pub bootstrap: Option<ProbeKeys>,
	pub bootstrap_failure: Option<String>,
	pub lookups: BTreeMap<String, ProbeKeys>,
}

/// The dnscheck measurer.
///
/// The throttle is shared by every measurement this instance performs.
#[derive(Clone)]
pub struct DnsCheck {
	throttle: Throttle,
	fetcher: Arc<dyn Fetcher>,
	bootstrap: Arc<dyn BootstrapResolver>,
}

impl DnsCheck {
	pub fn new(throttle: Throttle, fetcher: Arc<dyn Fetcher>, bootstrap: Arc<dyn BootstrapResolver>) -> Self {
		DnsCheck { throttle, fetcher, bootstrap }
	}

	pub fn throttle(&self) -> &Throttle {
		&self.throttle
	}

	/// Measure `target`.
	///
	/// Errors only when the target itself is unusable; past URL validation
	/// every failure is recorded in the returned test keys.
	pub async fn measure(
		&self,
		cancel: &CancellationToken,
		target: &Target,
		begin: Instant,
	) -> Result<TestKeys, ExperimentError> {
		let config = &target.options;
		info!(url = %target.url, options = ?config, "dnscheck: using richer input");

		let domain = config.domain();
		let mut tk = TestKeys {
			x_default_addrs: config.default_addrs.clone(),
			domain: domain.to_string(),
			x_http3_enabled: config.http3_enabled,
			x_http_host: config.http_host.clone(),
			x_tls_server_name: config.tls_server_name.clone(),
			x_tls_version: config.tls_version.clone(),
			x_residual: self.throttle.is_active(),
			..Default::default()
		};

		let url = ResolverUrl::parse(&target.url)?;

		let candidates = build_candidate_set(
			self.bootstrap.as_ref(),
			&url,
			&config.default_addrs,
			cancel,
			begin,
		).await;
		tk.bootstrap_failure = candidates.failure;
		if !candidates.queries.is_empty() {
			tk.bootstrap = Some(ProbeKeys { queries: candidates.queries, failure: None });
		}

		let mut seen = HashSet::new();
		let inputs: Vec<ProbeInput> = candidates.addrs.iter()
			.map(|addr| url.with_address(*addr))
			.filter(|resolver_url| seen.insert(resolver_url.clone()))
			.map(|resolver_url| ProbeInput {
				config: FetchConfig {
					dns_http_host: config.http_host(url.host()),
					dns_tls_server_name: config.tls_server_name(url.hostname()),
					dns_tls_version: config.tls_version.clone(),
					http3_enabled: config.http3_enabled,
					reject_dns_bogons: true,
					resolver_url,
					timeout: PROBE_TIMEOUT,
				},
				target: format!("dnslookup://{}", domain),
			})
			.collect();

		let multi = Multi {
			begin,
			parallelism: MAX_PARALLELISM.min(inputs.len()),
			fetcher: self.fetcher.clone(),
			throttle: self.throttle.clone(),
			cancel: cancel.clone(),
		};
		let mut outputs = collect(&multi, inputs);
		while let Some(output) = outputs.recv().await {
			tk.lookups.insert(output.input.config.resolver_url, output.test_keys);
		}
		Ok(tk)
	}
}

#[async_trait]
impl Measurer for DnsCheck {
	fn name(&self) -> &'static str {
		TEST_NAME
	}

	fn version(&self) -> &'static str {
		TEST_VERSION
	}

	async fn run(&self, args: ExperimentArgs<'_>) -> Result<(), ExperimentError> {
		let Some(ExperimentTarget::DnsCheck(target)) = args.target else {
			return Err(ExperimentError::InputRequired);
		};
		let begin = args.measurement.begin();
		let tk = self.measure(args.cancel, target, begin).await?;
		args.measurement.test_keys = Some(serde_json::to_value(&tk)?);
		Ok(())
	}
}
