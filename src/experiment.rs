use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::dnscheck;
use crate::error::ExperimentError;

/// Probe IP written into every measurement; the real one is never shared.
pub const DEFAULT_PROBE_IP: &str = "127.0.0.1";

/// Where the probe runs, as discovered by the session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeLocation {
	pub probe_ip: String,
	pub asn: u32,
	pub country_code: String,
	pub network_name: String,
	pub resolver_ip: String,
	pub resolver_asn: u32,
	pub resolver_network_name: String,
}

impl ProbeLocation {
	pub fn unknown() -> Self {
		ProbeLocation {
			probe_ip: DEFAULT_PROBE_IP.to_string(),
			asn: 0,
			country_code: "ZZ".to_string(),
			network_name: String::new(),
			resolver_ip: String::new(),
			resolver_asn: 0,
			resolver_network_name: String::new(),
		}
	}
}

/// A measurement as submitted and stored.
#[derive(Debug, Clone, Serialize)]
pub struct Measurement {
	pub input: Option<String>,
	pub test_name: String,
	pub test_version: String,
	pub measurement_start_time: String,
	pub test_runtime: f64,
	pub probe_asn: String,
	pub probe_cc: String,
	pub probe_ip: String,
	pub probe_network_name: String,
	pub resolver_ip: String,
	pub resolver_asn: String,
	pub resolver_network_name: String,
	pub test_keys: Option<serde_json::Value>,
	#[serde(skip)]
	pub start: Option<Instant>,
}

impl Measurement {
	/// Start a new measurement for `measurer` at `location`.
	///
	/// The probe IP is always replaced with `DEFAULT_PROBE_IP`.
	pub fn new(measurer: &dyn Measurer, location: &ProbeLocation, input: Option<String>) -> Self {
		Self::new_at(measurer, location, input, Utc::now())
	}

	fn new_at(
		measurer: &dyn Measurer,
		location: &ProbeLocation,
		input: Option<String>,
		now: DateTime<Utc>,
	) -> Self {
		Measurement {
			input,
			test_name: measurer.name().to_string(),
			test_version: measurer.version().to_string(),
			measurement_start_time: now.format("%Y-%m-%d %H:%M:%S").to_string(),
			test_runtime: 0.0,
			probe_asn: format!("AS{}", location.asn),
			probe_cc: location.country_code.clone(),
			probe_ip: DEFAULT_PROBE_IP.to_string(),
			probe_network_name: location.network_name.clone(),
			resolver_ip: location.resolver_ip.clone(),
			resolver_asn: format!("AS{}", location.resolver_asn),
			resolver_network_name: location.resolver_network_name.clone(),
			test_keys: None,
			start: Some(Instant::now()),
		}
	}

	/// Monotonic start of the measurement, used to timestamp events.
	pub fn begin(&self) -> Instant {
		self.start.unwrap_or_else(Instant::now)
	}
}

/// Richer input for the experiments this probe knows about.
///
/// Resolved once when dispatching to a measurer.
#[derive(Debug, Clone, PartialEq)]
pub enum ExperimentTarget {
	DnsCheck(dnscheck::Target),
}

/// Arguments for a single experiment run.
pub struct ExperimentArgs<'a> {
	pub cancel: &'a CancellationToken,
	pub measurement: &'a mut Measurement,
	pub target: Option<&'a ExperimentTarget>,
}

/// An experiment that fills in a measurement.
///
/// Returning an error means there is no measurement to submit.
#[async_trait]
pub trait Measurer: Send + Sync {
	fn name(&self) -> &'static str;
	fn version(&self) -> &'static str;
	async fn run(&self, args: ExperimentArgs<'_>) -> Result<(), ExperimentError>;
}
