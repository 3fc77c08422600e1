use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FetchError;

/// Per-probe fetch settings, derived from the experiment config and the
/// resolver URL being measured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchConfig {
	/// Host header for DoH requests.
	pub dns_http_host: String,
	/// SNI for DoT and DoH handshakes.
	pub dns_tls_server_name: String,
	/// Pinned TLS version; empty means negotiate.
	pub dns_tls_version: String,
	pub http3_enabled: bool,
	pub reject_dns_bogons: bool,
	pub resolver_url: String,
	pub timeout: Duration,
}

/// One probe task: which resolver to use and what to resolve through it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeInput {
	pub config: FetchConfig,
	/// Target such as `dnslookup://example.org`.
	pub target: String,
}

impl ProbeInput {
	/// Domain named by a `dnslookup://` target.
	pub fn domain(&self) -> &str {
		self.target.strip_prefix("dnslookup://").unwrap_or(&self.target)
	}
}

/// DNS query type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryType {
	A,
	AAAA,
}

/// An address returned in a DNS answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsAnswer {
	pub answer_type: QueryType,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub ipv4: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub ipv6: Option<String>,
}

impl DnsAnswer {
	pub fn from_ip(ip: IpAddr) -> Self {
		match ip {
			IpAddr::V4(v4) => DnsAnswer {
				answer_type: QueryType::A,
				ipv4: Some(v4.to_string()),
				ipv6: None,
			},
			IpAddr::V6(v6) => DnsAnswer {
				answer_type: QueryType::AAAA,
				ipv4: None,
				ipv6: Some(v6.to_string()),
			},
		}
	}
}

/// A single DNS query as observed by the probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsQueryEvent {
	pub engine: String,
	pub resolver_address: String,
	pub hostname: String,
	pub query_type: QueryType,
	pub answers: Vec<DnsAnswer>,
	pub failure: Option<String>,
	/// Seconds since measurement start when the query was sent.
	pub t0: f64,
	/// Seconds since measurement start when the query completed.
	pub t: f64,
}

/// Trace of a single probe, stored per resolver URL in the test keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeKeys {
	pub queries: Vec<DnsQueryEvent>,
	pub failure: Option<String>,
}

impl ProbeKeys {
	/// Addresses found in all successful answers.
	pub fn addresses(&self) -> Vec<String> {
		self.queries.iter()
			.flat_map(|q| q.answers.iter())
			.filter_map(|a| a.ipv4.clone().or_else(|| a.ipv6.clone()))
			.collect()
	}
}

/// Result of a single probe task.
#[derive(Debug, Clone)]
pub struct ProbeOutput {
	pub input: ProbeInput,
	pub err: Option<FetchError>,
	pub test_keys: ProbeKeys,
}
