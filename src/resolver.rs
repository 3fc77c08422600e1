use std::net::{IpAddr, SocketAddr};

use anyhow::{anyhow, Result};
use url::Url;

use crate::error::ExperimentError;

/// Transport used to reach a resolver under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolverScheme {
	Https,
	Dot,
	Udp,
	Tcp,
}

impl ResolverScheme {
	pub fn parse(scheme: &str) -> Option<Self> {
		match scheme {
			"https" => Some(ResolverScheme::Https),
			"dot" => Some(ResolverScheme::Dot),
			"udp" => Some(ResolverScheme::Udp),
			"tcp" => Some(ResolverScheme::Tcp),
			_ => None,
		}
	}

	pub fn as_str(self) -> &'static str {
		match self {
			ResolverScheme::Https => "https",
			ResolverScheme::Dot => "dot",
			ResolverScheme::Udp => "udp",
			ResolverScheme::Tcp => "tcp",
		}
	}

	pub fn default_port(self) -> u16 {
		match self {
			ResolverScheme::Https => 443,
			ResolverScheme::Dot => 853,
			ResolverScheme::Udp | ResolverScheme::Tcp => 53,
		}
	}
}

/// A parsed resolver URL such as `https://dns.google/dns-query` or
/// `udp://8.8.8.8:53`.
///
/// The authority and the path/query tail are kept verbatim so that a URL
/// which already names an address is reproduced byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverUrl {
	scheme: ResolverScheme,
	authority: String,
	hostname: String,
	port: Option<String>,
	tail: String,
}

impl ResolverUrl {
	/// Parse and validate a resolver URL.
	///
	/// Fails with `InvalidUrl` when the string is not a URL with a host and
	/// with `UnsupportedScheme` for anything other than https, dot, udp, tcp.
	pub fn parse(input: &str) -> std::result::Result<Self, ExperimentError> {
		if input.is_empty() {
			return Err(ExperimentError::InputRequired);
		}
		let parsed = Url::parse(input)
			.map_err(|e| ExperimentError::InvalidUrl(e.to_string()))?;
		let scheme = ResolverScheme::parse(parsed.scheme())
			.ok_or_else(|| ExperimentError::UnsupportedScheme(parsed.scheme().to_string()))?;

		let rest = input.split_once("://")
			.map(|(_, rest)| rest)
			.ok_or_else(|| ExperimentError::InvalidUrl(format!("missing authority in '{}'", input)))?;
		let end = rest.find(|c| matches!(c, '/' | '?' | '#')).unwrap_or(rest.len());
		let authority = match rest[..end].rsplit_once('@') {
			Some((_userinfo, host)) => host,
			None => &rest[..end],
		};
		let tail = rest[end..].split('#').next().unwrap_or("");

		let (hostname, port) = split_host_port(authority)
			.ok_or_else(|| ExperimentError::InvalidUrl(format!("malformed host in '{}'", input)))?;
		if hostname.is_empty() {
			return Err(ExperimentError::InvalidUrl(format!("missing host in '{}'", input)));
		}

		Ok(ResolverUrl {
			scheme,
			authority: authority.to_string(),
			hostname,
			port,
			tail: tail.to_string(),
		})
	}

	pub fn scheme(&self) -> ResolverScheme {
		self.scheme
	}

	/// Host and optional port, as written in the URL.
	pub fn host(&self) -> &str {
		&self.authority
	}

	/// Host without port and without IPv6 brackets.
	pub fn hostname(&self) -> &str {
		&self.hostname
	}

	pub fn port(&self) -> Option<&str> {
		self.port.as_deref()
	}

	/// The literal address in the host position, if any.
	pub fn ip(&self) -> Option<IpAddr> {
		self.hostname.parse().ok()
	}

	/// Socket address of a URL whose host is a literal address.
	pub fn socket_addr(&self) -> Option<SocketAddr> {
		let ip = self.ip()?;
		let port = match &self.port {
			Some(port) => port.parse().ok()?,
			None => self.scheme.default_port(),
		};
		Some(SocketAddr::new(ip, port))
	}

	/// Path and query, e.g. `/dns-query?x=1`.
	pub fn tail(&self) -> &str {
		&self.tail
	}

	/// Rewrite this URL so it targets `addr`.
	///
	/// A host that is already a literal address is left untouched. An
	/// explicit port is carried over; IPv6 hosts are bracketed.
	pub fn with_address(&self, addr: IpAddr) -> String {
		let hostname = match self.ip() {
			Some(_) => self.hostname.clone(),
			None => addr.to_string(),
		};
		let host = match &self.port {
			Some(port) => join_host_port(&hostname, port),
			None if hostname.contains(':') => format!("[{}]", hostname),
			None => hostname,
		};
		let rewritten = format!("{}://{}{}", self.scheme.as_str(), host, self.tail);
		// The input was validated by `parse`, so a failure here is a bug.
		if let Err(err) = Url::parse(&rewritten) {
			panic!("rewritten resolver URL '{}' is malformed: {}", rewritten, err);
		}
		rewritten
	}
}

impl std::fmt::Display for ResolverUrl {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}://{}{}", self.scheme.as_str(), self.authority, self.tail)
	}
}

/// Split `host[:port]` or `[v6][:port]` into hostname and port.
fn split_host_port(authority: &str) -> Option<(String, Option<String>)> {
	if let Some(rest) = authority.strip_prefix('[') {
		let (host, after) = rest.split_once(']')?;
		let port = match after {
			"" => None,
			_ => Some(after.strip_prefix(':')?),
		};
		return Some((host.to_string(), port.filter(|p| !p.is_empty()).map(String::from)));
	}
	match authority.rsplit_once(':') {
		Some((host, port)) => {
			let port = if port.is_empty() { None } else { Some(port.to_string()) };
			Some((host.to_string(), port))
		}
		None => Some((authority.to_string(), None)),
	}
}

fn join_host_port(host: &str, port: &str) -> String {
	if host.contains(':') {
		format!("[{}]:{}", host, port)
	} else {
		format!("{}:{}", host, port)
	}
}

/// Read resolver URLs from a file, one per line.
///
/// Blank lines and lines starting with '#' are skipped.
pub fn read_resolver_file(path: &str) -> Result<Vec<String>> {
	let content = std::fs::read_to_string(path)
		.map_err(|e| anyhow!("failed to read input file '{}': {}", path, e))?;
	let urls = content.lines()
		.map(|line| line.trim().to_string())
		.filter(|line| !line.is_empty() && !line.starts_with('#'))
		.collect();
	Ok(urls)
}

/// Return a list of well-known resolver URLs, one per transport family.
pub fn default_resolver_urls() -> Vec<String> {
	vec![
		"https://dns.google/dns-query",
		"https://cloudflare-dns.com/dns-query",
		"https://dns.quad9.net/dns-query",
		"dot://dns.google",
		"dot://1dot1dot1dot1.cloudflare-dns.com",
		"udp://8.8.8.8:53",
		"udp://1.1.1.1:53",
		"tcp://9.9.9.9:53",
	].into_iter().map(String::from).collect()
}
