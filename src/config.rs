use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cli::Cli;
use crate::dnscheck;
use crate::run::NettestSettings;

/// Settings read from the optional JSON file.
///
/// ```json
/// {
///   "nettests": { "websites_max_runtime": 300 },
///   "dnscheck": { "domain": "example.com", "default_addrs": "8.8.8.8" }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
	pub nettests: NettestSettings,
	pub dnscheck: dnscheck::Config,
}

impl Settings {
	pub fn load(path: &Path) -> Result<Self> {
		let content = std::fs::read_to_string(path)
			.with_context(|| format!("failed to read settings file '{}'", path.display()))?;
		serde_json::from_str(&content)
			.with_context(|| format!("invalid settings file '{}'", path.display()))
	}

	/// File settings, if any, overridden by command line flags.
	pub fn from_cli(cli: &Cli) -> Result<Self> {
		let mut settings = match &cli.config {
			Some(path) => Self::load(path)?,
			None => Self::default(),
		};
		settings.apply_cli(cli);
		Ok(settings)
	}

	fn apply_cli(&mut self, cli: &Cli) {
		let options = &mut self.dnscheck;
		if let Some(domain) = &cli.domain {
			options.domain = domain.clone();
		}
		if let Some(addrs) = &cli.default_addrs {
			options.default_addrs = addrs.clone();
		}
		if cli.http3 {
			options.http3_enabled = true;
		}
		if let Some(host) = &cli.http_host {
			options.http_host = host.clone();
		}
		if let Some(sni) = &cli.tls_server_name {
			options.tls_server_name = sni.clone();
		}
		if let Some(version) = &cli.tls_version {
			options.tls_version = version.clone();
		}
		if let Some(limit) = cli.websites_url_limit {
			self.nettests.websites_url_limit = limit;
		}
		if let Some(runtime) = cli.websites_max_runtime {
			self.nettests.websites_max_runtime = runtime;
		}
	}
}
