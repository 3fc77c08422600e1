mod bootstrap;
mod cli;
mod collect;
mod config;
mod dns;
mod dnscheck;
mod error;
mod exchange;
mod experiment;
mod logging;
mod nettests;
mod output;
mod resolver;
mod run;
mod session;
mod store;
mod throttle;
mod transport;

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bootstrap::SystemBootstrap;
use crate::cli::Cli;
use crate::config::Settings;
use crate::dnscheck::DnsCheck;
use crate::error::RunError;
use crate::exchange::DnsFetcher;
use crate::nettests::{DnsCheckNettest, GroupRegistry};
use crate::run::{RunController, RunGroupConfig, TokioPause};
use crate::session::OfflineSessionFactory;
use crate::store::JsonStore;
use crate::throttle::Throttle;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	logging::init_logging(&cli.log_level);

	let settings = Settings::from_cli(&cli)?;

	// Residual-censorship throttling is opt-in
	let throttle = match cli.residual_wait {
		Some(secs) => Throttle::enabled(Duration::from_secs(secs)),
		None => Throttle::disabled(),
	};
	let measurer = DnsCheck::new(throttle.clone(), Arc::new(DnsFetcher), Arc::new(SystemBootstrap::new()));
	let registry = GroupRegistry::with_defaults(
		DnsCheckNettest::new(measurer, settings.dnscheck.clone(), cli.output.clone()),
	);

	let store = JsonStore::new(&cli.home)?;
	info!(home = %store.home().display(), "storing results");

	// Ctrl-C terminates the run between inputs and nettests
	let cancel = CancellationToken::new();
	{
		let cancel = cancel.clone();
		tokio::spawn(async move {
			if tokio::signal::ctrl_c().await.is_ok() {
				warn!("interrupted, finishing the current measurement");
				cancel.cancel();
			}
		});
	}

	let sessions = OfflineSessionFactory;
	let pause = TokioPause;
	let mut controller = RunController::new(
		&sessions, &store, &registry, &pause, cancel, settings.nettests,
	);
	let config = RunGroupConfig {
		group_name: cli.group.clone(),
		inputs: cli.inputs.clone(),
		input_files: cli.input_files.clone(),
	};
	if let Err(err) = controller.run_group(&config).await {
		if let RunError::UnknownGroup(_) = &err {
			eprintln!("Available groups: {}", registry.names().join(", "));
		}
		return Err(err.into());
	}

	if throttle.is_active() {
		info!(waits = throttle.wait_count(), "residual wait summary");
	}
	Ok(())
}
