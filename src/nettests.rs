use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::dnscheck::{self, DnsCheck, TestKeys};
use crate::experiment::{ExperimentArgs, ExperimentTarget, Measurement, Measurer};
use crate::output::{self, LookupRow};
use crate::resolver::{default_resolver_urls, read_resolver_file};
use crate::session::Session;
use crate::store::ResultStore;

/// What a nettest needs from the group run that invokes it.
pub struct Controller<'a> {
	pub session: &'a dyn Session,
	pub store: &'a dyn ResultStore,
	pub result_id: i64,
	pub cancel: &'a CancellationToken,
	pub inputs: &'a [String],
	pub input_files: &'a [String],
	pub nettest_index: usize,
	pub nettest_count: usize,
}

impl Controller<'_> {
	pub fn is_terminated(&self) -> bool {
		self.cancel.is_cancelled()
	}

	/// Literal inputs followed by the contents of every input file, or
	/// `defaults()` when neither yields anything.
	pub fn load_inputs(&self, defaults: impl FnOnce() -> Vec<String>) -> Result<Vec<String>> {
		let mut inputs: Vec<String> = self.inputs.iter()
			.map(|i| i.trim().to_string())
			.filter(|i| !i.is_empty())
			.collect();
		for path in self.input_files {
			inputs.extend(read_resolver_file(path)?);
		}
		if inputs.is_empty() {
			inputs = defaults();
		}
		Ok(inputs)
	}

	/// Run one measurement and save it under this run's result.
	pub async fn measure(
		&self,
		measurer: &dyn Measurer,
		input: &str,
		target: &ExperimentTarget,
	) -> Result<Measurement> {
		let location = self.session.location();
		let mut measurement = Measurement::new(measurer, &location, Some(input.to_string()));
		let begin = measurement.begin();
		measurer.run(ExperimentArgs {
			cancel: self.cancel,
			measurement: &mut measurement,
			target: Some(target),
		}).await?;
		measurement.test_runtime = begin.elapsed().as_secs_f64();
		self.store.save_measurement(self.result_id, &measurement)?;
		Ok(measurement)
	}
}

/// A test that can run as part of a group.
#[async_trait]
pub trait Nettest: Send + Sync {
	fn name(&self) -> &str;
	async fn run(&self, ctl: &Controller<'_>) -> Result<()>;
}

/// A labelled, ordered list of nettests.
#[derive(Clone)]
pub struct Group {
	pub label: String,
	pub nettests: Vec<Arc<dyn Nettest>>,
}

/// Test groups by name.
#[derive(Clone, Default)]
pub struct GroupRegistry {
	groups: HashMap<String, Group>,
}

impl GroupRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// The groups this probe ships with.
	pub fn with_defaults(dnscheck: DnsCheckNettest) -> Self {
		let mut registry = Self::new();
		registry.insert("dnscheck", Group {
			label: "DNS Check".to_string(),
			nettests: vec![Arc::new(dnscheck)],
		});
		registry
	}

	pub fn insert(&mut self, name: &str, group: Group) {
		self.groups.insert(name.to_string(), group);
	}

	pub fn get(&self, name: &str) -> Option<&Group> {
		self.groups.get(name)
	}

	pub fn names(&self) -> Vec<&str> {
		let mut names: Vec<&str> = self.groups.keys().map(String::as_str).collect();
		names.sort_unstable();
		names
	}
}

/// Runs dnscheck over every input resolver URL.
pub struct DnsCheckNettest {
	measurer: DnsCheck,
	options: dnscheck::Config,
	csv_output: Option<String>,
}

impl DnsCheckNettest {
	pub fn new(measurer: DnsCheck, options: dnscheck::Config, csv_output: Option<String>) -> Self {
		DnsCheckNettest { measurer, options, csv_output }
	}
}

#[async_trait]
impl Nettest for DnsCheckNettest {
	fn name(&self) -> &str {
		dnscheck::TEST_NAME
	}

	async fn run(&self, ctl: &Controller<'_>) -> Result<()> {
		let inputs = ctl.load_inputs(default_resolver_urls)?;
		output::print_config_summary(&inputs, &self.options, self.measurer.throttle());

		let mut rows: Vec<LookupRow> = Vec::new();
		for (idx, input) in inputs.iter().enumerate() {
			if ctl.is_terminated() {
				info!("interrupted, skipping remaining inputs");
				break;
			}
			info!(
				nettest = ctl.nettest_index + 1,
				of = ctl.nettest_count,
				input = idx + 1,
				inputs = inputs.len(),
				url = %input,
				"dnscheck: starting"
			);
			let target = ExperimentTarget::DnsCheck(dnscheck::Target::new(input.clone(), self.options.clone()));
			let measurement = match ctl.measure(&self.measurer, input, &target).await {
				Ok(m) => m,
				Err(err) => {
					warn!(url = %input, error = %err, "dnscheck: measurement failed");
					continue;
				}
			};
			if let Some(value) = measurement.test_keys {
				let tk: TestKeys = serde_json::from_value(value)?;
				rows.extend(output::lookup_rows(input, &tk));
			}
		}

		output::print_results_table(&rows);
		if let Some(path) = &self.csv_output {
			output::write_csv(path, &rows)?;
		}
		Ok(())
	}
}
