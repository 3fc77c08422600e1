use comfy_table::{Table, ContentArrangement, presets::UTF8_FULL};

use anyhow::Result;

use crate::dnscheck::{Config, TestKeys};
use crate::throttle::Throttle;

/// One probed resolver URL, flattened for display.
#[derive(Debug, Clone, PartialEq)]
pub struct LookupRow {
	pub input: String,
	pub resolver_url: String,
	pub addresses: Vec<String>,
	pub failure: Option<String>,
}

impl LookupRow {
	pub fn status(&self) -> &str {
		self.failure.as_deref().unwrap_or("success")
	}
}

/// Flatten the lookups of one measurement into rows.
pub fn lookup_rows(input: &str, tk: &TestKeys) -> Vec<LookupRow> {
	tk.lookups.iter()
		.map(|(resolver_url, keys)| LookupRow {
			input: input.to_string(),
			resolver_url: resolver_url.clone(),
			addresses: keys.addresses(),
			failure: keys.failure.clone(),
		})
		.collect()
}

/// Print what is about to be measured.
pub fn print_config_summary(inputs: &[String], options: &Config, throttle: &Throttle) {
	println!("DNS Check Configuration");
	println!("=======================");
	println!("Resolvers:      {}", inputs.len());
	for input in inputs {
		println!("  - {}", input);
	}
	println!("Domain:         {}", options.domain());
	if !options.default_addrs.is_empty() {
		println!("Default addrs:  {}", options.default_addrs);
	}
	let residual = if throttle.is_active() { "yes" } else { "no" };
	println!("Residual wait:  {}", residual);
	println!();
}

/// Print the lookups as a formatted table.
pub fn print_results_table(rows: &[LookupRow]) {
	let mut table = Table::new();
	table.load_preset(UTF8_FULL);
	table.set_content_arrangement(ContentArrangement::Dynamic);
	table.set_header(vec!["Input", "Resolver URL", "Status", "Addresses"]);

	for row in rows {
		table.add_row(vec![
			row.input.clone(),
			row.resolver_url.clone(),
			row.status().to_string(),
			row.addresses.join(" "),
		]);
	}

	let failed = rows.iter().filter(|r| r.failure.is_some()).count();
	println!("\nDNS Check Results");
	println!("=================\n");
	println!("{table}");
	println!("{} lookup(s), {} failed", rows.len(), failed);
}

/// Write one CSV row per lookup.
pub fn write_csv(path: &str, rows: &[LookupRow]) -> Result<()> {
	let mut writer = csv::Writer::from_path(path)?;
	write_rows(&mut writer, rows)?;
	println!("\nResults written to: {}", path);
	Ok(())
}

fn write_rows<W: std::io::Write>(writer: &mut csv::Writer<W>, rows: &[LookupRow]) -> Result<()> {
	writer.write_record(["input", "resolver_url", "status", "addresses"])?;
	for row in rows {
		writer.write_record([
			row.input.as_str(),
			row.resolver_url.as_str(),
			row.status(),
			row.addresses.join(" ").as_str(),
		])?;
	}
	writer.flush()?;
	Ok(())
}
