//! Local persistence of networks, results and measurements.
//!
//! ```text
//! <home>/networks.json
//! <home>/results/<id>/result.json
//! <home>/results/<id>/measurement-<n>.json
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreError;
use crate::experiment::{Measurement, ProbeLocation};

/// The network a group run was performed from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
	pub id: i64,
	pub asn: u32,
	pub country_code: String,
	pub network_name: String,
}

/// A group run. Created once, then marked finished once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
	pub id: i64,
	pub test_group_name: String,
	pub network_id: i64,
	pub start_time: DateTime<Utc>,
	pub runtime: f64,
	pub is_done: bool,
	pub measurement_count: u64,
}

/// Storage for group-run records.
pub trait ResultStore: Send + Sync {
	fn create_network(&self, location: &ProbeLocation) -> Result<Network, StoreError>;

	fn create_result(&self, group_name: &str, network_id: i64) -> Result<ResultRecord, StoreError>;

	fn save_measurement(&self, result_id: i64, measurement: &Measurement) -> Result<(), StoreError>;

	/// Mark a result as finished. Finishing twice is an error.
	fn finish_result(&self, result_id: i64) -> Result<(), StoreError>;
}

/// `ResultStore` backed by JSON files under a home directory.
#[derive(Debug)]
pub struct JsonStore {
	home: PathBuf,
	lock: Mutex<()>,
}

impl JsonStore {
	pub fn new(home: impl Into<PathBuf>) -> Result<Self, StoreError> {
		let home = home.into();
		fs::create_dir_all(home.join("results"))?;
		Ok(JsonStore { home, lock: Mutex::new(()) })
	}

	pub fn home(&self) -> &Path {
		&self.home
	}

	pub fn result_dir(&self, result_id: i64) -> PathBuf {
		self.home.join("results").join(result_id.to_string())
	}

	fn networks_path(&self) -> PathBuf {
		self.home.join("networks.json")
	}

	fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
		// The guarded data is (), so a poisoned lock is still usable.
		self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
	}

	fn read_networks(&self) -> Result<Vec<Network>, StoreError> {
		let path = self.networks_path();
		if !path.exists() {
			return Ok(Vec::new());
		}
		Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
	}

	pub fn read_result(&self, result_id: i64) -> Result<ResultRecord, StoreError> {
		let path = self.result_dir(result_id).join("result.json");
		Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
	}

	fn write_result(&self, result: &ResultRecord) -> Result<(), StoreError> {
		write_json(&self.result_dir(result.id).join("result.json"), result)
	}

	fn next_result_id(&self) -> Result<i64, StoreError> {
		let mut max = 0;
		for entry in fs::read_dir(self.home.join("results"))? {
			let entry = entry?;
			if let Some(id) = entry.file_name().to_str().and_then(|n| n.parse::<i64>().ok()) {
				max = max.max(id);
			}
		}
		Ok(max + 1)
	}
}

impl ResultStore for JsonStore {
	fn create_network(&self, location: &ProbeLocation) -> Result<Network, StoreError> {
		let _guard = self.guard();
		let mut networks = self.read_networks()?;
		let network = Network {
			id: networks.iter().map(|n| n.id).max().unwrap_or(0) + 1,
			asn: location.asn,
			country_code: location.country_code.clone(),
			network_name: location.network_name.clone(),
		};
		networks.push(network.clone());
		write_json(&self.networks_path(), &networks)?;
		debug!(id = network.id, asn = network.asn, "created network");
		Ok(network)
	}

	fn create_result(&self, group_name: &str, network_id: i64) -> Result<ResultRecord, StoreError> {
		let _guard = self.guard();
		let result = ResultRecord {
			id: self.next_result_id()?,
			test_group_name: group_name.to_string(),
			network_id,
			start_time: Utc::now(),
			runtime: 0.0,
			is_done: false,
			measurement_count: 0,
		};
		fs::create_dir_all(self.result_dir(result.id))?;
		self.write_result(&result)?;
		debug!(id = result.id, group = group_name, "created result");
		Ok(result)
	}

	fn save_measurement(&self, result_id: i64, measurement: &Measurement) -> Result<(), StoreError> {
		let _guard = self.guard();
		let mut result = self.read_result(result_id)?;
		if result.is_done {
			return Err(StoreError::AlreadyFinished(result_id));
		}
		result.measurement_count += 1;
		let path = self.result_dir(result_id)
			.join(format!("measurement-{}.json", result.measurement_count));
		write_json(&path, measurement)?;
		self.write_result(&result)
	}

	fn finish_result(&self, result_id: i64) -> Result<(), StoreError> {
		let _guard = self.guard();
		let mut result = self.read_result(result_id)?;
		if result.is_done {
			return Err(StoreError::AlreadyFinished(result_id));
		}
		result.is_done = true;
		result.runtime = (Utc::now() - result.start_time).num_milliseconds() as f64 / 1000.0;
		self.write_result(&result)
	}
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
	let data = serde_json::to_vec_pretty(value)?;
	fs::write(path, data)?;
	Ok(())
}
