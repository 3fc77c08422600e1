//! Running a group of nettests as one persisted result.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{RunError, SessionError};
use crate::nettests::{Controller, GroupRegistry};
use crate::session::{Session, SessionFactory};
use crate::store::ResultStore;

/// How long the legacy settings warning stays on screen before the run starts.
pub const LEGACY_NOTICE_PAUSE: Duration = Duration::from_secs(30);

/// Seconds of runtime budgeted per URL when converting the legacy limit.
const SECONDS_PER_URL: i64 = 5;

const WEBSITES_URL_LIMIT_REMOVED: &str = "\
CONFIGURATION CHANGE REQUIRED: websites_url_limit has been replaced by \
websites_max_runtime. Each URL is assumed to take five seconds, so \
websites_max_runtime is derived from websites_url_limit when unset. Set \
websites_url_limit to zero or replace it with websites_max_runtime to \
silence this warning.";

/// Nettest settings shared by every group run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NettestSettings {
	/// Deprecated: superseded by `websites_max_runtime`.
	pub websites_url_limit: i64,
	/// Seconds; zero or less means unlimited.
	pub websites_max_runtime: i64,
}

/// A delay the run controller can be told to wait out.
#[async_trait]
pub trait Pause: Send + Sync {
	async fn pause(&self, duration: Duration);
}

/// Pause on the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioPause;

#[async_trait]
impl Pause for TokioPause {
	async fn pause(&self, duration: Duration) {
		tokio::time::sleep(duration).await;
	}
}

/// Convert the legacy `websites_url_limit` setting.
///
/// Whenever the legacy limit is set, a warning is logged and the run pauses
/// for `LEGACY_NOTICE_PAUSE`. The runtime limit is derived only when it is
/// not already set. Returns whether the legacy limit was present.
pub async fn migrate_settings(settings: &mut NettestSettings, pause: &dyn Pause) -> bool {
	if settings.websites_url_limit <= 0 {
		return false;
	}
	warn!("{}", WEBSITES_URL_LIMIT_REMOVED);
	if settings.websites_max_runtime <= 0 {
		settings.websites_max_runtime = SECONDS_PER_URL * settings.websites_url_limit;
		info!(websites_max_runtime = settings.websites_max_runtime, "derived runtime limit");
	}
	pause.pause(LEGACY_NOTICE_PAUSE).await;
	true
}

/// What to run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunGroupConfig {
	pub group_name: String,
	pub inputs: Vec<String>,
	pub input_files: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
	Created,
	SessionEstablished,
	LocationResolved,
	BackendsDiscovered,
	PerTestLoop,
	Finished,
	Aborted,
}

/// Drives a group run from session setup to a finished result.
pub struct RunController<'a> {
	sessions: &'a dyn SessionFactory,
	store: &'a dyn ResultStore,
	registry: &'a GroupRegistry,
	pause: &'a dyn Pause,
	cancel: CancellationToken,
	settings: NettestSettings,
	settings_migrated: bool,
	state: RunState,
}

impl<'a> RunController<'a> {
	pub fn new(
		sessions: &'a dyn SessionFactory,
		store: &'a dyn ResultStore,
		registry: &'a GroupRegistry,
		pause: &'a dyn Pause,
		cancel: CancellationToken,
		settings: NettestSettings,
	) -> Self {
		RunController {
			sessions,
			store,
			registry,
			pause,
			cancel,
			settings,
			settings_migrated: false,
			state: RunState::Created,
		}
	}

	pub fn state(&self) -> RunState {
		self.state
	}

	pub fn settings(&self) -> &NettestSettings {
		&self.settings
	}

	fn transition(&mut self, next: RunState) {
		debug!(from = ?self.state, to = ?next, "run state");
		self.state = next;
	}

	/// Run every nettest of `config.group_name`.
	///
	/// Setup failures abort the run with nothing persisted. Nettest failures
	/// are logged and skipped. The result is always marked finished once it
	/// exists, and failing to do so fails the run.
	///
	/// Legacy settings are migrated by the first run only.
	pub async fn run_group(&mut self, config: &RunGroupConfig) -> Result<(), RunError> {
		if !self.settings_migrated {
			migrate_settings(&mut self.settings, self.pause).await;
			self.settings_migrated = true;
		}

		if self.cancel.is_cancelled() {
			debug!("run terminated before start, stopping early");
			self.transition(RunState::Finished);
			return Ok(());
		}

		let session = match self.sessions.new_session().await {
			Ok(session) => session,
			Err(err) => {
				error!(error = %err, "failed to create a measurement session");
				self.transition(RunState::Aborted);
				return Err(err.into());
			}
		};

		let outcome = self.run_with_session(session.as_ref(), config).await;
		session.close().await;
		if outcome.is_err() {
			self.transition(RunState::Aborted);
		}
		outcome
	}

	async fn run_with_session(&mut self, session: &dyn Session, config: &RunGroupConfig) -> Result<(), RunError> {
		self.transition(RunState::SessionEstablished);

		session.maybe_lookup_location().await
			.inspect_err(|err| error!(error = %err, "failed to lookup the location of the probe"))?;
		self.transition(RunState::LocationResolved);

		let network = self.store.create_network(&session.location())
			.inspect_err(|err| error!(error = %err, "failed to create the network row"))?;
		session.maybe_lookup_backends().await
			.inspect_err(|err: &SessionError| warn!(error = %err, "failed to discover backends"))?;
		self.transition(RunState::BackendsDiscovered);

		let registry = self.registry;
		let Some(group) = registry.get(&config.group_name) else {
			error!(group = %config.group_name, "no test group with this name");
			return Err(RunError::UnknownGroup(config.group_name.clone()));
		};
		debug!(label = %group.label, "running test group");

		let result = self.store.create_result(&config.group_name, network.id)
			.inspect_err(|err| error!(error = %err, "cannot create result"))?;
		self.transition(RunState::PerTestLoop);

		let count = group.nettests.len();
		for (idx, nettest) in group.nettests.iter().enumerate() {
			if self.cancel.is_cancelled() {
				debug!("run terminated, stopping the nettest loop early");
				break;
			}
			debug!(nettest = nettest.name(), "running test");
			let ctl = Controller {
				session,
				store: self.store,
				result_id: result.id,
				cancel: &self.cancel,
				inputs: &config.inputs,
				input_files: &config.input_files,
				nettest_index: idx,
				nettest_count: count,
			};
			if let Err(err) = nettest.run(&ctl).await {
				error!(group = %group.label, nettest = nettest.name(), error = %err, "failed to run nettest");
			}
		}

		self.store.finish_result(result.id)?;
		self.transition(RunState::Finished);
		info!(result = result.id, group = %config.group_name, "result finished");
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
	use std::sync::{Arc, Mutex};

	use tokio::time::Instant;

	use crate::experiment::ProbeLocation;
	use crate::nettests::{Group, Nettest};
	use crate::store::memory::MemoryStore;

	#[derive(Default)]
	struct RecordingPause {
		pauses: Mutex<Vec<Duration>>,
	}

	#[async_trait]
	impl Pause for RecordingPause {
		async fn pause(&self, duration: Duration) {
			self.pauses.lock().unwrap().push(duration);
		}
	}

	#[derive(Default, Clone)]
	struct SessionBehaviour {
		fail_create: bool,
		fail_location: bool,
		fail_backends: bool,
	}

	struct FakeSession {
		behaviour: SessionBehaviour,
		closed: Arc<AtomicBool>,
	}

	#[async_trait]
	impl Session for FakeSession {
		async fn maybe_lookup_location(&self) -> Result<(), SessionError> {
			if self.behaviour.fail_location {
				return Err(SessionError::Location("geoip unavailable".to_string()));
			}
			Ok(())
		}

		fn location(&self) -> ProbeLocation {
			ProbeLocation { asn: 30722, country_code: "IT".to_string(), ..Default::default() }
		}

		async fn maybe_lookup_backends(&self) -> Result<(), SessionError> {
			if self.behaviour.fail_backends {
				return Err(SessionError::Backends("no backend reachable".to_string()));
			}
			Ok(())
		}

		async fn close(&self) {
			self.closed.store(true, Ordering::SeqCst);
		}
	}

	#[derive(Default)]
	struct FakeFactory {
		behaviour: SessionBehaviour,
		created: AtomicUsize,
		closed: Arc<AtomicBool>,
	}

	impl FakeFactory {
		fn with(behaviour: SessionBehaviour) -> Self {
			FakeFactory { behaviour, ..Default::default() }
		}
	}

	#[async_trait]
	impl SessionFactory for FakeFactory {
		async fn new_session(&self) -> Result<Box<dyn Session>, SessionError> {
			if self.behaviour.fail_create {
				return Err(SessionError::Create("no network".to_string()));
			}
			self.created.fetch_add(1, Ordering::SeqCst);
			Ok(Box::new(FakeSession { behaviour: self.behaviour.clone(), closed: self.closed.clone() }))
		}
	}

	struct FakeNettest {
		name: &'static str,
		fail: bool,
		cancel: Option<CancellationToken>,
		ran: Arc<Mutex<Vec<&'static str>>>,
	}

	#[async_trait]
	impl Nettest for FakeNettest {
		fn name(&self) -> &str {
			self.name
		}

		async fn run(&self, ctl: &Controller<'_>) -> anyhow::Result<()> {
			self.ran.lock().unwrap().push(self.name);
			assert_eq!(ctl.result_id, 1);
			if let Some(cancel) = &self.cancel {
				cancel.cancel();
			}
			if self.fail {
				anyhow::bail!("{} exploded", self.name);
			}
			Ok(())
		}
	}

	struct Harness {
		factory: FakeFactory,
		store: MemoryStore,
		registry: GroupRegistry,
		pause: RecordingPause,
		cancel: CancellationToken,
		ran: Arc<Mutex<Vec<&'static str>>>,
	}

	impl Harness {
		fn new(factory: FakeFactory, store: MemoryStore) -> Self {
			Harness {
				factory,
				store,
				registry: GroupRegistry::new(),
				pause: RecordingPause::default(),
				cancel: CancellationToken::new(),
				ran: Arc::default(),
			}
		}

		/// Register group "test" with nettests named by `spec`: a trailing
		/// '!' fails the nettest, a trailing '^' cancels the run.
		fn group(mut self, spec: &[&'static str]) -> Self {
			let nettests = spec.iter()
				.map(|&name| {
					let nettest: Arc<dyn Nettest> = Arc::new(FakeNettest {
						name,
						fail: name.ends_with('!'),
						cancel: name.ends_with('^').then(|| self.cancel.clone()),
						ran: self.ran.clone(),
					});
					nettest
				})
				.collect();
			self.registry.insert("test", Group { label: "Test".to_string(), nettests });
			self
		}

		async fn run(&self, settings: NettestSettings) -> (Result<(), RunError>, RunState) {
			let mut controller = RunController::new(
				&self.factory, &self.store, &self.registry, &self.pause, self.cancel.clone(), settings,
			);
			let config = RunGroupConfig { group_name: "test".to_string(), ..Default::default() };
			let outcome = controller.run_group(&config).await;
			(outcome, controller.state())
		}

		fn ran(&self) -> Vec<&'static str> {
			self.ran.lock().unwrap().clone()
		}
	}

	fn settings(url_limit: i64, max_runtime: i64) -> NettestSettings {
		NettestSettings { websites_url_limit: url_limit, websites_max_runtime: max_runtime }
	}

	#[tokio::test]
	async fn test_failing_nettest_does_not_stop_group() {
		let harness = Harness::new(FakeFactory::default(), MemoryStore::default())
			.group(&["first", "second!", "third"]);
		let (outcome, state) = harness.run(NettestSettings::default()).await;
		assert!(outcome.is_ok());
		assert_eq!(state, RunState::Finished);
		assert_eq!(harness.ran(), vec!["first", "second!", "third"]);

		let store = harness.store.state();
		assert_eq!(store.finish_calls, 1);
		assert!(store.results[0].is_done);
		assert_eq!(store.results[0].network_id, store.networks[0].id);
		assert_eq!(store.networks[0].asn, 30722);
		assert!(harness.factory.closed.load(Ordering::SeqCst));
	}

	#[tokio::test]
	async fn test_terminated_before_start_is_a_noop() {
		let harness = Harness::new(FakeFactory::default(), MemoryStore::default()).group(&["first"]);
		harness.cancel.cancel();
		let (outcome, state) = harness.run(NettestSettings::default()).await;
		assert!(outcome.is_ok());
		assert_eq!(state, RunState::Finished);
		assert_eq!(harness.factory.created.load(Ordering::SeqCst), 0);
		assert!(harness.ran().is_empty());
		assert!(harness.store.state().results.is_empty());
	}

	#[tokio::test]
	async fn test_termination_stops_loop_but_finishes() {
		let harness = Harness::new(FakeFactory::default(), MemoryStore::default())
			.group(&["first^", "second"]);
		let (outcome, state) = harness.run(NettestSettings::default()).await;
		assert!(outcome.is_ok());
		assert_eq!(state, RunState::Finished);
		assert_eq!(harness.ran(), vec!["first^"]);
		assert_eq!(harness.store.state().finish_calls, 1);
	}

	#[tokio::test]
	async fn test_session_creation_failure_aborts() {
		let factory = FakeFactory::with(SessionBehaviour { fail_create: true, ..Default::default() });
		let harness = Harness::new(factory, MemoryStore::default()).group(&["first"]);
		let (outcome, state) = harness.run(NettestSettings::default()).await;
		assert!(matches!(outcome, Err(RunError::Session(SessionError::Create(_)))));
		assert_eq!(state, RunState::Aborted);
		assert!(harness.ran().is_empty());
	}

	#[tokio::test]
	async fn test_location_failure_aborts_and_closes_session() {
		let factory = FakeFactory::with(SessionBehaviour { fail_location: true, ..Default::default() });
		let harness = Harness::new(factory, MemoryStore::default()).group(&["first"]);
		let (outcome, state) = harness.run(NettestSettings::default()).await;
		assert!(matches!(outcome, Err(RunError::Session(SessionError::Location(_)))));
		assert_eq!(state, RunState::Aborted);
		assert!(harness.factory.closed.load(Ordering::SeqCst));
		assert!(harness.store.state().networks.is_empty());
		assert!(harness.store.state().results.is_empty());
	}

	#[tokio::test]
	async fn test_backend_failure_aborts_without_result() {
		let factory = FakeFactory::with(SessionBehaviour { fail_backends: true, ..Default::default() });
		let harness = Harness::new(factory, MemoryStore::default()).group(&["first"]);
		let (outcome, state) = harness.run(NettestSettings::default()).await;
		assert!(matches!(outcome, Err(RunError::Session(SessionError::Backends(_)))));
		assert_eq!(state, RunState::Aborted);
		assert!(harness.store.state().results.is_empty());
		assert!(harness.ran().is_empty());
	}

	#[tokio::test]
	async fn test_unknown_group_aborts() {
		let harness = Harness::new(FakeFactory::default(), MemoryStore::default());
		let (outcome, state) = harness.run(NettestSettings::default()).await;
		assert!(matches!(outcome, Err(RunError::UnknownGroup(name)) if name == "test"));
		assert_eq!(state, RunState::Aborted);
		assert!(harness.store.state().results.is_empty());
		assert!(harness.factory.closed.load(Ordering::SeqCst));
	}

	#[tokio::test]
	async fn test_result_creation_failure_aborts() {
		let store = MemoryStore { fail_create_result: true, ..Default::default() };
		let harness = Harness::new(FakeFactory::default(), store).group(&["first"]);
		let (outcome, state) = harness.run(NettestSettings::default()).await;
		assert!(matches!(outcome, Err(RunError::Store(_))));
		assert_eq!(state, RunState::Aborted);
		assert!(harness.ran().is_empty());
	}

	#[tokio::test]
	async fn test_finish_failure_is_fatal() {
		let harness = Harness::new(FakeFactory::default(), MemoryStore::failing_finish())
			.group(&["first", "second"]);
		let (outcome, state) = harness.run(NettestSettings::default()).await;
		assert!(matches!(outcome, Err(RunError::Store(_))));
		assert_eq!(state, RunState::Aborted);
		assert_eq!(harness.ran(), vec!["first", "second"]);
		assert_eq!(harness.store.state().finish_calls, 1);
	}

	#[tokio::test]
	async fn test_legacy_limit_is_migrated() {
		let pause = RecordingPause::default();
		let mut migrated = settings(10, 0);
		assert!(migrate_settings(&mut migrated, &pause).await);
		assert_eq!(migrated.websites_max_runtime, 50);
		assert_eq!(*pause.pauses.lock().unwrap(), vec![LEGACY_NOTICE_PAUSE]);
	}

	#[tokio::test]
	async fn test_legacy_limit_keeps_explicit_runtime() {
		let pause = RecordingPause::default();
		let mut migrated = settings(10, 90);
		assert!(migrate_settings(&mut migrated, &pause).await);
		assert_eq!(migrated.websites_max_runtime, 90);
		assert_eq!(pause.pauses.lock().unwrap().len(), 1);
	}

	#[tokio::test]
	async fn test_no_legacy_limit_no_pause() {
		let pause = RecordingPause::default();
		let mut unchanged = settings(0, 0);
		assert!(!migrate_settings(&mut unchanged, &pause).await);
		assert_eq!(unchanged, settings(0, 0));
		assert!(pause.pauses.lock().unwrap().is_empty());
	}

	#[tokio::test]
	async fn test_run_applies_migration() {
		let harness = Harness::new(FakeFactory::default(), MemoryStore::default()).group(&["first"]);
		let mut controller = RunController::new(
			&harness.factory, &harness.store, &harness.registry, &harness.pause,
			harness.cancel.clone(), settings(4, 0),
		);
		let config = RunGroupConfig { group_name: "test".to_string(), ..Default::default() };
		controller.run_group(&config).await.unwrap();
		assert_eq!(controller.settings().websites_max_runtime, 20);
		assert_eq!(harness.pause.pauses.lock().unwrap().len(), 1);
	}

	#[tokio::test]
	async fn test_reused_controller_migrates_once() {
		let harness = Harness::new(FakeFactory::default(), MemoryStore::default());
		let mut controller = RunController::new(
			&harness.factory, &harness.store, &harness.registry, &harness.pause,
			harness.cancel.clone(), settings(4, 0),
		);
		let config = RunGroupConfig { group_name: "missing".to_string(), ..Default::default() };
		for _ in 0..2 {
			assert!(matches!(controller.run_group(&config).await, Err(RunError::UnknownGroup(_))));
		}
		assert_eq!(controller.settings().websites_max_runtime, 20);
		assert_eq!(*harness.pause.pauses.lock().unwrap(), vec![LEGACY_NOTICE_PAUSE]);
	}

	#[tokio::test(start_paused = true)]
	async fn test_tokio_pause_waits() {
		let start = Instant::now();
		TokioPause.pause(LEGACY_NOTICE_PAUSE).await;
		assert_eq!(start.elapsed(), LEGACY_NOTICE_PAUSE);
	}
}
