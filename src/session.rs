use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use crate::error::SessionError;
use crate::experiment::ProbeLocation;

/// A measurement session: where the probe is and which backends it talks to.
#[async_trait]
pub trait Session: Send + Sync {
	/// Discover the probe location, unless already known.
	async fn maybe_lookup_location(&self) -> Result<(), SessionError>;

	/// The location discovered so far.
	fn location(&self) -> ProbeLocation;

	/// Discover the backends to submit to, unless already known.
	async fn maybe_lookup_backends(&self) -> Result<(), SessionError>;

	/// Release session resources. Safe to call more than once.
	async fn close(&self);
}

/// Creates sessions for group runs.
#[async_trait]
pub trait SessionFactory: Send + Sync {
	async fn new_session(&self) -> Result<Box<dyn Session>, SessionError>;
}

/// Session that never touches the network.
///
/// The location is unknown (`AS0`, `ZZ`) and no backends are discovered,
/// so measurements are only kept locally.
#[derive(Debug, Default)]
pub struct OfflineSession {
	location: Mutex<Option<ProbeLocation>>,
	closed: AtomicBool,
}

impl OfflineSession {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl Session for OfflineSession {
	async fn maybe_lookup_location(&self) -> Result<(), SessionError> {
		let mut location = self.location.lock()
			.map_err(|_| SessionError::Location("location lock poisoned".to_string()))?;
		location.get_or_insert_with(ProbeLocation::unknown);
		Ok(())
	}

	fn location(&self) -> ProbeLocation {
		self.location.lock()
			.ok()
			.and_then(|l| l.clone())
			.unwrap_or_else(ProbeLocation::unknown)
	}

	async fn maybe_lookup_backends(&self) -> Result<(), SessionError> {
		debug!("offline session: no backends to discover");
		Ok(())
	}

	async fn close(&self) {
		self.closed.store(true, Ordering::SeqCst);
	}
}

/// Factory for `OfflineSession`s.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineSessionFactory;

#[async_trait]
impl SessionFactory for OfflineSessionFactory {
	async fn new_session(&self) -> Result<Box<dyn Session>, SessionError> {
		Ok(Box::new(OfflineSession::new()))
	}
}
