use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::info;

use crate::resolver::ResolverScheme;

/// How long to wait before probing the same resolver URL again.
pub const DEFAULT_WAIT_TIME: Duration = Duration::from_secs(180);

/// Tracks, per resolver URL, the earliest time it may be probed again.
///
/// Probing the same endpoint in a short window may itself trigger blocking
/// (residual censorship), so probes against a recently measured endpoint
/// are delayed until the window has elapsed.
#[derive(Debug)]
pub struct Endpoints {
	wait_time: Duration,
	waits: AtomicU64,
	next_visit: DashMap<String, Instant>,
}

impl Endpoints {
	/// A zero `wait_time` selects `DEFAULT_WAIT_TIME`.
	pub fn new(wait_time: Duration) -> Self {
		let wait_time = if wait_time.is_zero() { DEFAULT_WAIT_TIME } else { wait_time };
		Endpoints {
			wait_time,
			waits: AtomicU64::new(0),
			next_visit: DashMap::new(),
		}
	}

	pub fn wait_time(&self) -> Duration {
		self.wait_time
	}

	/// Number of times a probe had to wait.
	pub fn wait_count(&self) -> u64 {
		self.waits.load(Ordering::Relaxed)
	}

	/// Wait until `resolver_url` may be probed again.
	///
	/// Only the lookup of the next-visit time is serialized; the wait itself
	/// happens outside the map so other resolver URLs are not held up.
	pub async fn maybe_sleep(&self, resolver_url: &str) {
		let remaining = match self.next_visit.get(resolver_url) {
			Some(next) => next.saturating_duration_since(Instant::now()),
			None => return,
		};
		if remaining.is_zero() {
			return;
		}
		self.waits.fetch_add(1, Ordering::Relaxed);
		info!(resolver_url, wait = ?remaining, "waiting before testing resolver again");
		tokio::time::sleep(remaining).await;
	}

	/// Record that `resolver_url` was just probed.
	///
	/// Plaintext UDP resolvers are exempt.
	pub fn maybe_register(&self, resolver_url: &str) {
		if is_udp(resolver_url) {
			return;
		}
		self.next_visit.insert(resolver_url.to_string(), Instant::now() + self.wait_time);
	}
}

fn is_udp(resolver_url: &str) -> bool {
	resolver_url.split_once("://")
		.and_then(|(scheme, _)| ResolverScheme::parse(scheme))
		== Some(ResolverScheme::Udp)
}

/// Optional throttle shared by all probes of a measurer.
///
/// A disabled throttle turns both operations into no-ops.
#[derive(Debug, Clone, Default)]
pub struct Throttle {
	endpoints: Option<Arc<Endpoints>>,
}

impl Throttle {
	pub fn disabled() -> Self {
		Throttle { endpoints: None }
	}

	pub fn enabled(wait_time: Duration) -> Self {
		Throttle { endpoints: Some(Arc::new(Endpoints::new(wait_time))) }
	}

	pub fn is_active(&self) -> bool {
		self.endpoints.is_some()
	}

	pub fn wait_count(&self) -> u64 {
		self.endpoints.as_ref().map_or(0, |e| e.wait_count())
	}

	pub async fn maybe_sleep(&self, resolver_url: &str) {
		if let Some(endpoints) = &self.endpoints {
			endpoints.maybe_sleep(resolver_url).await;
		}
	}

	pub fn maybe_register(&self, resolver_url: &str) {
		if let Some(endpoints) = &self.endpoints {
			endpoints.maybe_register(resolver_url);
		}
	}
}
