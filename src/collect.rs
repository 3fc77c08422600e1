use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{error_to_string_or_ok, FetchError};
use crate::exchange::Fetcher;
use crate::throttle::Throttle;
use crate::transport::{ProbeInput, ProbeKeys, ProbeOutput};

/// Upper bound on concurrently running probes of one measurement.
pub const MAX_PARALLELISM: usize = 10;

/// Runs many probe tasks through a bounded pool.
#[derive(Clone)]
pub struct Multi {
	pub begin: Instant,
	pub parallelism: usize,
	pub fetcher: Arc<dyn Fetcher>,
	pub throttle: Throttle,
	pub cancel: CancellationToken,
}

impl Multi {
	/// Start one task per input and return a stream of their outputs.
	///
	/// Outputs arrive in completion order. Exactly `inputs.len()` outputs
	/// are sent, after which the stream closes.
	pub fn run(&self, inputs: Vec<ProbeInput>) -> mpsc::Receiver<ProbeOutput> {
		let expect = inputs.len();
		let (tx, rx) = mpsc::channel(expect.max(1));
		let parallelism = self.parallelism.max(1).min(expect);
		let semaphore = Arc::new(Semaphore::new(parallelism));

		let mut tasks = JoinSet::new();
		for (idx, input) in inputs.iter().cloned().enumerate() {
			let semaphore = semaphore.clone();
			let fetcher = self.fetcher.clone();
			let throttle = self.throttle.clone();
			let cancel = self.cancel.clone();
			let begin = self.begin;

			tasks.spawn(async move {
				let resolver_url = input.config.resolver_url.clone();
				// Cancellation covers the residual wait as well as the fetch.
				let (test_keys, err) = tokio::select! {
					biased;
					_ = cancel.cancelled() => failed(FetchError::Cancelled),
					fetched = async {
						throttle.maybe_sleep(&resolver_url).await;
						// The semaphore is never closed, so acquiring cannot fail.
						let _permit = semaphore.acquire_owned().await.ok();
						fetcher.fetch(&input, begin).await
					} => fetched,
				};

				throttle.maybe_register(&resolver_url);
				(idx, ProbeOutput { input, err, test_keys })
			});
		}

		let throttle = self.throttle.clone();
		tokio::spawn(async move {
			let mut delivered = vec![false; expect];
			while let Some(joined) = tasks.join_next().await {
				match joined {
					Ok((idx, output)) => {
						delivered[idx] = true;
						if tx.send(output).await.is_err() {
							return;
						}
					}
					Err(err) => warn!(error = %err, "probe task did not complete"),
				}
			}
			// A task that panicked still owes its input an output, and its
			// endpoint was contacted all the same.
			for (input, done) in inputs.into_iter().zip(delivered) {
				if done {
					continue;
				}
				throttle.maybe_register(&input.config.resolver_url);
				let (test_keys, err) = failed(FetchError::Other("probe task failed".to_string()));
				if tx.send(ProbeOutput { input, err, test_keys }).await.is_err() {
					return;
				}
			}
		});

		rx
	}
}

fn failed(err: FetchError) -> (ProbeKeys, Option<FetchError>) {
	let keys = ProbeKeys { queries: Vec::new(), failure: Some(err.failure()) };
	(keys, Some(err))
}

/// Run every input through `multi` and forward the outputs, logging the
/// status of each completed probe. The returned stream closes after the
/// last output.
pub fn collect(multi: &Multi, inputs: Vec<ProbeInput>) -> mpsc::Receiver<ProbeOutput> {
	let expect = inputs.len();
	let (tx, rx) = mpsc::channel(expect.max(1));
	let mut inputch = multi.run(inputs);
	tokio::spawn(async move {
		let mut count = 0;
		while count < expect {
			let Some(entry) = inputch.recv().await else {
				break;
			};
			count += 1;
			info!(
				resolver_url = %entry.input.config.resolver_url,
				status = %error_to_string_or_ok(entry.err.as_ref()),
				"dnscheck: measure"
			);
			if tx.send(entry).await.is_err() {
				break;
			}
		}
	});
	rx
}
