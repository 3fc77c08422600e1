use std::collections::BTreeSet;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::ResponseCode;
use hickory_proto::ProtoErrorKind;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::{ResolveError, Resolver, TokioResolver};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::dns::is_bogon;
use crate::error::FetchError;
use crate::resolver::ResolverUrl;
use crate::transport::{DnsAnswer, DnsQueryEvent, QueryType};

/// Upper bound for the bootstrap lookup.
pub const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(10);

/// Query events recorded while a bootstrap lookup runs.
///
/// The log outlives the lookup, so events recorded before a timeout or
/// cancellation are kept.
#[derive(Debug, Default)]
pub struct QueryLog {
	events: Mutex<Vec<DnsQueryEvent>>,
}

impl QueryLog {
	pub fn record(&self, event: DnsQueryEvent) {
		self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push(event);
	}

	pub fn into_events(self) -> Vec<DnsQueryEvent> {
		self.events.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner())
	}
}

/// Resolver used to discover the addresses behind a resolver URL's host.
///
/// Implementations record the queries they perform in `log`; literal
/// addresses are returned as-is and produce no query events.
#[async_trait]
pub trait BootstrapResolver: Send + Sync {
	async fn lookup_host(
		&self,
		hostname: &str,
		begin: Instant,
		log: &QueryLog,
	) -> Result<Vec<IpAddr>, FetchError>;
}

/// Bootstrap resolver backed by the system's DNS configuration.
pub struct SystemBootstrap {
	resolver: TokioResolver,
	reject_bogons: bool,
}

impl SystemBootstrap {
	pub fn new() -> Self {
		let resolver = match Resolver::builder_tokio() {
			Ok(builder) => builder.build(),
			Err(err) => {
				warn!(error = %err, "cannot read system resolver config, using defaults");
				Resolver::builder_with_config(
					ResolverConfig::default(),
					TokioConnectionProvider::default(),
				).build()
			}
		};
		SystemBootstrap { resolver, reject_bogons: true }
	}

	async fn query(&self, hostname: &str, query_type: QueryType) -> Result<Vec<IpAddr>, FetchError> {
		let addrs: Vec<IpAddr> = match query_type {
			QueryType::A => self.resolver.ipv4_lookup(hostname).await
				.map_err(|err| map_resolve_error(&err))?
				.iter()
				.map(|a| IpAddr::V4(a.0))
				.collect(),
			QueryType::AAAA => self.resolver.ipv6_lookup(hostname).await
				.map_err(|err| map_resolve_error(&err))?
				.iter()
				.map(|aaaa| IpAddr::V6(aaaa.0))
				.collect(),
		};
		if addrs.is_empty() {
			return Err(FetchError::NoAnswer);
		}
		if self.reject_bogons && addrs.iter().any(|ip| is_bogon(*ip)) {
			return Err(FetchError::Bogon);
		}
		Ok(addrs)
	}
}

impl Default for SystemBootstrap {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl BootstrapResolver for SystemBootstrap {
	async fn lookup_host(
		&self,
		hostname: &str,
		begin: Instant,
		log: &QueryLog,
	) -> Result<Vec<IpAddr>, FetchError> {
		if let Ok(ip) = hostname.parse::<IpAddr>() {
			return Ok(vec![ip]);
		}
		resolve_both(
			hostname,
			begin,
			log,
			self.query(hostname, QueryType::A),
			self.query(hostname, QueryType::AAAA),
		).await
	}
}

/// Run the A and AAAA queries concurrently, recording one event for each
/// as soon as it completes.
///
/// Succeeds when either query found addresses; otherwise the A failure
/// wins over the AAAA one.
pub async fn resolve_both<A, Aaaa>(
	hostname: &str,
	begin: Instant,
	log: &QueryLog,
	a: A,
	aaaa: Aaaa,
) -> Result<Vec<IpAddr>, FetchError>
where
	A: Future<Output = Result<Vec<IpAddr>, FetchError>>,
	Aaaa: Future<Output = Result<Vec<IpAddr>, FetchError>>,
{
	let (a, aaaa) = tokio::join!(
		traced(hostname, QueryType::A, begin, log, a),
		traced(hostname, QueryType::AAAA, begin, log, aaaa),
	);

	let mut addrs = Vec::new();
	let mut first_err = None;
	for result in [a, aaaa] {
		match result {
			Ok(found) => addrs.extend(found),
			Err(err) => {
				first_err.get_or_insert(err);
			}
		}
	}
	match (addrs.is_empty(), first_err) {
		(false, _) => Ok(addrs),
		(true, Some(err)) => Err(err),
		(true, None) => Err(FetchError::NoAnswer),
	}
}

async fn traced<F>(
	hostname: &str,
	query_type: QueryType,
	begin: Instant,
	log: &QueryLog,
	query: F,
) -> Result<Vec<IpAddr>, FetchError>
where
	F: Future<Output = Result<Vec<IpAddr>, FetchError>>,
{
	let t0 = begin.elapsed().as_secs_f64();
	let result = query.await;
	let (answers, failure) = match &result {
		Ok(found) => (found.iter().copied().map(DnsAnswer::from_ip).collect(), None),
		Err(err) => (Vec::new(), Some(err.failure())),
	};
	log.record(DnsQueryEvent {
		engine: "system".to_string(),
		resolver_address: String::new(),
		hostname: hostname.to_string(),
		query_type,
		answers,
		failure,
		t0,
		t: begin.elapsed().as_secs_f64(),
	});
	result
}

/// Classify a resolver error by its kind and response code.
fn map_resolve_error(err: &ResolveError) -> FetchError {
	let Some(proto) = err.proto() else {
		return FetchError::Other(err.to_string());
	};
	match proto.kind() {
		ProtoErrorKind::NoRecordsFound { response_code, .. } => match response_code {
			ResponseCode::NXDomain => FetchError::NxDomain,
			ResponseCode::ServFail => FetchError::ServerFailure,
			ResponseCode::Refused => FetchError::Refused,
			_ => FetchError::NoAnswer,
		},
		ProtoErrorKind::Timeout => FetchError::Timeout,
		_ => FetchError::Other(err.to_string()),
	}
}

/// Addresses to probe, plus the trace of the lookup that found them.
#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
	pub addrs: BTreeSet<IpAddr>,
	pub queries: Vec<DnsQueryEvent>,
	pub failure: Option<String>,
}

/// Resolve the resolver URL's host and merge the result with the
/// space-separated `default_addrs`.
///
/// A failed lookup is not an error: the failure is recorded and the
/// default addresses alone form the candidate set. Query events recorded
/// before a timeout or cancellation are kept.
pub async fn build_candidate_set(
	resolver: &dyn BootstrapResolver,
	url: &ResolverUrl,
	default_addrs: &str,
	cancel: &CancellationToken,
	begin: Instant,
) -> CandidateSet {
	let log = QueryLog::default();
	let addrs = tokio::select! {
		biased;
		_ = cancel.cancelled() => Err(FetchError::Cancelled),
		result = tokio::time::timeout(BOOTSTRAP_TIMEOUT, resolver.lookup_host(url.hostname(), begin, &log)) => {
			result.unwrap_or(Err(FetchError::Timeout))
		}
	};

	let mut set = CandidateSet { queries: log.into_events(), ..Default::default() };
	match addrs {
		Ok(addrs) => set.addrs.extend(addrs),
		Err(err) => {
			debug!(hostname = url.hostname(), failure = %err, "bootstrap lookup failed");
			set.failure = Some(err.failure());
		}
	}
	set.addrs.extend(parse_default_addrs(default_addrs));
	set
}

/// Split a space-separated address list, dropping empty and invalid tokens.
pub fn parse_default_addrs(default_addrs: &str) -> Vec<IpAddr> {
	default_addrs.split(' ')
		.filter(|token| !token.is_empty())
		.filter_map(|token| match token.parse::<IpAddr>() {
			Ok(ip) => Some(ip),
			Err(_) => {
				warn!(addr = token, "ignoring default address that is not an IP address");
				None
			}
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use hickory_proto::op::Query;
	use hickory_proto::rr::{Name, RecordType};
	use hickory_proto::ProtoError;

	struct FixedResolver(Result<Vec<IpAddr>, FetchError>);

	#[async_trait]
	impl BootstrapResolver for FixedResolver {
		async fn lookup_host(
			&self,
			hostname: &str,
			begin: Instant,
			log: &QueryLog,
		) -> Result<Vec<IpAddr>, FetchError> {
			traced(hostname, QueryType::A, begin, log, async { self.0.clone() }).await
		}
	}

	struct HangingResolver;

	#[async_trait]
	impl BootstrapResolver for HangingResolver {
		async fn lookup_host(
			&self,
			_hostname: &str,
			_begin: Instant,
			_log: &QueryLog,
		) -> Result<Vec<IpAddr>, FetchError> {
			std::future::pending().await
		}
	}

	/// A answers immediately, AAAA never does.
	struct StalledAaaaResolver;

	#[async_trait]
	impl BootstrapResolver for StalledAaaaResolver {
		async fn lookup_host(
			&self,
			hostname: &str,
			begin: Instant,
			log: &QueryLog,
		) -> Result<Vec<IpAddr>, FetchError> {
			resolve_both(
				hostname,
				begin,
				log,
				async { Ok(vec![ip("8.8.8.8")]) },
				std::future::pending(),
			).await
		}
	}

	fn ip(s: &str) -> IpAddr {
		s.parse().unwrap()
	}

	fn no_records(response_code: ResponseCode) -> ResolveError {
		let query = Query::query(Name::root(), RecordType::A);
		ProtoError::nx_error(Box::new(query), None, None, None, response_code, false, None).into()
	}

	#[test]
	fn test_parse_default_addrs() {
		let addrs = parse_default_addrs(" 8.8.8.8  2001:4860:4860::8888 not-an-ip ");
		assert_eq!(addrs, vec![ip("8.8.8.8"), ip("2001:4860:4860::8888")]);
		assert!(parse_default_addrs("").is_empty());
	}

	#[test]
	fn test_resolve_errors_map_by_response_code() {
		assert_eq!(map_resolve_error(&no_records(ResponseCode::NXDomain)), FetchError::NxDomain);
		assert_eq!(map_resolve_error(&no_records(ResponseCode::ServFail)), FetchError::ServerFailure);
		assert_eq!(map_resolve_error(&no_records(ResponseCode::Refused)), FetchError::Refused);
		assert_eq!(map_resolve_error(&no_records(ResponseCode::NoError)), FetchError::NoAnswer);

		let timeout: ResolveError = ProtoError::from(ProtoErrorKind::Timeout).into();
		assert_eq!(map_resolve_error(&timeout), FetchError::Timeout);
	}

	#[tokio::test]
	async fn test_merges_lookup_with_defaults() {
		let resolver = FixedResolver(Ok(vec![ip("8.8.8.8"), ip("8.8.4.4")]));
		let url = ResolverUrl::parse("dot://dns.google").unwrap();
		let set = build_candidate_set(
			&resolver, &url, "8.8.8.8 1.2.3.4", &CancellationToken::new(), Instant::now(),
		).await;
		let expected: BTreeSet<IpAddr> = [ip("8.8.8.8"), ip("8.8.4.4"), ip("1.2.3.4")].into();
		assert_eq!(set.addrs, expected);
		assert!(set.failure.is_none());
		assert_eq!(set.queries.len(), 1);
		assert_eq!(set.queries[0].answers.len(), 2);
	}

	#[tokio::test]
	async fn test_failed_lookup_keeps_defaults() {
		let resolver = FixedResolver(Err(FetchError::NxDomain));
		let url = ResolverUrl::parse("https://dns.example/dns-query").unwrap();
		let set = build_candidate_set(
			&resolver, &url, "1.1.1.1", &CancellationToken::new(), Instant::now(),
		).await;
		assert_eq!(set.failure.as_deref(), Some("dns_nxdomain_error"));
		assert_eq!(set.addrs.len(), 1);
		assert_eq!(set.queries[0].failure.as_deref(), Some("dns_nxdomain_error"));
	}

	#[tokio::test]
	async fn test_failed_lookup_without_defaults_is_empty() {
		let resolver = FixedResolver(Err(FetchError::NxDomain));
		let url = ResolverUrl::parse("https://dns.example/dns-query").unwrap();
		let set = build_candidate_set(
			&resolver, &url, "", &CancellationToken::new(), Instant::now(),
		).await;
		assert!(set.addrs.is_empty());
		assert!(set.failure.is_some());
	}

	#[tokio::test(start_paused = true)]
	async fn test_lookup_times_out() {
		let url = ResolverUrl::parse("dot://dns.google").unwrap();
		let start = Instant::now();
		let set = build_candidate_set(
			&HangingResolver, &url, "", &CancellationToken::new(), start,
		).await;
		assert_eq!(start.elapsed(), BOOTSTRAP_TIMEOUT);
		assert_eq!(set.failure.as_deref(), Some("generic_timeout_error"));
	}

	#[tokio::test(start_paused = true)]
	async fn test_timeout_keeps_completed_queries() {
		let url = ResolverUrl::parse("dot://dns.google").unwrap();
		let set = build_candidate_set(
			&StalledAaaaResolver, &url, "", &CancellationToken::new(), Instant::now(),
		).await;
		assert_eq!(set.failure.as_deref(), Some("generic_timeout_error"));
		assert_eq!(set.queries.len(), 1);
		assert_eq!(set.queries[0].query_type, QueryType::A);
		assert_eq!(set.queries[0].answers, vec![DnsAnswer::from_ip(ip("8.8.8.8"))]);
		assert!(set.queries[0].failure.is_none());
	}

	#[tokio::test]
	async fn test_resolve_both_prefers_any_answer() {
		let log = QueryLog::default();
		let addrs = resolve_both(
			"dns.google",
			Instant::now(),
			&log,
			async { Err(FetchError::NoAnswer) },
			async { Ok(vec![ip("2001:4860:4860::8888")]) },
		).await;
		assert_eq!(addrs, Ok(vec![ip("2001:4860:4860::8888")]));
		assert_eq!(log.into_events().len(), 2);

		let log = QueryLog::default();
		let addrs = resolve_both(
			"dns.google",
			Instant::now(),
			&log,
			async { Err(FetchError::NxDomain) },
			async { Err(FetchError::Timeout) },
		).await;
		assert_eq!(addrs, Err(FetchError::NxDomain));
	}

	#[tokio::test]
	async fn test_lookup_honours_cancellation() {
		let url = ResolverUrl::parse("dot://dns.google").unwrap();
		let cancel = CancellationToken::new();
		cancel.cancel();
		let set = build_candidate_set(&HangingResolver, &url, "", &cancel, Instant::now()).await;
		assert_eq!(set.failure.as_deref(), Some("interrupted"));
		assert!(set.addrs.is_empty());
	}

	#[tokio::test]
	async fn test_system_bootstrap_passes_literals_through() {
		let bootstrap = SystemBootstrap::new();
		let log = QueryLog::default();
		let addrs = bootstrap.lookup_host("2606:4700::1111", Instant::now(), &log).await;
		assert_eq!(addrs.unwrap(), vec![ip("2606:4700::1111")]);
		assert!(log.into_events().is_empty());
	}
}
