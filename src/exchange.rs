//! Multi-protocol DNS lookups through a single resolver URL.
//!
//! A probe resolves the A and AAAA records of its target domain through
//! the resolver named by `resolver_url`:
//!
//! ```text
//! udp://8.8.8.8:53            one datagram per query
//! tcp://9.9.9.9               2-byte length-prefixed query over TCP
//! dot://1.1.1.1               length-prefixed query over TLS (RFC 7858)
//! https://8.8.8.8/dns-query   POST application/dns-message (RFC 8484)
//! ```
//!
//! With HTTP/3 enabled, `https://` resolvers are queried over QUIC.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::Instant;
use tracing::debug;

use crate::dns::{answer_addresses, build_query, parse_response, DnsResponse};
use crate::error::FetchError;
use crate::resolver::{ResolverScheme, ResolverUrl};
use crate::transport::{DnsAnswer, DnsQueryEvent, FetchConfig, ProbeInput, ProbeKeys, QueryType};

/// Expected content type for DNS-over-HTTPS (RFC 8484 §4.2.1)
const DNS_MESSAGE_CONTENT_TYPE: &str = "application/dns-message";

type H3SendRequest = h3::client::SendRequest<h3_quinn::OpenStreams, Bytes>;

/// Performs the DNS lookup described by a probe input.
///
/// Returns the probe trace together with the error that failed the probe,
/// if any; the trace is kept even on failure.
#[async_trait]
pub trait Fetcher: Send + Sync {
	async fn fetch(&self, input: &ProbeInput, begin: Instant) -> (ProbeKeys, Option<FetchError>);
}

/// Fetcher that talks to real resolvers.
#[derive(Debug, Default, Clone)]
pub struct DnsFetcher;

#[async_trait]
impl Fetcher for DnsFetcher {
	async fn fetch(&self, input: &ProbeInput, begin: Instant) -> (ProbeKeys, Option<FetchError>) {
		let exchange = match Exchange::new(&input.config) {
			Ok(exchange) => exchange,
			Err(err) => {
				let keys = ProbeKeys { queries: Vec::new(), failure: Some(err.failure()) };
				return (keys, Some(err));
			}
		};
		lookup_host(&exchange, input, begin).await
	}
}

/// Resolve A and AAAA for the probe's domain, recording one event per query.
async fn lookup_host(
	exchange: &Exchange,
	input: &ProbeInput,
	begin: Instant,
) -> (ProbeKeys, Option<FetchError>) {
	let domain = input.domain();
	let deadline = Instant::now() + input.config.timeout;
	let mut keys = ProbeKeys::default();
	let mut first_err = None;
	let mut found = false;

	for query_type in [QueryType::A, QueryType::AAAA] {
		let t0 = begin.elapsed().as_secs_f64();
		let result = match tokio::time::timeout_at(deadline, exchange.query(domain, query_type)).await {
			Ok(result) => result,
			Err(_) => Err(FetchError::Timeout),
		};
		let result = result.and_then(|response| {
			answer_addresses(response, input.config.reject_dns_bogons)
		});
		let (answers, failure) = match result {
			Ok(addrs) => {
				found = true;
				(addrs.into_iter().map(DnsAnswer::from_ip).collect(), None)
			}
			Err(err) => {
				let failure = err.failure();
				first_err.get_or_insert(err);
				(Vec::new(), Some(failure))
			}
		};
		keys.queries.push(DnsQueryEvent {
			engine: exchange.engine().to_string(),
			resolver_address: exchange.address(),
			hostname: domain.to_string(),
			query_type,
			answers,
			failure,
			t0,
			t: begin.elapsed().as_secs_f64(),
		});
	}

	if found {
		return (keys, None);
	}
	keys.failure = first_err.as_ref().map(FetchError::failure);
	(keys, first_err)
}

/// A resolver endpoint ready to exchange queries over its transport.
enum Exchange {
	Udp(SocketAddr),
	Tcp(SocketAddr),
	Tls {
		server: SocketAddr,
		server_name: ServerName<'static>,
		connector: tokio_rustls::TlsConnector,
	},
	Https {
		client: reqwest::Client,
		url: String,
		host: Option<String>,
	},
	Http3 {
		server: SocketAddr,
		server_name: String,
		client_config: quinn::ClientConfig,
		url: String,
		host: Option<String>,
	},
}

impl Exchange {
	fn new(config: &FetchConfig) -> Result<Self, FetchError> {
		let url = ResolverUrl::parse(&config.resolver_url)
			.map_err(|e| FetchError::Other(e.to_string()))?;
		let server = url.socket_addr().ok_or_else(|| {
			FetchError::Other(format!("resolver host '{}' is not an address", url.hostname()))
		})?;

		match url.scheme() {
			ResolverScheme::Udp => Ok(Exchange::Udp(server)),
			ResolverScheme::Tcp => Ok(Exchange::Tcp(server)),
			ResolverScheme::Dot => {
				let tls = tls_config(&config.dns_tls_version, &[])?;
				let server_name = server_name(&config.dns_tls_server_name, server.ip())?;
				Ok(Exchange::Tls {
					server,
					server_name,
					connector: tokio_rustls::TlsConnector::from(Arc::new(tls)),
				})
			}
			ResolverScheme::Https if config.http3_enabled => http3_exchange(&url, server, config),
			ResolverScheme::Https => https_exchange(&url, server, config),
		}
	}

	fn engine(&self) -> &'static str {
		match self {
			Exchange::Udp(_) => "udp",
			Exchange::Tcp(_) => "tcp",
			Exchange::Tls { .. } => "dot",
			Exchange::Https { .. } => "doh",
			Exchange::Http3 { .. } => "doh3",
		}
	}

	fn address(&self) -> String {
		match self {
			Exchange::Udp(addr) | Exchange::Tcp(addr) => addr.to_string(),
			Exchange::Tls { server, .. } => server.to_string(),
			Exchange::Https { url, .. } | Exchange::Http3 { url, .. } => url.clone(),
		}
	}

	async fn query(&self, domain: &str, query_type: QueryType) -> Result<DnsResponse, FetchError> {
		let txid: u16 = rand::random();
		let query = build_query(domain, query_type, txid)?;
		debug!(engine = self.engine(), address = %self.address(), domain, ?query_type, "sending query");
		match self {
			Exchange::Udp(server) => udp_exchange(*server, &query, txid).await,
			Exchange::Tcp(server) => {
				let mut stream = TcpStream::connect(*server).await?;
				let bytes = stream_exchange(&mut stream, &query).await?;
				parse_response(&bytes, txid)
			}
			Exchange::Tls { server, server_name, connector } => {
				let tcp = TcpStream::connect(*server).await?;
				let mut stream = connector.connect(server_name.clone(), tcp).await
					.map_err(|e| FetchError::TlsHandshake(e.to_string()))?;
				let bytes = stream_exchange(&mut stream, &query).await?;
				parse_response(&bytes, txid)
			}
			Exchange::Https { client, url, host } => {
				let bytes = https_post(client, url, host.as_deref(), query).await?;
				parse_response(&bytes, txid)
			}
			Exchange::Http3 { server, server_name, client_config, url, host } => {
				let bytes = http3_post(*server, server_name, client_config, url, host.as_deref(), query).await?;
				parse_response(&bytes, txid)
			}
		}
	}
}

/// Send a query over UDP from a dedicated socket.
///
/// Responses with a foreign transaction id are skipped; the caller bounds
/// the whole exchange with the probe deadline.
async fn udp_exchange(server: SocketAddr, query: &[u8], txid: u16) -> Result<DnsResponse, FetchError> {
	let bind_addr = if server.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
	let socket = UdpSocket::bind(bind_addr).await?;
	socket.send_to(query, server).await?;

	// 4096-byte buffer to handle EDNS-extended responses
	let mut buf = vec![0u8; 4096];
	let max_retries = 3;
	let mut last_err = FetchError::Timeout;
	for _ in 0..max_retries {
		let (len, _src) = socket.recv_from(&mut buf).await?;
		match parse_response(&buf[..len], txid) {
			Ok(response) => return Ok(response),
			Err(err) => last_err = err,
		}
	}
	Err(last_err)
}

/// Write a length-prefixed query and read the length-prefixed response.
async fn stream_exchange<S>(stream: &mut S, query: &[u8]) -> Result<Vec<u8>, FetchError>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let len = u16::try_from(query.len())
		.map_err(|_| FetchError::Other(format!("query too large: {} bytes", query.len())))?;
	let mut framed = Vec::with_capacity(query.len() + 2);
	framed.extend_from_slice(&len.to_be_bytes());
	framed.extend_from_slice(query);
	stream.write_all(&framed).await?;
	stream.flush().await?;

	let mut len_buf = [0u8; 2];
	stream.read_exact(&mut len_buf).await?;
	let response_len = u16::from_be_bytes(len_buf) as usize;
	if response_len == 0 {
		return Err(FetchError::InvalidResponse(format!("bad response length {}", response_len)));
	}
	let mut response = vec![0u8; response_len];
	stream.read_exact(&mut response).await?;
	Ok(response)
}

/// Host named by DoH requests: the SNI override when it is a hostname,
/// otherwise the URL's own host.
fn request_host(url: &ResolverUrl, config: &FetchConfig) -> String {
	let sni = config.dns_tls_server_name.as_str();
	if sni.is_empty() || sni.parse::<IpAddr>().is_ok() {
		url.hostname().to_string()
	} else {
		sni.to_string()
	}
}

/// Request URL for `host`, plus the Host override when it differs from the
/// request authority.
fn request_target(url: &ResolverUrl, host: &str, config: &FetchConfig) -> (String, Option<String>) {
	let bracketed = if host.contains(':') { format!("[{}]", host) } else { host.to_string() };
	let authority = match url.port() {
		Some(port) => format!("{}:{}", bracketed, port),
		None => bracketed,
	};
	let request_url = format!("https://{}{}", authority, url.tail());
	let host_header = Some(config.dns_http_host.clone())
		.filter(|h| !h.is_empty() && *h != authority);
	(request_url, host_header)
}

fn https_exchange(url: &ResolverUrl, server: SocketAddr, config: &FetchConfig) -> Result<Exchange, FetchError> {
	let tls = tls_config(&config.dns_tls_version, &[b"h2".as_slice(), b"http/1.1".as_slice()])?;
	let mut builder = reqwest::Client::builder()
		.use_preconfigured_tls(tls)
		.timeout(config.timeout);

	// Requests name the SNI host and pin it to the resolver address, so the
	// handshake carries the configured server name.
	let host = request_host(url, config);
	if host != url.hostname() {
		builder = builder.resolve(&host, server);
	}
	let (request_url, host_header) = request_target(url, &host, config);

	let client = builder.build().map_err(|e| FetchError::Http(e.to_string()))?;
	Ok(Exchange::Https { client, url: request_url, host: host_header })
}

fn http3_exchange(url: &ResolverUrl, server: SocketAddr, config: &FetchConfig) -> Result<Exchange, FetchError> {
	// QUIC only runs over TLS 1.3
	if config.dns_tls_version == "TLSv1.2" {
		return Err(FetchError::InvalidTlsVersion("TLSv1.2 over QUIC".to_string()));
	}
	let tls = tls_config(&config.dns_tls_version, &[b"h3".as_slice()])?;
	let quic = quinn::crypto::rustls::QuicClientConfig::try_from(Arc::new(tls))
		.map_err(|e| FetchError::TlsHandshake(e.to_string()))?;

	let host = request_host(url, config);
	let (request_url, host_header) = request_target(url, &host, config);
	Ok(Exchange::Http3 {
		server,
		server_name: host,
		client_config: quinn::ClientConfig::new(Arc::new(quic)),
		url: request_url,
		host: host_header,
	})
}

async fn https_post(
	client: &reqwest::Client,
	url: &str,
	host: Option<&str>,
	query: Vec<u8>,
) -> Result<Vec<u8>, FetchError> {
	let mut request = client.post(url)
		.header(reqwest::header::CONTENT_TYPE, DNS_MESSAGE_CONTENT_TYPE)
		.header(reqwest::header::ACCEPT, DNS_MESSAGE_CONTENT_TYPE)
		.body(query);
	if let Some(host) = host {
		request = request.header(reqwest::header::HOST, host);
	}
	let response = request.send().await.map_err(map_reqwest_error)?;

	let status = response.status();
	if !status.is_success() {
		return Err(FetchError::Http(format!("status {}", status.as_u16())));
	}
	let body = response.bytes().await.map_err(map_reqwest_error)?;
	Ok(body.to_vec())
}

/// POST a query over a fresh QUIC connection to `server`.
async fn http3_post(
	server: SocketAddr,
	server_name: &str,
	client_config: &quinn::ClientConfig,
	url: &str,
	host: Option<&str>,
	query: Vec<u8>,
) -> Result<Vec<u8>, FetchError> {
	let bind: SocketAddr = if server.is_ipv4() {
		(Ipv4Addr::UNSPECIFIED, 0).into()
	} else {
		(Ipv6Addr::UNSPECIFIED, 0).into()
	};
	let mut endpoint = quinn::Endpoint::client(bind)?;
	endpoint.set_default_client_config(client_config.clone());

	let connecting = endpoint.connect(server, server_name)
		.map_err(|e| FetchError::Other(e.to_string()))?;
	let connection = connecting.await.map_err(map_quic_error)?;

	let (mut driver, mut send_request) = h3::client::new(h3_quinn::Connection::new(connection)).await
		.map_err(http3_error)?;
	let driver = tokio::spawn(async move {
		let _ = std::future::poll_fn(|cx| driver.poll_close(cx)).await;
	});

	let result = http3_request(&mut send_request, url, host, query).await;
	driver.abort();
	endpoint.close(quinn::VarInt::from_u32(0), b"");
	result
}

async fn http3_request(
	send_request: &mut H3SendRequest,
	url: &str,
	host: Option<&str>,
	query: Vec<u8>,
) -> Result<Vec<u8>, FetchError> {
	let mut request = http::Request::builder()
		.method(http::Method::POST)
		.uri(url)
		.header(http::header::CONTENT_TYPE, DNS_MESSAGE_CONTENT_TYPE)
		.header(http::header::ACCEPT, DNS_MESSAGE_CONTENT_TYPE);
	if let Some(host) = host {
		request = request.header(http::header::HOST, host);
	}
	let request = request.body(()).map_err(http3_error)?;

	let mut stream = send_request.send_request(request).await.map_err(http3_error)?;
	stream.send_data(Bytes::from(query)).await.map_err(http3_error)?;
	stream.finish().await.map_err(http3_error)?;

	let response = stream.recv_response().await.map_err(http3_error)?;
	let status = response.status();
	if !status.is_success() {
		return Err(FetchError::Http(format!("status {}", status.as_u16())));
	}

	let mut body = BytesMut::new();
	while let Some(mut chunk) = stream.recv_data().await.map_err(http3_error)? {
		body.extend_from_slice(chunk.chunk());
		chunk.advance(chunk.remaining());
	}
	Ok(body.to_vec())
}

fn map_quic_error(err: quinn::ConnectionError) -> FetchError {
	match err {
		quinn::ConnectionError::TimedOut => FetchError::Timeout,
		other => FetchError::TlsHandshake(other.to_string()),
	}
}

fn http3_error(err: impl std::fmt::Display) -> FetchError {
	FetchError::Http(err.to_string())
}

fn map_reqwest_error(err: reqwest::Error) -> FetchError {
	if err.is_timeout() {
		FetchError::Timeout
	} else {
		FetchError::Http(err.to_string())
	}
}

/// Build a rustls client config, optionally pinned to one TLS version.
fn tls_config(version: &str, alpn: &[&[u8]]) -> Result<rustls::ClientConfig, FetchError> {
	let versions: Vec<&'static rustls::SupportedProtocolVersion> = match version {
		"" => rustls::DEFAULT_VERSIONS.to_vec(),
		"TLSv1.3" => vec![&rustls::version::TLS13],
		"TLSv1.2" => vec![&rustls::version::TLS12],
		other => return Err(FetchError::InvalidTlsVersion(other.to_string())),
	};

	let mut root_store = rustls::RootCertStore::empty();
	root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

	let provider = Arc::new(rustls::crypto::ring::default_provider());
	let mut config = rustls::ClientConfig::builder_with_provider(provider)
		.with_protocol_versions(&versions)
		.map_err(|e| FetchError::TlsHandshake(e.to_string()))?
		.with_root_certificates(root_store)
		.with_no_client_auth();
	config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
	Ok(config)
}

fn server_name(configured: &str, fallback: IpAddr) -> Result<ServerName<'static>, FetchError> {
	let name = if configured.is_empty() { fallback.to_string() } else { configured.to_string() };
	ServerName::try_from(name.clone()).map_err(|_| FetchError::InvalidServerName(name))
}
