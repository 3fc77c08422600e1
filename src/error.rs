use thiserror::Error;

/// Errors that prevent an experiment from producing a measurement at all.
#[derive(Error, Debug)]
pub enum ExperimentError {
	#[error("input is required")]
	InputRequired,

	#[error("the input URL is invalid: {0}")]
	InvalidUrl(String),

	#[error("unsupported URL scheme: {0}")]
	UnsupportedScheme(String),

	#[error("cannot serialize test keys: {0}")]
	Serialize(#[from] serde_json::Error),
}

/// Failure of a single DNS exchange or bootstrap lookup.
///
/// The `Display` output is the failure string recorded in the measurement,
/// so the variants map onto a small, stable vocabulary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
	#[error("generic_timeout_error")]
	Timeout,

	#[error("dns_nxdomain_error")]
	NxDomain,

	#[error("dns_no_answer")]
	NoAnswer,

	#[error("dns_bogon_error")]
	Bogon,

	#[error("dns_server_failure")]
	ServerFailure,

	#[error("dns_refused_error")]
	Refused,

	#[error("connection_refused")]
	ConnectionRefused,

	#[error("connection_reset")]
	ConnectionReset,

	#[error("ssl_failed_handshake: {0}")]
	TlsHandshake(String),

	#[error("ssl_invalid_hostname: {0}")]
	InvalidServerName(String),

	#[error("ssl_invalid_tls_version: {0}")]
	InvalidTlsVersion(String),

	#[error("http_request_failed: {0}")]
	Http(String),

	#[error("dns_invalid_response: {0}")]
	InvalidResponse(String),

	#[error("interrupted")]
	Cancelled,

	#[error("unknown_failure: {0}")]
	Other(String),
}

impl FetchError {
	/// The failure string recorded in the measurement.
	pub fn failure(&self) -> String {
		self.to_string()
	}
}

impl From<std::io::Error> for FetchError {
	fn from(err: std::io::Error) -> Self {
		use std::io::ErrorKind;
		match err.kind() {
			ErrorKind::TimedOut => FetchError::Timeout,
			ErrorKind::ConnectionRefused => FetchError::ConnectionRefused,
			ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
				FetchError::ConnectionReset
			}
			_ => FetchError::Other(err.to_string()),
		}
	}
}

/// Errors raised by the session collaborator while bootstrapping a run.
#[derive(Error, Debug)]
pub enum SessionError {
	#[error("cannot create session: {0}")]
	Create(String),

	#[error("cannot lookup probe location: {0}")]
	Location(String),

	#[error("cannot discover backends: {0}")]
	Backends(String),
}

/// Errors raised by the result store.
#[derive(Error, Debug)]
pub enum StoreError {
	#[error("store I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("store encoding error: {0}")]
	Encode(#[from] serde_json::Error),

	#[error("result {0} is already finished")]
	AlreadyFinished(i64),
}

/// Errors that abort a group run.
#[derive(Error, Debug)]
pub enum RunError {
	#[error(transparent)]
	Session(#[from] SessionError),

	#[error(transparent)]
	Store(#[from] StoreError),

	#[error("invalid test group name: {0}")]
	UnknownGroup(String),
}

/// Turn an optional error into the string logged for a completed probe.
pub fn error_to_string_or_ok(err: Option<&FetchError>) -> String {
	match err {
		Some(e) => e.failure(),
		None => "success".to_string(),
	}
}
