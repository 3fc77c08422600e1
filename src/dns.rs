use std::net::IpAddr;

use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};

use crate::error::FetchError;
use crate::transport::QueryType;

/// DNS response information extracted from a parsed message
#[derive(Debug)]
pub struct DnsResponse {
	pub rcode: ResponseCode,
	/// A and AAAA addresses found in the answer section
	pub addresses: Vec<IpAddr>,
}

/// Build a DNS query message for the given domain and query type.
///
/// Returns the serialized query bytes ready to send over any transport.
pub fn build_query(domain: &str, query_type: QueryType, txid: u16) -> Result<Vec<u8>, FetchError> {
	let name = Name::from_ascii(domain)
		.map_err(|e| FetchError::Other(format!("invalid domain name '{}': {}", domain, e)))?;

	let record_type = match query_type {
		QueryType::A => RecordType::A,
		QueryType::AAAA => RecordType::AAAA,
	};

	let mut message = Message::new();
	message.set_id(txid);
	message.set_recursion_desired(true);
	message.add_query(Query::query(name, record_type));

	message.to_vec()
		.map_err(|e| FetchError::Other(format!("failed to serialize DNS query: {}", e)))
}

/// Parse a DNS response, validating the transaction ID and extracting the
/// rcode and the addresses in the answer section.
pub fn parse_response(bytes: &[u8], expected_txid: u16) -> Result<DnsResponse, FetchError> {
	let message = Message::from_vec(bytes)
		.map_err(|e| FetchError::InvalidResponse(e.to_string()))?;

	if message.id() != expected_txid {
		return Err(FetchError::InvalidResponse(format!(
			"txid mismatch: expected {}, got {}",
			expected_txid, message.id()
		)));
	}

	if message.message_type() != MessageType::Response {
		return Err(FetchError::InvalidResponse(
			"received a query instead of a response".to_string(),
		));
	}

	let addresses = message.answers().iter()
		.filter_map(|record| match record.data() {
			RData::A(a) => Some(IpAddr::V4(a.0)),
			RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
			_ => None,
		})
		.collect();

	Ok(DnsResponse {
		rcode: message.response_code(),
		addresses,
	})
}

/// Turn a parsed response into the list of answered addresses, mapping
/// error rcodes, empty answers, and (optionally) bogons to failures.
pub fn answer_addresses(response: DnsResponse, reject_bogons: bool) -> Result<Vec<IpAddr>, FetchError> {
	match response.rcode {
		ResponseCode::NoError => {}
		ResponseCode::NXDomain => return Err(FetchError::NxDomain),
		ResponseCode::ServFail => return Err(FetchError::ServerFailure),
		ResponseCode::Refused => return Err(FetchError::Refused),
		other => return Err(FetchError::Other(format!("dns rcode {}", other))),
	}
	if response.addresses.is_empty() {
		return Err(FetchError::NoAnswer);
	}
	if reject_bogons && response.addresses.iter().any(|ip| is_bogon(*ip)) {
		return Err(FetchError::Bogon);
	}
	Ok(response.addresses)
}

/// Whether an address should never appear in a public DNS answer.
pub fn is_bogon(ip: IpAddr) -> bool {
	match ip {
		IpAddr::V4(v4) => {
			let octets = v4.octets();
			v4.is_private()
				|| v4.is_loopback()
				|| v4.is_link_local()
				|| v4.is_unspecified()
				|| v4.is_broadcast()
				|| v4.is_documentation()
				|| v4.is_multicast()
				|| octets[0] == 0
				|| octets[0] >= 240
				// 100.64.0.0/10 (carrier-grade NAT)
				|| (octets[0] == 100 && (octets[1] & 0xc0) == 64)
		}
		IpAddr::V6(v6) => {
			if let Some(v4) = v6.to_ipv4_mapped() {
				return is_bogon(IpAddr::V4(v4));
			}
			let segments = v6.segments();
			v6.is_loopback()
				|| v6.is_unspecified()
				|| v6.is_multicast()
				// fc00::/7 unique local
				|| (segments[0] & 0xfe00) == 0xfc00
				// fe80::/10 link local
				|| (segments[0] & 0xffc0) == 0xfe80
				// 2001:db8::/32 documentation
				|| (segments[0] == 0x2001 && segments[1] == 0x0db8)
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use hickory_proto::rr::rdata::{A, AAAA};
	use hickory_proto::rr::Record;

	fn response_with(txid: u16, rdata: Vec<RData>, rcode: ResponseCode) -> Vec<u8> {
		let query_bytes = build_query("example.org", QueryType::A, txid).unwrap();
		let mut response = Message::from_vec(&query_bytes).unwrap();
		response.set_message_type(MessageType::Response);
		response.set_response_code(rcode);
		let name = Name::from_ascii("example.org").unwrap();
		for data in rdata {
			response.add_answer(Record::from_rdata(name.clone(), 300, data));
		}
		response.to_vec().unwrap()
	}

	#[test]
	fn test_build_a_query() {
		let bytes = build_query("example.com", QueryType::A, 1234).unwrap();
		// DNS header is 12 bytes minimum
		assert!(bytes.len() >= 12);
		// Verify txid in first two bytes (big-endian)
		assert_eq!(bytes[0], (1234 >> 8) as u8);
		assert_eq!(bytes[1], (1234 & 0xff) as u8);
	}

	#[test]
	fn test_build_aaaa_query() {
		let bytes = build_query("example.com", QueryType::AAAA, 5678).unwrap();
		let message = Message::from_vec(&bytes).unwrap();
		assert_eq!(message.queries()[0].query_type(), RecordType::AAAA);
	}

	#[test]
	fn test_parse_answers() {
		let bytes = response_with(
			9999,
			vec![
				RData::A(A::new(93, 184, 216, 34)),
				RData::AAAA(AAAA::from("2606:2800:220:1::".parse::<std::net::Ipv6Addr>().unwrap())),
			],
			ResponseCode::NoError,
		);
		let response = parse_response(&bytes, 9999).unwrap();
		assert_eq!(response.rcode, ResponseCode::NoError);
		assert_eq!(response.addresses.len(), 2);
		let addrs = answer_addresses(response, true).unwrap();
		assert_eq!(addrs[0], "93.184.216.34".parse::<IpAddr>().unwrap());
	}

	#[test]
	fn test_txid_mismatch() {
		let bytes = response_with(1111, vec![], ResponseCode::NoError);
		let err = parse_response(&bytes, 2222).unwrap_err();
		assert!(err.to_string().contains("txid mismatch"));
	}

	#[test]
	fn test_truncated_buffer() {
		// Only 5 bytes -- too short for a valid DNS message
		let bytes = vec![0u8; 5];
		assert!(parse_response(&bytes, 0).is_err());
	}

	#[test]
	fn test_rcode_mapping() {
		let bytes = response_with(7, vec![], ResponseCode::NXDomain);
		let response = parse_response(&bytes, 7).unwrap();
		assert_eq!(answer_addresses(response, true).unwrap_err(), FetchError::NxDomain);

		let bytes = response_with(8, vec![], ResponseCode::NoError);
		let response = parse_response(&bytes, 8).unwrap();
		assert_eq!(answer_addresses(response, true).unwrap_err(), FetchError::NoAnswer);
	}

	#[test]
	fn test_bogon_rejection() {
		let bytes = response_with(3, vec![RData::A(A::new(10, 0, 0, 1))], ResponseCode::NoError);
		let response = parse_response(&bytes, 3).unwrap();
		assert_eq!(answer_addresses(response, true).unwrap_err(), FetchError::Bogon);

		let bytes = response_with(4, vec![RData::A(A::new(10, 0, 0, 1))], ResponseCode::NoError);
		let response = parse_response(&bytes, 4).unwrap();
		assert!(answer_addresses(response, false).is_ok());
	}

	#[test]
	fn test_is_bogon() {
		for bogon in ["10.1.2.3", "127.0.0.1", "100.64.0.1", "0.1.2.3", "::1", "fd00::1", "fe80::1", "::ffff:192.168.1.1"] {
			assert!(is_bogon(bogon.parse().unwrap()), "{}", bogon);
		}
		for public in ["8.8.8.8", "1.1.1.1", "2606:4700::1111"] {
			assert!(!is_bogon(public.parse().unwrap()), "{}", public);
		}
	}
}
