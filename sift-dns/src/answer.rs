//! DNS message inspection and synthesis
//!
//! The proxy never rewrites upstream traffic; these helpers only look
//! inside responses (address extraction), build the SERVFAIL fallback,
//! and optionally strip AAAA records when v4-only routing is enforced.

use std::net::Ipv4Addr;

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::{RData, RecordType};

use crate::error::{Error, Result};

/// TTL assumed when a response carries no answer records
pub const DEFAULT_ANSWER_TTL: u32 = 3600;

/// Summary of the A records in one DNS response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAnswer {
    /// Queried name, normalized (lowercased, no trailing dot)
    pub domain: String,
    /// IPv4 addresses from A records, in answer order
    pub ips: Vec<Ipv4Addr>,
    /// Minimum TTL across all answer records
    pub min_ttl: u32,
}

/// Extract the queried name, A-record addresses and minimum answer TTL
/// from a DNS response. Returns `None` when the bytes do not decode.
pub fn extract_answer(response: &[u8]) -> Option<ResolvedAnswer> {
    let message = Message::from_vec(response).ok()?;

    let domain = message
        .queries()
        .first()
        .map(|q| sift_rules::normalize_name(&q.name().to_string()))
        .unwrap_or_default();

    let mut ips = Vec::new();
    let mut min_ttl: Option<u32> = None;

    for record in message.answers() {
        min_ttl = Some(min_ttl.map_or(record.ttl(), |m| m.min(record.ttl())));
        if let RData::A(a) = record.data() {
            ips.push(a.0);
        }
    }

    Some(ResolvedAnswer {
        domain,
        ips,
        min_ttl: min_ttl.unwrap_or(DEFAULT_ANSWER_TTL),
    })
}

/// Build a SERVFAIL response for a query that could not be answered.
///
/// The original id and question section are copied; the answer section
/// is empty. Fails when the query itself does not decode.
pub fn synthesize_servfail(query: &[u8]) -> Result<Vec<u8>> {
    let request = Message::from_vec(query).map_err(|e| Error::Decode(e.to_string()))?;

    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(request.op_code());
    response.set_recursion_desired(request.recursion_desired());
    response.set_recursion_available(true);
    response.set_response_code(ResponseCode::ServFail);
    for query in request.queries() {
        response.add_query(query.clone());
    }

    response.to_vec().map_err(|e| Error::Decode(e.to_string()))
}

/// Remove AAAA records from a response, preserving everything else.
///
/// Used when v4-only split routing must not be bypassed by v6 answers.
/// The message is rebuilt, so the result is a fresh serialization.
pub fn filter_aaaa(response: &[u8]) -> Result<Vec<u8>> {
    let message = Message::from_vec(response).map_err(|e| Error::Decode(e.to_string()))?;

    let mut filtered = Message::new();
    filtered.set_id(message.id());
    filtered.set_message_type(message.message_type());
    filtered.set_op_code(message.op_code());
    filtered.set_authoritative(message.authoritative());
    filtered.set_truncated(message.truncated());
    filtered.set_recursion_desired(message.recursion_desired());
    filtered.set_recursion_available(message.recursion_available());
    filtered.set_authentic_data(message.authentic_data());
    filtered.set_checking_disabled(message.checking_disabled());
    filtered.set_response_code(message.response_code());

    for query in message.queries() {
        filtered.add_query(query.clone());
    }
    for record in message.answers() {
        if record.record_type() != RecordType::AAAA {
            filtered.add_answer(record.clone());
        }
    }
    for record in message.name_servers() {
        if record.record_type() != RecordType::AAAA {
            filtered.add_name_server(record.clone());
        }
    }
    for record in message.additionals() {
        if record.record_type() != RecordType::AAAA {
            filtered.add_additional(record.clone());
        }
    }

    filtered.to_vec().map_err(|e| Error::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Query;
    use hickory_proto::rr::rdata::{A, AAAA};
    use hickory_proto::rr::{Name, Record};
    use std::net::Ipv6Addr;
    use std::str::FromStr;

    fn response_with(name: &str, records: Vec<Record>) -> Vec<u8> {
        let mut message = Message::new();
        message.set_id(4660);
        message.set_message_type(MessageType::Response);
        message.add_query(Query::query(
            Name::from_str(name).unwrap(),
            RecordType::A,
        ));
        for record in records {
            message.add_answer(record);
        }
        message.to_vec().unwrap()
    }

    #[test]
    fn test_extract_a_records_and_min_ttl() {
        let name = Name::from_str("example.com.").unwrap();
        let bytes = response_with(
            "example.com.",
            vec![
                Record::from_rdata(name.clone(), 300, RData::A(A(Ipv4Addr::new(93, 184, 216, 34)))),
                Record::from_rdata(name, 120, RData::A(A(Ipv4Addr::new(93, 184, 216, 35)))),
            ],
        );

        let answer = extract_answer(&bytes).unwrap();
        assert_eq!(answer.domain, "example.com");
        assert_eq!(
            answer.ips,
            vec![
                Ipv4Addr::new(93, 184, 216, 34),
                Ipv4Addr::new(93, 184, 216, 35)
            ]
        );
        assert_eq!(answer.min_ttl, 120);
    }

    #[test]
    fn test_extract_no_answers_uses_default_ttl() {
        let bytes = response_with("example.com.", vec![]);
        let answer = extract_answer(&bytes).unwrap();
        assert!(answer.ips.is_empty());
        assert_eq!(answer.min_ttl, DEFAULT_ANSWER_TTL);
    }

    #[test]
    fn test_extract_ignores_aaaa() {
        let name = Name::from_str("example.com.").unwrap();
        let bytes = response_with(
            "example.com.",
            vec![Record::from_rdata(
                name,
                60,
                RData::AAAA(AAAA(Ipv6Addr::LOCALHOST)),
            )],
        );
        let answer = extract_answer(&bytes).unwrap();
        assert!(answer.ips.is_empty());
        assert_eq!(answer.min_ttl, 60);
    }

    #[test]
    fn test_extract_garbage_is_none() {
        assert!(extract_answer(&[0xff, 0x00, 0x01]).is_none());
    }

    #[test]
    fn test_servfail_copies_id_and_questions() {
        let mut query = Message::new();
        query.set_id(0xbeef);
        query.set_recursion_desired(true);
        query.add_query(Query::query(
            Name::from_str("example.com.").unwrap(),
            RecordType::A,
        ));
        let bytes = query.to_vec().unwrap();

        let servfail = synthesize_servfail(&bytes).unwrap();
        let decoded = Message::from_vec(&servfail).unwrap();
        assert_eq!(decoded.id(), 0xbeef);
        assert_eq!(decoded.response_code(), ResponseCode::ServFail);
        assert_eq!(decoded.message_type(), MessageType::Response);
        assert_eq!(decoded.queries().len(), 1);
        assert_eq!(
            decoded.queries()[0].name().to_string(),
            "example.com."
        );
        assert!(decoded.answers().is_empty());
    }

    #[test]
    fn test_servfail_rejects_garbage() {
        assert!(synthesize_servfail(&[0x01]).is_err());
    }

    #[test]
    fn test_filter_aaaa_keeps_a() {
        let name = Name::from_str("example.com.").unwrap();
        let bytes = response_with(
            "example.com.",
            vec![
                Record::from_rdata(name.clone(), 300, RData::A(A(Ipv4Addr::new(1, 2, 3, 4)))),
                Record::from_rdata(name, 300, RData::AAAA(AAAA(Ipv6Addr::LOCALHOST))),
            ],
        );

        let filtered = filter_aaaa(&bytes).unwrap();
        let decoded = Message::from_vec(&filtered).unwrap();
        assert_eq!(decoded.answers().len(), 1);
        assert_eq!(decoded.answers()[0].record_type(), RecordType::A);
        assert_eq!(decoded.id(), 4660);
    }
}
