/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Shared DNS-level helpers used across plugins and executors.

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::SOA;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use std::net::IpAddr;

/// Parse symbolic DNS response code name.
pub fn parse_named_response_code(raw: &str) -> Option<ResponseCode> {
    if let Ok(code) = raw.parse::<u16>() {
        return Some(code.into());
    }

    match raw.to_ascii_uppercase().as_str() {
        "NOERROR" => Some(ResponseCode::NoError),
        "FORMERR" => Some(ResponseCode::FormErr),
        "SERVFAIL" => Some(ResponseCode::ServFail),
        "NXDOMAIN" => Some(ResponseCode::NXDomain),
        "NOTIMP" => Some(ResponseCode::NotImp),
        "REFUSED" => Some(ResponseCode::Refused),
        "YXDOMAIN" => Some(ResponseCode::YXDomain),
        "YXRRSET" => Some(ResponseCode::YXRRSet),
        "NXRRSET" => Some(ResponseCode::NXRRSet),
        "NOTAUTH" => Some(ResponseCode::NotAuth),
        "NOTZONE" => Some(ResponseCode::NotZone),
        _ => None,
    }
}

/// Build a minimal DNS response from request, preserving id/opcode/query.
pub fn build_response_from_request(request: &Message, rcode: ResponseCode) -> Message {
    let mut response = Message::new();
    response.set_id(request.id());
    response.set_op_code(request.op_code());
    response.set_message_type(MessageType::Response);
    response.set_recursion_desired(request.recursion_desired());
    response.set_recursion_available(true);
    response.set_response_code(rcode);
    *response.queries_mut() = request.queries().to_vec();
    response
}

/// Iterate all records in answer/authority/additional sections.
pub fn response_records(message: &Message) -> impl Iterator<Item = &Record> {
    message
        .answers()
        .iter()
        .chain(message.name_servers().iter())
        .chain(message.additionals().iter())
}

/// Extract A/AAAA IP from a resource record.
pub fn rr_to_ip(record: &Record) -> Option<IpAddr> {
    match record.record_type() {
        RecordType::A => match record.data() {
            RData::A(v) => Some(IpAddr::V4(**v)),
            _ => None,
        },
        RecordType::AAAA => match record.data() {
            RData::AAAA(v) => Some(IpAddr::V6(**v)),
            _ => None,
        },
        _ => None,
    }
}

/// Extract normalized CNAME target from a resource record.
pub fn rr_to_cname(record: &Record) -> Option<String> {
    match record.data() {
        RData::CNAME(v) => Some(v.0.to_utf8().trim_end_matches('.').to_ascii_lowercase()),
        _ => None,
    }
}

/// Minimal TTL across all answer/authority/additional records.
///
/// OPT pseudo-records do not carry a real TTL and are skipped. Returns
/// `default` when the message has no TTL-bearing record.
pub fn minimal_ttl(message: &Message, default: u32) -> u32 {
    response_records(message)
        .filter(|r| r.record_type() != RecordType::OPT)
        .map(Record::ttl)
        .min()
        .unwrap_or(default)
}

/// Subtract `delta` seconds from every record TTL, clamping at zero.
pub fn subtract_ttl(message: &mut Message, delta: u32) {
    apply_ttl(message, |ttl| ttl.saturating_sub(delta));
}

/// Set every record TTL to `ttl`.
pub fn set_ttl(message: &mut Message, ttl: u32) {
    apply_ttl(message, |_| ttl);
}

/// Cap every record TTL at `ceiling`.
pub fn apply_ttl_ceiling(message: &mut Message, ceiling: u32) {
    apply_ttl(message, |ttl| ttl.min(ceiling));
}

fn apply_ttl(message: &mut Message, f: impl Fn(u32) -> u32) {
    for record in message.answers_mut() {
        if record.record_type() == RecordType::OPT {
            continue;
        }
        let ttl = f(record.ttl());
        record.set_ttl(ttl);
    }
    for record in message.name_servers_mut() {
        let ttl = f(record.ttl());
        record.set_ttl(ttl);
    }
    for record in message.additionals_mut() {
        if record.record_type() == RecordType::OPT {
            continue;
        }
        let ttl = f(record.ttl());
        record.set_ttl(ttl);
    }
}

/// Synthesize a negative-answer SOA for `qname`, placed in the authority
/// section of locally generated empty replies.
pub fn fake_soa(qname: &Name) -> Record {
    let mname = Name::from_ascii("fake-ns.seqdns.invalid.").unwrap_or_else(|_| Name::root());
    let rname = Name::from_ascii("nobody.seqdns.invalid.").unwrap_or_else(|_| Name::root());
    let soa = SOA::new(mname, rname, 1, 3600, 600, 86400, 10);
    Record::from_rdata(qname.clone(), 10, RData::SOA(soa))
}

/// Parse a PTR query name (`x.x.x.x.in-addr.arpa.` / nibble ip6.arpa) into an
/// address.
pub fn parse_ptr_name(name: &Name) -> Option<IpAddr> {
    name.parse_arpa_name().ok().map(|net| net.addr())
}

/// Mutable handle to the message's EDNS OPT record, created on demand.
pub fn ensure_opt_record(message: &mut Message) -> &mut hickory_proto::rr::rdata::OPT {
    let mut opt_idx = None;
    for (idx, record) in message.additionals().iter().enumerate() {
        if matches!(record.data(), RData::OPT(_)) {
            opt_idx = Some(idx);
            break;
        }
    }

    let idx = match opt_idx {
        Some(idx) => idx,
        None => {
            message.add_additional(Record::from_rdata(
                Name::root(),
                0,
                RData::OPT(hickory_proto::rr::rdata::OPT::default()),
            ));
            message.additionals().len() - 1
        }
    };

    match message.additionals_mut()[idx].data_mut() {
        RData::OPT(opt) => opt,
        _ => unreachable!("OPT record must contain OPT rdata"),
    }
}

/// Render an address as its reverse-lookup FQDN.
pub fn ip_to_ptr_fqdn(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.{}.in-addr.arpa.", o[3], o[2], o[1], o[0])
        }
        IpAddr::V6(v6) => {
            let mut out = String::with_capacity(74);
            for byte in v6.octets().iter().rev() {
                out.push(char::from_digit((byte & 0x0f) as u32, 16).unwrap());
                out.push('.');
                out.push(char::from_digit((byte >> 4) as u32, 16).unwrap());
                out.push('.');
            }
            out.push_str("ip6.arpa.");
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Query;
    use hickory_proto::rr::rdata::A;
    use std::net::Ipv4Addr;

    #[test]
    fn test_build_response_preserves_id_and_query() {
        let mut request = Message::new();
        request.set_id(0xbeef);
        request.add_query(Query::query(
            Name::from_ascii("example.com.").unwrap(),
            RecordType::A,
        ));

        let response = build_response_from_request(&request, ResponseCode::NXDomain);
        assert_eq!(response.id(), 0xbeef);
        assert_eq!(response.response_code(), ResponseCode::NXDomain);
        assert_eq!(response.queries().len(), 1);
        assert_eq!(response.message_type(), MessageType::Response);
    }

    #[test]
    fn test_ttl_arithmetic() {
        let mut message = Message::new();
        message.add_answer(Record::from_rdata(
            Name::from_ascii("a.example.").unwrap(),
            60,
            RData::A(A(Ipv4Addr::new(192, 0, 2, 1))),
        ));
        message.add_answer(Record::from_rdata(
            Name::from_ascii("a.example.").unwrap(),
            30,
            RData::A(A(Ipv4Addr::new(192, 0, 2, 2))),
        ));

        assert_eq!(minimal_ttl(&message, 300), 30);

        subtract_ttl(&mut message, 40);
        assert_eq!(message.answers()[0].ttl(), 20);
        assert_eq!(message.answers()[1].ttl(), 0);

        set_ttl(&mut message, 5);
        assert!(message.answers().iter().all(|r| r.ttl() == 5));
    }

    #[test]
    fn test_ip_to_ptr_fqdn_v4() {
        assert_eq!(
            ip_to_ptr_fqdn("192.168.1.5".parse().unwrap()),
            "5.1.168.192.in-addr.arpa."
        );
    }

    #[test]
    fn test_parse_ptr_name_round_trip() {
        let ip: IpAddr = "192.168.1.5".parse().unwrap();
        let name = Name::from_ascii(&ip_to_ptr_fqdn(ip)).unwrap();
        assert_eq!(parse_ptr_name(&name), Some(ip));
    }
}
