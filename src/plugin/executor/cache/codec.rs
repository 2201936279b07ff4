/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! JSON codec for cached DNS items.
//!
//! Record data travels as base64 wire bytes next to its numeric record
//! type; decoding dispatches on the type to rebuild the concrete rdata.
//! Every record type the cache should round-trip must be added to
//! [`decode_rdata`]; anything else degrades to NULL with the raw bytes.

use crate::core::error::{DnsError, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hickory_proto::op::{Message, MessageType, Query};
use hickory_proto::rr::rdata::name::{CNAME, NS, PTR};
use hickory_proto::rr::rdata::{A, AAAA, MX, NULL, SOA, SRV, TXT};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinDecoder, BinEncodable};
use serde::{Deserialize, Serialize};

/// One DNS cache entry as stored in a backend.
#[derive(Debug, Clone)]
pub struct CacheItem {
    pub resp: Message,
    /// Unix milliseconds when the entry was stored.
    pub stored_time: i64,
    /// Unix milliseconds after which the entry is no longer fresh.
    pub expiration_time: i64,
    /// Tag of the interceptor whose original response this is, if any.
    pub black_hole_tag: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonItem {
    resp: JsonMessage,
    stored_time: i64,
    expiration_time: i64,
    #[serde(default)]
    black_hole_tag: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonMessage {
    rcode: u16,
    #[serde(default)]
    authoritative: bool,
    #[serde(default)]
    recursion_available: bool,
    #[serde(default)]
    queries: Vec<JsonQuery>,
    #[serde(default)]
    answers: Vec<JsonRecord>,
    #[serde(default)]
    name_servers: Vec<JsonRecord>,
    #[serde(default)]
    additionals: Vec<JsonRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonQuery {
    name: String,
    qtype: u16,
    qclass: u16,
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonRecord {
    name: String,
    rtype: u16,
    class: u16,
    ttl: u32,
    rdata: String,
}

pub fn marshal_item(item: &CacheItem) -> Result<String> {
    let json = JsonItem {
        resp: encode_message(&item.resp)?,
        stored_time: item.stored_time,
        expiration_time: item.expiration_time,
        black_hole_tag: item.black_hole_tag.clone(),
    };
    Ok(serde_json::to_string(&json)?)
}

pub fn unmarshal_item(raw: &str) -> Result<CacheItem> {
    let json: JsonItem = serde_json::from_str(raw)?;
    Ok(CacheItem {
        resp: decode_message(&json.resp)?,
        stored_time: json.stored_time,
        expiration_time: json.expiration_time,
        black_hole_tag: json.black_hole_tag,
    })
}

fn encode_message(message: &Message) -> Result<JsonMessage> {
    Ok(JsonMessage {
        rcode: message.response_code().into(),
        authoritative: message.authoritative(),
        recursion_available: message.recursion_available(),
        queries: message
            .queries()
            .iter()
            .map(|q| JsonQuery {
                name: q.name().to_string(),
                qtype: q.query_type().into(),
                qclass: q.query_class().into(),
            })
            .collect(),
        answers: encode_records(message.answers())?,
        name_servers: encode_records(message.name_servers())?,
        additionals: encode_records(message.additionals())?,
    })
}

fn encode_records(records: &[Record]) -> Result<Vec<JsonRecord>> {
    let mut out = Vec::with_capacity(records.len());
    for record in records {
        // OPT is per-transaction metadata and is not cached.
        if record.record_type() == RecordType::OPT {
            continue;
        }
        let rdata = record.data().to_bytes()?;
        out.push(JsonRecord {
            name: record.name().to_string(),
            rtype: record.record_type().into(),
            class: record.dns_class().into(),
            ttl: record.ttl(),
            rdata: BASE64.encode(rdata),
        });
    }
    Ok(out)
}

fn decode_message(json: &JsonMessage) -> Result<Message> {
    let mut message = Message::new();
    message.set_message_type(MessageType::Response);
    message.set_response_code(json.rcode.into());
    message.set_authoritative(json.authoritative);
    message.set_recursion_available(json.recursion_available);

    for q in &json.queries {
        let name = Name::from_ascii(&q.name)
            .map_err(|e| DnsError::protocol(format!("bad cached query name '{}': {}", q.name, e)))?;
        let mut query = Query::query(name, RecordType::from(q.qtype));
        query.set_query_class(DNSClass::from(q.qclass));
        message.add_query(query);
    }

    for r in &json.answers {
        message.add_answer(decode_record(r)?);
    }
    for r in &json.name_servers {
        message.add_name_server(decode_record(r)?);
    }
    for r in &json.additionals {
        message.add_additional(decode_record(r)?);
    }
    Ok(message)
}

fn decode_record(json: &JsonRecord) -> Result<Record> {
    let name = Name::from_ascii(&json.name)
        .map_err(|e| DnsError::protocol(format!("bad cached record name '{}': {}", json.name, e)))?;
    let rdata_bytes = BASE64
        .decode(&json.rdata)
        .map_err(|e| DnsError::protocol(format!("bad cached rdata: {}", e)))?;
    let rtype = RecordType::from(json.rtype);

    let rdata = decode_rdata(rtype, &rdata_bytes)?;
    let mut record = Record::from_rdata(name, json.ttl, rdata);
    record.set_dns_class(DNSClass::from(json.class));
    Ok(record)
}

/// Rebuild concrete rdata from wire bytes, dispatching on the record type.
fn decode_rdata(rtype: RecordType, bytes: &[u8]) -> Result<RData> {
    let mut decoder = BinDecoder::new(bytes);
    Ok(match rtype {
        RecordType::A => RData::A(A::read(&mut decoder)?),
        RecordType::AAAA => RData::AAAA(AAAA::read(&mut decoder)?),
        RecordType::NS => RData::NS(NS(Name::read(&mut decoder)?)),
        RecordType::CNAME => RData::CNAME(CNAME(Name::read(&mut decoder)?)),
        RecordType::PTR => RData::PTR(PTR(Name::read(&mut decoder)?)),
        RecordType::MX => RData::MX(MX::read(&mut decoder)?),
        RecordType::SOA => RData::SOA(SOA::read(&mut decoder)?),
        RecordType::SRV => RData::SRV(SRV::read(&mut decoder)?),
        RecordType::TXT => RData::TXT(decode_txt(bytes)?),
        _ => RData::NULL(NULL::with(bytes.to_vec())),
    })
}

/// TXT rdata is a run of `{len}{bytes}` character strings.
fn decode_txt(bytes: &[u8]) -> Result<TXT> {
    let mut strings = Vec::new();
    let mut pos = 0usize;
    while pos < bytes.len() {
        let len = bytes[pos] as usize;
        pos += 1;
        if pos + len > bytes.len() {
            return Err(DnsError::protocol("truncated TXT character string"));
        }
        strings.push(String::from_utf8_lossy(&bytes[pos..pos + len]).into_owned());
        pos += len;
    }
    Ok(TXT::new(strings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::ResponseCode;
    use std::net::Ipv4Addr;

    fn sample_response() -> Message {
        let mut message = Message::new();
        message.set_message_type(MessageType::Response);
        message.set_response_code(ResponseCode::NoError);
        message.add_query(Query::query(
            Name::from_ascii("example.com.").unwrap(),
            RecordType::A,
        ));
        message.add_answer(Record::from_rdata(
            Name::from_ascii("example.com.").unwrap(),
            60,
            RData::CNAME(CNAME(Name::from_ascii("cdn.example.net.").unwrap())),
        ));
        message.add_answer(Record::from_rdata(
            Name::from_ascii("cdn.example.net.").unwrap(),
            60,
            RData::A(A(Ipv4Addr::new(203, 0, 113, 1))),
        ));
        message.add_answer(Record::from_rdata(
            Name::from_ascii("example.com.").unwrap(),
            120,
            RData::TXT(TXT::new(vec!["v=spf1 -all".to_string()])),
        ));
        message
    }

    #[test]
    fn test_item_round_trip() {
        let item = CacheItem {
            resp: sample_response(),
            stored_time: 1_700_000_000_000,
            expiration_time: 1_700_000_060_000,
            black_hole_tag: "bh".to_string(),
        };

        let raw = marshal_item(&item).unwrap();
        let decoded = unmarshal_item(&raw).unwrap();

        assert_eq!(decoded.stored_time, item.stored_time);
        assert_eq!(decoded.expiration_time, item.expiration_time);
        assert_eq!(decoded.black_hole_tag, "bh");

        let resp = &decoded.resp;
        assert_eq!(resp.response_code(), ResponseCode::NoError);
        assert_eq!(resp.queries().len(), 1);
        assert_eq!(resp.answers().len(), 3);

        match resp.answers()[0].data() {
            RData::CNAME(target) => assert_eq!(target.0.to_utf8(), "cdn.example.net."),
            other => panic!("expected CNAME, got {:?}", other),
        }
        match resp.answers()[1].data() {
            RData::A(a) => assert_eq!(**a, Ipv4Addr::new(203, 0, 113, 1)),
            other => panic!("expected A, got {:?}", other),
        }
        match resp.answers()[2].data() {
            RData::TXT(txt) => {
                assert_eq!(txt.txt_data().len(), 1);
                assert_eq!(&*txt.txt_data()[0], b"v=spf1 -all".as_slice());
            }
            other => panic!("expected TXT, got {:?}", other),
        }
        assert_eq!(resp.answers()[1].ttl(), 60);
    }

    #[test]
    fn test_unknown_rtype_degrades_to_null() {
        let rdata = decode_rdata(RecordType::from(65280), &[1, 2, 3]).unwrap();
        match rdata {
            RData::NULL(null) => assert_eq!(null.anything(), &[1, 2, 3]),
            other => panic!("expected NULL, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_json_is_an_error() {
        assert!(unmarshal_item("{not json").is_err());
    }
}
