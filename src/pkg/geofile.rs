/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! V2Ray/Xray geo data file decoder.
//!
//! A geo file is a concatenation of `{field key}{varint bodyLen}{body}`
//! records, one per country bucket. [`find`] scans record headers and skips
//! bodies whose embedded country-code field does not match, so loading one
//! code never decodes the rest of the file. Decoded results are memoized
//! process-wide; [`purge`] drops every cache (used on shutdown and
//! reconfiguration).

use crate::core::error::{DnsError, Result};
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use ipnet::IpNet;

/// Domain entry kinds as encoded in geosite files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeoDomainKind {
    /// Substring match (`keyword:`)
    Plain,
    /// Regular expression (`regexp:`)
    Regex,
    /// Label-suffix match (`domain:`)
    RootDomain,
    /// Exact FQDN (`full:`)
    Full,
}

impl GeoDomainKind {
    fn from_wire(raw: u64) -> Option<GeoDomainKind> {
        match raw {
            0 => Some(GeoDomainKind::Plain),
            1 => Some(GeoDomainKind::Regex),
            2 => Some(GeoDomainKind::RootDomain),
            3 => Some(GeoDomainKind::Full),
            _ => None,
        }
    }

    /// Rule expression prefix for the matcher layer.
    pub fn rule_prefix(self) -> &'static str {
        match self {
            GeoDomainKind::Plain => "keyword",
            GeoDomainKind::Regex => "regexp",
            GeoDomainKind::RootDomain => "domain",
            GeoDomainKind::Full => "full",
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeoDomain {
    pub kind: GeoDomainKind,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct GeoSiteEntry {
    pub code: String,
    pub domains: Vec<GeoDomain>,
}

#[derive(Debug, Clone)]
pub struct GeoIpEntry {
    pub code: String,
    pub prefixes: Vec<IpNet>,
}

lazy_static! {
    static ref FILE_CACHE: Mutex<HashMap<String, Arc<Vec<u8>>>> = Mutex::new(HashMap::new());
    static ref IP_CACHE: Mutex<HashMap<String, Arc<Vec<IpNet>>>> = Mutex::new(HashMap::new());
    static ref SITE_CACHE: Mutex<HashMap<String, Arc<Vec<GeoDomain>>>> = Mutex::new(HashMap::new());
    static ref SITE_LIST_CACHE: Mutex<HashMap<String, Arc<Vec<GeoSiteEntry>>>> =
        Mutex::new(HashMap::new());
    static ref IP_LIST_CACHE: Mutex<HashMap<String, Arc<Vec<GeoIpEntry>>>> =
        Mutex::new(HashMap::new());
}

/// Drop every memoized file and decoded structure.
pub fn purge() {
    FILE_CACHE.lock().unwrap().clear();
    IP_CACHE.lock().unwrap().clear();
    SITE_CACHE.lock().unwrap().clear();
    SITE_LIST_CACHE.lock().unwrap().clear();
    IP_LIST_CACHE.lock().unwrap().clear();
}

/// Load the CIDR prefixes of one country code from a geoip file.
pub fn load_ip(file: &str, code: &str) -> Result<Arc<Vec<IpNet>>> {
    let key = format!("{}:{}", file, code.to_ascii_uppercase());
    if let Some(cached) = IP_CACHE.lock().unwrap().get(&key) {
        return Ok(cached.clone());
    }

    let data = read_asset(file)?;
    let body = find(&data, code.to_ascii_uppercase().as_bytes()).ok_or_else(|| {
        DnsError::config(format!("code '{}' not found in '{}'", code, file))
    })?;
    let entry = decode_geoip_body(body)
        .map_err(|e| DnsError::config(format!("bad geoip body for '{}' in '{}': {}", code, file, e)))?;

    let prefixes = Arc::new(entry.prefixes);
    IP_CACHE.lock().unwrap().insert(key, prefixes.clone());
    Ok(prefixes)
}

/// Load the domain entries of one country code from a geosite file.
pub fn load_site(file: &str, code: &str) -> Result<Arc<Vec<GeoDomain>>> {
    let key = format!("{}:{}", file, code.to_ascii_uppercase());
    if let Some(cached) = SITE_CACHE.lock().unwrap().get(&key) {
        return Ok(cached.clone());
    }

    let data = read_asset(file)?;
    let body = find(&data, code.to_ascii_uppercase().as_bytes()).ok_or_else(|| {
        DnsError::config(format!("code '{}' not found in '{}'", code, file))
    })?;
    let entry = decode_geosite_body(body).map_err(|e| {
        DnsError::config(format!("bad geosite body for '{}' in '{}': {}", code, file, e))
    })?;

    let domains = Arc::new(entry.domains);
    SITE_CACHE.lock().unwrap().insert(key, domains.clone());
    Ok(domains)
}

/// Fully decode a geosite file into its per-code entries.
pub fn load_site_entries(file: &str) -> Result<Arc<Vec<GeoSiteEntry>>> {
    if let Some(cached) = SITE_LIST_CACHE.lock().unwrap().get(file) {
        return Ok(cached.clone());
    }

    let data = read_asset(file)?;
    let mut entries = Vec::new();
    for body in iter_record_bodies(&data) {
        let entry = decode_geosite_body(body)
            .map_err(|e| DnsError::config(format!("bad geosite entry in '{}': {}", file, e)))?;
        entries.push(entry);
    }

    let entries = Arc::new(entries);
    SITE_LIST_CACHE
        .lock()
        .unwrap()
        .insert(file.to_string(), entries.clone());
    Ok(entries)
}

/// Fully decode a geoip file into its per-code entries.
pub fn load_ip_entries(file: &str) -> Result<Arc<Vec<GeoIpEntry>>> {
    if let Some(cached) = IP_LIST_CACHE.lock().unwrap().get(file) {
        return Ok(cached.clone());
    }

    let data = read_asset(file)?;
    let mut entries = Vec::new();
    for body in iter_record_bodies(&data) {
        let entry = decode_geoip_body(body)
            .map_err(|e| DnsError::config(format!("bad geoip entry in '{}': {}", file, e)))?;
        entries.push(entry);
    }

    let entries = Arc::new(entries);
    IP_LIST_CACHE
        .lock()
        .unwrap()
        .insert(file.to_string(), entries.clone());
    Ok(entries)
}

fn read_asset(file: &str) -> Result<Arc<Vec<u8>>> {
    if let Some(cached) = FILE_CACHE.lock().unwrap().get(file) {
        return Ok(cached.clone());
    }
    let bytes = Arc::new(std::fs::read(file)?);
    FILE_CACHE
        .lock()
        .unwrap()
        .insert(file.to_string(), bytes.clone());
    Ok(bytes)
}

/// Scan top-level records and return the raw body whose country-code field
/// equals `code`. Non-matching bodies are skipped without decoding.
pub(crate) fn find<'a>(mut data: &'a [u8], code: &[u8]) -> Option<&'a [u8]> {
    if code.is_empty() {
        return None;
    }
    loop {
        if data.len() < 2 {
            return None;
        }
        // Record layout: {entry field key}{varint bodyLen}{body}.
        let (body_len, varint_len) = decode_varint(&data[1..])?;
        let head_len = 1 + varint_len;
        let body_len = body_len as usize;
        if data.len() < head_len + body_len {
            return None;
        }
        let body = &data[head_len..head_len + body_len];
        // The body opens with the country-code field: {key}{len}{bytes}.
        if body.len() >= 2 && body[1] as usize == code.len() {
            let code_end = 2 + code.len();
            if body.len() >= code_end && body[2..code_end].eq_ignore_ascii_case(code) {
                return Some(body);
            }
        }
        data = &data[head_len + body_len..];
    }
}

fn iter_record_bodies(data: &[u8]) -> RecordBodies<'_> {
    RecordBodies { data }
}

struct RecordBodies<'a> {
    data: &'a [u8],
}

impl<'a> Iterator for RecordBodies<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.data.len() < 2 {
            return None;
        }
        let (body_len, varint_len) = decode_varint(&self.data[1..])?;
        let head_len = 1 + varint_len;
        let body_len = body_len as usize;
        if self.data.len() < head_len + body_len {
            return None;
        }
        let body = &self.data[head_len..head_len + body_len];
        self.data = &self.data[head_len + body_len..];
        Some(body)
    }
}

fn decode_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut x = 0u64;
    let mut n = 0usize;
    for shift in (0..64).step_by(7) {
        let b = *buf.get(n)?;
        n += 1;
        x |= u64::from(b & 0x7f) << shift;
        if b & 0x80 == 0 {
            return Some((x, n));
        }
    }
    None
}

/// Minimal protobuf wire reader for the fields geo bodies use.
struct WireReader<'a> {
    data: &'a [u8],
}

impl<'a> WireReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        WireReader { data }
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn read_key(&mut self) -> std::result::Result<(u64, u8), String> {
        let (key, n) = decode_varint(self.data).ok_or("truncated field key")?;
        self.data = &self.data[n..];
        Ok((key >> 3, (key & 0x07) as u8))
    }

    fn read_varint(&mut self) -> std::result::Result<u64, String> {
        let (v, n) = decode_varint(self.data).ok_or("truncated varint")?;
        self.data = &self.data[n..];
        Ok(v)
    }

    fn read_bytes(&mut self) -> std::result::Result<&'a [u8], String> {
        let len = self.read_varint()? as usize;
        if self.data.len() < len {
            return Err("truncated length-delimited field".to_string());
        }
        let (head, tail) = self.data.split_at(len);
        self.data = tail;
        Ok(head)
    }

    fn skip(&mut self, wire_type: u8) -> std::result::Result<(), String> {
        match wire_type {
            0 => {
                self.read_varint()?;
            }
            1 => {
                if self.data.len() < 8 {
                    return Err("truncated fixed64".to_string());
                }
                self.data = &self.data[8..];
            }
            2 => {
                self.read_bytes()?;
            }
            5 => {
                if self.data.len() < 4 {
                    return Err("truncated fixed32".to_string());
                }
                self.data = &self.data[4..];
            }
            other => return Err(format!("unsupported wire type {}", other)),
        }
        Ok(())
    }
}

fn decode_geoip_body(body: &[u8]) -> std::result::Result<GeoIpEntry, String> {
    let mut reader = WireReader::new(body);
    let mut code = String::new();
    let mut prefixes = Vec::new();

    while !reader.is_empty() {
        let (field, wire_type) = reader.read_key()?;
        match field {
            1 => {
                let raw = reader.read_bytes()?;
                code = String::from_utf8_lossy(raw).into_owned();
            }
            2 => {
                let raw = reader.read_bytes()?;
                prefixes.push(decode_cidr(raw)?);
            }
            _ => reader.skip(wire_type)?,
        }
    }

    Ok(GeoIpEntry { code, prefixes })
}

fn decode_cidr(body: &[u8]) -> std::result::Result<IpNet, String> {
    let mut reader = WireReader::new(body);
    let mut ip: Option<IpAddr> = None;
    let mut prefix = 0u8;

    while !reader.is_empty() {
        let (field, wire_type) = reader.read_key()?;
        match field {
            1 => {
                let raw = reader.read_bytes()?;
                ip = Some(match raw.len() {
                    4 => IpAddr::from(<[u8; 4]>::try_from(raw).unwrap()),
                    16 => IpAddr::from(<[u8; 16]>::try_from(raw).unwrap()),
                    n => return Err(format!("bad address length {}", n)),
                });
            }
            2 => {
                prefix = reader.read_varint()? as u8;
            }
            _ => reader.skip(wire_type)?,
        }
    }

    let ip = ip.ok_or("cidr entry without address")?;
    IpNet::new(ip, prefix)
        .map(|net| net.trunc())
        .map_err(|e| format!("bad prefix /{}: {}", prefix, e))
}

fn decode_geosite_body(body: &[u8]) -> std::result::Result<GeoSiteEntry, String> {
    let mut reader = WireReader::new(body);
    let mut code = String::new();
    let mut domains = Vec::new();

    while !reader.is_empty() {
        let (field, wire_type) = reader.read_key()?;
        match field {
            1 => {
                let raw = reader.read_bytes()?;
                code = String::from_utf8_lossy(raw).into_owned();
            }
            2 => {
                let raw = reader.read_bytes()?;
                if let Some(domain) = decode_domain(raw)? {
                    domains.push(domain);
                }
            }
            _ => reader.skip(wire_type)?,
        }
    }

    Ok(GeoSiteEntry { code, domains })
}

fn decode_domain(body: &[u8]) -> std::result::Result<Option<GeoDomain>, String> {
    let mut reader = WireReader::new(body);
    let mut kind_raw = 0u64;
    let mut value = String::new();

    while !reader.is_empty() {
        let (field, wire_type) = reader.read_key()?;
        match field {
            1 => kind_raw = reader.read_varint()?,
            2 => {
                let raw = reader.read_bytes()?;
                value = String::from_utf8_lossy(raw).into_owned();
            }
            _ => reader.skip(wire_type)?,
        }
    }

    // Unknown entry kinds are skipped, not an error.
    Ok(GeoDomainKind::from_wire(kind_raw).map(|kind| GeoDomain { kind, value }))
}
