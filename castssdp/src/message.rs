//! SSDP wire messages: parsing of NOTIFY / search responses, M-SEARCH building.

use std::collections::HashMap;
use std::net::SocketAddr;

use tracing::trace;

use super::{DEFAULT_MAX_AGE, SEARCH_MX, SSDP_MULTICAST_ADDR, SSDP_PORT};

/// Message class, derived from the datagram start line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SsdpPacketKind {
    /// Unsolicited `NOTIFY * HTTP/1.1` announcement.
    Notify,
    /// `HTTP/1.1 200 OK` reply to one of our M-SEARCH requests.
    SearchResponse,
    /// `M-SEARCH * HTTP/1.1` from another control point. Never acted on.
    Search,
}

/// A parsed SSDP datagram.
#[derive(Debug, Clone)]
pub struct SsdpPacket {
    pub kind: SsdpPacketKind,
    pub headers: HashMap<String, String>,
    pub from: SocketAddr,
}

impl SsdpPacket {
    /// Parse a raw datagram. Returns `None` for empty payloads and
    /// unrecognized start lines.
    pub fn parse(data: &str, from: SocketAddr) -> Option<Self> {
        let mut lines = data.lines();
        let first_line = lines.next()?.trim();
        let upper = first_line.to_ascii_uppercase();

        let kind = if upper.starts_with("NOTIFY ") {
            SsdpPacketKind::Notify
        } else if upper.starts_with("HTTP/") && upper.contains(" 200 ") {
            SsdpPacketKind::SearchResponse
        } else if upper.starts_with("M-SEARCH ") {
            SsdpPacketKind::Search
        } else {
            trace!("Unknown SSDP message type from {}: {}", from, first_line);
            return None;
        };

        let headers = parse_headers(lines);
        if headers.is_empty() {
            trace!("SSDP message from {} carries no headers", from);
            return None;
        }

        Some(Self {
            kind,
            headers,
            from,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// The filter token of this packet: `NT` on notifications, `ST` on
    /// search responses.
    pub fn filter_token(&self) -> Option<&str> {
        match self.kind {
            SsdpPacketKind::Notify => self.header("NT"),
            SsdpPacketKind::SearchResponse => self.header("ST"),
            SsdpPacketKind::Search => None,
        }
    }

    /// True when the packet announces a service leaving the network.
    pub fn is_byebye(&self) -> bool {
        self.header("NTS")
            .map(|nts| nts.eq_ignore_ascii_case("ssdp:byebye"))
            .unwrap_or(false)
    }

    pub fn max_age(&self) -> u32 {
        parse_max_age(self.header("CACHE-CONTROL"))
    }
}

/// Build an M-SEARCH request for the given search target.
pub fn search_message(st: &str) -> String {
    let mx = SEARCH_MX.max(1); // MX must be >= 1
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {}:{}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: {}\r\n\
         ST: {}\r\n\
         USER-AGENT: CastLink SSDP Client\r\n\
         \r\n",
        SSDP_MULTICAST_ADDR, SSDP_PORT, mx, st
    )
}

/// Extract the service instance uuid from a `USN` header value: the token
/// following `uuid:`, up to the first `::` or the end of the string.
pub fn extract_uuid(usn: &str) -> Option<String> {
    let lower = usn.trim().to_ascii_lowercase();
    let idx = lower.find("uuid:")?;
    let sub = &lower[idx + "uuid:".len()..];
    if sub.is_empty() {
        return None;
    }
    match sub.find("::") {
        Some(end) if end == 0 => None,
        Some(end) => Some(sub[..end].to_string()),
        None => Some(sub.to_string()),
    }
}

fn parse_headers<'a, I>(lines: I) -> HashMap<String, String>
where
    I: Iterator<Item = &'a str>,
{
    let mut headers = HashMap::new();
    for line in lines {
        let line = line.trim();

        // Empty line marks end of headers
        if line.is_empty() {
            break;
        }

        // Split on first ':' only (values may contain ':')
        if let Some(colon_pos) = line.find(':') {
            let (name, value_with_colon) = line.split_at(colon_pos);
            let value = &value_with_colon[1..];

            let name = name.trim().to_ascii_uppercase();
            let value = value.trim().to_string();

            if !name.is_empty() && !value.is_empty() {
                headers.insert(name, value);
            } else {
                trace!("Skipping malformed header: '{}'", line);
            }
        } else {
            trace!("Skipping line without colon: '{}'", line);
        }
    }
    headers
}

fn parse_max_age(value: Option<&str>) -> u32 {
    if let Some(v) = value {
        let lower = v.to_ascii_lowercase();
        if let Some(idx) = lower.find("max-age") {
            let after_key = &v[idx + 7..];
            let after_eq = after_key.trim_start().trim_start_matches('=').trim_start();
            let digits: String = after_eq
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            if let Ok(age) = digits.parse::<u32>() {
                return age;
            }
        }
        trace!(
            "Could not parse max-age from CACHE-CONTROL: '{}', using default {}",
            v, DEFAULT_MAX_AGE
        );
    }
    DEFAULT_MAX_AGE
}
