//! Ordered header storage and the proxy's header rewriting rules.
//!
//! Headers are kept as a sequence of (name, value) pairs: order is preserved,
//! duplicates are permitted, and names keep the casing they had on the wire.
//! Lookup is case-insensitive. On the way through the proxy, hop-by-hop
//! headers (RFC 7230 §6.1) are removed and the request direction gains
//! `Via` and `X-Forwarded-For` entries.

use std::net::IpAddr;

use http::{Method, StatusCode};
use n0_error::{Result, anyerr};

/// Headers that are meaningful for a single connection only and must not
/// cross the proxy in either direction.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub(crate) fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|hop| hop.eq_ignore_ascii_case(name))
}

/// An ordered multimap of HTTP headers.
#[derive(Debug, Clone, Default)]
pub struct HeaderList {
    entries: Vec<(String, Vec<u8>)>,
}

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a header, keeping any existing entries with the same name.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Returns the value of the first header matching `name`, compared
    /// case-insensitively.
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(entry, _)| entry.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_slice())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Removes every entry matching `name`, compared case-insensitively.
    pub fn remove(&mut self, name: &str) {
        self.entries
            .retain(|(entry, _)| !entry.eq_ignore_ascii_case(name));
    }

    /// Iterates entries in their original order, duplicates included.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parses the `Content-Length` value, if any.
    ///
    /// Multiple entries must agree; conflicting or malformed values are an
    /// error per RFC 7230 §3.3.2.
    pub(crate) fn content_length(&self) -> Result<Option<u64>> {
        let mut parsed = None;
        for (name, value) in self.iter() {
            if !name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            let value = std::str::from_utf8(value)
                .ok()
                .map(str::trim)
                .and_then(|value| value.parse::<u64>().ok())
                .ok_or_else(|| anyerr!("invalid Content-Length header"))?;
            match parsed {
                Some(existing) if existing != value => {
                    return Err(anyerr!("conflicting Content-Length headers"));
                }
                _ => parsed = Some(value),
            }
        }
        Ok(parsed)
    }

    /// Whether any `Transfer-Encoding` entry lists the `chunked` coding.
    pub(crate) fn has_chunked_transfer_encoding(&self) -> bool {
        self.iter()
            .filter(|(name, _)| name.eq_ignore_ascii_case("transfer-encoding"))
            .filter_map(|(_, value)| std::str::from_utf8(value).ok())
            .flat_map(|value| value.split(','))
            .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
    }

    /// Whether any `Connection` entry lists `token`.
    pub(crate) fn connection_has_token(&self, token: &str) -> bool {
        self.iter()
            .filter(|(name, _)| name.eq_ignore_ascii_case("connection"))
            .filter_map(|(_, value)| std::str::from_utf8(value).ok())
            .flat_map(|value| value.split(','))
            .any(|entry| entry.trim().eq_ignore_ascii_case(token))
    }

    /// Serializes all entries as `name: value\r\n` lines.
    pub(crate) fn encode_into(&self, out: &mut Vec<u8>) {
        for (name, value) in self.iter() {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
    }
}

impl<'a> FromIterator<(&'a str, &'a [u8])> for HeaderList {
    fn from_iter<T: IntoIterator<Item = (&'a str, &'a [u8])>>(iter: T) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(name, value)| (name.to_string(), value.to_vec()))
                .collect(),
        }
    }
}

/// Rewrites client request headers for the upstream hop.
///
/// Hop-by-hop headers are dropped. The first `X-Forwarded-For` gains the
/// client address, the first `Via` gains the proxy's pseudonym; when either
/// is absent a fresh entry is appended after the originals.
pub(crate) fn rewrite_request(
    headers: &HeaderList,
    client_addr: IpAddr,
    via_token: &str,
) -> HeaderList {
    let mut out = HeaderList::new();
    let mut seen_forwarded_for = false;
    let mut seen_via = false;
    for (name, value) in headers.iter() {
        if is_hop_by_hop(name) {
            continue;
        }
        if !seen_forwarded_for && name.eq_ignore_ascii_case("x-forwarded-for") {
            seen_forwarded_for = true;
            out.push(name, extend_list_value(value, &client_addr.to_string()));
        } else if !seen_via && name.eq_ignore_ascii_case("via") {
            seen_via = true;
            out.push(name, extend_list_value(value, via_token));
        } else {
            out.push(name, value);
        }
    }
    if !seen_forwarded_for {
        out.push("X-Forwarded-For", client_addr.to_string().into_bytes());
    }
    if !seen_via {
        out.push("Via", via_token.as_bytes());
    }
    out
}

/// Rewrites upstream response headers for the client hop.
///
/// Only hop-by-hop stripping applies; `Via` and `X-Forwarded-For` injection
/// is request-direction only.
pub(crate) fn rewrite_response(headers: &HeaderList) -> HeaderList {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name))
        .collect()
}

fn extend_list_value(value: &[u8], element: &str) -> Vec<u8> {
    let mut out = value.to_vec();
    out.extend_from_slice(b", ");
    out.extend_from_slice(element.as_bytes());
    out
}

/// The proxy's process-wide identity: the local hostname combined with the
/// fixed product token into the `Via` pseudonym `1.1 <host> (proxy/<version>)`.
#[derive(Debug, Clone)]
pub struct ServerIdent {
    via_token: String,
}

const PRODUCT_TOKEN: &str = concat!("proxy/", env!("CARGO_PKG_VERSION"));

impl ServerIdent {
    /// Detects the local hostname, falling back to `localhost`.
    pub(crate) fn detect() -> Self {
        let host = hostname::get()
            .map(|host| host.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());
        Self::for_host(&host)
    }

    pub(crate) fn for_host(host: &str) -> Self {
        Self {
            via_token: format!("1.1 {host} ({PRODUCT_TOKEN})"),
        }
    }

    /// The element this proxy appends to the `Via` chain.
    pub fn via_token(&self) -> &str {
        &self.via_token
    }
}

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    /// No body follows the header section.
    Empty,
    /// Exactly this many bytes follow.
    Length(u64),
    /// Chunk-encoded until a zero-length chunk.
    Chunked,
    /// Delimited by closing the connection (responses only).
    Close,
}

impl BodyFraming {
    /// Classifies a request body. Requests cannot be close-delimited; with
    /// neither `Transfer-Encoding: chunked` nor `Content-Length` there is no
    /// body.
    pub(crate) fn of_request(headers: &HeaderList) -> Result<Self> {
        if headers.has_chunked_transfer_encoding() {
            return Ok(Self::Chunked);
        }
        Ok(match headers.content_length()? {
            Some(len) => Self::Length(len),
            None => Self::Empty,
        })
    }

    /// Classifies a response body per RFC 7230 §3.3.3.
    pub(crate) fn of_response(
        method: &Method,
        status: StatusCode,
        headers: &HeaderList,
    ) -> Result<Self> {
        if method == Method::HEAD
            || status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
        {
            return Ok(Self::Empty);
        }
        if headers.has_chunked_transfer_encoding() {
            return Ok(Self::Chunked);
        }
        Ok(match headers.content_length()? {
            Some(len) => Self::Length(len),
            None => Self::Close,
        })
    }
}
