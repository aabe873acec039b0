use std::str::FromStr;

use http::{Method, StatusCode, Uri};
use n0_error::{Result, StackResultExt, StdResultExt, anyerr, ensure_any};
use tokio::io::{self, AsyncRead};

use crate::{headers::HeaderList, util::Prebuffered};

/// Host and port of a proxy target.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
#[display("{host}:{port}")]
pub struct Authority {
    /// Hostname or IP literal, without brackets for IPv6.
    pub host: String,
    /// Port number in host byte order.
    pub port: u16,
}

impl FromStr for Authority {
    type Err = n0_error::AnyError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_authority_str(s)
    }
}

impl Authority {
    /// Parses an authority-form request target (`host:port`).
    ///
    /// The port is required and must consist of decimal digits only.
    pub fn from_authority_str(s: &str) -> Result<Self> {
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            // Bracketed IPv6 literal.
            let end = rest.find(']').context("invalid IPv6 authority")?;
            let port = rest[end + 1..]
                .strip_prefix(':')
                .context("target port is required")?;
            (&rest[..end], port)
        } else {
            s.rsplit_once(':').context("target port is required")?
        };
        ensure_any!(!host.is_empty(), "target host is required");
        ensure_any!(
            !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()),
            "target port must be a decimal integer"
        );
        let port = port.parse::<u16>().std_context("target port out of range")?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// Extracts host and port from an absolute-form `http` URL.
    ///
    /// Note: a missing port defaults to 80.
    pub fn from_absolute_uri(uri: &Uri) -> Result<Self> {
        let authority = uri.authority().context("URL has no authority")?;
        Ok(Self {
            host: authority.host().trim_matches(['[', ']']).to_string(),
            port: authority.port_u16().unwrap_or(80),
        })
    }
}

/// Parsed request line and header section of a client request.
#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    /// Request target exactly as it appeared on the request line.
    pub target: String,
    /// Minor version of the HTTP/1.x request.
    pub version: u8,
    pub headers: HeaderList,
}

impl RequestHead {
    /// Reads and parses a request head, consuming it from `reader`.
    ///
    /// Returns `None` when the peer closed the connection before sending
    /// anything. A close mid-header-section, or a header section exceeding
    /// the buffer limit, is an error.
    pub(crate) async fn read(
        reader: &mut Prebuffered<impl AsyncRead + Unpin>,
    ) -> Result<Option<Self>> {
        loop {
            if let Some((len, head)) = Self::parse_with_len(reader.pending())? {
                reader.consume(len);
                return Ok(Some(head));
            }
            if reader.is_at_limit() {
                return Err(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    "request header section exceeds buffer limit",
                )
                .into());
            }
            if reader.fill().await? == 0 {
                if reader.pending().is_empty() {
                    return Ok(None);
                }
                return Err(anyerr!("connection closed inside request header section"));
            }
        }
    }

    /// Parses a request head from a buffer, returning `None` when incomplete.
    ///
    /// Returns the length of the header section and the parsed head.
    pub fn parse_with_len(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(buf).std_context("invalid HTTP request")? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(header_len) => {
                let method = req
                    .method
                    .context("missing HTTP method")?
                    .parse::<Method>()
                    .std_context("invalid HTTP method")?;
                let target = req.path.context("missing request target")?.to_string();
                let version = req.version.context("missing HTTP version")?;
                let headers = req
                    .headers
                    .iter()
                    .map(|header| (header.name, header.value))
                    .collect();
                Ok(Some((
                    header_len,
                    Self {
                        method,
                        target,
                        version,
                        headers,
                    },
                )))
            }
        }
    }

    /// Whether the client asked for this connection to close after the
    /// current exchange.
    pub(crate) fn wants_close(&self) -> bool {
        if self.version == 0 {
            return !self.headers.connection_has_token("keep-alive");
        }
        self.headers.connection_has_token("close")
    }
}

/// Parsed status line and header section of an upstream response.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    /// Reason phrase as sent by the origin, if any.
    pub reason: Option<String>,
    pub headers: HeaderList,
}

impl ResponseHead {
    /// Reads and parses a response head, consuming it from `reader`.
    pub(crate) async fn read(
        reader: &mut Prebuffered<impl AsyncRead + Unpin>,
    ) -> Result<Self> {
        loop {
            if let Some((len, head)) = Self::parse_with_len(reader.pending())? {
                reader.consume(len);
                return Ok(head);
            }
            if reader.is_at_limit() {
                return Err(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    "response header section exceeds buffer limit",
                )
                .into());
            }
            if reader.fill().await? == 0 {
                return Err(anyerr!("connection closed inside response header section"));
            }
        }
    }

    /// Parses a response head from a buffer, returning `None` when incomplete.
    ///
    /// Returns the length of the header section and the parsed head.
    pub fn parse_with_len(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut res = httparse::Response::new(&mut headers);
        match res.parse(buf).std_context("invalid HTTP response")? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(header_len) => {
                let code = res.code.context("missing response status code")?;
                let status =
                    StatusCode::from_u16(code).std_context("invalid response status code")?;
                let reason = res.reason.filter(|r| !r.is_empty()).map(ToOwned::to_owned);
                let headers = res
                    .headers
                    .iter()
                    .map(|header| (header.name, header.value))
                    .collect();
                Ok(Some((
                    header_len,
                    Self {
                        status,
                        reason,
                        headers,
                    },
                )))
            }
        }
    }

    /// Formats the status line relayed to the client.
    pub fn status_line(&self) -> String {
        format!(
            "HTTP/1.1 {} {}\r\n",
            self.status.as_u16(),
            self.reason
                .as_deref()
                .or(self.status.canonical_reason())
                .unwrap_or_default()
        )
    }
}
