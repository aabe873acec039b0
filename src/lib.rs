//! Building blocks for an HTTP/1.1 forward proxy over TCP.
//!
//! [`ProxyServer`] accepts client connections and serves the two proxied
//! request forms: absolute-form requests (`GET http://host/path HTTP/1.1`)
//! are terminated and re-originated toward the origin with rewritten
//! headers, and `CONNECT host:port` requests become raw bidirectional byte
//! tunnels. Hop-by-hop headers never cross the proxy; forwarded requests
//! gain `Via` and `X-Forwarded-For` entries.
//!
//! Authentication is opt-in through the [`Authenticator`] trait (requests
//! without acceptable credentials are challenged with 407), and outbound
//! connections go through the [`Dialer`] trait so embedders can pool or
//! reroute them.

mod auth;
mod dial;
mod headers;
mod parse;
mod relay;
mod server;
mod tunnel;
mod util;

pub use auth::{Authenticator, BasicAuthenticator};
pub use dial::{DialError, Dialer, TcpDialer};
pub use headers::HeaderList;
pub use parse::{Authority, RequestHead, ResponseHead};
pub use server::{ProxyError, ProxyServer};

/// How much data to read for a request or response header section before
/// it's considered invalid. 8KB should be plenty.
pub(crate) const HEADER_SECTION_MAX_LENGTH: usize = 8192;
