use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use http::{Method, StatusCode};
use n0_error::{AnyError, Result, anyerr, stack_error};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    net::{
        TcpListener, TcpStream,
        tcp::{ReadHalf, WriteHalf},
    },
};
use tokio_util::{
    future::FutureExt, sync::CancellationToken, task::TaskTracker, time::FutureExt as _,
};
use tracing::{Instrument, debug, error_span, warn};

use crate::{
    HEADER_SECTION_MAX_LENGTH,
    auth::{DynAuthenticator, PROXY_AUTHENTICATE_CHALLENGE},
    dial::{DialError, DynDialer, TcpDialer},
    headers::ServerIdent,
    parse::RequestHead,
    relay, tunnel,
    util::Prebuffered,
};

const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

const SCHEME_ERROR_BODY: &str = "Only \"http:\" protocol prefix is supported\n";

/// An HTTP/1.1 forward proxy server.
///
/// Accepts proxied requests on TCP connections and relays them to origin
/// servers: absolute-form requests (`GET http://host/path HTTP/1.1`) are
/// terminated and re-originated with rewritten headers, CONNECT requests
/// become raw byte tunnels.
///
/// # Extension points
///
/// - [`with_authenticator`](Self::with_authenticator) gates every request
///   behind a [`Authenticator`](crate::Authenticator); without one, all
///   requests are allowed.
/// - [`with_dialer`](Self::with_dialer) replaces how outbound connections
///   are opened, e.g. to pool them or route them elsewhere.
///
/// # Usage
///
/// ```ignore
/// let server = ProxyServer::new()
///     .with_authenticator(BasicAuthenticator::new("user", "secret"));
/// let listener = TcpListener::bind("127.0.0.1:3128").await?;
/// server.serve(listener).await?;
/// ```
#[derive(derive_more::Debug, Clone)]
pub struct ProxyServer {
    #[debug("{}", auth.as_ref().map(|_| "Some(Arc<dyn Authenticator>)").unwrap_or("None"))]
    pub(crate) auth: Option<Arc<DynAuthenticator<'static>>>,
    #[debug("Arc<dyn Dialer>")]
    pub(crate) dialer: Arc<DynDialer<'static>>,
    pub(crate) ident: ServerIdent,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Default for ProxyServer {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyServer {
    pub fn new() -> Self {
        Self {
            auth: None,
            dialer: DynDialer::new_arc(TcpDialer),
            ident: ServerIdent::detect(),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Installs an authentication handler. Every subsequent request must
    /// carry credentials the handler accepts, or it is challenged with 407.
    pub fn with_authenticator(mut self, auth: impl crate::Authenticator + 'static) -> Self {
        self.auth = Some(DynAuthenticator::new_arc(auth));
        self
    }

    /// Replaces the outbound connection dialer.
    pub fn with_dialer(mut self, dialer: impl crate::Dialer + 'static) -> Self {
        self.dialer = DynDialer::new_arc(dialer);
        self
    }

    /// The `Via` pseudonym this server appends to forwarded requests.
    pub fn via_token(&self) -> &str {
        self.ident.via_token()
    }

    /// Accepts connections from the listener and serves each in a new task.
    ///
    /// Runs until the listener errors or [`shutdown`](Self::shutdown) is
    /// called.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let mut id = 0u64;
        loop {
            let accepted = match listener.accept().with_cancellation_token(&self.shutdown).await {
                None => return Ok(()),
                Some(accepted) => accepted,
            };
            let (stream, peer) = accepted?;
            let this = self.clone();
            self.tasks.spawn(
                async move {
                    debug!(%peer, "accepted connection");
                    if let Err(err) = this.handle_connection(stream, peer).await {
                        if this.shutdown.is_cancelled() {
                            debug!("connection aborted at shutdown: {err:#}");
                        } else {
                            debug!("connection closed with error: {err:#}");
                        }
                    }
                }
                .instrument(error_span!("client", id)),
            );
            id += 1;
        }
    }

    /// Serves a single accepted client connection.
    ///
    /// Public so embedders with their own accept loop can drive the proxy
    /// directly.
    pub async fn handle_connection(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let (recv, send) = stream.split();
        let mut client = ClientConn {
            recv: Prebuffered::new(recv, HEADER_SECTION_MAX_LENGTH),
            send,
            peer,
            responded: false,
        };
        if let Err(err) = self.serve_requests(&mut client).await {
            if client.responded {
                // A status line is already on the wire; the only safe
                // teardown is dropping the socket.
                debug!("request failed after response started: {err:#}");
            } else if let Some(status) = err.response_status() {
                debug!(%status, "sending error response");
                if let Err(write_err) = write_error_response(&err, &mut client.send).await {
                    debug!("failed to send error response: {write_err:#}");
                }
            }
            return Err(err.into());
        }
        Ok(())
    }

    /// Reads request heads off the connection and dispatches them until the
    /// connection is not reusable.
    async fn serve_requests(&self, client: &mut ClientConn<'_>) -> Result<(), ProxyError> {
        loop {
            client.responded = false;
            let head = RequestHead::read(&mut client.recv)
                .await
                .map_err(ProxyError::bad_request)?;
            let Some(head) = head else {
                debug!("client closed the connection");
                return Ok(());
            };
            debug!(method=%head.method, target=%head.target, "incoming request");
            if head.method == Method::CONNECT {
                // A tunnelled connection carries raw bytes afterwards and is
                // never reused for HTTP.
                return tunnel::proxy_connect(self, head, client).await;
            }
            if !relay::proxy_request(self, head, client).await? {
                return Ok(());
            }
        }
    }

    /// Stops accepting connections and waits briefly for open ones to drain.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        debug!("shutting down ({} open connections)", self.tasks.len());
        match self.tasks.wait().timeout(GRACEFUL_SHUTDOWN_TIMEOUT).await {
            Ok(_) => debug!("all connections closed cleanly"),
            Err(_) => warn!(
                remaining = self.tasks.len(),
                "connections still open after grace period, aborting"
            ),
        }
    }
}

/// Per-connection state: the split client socket, the peer address, and the
/// response-sent latch for the request currently being served.
pub(crate) struct ClientConn<'a> {
    pub(crate) recv: Prebuffered<ReadHalf<'a>>,
    pub(crate) send: WriteHalf<'a>,
    pub(crate) peer: SocketAddr,
    /// Flips the moment a status line (or the CONNECT 200) is committed to
    /// the wire; afterwards error paths must destroy the socket instead of
    /// writing a second status line.
    pub(crate) responded: bool,
}

/// Error type for failed proxy exchanges.
///
/// `response_status` carries the status to surface to the client when no
/// response has been started yet; `None` means the failure is only
/// observable as a closed connection.
#[stack_error(add_meta, derive)]
pub struct ProxyError {
    response_status: Option<StatusCode>,
    body: Option<&'static str>,
    #[error(source)]
    source: AnyError,
}

impl ProxyError {
    /// The HTTP status to surface to the client, if any.
    pub fn response_status(&self) -> Option<StatusCode> {
        self.response_status
    }

    pub(crate) fn bad_request(source: impl Into<AnyError>) -> Self {
        Self::new(Some(StatusCode::BAD_REQUEST), None, source.into())
    }

    pub(crate) fn unsupported_scheme() -> Self {
        Self::new(
            Some(StatusCode::BAD_REQUEST),
            Some(SCHEME_ERROR_BODY),
            anyerr!("request target is not an http URL"),
        )
    }

    pub(crate) fn auth_required(source: impl Into<AnyError>) -> Self {
        Self::new(
            Some(StatusCode::PROXY_AUTHENTICATION_REQUIRED),
            None,
            source.into(),
        )
    }

    pub(crate) fn not_found(source: impl Into<AnyError>) -> Self {
        Self::new(Some(StatusCode::NOT_FOUND), None, source.into())
    }

    pub(crate) fn internal(source: impl Into<AnyError>) -> Self {
        Self::new(Some(StatusCode::INTERNAL_SERVER_ERROR), None, source.into())
    }

    pub(crate) fn io(source: impl Into<AnyError>) -> Self {
        Self::new(None, None, source.into())
    }
}

impl From<io::Error> for ProxyError {
    #[track_caller]
    fn from(value: io::Error) -> Self {
        Self::io(value)
    }
}

impl From<DialError> for ProxyError {
    #[track_caller]
    fn from(value: DialError) -> Self {
        match value {
            DialError::Resolve { .. } => Self::not_found(value),
            DialError::Connect { .. } => Self::internal(value),
        }
    }
}

/// Writes a status-only error response and closes the stream.
///
/// The body, when present, is a single line delimited by the connection
/// close; 407 responses additionally carry the authentication challenge.
async fn write_error_response(
    err: &ProxyError,
    writer: &mut (impl AsyncWrite + Unpin),
) -> io::Result<()> {
    let Some(status) = err.response_status() else {
        return Ok(());
    };
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or_default()
    );
    if status == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
        head.push_str("Proxy-Authenticate: ");
        head.push_str(PROXY_AUTHENTICATE_CHALLENGE);
        head.push_str("\r\n");
    }
    head.push_str("Connection: close\r\n\r\n");
    if let Some(body) = err.body {
        head.push_str(body);
    }
    writer.write_all(head.as_bytes()).await?;
    writer.shutdown().await
}
