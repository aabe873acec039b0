//! CONNECT tunneling.
//!
//! After the 200 response the connection carries raw bytes, so the status
//! line is written directly on the client socket and the proxy switches to
//! a plain bidirectional splice. No header processing happens beyond the
//! request line.

use n0_error::anyerr;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::{
    auth::authorize,
    dial::Dialer,
    parse::{Authority, RequestHead},
    server::{ClientConn, ProxyError, ProxyServer},
    util::splice_bidi,
};

const ESTABLISHED_RESPONSE: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// Establishes a raw TCP tunnel to the authority-form target and relays
/// bytes in both directions until either side closes.
pub(crate) async fn proxy_connect(
    server: &ProxyServer,
    head: RequestHead,
    client: &mut ClientConn<'_>,
) -> Result<(), ProxyError> {
    // Nothing may arrive between the CONNECT header section and the tunnel
    // going up: the client cannot know yet whether the target is reachable.
    if !client.recv.pending().is_empty() {
        return Err(ProxyError::bad_request(anyerr!(
            "unexpected payload before tunnel establishment"
        )));
    }

    let target = Authority::from_authority_str(&head.target).map_err(ProxyError::bad_request)?;

    authorize(server.auth.as_deref(), &head).await?;

    let target_stream = server.dialer.dial(&target).await?;
    debug!(%target, "tunnel target connected");

    // The full 200 must be on the wire before the first target byte; the
    // latch flips first so a failed write cannot lead to a second status.
    client.responded = true;
    client.send.write_all(ESTABLISHED_RESPONSE).await?;
    client.send.flush().await?;

    let (mut target_recv, mut target_send) = target_stream.into_split();
    let (to_target, to_client) = splice_bidi(
        &mut client.recv,
        &mut client.send,
        &mut target_recv,
        &mut target_send,
    )
    .await
    .map_err(ProxyError::io)?;
    debug!(to_target, to_client, "tunnel closed");
    Ok(())
}
