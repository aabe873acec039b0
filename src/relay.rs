//! The proxy path for non-CONNECT methods.
//!
//! Each request is terminated and re-originated: the target URL is parsed
//! from the absolute-form request line, headers are rewritten for the
//! upstream hop, and both bodies are streamed with the framing the proxy
//! itself owns. A failure before the response latch turns into a status for
//! the client; after the latch the socket is destroyed.

use std::{pin::pin, str::FromStr};

use http::Uri;
use n0_error::anyerr;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::{
    HEADER_SECTION_MAX_LENGTH,
    auth::authorize,
    dial::Dialer,
    headers::{BodyFraming, rewrite_request, rewrite_response},
    parse::{Authority, RequestHead, ResponseHead},
    server::{ClientConn, ProxyError, ProxyServer},
    util::{Prebuffered, copy_chunked, copy_exact},
};

/// Relays one request to its origin and streams the response back.
///
/// Returns whether the client connection may be reused for another request.
pub(crate) async fn proxy_request(
    server: &ProxyServer,
    head: RequestHead,
    client: &mut ClientConn<'_>,
) -> Result<bool, ProxyError> {
    // The client socket is not read from until the gate decides: pipelined
    // body bytes stay in the prebuffer.
    authorize(server.auth.as_deref(), &head).await?;

    let uri = Uri::from_str(&head.target).map_err(|err| ProxyError::bad_request(anyerr!(err)))?;
    if uri.scheme_str() != Some("http") {
        return Err(ProxyError::unsupported_scheme());
    }
    let target = Authority::from_absolute_uri(&uri).map_err(ProxyError::bad_request)?;
    let origin_form = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let request_body = BodyFraming::of_request(&head.headers).map_err(ProxyError::bad_request)?;
    let mut upstream_headers = rewrite_request(
        &head.headers,
        client.peer.ip(),
        server.ident.via_token(),
    );
    if !upstream_headers.contains("host") {
        upstream_headers.push("Host", target.to_string().into_bytes());
    }
    if request_body == BodyFraming::Chunked {
        // The incoming Transfer-Encoding was stripped as hop-by-hop; the
        // proxy re-frames the body under its own. A stray Content-Length
        // must not contradict it.
        upstream_headers.remove("content-length");
        upstream_headers.push("Transfer-Encoding", b"chunked".as_slice());
    }

    let upstream = server.dialer.dial(&target).await?;
    debug!(%target, "connected to origin");
    let (upstream_recv, mut upstream_send) = upstream.into_split();
    let mut upstream_recv = Prebuffered::new(upstream_recv, HEADER_SECTION_MAX_LENGTH);

    let mut request_head = Vec::with_capacity(256);
    request_head.extend_from_slice(head.method.as_str().as_bytes());
    request_head.push(b' ');
    request_head.extend_from_slice(origin_form.as_bytes());
    request_head.extend_from_slice(b" HTTP/1.1\r\n");
    upstream_headers.encode_into(&mut request_head);
    request_head.extend_from_slice(b"\r\n");
    upstream_send
        .write_all(&request_head)
        .await
        .map_err(|err| ProxyError::internal(anyerr!(err)))?;

    // Stream the request body upstream while waiting for the response head,
    // so an upstream that answers early or dies mid-upload is observed
    // either way.
    let mut body_sent = false;
    let response = {
        let mut send_body = pin!(async {
            match request_body {
                BodyFraming::Empty => Ok(0),
                BodyFraming::Length(len) => {
                    copy_exact(&mut client.recv, &mut upstream_send, len).await
                }
                BodyFraming::Chunked => copy_chunked(&mut client.recv, &mut upstream_send).await,
                // Requests are never close-delimited.
                BodyFraming::Close => Ok(0),
            }
        });
        let mut recv_response = pin!(ResponseHead::read(&mut upstream_recv));
        loop {
            tokio::select! {
                sent = &mut send_body, if !body_sent => {
                    sent.map_err(|err| ProxyError::internal(anyerr!(err)))?;
                    body_sent = true;
                }
                response = &mut recv_response => {
                    break response.map_err(ProxyError::internal)?;
                }
            }
        }
    };
    debug!(status=%response.status, "response head from origin");

    let response_body = BodyFraming::of_response(&head.method, response.status, &response.headers)
        .map_err(ProxyError::internal)?;
    let mut client_headers = rewrite_response(&response.headers);
    match response_body {
        BodyFraming::Chunked => {
            client_headers.remove("content-length");
            client_headers.push("Transfer-Encoding", b"chunked".as_slice());
        }
        BodyFraming::Close => client_headers.push("Connection", b"close".as_slice()),
        _ => {}
    }

    // From here on a second status line must never be written.
    client.responded = true;
    let mut response_head = Vec::with_capacity(256);
    response_head.extend_from_slice(response.status_line().as_bytes());
    client_headers.encode_into(&mut response_head);
    response_head.extend_from_slice(b"\r\n");
    client.send.write_all(&response_head).await?;

    match response_body {
        BodyFraming::Empty => {}
        BodyFraming::Length(len) => {
            copy_exact(&mut upstream_recv, &mut client.send, len).await?;
        }
        BodyFraming::Chunked => {
            copy_chunked(&mut upstream_recv, &mut client.send).await?;
        }
        BodyFraming::Close => {
            tokio::io::copy(&mut upstream_recv, &mut client.send).await?;
        }
    }
    client.send.flush().await?;
    debug!("response relayed");

    let reuse = body_sent && response_body != BodyFraming::Close && !head.wants_close();
    Ok(reuse)
}
