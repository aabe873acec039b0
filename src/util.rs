use std::io;

use n0_error::{Result, StackResultExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

pub(crate) use self::prebuffered::Prebuffered;

mod prebuffered;

/// Upper bound on a chunk-size line, including any chunk extensions.
const CHUNK_LINE_MAX_LENGTH: usize = 1024;

/// Splices bytes between the client connection and the target until both
/// directions have finished.
///
/// Each direction propagates end-of-stream by shutting down the peer's write
/// half once its copy completes, so a close on either side tears the relay
/// down. Returns the byte counts (client-to-target, target-to-client).
pub(crate) async fn splice_bidi(
    client_recv: &mut (impl AsyncRead + Send + Unpin),
    client_send: &mut (impl AsyncWrite + Send + Unpin),
    target_recv: &mut (impl AsyncRead + Send + Unpin),
    target_send: &mut (impl AsyncWrite + Send + Unpin),
) -> Result<(u64, u64)> {
    let start = n0_future::time::Instant::now();
    let (to_target, to_client) = tokio::join!(
        async {
            let res = tokio::io::copy(client_recv, target_send).await;
            target_send.shutdown().await.ok();
            trace!(?res, elapsed=?start.elapsed(), "client-to-target finished");
            res
        },
        async {
            let res = tokio::io::copy(target_recv, client_send).await;
            client_send.shutdown().await.ok();
            trace!(?res, elapsed=?start.elapsed(), "target-to-client finished");
            res
        }
    );
    let to_target = to_target.context("failed to copy client-to-target")?;
    let to_client = to_client.context("failed to copy target-to-client")?;
    Ok((to_target, to_client))
}

/// Copies exactly `len` bytes from `reader` to `writer`.
///
/// An end of stream before `len` bytes is an [`io::ErrorKind::UnexpectedEof`]
/// error.
pub(crate) async fn copy_exact(
    reader: &mut (impl AsyncRead + Unpin),
    writer: &mut (impl AsyncWrite + Unpin),
    len: u64,
) -> io::Result<u64> {
    let mut buf = [0u8; 16 * 1024];
    let mut remaining = len;
    while remaining > 0 {
        let want = buf.len().min(usize::try_from(remaining).unwrap_or(buf.len()));
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "body ended before its declared length",
            ));
        }
        writer.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }
    Ok(len)
}

/// Relays a chunked-encoded body, re-emitting the framing it parses.
///
/// Chunk extensions are dropped and the trailer section is consumed without
/// being forwarded. Returns the number of payload bytes relayed.
pub(crate) async fn copy_chunked(
    reader: &mut (impl AsyncRead + Unpin),
    writer: &mut (impl AsyncWrite + Unpin),
) -> io::Result<u64> {
    let mut total = 0u64;
    loop {
        let line = read_chunk_line(reader).await?;
        let size_field = line.split(';').next().unwrap_or_default().trim();
        let size = u64::from_str_radix(size_field, 16)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size"))?;
        if size == 0 {
            break;
        }
        writer.write_all(format!("{size:x}\r\n").as_bytes()).await?;
        copy_exact(reader, writer, size).await?;
        let delimiter = read_chunk_line(reader).await?;
        if !delimiter.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "missing CRLF after chunk data",
            ));
        }
        writer.write_all(b"\r\n").await?;
        total += size;
    }
    // Trailer fields run until an empty line.
    loop {
        if read_chunk_line(reader).await?.is_empty() {
            break;
        }
    }
    writer.write_all(b"0\r\n\r\n").await?;
    Ok(total)
}

/// Reads one CRLF-terminated line of chunked framing, without the CRLF.
async fn read_chunk_line(reader: &mut (impl AsyncRead + Unpin)) -> io::Result<String> {
    let mut line = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte).await?;
        if byte[0] == b'\n' {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return String::from_utf8(line)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err));
        }
        line.push(byte[0]);
        if line.len() > CHUNK_LINE_MAX_LENGTH {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "chunk size line too long",
            ));
        }
    }
}
