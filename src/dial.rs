use std::future::Future;

use dynosaur::dynosaur;
use n0_error::{AnyError, Result, anyerr, e, stack_error};
use tokio::net::{TcpStream, lookup_host};

use crate::parse::Authority;

/// Failure to open an outbound connection, split at the boundary that
/// decides the client-facing status: name resolution versus transport.
#[stack_error(add_meta, derive)]
pub enum DialError {
    /// The target host could not be resolved.
    Resolve { source: AnyError },
    /// The target resolved but no connection could be established.
    Connect { source: AnyError },
}

#[dynosaur(pub(crate) DynDialer = dyn(box) Dialer)]
/// Opens outbound TCP connections for the proxy.
///
/// This is the server's outbound-connection hook: the default implementation
/// dials directly, a custom one can pool connections or route through
/// another network. Shared across all requests, so implementations carry
/// their own synchronization.
pub trait Dialer: Send + Sync {
    /// Connects to the target, classifying failures as resolution or
    /// transport errors.
    fn dial<'a>(
        &'a self,
        target: &'a Authority,
    ) -> impl Future<Output = Result<TcpStream, DialError>> + Send + 'a;
}

/// Default dialer: resolve via the platform resolver, then connect to the
/// first address that accepts.
#[derive(Debug, Clone, Default)]
pub struct TcpDialer;

impl Dialer for TcpDialer {
    async fn dial(&self, target: &Authority) -> Result<TcpStream, DialError> {
        let addrs = lookup_host((target.host.as_str(), target.port))
            .await
            .map_err(|err| e!(DialError::Resolve, anyerr!(err)))?;
        let mut last_err = anyerr!("no addresses found for {}", target.host);
        let mut resolved_any = false;
        for addr in addrs {
            resolved_any = true;
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(err) => last_err = anyerr!(err),
            }
        }
        if resolved_any {
            Err(e!(DialError::Connect, last_err))
        } else {
            Err(e!(DialError::Resolve, last_err))
        }
    }
}
