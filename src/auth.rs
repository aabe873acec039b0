use std::future::Future;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64_STANDARD};
use dynosaur::dynosaur;
use n0_error::{AnyError, Result, anyerr};

use crate::{parse::RequestHead, server::ProxyError};

/// The challenge sent with every 407 response. Scheme and realm are fixed.
pub(crate) const PROXY_AUTHENTICATE_CHALLENGE: &str = "Basic realm=\"proxy\"";

#[dynosaur(pub(crate) DynAuthenticator = dyn(box) Authenticator)]
/// Decides whether a proxied request may proceed.
///
/// Installed on the server with
/// [`ProxyServer::with_authenticator`](crate::ProxyServer::with_authenticator);
/// when absent, every request is allowed. The handler sees the full request
/// head, including its `Proxy-Authorization` header.
pub trait Authenticator: Send + Sync {
    /// Returns whether the request is authorized.
    ///
    /// `Ok(false)` challenges the client with 407; an error is the handler's
    /// own failure and yields 500.
    fn authenticate<'a>(
        &'a self,
        req: &'a RequestHead,
    ) -> impl Future<Output = Result<bool, AnyError>> + Send + 'a;
}

/// Runs the authentication gate for one request.
///
/// No authenticator means the request is allowed: authentication is opt-in.
/// With an authenticator installed, a request without credentials is
/// challenged without consulting the handler.
pub(crate) async fn authorize(
    auth: Option<&DynAuthenticator<'_>>,
    req: &RequestHead,
) -> Result<(), ProxyError> {
    let Some(auth) = auth else {
        return Ok(());
    };
    if !req.headers.contains("proxy-authorization") {
        return Err(ProxyError::auth_required(anyerr!(
            "missing Proxy-Authorization header"
        )));
    }
    match auth.authenticate(req).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(ProxyError::auth_required(anyerr!("credentials rejected"))),
        Err(err) => Err(ProxyError::internal(err)),
    }
}

/// Checks `Proxy-Authorization: Basic` credentials against a fixed
/// username and password.
#[derive(Debug, Clone)]
pub struct BasicAuthenticator {
    username: String,
    password: String,
}

impl BasicAuthenticator {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Authenticator for BasicAuthenticator {
    async fn authenticate(&self, req: &RequestHead) -> Result<bool, AnyError> {
        let Some(value) = req.headers.get("proxy-authorization") else {
            return Ok(false);
        };
        let Some(encoded) = std::str::from_utf8(value)
            .ok()
            .map(str::trim)
            .and_then(|value| value.strip_prefix("Basic "))
        else {
            return Ok(false);
        };
        let Ok(decoded) = BASE64_STANDARD.decode(encoded.trim()) else {
            return Ok(false);
        };
        let mut parts = decoded.splitn(2, |byte| *byte == b':');
        let username = parts.next().unwrap_or_default();
        let password = parts.next().unwrap_or_default();
        let username_ok = constant_time_eq(self.username.as_bytes(), username);
        let password_ok = constant_time_eq(self.password.as_bytes(), password);
        Ok(username_ok & password_ok)
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (left, right) in a.iter().zip(b.iter()) {
        diff |= left ^ right;
    }
    diff == 0
}
