//! The HTTP face of the handshake: reading `Authorization` headers and answering with
//! `WWW-Authenticate` challenges.
//!
//! An HTTP handler typically calls [`Policy::authorize`] first; an empty result means the request
//! is not (yet) authenticated, and [`Policy::notify_auth_required`] builds the 401 response that
//! requests the next step of the handshake.


use std::fmt;
use std::hash::Hash;
use std::net::SocketAddr;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use http::{HeaderValue, Method, Request, Response, StatusCode, Uri};
use http::header::{AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use tracing::warn;

use crate::{Error, ErrorKind};
use crate::handshake::HandshakeCoordinator;
use crate::message::{MessageType, read_message_number};
use crate::provider::SecurityProvider;


/// The response body written by default when a request cannot be authorized.
pub const STATUS_UNAUTHORIZED_HTML: &str = "<html><body><h1>Unauthorized</h1></body></html>";

/// The scheme prefix of NTLM header values, including the separating space.
const NTLM_PREFIX: &str = "NTLM ";


/// Settings of a [`Policy`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct PolicyConfig {
    /// How long a challenge stays valid.
    pub handshake_timeout: Duration,

    /// Whether [`Policy::authorize`] returns `DOMAIN\user` instead of the bare username.
    pub include_domain: bool,
}
impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(120),
            include_domain: false,
        }
    }
}


/// Why an authentication attempt failed. Handed to the failure logger, never to the client.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Diagnostic {
    pub kind: ErrorKind,
    pub detail: String,
}
impl From<&Error> for Diagnostic {
    fn from(e: &Error) -> Self {
        Self {
            kind: e.kind(),
            detail: e.to_string(),
        }
    }
}
impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}


/// Renders the body of a 401 response.
pub trait UnauthorizedBody: Send + Sync {
    fn render(&self, method: &Method, uri: &Uri) -> String;
}
impl<F> UnauthorizedBody for F
where
    F: Fn(&Method, &Uri) -> String + Send + Sync,
{
    fn render(&self, method: &Method, uri: &Uri) -> String {
        self(method, uri)
    }
}

/// Renders [`STATUS_UNAUTHORIZED_HTML`] for every request.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct DefaultUnauthorizedBody;
impl UnauthorizedBody for DefaultUnauthorizedBody {
    fn render(&self, _method: &Method, _uri: &Uri) -> String {
        STATUS_UNAUTHORIZED_HTML.to_owned()
    }
}


/// Marks a 401 response that carries a Challenge message.
///
/// The handshake is bound to the connection the Negotiate message arrived on, so a server that
/// finds this in the response extensions must keep that connection open for the client's next
/// request.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct HandshakePending;


fn log_failure_with_tracing(diagnostic: &Diagnostic) {
    warn!(kind = %diagnostic.kind, detail = %diagnostic.detail, "NTLM authentication failed");
}


/// An HTTP authentication policy for the NTLM scheme.
///
/// Handshakes are correlated by a key of type `K` that the HTTP server stores in the extensions of
/// every request; by default this is the peer address of the connection. Requests without such a
/// key can neither start nor complete a handshake.
pub struct Policy<P: SecurityProvider, K = SocketAddr> {
    coordinator: HandshakeCoordinator<P, K>,
    include_domain: bool,
    log_failure: Box<dyn Fn(&Diagnostic) + Send + Sync>,
    unauthorized_body: Box<dyn UnauthorizedBody>,
}

impl<P, K> Policy<P, K>
where
    P: SecurityProvider,
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
{
    /// Creates a policy, acquiring the server credentials from `provider`.
    pub fn new(provider: P, config: PolicyConfig) -> Result<Self, Error> {
        Ok(Self {
            coordinator: HandshakeCoordinator::new(provider, config.handshake_timeout)?,
            include_domain: config.include_domain,
            log_failure: Box::new(log_failure_with_tracing),
            unauthorized_body: Box::new(DefaultUnauthorizedBody),
        })
    }

    /// Replaces the function that is told about failed authentication attempts.
    pub fn with_failure_logger<F>(mut self, log_failure: F) -> Self
    where
        F: Fn(&Diagnostic) + Send + Sync + 'static,
    {
        self.log_failure = Box::new(log_failure);
        self
    }

    /// Replaces the renderer of 401 response bodies.
    pub fn with_unauthorized_body<U>(mut self, body: U) -> Self
    where
        U: UnauthorizedBody + 'static,
    {
        self.unauthorized_body = Box::new(body);
        self
    }

    pub fn coordinator(&self) -> &HandshakeCoordinator<P, K> {
        &self.coordinator
    }

    fn fail(&self, error: &Error) {
        (self.log_failure)(&Diagnostic::from(error));
    }

    /// Extracts the NTLM message from the `Authorization` header.
    ///
    /// `None` means the request carries no NTLM credentials at all.
    fn token<B>(request: &Request<B>) -> Option<Result<Vec<u8>, Error>> {
        let value = request.headers().get(AUTHORIZATION)?;
        let encoded = value.to_str().ok()?.strip_prefix(NTLM_PREFIX)?;
        Some(
            BASE64_STANDARD.decode(encoded)
                .map_err(|e| Error::InvalidBase64 { reason: e.to_string() })
        )
    }

    /// Returns the token and its message type. Anything undecodable is `Err`.
    fn message<B>(request: &Request<B>) -> Option<Result<(Vec<u8>, MessageType), Error>> {
        let result = Self::token(request)?
            .and_then(|data| {
                let number = read_message_number(&data)?;
                match MessageType::from_message_number(number) {
                    t @ (MessageType::Negotiate | MessageType::Authenticate) => Ok((data, t)),
                    _ => Err(Error::UnexpectedMessageType { expected: 3, obtained: number }),
                }
            });
        Some(result)
    }

    fn key<'r, B>(&self, request: &'r Request<B>) -> Option<&'r K> {
        let key = request.extensions().get::<K>();
        if key.is_none() {
            self.fail(&Error::NoContext);
        }
        key
    }

    /// Returns the name of the authenticated user, or an empty string if the request is not
    /// authenticated for whatever reason.
    ///
    /// Only an Authenticate message can authenticate a request. A Negotiate message yields an empty
    /// string without being reported as a failure; the handshake is continued by
    /// [`notify_auth_required`](Self::notify_auth_required).
    pub fn authorize<B>(&self, request: &Request<B>) -> String {
        let data = match Self::message(request) {
            Some(Ok((data, MessageType::Authenticate))) => data,
            Some(Err(e)) => {
                self.fail(&e);
                return String::new();
            },
            _ => return String::new(),
        };
        let key = match self.key(request) {
            Some(k) => k,
            None => return String::new(),
        };

        match self.coordinator.authenticate(key, &data) {
            Ok(identity) => {
                if self.include_domain {
                    identity.to_string()
                } else {
                    identity.user
                }
            },
            Err(e) => {
                self.fail(&e);
                String::new()
            },
        }
    }

    /// Issues a challenge if the request carries a Negotiate message.
    ///
    /// Undecodable headers are not reported here; [`authorize`](Self::authorize) has seen the same
    /// request already.
    fn issue_challenge<B>(&self, request: &Request<B>) -> Option<HeaderValue> {
        let data = match Self::message(request)? {
            Ok((data, MessageType::Negotiate)) => data,
            _ => return None,
        };
        let key = self.key(request)?;

        let challenge = match self.coordinator.negotiate(key, &data) {
            Ok(c) => c,
            Err(e) => {
                self.fail(&e);
                return None;
            },
        };
        let value = format!("{}{}", NTLM_PREFIX, BASE64_STANDARD.encode(challenge));
        // base64 is always a valid header value
        HeaderValue::from_str(&value).ok()
    }

    /// Returns the `WWW-Authenticate` value that answers `request`.
    ///
    /// If the request carries a Negotiate message, a handshake is started and the value contains
    /// the Challenge message; otherwise the value is a bare `NTLM`, asking the client to start
    /// over.
    pub fn challenge_header<B>(&self, request: &Request<B>) -> HeaderValue {
        self.issue_challenge(request)
            .unwrap_or_else(|| HeaderValue::from_static("NTLM"))
    }

    /// Builds the 401 response for a request that [`authorize`](Self::authorize) refused.
    ///
    /// If a challenge was issued, the response carries the [`HandshakePending`] extension.
    pub fn notify_auth_required<B>(&self, request: &Request<B>) -> Response<String> {
        let challenge = self.issue_challenge(request);
        let body = self.unauthorized_body.render(request.method(), request.uri());

        let mut response = Response::new(body);
        *response.status_mut() = StatusCode::UNAUTHORIZED;
        response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
        match challenge {
            Some(value) => {
                response.headers_mut().insert(WWW_AUTHENTICATE, value);
                response.extensions_mut().insert(HandshakePending);
            },
            None => {
                response.headers_mut().insert(WWW_AUTHENTICATE, HeaderValue::from_static("NTLM"));
            },
        }
        response
    }
}
