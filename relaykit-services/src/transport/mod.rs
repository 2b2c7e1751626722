//! The transport seam of the request pipeline.
//!
//! A [`Transport`] turns an [`OutboundRequest`] into a cancelable future of a live
//! [`RawReply`]. The reply is owned by the transport's network thread; consumers read it through
//! the trait and learn about its progress through a [`ReplyObserver`]. Events are reported the
//! way a classic network access manager does it: zero or more TLS error batches, then an
//! `errored` event if the exchange failed (including HTTP 4xx/5xx statuses), then `finished`.
use std::{fmt, sync::Arc};

use bytes::Bytes;
use http::{header::HeaderName, HeaderMap, Method, Uri};
use relaykit_core::{config::RestAuth, CancelableFuture};

pub mod auth;
pub mod client;

#[cfg(test)]
pub(crate) mod mock;

pub type RawReplyRef = Arc<dyn RawReply>;

pub trait Transport: Send + Sync {
    fn issue(&self, request: OutboundRequest) -> CancelableFuture<RawReplyRef>;

    /// Credentials requests are currently signed with.
    fn auth(&self) -> RestAuth;
}

pub trait RawReply: Send + Sync {
    fn url(&self) -> Uri;

    /// HTTP status, if the server answered at all.
    fn status_code(&self) -> Option<u16>;

    fn reason_phrase(&self) -> String;

    fn headers(&self) -> HeaderMap;

    fn header(&self, name: HeaderName) -> Option<String> {
        self.headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    }

    /// The complete body. Empty once the reply is released.
    fn read_all(&self) -> Bytes;

    fn error(&self) -> TransportError;

    fn error_string(&self) -> String;

    fn is_running(&self) -> bool;

    /// Stops the exchange. A running reply reports [`TransportError::OPERATION_CANCELED`] and
    /// finishes.
    fn abort(&self);

    /// Frees the buffered response. Observers are dropped as well.
    fn release(&self);

    /// Registers an observer. Observers registered after the reply finished get the terminal
    /// events replayed immediately.
    fn observe(&self, observer: Arc<dyn ReplyObserver>);
}

pub trait ReplyObserver: Send + Sync {
    fn finished(&self, reply: &dyn RawReply);

    fn errored(&self, reply: &dyn RawReply, error: TransportError);

    fn tls_errors(&self, reply: &dyn RawReply, errors: &[TlsError]);
}

/// One request as handed to a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub vendor: Option<String>,
}

impl OutboundRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        OutboundRequest {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            vendor: None,
        }
    }

    #[must_use]
    pub fn with_query<K, V>(mut self, query: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.query
            .extend(query.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    #[must_use]
    pub fn with_vendor(mut self, vendor: Option<String>) -> Self {
        self.vendor = vendor.filter(|vendor| !vendor.is_empty());
        self
    }

    /// `application/x-www-form-urlencoded` query, `None` when there are no parameters.
    pub fn query_string(&self) -> Option<String> {
        if self.query.is_empty() {
            return None;
        }
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        serializer.extend_pairs(self.query.iter());
        Some(serializer.finish())
    }

    /// Path plus query, always starting with `/`.
    pub fn path_and_query(&self) -> String {
        let mut target = String::with_capacity(self.path.len() + 1);
        if !self.path.starts_with('/') {
            target.push('/');
        }
        target.push_str(&self.path);
        if let Some(query) = self.query_string() {
            target.push('?');
            target.push_str(&query);
        }
        target
    }

    /// Media type sent with the request.
    ///
    /// The body format is sniffed (JSON or XML); a vendor tag turns the type into
    /// `application/vnd.<vendor>[+json|+xml]`.
    pub fn content_type(&self) -> String {
        let format = self.body.as_deref().and_then(BodyFormat::sniff);
        match (&self.vendor, format) {
            (None, None) => "text/plain".to_string(),
            (None, Some(BodyFormat::Json)) => "application/json".to_string(),
            (None, Some(BodyFormat::Xml)) => "text/xml".to_string(),
            (Some(vendor), None) => format!("application/vnd.{vendor}"),
            (Some(vendor), Some(BodyFormat::Json)) => format!("application/vnd.{vendor}+json"),
            (Some(vendor), Some(BodyFormat::Xml)) => format!("application/vnd.{vendor}+xml"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFormat {
    Json,
    Xml,
}

impl BodyFormat {
    fn sniff(body: &[u8]) -> Option<BodyFormat> {
        match body.iter().find(|b| !b.is_ascii_whitespace())? {
            b'{' | b'[' => Some(BodyFormat::Json),
            b'<' => Some(BodyFormat::Xml),
            _ => None,
        }
    }
}

/// Transport level error code.
///
/// Codes are grouped by hundreds: below 100 network, 1xx proxy, 2xx content (mostly HTTP 4xx
/// statuses), 3xx protocol, 4xx server (HTTP 5xx statuses).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct TransportError(pub i32);

impl TransportError {
    pub const NO_ERROR: TransportError = TransportError(0);

    pub const CONNECTION_REFUSED: TransportError = TransportError(1);
    pub const REMOTE_HOST_CLOSED: TransportError = TransportError(2);
    pub const HOST_NOT_FOUND: TransportError = TransportError(3);
    pub const TIMEOUT: TransportError = TransportError(4);
    pub const OPERATION_CANCELED: TransportError = TransportError(5);
    pub const SSL_HANDSHAKE_FAILED: TransportError = TransportError(6);
    pub const TEMPORARY_NETWORK_FAILURE: TransportError = TransportError(7);
    pub const UNKNOWN_NETWORK: TransportError = TransportError(99);

    pub const PROXY_CONNECTION_REFUSED: TransportError = TransportError(101);
    pub const PROXY_CONNECTION_CLOSED: TransportError = TransportError(102);
    pub const PROXY_NOT_FOUND: TransportError = TransportError(103);
    pub const PROXY_TIMEOUT: TransportError = TransportError(104);
    pub const PROXY_AUTHENTICATION_REQUIRED: TransportError = TransportError(105);
    pub const UNKNOWN_PROXY: TransportError = TransportError(199);

    pub const CONTENT_ACCESS_DENIED: TransportError = TransportError(201);
    pub const CONTENT_OPERATION_NOT_PERMITTED: TransportError = TransportError(202);
    pub const CONTENT_NOT_FOUND: TransportError = TransportError(203);
    pub const AUTHENTICATION_REQUIRED: TransportError = TransportError(204);
    pub const CONTENT_RESEND: TransportError = TransportError(205);
    pub const CONTENT_CONFLICT: TransportError = TransportError(206);
    pub const CONTENT_GONE: TransportError = TransportError(207);
    pub const UNKNOWN_CONTENT: TransportError = TransportError(299);

    pub const PROTOCOL_UNKNOWN: TransportError = TransportError(301);
    pub const PROTOCOL_INVALID_OPERATION: TransportError = TransportError(302);
    pub const PROTOCOL_FAILURE: TransportError = TransportError(399);

    pub const INTERNAL_SERVER_ERROR: TransportError = TransportError(401);
    pub const OPERATION_NOT_IMPLEMENTED: TransportError = TransportError(402);
    pub const SERVICE_UNAVAILABLE: TransportError = TransportError(403);
    pub const UNKNOWN_SERVER: TransportError = TransportError(499);

    pub const fn code(self) -> i32 {
        self.0
    }

    pub const fn is_error(self) -> bool {
        self.0 != 0
    }

    /// Error reported alongside an HTTP status, `NO_ERROR` below 400.
    pub const fn from_http_status(status: u16) -> TransportError {
        match status {
            0..=399 => Self::NO_ERROR,
            401 => Self::AUTHENTICATION_REQUIRED,
            403 => Self::CONTENT_ACCESS_DENIED,
            404 => Self::CONTENT_NOT_FOUND,
            405 => Self::CONTENT_OPERATION_NOT_PERMITTED,
            407 => Self::PROXY_AUTHENTICATION_REQUIRED,
            409 => Self::CONTENT_CONFLICT,
            410 => Self::CONTENT_GONE,
            418 => Self::PROTOCOL_INVALID_OPERATION,
            500 => Self::INTERNAL_SERVER_ERROR,
            501 => Self::OPERATION_NOT_IMPLEMENTED,
            503 => Self::SERVICE_UNAVAILABLE,
            501.. => Self::UNKNOWN_SERVER,
            _ => Self::UNKNOWN_CONTENT,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::NO_ERROR => "No error",
            Self::CONNECTION_REFUSED => "Connection refused",
            Self::REMOTE_HOST_CLOSED => "Remote host closed the connection",
            Self::HOST_NOT_FOUND => "Host not found",
            Self::TIMEOUT => "Operation timed out",
            Self::OPERATION_CANCELED => "Operation canceled",
            Self::SSL_HANDSHAKE_FAILED => "SSL handshake failed",
            Self::TEMPORARY_NETWORK_FAILURE => "Temporary network failure",
            Self::CONTENT_ACCESS_DENIED => "Access denied",
            Self::CONTENT_OPERATION_NOT_PERMITTED => "Operation not permitted",
            Self::CONTENT_NOT_FOUND => "Not found",
            Self::AUTHENTICATION_REQUIRED => "Authentication required",
            Self::CONTENT_CONFLICT => "Conflict",
            Self::CONTENT_GONE => "Gone",
            Self::INTERNAL_SERVER_ERROR => "Internal server error",
            Self::OPERATION_NOT_IMPLEMENTED => "Operation not implemented",
            Self::SERVICE_UNAVAILABLE => "Service unavailable",
            TransportError(101..=199) => "Proxy error",
            TransportError(200..=299) => "Content error",
            TransportError(300..=399) => "Protocol error",
            TransportError(400..=499) => "Server error",
            _ => "Unknown network error",
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.0)
    }
}

/// Certificate validation problems, numbered like the TLS stacks of classic client
/// frameworks report them.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum TlsErrorKind {
    UnspecifiedError = -1,
    NoError = 0,
    UnableToGetIssuerCertificate = 1,
    UnableToDecryptCertificateSignature = 2,
    UnableToDecodeIssuerPublicKey = 3,
    CertificateSignatureFailed = 4,
    CertificateNotYetValid = 5,
    CertificateExpired = 6,
    InvalidNotBeforeField = 7,
    InvalidNotAfterField = 8,
    SelfSignedCertificate = 9,
    SelfSignedCertificateInChain = 10,
    UnableToGetLocalIssuerCertificate = 11,
    UnableToVerifyFirstCertificate = 12,
    CertificateRevoked = 13,
    InvalidCaCertificate = 14,
    PathLengthExceeded = 15,
    InvalidPurpose = 16,
    CertificateUntrusted = 17,
    CertificateRejected = 18,
    SubjectIssuerMismatch = 19,
    AuthorityIssuerSerialNumberMismatch = 20,
    NoPeerCertificate = 21,
    HostNameMismatch = 22,
    NoSslSupport = 23,
    CertificateBlacklisted = 24,
}

impl TlsErrorKind {
    pub const fn code(self) -> i32 {
        self as i32
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsError {
    pub kind: TlsErrorKind,
    pub message: String,
}

impl TlsError {
    pub fn new(kind: TlsErrorKind, message: impl Into<String>) -> Self {
        TlsError {
            kind,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind != TlsErrorKind::NoError
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_negotiation() {
        let plain = OutboundRequest::new(Method::GET, "/");
        assert_eq!("text/plain", plain.content_type());

        let vendor = Some("opensoft".to_string());
        let bare = OutboundRequest::new(Method::DELETE, "/").with_vendor(vendor.clone());
        assert_eq!("application/vnd.opensoft", bare.content_type());

        let json = OutboundRequest::new(Method::POST, "/").with_body(&b" {\"a\": 1}"[..]);
        assert_eq!("application/json", json.content_type());
        assert_eq!(
            "application/vnd.opensoft+json",
            json.with_vendor(vendor.clone()).content_type()
        );

        let xml = OutboundRequest::new(Method::PUT, "/").with_body(&b"<a/>"[..]);
        assert_eq!("text/xml", xml.content_type());
        assert_eq!(
            "application/vnd.opensoft+xml",
            xml.with_vendor(vendor).content_type()
        );

        let empty_vendor = OutboundRequest::new(Method::GET, "/").with_vendor(Some(String::new()));
        assert_eq!("text/plain", empty_vendor.content_type());
    }

    #[test]
    fn test_path_and_query() {
        let request = OutboundRequest::new(Method::GET, "orders")
            .with_query([("status", "open"), ("q", "a b&c")]);
        assert_eq!("/orders?status=open&q=a+b%26c", request.path_and_query());
        assert_eq!("/", OutboundRequest::new(Method::GET, "").path_and_query());
    }

    #[test]
    fn test_transport_error_from_http_status() {
        assert_eq!(TransportError::NO_ERROR, TransportError::from_http_status(204));
        assert_eq!(TransportError::CONTENT_NOT_FOUND, TransportError::from_http_status(404));
        assert_eq!(TransportError::UNKNOWN_CONTENT, TransportError::from_http_status(422));
        assert_eq!(TransportError::INTERNAL_SERVER_ERROR, TransportError::from_http_status(500));
        assert_eq!(TransportError::UNKNOWN_SERVER, TransportError::from_http_status(502));
        assert_eq!(2, TransportError::from_http_status(404).code() / 100);
        assert_eq!(4, TransportError::from_http_status(503).code() / 100);
    }
}
