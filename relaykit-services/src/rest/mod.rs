//! Request pipeline: one outbound call in, one [`CancelableFuture<RestApiReply>`] out.
//!
//! [`RestApi`] issues the call through a [`Transport`], wires the reply events to a
//! [`Promise`], classifies the outcome and tracks the future in a [`ReplyRegistry`] until it
//! completes.
//!
//! # Classification
//!
//! Exactly one of three reply events classifies:
//!
//! - TLS errors: the first real error fails the call with [`ErrorKind::SslError`] and code
//!   `SSL_ERROR_OFFSET + tls code`.
//! - Transport error: handled here only when its code is neither in the 2xx (content) nor the
//!   4xx (server) band; those carry an HTTP status and are classified on completion instead.
//!   See [`process_errored_reply`].
//! - Completion: an allowed HTTP status succeeds, anything else becomes a
//!   [`ErrorKind::ServerError`] with a message taken from the body. See
//!   [`process_successful_reply`].
//!
//! The raw reply is released exactly once, whichever event got there first. Services with their
//! own error body conventions implement [`ReplyProcessor`] and reuse the free functions for the
//! parts they do not change.
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use bytes::Bytes;
use http::{header, header::HeaderName, HeaderMap, Method};
use relaykit_core::{CancelableFuture, ErrorKind, Failure, FailureHints, Promise};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    tasks::TaskPool,
    transport::{
        OutboundRequest, RawReply, RawReplyRef, ReplyObserver, TlsError, Transport,
        TransportError,
    },
};

pub mod registry;

use registry::ReplyRegistry;

pub const NETWORK_ERROR_OFFSET: i64 = 1000;
pub const SSL_ERROR_OFFSET: i64 = 1500;

/// Statuses that count as success. Other 2xx codes are classified like errors.
pub const ALLOWED_HTTP_STATUSES: [u16; 7] = [200, 201, 202, 203, 204, 205, 206];

/// Snapshot of a successful reply, detached from the transport.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RestApiReply {
    pub body: Bytes,
    pub headers: HeaderMap,
    pub status_text: String,
    pub status_code: u16,
}

impl RestApiReply {
    pub fn from_raw(reply: &dyn RawReply) -> Self {
        RestApiReply {
            body: reply.read_all(),
            headers: reply.headers(),
            status_text: reply.reason_phrase(),
            status_code: reply.status_code().unwrap_or_default(),
        }
    }

    pub fn header(&self, name: HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// Decodes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, Failure> {
        serde_json::from_slice(&self.body).map_err(|e| {
            Failure::of_kind(ErrorKind::InvalidReply, format!("Invalid reply: {e}"))
                .with_detail(i64::from(self.status_code))
        })
    }
}

/// Classification hooks of the pipeline.
///
/// Both methods run on the thread that reports the reply event. The default implementations
/// are [`process_successful_reply`] and [`process_errored_reply`].
pub trait ReplyProcessor: Send + Sync + 'static {
    fn process_successful_reply(
        &self,
        reply: &dyn RawReply,
        promise: &Promise<RestApiReply>,
        tasks: &TaskPool,
    ) {
        process_successful_reply(reply, promise, tasks);
    }

    fn process_errored_reply(&self, reply: &dyn RawReply, promise: &Promise<RestApiReply>) {
        process_errored_reply(reply, promise);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultReplyProcessor;

impl ReplyProcessor for DefaultReplyProcessor {}

/// Completion path.
///
/// The reply is read here, on the reporting thread; the promise is fulfilled on `tasks`.
pub fn process_successful_reply(
    reply: &dyn RawReply,
    promise: &Promise<RestApiReply>,
    tasks: &TaskPool,
) {
    let status = reply.status_code();
    if status.is_some_and(|status| ALLOWED_HTTP_STATUSES.contains(&status)) {
        let data = RestApiReply::from_raw(reply);
        let promise = promise.clone();
        tasks.run(move || {
            promise.success(data);
        });
        return;
    }

    let code = status.map(i64::from).unwrap_or_default();
    let message = error_message(reply);
    debug!("Network error occurred {}: {code} {message}", reply.url());
    let mut hints = FailureHints::USER_FRIENDLY;
    if code > 0 {
        hints |= FailureHints::DATA_IS_HTTP_CODE;
    }
    promise.failure(
        Failure::of_kind(ErrorKind::ServerError, message)
            .with_hints(hints)
            .with_detail(code),
    );
}

/// Transport error path.
pub fn process_errored_reply(reply: &dyn RawReply, promise: &Promise<RestApiReply>) {
    let http_status = reply
        .status_code()
        .map(i64::from)
        .filter(|status| *status > 0);
    let error = reply.error();
    let code = http_status.unwrap_or(NETWORK_ERROR_OFFSET + i64::from(error.code()));
    let mut hints = match http_status {
        Some(_) => FailureHints::DATA_IS_HTTP_CODE,
        None => FailureHints::NO_HINT,
    };
    let url = reply.url();
    let host = url.host().unwrap_or_default();
    debug!("Error occurred for {url}: {code} {}", reply.error_string());

    let (kind, message) = match error {
        TransportError::HOST_NOT_FOUND => {
            hints |= FailureHints::USER_FRIENDLY;
            (
                ErrorKind::ServiceUnavailable,
                format!("Host {host} not found. Try again later"),
            )
        }
        TransportError::CONNECTION_REFUSED
        | TransportError::REMOTE_HOST_CLOSED
        | TransportError::TIMEOUT
        | TransportError::OPERATION_CANCELED => {
            hints |= FailureHints::USER_FRIENDLY;
            (
                ErrorKind::ServiceUnavailable,
                format!("Host {host} is unavailable. Try again later"),
            )
        }
        _ => (ErrorKind::ServerError, reply.error_string()),
    };
    promise.failure(
        Failure::of_kind(kind, message)
            .with_hints(hints)
            .with_detail(code),
    );
}

/// Whether a transport error is classified by the error path rather than on completion.
pub fn should_be_handled_by_error(error: TransportError) -> bool {
    if !error.is_error() {
        return false;
    }
    let hundreds = error.code() / 100;
    hundreds != 2 && hundreds != 4
}

fn error_message(reply: &dyn RawReply) -> String {
    let content_type = reply.header(header::CONTENT_TYPE).unwrap_or_default();
    let types: Vec<&str> = content_type
        .split(';')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect();

    let mut message = String::new();
    if types.contains(&"text/plain") {
        message = String::from_utf8_lossy(&reply.read_all()).trim().to_string();
    } else if types.contains(&"application/json") {
        if let Ok(Value::Object(object)) = serde_json::from_slice::<Value>(&reply.read_all()) {
            message = object
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
        }
    }
    if message.is_empty() {
        message = reply.reason_phrase().trim().to_string();
    }
    message
}

/// Per-call state shared by the reply events.
struct ReplyWatcher {
    promise: Promise<RestApiReply>,
    processor: Arc<dyn ReplyProcessor>,
    tasks: Arc<TaskPool>,
    settled: AtomicBool,
    released: AtomicBool,
}

impl ReplyWatcher {
    fn new(
        promise: Promise<RestApiReply>,
        processor: Arc<dyn ReplyProcessor>,
        tasks: Arc<TaskPool>,
    ) -> Self {
        ReplyWatcher {
            promise,
            processor,
            tasks,
            settled: AtomicBool::new(false),
            released: AtomicBool::new(false),
        }
    }

    fn attach(self: &Arc<Self>, reply: &RawReplyRef) {
        if self.promise.filled() {
            debug!("reply for {} arrived after the call completed", reply.url());
            reply.abort();
            self.release(reply.as_ref());
            return;
        }

        let running = reply.clone();
        self.promise.future().on_failure(move |_| {
            if running.is_running() {
                running.abort();
            }
        });
        reply.observe(self.clone());
    }

    /// Whether the caller gets to classify the reply.
    fn claim(&self) -> bool {
        !self.promise.filled() && !self.settled.swap(true, Ordering::AcqRel)
    }

    fn release(&self, reply: &dyn RawReply) {
        if !self.released.swap(true, Ordering::AcqRel) {
            reply.release();
        }
    }
}

impl ReplyObserver for ReplyWatcher {
    fn finished(&self, reply: &dyn RawReply) {
        if !self.promise.filled() && should_be_handled_by_error(reply.error()) {
            return;
        }
        if self.claim() {
            self.processor
                .process_successful_reply(reply, &self.promise, &self.tasks);
        }
        self.release(reply);
    }

    fn errored(&self, reply: &dyn RawReply, error: TransportError) {
        if !self.promise.filled() && !should_be_handled_by_error(error) {
            return;
        }
        if self.claim() {
            self.processor.process_errored_reply(reply, &self.promise);
        }
        self.release(reply);
    }

    fn tls_errors(&self, reply: &dyn RawReply, errors: &[TlsError]) {
        for error in errors.iter().filter(|error| error.is_error()) {
            let code = SSL_ERROR_OFFSET + i64::from(error.kind.code());
            warn!(
                "SSL error occurred {}: {code} {}",
                reply.url(),
                error.message
            );
            if !self.claim() {
                continue;
            }
            self.promise.failure(
                Failure::of_kind(ErrorKind::SslError, error.message.clone())
                    .with_hints(FailureHints::USER_FRIENDLY)
                    .with_detail(code),
            );
        }
        // A batch with nothing to report leaves classification to completion.
        if self.promise.filled() {
            self.release(reply);
        }
    }
}

/// Base of a REST service client.
pub struct RestApi {
    transport: Arc<dyn Transport>,
    tasks: Arc<TaskPool>,
    processor: Arc<dyn ReplyProcessor>,
    vendor: Option<String>,
    replies: ReplyRegistry<RestApiReply>,
}

impl RestApi {
    pub fn new(transport: Arc<dyn Transport>, tasks: Arc<TaskPool>) -> Self {
        RestApi {
            transport,
            tasks,
            processor: Arc::new(DefaultReplyProcessor),
            vendor: None,
            replies: ReplyRegistry::new(),
        }
    }

    #[must_use]
    pub fn with_processor(mut self, processor: Arc<dyn ReplyProcessor>) -> Self {
        self.processor = processor;
        self
    }

    /// Media-type vendor tag sent with every request.
    #[must_use]
    pub fn with_vendor(mut self, vendor: Option<String>) -> Self {
        self.vendor = vendor.filter(|vendor| !vendor.is_empty());
        self
    }

    pub fn vendor(&self) -> Option<&str> {
        self.vendor.as_deref()
    }

    pub fn get(&self, path: &str, query: &[(&str, &str)]) -> CancelableFuture<RestApiReply> {
        self.send(OutboundRequest::new(Method::GET, path).with_query(query.iter().copied()))
    }

    pub fn post(
        &self,
        path: &str,
        query: &[(&str, &str)],
        body: impl Into<Bytes>,
    ) -> CancelableFuture<RestApiReply> {
        self.send(
            OutboundRequest::new(Method::POST, path)
                .with_query(query.iter().copied())
                .with_body(body),
        )
    }

    pub fn put(
        &self,
        path: &str,
        query: &[(&str, &str)],
        body: impl Into<Bytes>,
    ) -> CancelableFuture<RestApiReply> {
        self.send(
            OutboundRequest::new(Method::PUT, path)
                .with_query(query.iter().copied())
                .with_body(body),
        )
    }

    pub fn patch(
        &self,
        path: &str,
        query: &[(&str, &str)],
        body: impl Into<Bytes>,
    ) -> CancelableFuture<RestApiReply> {
        self.send(
            OutboundRequest::new(Method::PATCH, path)
                .with_query(query.iter().copied())
                .with_body(body),
        )
    }

    pub fn delete(&self, path: &str, query: &[(&str, &str)]) -> CancelableFuture<RestApiReply> {
        self.send(OutboundRequest::new(Method::DELETE, path).with_query(query.iter().copied()))
    }

    /// Issues `request`, tagged with this API's vendor unless it carries its own.
    pub fn send(&self, mut request: OutboundRequest) -> CancelableFuture<RestApiReply> {
        if request.vendor.is_none() {
            request.vendor = self.vendor.clone();
        }
        self.configure_reply(self.transport.issue(request))
    }

    /// Turns a raw transport future into a classified, tracked call.
    pub fn configure_reply(
        &self,
        raw: CancelableFuture<RawReplyRef>,
    ) -> CancelableFuture<RestApiReply> {
        let promise = Promise::new();
        let upstream = raw.clone();
        promise.future().on_failure(move |_| upstream.cancel());

        let watcher = Arc::new(ReplyWatcher::new(
            promise.clone(),
            self.processor.clone(),
            self.tasks.clone(),
        ));
        raw.on_result(move |result| match result {
            Ok(reply) => watcher.attach(reply),
            Err(failure) => {
                watcher.promise.failure(failure.clone());
            }
        });

        let result = CancelableFuture::new(promise);
        self.replies.remember(&result);
        result
    }

    /// Cancels every call still in flight. Returns how many were cancelled.
    pub fn abort_all_replies(&self) -> usize {
        self.replies.abort_all()
    }

    pub fn in_flight(&self) -> usize {
        self.replies.len()
    }

    /// Whether the transport lacks the credentials its auth type needs. Callers typically
    /// [`abort_all_replies`](RestApi::abort_all_replies) once this turns true.
    pub fn is_logged_out(&self) -> bool {
        self.transport.auth().is_logged_out()
    }
}
