//! In-memory transport and reply driven by the test itself.
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use http::{header::HeaderName, HeaderMap, HeaderValue, Uri};
use parking_lot::Mutex;
use relaykit_core::{config::RestAuth, CancelableFuture, Failure, Promise};

use super::{
    OutboundRequest, RawReply, RawReplyRef, ReplyObserver, TlsError, Transport, TransportError,
};

struct ScriptState {
    status: Option<u16>,
    reason: String,
    headers: HeaderMap,
    body: Bytes,
    error: TransportError,
    error_string: String,
    running: bool,
    observers: Vec<Arc<dyn ReplyObserver>>,
}

pub(crate) struct ScriptedReply {
    url: Uri,
    state: Mutex<ScriptState>,
    aborts: AtomicUsize,
    releases: AtomicUsize,
}

impl ScriptedReply {
    pub fn new(url: &'static str) -> Self {
        ScriptedReply {
            url: Uri::from_static(url),
            state: Mutex::new(ScriptState {
                status: None,
                reason: String::new(),
                headers: HeaderMap::new(),
                body: Bytes::new(),
                error: TransportError::NO_ERROR,
                error_string: String::new(),
                running: true,
                observers: Vec::new(),
            }),
            aborts: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        }
    }

    /// Sets the HTTP status and the transport error a network stack reports with it.
    pub fn with_status(self, status: u16, reason: &str) -> Self {
        {
            let mut state = self.state.lock();
            state.status = Some(status);
            state.reason = reason.to_string();
            state.error = TransportError::from_http_status(status);
            if state.error.is_error() {
                state.error_string = format!("server replied: {reason}");
            }
        }
        self
    }

    pub fn with_header(self, name: HeaderName, value: &'static str) -> Self {
        self.state
            .lock()
            .headers
            .insert(name, HeaderValue::from_static(value));
        self
    }

    pub fn with_body(self, body: &'static str) -> Self {
        self.state.lock().body = Bytes::from_static(body.as_bytes());
        self
    }

    pub fn with_error(self, error: TransportError, error_string: &str) -> Self {
        {
            let mut state = self.state.lock();
            state.error = error;
            state.error_string = error_string.to_string();
        }
        self
    }

    /// Finishes the exchange: `errored` (if there is an error), then `finished`.
    pub fn complete(&self) {
        let (observers, error) = {
            let mut state = self.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
            (state.observers.clone(), state.error)
        };
        for observer in &observers {
            if error.is_error() {
                observer.errored(self, error);
            }
        }
        for observer in &observers {
            observer.finished(self);
        }
    }

    pub fn emit_tls_errors(&self, errors: &[TlsError]) {
        let observers = self.state.lock().observers.clone();
        for observer in &observers {
            observer.tls_errors(self, errors);
        }
    }

    pub fn aborts(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl RawReply for ScriptedReply {
    fn url(&self) -> Uri {
        self.url.clone()
    }

    fn status_code(&self) -> Option<u16> {
        self.state.lock().status
    }

    fn reason_phrase(&self) -> String {
        self.state.lock().reason.clone()
    }

    fn headers(&self) -> HeaderMap {
        self.state.lock().headers.clone()
    }

    fn read_all(&self) -> Bytes {
        self.state.lock().body.clone()
    }

    fn error(&self) -> TransportError {
        self.state.lock().error
    }

    fn error_string(&self) -> String {
        self.state.lock().error_string.clone()
    }

    fn is_running(&self) -> bool {
        self.state.lock().running
    }

    fn abort(&self) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.state.lock();
            if !state.running {
                return;
            }
            state.status = None;
            state.error = TransportError::OPERATION_CANCELED;
            state.error_string = "Operation canceled".to_string();
        }
        self.complete();
    }

    fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.body = Bytes::new();
        state.observers.clear();
    }

    fn observe(&self, observer: Arc<dyn ReplyObserver>) {
        self.state.lock().observers.push(observer);
    }
}

/// Records issued requests and hands out raw futures the test fills later.
#[derive(Default)]
pub(crate) struct MockTransport {
    issued: Mutex<Vec<OutboundRequest>>,
    pending: Mutex<VecDeque<Promise<RawReplyRef>>>,
    auth: Mutex<RestAuth>,
}

impl MockTransport {
    pub fn set_auth(&self, auth: RestAuth) {
        *self.auth.lock() = auth;
    }

    pub fn issued(&self) -> Vec<OutboundRequest> {
        self.issued.lock().clone()
    }

    /// Hands `reply` to the oldest outstanding request. Like a real transport, a reply that
    /// arrives for a cancelled request is aborted and released on the spot.
    pub fn deliver(&self, reply: Arc<ScriptedReply>) {
        let Some(raw) = self.pending.lock().pop_front() else {
            panic!("no outstanding request");
        };
        if !raw.success(reply.clone()) {
            reply.abort();
            reply.release();
        }
    }

    pub fn fail(&self, failure: Failure) {
        let Some(raw) = self.pending.lock().pop_front() else {
            panic!("no outstanding request");
        };
        raw.failure(failure);
    }
}

impl Transport for MockTransport {
    fn issue(&self, request: OutboundRequest) -> CancelableFuture<RawReplyRef> {
        self.issued.lock().push(request);
        let raw = Promise::new();
        self.pending.lock().push_back(raw.clone());
        CancelableFuture::new(raw)
    }

    fn auth(&self) -> RestAuth {
        self.auth.lock().clone()
    }
}
