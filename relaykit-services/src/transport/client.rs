//! HTTP transport running on a dedicated monoio network thread.
//!
//! [`HttpTransport::issue`] builds the request on the calling thread and ships it to the network
//! thread over a channel. There the live [`HttpReply`] is created and handed out through the raw
//! future *before* the exchange starts, so whoever consumes the future can attach observers
//! before any event fires. Each exchange runs as its own task sharing one pooled
//! `HttpConnector`.
//!
//! Only plain HTTP is spoken; `https` targets are rejected as invalid URLs.
use std::{
    io,
    net::{SocketAddr, ToSocketAddrs},
    rc::Rc,
    sync::{Arc, Weak},
    thread::JoinHandle,
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures_channel::{
    mpsc::{unbounded, UnboundedReceiver, UnboundedSender},
    oneshot::{self, Receiver as OReceiver, Sender as OSender},
};
use http::{header, uri::Scheme, HeaderMap, Request, StatusCode, Uri};
use monoio::net::TcpStream;
use monoio_http::common::body::{Body, FixedBody, HttpBody};
use monoio_transports::{
    connectors::{Connector, TcpConnector},
    http::{HttpConnection, HttpConnector},
};
use parking_lot::{Mutex, RwLock};
use relaykit_core::{
    config::{ClientConfig, RestAuth, RuntimeConfig},
    runtime::RuntimeWrapper,
    CancelableFuture, ErrorKind, Failure, Promise,
};
use tracing::{debug, error, info, warn};

use super::{
    auth::auth_headers, OutboundRequest, RawReply, RawReplyRef, ReplyObserver, Transport,
    TransportError,
};

type PooledHttpConnector = HttpConnector<TcpConnector, SocketAddr, TcpStream>;

const DEFAULT_HTTP_PORT: u16 = 80;

struct Job {
    request: Request<Option<Bytes>>,
    raw: Promise<RawReplyRef>,
}

struct NetworkWorker {
    handle: JoinHandle<()>,
    stop: OSender<()>,
}

pub struct HttpTransport {
    config: ClientConfig,
    auth: RwLock<RestAuth>,
    jobs: UnboundedSender<Job>,
    worker: Mutex<Option<NetworkWorker>>,
}

impl HttpTransport {
    /// Starts the network thread.
    pub fn new(config: ClientConfig, runtime: &RuntimeConfig) -> io::Result<Self> {
        let (jobs, jobs_rx) = unbounded();
        let (stop, stop_rx) = oneshot::channel::<()>();
        let runtime_config = runtime.clone();
        let read_timeout = config.read_timeout();
        let connect_timeout = config.connect_timeout();

        let handle = std::thread::Builder::new()
            .name("relaykit-network".to_string())
            .spawn(move || {
                let mut runtime = match RuntimeWrapper::new(&runtime_config) {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!("network thread failed to build runtime: {e}");
                        return;
                    }
                };
                runtime.block_on(serve(jobs_rx, stop_rx, read_timeout, connect_timeout));
            })?;

        Ok(HttpTransport {
            auth: RwLock::new(config.auth.clone()),
            config,
            jobs,
            worker: Mutex::new(Some(NetworkWorker { handle, stop })),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Replaces the credentials, e.g. on login or logout. Applies to requests issued afterwards.
    pub fn set_auth(&self, auth: RestAuth) {
        *self.auth.write() = auth;
    }

    /// Stops the network thread. Requests still queued fail with `ServiceUnavailable`, replies
    /// still running finish as canceled.
    pub fn shutdown(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        let _ = worker.stop.send(());
        if worker.handle.join().is_err() {
            warn!("network thread panicked");
        }
        info!("http transport stopped");
    }

    fn build_request(&self, request: OutboundRequest) -> Result<Request<Option<Bytes>>, Failure> {
        let config = &self.config;
        let target = format!(
            "{}://{}:{}{}",
            config.scheme,
            config.host,
            config.port,
            request.path_and_query()
        );
        let uri: Uri = target.parse().map_err(|e| {
            Failure::of_kind(ErrorKind::InvalidUrl, format!("Invalid url {target}: {e}"))
        })?;
        if uri.scheme() != Some(&Scheme::HTTP) {
            return Err(Failure::of_kind(
                ErrorKind::InvalidUrl,
                format!("Unsupported scheme {}", config.scheme),
            ));
        }

        let host = match config.port {
            DEFAULT_HTTP_PORT => config.host.clone(),
            port => format!("{}:{port}", config.host),
        };
        let mut builder = Request::builder()
            .method(request.method.clone())
            .uri(uri)
            .header(header::HOST, host)
            .header(header::USER_AGENT, &config.client_name)
            .header(header::CONTENT_TYPE, request.content_type());
        if let Some(body) = &request.body {
            builder = builder.header(header::CONTENT_LENGTH, body.len());
        }
        for (name, value) in auth_headers(&self.auth.read()) {
            builder = builder.header(name, value);
        }
        builder
            .body(request.body)
            .map_err(|e| Failure::of_kind(ErrorKind::InvalidUrl, e.to_string()))
    }
}

impl Transport for HttpTransport {
    fn issue(&self, request: OutboundRequest) -> CancelableFuture<RawReplyRef> {
        let raw = Promise::new();
        let future = CancelableFuture::new(raw.clone());
        match self.build_request(request) {
            Ok(request) => {
                debug!("issuing {} {}", request.method(), request.uri());
                let job = Job {
                    request,
                    raw: raw.clone(),
                };
                if let Err(e) = self.jobs.unbounded_send(job) {
                    warn!("network thread is not accepting requests: {e}");
                    raw.failure(Failure::of_kind(
                        ErrorKind::ServiceUnavailable,
                        "Network thread is not running",
                    ));
                }
            }
            Err(failure) => {
                debug!("request rejected: {failure}");
                raw.failure(failure);
            }
        }
        future
    }

    fn auth(&self) -> RestAuth {
        self.auth.read().clone()
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn serve(
    mut jobs: UnboundedReceiver<Job>,
    mut stop: OReceiver<()>,
    read_timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
) {
    let mut connector = PooledHttpConnector::default();
    connector.set_read_timeout(read_timeout);
    let connector = Rc::new(connector);
    let mut live: Vec<Weak<HttpReply>> = Vec::new();
    info!("network thread started");

    loop {
        monoio::select! {
            _ = &mut stop => {
                info!("network thread is notified to stop");
                break;
            }
            job = jobs.next() => match job {
                Some(job) => dispatch(job, &connector, connect_timeout, &mut live),
                None => {
                    info!("all transport handles dropped, network thread exits");
                    break;
                }
            }
        }
    }

    jobs.close();
    let mut dropped = 0;
    while let Ok(Some(job)) = jobs.try_next() {
        dropped += 1;
        job.raw.failure(Failure::of_kind(
            ErrorKind::ServiceUnavailable,
            "Network thread is not running",
        ));
    }
    let running: Vec<Arc<HttpReply>> = live
        .iter()
        .filter_map(Weak::upgrade)
        .filter(|reply| reply.is_running())
        .collect();
    debug!(
        "network thread stopping: {dropped} queued requests failed, {} replies aborted",
        running.len()
    );
    for reply in running {
        reply.complete(Err(ExchangeError::Aborted));
    }
}

fn dispatch(
    job: Job,
    connector: &Rc<PooledHttpConnector>,
    connect_timeout: Option<Duration>,
    live: &mut Vec<Weak<HttpReply>>,
) {
    let (abort, abort_rx) = oneshot::channel::<()>();
    let reply = Arc::new(HttpReply::new(job.request.uri().clone(), abort));
    if !job.raw.success(reply.clone()) {
        debug!("request to {} cancelled before dispatch", reply.url);
        return;
    }
    live.retain(|reply| reply.upgrade().is_some_and(|reply| reply.is_running()));
    live.push(Arc::downgrade(&reply));
    let request = job.request.map(HttpBody::fixed_body);
    monoio::spawn(execute(
        connector.clone(),
        request,
        reply,
        abort_rx,
        connect_timeout,
    ));
}

async fn execute(
    connector: Rc<PooledHttpConnector>,
    request: Request<HttpBody>,
    reply: Arc<HttpReply>,
    abort: OReceiver<()>,
    connect_timeout: Option<Duration>,
) {
    let outcome = monoio::select! {
        _ = abort => Err(ExchangeError::Aborted),
        outcome = exchange(&connector, request, connect_timeout) => outcome,
    };
    reply.complete(outcome);
}

struct Exchange {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

#[derive(thiserror::Error, Debug)]
enum ExchangeError {
    #[error("Host {0} not found")]
    HostNotFound(String),
    #[error("Connection refused: {0}")]
    Connect(String),
    #[error("Connection timed out")]
    Timeout,
    #[error("Remote host closed the connection: {0}")]
    Closed(String),
    #[error("Operation canceled")]
    Aborted,
}

impl ExchangeError {
    fn transport_error(&self) -> TransportError {
        match self {
            ExchangeError::HostNotFound(_) => TransportError::HOST_NOT_FOUND,
            ExchangeError::Connect(_) => TransportError::CONNECTION_REFUSED,
            ExchangeError::Timeout => TransportError::TIMEOUT,
            ExchangeError::Closed(_) => TransportError::REMOTE_HOST_CLOSED,
            ExchangeError::Aborted => TransportError::OPERATION_CANCELED,
        }
    }
}

async fn exchange(
    connector: &PooledHttpConnector,
    mut request: Request<HttpBody>,
    connect_timeout: Option<Duration>,
) -> Result<Exchange, ExchangeError> {
    let host = request.uri().host().unwrap_or_default().to_string();
    let port = request.uri().port_u16().unwrap_or(DEFAULT_HTTP_PORT);
    let Some(key) = (host.as_str(), port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
    else {
        return Err(ExchangeError::HostNotFound(host));
    };
    debug!("connecting to {key:?}");

    let connect = match connect_timeout {
        Some(connect_timeout) => monoio::time::timeout(connect_timeout, connector.connect(key))
            .await
            .map_err(|_| ExchangeError::Timeout)?,
        None => connector.connect(key).await,
    };
    let mut conn = connect.map_err(|e| ExchangeError::Connect(format!("{e:?}")))?;
    match &conn {
        HttpConnection::Http1(_) => {
            *request.version_mut() = http::Version::HTTP_11;
        }
        HttpConnection::Http2(_) => {
            *request.version_mut() = http::Version::HTTP_2;
            request.headers_mut().remove(header::HOST);
        }
    }

    let response = match conn.send_request(request).await {
        (Ok(response), _) => response,
        (Err(e), _) => return Err(ExchangeError::Closed(format!("{e:?}"))),
    };
    let (parts, mut body) = response.into_parts();
    let mut data = BytesMut::new();
    while let Some(chunk) = body.next_data().await {
        let chunk = chunk.map_err(|e| ExchangeError::Closed(format!("{e:?}")))?;
        data.extend_from_slice(&chunk);
    }
    Ok(Exchange {
        status: parts.status,
        headers: parts.headers,
        body: data.freeze(),
    })
}

struct ReplyState {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: Bytes,
    error: TransportError,
    error_string: String,
    running: bool,
    observers: Vec<Arc<dyn ReplyObserver>>,
}

/// A reply owned by the network thread. Readable from any thread.
pub struct HttpReply {
    url: Uri,
    state: Mutex<ReplyState>,
    abort: Mutex<Option<OSender<()>>>,
}

impl HttpReply {
    fn new(url: Uri, abort: OSender<()>) -> Self {
        HttpReply {
            url,
            state: Mutex::new(ReplyState {
                status: None,
                headers: HeaderMap::new(),
                body: Bytes::new(),
                error: TransportError::NO_ERROR,
                error_string: String::new(),
                running: true,
                observers: Vec::new(),
            }),
            abort: Mutex::new(Some(abort)),
        }
    }

    fn complete(&self, outcome: Result<Exchange, ExchangeError>) {
        let (observers, error) = {
            let mut state = self.state.lock();
            if !state.running {
                return;
            }
            match outcome {
                Ok(exchange) => {
                    let error = TransportError::from_http_status(exchange.status.as_u16());
                    if error.is_error() {
                        state.error_string = format!(
                            "Error transferring {} - server replied: {}",
                            self.url,
                            exchange.status.canonical_reason().unwrap_or_default()
                        );
                    }
                    state.status = Some(exchange.status);
                    state.headers = exchange.headers;
                    state.body = exchange.body;
                    state.error = error;
                }
                Err(e) => {
                    debug!("exchange with {} failed: {e}", self.url);
                    state.error = e.transport_error();
                    state.error_string = e.to_string();
                }
            }
            state.running = false;
            (std::mem::take(&mut state.observers), state.error)
        };
        *self.abort.lock() = None;

        for observer in &observers {
            if error.is_error() {
                observer.errored(self, error);
            }
        }
        for observer in &observers {
            observer.finished(self);
        }
    }
}

impl RawReply for HttpReply {
    fn url(&self) -> Uri {
        self.url.clone()
    }

    fn status_code(&self) -> Option<u16> {
        self.state.lock().status.map(|status| status.as_u16())
    }

    fn reason_phrase(&self) -> String {
        self.state
            .lock()
            .status
            .and_then(|status| status.canonical_reason())
            .unwrap_or_default()
            .to_string()
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
        if let Some(abort) = self.abort.lock().take() {
            debug!("aborting request to {}", self.url);
            let _ = abort.send(());
        }
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.body = Bytes::new();
        state.headers.clear();
        state.observers.clear();
    }

    fn observe(&self, observer: Arc<dyn ReplyObserver>) {
        let error = {
            let mut state = self.state.lock();
            if state.running {
                state.observers.push(observer);
                return;
            }
            state.error
        };
        if error.is_error() {
            observer.errored(self, error);
        }
        observer.finished(self);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::TcpListener,
        sync::mpsc,
    };

    use http::Method;
    use relaykit_core::config::RuntimeType;

    use super::*;
    use crate::{rest::RestApi, tasks::TaskPool, transport::TlsError};

    fn legacy_runtime() -> RuntimeConfig {
        RuntimeConfig {
            runtime_type: RuntimeType::Legacy,
            ..Default::default()
        }
    }

    fn client(port: u16) -> ClientConfig {
        ClientConfig {
            port,
            connect_timeout_sec: Some(5),
            read_timeout_sec: Some(5),
            ..Default::default()
        }
    }

    struct Events(mpsc::Sender<String>);

    impl ReplyObserver for Events {
        fn finished(&self, reply: &dyn RawReply) {
            let _ = self.0.send(format!("finished {:?}", reply.status_code()));
        }

        fn errored(&self, _reply: &dyn RawReply, error: TransportError) {
            let _ = self.0.send(format!("errored {}", error.code()));
        }

        fn tls_errors(&self, _reply: &dyn RawReply, _errors: &[TlsError]) {}
    }

    fn observe(reply: &RawReplyRef) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel();
        reply.observe(Arc::new(Events(tx)));
        rx
    }

    fn next(events: &mpsc::Receiver<String>) -> String {
        events.recv_timeout(Duration::from_secs(10)).unwrap()
    }

    #[test]
    fn test_build_request() {
        let transport = HttpTransport::new(client(8080), &legacy_runtime()).unwrap();
        let request = transport
            .build_request(
                OutboundRequest::new(Method::POST, "/orders")
                    .with_query([("page", "2")])
                    .with_body("{\"id\": 1}")
                    .with_vendor(Some("opensoft".to_string())),
            )
            .unwrap();
        assert_eq!("http://127.0.0.1:8080/orders?page=2", request.uri().to_string());
        assert_eq!("127.0.0.1:8080", request.headers()[header::HOST]);
        assert_eq!(
            "application/vnd.opensoft+json",
            request.headers()[header::CONTENT_TYPE]
        );
        assert_eq!("9", request.headers()[header::CONTENT_LENGTH]);
        assert!(request.headers().get(header::AUTHORIZATION).is_none());
    }

    #[test]
    fn test_requests_are_signed() {
        let config = ClientConfig {
            auth: RestAuth::BearerToken {
                token: "abc".to_string(),
            },
            ..client(8080)
        };
        let transport = HttpTransport::new(config, &legacy_runtime()).unwrap();
        let request = transport
            .build_request(OutboundRequest::new(Method::GET, "/me"))
            .unwrap();
        assert_eq!("Bearer abc", request.headers()[header::AUTHORIZATION]);

        transport.set_auth(RestAuth::NoAuth);
        assert_eq!(RestAuth::NoAuth, transport.auth());
        let request = transport
            .build_request(OutboundRequest::new(Method::GET, "/me"))
            .unwrap();
        assert!(request.headers().get(header::AUTHORIZATION).is_none());
    }

    #[test]
    fn test_unsupported_scheme_is_invalid_url() {
        let config = ClientConfig {
            scheme: "https".to_string(),
            ..client(443)
        };
        let transport = HttpTransport::new(config, &legacy_runtime()).unwrap();
        let raw = transport.issue(OutboundRequest::new(Method::GET, "/"));
        let failure = raw.failure_reason().unwrap();
        assert_eq!(Some(ErrorKind::InvalidUrl), failure.kind());
    }

    #[test]
    fn test_connection_refused() {
        // Bind and drop to get a port nobody listens on.
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let transport = HttpTransport::new(client(port), &legacy_runtime()).unwrap();
        let raw = transport
            .issue(OutboundRequest::new(Method::GET, "/"))
            .wait()
            .unwrap();
        let events = observe(&raw);
        assert_eq!("errored 1", next(&events));
        assert_eq!("finished None", next(&events));
        assert_eq!(TransportError::CONNECTION_REFUSED, raw.error());
        assert!(!raw.is_running());
    }

    #[test]
    fn test_http_status_reported_as_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let body = "{\"message\":\"not found\"}";
            let response = format!(
                "HTTP/1.1 404 Not Found\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).unwrap();
            String::from_utf8_lossy(&request).to_string()
        });

        let transport = HttpTransport::new(client(port), &legacy_runtime()).unwrap();
        let raw = transport
            .issue(OutboundRequest::new(Method::GET, "/missing"))
            .wait()
            .unwrap();
        let events = observe(&raw);
        assert_eq!("errored 203", next(&events));
        assert_eq!("finished Some(404)", next(&events));
        assert_eq!(
            Some("application/json".to_string()),
            raw.header(header::CONTENT_TYPE)
        );
        assert_eq!(&b"{\"message\":\"not found\"}"[..], &raw.read_all()[..]);

        let request = server.join().unwrap();
        assert!(request.starts_with("GET /missing HTTP/1.1\r\n"));
        raw.release();
        assert!(raw.read_all().is_empty());
    }

    /// Accepts connections and never answers.
    fn silent_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            while let Ok((mut stream, _)) = listener.accept() {
                std::thread::spawn(move || {
                    let mut buf = [0u8; 1024];
                    while matches!(stream.read(&mut buf), Ok(n) if n > 0) {}
                });
            }
        });
        port
    }

    #[test]
    fn test_shutdown_finishes_running_reply() {
        let transport = HttpTransport::new(client(silent_server()), &legacy_runtime()).unwrap();
        let raw = transport
            .issue(OutboundRequest::new(Method::GET, "/hang"))
            .wait()
            .unwrap();
        let events = observe(&raw);
        assert!(raw.is_running());

        transport.shutdown();
        assert_eq!("errored 5", next(&events));
        assert_eq!("finished None", next(&events));
        assert!(!raw.is_running());
    }

    #[test]
    fn test_shutdown_settles_pipeline_calls() {
        let transport =
            Arc::new(HttpTransport::new(client(silent_server()), &legacy_runtime()).unwrap());
        let api = RestApi::new(transport.clone(), Arc::new(TaskPool::inline()));
        let calls: Vec<_> = (0..3).map(|_| api.get("/hang", &[])).collect();

        transport.shutdown();
        for call in &calls {
            let failure = call
                .wait_timeout(Duration::from_secs(5))
                .expect("call settles on shutdown")
                .unwrap_err();
            assert_eq!(Some(ErrorKind::ServiceUnavailable), failure.kind());
        }
        for _ in 0..100 {
            if api.in_flight() == 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(0, api.in_flight());

        let late = api.get("/late", &[]);
        assert_eq!(
            Some(ErrorKind::ServiceUnavailable),
            late.failure_reason().and_then(Failure::kind)
        );
    }
}
