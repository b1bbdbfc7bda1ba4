use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::Response,
    Router,
};
use bytes::Bytes;
use oss_gateway::{AppConfig, Server};
use parking_lot::Mutex;
use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::oneshot,
    task::JoinHandle,
};

/// What the mock origin answers with
#[derive(Clone)]
pub struct MockResponse {
    pub status: StatusCode,
    pub headers: Vec<(HeaderName, HeaderValue)>,
    pub body: Bytes,
    pub delay: Option<Duration>,
}

impl MockResponse {
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: StatusCode::OK,
            headers: Vec::new(),
            body: body.into(),
            delay: None,
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn with_header(mut self, name: &'static str, value: &'static str) -> Self {
        self.headers
            .push((HeaderName::from_static(name), HeaderValue::from_static(value)));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// A request as seen by the mock origin
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

struct MockState {
    response: MockResponse,
    requests: Mutex<Vec<RecordedRequest>>,
}

/// In-process stand-in for the object-storage origin.
pub struct MockUpstream {
    pub addr: SocketAddr,
    state: Arc<MockState>,
}

impl MockUpstream {
    pub async fn start(response: MockResponse) -> Self {
        let state = Arc::new(MockState {
            response,
            requests: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .fallback(record_and_respond)
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock origin");
        let addr = listener.local_addr().expect("Mock origin has no address");

        tokio::spawn(async move {
            axum::serve(listener, app)
                .await
                .expect("Mock origin stopped");
        });

        Self { addr, state }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().clone()
    }
}

async fn record_and_respond(State(state): State<Arc<MockState>>, request: Request) -> Response {
    state.requests.lock().push(RecordedRequest {
        method: request.method().clone(),
        uri: request.uri().clone(),
        headers: request.headers().clone(),
    });

    if let Some(delay) = state.response.delay {
        tokio::time::sleep(delay).await;
    }

    let mut response = Response::new(Body::from(state.response.body.clone()));
    *response.status_mut() = state.response.status;
    for (name, value) in &state.response.headers {
        response.headers_mut().append(name.clone(), value.clone());
    }
    response
}

/// Origin that accepts TCP connections and hangs up without answering.
pub struct DroppingUpstream {
    pub addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
}

impl DroppingUpstream {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind dropping origin");
        let addr = listener.local_addr().expect("Dropping origin has no address");
        let accepted = Arc::new(AtomicUsize::new(0));

        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(stream);
            }
        });

        Self { addr, accepted }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

/// Origin that declares a body length, sends only part of it and hangs up.
pub struct TruncatingUpstream {
    pub addr: SocketAddr,
}

impl TruncatingUpstream {
    pub async fn start(declared: usize, sent: &'static [u8]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind truncating origin");
        let addr = listener.local_addr().expect("Truncating origin has no address");

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    // Read the whole request head first so closing does not reset
                    // the connection before the response is read.
                    if read_until(&mut stream, b"\r\n\r\n").await.is_err() {
                        return;
                    }
                    let head = format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/octet-stream\r\ncontent-length: {}\r\n\r\n",
                        declared
                    );
                    let _ = stream.write_all(head.as_bytes()).await;
                    let _ = stream.write_all(sent).await;
                    let _ = stream.flush().await;
                });
            }
        });

        Self { addr }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

/// Reads from `stream` until `needle` shows up, returning everything read.
pub async fn read_until(stream: &mut TcpStream, needle: &[u8]) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    while !buf.windows(needle.len()).any(|w| w == needle) {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed"));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(buf)
}

/// Drains `stream` until the peer closes it and returns how long that took.
/// A reset counts as closed.
pub async fn wait_for_close(stream: &mut TcpStream) -> Duration {
    let started = Instant::now();
    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return started.elapsed(),
            Ok(_) => {}
        }
    }
}

/// Sends a keep-alive `GET /health` on a raw socket and reads the full reply.
pub async fn raw_health_request(stream: &mut TcpStream) -> Vec<u8> {
    stream
        .write_all(b"GET /health HTTP/1.1\r\nhost: gateway\r\n\r\n")
        .await
        .expect("Failed to write request");
    read_until(stream, b"\"}").await.expect("Failed to read health reply")
}

/// An address nothing is listening on.
pub fn closed_port_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("Failed to bind spare port");
    let addr = listener.local_addr().expect("Spare port has no address");
    drop(listener);
    format!("http://{}", addr)
}

/// Starts a gateway on an ephemeral port and returns its base URL.
pub async fn spawn_gateway(config: AppConfig) -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind gateway");
    let addr = listener.local_addr().expect("Gateway has no address");

    let server = Server::new(Arc::new(config)).expect("Failed to create gateway");
    tokio::spawn(server.serve(listener, std::future::pending()));

    format!("http://{}", addr)
}

/// Starts a gateway that stops once the returned sender fires.
pub async fn spawn_stoppable_gateway(
    config: AppConfig,
) -> (SocketAddr, oneshot::Sender<()>, JoinHandle<io::Result<()>>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind gateway");
    let addr = listener.local_addr().expect("Gateway has no address");

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = Server::new(Arc::new(config)).expect("Failed to create gateway");
    let handle = tokio::spawn(server.serve(listener, async move {
        let _ = stop_rx.await;
    }));

    (addr, stop_tx, handle)
}

/// Gateway pointed at `upstream_url` with otherwise default settings.
pub async fn spawn_gateway_for(upstream_url: String) -> String {
    spawn_gateway(AppConfig::new().with_base_url(upstream_url)).await
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .build()
        .expect("Failed to build test client")
}
