//! HTTP transport: inbound server feeding the router, outbound client for peer calls.
//!
//! The server speaks a minimal HTTP/1.1: one request per connection, `content-length`
//! bodies, `connection: close` on every response. A request that is not fully received
//! within the read timeout is dropped and its connection closed.

use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use intairact_core::{Method, Request, Response, Router, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const MAX_HEAD_LEN: usize = 16 * 1024;
const MAX_BODY_LEN: usize = 8 * 1024 * 1024;
const MAX_HEADERS: usize = 64;

/// Inbound HTTP server. Accepts until `close()` or drop.
pub struct HttpServer {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl HttpServer {
    /// Bind and start accepting. Must be called from within a Tokio runtime.
    /// `read_timeout` bounds how long a connection may take to deliver its request.
    pub fn bind(addr: SocketAddr, router: Arc<Router>, read_timeout: Duration) -> io::Result<Self> {
        let std_listener = std::net::TcpListener::bind(addr)?;
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;
        let local_addr = listener.local_addr()?;
        let accept_task = tokio::spawn(accept_loop(listener, router, read_timeout));
        tracing::debug!(addr = %local_addr, "http server listening");
        Ok(Self {
            local_addr,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting. Connections already accepted finish on their own.
    pub fn close(&self) {
        self.accept_task.abort();
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: TcpListener, router: Arc<Router>, read_timeout: Duration) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let router = router.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, router, read_timeout).await {
                        tracing::debug!(%peer, error = %e, "connection failed");
                    }
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    router: Arc<Router>,
    read_timeout: Duration,
) -> Result<(), TransportError> {
    let read = tokio::time::timeout(read_timeout, read_request(&mut stream))
        .await
        .map_err(|_| TransportError::Timeout { addr: peer })?;
    let mut head_only = false;
    let response = match read {
        Ok(Some(request)) => {
            tracing::debug!(method = %request.method(), path = request.path(), "request");
            head_only = request.method() == Method::Head;
            // Handlers are synchronous and may block.
            tokio::task::spawn_blocking(move || router.dispatch(request))
                .await
                .unwrap_or_else(|_| Response::new(StatusCode::INTERNAL_ERROR))
        }
        Ok(None) => return Ok(()),
        Err(TransportError::Malformed(msg)) => Response::error(msg),
        Err(TransportError::UnsupportedMethod(m)) => {
            Response::new(StatusCode(405)).with_body(format!("unsupported method {m}"))
        }
        Err(e) => return Err(e),
    };
    write_response(&mut stream, &response, head_only).await?;
    stream.shutdown().await?;
    Ok(())
}

struct Head {
    method: String,
    target: String,
    headers: Vec<(String, String)>,
    len: usize,
}

fn parse_head(buf: &[u8]) -> Result<Option<Head>, TransportError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let status = req
        .parse(buf)
        .map_err(|e| TransportError::Malformed(e.to_string()))?;
    let httparse::Status::Complete(len) = status else {
        return Ok(None);
    };
    let method = req.method.unwrap_or_default().to_string();
    let target = req.path.unwrap_or("/").to_string();
    let headers = req
        .headers
        .iter()
        .map(|h| {
            (
                h.name.to_ascii_lowercase(),
                String::from_utf8_lossy(h.value).trim().to_string(),
            )
        })
        .collect();
    Ok(Some(Head {
        method,
        target,
        headers,
        len,
    }))
}

/// Read one request. `Ok(None)` when the peer closed without sending anything.
async fn read_request(stream: &mut TcpStream) -> Result<Option<Request>, TransportError> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    let head = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(TransportError::Malformed("connection closed in headers".into()));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(head) = parse_head(&buf)? {
            break head;
        }
        if buf.len() > MAX_HEAD_LEN {
            return Err(TransportError::Malformed("request head too large".into()));
        }
    };

    let method =
        Method::from_str(&head.method).map_err(|_| TransportError::UnsupportedMethod(head.method.clone()))?;
    let content_length = match head.headers.iter().find(|(k, _)| k == "content-length") {
        Some((_, v)) => v
            .parse::<usize>()
            .map_err(|_| TransportError::Malformed(format!("bad content-length {v:?}")))?,
        None => 0,
    };
    if content_length > MAX_BODY_LEN {
        return Err(TransportError::Malformed(format!(
            "body of {content_length} bytes exceeds limit"
        )));
    }

    let mut body = buf.split_off(head.len);
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(TransportError::Body("connection closed in body".into()));
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    let mut request = Request::new(method, &head.target);
    for (name, value) in head.headers {
        request = request.with_header(&name, value);
    }
    Ok(Some(request.with_body(body)))
}

/// Status line, headers and body. `head_only` answers a HEAD request: the
/// content-length of the body is sent, the body is not.
fn encode_response(response: &Response, head_only: bool) -> Vec<u8> {
    let status = response.status();
    let mut out = format!("HTTP/1.1 {} {}\r\n", status.as_u16(), status.reason());
    for (name, value) in response.metadata() {
        if name == "content-length" || name == "connection" {
            continue;
        }
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str(&format!("content-length: {}\r\n", response.body().len()));
    out.push_str("connection: close\r\n\r\n");
    let mut bytes = out.into_bytes();
    if !head_only {
        bytes.extend_from_slice(response.body());
    }
    bytes
}

async fn write_response(stream: &mut TcpStream, response: &Response, head_only: bool) -> io::Result<()> {
    stream.write_all(&encode_response(response, head_only)).await?;
    stream.flush().await
}

/// Outbound client. Every request carries the configured timeout; there is no retry.
#[derive(Clone)]
pub struct HttpClient {
    inner: reqwest::Client,
}

impl HttpClient {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let inner = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Setup(e.to_string()))?;
        Ok(Self { inner })
    }

    /// Send `request` to the peer at `addr`.
    pub async fn send(&self, addr: SocketAddr, request: &Request) -> Result<Response, TransportError> {
        let url = format!("http://{}{}", addr, request.target());
        let method = reqwest::Method::from_bytes(request.method().as_str().as_bytes())
            .map_err(|e| TransportError::Malformed(e.to_string()))?;
        let mut builder = self.inner.request(method, &url);
        for (name, value) in request.metadata() {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let resp = builder
            .body(request.body().to_vec())
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(addr, e))?;

        let mut response = Response::new(StatusCode(resp.status().as_u16()));
        for (name, value) in resp.headers() {
            if let Ok(v) = value.to_str() {
                response = response.with_header(name.as_str(), v);
            }
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| TransportError::from_reqwest(addr, e))?;
        Ok(response.with_body(body.to_vec()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("{addr} unreachable: {message}")]
    Unreachable { addr: SocketAddr, message: String },
    #[error("request to {addr} timed out")]
    Timeout { addr: SocketAddr },
    #[error("body: {0}")]
    Body(String),
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("unsupported method {0:?}")]
    UnsupportedMethod(String),
    #[error("client setup: {0}")]
    Setup(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TransportError {
    fn from_reqwest(addr: SocketAddr, e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout { addr }
        } else if e.is_body() || e.is_decode() {
            TransportError::Body(e.to_string())
        } else {
            TransportError::Unreachable {
                addr,
                message: e.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use intairact_core::{HandlerFault, Route};

    fn echo_router() -> Arc<Router> {
        let router = Router::new();
        router.add_route(Route::put("/echo/:id").unwrap(), |req| {
            Ok(Response::ok()
                .with_header("x-id", req.param("id").unwrap_or_default())
                .with_body(req.body().to_vec()))
        });
        router.add_route(Route::get("/fault").unwrap(), |_| {
            Err(HandlerFault::new("nope"))
        });
        Arc::new(router)
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn serve(router: Arc<Router>) -> HttpServer {
        HttpServer::bind(loopback(), router, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn head_parsing() {
        let head = parse_head(b"PUT /a?b=1 HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc")
            .unwrap()
            .unwrap();
        assert_eq!(head.method, "PUT");
        assert_eq!(head.target, "/a?b=1");
        assert_eq!(head.headers, vec![("content-length".into(), "3".into())]);
        assert_eq!(head.len, 42);
        assert!(parse_head(b"PUT /a HTTP/1.1\r\nHost").unwrap().is_none());
        assert!(parse_head(b"\x00\x01garbage\r\n\r\n").is_err());
    }

    #[test]
    fn response_encoding() {
        let bytes = encode_response(&Response::created(), false);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 201 Created\r\n"));
        assert!(text.contains("content-length: 0\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn head_response_omits_body() {
        let response = Response::ok().with_body("abcdef");
        let text = String::from_utf8(encode_response(&response, true)).unwrap();
        assert!(text.contains("content-length: 6\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
        let text = String::from_utf8(encode_response(&response, false)).unwrap();
        assert!(text.ends_with("\r\n\r\nabcdef"));
    }

    #[tokio::test]
    async fn head_request_over_loopback() {
        let router = Router::new();
        router.add_route(Route::new(Method::Head, "/doc").unwrap(), |_| {
            Ok(Response::ok().with_body("abcdef"))
        });
        let server = serve(Arc::new(router));
        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        stream
            .write_all(b"HEAD /doc HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.unwrap();
        let text = String::from_utf8(raw).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-length: 6\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn stalled_request_is_dropped() {
        let server = HttpServer::bind(loopback(), echo_router(), Duration::from_millis(200)).unwrap();
        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        stream.write_all(b"GET /a HTTP/1.1\r\nHost: x\r\n").await.unwrap();
        let mut raw = Vec::new();
        let outcome = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut raw))
            .await
            .expect("server kept a stalled connection open");
        if let Ok(n) = outcome {
            assert_eq!(n, 0);
        }
    }

    #[tokio::test]
    async fn round_trip_over_loopback() {
        let server = serve(echo_router());
        let client = HttpClient::new(Duration::from_secs(5)).unwrap();

        let req = Request::new(Method::Put, "/echo/a%20b").with_body("hello");
        let resp = client.send(server.local_addr(), &req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.body(), b"hello");
        assert_eq!(resp.header("x-id"), Some("a b"));

        let resp = client
            .send(server.local_addr(), &Request::new(Method::Get, "/fault"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ERROR);
        assert_eq!(resp.body(), b"nope");

        let resp = client
            .send(server.local_addr(), &Request::new(Method::Get, "/missing"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(resp.body().is_empty());
    }

    #[tokio::test]
    async fn closed_server_is_unreachable() {
        let server = serve(echo_router());
        let addr = server.local_addr();
        drop(server);
        tokio::task::yield_now().await;
        let client = HttpClient::new(Duration::from_secs(2)).unwrap();
        let err = client
            .send(addr, &Request::new(Method::Get, "/fault"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::Unreachable { .. } | TransportError::Timeout { .. }
        ));
    }

    #[tokio::test]
    async fn bind_conflict_fails() {
        let server = serve(echo_router());
        assert!(HttpServer::bind(server.local_addr(), echo_router(), Duration::from_secs(5)).is_err());
    }
}
