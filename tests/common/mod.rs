//! Shared test harness: a minimal blocking WebSocket client speaking this
//! engine's dialect (unmasked frames), plus server bootstrap helpers.
#![allow(dead_code)]

use bidisync::{
    listener, ConnectionId, Frame, FrameStream, RestHandler, RestRequest, RestResponse, Server,
    ServerConfig, TcpWire,
};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::Once;
use std::time::{Duration, Instant};

/// RFC 6455 sample nonce; decodes to exactly 16 bytes.
pub const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
/// Accept value for [`SAMPLE_KEY`].
pub const SAMPLE_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

static LOGGING: Once = Once::new();

/// Route test logs through tracing; `RUST_LOG` controls verbosity.
pub fn init_logging() {
    LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Start a listener-backed server with the given handler.
pub fn start_server(
    config: ServerConfig,
    handler: Arc<dyn RestHandler>,
) -> listener::ListenerHandle {
    init_logging();
    let server = Server::new(config, handler);
    listener::serve(server).expect("bind listener")
}

/// An echo handler: answers 200 with the request body and content type.
pub struct EchoHandler;

impl RestHandler for EchoHandler {
    fn handle(&self, request: &RestRequest) -> RestResponse {
        RestResponse {
            status: 200,
            out_headers: String::new(),
            content_type: request.content_type.clone(),
            content: request.content.clone(),
        }
    }
}

/// The raw HTTP response to a handshake attempt.
pub struct RawResponse {
    pub status: u16,
    pub head: String,
    pub stream: TcpStream,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        let prefix = format!("{name}: ").to_ascii_lowercase();
        self.head.lines().find_map(|line| {
            let lower = line.to_ascii_lowercase();
            lower.strip_prefix(&prefix).map(|_| &line[prefix.len()..])
        })
    }
}

/// Send an upgrade request and read the response head, without assuming
/// acceptance.
pub fn raw_handshake(addr: SocketAddr, protocols: &str) -> RawResponse {
    let mut stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let request = format!(
        "GET /ws HTTP/1.1\r\n\
         Host: loopback\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Key: {SAMPLE_KEY}\r\n\
         Sec-WebSocket-Protocol: {protocols}\r\n\
         \r\n"
    );
    stream.write_all(request.as_bytes()).expect("send handshake");

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).expect("read response head");
        assert!(n > 0, "server closed during handshake");
        head.push(byte[0]);
        assert!(head.len() < 8192, "response head too large");
    }

    let head = String::from_utf8(head).expect("response head is UTF-8");
    let status: u16 = head
        .split_whitespace()
        .nth(1)
        .expect("status code")
        .parse()
        .expect("numeric status");

    RawResponse {
        status,
        head,
        stream,
    }
}

/// A connected, upgraded test client.
pub struct TestClient {
    pub stream: FrameStream<TcpWire>,
    pub accept: String,
    pub protocol: String,
}

impl TestClient {
    /// Connect and upgrade, asserting acceptance.
    pub fn connect(addr: SocketAddr, protocols: &str) -> Self {
        let response = raw_handshake(addr, protocols);
        assert_eq!(response.status, 101, "head: {}", response.head);
        let accept = response
            .header("Sec-WebSocket-Accept")
            .expect("accept header")
            .to_string();
        let protocol = response
            .header("Sec-WebSocket-Protocol")
            .expect("protocol header")
            .to_string();

        Self {
            stream: FrameStream::new(TcpWire::new(response.stream)),
            accept,
            protocol,
        }
    }

    /// Read frames until one arrives or the deadline passes.
    pub fn expect_frame(&mut self, timeout: Duration) -> Frame {
        let deadline = Instant::now() + timeout;
        loop {
            match self.stream.get_frame(Duration::from_millis(50)) {
                Ok(Some(frame)) => return frame,
                Ok(None) => assert!(Instant::now() < deadline, "no frame within {timeout:?}"),
                Err(e) => panic!("client read failed: {e}"),
            }
        }
    }

    /// Assert silence on the wire for `window`.
    pub fn expect_no_frame(&mut self, window: Duration) {
        let deadline = Instant::now() + window;
        while Instant::now() < deadline {
            if let Ok(Some(frame)) = self.stream.get_frame(Duration::from_millis(50)) {
                panic!("unexpected frame: {:?}", frame.opcode);
            }
        }
    }
}

/// Wait until the server has registered exactly one connection.
pub fn wait_for_connection(server: &Arc<Server>) -> ConnectionId {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(id) = server.connection_ids().first().copied() {
            return id;
        }
        assert!(Instant::now() < deadline, "connection never registered");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Wait until the server index is empty.
pub fn wait_for_disconnect(server: &Arc<Server>) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while server.connection_count() != 0 {
        assert!(Instant::now() < deadline, "connection never deregistered");
        std::thread::sleep(Duration::from_millis(5));
    }
}
