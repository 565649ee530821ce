//! Blocking HTTP/1.1 front end.
//!
//! One accept loop, one OS thread per accepted socket. Each connection
//! thread reads the request head, attempts the WebSocket upgrade and, on
//! success, becomes that connection's reader loop for the rest of its life.
//! Requests that fail upgrade validation fall through to plain HTTP and are
//! answered with a 400.

use crate::handshake::{reject_bytes, HttpRequest};
use crate::server::Server;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Upper bound on an HTTP request head.
const MAX_HEAD_LEN: usize = 8192;

/// How long a fresh socket may take to deliver its request head.
const HEAD_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Accept-loop poll interval while idle.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Bind and start accepting connections for the server.
///
/// Returns once the listener is bound; accepted sockets are served on their
/// own threads until [`Server::terminate`] is called.
pub fn serve(server: Arc<Server>) -> io::Result<ListenerHandle> {
    let listener = TcpListener::bind((server.config().bind_addr.as_str(), server.config().port))?;
    let local_addr = listener.local_addr()?;
    listener.set_nonblocking(true)?;

    tracing::debug!(%local_addr, "listener bound");
    let accept_server = Arc::clone(&server);
    let thread = thread::Builder::new()
        .name("ws-accept".to_string())
        .spawn(move || accept_loop(&accept_server, &listener))?;

    Ok(ListenerHandle {
        local_addr,
        server,
        thread: Some(thread),
    })
}

fn accept_loop(server: &Arc<Server>, listener: &TcpListener) {
    while !server.is_terminated() {
        match listener.accept() {
            Ok((stream, peer)) => {
                let server = Arc::clone(server);
                let spawned = thread::Builder::new()
                    .name(format!("ws-conn-{peer}"))
                    .spawn(move || serve_connection(&server, stream));
                if let Err(error) = spawned {
                    tracing::warn!(%error, %peer, "failed to spawn connection thread");
                }
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(error) => {
                tracing::warn!(%error, "accept failed");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
    tracing::debug!("accept loop exited");
}

fn serve_connection(server: &Arc<Server>, mut stream: TcpStream) {
    let head = match read_request_head(&mut stream) {
        Ok(head) => head,
        Err(error) => {
            tracing::debug!(%error, "failed to read request head");
            return;
        }
    };

    let request = match HttpRequest::parse(&head) {
        Ok(request) => request,
        Err(error) => {
            tracing::debug!(%error, "unparsable request head");
            answer_plain(&stream, 400, "Bad Request");
            return;
        }
    };

    match server.prepare_upgrade(&request) {
        Ok(pending) => {
            // Frame traffic is latency-sensitive; the send path already
            // coalesces where it matters.
            let _ = stream.set_nodelay(true);
            if let Err(error) = server.run_upgraded_tcp(pending, stream) {
                tracing::debug!(%error, "upgraded connection ended with error");
            }
        }
        Err(error) => {
            tracing::debug!(%error, path = %request.path, "not an upgrade, answering plain HTTP");
            answer_plain(&stream, 400, "Bad Request");
        }
    }
}

fn answer_plain(mut stream: &TcpStream, status: u16, reason: &str) {
    use std::io::Write;
    let _ = stream.write_all(&reject_bytes(status, reason));
}

/// Read the request head byte-wise up to the blank line, so no frame bytes
/// that might follow it are swallowed.
fn read_request_head(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    use std::io::Read;

    stream.set_read_timeout(Some(HEAD_READ_TIMEOUT))?;
    let mut head = Vec::with_capacity(512);
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed before sending a request head",
            ));
        }
        head.push(byte[0]);
        if head.ends_with(b"\r\n\r\n") {
            return Ok(head);
        }
        if head.len() > MAX_HEAD_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request head too large",
            ));
        }
    }
}

/// Handle to a running listener.
pub struct ListenerHandle {
    local_addr: SocketAddr,
    server: Arc<Server>,
    thread: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    /// The address the listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The server this listener feeds.
    #[must_use]
    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// Stop the server and wait for the accept loop to exit. Connection
    /// threads notice the terminated flag at their next iteration.
    pub fn shutdown(mut self) {
        self.server.terminate();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.server.terminate();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
