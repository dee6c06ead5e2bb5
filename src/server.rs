//! TCP server for the key-value HTTP surface.
//!
//! Accepts connections, performs one bounded read per connection, answers
//! with a single response and closes. By default connections are handled one
//! at a time on the accepting task; in concurrent mode each connection gets
//! its own task, bounded by a connection-limit semaphore.

use crate::config::Config;
use crate::http;
use crate::shutdown::Shutdown;
use crate::storage::Storage;
use bytes::BytesMut;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{AcquireError, Semaphore};
use tracing::{debug, error, info, trace};

/// Pending-connection backlog for the listening socket
const LISTEN_BACKLOG: i32 = 128;

/// Pause after the first of a run of failed accepts
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);

/// Longest pause between failed accepts
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Server errors
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid listen address '{0}'")]
    InvalidAddress(String),
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("connection limiter closed")]
    LimiterClosed(#[from] AcquireError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Server instance
///
/// Owns the store and the running flag; the flag is shared with the
/// [`Shutdown`] handle returned by [`Server::shutdown_handle`].
pub struct Server {
    config: Config,
    storage: Arc<Storage>,
    running: Arc<AtomicBool>,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        let connection_limit = Arc::new(Semaphore::new(config.max_connections));

        Server {
            config,
            storage: Storage::new(),
            running: Arc::new(AtomicBool::new(true)),
            connection_limit,
        }
    }

    /// Bind the listening socket.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = resolve(&self.config.listen)?;
        let bind_error = |source| ServerError::Bind {
            addr: self.config.listen.clone(),
            source,
        };

        let listener = create_listener(addr).map_err(bind_error)?;
        let listener = TcpListener::from_std(listener).map_err(bind_error)?;

        info!(address = %listener.local_addr()?, "Server listening");
        Ok(listener)
    }

    /// Shutdown handle that wakes `listener`'s accept loop
    pub fn shutdown_handle(&self, listener: &TcpListener) -> Result<Shutdown, ServerError> {
        Ok(Shutdown::new(
            Arc::clone(&self.running),
            listener.local_addr()?,
        ))
    }

    /// Accept and serve connections until the running flag is cleared.
    ///
    /// The listener is closed before this returns. In concurrent mode this
    /// also waits for in-flight connections to finish.
    pub async fn run(&self, listener: TcpListener) -> Result<(), ServerError> {
        let max_request_size = self.config.max_request_size;
        let mut accept_failures: u32 = 0;

        while self.running.load(Ordering::SeqCst) {
            let permit = if self.config.concurrent {
                Some(Arc::clone(&self.connection_limit).acquire_owned().await?)
            } else {
                None
            };

            let (stream, peer) = match listener.accept().await {
                Ok(conn) => {
                    accept_failures = 0;
                    conn
                }
                Err(e) => {
                    // Errors such as EMFILE persist until something frees up,
                    // so back off instead of spinning
                    accept_failures = accept_failures.saturating_add(1);
                    let pause = accept_backoff(accept_failures);
                    if accept_failures == 1 {
                        error!(error = %e, "Failed to accept connection");
                    } else {
                        debug!(error = %e, failures = accept_failures, "Accept still failing");
                    }
                    drop(permit);
                    tokio::time::sleep(pause).await;
                    continue;
                }
            };

            // Cleared while parked in accept: this is the wake-up connection
            if !self.running.load(Ordering::SeqCst) {
                debug!(peer = %peer, "Dropping connection accepted during shutdown");
                break;
            }

            debug!(peer = %peer, "New connection");

            match permit {
                Some(permit) => {
                    let storage = Arc::clone(&self.storage);
                    tokio::spawn(async move {
                        handle_connection(stream, peer, &storage, max_request_size).await;
                        drop(permit);
                    });
                }
                None => {
                    handle_connection(stream, peer, &self.storage, max_request_size).await;
                }
            }
        }

        drop(listener);
        info!("Listener closed");

        if self.config.concurrent {
            debug!("Waiting for in-flight connections");
            // Permits only come back when connection tasks finish
            let _all = self
                .connection_limit
                .acquire_many(self.config.max_connections as u32)
                .await?;
        }

        let stats = self.storage.stats();
        info!(
            items = stats.item_count,
            sets = stats.sets,
            hits = stats.hits,
            misses = stats.misses,
            deletes = stats.deletes,
            "Server stopped"
        );
        Ok(())
    }

    /// Get a reference to the storage for testing
    #[cfg(test)]
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }
}

/// Pause before retrying after `failures` consecutive accept errors
fn accept_backoff(failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(16);
    ACCEPT_BACKOFF_MIN
        .saturating_mul(1 << shift)
        .min(ACCEPT_BACKOFF_MAX)
}

fn resolve(listen: &str) -> Result<SocketAddr, ServerError> {
    listen
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| ServerError::InvalidAddress(listen.to_string()))
}

fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

/// Serve one connection and close it. Failures are logged, never returned.
async fn handle_connection<S>(mut stream: S, peer: SocketAddr, storage: &Storage, limit: usize)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match serve_request(&mut stream, storage, limit).await {
        Ok(()) => trace!(peer = %peer, "Connection closed"),
        Err(e) => debug!(peer = %peer, error = %e, "Connection error"),
    }
}

/// Read one request, write one response.
///
/// A request longer than `limit` bytes is never read past the first
/// `limit` bytes.
async fn serve_request<S>(stream: &mut S, storage: &Storage, limit: usize) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::zeroed(limit);

    let n = match stream.read(&mut buffer).await {
        Ok(n) => n,
        Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
            trace!("Connection reset by client");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    if n == 0 {
        trace!("Connection closed by client");
        return Ok(());
    }
    buffer.truncate(n);

    let response = http::process(&buffer, storage, limit);
    stream.write_all(&response).await?;
    stream.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    fn test_config(concurrent: bool) -> Config {
        Config {
            listen: "127.0.0.1:0".to_string(),
            max_request_size: 4096,
            concurrent,
            workers: None,
            max_connections: 16,
            log_level: "info".to_string(),
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    /// Start a server on an ephemeral port
    fn start(concurrent: bool) -> (
        Arc<Server>,
        SocketAddr,
        Shutdown,
        JoinHandle<Result<(), ServerError>>,
    ) {
        let server = Arc::new(Server::new(test_config(concurrent)));
        let listener = server.bind().unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = server.shutdown_handle(&listener).unwrap();

        let runner = Arc::clone(&server);
        let handle = tokio::spawn(async move { runner.run(listener).await });
        (server, addr, shutdown, handle)
    }

    /// Send one raw request and read the whole response
    async fn send(addr: SocketAddr, request: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        String::from_utf8(response).unwrap()
    }

    fn body(response: &str) -> &str {
        response.split_once("\r\n\r\n").map_or("", |(_, body)| body)
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = Server::new(test_config(false));
        assert_eq!(server.storage().stats().item_count, 0);
        assert!(server.running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_bind_invalid_address() {
        let mut config = test_config(false);
        config.listen = "not an address".to_string();
        match Server::new(config).bind() {
            Err(ServerError::InvalidAddress(addr)) => assert_eq!(addr, "not an address"),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_bind_address_in_use() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = test_config(false);
        config.listen = taken.local_addr().unwrap().to_string();

        match Server::new(config).bind() {
            Err(ServerError::Bind { .. }) => {}
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_accept_backoff() {
        assert_eq!(accept_backoff(1), Duration::from_millis(10));
        assert_eq!(accept_backoff(2), Duration::from_millis(20));
        assert_eq!(accept_backoff(4), Duration::from_millis(80));
        assert_eq!(accept_backoff(7), Duration::from_millis(640));
        assert_eq!(accept_backoff(8), Duration::from_secs(1));
        assert_eq!(accept_backoff(u32::MAX), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_serve_request_mock() {
        let storage = Storage::new();
        let expected = b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 11\r\nConnection: close\r\n\r\n{\"x\": \"10\"}";

        let stream = tokio_test::io::Builder::new()
            .read(b"POST /?x=10 HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .write(expected)
            .build();
        handle_connection(stream, peer(), &storage, 4096).await;

        assert_eq!(storage.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_read_sends_nothing() {
        let storage = Storage::new();

        // No scripted writes: any response would fail the mock
        let stream = tokio_test::io::Builder::new().build();
        handle_connection(stream, peer(), &storage, 4096).await;
    }

    #[tokio::test]
    async fn test_connection_reset_sends_nothing() {
        let storage = Storage::new();

        let mut stream = tokio_test::io::Builder::new()
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        assert!(serve_request(&mut stream, &storage, 4096).await.is_ok());
    }

    #[tokio::test]
    async fn test_oversized_request_rejected() {
        let storage = Storage::new();
        let (mut client, server) = tokio::io::duplex(512);

        client.write_all(&[b'G'; 32]).await.unwrap();
        let serve = {
            let storage = Arc::clone(&storage);
            tokio::spawn(async move {
                handle_connection(server, peer(), &storage, 16).await;
            })
        };

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        serve.await.unwrap();

        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(body(&response).contains("RequestTooLarge"));
        assert_eq!(storage.len(), 0);
    }

    #[tokio::test]
    async fn test_end_to_end() {
        let (server, addr, shutdown, handle) = start(false);

        let response = send(addr, "POST /?x=10 HTTP/1.1\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(body(&response), r#"{"x": "10"}"#);

        assert_eq!(body(&send(addr, "GET /?x HTTP/1.1\r\n\r\n").await), r#"{"x": "10"}"#);
        assert_eq!(body(&send(addr, "DELETE /?x HTTP/1.1\r\n\r\n").await), r#"{"x": "10"}"#);
        assert_eq!(
            body(&send(addr, "GET /?x HTTP/1.1\r\n\r\n").await),
            r#"{"KeyNotFound": "InvalidOperation"}"#
        );
        assert_eq!(server.storage().len(), 0);

        assert!(shutdown.trigger().await);
        timeout(Duration::from_secs(5), handle)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_bad_requests_do_not_stop_loop() {
        let (_server, addr, shutdown, handle) = start(false);

        let response = send(addr, "PUT /?a=1 HTTP/1.1\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));

        let response = send(addr, "nonsense\r\n").await;
        assert!(body(&response).contains("MalformedRequest"));

        // A client that connects and leaves without sending anything
        drop(TcpStream::connect(addr).await.unwrap());

        let response = send(addr, "POST /?a=1 HTTP/1.1\r\n\r\n").await;
        assert_eq!(body(&response), r#"{"a": "1"}"#);

        shutdown.trigger().await;
        timeout(Duration::from_secs(5), handle)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_releases_listener() {
        let (_server, addr, shutdown, handle) = start(false);

        assert!(shutdown.trigger().await);
        assert!(!shutdown.trigger().await);
        timeout(Duration::from_secs(5), handle)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();

        // The port is free again once run() has returned
        std::net::TcpListener::bind(addr).expect("listener was not released");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_shutdown_drains_connections() {
        let (server, addr, shutdown, handle) = start(true);

        // Connected but silent: its task is parked in read
        let mut pending = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(shutdown.trigger().await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handle.is_finished());

        // The in-flight connection is still served after the trigger
        pending.write_all(b"POST /?z=1 HTTP/1.1\r\n\r\n").await.unwrap();
        let mut response = Vec::new();
        pending.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(body(&response), r#"{"z": "1"}"#);

        timeout(Duration::from_secs(5), handle)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
        assert_eq!(server.storage().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_mode() {
        let (server, addr, shutdown, handle) = start(true);

        let clients: Vec<_> = (0..8)
            .map(|i| {
                tokio::spawn(async move {
                    let response = send(addr, &format!("POST /?k{i}={i} HTTP/1.1\r\n\r\n")).await;
                    assert_eq!(body(&response), format!(r#"{{"k{i}": "{i}"}}"#));
                })
            })
            .collect();
        for client in clients {
            client.await.unwrap();
        }
        assert_eq!(server.storage().len(), 8);

        shutdown.trigger().await;
        timeout(Duration::from_secs(5), handle)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}
