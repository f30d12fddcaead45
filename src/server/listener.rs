//! Relay server listener
//!
//! Handles the TCP accept loop; each connection reads one request head and
//! is then either handed to the channel registry or answered directly.

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

use crate::error::Result;
use crate::registry::{ChannelRegistry, Interface};
use crate::server::config::ServerConfig;
use crate::server::request::{self, Method, RequestError, RequestHead, Route};
use crate::session::ClientInfo;

/// State shared by every connection task
struct ConnectionContext {
    config: ServerConfig,
    registry: Arc<ChannelRegistry>,
    default_interface: Interface,
}

/// HTTP front end of the relay
pub struct HubServer {
    context: Arc<ConnectionContext>,
    next_connection_id: AtomicU64,
    connection_semaphore: Option<Arc<Semaphore>>,
}

impl HubServer {
    /// Create a server feeding `registry`
    pub fn new(config: ServerConfig, registry: Arc<ChannelRegistry>) -> Result<Self> {
        config.validate()?;
        let default_interface = Interface::by_name(&config.default_interface)?;

        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        Ok(Self {
            context: Arc::new(ConnectionContext {
                config,
                registry,
                default_interface,
            }),
            next_connection_id: AtomicU64::new(1),
            connection_semaphore,
        })
    }

    /// Get a reference to the channel registry
    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.context.registry
    }

    /// Get the bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.context.config.bind_addr
    }

    /// Run the server
    ///
    /// This method blocks until the server is shut down.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.bind_addr()).await?;
        tracing::info!(addr = %self.bind_addr(), "Relay server listening");
        self.accept_loop(&listener).await
    }

    /// Run the server with graceful shutdown
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.bind_addr()).await?;
        tracing::info!(addr = %self.bind_addr(), "Relay server listening");
        self.serve_until(listener, shutdown).await
    }

    /// Serve an already bound listener until `shutdown` completes
    pub async fn serve_until<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
            result = self.accept_loop(&listener) => result,
        }
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    self.handle_connection(socket, peer_addr);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        // Check connection limit
        let permit = if let Some(ref sem) = self.connection_semaphore {
            match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                    return;
                }
            }
        } else {
            None
        };

        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(connection_id = connection_id, peer = %peer_addr, "New connection");

        let context = Arc::clone(&self.context);
        tokio::spawn(async move {
            // Held only while the request is read; attached clients do not count
            let _permit = permit;
            if let Err(e) = serve_connection(socket, peer_addr, &context).await {
                tracing::debug!(connection_id = connection_id, error = %e, "Connection error");
            }
        });
    }
}

async fn serve_connection(
    mut socket: TcpStream,
    peer_addr: SocketAddr,
    context: &ConnectionContext,
) -> Result<()> {
    let timeout = context.config.request_timeout;
    let head = match tokio::time::timeout(
        timeout,
        read_head(&mut socket, context.config.max_request_size),
    )
    .await
    {
        Ok(Ok(head)) => head,
        Ok(Err(e)) => {
            let _ = respond(&mut socket, "400 Bad Request", "", b"Bad request\n").await;
            return Err(e);
        }
        Err(_) => return Err(RequestError::Timeout(timeout).into()),
    };

    tracing::debug!(
        peer = %peer_addr,
        method = ?head.method,
        path = %head.path,
        "Request"
    );

    let registry = &context.registry;
    match request::route(&head, &context.default_interface) {
        Route::Stream(_) if head.method == Method::Head => {
            socket.write_all(&registry.response_header()).await?;
        }
        Route::Stream(params) => {
            if registry.is_closed() {
                respond(&mut socket, "503 Service Unavailable", "", b"").await?;
                return Ok(());
            }

            let info = ClientInfo {
                peer: peer_addr,
                real_addr: head.real_ip,
                user_agent: head.user_agent,
            };
            let attach = registry.attach(socket.into_std()?, params, info)?;
            match attach.await {
                Ok(Ok(attached)) => tracing::debug!(
                    peer = %peer_addr,
                    channel = %attached.key,
                    worker = attached.worker,
                    created = attached.created,
                    "Client handed over"
                ),
                Ok(Err(e)) => return Err(e),
                Err(_) => tracing::debug!(peer = %peer_addr, "Worker stopped before attach"),
            }
        }
        Route::Status => {
            let body = registry.render_summary()?;
            respond(&mut socket, "200 OK", "", &body).await?;
        }
        Route::ChannelStatus => {
            let body = registry.render_channels().await?;
            respond(&mut socket, "200 OK", "", &body).await?;
        }
        Route::NotFound => respond(&mut socket, "404 Not Found", "", b"Not found\n").await?,
        Route::BadRequest(reason) => {
            let body = format!("{}\n", reason);
            respond(&mut socket, "400 Bad Request", "", body.as_bytes()).await?;
        }
        Route::MethodNotAllowed => {
            respond(
                &mut socket,
                "405 Method Not Allowed",
                "Allow: GET, HEAD\r\n",
                b"Method not allowed\n",
            )
            .await?
        }
    }

    Ok(())
}

/// Read until the blank line ending the request head
async fn read_head(socket: &mut TcpStream, limit: usize) -> Result<RequestHead> {
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some(head) = RequestHead::parse_partial(&buf)? {
            return Ok(head);
        }
        if buf.len() >= limit {
            return Err(RequestError::TooLarge(limit).into());
        }
        if socket.read_buf(&mut buf).await? == 0 {
            return Err(RequestError::Incomplete.into());
        }
    }
}

/// Complete plain-text response, then close
fn render_response(status: &str, extra_headers: &str, body: &[u8]) -> Result<Bytes> {
    let mut out = BytesMut::with_capacity(128 + body.len());
    write!(
        out,
        "HTTP/1.1 {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n{}\r\n",
        status,
        body.len(),
        extra_headers
    )?;
    out.extend_from_slice(body);
    Ok(out.freeze())
}

async fn respond(socket: &mut TcpStream, status: &str, extra_headers: &str, body: &[u8]) -> Result<()> {
    let response = render_response(status, extra_headers, body)?;
    socket.write_all(&response).await?;
    socket.shutdown().await?;
    Ok(())
}
