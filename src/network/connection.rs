//! TCP socket setup
//!
//! Sockets are built with socket2 so buffer sizes, `TCP_NODELAY` and the
//! reuse flags are applied before connect/bind, then handed to std as
//! blocking streams.

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::pipeline::CancelToken;

fn resolve(endpoint: &str) -> Result<Vec<SocketAddr>, String> {
    let addrs: Vec<SocketAddr> = endpoint
        .to_socket_addrs()
        .map_err(|e| e.to_string())?
        .collect();
    if addrs.is_empty() {
        return Err("no addresses resolved".into());
    }
    Ok(addrs)
}

/// Apply buffer sizes and `TCP_NODELAY` to a connected stream
pub fn configure_stream(stream: &TcpStream, config: &NetworkConfig) -> std::io::Result<()> {
    let sock = SockRef::from(stream);
    sock.set_nodelay(config.nodelay)?;
    if config.socket_buffer_size > 0 {
        sock.set_send_buffer_size(config.socket_buffer_size)?;
        sock.set_recv_buffer_size(config.socket_buffer_size)?;
    }
    Ok(())
}

/// Dial the configured endpoint, trying each resolved address once
pub fn connect(config: &NetworkConfig) -> Result<TcpStream, NetworkError> {
    let endpoint = config.endpoint();
    let failed = |reason: String| NetworkError::ConnectionFailed {
        addr: endpoint.clone(),
        reason,
    };

    let mut last_error = String::new();
    for addr in resolve(&endpoint).map_err(&failed)? {
        match dial(addr, config) {
            Ok(stream) => {
                info!("Connected to {}", addr);
                return Ok(stream);
            }
            Err(e) => {
                debug!("Connect to {} failed: {}", addr, e);
                last_error = e.to_string();
            }
        }
    }
    Err(failed(last_error))
}

fn dial(addr: SocketAddr, config: &NetworkConfig) -> std::io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nodelay(config.nodelay)?;
    if config.socket_buffer_size > 0 {
        socket.set_send_buffer_size(config.socket_buffer_size)?;
        socket.set_recv_buffer_size(config.socket_buffer_size)?;
    }
    socket.connect_timeout(&addr.into(), config.connect_timeout())?;
    Ok(socket.into())
}

/// Bind a single-connection listener on the configured endpoint
pub fn listen(config: &NetworkConfig) -> Result<TcpListener, NetworkError> {
    let endpoint = config.endpoint();
    let failed = |reason: String| NetworkError::BindFailed {
        addr: endpoint.clone(),
        reason,
    };

    let addr = resolve(&endpoint).map_err(&failed)?[0];
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| failed(format!("socket(): {}", e)))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| failed(format!("SO_REUSEADDR: {}", e)))?;
    #[cfg(unix)]
    socket
        .set_reuse_port(true)
        .map_err(|e| failed(format!("SO_REUSEPORT: {}", e)))?;
    socket
        .bind(&addr.into())
        .map_err(|e| failed(format!("bind(): {}", e)))?;
    socket
        .listen(1)
        .map_err(|e| failed(format!("listen(): {}", e)))?;

    Ok(socket.into())
}

/// Wait for one connection, checking `cancel` every `poll_interval`
///
/// Returns `Ok(None)` when cancelled before a peer arrived.
pub fn accept_cancellable(
    listener: &TcpListener,
    cancel: &CancelToken,
    poll_interval: Duration,
) -> Result<Option<(TcpStream, SocketAddr)>, NetworkError> {
    listener
        .set_nonblocking(true)
        .map_err(|e| NetworkError::ReceiveFailed(e.to_string()))?;

    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                stream
                    .set_nonblocking(false)
                    .map_err(|e| NetworkError::ReceiveFailed(e.to_string()))?;
                return Ok(Some((stream, peer)));
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                if !cancel.sleep(poll_interval) {
                    return Ok(None);
                }
            }
            Err(e) => return Err(NetworkError::ReceiveFailed(e.to_string())),
        }
    }
}
