//! Socket construction helpers.
//!
//! Listeners are built as blocking-API `std` sockets at startup so bind
//! and listen failures surface before any worker thread exists; the
//! acceptor promotes them onto its reactor. Outbound connections are
//! non-blocking from the start and connect asynchronously.

use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpSocket, TcpStream};

/// Listen backlog for every relay listener.
pub const LISTEN_BACKLOG: i32 = 1024;

/// Create a non-blocking listening socket bound to `addr`.
pub fn create_listener(addr: SocketAddr, reuse_addr: bool) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if reuse_addr {
        socket.set_reuse_address(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

/// Open a connection to `dst`, optionally bound to `src` first.
///
/// A `src` port of 0 binds the address and lets the OS pick the port. The
/// connect is asynchronous; the socket is non-blocking before it is ever
/// handed to the forwarding engine.
pub async fn create_connection(
    src: Option<SocketAddr>,
    dst: SocketAddr,
) -> io::Result<TcpStream> {
    let socket = match dst {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    if let Some(src) = src {
        socket.bind(src)?;
    }
    socket.connect(dst).await
}
