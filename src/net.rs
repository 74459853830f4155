use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};

use socket2::{Domain, Protocol, Socket, Type};


/// The maximum length of the pending-connection queue of listening sockets.
pub const BACKLOG: i32 = 1024;


/// Opens a TCP listener on `addr` with `SO_REUSEADDR` and the given backlog.
///
/// The listener is left in blocking mode. Call
/// [`TcpListener::set_nonblocking`] before registering it with a readiness
/// loop.
///
/// # Errors
/// Forwards any error from creating, configuring, binding or listening on
/// the socket.
pub fn listen(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    let listener: TcpListener = socket.into();
    let local = listener.local_addr()?;
    tracing::debug!(%local, backlog, "listening");
    Ok(listener)
}

/// Opens a TCP listener on all IPv4 interfaces at `port`.
///
/// Port 0 picks an ephemeral port, see [`TcpListener::local_addr`].
///
/// # Errors
/// See [`listen`].
#[inline]
pub fn open_listenfd(port: u16) -> io::Result<TcpListener> {
    listen(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)), BACKLOG)
}

/// Connects to `host` at `port`.
///
/// Every address `host` resolves to is tried in turn. The first successful
/// connection is returned.
///
/// # Errors
/// Returns the resolver error, or the error of the last failed connection
/// attempt. [`io::ErrorKind::NotFound`] is returned if `host` resolves to
/// no addresses at all.
pub fn open_clientfd(host: &str, port: u16) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                tracing::debug!(peer = %addr, "connected");
                return Ok(stream);
            },
            Err(e) => {
                tracing::debug!(peer = %addr, error = %e, "connection attempt failed");
                last_err = Some(e);
            },
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")
    }))
}
