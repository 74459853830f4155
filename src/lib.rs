// TODO(docs): #![deny(missing_docs)]
#![deny(unsafe_code, single_use_lifetimes, unused_lifetimes)]
#![warn(keyword_idents, let_underscore_drop, unreachable_pub, unused_import_braces)]

#![deny(clippy::suspicious, clippy::cargo)]
#![deny(clippy::exit, clippy::semicolon_inside_block, clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::multiple_crate_versions)]
#![allow(clippy::enum_glob_use, clippy::items_after_statements, clippy::module_name_repetitions)]

use std::num::NonZeroU32;
use std::time::Duration;

use compact_str::CompactString;


/// Helpful extension traits shared across the crate.
pub(crate) mod ext;
pub(crate) mod macros;

/// The operating system seam: file descriptors and memory-mapped files.
pub mod sys;

/// A per-connection bump arena for response-time allocations.
pub mod pool;

mod span;
pub use span::Span;

/// Request header storage and case-insensitive lookup.
pub mod header;

/// The in-flight HTTP request and the contract of the external parser.
pub mod request;

/// Deadline-ordered timeout queue with weak connection back-references.
pub mod timeout;

/// The per-connection state machine and its lifecycle.
pub mod conn;

/// HTTP/1.1 response head serialization.
pub mod response;

/// Listening and client socket setup.
pub mod net;

pub use conn::{ConnId, Connection, Connections, Outcome, Phase, Ready, Respond, ResponseBuilder};
pub use request::{Parse, ParseError, Progress, Request};


/// The receive-buffer capacity used when [`Config`] is not customized.
pub const DEFAULT_BUF_SIZE: usize = 8192;
/// The arena chunk size used when [`Config`] is not customized.
pub const DEFAULT_POOL_SIZE: usize = 4096;
/// The smallest receive buffer a [`Connection`] will allocate.
const MIN_BUF_SIZE: usize = 512;


/// Startup configuration shared by all connections.
///
/// The buffer and pool sizes are runtime values (rather than constants) so
/// that tests can exercise buffer exhaustion with tiny connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Capacity of each connection's receive buffer, in bytes.
    pub buffer_size: usize,
    /// Chunk size of each connection's [`Pool`](pool::Pool), in bytes.
    pub pool_size: usize,
    /// Maximum length of the pending-connection queue of listening sockets.
    pub backlog: i32,
    /// Idle deadline for connections waiting on their next request.
    pub keep_alive: Duration,
    /// Maximum number of simultaneously open connections.
    pub max_conns: NonZeroU32,
    /// Value of the `Server` response header.
    pub server_name: CompactString,
}

impl Default for Config {
    fn default() -> Self {
        Self::with_conns(NonZeroU32::MIN.saturating_add(1023))
    }
}

impl Config {
    /// Creates a default [`Config`] accepting at most `max_conns` connections.
    #[must_use]
    pub fn with_conns(max_conns: NonZeroU32) -> Self {
        Self {
            buffer_size: DEFAULT_BUF_SIZE,
            pool_size: DEFAULT_POOL_SIZE,
            backlog: net::BACKLOG,
            keep_alive: Duration::from_secs(60),
            max_conns,
            server_name: CompactString::const_new(concat!(
                env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),
            )),
        }
    }

    /// Opens a listener on all IPv4 interfaces at `port`, using the
    /// configured backlog.
    ///
    /// # Errors
    /// See [`net::listen`].
    pub fn listen(&self, port: u16) -> std::io::Result<std::net::TcpListener> {
        let addr = std::net::SocketAddr::from((std::net::Ipv4Addr::UNSPECIFIED, port));
        net::listen(addr, self.backlog)
    }

    /// Returns the receive-buffer size actually allocated for `buffer_size`.
    ///
    /// Tiny values are raised to a minimum that still fits a short request
    /// line, and the result is rounded up to a multiple of 8.
    #[inline]
    #[must_use]
    pub fn aligned_bufsize(&self) -> usize {
        let size = std::cmp::max(self.buffer_size, MIN_BUF_SIZE);
        (size + 7) & !7
    }
}


/// Unrecoverable conditions that terminate a single connection.
///
/// None of these affect other connections. [`Connection::on_ready`] logs the
/// error and closes the connection before returning [`Outcome::Closed`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A non-blocking read or write on the connection failed.
    #[error("connection I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The receive buffer filled up before the request was complete.
    #[error("request does not fit into the {capacity} byte receive buffer")]
    RequestTooLarge {
        /// The capacity of the exhausted receive buffer.
        capacity: usize,
    },

    /// The external parser rejected the request bytes.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// The peer shut down its side of the connection mid-request.
    #[error("peer closed the connection")]
    PeerClosed,

    /// The response could not be composed.
    #[error("composing the response failed: {0}")]
    Respond(#[source] std::io::Error),
}


#[cfg(test)]
mod test_support;
