use std::os::fd::RawFd;

use compact_str::CompactString;

use crate::header::HeaderName;
use crate::pool::{Pool, PoolSlice};
use crate::request::Request;
use crate::sys::{MappedRegion, Sys};
use crate::timeout::{TimerHandle, TimerQueue};
use crate::Config;

mod dispatch;
mod table;

pub use dispatch::{Outcome, Phase, Ready, Respond, ResponseBuilder};
pub use table::{ConnId, Connections};


/// The live state of one accepted client socket.
///
/// A [`Connection`] owns its receive buffer, the in-flight [`Request`] whose
/// [`Span`](crate::Span)s point into that buffer, the pending response and a
/// [`Pool`] for response-time allocations. It also holds a weak
/// [`TimerHandle`] into the shared [`TimerQueue`].
///
/// The lifecycle consists of three entry points: `Connection::new` on
/// accept, `Connection::reset` between requests on a keep-alive connection
/// and `Connection::close` on termination. The storage of the [`Connection`]
/// itself outlives `close`; it belongs to whoever created it, usually
/// [`Connections`].
///
/// `M` is the type of memory-mapped response bodies, see [`Sys::Map`].
#[derive(Debug)]
pub struct Connection<M = MappedRegion> {
    fd: RawFd,
    epfd: RawFd,
    pool: Pool,
    server_name: CompactString,

    buf: Box<[u8]>,
    buf_pos: usize,
    remain: usize,
    request: Request,
    pipelined: bool,

    resp_head: Option<PoolSlice>,
    resp_head_pos: usize,
    resp_head_left: usize,
    resp_body: Option<M>,
    resp_body_pos: usize,
    resp_body_left: usize,
    resp_file_size: usize,
    keep_alive: bool,

    phase: Phase,
    served: u64,
    timer: Option<TimerHandle>,
}

impl<M> Connection<M> {
    /// Creates a [`Connection`] for the freshly accepted socket `fd`, which is
    /// registered with the readiness group `epfd`.
    ///
    /// The connection starts in [`Phase::Close`] without a timeout node. The
    /// event loop installs the first real phase with `Connection::set_phase`.
    #[must_use]
    pub fn new(fd: RawFd, epfd: RawFd, config: &Config) -> Self {
        Self::with_pool(fd, epfd, config, Pool::new(config.pool_size))
    }

    /// Like `Connection::new`, but reuses the [`Pool`] of a previous
    /// connection.
    #[must_use]
    pub fn with_pool(fd: RawFd, epfd: RawFd, config: &Config, pool: Pool) -> Self {
        let capacity = config.aligned_bufsize();
        tracing::debug!(fd, capacity, "connection created");
        Self {
            fd,
            epfd,
            pool,
            server_name: config.server_name.clone(),

            buf: vec![0; capacity].into_boxed_slice(),
            buf_pos: 0,
            remain: capacity,
            request: Request::new(),
            pipelined: false,

            resp_head: None,
            resp_head_pos: 0,
            resp_head_left: 0,
            resp_body: None,
            resp_body_pos: 0,
            resp_body_left: 0,
            resp_file_size: 0,
            keep_alive: false,

            phase: Phase::default(),
            served: 0,
            timer: None,
        }
    }

    /// Prepares a drained keep-alive connection for its next request.
    ///
    /// The receive buffer is zeroed, the [`Request`] re-initialized and its
    /// header storage released, all response state cleared and the pool
    /// reset. A still attached body of an abandoned response is unmapped
    /// through `sys` if its size is positive; a failure is logged. The phase
    /// falls back to [`Phase::Close`].
    ///
    /// The timeout node is deliberately left alone: the connection keeps its
    /// place (or lack of one) in the [`TimerQueue`].
    pub fn reset<S: Sys<Map = M>>(&mut self, sys: &mut S) {
        self.buf.fill(0);
        self.buf_pos = 0;
        self.remain = self.buf.len();

        self.request.init();
        self.request.headers_mut().release();
        self.pipelined = false;

        self.resp_head = None;
        self.resp_head_pos = 0;
        self.resp_head_left = 0;
        self.release_body(sys);
        self.resp_body_pos = 0;
        self.keep_alive = false;
        self.pool.reset();

        self.phase = Phase::Close;
        tracing::debug!(fd = self.fd, "connection reset");
    }

    /// Closes the connection and releases everything it holds.
    ///
    /// In order, this closes the socket, clears the payload of the timeout
    /// node and unmaps the response body if one is mapped with a positive
    /// size. Failures are logged and do not stop the sequence; the connection
    /// counts as closed regardless. A missing timeout node is logged as a
    /// warning. The node itself stays queued and the handle is kept, so the
    /// [`TimerQueue`] can harvest the node on its own schedule.
    ///
    /// Closing an already closed connection would close its descriptor twice
    /// and must not be done.
    pub fn close<S: Sys<Map = M>>(&mut self, sys: &mut S, timers: &mut TimerQueue) {
        let fd = self.fd;
        if let Err(e) = sys.close(fd) {
            tracing::error!(fd, error = %e, "closing connection socket failed");
        }
        tracing::debug!(fd, served = self.served, "connection closed");

        match self.timer {
            None => tracing::warn!(fd, "closed connection had no timeout node"),
            Some(handle) => {
                if !timers.clear_data(handle) {
                    crate::macros::trace!(fd, "timeout node already harvested");
                }
            },
        }

        self.release_body(sys);

        self.request.headers_mut().release();
        self.resp_head = None;
        self.resp_head_left = 0;
        self.phase = Phase::Close;
    }

    /// Unmaps the response body if one is mapped with a positive size.
    fn release_body<S: Sys<Map = M>>(&mut self, sys: &mut S) {
        let size = std::mem::take(&mut self.resp_file_size);
        self.resp_body_left = 0;
        if let Some(body) = self.resp_body.take() {
            if size > 0 {
                if let Err(e) = sys.unmap(body) {
                    tracing::error!(fd = self.fd, size, error = %e, "unmapping response body failed");
                }
            }
        }
    }

    /// Returns the value of the first request header named `name`.
    ///
    /// Names are matched case-insensitively. A miss is not an error.
    #[must_use]
    pub fn header<'i, S>(&self, name: S) -> Option<&[u8]>
    where
        S: Into<&'i HeaderName>,
    {
        self.request.header(&self.buf, name).map(|s| s.get(&self.buf))
    }

    /// Queues a new timeout node for this connection at `deadline`.
    ///
    /// The payload of the previous node, if any, is cleared first so that
    /// its expiry no longer refers to this connection.
    pub fn arm_timer(&mut self, timers: &mut TimerQueue, deadline: std::time::Instant, id: ConnId) {
        if let Some(old) = self.timer {
            timers.clear_data(old);
        }
        self.timer = Some(timers.insert(deadline, id));
    }

    /// Replaces the timeout handle and returns the previous one.
    #[inline]
    pub fn set_timer(&mut self, timer: Option<TimerHandle>) -> Option<TimerHandle> {
        std::mem::replace(&mut self.timer, timer)
    }

    /// Returns the handle of the connection's timeout node.
    #[inline]
    #[must_use]
    pub fn timer(&self) -> Option<TimerHandle> {
        self.timer
    }

    /// Installs the phase the next readiness event is dispatched to.
    #[inline]
    pub fn set_phase(&mut self, phase: Phase) {
        crate::macros::trace!(fd = self.fd, ?phase, "phase installed");
        self.phase = phase;
    }

    /// Returns the current phase.
    #[inline]
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Returns the connection's socket.
    #[inline]
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Returns the readiness group the socket is registered with.
    #[inline]
    #[must_use]
    pub fn epfd(&self) -> RawFd {
        self.epfd
    }

    /// Returns the in-flight request.
    #[inline]
    #[must_use]
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Returns the receive buffer, including its unused tail.
    #[inline]
    #[must_use]
    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    /// Returns the capacity of the receive buffer.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Returns the number of bytes still free in the receive buffer.
    #[inline]
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.remain
    }

    /// Returns the connection's allocation pool.
    #[inline]
    #[must_use]
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Returns the number of requests completed on this connection.
    #[inline]
    #[must_use]
    pub fn served(&self) -> u64 {
        self.served
    }

    /// Tests whether a response body is currently attached.
    #[inline]
    #[must_use]
    pub fn has_body(&self) -> bool {
        self.resp_body.is_some()
    }

    /// Consumes the connection and returns its [`Pool`] for reuse.
    pub(crate) fn into_pool(mut self) -> Pool {
        self.pool.reset();
        self.pool
    }
}
