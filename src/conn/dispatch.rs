use std::fs::File;
use std::io;

use compact_str::{CompactString, ToCompactString};
use smallvec::SmallVec;

use super::Connection;
use crate::ext::{retry_eintr, NonBlocking};
use crate::pool::{Pool, PoolSlice};
use crate::request::{Parse, Progress, Request};
use crate::response::{reason_phrase, write_head};
use crate::sys::Sys;
use crate::timeout::TimerQueue;
use crate::Error;


/// The protocol phase a [`Connection`] is in.
///
/// Every readiness event is dispatched on the current phase by
/// `Connection::on_ready`. The default phase closes the connection, so a
/// connection nobody installed a phase for fails closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, strum::IntoStaticStr)]
#[cfg_attr(test, derive(strum::EnumIter))]
#[strum(serialize_all = "snake_case")]
pub enum Phase {
    /// Receiving and parsing the request line and header block.
    ReadRequest,
    /// Sending the serialized response head.
    WriteHeaders,
    /// Sending the response body.
    WriteBody,
    /// Closing the connection on the next dispatch.
    #[default]
    Close,
}


bitflags::bitflags! {
    /// The readiness conditions reported for a socket.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Ready: u8 {
        /// The socket has data to read, or the peer shut down writing.
        const READABLE = 1 << 0;
        /// The socket accepts more data.
        const WRITABLE = 1 << 1;
        /// The peer hung up.
        const HANGUP = 1 << 2;
        /// An error condition is pending on the socket.
        const ERROR = 1 << 3;
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl Ready {
    /// Translates an `epoll_event.events` mask.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn from_epoll(events: u32) -> Self {
        let mut ready = Self::empty();
        ready.set(Self::READABLE, events & (libc::EPOLLIN | libc::EPOLLRDHUP) as u32 != 0);
        ready.set(Self::WRITABLE, events & libc::EPOLLOUT as u32 != 0);
        ready.set(Self::HANGUP, events & libc::EPOLLHUP as u32 != 0);
        ready.set(Self::ERROR, events & libc::EPOLLERR as u32 != 0);
        ready
    }
}


/// What the event loop has to do after `Connection::on_ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use]
pub enum Outcome {
    /// The connection waits for further readiness events.
    Pending,
    /// The connection was closed. It must be removed from the loop.
    Closed,
}


/// The response-composition logic, as seen by a [`Connection`].
///
/// Invoked once per complete request. Header values can be looked up with
/// `Request::header` over `buf`.
pub trait Respond<S: Sys> {
    /// Composes the response to `req` into `res`.
    ///
    /// # Errors
    /// Any error closes the connection without a response.
    fn respond(&mut self, req: &Request, buf: &[u8], res: &mut ResponseBuilder<'_, S>) -> io::Result<()>;
}

impl<S: Sys, R: Respond<S> + ?Sized> Respond<S> for &mut R {
    #[inline]
    fn respond(&mut self, req: &Request, buf: &[u8], res: &mut ResponseBuilder<'_, S>) -> io::Result<()> {
        (**self).respond(req, buf, res)
    }
}


/// A response under construction.
///
/// The status defaults to `200 OK` and the body to empty. `Server`,
/// `Content-Length` and `Connection` headers are added automatically when the
/// response is finished. The body is either a byte string, which is copied
/// into the connection's [`Pool`] right behind the head, or a memory-mapped
/// file.
pub struct ResponseBuilder<'c, S: Sys> {
    sys: &'c mut S,
    status: u16,
    headers: SmallVec<[(CompactString, CompactString); 8]>,
    inline: Vec<u8>,
    file: Option<S::Map>,
    file_size: usize,
    keep_alive: bool,
}

/// A finished response, ready to be attached to a [`Connection`].
struct Prepared<M> {
    head: PoolSlice,
    head_len: usize,
    file: Option<M>,
    file_size: usize,
    keep_alive: bool,
}

impl<'c, S: Sys> ResponseBuilder<'c, S> {
    pub(crate) fn new(sys: &'c mut S, keep_alive: bool) -> Self {
        Self {
            sys,
            status: 200,
            headers: SmallVec::new(),
            inline: Vec::new(),
            file: None,
            file_size: 0,
            keep_alive,
        }
    }

    /// Sets the status code.
    ///
    /// # Panics
    /// Panics if `status` is not a three-digit code.
    pub fn status(&mut self, status: u16) -> &mut Self {
        assert!((100..1000).contains(&status), "status code must have three digits");
        self.status = status;
        self
    }

    /// Appends a response header.
    pub fn header(&mut self, name: &str, value: &str) -> &mut Self {
        debug_assert!(
            !["server", "content-length", "connection"].iter().any(|n| name.eq_ignore_ascii_case(n)),
            "header `{name}` is set automatically",
        );
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Overrides whether the connection stays open after this response.
    ///
    /// The default follows the request's protocol version and `Connection`
    /// header.
    pub fn keep_alive(&mut self, keep_alive: bool) -> &mut Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Tests whether the connection stays open after this response.
    #[inline]
    #[must_use]
    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Uses `data` as the response body, replacing any previous body.
    ///
    /// # Errors
    /// Fails only if a previously attached file cannot be unmapped.
    pub fn body(&mut self, data: &[u8]) -> io::Result<&mut Self> {
        self.drop_file()?;
        self.inline.clear();
        self.inline.extend_from_slice(data);
        Ok(self)
    }

    /// Uses the first `len` bytes of `file` as the response body, replacing
    /// any previous body.
    ///
    /// The file is memory-mapped and sent straight from the mapping. An
    /// empty file is not mapped at all.
    ///
    /// # Errors
    /// Returns [`io::ErrorKind::InvalidInput`] if `file` is shorter than
    /// `len`, leaving any previous body in place. Otherwise forwards errors
    /// from querying the file size, from `Sys::map_file`, and from unmapping
    /// a previously attached file.
    pub fn body_file(&mut self, file: &File, len: usize) -> io::Result<&mut Self> {
        let available = file.metadata()?.len();
        if u64::try_from(len).map_or(true, |len| len > available) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("body length {len} exceeds file size {available}"),
            ));
        }
        self.drop_file()?;
        self.inline.clear();
        if len > 0 {
            self.file = Some(self.sys.map_file(file, len)?);
            self.file_size = len;
        }
        Ok(self)
    }

    fn drop_file(&mut self) -> io::Result<()> {
        let size = std::mem::take(&mut self.file_size);
        match self.file.take() {
            Some(map) if size > 0 => self.sys.unmap(map),
            _ => Ok(()),
        }
    }

    /// Releases the mapped body of a response that will not be sent.
    pub(crate) fn abort(mut self) {
        if let Err(e) = self.drop_file() {
            tracing::error!(error = %e, "unmapping abandoned response body failed");
        }
    }

    /// Serializes the head, plus any inline body, into `pool`.
    fn finish(mut self, pool: &mut Pool, server_name: &str) -> Result<Prepared<S::Map>, Error> {
        let content_length = (self.inline.len() + self.file_size).to_compact_string();
        let connection: &[u8] = if self.keep_alive { b"keep-alive" } else { b"close" };
        let automatic: [(&[u8], &[u8]); 3] = [
            (b"Server", server_name.as_bytes()),
            (b"Content-Length", content_length.as_bytes()),
            (b"Connection", connection),
        ];
        let headers = self.headers.iter()
            .map(|(n, v)| (n.as_bytes(), v.as_bytes()))
            .chain(automatic);

        let mut head: SmallVec<[u8; 512]> = SmallVec::new();
        if let Err(e) = write_head(&mut head, self.status, reason_phrase(self.status), headers) {
            self.abort();
            return Err(Error::Respond(e));
        }
        head.extend_from_slice(&self.inline);

        Ok(Prepared {
            head: pool.alloc_copy(&head),
            head_len: head.len(),
            file: self.file.take(),
            file_size: self.file_size,
            keep_alive: self.keep_alive,
        })
    }
}


/// Tests whether `token` is an element of a comma-separated header value.
fn has_token(value: &[u8], token: &[u8]) -> bool {
    let ows = |b: &u8| !matches!(b, b' ' | b'\t');
    value.split(|&b| b == b',').any(|t| {
        let start = t.iter().position(ows).unwrap_or(t.len());
        let end = t.iter().rposition(ows).map_or(start, |p| p + 1);
        t[start..end].eq_ignore_ascii_case(token)
    })
}

/// Decides the default persistence of the connection (RFC 9112, Section 9.3).
fn wants_keep_alive(req: &Request, buf: &[u8]) -> bool {
    let connection = req.header(buf, "Connection").map_or(&b""[..], |s| s.get(buf));
    if has_token(connection, b"close") {
        false
    } else if req.proto.get(buf) == b"HTTP/1.0" {
        has_token(connection, b"keep-alive")
    } else {
        true
    }
}


enum Step {
    Pending,
    Done,
    Eof,
}

impl<M: AsRef<[u8]>> Connection<M> {
    /// Drives the connection after a readiness event.
    ///
    /// This is the single control routine of the connection: it dispatches on
    /// the current [`Phase`] and keeps going until the socket would block or
    /// the connection ends. Read and write errors, protocol errors and an
    /// exhausted receive buffer all close the connection, as does
    /// [`Phase::Close`]. A drained keep-alive connection is reset and starts
    /// over in [`Phase::ReadRequest`].
    pub fn on_ready<S, P, R>(
        &mut self,
        ready: Ready,
        sys: &mut S,
        timers: &mut TimerQueue,
        parser: &mut P,
        responder: &mut R,
    ) -> Outcome
    where
        S: Sys<Map = M>,
        P: Parse + ?Sized,
        R: Respond<S> + ?Sized,
    {
        match self.drive(ready, sys, parser, responder) {
            Ok(Phase::Close) => {},
            Ok(_) => return Outcome::Pending,
            Err(Error::PeerClosed) => tracing::debug!(fd = self.fd, "peer closed mid-request"),
            Err(e) => tracing::warn!(fd = self.fd, phase = <&str>::from(self.phase), error = %e, "connection failed"),
        }
        self.close(sys, timers);
        Outcome::Closed
    }

    fn drive<S, P, R>(&mut self, ready: Ready, sys: &mut S, parser: &mut P, responder: &mut R) -> Result<Phase, Error>
    where
        S: Sys<Map = M>,
        P: Parse + ?Sized,
        R: Respond<S> + ?Sized,
    {
        if ready.contains(Ready::ERROR) {
            return Err(Error::Io(io::Error::new(io::ErrorKind::ConnectionReset, "error condition on socket")));
        }
        if ready.contains(Ready::HANGUP) && !ready.contains(Ready::READABLE) {
            tracing::debug!(fd = self.fd, "peer hung up");
            return Ok(Phase::Close);
        }

        loop {
            crate::macros::trace!(fd = self.fd, phase = <&str>::from(self.phase), "dispatch");
            match self.phase {
                Phase::Close => return Ok(Phase::Close),
                Phase::ReadRequest => match self.read_request(sys, parser)? {
                    Step::Pending => return Ok(Phase::ReadRequest),
                    Step::Eof => return Ok(Phase::Close),
                    Step::Done => {
                        self.respond(sys, responder)?;
                        self.phase = Phase::WriteHeaders;
                    },
                },
                Phase::WriteHeaders => match self.send_head(sys)? {
                    Step::Pending => return Ok(Phase::WriteHeaders),
                    _ => self.phase = Phase::WriteBody,
                },
                Phase::WriteBody => match self.send_body(sys)? {
                    Step::Pending => return Ok(Phase::WriteBody),
                    _ => self.phase = self.finish_response(sys)?,
                },
            }
        }
    }

    fn read_request<S, P>(&mut self, sys: &mut S, parser: &mut P) -> Result<Step, Error>
    where
        S: Sys<Map = M>,
        P: Parse + ?Sized,
    {
        // Bytes left over from the previous request are parsed before reading
        if std::mem::take(&mut self.pipelined)
            && parser.parse(&mut self.request, &self.buf)? == Progress::Complete
        {
            return Ok(Step::Done);
        }

        let fd = self.fd;
        loop {
            if self.remain == 0 {
                return Err(Error::RequestTooLarge { capacity: self.buf.len() });
            }

            let pos = self.buf_pos;
            let buf = &mut self.buf[pos..];
            let n = match retry_eintr(|| sys.read(fd, buf)).nonblocking()? {
                None => return Ok(Step::Pending),
                Some(0) if pos == 0 => return Ok(Step::Eof),
                Some(0) => return Err(Error::PeerClosed),
                Some(n) => n,
            };
            crate::macros::trace!(fd, bytes = n, "request bytes received");
            self.buf_pos += n;
            self.remain -= n;
            self.request.received(n);

            if parser.parse(&mut self.request, &self.buf)? == Progress::Complete {
                return Ok(Step::Done);
            }
        }
    }

    fn respond<S, R>(&mut self, sys: &mut S, responder: &mut R) -> Result<(), Error>
    where
        S: Sys<Map = M>,
        R: Respond<S> + ?Sized,
    {
        let keep_alive = wants_keep_alive(&self.request, &self.buf);
        let mut res = ResponseBuilder::new(sys, keep_alive);
        if let Err(e) = responder.respond(&self.request, &self.buf, &mut res) {
            res.abort();
            return Err(Error::Respond(e));
        }
        let prepared = res.finish(&mut self.pool, &self.server_name)?;
        tracing::debug!(
            fd = self.fd,
            method = %self.request.method.get(&self.buf).escape_ascii(),
            uri = %self.request.uri.get(&self.buf).escape_ascii(),
            head = prepared.head_len,
            file = prepared.file_size,
            keep_alive = prepared.keep_alive,
            "response prepared",
        );

        self.resp_head = Some(prepared.head);
        self.resp_head_pos = 0;
        self.resp_head_left = prepared.head_len;
        self.resp_body = prepared.file;
        self.resp_body_pos = 0;
        self.resp_body_left = prepared.file_size;
        self.resp_file_size = prepared.file_size;
        self.keep_alive = prepared.keep_alive;
        Ok(())
    }

    fn send_head<S: Sys<Map = M>>(&mut self, sys: &mut S) -> Result<Step, Error> {
        let Some(head) = self.resp_head else { return Ok(Step::Done); };
        let fd = self.fd;
        while self.resp_head_left > 0 {
            let bytes = self.pool.get(head).ok_or_else(|| {
                Error::Respond(io::Error::new(io::ErrorKind::InvalidData, "response head invalidated"))
            })?;
            let chunk = &bytes[self.resp_head_pos..];
            match retry_eintr(|| sys.write(fd, chunk)).nonblocking()? {
                None => return Ok(Step::Pending),
                Some(0) => return Err(Error::Io(io::ErrorKind::WriteZero.into())),
                Some(n) => {
                    crate::macros::trace!(fd, bytes = n, "response head sent");
                    self.resp_head_pos += n;
                    self.resp_head_left -= n;
                },
            }
        }
        Ok(Step::Done)
    }

    fn send_body<S: Sys<Map = M>>(&mut self, sys: &mut S) -> Result<Step, Error> {
        let Some(body) = &self.resp_body else { return Ok(Step::Done); };
        let fd = self.fd;
        while self.resp_body_left > 0 {
            let bytes = body.as_ref();
            let end = bytes.len().min(self.resp_file_size);
            let chunk = bytes.get(self.resp_body_pos..end).unwrap_or_default();
            if chunk.is_empty() {
                return Err(Error::Respond(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "mapped body is shorter than its announced length",
                )));
            }
            match retry_eintr(|| sys.write(fd, chunk)).nonblocking()? {
                None => return Ok(Step::Pending),
                Some(0) => return Err(Error::Io(io::ErrorKind::WriteZero.into())),
                Some(n) => {
                    crate::macros::trace!(fd, bytes = n, "response body sent");
                    self.resp_body_pos += n;
                    self.resp_body_left -= n;
                },
            }
        }
        Ok(Step::Done)
    }

    /// Releases the sent response and picks the next phase.
    fn finish_response<S: Sys<Map = M>>(&mut self, sys: &mut S) -> Result<Phase, Error> {
        let size = std::mem::take(&mut self.resp_file_size);
        if let Some(body) = self.resp_body.take() {
            if size > 0 {
                sys.unmap(body)?;
            }
        }
        if !self.keep_alive {
            return Ok(Phase::Close);
        }

        let carry: SmallVec<[u8; 256]> = SmallVec::from_slice(self.request.unparsed(&self.buf));
        self.reset(sys);
        self.served += 1;
        if !carry.is_empty() {
            self.buf[..carry.len()].copy_from_slice(&carry);
            self.buf_pos = carry.len();
            self.remain -= carry.len();
            self.request.received(carry.len());
            self.pipelined = true;
        }
        Ok(Phase::ReadRequest)
    }
}
