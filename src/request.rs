use crate::header::{HeaderName, HeaderTable};
use crate::Span;


/// The state of the external request parser.
///
/// The value is opaque to this crate. Only `ParseState::INITIAL` has a fixed
/// meaning: the parser has not consumed anything of the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ParseState(pub u8);

impl ParseState {
    /// The state of a freshly initialized [`Request`].
    pub const INITIAL: Self = Self(0);
}


/// The result of one successful `Parse::parse` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Progress {
    /// All buffered bytes were consumed, but the request is not complete yet.
    Incomplete,
    /// The request line and header block are complete.
    Complete,
}


/// An error type for requests the parser cannot make sense of.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed HTTP request at byte {offset}: {reason}")]
pub struct ParseError {
    /// Offset into the receive buffer at which parsing failed.
    pub offset: usize,
    /// A short, static description of the violation.
    pub reason: &'static str,
}


/// The HTTP request parser, as seen by a [`Connection`](crate::Connection).
///
/// A parser consumes `buf[req.cursor()..req.end()]`, advances the cursor with
/// `Request::advance` and records what it found as [`Span`]s into `buf`.
/// Incomplete input must be left unconsumed or tracked through
/// `Request::state`, because the next call sees the same buffer with more
/// bytes appended.
pub trait Parse {
    /// Parses as much of the buffered request as possible.
    ///
    /// # Errors
    /// Returns a [`ParseError`] if the input is not a valid HTTP request. The
    /// connection is closed in that case.
    fn parse(&mut self, req: &mut Request, buf: &[u8]) -> Result<Progress, ParseError>;
}

impl<P: Parse + ?Sized> Parse for &mut P {
    #[inline]
    fn parse(&mut self, req: &mut Request, buf: &[u8]) -> Result<Progress, ParseError> {
        (**self).parse(req, buf)
    }
}


/// The in-progress or completed parse result for one HTTP request.
///
/// A [`Request`] is owned by its [`Connection`](crate::Connection) and
/// re-initialized in place for every request on a keep-alive connection.
/// All [`Span`]s refer to the connection's receive buffer.
#[derive(Debug, Clone, Default)]
pub struct Request {
    /// The parser's own state.
    pub state: ParseState,
    pos: usize,
    last: usize,

    /// The request method, such as `GET`.
    pub method: Span,
    /// The request target without its query string.
    pub uri: Span,
    /// The protocol version, such as `HTTP/1.1`.
    pub proto: Span,
    /// The query string without the leading `?`, if any.
    pub query_string: Span,

    /// Name of a header field the parser has started but not yet finished.
    pub partial_name: Span,
    /// Value of a header field the parser has started but not yet finished.
    pub partial_value: Span,
    headers: HeaderTable,
}

impl Request {
    /// Creates an empty [`Request`].
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the [`Request`] to its initial, empty state.
    ///
    /// Safe to call any number of times. Header fields are forgotten, but
    /// their heap storage is kept; see `HeaderTable::release`.
    pub fn init(&mut self) {
        self.state = ParseState::INITIAL;
        self.pos = 0;
        self.last = 0;

        self.method = Span::EMPTY;
        self.uri = Span::EMPTY;
        self.proto = Span::EMPTY;
        self.query_string = Span::EMPTY;

        self.partial_name = Span::EMPTY;
        self.partial_value = Span::EMPTY;
        self.headers.clear();
    }

    /// Returns the offset of the first byte the parser has not consumed.
    #[inline]
    #[must_use]
    pub fn cursor(&self) -> usize {
        self.pos
    }

    /// Returns the offset one past the last received byte.
    #[inline]
    #[must_use]
    pub fn end(&self) -> usize {
        self.last
    }

    /// Returns the received but not yet consumed part of `buf`.
    #[inline]
    #[must_use]
    pub fn unparsed<'b>(&self, buf: &'b [u8]) -> &'b [u8] {
        buf.get(self.pos..self.last).unwrap_or_default()
    }

    /// Marks everything before `pos` as consumed.
    ///
    /// # Panics
    /// Panics if `pos` moves the cursor backwards or past `Request::end`.
    #[inline]
    pub fn advance(&mut self, pos: usize) {
        assert!(self.pos <= pos && pos <= self.last, "parser cursor out of bounds");
        self.pos = pos;
    }

    /// Records `n` freshly received bytes after `Request::end`.
    #[inline]
    pub(crate) fn received(&mut self, n: usize) {
        self.last += n;
    }

    /// Returns the header fields parsed so far.
    #[inline]
    #[must_use]
    pub fn headers(&self) -> &HeaderTable {
        &self.headers
    }

    /// Mutable access to the header fields, used for releasing storage.
    #[inline]
    pub(crate) fn headers_mut(&mut self) -> &mut HeaderTable {
        &mut self.headers
    }

    /// Appends a completed header field.
    #[inline]
    pub fn push_header(&mut self, name: Span, value: Span) {
        self.headers.push(name, value);
    }

    /// Returns the number of parsed header fields.
    #[inline]
    #[must_use]
    pub fn header_cnt(&self) -> usize {
        self.headers.len()
    }

    /// Looks up the value of the first header field named `name`.
    ///
    /// See `HeaderTable::get` for the matching rules.
    #[inline]
    #[must_use]
    pub fn header<'i, S>(&self, buf: &[u8], name: S) -> Option<Span>
    where
        S: Into<&'i HeaderName>,
    {
        self.headers.get(buf, name)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::LineParser;

    #[track_caller]
    fn assert_initial(req: &Request) {
        assert_eq!(req.state, ParseState::INITIAL);
        assert_eq!((req.cursor(), req.end()), (0, 0));
        assert!(req.method.is_empty() && req.uri.is_empty());
        assert!(req.proto.is_empty() && req.query_string.is_empty());
        assert!(req.partial_name.is_empty() && req.partial_value.is_empty());
        assert_eq!(req.header_cnt(), 0);
        assert!(req.headers().is_empty());
    }

    #[test]
    fn init_idempotent() {
        let mut req = Request::new();
        assert_initial(&req);
        req.init();
        req.init();
        assert_initial(&req);
    }

    #[test]
    fn init_after_parse() {
        const RAW: &[u8] = b"GET /search?q=rust HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n";
        let mut req = Request::new();
        req.received(RAW.len());
        let progress = LineParser.parse(&mut req, RAW).unwrap();
        assert_eq!(progress, Progress::Complete);
        assert_eq!(req.method.get(RAW), b"GET");
        assert_eq!(req.uri.get(RAW), b"/search");
        assert_eq!(req.query_string.get(RAW), b"q=rust");
        assert_eq!(req.header_cnt(), 2);

        // Scribble over the parser state as a half-finished parser would
        req.state = ParseState(fastrand::u8(1..));
        req.partial_name = Span::new(3..9);
        req.init();
        assert_initial(&req);
        assert!(req.header(RAW, "Host").is_none());
    }

    #[test]
    fn header_lookup() {
        const RAW: &[u8] = b"GET / HTTP/1.1\r\nHost: a\r\nContent-Length: 10\r\nHost: b\r\n\r\n";
        let mut req = Request::new();
        req.received(RAW.len());
        assert_eq!(LineParser.parse(&mut req, RAW).unwrap(), Progress::Complete);

        assert_eq!(req.header(RAW, "Host").unwrap().get(RAW), b"a");
        assert_eq!(req.header(RAW, "content-length").unwrap().get(RAW), b"10");
        assert!(req.header(RAW, "Connection").is_none());
    }

    #[test]
    fn cursor_bounds() {
        let mut req = Request::new();
        req.received(10);
        req.advance(4);
        assert_eq!(req.unparsed(b"0123456789abc"), b"456789");
        req.advance(10);
        assert_eq!(req.unparsed(b"0123456789abc"), b"");
    }

    #[test]
    #[should_panic = "out of bounds"]
    fn cursor_past_end() {
        let mut req = Request::new();
        req.received(3);
        req.advance(4);
    }
}
