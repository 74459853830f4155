use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::RawFd;

use crate::request::{Parse, ParseError, ParseState, Progress, Request};
use crate::sys::Sys;
use crate::Span;


pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}


const DONE: ParseState = ParseState(1);

fn find(hay: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    hay.get(from..)?
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

fn trim_ows(buf: &[u8], mut start: usize, mut end: usize) -> Span {
    while start < end && matches!(buf[start], b' ' | b'\t') {
        start += 1;
    }
    while end > start && matches!(buf[end - 1], b' ' | b'\t') {
        end -= 1;
    }
    Span::new(start..end)
}

/// A minimal line-based stand-in for the real byte-level parser.
///
/// Waits until the entire header block is buffered, then records all spans
/// in one go.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct LineParser;

impl Parse for LineParser {
    fn parse(&mut self, req: &mut Request, buf: &[u8]) -> Result<Progress, ParseError> {
        if req.state == DONE {
            return Ok(Progress::Complete);
        }
        let buf = &buf[..req.end()];
        let Some(head_end) = find(buf, b"\r\n\r\n", req.cursor()) else {
            return Ok(Progress::Incomplete);
        };

        let line_end = find(buf, b"\r\n", req.cursor()).unwrap_or(head_end);
        let bad = |offset, reason| ParseError { offset, reason };
        let sp1 = find(buf, b" ", req.cursor())
            .filter(|&p| p < line_end)
            .ok_or(bad(req.cursor(), "missing request target"))?;
        let sp2 = find(buf, b" ", sp1 + 1)
            .filter(|&p| p < line_end)
            .ok_or(bad(sp1, "missing protocol"))?;

        req.method = Span::new(req.cursor()..sp1);
        match find(&buf[..sp2], b"?", sp1 + 1) {
            Some(q) => {
                req.uri = Span::new((sp1 + 1)..q);
                req.query_string = Span::new((q + 1)..sp2);
            },
            None => req.uri = Span::new((sp1 + 1)..sp2),
        }
        req.proto = Span::new((sp2 + 1)..line_end);

        let mut pos = line_end + 2;
        while pos < head_end + 2 {
            let eol = find(buf, b"\r\n", pos).unwrap_or(head_end);
            let colon = find(&buf[..eol], b":", pos).ok_or(bad(pos, "header without colon"))?;
            req.push_header(Span::new(pos..colon), trim_ows(buf, colon + 1, eol));
            pos = eol + 2;
        }

        req.advance(head_end + 4);
        req.state = DONE;
        Ok(Progress::Complete)
    }
}


/// One scripted outcome of `Sys::read` on a [`Recorder`].
#[derive(Debug)]
pub(crate) enum ReadStep {
    Data(Vec<u8>),
    WouldBlock,
    Eof,
    Fail(io::ErrorKind),
}

/// An in-memory body standing in for a memory-mapped file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FakeMap(pub(crate) Vec<u8>);

impl AsRef<[u8]> for FakeMap {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A [`Sys`] implementation which records every call.
#[derive(Debug, Default)]
pub(crate) struct Recorder {
    pub(crate) reads: VecDeque<ReadStep>,
    pub(crate) written: Vec<u8>,
    /// Caps the bytes accepted per write; 0 means unlimited.
    pub(crate) write_chunk: usize,
    /// Every other write reports WouldBlock if set.
    pub(crate) flaky_writes: bool,
    pub(crate) closed: Vec<RawFd>,
    pub(crate) mapped: usize,
    pub(crate) unmapped: Vec<FakeMap>,
    pub(crate) fail_close: bool,
    pub(crate) fail_unmap: bool,
    pub(crate) write_calls: usize,
}

impl Recorder {
    pub(crate) fn with_input(chunks: impl IntoIterator<Item = Vec<u8>>) -> Self {
        Self { reads: chunks.into_iter().map(ReadStep::Data).collect(), ..Self::default() }
    }

    pub(crate) fn push_read(&mut self, step: ReadStep) {
        self.reads.push_back(step);
    }
}

impl Sys for Recorder {
    type Map = FakeMap;

    fn read(&mut self, _fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        match self.reads.pop_front() {
            None | Some(ReadStep::WouldBlock) => Err(io::ErrorKind::WouldBlock.into()),
            Some(ReadStep::Eof) => Ok(0),
            Some(ReadStep::Fail(kind)) => Err(kind.into()),
            Some(ReadStep::Data(mut data)) => {
                let n = std::cmp::min(buf.len(), data.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    self.reads.push_front(ReadStep::Data(data.split_off(n)));
                }
                Ok(n)
            },
        }
    }

    fn write(&mut self, _fd: RawFd, buf: &[u8]) -> io::Result<usize> {
        self.write_calls += 1;
        if self.flaky_writes && self.write_calls % 2 == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = match self.write_chunk {
            0 => buf.len(),
            c => std::cmp::min(c, buf.len()),
        };
        self.written.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn close(&mut self, fd: RawFd) -> io::Result<()> {
        self.closed.push(fd);
        if self.fail_close {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        Ok(())
    }

    fn map_file(&mut self, mut file: &File, len: usize) -> io::Result<FakeMap> {
        let mut data = Vec::with_capacity(len);
        file.read_to_end(&mut data)?;
        data.truncate(len);
        self.mapped += 1;
        Ok(FakeMap(data))
    }

    fn unmap(&mut self, map: FakeMap) -> io::Result<()> {
        self.unmapped.push(map);
        if self.fail_unmap {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        Ok(())
    }
}
