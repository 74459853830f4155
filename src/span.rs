use std::fmt;
use std::ops::Range;


/// A non-owning view into a connection's receive buffer.
///
/// A [`Span`] is just an offset and a length. It never owns bytes and is only
/// meaningful together with the buffer it was created for, for as long as that
/// buffer is not reset. Offsets instead of pointers mean a stale [`Span`] can
/// at worst select the wrong bytes, never freed memory.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Span {
    start: u32,
    len: u32,
}

impl Span {
    /// The empty span at offset 0.
    pub const EMPTY: Self = Self { start: 0, len: 0 };

    /// Creates a [`Span`] covering `range`.
    ///
    /// # Panics
    /// Panics if `range` is decreasing or does not fit into `u32`.
    #[must_use]
    pub fn new(range: Range<usize>) -> Self {
        assert!(range.start <= range.end, "span range must not be decreasing");
        let start = u32::try_from(range.start).expect("span start exceeds u32::MAX");
        let len = u32::try_from(range.end - range.start).expect("span length exceeds u32::MAX");
        Self { start, len }
    }

    /// Returns the offset of the first byte.
    #[inline]
    #[must_use]
    pub fn start(self) -> usize {
        self.start as usize
    }

    /// Returns the offset one past the last byte.
    #[inline]
    #[must_use]
    pub fn end(self) -> usize {
        self.start as usize + self.len as usize
    }

    /// Returns the number of bytes covered.
    #[inline]
    #[must_use]
    pub fn len(self) -> usize {
        self.len as usize
    }

    /// Tests whether the span covers no bytes.
    #[inline]
    #[must_use]
    pub fn is_empty(self) -> bool {
        self.len == 0
    }

    /// Resolves the span against `buf`.
    ///
    /// Returns an empty slice if the span lies (partially) outside of `buf`,
    /// which can only happen if it was created for a different buffer.
    #[inline]
    #[must_use]
    pub fn get(self, buf: &[u8]) -> &[u8] {
        buf.get(self.start()..self.end()).unwrap_or_default()
    }
}

impl From<Range<usize>> for Span {
    #[inline]
    fn from(r: Range<usize>) -> Self {
        Self::new(r)
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Span({}..{})", self.start(), self.end())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve() {
        let buf = b"GET /index.html HTTP/1.1\r\n";
        let uri = Span::new(4..15);
        assert_eq!(uri.get(buf), b"/index.html");
        assert_eq!(uri.len(), 11);
        assert_eq!(uri.end(), 15);
        assert!(!uri.is_empty());

        assert!(Span::EMPTY.is_empty());
        assert_eq!(Span::EMPTY.get(buf), b"");
        assert_eq!(Span::default(), Span::EMPTY);
    }

    #[test]
    fn out_of_bounds() {
        let buf = [0u8; 8];
        assert_eq!(Span::new(4..12).get(&buf), b"");
        assert_eq!(Span::new(8..8).get(&buf), b"");
    }

    #[test]
    #[should_panic = "decreasing"]
    fn decreasing() {
        #[allow(clippy::reversed_empty_ranges)]
        let _ = Span::new(5..2);
    }
}
