use std::fmt;

use smallvec::SmallVec;

use crate::Span;


// Typical browser requests carry 8-14 header fields
const INLINE_FIELDS: usize = 16;


/// A byte-string wrapper for HTTP field names.
///
/// Field names are case-insensitive (RFC 9110, Section 5.1), hence this
/// wrapper provides case-insensitive equality for its wrapped bytes. The bytes
/// themselves are not modified. The parser stores names as they appeared on
/// the wire, so all lookups go through this type.
///
/// Matching case-insensitively is a deliberate choice of this crate, so a
/// lookup for `Host` also finds `host` and `HOST`.
#[derive(ref_cast::RefCastCustom)]
#[repr(transparent)]
pub struct HeaderName([u8]);

impl HeaderName {
    /// Wraps a byte slice in a [`HeaderName`].
    ///
    /// [`HeaderName`] also implements [`From<&T>`] for any
    /// `T: AsRef<[u8]>`, which includes `str`.
    #[ref_cast::ref_cast_custom]
    // Unsafe code is generated and checked by ref-cast
    #[allow(unsafe_code, clippy::let_underscore_untyped)]
    #[must_use]
    pub const fn new(name: &[u8]) -> &Self;

    /// Returns the wrapped bytes.
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> From<&'a T> for &'a HeaderName {
    #[inline]
    fn from(v: &'a T) -> Self {
        HeaderName::new(v.as_ref())
    }
}

impl PartialEq for HeaderName {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}
impl Eq for HeaderName {}

impl PartialEq<[u8]> for HeaderName {
    #[inline]
    fn eq(&self, other: &[u8]) -> bool {
        self.0.eq_ignore_ascii_case(other)
    }
}

impl fmt::Debug for HeaderName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "HeaderName(\"{}\")", self.0.escape_ascii())
    }
}


/// A single request header field, as spans into the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeaderField {
    /// The field name, as sent by the client.
    pub name: Span,
    /// The field value without surrounding whitespace.
    pub value: Span,
}


/// The header fields of a request in wire order.
///
/// Names and values are kept as pairs in a single sequence, so a name can
/// never lose its value. Small tables live inline. Once a request carries more
/// than a handful of fields, the sequence spills onto the heap; that storage
/// is independent of the connection's [`Pool`](crate::pool::Pool) and is
/// only returned by `HeaderTable::release` (or by dropping the table).
#[derive(Debug, Clone, Default)]
pub struct HeaderTable {
    fields: SmallVec<[HeaderField; INLINE_FIELDS]>,
}

impl HeaderTable {
    /// Creates an empty [`HeaderTable`] without heap storage.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of header fields.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Tests whether the table holds no header fields.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Tests whether the table currently owns heap storage.
    #[inline]
    #[must_use]
    pub fn is_spilled(&self) -> bool {
        self.fields.spilled()
    }

    /// Appends a header field. Order of insertion is wire order.
    #[inline]
    pub fn push(&mut self, name: Span, value: Span) {
        self.fields.push(HeaderField { name, value });
    }

    /// Returns the value of the first field named `name`, resolved against
    /// `buf`.
    ///
    /// Names are compared case-insensitively. If a field occurs multiple
    /// times, the earliest one in wire order wins. A miss is not an error.
    #[must_use]
    pub fn get<'i, S>(&self, buf: &[u8], name: S) -> Option<Span>
    where
        S: Into<&'i HeaderName>,
    {
        if self.fields.is_empty() {
            return None;
        }
        let name = name.into();
        self.fields.iter()
            .find(|f| *name == *f.name.get(buf))
            .map(|f| f.value)
    }

    /// Returns an iterator over all header fields in wire order.
    #[inline]
    pub fn iter(&self) -> std::slice::Iter<'_, HeaderField> {
        self.fields.iter()
    }

    /// Forgets all header fields but keeps any heap storage for reuse.
    #[inline]
    pub fn clear(&mut self) {
        self.fields.clear();
    }

    /// Forgets all header fields and returns any heap storage to the
    /// allocator.
    pub fn release(&mut self) {
        if self.fields.spilled() {
            crate::macros::trace!(capacity = self.fields.capacity(), "header storage released");
        }
        self.fields = SmallVec::new();
    }
}

impl<'a> IntoIterator for &'a HeaderTable {
    type Item = &'a HeaderField;
    type IntoIter = std::slice::Iter<'a, HeaderField>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    /// Lays out `name: value\r\n` lines in a buffer and records their spans.
    fn table_for(fields: &[(&str, &str)]) -> (Vec<u8>, HeaderTable) {
        let mut buf = Vec::new();
        let mut table = HeaderTable::new();
        for (n, v) in fields {
            let name_start = buf.len();
            buf.extend_from_slice(n.as_bytes());
            let name = Span::new(name_start..buf.len());
            buf.extend_from_slice(b": ");
            let value_start = buf.len();
            buf.extend_from_slice(v.as_bytes());
            table.push(name, Span::new(value_start..buf.len()));
            buf.extend_from_slice(b"\r\n");
        }
        (buf, table)
    }

    #[test]
    fn name_equality() {
        assert_eq!(HeaderName::new(b"Content-Length"), <&HeaderName>::from("content-length"));
        assert_eq!(<&HeaderName>::from("HOST"), <&HeaderName>::from("host"));
        assert_ne!(<&HeaderName>::from("Host"), <&HeaderName>::from("Hos"));
        assert_ne!(<&HeaderName>::from("X-A"), <&HeaderName>::from("X_A"));
        assert!(*HeaderName::new(b"ETag") == b"etag"[..]);
    }

    #[test]
    fn first_match_wins() {
        let (buf, table) = table_for(&[("Host", "a"), ("Content-Length", "10"), ("Host", "b")]);
        assert_eq!(table.len(), 3);
        assert_eq!(table.get(&buf, "Host").unwrap().get(&buf), b"a");
        assert_eq!(table.get(&buf, "host").unwrap().get(&buf), b"a");
        assert_eq!(table.get(&buf, "Content-Length").unwrap().get(&buf), b"10");
        assert!(table.get(&buf, "Accept").is_none());
        assert!(table.get(&buf, "").is_none());
    }

    #[test]
    fn empty_table() {
        let table = HeaderTable::new();
        for name in ["", "Host", "x-unknown"] {
            assert!(table.get(b"", name).is_none());
        }
        assert!(table.is_empty());
        assert_eq!(table.iter().count(), 0);
    }

    #[test]
    fn wire_order() {
        let fields: Vec<(String, String)> = (0..40)
            .map(|i| (format!("X-Field-{i}"), format!("{}", fastrand::u32(..))))
            .collect();
        let borrowed: Vec<(&str, &str)> =
            fields.iter().map(|(n, v)| (n.as_str(), v.as_str())).collect();
        let (buf, table) = table_for(&borrowed);

        for (f, (n, v)) in table.iter().zip(&borrowed) {
            assert_eq!(f.name.get(&buf), n.as_bytes());
            assert_eq!(f.value.get(&buf), v.as_bytes());
        }
        let pick = fastrand::usize(..borrowed.len());
        let (n, v) = borrowed[pick];
        assert_eq!(table.get(&buf, &n.to_ascii_uppercase()).unwrap().get(&buf), v.as_bytes());
    }

    #[test]
    fn clear_and_release() {
        let mut table = HeaderTable::new();
        for i in 0..(INLINE_FIELDS + 4) {
            table.push(Span::new(i..i + 1), Span::EMPTY);
        }
        assert!(table.is_spilled());

        table.clear();
        assert!(table.is_empty());
        // clear keeps the spilled storage around
        assert!(table.is_spilled());

        table.push(Span::new(0..1), Span::EMPTY);
        table.release();
        assert!(table.is_empty());
        assert!(!table.is_spilled());
    }
}
