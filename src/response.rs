use std::io::{self, Write};


/// Returns the canonical reason phrase for common HTTP status codes.
///
/// Unknown codes map to `"Unknown"`. The reason phrase carries no meaning in
/// HTTP/1.1 (RFC 9112, Section 4), so this is purely cosmetic.
#[must_use]
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Content Too Large",
        414 => "URI Too Long",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}


/// Writes the head of an [`http::Response<T>`] into the writer.
///
/// This function is a wrapper around [`write_head`]. See its documentation
/// for details. The body of the [`http::Response`] is ignored by this function
/// and must be sent separately.
///
/// # Errors
/// Any errors from [`Write::write_all`] are forwarded to the caller.
#[cfg(feature = "http")]
#[inline]
pub fn http_head<T>(w: impl Write, response: &http::Response<T>) -> io::Result<usize> {
    let status = response.status();
    let reason = status.canonical_reason().unwrap_or_else(|| reason_phrase(status.as_u16()));
    let headers = response.headers().iter().map(|(n, v)| (n.as_ref(), v.as_ref()));
    write_head(w, status.as_u16(), reason, headers)
}

/// Writes an HTTP/1.1 status line and header block into the writer.
///
/// `headers` is an iterator over pairs of header names and associated values.
/// A header value must be a single line and therefore may not contain newline
/// characters like `\n` and `\r`. This is verified by a debug assertion.
/// `status` must be a three-digit code.
///
/// The header block is terminated by an empty line. After this function
/// returns [`Ok(n)`], the caller can immediately send the body.
///
/// # Errors
/// Any errors from [`Write::write_all`] are forwarded to the caller.
pub fn write_head<'a, W, I>(mut w: W, status: u16, reason: &str, headers: I) -> io::Result<usize>
where
    W: Write,
    I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
{
    debug_assert!((100..1000).contains(&status), "status code must have three digits");
    let mut sbuf = *b"HTTP/1.1 \0\0\0 ";
    sbuf[9] = b'0' + (status / 100 % 10) as u8;
    sbuf[10] = b'0' + (status / 10 % 10) as u8;
    sbuf[11] = b'0' + (status % 10) as u8;

    w.write_all(&sbuf)?;
    w.write_all(reason.as_bytes())?;
    let mut written = sbuf.len() + reason.len();

    for (name, val) in headers {
        debug_assert!(!val.iter().any(|&b| b == b'\r' || b == b'\n'), "header value spans lines");
        w.write_all(b"\r\n")?;
        w.write_all(name)?;
        w.write_all(b": ")?;
        w.write_all(val)?;
        written += name.len() + val.len() + 4;
    }

    w.write_all(b"\r\n\r\n")?;
    Ok(written + 4)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_layout() {
        let mut out = Vec::new();
        let headers: [(&[u8], &[u8]); 2] = [(b"Content-Type", b"text/html"), (b"Content-Length", b"42")];
        let n = write_head(&mut out, 200, reason_phrase(200), headers).unwrap();
        assert_eq!(n, out.len());
        assert_eq!(
            out,
            b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 42\r\n\r\n",
        );
    }

    #[test]
    fn head_without_headers() {
        let mut out = Vec::new();
        let n = write_head(&mut out, 404, reason_phrase(404), []).unwrap();
        assert_eq!(n, out.len());
        assert_eq!(out, b"HTTP/1.1 404 Not Found\r\n\r\n");

        out.clear();
        write_head(&mut out, 599, reason_phrase(599), []).unwrap();
        assert_eq!(out, b"HTTP/1.1 599 Unknown\r\n\r\n");
    }

    #[cfg(feature = "http")]
    #[test]
    fn http_response() {
        let resp = http::Response::builder()
            .status(http::StatusCode::NO_CONTENT)
            .header(http::header::SERVER, "test")
            .body(())
            .unwrap();
        let mut out = Vec::new();
        let n = http_head(&mut out, &resp).unwrap();
        assert_eq!(n, out.len());
        assert_eq!(out, b"HTTP/1.1 204 No Content\r\nserver: test\r\n\r\n");
    }
}
