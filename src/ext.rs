use std::io;


/// An extension trait for the results of non-blocking I/O calls.
pub(crate) trait NonBlocking<T>: Sized {
    /// Converts [`io::ErrorKind::WouldBlock`] into `Ok(None)`.
    ///
    /// Any other error is passed through, as is a successful result.
    fn nonblocking(self) -> io::Result<Option<T>>;
}

impl<T> NonBlocking<T> for io::Result<T> {
    #[inline]
    fn nonblocking(self) -> io::Result<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}


/// Repeats `op` for as long as it fails with [`io::ErrorKind::Interrupted`].
#[inline]
pub(crate) fn retry_eintr<T>(mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match op() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            res => return res,
        }
    }
}
