//! Every system call performed on behalf of a [`Connection`] goes through the
//! [`Sys`] trait. [`Os`] forwards to `libc`; tests substitute a recording
//! implementation to observe exactly which descriptors get closed and which
//! regions get unmapped.
//!
//! [`Connection`]: crate::Connection
// Together with the handle table of the pool, the only unsafe code of the crate.
#![allow(unsafe_code)]

use std::fmt;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::ptr::NonNull;


/// The operating-system services used by the connection lifecycle.
///
/// All operations are expected to be non-blocking where applicable. Errors are
/// reported as [`io::Error`] and never retried by the implementation.
pub trait Sys {
    /// A read-only, memory-mapped view of a file used as a response body.
    type Map: AsRef<[u8]>;

    /// Reads from `fd` into `buf`, returning the number of bytes read.
    ///
    /// # Errors
    /// Forwards the error of the underlying `read(2)`.
    fn read(&mut self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes `buf` into `fd`, returning the number of bytes written.
    ///
    /// # Errors
    /// Forwards the error of the underlying `write(2)`.
    fn write(&mut self, fd: RawFd, buf: &[u8]) -> io::Result<usize>;

    /// Closes `fd`. The descriptor is invalid afterwards, even on error.
    ///
    /// # Errors
    /// Forwards the error of the underlying `close(2)`.
    fn close(&mut self, fd: RawFd) -> io::Result<()>;

    /// Maps the first `len` bytes of `file` into memory, read-only.
    ///
    /// # Errors
    /// Returns [`io::ErrorKind::InvalidInput`] for `len == 0`, otherwise
    /// forwards the error of the underlying `mmap(2)`.
    fn map_file(&mut self, file: &File, len: usize) -> io::Result<Self::Map>;

    /// Releases a region previously returned by `Sys::map_file`.
    ///
    /// # Errors
    /// Forwards the error of the underlying `munmap(2)`.
    fn unmap(&mut self, map: Self::Map) -> io::Result<()>;
}


/// A private, read-only file mapping created by [`Os`].
///
/// The region is *not* unmapped on drop. It must be handed back to
/// `Sys::unmap`, which keeps teardown explicit and observable.
#[must_use = "mapped regions leak unless passed to Sys::unmap"]
pub struct MappedRegion {
    addr: NonNull<u8>,
    len: usize,
}

impl MappedRegion {
    /// Returns the length of the mapping in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Tests whether the mapping is empty. [`Os`] never creates empty mappings.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl AsRef<[u8]> for MappedRegion {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        // SAFETY: addr..addr+len was mapped PROT_READ by Os::map_file and
        // stays mapped until Os::unmap consumes self.
        unsafe { std::slice::from_raw_parts(self.addr.as_ptr(), self.len) }
    }
}

impl fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MappedRegion")
            .field("addr", &self.addr)
            .field("len", &self.len)
            .finish()
    }
}


/// The real operating system, accessed through `libc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Os;

#[inline]
fn cvt(ret: libc::ssize_t) -> io::Result<usize> {
    usize::try_from(ret).map_err(|_| io::Error::last_os_error())
}

impl Sys for Os {
    type Map = MappedRegion;

    fn read(&mut self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: buf is valid for writes of buf.len() bytes.
        cvt(unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) })
    }

    fn write(&mut self, fd: RawFd, buf: &[u8]) -> io::Result<usize> {
        // SAFETY: buf is valid for reads of buf.len() bytes.
        cvt(unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) })
    }

    fn close(&mut self, fd: RawFd) -> io::Result<()> {
        // SAFETY: closing an arbitrary integer is memory-safe; EBADF is reported.
        if unsafe { libc::close(fd) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn map_file(&mut self, file: &File, len: usize) -> io::Result<MappedRegion> {
        if len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "cannot map an empty file"));
        }
        // SAFETY: a fresh private read-only mapping does not alias any Rust object.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let addr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;
        Ok(MappedRegion { addr, len })
    }

    fn unmap(&mut self, map: MappedRegion) -> io::Result<()> {
        // SAFETY: map was produced by Os::map_file and is consumed here,
        // so no slice derived from it can outlive the mapping.
        if unsafe { libc::munmap(map.addr.as_ptr().cast(), map.len) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
