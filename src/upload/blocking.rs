//! Blocking adapter
//!
//! Exposes an [`UploadStream`] as a [`std::io::Write`] for callers outside
//! async code. Every call blocks the current thread on a tokio runtime
//! handle, so it must not be used from inside that runtime's async tasks.

use super::stream::UploadStream;
use super::UploadError;
use std::io;
use tokio::runtime::Handle;

/// `std::io::Write` over an [`UploadStream`]
pub struct BlockingUploadStream {
    inner: UploadStream,
    handle: Handle,
}

impl BlockingUploadStream {
    pub fn new(inner: UploadStream, handle: Handle) -> Self {
        Self { inner, handle }
    }

    /// Commit the object
    pub fn close(&mut self) -> Result<(), UploadError> {
        self.handle.block_on(self.inner.close())
    }

    pub fn content_hash(&self) -> Option<&str> {
        self.inner.content_hash()
    }

    pub fn part_number(&self) -> u32 {
        self.inner.part_number()
    }

    pub fn into_inner(self) -> UploadStream {
        self.inner
    }
}

fn to_io_error(err: UploadError) -> io::Error {
    match err {
        UploadError::LocalBuffer(e) => e,
        other => io::Error::other(other),
    }
}

impl io::Write for BlockingUploadStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.handle
            .block_on(self.inner.write(buf))
            .map_err(to_io_error)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.handle.block_on(self.inner.flush()).map_err(to_io_error)
    }
}
