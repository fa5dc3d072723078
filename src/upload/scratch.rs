//! File-backed scratch buffer
//!
//! Accumulates at most one partition of the object in a temp file. Each
//! drain reads the segment back as an immutable [`Bytes`] snapshot and
//! truncates the file.
//!
//! Drained segments live on the heap until their part upload finishes. With
//! a pool of `concurrency` workers a stream holds up to `concurrency` parts
//! in flight, one part waiting for a permit and one partition in the file,
//! so roughly `(concurrency + 2) * partition_size` bytes can be resident.
//! The default directory is tmpfs (/dev/shm) on Linux, which is also RAM;
//! set `scratch_dir` to a disk path to keep the buffered partition off it.
//!
//! Two SHA-256 accumulators run alongside the file: one per segment, reset
//! on every drain, and one over the whole object.
//!
//! # Example
//!
//! ```no_run
//! use s3_upload_stream::upload::scratch::ScratchBuffer;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut buffer = ScratchBuffer::new(None)?;
//! buffer.append(b"Hello, World!")?;
//!
//! let segment = buffer.drain_for_upload()?;
//! println!("Size: {} bytes", segment.data.len());
//! println!("SHA256: {}", segment.sha256);
//! assert!(buffer.is_empty());
//! # Ok(())
//! # }
//! ```

use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// One drained segment of the object
#[derive(Debug, Clone)]
pub struct Segment {
    pub data: Bytes,
    /// Hex-encoded SHA-256 of `data`
    pub sha256: String,
}

/// Temp-file buffer for one partition
///
/// The file is removed on [`release`](Self::release) or when dropped.
pub struct ScratchBuffer {
    path: PathBuf,
    writer: BufWriter<File>,
    size: usize,
    segment_hasher: Sha256,
    object_hasher: Sha256,
    #[cfg(test)]
    fail_next_drain: bool,
}

impl ScratchBuffer {
    /// Create an empty buffer in `dir`, or the platform default
    ///
    /// Uses tmpfs (/dev/shm) on Linux when available.
    pub fn new(dir: Option<&Path>) -> io::Result<Self> {
        let dir = match dir {
            Some(dir) => dir.to_path_buf(),
            None => Self::get_temp_dir(),
        };
        let path = dir.join(format!("upload-{}.tmp", uuid::Uuid::new_v4()));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
            size: 0,
            segment_hasher: Sha256::new(),
            object_hasher: Sha256::new(),
            #[cfg(test)]
            fail_next_drain: false,
        })
    }

    /// Append bytes to the current segment
    pub fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data)?;
        self.segment_hasher.update(data);
        self.object_hasher.update(data);
        self.size += data.len();
        Ok(())
    }

    /// Bytes in the current segment
    pub fn size_in_bytes(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Take the current segment and reset the buffer to empty
    ///
    /// The returned segment is a heap copy of the file contents.
    pub fn drain_for_upload(&mut self) -> io::Result<Segment> {
        #[cfg(test)]
        if std::mem::take(&mut self.fail_next_drain) {
            return Err(io::Error::other("injected drain failure"));
        }

        self.writer.flush()?;

        let file = self.writer.get_mut();
        file.seek(SeekFrom::Start(0))?;
        let mut data = vec![0u8; self.size];
        file.read_exact(&mut data)?;

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;

        let sha256 = hex::encode(self.segment_hasher.finalize_reset());
        self.size = 0;

        Ok(Segment {
            data: Bytes::from(data),
            sha256,
        })
    }

    /// Hex-encoded SHA-256 of every byte appended so far
    pub fn object_sha256(&self) -> String {
        hex::encode(self.object_hasher.clone().finalize())
    }

    /// Get the path to the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Discard the buffer and its backing file
    pub fn release(self) {
        drop(self);
    }

    /// Make the next `drain_for_upload` fail
    #[cfg(test)]
    pub(crate) fn fail_next_drain(&mut self) {
        self.fail_next_drain = true;
    }

    // ========================================================================
    // Private helpers
    // ========================================================================

    /// Get the best temp directory for the platform
    fn get_temp_dir() -> PathBuf {
        #[cfg(target_os = "linux")]
        {
            let shm = PathBuf::from("/dev/shm");
            if shm.is_dir() {
                return shm;
            }
        }

        std::env::temp_dir()
    }
}

impl Drop for ScratchBuffer {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to clean up scratch file"
                );
            }
        }
    }
}
