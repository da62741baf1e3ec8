//! The mapped cache file.
//!
//! Owns the file handle and the shared read/write mapping for the process
//! lifetime. Creation and the first-open handshake run under the header
//! lock so only one process initializes a fresh file; existing files
//! dictate their own geometry.

use std::fs::OpenOptions;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};
use tracing::trace;

use super::layout::{Header, HEADER_SIZE};
use super::lock;
use crate::error::Result;

/// Zero-pad unit used when growing the file to its full size.
const PAD_CHUNK: usize = 1024;

/// The open cache file: handle, mapping, and adopted geometry.
pub struct Region {
    pub(crate) file: std::fs::File,
    pub(crate) map: MmapMut,
    pub(crate) path: PathBuf,
    pub(crate) header: Header,
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("path", &self.path)
            .field("header", &self.header)
            .finish()
    }
}

impl Region {
    /// Open or create the cache file at `path`.
    ///
    /// `requested` supplies the geometry for a fresh file; a file that
    /// already carries a valid header overrides it wholesale. The file is
    /// grown to `pagesize + buckets * bucketsize` with 1 KiB zero pads and
    /// mapped shared read/write.
    pub fn open(path: &Path, requested: Header, permissions: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(permissions)
            .open(path)?;

        // Only one process may initialize a newly created file.
        let guard = lock::exclusive(&file, 0, HEADER_SIZE as u64)?;

        let len = file.metadata()?.len();
        let (header, fresh) = if len >= HEADER_SIZE as u64 {
            let mut buf = [0u8; HEADER_SIZE];
            file.read_exact_at(&mut buf, 0)?;
            (Header::decode(&buf, path)?, false)
        } else {
            (requested, true)
        };

        let total = header.total_size();
        let mut end = len;
        let pad = [0u8; PAD_CHUNK];
        while end < total as u64 {
            file.write_all_at(&pad, end)?;
            end += PAD_CHUNK as u64;
        }
        let final_len = file.metadata()?.len();
        if final_len < total as u64 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                format!(
                    "failed to extend cache file to {total} bytes (size is {final_len})"
                ),
            )
            .into());
        }

        if fresh {
            file.write_all_at(&header.encode(), 0)?;
        }

        let map = unsafe { MmapOptions::new().len(total).map_mut(&file)? };
        drop(guard);

        trace!(
            path = %path.display(),
            buckets = header.buckets,
            bucketsize = header.bucketsize,
            pagesize = header.pagesize,
            strings = header.strings,
            fresh,
            "cache file mapped"
        );

        Ok(Region {
            file,
            map,
            path: path.to_path_buf(),
            header,
        })
    }

    /// Byte range of bucket `index` within the mapping.
    pub fn bucket_range(&self, index: usize) -> std::ops::Range<usize> {
        let start = self.header.bucket_offset(index);
        start..start + self.header.bucketsize
    }
}
