//! Construction options.
//!
//! Geometry options (`buckets`, `bucketsize`, `pagesize`, `strings`) apply
//! only when the file is created; an existing file dictates its own. The
//! backing store is three optional callbacks plus an opaque context value
//! handed to each of them.

use std::any::Any;

use crate::codec::Value;
use crate::error::{BoxError, CacheError, Result};
use crate::mmap::layout::HEADER_SIZE;

/// Opaque state handed to every backing-store callback.
pub type Context = Box<dyn Any + Send>;

/// Backing-store fetch, called on cache miss. `Ok(None)` means not found.
pub type ReadFn =
    Box<dyn FnMut(&Value, Option<&Context>) -> std::result::Result<Option<Value>, BoxError> + Send>;

/// Backing-store commit, called on `write` (writethrough) or when a dirty
/// entry is evicted (writeback).
pub type WriteFn =
    Box<dyn FnMut(&Value, &Value, Option<&Context>) -> std::result::Result<(), BoxError> + Send>;

/// Backing-store remove, called on `delete` of a clean entry. Receives the
/// cached value that is being dropped.
pub type DeleteFn = Box<
    dyn FnMut(&Value, Option<&Value>, Option<&Context>) -> std::result::Result<(), BoxError> + Send,
>;

pub struct CacheOptions {
    pub(crate) buckets: usize,
    pub(crate) bucketsize: usize,
    pub(crate) pagesize: usize,
    pub(crate) strings: bool,
    pub(crate) expiry: u32,
    pub(crate) permissions: u32,
    pub(crate) cachenegative: bool,
    pub(crate) writethrough: bool,
    pub(crate) read: Option<ReadFn>,
    pub(crate) write: Option<WriteFn>,
    pub(crate) delete: Option<DeleteFn>,
    pub(crate) context: Option<Context>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        CacheOptions {
            buckets: 13,
            bucketsize: 1024,
            pagesize: 1024,
            strings: false,
            expiry: 0,
            permissions: 0o600,
            cachenegative: false,
            writethrough: true,
            read: None,
            write: None,
            delete: None,
            context: None,
        }
    }
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buckets (new files only).
    pub fn buckets(mut self, n: usize) -> Self {
        self.buckets = n;
        self
    }

    /// Bucket size in bytes (new files only); rounded up to a multiple of
    /// the page size.
    pub fn bucketsize(mut self, n: usize) -> Self {
        self.bucketsize = n;
        self
    }

    /// Header and alignment unit in bytes (new files only); at least 40.
    pub fn pagesize(mut self, n: usize) -> Self {
        self.pagesize = n;
        self
    }

    /// Store raw byte strings instead of structured values (new files only).
    pub fn strings(mut self, on: bool) -> Self {
        self.strings = on;
        self
    }

    /// Entry time-to-live in seconds; 0 disables expiry.
    pub fn expiry(mut self, seconds: u32) -> Self {
        self.expiry = seconds;
        self
    }

    /// POSIX mode bits for a newly created file.
    pub fn permissions(mut self, mode: u32) -> Self {
        self.permissions = mode;
        self
    }

    /// Cache backing-store misses so later reads skip the backing store.
    pub fn cachenegative(mut self, on: bool) -> Self {
        self.cachenegative = on;
        self
    }

    /// When true (the default) the `write` callback runs synchronously
    /// from [`Cache::write`](crate::Cache::write); when false it is
    /// deferred until the entry is evicted.
    pub fn writethrough(mut self, on: bool) -> Self {
        self.writethrough = on;
        self
    }

    pub fn on_read<F>(mut self, f: F) -> Self
    where
        F: FnMut(&Value, Option<&Context>) -> std::result::Result<Option<Value>, BoxError>
            + Send
            + 'static,
    {
        self.read = Some(Box::new(f));
        self
    }

    pub fn on_write<F>(mut self, f: F) -> Self
    where
        F: FnMut(&Value, &Value, Option<&Context>) -> std::result::Result<(), BoxError>
            + Send
            + 'static,
    {
        self.write = Some(Box::new(f));
        self
    }

    pub fn on_delete<F>(mut self, f: F) -> Self
    where
        F: FnMut(&Value, Option<&Value>, Option<&Context>) -> std::result::Result<(), BoxError>
            + Send
            + 'static,
    {
        self.delete = Some(Box::new(f));
        self
    }

    /// Opaque value passed to every callback.
    pub fn context(mut self, ctx: impl Any + Send) -> Self {
        self.context = Some(Box::new(ctx));
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.buckets == 0 {
            return Err(CacheError::Config("buckets must be positive".into()));
        }
        if self.bucketsize == 0 {
            return Err(CacheError::Config("bucketsize must be positive".into()));
        }
        if self.pagesize < HEADER_SIZE {
            return Err(CacheError::Config(format!(
                "pagesize must be at least {HEADER_SIZE} bytes"
            )));
        }
        Ok(())
    }

    /// Bucket size rounded up to the next multiple of the page size.
    pub(crate) fn rounded_bucketsize(&self) -> usize {
        self.bucketsize.div_ceil(self.pagesize) * self.pagesize
    }
}
