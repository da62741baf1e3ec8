//! The public cache surface.
//!
//! Composes the bucket engine with the locking discipline and the optional
//! backing-store callbacks. Every operation takes the affected bucket's
//! exclusive byte-range lock for its whole duration; callbacks run while
//! the lock is held and must not re-enter the same cache.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, trace};

use crate::codec::{self, Value};
use crate::error::{CacheError, Result};
use crate::mmap::bucket::{self, BucketContext};
use crate::mmap::layout::{
    EntryHeader, Header, BUCKET_HEADER_SIZE, ENTRY_HEADER_SIZE, HEADER_SIZE,
};
use crate::mmap::lock;
use crate::mmap::region::Region;
use crate::options::{CacheOptions, Context, WriteFn};

/// How much of each entry [`Cache::entries`] should report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detail {
    /// Keys only.
    Keys,
    /// Key, insertion time, and dirty flag.
    Meta,
    /// Everything, including the decoded value.
    Full,
}

/// One entry from an enumeration snapshot.
#[derive(Debug)]
pub struct EntryInfo {
    pub key: Value,
    /// Insertion time (seconds since the epoch), from [`Detail::Meta`] up.
    pub time: Option<i64>,
    /// Whether the entry awaits writeback, from [`Detail::Meta`] up.
    pub dirty: Option<bool>,
    /// Decoded value at [`Detail::Full`]; the inner `None` is a cached
    /// negative result.
    pub value: Option<Option<Value>>,
}

/// A shared, persistent key/value cache backed by one memory-mapped file.
///
/// Independent processes may open the same file; each operation serializes
/// against the others through a byte-range lock on the touched bucket.
/// Those locks are owned by the process, so sharing a single `Cache`
/// between threads is safe through `&mut self`, but two handles to the
/// same file within one process do not exclude each other.
///
/// Dropping the cache unmaps the region and closes the file.
pub struct Cache {
    region: Region,
    options: CacheOptions,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("path", &self.region.path)
            .finish()
    }
}

impl Cache {
    /// Open or create the cache file at `path`.
    ///
    /// Geometry options apply only when the file is created; an existing
    /// file's header overrides them (check the accessors after opening).
    pub fn new(path: impl AsRef<Path>, options: CacheOptions) -> Result<Cache> {
        options.validate()?;
        let requested = Header {
            buckets: options.buckets,
            bucketsize: options.rounded_bucketsize(),
            pagesize: options.pagesize,
            strings: options.strings,
        };
        let region = Region::open(path.as_ref(), requested, options.permissions)?;
        Ok(Cache { region, options })
    }

    /// Look up `key`, pulling from the backing store on miss.
    ///
    /// A hit moves the entry one slot toward its bucket head. A hit on an
    /// expired clean entry removes it and counts as a miss; expired dirty
    /// entries are still returned (their value has nowhere else to live
    /// until writeback). On miss with a `read` callback, the fetched value
    /// (or, with `cachenegative`, the miss itself) is inserted clean.
    pub fn read(&mut self, key: &Value) -> Result<Option<Value>> {
        let strings = self.region.header.strings;
        let raw = key.raw_bytes()?;
        let key_enc = codec::encode(Some(key), strings, true)?;
        let idx = bucket::bucket_index(raw, self.region.header.buckets);
        let range = self.region.bucket_range(idx);
        let now = unix_now();

        let _guard = lock::exclusive(
            &self.region.file,
            range.start as u64,
            self.region.header.bucketsize as u64,
        )?;
        let ctx = BucketContext {
            path: &self.region.path,
            file_offset: range.start as u64,
        };

        let bucket_slice = &mut self.region.map[range.clone()];
        if let Some(f) = bucket::find(bucket_slice, &key_enc, now, self.options.expiry, &ctx)? {
            if !f.expired || f.header.dirty() {
                let value = codec::decode(&bucket_slice[f.value_range()], strings, false)?;
                if let Some(prev) = f.prev_off {
                    bucket::swap_with_predecessor(bucket_slice, prev, f.off, f.size());
                }
                trace!(bucket = idx, "cache hit");
                return Ok(value);
            }
            // Expired clean entry: drop it and treat the read as a miss.
            bucket::remove(bucket_slice, f.off, f.size());
            trace!(bucket = idx, "dropped expired entry");
        }

        let fetched = match self.options.read.as_mut() {
            None => {
                trace!(bucket = idx, "cache miss");
                return Ok(None);
            }
            Some(cb) => {
                cb(key, self.options.context.as_ref()).map_err(CacheError::Backing)?
            }
        };
        trace!(bucket = idx, found = fetched.is_some(), "backing store read");

        if fetched.is_some() || self.options.cachenegative {
            let val_enc = codec::encode(fetched.as_ref(), strings, false)?;
            let writethrough = self.options.writethrough;
            let write_cb = &mut self.options.write;
            let cb_ctx = self.options.context.as_ref();
            let bucket_slice = &mut self.region.map[range];
            bucket::insert(
                bucket_slice,
                &key_enc,
                &val_enc,
                now,
                false,
                &ctx,
                |h, k, v| writeback_evicted(h, k, v, strings, writethrough, write_cb, cb_ctx),
            )?;
        }
        Ok(fetched)
    }

    /// Store `value` under `key`.
    ///
    /// With `writethrough` the `write` callback runs synchronously while
    /// the bucket lock is still held; otherwise the entry is marked dirty
    /// and flushed when it is evicted. A value too large for a bucket
    /// bypasses the cache entirely: it is written straight through when a
    /// `write` callback exists, and silently dropped when none does.
    pub fn write(&mut self, key: &Value, value: &Value) -> Result<()> {
        let strings = self.region.header.strings;
        let raw = key.raw_bytes()?;
        let key_enc = codec::encode(Some(key), strings, true)?;
        let val_enc = codec::encode(Some(value), strings, false)?;
        let size = ENTRY_HEADER_SIZE + key_enc.len() + val_enc.len();
        let capacity = self.region.header.bucketsize - BUCKET_HEADER_SIZE;

        if size > capacity {
            if self.options.write.is_some() {
                // Remove any stale cached copy, then commit directly.
                self.delete(key)?;
                if let Some(cb) = self.options.write.as_mut() {
                    cb(key, value, self.options.context.as_ref())
                        .map_err(CacheError::Backing)?;
                }
                debug!(size, capacity, "entry too large for its bucket; wrote through");
            } else {
                debug!(size, capacity, "entry too large for its bucket; dropped");
            }
            return Ok(());
        }

        let idx = bucket::bucket_index(raw, self.region.header.buckets);
        let range = self.region.bucket_range(idx);
        let now = unix_now();

        let _guard = lock::exclusive(
            &self.region.file,
            range.start as u64,
            self.region.header.bucketsize as u64,
        )?;
        let ctx = BucketContext {
            path: &self.region.path,
            file_offset: range.start as u64,
        };

        let bucket_slice = &mut self.region.map[range];
        if let Some(f) = bucket::find(bucket_slice, &key_enc, now, self.options.expiry, &ctx)? {
            bucket::remove(bucket_slice, f.off, f.size());
        }

        let writethrough = self.options.writethrough;
        let write_cb = &mut self.options.write;
        let cb_ctx = self.options.context.as_ref();
        bucket::insert(
            bucket_slice,
            &key_enc,
            &val_enc,
            now,
            !writethrough,
            &ctx,
            |h, k, v| writeback_evicted(h, k, v, strings, writethrough, write_cb, cb_ctx),
        )?;
        trace!(bucket = idx, dirty = !writethrough, "stored entry");

        if writethrough {
            if let Some(cb) = self.options.write.as_mut() {
                cb(key, value, self.options.context.as_ref()).map_err(CacheError::Backing)?;
            }
        }
        Ok(())
    }

    /// Remove `key` from the cache, returning the cached value if present.
    ///
    /// The `delete` callback runs only for clean entries; a dirty entry
    /// was never committed to the backing store, so there is nothing to
    /// remove there.
    pub fn delete(&mut self, key: &Value) -> Result<Option<Value>> {
        let strings = self.region.header.strings;
        let raw = key.raw_bytes()?;
        let key_enc = codec::encode(Some(key), strings, true)?;
        let idx = bucket::bucket_index(raw, self.region.header.buckets);
        let range = self.region.bucket_range(idx);
        let now = unix_now();

        let _guard = lock::exclusive(
            &self.region.file,
            range.start as u64,
            self.region.header.bucketsize as u64,
        )?;
        let ctx = BucketContext {
            path: &self.region.path,
            file_offset: range.start as u64,
        };

        let bucket_slice = &mut self.region.map[range];
        let Some(f) = bucket::find(bucket_slice, &key_enc, now, self.options.expiry, &ctx)? else {
            trace!(bucket = idx, "delete miss");
            return Ok(None);
        };

        let value = codec::decode(&bucket_slice[f.value_range()], strings, false)?;
        if !f.header.dirty() {
            if let Some(cb) = self.options.delete.as_mut() {
                cb(key, value.as_ref(), self.options.context.as_ref())
                    .map_err(CacheError::Backing)?;
            }
        }
        bucket::remove(bucket_slice, f.off, f.size());
        trace!(bucket = idx, "deleted entry");
        Ok(value)
    }

    /// A point-in-time listing of the live entries.
    ///
    /// Buckets are locked and walked one at a time, so the snapshot is
    /// consistent per bucket but not across the whole file. Expired clean
    /// entries are skipped; expired dirty entries still appear, matching
    /// what [`Cache::read`] would return for them.
    pub fn entries(&mut self, detail: Detail) -> Result<Vec<EntryInfo>> {
        let strings = self.region.header.strings;
        let expiry = self.options.expiry;
        let now = unix_now();
        let mut out = Vec::new();

        for idx in 0..self.region.header.buckets {
            let range = self.region.bucket_range(idx);
            let _guard = lock::exclusive(
                &self.region.file,
                range.start as u64,
                self.region.header.bucketsize as u64,
            )?;
            let ctx = BucketContext {
                path: &self.region.path,
                file_offset: range.start as u64,
            };

            let bucket_slice = &self.region.map[range];
            for e in bucket::walk(bucket_slice, now, expiry, &ctx)? {
                if e.expired && !e.header.dirty() {
                    continue;
                }
                let key = codec::decode(&bucket_slice[e.key_range()], strings, true)?
                    .ok_or_else(|| CacheError::Codec("entry with an empty key".into()))?;
                let mut info = EntryInfo {
                    key,
                    time: None,
                    dirty: None,
                    value: None,
                };
                if detail != Detail::Keys {
                    info.time = Some(e.header.time as i64);
                    info.dirty = Some(e.header.dirty());
                }
                if detail == Detail::Full {
                    info.value =
                        Some(codec::decode(&bucket_slice[e.value_range()], strings, false)?);
                }
                out.push(info);
            }
        }
        Ok(out)
    }

    /// Zero every bucket. Dirty entries are not flushed; this is the
    /// explicitly destructive fast path.
    pub fn quick_clear(&mut self) -> Result<()> {
        let _guard = lock::exclusive(&self.region.file, 0, HEADER_SIZE as u64)?;
        let pagesize = self.region.header.pagesize;
        let total = self.region.header.total_size();
        self.region.map[pagesize..total].fill(0);
        debug!("cache cleared");
        Ok(())
    }

    // Geometry accessors report the on-disk values, which for an existing
    // file may differ from what was passed to `new`.

    pub fn buckets(&self) -> usize {
        self.region.header.buckets
    }

    pub fn bucketsize(&self) -> usize {
        self.region.header.bucketsize
    }

    pub fn pagesize(&self) -> usize {
        self.region.header.pagesize
    }

    pub fn strings(&self) -> bool {
        self.region.header.strings
    }

    pub fn expiry(&self) -> u32 {
        self.options.expiry
    }

    pub fn writethrough(&self) -> bool {
        self.options.writethrough
    }

    pub fn cachenegative(&self) -> bool {
        self.options.cachenegative
    }

    pub fn path(&self) -> &PathBuf {
        &self.region.path
    }

    /// The opaque context value handed to backing-store callbacks.
    pub fn context(&self) -> Option<&Context> {
        self.options.context.as_ref()
    }

    pub fn set_context(&mut self, context: Option<Context>) {
        self.options.context = context;
    }
}

/// Flush one evicted entry through the `write` callback when it is dirty
/// and the cache runs in writeback mode.
fn writeback_evicted(
    header: &EntryHeader,
    key_enc: &[u8],
    val_enc: &[u8],
    strings: bool,
    writethrough: bool,
    write_cb: &mut Option<WriteFn>,
    cb_ctx: Option<&Context>,
) -> Result<()> {
    if writethrough || !header.dirty() {
        return Ok(());
    }
    let Some(cb) = write_cb.as_mut() else {
        return Ok(());
    };
    let Some(key) = codec::decode(key_enc, strings, true)? else {
        return Ok(());
    };
    let Some(value) = codec::decode(val_enc, strings, false)? else {
        return Ok(());
    };
    debug!("writing back evicted dirty entry");
    cb(&key, &value, cb_ctx).map_err(CacheError::Backing)
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
