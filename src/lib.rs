//! Shared, persistent key/value cache backed by a single memory-mapped
//! file.
//!
//! Any number of processes may open the same cache file; every bucket is
//! guarded by its own byte-range advisory lock, and the kernel keeps the
//! shared mapping coherent between them. The cache can front a backing
//! store through optional `read`/`write`/`delete` callbacks: misses pull
//! from it, writes go through synchronously or are deferred until
//! eviction, and deletes are forwarded.
//!
//! ```no_run
//! use bucket_cache::{Cache, CacheOptions, Value};
//!
//! let mut cache = Cache::new(
//!     "/var/tmp/lookups.map",
//!     CacheOptions::new().strings(true).buckets(64),
//! )?;
//! cache.write(&Value::from("abc"), &Value::from("def"))?;
//! assert_eq!(cache.read(&Value::from("abc"))?, Some(Value::from("def")));
//! # Ok::<(), bucket_cache::CacheError>(())
//! ```

mod cache;
mod codec;
mod error;
mod mmap;
mod options;

pub use cache::{Cache, Detail, EntryInfo};
pub use codec::Value;
pub use error::{BoxError, CacheError, CorruptionKind, Result};
pub use options::{CacheOptions, Context, DeleteFn, ReadFn, WriteFn};
