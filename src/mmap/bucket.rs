//! The bucket engine.
//!
//! Operates on a single bucket's byte slice while the caller holds that
//! bucket's exclusive byte-range lock. Entries are packed head-to-tail
//! after the bucket header; the most recently touched entry drifts one
//! slot toward the head on each access, and a freshly inserted entry
//! becomes the new head. Overflow evicts from the tail, handing each
//! evicted entry to the caller before the new bucket image is committed.

use std::path::Path;

use crate::error::{CacheError, CorruptionKind, Result};

use super::layout::{self, EntryHeader, BUCKET_HEADER_SIZE, ENTRY_HEADER_SIZE};

/// Choose a bucket for a key.
///
/// The hash runs over the raw key bytes as supplied by the caller, before
/// encoding: `h := h * 33 + b` in wrapping 32-bit arithmetic. The modulo
/// treats the accumulated word as unsigned.
pub fn bucket_index(raw_key: &[u8], buckets: usize) -> usize {
    (bucket_hash(raw_key) as u64 % buckets as u64) as usize
}

pub fn bucket_hash(raw_key: &[u8]) -> u32 {
    let mut h: u32 = 0;
    for &b in raw_key {
        h = h.wrapping_mul(33).wrapping_add(b as u32);
    }
    h
}

/// File context for corruption reports: which file, and where the bucket
/// under inspection starts within it.
pub struct BucketContext<'a> {
    pub path: &'a Path,
    pub file_offset: u64,
}

impl BucketContext<'_> {
    fn corrupt(&self, kind: CorruptionKind, bytes: &[u8], offset: usize) -> CacheError {
        let end = (offset + ENTRY_HEADER_SIZE).min(bytes.len());
        let start = offset.saturating_sub(8).min(end);
        let dump = bytes[start..end]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(" ");
        CacheError::Corruption {
            path: self.path.to_path_buf(),
            offset: self.file_offset + offset as u64,
            kind,
            dump,
        }
    }
}

/// Decode and sanity-check the entry header at `offset`.
///
/// `limit` is the end of the region the entry must fit inside (the bucket
/// size, or the combined length during an insert overflow walk).
fn entry_at(
    bytes: &[u8],
    offset: usize,
    limit: usize,
    ctx: &BucketContext<'_>,
) -> Result<EntryHeader> {
    if offset + ENTRY_HEADER_SIZE > limit {
        return Err(ctx.corrupt(CorruptionKind::SuperSized, bytes, offset));
    }
    let header = EntryHeader::decode(&bytes[offset..offset + ENTRY_HEADER_SIZE]);
    if header.size <= 0 {
        return Err(ctx.corrupt(CorruptionKind::ZeroSized, bytes, offset));
    }
    let size = header.size as usize;
    if header.klen < 0
        || header.vlen < 0
        || size < ENTRY_HEADER_SIZE + header.klen as usize + header.vlen as usize
        || offset + size > limit
    {
        return Err(ctx.corrupt(CorruptionKind::SuperSized, bytes, offset));
    }
    Ok(header)
}

/// A located entry: where it sits, who precedes it, and whether it has
/// outlived the cache expiry.
#[derive(Debug)]
pub struct FoundEntry {
    pub off: usize,
    /// Offset of the preceding entry, `None` when this is the bucket head.
    pub prev_off: Option<usize>,
    pub header: EntryHeader,
    pub expired: bool,
}

impl FoundEntry {
    pub fn size(&self) -> usize {
        self.header.size as usize
    }

    pub fn key_range(&self) -> std::ops::Range<usize> {
        let start = self.off + ENTRY_HEADER_SIZE;
        start..start + self.header.klen as usize
    }

    pub fn value_range(&self) -> std::ops::Range<usize> {
        let start = self.off + ENTRY_HEADER_SIZE + self.header.klen as usize;
        start..start + self.header.vlen as usize
    }
}

/// Walk the bucket looking for an encoded key.
///
/// Stops at the first match. A header claiming `size == 0` or an entry
/// reaching past the bucket end aborts the walk with a corruption error.
pub fn find(
    bucket: &[u8],
    key_enc: &[u8],
    now: i64,
    expiry: u32,
    ctx: &BucketContext<'_>,
) -> Result<Option<FoundEntry>> {
    let end = BUCKET_HEADER_SIZE.saturating_add(layout::read_filled(bucket));
    let mut off = BUCKET_HEADER_SIZE;
    let mut prev_off = None;

    while off < end {
        let header = entry_at(bucket, off, bucket.len(), ctx)?;
        let kstart = off + ENTRY_HEADER_SIZE;
        if &bucket[kstart..kstart + header.klen as usize] == key_enc {
            let expired = expiry != 0 && now - header.time as i64 > expiry as i64;
            return Ok(Some(FoundEntry {
                off,
                prev_off,
                header,
                expired,
            }));
        }
        prev_off = Some(off);
        off += header.size as usize;
    }

    Ok(None)
}

/// Walk every entry in the bucket, with the same corruption checks as
/// [`find`]. Used by enumeration.
pub fn walk(
    bucket: &[u8],
    now: i64,
    expiry: u32,
    ctx: &BucketContext<'_>,
) -> Result<Vec<FoundEntry>> {
    let end = BUCKET_HEADER_SIZE.saturating_add(layout::read_filled(bucket));
    let mut off = BUCKET_HEADER_SIZE;
    let mut prev_off = None;
    let mut out = Vec::new();

    while off < end {
        let header = entry_at(bucket, off, bucket.len(), ctx)?;
        let expired = expiry != 0 && now - header.time as i64 > expiry as i64;
        out.push(FoundEntry {
            off,
            prev_off,
            header,
            expired,
        });
        prev_off = Some(off);
        off += header.size as usize;
    }

    Ok(out)
}

/// Swap the entry at `off` with its predecessor at `prev_off`, moving it
/// one slot toward the bucket head. Cheap and local; deliberately not a
/// move-to-front.
pub fn swap_with_predecessor(bucket: &mut [u8], prev_off: usize, off: usize, size: usize) {
    let entry = bucket[off..off + size].to_vec();
    bucket.copy_within(prev_off..off, prev_off + size);
    bucket[prev_off..prev_off + size].copy_from_slice(&entry);
}

/// Remove the entry at `off`: shift the tail left, zero the freed range,
/// and shrink `filled`.
pub fn remove(bucket: &mut [u8], off: usize, size: usize) {
    let filled = layout::read_filled(bucket);
    let end = BUCKET_HEADER_SIZE + filled.min(bucket.len() - BUCKET_HEADER_SIZE);
    bucket.copy_within(off + size..end, off);
    bucket[end - size..end].fill(0);
    layout::write_filled(bucket, filled.saturating_sub(size));
}

/// Prepend a new entry, evicting from the tail on overflow.
///
/// Entries that no longer fit are handed to `on_evict` in tail order, each
/// with its header (schema order: size, time, klen, vlen, flags) and its
/// encoded key and value bytes. The new bucket image is committed only
/// after every eviction callback has returned, so a failing writeback
/// leaves the bucket unchanged.
///
/// An entry larger than the bucket capacity is not stored.
pub fn insert<F>(
    bucket: &mut [u8],
    key_enc: &[u8],
    val_enc: &[u8],
    now: i64,
    dirty: bool,
    ctx: &BucketContext<'_>,
    mut on_evict: F,
) -> Result<()>
where
    F: FnMut(&EntryHeader, &[u8], &[u8]) -> Result<()>,
{
    let capacity = bucket.len() - BUCKET_HEADER_SIZE;
    let size = ENTRY_HEADER_SIZE + key_enc.len() + val_enc.len();
    if size > capacity {
        return Ok(());
    }

    let header = EntryHeader {
        size: size as i32,
        time: now as i32,
        klen: key_enc.len() as i32,
        vlen: val_enc.len() as i32,
        flags: if dirty { layout::ENTRY_DIRTY } else { 0 },
    };

    // New head entry followed by the current live range.
    let filled = layout::read_filled(bucket).min(capacity);
    let mut combined = Vec::with_capacity(size + filled);
    combined.extend_from_slice(&header.encode());
    combined.extend_from_slice(key_enc);
    combined.extend_from_slice(val_enc);
    combined.extend_from_slice(&bucket[BUCKET_HEADER_SIZE..BUCKET_HEADER_SIZE + filled]);

    let mut kept = combined.len();
    if combined.len() > capacity {
        // Cutoff: the last entry boundary still inside the bucket.
        let mut cur = 0;
        while cur < combined.len() {
            let entry = entry_at(&combined, cur, combined.len(), ctx)?;
            if cur + entry.size as usize > capacity {
                break;
            }
            cur += entry.size as usize;
        }
        kept = cur;

        let mut off = kept;
        while off < combined.len() {
            let entry = entry_at(&combined, off, combined.len(), ctx)?;
            let kstart = off + ENTRY_HEADER_SIZE;
            let vstart = kstart + entry.klen as usize;
            on_evict(
                &entry,
                &combined[kstart..vstart],
                &combined[vstart..vstart + entry.vlen as usize],
            )?;
            off += entry.size as usize;
        }
    }

    layout::write_filled(bucket, kept);
    bucket[BUCKET_HEADER_SIZE..BUCKET_HEADER_SIZE + kept].copy_from_slice(&combined[..kept]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    const BUCKETSIZE: usize = 256;

    fn ctx() -> BucketContext<'static> {
        BucketContext {
            path: Path::new("test.map"),
            file_offset: 0,
        }
    }

    fn make_bucket() -> Vec<u8> {
        vec![0u8; BUCKETSIZE]
    }

    /// Insert without any eviction observer.
    fn put(bucket: &mut [u8], key: &[u8], val: &[u8], dirty: bool) {
        insert(bucket, key, val, 1000, dirty, &ctx(), |_, _, _| Ok(())).unwrap();
    }

    fn keys_in_order(bucket: &[u8]) -> Vec<Vec<u8>> {
        walk(bucket, 1000, 0, &ctx())
            .unwrap()
            .iter()
            .map(|e| bucket[e.key_range()].to_vec())
            .collect()
    }

    #[test]
    fn hash_matches_the_times_33_recurrence() {
        assert_eq!(bucket_hash(b""), 0);
        assert_eq!(bucket_hash(b"a"), 97);
        assert_eq!(bucket_hash(b"abc"), 108_966);
        // Accumulation wraps at 32 bits; the modulo is unsigned.
        let h = bucket_hash(b"a long enough key to overflow thirty-two bits");
        assert_eq!(bucket_index(b"abc", 13), (108_966 % 13) as usize);
        assert!(bucket_index(&h.to_le_bytes(), 7) < 7);
    }

    #[test]
    fn new_entry_becomes_the_head() {
        let mut bucket = make_bucket();
        put(&mut bucket, b" k1", b" v1", false);
        put(&mut bucket, b" k2", b" v2", false);
        assert_eq!(keys_in_order(&bucket), vec![b" k2".to_vec(), b" k1".to_vec()]);
    }

    #[test]
    fn find_reports_predecessor_and_payload() {
        let mut bucket = make_bucket();
        put(&mut bucket, b" k1", b" v1", false);
        put(&mut bucket, b" k2", b" v2", true);

        let head = find(&bucket, b" k2", 1000, 0, &ctx()).unwrap().unwrap();
        assert_eq!(head.off, BUCKET_HEADER_SIZE);
        assert!(head.prev_off.is_none());
        assert!(head.header.dirty());
        assert_eq!(&bucket[head.value_range()], b" v2");

        let tail = find(&bucket, b" k1", 1000, 0, &ctx()).unwrap().unwrap();
        assert_eq!(tail.prev_off, Some(head.off));
        assert!(!tail.header.dirty());

        assert!(find(&bucket, b" nope", 1000, 0, &ctx()).unwrap().is_none());
    }

    #[test]
    fn swap_moves_an_entry_one_slot_toward_the_head() {
        let mut bucket = make_bucket();
        put(&mut bucket, b" k1", b" v1", false);
        put(&mut bucket, b" k2", b" v2", false);
        put(&mut bucket, b" k3", b" v3", false);

        let f = find(&bucket, b" k1", 1000, 0, &ctx()).unwrap().unwrap();
        swap_with_predecessor(&mut bucket, f.prev_off.unwrap(), f.off, f.size());

        assert_eq!(
            keys_in_order(&bucket),
            vec![b" k3".to_vec(), b" k1".to_vec(), b" k2".to_vec()]
        );
        // Payloads traveled with their entries.
        let f = find(&bucket, b" k2", 1000, 0, &ctx()).unwrap().unwrap();
        assert_eq!(&bucket[f.value_range()], b" v2");
    }

    #[test]
    fn remove_compacts_and_zeroes_the_tail() {
        let mut bucket = make_bucket();
        put(&mut bucket, b" k1", b" v1", false);
        put(&mut bucket, b" k2", b" v2", false);
        let filled_before = layout::read_filled(&bucket);

        let f = find(&bucket, b" k2", 1000, 0, &ctx()).unwrap().unwrap();
        let size = f.size();
        remove(&mut bucket, f.off, size);

        assert_eq!(layout::read_filled(&bucket), filled_before - size);
        assert_eq!(keys_in_order(&bucket), vec![b" k1".to_vec()]);
        let end = BUCKET_HEADER_SIZE + filled_before;
        assert!(bucket[end - size..end].iter().all(|&b| b == 0));
    }

    #[test]
    fn expiry_is_reported_from_the_stored_time() {
        let mut bucket = make_bucket();
        insert(&mut bucket, b" k", b" v", 1000, false, &ctx(), |_, _, _| Ok(())).unwrap();

        let fresh = find(&bucket, b" k", 1004, 5, &ctx()).unwrap().unwrap();
        assert!(!fresh.expired);
        let stale = find(&bucket, b" k", 1006, 5, &ctx()).unwrap().unwrap();
        assert!(stale.expired);
        let forever = find(&bucket, b" k", 9999, 0, &ctx()).unwrap().unwrap();
        assert!(!forever.expired);
    }

    #[test]
    fn overflow_evicts_the_tail_with_original_payloads() {
        // Capacity 216: each entry below is 40 + 3 + 9 = 52 bytes, so the
        // fifth insert overflows and the oldest entry falls off the tail.
        let mut bucket = make_bucket();
        let mut evicted = Vec::new();
        for i in 0..5u8 {
            let key = [b' ', b'k', b'0' + i];
            insert(
                &mut bucket,
                &key,
                b" payload!",
                1000,
                true,
                &ctx(),
                |h, k, v| {
                    evicted.push((h.dirty(), k.to_vec(), v.to_vec()));
                    Ok(())
                },
            )
            .unwrap();
        }

        assert_eq!(evicted, vec![(true, b" k0".to_vec(), b" payload!".to_vec())]);
        assert_eq!(
            keys_in_order(&bucket),
            vec![b" k4".to_vec(), b" k3".to_vec(), b" k2".to_vec(), b" k1".to_vec()]
        );
    }

    #[test]
    fn failing_eviction_leaves_the_bucket_unchanged() {
        let mut bucket = make_bucket();
        for i in 0..4u8 {
            put(&mut bucket, &[b' ', b'k', b'0' + i], b" payload!", true);
        }
        let before = bucket.clone();

        let err = insert(
            &mut bucket,
            b" k4",
            b" payload!",
            1000,
            true,
            &ctx(),
            |_, _, _| Err(CacheError::Codec("writeback refused".into())),
        )
        .unwrap_err();
        assert!(err.to_string().contains("writeback refused"));
        assert_eq!(bucket, before);
    }

    #[test]
    fn oversized_entry_is_not_stored() {
        let mut bucket = make_bucket();
        let huge = vec![b'x'; BUCKETSIZE];
        insert(&mut bucket, b" k", &huge, 1000, false, &ctx(), |_, _, _| Ok(())).unwrap();
        assert_eq!(layout::read_filled(&bucket), 0);
    }

    #[test]
    fn zero_sized_entry_is_a_corruption_error() {
        let mut bucket = make_bucket();
        put(&mut bucket, b" k", b" v", false);
        // Lie about the live range without writing an entry there.
        layout::write_filled(&mut bucket, 100);
        bucket[BUCKET_HEADER_SIZE..BUCKET_HEADER_SIZE + 4].fill(0);

        let err = find(&bucket, b" k", 1000, 0, &ctx()).unwrap_err();
        assert!(err.to_string().contains("Zero-sized"), "{err}");
    }

    #[test]
    fn entry_past_the_bucket_end_is_super_sized() {
        let mut bucket = make_bucket();
        put(&mut bucket, b" abc", b" def", false);
        layout::write_filled(&mut bucket, 1000);
        // First entry now claims a size that jumps past the bucket end.
        bucket[BUCKET_HEADER_SIZE..BUCKET_HEADER_SIZE + 4]
            .copy_from_slice(&300i32.to_le_bytes());

        let err = find(&bucket, b" abs", 1000, 0, &ctx()).unwrap_err();
        assert!(err.to_string().contains("Super-sized"), "{err}");
    }
}
