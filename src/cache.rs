//! C2 — the shared cache: entries, readers, lifecycle, invalidation.
//!
//! Grounded in `original_source/cache.c`. The global index is a
//! `FxHashMap<String, Arc<CacheEntry>>` instead of the original's
//! intrusive linked list (the teacher, `epheo-kiss`, already reaches for
//! `rustc_hash::FxHashMap` for its own cache index), but `find_or_create`
//! still performs the same opportunistic reclamation scan described in
//! spec.md §4.2 before ever allocating a new entry.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::error::CacheError;

type Notify = Arc<dyn Fn() + Send + Sync>;

/// A single registered fan-out subscriber.
struct ReaderSlot {
    id: u64,
    notify: Notify,
}

pub struct CacheEntry {
    url: String,
    body: RwLock<Vec<u8>>,
    finished: AtomicBool,
    invalid: AtomicBool,
    readers: Mutex<Vec<ReaderSlot>>,
    next_reader_id: AtomicU64,
}

impl CacheEntry {
    fn new(url: String) -> Self {
        Self {
            url,
            body: RwLock::new(Vec::new()),
            finished: AtomicBool::new(false),
            invalid: AtomicBool::new(false),
            readers: Mutex::new(Vec::new()),
            next_reader_id: AtomicU64::new(0),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Acquire)
    }

    pub fn body_len(&self) -> usize {
        self.body.read().len()
    }

    fn reader_count(&self) -> usize {
        self.readers.lock().len()
    }

    fn reclaimable(&self) -> bool {
        self.is_invalid() && self.is_finished() && self.reader_count() == 0
    }

    /// Snapshot the reader list and invoke each notify callback after the
    /// lock is released. A reader is free to unsubscribe itself (or any
    /// other reader) from within its callback: the snapshot is a plain
    /// `Vec` of cloned `Arc`s taken before any callback runs, so mutating
    /// `self.readers` mid-iteration cannot invalidate it.
    fn fan_out(&self) {
        let snapshot: Vec<Notify> = {
            let guard = self.readers.lock();
            guard.iter().map(|s| Arc::clone(&s.notify)).collect()
        };
        for notify in snapshot {
            notify();
        }
    }
}

/// Result of [`Cache::find_or_create`].
pub enum CacheLookup {
    Found(Arc<CacheEntry>),
    Created(Arc<CacheEntry>),
}

/// A subscription handle: owned by the subscribing client, used only to
/// cancel. Holding this (or the `Arc<CacheEntry>` inside it) past
/// reclamation just keeps the allocation alive in memory; it is not
/// observable through `find_or_create`, which never returns a reclaimed
/// entry regardless of outstanding handles.
pub struct CacheReader {
    entry: Arc<CacheEntry>,
    id: u64,
}

impl CacheReader {
    pub fn entry(&self) -> &Arc<CacheEntry> {
        &self.entry
    }
}

pub struct Cache {
    index: Mutex<FxHashMap<String, Arc<CacheEntry>>>,
}

impl Cache {
    pub fn new() -> Self {
        Self {
            index: Mutex::new(FxHashMap::default()),
        }
    }

    /// Scan entries, reclaiming any that are `invalid && finished` and
    /// readerless; return a `Found` entry whose URL matches and which is
    /// not invalid, or allocate and return a `Created` one.
    pub fn find_or_create(&self, url: &str) -> CacheLookup {
        let mut index = self.index.lock();

        index.retain(|_, entry| !entry.reclaimable());

        if let Some(entry) = index.get(url) {
            if !entry.is_invalid() {
                return CacheLookup::Found(Arc::clone(entry));
            }
        }

        let entry = Arc::new(CacheEntry::new(url.to_string()));
        index.insert(url.to_string(), Arc::clone(&entry));
        CacheLookup::Created(entry)
    }

    /// Insert a new reader, invoke its notify callback once synchronously
    /// (an immediate "you may already have data" signal), and return the
    /// handle used to unsubscribe later.
    pub fn subscribe(
        &self,
        entry: &Arc<CacheEntry>,
        notify: impl Fn() + Send + Sync + 'static,
    ) -> CacheReader {
        let notify: Notify = Arc::new(notify);
        let id = entry.next_reader_id.fetch_add(1, Ordering::Relaxed);
        entry.readers.lock().push(ReaderSlot {
            id,
            notify: Arc::clone(&notify),
        });
        notify();
        CacheReader {
            entry: Arc::clone(entry),
            id,
        }
    }

    pub fn unsubscribe(&self, reader: CacheReader) {
        let mut readers = reader.entry.readers.lock();
        readers.retain(|s| s.id != reader.id);
    }

    /// Copy up to `buf.len()` bytes starting at `offset` into `buf`,
    /// returning the number of bytes copied.
    pub fn extract(
        &self,
        entry: &Arc<CacheEntry>,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<usize, CacheError> {
        let body = entry.body.read();
        if offset > body.len() {
            return Err(CacheError::OffsetOutOfRange {
                offset,
                len: body.len(),
            });
        }
        let available = body.len() - offset;
        let n = available.min(buf.len());
        buf[..n].copy_from_slice(&body[offset..offset + n]);
        Ok(n)
    }

    /// Append producer bytes to the entry's body, then fan out to all
    /// current subscribers. The write lock is released before any
    /// callback runs.
    pub fn append(&self, entry: &Arc<CacheEntry>, data: &[u8]) -> Result<(), CacheError> {
        if entry.is_finished() {
            return Err(CacheError::AlreadyFinished);
        }
        {
            let mut body = entry.body.write();
            body.extend_from_slice(data);
        }
        entry.fan_out();
        Ok(())
    }

    pub fn mark_finished(&self, entry: &Arc<CacheEntry>) {
        entry.finished.store(true, Ordering::Release);
        entry.fan_out();
    }

    pub fn mark_invalid(&self, entry: &Arc<CacheEntry>) {
        entry.invalid.store(true, Ordering::Release);
    }

    pub fn mark_invalid_and_finished(&self, entry: &Arc<CacheEntry>) {
        entry.invalid.store(true, Ordering::Release);
        entry.finished.store(true, Ordering::Release);
        entry.fan_out();
    }

    /// Number of live entries, for diagnostics/tests only.
    pub fn entry_count(&self) -> usize {
        self.index.lock().len()
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AOrdering};

    #[test]
    fn find_or_create_then_found() {
        let cache = Cache::new();
        let entry = match cache.find_or_create("http://example.test/x") {
            CacheLookup::Created(e) => e,
            CacheLookup::Found(_) => panic!("expected Created on first lookup"),
        };
        assert_eq!(entry.url(), "http://example.test/x");

        match cache.find_or_create("http://example.test/x") {
            CacheLookup::Found(e) => assert_eq!(e.url(), "http://example.test/x"),
            CacheLookup::Created(_) => panic!("expected Found on second lookup"),
        }
    }

    #[test]
    fn invalid_entries_are_never_found() {
        let cache = Cache::new();
        let entry = match cache.find_or_create("http://example.test/y") {
            CacheLookup::Created(e) => e,
            _ => unreachable!(),
        };
        cache.mark_invalid_and_finished(&entry);

        match cache.find_or_create("http://example.test/y") {
            CacheLookup::Created(_) => {}
            CacheLookup::Found(_) => panic!("invalid entry must not be returned as Found"),
        }
    }

    #[test]
    fn reclamation_requires_invalid_finished_and_readerless() {
        let cache = Cache::new();
        let entry = match cache.find_or_create("http://example.test/z") {
            CacheLookup::Created(e) => e,
            _ => unreachable!(),
        };
        let reader = cache.subscribe(&entry, || {});
        cache.mark_invalid_and_finished(&entry);

        // Still has a reader: the old entry stays in the index (as a
        // second, draining copy) until the reader unsubscribes.
        assert_eq!(cache.entry_count(), 1);
        cache.unsubscribe(reader);

        // Next scan reclaims it and allocates a fresh one.
        let fresh = match cache.find_or_create("http://example.test/z") {
            CacheLookup::Created(e) => e,
            CacheLookup::Found(_) => panic!("expected a fresh entry post-reclamation"),
        };
        assert!(!fresh.is_invalid());
        assert_eq!(cache.entry_count(), 1);
    }

    #[test]
    fn append_then_extract_roundtrip() {
        let cache = Cache::new();
        let entry = match cache.find_or_create("http://example.test/body") {
            CacheLookup::Created(e) => e,
            _ => unreachable!(),
        };
        cache.append(&entry, b"hello").unwrap();
        let mut buf = [0u8; 5];
        let n = cache.extract(&entry, 0, &mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn extract_past_body_length_errors() {
        let cache = Cache::new();
        let entry = match cache.find_or_create("http://example.test/short") {
            CacheLookup::Created(e) => e,
            _ => unreachable!(),
        };
        cache.append(&entry, b"hi").unwrap();
        let mut buf = [0u8; 4];
        let err = cache.extract(&entry, 10, &mut buf).unwrap_err();
        assert!(matches!(err, CacheError::OffsetOutOfRange { .. }));
    }

    #[test]
    fn append_after_finished_is_rejected() {
        let cache = Cache::new();
        let entry = match cache.find_or_create("http://example.test/done") {
            CacheLookup::Created(e) => e,
            _ => unreachable!(),
        };
        cache.mark_finished(&entry);
        let err = cache.append(&entry, b"late").unwrap_err();
        assert!(matches!(err, CacheError::AlreadyFinished));
    }

    #[test]
    fn subscribe_fires_immediately_then_on_append() {
        let cache = Cache::new();
        let entry = match cache.find_or_create("http://example.test/notify") {
            CacheLookup::Created(e) => e,
            _ => unreachable!(),
        };
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let reader = cache.subscribe(&entry, move || {
            calls2.fetch_add(1, AOrdering::SeqCst);
        });
        assert_eq!(calls.load(AOrdering::SeqCst), 1, "immediate synchronous fire");

        cache.append(&entry, b"x").unwrap();
        assert_eq!(calls.load(AOrdering::SeqCst), 2);

        cache.unsubscribe(reader);
        cache.append(&entry, b"y").unwrap();
        assert_eq!(calls.load(AOrdering::SeqCst), 2, "no callback after unsubscribe");
    }

    #[test]
    fn reader_can_unsubscribe_itself_from_within_callback() {
        let cache = Cache::new();
        let entry = match cache.find_or_create("http://example.test/self-cancel") {
            CacheLookup::Created(e) => e,
            _ => unreachable!(),
        };
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        let _r1 = cache.subscribe(&entry, move || {
            seen2.fetch_add(1, AOrdering::SeqCst);
        });
        let seen3 = Arc::clone(&seen);
        let _r2 = cache.subscribe(&entry, move || {
            seen3.fetch_add(1, AOrdering::SeqCst);
        });
        // two immediate fires already happened during subscribe()
        assert_eq!(seen.load(AOrdering::SeqCst), 2);
        cache.append(&entry, b"z").unwrap();
        assert_eq!(seen.load(AOrdering::SeqCst), 4);
    }
}
