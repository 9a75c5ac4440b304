//! Union reader (spec §4.4): merges many archives' tree scanners into one
//! monotonically non-decreasing, deduplicated, seek-windowed, optionally
//! filtered stream.
//!
//! Grounded directly on spec §4.4.1–§4.4.4's pseudocode: a small sorted
//! array of [`BufferedScanner`]s, kept in ascending `cacheKey` order
//! (invalid caches last), a fast path through `readWhile` and a slow path
//! that refreshes the cache, suppresses duplicates with a bounded reverse
//! insertion sort, and advances seek windows.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::warn;

use snapdb_tree::{KeyType, NodeEncoding, NodeStore, Scanner, ValueType};

use crate::Error;

/// An iterator over inclusive `[startOfFrame, endOfFrame]` key windows,
/// produced in ascending, non-overlapping order (spec §4.4.5).
pub trait SeekFilter<K> {
    fn reset(&mut self);
    /// Advance to the next window. Returns `false` once windows are
    /// exhausted, at which point the reader transitions to end-of-stream.
    fn next_window(&mut self) -> bool;
    fn start_of_frame(&self) -> K;
    fn end_of_frame(&self) -> K;
}

/// A seek filter with a single window spanning the whole key space.
pub struct UniverseSeekFilter<K> {
    lower: K,
    upper: K,
    opened: bool,
}

impl<K: Copy> UniverseSeekFilter<K> {
    pub fn new(lower: K, upper: K) -> Self {
        Self { lower, upper, opened: false }
    }
}

impl<K: Copy> SeekFilter<K> for UniverseSeekFilter<K> {
    fn reset(&mut self) {
        self.opened = false;
    }

    fn next_window(&mut self) -> bool {
        if self.opened {
            false
        } else {
            self.opened = true;
            true
        }
    }

    fn start_of_frame(&self) -> K {
        self.lower
    }

    fn end_of_frame(&self) -> K {
        self.upper
    }
}

/// A pure, side-effect-free per-record predicate applied after seek
/// filtering (spec §4.4.5).
pub trait MatchFilter<K, V> {
    fn contains(&self, key: &K, value: &V) -> bool;
}

/// A clonable handle that can cancel a [`UnionReader`] from another thread
/// (spec §4.4.6, §5: "exposes `cancel()` which atomically sets a flag").
#[derive(Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, AtomicOrdering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(AtomicOrdering::Relaxed)
    }
}

struct BufferedScanner<'a, K, V, E, S> {
    scanner: Scanner<'a, K, V, E, S>,
    cache: Option<(K, V)>,
}

impl<'a, K, V, E, S> BufferedScanner<'a, K, V, E, S>
where
    K: KeyType,
    V: ValueType,
    E: NodeEncoding<K, V>,
    S: NodeStore,
{
    fn new(scanner: Scanner<'a, K, V, E, S>) -> Result<Self, Error> {
        let mut s = Self { scanner, cache: None };
        s.refresh()?;
        Ok(s)
    }

    fn cache_key(&self) -> Option<K> {
        self.cache.map(|(k, _)| k)
    }

    fn refresh(&mut self) -> Result<(), Error> {
        self.cache = self.scanner.peek()?;
        Ok(())
    }

    fn seek_to_key(&mut self, key: &K) -> Result<(), Error> {
        self.scanner.seek_to_key(key)?;
        self.refresh()
    }

    fn read(&mut self) -> Result<Option<(K, V)>, Error> {
        let item = self.scanner.read()?;
        self.refresh()?;
        Ok(item)
    }

    fn read_while(&mut self, upper_bound: &K) -> Result<Option<(K, V)>, Error> {
        let item = self.scanner.read_while(upper_bound)?;
        if item.is_some() {
            self.refresh()?;
        }
        Ok(item)
    }

    fn read_while_matching<M: MatchFilter<K, V>>(&mut self, upper_bound: &K, filter: &M) -> Result<Option<(K, V)>, Error> {
        let item = self.scanner.read_while_matching(upper_bound, |k, v| filter.contains(k, v))?;
        if item.is_some() {
            self.refresh()?;
        }
        Ok(item)
    }
}

fn cache_order<K: KeyType, V: ValueType>(a: &Option<(K, V)>, b: &Option<(K, V)>) -> Ordering {
    match (a, b) {
        (Some((ka, _)), Some((kb, _))) => ka.cmp(kb),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Merges many archive scanners into one sorted, deduplicated stream (spec
/// §4.4). Not safe for concurrent use by more than one thread at a time
/// (spec §5); `cancel_handle` is the one escape hatch meant to be called
/// from elsewhere.
pub struct UnionReader<'a, K, V, E, S, F, M> {
    scanners: Vec<BufferedScanner<'a, K, V, E, S>>,
    seek_filter: F,
    match_filter: Option<M>,
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
    point_count: u64,
    safe_point_interval: u64,
    safe_point: Option<Box<dyn FnMut() + 'a>>,
    upper_bound: Option<K>,
    stream_ended: bool,
}

impl<'a, K, V, E, S, F, M> UnionReader<'a, K, V, E, S, F, M>
where
    K: KeyType,
    V: ValueType,
    E: NodeEncoding<K, V>,
    S: NodeStore,
    F: SeekFilter<K>,
    M: MatchFilter<K, V>,
{
    pub fn new(scanners: Vec<Scanner<'a, K, V, E, S>>, seek_filter: F, match_filter: Option<M>) -> Result<Self, Error> {
        let mut buffered = Vec::with_capacity(scanners.len());
        for scanner in scanners {
            buffered.push(BufferedScanner::new(scanner)?);
        }
        let mut reader = Self {
            scanners: buffered,
            seek_filter,
            match_filter,
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: None,
            point_count: 0,
            safe_point_interval: 10_000,
            safe_point: None,
            upper_bound: None,
            stream_ended: false,
        };
        reader.full_sort();
        Ok(reader)
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancelled.clone())
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.deadline = Some(Instant::now() + timeout);
    }

    /// Registers a callback invoked every `interval` emitted points (spec
    /// §4.4.6, default 10,000) so a caller can pulse a scheduler during a
    /// long scan.
    pub fn set_safe_point(&mut self, interval: u64, callback: Box<dyn FnMut() + 'a>) {
        self.safe_point_interval = interval.max(1);
        self.safe_point = Some(callback);
    }

    pub fn point_count(&self) -> u64 {
        self.point_count
    }

    fn full_sort(&mut self) {
        self.scanners.sort_by(|a, b| cache_order(&a.cache, &b.cache));
    }

    /// Bounded reverse insertion sort (spec §4.4.4): `scanners[idx]`'s key
    /// just increased (a read or seek happened), so slide it rightward
    /// until it's back in order. Each call moves it only as far as it
    /// needs to go, not a full re-sort.
    fn rerank_up(&mut self, mut idx: usize) {
        while idx + 1 < self.scanners.len() && cache_order(&self.scanners[idx].cache, &self.scanners[idx + 1].cache) == Ordering::Greater {
            self.scanners.swap(idx, idx + 1);
            idx += 1;
        }
    }

    fn recompute_upper_bound(&mut self) {
        let neighbor = self.scanners.get(1).and_then(|s| s.cache_key());
        let end = self.seek_filter.end_of_frame();
        self.upper_bound = Some(match neighbor {
            Some(k) if k < end => k,
            _ => end,
        });
    }

    /// Advance to the seek filter's next window, re-seeking any scanner
    /// that fell behind the new window start, and re-sort. Returns `false`
    /// (and marks the stream ended) once windows are exhausted.
    fn open_or_advance_window(&mut self) -> Result<bool, Error> {
        if !self.seek_filter.next_window() {
            self.stream_ended = true;
            return Ok(false);
        }
        let start = self.seek_filter.start_of_frame();
        for scanner in &mut self.scanners {
            if matches!(scanner.cache_key(), Some(k) if k < start) {
                scanner.seek_to_key(&start)?;
            }
        }
        self.full_sort();
        self.recompute_upper_bound();
        Ok(true)
    }

    /// Duplicate suppression (spec §4.4.4): while the head and the next
    /// scanner share a key, advance the trailing one past it and re-rank.
    fn verify_and_restore_sort(&mut self) -> Result<(), Error> {
        self.rerank_up(0);
        let Some(k0) = self.scanners[0].cache_key() else { return Ok(()) };
        while self.scanners.len() > 1 && self.scanners[1].cache_key() == Some(k0) {
            self.scanners[1].read()?;
            self.rerank_up(1);
        }
        Ok(())
    }

    /// `readNext(outKey, outValue)` (spec §4.4.3). Returns `Ok(None)` at a
    /// genuine end of stream and `Err(Error::Cancelled)` if cancelled or
    /// timed out.
    pub fn read_next(&mut self) -> Result<Option<(K, V)>, Error> {
        if self.stream_ended {
            return Ok(None);
        }
        if self.upper_bound.is_none() && !self.open_or_advance_window()? {
            return Ok(None);
        }

        loop {
            if self.stream_ended {
                return Ok(None);
            }
            if self.cancelled.load(AtomicOrdering::Relaxed) || self.deadline.is_some_and(|d| Instant::now() >= d) {
                self.cancelled.store(true, AtomicOrdering::Relaxed);
                self.scanners.clear();
                return Err(Error::Cancelled);
            }

            let Some(upper) = self.upper_bound else { return Ok(None) };

            let emitted = match &self.match_filter {
                Some(filter) => self.scanners[0].read_while_matching(&upper, filter)?,
                None => self.scanners[0].read_while(&upper)?,
            };
            if let Some(pair) = emitted {
                self.point_count += 1;
                if self.point_count % self.safe_point_interval == 0 {
                    if let Some(cb) = &mut self.safe_point {
                        cb();
                    }
                }
                self.rerank_up(0);
                return Ok(Some(pair));
            }

            // Slow path: either a node-boundary return, a duplicate, or a
            // seek-window transition.
            self.scanners[0].refresh()?;
            if matches!(self.scanners[0].cache_key(), Some(k) if k < upper) {
                continue;
            }
            self.verify_and_restore_sort()?;

            let Some(k0) = self.scanners[0].cache_key() else {
                self.stream_ended = true;
                return Ok(None);
            };
            let end = self.seek_filter.end_of_frame();
            if k0 == end {
                let item = self.scanners[0].read()?;
                self.rerank_up(0);
                self.open_or_advance_window()?;
                match item {
                    Some((k, v)) => {
                        let passes = match &self.match_filter {
                            Some(f) => f.contains(&k, &v),
                            None => true,
                        };
                        if passes {
                            return Ok(Some((k, v)));
                        }
                        continue;
                    }
                    None => continue,
                }
            }
            if k0 > end {
                if !self.open_or_advance_window()? {
                    return Ok(None);
                }
                continue;
            }
            // k0 is inside the current frame but not less than `upper`
            // purely because of a tied neighbor; the dedup pass above
            // already resolved it, loop and re-evaluate.
        }
    }
}

impl<'a, K, V, E, S, F, M> Drop for UnionReader<'a, K, V, E, S, F, M> {
    fn drop(&mut self) {
        if self.cancelled.load(AtomicOrdering::Relaxed) && !self.scanners.is_empty() {
            warn!("union reader dropped with a cancelled scan still holding scanners");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::File;
    use crate::guid::Guid;
    use snapdb_tree::FixedSizePair;

    struct EvenMatch;
    impl MatchFilter<i32, i32> for EvenMatch {
        fn contains(&self, _key: &i32, value: &i32) -> bool {
            value % 2 == 0
        }
    }

    struct WindowsFilter {
        windows: Vec<(i32, i32)>,
        idx: usize,
    }
    impl SeekFilter<i32> for WindowsFilter {
        fn reset(&mut self) {
            self.idx = 0;
        }
        fn next_window(&mut self) -> bool {
            if self.idx >= self.windows.len() {
                false
            } else {
                self.idx += 1;
                true
            }
        }
        fn start_of_frame(&self) -> i32 {
            self.windows[self.idx - 1].0
        }
        fn end_of_frame(&self) -> i32 {
            self.windows[self.idx - 1].1
        }
    }

    fn make_archive(entries: &[(i32, i32)]) -> File {
        let mut file = File::create_in_memory(4096, 0).unwrap();
        let mut edit = file.begin_edit().unwrap();
        let id = edit.create_sub_file(crate::guid::PRIMARY_ARCHIVE_PURPOSE, Guid::ZERO, Guid::ZERO).unwrap();
        edit.with_tree::<i32, i32, FixedSizePair, _>(id, |tree| {
            for (k, v) in entries {
                tree.try_add(k, v)?;
            }
            Ok(())
        })
        .unwrap();
        edit.commit().unwrap();
        file
    }

    #[test]
    fn duplicate_suppression_across_two_archives() {
        let file_a = make_archive(&[(10, 1), (20, 2), (30, 3)]);
        let file_b = make_archive(&[(10, 11), (20, 22), (30, 33)]);
        let snap_a = file_a.snapshot();
        let snap_b = file_b.snapshot();
        let id_a = snap_a.find_sub_file(crate::guid::PRIMARY_ARCHIVE_PURPOSE).unwrap();
        let id_b = snap_b.find_sub_file(crate::guid::PRIMARY_ARCHIVE_PURPOSE).unwrap();
        let tree_a = snap_a.open_sub_file::<i32, i32, FixedSizePair>(id_a).unwrap();
        let tree_b = snap_b.open_sub_file::<i32, i32, FixedSizePair>(id_b).unwrap();
        let scanners = vec![tree_a.create_scanner(), tree_b.create_scanner()];
        let seek_filter = UniverseSeekFilter::new(i32::MIN, i32::MAX);
        let mut reader = UnionReader::<_, _, FixedSizePair, _, _, EvenMatch>::new(scanners, seek_filter, None).unwrap();

        let mut keys = Vec::new();
        while let Some((k, _v)) = reader.read_next().unwrap() {
            keys.push(k);
        }
        assert_eq!(keys, vec![10, 20, 30]);
    }

    #[test]
    fn seek_windows_emit_only_requested_ranges() {
        let file = make_archive(&(1..100).map(|k| (k, k)).collect::<Vec<_>>());
        let snap = file.snapshot();
        let id = snap.find_sub_file(crate::guid::PRIMARY_ARCHIVE_PURPOSE).unwrap();
        let tree = snap.open_sub_file::<i32, i32, FixedSizePair>(id).unwrap();
        let seek_filter = WindowsFilter { windows: vec![(10, 20), (50, 60)], idx: 0 };
        let mut reader = UnionReader::<_, _, FixedSizePair, _, _, EvenMatch>::new(vec![tree.create_scanner()], seek_filter, None).unwrap();

        let mut keys = Vec::new();
        while let Some((k, _v)) = reader.read_next().unwrap() {
            keys.push(k);
        }
        let expected: Vec<i32> = (10..=20).chain(50..=60).collect();
        assert_eq!(keys, expected);
    }

    #[test]
    fn match_filter_restricts_to_even_values() {
        let file = make_archive(&(1..100).map(|k| (k, k)).collect::<Vec<_>>());
        let snap = file.snapshot();
        let id = snap.find_sub_file(crate::guid::PRIMARY_ARCHIVE_PURPOSE).unwrap();
        let tree = snap.open_sub_file::<i32, i32, FixedSizePair>(id).unwrap();
        let seek_filter = WindowsFilter { windows: vec![(10, 20), (50, 60)], idx: 0 };
        let mut reader = UnionReader::new(vec![tree.create_scanner()], seek_filter, Some(EvenMatch)).unwrap();

        let mut keys = Vec::new();
        while let Some((k, _v)) = reader.read_next().unwrap() {
            keys.push(k);
        }
        let expected: Vec<i32> = (10..=20).step_by(2).chain((50..=60).step_by(2)).collect();
        assert_eq!(keys, expected);
    }

    #[test]
    fn cancel_handle_stops_the_reader() {
        let file = make_archive(&(1..1000).map(|k| (k, k)).collect::<Vec<_>>());
        let snap = file.snapshot();
        let id = snap.find_sub_file(crate::guid::PRIMARY_ARCHIVE_PURPOSE).unwrap();
        let tree = snap.open_sub_file::<i32, i32, FixedSizePair>(id).unwrap();
        let seek_filter = UniverseSeekFilter::new(i32::MIN, i32::MAX);
        let mut reader = UnionReader::<_, _, FixedSizePair, _, _, EvenMatch>::new(vec![tree.create_scanner()], seek_filter, None).unwrap();
        let handle = reader.cancel_handle();
        handle.cancel();
        assert!(matches!(reader.read_next(), Err(Error::Cancelled)));
    }
}
