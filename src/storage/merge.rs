//! Merges many descending index scans into one newest-first event stream.

use nostr::Event;
use std::cmp::Ordering;
use std::collections::{HashSet, VecDeque};
use tracing::warn;

use super::iterator::IndexIterator;
use super::planner::{self, AbstractQuery, Plan, PlannedQuery};
use super::record::RawRecord;
use super::residual::Residual;
use super::{IndexView, RecordPtr};
use crate::config::QueryTuning;
use crate::error::Result;

/// Entries pulled per step when counting.
const COUNT_BATCH: usize = 256;

// ---------------------------------------------------------------------------
// Quickselect
// ---------------------------------------------------------------------------

/// Reorders `items` so the `k` elements with the greatest keys occupy
/// `items[..k]`, in no particular order. Average O(n).
pub fn select_top<T, K: Ord>(items: &mut [T], k: usize, key: impl Fn(&T) -> K) {
    if k == 0 || k >= items.len() {
        return;
    }
    let target = k - 1;
    let (mut low, mut high) = (0, items.len() - 1);
    while low < high {
        let (lt, gt) = partition(items, low, high, &key);
        if target < lt {
            high = lt - 1;
        } else if target > gt {
            low = gt + 1;
        } else {
            return;
        }
    }
}

/// Three-way partition of `items[low..=high]` around its middle element,
/// greatest first. Returns the inclusive range holding keys equal to the pivot.
fn partition<T, K: Ord>(
    items: &mut [T],
    low: usize,
    high: usize,
    key: &impl Fn(&T) -> K,
) -> (usize, usize) {
    let pivot = key(&items[low + (high - low) / 2]);
    let (mut lt, mut i, mut gt) = (low, low, high);
    while i <= gt {
        match key(&items[i]).cmp(&pivot) {
            Ordering::Greater => {
                items.swap(lt, i);
                lt += 1;
                i += 1;
            }
            Ordering::Less => {
                items.swap(i, gt);
                if gt == 0 {
                    break;
                }
                gt -= 1;
            }
            Ordering::Equal => i += 1,
        }
    }
    (lt, gt)
}

/// Newest first; equal timestamps by descending id.
fn newest_first(a: &Event, b: &Event) -> Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| b.id.as_bytes().cmp(a.id.as_bytes()))
}

// ---------------------------------------------------------------------------
// QueryIter
// ---------------------------------------------------------------------------

struct Scan<'a, V: IndexView + 'a> {
    iterators: Vec<IndexIterator<'a, V::Cursor<'a>>>,
    batch: usize,
    fanout: usize,
    since: u32,
}

/// Lazy, newest-first stream of events matching a planned query.
///
/// Each round refills only the iterators blocking progress and emits
/// everything strictly newer than what any iterator can still produce.
/// Dropping the iterator closes every cursor.
pub struct QueryIter<'a, V: IndexView + 'a> {
    view: &'a V,
    scan: Option<Scan<'a, V>>,
    residual: Residual,
    limit: usize,
    emitted: usize,
    ready: VecDeque<Event>,
    /// Pointers already emitted; only needed when several scans may overlap.
    seen: Option<HashSet<RecordPtr>>,
}

impl<'a, V: IndexView + 'a> QueryIter<'a, V> {
    pub fn new(view: &'a V, planned: PlannedQuery, tuning: &QueryTuning) -> Self {
        let limit = planned.limit;
        let mut iter = Self {
            view,
            scan: None,
            residual: Residual::default(),
            limit,
            emitted: 0,
            ready: VecDeque::new(),
            seen: None,
        };

        match planned.plan {
            Plan::Nothing => {}
            Plan::Ids { ids, residual } => {
                iter.residual = residual;
                let mut events: Vec<Event> = ids
                    .iter()
                    .filter_map(|id| iter.fetch_by_id(id))
                    .collect();
                events.sort_unstable_by(newest_first);
                events.truncate(limit);
                iter.ready = events.into();
            }
            Plan::Scan {
                queries,
                residual,
                since,
            } => {
                iter.residual = residual;
                if queries.len() > 1 {
                    iter.seen = Some(HashSet::new());
                }
                let batch = planner::batch_size(limit, queries.len(), tuning);
                let fanout = planner::fanout(queries.len(), tuning);
                let iterators = open_iterators(view, queries, batch, since);
                iter.scan = Some(Scan {
                    iterators,
                    batch,
                    fanout,
                    since,
                });
            }
        }
        iter
    }

    fn fetch_by_id(&self, id: &[u8; 32]) -> Option<Event> {
        let ptr = match self.view.lookup_id(id) {
            Ok(Some(ptr)) => ptr,
            Ok(None) => return None,
            Err(e) => {
                warn!("id lookup failed: {}", e);
                return None;
            }
        };
        self.fetch(ptr)
    }

    /// Loads the record at `ptr` and applies the residual predicates.
    fn fetch(&self, ptr: RecordPtr) -> Option<Event> {
        let raw = match self.view.get_record(ptr) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                warn!(ptr, "index entry points at a missing record");
                return None;
            }
            Err(e) => {
                warn!(ptr, "record fetch failed: {}", e);
                return None;
            }
        };
        let Some(record) = RawRecord::parse(raw) else {
            warn!(ptr, "skipping truncated record");
            return None;
        };
        if !self.residual.matches_header(&record) {
            return None;
        }
        let event = match record.decode() {
            Ok(event) => event,
            Err(e) => {
                warn!(ptr, "skipping undecodable record: {}", e);
                return None;
            }
        };
        self.residual.matches_tags(&event).then_some(event)
    }

    /// Runs one merge round. Returns false once every iterator is drained.
    fn round(&mut self) -> bool {
        let Some(mut scan) = self.scan.take() else {
            return false;
        };
        scan.iterators
            .retain(|it| !(it.exhausted && it.entries.is_empty()));
        if scan.iterators.is_empty() {
            return false;
        }

        let k = scan.fanout.min(scan.iterators.len());
        select_top(&mut scan.iterators, k, |it| it.bound());
        // Nothing outside the top group can produce anything above this.
        let threshold = scan.iterators[..k].iter().filter_map(|it| it.bound()).max();

        let mut batch = Vec::new();
        for it in scan.iterators.iter_mut() {
            let mut i = 0;
            while i < it.entries.len() {
                let (created_at, ptr) = it.entries[i];
                if threshold.map_or(true, |t| created_at > t) {
                    it.entries.swap_remove(i);
                    let fresh = self.seen.as_mut().map_or(true, |seen| seen.insert(ptr));
                    if fresh {
                        if let Some(event) = self.fetch(ptr) {
                            batch.push(event);
                        }
                    }
                } else {
                    i += 1;
                }
            }
        }
        batch.sort_unstable_by(newest_first);
        self.ready.extend(batch);

        for it in scan.iterators[..k].iter_mut() {
            if !it.exhausted {
                it.pull(scan.batch, scan.since);
            }
        }
        self.scan = Some(scan);
        true
    }
}

fn open_iterators<'a, V: IndexView>(
    view: &'a V,
    queries: Vec<AbstractQuery>,
    batch: usize,
    since: u32,
) -> Vec<IndexIterator<'a, V::Cursor<'a>>> {
    let mut iterators = Vec::with_capacity(queries.len());
    for query in queries {
        let cursor = match view.open_cursor(query.index) {
            Ok(cursor) => cursor,
            Err(e) => {
                warn!(index = ?query.index, "failed to open cursor: {}", e);
                continue;
            }
        };
        let mut it = IndexIterator::new(cursor, query);
        it.seek();
        it.pull(batch, since);
        iterators.push(it);
    }
    iterators
}

impl<'a, V: IndexView + 'a> Iterator for QueryIter<'a, V> {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        loop {
            if self.emitted >= self.limit {
                self.scan = None;
                self.ready.clear();
                return None;
            }
            if let Some(event) = self.ready.pop_front() {
                self.emitted += 1;
                return Some(event);
            }
            if !self.round() {
                return None;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Counting
// ---------------------------------------------------------------------------

/// Counts events matching `planned`, ignoring its limit. Records are only
/// decoded when residual tag conditions require it. Entries that fail to
/// load are logged and left out of the count.
pub fn count_matches<V: IndexView>(view: &V, planned: PlannedQuery) -> Result<u32> {
    let (queries, residual, since) = match planned.plan {
        Plan::Nothing => return Ok(0),
        Plan::Ids { ids, residual } => {
            let mut count = 0u32;
            for id in &ids {
                let ptr = match view.lookup_id(id) {
                    Ok(Some(ptr)) => ptr,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!("id lookup failed: {}", e);
                        continue;
                    }
                };
                if counts(view, ptr, &residual) {
                    count += 1;
                }
            }
            return Ok(count);
        }
        Plan::Scan {
            queries,
            residual,
            since,
        } => (queries, residual, since),
    };

    let mut seen: HashSet<RecordPtr> = HashSet::new();
    let dedupe = queries.len() > 1;
    let mut count = 0u32;
    for query in queries {
        let cursor = match view.open_cursor(query.index) {
            Ok(cursor) => cursor,
            Err(e) => {
                warn!(index = ?query.index, "failed to open cursor: {}", e);
                continue;
            }
        };
        let mut it = IndexIterator::new(cursor, query);
        it.seek();
        loop {
            it.pull(COUNT_BATCH, since);
            for (_, ptr) in it.entries.drain(..) {
                if dedupe && !seen.insert(ptr) {
                    continue;
                }
                if counts(view, ptr, &residual) {
                    count = count.saturating_add(1);
                }
            }
            if it.exhausted {
                break;
            }
        }
    }
    Ok(count)
}

fn counts<V: IndexView>(view: &V, ptr: RecordPtr, residual: &Residual) -> bool {
    let raw = match view.get_record(ptr) {
        Ok(Some(raw)) => raw,
        Ok(None) => {
            warn!(ptr, "index entry points at a missing record");
            return false;
        }
        Err(e) => {
            warn!(ptr, "record fetch failed: {}", e);
            return false;
        }
    };
    let Some(record) = RawRecord::parse(raw) else {
        warn!(ptr, "skipping truncated record");
        return false;
    };
    if !residual.matches_header(&record) {
        return false;
    }
    if !residual.needs_decode() {
        return true;
    }
    match record.decode() {
        Ok(event) => residual.matches_tags(&event),
        Err(e) => {
            warn!(ptr, "skipping undecodable record: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::storage::memory::{MemoryCursor, MemoryReader};
    use crate::storage::{writer, Backend, IndexId, MemoryBackend, WriteBatch};
    use nostr::{EventBuilder, Filter, Keys, Kind, Timestamp};

    /// A read view that fails to load one record and one id.
    struct FlakyView<'b> {
        inner: MemoryReader<'b>,
        broken_ptr: RecordPtr,
        broken_id: [u8; 32],
    }

    impl<'b> IndexView for FlakyView<'b> {
        type Cursor<'a> = MemoryCursor<'a> where Self: 'a;

        fn open_cursor(&self, index: IndexId) -> Result<MemoryCursor<'_>> {
            self.inner.open_cursor(index)
        }

        fn get_record(&self, ptr: RecordPtr) -> Result<Option<&[u8]>> {
            if ptr == self.broken_ptr {
                return Err(Error::CorruptRecord(ptr));
            }
            self.inner.get_record(ptr)
        }

        fn lookup_id(&self, id: &[u8; 32]) -> Result<Option<RecordPtr>> {
            if *id == self.broken_id {
                return Err(Error::LockPoisoned);
            }
            self.inner.lookup_id(id)
        }

        fn record_count(&self) -> Result<u64> {
            self.inner.record_count()
        }
    }

    fn note(keys: &Keys, created_at: u64) -> Event {
        EventBuilder::new(Kind::from(1), format!("note {}", created_at), [])
            .custom_created_at(Timestamp::from(created_at))
            .to_event(keys)
            .unwrap()
    }

    #[test]
    fn failed_loads_are_skipped_not_fatal() {
        let keys = Keys::generate();
        let events: Vec<Event> = (1..=4).map(|ts| note(&keys, ts)).collect();
        let backend = MemoryBackend::new();
        let mut wtxn = backend.begin_write().unwrap();
        for event in &events {
            writer::save(&mut wtxn, event).unwrap();
        }
        wtxn.commit().unwrap();

        let broken_ptr = backend
            .begin_read()
            .unwrap()
            .lookup_id(events[1].id.as_bytes())
            .unwrap()
            .unwrap();
        let view = FlakyView {
            inner: backend.begin_read().unwrap(),
            broken_ptr,
            broken_id: *events[2].id.as_bytes(),
        };

        let by_author = Filter::new().author(keys.public_key());
        assert_eq!(count_matches(&view, planner::plan(&by_author, 100)).unwrap(), 3);
        let streamed: Vec<Event> =
            QueryIter::new(&view, planner::plan(&by_author, 100), &QueryTuning::default()).collect();
        assert_eq!(streamed.len(), 3);

        let by_ids = Filter::new().ids(events.iter().map(|e| e.id));
        // one id fails to resolve, another resolves to the broken record
        assert_eq!(count_matches(&view, planner::plan(&by_ids, 100)).unwrap(), 2);
    }

    #[test]
    fn select_top_groups_greatest_keys() {
        let mut items = vec![5, 1, 9, 3, 7, 9, 2, 8, 6, 4];
        select_top(&mut items, 3, |x| *x);
        let mut top = items[..3].to_vec();
        top.sort();
        assert_eq!(top, vec![8, 9, 9]);
        assert!(items[3..].iter().all(|x| *x <= 8));
    }

    #[test]
    fn select_top_handles_duplicates_and_options() {
        let mut items = vec![None, Some(3), None, Some(3), Some(3), Some(1), None];
        select_top(&mut items, 2, |x| *x);
        assert_eq!(&items[..2], &[Some(3), Some(3)]);

        let mut same = vec![4; 50];
        select_top(&mut same, 10, |x| *x);
        assert_eq!(same, vec![4; 50]);
    }

    #[test]
    fn select_top_is_a_noop_at_the_edges() {
        let mut items = vec![2, 1, 3];
        select_top(&mut items, 0, |x| *x);
        select_top(&mut items, 3, |x| *x);
        assert_eq!(items, vec![2, 1, 3]);
    }

    #[test]
    fn select_top_matches_sorting_on_many_inputs() {
        // small deterministic LCG so the test needs no extra deps
        let mut state = 7u64;
        for n in 1..60usize {
            let mut items: Vec<u64> = (0..n)
                .map(|_| {
                    state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
                    (state >> 33) % 20
                })
                .collect();
            for k in 1..=n {
                let mut expected = items.clone();
                expected.sort_by(|a, b| b.cmp(a));
                select_top(&mut items, k, |x| *x);
                let mut top = items[..k].to_vec();
                top.sort_by(|a, b| b.cmp(a));
                assert_eq!(top, expected[..k].to_vec(), "n={} k={}", n, k);
            }
        }
    }
}
