use tracing::warn;

use super::keys;
use super::planner::AbstractQuery;
use super::{IndexCursor, RecordPtr};

/// Pulls `(created_at, pointer)` pairs for one [`AbstractQuery`] in
/// descending time order, a bounded batch at a time.
pub struct IndexIterator<'a, C> {
    cursor: C,
    pub query: AbstractQuery,
    /// Buffered entries not yet consumed by the merge.
    pub entries: Vec<(u32, RecordPtr)>,
    /// Timestamp of the most recently buffered entry, the smallest so far.
    pub last: Option<u32>,
    pub exhausted: bool,
    lookahead: Option<&'a [u8]>,
}

impl<'a, C: IndexCursor<'a>> IndexIterator<'a, C> {
    pub fn new(cursor: C, query: AbstractQuery) -> Self {
        Self {
            cursor,
            query,
            entries: Vec::new(),
            last: None,
            exhausted: false,
            lookahead: None,
        }
    }

    /// Highest timestamp this iterator may still produce from its cursor.
    #[inline]
    pub fn bound(&self) -> Option<u32> {
        if self.exhausted {
            None
        } else {
            self.last.or(Some(u32::MAX))
        }
    }

    /// Positions the cursor at the greatest key `<= starting_point`.
    pub fn seek(&mut self) {
        let start = &self.query.starting_point;
        let mut key = start.clone();
        if start.ends_with(&u32::MAX.to_be_bytes()) {
            // `until` saturated: entries stamped u32::MAX must still be reached
            key.extend_from_slice(&[0xff; keys::PTR_LEN]);
        }
        match self.cursor.seek(&key) {
            Ok(found) => self.lookahead = found,
            Err(e) => self.fail(e),
        }
    }

    /// Buffers up to `n` more entries no older than `since`.
    pub fn pull(&mut self, n: usize, since: u32) {
        let prefix_len = self.query.prefix.len();
        let mut pulled = 0;
        while pulled < n && !self.exhausted {
            let Some(key) = self.lookahead else {
                self.exhausted = true;
                break;
            };
            if !key.starts_with(&self.query.prefix) {
                self.exhausted = true;
                break;
            }
            if let Some((created_at, ptr)) = keys::split_suffix(key, prefix_len) {
                if created_at < since {
                    self.exhausted = true;
                    break;
                }
                self.entries.push((created_at, ptr));
                self.last = Some(created_at);
                pulled += 1;
            }
            match self.cursor.prev() {
                Ok(next) => self.lookahead = next,
                Err(e) => self.fail(e),
            }
        }
    }

    fn fail(&mut self, error: crate::error::Error) {
        warn!(index = ?self.query.index, "index scan aborted: {}", error);
        self.lookahead = None;
        self.exhausted = true;
    }
}
