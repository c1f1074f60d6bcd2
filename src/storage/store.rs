use nostr::{Event, EventId, Filter};
use std::ops::ControlFlow;
use tracing::debug;

use super::merge::{self, QueryIter};
use super::planner::{self, is_addressable, is_replaceable};
use super::record::RawRecord;
use super::{writer, Backend, IndexView, WriteBatch};
use crate::config::QueryTuning;
use crate::error::{Error, Result};

/// Event store operations consumed by relay and CLI layers.
pub trait EventStore: Send + Sync {
    /// Stores a new event. Fails with [`Error::DupEvent`] if it is already present.
    fn save_event(&self, event: &Event) -> Result<()>;
    /// Stores many events in one transaction, skipping duplicates.
    /// Returns how many were stored.
    fn save_events(&self, events: &[Event]) -> Result<usize>;
    /// Keeps only the newest version of a replaceable or addressable event.
    /// Returns false when a newer version was already stored.
    fn replace_event(&self, event: &Event) -> Result<bool>;
    fn delete_event(&self, id: &EventId) -> Result<bool>;
    fn get_event(&self, id: &EventId) -> Result<Option<Event>>;
    /// Streams matching events newest first until `visit` breaks or the
    /// effective limit is reached.
    fn visit_events(
        &self,
        filter: &Filter,
        max_limit: usize,
        visit: &mut dyn FnMut(Event) -> ControlFlow<()>,
    ) -> Result<()>;
    fn count_events(&self, filter: &Filter) -> Result<u32>;
    fn event_count(&self) -> Result<u64>;
    fn db_path(&self) -> &str;

    fn query_events(&self, filter: &Filter, max_limit: usize) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        self.visit_events(filter, max_limit, &mut |event| {
            events.push(event);
            ControlFlow::Continue(())
        })?;
        Ok(events)
    }

    /// Routes replaceable and addressable kinds through `replace_event`.
    /// Returns whether `event` was written.
    fn store_event(&self, event: &Event) -> Result<bool> {
        let kind = event.kind.as_u16();
        if is_replaceable(kind) || is_addressable(kind) {
            self.replace_event(event)
        } else {
            self.save_event(event).map(|()| true)
        }
    }
}

/// The façade over any [`Backend`]: planning, merging and write logic are
/// shared, the backend only supplies cursors and transactions.
pub struct Store<B> {
    backend: B,
    tuning: QueryTuning,
}

impl<B: Backend> Store<B> {
    pub fn new(backend: B, tuning: QueryTuning) -> Self {
        Self { backend, tuning }
    }
}

impl<B: Backend> EventStore for Store<B> {
    fn save_event(&self, event: &Event) -> Result<()> {
        let mut wtxn = self.backend.begin_write()?;
        writer::save(&mut wtxn, event)?;
        wtxn.commit()
    }

    fn save_events(&self, events: &[Event]) -> Result<usize> {
        let mut wtxn = self.backend.begin_write()?;
        let mut stored = 0;
        for event in events {
            match writer::save(&mut wtxn, event) {
                Ok(()) => stored += 1,
                Err(Error::DupEvent) => continue,
                Err(e) => return Err(e),
            }
        }
        wtxn.commit()?;
        Ok(stored)
    }

    fn replace_event(&self, event: &Event) -> Result<bool> {
        let mut wtxn = self.backend.begin_write()?;
        let stored = writer::replace(&mut wtxn, event, &self.tuning)?;
        if !stored {
            debug!(id = %event.id, "newer version already stored");
        }
        wtxn.commit()?;
        Ok(stored)
    }

    fn delete_event(&self, id: &EventId) -> Result<bool> {
        let mut wtxn = self.backend.begin_write()?;
        let deleted = writer::delete(&mut wtxn, id.as_bytes())?;
        wtxn.commit()?;
        Ok(deleted)
    }

    fn get_event(&self, id: &EventId) -> Result<Option<Event>> {
        let rtxn = self.backend.begin_read()?;
        let Some(ptr) = rtxn.lookup_id(id.as_bytes())? else {
            return Ok(None);
        };
        match rtxn.get_record(ptr)? {
            Some(raw) => Ok(Some(
                RawRecord::parse(raw)
                    .ok_or(Error::CorruptRecord(ptr))?
                    .decode()?,
            )),
            None => Ok(None),
        }
    }

    fn visit_events(
        &self,
        filter: &Filter,
        max_limit: usize,
        visit: &mut dyn FnMut(Event) -> ControlFlow<()>,
    ) -> Result<()> {
        let planned = planner::plan(filter, max_limit);
        let rtxn = self.backend.begin_read()?;
        for event in QueryIter::new(&rtxn, planned, &self.tuning) {
            if visit(event).is_break() {
                break;
            }
        }
        Ok(())
    }

    fn count_events(&self, filter: &Filter) -> Result<u32> {
        let mut counting = filter.clone();
        // the count ignores the limit unless it is an explicit zero
        if counting.limit != Some(0) {
            counting.limit = None;
        }
        let planned = planner::plan(&counting, usize::MAX);
        let rtxn = self.backend.begin_read()?;
        merge::count_matches(&rtxn, planned)
    }

    fn event_count(&self) -> Result<u64> {
        self.backend.begin_read()?.record_count()
    }

    fn db_path(&self) -> &str {
        self.backend.path()
    }
}
