//! Mutations shared by every backend, run inside one write batch.

use nostr::{Event, Filter};
use tracing::debug;

use super::merge::QueryIter;
use super::planner::{self, is_addressable};
use super::record::{self, RawRecord};
use super::{keys, WriteBatch};
use crate::config::QueryTuning;
use crate::error::{Error, Result};

/// Prior versions read by a replace before deciding.
const REPLACE_CANDIDATES: usize = 10;

/// Stores `event` unless its id is already present.
pub fn save<W: WriteBatch>(batch: &mut W, event: &Event) -> Result<()> {
    if batch.lookup_id(event.id.as_bytes())?.is_some() {
        return Err(Error::DupEvent);
    }
    insert(batch, event)
}

fn insert<W: WriteBatch>(batch: &mut W, event: &Event) -> Result<()> {
    let ptr = batch.next_pointer()?;
    let raw = record::encode(event)?;
    batch.put_record(ptr, &raw)?;
    batch.put_id(event.id.as_bytes(), ptr)?;
    for (index, key) in keys::index_keys(event, ptr) {
        batch.put_index(index, &key)?;
    }
    Ok(())
}

/// Removes the event with `id` and all of its index entries.
pub fn delete<W: WriteBatch>(batch: &mut W, id: &[u8; 32]) -> Result<bool> {
    let Some(ptr) = batch.lookup_id(id)? else {
        return Ok(false);
    };
    // decode before mutating: the record borrows the batch
    let event = match batch.get_record(ptr)? {
        Some(raw) => RawRecord::parse(raw)
            .ok_or(Error::CorruptRecord(ptr))?
            .decode()?,
        None => return Err(Error::CorruptRecord(ptr)),
    };
    for (index, key) in keys::index_keys(&event, ptr) {
        batch.delete_index(index, &key)?;
    }
    batch.delete_record(ptr)?;
    batch.delete_id(id)?;
    Ok(true)
}

/// `a` is superseded by `b`: older, or same second with a smaller id.
pub fn is_older(a: &Event, b: &Event) -> bool {
    a.created_at < b.created_at
        || (a.created_at == b.created_at && a.id.as_bytes() < b.id.as_bytes())
}

/// The d-tag of an addressable event, empty when absent.
pub fn d_tag(event: &Event) -> String {
    for tag in event.tags.iter() {
        let v = tag.as_vec();
        if v.len() >= 2 && v[0] == "d" {
            return v[1].clone();
        }
    }
    String::new()
}

/// Deletes every older version sharing author, kind (and d-tag for
/// addressable kinds) and stores `event`, unless a newer version already
/// exists. Returns whether `event` was stored.
pub fn replace<W: WriteBatch>(batch: &mut W, event: &Event, tuning: &QueryTuning) -> Result<bool> {
    let addressable = is_addressable(event.kind.as_u16());
    let d = if addressable { d_tag(event) } else { String::new() };

    let mut filter = Filter::new().author(event.pubkey).kind(event.kind);
    // an empty d-tag usually means no d-tag at all, which has no index entry
    if !d.is_empty() {
        filter = filter.identifier(d.clone());
    }
    let mut planned = planner::plan(&filter, usize::MAX);
    // stale duplicates past the one-per-address limit must be found too
    planned.limit = usize::MAX;

    let previous: Vec<Event> = QueryIter::new(&*batch, planned, tuning)
        .filter(|old| !addressable || d_tag(old) == d)
        .take(REPLACE_CANDIDATES)
        .collect();

    let mut should_store = true;
    for old in &previous {
        if is_older(old, event) {
            debug!(old = %old.id, new = %event.id, "replacing superseded event");
            delete(batch, old.id.as_bytes())?;
        } else {
            should_store = false;
        }
    }
    if should_store {
        insert(batch, event)?;
    }
    Ok(should_store)
}
