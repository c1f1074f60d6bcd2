#![allow(dead_code)]

use moar_store::config::QueryTuning;
use moar_store::storage::planner::theoretical_limit;
use moar_store::storage::{LmdbBackend, LmdbStore, MemoryBackend, MemoryStore, Store};
use nostr::{Alphabet, Event, EventBuilder, Filter, Keys, Kind, SingleLetterTag, Tag, Timestamp};
use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

pub fn memory_store() -> MemoryStore {
    Store::new(MemoryBackend::new(), QueryTuning::default())
}

/// The directory must outlive the store.
pub fn lmdb_store() -> (TempDir, LmdbStore) {
    let dir = TempDir::new().expect("tempdir");
    let backend = LmdbBackend::new(dir.path(), 256).expect("open lmdb");
    (dir, Store::new(backend, QueryTuning::default()))
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

pub fn tag(parts: &[&str]) -> Tag {
    Tag::parse(parts).expect("valid tag")
}

static SEQ: AtomicU64 = AtomicU64::new(0);

/// Content carries a sequence number so generated events never share an id.
pub fn make_event(keys: &Keys, kind: u16, created_at: u64, tags: Vec<Tag>) -> Event {
    let seq = SEQ.fetch_add(1, AtomicOrdering::Relaxed);
    EventBuilder::new(Kind::from(kind), format!("event #{}", seq), tags)
        .custom_created_at(Timestamp::from(created_at))
        .to_event(keys)
        .unwrap()
}

pub fn with_tag<S: ToString>(mut filter: Filter, letter: Alphabet, values: &[S]) -> Filter {
    filter.generic_tags.insert(
        SingleLetterTag::lowercase(letter),
        values.iter().map(|v| v.to_string()).collect(),
    );
    filter
}

// ---------------------------------------------------------------------------
// Ground truth
// ---------------------------------------------------------------------------

/// Naive filter match, scanning every field.
pub fn matches(filter: &Filter, event: &Event) -> bool {
    if let Some(ids) = &filter.ids {
        if !ids.contains(&event.id) {
            return false;
        }
    }
    if let Some(authors) = &filter.authors {
        if !authors.contains(&event.pubkey) {
            return false;
        }
    }
    if let Some(kinds) = &filter.kinds {
        if !kinds.contains(&event.kind) {
            return false;
        }
    }
    if let Some(since) = filter.since {
        if event.created_at < since {
            return false;
        }
    }
    if let Some(until) = filter.until {
        if event.created_at > until {
            return false;
        }
    }
    filter.generic_tags.iter().all(|(letter, values)| {
        let name = letter.to_string();
        event.tags.iter().any(|t| {
            let v = t.as_vec();
            v.len() >= 2 && v[0] == name && values.contains(&v[1])
        })
    })
}

pub fn newest_first(a: &Event, b: &Event) -> Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| b.id.as_bytes().cmp(a.id.as_bytes()))
}

/// `sort_desc(filter(D, F))[..min(M, F.limit, theoretical(F))]`
pub fn ground_truth(events: &[Event], filter: &Filter, max_limit: usize) -> Vec<Event> {
    let mut limit = filter.limit.unwrap_or(max_limit).min(max_limit);
    if let Some(theoretical) = theoretical_limit(filter) {
        limit = limit.min(theoretical);
    }
    let mut matching: Vec<Event> = events
        .iter()
        .filter(|e| matches(filter, e))
        .cloned()
        .collect();
    matching.sort_by(newest_first);
    matching.truncate(limit);
    matching
}

pub fn ids(events: &[Event]) -> Vec<String> {
    events.iter().map(|e| e.id.to_hex()).collect()
}
