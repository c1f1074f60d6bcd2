use nostr::Event;

use super::record::RawRecord;

/// A tag condition the chosen index could not enforce on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagCondition {
    pub name: String,
    pub values: Vec<String>,
}

impl TagCondition {
    fn matches(&self, event: &Event) -> bool {
        event.tags.iter().any(|tag| {
            let tag_vec = tag.as_vec();
            tag_vec.len() >= 2 && tag_vec[0] == self.name && self.values.contains(&tag_vec[1])
        })
    }
}

/// Predicates checked on each candidate after it has been fetched.
///
/// Author, kind and time checks read the record header; tag checks need
/// the decoded event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Residual {
    /// Sorted for binary search.
    pub authors: Option<Vec<[u8; 32]>>,
    /// Sorted for binary search.
    pub kinds: Option<Vec<u16>>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub tags: Vec<TagCondition>,
}

impl Residual {
    pub fn needs_decode(&self) -> bool {
        !self.tags.is_empty()
    }

    pub fn matches_header(&self, record: &RawRecord<'_>) -> bool {
        if let Some(authors) = &self.authors {
            if authors.binary_search(&record.pubkey).is_err() {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if kinds.binary_search(&record.kind).is_err() {
                return false;
            }
        }
        if let Some(since) = self.since {
            if record.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if record.created_at > until {
                return false;
            }
        }
        true
    }

    pub fn matches_tags(&self, event: &Event) -> bool {
        self.tags.iter().all(|condition| condition.matches(event))
    }
}
