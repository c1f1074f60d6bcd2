//! Turns a filter into index scans plus residual predicates.

use nostr::Filter;
use std::collections::BTreeSet;
use tracing::debug;

use super::keys;
use super::residual::{Residual, TagCondition};
use super::IndexId;
use crate::config::QueryTuning;

// ---------------------------------------------------------------------------
// Replaceable event kind ranges (NIP-01)
// ---------------------------------------------------------------------------

pub fn is_replaceable(kind: u16) -> bool {
    kind == 0 || kind == 3 || (10_000..20_000).contains(&kind)
}

pub fn is_addressable(kind: u16) -> bool {
    (30_000..40_000).contains(&kind)
}

/// One planned scan: walk `index` backwards from `starting_point` while
/// keys still start with `prefix`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbstractQuery {
    pub index: IndexId,
    pub prefix: Vec<u8>,
    pub starting_point: Vec<u8>,
}

impl AbstractQuery {
    fn new(index: IndexId, prefix: Vec<u8>, until: Option<u64>) -> Self {
        let starting_point = keys::starting_point(&prefix, until);
        Self {
            index,
            prefix,
            starting_point,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    /// The filter cannot match anything.
    Nothing,
    /// Direct lookups through the id table.
    Ids { ids: Vec<[u8; 32]>, residual: Residual },
    /// Merged index scans.
    Scan {
        queries: Vec<AbstractQuery>,
        residual: Residual,
        /// Lower bound on key timestamps.
        since: u32,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedQuery {
    pub plan: Plan,
    /// Maximum number of events to emit.
    pub limit: usize,
}

/// A filter with empty sets removed and keys pre-extracted.
struct Normalized {
    ids: Option<Vec<[u8; 32]>>,
    authors: Option<Vec<[u8; 32]>>,
    kinds: Option<Vec<u16>>,
    /// Tag name to values, in filter order.
    tags: Vec<(String, Vec<String>)>,
    since: Option<u64>,
    until: Option<u64>,
}

impl Normalized {
    fn new(filter: &Filter) -> Self {
        let ids = filter
            .ids
            .as_ref()
            .filter(|ids| !ids.is_empty())
            .map(|ids| ids.iter().map(|id| *id.as_bytes()).collect());
        let authors = filter
            .authors
            .as_ref()
            .filter(|authors| !authors.is_empty())
            .map(|authors| sorted(authors.iter().map(|pk| pk.to_bytes())));
        let kinds = filter
            .kinds
            .as_ref()
            .filter(|kinds| !kinds.is_empty())
            .map(|kinds| sorted(kinds.iter().map(|k| k.as_u16())));
        let tags = filter
            .generic_tags
            .iter()
            .filter(|(_, values)| !values.is_empty())
            .map(|(tag, values)| (tag.to_string(), values.iter().cloned().collect()))
            .collect();

        Self {
            ids,
            authors,
            kinds,
            tags,
            since: filter.since.map(|s| s.as_u64()),
            until: filter.until.map(|u| u.as_u64()),
        }
    }

    fn residual(&self, tags: Vec<TagCondition>) -> Residual {
        Residual {
            authors: self.authors.clone(),
            kinds: self.kinds.clone(),
            since: self.since,
            until: self.until,
            tags,
        }
    }

    /// Tag conditions for every tag except `skip`, narrowest first.
    fn tag_conditions(&self, skip: Option<&str>) -> Vec<TagCondition> {
        let mut remaining: Vec<&(String, Vec<String>)> = self
            .tags
            .iter()
            .filter(|(name, _)| Some(name.as_str()) != skip)
            .collect();
        let has_authors = self.authors.is_some();
        // stable: equal goodness keeps filter order
        remaining.sort_by_key(|(name, _)| std::cmp::Reverse(tag_goodness(name, has_authors)));
        remaining
            .into_iter()
            .map(|(name, values)| TagCondition {
                name: name.clone(),
                values: values.clone(),
            })
            .collect()
    }
}

fn sorted<T: Ord>(items: impl Iterator<Item = T>) -> Vec<T> {
    let set: BTreeSet<T> = items.collect();
    set.into_iter().collect()
}

// ---------------------------------------------------------------------------
// Heuristics
// ---------------------------------------------------------------------------

/// Expected selectivity of a tag name; higher is narrower.
fn tag_goodness(name: &str, has_authors: bool) -> u8 {
    match name {
        "e" | "q" => 9,
        "a" | "A" | "i" | "I" | "g" | "G" | "r" | "R" => 8,
        "d" if has_authors => 7,
        "d" => 4,
        "h" | "t" | "l" | "k" | "K" => 6,
        "p" => 2,
        _ => 1,
    }
}

/// Picks the tag whose index scan is expected to touch the fewest entries.
/// Returns `(name, values, goodness)`; ties keep the first tag in the filter.
pub fn choose_narrowest_tag(filter: &Filter) -> Option<(String, Vec<String>, u8)> {
    let has_authors = filter.authors.as_ref().is_some_and(|a| !a.is_empty());
    let mut best: Option<(String, Vec<String>, u8)> = None;
    for (tag, values) in filter.generic_tags.iter() {
        if values.is_empty() {
            continue;
        }
        let name = tag.to_string();
        let goodness = tag_goodness(&name, has_authors);
        if best.as_ref().map_or(true, |(_, _, g)| goodness > *g) {
            best = Some((name, values.iter().cloned().collect(), goodness));
        }
    }
    best
}

/// How many index entries each iterator pulls per round.
pub fn batch_size(limit: usize, queries: usize, tuning: &QueryTuning) -> usize {
    if queries <= 1 || limit.saturating_mul(queries) < tuning.small_plan_threshold {
        return limit.max(1);
    }
    let size = (limit as f64).powf(tuning.batch_limit_exponent)
        / (queries as f64).powf(tuning.batch_queries_exponent);
    (size.ceil() as usize).clamp(1, limit.max(1))
}

/// How many iterators are refilled per merge round.
pub fn fanout(queries: usize, tuning: &QueryTuning) -> usize {
    let divisor = tuning.fanout_divisor.max(1);
    ((queries + divisor - 1) / divisor).max(1)
}

/// Upper bound on how many events can match, from the filter shape alone.
pub fn theoretical_limit(filter: &Filter) -> Option<usize> {
    if let Some(ids) = filter.ids.as_ref().filter(|ids| !ids.is_empty()) {
        return Some(ids.len());
    }
    let kinds = filter.kinds.as_ref().filter(|k| !k.is_empty())?;
    let authors = filter.authors.as_ref().filter(|a| !a.is_empty())?;

    if kinds.iter().all(|k| is_replaceable(k.as_u16())) {
        return Some(authors.len() * kinds.len());
    }
    let d_values = filter
        .generic_tags
        .iter()
        .find(|(tag, _)| tag.to_string() == "d")
        .map(|(_, values)| values.len())
        .unwrap_or(0);
    if d_values > 0 && kinds.iter().all(|k| is_addressable(k.as_u16())) {
        return Some(authors.len() * kinds.len() * d_values);
    }
    None
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

pub fn plan(filter: &Filter, max_limit: usize) -> PlannedQuery {
    let mut limit = filter.limit.unwrap_or(max_limit).min(max_limit);
    if let Some(theoretical) = theoretical_limit(filter) {
        limit = limit.min(theoretical);
    }

    let nf = Normalized::new(filter);
    let empty_range = matches!((nf.since, nf.until), (Some(s), Some(u)) if s > u);
    if limit == 0 || empty_range {
        return PlannedQuery {
            plan: Plan::Nothing,
            limit: 0,
        };
    }

    if let Some(ids) = &nf.ids {
        let residual = nf.residual(nf.tag_conditions(None));
        return PlannedQuery {
            plan: Plan::Ids {
                ids: ids.clone(),
                residual,
            },
            limit,
        };
    }

    let since = keys::clamp_ts(nf.since.unwrap_or(0));
    let (queries, residual) = plan_scans(&nf, filter);
    debug!(
        queries = queries.len(),
        index = ?queries.first().map(|q| q.index),
        residual_tags = residual.tags.len(),
        limit,
        "planned filter"
    );

    PlannedQuery {
        plan: Plan::Scan {
            queries,
            residual,
            since,
        },
        limit,
    }
}

fn plan_scans(nf: &Normalized, filter: &Filter) -> (Vec<AbstractQuery>, Residual) {
    let until = nf.until;

    if let Some((name, values, goodness)) = choose_narrowest_tag(filter) {
        let other_predicate = nf.authors.is_some() || nf.kinds.is_some();
        if goodness >= 2 || !other_predicate {
            let letter = name.as_bytes()[0];
            let mut lossy = false;
            let mut queries = Vec::with_capacity(values.len());
            for value in &values {
                let classified = keys::classify_tag_value(value);
                lossy |= classified.is_lossy();
                queries.push(AbstractQuery::new(
                    classified.index(),
                    keys::tag_prefix(letter, &classified),
                    until,
                ));
            }

            let mut tags = Vec::new();
            if lossy {
                tags.push(TagCondition {
                    name: name.clone(),
                    values,
                });
            }
            tags.extend(nf.tag_conditions(Some(name.as_str())));
            return (dedup(queries), nf.residual(tags));
        }
    }

    let tags = nf.tag_conditions(None);
    let queries = match (&nf.authors, &nf.kinds) {
        (Some(authors), None) => authors
            .iter()
            .map(|pk| AbstractQuery::new(IndexId::Pubkey, keys::pubkey_prefix(pk), until))
            .collect(),
        (Some(authors), Some(kinds)) => authors
            .iter()
            .flat_map(|pk| {
                kinds.iter().map(move |kind| {
                    AbstractQuery::new(
                        IndexId::PubkeyKind,
                        keys::pubkey_kind_prefix(pk, *kind),
                        until,
                    )
                })
            })
            .collect(),
        (None, Some(kinds)) => kinds
            .iter()
            .map(|kind| AbstractQuery::new(IndexId::Kind, keys::kind_prefix(*kind), until))
            .collect(),
        (None, None) => vec![AbstractQuery::new(IndexId::CreatedAt, Vec::new(), until)],
    };
    (dedup(queries), nf.residual(tags))
}

/// Pubkey prefixes and hex tag values can collide; scan each prefix once.
fn dedup(mut queries: Vec<AbstractQuery>) -> Vec<AbstractQuery> {
    queries.sort_by(|a, b| (a.index, &a.prefix).cmp(&(b.index, &b.prefix)));
    queries.dedup_by(|a, b| a.index == b.index && a.prefix == b.prefix);
    queries
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{Alphabet, EventId, Keys, Kind, PublicKey, SingleLetterTag, Timestamp};

    const HEX: &str = "b3e392b11f5d4f28321cedd09303a748acfd0487aea5a7450b3481c60b6e4f87";

    fn tuning() -> QueryTuning {
        QueryTuning::default()
    }

    fn with_tag(mut filter: Filter, letter: Alphabet, values: &[&str]) -> Filter {
        filter.generic_tags.insert(
            SingleLetterTag::lowercase(letter),
            values.iter().map(|v| v.to_string()).collect(),
        );
        filter
    }

    fn pubkeys(n: usize) -> Vec<PublicKey> {
        (0..n).map(|_| Keys::generate().public_key()).collect()
    }

    fn scan(planned: PlannedQuery) -> (Vec<AbstractQuery>, Residual, u32) {
        match planned.plan {
            Plan::Scan {
                queries,
                residual,
                since,
            } => (queries, residual, since),
            other => panic!("expected scan plan, got {:?}", other),
        }
    }

    #[test]
    fn empty_filter_scans_created_at_index() {
        let (queries, residual, since) = scan(plan(&Filter::new(), 100));
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].index, IndexId::CreatedAt);
        assert!(queries[0].prefix.is_empty());
        assert_eq!(queries[0].starting_point, u32::MAX.to_be_bytes().to_vec());
        assert_eq!(residual, Residual::default());
        assert_eq!(since, 0);
    }

    #[test]
    fn ids_bypass_index_planning() {
        let id = EventId::from_slice(&[0u8; 32]).unwrap();
        let filter = Filter::new().id(id).kind(Kind::from(1));
        let planned = plan(&filter, 100);
        assert_eq!(planned.limit, 1);
        match planned.plan {
            Plan::Ids { ids, residual } => {
                assert_eq!(ids, vec![[0u8; 32]]);
                assert_eq!(residual.kinds, Some(vec![1]));
            }
            other => panic!("expected ids plan, got {:?}", other),
        }
    }

    #[test]
    fn authors_and_kinds_use_cross_product() {
        let authors = pubkeys(3);
        let filter = Filter::new()
            .authors(authors.clone())
            .kinds([Kind::from(1), Kind::from(7)])
            .since(Timestamp::from(10))
            .until(Timestamp::from(20));
        let (queries, residual, since) = scan(plan(&filter, 100));

        assert_eq!(queries.len(), 6);
        assert!(queries.iter().all(|q| q.index == IndexId::PubkeyKind));
        assert!(queries
            .iter()
            .all(|q| q.starting_point.len() == q.prefix.len() + 4));
        assert!(queries
            .iter()
            .all(|q| q.starting_point.ends_with(&21u32.to_be_bytes())));
        assert_eq!(residual.authors.as_ref().map(Vec::len), Some(3));
        assert_eq!(since, 10);
    }

    #[test]
    fn authors_only_use_pubkey_index_and_kinds_only_use_kind_index() {
        let (queries, _, _) = scan(plan(&Filter::new().authors(pubkeys(2)), 100));
        assert!(queries.iter().all(|q| q.index == IndexId::Pubkey && q.prefix.len() == 8));

        let (queries, _, _) = scan(plan(&Filter::new().kinds([Kind::from(1)]), 100));
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].index, IndexId::Kind);
        assert_eq!(queries[0].prefix, vec![0, 1]);
    }

    #[test]
    fn selective_tag_wins_over_authors() {
        let filter = with_tag(Filter::new().authors(pubkeys(1)), Alphabet::E, &[HEX]);
        let (queries, residual, _) = scan(plan(&filter, 100));
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].index, IndexId::Tag32);
        assert!(residual.authors.is_some());
        // tag32 keeps only 8 bytes of the value, so the tag is re-checked
        assert_eq!(residual.tags.len(), 1);
        assert_eq!(residual.tags[0].name, "e");
    }

    #[test]
    fn address_tag_is_always_rechecked() {
        let address = format!("30023:{}:post", HEX);
        let filter = with_tag(Filter::new(), Alphabet::A, &[address.as_str()]);
        let (queries, residual, _) = scan(plan(&filter, 100));
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].index, IndexId::TagAddr);
        assert_eq!(residual.tags.len(), 1);
        assert_eq!(residual.tags[0].values, vec![address]);
    }

    #[test]
    fn broad_tag_falls_through_to_kinds() {
        let filter = with_tag(Filter::new().kind(Kind::from(1)), Alphabet::P, &["x"]);
        let (queries, residual, _) = scan(plan(&filter, 100));
        assert!(queries.iter().all(|q| q.index == IndexId::Kind));
        assert_eq!(residual.tags.len(), 1);
        assert_eq!(residual.tags[0].name, "p");
    }

    #[test]
    fn broad_tag_alone_still_uses_tag_index() {
        let filter = with_tag(Filter::new(), Alphabet::P, &["x", "y"]);
        let (queries, residual, _) = scan(plan(&filter, 100));
        assert_eq!(queries.len(), 2);
        assert!(queries.iter().all(|q| q.index == IndexId::Tag));
        assert!(residual.tags.is_empty());
    }

    #[test]
    fn remaining_tags_become_residuals_narrowest_first() {
        let filter = with_tag(
            with_tag(with_tag(Filter::new(), Alphabet::P, &["x"]), Alphabet::T, &["y"]),
            Alphabet::E,
            &["z"],
        );
        let (queries, residual, _) = scan(plan(&filter, 100));
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].prefix[0], b'e');
        let names: Vec<&str> = residual.tags.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["t", "p"]);
    }

    #[test]
    fn narrowest_tag_scores() {
        let filter = with_tag(with_tag(Filter::new(), Alphabet::D, &["a"]), Alphabet::T, &["b"]);
        assert_eq!(choose_narrowest_tag(&filter).unwrap().0, "t");

        let filter = filter.authors(pubkeys(1));
        let (name, values, goodness) = choose_narrowest_tag(&filter).unwrap();
        assert_eq!((name.as_str(), goodness), ("d", 7));
        assert_eq!(values, vec!["a".to_string()]);

        assert!(choose_narrowest_tag(&Filter::new()).is_none());
    }

    #[test]
    fn limits_combine_filter_max_and_theoretical() {
        assert_eq!(plan(&Filter::new().limit(10), 100).limit, 10);
        assert_eq!(plan(&Filter::new().limit(1000), 100).limit, 100);
        assert_eq!(plan(&Filter::new(), 100).limit, 100);
        assert_eq!(plan(&Filter::new().limit(0), 100).plan, Plan::Nothing);

        let replaceable = Filter::new()
            .authors(pubkeys(2))
            .kinds([Kind::from(0), Kind::from(10_002)]);
        assert_eq!(theoretical_limit(&replaceable), Some(4));
        assert_eq!(plan(&replaceable, 100).limit, 4);

        let addressable = with_tag(
            Filter::new().authors(pubkeys(2)).kind(Kind::from(30_023)),
            Alphabet::D,
            &["a", "b", "c"],
        );
        assert_eq!(theoretical_limit(&addressable), Some(6));

        let regular = Filter::new().authors(pubkeys(2)).kind(Kind::from(1));
        assert_eq!(theoretical_limit(&regular), None);
    }

    #[test]
    fn inverted_time_range_plans_nothing() {
        let filter = Filter::new()
            .since(Timestamp::from(20))
            .until(Timestamp::from(10));
        assert_eq!(plan(&filter, 100).plan, Plan::Nothing);
    }

    #[test]
    fn batch_size_is_sublinear_in_query_count() {
        let t = tuning();
        assert_eq!(batch_size(500, 1, &t), 500);
        assert_eq!(batch_size(10, 4, &t), 10);
        // ceil(500^0.8 / 5100^0.71)
        assert_eq!(batch_size(500, 5100, &t), 1);
        // ceil(100^0.8 / 10^0.71) = ceil(39.81 / 5.13)
        assert_eq!(batch_size(100, 10, &t), 8);
    }

    #[test]
    fn fanout_rounds_up() {
        let t = tuning();
        assert_eq!(fanout(1, &t), 1);
        assert_eq!(fanout(12, &t), 1);
        assert_eq!(fanout(13, &t), 2);
        assert_eq!(fanout(5100, &t), 425);
    }
}
