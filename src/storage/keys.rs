//! Composite index key layouts.
//!
//! Every scanned index key ends with `created_at (4, BE) ++ pointer (8, BE)`,
//! so a descending cursor walk over one prefix yields entries newest first.

use md5::{Digest, Md5};
use nostr::Event;

use super::{IndexId, RecordPtr};

pub const TS_LEN: usize = 4;
pub const PTR_LEN: usize = 8;
/// Bytes after the prefix of every scanned key.
pub const SUFFIX_LEN: usize = TS_LEN + PTR_LEN;

const PUBKEY_PREFIX_LEN: usize = 8;
const TAG32_VALUE_LEN: usize = 8;
const TAG_HASH_LEN: usize = 16;
/// Address identifiers longer than this are truncated in `TagAddr` keys.
pub const MAX_IDENTIFIER_LEN: usize = 30;

/// Seconds are stored in four bytes; later timestamps saturate.
#[inline]
pub fn clamp_ts(created_at: u64) -> u32 {
    created_at.min(u32::MAX as u64) as u32
}

// ---------------------------------------------------------------------------
// Prefixes
// ---------------------------------------------------------------------------

pub fn pubkey_prefix(pubkey: &[u8; 32]) -> Vec<u8> {
    pubkey[..PUBKEY_PREFIX_LEN].to_vec()
}

pub fn kind_prefix(kind: u16) -> Vec<u8> {
    kind.to_be_bytes().to_vec()
}

pub fn pubkey_kind_prefix(pubkey: &[u8; 32], kind: u16) -> Vec<u8> {
    let mut key = Vec::with_capacity(PUBKEY_PREFIX_LEN + 2 + SUFFIX_LEN);
    key.extend_from_slice(&pubkey[..PUBKEY_PREFIX_LEN]);
    key.extend_from_slice(&kind.to_be_bytes());
    key
}

/// How a tag value is laid out in the tag indexes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagValue<'a> {
    /// 64 hex characters (event ids, pubkeys): first 8 decoded bytes.
    Hex32([u8; TAG32_VALUE_LEN]),
    /// `kind:pubkey:identifier` address of a replaceable event.
    Address {
        kind: u16,
        pubkey: [u8; PUBKEY_PREFIX_LEN],
        identifier: &'a str,
    },
    /// Anything else, stored as its md5 digest.
    Generic(&'a str),
}

impl TagValue<'_> {
    pub fn index(&self) -> IndexId {
        match self {
            TagValue::Hex32(_) => IndexId::Tag32,
            TagValue::Address { .. } => IndexId::TagAddr,
            TagValue::Generic(_) => IndexId::Tag,
        }
    }

    /// Whether two distinct values may share the same key prefix.
    ///
    /// Hex is decoded case-insensitively and only 8 bytes are kept, so every
    /// `Hex32` and `Address` key must be confirmed against the full value.
    pub fn is_lossy(&self) -> bool {
        match self {
            TagValue::Hex32(_) | TagValue::Address { .. } => true,
            TagValue::Generic(_) => false,
        }
    }
}

pub fn classify_tag_value(value: &str) -> TagValue<'_> {
    if value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit()) {
        let mut raw = [0u8; TAG32_VALUE_LEN];
        if hex::decode_to_slice(&value[..TAG32_VALUE_LEN * 2], &mut raw).is_ok() {
            return TagValue::Hex32(raw);
        }
    }
    if let Some(address) = parse_address(value) {
        return address;
    }
    TagValue::Generic(value)
}

fn parse_address(value: &str) -> Option<TagValue<'_>> {
    let mut parts = value.splitn(3, ':');
    let kind: u16 = parts.next()?.parse().ok()?;
    let pubkey_hex = parts.next()?;
    let identifier = parts.next()?;
    if pubkey_hex.len() != 64 || !pubkey_hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let mut pubkey = [0u8; PUBKEY_PREFIX_LEN];
    hex::decode_to_slice(&pubkey_hex[..PUBKEY_PREFIX_LEN * 2], &mut pubkey).ok()?;
    Some(TagValue::Address {
        kind,
        pubkey,
        identifier,
    })
}

/// Builds the prefix of a tag index key. `letter` is the first byte of the tag name.
pub fn tag_prefix(letter: u8, value: &TagValue<'_>) -> Vec<u8> {
    match value {
        TagValue::Hex32(raw) => {
            let mut key = Vec::with_capacity(1 + TAG32_VALUE_LEN + SUFFIX_LEN);
            key.push(letter);
            key.extend_from_slice(raw);
            key
        }
        TagValue::Address {
            kind,
            pubkey,
            identifier,
        } => {
            let ident = truncate_identifier(identifier);
            let mut key =
                Vec::with_capacity(1 + 2 + PUBKEY_PREFIX_LEN + ident.len() + SUFFIX_LEN);
            key.push(letter);
            key.extend_from_slice(&kind.to_be_bytes());
            key.extend_from_slice(pubkey);
            key.extend_from_slice(ident);
            key
        }
        TagValue::Generic(value) => {
            let mut key = Vec::with_capacity(1 + TAG_HASH_LEN + SUFFIX_LEN);
            key.push(letter);
            key.extend_from_slice(&Md5::digest(value.as_bytes()));
            key
        }
    }
}

fn truncate_identifier(identifier: &str) -> &[u8] {
    let bytes = identifier.as_bytes();
    &bytes[..bytes.len().min(MAX_IDENTIFIER_LEN)]
}

// ---------------------------------------------------------------------------
// Full keys
// ---------------------------------------------------------------------------

fn with_suffix(mut prefix: Vec<u8>, created_at: u32, ptr: RecordPtr) -> Vec<u8> {
    prefix.extend_from_slice(&created_at.to_be_bytes());
    prefix.extend_from_slice(&ptr.to_be_bytes());
    prefix
}

/// Every scanned index entry for `event` stored at `ptr`.
pub fn index_keys(event: &Event, ptr: RecordPtr) -> Vec<(IndexId, Vec<u8>)> {
    let pubkey = event.pubkey.to_bytes();
    let kind = event.kind.as_u16();
    let ts = clamp_ts(event.created_at.as_u64());

    let mut keys = vec![
        (IndexId::Pubkey, with_suffix(pubkey_prefix(&pubkey), ts, ptr)),
        (IndexId::Kind, with_suffix(kind_prefix(kind), ts, ptr)),
        (
            IndexId::PubkeyKind,
            with_suffix(pubkey_kind_prefix(&pubkey, kind), ts, ptr),
        ),
        (IndexId::CreatedAt, with_suffix(Vec::new(), ts, ptr)),
    ];

    let mut seen: Vec<(&str, &str)> = Vec::new();
    for tag in event.tags.iter() {
        let tag_vec = tag.as_vec();
        if tag_vec.len() < 2 || tag_vec[0].len() != 1 {
            continue;
        }
        let (name, value) = (tag_vec[0].as_str(), tag_vec[1].as_str());
        if seen.contains(&(name, value)) {
            continue;
        }
        seen.push((name, value));

        let classified = classify_tag_value(value);
        let prefix = tag_prefix(name.as_bytes()[0], &classified);
        keys.push((classified.index(), with_suffix(prefix, ts, ptr)));
    }
    keys
}

/// Where a descending scan over `prefix` starts for an inclusive `until`.
pub fn starting_point(prefix: &[u8], until: Option<u64>) -> Vec<u8> {
    let bound = match until {
        Some(until) => clamp_ts(until.saturating_add(1)),
        None => u32::MAX,
    };
    let mut key = Vec::with_capacity(prefix.len() + TS_LEN);
    key.extend_from_slice(prefix);
    key.extend_from_slice(&bound.to_be_bytes());
    key
}

/// Splits the `(created_at, pointer)` suffix off a key scanned under a
/// prefix of `prefix_len` bytes. Keys of a different length belong to a
/// longer prefix that merely starts with ours.
pub fn split_suffix(key: &[u8], prefix_len: usize) -> Option<(u32, RecordPtr)> {
    if key.len() != prefix_len + SUFFIX_LEN {
        return None;
    }
    let ts = u32::from_be_bytes(key[prefix_len..prefix_len + TS_LEN].try_into().ok()?);
    let ptr = u64::from_be_bytes(key[prefix_len + TS_LEN..].try_into().ok()?);
    Some((ts, ptr))
}
