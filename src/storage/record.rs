//! Raw record layout: a fixed header followed by the event JSON.
//!
//! `id (32) | pubkey (32) | created_at (8, BE) | kind (2, BE) | json`
//!
//! The header lets residual author/kind/time checks run against the stored
//! bytes without deserializing the event.

use nostr::Event;

use crate::error::Result;

const ID_END: usize = 32;
const PUBKEY_END: usize = ID_END + 32;
const CREATED_END: usize = PUBKEY_END + 8;
const KIND_END: usize = CREATED_END + 2;
pub const HEADER_LEN: usize = KIND_END;

pub fn encode(event: &Event) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(event)?;
    let mut raw = Vec::with_capacity(HEADER_LEN + json.len());
    raw.extend_from_slice(event.id.as_bytes());
    raw.extend_from_slice(&event.pubkey.to_bytes());
    raw.extend_from_slice(&event.created_at.as_u64().to_be_bytes());
    raw.extend_from_slice(&event.kind.as_u16().to_be_bytes());
    raw.extend_from_slice(&json);
    Ok(raw)
}

/// Borrowed view of a stored record with its header already parsed.
#[derive(Debug, Clone, Copy)]
pub struct RawRecord<'a> {
    pub id: [u8; 32],
    pub pubkey: [u8; 32],
    pub created_at: u64,
    pub kind: u16,
    json: &'a [u8],
}

impl<'a> RawRecord<'a> {
    /// Returns `None` when `raw` is too short to hold a header.
    pub fn parse(raw: &'a [u8]) -> Option<Self> {
        if raw.len() < HEADER_LEN {
            return None;
        }
        Some(Self {
            id: raw[..ID_END].try_into().ok()?,
            pubkey: raw[ID_END..PUBKEY_END].try_into().ok()?,
            created_at: u64::from_be_bytes(raw[PUBKEY_END..CREATED_END].try_into().ok()?),
            kind: u16::from_be_bytes(raw[CREATED_END..KIND_END].try_into().ok()?),
            json: &raw[HEADER_LEN..],
        })
    }

    #[inline]
    pub fn decode(&self) -> Result<Event> {
        Ok(serde_json::from_slice(self.json)?)
    }
}
