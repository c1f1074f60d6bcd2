//! The capability the query engine needs from an ordered byte-key store.
//!
//! Backends only provide cursors, record lookups and transactions; index
//! layout, planning and merging live once in the rest of `storage`.

use crate::error::Result;

/// Backend-assigned reference from an index entry to its raw record.
pub type RecordPtr = u64;

/// The secondary indexes every backend maintains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexId {
    Pubkey,
    Kind,
    PubkeyKind,
    Tag,
    Tag32,
    TagAddr,
    CreatedAt,
    /// Event id to pointer. Looked up by key, never scanned.
    Id,
}

impl IndexId {
    pub fn name(&self) -> &'static str {
        match self {
            IndexId::Pubkey => "idx_pubkey",
            IndexId::Kind => "idx_kind",
            IndexId::PubkeyKind => "idx_pubkey_kind",
            IndexId::Tag => "idx_tag",
            IndexId::Tag32 => "idx_tag32",
            IndexId::TagAddr => "idx_tag_addr",
            IndexId::CreatedAt => "idx_created",
            IndexId::Id => "idx_id",
        }
    }
}

/// A descending cursor over one index, borrowing its snapshot for `'a`.
pub trait IndexCursor<'a> {
    /// Positions at the greatest key `<= key` and returns it.
    fn seek(&mut self, key: &[u8]) -> Result<Option<&'a [u8]>>;
    /// Moves to the next smaller key.
    fn prev(&mut self) -> Result<Option<&'a [u8]>>;
}

/// A consistent read view: a read snapshot or an open write transaction.
pub trait IndexView {
    type Cursor<'a>: IndexCursor<'a>
    where
        Self: 'a;

    fn open_cursor(&self, index: IndexId) -> Result<Self::Cursor<'_>>;
    fn get_record(&self, ptr: RecordPtr) -> Result<Option<&[u8]>>;
    fn lookup_id(&self, id: &[u8; 32]) -> Result<Option<RecordPtr>>;
    fn record_count(&self) -> Result<u64>;
}

/// An exclusive write transaction. Nothing is visible to readers until
/// `commit`; dropping the batch discards every mutation.
pub trait WriteBatch: IndexView {
    fn next_pointer(&mut self) -> Result<RecordPtr>;
    fn put_record(&mut self, ptr: RecordPtr, raw: &[u8]) -> Result<()>;
    fn delete_record(&mut self, ptr: RecordPtr) -> Result<()>;
    fn put_id(&mut self, id: &[u8; 32], ptr: RecordPtr) -> Result<()>;
    fn delete_id(&mut self, id: &[u8; 32]) -> Result<()>;
    fn put_index(&mut self, index: IndexId, key: &[u8]) -> Result<()>;
    fn delete_index(&mut self, index: IndexId, key: &[u8]) -> Result<()>;
    fn commit(self) -> Result<()>
    where
        Self: Sized;
}

pub trait Backend: Send + Sync {
    type Reader<'a>: IndexView
    where
        Self: 'a;
    type Writer<'a>: WriteBatch
    where
        Self: 'a;

    fn begin_read(&self) -> Result<Self::Reader<'_>>;
    fn begin_write(&self) -> Result<Self::Writer<'_>>;
    fn path(&self) -> &str;
}
