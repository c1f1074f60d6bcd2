use heed::types::*;
use heed::{Database, Env, EnvOpenOptions, RoRevRange, RoTxn, RwTxn};
use std::fs;
use std::ops::Bound;
use std::path::Path;

use super::{Backend, IndexCursor, IndexId, IndexView, RecordPtr, WriteBatch};
use crate::error::Result;

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

/// Database handles; cheap to copy into every transaction wrapper.
#[derive(Clone, Copy)]
struct Tables {
    /// Pointer (BE 8) → raw record
    records: Database<Bytes, Bytes>,
    /// EventId (32) → pointer (BE 8)
    ids: Database<Bytes, Bytes>,
    // --- Scanned indices (key-only, value = Unit) ---
    /// Pubkey[0:8] + CreatedAt(BE 4) + Ptr(BE 8)
    pubkey: Database<Bytes, Unit>,
    /// Kind(BE 2) + CreatedAt + Ptr
    kind: Database<Bytes, Unit>,
    /// Pubkey[0:8] + Kind(BE 2) + CreatedAt + Ptr
    pubkey_kind: Database<Bytes, Unit>,
    /// Letter + md5(value) + CreatedAt + Ptr
    tag: Database<Bytes, Unit>,
    /// Letter + hex value[0:8] + CreatedAt + Ptr
    tag32: Database<Bytes, Unit>,
    /// Letter + Kind + Pubkey[0:8] + Identifier + CreatedAt + Ptr
    tag_addr: Database<Bytes, Unit>,
    /// CreatedAt + Ptr
    created: Database<Bytes, Unit>,
}

impl Tables {
    fn index(&self, index: IndexId) -> Option<Database<Bytes, Unit>> {
        Some(match index {
            IndexId::Pubkey => self.pubkey,
            IndexId::Kind => self.kind,
            IndexId::PubkeyKind => self.pubkey_kind,
            IndexId::Tag => self.tag,
            IndexId::Tag32 => self.tag32,
            IndexId::TagAddr => self.tag_addr,
            IndexId::CreatedAt => self.created,
            IndexId::Id => return None,
        })
    }

    fn scanned(&self, index: IndexId) -> Result<Database<Bytes, Unit>> {
        self.index(index).ok_or_else(|| {
            heed::Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a scanned index", index.name()),
            ))
            .into()
        })
    }

    fn cursor<'t>(&self, txn: &'t RoTxn, index: IndexId) -> Result<LmdbCursor<'t>> {
        Ok(LmdbCursor {
            db: self.scanned(index)?,
            txn,
            iter: None,
        })
    }

    fn get_record<'t>(&self, txn: &'t RoTxn, ptr: RecordPtr) -> Result<Option<&'t [u8]>> {
        Ok(self.records.get(txn, &ptr.to_be_bytes())?)
    }

    fn lookup_id(&self, txn: &RoTxn, id: &[u8; 32]) -> Result<Option<RecordPtr>> {
        Ok(self
            .ids
            .get(txn, id)?
            .and_then(|raw| raw.try_into().ok())
            .map(u64::from_be_bytes))
    }
}

// ---------------------------------------------------------------------------
// LmdbBackend
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct LmdbBackend {
    env: Env,
    tables: Tables,
    path: String,
}

impl LmdbBackend {
    pub fn new<P: AsRef<Path>>(path: P, map_size_mb: usize) -> Result<Self> {
        fs::create_dir_all(&path)?;

        let mut env_builder = EnvOpenOptions::new();
        env_builder.max_dbs(20);
        env_builder.map_size(map_size_mb * 1024 * 1024);
        let env = unsafe { env_builder.open(&path)? };

        let mut wtxn = env.write_txn()?;
        let tables = Tables {
            records: env.create_database(&mut wtxn, Some("records"))?,
            ids: env.create_database(&mut wtxn, Some(IndexId::Id.name()))?,
            pubkey: env.create_database(&mut wtxn, Some(IndexId::Pubkey.name()))?,
            kind: env.create_database(&mut wtxn, Some(IndexId::Kind.name()))?,
            pubkey_kind: env.create_database(&mut wtxn, Some(IndexId::PubkeyKind.name()))?,
            tag: env.create_database(&mut wtxn, Some(IndexId::Tag.name()))?,
            tag32: env.create_database(&mut wtxn, Some(IndexId::Tag32.name()))?,
            tag_addr: env.create_database(&mut wtxn, Some(IndexId::TagAddr.name()))?,
            created: env.create_database(&mut wtxn, Some(IndexId::CreatedAt.name()))?,
        };
        wtxn.commit()?;

        Ok(Self {
            env,
            tables,
            path: path.as_ref().to_string_lossy().into_owned(),
        })
    }
}

impl Backend for LmdbBackend {
    type Reader<'a> = LmdbReader<'a> where Self: 'a;
    type Writer<'a> = LmdbWriter<'a> where Self: 'a;

    fn begin_read(&self) -> Result<LmdbReader<'_>> {
        Ok(LmdbReader {
            txn: self.env.read_txn()?,
            tables: self.tables,
        })
    }

    fn begin_write(&self) -> Result<LmdbWriter<'_>> {
        Ok(LmdbWriter {
            txn: self.env.write_txn()?,
            tables: self.tables,
        })
    }

    fn path(&self) -> &str {
        &self.path
    }
}

// ---------------------------------------------------------------------------
// Cursor: reverse range from the seek key down to the start of the index
// ---------------------------------------------------------------------------

pub struct LmdbCursor<'t> {
    db: Database<Bytes, Unit>,
    txn: &'t RoTxn<'t>,
    iter: Option<RoRevRange<'t, Bytes, Unit>>,
}

impl<'t> IndexCursor<'t> for LmdbCursor<'t> {
    fn seek(&mut self, key: &[u8]) -> Result<Option<&'t [u8]>> {
        let range: (Bound<&[u8]>, Bound<&[u8]>) = (Bound::Unbounded, Bound::Included(key));
        self.iter = Some(self.db.rev_range(self.txn, &range)?);
        self.prev()
    }

    fn prev(&mut self) -> Result<Option<&'t [u8]>> {
        let Some(iter) = self.iter.as_mut() else {
            return Ok(None);
        };
        match iter.next() {
            Some(result) => Ok(Some(result?.0)),
            None => {
                self.iter = None;
                Ok(None)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Read snapshot
// ---------------------------------------------------------------------------

pub struct LmdbReader<'e> {
    txn: RoTxn<'e>,
    tables: Tables,
}

impl<'e> IndexView for LmdbReader<'e> {
    type Cursor<'a> = LmdbCursor<'a> where Self: 'a;

    fn open_cursor(&self, index: IndexId) -> Result<LmdbCursor<'_>> {
        self.tables.cursor(&self.txn, index)
    }

    fn get_record(&self, ptr: RecordPtr) -> Result<Option<&[u8]>> {
        self.tables.get_record(&self.txn, ptr)
    }

    fn lookup_id(&self, id: &[u8; 32]) -> Result<Option<RecordPtr>> {
        self.tables.lookup_id(&self.txn, id)
    }

    fn record_count(&self) -> Result<u64> {
        Ok(self.tables.records.len(&self.txn)?)
    }
}

// ---------------------------------------------------------------------------
// Write transaction
// ---------------------------------------------------------------------------

pub struct LmdbWriter<'e> {
    txn: RwTxn<'e>,
    tables: Tables,
}

impl<'e> IndexView for LmdbWriter<'e> {
    type Cursor<'a> = LmdbCursor<'a> where Self: 'a;

    fn open_cursor(&self, index: IndexId) -> Result<LmdbCursor<'_>> {
        self.tables.cursor(&self.txn, index)
    }

    fn get_record(&self, ptr: RecordPtr) -> Result<Option<&[u8]>> {
        self.tables.get_record(&self.txn, ptr)
    }

    fn lookup_id(&self, id: &[u8; 32]) -> Result<Option<RecordPtr>> {
        self.tables.lookup_id(&self.txn, id)
    }

    fn record_count(&self) -> Result<u64> {
        Ok(self.tables.records.len(&self.txn)?)
    }
}

impl<'e> WriteBatch for LmdbWriter<'e> {
    fn next_pointer(&mut self) -> Result<RecordPtr> {
        let last = self
            .tables
            .records
            .last(&self.txn)?
            .and_then(|(key, _)| key.try_into().ok())
            .map(u64::from_be_bytes);
        Ok(last.map_or(1, |ptr| ptr + 1))
    }

    fn put_record(&mut self, ptr: RecordPtr, raw: &[u8]) -> Result<()> {
        self.tables
            .records
            .put(&mut self.txn, &ptr.to_be_bytes(), raw)?;
        Ok(())
    }

    fn delete_record(&mut self, ptr: RecordPtr) -> Result<()> {
        self.tables.records.delete(&mut self.txn, &ptr.to_be_bytes())?;
        Ok(())
    }

    fn put_id(&mut self, id: &[u8; 32], ptr: RecordPtr) -> Result<()> {
        self.tables.ids.put(&mut self.txn, id, &ptr.to_be_bytes())?;
        Ok(())
    }

    fn delete_id(&mut self, id: &[u8; 32]) -> Result<()> {
        self.tables.ids.delete(&mut self.txn, id)?;
        Ok(())
    }

    fn put_index(&mut self, index: IndexId, key: &[u8]) -> Result<()> {
        self.tables.scanned(index)?.put(&mut self.txn, key, &())?;
        Ok(())
    }

    fn delete_index(&mut self, index: IndexId, key: &[u8]) -> Result<()> {
        self.tables.scanned(index)?.delete(&mut self.txn, key)?;
        Ok(())
    }

    fn commit(self) -> Result<()> {
        self.txn.commit()?;
        Ok(())
    }
}
