//! Ordered in-memory backend for tests and ephemeral relays.

use std::collections::btree_set;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::iter::Rev;
use std::ops::Bound;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{Backend, IndexCursor, IndexId, IndexView, RecordPtr, WriteBatch};
use crate::error::{Error, Result};

#[derive(Default)]
struct Tables {
    records: BTreeMap<RecordPtr, Vec<u8>>,
    ids: HashMap<[u8; 32], RecordPtr>,
    indexes: HashMap<IndexId, BTreeSet<Vec<u8>>>,
    next_ptr: RecordPtr,
}

impl Tables {
    fn index(&self, index: IndexId) -> Option<&BTreeSet<Vec<u8>>> {
        self.indexes.get(&index)
    }

    fn view_cursor(&self, index: IndexId) -> MemoryCursor<'_> {
        MemoryCursor {
            set: self.index(index),
            iter: None,
        }
    }

    fn record_count(&self) -> u64 {
        self.records.len() as u64
    }
}

/// Backend over ordered std maps behind a `RwLock`.
///
/// Readers share the lock; a writer holds it exclusively until it commits
/// or is dropped, so a read never observes a half-applied write.
#[derive(Default)]
pub struct MemoryBackend {
    tables: RwLock<Tables>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemoryBackend {
    type Reader<'a> = MemoryReader<'a> where Self: 'a;
    type Writer<'a> = MemoryWriter<'a> where Self: 'a;

    fn begin_read(&self) -> Result<MemoryReader<'_>> {
        let tables = self.tables.read().map_err(|_| Error::LockPoisoned)?;
        Ok(MemoryReader { tables })
    }

    fn begin_write(&self) -> Result<MemoryWriter<'_>> {
        let tables = self.tables.write().map_err(|_| Error::LockPoisoned)?;
        Ok(MemoryWriter {
            tables,
            undo: Vec::new(),
            committed: false,
        })
    }

    fn path(&self) -> &str {
        ":memory:"
    }
}

pub struct MemoryCursor<'a> {
    set: Option<&'a BTreeSet<Vec<u8>>>,
    iter: Option<Rev<btree_set::Range<'a, Vec<u8>>>>,
}

impl<'a> IndexCursor<'a> for MemoryCursor<'a> {
    fn seek(&mut self, key: &[u8]) -> Result<Option<&'a [u8]>> {
        let Some(set) = self.set else {
            return Ok(None);
        };
        let range: (Bound<&[u8]>, Bound<&[u8]>) = (Bound::Unbounded, Bound::Included(key));
        self.iter = Some(set.range::<[u8], _>(range).rev());
        self.prev()
    }

    fn prev(&mut self) -> Result<Option<&'a [u8]>> {
        Ok(self
            .iter
            .as_mut()
            .and_then(|it| it.next())
            .map(|key| key.as_slice()))
    }
}

pub struct MemoryReader<'a> {
    tables: RwLockReadGuard<'a, Tables>,
}

impl<'b> IndexView for MemoryReader<'b> {
    type Cursor<'a> = MemoryCursor<'a> where Self: 'a;

    fn open_cursor(&self, index: IndexId) -> Result<MemoryCursor<'_>> {
        Ok(self.tables.view_cursor(index))
    }

    fn get_record(&self, ptr: RecordPtr) -> Result<Option<&[u8]>> {
        Ok(self.tables.records.get(&ptr).map(Vec::as_slice))
    }

    fn lookup_id(&self, id: &[u8; 32]) -> Result<Option<RecordPtr>> {
        Ok(self.tables.ids.get(id).copied())
    }

    fn record_count(&self) -> Result<u64> {
        Ok(self.tables.record_count())
    }
}

/// Inverse of one applied mutation.
enum Undo {
    RemoveRecord(RecordPtr),
    RestoreRecord(RecordPtr, Vec<u8>),
    RemoveId([u8; 32]),
    RestoreId([u8; 32], RecordPtr),
    RemoveIndex(IndexId, Vec<u8>),
    RestoreIndex(IndexId, Vec<u8>),
    ResetPointer(RecordPtr),
}

/// Applies mutations in place and rolls them back on drop unless committed.
pub struct MemoryWriter<'a> {
    tables: RwLockWriteGuard<'a, Tables>,
    undo: Vec<Undo>,
    committed: bool,
}

impl<'b> IndexView for MemoryWriter<'b> {
    type Cursor<'a> = MemoryCursor<'a> where Self: 'a;

    fn open_cursor(&self, index: IndexId) -> Result<MemoryCursor<'_>> {
        Ok(self.tables.view_cursor(index))
    }

    fn get_record(&self, ptr: RecordPtr) -> Result<Option<&[u8]>> {
        Ok(self.tables.records.get(&ptr).map(Vec::as_slice))
    }

    fn lookup_id(&self, id: &[u8; 32]) -> Result<Option<RecordPtr>> {
        Ok(self.tables.ids.get(id).copied())
    }

    fn record_count(&self) -> Result<u64> {
        Ok(self.tables.record_count())
    }
}

impl<'b> WriteBatch for MemoryWriter<'b> {
    fn next_pointer(&mut self) -> Result<RecordPtr> {
        let previous = self.tables.next_ptr;
        self.tables.next_ptr += 1;
        self.undo.push(Undo::ResetPointer(previous));
        Ok(self.tables.next_ptr)
    }

    fn put_record(&mut self, ptr: RecordPtr, raw: &[u8]) -> Result<()> {
        let undo = match self.tables.records.insert(ptr, raw.to_vec()) {
            Some(old) => Undo::RestoreRecord(ptr, old),
            None => Undo::RemoveRecord(ptr),
        };
        self.undo.push(undo);
        Ok(())
    }

    fn delete_record(&mut self, ptr: RecordPtr) -> Result<()> {
        if let Some(old) = self.tables.records.remove(&ptr) {
            self.undo.push(Undo::RestoreRecord(ptr, old));
        }
        Ok(())
    }

    fn put_id(&mut self, id: &[u8; 32], ptr: RecordPtr) -> Result<()> {
        let undo = match self.tables.ids.insert(*id, ptr) {
            Some(old) => Undo::RestoreId(*id, old),
            None => Undo::RemoveId(*id),
        };
        self.undo.push(undo);
        Ok(())
    }

    fn delete_id(&mut self, id: &[u8; 32]) -> Result<()> {
        if let Some(old) = self.tables.ids.remove(id) {
            self.undo.push(Undo::RestoreId(*id, old));
        }
        Ok(())
    }

    fn put_index(&mut self, index: IndexId, key: &[u8]) -> Result<()> {
        let inserted = self
            .tables
            .indexes
            .entry(index)
            .or_default()
            .insert(key.to_vec());
        if inserted {
            self.undo.push(Undo::RemoveIndex(index, key.to_vec()));
        }
        Ok(())
    }

    fn delete_index(&mut self, index: IndexId, key: &[u8]) -> Result<()> {
        let removed = self
            .tables
            .indexes
            .get_mut(&index)
            .is_some_and(|set| set.remove(key));
        if removed {
            self.undo.push(Undo::RestoreIndex(index, key.to_vec()));
        }
        Ok(())
    }

    fn commit(mut self) -> Result<()> {
        self.committed = true;
        self.undo.clear();
        Ok(())
    }
}

impl Drop for MemoryWriter<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        while let Some(undo) = self.undo.pop() {
            let tables = &mut *self.tables;
            match undo {
                Undo::RemoveRecord(ptr) => {
                    tables.records.remove(&ptr);
                }
                Undo::RestoreRecord(ptr, raw) => {
                    tables.records.insert(ptr, raw);
                }
                Undo::RemoveId(id) => {
                    tables.ids.remove(&id);
                }
                Undo::RestoreId(id, ptr) => {
                    tables.ids.insert(id, ptr);
                }
                Undo::RemoveIndex(index, key) => {
                    if let Some(set) = tables.indexes.get_mut(&index) {
                        set.remove(&key);
                    }
                }
                Undo::RestoreIndex(index, key) => {
                    tables.indexes.entry(index).or_default().insert(key);
                }
                Undo::ResetPointer(ptr) => tables.next_ptr = ptr,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(prefix: u8, ts: u32, ptr: u64) -> Vec<u8> {
        let mut k = vec![prefix];
        k.extend_from_slice(&ts.to_be_bytes());
        k.extend_from_slice(&ptr.to_be_bytes());
        k
    }

    #[test]
    fn dropped_writer_rolls_back() {
        let backend = MemoryBackend::new();
        {
            let mut w = backend.begin_write().unwrap();
            let ptr = w.next_pointer().unwrap();
            w.put_record(ptr, b"committed").unwrap();
            w.put_id(&[1; 32], ptr).unwrap();
            w.commit().unwrap();
        }
        {
            let mut w = backend.begin_write().unwrap();
            let ptr = w.next_pointer().unwrap();
            w.put_record(ptr, b"discarded").unwrap();
            w.put_index(IndexId::Kind, &key(1, 5, ptr)).unwrap();
            w.delete_id(&[1; 32]).unwrap();
            w.delete_record(1).unwrap();
        }

        let r = backend.begin_read().unwrap();
        assert_eq!(r.record_count().unwrap(), 1);
        assert_eq!(r.lookup_id(&[1; 32]).unwrap(), Some(1));
        assert_eq!(r.get_record(1).unwrap(), Some(&b"committed"[..]));
        let mut cursor = r.open_cursor(IndexId::Kind).unwrap();
        assert_eq!(cursor.seek(&[0xff]).unwrap(), None);
        drop(cursor);
        drop(r);

        let mut w = backend.begin_write().unwrap();
        assert_eq!(w.next_pointer().unwrap(), 2);
    }

    #[test]
    fn cursor_walks_backwards_from_seek_key() {
        let backend = MemoryBackend::new();
        let mut w = backend.begin_write().unwrap();
        for (ts, ptr) in [(10, 1), (20, 2), (30, 3)] {
            w.put_index(IndexId::CreatedAt, &key(0, ts, ptr)).unwrap();
        }
        w.commit().unwrap();

        let r = backend.begin_read().unwrap();
        let mut cursor = r.open_cursor(IndexId::CreatedAt).unwrap();
        let mut start = vec![0];
        start.extend_from_slice(&25u32.to_be_bytes());
        assert_eq!(cursor.seek(&start).unwrap(), Some(key(0, 20, 2).as_slice()));
        assert_eq!(cursor.prev().unwrap(), Some(key(0, 10, 1).as_slice()));
        assert_eq!(cursor.prev().unwrap(), None);
    }
}
