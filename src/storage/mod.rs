use std::sync::Arc;

use crate::config::{BackendKind, StoreConfig};
use crate::error::Result;

mod backend;
pub mod iterator;
pub mod keys;
pub mod lmdb;
pub mod memory;
pub mod merge;
pub mod planner;
pub mod record;
pub mod residual;
pub mod store;
pub mod writer;

pub use backend::{Backend, IndexCursor, IndexId, IndexView, RecordPtr, WriteBatch};
pub use lmdb::LmdbBackend;
pub use memory::MemoryBackend;
pub use store::{EventStore, Store};

pub type LmdbStore = Store<LmdbBackend>;
pub type MemoryStore = Store<MemoryBackend>;

/// Opens the backend selected by `config`.
pub fn open(config: &StoreConfig) -> Result<Arc<dyn EventStore>> {
    let tuning = config.tuning.clone();
    Ok(match config.backend {
        BackendKind::Lmdb => Arc::new(Store::new(
            LmdbBackend::new(&config.db_path, config.map_size_mb)?,
            tuning,
        )),
        BackendKind::Memory => Arc::new(Store::new(MemoryBackend::new(), tuning)),
    })
}
