//! Durable record collections on top of sled.
//!
//! Each collection is a tree of JSON records keyed by id, plus a
//! `by-timestamp` index tree whose keys sort chronologically and, for
//! collections with a workflow status, a `by-status` index tree.
//! The database is opened on first use and the handle is shared by every
//! clone of the store.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    ClinicalNotes,
    DrugDispatch,
    Appointments,
}

impl Collection {
    pub fn name(self) -> &'static str {
        match self {
            Collection::ClinicalNotes => "clinical_notes",
            Collection::DrugDispatch => "drug_dispatch",
            Collection::Appointments => "appointments",
        }
    }

    fn indexed_by_status(self) -> bool {
        !matches!(self, Collection::ClinicalNotes)
    }
}

/// A value persisted in one of the collections.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + 'static {
    const COLLECTION: Collection;

    fn id(&self) -> &str;
    fn timestamp(&self) -> DateTime<Utc>;

    fn status(&self) -> Option<&'static str> {
        None
    }
}

enum Location {
    Path(PathBuf),
    Temporary,
}

struct StoreInner {
    location: Location,
    db: Mutex<Option<sled::Db>>,
}

#[derive(Clone)]
pub struct RecordStore {
    inner: Arc<StoreInner>,
}

struct Trees {
    records: sled::Tree,
    by_timestamp: sled::Tree,
    by_status: Option<sled::Tree>,
}

impl Trees {
    fn index<R: Record>(&self, record: &R) -> Result<(), StoreError> {
        self.by_timestamp
            .insert(timestamp_key(record.timestamp(), record.id()), record.id().as_bytes())?;
        if let (Some(tree), Some(status)) = (&self.by_status, record.status()) {
            tree.insert(status_key(status, record.id()), record.id().as_bytes())?;
        }
        Ok(())
    }

    fn unindex<R: Record>(&self, record: &R) -> Result<(), StoreError> {
        self.by_timestamp
            .remove(timestamp_key(record.timestamp(), record.id()))?;
        if let (Some(tree), Some(status)) = (&self.by_status, record.status()) {
            tree.remove(status_key(status, record.id()))?;
        }
        Ok(())
    }
}

impl RecordStore {
    /// Store backed by the directory at `path`. Nothing is opened until the
    /// first operation.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self::with_location(Location::Path(path.into()))
    }

    /// In-memory store that disappears when the last handle is dropped.
    pub fn temporary() -> Self {
        Self::with_location(Location::Temporary)
    }

    fn with_location(location: Location) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                location,
                db: Mutex::new(None),
            }),
        }
    }

    fn db(&self) -> Result<sled::Db, StoreError> {
        let mut guard = self.inner.db.lock();
        if let Some(db) = guard.as_ref() {
            return Ok(db.clone());
        }
        let db = match &self.inner.location {
            Location::Path(path) => {
                log::info!("Opening record store at {}", path.display());
                sled::open(path)?
            }
            Location::Temporary => sled::Config::new().temporary(true).open()?,
        };
        *guard = Some(db.clone());
        Ok(db)
    }

    fn trees(&self, collection: Collection) -> Result<Trees, StoreError> {
        let db = self.db()?;
        let name = collection.name();
        let by_status = if collection.indexed_by_status() {
            Some(db.open_tree(format!("{}/by-status", name))?)
        } else {
            None
        };
        Ok(Trees {
            records: db.open_tree(name)?,
            by_timestamp: db.open_tree(format!("{}/by-timestamp", name))?,
            by_status,
        })
    }

    /// Insert a new record; fails if the id is already taken.
    pub fn add<R: Record>(&self, record: &R) -> Result<(), StoreError> {
        let trees = self.trees(R::COLLECTION)?;
        let bytes = serde_json::to_vec(record)?;
        if trees
            .records
            .compare_and_swap(record.id().as_bytes(), None::<&[u8]>, Some(bytes))?
            .is_err()
        {
            return Err(StoreError::Duplicate(record.id().to_string()));
        }
        trees.index(record)
    }

    /// Insert or replace a record, keeping the indexes in step.
    pub fn put<R: Record>(&self, record: &R) -> Result<(), StoreError> {
        let trees = self.trees(R::COLLECTION)?;
        let bytes = serde_json::to_vec(record)?;
        if let Some(previous) = trees.records.insert(record.id().as_bytes(), bytes)? {
            let previous: R = serde_json::from_slice(&previous)?;
            trees.unindex(&previous)?;
        }
        trees.index(record)
    }

    pub fn get<R: Record>(&self, id: &str) -> Result<Option<R>, StoreError> {
        let trees = self.trees(R::COLLECTION)?;
        match trees.records.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Remove a record. Returns whether it existed.
    pub fn delete<R: Record>(&self, id: &str) -> Result<bool, StoreError> {
        let trees = self.trees(R::COLLECTION)?;
        match trees.records.remove(id.as_bytes())? {
            Some(bytes) => {
                let record: R = serde_json::from_slice(&bytes)?;
                trees.unindex(&record)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// All records of a collection, newest first.
    pub fn list<R: Record>(&self) -> Result<Vec<R>, StoreError> {
        let trees = self.trees(R::COLLECTION)?;
        let mut records = Vec::new();
        for entry in trees.by_timestamp.iter().rev() {
            let (_, id) = entry?;
            match trees.records.get(&id)? {
                Some(bytes) => records.push(serde_json::from_slice(&bytes)?),
                None => log::warn!(
                    "Dangling timestamp index entry in {}: {}",
                    R::COLLECTION.name(),
                    String::from_utf8_lossy(&id)
                ),
            }
        }
        Ok(records)
    }

    /// Records with the given status, newest first.
    pub fn list_by_status<R: Record>(&self, status: &str) -> Result<Vec<R>, StoreError> {
        let trees = self.trees(R::COLLECTION)?;
        let Some(index) = &trees.by_status else {
            return Ok(Vec::new());
        };
        let mut prefix = status.as_bytes().to_vec();
        prefix.push(0);

        let mut records: Vec<R> = Vec::new();
        for entry in index.scan_prefix(prefix) {
            let (_, id) = entry?;
            if let Some(bytes) = trees.records.get(&id)? {
                records.push(serde_json::from_slice(&bytes)?);
            }
        }
        records.sort_by(|a, b| b.timestamp().cmp(&a.timestamp()));
        Ok(records)
    }

    pub fn is_empty<R: Record>(&self) -> Result<bool, StoreError> {
        Ok(self.trees(R::COLLECTION)?.records.is_empty())
    }

    /// Flush and release the database. The next operation reopens it.
    pub fn close(&self) -> Result<(), StoreError> {
        let db = self.inner.db.lock().take();
        if let Some(db) = db {
            db.flush()?;
        }
        Ok(())
    }
}

// Big-endian with the sign bit flipped so byte order matches time order.
fn timestamp_key(timestamp: DateTime<Utc>, id: &str) -> Vec<u8> {
    let ordered = (timestamp.timestamp_micros() as u64) ^ (1 << 63);
    let mut key = ordered.to_be_bytes().to_vec();
    key.extend_from_slice(id.as_bytes());
    key
}

fn status_key(status: &str, id: &str) -> Vec<u8> {
    let mut key = status.as_bytes().to_vec();
    key.push(0);
    key.extend_from_slice(id.as_bytes());
    key
}
