//! Authoritative point buffer.
//!
//! One record per entity, allocated once at load. The only mutation after
//! load is the meta word, written through [`PointBuffer::set_meta`]. Readers
//! take encoded snapshots; a snapshot is produced under the read side of the
//! same lock that guards writes, so it never contains a torn word. Encoded
//! snapshots are cached per encoding until the next write.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::{
    bitmask::MetaLayout,
    errors::{ContractError, ContractResult},
    record::{DiffEntry, Encoding, EntityRecord},
    types::{EntityIndex, WorldPoint},
};

/// Immutable encoded view of the whole buffer.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub version: u64,
    pub encoding: Encoding,
    pub count: usize,
    pub bytes: Arc<[u8]>,
}

struct Inner {
    records: Vec<EntityRecord>,
    dirty_flags: Vec<bool>,
    dirty: Vec<EntityIndex>,
    version: u64,
}

impl Inner {
    fn check(&self, index: EntityIndex) -> ContractResult<usize> {
        let slot = index.as_usize();
        if slot >= self.records.len() {
            return Err(ContractError::IndexOutOfRange {
                index,
                count: self.records.len(),
            });
        }
        Ok(slot)
    }

    fn write_meta(&mut self, slot: usize, word: u32) -> bool {
        let record = &mut self.records[slot];
        if record.meta == word {
            return false;
        }
        record.meta = word;
        if !self.dirty_flags[slot] {
            self.dirty_flags[slot] = true;
            self.dirty.push(EntityIndex(slot as u32));
        }
        true
    }

    fn take_dirty(&mut self) -> Vec<EntityIndex> {
        let mut dirty = std::mem::take(&mut self.dirty);
        for index in &dirty {
            self.dirty_flags[index.as_usize()] = false;
        }
        dirty.sort_unstable();
        dirty
    }
}

pub struct PointBuffer {
    layout: MetaLayout,
    count: usize,
    inner: RwLock<Inner>,
    cache: Mutex<[Option<Snapshot>; 2]>,
}

impl PointBuffer {
    pub fn new(records: Vec<EntityRecord>, layout: MetaLayout) -> Self {
        let count = records.len();
        Self {
            layout,
            count,
            inner: RwLock::new(Inner {
                records,
                dirty_flags: vec![false; count],
                dirty: Vec::new(),
                version: 0,
            }),
            cache: Mutex::new([None, None]),
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn layout(&self) -> MetaLayout {
        self.layout
    }

    /// Overwrites one meta word. Returns whether the word changed; a change
    /// marks the index dirty. Out-of-range indices are rejected.
    pub fn set_meta(&self, index: EntityIndex, word: u32) -> ContractResult<bool> {
        let mut inner = self.inner.write();
        let slot = inner.check(index)?;
        let changed = inner.write_meta(slot, word);
        if changed {
            inner.version += 1;
        }
        Ok(changed)
    }

    /// Batched form of [`set_meta`](Self::set_meta) under a single write
    /// lock. Every index is validated before any word is written.
    pub fn set_meta_many(&self, updates: &[(EntityIndex, u32)]) -> ContractResult<usize> {
        let mut inner = self.inner.write();
        for (index, _) in updates {
            inner.check(*index)?;
        }
        let mut changed = 0;
        for (index, word) in updates {
            if inner.write_meta(index.as_usize(), *word) {
                changed += 1;
            }
        }
        if changed > 0 {
            inner.version += 1;
        }
        Ok(changed)
    }

    pub fn meta(&self, index: EntityIndex) -> ContractResult<u32> {
        let inner = self.inner.read();
        let slot = inner.check(index)?;
        Ok(inner.records[slot].meta)
    }

    pub fn record(&self, index: EntityIndex) -> ContractResult<EntityRecord> {
        let inner = self.inner.read();
        let slot = inner.check(index)?;
        Ok(inner.records[slot])
    }

    pub fn meta_words(&self) -> Vec<u32> {
        self.inner.read().records.iter().map(|r| r.meta).collect()
    }

    pub fn attrs(&self) -> Vec<u32> {
        self.inner.read().records.iter().map(|r| r.attr).collect()
    }

    pub fn positions(&self) -> Vec<WorldPoint> {
        self.inner.read().records.iter().map(|r| r.position).collect()
    }

    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    /// Encodes the full buffer. Repeated calls between writes share bytes.
    pub fn snapshot(&self, encoding: Encoding) -> Snapshot {
        let inner = self.inner.read();
        {
            let cache = self.cache.lock();
            if let Some(cached) = &cache[encoding.slot()] {
                if cached.version == inner.version {
                    return cached.clone();
                }
            }
        }

        let mut bytes = Vec::with_capacity(inner.records.len() * encoding.stride());
        for record in &inner.records {
            record.write(encoding, &mut bytes);
        }
        let snapshot = Snapshot {
            version: inner.version,
            encoding,
            count: inner.records.len(),
            bytes: Arc::from(bytes),
        };
        drop(inner);

        let mut cache = self.cache.lock();
        let replace = cache[encoding.slot()]
            .as_ref()
            .map(|cached| cached.version < snapshot.version)
            .unwrap_or(true);
        if replace {
            cache[encoding.slot()] = Some(snapshot.clone());
        }
        snapshot
    }

    /// Returns and clears the dirty set, sorted by index.
    pub fn drain_dirty(&self) -> Vec<EntityIndex> {
        self.inner.write().take_dirty()
    }

    /// Drains the dirty set together with the current attr/meta of each
    /// index, read under the same lock.
    pub fn drain_diff(&self) -> Vec<DiffEntry> {
        let mut inner = self.inner.write();
        let dirty = inner.take_dirty();
        dirty
            .into_iter()
            .map(|index| {
                let record = &inner.records[index.as_usize()];
                DiffEntry {
                    index,
                    attr: record.attr,
                    meta: record.meta,
                }
            })
            .collect()
    }

    pub fn dirty_len(&self) -> usize {
        self.inner.read().dirty.len()
    }
}

impl std::fmt::Debug for PointBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PointBuffer")
            .field("layout", &self.layout)
            .field("count", &self.count)
            .finish_non_exhaustive()
    }
}
