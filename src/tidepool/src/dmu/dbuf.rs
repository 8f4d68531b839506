// Copyright (C) 2026 The Tidepool Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Dbufs: in-memory handles on one block of one object at one level.
//!
//! The state machine:
//!
//! ```text
//! UNCACHED --read--> READ ---------> CACHED
//! UNCACHED --fill--> FILL ---------> CACHED
//! UNCACHED --nofill--> NOFILL -----> CACHED
//! CACHED -----evict----> EVICTING -> (dropped)
//! ```
//!
//! A transition into CACHED publishes a stable buffer and wakes waiters
//! on `db_changed`; leaving CACHED requires zero holds. Each dbuf keeps
//! its dirty records newest-first, one per txg. When a newer txg first
//! dirties a dbuf, the previous record is frozen with a private copy of
//! the buffer, so the syncing txg always writes the bytes it saw.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, RwLock};

use tp_utils::Refcount;

use crate::blkptr::BlockPtr;

/// Stripe count for the global dbuf hash.
pub const DBUF_RWLOCKS: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DbufKey {
    pub objset: u64,
    pub object: u64,
    pub level: u8,
    pub blkid: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbufState {
    Uncached,
    Read,
    Fill,
    NoFill,
    Cached,
    Evicting,
}

/// One txg's worth of pending change to one dbuf.
pub struct DirtyRecord {
    pub txg: u64,
    pub key: DbufKey,
    /// Frozen copy of the buffer, set when a newer txg first redirties
    /// the dbuf (or at sync start). `None` means the live buffer is
    /// still the right image.
    pub frozen: Mutex<Option<Vec<u8>>>,
    /// Dirty children (indirect dbufs only).
    pub children: Mutex<Vec<Arc<DirtyRecord>>>,
    /// Block pointer already produced outside the sync path (intent-log
    /// direct writes).
    pub override_bp: Mutex<Option<BlockPtr>>,
}

pub struct DbufInner {
    pub state: DbufState,
    pub data: Option<Vec<u8>>,
    /// Newest first; strictly decreasing txgs.
    pub dirty: Vec<Arc<DirtyRecord>>,
    pub pending_evict: bool,
}

pub struct Dbuf {
    pub key: DbufKey,
    pub inner: Mutex<DbufInner>,
    /// `db_changed`: broadcast on every state transition into CACHED.
    pub cv: Condvar,
    pub holds: Refcount,
}

impl Dbuf {
    fn new(key: DbufKey) -> Arc<Dbuf> {
        Arc::new(Dbuf {
            key,
            inner: Mutex::new(DbufInner {
                state: DbufState::Uncached,
                data: None,
                dirty: Vec::new(),
                pending_evict: false,
            }),
            cv: Condvar::new(),
            holds: Refcount::new(),
        })
    }

    pub fn state(&self) -> DbufState {
        self.inner.lock().unwrap().state
    }

    /// Publish `data` and move to CACHED; wakes `db_changed` waiters.
    pub fn fill_done(&self, data: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(matches!(
            inner.state,
            DbufState::Read | DbufState::Fill | DbufState::NoFill
        ));
        inner.data = Some(data);
        inner.state = DbufState::Cached;
        drop(inner);
        self.cv.notify_all();
    }

    /// A read that failed returns the dbuf to UNCACHED so another caller
    /// can retry.
    pub fn read_failed(&self) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert_eq!(inner.state, DbufState::Read);
        inner.state = DbufState::Uncached;
        drop(inner);
        self.cv.notify_all();
    }

    /// Head dirty record for `txg`, if this txg already dirtied the
    /// dbuf.
    pub fn dirty_record_for(&self, txg: u64) -> Option<Arc<DirtyRecord>> {
        let inner = self.inner.lock().unwrap();
        inner.dirty.iter().find(|d| d.txg == txg).map(Arc::clone)
    }

    /// The bytes txg `txg` must write: the frozen copy if the record was
    /// frozen, the live buffer otherwise.
    pub fn sync_data(&self, dr: &DirtyRecord) -> Option<Vec<u8>> {
        if let Some(frozen) = dr.frozen.lock().unwrap().clone() {
            return Some(frozen);
        }
        self.inner.lock().unwrap().data.clone()
    }

    /// Drop a completed dirty record.
    pub fn undirty(&self, txg: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.dirty.retain(|d| d.txg != txg);
    }

    pub fn is_dirty(&self) -> bool {
        !self.inner.lock().unwrap().dirty.is_empty()
    }
}

/// The global dbuf hash: fixed stripe array selected by the low bits of
/// the key hash.
pub struct DbufHash {
    stripes: Vec<RwLock<HashMap<DbufKey, Arc<Dbuf>>>>,
}

impl Default for DbufHash {
    fn default() -> Self {
        Self::new()
    }
}

impl DbufHash {
    pub fn new() -> Self {
        DbufHash {
            stripes: (0..DBUF_RWLOCKS).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn stripe(&self, key: &DbufKey) -> &RwLock<HashMap<DbufKey, Arc<Dbuf>>> {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let mut h = DefaultHasher::new();
        key.hash(&mut h);
        &self.stripes[(h.finish() as usize) & (DBUF_RWLOCKS - 1)]
    }

    /// Find or create; the returned dbuf carries one hold for `tag`.
    pub fn hold(&self, key: DbufKey, tag: &'static str) -> Arc<Dbuf> {
        {
            let stripe = self.stripe(&key).read().unwrap();
            if let Some(db) = stripe.get(&key) {
                db.holds.add(tag);
                return Arc::clone(db);
            }
        }
        let mut stripe = self.stripe(&key).write().unwrap();
        let db = stripe
            .entry(key)
            .or_insert_with(|| Dbuf::new(key));
        db.holds.add(tag);
        Arc::clone(db)
    }

    pub fn lookup(&self, key: &DbufKey) -> Option<Arc<Dbuf>> {
        self.stripe(key).read().unwrap().get(key).map(Arc::clone)
    }

    /// Release a hold; a holdless, clean, cached dbuf flagged for
    /// eviction is dropped from the hash.
    pub fn rele(&self, db: &Arc<Dbuf>, tag: &'static str) {
        let remaining = db.holds.remove(tag);
        if remaining > 0 {
            return;
        }
        let evict = {
            let inner = db.inner.lock().unwrap();
            inner.pending_evict && inner.dirty.is_empty() && inner.state == DbufState::Cached
        };
        if evict {
            self.evict(&db.key);
        }
    }

    /// Evict one dbuf if it is clean and holdless.
    pub fn evict(&self, key: &DbufKey) -> bool {
        let mut stripe = self.stripe(key).write().unwrap();
        if let Some(db) = stripe.get(key) {
            if !db.holds.is_zero() {
                return false;
            }
            let mut inner = db.inner.lock().unwrap();
            if !inner.dirty.is_empty() {
                return false;
            }
            inner.state = DbufState::Evicting;
            inner.data = None;
            drop(inner);
            stripe.remove(key);
            return true;
        }
        false
    }

    /// Drop every dbuf of one object (object free).
    pub fn evict_objset_object(&self, objset: u64, object: u64) {
        for stripe in &self.stripes {
            let mut map = stripe.write().unwrap();
            map.retain(|k, db| {
                if k.objset != objset || k.object != object {
                    return true;
                }
                let mut inner = db.inner.lock().unwrap();
                inner.state = DbufState::Evicting;
                inner.data = None;
                false
            });
        }
    }

    /// Drop every dbuf of an objset (dataset destroy / objset close).
    pub fn evict_objset(&self, objset: u64) {
        for stripe in &self.stripes {
            let mut map = stripe.write().unwrap();
            map.retain(|k, db| {
                if k.objset != objset {
                    return true;
                }
                let mut inner = db.inner.lock().unwrap();
                inner.state = DbufState::Evicting;
                inner.data = None;
                false
            });
        }
    }

    pub fn len(&self) -> usize {
        self.stripes.iter().map(|s| s.read().unwrap().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(blkid: u64) -> DbufKey {
        DbufKey {
            objset: 1,
            object: 2,
            level: 0,
            blkid,
        }
    }

    #[test]
    fn hold_returns_same_dbuf() {
        let hash = DbufHash::new();
        let a = hash.hold(key(0), "a");
        let b = hash.hold(key(0), "b");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.holds.count(), 2);
        hash.rele(&a, "a");
        hash.rele(&b, "b");
    }

    #[test]
    fn fsm_read_to_cached() {
        let hash = DbufHash::new();
        let db = hash.hold(key(1), "t");
        assert_eq!(db.state(), DbufState::Uncached);
        {
            let mut inner = db.inner.lock().unwrap();
            inner.state = DbufState::Read;
        }
        db.fill_done(vec![1, 2, 3]);
        assert_eq!(db.state(), DbufState::Cached);
        assert_eq!(db.inner.lock().unwrap().data.as_ref().unwrap().len(), 3);
        hash.rele(&db, "t");
    }

    #[test]
    fn eviction_requires_no_holds_and_clean() {
        let hash = DbufHash::new();
        let db = hash.hold(key(2), "t");
        {
            let mut inner = db.inner.lock().unwrap();
            inner.state = DbufState::Cached;
            inner.data = Some(vec![0u8; 8]);
        }
        assert!(!hash.evict(&key(2)), "held dbuf must not evict");
        hash.rele(&db, "t");
        assert!(hash.evict(&key(2)));
        assert!(hash.lookup(&key(2)).is_none());
    }

    #[test]
    fn dirty_records_are_per_txg_and_freezable() {
        let hash = DbufHash::new();
        let db = hash.hold(key(3), "t");
        {
            let mut inner = db.inner.lock().unwrap();
            inner.state = DbufState::Cached;
            inner.data = Some(vec![0xaa; 16]);
            inner.dirty.insert(
                0,
                Arc::new(DirtyRecord {
                    txg: 10,
                    key: key(3),
                    frozen: Mutex::new(None),
                    children: Mutex::new(Vec::new()),
                    override_bp: Mutex::new(None),
                }),
            );
        }
        let dr = db.dirty_record_for(10).unwrap();
        // Unfrozen: sync sees the live buffer.
        assert_eq!(db.sync_data(&dr).unwrap(), vec![0xaa; 16]);
        // Freeze, then mutate the live buffer; sync still sees the old image.
        *dr.frozen.lock().unwrap() = Some(vec![0xaa; 16]);
        db.inner.lock().unwrap().data = Some(vec![0xbb; 16]);
        assert_eq!(db.sync_data(&dr).unwrap(), vec![0xaa; 16]);
        db.undirty(10);
        assert!(!db.is_dirty());
        hash.rele(&db, "t");
    }
}
