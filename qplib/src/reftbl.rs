//! Resource id → handle lookup for asynchronous event dispatch
//!
//! The table holds weak handles only; owners keep the resources alive.
//! Lookups take the read lock, create/destroy take the write lock.

use crate::{QplibError, Result};
use log::{debug, warn};
use parking_lot::RwLock;
use std::sync::{Arc, Weak};

struct Record<T> {
    xid: u32,
    handle: Weak<T>,
}

pub struct ReferenceTable<T> {
    name: &'static str,
    records: RwLock<Vec<Option<Record<T>>>>,
}

impl<T> ReferenceTable<T> {
    pub fn new(name: &'static str, capacity: u32) -> Self {
        let capacity = capacity.max(1) as usize;
        Self {
            name,
            records: RwLock::new((0..capacity).map(|_| None).collect()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.records.read().len()
    }

    fn index(&self, xid: u32, len: usize) -> usize {
        xid as usize % len
    }

    /// Register `handle` under `xid`
    pub fn insert(&self, xid: u32, handle: &Arc<T>) -> Result<()> {
        let mut records = self.records.write();
        let idx = self.index(xid, records.len());
        if let Some(existing) = &records[idx] {
            if existing.handle.strong_count() > 0 {
                warn!(
                    "{} table slot {} busy (xid 0x{:x}), cannot insert 0x{:x}",
                    self.name, idx, existing.xid, xid
                );
                return Err(QplibError::Busy(format!("{} table slot {}", self.name, idx)));
            }
        }
        records[idx] = Some(Record {
            xid,
            handle: Arc::downgrade(handle),
        });
        debug!("{} table: inserted 0x{:x} at {}", self.name, xid, idx);
        Ok(())
    }

    /// Remove the record for `xid`, returning the weak handle it held.
    /// Removing an id that is not present is rejected and leaves the
    /// table untouched.
    pub fn remove(&self, xid: u32) -> Result<Weak<T>> {
        let mut records = self.records.write();
        let idx = self.index(xid, records.len());
        match records[idx].take() {
            Some(record) if record.xid == xid => {
                debug!("{} table: removed 0x{:x}", self.name, xid);
                Ok(record.handle)
            }
            other => {
                records[idx] = other;
                Err(QplibError::AlreadyDestroyed(xid))
            }
        }
    }

    /// Put back a record removed by `remove` (used when teardown fails)
    pub fn restore(&self, xid: u32, handle: Weak<T>) {
        let mut records = self.records.write();
        let idx = self.index(xid, records.len());
        records[idx] = Some(Record { xid, handle });
    }

    pub fn lookup(&self, xid: u32) -> Option<Arc<T>> {
        let records = self.records.read();
        let idx = self.index(xid, records.len());
        records[idx]
            .as_ref()
            .filter(|record| record.xid == xid)
            .and_then(|record| record.handle.upgrade())
    }

    pub fn contains(&self, xid: u32) -> bool {
        self.lookup(xid).is_some()
    }

    /// Live handles, in table order
    pub fn live(&self) -> Vec<Arc<T>> {
        self.records
            .read()
            .iter()
            .flatten()
            .filter_map(|record| record.handle.upgrade())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_lookup_remove() {
        let table = ReferenceTable::new("qp", 8);
        let qp = Arc::new(42u32);

        table.insert(3, &qp).unwrap();
        assert_eq!(*table.lookup(3).unwrap(), 42);
        assert!(table.lookup(11).is_none()); // same slot, different id

        table.remove(3).unwrap();
        assert!(table.lookup(3).is_none());
    }

    #[test]
    fn test_double_remove_rejected() {
        let table = ReferenceTable::new("cq", 8);
        let a = Arc::new("a");
        let b = Arc::new("b");
        table.insert(1, &a).unwrap();
        table.insert(2, &b).unwrap();

        table.remove(1).unwrap();
        assert_eq!(table.remove(1).unwrap_err(), QplibError::AlreadyDestroyed(1));
        // Wrong id mapping to an occupied slot leaves it alone
        assert_eq!(table.remove(10).unwrap_err(), QplibError::AlreadyDestroyed(10));
        assert_eq!(*table.lookup(2).unwrap(), "b");
    }

    #[test]
    fn test_weak_handles_do_not_own() {
        let table = ReferenceTable::new("srq", 4);
        let srq = Arc::new(7u8);
        table.insert(0, &srq).unwrap();
        drop(srq);
        assert!(table.lookup(0).is_none());
        assert!(table.live().is_empty());

        // A dead record no longer blocks its slot
        let other = Arc::new(8u8);
        table.insert(4, &other).unwrap();
        assert_eq!(*table.lookup(4).unwrap(), 8);
    }

    #[test]
    fn test_restore_after_remove() {
        let table = ReferenceTable::new("qp", 4);
        let qp = Arc::new(1u32);
        table.insert(2, &qp).unwrap();
        let weak = table.remove(2).unwrap();
        table.restore(2, weak);
        assert!(table.contains(2));
    }

    #[test]
    fn test_collision_with_live_handle() {
        let table = ReferenceTable::new("qp", 4);
        let a = Arc::new(1u32);
        let b = Arc::new(2u32);
        table.insert(1, &a).unwrap();
        assert!(matches!(table.insert(5, &b), Err(QplibError::Busy(_))));
    }
}
