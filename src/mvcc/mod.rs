//! # Snapshot Versioning
//!
//! Concurrency in the store is single-writer, many-reader. Writers
//! serialize on a writer lock and advance a monotonic version counter, one
//! tick per successful commit. Readers capture `{root, version, mapping}`
//! under a short-held snapshot lock and are then completely lock-free: the
//! pages their root can reach are immutable by the copy-on-write
//! discipline.
//!
//! The one coupling point between the two sides is storage reclamation. A
//! page released at version `v` may still be reachable from the snapshot of
//! any reader whose captured version is below `v`, so the free list refuses
//! to recycle it until the minimum live reader version has caught up. The
//! [`ReaderTable`] provides that minimum: a multiset of captured versions
//! with cheap insert, remove and min lookup.
//!
//! ## Ordering Guarantees
//!
//! - A reader at version `V` observes every commit with version <= `V` and
//!   nothing newer.
//! - Two successful commits never share a version.
//! - A page released at version `W` is never handed out while a reader at a
//!   version < `W` is live.

use std::collections::BTreeMap;

/// Multiset of live reader versions, ordered for O(log n) minimum lookup.
/// Guarded by the store's snapshot mutex.
#[derive(Debug, Default)]
pub struct ReaderTable {
    versions: BTreeMap<u64, usize>,
}

impl ReaderTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, version: u64) {
        *self.versions.entry(version).or_insert(0) += 1;
    }

    pub fn unregister(&mut self, version: u64) {
        match self.versions.get_mut(&version) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.versions.remove(&version);
            }
            None => panic!("unregister of an unknown reader version {version}"),
        }
    }

    /// Version of the oldest live reader, if any.
    pub fn min_version(&self) -> Option<u64> {
        self.versions.keys().next().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_table_has_no_minimum() {
        let table = ReaderTable::new();

        assert_eq!(table.min_version(), None);
        assert!(table.is_empty());
    }

    #[test]
    fn minimum_tracks_the_oldest_reader() {
        let mut table = ReaderTable::new();
        table.register(7);
        table.register(3);
        table.register(9);

        assert_eq!(table.min_version(), Some(3));
    }

    #[test]
    fn unregister_releases_one_reader_at_a_time() {
        let mut table = ReaderTable::new();
        table.register(3);
        table.register(3);
        table.register(8);

        table.unregister(3);
        assert_eq!(table.min_version(), Some(3));

        table.unregister(3);
        assert_eq!(table.min_version(), Some(8));
    }

    #[test]
    #[should_panic(expected = "unknown reader version")]
    fn unregister_of_unknown_version_panics() {
        let mut table = ReaderTable::new();
        table.unregister(42);
    }
}
