use std::collections::BTreeMap;

use ringlog_common::{Asn, Disposition, LogError, Lsn, RecordVersion, NO_LSN};

/// One ASN index entry. `lowest_lsn_of_higher_asns` is the minimum LSN of
/// any entry with a strictly greater ASN; it is the quantity consulted to
/// decide how far the stream's LSN range may shrink after a truncation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AsnEntry {
    pub asn: Asn,
    pub version: RecordVersion,
    pub io_buffer_size: u32,
    pub disposition: Disposition,
    pub lsn: Lsn,
    pub lowest_lsn_of_higher_asns: Lsn,
}

/// Saved pre-update state so a failed in-flight write can be rolled back.
/// `None` means the update was a fresh insert (rollback removes the entry).
#[derive(Clone, Debug)]
pub struct SavedEntryState {
    pub version: RecordVersion,
    pub io_buffer_size: u32,
    pub disposition: Disposition,
    pub lsn: Lsn,
}

/// Ordered container keyed by ASN, with version-conflict resolution and the
/// `lowest_lsn_of_higher_asns` decoration maintained on every mutation.
#[derive(Default)]
pub struct AsnIndex {
    map: BTreeMap<Asn, AsnEntry>,
}

impl AsnIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&self, asn: Asn) -> Option<&AsnEntry> {
        self.map.get(&asn)
    }

    pub fn lowest_asn(&self) -> Option<Asn> {
        self.map.keys().next().copied()
    }

    pub fn highest_asn(&self) -> Option<Asn> {
        self.map.keys().next_back().copied()
    }

    /// Lowest LSN referenced by any entry, derivable from the smallest-ASN
    /// entry alone thanks to the decoration.
    pub fn lowest_lsn(&self) -> Lsn {
        match self.map.values().next() {
            Some(first) => first.lsn.min(first.lowest_lsn_of_higher_asns),
            None => NO_LSN,
        }
    }

    /// Admit a write: insert a new entry, or replace an existing one when
    /// the incoming version is strictly higher. Returns the saved state the
    /// caller needs for [`AsnIndex::restore`] (`Ok(None)` for an insert).
    pub fn add_or_update(
        &mut self,
        asn: Asn,
        version: RecordVersion,
        io_buffer_size: u32,
        disposition: Disposition,
        lsn: Lsn,
    ) -> Result<Option<SavedEntryState>, LogError> {
        let saved = match self.map.get_mut(&asn) {
            None => {
                self.map.insert(
                    asn,
                    AsnEntry {
                        asn,
                        version,
                        io_buffer_size,
                        disposition,
                        lsn,
                        lowest_lsn_of_higher_asns: NO_LSN,
                    },
                );
                None
            }
            Some(existing) if existing.version < version => {
                let saved = SavedEntryState {
                    version: existing.version,
                    io_buffer_size: existing.io_buffer_size,
                    disposition: existing.disposition,
                    lsn: existing.lsn,
                };
                existing.version = version;
                existing.io_buffer_size = io_buffer_size;
                existing.disposition = disposition;
                existing.lsn = lsn;
                Some(saved)
            }
            Some(existing) => {
                return Err(LogError::StaleVersion {
                    asn,
                    existing: existing.version,
                    attempted: version,
                });
            }
        };
        self.refresh_decorations();
        Ok(saved)
    }

    /// CAS on version: assign the allocated LSN and move the entry along
    /// its lifecycle.
    pub fn update_lsn_and_disposition(
        &mut self,
        asn: Asn,
        expected_version: RecordVersion,
        disposition: Disposition,
        lsn: Lsn,
    ) -> Result<(), LogError> {
        {
            let entry = self.map.get_mut(&asn).ok_or(LogError::NotFound)?;
            if entry.version != expected_version {
                return Err(LogError::StaleVersion {
                    asn,
                    existing: entry.version,
                    attempted: expected_version,
                });
            }
            entry.disposition = disposition;
            entry.lsn = lsn;
        }
        self.refresh_decorations();
        Ok(())
    }

    /// CAS on version: disposition-only transition.
    pub fn update_disposition(
        &mut self,
        asn: Asn,
        expected_version: RecordVersion,
        disposition: Disposition,
    ) -> Result<(), LogError> {
        let entry = self.map.get_mut(&asn).ok_or(LogError::NotFound)?;
        if entry.version != expected_version {
            return Err(LogError::StaleVersion {
                asn,
                existing: entry.version,
                attempted: expected_version,
            });
        }
        entry.disposition = disposition;
        Ok(())
    }

    /// Undo a failed in-flight update: reinstate the saved state, or remove
    /// the entry if the update had been a fresh insert. Re-establishes the
    /// decoration for this and all lower-ASN entries.
    pub fn restore(
        &mut self,
        asn: Asn,
        expected_version: RecordVersion,
        saved: Option<SavedEntryState>,
    ) -> Result<(), LogError> {
        match self.map.get_mut(&asn) {
            None => return Err(LogError::NotFound),
            Some(entry) => {
                if entry.version != expected_version {
                    // A higher-version admission replaced the entry after
                    // our update; its own rollback owns the restore.
                    return Err(LogError::StaleVersion {
                        asn,
                        existing: entry.version,
                        attempted: expected_version,
                    });
                }
                match saved {
                    Some(saved) => {
                        entry.version = saved.version;
                        entry.io_buffer_size = saved.io_buffer_size;
                        entry.disposition = saved.disposition;
                        entry.lsn = saved.lsn;
                    }
                    None => {
                        self.map.remove(&asn);
                    }
                }
            }
        }
        self.refresh_decorations();
        Ok(())
    }

    /// Delete all entries with ASN ≤ `up_to`; returns the lowest LSN still
    /// referenced by the stream (or `NO_LSN` if it is now empty).
    pub fn truncate(&mut self, up_to: Asn) -> Lsn {
        self.map = self.map.split_off(&(up_to + 1));
        // Decorations of surviving entries are unaffected by removing lower
        // ASNs, but recompute for symmetry with the other mutators.
        self.refresh_decorations();
        self.lowest_lsn()
    }

    /// True when some entry at or below `asn` has not reached `Persisted`.
    /// Truncation requests must wait for those writes to settle.
    pub fn has_unsettled_at_or_below(&self, asn: Asn) -> bool {
        self.map
            .range(..=asn)
            .any(|(_, e)| e.disposition != Disposition::Persisted)
    }

    /// Highest ASN whose record has fully persisted.
    pub fn highest_persisted_asn(&self) -> Option<Asn> {
        self.map
            .iter()
            .rev()
            .find(|(_, e)| e.disposition == Disposition::Persisted)
            .map(|(asn, _)| *asn)
    }

    /// Entries in ASN order.
    pub fn iter(&self) -> impl Iterator<Item = &AsnEntry> {
        self.map.values()
    }

    /// `Persisted` entries in ASN order, the serializable subset used by
    /// stream checkpointing.
    pub fn persisted(&self) -> impl Iterator<Item = &AsnEntry> {
        self.map
            .values()
            .filter(|e| e.disposition == Disposition::Persisted)
    }

    pub fn range(&self, lo: Asn, hi: Asn) -> impl Iterator<Item = &AsnEntry> {
        self.map.range(lo..=hi).map(|(_, e)| e)
    }

    /// Recovery-side upsert: apply a scanned durable record, resolving ASN
    /// collisions by version (stale versions are ignored, not errors).
    pub fn recover_record(
        &mut self,
        asn: Asn,
        version: RecordVersion,
        io_buffer_size: u32,
        lsn: Lsn,
    ) -> bool {
        let applied = match self.map.get_mut(&asn) {
            None => {
                self.map.insert(
                    asn,
                    AsnEntry {
                        asn,
                        version,
                        io_buffer_size,
                        disposition: Disposition::Persisted,
                        lsn,
                        lowest_lsn_of_higher_asns: NO_LSN,
                    },
                );
                true
            }
            Some(existing) if existing.version < version => {
                existing.version = version;
                existing.io_buffer_size = io_buffer_size;
                existing.disposition = Disposition::Persisted;
                existing.lsn = lsn;
                true
            }
            Some(_) => false,
        };
        if applied {
            self.refresh_decorations();
        }
        applied
    }

    /// One descending pass re-deriving `lowest_lsn_of_higher_asns` as a
    /// running suffix minimum. Entries without an LSN (`NO_LSN`) do not
    /// contribute.
    fn refresh_decorations(&mut self) {
        let mut running = NO_LSN;
        for entry in self.map.values_mut().rev() {
            entry.lowest_lsn_of_higher_asns = running;
            running = running.min(entry.lsn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persisted(index: &mut AsnIndex, asn: Asn, version: RecordVersion, lsn: Lsn) {
        index
            .add_or_update(asn, version, 4096, Disposition::Persisted, lsn)
            .unwrap();
    }

    #[test]
    fn test_insert_and_decoration() {
        let mut index = AsnIndex::new();
        persisted(&mut index, 10, 1, 300);
        persisted(&mut index, 20, 1, 100);
        persisted(&mut index, 30, 1, 200);

        // Entry 10 sees the minimum LSN among ASNs 20 and 30.
        assert_eq!(index.get(10).unwrap().lowest_lsn_of_higher_asns, 100);
        assert_eq!(index.get(20).unwrap().lowest_lsn_of_higher_asns, 200);
        assert_eq!(index.get(30).unwrap().lowest_lsn_of_higher_asns, NO_LSN);
        assert_eq!(index.lowest_lsn(), 100);
    }

    #[test]
    fn test_version_conflict() {
        let mut index = AsnIndex::new();
        persisted(&mut index, 5, 2, 0);

        // Same version: stale.
        let err = index
            .add_or_update(5, 2, 0, Disposition::None, NO_LSN)
            .unwrap_err();
        assert!(matches!(err, LogError::StaleVersion { .. }));

        // Higher version: replaces, returns saved state.
        let saved = index
            .add_or_update(5, 3, 0, Disposition::None, NO_LSN)
            .unwrap()
            .expect("saved state for update");
        assert_eq!(saved.version, 2);
        assert_eq!(saved.disposition, Disposition::Persisted);
        assert_eq!(index.get(5).unwrap().version, 3);
    }

    #[test]
    fn test_restore_update() {
        let mut index = AsnIndex::new();
        persisted(&mut index, 5, 1, 4096);

        let saved = index
            .add_or_update(5, 2, 0, Disposition::None, NO_LSN)
            .unwrap();
        index.restore(5, 2, saved).unwrap();

        let entry = index.get(5).unwrap();
        assert_eq!(entry.version, 1);
        assert_eq!(entry.disposition, Disposition::Persisted);
        assert_eq!(entry.lsn, 4096);
    }

    #[test]
    fn test_restore_insert_removes_entry() {
        let mut index = AsnIndex::new();
        let saved = index
            .add_or_update(7, 1, 0, Disposition::None, NO_LSN)
            .unwrap();
        assert!(saved.is_none());
        index.restore(7, 1, saved).unwrap();
        assert!(index.get(7).is_none());
        assert!(index.is_empty());
    }

    #[test]
    fn test_restore_decoration_reestablished() {
        let mut index = AsnIndex::new();
        persisted(&mut index, 1, 1, 500);
        persisted(&mut index, 2, 1, 600);

        // In-flight rewrite of ASN 2 moves its LSN, then fails.
        let saved = index
            .add_or_update(2, 2, 0, Disposition::Pending, 900)
            .unwrap();
        index.restore(2, 2, saved).unwrap();
        assert_eq!(index.get(1).unwrap().lowest_lsn_of_higher_asns, 600);
    }

    #[test]
    fn test_truncate_returns_lowest_remaining() {
        let mut index = AsnIndex::new();
        for i in 1..=10u64 {
            persisted(&mut index, i, 1, i * 1000);
        }
        let low = index.truncate(4);
        assert_eq!(low, 5000);
        assert_eq!(index.lowest_asn(), Some(5));
        assert_eq!(index.len(), 6);

        // Truncating everything empties the index.
        assert_eq!(index.truncate(100), NO_LSN);
        assert!(index.is_empty());
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut index = AsnIndex::new();
        index
            .add_or_update(1, 1, 8192, Disposition::None, NO_LSN)
            .unwrap();
        index
            .update_lsn_and_disposition(1, 1, Disposition::Pending, 12288)
            .unwrap();
        assert_eq!(index.get(1).unwrap().lsn, 12288);
        index.update_disposition(1, 1, Disposition::Persisted).unwrap();
        assert_eq!(index.get(1).unwrap().disposition, Disposition::Persisted);

        // Wrong expected version is refused.
        assert!(matches!(
            index.update_disposition(1, 9, Disposition::Pending),
            Err(LogError::StaleVersion { .. })
        ));
    }

    #[test]
    fn test_unsettled_tracking() {
        let mut index = AsnIndex::new();
        persisted(&mut index, 1, 1, 100);
        index
            .add_or_update(2, 1, 0, Disposition::Pending, 200)
            .unwrap();
        persisted(&mut index, 3, 1, 300);

        assert!(!index.has_unsettled_at_or_below(1));
        assert!(index.has_unsettled_at_or_below(2));
        assert_eq!(index.highest_persisted_asn(), Some(3));
    }

    #[test]
    fn test_recover_record_version_resolution() {
        let mut index = AsnIndex::new();
        assert!(index.recover_record(4, 1, 0, 100));
        assert!(index.recover_record(4, 3, 0, 300));
        // Older version scanned later (out of LSN order) does not win.
        assert!(!index.recover_record(4, 2, 0, 200));
        assert_eq!(index.get(4).unwrap().version, 3);
        assert_eq!(index.get(4).unwrap().lsn, 300);
    }
}
