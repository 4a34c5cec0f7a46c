use cells::{Cell, KeyRange, OwnedKey};
use std::collections::{BTreeMap, HashMap};

/// An MVCC version: a global step plus the transaction that committed at it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub step: u64,
    pub tx_id: u64,
}

impl Version {
    /// The read-everything-committed sentinel used for HEAD reads.
    pub const HEAD: Version = Version { step: u64::MAX, tx_id: u64::MAX };

    pub fn new(step: u64, tx_id: u64) -> Self {
        Self { step, tx_id }
    }

    pub fn is_head(&self) -> bool {
        *self == Self::HEAD
    }
}

/// One visible row of a scan.
#[derive(Clone, Debug, PartialEq)]
pub struct ScanItem {
    pub key: OwnedKey,
    pub row: Vec<Cell>,
}

/// A page of a snapshot scan.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScanPage {
    pub items: Vec<ScanItem>,
    /// A key in the scanned span carries a committed version above the read
    /// snapshot; readers holding locks break them on this signal.
    pub saw_newer_version: bool,
    /// The range was fully consumed.
    pub exhausted: bool,
}

/// The read interface the shard iterator consumes. Implemented by the
/// in-memory MVCC store here and by the real storage engine elsewhere.
pub trait TableStore {
    /// Latest committed version.
    fn head_version(&self) -> Version;

    /// Whether an in-flight planned writer intersects `range`.
    fn has_open_writer(&self, range: &KeyRange) -> bool;

    /// Scans `range` at `at`, starting strictly after `after` in scan order,
    /// returning up to `limit` visible rows.
    fn scan(
        &self,
        range: &KeyRange,
        after: Option<&OwnedKey>,
        reverse: bool,
        at: Version,
        limit: usize,
    ) -> ScanPage;
}

#[derive(Default)]
struct VersionChain {
    // Ascending by version; None marks an erase.
    versions: Vec<(Version, Option<Vec<Cell>>)>,
}

impl VersionChain {
    fn visible_at(&self, at: Version) -> Option<&Vec<Cell>> {
        self.versions
            .iter()
            .rev()
            .find(|(v, _)| *v <= at)
            .and_then(|(_, row)| row.as_ref())
    }

    fn newest(&self) -> Option<Version> {
        self.versions.last().map(|(v, _)| *v)
    }

    fn put(&mut self, version: Version, row: Option<Vec<Cell>>) {
        let position = self.versions.partition_point(|(v, _)| *v <= version);
        self.versions.insert(position, (version, row));
    }
}

/// An in-memory MVCC table: a key-ordered map of version chains plus the
/// set of planned-but-uncommitted writers.
#[derive(Default)]
pub struct MemStore {
    rows: BTreeMap<OwnedKey, VersionChain>,
    open_writers: HashMap<u64, Vec<OwnedKey>>,
    head: Option<Version>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commits a row at an explicit version.
    pub fn upsert(&mut self, key: OwnedKey, row: Vec<Cell>, version: Version) {
        self.rows.entry(key).or_default().put(version, Some(row));
        self.head = Some(self.head.map_or(version, |h| h.max(version)));
    }

    /// Commits an erase at an explicit version.
    pub fn erase(&mut self, key: OwnedKey, version: Version) {
        self.rows.entry(key).or_default().put(version, None);
        self.head = Some(self.head.map_or(version, |h| h.max(version)));
    }

    /// Registers a planned writer over `keys`; HEAD reads touching them
    /// restart at the latest committed version.
    pub fn plan_write(&mut self, tx_id: u64, keys: Vec<OwnedKey>) {
        self.open_writers.insert(tx_id, keys);
    }

    /// Commits a planned writer's rows and clears the conflict marker.
    pub fn commit_planned(&mut self, tx_id: u64, version: Version, rows: Vec<(OwnedKey, Option<Vec<Cell>>)>) {
        self.open_writers.remove(&tx_id);
        for (key, row) in rows {
            match row {
                Some(row) => self.upsert(key, row, version),
                None => self.erase(key, version),
            }
        }
    }

    pub fn abort_planned(&mut self, tx_id: u64) {
        self.open_writers.remove(&tx_id);
    }
}

impl TableStore for MemStore {
    fn head_version(&self) -> Version {
        self.head.unwrap_or(Version::new(0, 0))
    }

    fn has_open_writer(&self, range: &KeyRange) -> bool {
        self.open_writers
            .values()
            .flatten()
            .any(|key| range.contains(key.cells()))
    }

    fn scan(
        &self,
        range: &KeyRange,
        after: Option<&OwnedKey>,
        reverse: bool,
        at: Version,
        limit: usize,
    ) -> ScanPage {
        let mut page = ScanPage::default();
        if limit == 0 {
            return page;
        }

        let in_range = |key: &OwnedKey| range.contains(key.cells());
        let past_cursor = |key: &OwnedKey| match after {
            None => true,
            Some(cursor) => {
                if reverse {
                    key < cursor
                } else {
                    key > cursor
                }
            }
        };

        // Once `limit` rows are collected, scanning continues only to learn
        // whether another visible row follows: a chunk that consumed the last
        // row of its range must still report the range exhausted.
        let mut visit = |key: &OwnedKey, chain: &VersionChain, page: &mut ScanPage| -> bool {
            if let Some(newest) = chain.newest() {
                if newest > at {
                    page.saw_newer_version = true;
                }
            }
            if let Some(row) = chain.visible_at(at) {
                if page.items.len() >= limit {
                    return false;
                }
                page.items.push(ScanItem { key: key.clone(), row: row.clone() });
            }
            true
        };

        if reverse {
            for (key, chain) in self.rows.iter().rev() {
                if !in_range(key) || !past_cursor(key) {
                    continue;
                }
                if !visit(key, chain, &mut page) {
                    return page;
                }
            }
        } else {
            for (key, chain) in self.rows.iter() {
                if !in_range(key) || !past_cursor(key) {
                    continue;
                }
                if !visit(key, chain, &mut page) {
                    return page;
                }
            }
        }
        page.exhausted = true;
        page
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use cells::KeyBound;

    fn key(cells: &[u32]) -> OwnedKey {
        OwnedKey::new(cells.iter().map(|c| Cell::Uint32(*c)).collect())
    }

    fn row(value: u32) -> Vec<Cell> {
        vec![Cell::Uint32(value)]
    }

    fn range(from: &[u32], to: &[u32]) -> KeyRange {
        KeyRange::new(
            KeyBound::inclusive(from.iter().map(|c| Cell::Uint32(*c)).collect()),
            KeyBound::inclusive(to.iter().map(|c| Cell::Uint32(*c)).collect()),
        )
    }

    #[test]
    fn reads_at_versions() {
        let mut store = MemStore::new();
        store.upsert(key(&[1]), row(100), Version::new(10, 1));
        store.upsert(key(&[1]), row(101), Version::new(20, 2));

        let page = store.scan(&range(&[1], &[1]), None, false, Version::new(15, u64::MAX), 10);
        assert_eq!(page.items[0].row, row(100));
        assert!(page.saw_newer_version);

        let page = store.scan(&range(&[1], &[1]), None, false, Version::HEAD, 10);
        assert_eq!(page.items[0].row, row(101));
        assert!(!page.saw_newer_version);
    }

    #[test]
    fn erased_rows_are_invisible() {
        let mut store = MemStore::new();
        store.upsert(key(&[1]), row(100), Version::new(10, 1));
        store.erase(key(&[1]), Version::new(20, 2));

        let page = store.scan(&range(&[1], &[1]), None, false, Version::HEAD, 10);
        assert!(page.items.is_empty());
        assert!(page.exhausted);

        let page = store.scan(&range(&[1], &[1]), None, false, Version::new(15, 0), 10);
        assert_eq!(page.items.len(), 1);
    }

    #[test]
    fn scans_resume_after_a_cursor() {
        let mut store = MemStore::new();
        for k in [1u32, 3, 5, 8] {
            store.upsert(key(&[k]), row(k * 100), Version::new(10, 1));
        }

        let span = range(&[1], &[8]);
        let page = store.scan(&span, None, false, Version::HEAD, 2);
        assert_eq!(page.items.len(), 2);
        assert!(!page.exhausted);

        let cursor = page.items.last().map(|i| i.key.clone());
        let page = store.scan(&span, cursor.as_ref(), false, Version::HEAD, 10);
        assert_eq!(page.items.len(), 2);
        assert!(page.exhausted);
        assert_eq!(page.items[0].key, key(&[5]));

        let page = store.scan(&span, None, true, Version::HEAD, 10);
        let keys: Vec<u32> = page
            .items
            .iter()
            .map(|i| match i.key.cells()[0] {
                Cell::Uint32(v) => v,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(keys, vec![8, 5, 3, 1]);
    }

    #[test]
    fn open_writers_are_conflicts() {
        let mut store = MemStore::new();
        store.upsert(key(&[5]), row(500), Version::new(10, 1));
        store.plan_write(77, vec![key(&[5])]);

        assert!(store.has_open_writer(&range(&[1], &[8])));
        assert!(!store.has_open_writer(&range(&[6], &[8])));

        store.commit_planned(77, Version::new(20, 77), vec![(key(&[5]), Some(row(501)))]);
        assert!(!store.has_open_writer(&range(&[1], &[8])));
        let page = store.scan(&range(&[5], &[5]), None, false, Version::HEAD, 1);
        assert_eq!(page.items[0].row, row(501));
    }
}
