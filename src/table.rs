use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, trace};

use crate::index::Index;
use crate::page::Page;
use crate::Rid;

/// A base-page or tail-page location: `(page_idx, slot_idx)`.
pub type Location = (usize, usize);

/// A single version-chain entry: one slot per column, present iff that
/// column changed in this version.
pub type VersionEntry = Vec<Option<Location>>;

/// One projected (or partially projected) row, as returned by `Query`.
/// `columns[i]` is `None` wherever the caller's projection mask asked for
/// that column to be omitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub rid: Rid,
    pub key: i64,
    pub columns: Vec<Option<i64>>,
}

impl Record {
    pub fn new(rid: Rid, key: i64, columns: Vec<Option<i64>>) -> Self {
        Record { rid, key, columns }
    }
}

struct ColumnStore {
    base: RwLock<Vec<Arc<Page>>>,
    tail: RwLock<Vec<Arc<Page>>>,
}

impl ColumnStore {
    fn new() -> Self {
        ColumnStore {
            base: RwLock::new(vec![Arc::new(Page::new())]),
            tail: RwLock::new(vec![Arc::new(Page::new())]),
        }
    }
}

/// Appends `value` to the last page in `pages`, allocating a fresh page
/// first if the last one is full. The common case (room in the last page)
/// only ever takes a read lock on `pages`, since `Page::write` has its own
/// internal mutex; a write lock on the page list is only taken on the rare
/// page-allocating path.
fn append_to(pages: &RwLock<Vec<Arc<Page>>>, value: i64) -> Location {
    {
        let guard = pages.read().unwrap();
        let idx = guard.len() - 1;
        if guard[idx].write(value) {
            return (idx, guard[idx].num_records() - 1);
        }
    }
    let mut guard = pages.write().unwrap();
    let idx = guard.len() - 1;
    if guard[idx].has_capacity() {
        let ok = guard[idx].write(value);
        debug_assert!(ok);
        return (idx, guard[idx].num_records() - 1);
    }
    guard.push(Arc::new(Page::new()));
    let idx = guard.len() - 1;
    guard[idx].write(value);
    (idx, guard[idx].num_records() - 1)
}

/// Columnar, append-mostly storage for one fixed-arity table of signed
/// 64-bit integers.
///
/// `name`, `key`, and `num_columns` are set once at construction and never
/// mutated again, so the getters need no lock at all. The RID counter is
/// an atomic rather than a separately locked field, since `insert_row` is
/// the only RID-allocating call site in this crate.
pub struct Table {
    name: String,
    key: usize,
    num_columns: usize,

    columns: Vec<ColumnStore>,

    page_directory: Mutex<HashMap<Rid, Vec<Location>>>,
    version_chain: Mutex<HashMap<Rid, Vec<VersionEntry>>>,
    rid_counter: AtomicU64,
    insert_lock: Mutex<()>,

    index: Index,
}

impl Table {
    pub fn new(name: &str, num_columns: usize, key: usize) -> Self {
        assert!(key < num_columns, "key column index out of range");
        let table = Table {
            name: name.to_string(),
            key,
            num_columns,
            columns: (0..num_columns).map(|_| ColumnStore::new()).collect(),
            page_directory: Mutex::new(HashMap::new()),
            version_chain: Mutex::new(HashMap::new()),
            rid_counter: AtomicU64::new(0),
            insert_lock: Mutex::new(()),
            index: Index::new(num_columns),
        };
        table.index.create_index(key, std::iter::empty());
        table
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_columns(&self) -> usize {
        self.num_columns
    }

    pub fn key_col(&self) -> usize {
        self.key
    }

    pub(crate) fn index(&self) -> &Index {
        &self.index
    }

    /// Rejects a duplicate key, allocates a RID, appends each column's
    /// value, and installs the page-directory and index entries, all as
    /// one critical section under `insert_lock`. A narrower scope would let
    /// two concurrent inserts both pass the uniqueness check.
    pub fn insert_row(&self, values: &[i64]) -> Option<Rid> {
        assert_eq!(values.len(), self.num_columns, "column count mismatch");
        let _guard = self.insert_lock.lock().unwrap();

        let key_value = values[self.key];
        if self.index.locate(self.key, key_value).is_some() {
            debug!(
                "insert into {} rejected: duplicate key {}",
                self.name, key_value
            );
            return None;
        }

        let rid = self.rid_counter.fetch_add(1, Ordering::SeqCst) + 1;

        let mut positions = Vec::with_capacity(self.num_columns);
        for (col, &value) in values.iter().enumerate() {
            positions.push(append_to(&self.columns[col].base, value));
        }

        self.page_directory.lock().unwrap().insert(rid, positions);
        self.index.insert(self.key, key_value, rid);

        trace!("insert into {} allocated rid {}", self.name, rid);
        Some(rid)
    }

    pub fn read_column(&self, col: usize, page_idx: usize, slot_idx: usize) -> i64 {
        self.columns[col].base.read().unwrap()[page_idx].read(slot_idx)
    }

    pub fn read_tail(&self, col: usize, page_idx: usize, slot_idx: usize) -> i64 {
        self.columns[col].tail.read().unwrap()[page_idx].read(slot_idx)
    }

    fn write_base_in_place(&self, col: usize, page_idx: usize, slot_idx: usize, value: i64) {
        self.columns[col].base.read().unwrap()[page_idx].write_at(slot_idx, value);
    }

    /// Appends `old_value` to `tail[col]`, returning its location. Called
    /// by `update` before it overwrites the base slot.
    pub(crate) fn append_tail(&self, col: usize, old_value: i64) -> Location {
        append_to(&self.columns[col].tail, old_value)
    }

    pub(crate) fn write_base(&self, col: usize, page_idx: usize, slot_idx: usize, value: i64) {
        self.write_base_in_place(col, page_idx, slot_idx, value);
    }

    /// Treats an index hit as a probe: a stale entry left behind by a
    /// delete or a rolled-back insert is masked by revalidating against
    /// the page directory before trusting it.
    pub(crate) fn locate_live(&self, key: i64) -> Option<Rid> {
        let rid = self.index.locate(self.key, key)?;
        if self.page_directory.lock().unwrap().contains_key(&rid) {
            Some(rid)
        } else {
            None
        }
    }

    pub(crate) fn positions(&self, rid: Rid) -> Option<Vec<Location>> {
        self.page_directory.lock().unwrap().get(&rid).cloned()
    }

    /// Removes the page-directory entry. Base slots, tail slots, and index
    /// entries are left behind untouched.
    pub(crate) fn delete_row(&self, rid: Rid) -> bool {
        self.page_directory.lock().unwrap().remove(&rid).is_some()
    }

    /// Re-installs a page-directory entry for `rid` pointing at `positions`,
    /// used by insert-rollback's compensating delete-then-reinsert and by
    /// delete-rollback's compensating reinsert.
    pub(crate) fn restore_positions(&self, rid: Rid, positions: Vec<Location>) {
        self.page_directory.lock().unwrap().insert(rid, positions);
    }

    pub(crate) fn prepend_version(&self, rid: Rid, entry: VersionEntry) {
        self.version_chain
            .lock()
            .unwrap()
            .entry(rid)
            .or_insert_with(Vec::new)
            .insert(0, entry);
    }

    pub(crate) fn version_chain_len(&self, rid: Rid) -> usize {
        self.version_chain
            .lock()
            .unwrap()
            .get(&rid)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub(crate) fn version_entry(&self, rid: Rid, idx: usize) -> Option<VersionEntry> {
        self.version_chain
            .lock()
            .unwrap()
            .get(&rid)
            .and_then(|chain| chain.get(idx).cloned())
    }

    // --- persistence plumbing (used only by `Database`) ---

    pub(crate) fn base_pages(&self, col: usize) -> Vec<Arc<Page>> {
        self.columns[col].base.read().unwrap().clone()
    }

    pub(crate) fn tail_pages(&self, col: usize) -> Vec<Arc<Page>> {
        self.columns[col].tail.read().unwrap().clone()
    }

    pub(crate) fn set_base_pages(&self, col: usize, pages: Vec<Page>) {
        let pages = pages.into_iter().map(Arc::new).collect();
        *self.columns[col].base.write().unwrap() = pages;
    }

    pub(crate) fn set_tail_pages(&self, col: usize, pages: Vec<Page>) {
        let pages = pages.into_iter().map(Arc::new).collect();
        *self.columns[col].tail.write().unwrap() = pages;
    }

    pub(crate) fn page_directory_snapshot(&self) -> HashMap<Rid, Vec<Location>> {
        self.page_directory.lock().unwrap().clone()
    }

    pub(crate) fn set_page_directory(&self, pd: HashMap<Rid, Vec<Location>>) {
        let max_rid = pd.keys().copied().max().unwrap_or(0);
        *self.page_directory.lock().unwrap() = pd;
        self.rid_counter.store(max_rid, Ordering::SeqCst);
    }

    pub(crate) fn version_chain_snapshot(&self) -> HashMap<Rid, Vec<VersionEntry>> {
        self.version_chain.lock().unwrap().clone()
    }

    pub(crate) fn set_version_chain(&self, vc: HashMap<Rid, Vec<VersionEntry>>) {
        *self.version_chain.lock().unwrap() = vc;
    }

    /// Rebuilds the primary-key index from the page directory. Called by
    /// `Database::open` after a table's pages and page directory are
    /// loaded; secondary indexes (if any existed) are not restored.
    pub(crate) fn rebuild_key_index(&self) {
        self.index.drop_index(self.key);
        let pd = self.page_directory.lock().unwrap();
        let entries: Vec<(i64, Rid)> = pd
            .iter()
            .map(|(&rid, positions)| {
                let (page_idx, slot_idx) = positions[self.key];
                (self.read_column(self.key, page_idx, slot_idx), rid)
            })
            .collect();
        drop(pd);
        self.index.create_index(self.key, entries);
    }
}
