use crate::table::{Location, Record, Table, VersionEntry};
use crate::Rid;

fn project_base(table: &Table, positions: &[Location], mask: &[bool]) -> Vec<Option<i64>> {
    positions
        .iter()
        .enumerate()
        .map(|(col, &(page_idx, slot_idx))| {
            if mask[col] {
                Some(table.read_column(col, page_idx, slot_idx))
            } else {
                None
            }
        })
        .collect()
}

/// Resolves `relative_version` against a chain of length `chain_len`:
/// `k = -relative_version - 1`; if the chain is shorter than `k+1`, clamp
/// to the oldest available entry. Returns `None` when there is no history
/// at all, meaning "read straight from base".
fn resolve_version_index(relative_version: i64, chain_len: usize) -> Option<usize> {
    if relative_version >= 0 || chain_len == 0 {
        return None;
    }
    let k = (-relative_version - 1) as usize;
    Some(k.min(chain_len - 1))
}

fn project_versioned(
    table: &Table,
    positions: &[Location],
    mask: &[bool],
    entry: Option<&VersionEntry>,
) -> Vec<Option<i64>> {
    positions
        .iter()
        .enumerate()
        .map(|(col, &(page_idx, slot_idx))| {
            if !mask[col] {
                return None;
            }
            let value = match entry.and_then(|e| e[col]) {
                Some((tail_page, tail_slot)) => table.read_tail(col, tail_page, tail_slot),
                None => table.read_column(col, page_idx, slot_idx),
            };
            Some(value)
        })
        .collect()
}

/// Stateless operations over a bound `Table`.
///
/// Every method here reports failure as `false`, an empty list, or `None`,
/// never a panic or an `Err`, so that `Transaction::run` can treat any
/// operation outcome uniformly as "succeeded" or "abort".
pub struct Query<'a> {
    table: &'a Table,
}

impl<'a> Query<'a> {
    pub fn new(table: &'a Table) -> Self {
        Query { table }
    }

    pub fn table(&self) -> &'a Table {
        self.table
    }

    /// Inserts a new row. `values[key_col]` is the primary key.
    pub fn insert(&self, values: &[i64]) -> bool {
        self.table.insert_row(values).is_some()
    }

    /// Locates a record by `search_value` on `search_col` and returns a
    /// zero-or-one-element list of `Record`s projected by `mask`. Only
    /// columns with an index built (ordinarily just the primary key) can
    /// ever be found; this engine does not scan unindexed columns.
    pub fn select(&self, search_value: i64, search_col: usize, mask: &[bool]) -> Vec<Record> {
        let rid = match self.table.index().locate(search_col, search_value) {
            Some(rid) => rid,
            None => return Vec::new(),
        };
        let positions = match self.table.positions(rid) {
            Some(p) => p,
            None => return Vec::new(),
        };
        let columns = project_base(self.table, &positions, mask);
        vec![Record::new(rid, search_value, columns)]
    }

    /// As `select`, but reads column values as of `relative_version`
    /// (0 = current, negative = `-k`-th prior committed update).
    pub fn select_version(
        &self,
        search_value: i64,
        search_col: usize,
        mask: &[bool],
        relative_version: i64,
    ) -> Vec<Record> {
        let rid = match self.table.index().locate(search_col, search_value) {
            Some(rid) => rid,
            None => return Vec::new(),
        };
        let positions = match self.table.positions(rid) {
            Some(p) => p,
            None => return Vec::new(),
        };

        let chain_len = self.table.version_chain_len(rid);
        let columns = match resolve_version_index(relative_version, chain_len) {
            None => project_base(self.table, &positions, mask),
            Some(idx) => {
                let entry = self.table.version_entry(rid, idx);
                project_versioned(self.table, &positions, mask, entry.as_ref())
            }
        };
        vec![Record::new(rid, search_value, columns)]
    }

    /// `values[c]` is `Some(new_value)` to rewrite column `c`, `None` to
    /// leave it unchanged. Rewriting the key column to a different value
    /// is always rejected, rather than attempting to support rollback of a
    /// primary-key-changing update.
    pub fn update(&self, key: i64, values: &[Option<i64>]) -> bool {
        let table = self.table;
        if values.len() != table.num_columns() {
            return false;
        }

        let rid = match table.locate_live(key) {
            Some(rid) => rid,
            None => return false,
        };
        let positions = match table.positions(rid) {
            Some(p) => p,
            None => return false,
        };

        if let Some(new_key) = values[table.key_col()] {
            if new_key != key {
                return false;
            }
        }

        let mut tail_locations: VersionEntry = vec![None; table.num_columns()];
        for (col, new_value) in values.iter().enumerate() {
            if let Some(new_value) = new_value {
                let (page_idx, slot_idx) = positions[col];
                let old_value = table.read_column(col, page_idx, slot_idx);
                tail_locations[col] = Some(table.append_tail(col, old_value));
                table.write_base(col, page_idx, slot_idx, *new_value);
            }
        }

        table.prepend_version(rid, tail_locations);
        true
    }

    /// Removes the page-directory entry for `key`'s row only.
    pub fn delete(&self, key: i64) -> bool {
        match self.table.locate_live(key) {
            Some(rid) => self.table.delete_row(rid),
            None => false,
        }
    }

    /// Sums `agg_col` over every live record with a key in `[lo, hi]`.
    /// `None` on an empty range.
    pub fn sum(&self, lo: i64, hi: i64, agg_col: usize) -> Option<i64> {
        self.sum_rids(self.table.index().locate_range(self.table.key_col(), lo, hi), agg_col)
    }

    fn sum_rids(&self, rids: Vec<Rid>, agg_col: usize) -> Option<i64> {
        let mut total = 0i64;
        let mut found = false;
        for rid in rids {
            if let Some(positions) = self.table.positions(rid) {
                let (page_idx, slot_idx) = positions[agg_col];
                total += self.table.read_column(agg_col, page_idx, slot_idx);
                found = true;
            }
        }
        if found {
            Some(total)
        } else {
            None
        }
    }

    /// As `sum`, reading `agg_col` as of `relative_version` for each
    /// record, with the same clamping rule as `select_version`.
    pub fn sum_version(
        &self,
        lo: i64,
        hi: i64,
        agg_col: usize,
        relative_version: i64,
    ) -> Option<i64> {
        let rids = self.table.index().locate_range(self.table.key_col(), lo, hi);
        let mut total = 0i64;
        let mut found = false;
        for rid in rids {
            let positions = match self.table.positions(rid) {
                Some(p) => p,
                None => continue,
            };
            let (base_page, base_slot) = positions[agg_col];
            let chain_len = self.table.version_chain_len(rid);
            let value = match resolve_version_index(relative_version, chain_len) {
                None => self.table.read_column(agg_col, base_page, base_slot),
                Some(idx) => {
                    let entry = self.table.version_entry(rid, idx);
                    match entry.and_then(|e| e[agg_col]) {
                        Some((tail_page, tail_slot)) => {
                            self.table.read_tail(agg_col, tail_page, tail_slot)
                        }
                        None => self.table.read_column(agg_col, base_page, base_slot),
                    }
                }
            };
            total += value;
            found = true;
        }
        if found {
            Some(total)
        } else {
            None
        }
    }

    /// Reads `col`, adds one, writes it back.
    pub fn increment(&self, key: i64, col: usize) -> bool {
        let mut mask = vec![false; self.table.num_columns()];
        mask[col] = true;
        let current = match self.select(key, self.table.key_col(), &mask).first() {
            Some(record) => match record.columns[col] {
                Some(v) => v,
                None => return false,
            },
            None => return false,
        };

        let mut values = vec![None; self.table.num_columns()];
        values[col] = Some(current + 1);
        self.update(key, &values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_select_round_trips() {
        let table = Table::new("t", 3, 0);
        let query = Query::new(&table);
        assert!(query.insert(&[1000, 5, 6]));

        let rows = query.select(1000, 0, &[true, true, true]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].columns, vec![Some(1000), Some(5), Some(6)]);
    }

    #[test]
    fn select_honors_projection_mask() {
        let table = Table::new("t", 3, 0);
        let query = Query::new(&table);
        query.insert(&[1, 2, 3]);
        let rows = query.select(1, 0, &[true, false, true]);
        assert_eq!(rows[0].columns, vec![Some(1), None, Some(3)]);
    }

    #[test]
    fn update_merges_and_select_version_reads_old_value() {
        let table = Table::new("t", 2, 0);
        let query = Query::new(&table);
        query.insert(&[1, 1000]);
        assert!(query.update(1, &[None, Some(9999)]));

        let now = query.select(1, 0, &[true, true]);
        assert_eq!(now[0].columns[1], Some(9999));

        let prior = query.select_version(1, 0, &[true, true], -1);
        assert_eq!(prior[0].columns[1], Some(1000));
    }

    #[test]
    fn select_version_clamps_to_oldest() {
        let table = Table::new("t", 2, 0);
        let query = Query::new(&table);
        query.insert(&[1, 100]);
        query.update(1, &[None, Some(200)]);
        query.update(1, &[None, Some(300)]);

        // only one prior version exists (100); -5 clamps to it.
        let clamped = query.select_version(1, 0, &[true, true], -5);
        assert_eq!(clamped[0].columns[1], Some(100));
    }

    #[test]
    fn update_rejects_primary_key_change() {
        let table = Table::new("t", 2, 0);
        let query = Query::new(&table);
        query.insert(&[1, 1]);
        assert!(!query.update(1, &[Some(2), None]));
    }

    #[test]
    fn insert_delete_select_empty() {
        let table = Table::new("t", 1, 0);
        let query = Query::new(&table);
        query.insert(&[7]);
        assert!(query.delete(7));
        assert!(query.select(7, 0, &[true]).is_empty());
        assert!(!query.delete(7));
    }

    #[test]
    fn sum_over_range() {
        let table = Table::new("t", 2, 0);
        let query = Query::new(&table);
        for k in 0..10i64 {
            query.insert(&[k, k * 10]);
        }
        assert_eq!(query.sum(2, 5, 1), Some((2 + 3 + 4 + 5) * 10));
        assert_eq!(query.sum(1000, 2000, 1), None);
    }

    #[test]
    fn increment_adds_one() {
        let table = Table::new("t", 2, 0);
        let query = Query::new(&table);
        query.insert(&[1, 41]);
        assert!(query.increment(1, 1));
        assert_eq!(query.select(1, 0, &[false, true])[0].columns[1], Some(42));
    }
}
