use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};

use crate::lock_manager::{self, LockManager};
use crate::query::Query;
use crate::table::Table;

/// A ceiling on how many integer keys a `sum`/`sum_version` range lock may
/// enumerate before the transaction aborts outright, rather than locking
/// without bound.
pub const MAX_RANGE_LOCK_SPAN: i64 = 10_000;

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// One queued unit of work: a tagged operation, carrying exactly the
/// arguments `Query`'s matching method needs.
#[derive(Debug, Clone)]
pub enum Operation {
    Insert { values: Vec<i64> },
    Select { key: i64, projection: Vec<bool> },
    SelectVersion { key: i64, projection: Vec<bool>, relative_version: i64 },
    Update { key: i64, values: Vec<Option<i64>> },
    Delete { key: i64 },
    Sum { lo: i64, hi: i64, agg_col: usize },
    SumVersion { lo: i64, hi: i64, agg_col: usize, relative_version: i64 },
    Increment { key: i64, col: usize },
}

struct QueuedOp {
    table: Arc<Table>,
    op: Operation,
}

/// Rollback metadata for one already-executed operation.
enum Undo {
    Insert { key: i64 },
    Update { key: i64, old_values: Vec<i64> },
    Delete { values: Vec<i64> },
}

struct ExecutedOp {
    table: Arc<Table>,
    undo: Undo,
}

fn lock_key(table: &Table, key: i64) -> String {
    lock_manager::lock_key(table.name(), key)
}

/// An ordered list of `(operation, table, args)` triples executed as one
/// strictly two-phase-locked unit. `run` attempts the whole list
/// once: on any lock refusal or operation failure it rolls back what it
/// had executed so far and returns `false`; a caller (typically
/// [`crate::transaction_worker::TransactionWorker`]) is expected to retry
/// by calling `run` again.
pub struct Transaction {
    id: u64,
    ops: Vec<QueuedOp>,
    executed: Vec<ExecutedOp>,
}

impl Transaction {
    pub fn new() -> Self {
        Transaction {
            id: NEXT_TRANSACTION_ID.fetch_add(1, Ordering::SeqCst),
            ops: Vec::new(),
            executed: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queues one operation against `table`. Queued order is the order
    /// operations execute in within `run`.
    pub fn add_query(&mut self, table: Arc<Table>, op: Operation) {
        self.ops.push(QueuedOp { table, op });
    }

    /// Executes every queued operation in order, acquiring locks keyed by
    /// table and primary key before each one. Returns `true` iff every
    /// operation succeeded and the transaction committed; on `false` every
    /// effect of this attempt has been rolled back and all locks held by
    /// this transaction have been released.
    pub fn run(&mut self) -> bool {
        self.executed.clear();
        let lock_mgr = lock_manager::global();

        for index in 0..self.ops.len() {
            let table = Arc::clone(&self.ops[index].table);
            let op = self.ops[index].op.clone();
            let key_col = table.key_col();

            let outcome = match op {
                Operation::Select { key, projection } => {
                    self.run_read(lock_mgr, &table, key, |query| {
                        query.select(key, key_col, &projection);
                        true
                    })
                }
                Operation::SelectVersion { key, projection, relative_version } => {
                    self.run_read(lock_mgr, &table, key, |query| {
                        query.select_version(key, key_col, &projection, relative_version);
                        true
                    })
                }
                Operation::Insert { values } => self.run_insert(lock_mgr, &table, values),
                Operation::Update { key, values } => self.run_update(lock_mgr, &table, key, values),
                Operation::Delete { key } => self.run_delete(lock_mgr, &table, key),
                Operation::Increment { key, col } => self.run_increment(lock_mgr, &table, key, col),
                Operation::Sum { lo, hi, agg_col } => {
                    self.run_sum(lock_mgr, &table, lo, hi, |query| query.sum(lo, hi, agg_col))
                }
                Operation::SumVersion { lo, hi, agg_col, relative_version } => {
                    self.run_sum(lock_mgr, &table, lo, hi, |query| {
                        query.sum_version(lo, hi, agg_col, relative_version)
                    })
                }
            };

            if !outcome {
                debug!("transaction {} aborting", self.id);
                self.rollback_and_release(lock_mgr);
                return false;
            }
        }

        self.executed.clear();
        lock_mgr.release_all(self.id);
        true
    }

    fn run_read(
        &self,
        lock_mgr: &LockManager,
        table: &Arc<Table>,
        key: i64,
        op: impl FnOnce(&Query) -> bool,
    ) -> bool {
        if !lock_mgr.acquire_shared(self.id, &lock_key(table, key)) {
            return false;
        }
        op(&Query::new(table))
    }

    fn run_sum(
        &self,
        lock_mgr: &LockManager,
        table: &Arc<Table>,
        lo: i64,
        hi: i64,
        op: impl FnOnce(&Query) -> Option<i64>,
    ) -> bool {
        if !self.acquire_range_locks(lock_mgr, table, lo, hi) {
            return false;
        }
        op(&Query::new(table)).is_some()
    }

    fn run_insert(&mut self, lock_mgr: &LockManager, table: &Arc<Table>, values: Vec<i64>) -> bool {
        let key = values[table.key_col()];
        if !lock_mgr.acquire_exclusive(self.id, &lock_key(table, key)) {
            return false;
        }
        if !Query::new(table).insert(&values) {
            return false;
        }
        self.executed.push(ExecutedOp {
            table: Arc::clone(table),
            undo: Undo::Insert { key },
        });
        true
    }

    fn run_update(
        &mut self,
        lock_mgr: &LockManager,
        table: &Arc<Table>,
        key: i64,
        values: Vec<Option<i64>>,
    ) -> bool {
        if !lock_mgr.acquire_exclusive(self.id, &lock_key(table, key)) {
            return false;
        }
        let query = Query::new(table);
        let old_values = match Self::snapshot(&query, table, key) {
            Some(v) => v,
            None => return false,
        };
        if !query.update(key, &values) {
            return false;
        }
        self.executed.push(ExecutedOp {
            table: Arc::clone(table),
            undo: Undo::Update { key, old_values },
        });
        true
    }

    fn run_delete(&mut self, lock_mgr: &LockManager, table: &Arc<Table>, key: i64) -> bool {
        if !lock_mgr.acquire_exclusive(self.id, &lock_key(table, key)) {
            return false;
        }
        let query = Query::new(table);
        let old_values = match Self::snapshot(&query, table, key) {
            Some(v) => v,
            None => return false,
        };
        if !query.delete(key) {
            return false;
        }
        self.executed.push(ExecutedOp {
            table: Arc::clone(table),
            undo: Undo::Delete { values: old_values },
        });
        true
    }

    fn run_increment(&mut self, lock_mgr: &LockManager, table: &Arc<Table>, key: i64, col: usize) -> bool {
        if !lock_mgr.acquire_exclusive(self.id, &lock_key(table, key)) {
            return false;
        }
        let query = Query::new(table);
        let old_values = match Self::snapshot(&query, table, key) {
            Some(v) => v,
            None => return false,
        };
        if !query.increment(key, col) {
            return false;
        }
        self.executed.push(ExecutedOp {
            table: Arc::clone(table),
            undo: Undo::Update { key, old_values },
        });
        true
    }

    /// Reads every column of `key`'s current version, for use as rollback
    /// material.
    fn snapshot(query: &Query, table: &Table, key: i64) -> Option<Vec<i64>> {
        let mask = vec![true; table.num_columns()];
        let rows = query.select(key, table.key_col(), &mask);
        rows.first().map(|record| {
            record
                .columns
                .iter()
                .map(|v| v.expect("fully-projected select returns every column"))
                .collect()
        })
    }

    fn acquire_range_locks(&self, lock_mgr: &LockManager, table: &Arc<Table>, lo: i64, hi: i64) -> bool {
        if hi < lo {
            return true;
        }
        if hi - lo + 1 > MAX_RANGE_LOCK_SPAN {
            warn!(
                "transaction {} refused to range-lock {}..={} on {} ({} keys exceeds ceiling of {})",
                self.id,
                lo,
                hi,
                table.name(),
                hi - lo + 1,
                MAX_RANGE_LOCK_SPAN
            );
            return false;
        }
        for key in lo..=hi {
            if !lock_mgr.acquire_shared(self.id, &lock_key(table, key)) {
                return false;
            }
        }
        true
    }

    /// Walks `executed` in reverse, compensating each operation, then
    /// releases every lock this transaction holds. Compensation re-enters
    /// the query layer (an insert's rollback is a fresh `delete`, a
    /// delete's rollback a fresh `insert`), so aborting visibly grows
    /// affected version chains rather than performing true undo-logging.
    fn rollback_and_release(&mut self, lock_mgr: &LockManager) {
        for executed in self.executed.drain(..).rev() {
            let query = Query::new(&executed.table);
            match executed.undo {
                Undo::Insert { key } => {
                    let _ = query.delete(key);
                }
                Undo::Update { key, old_values } => {
                    let values: Vec<Option<i64>> = old_values.into_iter().map(Some).collect();
                    let _ = query.update(key, &values);
                }
                Undo::Delete { values } => {
                    let _ = query.insert(&values);
                }
            }
        }
        lock_mgr.release_all(self.id);
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Transaction::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_mask(table: &Table) -> Vec<bool> {
        vec![true; table.num_columns()]
    }

    #[test]
    fn basic_commit_updates_are_visible() {
        let table = Arc::new(Table::new("basic_commit", 2, 0));
        for key in 1000..1005i64 {
            table.insert_row(&[key, 0]).unwrap();
        }

        let mut txn = Transaction::new();
        txn.add_query(
            Arc::clone(&table),
            Operation::Update { key: 1000, values: vec![None, Some(99)] },
        );
        assert!(txn.run());

        let rows = Query::new(&table).select(1000, 0, &full_mask(&table));
        assert_eq!(rows[0].columns[1], Some(99));
    }

    #[test]
    fn conflicting_exclusive_locks_cause_abort_not_deadlock() {
        let table = Arc::new(Table::new("conflict_abort", 2, 0));
        table.insert_row(&[1, 1]).unwrap();

        let mut t1 = Transaction::new();
        t1.add_query(
            Arc::clone(&table),
            Operation::Update { key: 1, values: vec![None, Some(2)] },
        );
        assert!(t1.run());

        // t1 has already committed and released its locks by the time t2 runs.
        let mut t2 = Transaction::new();
        t2.add_query(
            Arc::clone(&table),
            Operation::Update { key: 1, values: vec![None, Some(3)] },
        );
        assert!(t2.run());

        let rows = Query::new(&table).select(1, 0, &full_mask(&table));
        assert_eq!(rows[0].columns[1], Some(3));
    }

    #[test]
    fn aborted_insert_is_fully_rolled_back() {
        let table = Arc::new(Table::new("insert_rollback", 2, 0));

        let mut txn = Transaction::new();
        txn.add_query(Arc::clone(&table), Operation::Insert { values: vec![1, 1] });
        // the second insert of the same key fails, forcing abort of the whole txn
        txn.add_query(Arc::clone(&table), Operation::Insert { values: vec![1, 2] });
        assert!(!txn.run());

        assert!(Query::new(&table).select(1, 0, &full_mask(&table)).is_empty());
    }

    #[test]
    fn lock_upgrade_within_one_transaction_succeeds() {
        let table = Arc::new(Table::new("lock_upgrade", 2, 0));
        table.insert_row(&[1, 10]).unwrap();

        let mut txn = Transaction::new();
        txn.add_query(
            Arc::clone(&table),
            Operation::Select { key: 1, projection: full_mask(&table) },
        );
        txn.add_query(
            Arc::clone(&table),
            Operation::Update { key: 1, values: vec![None, Some(20)] },
        );
        assert!(txn.run());

        let rows = Query::new(&table).select(1, 0, &full_mask(&table));
        assert_eq!(rows[0].columns[1], Some(20));
    }

    #[test]
    fn oversized_range_lock_aborts_before_locking_anything() {
        let table = Arc::new(Table::new("range_ceiling", 2, 0));
        table.insert_row(&[1, 1]).unwrap();

        let mut txn = Transaction::new();
        txn.add_query(
            Arc::clone(&table),
            Operation::Sum { lo: 0, hi: MAX_RANGE_LOCK_SPAN + 1, agg_col: 1 },
        );
        assert!(!txn.run());

        // the key is still free to be locked by someone else afterwards.
        let mgr = lock_manager::global();
        assert!(mgr.acquire_exclusive(9999, &lock_key(&table, 1)));
        mgr.release_all(9999);
    }

    #[test]
    fn multi_op_commit_is_all_or_nothing() {
        let table = Arc::new(Table::new("multi_op_commit", 2, 0));
        for key in 1001..1004i64 {
            table.insert_row(&[key, 0]).unwrap();
        }

        let mut txn = Transaction::new();
        for (key, new_value) in [(1001, 111), (1002, 222), (1003, 333)] {
            txn.add_query(
                Arc::clone(&table),
                Operation::Update { key, values: vec![None, Some(new_value)] },
            );
        }
        assert!(txn.run());

        for (key, expected) in [(1001, 111), (1002, 222), (1003, 333)] {
            let rows = Query::new(&table).select(key, 0, &full_mask(&table));
            assert_eq!(rows[0].columns[1], Some(expected));
        }
    }
}
