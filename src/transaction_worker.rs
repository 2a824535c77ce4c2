use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver};
use log::warn;

use crate::transaction::Transaction;

/// Retry ceiling per transaction.
const MAX_RETRIES: u32 = 100;

/// Sleep between retries, to de-synchronize competing workers.
const RETRY_BACKOFF: Duration = Duration::from_millis(1);

/// Ceiling `join` waits for the worker thread before giving up and
/// warning, without cancelling the thread.
const JOIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Owns a batch of [`Transaction`]s and a dedicated background thread that
/// runs each one to commitment, retrying aborted attempts.
pub struct TransactionWorker {
    transactions: Option<Vec<Transaction>>,
    stats: Arc<Mutex<Vec<bool>>>,
    result: Arc<AtomicUsize>,
    done: Option<Receiver<()>>,
}

impl TransactionWorker {
    pub fn new() -> Self {
        TransactionWorker {
            transactions: Some(Vec::new()),
            stats: Arc::new(Mutex::new(Vec::new())),
            result: Arc::new(AtomicUsize::new(0)),
            done: None,
        }
    }

    /// Appends `transaction` to this worker's batch. Panics if called
    /// after `run`, since the batch is handed to the background thread and
    /// can no longer be appended to.
    pub fn add_transaction(&mut self, transaction: Transaction) {
        self.transactions
            .as_mut()
            .expect("add_transaction called after run")
            .push(transaction);
    }

    /// Starts the background thread. Each queued transaction is run
    /// repeatedly until it commits or `MAX_RETRIES` is exhausted, with
    /// `RETRY_BACKOFF` between attempts.
    pub fn run(&mut self) {
        let mut transactions = self
            .transactions
            .take()
            .expect("run called more than once on the same worker");
        let stats = Arc::clone(&self.stats);
        let result = Arc::clone(&self.result);
        let (done_tx, done_rx) = bounded(1);
        self.done = Some(done_rx);

        thread::spawn(move || {
            let mut committed_count = 0usize;
            for transaction in transactions.iter_mut() {
                let mut committed = false;
                let mut retries = 0;
                while !committed && retries < MAX_RETRIES {
                    if transaction.run() {
                        committed = true;
                    } else {
                        retries += 1;
                        if retries < MAX_RETRIES {
                            thread::sleep(RETRY_BACKOFF);
                        }
                    }
                }
                if committed {
                    committed_count += 1;
                } else {
                    warn!(
                        "transaction {} failed after {} retries",
                        transaction.id(),
                        MAX_RETRIES
                    );
                }
                stats.lock().unwrap().push(committed);
            }
            result.store(committed_count, Ordering::SeqCst);
            let _ = done_tx.send(());
        });
    }

    /// Waits for the worker thread to finish, up to `JOIN_TIMEOUT`. Past
    /// the timeout this logs a warning and returns without cancelling the
    /// thread.
    pub fn join(&mut self) {
        if let Some(done) = self.done.take() {
            if done.recv_timeout(JOIN_TIMEOUT).is_err() {
                warn!(
                    "worker thread did not finish within {:?}",
                    JOIN_TIMEOUT
                );
            }
        }
    }

    /// One entry per transaction run so far, in queue order: `true` if it
    /// committed, `false` if it exhausted its retries.
    pub fn stats(&self) -> Vec<bool> {
        self.stats.lock().unwrap().clone()
    }

    /// Count of committed transactions.
    pub fn result(&self) -> usize {
        self.result.load(Ordering::SeqCst)
    }
}

impl Default for TransactionWorker {
    fn default() -> Self {
        TransactionWorker::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Table;
    use crate::transaction::Operation;
    use std::sync::Arc as StdArc;

    #[test]
    fn worker_commits_independent_transactions() {
        let table = StdArc::new(Table::new("worker_independent", 2, 0));
        for key in 3000..3020i64 {
            table.insert_row(&[key, 0]).unwrap();
        }

        let mut worker = TransactionWorker::new();
        for key in 3000..3020i64 {
            let mut txn = Transaction::new();
            txn.add_query(
                StdArc::clone(&table),
                Operation::Update { key, values: vec![None, Some(key * 7)] },
            );
            worker.add_transaction(txn);
        }

        worker.run();
        worker.join();

        assert_eq!(worker.result(), 20);
        assert!(worker.stats().iter().all(|&committed| committed));

        let query = crate::query::Query::new(&table);
        for key in 3000..3020i64 {
            let rows = query.select(key, 0, &[true, true]);
            assert_eq!(rows[0].columns[1], Some(key * 7));
        }
    }

    #[test]
    fn worker_retries_past_a_transient_conflict_then_commits() {
        let table = StdArc::new(Table::new("worker_retry", 2, 0));
        table.insert_row(&[1, 1]).unwrap();

        // Hold the exclusive lock briefly on another thread, release it
        // quickly, so the worker's first attempt refuses and a retry
        // succeeds.
        let lock_mgr = crate::lock_manager::global();
        let key = crate::lock_manager::lock_key("worker_retry", 1);
        assert!(lock_mgr.acquire_exclusive(999_999, &key));

        let table_for_release = StdArc::clone(&table);
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            crate::lock_manager::global().release_all(999_999);
            let _ = table_for_release.name();
        });

        let mut worker = TransactionWorker::new();
        let mut txn = Transaction::new();
        txn.add_query(
            StdArc::clone(&table),
            Operation::Update { key: 1, values: vec![None, Some(2)] },
        );
        worker.add_transaction(txn);
        worker.run();
        worker.join();
        releaser.join().unwrap();

        assert_eq!(worker.result(), 1);
    }
}
