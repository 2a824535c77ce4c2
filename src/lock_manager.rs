use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;

/// A transaction identifier, assigned by [`crate::transaction::Transaction`].
pub type TransactionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockMode {
    Shared,
    Exclusive,
}

struct Lock {
    shared_holders: std::collections::HashSet<TransactionId>,
    exclusive_holder: Option<TransactionId>,
}

impl Lock {
    fn new() -> Self {
        Lock {
            shared_holders: std::collections::HashSet::new(),
            exclusive_holder: None,
        }
    }

    fn can_grant_shared(&self, tid: TransactionId) -> bool {
        self.exclusive_holder.is_none() || self.exclusive_holder == Some(tid)
    }

    fn can_grant_exclusive(&self, tid: TransactionId) -> bool {
        if self.exclusive_holder == Some(tid) {
            return true;
        }
        if self.exclusive_holder.is_some() {
            return false;
        }
        match self.shared_holders.len() {
            0 => true,
            1 => self.shared_holders.contains(&tid),
            _ => false,
        }
    }

    fn acquire_shared(&mut self, tid: TransactionId) -> bool {
        if self.can_grant_shared(tid) {
            self.shared_holders.insert(tid);
            true
        } else {
            false
        }
    }

    fn acquire_exclusive(&mut self, tid: TransactionId) -> bool {
        if self.can_grant_exclusive(tid) {
            self.shared_holders.remove(&tid);
            self.exclusive_holder = Some(tid);
            true
        } else {
            false
        }
    }

    fn release(&mut self, tid: TransactionId) {
        self.shared_holders.remove(&tid);
        if self.exclusive_holder == Some(tid) {
            self.exclusive_holder = None;
        }
    }
}

/// Strict two-phase locking with a no-wait policy over string-keyed locks.
/// Keying locks by `"{table}:{primary_key}"` rather than by RID lets a
/// transaction pre-lock an about-to-be-inserted key before any RID exists
/// for it.
///
/// Every method here takes its internal lock once per call and never calls
/// back into another `LockManager` method while holding it, so a plain
/// `std::sync::Mutex` is enough.
pub struct LockManager {
    locks: Mutex<HashMap<String, Lock>>,
    transaction_locks: Mutex<HashMap<TransactionId, Vec<(String, LockMode)>>>,
}

impl LockManager {
    pub fn new() -> Self {
        LockManager {
            locks: Mutex::new(HashMap::new()),
            transaction_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Attempts to acquire a shared lock on `key` for `tid`. `false` means
    /// the caller must abort immediately: this manager never blocks.
    pub fn acquire_shared(&self, tid: TransactionId, key: &str) -> bool {
        let granted = {
            let mut locks = self.locks.lock().unwrap();
            locks
                .entry(key.to_string())
                .or_insert_with(Lock::new)
                .acquire_shared(tid)
        };
        if granted {
            self.transaction_locks
                .lock()
                .unwrap()
                .entry(tid)
                .or_insert_with(Vec::new)
                .push((key.to_string(), LockMode::Shared));
        }
        granted
    }

    /// Attempts to acquire an exclusive lock on `key` for `tid`, promoting
    /// in place if `tid` is the sole shared holder. `false` means the
    /// caller must abort immediately.
    pub fn acquire_exclusive(&self, tid: TransactionId, key: &str) -> bool {
        let granted = {
            let mut locks = self.locks.lock().unwrap();
            locks
                .entry(key.to_string())
                .or_insert_with(Lock::new)
                .acquire_exclusive(tid)
        };
        if granted {
            let mut tx_locks = self.transaction_locks.lock().unwrap();
            let entry = tx_locks.entry(tid).or_insert_with(Vec::new);
            entry.retain(|(held_key, _)| held_key != key);
            entry.push((key.to_string(), LockMode::Exclusive));
        }
        granted
    }

    /// Releases every lock `tid` holds. Called exactly once, on commit or
    /// abort.
    pub fn release_all(&self, tid: TransactionId) {
        let held = self.transaction_locks.lock().unwrap().remove(&tid);
        let held = match held {
            Some(held) => held,
            None => return,
        };
        let mut locks = self.locks.lock().unwrap();
        for (key, _mode) in held {
            if let Some(lock) = locks.get_mut(&key) {
                lock.release(tid);
            }
        }
    }
}

impl Default for LockManager {
    fn default() -> Self {
        LockManager::new()
    }
}

static GLOBAL: Lazy<LockManager> = Lazy::new(LockManager::new);

/// The process-wide lock manager shared by every `Database`/`Table` in this
/// process. A single global, rather than one per `Database`, since record
/// locks must be visible to every transaction regardless of which table
/// handle touched them first.
pub fn global() -> &'static LockManager {
    &GLOBAL
}

/// Builds the `"{table}:{primary_key}"` lock key.
pub fn lock_key(table_name: &str, primary_key: i64) -> String {
    format!("{}:{}", table_name, primary_key)
}
