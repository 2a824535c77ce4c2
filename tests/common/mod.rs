use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use small_db::log::init_log;

static SCRATCH_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Initializes logging once before every integration test.
pub fn setup() {
    init_log();
}

/// A fresh, never-reused scratch directory under the OS temp dir, for tests
/// that exercise `Database::open`/`close`.
pub fn scratch_dir(tag: &str) -> PathBuf {
    let n = SCRATCH_COUNTER.fetch_add(1, Ordering::SeqCst);
    std::env::temp_dir().join(format!("small-db-e2e-{}-{}-{}", std::process::id(), tag, n))
}
