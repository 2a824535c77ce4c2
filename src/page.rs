use std::sync::Mutex;

use crate::error::{Error, Result};

/// Bytes in one page: a fixed 4 KiB slab.
pub const PAGE_SIZE: usize = 4096;

/// Bytes per slot: one little-endian signed 64-bit integer.
pub const SLOT_SIZE: usize = 8;

/// Slots per page. `num_records` never exceeds this.
pub const SLOTS_PER_PAGE: usize = PAGE_SIZE / SLOT_SIZE;

struct PageInner {
    slots: [i64; SLOTS_PER_PAGE],
    num_records: usize,
}

/// A fixed 4 KiB slab of 512 little-endian signed 64-bit slots.
///
/// Writes are append-only (`write`); the update path (`write_at`) mutates a
/// slot already written, which is how `Table::update` rewrites a base slot
/// in place after copying its old value into a tail page. Every operation
/// here is a short critical section over one internal mutex.
pub struct Page {
    inner: Mutex<PageInner>,
}

impl Page {
    pub fn new() -> Self {
        Page {
            inner: Mutex::new(PageInner {
                slots: [0; SLOTS_PER_PAGE],
                num_records: 0,
            }),
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.inner.lock().unwrap().num_records < SLOTS_PER_PAGE
    }

    /// Appends `value` to the next free slot. Returns `false` iff the page
    /// is already full; the caller is then expected to allocate a new page.
    pub fn write(&self, value: i64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.num_records >= SLOTS_PER_PAGE {
            return false;
        }
        let slot = inner.num_records;
        inner.slots[slot] = value;
        inner.num_records += 1;
        true
    }

    pub fn read(&self, slot: usize) -> i64 {
        self.inner.lock().unwrap().slots[slot]
    }

    /// Overwrites an already-written slot in place. Used by `Table::update`
    /// after the old value has been copied into a tail page.
    pub fn write_at(&self, slot: usize, value: i64) {
        self.inner.lock().unwrap().slots[slot] = value;
    }

    pub fn num_records(&self) -> usize {
        self.inner.lock().unwrap().num_records
    }

    /// Serializes as `metadata.db`-style records: `i32` `num_records`
    /// followed by the raw 4096-byte slot region.
    pub fn to_bytes(&self) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        let mut out = Vec::with_capacity(4 + PAGE_SIZE);
        out.extend_from_slice(&(inner.num_records as i32).to_le_bytes());
        for slot in inner.slots.iter() {
            out.extend_from_slice(&slot.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 + PAGE_SIZE {
            return Err(Error::Corrupt(format!(
                "page record too short: {} bytes",
                bytes.len()
            )));
        }
        let num_records = i32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        if num_records > SLOTS_PER_PAGE {
            return Err(Error::Corrupt(format!(
                "page record count {} exceeds capacity {}",
                num_records, SLOTS_PER_PAGE
            )));
        }
        let mut slots = [0i64; SLOTS_PER_PAGE];
        for (i, slot) in slots.iter_mut().enumerate() {
            let start = 4 + i * SLOT_SIZE;
            *slot = i64::from_le_bytes(bytes[start..start + SLOT_SIZE].try_into().unwrap());
        }
        Ok(Page {
            inner: Mutex::new(PageInner { slots, num_records }),
        })
    }
}

impl Default for Page {
    fn default() -> Self {
        Page::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_and_read_round_trip() {
        let page = Page::new();
        assert!(page.has_capacity());
        assert!(page.write(42));
        assert_eq!(page.read(0), 42);
        assert_eq!(page.num_records(), 1);
    }

    #[test]
    fn write_fails_when_full() {
        let page = Page::new();
        for i in 0..SLOTS_PER_PAGE as i64 {
            assert!(page.write(i));
        }
        assert!(!page.has_capacity());
        assert!(!page.write(999));
        assert_eq!(page.num_records(), SLOTS_PER_PAGE);
    }

    #[test]
    fn write_at_overwrites_in_place() {
        let page = Page::new();
        page.write(7);
        page.write_at(0, 99);
        assert_eq!(page.read(0), 99);
        assert_eq!(page.num_records(), 1);
    }

    #[test]
    fn serialization_round_trips() {
        let page = Page::new();
        page.write(-5);
        page.write(i64::MAX);
        page.write(0);

        let bytes = page.to_bytes();
        assert_eq!(bytes.len(), 4 + PAGE_SIZE);

        let restored = Page::from_bytes(&bytes).unwrap();
        assert_eq!(restored.num_records(), 3);
        assert_eq!(restored.read(0), -5);
        assert_eq!(restored.read(1), i64::MAX);
        assert_eq!(restored.read(2), 0);
    }

    #[test]
    fn from_bytes_rejects_truncated_input() {
        let err = Page::from_bytes(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));
    }
}
