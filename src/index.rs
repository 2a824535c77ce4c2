use std::sync::Mutex;

use itertools::Itertools;

use crate::Rid;

/// Default B+-tree fanout: 3 entries per node before a split.
const DEFAULT_ORDER: usize = 4;

enum Node {
    Internal { keys: Vec<i64>, children: Vec<usize> },
    Leaf { entries: Vec<(i64, Rid)>, next: Option<usize> },
}

/// A B+-tree mapping column value to RID, with duplicate values permitted.
///
/// Nodes live in an arena (`Vec<Node>`) addressed by `usize`, rather than
/// `Rc<RefCell<_>>` or raw pointers. This keeps the leaf linked-list
/// (needed for `locate_range`) representable without reference counting or
/// unsafe code.
struct BPlusTree {
    arena: Vec<Node>,
    root: usize,
    order: usize,
}

impl BPlusTree {
    fn new(order: usize) -> Self {
        BPlusTree {
            arena: vec![Node::Leaf {
                entries: Vec::new(),
                next: None,
            }],
            root: 0,
            order,
        }
    }

    fn key_count(&self, idx: usize) -> usize {
        match &self.arena[idx] {
            Node::Leaf { entries, .. } => entries.len(),
            Node::Internal { keys, .. } => keys.len(),
        }
    }

    fn insert(&mut self, key: i64, rid: Rid) {
        if self.key_count(self.root) == self.order - 1 {
            let old_root = self.root;
            let new_root = self.arena.len();
            self.arena.push(Node::Internal {
                keys: Vec::new(),
                children: vec![old_root],
            });
            self.root = new_root;
            self.split_child(new_root, 0);
        }
        self.insert_non_full(self.root, key, rid);
    }

    /// Splits the full child at `children[index]` of `parent`, promoting
    /// the median key into `parent`.
    fn split_child(&mut self, parent: usize, index: usize) {
        let child_idx = match &self.arena[parent] {
            Node::Internal { children, .. } => children[index],
            Node::Leaf { .. } => unreachable!("split_child called on a leaf parent"),
        };

        let mid = self.order / 2;
        let (split_key, new_node, child_is_leaf) = match &mut self.arena[child_idx] {
            Node::Leaf { entries, next } => {
                let split_key = entries[mid].0;
                let right_entries = entries.split_off(mid);
                let right_next = *next;
                (
                    split_key,
                    Node::Leaf {
                        entries: right_entries,
                        next: right_next,
                    },
                    true,
                )
            }
            Node::Internal { keys, children } => {
                let split_key = keys[mid];
                let right_keys = keys.split_off(mid + 1);
                keys.truncate(mid);
                let right_children = children.split_off(mid + 1);
                (
                    split_key,
                    Node::Internal {
                        keys: right_keys,
                        children: right_children,
                    },
                    false,
                )
            }
        };

        let new_idx = self.arena.len();
        self.arena.push(new_node);

        if child_is_leaf {
            if let Node::Leaf { next, .. } = &mut self.arena[child_idx] {
                *next = Some(new_idx);
            }
        }

        if let Node::Internal { keys, children } = &mut self.arena[parent] {
            keys.insert(index, split_key);
            children.insert(index + 1, new_idx);
        }
    }

    fn insert_non_full(&mut self, idx: usize, key: i64, rid: Rid) {
        if let Node::Leaf { entries, .. } = &mut self.arena[idx] {
            let pos = entries
                .iter()
                .position(|(k, _)| *k >= key)
                .unwrap_or(entries.len());
            entries.insert(pos, (key, rid));
            return;
        }

        let mut i = 0;
        if let Node::Internal { keys, .. } = &self.arena[idx] {
            while i < keys.len() && key > keys[i] {
                i += 1;
            }
        }

        let child = match &self.arena[idx] {
            Node::Internal { children, .. } => children[i],
            Node::Leaf { .. } => unreachable!(),
        };

        if self.key_count(child) == self.order - 1 {
            self.split_child(idx, i);
            if let Node::Internal { keys, .. } = &self.arena[idx] {
                if key > keys[i] {
                    i += 1;
                }
            }
        }

        let child = match &self.arena[idx] {
            Node::Internal { children, .. } => children[i],
            Node::Leaf { .. } => unreachable!(),
        };
        self.insert_non_full(child, key, rid);
    }

    fn locate(&self, key: i64) -> Vec<Rid> {
        let mut idx = self.root;
        loop {
            match &self.arena[idx] {
                Node::Leaf { entries, .. } => {
                    return entries
                        .iter()
                        .filter(|(k, _)| *k == key)
                        .map(|(_, rid)| *rid)
                        .collect();
                }
                Node::Internal { keys, children } => {
                    let mut i = 0;
                    while i < keys.len() && key >= keys[i] {
                        i += 1;
                    }
                    idx = children[i];
                }
            }
        }
    }

    fn locate_range(&self, lo: i64, hi: i64) -> Vec<Rid> {
        let mut idx = self.root;
        loop {
            match &self.arena[idx] {
                Node::Leaf { .. } => break,
                Node::Internal { keys, children } => {
                    let mut i = 0;
                    while i < keys.len() && lo > keys[i] {
                        i += 1;
                    }
                    idx = children[i];
                }
            }
        }

        let mut results = Vec::new();
        let mut cur = Some(idx);
        while let Some(node_idx) = cur {
            let next = match &self.arena[node_idx] {
                Node::Leaf { entries, next } => {
                    for (k, rid) in entries {
                        if *k > hi {
                            return results;
                        }
                        if *k >= lo {
                            results.push(*rid);
                        }
                    }
                    *next
                }
                Node::Internal { .. } => unreachable!("leaf chain ran into an internal node"),
            };
            cur = next;
        }
        results
    }
}

/// Per-table collection of per-column secondary indexes.
///
/// All operations lock one mutex for the duration of the call; since every
/// method here takes the lock once and never calls back into another
/// `Index` method while holding it, a plain `std::sync::Mutex` suffices.
pub struct Index {
    trees: Mutex<Vec<Option<BPlusTree>>>,
    order: usize,
}

impl Index {
    pub fn new(num_columns: usize) -> Self {
        Index {
            trees: Mutex::new((0..num_columns).map(|_| None).collect()),
            order: DEFAULT_ORDER,
        }
    }

    /// Builds an index on `column` by scanning `entries` (typically the
    /// table's page directory). A no-op if the column is already indexed.
    ///
    /// `entries` is sorted by value first, so a reload walks the tree's
    /// insertion path in ascending order rather than the arbitrary order a
    /// page-directory `HashMap` iterates in, giving fewer lopsided splits
    /// than inserting in hash order.
    pub fn create_index<I: IntoIterator<Item = (i64, Rid)>>(&self, column: usize, entries: I) {
        let mut trees = self.trees.lock().unwrap();
        if trees[column].is_some() {
            return;
        }
        let mut tree = BPlusTree::new(self.order);
        for (value, rid) in entries.into_iter().sorted_by_key(|&(value, _)| value) {
            tree.insert(value, rid);
        }
        trees[column] = Some(tree);
    }

    /// One RID whose `column` value equals `value`, or `None`. If the
    /// column is indexed and holds duplicates, an arbitrary matching RID
    /// among them is returned. Callers validate against the page directory
    /// before trusting the result, since stale entries are never scrubbed.
    pub fn locate(&self, column: usize, value: i64) -> Option<Rid> {
        let trees = self.trees.lock().unwrap();
        trees[column].as_ref()?.locate(value).into_iter().next()
    }

    pub fn locate_range(&self, column: usize, lo: i64, hi: i64) -> Vec<Rid> {
        let trees = self.trees.lock().unwrap();
        match trees[column].as_ref() {
            Some(tree) => tree.locate_range(lo, hi),
            None => Vec::new(),
        }
    }

    pub fn insert(&self, column: usize, value: i64, rid: Rid) {
        let mut trees = self.trees.lock().unwrap();
        if let Some(tree) = trees[column].as_mut() {
            tree.insert(value, rid);
        }
    }

    pub fn drop_index(&self, column: usize) {
        let mut trees = self.trees.lock().unwrap();
        trees[column] = None;
    }

    pub fn is_indexed(&self, column: usize) -> bool {
        self.trees.lock().unwrap()[column].is_some()
    }
}
