/// Bounded LRU cache with absolute per-entry expiry
///
/// Entries live in a slab-backed doubly linked list ordered from least to
/// most recently used, indexed by a hash map, so both lookup and eviction of
/// the oldest entry are O(1). Expired entries are only dropped when their key
/// is read; there is no background sweep.
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct Node<T> {
    key: String,
    value: T,
    expires_at: Instant,
    prev: Option<usize>,
    next: Option<usize>,
}

pub struct LruCache<T> {
    max_size: usize,
    ttl: Duration,
    map: HashMap<String, usize>,
    nodes: Vec<Option<Node<T>>>,
    free: Vec<usize>,
    /// Least recently used
    head: Option<usize>,
    /// Most recently used
    tail: Option<usize>,
}

impl<T: Clone> LruCache<T> {
    /// `max_size` is clamped to at least one entry
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        let max_size = max_size.max(1);
        Self {
            max_size,
            ttl,
            map: HashMap::with_capacity(max_size),
            nodes: Vec::with_capacity(max_size),
            free: Vec::new(),
            head: None,
            tail: None,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&mut self, key: &str) -> Option<T> {
        self.get_at(key, Instant::now())
    }

    pub fn set(&mut self, key: impl Into<String>, value: T) {
        self.set_at(key, value, Instant::now())
    }

    /// Read as of `now`: a live hit becomes most recent, an expired hit is removed
    pub fn get_at(&mut self, key: &str, now: Instant) -> Option<T> {
        let idx = *self.map.get(key)?;
        let expired = self.nodes[idx]
            .as_ref()
            .map_or(true, |node| now > node.expires_at);

        if expired {
            self.remove_index(idx);
            return None;
        }

        self.unlink(idx);
        self.push_back(idx);
        self.nodes[idx].as_ref().map(|node| node.value.clone())
    }

    /// Insert or overwrite as of `now`; evicts the least recent entry when full
    pub fn set_at(&mut self, key: impl Into<String>, value: T, now: Instant) {
        let key = key.into();

        if let Some(idx) = self.map.get(&key).copied() {
            self.remove_index(idx);
        }

        if self.map.len() >= self.max_size {
            if let Some(oldest) = self.head {
                self.remove_index(oldest);
            }
        }

        let node = Node {
            key: key.clone(),
            value,
            expires_at: now + self.ttl,
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };

        self.map.insert(key, idx);
        self.push_back(idx);
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = match &self.nodes[idx] {
            Some(node) => (node.prev, node.next),
            None => return,
        };

        match prev {
            Some(p) => {
                if let Some(node) = self.nodes[p].as_mut() {
                    node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.nodes[n].as_mut() {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }
    }

    fn push_back(&mut self, idx: usize) {
        let old_tail = self.tail;
        if let Some(node) = self.nodes[idx].as_mut() {
            node.prev = old_tail;
            node.next = None;
        }
        match old_tail {
            Some(t) => {
                if let Some(node) = self.nodes[t].as_mut() {
                    node.next = Some(idx);
                }
            }
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
    }

    fn remove_index(&mut self, idx: usize) {
        self.unlink(idx);
        if let Some(node) = self.nodes[idx].take() {
            self.map.remove(&node.key);
            self.free.push(idx);
        }
    }
}
