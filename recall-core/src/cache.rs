//! Bounded id → metadata cache in front of the relational store.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::models::Metadata;

#[derive(Default)]
struct Inner {
    generation: u64,
    entries: HashMap<String, Metadata>,
    order: VecDeque<String>,
}

/// Readers note the generation before going to the database and insert with
/// it; any invalidation in between bumps the generation and the stale insert
/// is dropped.
pub struct MetadataCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl MetadataCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().map(|i| i.generation).unwrap_or(0)
    }

    pub fn get(&self, id: &str) -> Option<Metadata> {
        self.inner.lock().ok()?.entries.get(id).cloned()
    }

    pub fn insert(&self, generation: u64, id: &str, metadata: Metadata) {
        if self.capacity == 0 {
            return;
        }
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.generation != generation {
            return;
        }
        if inner.entries.insert(id.to_string(), metadata).is_none() {
            inner.order.push_back(id.to_string());
        }
        while inner.entries.len() > self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    pub fn invalidate(&self, id: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.generation += 1;
            if inner.entries.remove(id).is_some() {
                inner.order.retain(|k| k != id);
            }
        }
    }

    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.generation += 1;
            inner.entries.clear();
            inner.order.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
