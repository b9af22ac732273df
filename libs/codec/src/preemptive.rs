//! Bounded set that forgets its oldest entries first

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

/// Set with a fixed capacity; inserting into a full set evicts the oldest value
#[derive(Debug, Clone)]
pub struct PreemptiveHashSet<T> {
    capacity: usize,
    members: HashSet<T>,
    order: VecDeque<T>,
}

impl<T: Eq + Hash + Clone> PreemptiveHashSet<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "PreemptiveHashSet capacity must be non-zero");
        Self {
            capacity,
            members: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Returns true if `value` was not already present
    pub fn insert(&mut self, value: T) -> bool {
        if self.members.contains(&value) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        self.members.insert(value.clone());
        self.order.push_back(value);
        true
    }

    pub fn contains(&self, value: &T) -> bool {
        self.members.contains(value)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.members.clear();
        self.order.clear();
    }
}
