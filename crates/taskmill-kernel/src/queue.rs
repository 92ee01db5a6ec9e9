//! Indexed priority queue.
//!
//! An array-backed min-heap of tasks ordered by `(priority, sequence)`:
//! smaller priority values dequeue first, and a monotonically increasing
//! sequence number makes equal-priority tasks dequeue in insertion order.
//! A side index maps task ids to heap slots so membership checks are O(1)
//! and arbitrary removal needs no scan-and-rebuild.
//!
//! The heap itself is not synchronized; the scheduler owns it behind its
//! state lock.  Invariant under that lock: the index keys are exactly the
//! ids present in the heap, and each maps to the slot holding that task.

use std::collections::HashMap;

use taskmill_core::{Task, TaskPriority};

struct HeapEntry {
    priority: TaskPriority,
    seq: u64,
    task: Task,
}

impl HeapEntry {
    fn key(&self) -> (u8, u64) {
        (self.priority as u8, self.seq)
    }
}

/// Min-heap of tasks with an id index.
#[derive(Default)]
pub struct TaskHeap {
    entries: Vec<HeapEntry>,
    index: HashMap<String, usize>,
    next_seq: u64,
}

impl TaskHeap {
    /// Create an empty heap.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the heap holds no tasks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `id` is currently queued.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// The queued task with `id`, if present.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Task> {
        self.index.get(id).map(|&slot| &self.entries[slot].task)
    }

    /// Priority of the next task to dequeue.
    #[must_use]
    pub fn peek_highest_priority(&self) -> Option<TaskPriority> {
        self.entries.first().map(|entry| entry.priority)
    }

    /// Insert a task.  O(log n).
    ///
    /// A task id may appear at most once; a duplicate push is ignored.
    pub fn push(&mut self, task: &Task) {
        let id = task.id().to_string();
        if self.index.contains_key(&id) {
            tracing::warn!(task_id = %id, "duplicate push ignored");
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        let slot = self.entries.len();
        self.entries.push(HeapEntry {
            priority: task.priority(),
            seq,
            task: task.clone(),
        });
        self.index.insert(id, slot);
        self.sift_up(slot);
    }

    /// Remove and return the highest-priority task.  O(log n).
    pub fn pop_highest(&mut self) -> Option<Task> {
        if self.entries.is_empty() {
            return None;
        }
        let last = self.entries.len() - 1;
        self.swap(0, last);
        let entry = self.entries.pop().map(|e| e.task)?;
        self.index.remove(entry.id());
        if !self.entries.is_empty() {
            self.sift_down(0);
        }
        Some(entry)
    }

    /// Remove an arbitrary task by id, restoring heap order.
    pub fn remove_by_id(&mut self, id: &str) -> Option<Task> {
        let slot = self.index.get(id).copied()?;
        let last = self.entries.len() - 1;
        self.swap(slot, last);
        let entry = self.entries.pop().map(|e| e.task)?;
        self.index.remove(entry.id());
        if slot < self.entries.len() {
            self.sift_down(slot);
            self.sift_up(slot);
        }
        Some(entry)
    }

    /// Iterate the queued tasks in heap (array) order.
    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.entries.iter().map(|entry| &entry.task)
    }

    // -- Sift helpers -------------------------------------------------------

    fn less(&self, a: usize, b: usize) -> bool {
        self.entries[a].key() < self.entries[b].key()
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.entries.swap(a, b);
        self.index.insert(self.entries[a].task.id().to_string(), a);
        self.index.insert(self.entries[b].task.id().to_string(), b);
    }

    fn sift_up(&mut self, mut slot: usize) {
        while slot > 0 {
            let parent = (slot - 1) / 2;
            if !self.less(slot, parent) {
                break;
            }
            self.swap(slot, parent);
            slot = parent;
        }
    }

    fn sift_down(&mut self, mut slot: usize) {
        let len = self.entries.len();
        loop {
            let left = 2 * slot + 1;
            let right = 2 * slot + 2;
            let mut smallest = slot;
            if left < len && self.less(left, smallest) {
                smallest = left;
            }
            if right < len && self.less(right, smallest) {
                smallest = right;
            }
            if smallest == slot {
                break;
            }
            self.swap(slot, smallest);
            slot = smallest;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
