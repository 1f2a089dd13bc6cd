//! Segmented FIFO queue: a chain of fixed-size chunks rather than one
//! growing buffer, so a burst of enqueues doesn't force a single large
//! reallocation and a long-lived queue doesn't retain one ever-growing
//! backing array.

use std::collections::VecDeque;
use std::sync::Mutex;

const CHUNK_SIZE: usize = 10;

struct Chunk<T> {
    items: Vec<Option<T>>,
    read: usize,
    write: usize,
}

impl<T> Chunk<T> {
    fn new() -> Self {
        let mut items = Vec::with_capacity(CHUNK_SIZE);
        items.resize_with(CHUNK_SIZE, || None);
        Self { items, read: 0, write: 0 }
    }

    fn is_full(&self) -> bool {
        self.write >= CHUNK_SIZE
    }

    fn has_more(&self) -> bool {
        self.read < self.write
    }

    fn push(&mut self, item: T) {
        debug_assert!(!self.is_full());
        self.items[self.write] = Some(item);
        self.write += 1;
    }

    fn pop(&mut self) -> Option<T> {
        if !self.has_more() {
            return None;
        }
        let item = self.items[self.read].take();
        self.read += 1;
        item
    }
}

/// A FIFO queue of `T`, safe to share behind an `Arc` and push/pop from
/// multiple tasks concurrently.
pub struct Queue<T> {
    chunks: Mutex<VecDeque<Chunk<T>>>,
}

impl<T> Queue<T> {
    pub fn new() -> Self {
        Self { chunks: Mutex::new(VecDeque::new()) }
    }

    pub fn push(&self, item: T) {
        let mut chunks = self.chunks.lock().expect("queue mutex poisoned");
        if chunks.back().map(Chunk::is_full).unwrap_or(true) {
            chunks.push_back(Chunk::new());
        }
        chunks.back_mut().expect("just pushed a chunk").push(item);
    }

    pub fn pop(&self) -> Option<T> {
        let mut chunks = self.chunks.lock().expect("queue mutex poisoned");
        loop {
            let front = chunks.front_mut()?;
            if front.has_more() {
                return front.pop();
            }
            if front.is_full() {
                // Drained and will never receive more pushes (pushes only
                // ever target the back chunk) — drop it and look further.
                chunks.pop_front();
            } else {
                return None;
            }
        }
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_within_and_across_chunks() {
        let queue = Queue::new();
        for i in 0..(CHUNK_SIZE * 3 + 2) {
            queue.push(i);
        }
        for i in 0..(CHUNK_SIZE * 3 + 2) {
            assert_eq!(queue.pop(), Some(i));
        }
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn interleaved_push_pop() {
        let queue = Queue::new();
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.pop(), Some(1));
        queue.push(3);
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), None);
    }
}
