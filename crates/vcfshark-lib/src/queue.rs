//! Multithreading queue with a registering mechanism: consumers can tell
//! apart "waiting for new data" from "no more data will ever arrive".

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

struct Inner<T> {
    queue: VecDeque<T>,
    n_producers: usize,
}

pub struct RegisteringQueue<T> {
    inner: Mutex<Inner<T>>,
    cv: Condvar,
}

impl<T> RegisteringQueue<T> {
    pub fn new(n_producers: usize) -> Self {
        Self {
            inner: Mutex::new(Inner { queue: VecDeque::new(), n_producers }),
            cv: Condvar::new(),
        }
    }

    pub fn push(&self, item: T) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.push_back(item);
        self.cv.notify_one();
    }

    /// A producer signs off. When the last producer completes, blocked
    /// consumers drain the remaining items and then observe the end.
    pub fn mark_completed(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.n_producers = inner.n_producers.saturating_sub(1);
        if inner.n_producers == 0 {
            self.cv.notify_all();
        }
    }

    /// Pop the next item, blocking while producers remain. Returns `None`
    /// once the queue is empty and all producers have completed.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(item) = inner.queue.pop_front() {
                return Some(item);
            }
            if inner.n_producers == 0 {
                return None;
            }
            inner = self.cv.wait(inner).unwrap();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn drains_then_ends() {
        let q = RegisteringQueue::new(1);
        q.push(1);
        q.push(2);
        q.mark_completed();
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn consumers_block_until_completion() {
        let q = Arc::new(RegisteringQueue::<u32>::new(1));
        let qc = Arc::clone(&q);
        let consumer = std::thread::spawn(move || {
            let mut seen = Vec::new();
            while let Some(v) = qc.pop() {
                seen.push(v);
            }
            seen
        });
        for i in 0..100 {
            q.push(i);
        }
        q.mark_completed();
        let seen = consumer.join().unwrap();
        assert_eq!(seen.len(), 100);
    }
}
