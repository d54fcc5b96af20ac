//! Bounded producer/consumer queue feeding the asynchronous log sink.
//!
//! `push_back` blocks while the queue is full; `pop_timeout` blocks while it
//! is empty. `close` wakes every waiter; a closed queue still hands out the
//! items already buffered before reporting `Closed`.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub enum Pop<T> {
    Item(T),
    TimedOut,
    Closed,
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

pub struct BoundedBlockingQueue<T> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> BoundedBlockingQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity,
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().items.is_empty()
    }

    /// Blocks while full. Returns false (dropping `item`) once closed.
    pub fn push_back(&self, item: T) -> bool {
        let mut inner = self.inner.lock().unwrap();
        while inner.items.len() >= self.capacity && !inner.closed {
            inner = self.not_full.wait(inner).unwrap();
        }
        if inner.closed {
            return false;
        }
        inner.items.push_back(item);
        drop(inner);
        self.not_empty.notify_one();
        true
    }

    /// Blocks up to `timeout` for an item. After `close`, drains the backlog
    /// and then reports `Closed`.
    pub fn pop_timeout(&self, timeout: Duration) -> Pop<T> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(item) = inner.items.pop_front() {
                drop(inner);
                self.not_full.notify_one();
                return Pop::Item(item);
            }
            if inner.closed {
                return Pop::Closed;
            }
            let (guard, result) = self.not_empty.wait_timeout(inner, timeout).unwrap();
            inner = guard;
            if result.timed_out() && inner.items.is_empty() && !inner.closed {
                return Pop::TimedOut;
            }
        }
    }

    /// Wake every producer and consumer; subsequent pushes are refused.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order() {
        let q = BoundedBlockingQueue::new(4);
        q.push_back(1);
        q.push_back(2);
        q.push_back(3);
        for want in 1..=3 {
            match q.pop_timeout(Duration::from_millis(10)) {
                Pop::Item(got) => assert_eq!(got, want),
                _ => panic!("expected item"),
            }
        }
        assert!(matches!(q.pop_timeout(Duration::from_millis(10)), Pop::TimedOut));
    }

    #[test]
    fn full_queue_blocks_producer_until_consumed() {
        let q = Arc::new(BoundedBlockingQueue::new(1));
        q.push_back(0u32);

        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.push_back(1))
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(q.len(), 1, "producer must still be parked");

        assert!(matches!(q.pop_timeout(Duration::from_secs(1)), Pop::Item(0)));
        assert!(producer.join().unwrap());
        assert!(matches!(q.pop_timeout(Duration::from_secs(1)), Pop::Item(1)));
    }

    #[test]
    fn close_wakes_blocked_consumer_and_drains_backlog() {
        let q = Arc::new(BoundedBlockingQueue::new(4));
        q.push_back(7);

        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                let mut got = Vec::new();
                loop {
                    match q.pop_timeout(Duration::from_secs(5)) {
                        Pop::Item(v) => got.push(v),
                        Pop::Closed => return got,
                        Pop::TimedOut => panic!("should not time out"),
                    }
                }
            })
        };
        thread::sleep(Duration::from_millis(20));
        q.close();

        assert_eq!(consumer.join().unwrap(), vec![7]);
        assert!(!q.push_back(8), "push after close is refused");
    }
}
