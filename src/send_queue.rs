//! Bounded per-client packet queue with drop-oldest overflow.
//!
//! The fan-out step must never block on a slow client, and a late packet is
//! worth less than a fresh one, so a full queue evicts its head instead of
//! refusing the push.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

pub struct PacketQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

struct QueueInner {
    packets: VecDeque<Vec<u8>>,
    closed: bool,
}

impl PacketQueue {
    pub fn new(capacity: usize) -> Arc<PacketQueue> {
        Arc::new(PacketQueue {
            inner: Mutex::new(QueueInner {
                packets: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        })
    }

    /// Enqueue a packet, evicting the oldest entries if the queue is full.
    /// Returns false if the queue has been closed.
    pub fn push(&self, packet: Vec<u8>) -> bool {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return false;
            }

            while inner.packets.len() >= self.capacity {
                inner.packets.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            inner.packets.push_back(packet);
        }

        self.notify.notify_one();
        true
    }

    /// Wait for the next packet. Returns None once the queue is closed and
    /// drained.
    pub async fn pop(&self) -> Option<Vec<u8>> {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(packet) = inner.packets.pop_front() {
                    return Some(packet);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        // notify_waiters wakes a task already parked in pop; notify_one
        // leaves a permit for one that is between its check and its await.
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn packet(tag: u8) -> Vec<u8> {
        vec![tag; 4]
    }

    #[tokio::test]
    async fn pops_in_fifo_order() {
        let queue = PacketQueue::new(8);
        assert!(queue.push(packet(1)));
        assert!(queue.push(packet(2)));
        assert!(queue.push(packet(3)));

        assert_eq!(queue.pop().await.unwrap()[0], 1);
        assert_eq!(queue.pop().await.unwrap()[0], 2);
        assert_eq!(queue.pop().await.unwrap()[0], 3);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_keeps_newest() {
        let queue = PacketQueue::new(50);
        for tag in 0..50u8 {
            queue.push(packet(tag));
        }
        assert_eq!(queue.len(), 50);

        queue.push(packet(50));
        assert_eq!(queue.len(), 50);
        assert_eq!(queue.dropped(), 1);

        // Packet 0 is gone; 1 is now the head and 50 is the tail.
        assert_eq!(queue.pop().await.unwrap()[0], 1);
        for _ in 0..48 {
            queue.pop().await.unwrap();
        }
        assert_eq!(queue.pop().await.unwrap()[0], 50);
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let queue = PacketQueue::new(8);
        queue.push(packet(1));
        queue.close();

        assert!(!queue.push(packet(2)));
        assert_eq!(queue.pop().await.unwrap()[0], 1);
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn close_wakes_a_parked_consumer() {
        let queue = PacketQueue::new(8);
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        let result = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer did not wake on close")
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn push_wakes_a_parked_consumer() {
        let queue = PacketQueue::new(8);
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(packet(9));

        let result = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer did not wake on push")
            .unwrap();
        assert_eq!(result.unwrap()[0], 9);
    }
}
