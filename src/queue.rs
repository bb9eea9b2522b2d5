//! Work queues between listeners, the router and senders, plus the shared
//! stop signal.
//!
//! Queues are unbounded FIFOs drained by polling. Workers never block on a
//! queue; they pop, and sleep for the poll interval when it is empty, so every
//! loop sees the stop signal within one interval.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::contact::{Contact, NetworkId};
use crate::protocol::Request;

/// Shared FIFO. Cloning yields another handle to the same queue.
pub struct WorkQueue<T> {
    items: Arc<Mutex<VecDeque<T>>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
        }
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn push(&self, item: T) {
        // A poisoned queue still holds valid items; keep using it.
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        items.push_back(item);
    }

    pub fn extend(&self, batch: impl IntoIterator<Item = T>) {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        items.extend(batch);
    }

    /// Non-blocking pop.
    pub fn pop(&self) -> Option<T> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return everything queued.
    pub fn drain(&self) -> Vec<T> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        items.drain(..).collect()
    }
}

/// Raw bytes as received by a listener.
#[derive(Debug, Clone)]
pub struct InboundItem {
    pub bytes: Vec<u8>,
    pub origin: SocketAddr,
    pub network: NetworkId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Contact(Contact),
    /// UDP broadcast on the network's discovery port.
    Lan,
}

#[derive(Debug, Clone)]
pub struct OutboundItem {
    pub network: NetworkId,
    pub request: Request,
    pub destination: Destination,
}

/// Process-wide cooperative cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
}

/// Granularity of [`StopSignal::sleep`].
const SLEEP_SLICE: Duration = Duration::from_millis(50);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` in short slices. Returns `false` if the signal
    /// was raised before the time was up.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_stopped() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_queue_is_fifo_and_shared() {
        let queue = WorkQueue::new();
        let handle = queue.clone();
        queue.push(1);
        handle.extend([2, 3]);
        assert_eq!(queue.len(), 3);
        assert_eq!(handle.pop(), Some(1));
        assert_eq!(queue.drain(), vec![2, 3]);
        assert!(handle.is_empty());
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_concurrent_producers() {
        let queue = WorkQueue::new();
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        queue.push(p * 100 + i);
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        let mut items = queue.drain();
        items.sort();
        assert_eq!(items, (0..400).collect::<Vec<_>>());
    }

    #[test]
    fn test_stop_interrupts_sleep() {
        let stop = StopSignal::new();
        assert!(stop.sleep(Duration::from_millis(1)));

        let remote = stop.clone();
        let sleeper = thread::spawn(move || remote.sleep(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(20));
        stop.stop();
        assert!(!sleeper.join().unwrap());
        assert!(stop.is_stopped());
    }
}
