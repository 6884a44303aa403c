//! Device-side state of events and external semaphores.
//!
//! An event counts records. Recording on a queue issues the next sequence
//! number at submission time and completes it when the queue reaches the
//! record; a wait snapshots the latest issued number at submission time and
//! blocks until it completes. Waiting on a never-recorded event returns at
//! once.
//!
//! A semaphore holds a monotonically compared 64-bit value: signalling sets
//! it, waiting blocks until it reaches the target.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;

#[derive(Debug)]
pub struct EventState {
    issued: AtomicU64,
    completed: watch::Sender<u64>,
}

impl Default for EventState {
    fn default() -> Self {
        EventState {
            issued: AtomicU64::new(0),
            completed: watch::Sender::new(0),
        }
    }
}

impl EventState {
    /// Issues the next record and returns its sequence number.
    pub fn issue(&self) -> u64 {
        self.issued.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Completes the record with sequence `seq` (and every earlier one).
    pub fn complete(&self, seq: u64) {
        self.completed.send_if_modified(|done| {
            if seq > *done {
                *done = seq;
                true
            } else {
                false
            }
        });
    }

    /// Issues and completes a record in one step, as a replayed record node
    /// does once its dependencies have run.
    pub fn record_now(&self) {
        let seq = self.issue();
        self.complete(seq);
    }

    /// The record a wait submitted now has to observe.
    pub fn latest(&self) -> u64 {
        self.issued.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        *self.completed.borrow() >= self.latest()
    }

    pub async fn wait_for(&self, target: u64) {
        let mut rx = self.completed.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|done| *done >= target).await;
    }
}

#[derive(Debug)]
pub struct SemaphoreState {
    value: watch::Sender<u64>,
}

impl Default for SemaphoreState {
    fn default() -> Self {
        SemaphoreState {
            value: watch::Sender::new(0),
        }
    }
}

impl SemaphoreState {
    pub fn value(&self) -> u64 {
        *self.value.borrow()
    }

    pub fn signal(&self, value: u64) {
        self.value.send_replace(value);
    }

    pub async fn wait_for(&self, target: u64) {
        let mut rx = self.value.subscribe();
        let _ = rx.wait_for(|v| *v >= target).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn fresh_event_is_complete() {
        let event = EventState::default();
        assert!(event.is_complete());
        assert_eq!(event.latest(), 0);
    }

    #[test]
    fn issued_record_is_pending_until_completed() {
        let event = EventState::default();
        let first = event.issue();
        let second = event.issue();
        assert!(!event.is_complete());
        event.complete(second);
        event.complete(first);
        assert!(event.is_complete());
    }

    #[tokio::test]
    async fn wait_returns_once_target_completes() {
        let event = Arc::new(EventState::default());
        let seq = event.issue();
        let waiter = {
            let event = Arc::clone(&event);
            tokio::spawn(async move { event.wait_for(seq).await })
        };
        event.complete(seq);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn semaphore_wait_blocks_until_value_reached() {
        let sem = Arc::new(SemaphoreState::default());
        let waiter = {
            let sem = Arc::clone(&sem);
            tokio::spawn(async move { sem.wait_for(3).await })
        };
        sem.signal(2);
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        sem.signal(3);
        waiter.await.unwrap();
        assert_eq!(sem.value(), 3);
    }
}
