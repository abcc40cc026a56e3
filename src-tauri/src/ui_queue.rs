//! Work posted to the thread that owns the overlay state.
//!
//! Background workers never touch UI state directly; they post an item here
//! and the owning thread drains the queue in arrival order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};

enum Envelope<T> {
    Now(T),
    At(Instant, T),
}

pub struct UiSender<T> {
    tx: Sender<Envelope<T>>,
}

impl<T> Clone for UiSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> UiSender<T> {
    /// Returns false once the owning thread has gone away.
    pub fn post(&self, item: T) -> bool {
        self.tx.send(Envelope::Now(item)).is_ok()
    }

    pub fn post_after(&self, delay: Duration, item: T) -> bool {
        self.tx
            .send(Envelope::At(Instant::now() + delay, item))
            .is_ok()
    }
}

struct Delayed<T> {
    due: Instant,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Delayed<T> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl<T> Eq for Delayed<T> {}

impl<T> PartialOrd for Delayed<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Delayed<T> {
    // Reversed so the max-heap pops the earliest deadline.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClosed;

pub struct UiQueue<T> {
    rx: Receiver<Envelope<T>>,
    delayed: BinaryHeap<Delayed<T>>,
    seq: u64,
}

pub fn channel<T>() -> (UiSender<T>, UiQueue<T>) {
    let (tx, rx) = unbounded();
    (
        UiSender { tx },
        UiQueue {
            rx,
            delayed: BinaryHeap::new(),
            seq: 0,
        },
    )
}

impl<T> UiQueue<T> {
    /// Everything that is due now, immediate items first in arrival order.
    pub fn drain_ready(&mut self) -> Vec<T> {
        let mut ready = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(envelope) => self.accept(envelope, &mut ready),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        self.pop_due(&mut ready);
        ready
    }

    /// Blocks until something is due or `timeout` elapses.
    pub fn wait(&mut self, timeout: Duration) -> Result<Vec<T>, QueueClosed> {
        let ready = self.drain_ready();
        if !ready.is_empty() {
            return Ok(ready);
        }

        let mut deadline = Instant::now() + timeout;
        if let Some(next) = self.delayed.peek() {
            deadline = deadline.min(next.due);
        }
        let wait_for = deadline.saturating_duration_since(Instant::now());

        let mut ready = Vec::new();
        match self.rx.recv_timeout(wait_for) {
            Ok(envelope) => self.accept(envelope, &mut ready),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                if self.delayed.is_empty() {
                    return Err(QueueClosed);
                }
                std::thread::sleep(wait_for);
            }
        }
        ready.extend(self.drain_ready());
        Ok(ready)
    }

    pub fn pending_delayed(&self) -> usize {
        self.delayed.len()
    }

    fn accept(&mut self, envelope: Envelope<T>, ready: &mut Vec<T>) {
        match envelope {
            Envelope::Now(item) => ready.push(item),
            Envelope::At(due, item) => {
                self.seq += 1;
                self.delayed.push(Delayed {
                    due,
                    seq: self.seq,
                    item,
                });
            }
        }
    }

    fn pop_due(&mut self, ready: &mut Vec<T>) {
        let now = Instant::now();
        while self.delayed.peek().is_some_and(|next| next.due <= now) {
            if let Some(next) = self.delayed.pop() {
                ready.push(next.item);
            }
        }
    }
}
