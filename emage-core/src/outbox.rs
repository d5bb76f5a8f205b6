//! Bounded buffer for reports produced while the controller is unreachable.
//!
//! Capacity is fixed per agent. When full, the oldest report is evicted to make room: fresh
//! measurements are worth more to the controller than a complete history. A capacity of zero
//! disables buffering, every report is evicted on arrival.

use std::collections::VecDeque;

#[derive(Debug)]
pub struct ReportBuffer {
    queue: VecDeque<Vec<u8>>,
    capacity: usize,
    evicted: u64,
}

impl ReportBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            // `capacity` only bounds the queue; it may be far larger than memory allows.
            queue: VecDeque::new(),
            capacity,
            evicted: 0,
        }
    }

    /// Queue a report payload. Returns the report evicted to make room, if any.
    pub fn push(&mut self, report: Vec<u8>) -> Option<Vec<u8>> {
        if self.capacity == 0 {
            self.evicted += 1;
            return Some(report);
        }
        let evicted = if self.queue.len() >= self.capacity {
            self.evicted += 1;
            self.queue.pop_front()
        } else {
            None
        };
        self.queue.push_back(report);
        evicted
    }

    /// Take every queued report in arrival order.
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        self.queue.drain(..).collect()
    }

    /// Put reports back at the front, ahead of anything queued since. Used when a flush is cut
    /// short; the capacity still holds, so the oldest of the combined set are evicted first.
    pub fn requeue_front(&mut self, reports: Vec<Vec<u8>>) {
        for r in reports.into_iter().rev() {
            if self.capacity == 0 {
                self.evicted += 1;
                continue;
            }
            if self.queue.len() >= self.capacity {
                self.evicted += 1;
                continue;
            }
            self.queue.push_front(r);
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total reports dropped to overflow since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}
