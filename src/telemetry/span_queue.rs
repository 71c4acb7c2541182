//! Bounded queue retaining the longest spans
//!
//! A min-heap of capacity K: while full, an incoming span replaces the
//! current minimum only if it is strictly longer, so the queue always holds
//! the K longest spans seen since the last flush.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use super::span::ReportedSpan;

pub struct ThresholdSpanQueue {
    capacity: usize,
    heap: BinaryHeap<Reverse<ReportedSpan>>,
    /// Spans offered since the last flush, kept or not
    seen: u64,
}

impl ThresholdSpanQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            heap: BinaryHeap::with_capacity(capacity),
            seen: 0,
        }
    }

    /// Offer a span; returns whether it was retained
    pub fn push(&mut self, span: ReportedSpan) -> bool {
        self.seen += 1;
        if self.heap.len() < self.capacity {
            self.heap.push(Reverse(span));
            return true;
        }
        let longer = self.heap.peek().is_some_and(|Reverse(min)| span > *min);
        if longer {
            self.heap.pop();
            self.heap.push(Reverse(span));
        }
        longer
    }

    /// Drain all retained spans, longest first
    pub fn flush(&mut self) -> Vec<ReportedSpan> {
        self.seen = 0;
        let mut spans: Vec<ReportedSpan> = self.heap.drain().map(|Reverse(s)| s).collect();
        spans.sort_unstable_by(|a, b| b.cmp(a));
        spans
    }

    /// Shortest retained span
    pub fn min(&self) -> Option<&ReportedSpan> {
        self.heap.peek().map(|Reverse(s)| s)
    }

    pub fn seen(&self) -> u64 {
        self.seen
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
