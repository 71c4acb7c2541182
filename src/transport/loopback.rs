//! In-memory transport that records every call
//!
//! Nothing is delivered anywhere: the driver of the loopback (a test or
//! the simulator) takes the recorded requests and timers and answers them
//! by calling back into the instance.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use super::{Request, TimerHandle, TimerKind, Transport};
use crate::cluster::NodeDescriptor;
use crate::config::SeedHost;
use crate::utils::TransportError;

/// A request accepted by `send`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRequest {
    pub node: usize,
    pub address: String,
    pub request: Request,
}

/// A timer registration that was not cancelled yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledTimer {
    pub handle: TimerHandle,
    pub after: Duration,
    pub kind: TimerKind,
}

#[derive(Default)]
pub struct LoopbackTransport {
    sent: Mutex<Vec<SentRequest>>,
    connects: Mutex<Vec<SeedHost>>,
    timers: Mutex<BTreeMap<TimerHandle, ScheduledTimer>>,
    down: Mutex<HashSet<usize>>,
    next_timer: AtomicU64,
    rejected: AtomicU64,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `send` to `node` fail as if no connection existed
    pub fn set_node_down(&self, node: usize, down: bool) {
        let mut set = self.down.lock();
        if down {
            set.insert(node);
        } else {
            set.remove(&node);
        }
    }

    /// Take every request sent since the last call
    pub fn take_sent(&self) -> Vec<SentRequest> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn take_connects(&self) -> Vec<SeedHost> {
        std::mem::take(&mut *self.connects.lock())
    }

    /// Live timers in registration order
    pub fn timers(&self) -> Vec<ScheduledTimer> {
        self.timers.lock().values().copied().collect()
    }

    /// Remove and return the live timer of `kind`, as if it fired
    pub fn fire(&self, kind: TimerKind) -> Option<ScheduledTimer> {
        let mut timers = self.timers.lock();
        let handle = timers.values().find(|t| t.kind == kind).map(|t| t.handle)?;
        timers.remove(&handle)
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, node_index: usize, node: &NodeDescriptor, request: Request) -> Result<(), TransportError> {
        if self.down.lock().contains(&node_index) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(TransportError::NotConnected(node_index));
        }
        self.sent.lock().push(SentRequest {
            node: node_index,
            address: node.address(),
            request,
        });
        Ok(())
    }

    fn connect(&self, seed: &SeedHost) {
        self.connects.lock().push(seed.clone());
    }

    fn schedule_timer(&self, after: Duration, kind: TimerKind) -> TimerHandle {
        let handle = TimerHandle(self.next_timer.fetch_add(1, Ordering::Relaxed));
        self.timers
            .lock()
            .insert(handle, ScheduledTimer { handle, after, kind });
        handle
    }

    fn cancel_timer(&self, handle: TimerHandle) {
        self.timers.lock().remove(&handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::OperationKind;

    fn request(opaque: u32) -> Request {
        Request {
            opaque,
            kind: OperationKind::Get,
            key: b"k".to_vec(),
            vbucket: 0,
            payload: Vec::new(),
        }
    }

    #[test]
    fn test_records_and_rejects() {
        let transport = LoopbackTransport::new();
        let node = NodeDescriptor::data_node("10.0.0.1", 11210);

        transport.send(0, &node, request(1)).unwrap();
        transport.set_node_down(1, true);
        assert_eq!(
            transport.send(1, &node, request(2)),
            Err(TransportError::NotConnected(1))
        );

        let sent = transport.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].address, "10.0.0.1:11210");
        assert_eq!(transport.sent_count(), 0);
        assert_eq!(transport.rejected_count(), 1);
    }

    #[test]
    fn test_timers() {
        let transport = LoopbackTransport::new();
        let a = transport.schedule_timer(Duration::from_millis(10), TimerKind::RetryTick);
        let b = transport.schedule_timer(Duration::from_secs(10), TimerKind::OrphanFlush);
        assert_ne!(a, b);
        assert_eq!(transport.timers().len(), 2);

        transport.cancel_timer(a);
        assert!(transport.fire(TimerKind::RetryTick).is_none());
        assert_eq!(transport.fire(TimerKind::OrphanFlush).map(|t| t.handle), Some(b));
        assert!(transport.timers().is_empty());
    }
}
