//! In-process virtual bus
//!
//! Every endpoint sees the frames sent by all other endpoints, as on a real
//! CAN bus. Used for dry runs and tests.

use super::BusTransport;
use crate::types::{BusFrame, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct BusState {
    next_endpoint: usize,
    endpoints: Vec<(usize, Sender<BusFrame>)>,
}

/// A virtual CAN bus that endpoints can be attached to
#[derive(Clone)]
pub struct VirtualBus {
    channel: String,
    state: Arc<Mutex<BusState>>,
}

impl VirtualBus {
    /// Create an empty bus
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            state: Arc::new(Mutex::new(BusState::default())),
        }
    }

    /// Attach a new endpoint to the bus
    pub fn endpoint(&self) -> VirtualEndpoint {
        let (tx, rx) = mpsc::channel();
        let mut state = self.state.lock();
        let id = state.next_endpoint;
        state.next_endpoint += 1;
        state.endpoints.push((id, tx));

        VirtualEndpoint {
            id,
            channel: self.channel.clone(),
            state: Arc::clone(&self.state),
            inbox: Mutex::new(rx),
            sent: AtomicUsize::new(0),
        }
    }
}

/// One node attached to a [`VirtualBus`]
pub struct VirtualEndpoint {
    id: usize,
    channel: String,
    state: Arc<Mutex<BusState>>,
    inbox: Mutex<Receiver<BusFrame>>,
    sent: AtomicUsize,
}

impl VirtualEndpoint {
    /// Number of frames this endpoint has put on the bus
    pub fn sent_count(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }
}

impl BusTransport for VirtualEndpoint {
    fn receive(&self, timeout: Duration) -> Result<Option<BusFrame>> {
        match self.inbox.lock().recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }

    fn send(&self, frame: &BusFrame) -> Result<()> {
        let mut state = self.state.lock();
        // Endpoints whose receiver is gone are pruned on the way
        state
            .endpoints
            .retain(|(id, tx)| *id == self.id || tx.send(frame.clone()).is_ok());
        self.sent.fetch_add(1, Ordering::SeqCst);
        log::trace!("{}: sent 0x{:X} {:02X?}", self.channel, frame.id, frame.data);
        Ok(())
    }

    fn channel(&self) -> &str {
        &self.channel
    }
}

impl Drop for VirtualEndpoint {
    fn drop(&mut self) {
        self.state.lock().endpoints.retain(|(id, _)| *id != self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(100);

    #[test]
    fn test_frames_reach_other_endpoints_only() {
        let bus = VirtualBus::new("vcan0");
        let a = bus.endpoint();
        let b = bus.endpoint();
        let c = bus.endpoint();

        let frame = BusFrame::new(0x123, vec![1, 2, 3]).unwrap();
        a.send(&frame).unwrap();

        assert_eq!(b.receive(WAIT).unwrap(), Some(frame.clone()));
        assert_eq!(c.receive(WAIT).unwrap(), Some(frame));
        assert_eq!(a.receive(Duration::ZERO).unwrap(), None);
        assert_eq!(a.sent_count(), 1);
    }

    #[test]
    fn test_dropped_endpoints_are_detached() {
        let bus = VirtualBus::new("vcan0");
        let a = bus.endpoint();
        {
            let _b = bus.endpoint();
        }
        assert_eq!(bus.state.lock().endpoints.len(), 1);
        a.send(&BusFrame::new(0x1, vec![]).unwrap()).unwrap();
    }
}
