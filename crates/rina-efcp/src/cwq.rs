//! Closed-window queue.
//!
//! Outgoing data PDUs whose sequence number falls outside the send window
//! (or that the rate gate refuses) are parked here in FIFO order, and
//! released once the window reopens. Relative order among parked PDUs is
//! preserved.

use std::collections::VecDeque;
use std::sync::Mutex;

use rina_core::{Pdu, SeqNum};

use crate::error::EfcpError;

/// FIFO queue of PDUs held while the send window is closed.
#[derive(Debug, Default)]
pub struct ClosedWindowQueue {
    inner: Mutex<VecDeque<Pdu>>,
}

impl ClosedWindowQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a PDU at the tail.
    pub fn push(&self, pdu: Pdu) {
        let mut q = self.inner.lock().expect("cwq lock poisoned");
        tracing::trace!(seq = %pdu.seq_num(), parked = q.len() + 1, "cwq: parked pdu");
        q.push_back(pdu);
    }

    /// Remove and return the head PDU.
    pub fn pop_front(&self) -> Option<Pdu> {
        self.inner.lock().expect("cwq lock poisoned").pop_front()
    }

    /// Sequence number of the next PDU to be released, for diagnostics.
    pub fn peek_seq(&self) -> Option<SeqNum> {
        self.inner
            .lock()
            .expect("cwq lock poisoned")
            .front()
            .map(Pdu::seq_num)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().expect("cwq lock poisoned").is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cwq lock poisoned").len()
    }

    /// Release queued PDUs in order while `permitted` allows the head.
    ///
    /// The queue lock is not held across `send`, so a send may observe the
    /// queue mid-drain; send and receive contexts are serial per connection.
    /// Returns the number of PDUs released.
    pub fn deliver<P, S>(&self, mut permitted: P, mut send: S) -> Result<usize, EfcpError>
    where
        P: FnMut(SeqNum) -> bool,
        S: FnMut(Pdu) -> Result<(), EfcpError>,
    {
        let mut released = 0;
        loop {
            let pdu = {
                let mut q = self.inner.lock().expect("cwq lock poisoned");
                match q.front() {
                    Some(head) if permitted(head.seq_num()) => q.pop_front().expect("head exists"),
                    _ => break,
                }
            };
            send(pdu)?;
            released += 1;
        }
        if released > 0 {
            tracing::debug!(released, "cwq: released parked pdus");
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rina_core::{Address, CepId, Pci, QosId};

    fn dt_pdu(seq: u32) -> Pdu {
        Pdu::new(
            Pci::new_dt(
                Address::new(1),
                Address::new(2),
                CepId::new(1),
                CepId::new(2),
                QosId::new(0),
                SeqNum::new(seq),
            ),
            vec![seq as u8],
        )
    }

    #[test]
    fn fifo_order_preserved() {
        let q = ClosedWindowQueue::new();
        q.push(dt_pdu(3));
        q.push(dt_pdu(4));
        q.push(dt_pdu(5));
        assert_eq!(q.len(), 3);
        assert_eq!(q.pop_front().unwrap().seq_num(), SeqNum::new(3));
        assert_eq!(q.pop_front().unwrap().seq_num(), SeqNum::new(4));
        assert_eq!(q.pop_front().unwrap().seq_num(), SeqNum::new(5));
        assert!(q.is_empty());
    }

    #[test]
    fn peek_does_not_remove() {
        let q = ClosedWindowQueue::new();
        q.push(dt_pdu(9));
        assert_eq!(q.peek_seq(), Some(SeqNum::new(9)));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn peek_empty_is_none() {
        let q = ClosedWindowQueue::new();
        assert_eq!(q.peek_seq(), None);
        assert!(q.pop_front().is_none());
    }

    #[test]
    fn deliver_stops_at_first_refused() {
        let q = ClosedWindowQueue::new();
        for seq in 3..=6 {
            q.push(dt_pdu(seq));
        }
        let mut sent = Vec::new();
        let released = q
            .deliver(
                |seq| seq.lt(SeqNum::new(5)),
                |pdu| {
                    sent.push(pdu.seq_num().value());
                    Ok(())
                },
            )
            .unwrap();
        assert_eq!(released, 2);
        assert_eq!(sent, vec![3, 4]);
        // 5 and 6 remain parked, in order.
        assert_eq!(q.peek_seq(), Some(SeqNum::new(5)));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn deliver_propagates_send_error() {
        let q = ClosedWindowQueue::new();
        q.push(dt_pdu(1));
        let res = q.deliver(|_| true, |_| Err(EfcpError::ResourceExhausted("rmt")));
        assert!(res.is_err());
        // The failed PDU was consumed by send; ownership passed on success
        // and failure alike, matching the RMT boundary contract.
        assert!(q.is_empty());
    }

    #[test]
    fn deliver_empty_queue_is_noop() {
        let q = ClosedWindowQueue::new();
        let released = q.deliver(|_| true, |_| Ok(())).unwrap();
        assert_eq!(released, 0);
    }
}
