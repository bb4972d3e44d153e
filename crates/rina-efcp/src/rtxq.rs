//! Retransmission queue.
//!
//! Holds exactly the data PDUs in `[snd_lft_win, last_sent]` that are not
//! yet acknowledged. Entries carry a resend counter; once a PDU would be
//! retransmitted more than `data_retransmit_max` times the connection is
//! declared failed.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rina_core::{Pdu, SeqNum};

use crate::error::EfcpError;

/// What to do with an entry whose timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Resend; `new_retries` is the count after this retransmission.
    Retry { new_retries: u32 },
    /// The retry budget is spent; the connection must fail.
    Exhausted,
}

/// Decide the fate of an entry that has already been retransmitted
/// `retries` times, against a budget of `max` retransmissions.
pub fn retry_outcome(retries: u32, max: u32) -> RetryOutcome {
    if retries >= max {
        RetryOutcome::Exhausted
    } else {
        RetryOutcome::Retry {
            new_retries: retries + 1,
        }
    }
}

#[derive(Debug)]
struct RtxEntry {
    pdu: Pdu,
    retries: u32,
    deadline: Instant,
}

/// Sent-but-unacknowledged PDUs awaiting ACK or retry.
///
/// Entries are kept in sequence order; data sequence numbers are assigned
/// monotonically, so appends preserve it.
#[derive(Debug)]
pub struct RetransmissionQueue {
    entries: Mutex<VecDeque<RtxEntry>>,
    max_retries: u32,
}

impl RetransmissionQueue {
    pub fn new(max_retries: u32) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            max_retries,
        }
    }

    /// Track a freshly sent PDU; its timer is armed at `now + timeout`.
    pub fn push(&self, pdu: Pdu, timeout: Duration, now: Instant) {
        let mut q = self.entries.lock().expect("rtxq lock poisoned");
        tracing::trace!(seq = %pdu.seq_num(), outstanding = q.len() + 1, "rtxq: tracking pdu");
        q.push_back(RtxEntry {
            pdu,
            retries: 0,
            deadline: now + timeout,
        });
    }

    /// Acknowledge every entry with sequence ≤ `acked_up_to` (modulo-wrap):
    /// acked entries are dropped and their timers cancelled, and the timers
    /// of the remaining entries are restarted at `now + base_timeout`.
    ///
    /// Returns the number of entries removed.
    pub fn ack(&self, acked_up_to: SeqNum, base_timeout: Duration, now: Instant) -> usize {
        let mut q = self.entries.lock().expect("rtxq lock poisoned");
        let before = q.len();
        q.retain(|e| e.pdu.seq_num().gt(acked_up_to));
        for e in q.iter_mut() {
            e.deadline = now + base_timeout;
        }
        let removed = before - q.len();
        if removed > 0 {
            tracing::trace!(acked_up_to = %acked_up_to, removed, "rtxq: acked entries");
        }
        removed
    }

    /// Immediately resend the single entry with sequence `seq`, bumping its
    /// resend counter and re-arming its timer.
    ///
    /// An unknown sequence is ignored: the entry may have been acked by a
    /// control PDU that overtook the NACK.
    pub fn nack<S>(
        &self,
        seq: SeqNum,
        base_timeout: Duration,
        now: Instant,
        send: S,
    ) -> Result<(), EfcpError>
    where
        S: FnOnce(Pdu) -> Result<(), EfcpError>,
    {
        let pdu = {
            let mut q = self.entries.lock().expect("rtxq lock poisoned");
            let Some(entry) = q.iter_mut().find(|e| e.pdu.seq_num() == seq) else {
                tracing::debug!(seq = %seq, "rtxq: nack for untracked seq, ignoring");
                return Ok(());
            };
            match retry_outcome(entry.retries, self.max_retries) {
                RetryOutcome::Exhausted => {
                    return Err(EfcpError::RetransmissionExhausted {
                        seq: seq.value(),
                        retries: entry.retries,
                    });
                }
                RetryOutcome::Retry { new_retries } => {
                    entry.retries = new_retries;
                    entry.deadline = now + base_timeout;
                    entry.pdu.clone()
                }
            }
        };
        tracing::debug!(seq = %seq, "rtxq: resending on nack");
        send(pdu)
    }

    /// Resend every entry whose timer has expired at `now`, bumping counters
    /// and re-arming timers. Returns the number resent, or
    /// `RetransmissionExhausted` once any entry runs out of budget.
    pub fn retransmit_expired<S>(
        &self,
        now: Instant,
        base_timeout: Duration,
        mut send: S,
    ) -> Result<usize, EfcpError>
    where
        S: FnMut(Pdu) -> Result<(), EfcpError>,
    {
        let to_send = {
            let mut q = self.entries.lock().expect("rtxq lock poisoned");
            let mut batch = Vec::new();
            for entry in q.iter_mut() {
                if entry.deadline > now {
                    continue;
                }
                match retry_outcome(entry.retries, self.max_retries) {
                    RetryOutcome::Exhausted => {
                        return Err(EfcpError::RetransmissionExhausted {
                            seq: entry.pdu.seq_num().value(),
                            retries: entry.retries,
                        });
                    }
                    RetryOutcome::Retry { new_retries } => {
                        entry.retries = new_retries;
                        entry.deadline = now + base_timeout;
                        batch.push(entry.pdu.clone());
                    }
                }
            }
            batch
        };
        let count = to_send.len();
        for pdu in to_send {
            tracing::debug!(seq = %pdu.seq_num(), "rtxq: retransmitting on timeout");
            send(pdu)?;
        }
        Ok(count)
    }

    /// Whether the head entry's timer has expired.
    pub fn head_expired(&self, now: Instant) -> bool {
        self.entries
            .lock()
            .expect("rtxq lock poisoned")
            .front()
            .is_some_and(|e| e.deadline <= now)
    }

    /// Sequence number of the head entry, the sender left-window edge.
    pub fn head_seq(&self) -> Option<SeqNum> {
        self.entries
            .lock()
            .expect("rtxq lock poisoned")
            .front()
            .map(|e| e.pdu.seq_num())
    }

    /// Resend counter of the entry with sequence `seq`, for diagnostics.
    pub fn retries_of(&self, seq: SeqNum) -> Option<u32> {
        self.entries
            .lock()
            .expect("rtxq lock poisoned")
            .iter()
            .find(|e| e.pdu.seq_num() == seq)
            .map(|e| e.retries)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().expect("rtxq lock poisoned").is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("rtxq lock poisoned").len()
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

    const T: Duration = Duration::from_millis(100);

    #[test]
    fn retry_outcome_budget() {
        assert_eq!(retry_outcome(0, 3), RetryOutcome::Retry { new_retries: 1 });
        assert_eq!(retry_outcome(2, 3), RetryOutcome::Retry { new_retries: 3 });
        assert_eq!(retry_outcome(3, 3), RetryOutcome::Exhausted);
        assert_eq!(retry_outcome(10, 3), RetryOutcome::Exhausted);
    }

    #[test]
    fn retry_outcome_zero_budget() {
        assert_eq!(retry_outcome(0, 0), RetryOutcome::Exhausted);
    }

    #[test]
    fn ack_trims_up_to_inclusive() {
        let q = RetransmissionQueue::new(5);
        let now = Instant::now();
        for seq in 1..=4 {
            q.push(dt_pdu(seq), T, now);
        }
        let removed = q.ack(SeqNum::new(2), T, now);
        assert_eq!(removed, 2);
        assert_eq!(q.head_seq(), Some(SeqNum::new(3)));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn ack_of_nothing_outstanding_is_noop() {
        let q = RetransmissionQueue::new(5);
        assert_eq!(q.ack(SeqNum::new(7), T, Instant::now()), 0);
        assert!(q.is_empty());
    }

    #[test]
    fn ack_rearms_remaining_timers() {
        let q = RetransmissionQueue::new(5);
        let now = Instant::now();
        q.push(dt_pdu(1), T, now);
        q.push(dt_pdu(2), T, now);
        // Ack 1 far in the future: entry 2's timer restarts from `then`.
        let then = now + Duration::from_secs(10);
        q.ack(SeqNum::new(1), T, then);
        assert!(!q.head_expired(then));
        assert!(q.head_expired(then + T));
    }

    #[test]
    fn expired_entries_are_resent_and_rearmed() {
        let q = RetransmissionQueue::new(5);
        let now = Instant::now();
        q.push(dt_pdu(1), T, now);
        q.push(dt_pdu(2), T, now);

        let later = now + T;
        let mut resent = Vec::new();
        let n = q
            .retransmit_expired(later, T, |pdu| {
                resent.push(pdu.seq_num().value());
                Ok(())
            })
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(resent, vec![1, 2]);
        assert_eq!(q.retries_of(SeqNum::new(1)), Some(1));
        // Timers re-armed: nothing expired right after the tick.
        assert!(!q.head_expired(later));
    }

    #[test]
    fn unexpired_entries_left_alone() {
        let q = RetransmissionQueue::new(5);
        let now = Instant::now();
        q.push(dt_pdu(1), T, now);
        let n = q.retransmit_expired(now, T, |_| panic!("nothing expired")).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn exhaustion_is_fatal() {
        let q = RetransmissionQueue::new(1);
        let now = Instant::now();
        q.push(dt_pdu(2), T, now);

        // First expiry: retry.
        let n = q.retransmit_expired(now + T, T, |_| Ok(())).unwrap();
        assert_eq!(n, 1);

        // Second expiry: budget of 1 is spent.
        let err = q
            .retransmit_expired(now + T + T, T, |_| Ok(()))
            .unwrap_err();
        assert!(matches!(
            err,
            EfcpError::RetransmissionExhausted { seq: 2, retries: 1 }
        ));
    }

    #[test]
    fn nack_resends_single_entry() {
        let q = RetransmissionQueue::new(5);
        let now = Instant::now();
        for seq in 1..=3 {
            q.push(dt_pdu(seq), T, now);
        }
        let mut resent = Vec::new();
        q.nack(SeqNum::new(2), T, now, |pdu| {
            resent.push(pdu.seq_num().value());
            Ok(())
        })
        .unwrap();
        assert_eq!(resent, vec![2]);
        assert_eq!(q.retries_of(SeqNum::new(2)), Some(1));
        assert_eq!(q.retries_of(SeqNum::new(1)), Some(0));
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn nack_unknown_seq_ignored() {
        let q = RetransmissionQueue::new(5);
        q.nack(SeqNum::new(42), T, Instant::now(), |_| {
            panic!("must not send")
        })
        .unwrap();
    }

    #[test]
    fn ack_across_wrap_boundary() {
        let q = RetransmissionQueue::new(5);
        let now = Instant::now();
        q.push(dt_pdu(0xFFFF_FFFF), T, now);
        q.push(dt_pdu(0), T, now);
        q.push(dt_pdu(1), T, now);
        let removed = q.ack(SeqNum::new(0), T, now);
        assert_eq!(removed, 2);
        assert_eq!(q.head_seq(), Some(SeqNum::new(1)));
    }
}
