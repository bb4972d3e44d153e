//! Neighbor liveness watchdog.
//!
//! A periodic task reads a counter object on each enrolled neighbor. A
//! reply refreshes the neighbor's last-heard time and RTT estimate; silence
//! past the declared-dead interval raises a dead-neighbor event.

use std::collections::HashMap;

use rina_core::{Millis, PortId};

use crate::neighbor::Neighbor;

/// Whether a neighbor can be skipped this period: it was heard from
/// recently enough.
pub fn heard_recently(last_heard_ms: u64, now_ms: u64, period_ms: Millis) -> bool {
    last_heard_ms + period_ms > now_ms
}

/// Whether a neighbor must be declared dead: it has been heard from at
/// least once, but not within the declared-dead interval.
pub fn is_dead(last_heard_ms: u64, now_ms: u64, dead_interval_ms: Millis) -> bool {
    last_heard_ms != 0 && last_heard_ms + dead_interval_ms < now_ms
}

/// What the watchdog decided for one neighbor this period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogAction {
    /// Probe the neighbor with a read of its address object.
    SendRead { name: String, port: PortId },
    /// The neighbor has not answered for too long.
    DeclareDead { name: String },
}

/// Liveness bookkeeping across watchdog periods.
#[derive(Debug)]
pub struct Watchdog {
    period_ms: Millis,
    dead_interval_ms: Millis,
    /// Probes awaiting a reply: neighbor name to probe send time.
    outstanding: HashMap<String, u64>,
}

impl Watchdog {
    pub fn new(period_ms: Millis, dead_interval_ms: Millis) -> Self {
        Self {
            period_ms,
            dead_interval_ms,
            outstanding: HashMap::new(),
        }
    }

    /// Run one period over the neighbor set, deciding per neighbor whether
    /// to probe, skip, or declare dead.
    pub fn tick<'a>(
        &mut self,
        neighbors: impl Iterator<Item = &'a Neighbor>,
        now_ms: u64,
    ) -> Vec<WatchdogAction> {
        self.outstanding.clear();
        let mut actions = Vec::new();
        for neighbor in neighbors {
            if !neighbor.enrolled {
                continue;
            }
            if heard_recently(neighbor.last_heard_from_ms, now_ms, self.period_ms) {
                continue;
            }
            if is_dead(neighbor.last_heard_from_ms, now_ms, self.dead_interval_ms) {
                tracing::warn!(neighbor = %neighbor.name, "neighbor declared dead");
                actions.push(WatchdogAction::DeclareDead {
                    name: neighbor.name.clone(),
                });
                continue;
            }
            self.outstanding.insert(neighbor.name.clone(), now_ms);
            actions.push(WatchdogAction::SendRead {
                name: neighbor.name.clone(),
                port: neighbor.underlying_port_id,
            });
        }
        actions
    }

    /// A probe reply arrived; returns the measured RTT when the probe was
    /// one of ours.
    pub fn on_read_response(&mut self, name: &str, now_ms: u64) -> Option<u64> {
        let sent_at = self.outstanding.remove(name)?;
        Some(now_ms.saturating_sub(sent_at))
    }

    /// Whether a probe to `name` is awaiting a reply.
    pub fn is_outstanding(&self, name: &str) -> bool {
        self.outstanding.contains_key(name)
    }
}
