//! Fragment reassembly
//!
//! Each connection keeps one [`Reassembler`] accumulating fragments
//! until a logical message is complete. Incomplete sets are bounded:
//! a newer message from the same sender supersedes an older pending
//! one, and a byte budget evicts the oldest pending set on overflow.
//! Evicted partial messages are dropped silently.

use std::collections::HashMap;

use tracing::{debug, warn};
use uuid::Uuid;

use super::notification::Notification;

struct Partial {
    fragments: Vec<Option<Notification>>,
    received: u32,
    bytes: usize,
    arrival: u64,
}

/// Reassembly table keyed by (sender id, sequence number)
pub struct Reassembler {
    pending: HashMap<(Uuid, u32), Partial>,
    pending_bytes: usize,
    budget: usize,
    arrivals: u64,
}

impl Reassembler {
    /// Create a reassembler with a byte budget for pending fragments
    pub fn new(budget: usize) -> Self {
        Self {
            pending: HashMap::new(),
            pending_bytes: 0,
            budget,
            arrivals: 0,
        }
    }

    /// Number of incomplete messages currently buffered
    pub fn pending_messages(&self) -> usize {
        self.pending.len()
    }

    /// Bytes currently buffered for incomplete messages
    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    /// Feed one notification; returns the complete notification once all
    /// fragments of its logical message have arrived
    pub fn add(&mut self, notification: Notification) -> Option<Notification> {
        if notification.fragment_count <= 1 {
            return Some(notification);
        }
        if notification.fragment_index >= notification.fragment_count {
            warn!(
                index = notification.fragment_index,
                count = notification.fragment_count,
                "Dropping fragment with out-of-range index"
            );
            return None;
        }

        let key = (notification.sender_id, notification.sequence_number);
        self.arrivals += 1;
        let arrival = self.arrivals;

        if !self.pending.contains_key(&key) {
            self.supersede(notification.sender_id);
            self.pending.insert(
                key,
                Partial {
                    fragments: (0..notification.fragment_count).map(|_| None).collect(),
                    received: 0,
                    bytes: 0,
                    arrival,
                },
            );
        }

        let complete = {
            // Entry exists by construction above
            let partial = self.pending.get_mut(&key)?;
            if partial.fragments.len() != notification.fragment_count as usize {
                warn!(
                    sender = %notification.sender_id,
                    sequence = notification.sequence_number,
                    "Dropping fragment with inconsistent fragment count"
                );
                return None;
            }
            let slot = &mut partial.fragments[notification.fragment_index as usize];
            if slot.is_some() {
                debug!(
                    sender = %notification.sender_id,
                    sequence = notification.sequence_number,
                    index = notification.fragment_index,
                    "Ignoring duplicate fragment"
                );
                return None;
            }
            let size = notification.payload.len();
            *slot = Some(notification);
            partial.received += 1;
            partial.bytes += size;
            self.pending_bytes += size;
            partial.received as usize == partial.fragments.len()
        };

        if complete {
            let partial = self.pending.remove(&key)?;
            self.pending_bytes -= partial.bytes;
            return assemble(partial);
        }

        self.enforce_budget();
        None
    }

    /// Drop all buffered fragments (connection teardown)
    pub fn clear(&mut self) {
        self.pending.clear();
        self.pending_bytes = 0;
    }

    /// A new message from a sender supersedes that sender's older
    /// pending messages
    fn supersede(&mut self, sender: Uuid) {
        let stale: Vec<_> = self
            .pending
            .keys()
            .filter(|(s, _)| *s == sender)
            .copied()
            .collect();
        for key in stale {
            if let Some(partial) = self.pending.remove(&key) {
                self.pending_bytes -= partial.bytes;
                debug!(
                    sender = %key.0,
                    sequence = key.1,
                    "Superseded incomplete fragment set dropped"
                );
            }
        }
    }

    fn enforce_budget(&mut self) {
        while self.pending_bytes > self.budget {
            let Some(oldest) = self
                .pending
                .iter()
                .min_by_key(|(_, partial)| partial.arrival)
                .map(|(key, _)| *key)
            else {
                break;
            };
            if let Some(partial) = self.pending.remove(&oldest) {
                self.pending_bytes -= partial.bytes;
                debug!(
                    sender = %oldest.0,
                    sequence = oldest.1,
                    "Evicted incomplete fragment set over byte budget"
                );
            }
        }
    }
}

/// Concatenate fragment payloads in index order into one notification
fn assemble(partial: Partial) -> Option<Notification> {
    let mut fragments = partial.fragments.into_iter().flatten();
    let mut first = fragments.next()?;
    for fragment in fragments {
        first.payload.extend_from_slice(&fragment.payload);
    }
    first.fragment_index = 0;
    first.fragment_count = 1;
    Some(first)
}
