use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use super::protocol::Protocol;
use super::sequence::{ACK_WINDOW, ack_offset, sequence_distance};

const HISTORY_LEN: usize = ACK_WINDOW as usize;

/// A sent wire message still waiting on an acknowledgement.
#[derive(Debug, Clone)]
pub struct InFlight {
    pub send_time: Instant,
    pub protocol: Protocol,
    pub payloads: Vec<Vec<u8>>,
}

/// Outcome of checking one in-flight message against an incoming ack.
#[derive(Debug)]
pub enum AckOutcome {
    Acknowledged { sequence: u32, rtt: Duration, message: InFlight },
    Lost { sequence: u32, message: InFlight },
}

#[derive(Debug, Default)]
pub struct SendLedger {
    in_flight: BTreeMap<u32, InFlight>,
}

impl SendLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, sequence: u32, message: InFlight) {
        self.in_flight.insert(sequence, message);
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    pub fn contains(&self, sequence: u32) -> bool {
        self.in_flight.contains_key(&sequence)
    }

    /// Removes every message sent more than `timeout` before `now`.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<(u32, InFlight)> {
        let expired: Vec<u32> = self
            .in_flight
            .iter()
            .filter(|(_, m)| now.saturating_duration_since(m.send_time) > timeout)
            .map(|(&sequence, _)| sequence)
            .collect();

        expired
            .into_iter()
            .filter_map(|sequence| self.in_flight.remove(&sequence).map(|m| (sequence, m)))
            .collect()
    }

    /// Settles in-flight messages against an incoming `ack`/`ack_bitfield`.
    ///
    /// Messages inside the window are acknowledged or lost according to their
    /// bit; messages that have fallen behind the window are lost. Messages newer
    /// than `ack` are left alone.
    pub fn process_ack(&mut self, ack: u32, ack_bitfield: u32, now: Instant) -> Vec<AckOutcome> {
        let settled: Vec<u32> = self
            .in_flight
            .keys()
            .copied()
            .filter(|&sequence| sequence_distance(ack, sequence) >= 0)
            .collect();

        let mut outcomes = Vec::with_capacity(settled.len());
        for sequence in settled {
            let Some(message) = self.in_flight.remove(&sequence) else {
                continue;
            };

            let acked = ack_offset(ack, sequence)
                .is_some_and(|offset| ack_bitfield & (1 << offset) != 0);

            if acked {
                let rtt = now.saturating_duration_since(message.send_time);
                outcomes.push(AckOutcome::Acknowledged {
                    sequence,
                    rtt,
                    message,
                });
            } else {
                outcomes.push(AckOutcome::Lost { sequence, message });
            }
        }

        outcomes
    }
}

/// Receive outcomes of the most recent remote sequences, newest last.
#[derive(Debug)]
pub struct ReceiveHistory {
    outcomes: VecDeque<bool>,
}

impl Default for ReceiveHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveHistory {
    pub fn new() -> Self {
        Self {
            outcomes: std::iter::repeat_n(false, HISTORY_LEN).collect(),
        }
    }

    pub fn push(&mut self, received: bool) {
        if self.outcomes.len() >= HISTORY_LEN {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(received);
    }

    /// Bit `k` describes the sequence `k` steps behind the newest entry.
    pub fn bitfield(&self) -> u32 {
        self.outcomes
            .iter()
            .rev()
            .take(HISTORY_LEN)
            .enumerate()
            .filter(|(_, received)| **received)
            .fold(0u32, |bits, (offset, _)| bits | (1 << offset))
    }

    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        self.outcomes.iter().copied()
    }
}

/// The most recent round-trip samples, averaged for flow control.
#[derive(Debug, Default)]
pub struct RttWindow {
    samples: VecDeque<Duration>,
}

impl RttWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, rtt: Duration) {
        if self.samples.len() >= HISTORY_LEN {
            self.samples.pop_front();
        }
        self.samples.push_back(rtt);
    }

    pub fn mean_ms(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let total: f64 = self.samples.iter().map(|s| s.as_secs_f64() * 1000.0).sum();
        total / self.samples.len() as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
