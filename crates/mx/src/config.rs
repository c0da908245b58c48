use std::time::Duration;

use crate::net::SAFE_DATAGRAM_SIZE;

/// Tunables shared by the dispatcher and every session it creates.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Ticks without an inbound datagram before the session is dropped.
    pub disconnect_limit: u32,
    /// Ticks without an inbound datagram before warnings are raised.
    pub disconnect_warning_limit: u32,
    /// Unacknowledged messages older than this are declared lost.
    pub message_timeout: Duration,
    pub good_send_rate: u32,
    pub bad_send_rate: u32,
    pub rtt_threshold_ms: f64,
    pub initial_penalty_secs: f64,
    pub max_penalty_secs: f64,
    pub min_penalty_secs: f64,
    pub penalty_reduction_secs: f64,
    pub safe_datagram_size: usize,
    pub receive_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            disconnect_limit: 900,
            disconnect_warning_limit: 30,
            message_timeout: Duration::from_millis(1000),
            good_send_rate: 20,
            bad_send_rate: 10,
            rtt_threshold_ms: 250.0,
            initial_penalty_secs: 4.0,
            max_penalty_secs: 60.0,
            min_penalty_secs: 1.0,
            penalty_reduction_secs: 10.0,
            safe_datagram_size: SAFE_DATAGRAM_SIZE,
            receive_buffer_size: 64 * 1024,
        }
    }
}

impl TransportConfig {
    pub fn send_interval(&self, good: bool) -> Duration {
        let rate = if good {
            self.good_send_rate
        } else {
            self.bad_send_rate
        };
        Duration::from_secs_f64(1.0 / rate.max(1) as f64)
    }
}
