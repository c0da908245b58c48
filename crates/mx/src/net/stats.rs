#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub probes_answered: u64,
    pub messages_lost: u64,
    pub corrupt_messages: u64,
}

impl NetworkStats {
    pub fn record_sent(&mut self, bytes: usize) {
        self.datagrams_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.datagrams_received += 1;
        self.bytes_received += bytes as u64;
    }

    /// Percentage of sent messages reported lost.
    pub fn loss_percent(&self) -> f32 {
        if self.datagrams_sent == 0 {
            return 0.0;
        }
        self.messages_lost as f32 / self.datagrams_sent as f32 * 100.0
    }
}
