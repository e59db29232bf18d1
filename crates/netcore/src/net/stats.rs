#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub packets_resent: u64,
    pub packets_compressed: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Payload bytes saved by compression.
    pub bytes_saved: u64,
    pub rtt_ms: f32,
    pub rtt_variance: f32,
}

impl NetworkStats {
    pub fn record_sent(&mut self, bytes: usize) {
        self.packets_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.packets_received += 1;
        self.bytes_received += bytes as u64;
    }

    pub fn compression_ratio(&self) -> f32 {
        let raw = self.bytes_sent + self.bytes_saved;
        if raw == 0 {
            return 1.0;
        }
        self.bytes_sent as f32 / raw as f32
    }

    pub fn merge(&mut self, other: &NetworkStats) {
        self.packets_sent += other.packets_sent;
        self.packets_received += other.packets_received;
        self.packets_lost += other.packets_lost;
        self.packets_resent += other.packets_resent;
        self.packets_compressed += other.packets_compressed;
        self.bytes_sent += other.bytes_sent;
        self.bytes_received += other.bytes_received;
        self.bytes_saved += other.bytes_saved;
    }
}
