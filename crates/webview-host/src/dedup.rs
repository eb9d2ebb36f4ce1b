//! Byte-level change detection for captured stills.

const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a over the whole buffer.
pub fn fingerprint(data: &[u8]) -> u32 {
    data.iter().fold(FNV_OFFSET, |hash, &b| {
        (hash ^ b as u32).wrapping_mul(FNV_PRIME)
    })
}

/// Remembers the fingerprint of the last processed still.
#[derive(Debug, Default)]
pub struct DedupGate {
    last: Option<u32>,
}

impl DedupGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when `hash` matches the last recorded still.
    pub fn is_duplicate(&self, hash: u32) -> bool {
        self.last == Some(hash)
    }

    /// Record a still as processed. Call only once the frame went through,
    /// so a failed decode is retried on the next identical capture.
    pub fn record(&mut self, hash: u32) {
        self.last = Some(hash);
    }

    #[cfg(test)]
    pub fn reset(&mut self) {
        self.last = None;
    }
}
