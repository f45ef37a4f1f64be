//! Sequence number pool
//!
//! Sequence numbers come from one byte; the two top values are kept out of
//! circulation. Numbers are handed out round-robin so a late reply to a
//! finished command is unlikely to match the next one.

/// Highest sequence number handed out
pub const MAX_SEQ: u8 = 0xFD;

/// Pool of sequence numbers for one device
#[derive(Debug, Clone)]
pub struct SequencePool {
    in_use: [u64; 4],
    next: u8,
    count: usize,
}

impl Default for SequencePool {
    fn default() -> Self {
        Self::new()
    }
}

impl SequencePool {
    /// Create an empty pool
    pub const fn new() -> Self {
        Self {
            in_use: [0; 4],
            next: 0,
            count: 0,
        }
    }

    const fn bit(seq: u8) -> (usize, u64) {
        ((seq / 64) as usize, 1 << (seq % 64))
    }

    /// Whether `seq` is currently handed out
    pub const fn contains(&self, seq: u8) -> bool {
        let (word, mask) = Self::bit(seq);
        self.in_use[word] & mask != 0
    }

    /// Number of sequence numbers handed out
    pub const fn in_use(&self) -> usize {
        self.count
    }

    /// Take a free sequence number, `None` if all are in use
    pub fn acquire(&mut self) -> Option<u8> {
        for _ in 0..=MAX_SEQ as usize {
            let seq = self.next;
            self.next = if seq >= MAX_SEQ { 0 } else { seq + 1 };
            if !self.contains(seq) {
                let (word, mask) = Self::bit(seq);
                self.in_use[word] |= mask;
                self.count += 1;
                return Some(seq);
            }
        }
        None
    }

    /// Return a sequence number to the pool
    pub fn release(&mut self, seq: u8) {
        if self.contains(seq) {
            let (word, mask) = Self::bit(seq);
            self.in_use[word] &= !mask;
            self.count -= 1;
        }
    }
}
