//! Duplicate suppression for unordered messages.
//!
//! Messages carry their own sequence numbers and may arrive in any order, so
//! the receiver remembers which sequences it already delivered. Everything
//! below a cumulative floor has been delivered; a bitfield records delivered
//! sequences in the window just above it. A sequence beyond the window cannot
//! be judged yet and is left unacknowledged for the sender to retransmit.

use crate::core::DUPLICATE_WINDOW_SIZE;

const WORDS: usize = DUPLICATE_WINDOW_SIZE / 64;

/// Verdict on an inbound message sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqCheck {
    /// First arrival; deliver and acknowledge.
    Fresh,
    /// Already delivered; acknowledge again but do not deliver.
    Duplicate,
    /// Too far ahead of the floor to track; neither deliver nor acknowledge.
    Ahead,
}

/// Sliding window over received message sequence numbers.
#[derive(Debug, Clone)]
pub struct SeqWindow {
    /// Lowest sequence not yet delivered.
    floor: u32,
    /// Bit i set = sequence `floor + i` delivered. Bit 0 is always clear.
    window: [u64; WORDS],
}

impl Default for SeqWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl SeqWindow {
    /// Window size in bits.
    pub const WINDOW_SIZE: usize = DUPLICATE_WINDOW_SIZE;

    /// Create an empty window.
    pub fn new() -> Self {
        Self {
            floor: 0,
            window: [0; WORDS],
        }
    }

    /// Lowest sequence not yet delivered.
    pub fn floor(&self) -> u32 {
        self.floor
    }

    /// Classify a sequence, marking it delivered if it is fresh.
    pub fn check_and_mark(&mut self, seq: u32) -> SeqCheck {
        if seq < self.floor {
            return SeqCheck::Duplicate;
        }

        let offset = (seq - self.floor) as usize;
        if offset >= Self::WINDOW_SIZE {
            return SeqCheck::Ahead;
        }

        let mask = 1u64 << (offset % 64);
        let word = &mut self.window[offset / 64];
        if *word & mask != 0 {
            return SeqCheck::Duplicate;
        }
        *word |= mask;

        if offset == 0 {
            self.advance();
        }
        SeqCheck::Fresh
    }

    /// Move the floor past the delivered run at the bottom of the window.
    fn advance(&mut self) {
        let mut run = 0;
        for word in &self.window {
            let ones = word.trailing_ones() as usize;
            run += ones;
            if ones < 64 {
                break;
            }
        }

        self.floor = self.floor.wrapping_add(run as u32);
        self.shift_down(run);
    }

    /// Drop the lowest `shift` bits of the window.
    fn shift_down(&mut self, shift: usize) {
        if shift >= Self::WINDOW_SIZE {
            self.window = [0; WORDS];
            return;
        }

        let word_shift = shift / 64;
        let bit_shift = shift % 64;

        if word_shift > 0 {
            for i in 0..WORDS {
                self.window[i] = if i + word_shift < WORDS {
                    self.window[i + word_shift]
                } else {
                    0
                };
            }
        }

        if bit_shift > 0 {
            for i in 0..WORDS {
                let high = if i + 1 < WORDS {
                    self.window[i + 1] << (64 - bit_shift)
                } else {
                    0
                };
                self.window[i] = (self.window[i] >> bit_shift) | high;
            }
        }
    }
}
