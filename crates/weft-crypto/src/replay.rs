//! Anti-replay window for datagram sequence numbers.
//!
//! Sequence numbers are grouped into aligned blocks of [`REPLAY_WINDOW`].
//! The detector remembers two adjacent blocks: the current one (containing
//! the highest accepted number) and the one before it. A number in either
//! block is accepted once; a number below the previous block is rejected
//! outright; a number beyond the current block slides the window forward,
//! keeping the old current block as previous only when the two are adjacent.
//! Memory stays fixed no matter how large the gaps caused by packet loss.

use crate::error::CryptoError;

/// Width of one replay block, in sequence numbers.
pub const REPLAY_WINDOW: u64 = 1024;

const WORDS: usize = (REPLAY_WINDOW / 64) as usize;

type Bitmap = [u64; WORDS];

/// Sliding two-block replay detector.
#[derive(Debug, Clone)]
pub struct ReplayWindow {
    current_base: Option<u64>,
    current: Bitmap,
    previous: Bitmap,
}

const fn block_base(seq: u64) -> u64 {
    seq & !(REPLAY_WINDOW - 1)
}

const fn bit_position(seq: u64) -> (usize, u64) {
    let offset = seq & (REPLAY_WINDOW - 1);
    ((offset / 64) as usize, 1 << (offset % 64))
}

impl ReplayWindow {
    /// Creates an empty window; the first sequence number seen anchors it.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            current_base: None,
            current: [0; WORDS],
            previous: [0; WORDS],
        }
    }

    /// Returns the base of the current block, if any number was accepted.
    #[must_use]
    pub const fn current_base(&self) -> Option<u64> {
        self.current_base
    }

    /// Checks whether `seq` would be accepted, without recording it.
    pub fn check(&self, seq: u64) -> Result<(), CryptoError> {
        let Some(current_base) = self.current_base else {
            return Ok(());
        };
        let base = block_base(seq);
        let (word, mask) = bit_position(seq);
        let seen = if base > current_base {
            false
        } else if base == current_base {
            self.current[word] & mask != 0
        } else if base + REPLAY_WINDOW == current_base {
            self.previous[word] & mask != 0
        } else {
            true
        };
        if seen { Err(CryptoError::Replay(seq)) } else { Ok(()) }
    }

    /// Accepts `seq` and records it, sliding the window if needed.
    pub fn accept(&mut self, seq: u64) -> Result<(), CryptoError> {
        self.check(seq)?;
        let base = block_base(seq);
        match self.current_base {
            None => self.current_base = Some(base),
            Some(current_base) if base > current_base => {
                self.previous = if base - current_base == REPLAY_WINDOW {
                    self.current
                } else {
                    [0; WORDS]
                };
                self.current = [0; WORDS];
                self.current_base = Some(base);
            }
            Some(_) => {}
        }

        let (word, mask) = bit_position(seq);
        if Some(base) == self.current_base {
            self.current[word] |= mask;
        } else {
            self.previous[word] |= mask;
        }
        Ok(())
    }
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}
