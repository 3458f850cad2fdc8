// Proof of Work search

use std::sync::atomic::{AtomicBool, Ordering};

use super::block::BlockHeader;

/// How many nonces are tried between two looks at the stop flag
const STOP_CHECK_INTERVAL: u64 = 4096;

/// Count leading zero bits of a digest
pub fn leading_zero_bits(digest: &[u8]) -> u32 {
    let mut zeros = 0;

    for byte in digest {
        if *byte == 0 {
            zeros += 8;
        } else {
            zeros += byte.leading_zeros();
            break;
        }
    }

    zeros
}

/// True when the header's digest has at least `difficulty` leading zero bits
pub fn meets_difficulty(header: &BlockHeader, difficulty: u32) -> bool {
    leading_zero_bits(&header.digest()) >= difficulty
}

/// Finds the first nonce, counting up from 0, whose header digest has at
/// least `difficulty` leading zero bits.
///
/// Blocks the calling thread until it succeeds. The nonce is also left set on
/// `header`.
pub fn search(header: &mut BlockHeader, difficulty: u32) -> u64 {
    let never = AtomicBool::new(false);
    // Only a raised stop flag yields None.
    search_until(header, difficulty, &never).unwrap_or(header.nonce)
}

/// Same enumeration as [`search`], but gives up with `None` once `stop` is
/// raised. The flag is looked at every few thousand nonces, so an abandoned
/// worker thread exits shortly after it is cancelled.
pub fn search_until(header: &mut BlockHeader, difficulty: u32, stop: &AtomicBool) -> Option<u64> {
    let mut nonce: u64 = 0;

    loop {
        header.nonce = nonce;
        if meets_difficulty(header, difficulty) {
            return Some(nonce);
        }

        nonce = nonce.wrapping_add(1);

        if nonce % STOP_CHECK_INTERVAL == 0 {
            if stop.load(Ordering::Relaxed) {
                return None;
            }
            if nonce % (STOP_CHECK_INTERVAL * 256) == 0 {
                log::trace!("PoW search at nonce {} for difficulty {}", nonce, difficulty);
            }
        }
    }
}
