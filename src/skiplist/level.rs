//! Node height selection shared by both skip list variants.
//!
//! Grounded in `stk::coin_flip_level_selector`: flip a fair coin per
//! level instead of drawing from a per-level probability table
//! (`skip_list_level_selector`). The original itself documents the
//! coin-flip path as the one its own threaded skip list variants prefer —
//! see `DESIGN.md`'s Open Question resolution for why this crate follows
//! suit over the probability-table alternative.

use crate::util::rng::with_thread_rng;

/// The largest level index a node may reach (`MAXH - 1`, `MAXH = 64`).
pub const MAX_LEVEL: usize = 63;

/// Draws a node height in `0..=max_level` via repeated coin flips: level
/// `0` with probability 1/2, each further level geometrically less
/// likely, clamped at `max_level`.
#[must_use]
pub fn coin_flip_level(max_level: usize) -> usize {
  with_thread_rng(|rng| {
    let bits: u64 = rng.next_u64();
    if bits & 1 != 0 {
      return 0;
    }
    let mut level: usize = 1;
    let mut shifted: u64 = bits >> 1;
    while shifted & 1 != 0 && level < max_level {
      level += 1;
      shifted >>= 1;
    }
    level
  })
}
