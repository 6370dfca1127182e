/// Generate a random tower level in `0..=max_level`.
///
/// Instead of flipping a coin in a loop, draw a single random word and count
/// trailing one-bits: each trailing 1 is one successful coin flip, so level
/// `k` comes up with probability `2^-(k+1)` before clamping.
///
/// `fastrand` keeps per-thread generator state, so concurrent `try_lock`
/// calls never contend on a shared seed.
///
#[inline]
pub(crate) fn random_level(max_level: usize) -> usize {
    let bits = fastrand::u64(..);
    (bits.trailing_ones() as usize).min(max_level)
}
