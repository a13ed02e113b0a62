//! I/O policy: an optional per-cycle rate/quota limiter a session may
//! share with other sessions (§4.9).

use std::time::{Duration, Instant};

/// Opaque identifier for whatever object (typically a session) is asking
/// a policy for permission. Policies key their per-holder accounting off
/// this.
pub type HolderId = u64;

/// Consulted by the reactor once per event cycle per session that
/// references it (§4.9).
pub trait IoPolicy: Send {
    /// Whether `holder` should be registered for I/O at all this cycle.
    fn okay_to_transfer(&mut self, holder: HolderId, now: Instant) -> bool;

    /// The maximum number of bytes `holder` may move this cycle. Called
    /// only if `okay_to_transfer` returned true.
    fn get_max_transfer_chunk_size(&mut self, holder: HolderId) -> usize;

    /// Reports that `holder` moved `n` bytes this cycle.
    fn bytes_transferred(&mut self, holder: HolderId, n: usize);

    /// Resets per-cycle accounting; called once per cycle after I/O.
    fn end_io(&mut self, now: Instant);

    /// Optional hook called once per cycle before any `okay_to_transfer`
    /// checks, mirroring `end_io`'s per-cycle reset (§4.8 step 4).
    fn begin_io(&mut self, _now: Instant) {}

    /// The next absolute time this policy wants the event loop to wake
    /// it, e.g. when a rate-limit window rolls over. `None` means "no
    /// opinion".
    fn get_pulse_time(&self, _previous: Option<Instant>) -> Option<Instant> {
        None
    }
}

/// A simple bytes-per-cycle cap shared by every holder that references
/// it: each cycle, every holder may move up to `bytes_per_cycle` bytes in
/// total combined across all holders using this policy instance (§4.9,
/// §8 scenario 5 uses one policy per session with its own cap, which is
/// the degenerate single-holder case of this same mechanism).
pub struct RateLimitPolicy {
    bytes_per_cycle: usize,
    remaining_this_cycle: usize,
}

impl RateLimitPolicy {
    pub fn new(bytes_per_cycle: usize) -> Self {
        RateLimitPolicy {
            bytes_per_cycle,
            remaining_this_cycle: bytes_per_cycle,
        }
    }
}

impl IoPolicy for RateLimitPolicy {
    fn okay_to_transfer(&mut self, _holder: HolderId, _now: Instant) -> bool {
        self.remaining_this_cycle > 0
    }

    fn get_max_transfer_chunk_size(&mut self, _holder: HolderId) -> usize {
        self.remaining_this_cycle
    }

    fn bytes_transferred(&mut self, _holder: HolderId, n: usize) {
        self.remaining_this_cycle = self.remaining_this_cycle.saturating_sub(n);
    }

    fn end_io(&mut self, _now: Instant) {
        self.remaining_this_cycle = self.bytes_per_cycle;
    }

    fn get_pulse_time(&self, previous: Option<Instant>) -> Option<Instant> {
        previous.map(|p| p + Duration::from_millis(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_policy_caps_bytes_per_cycle() {
        let mut policy = RateLimitPolicy::new(1024);
        let now = Instant::now();
        assert!(policy.okay_to_transfer(1, now));
        assert_eq!(policy.get_max_transfer_chunk_size(1), 1024);
        policy.bytes_transferred(1, 1024);
        assert!(!policy.okay_to_transfer(1, now));
        policy.end_io(now);
        assert!(policy.okay_to_transfer(1, now));
        assert_eq!(policy.get_max_transfer_chunk_size(1), 1024);
    }

    #[test]
    fn ten_kb_burst_over_ten_cycles_delivers_exactly_ten_kb_no_single_cycle_over_cap() {
        let mut policy = RateLimitPolicy::new(1024);
        let now = Instant::now();
        let mut total_delivered = 0usize;
        let burst = 10 * 1024usize;
        for _ in 0..10 {
            policy.begin_io(now);
            if !policy.okay_to_transfer(1, now) {
                policy.end_io(now);
                continue;
            }
            let cap = policy.get_max_transfer_chunk_size(1);
            let remaining_in_burst = burst - total_delivered;
            let moved = cap.min(remaining_in_burst);
            assert!(moved <= 1024);
            policy.bytes_transferred(1, moved);
            total_delivered += moved;
            policy.end_io(now);
        }
        assert_eq!(total_delivered, burst);
    }
}
