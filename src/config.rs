//! Runtime configuration: plain, `Default`-backed structs for the
//! reactor, multiplexer, rate-limit policy, and async data-I/O (§4.12).
//! No CLI or environment-variable parsing lives here; that remains the
//! embedding application's concern (§6).

use crate::mux::MultiplexerBackendKind;
use std::time::Duration;

/// Knobs for [`crate::reactor::ReflectServer`] (§4.12).
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Default stall limit applied to sessions that don't set their own
    /// (§4.8 step 8).
    pub default_stall_limit: Duration,
    /// Outgoing-queue byte threshold above which a session is dumped
    /// during the OOM check (§4.8 step 6).
    pub oom_queue_size_threshold: usize,
    /// Upper bound on how long `wait_for_events` may block even with no
    /// pulsable object requesting an earlier wakeup.
    pub pulse_granularity: Duration,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        ReactorConfig {
            default_stall_limit: Duration::from_secs(20),
            oom_queue_size_threshold: 5 * 1024 * 1024,
            pulse_granularity: Duration::from_millis(250),
        }
    }
}

/// Explicit backend override for [`crate::mux::SocketMultiplexer`]
/// (§4.12). `None` keeps the most-capable-per-platform default.
#[derive(Debug, Clone, Default)]
pub struct MultiplexerConfig {
    pub backend_override: Option<MultiplexerBackendKind>,
}

/// Knobs for [`crate::policy::RateLimitPolicy`] (§4.12).
#[derive(Debug, Clone)]
pub struct RateLimitPolicyConfig {
    pub bytes_per_cycle: usize,
}

impl Default for RateLimitPolicyConfig {
    fn default() -> Self {
        RateLimitPolicyConfig {
            bytes_per_cycle: 64 * 1024,
        }
    }
}

/// Knobs for [`crate::dataio::AsyncDataIo`]'s worker-thread channel
/// (§4.12).
#[derive(Debug, Clone)]
pub struct AsyncDataIoConfig {
    /// Reserved for a future bounded-channel variant; the current
    /// implementation uses an unbounded `crossbeam-channel` queue
    /// (§4.5, §10) so this has no effect yet.
    pub command_channel_depth: usize,
}

impl Default for AsyncDataIoConfig {
    fn default() -> Self {
        AsyncDataIoConfig {
            command_channel_depth: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let reactor = ReactorConfig::default();
        assert!(reactor.default_stall_limit > Duration::ZERO);
        assert!(reactor.oom_queue_size_threshold > 0);

        let mux = MultiplexerConfig::default();
        assert!(mux.backend_override.is_none());

        let policy = RateLimitPolicyConfig::default();
        assert!(policy.bytes_per_cycle > 0);
    }
}
