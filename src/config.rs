//! Configuration for the transport.

use std::fmt;
use std::rc::Rc;
use std::time::Instant;

/// Source of the cycle timestamps used for retransmit and session timeouts.
///
/// The default clock reports monotonic nanoseconds since process start.
/// Tests install their own clock to drive timeouts deterministically.
#[derive(Clone)]
pub struct CycleClock(Rc<dyn Fn() -> u64>);

impl CycleClock {
    /// Create a clock from an arbitrary cycle counter.
    pub fn new<F: Fn() -> u64 + 'static>(f: F) -> Self {
        CycleClock(Rc::new(f))
    }

    /// Read the current cycle count.
    #[inline]
    pub fn now(&self) -> u64 {
        (self.0)()
    }
}

impl Default for CycleClock {
    fn default() -> Self {
        static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
        CycleClock(Rc::new(|| {
            let start = START.get_or_init(Instant::now);
            start.elapsed().as_nanos() as u64
        }))
    }
}

impl fmt::Debug for CycleClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CycleClock")
    }
}

/// Transport configuration.
///
/// Controls channel multiplexing, the send window, ACK cadence, and the two
/// timeout levels (per-fragment retransmit and aggregate session).
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Number of channels a server session allocates and announces in
    /// session open responses.
    /// Default: 8
    pub num_channels_per_session: u8,
    /// Maximum number of announced channels a client will actually use.
    /// Default: 8
    pub max_channels_per_session: u8,
    /// Maximum number of in-flight unacknowledged fragments per message.
    /// Default: 10
    pub window_size: u32,
    /// A sender requests an ACK every this many data fragments.
    /// Default: 5
    pub req_ack_after: u32,
    /// Cycles after the last send of a fragment before it is presumed lost.
    /// Default: 10 ms at nanosecond resolution.
    pub timeout_cycles: u64,
    /// Cycles of session inactivity before the session is torn down.
    /// Default: 1 hour at nanosecond resolution.
    pub session_timeout_cycles: u64,
    /// Cycle counter used for all timeout decisions.
    pub clock: CycleClock,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            num_channels_per_session: 8,
            max_channels_per_session: 8,
            window_size: 10,
            req_ack_after: 5,
            timeout_cycles: 10_000_000,
            session_timeout_cycles: 3_600_000_000_000,
            clock: CycleClock::default(),
        }
    }
}

impl TransportConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of channels a server session allocates.
    pub fn with_num_channels(mut self, num_channels: u8) -> Self {
        self.num_channels_per_session = num_channels;
        self
    }

    /// Set the maximum number of channels a client session will use.
    pub fn with_max_channels(mut self, max_channels: u8) -> Self {
        self.max_channels_per_session = max_channels;
        self
    }

    /// Set the send window size.
    pub fn with_window_size(mut self, window_size: u32) -> Self {
        self.window_size = window_size;
        self
    }

    /// Set the ACK request cadence.
    pub fn with_req_ack_after(mut self, req_ack_after: u32) -> Self {
        self.req_ack_after = req_ack_after;
        self
    }

    /// Set the per-fragment retransmit timeout.
    pub fn with_timeout_cycles(mut self, timeout_cycles: u64) -> Self {
        self.timeout_cycles = timeout_cycles;
        self
    }

    /// Set the aggregate session timeout.
    pub fn with_session_timeout_cycles(mut self, session_timeout_cycles: u64) -> Self {
        self.session_timeout_cycles = session_timeout_cycles;
        self
    }

    /// Set the cycle clock.
    pub fn with_clock(mut self, clock: CycleClock) -> Self {
        self.clock = clock;
        self
    }
}
