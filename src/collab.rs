//! # Injected Collaborator Interfaces
//!
//! The core never opens a socket, runs a Reed–Solomon codec, rate-limits
//! a send, reads a clock or draws a random number itself: every one of
//! those is a narrow trait implemented by the caller's environment. This
//! keeps the protocol state machines deterministic and unit-testable
//! without touching real I/O, the same way the bonding runtime in this
//! codebase's lineage keeps its link transport behind a trait boundary.

use bytes::Bytes;
use quanta::Instant;

use crate::error::PgmError;
use crate::types::Nla;

/// Datagram I/O: read/write with source/destination NLAs attached. A real
/// implementation wraps a multicast UDP socket and handles group join,
/// interface binding and IP-header stripping — none of which the core
/// touches.
pub trait PacketIo: Send + Sync {
    fn send_to(&self, buf: &[u8], dst: Nla, router_alert: bool, no_reply_expected: bool) -> Result<usize, PgmError>;
    fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Nla), PgmError>;
}

/// Forward-error-correction codec: Reed–Solomon (or any systematic code)
/// over opaque blocks. The core only ever calls these two methods.
pub trait FecCodec: Send + Sync {
    /// Produce `h` parity blocks from `k` equally-sized data blocks.
    fn encode(&self, data_blocks: &[Bytes], h: usize) -> Result<Vec<Bytes>, PgmError>;

    /// Reconstruct the full `k`-block group given a slice where erased
    /// blocks (both data and parity) are `None`.
    fn decode(&self, blocks: &[Option<Bytes>], k: usize) -> Result<Vec<Bytes>, PgmError>;
}

/// Token-bucket style admission control for outgoing sends.
pub trait RateLimiter: Send + Sync {
    fn check(&self, len: usize) -> Result<(), PgmError>;
}

/// Monotonic clock, overridable in tests for deterministic timer-engine
/// unit tests (real NAK back-off uniformity needs wall-clock variance;
/// state-machine transition tests need a clock they can step by hand).
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Default `Clock` backed by `quanta`.
pub struct QuantaClock(quanta::Clock);

impl QuantaClock {
    pub fn new() -> Self {
        QuantaClock(quanta::Clock::new())
    }
}

impl Default for QuantaClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for QuantaClock {
    fn now(&self) -> Instant {
        self.0.now()
    }
}

/// Uniform random source for NAK back-off draws, overridable so invariant
/// #4's uniformity property and deterministic unit tests can supply a
/// fixed or recorded sequence instead of `rand`'s thread-local generator.
pub trait RandomSource: Send + Sync {
    /// Uniform draw in `[0, bound)`. `bound == 0` must return 0.
    fn uniform_u32(&self, bound: u32) -> u32;
}

/// Default `RandomSource` backed by `rand`.
#[derive(Default)]
pub struct ThreadRandomSource;

impl RandomSource for ThreadRandomSource {
    fn uniform_u32(&self, bound: u32) -> u32 {
        if bound == 0 {
            return 0;
        }
        use rand::Rng;
        rand::rng().random_range(0..bound)
    }
}
