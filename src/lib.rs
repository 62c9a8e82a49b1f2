//! # pgm-core
//!
//! Core protocol engine for Pragmatic General Multicast (RFC 3208):
//! NAK-based reliable one-to-many multicast with optional proactive/
//! on-demand Reed–Solomon parity. This crate is transport-agnostic — it
//! never opens a socket, runs a FEC codec, or reads a clock itself; all
//! of those are injected through the traits in [`collab`]. Callers own
//! the actual multicast UDP socket and drive [`transport::Transport`]
//! from their own I/O loop.
//!
//! ## Crate structure
//!
//! - [`types`] — TSI, NLA, serial-number sequence arithmetic
//! - [`wire`] — PGM header, TLV option chain, checksum
//! - [`parser`] — packet decode and routing-table acceptance predicates
//! - [`sender`] — APDU segmentation and ODATA/RDATA/NCF/SPM/SPMR encoding
//! - [`receiver`] — SPM application, NAK batching and encoding
//! - [`txw`] — transmit window and retransmit queue
//! - [`rxw`] — receive window and NAK state machine
//! - [`peer`] — per-sender receive-side state and expiry
//! - [`fec`] — transmission-group parity framing around an injected codec
//! - [`timer`] — SPM ambient/heartbeat cadence scheduling
//! - [`pool`] — slab-based buffer recycling for `PacketIo` implementors
//! - [`stats`] — cumulative sender/receiver/peer counters
//! - [`collab`] — injected collaborator traits (`PacketIo`, `FecCodec`,
//!   `RateLimiter`, `Clock`, `RandomSource`)
//! - [`error`] — the crate's single closed error enum
//! - [`transport`] — the control surface: `TransportConfig` and `Transport`

pub mod collab;
pub mod error;
pub mod fec;
pub mod parser;
pub mod peer;
pub mod pool;
pub mod receiver;
pub mod rxw;
pub mod sender;
pub mod stats;
pub mod timer;
pub mod transport;
pub mod txw;
pub mod types;
pub mod wire;

pub use error::{PgmError, PgmResult};
pub use transport::{Transport, TransportConfig};
pub use types::{Gsi, Nla, Sqn, Tsi};
