//! # Error Taxonomy
//!
//! A single closed error enum shared by every layer of the core: a
//! `thiserror` derive, one `#[error]` message per variant, and `#[from]`
//! for collaborator error types we don't want call sites to construct
//! by hand.

use crate::types::{Sqn, Tsi};

#[derive(Debug, thiserror::Error)]
pub enum PgmError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("transport is not bound")]
    NotBound,

    #[error("sqn {sqn} not in window [{trail}, {lead}]")]
    NotInWindow { sqn: u32, trail: u32, lead: u32 },

    #[error("malformed packet: {0}")]
    Malformed(String),

    #[error("checksum error")]
    ChecksumError,

    #[error("duplicate sqn {0}")]
    Duplicate(u32),

    #[error("rate limited")]
    RateLimited,

    #[error("would block")]
    WouldBlock,

    #[error("io error: {0}")]
    IoError(String),

    #[error("peer nla unknown for tsi {0}")]
    PeerUnknownNla(Tsi),

    #[error("apdu lost starting at sqn {0}")]
    ApduLost(Sqn),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl From<std::io::Error> for PgmError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::WouldBlock {
            PgmError::WouldBlock
        } else {
            PgmError::IoError(err.to_string())
        }
    }
}

pub type PgmResult<T> = Result<T, PgmError>;
