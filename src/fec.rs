//! # FEC Integration
//!
//! Orchestrates transmission-group assembly around the injected
//! [`FecCodec`](crate::collab::FecCodec): building the `k` data blocks
//! for a proactive or on-demand parity request, and substituting a
//! reconstructed block back into the receive window. The core never
//! touches Reed–Solomon math directly — only block framing, the
//! variable-packet-length padding/length-trailer convention, and the
//! OPT_FRAGMENT parity-stripe convention described in the wire section.

use bytes::{Bytes, BytesMut};

use crate::collab::FecCodec;
use crate::error::PgmError;
use crate::types::Sqn;
use crate::wire::OptFragment;

/// FEC configuration for a transport: `rs_k` data blocks per transmission
/// group, `rs_n` total blocks (so `h = rs_n - rs_k` parity blocks).
#[derive(Debug, Clone, Copy)]
pub struct FecConfig {
    pub rs_n: u32,
    pub rs_k: u32,
    pub tg_sqn_shift: u32,
    pub use_proactive_parity: bool,
    pub use_ondemand_parity: bool,
    pub use_varpkt_len: bool,
}

impl FecConfig {
    pub fn h(&self) -> u32 {
        self.rs_n - self.rs_k
    }

    pub fn validate(&self) -> Result<(), PgmError> {
        if !(2..=128).contains(&self.rs_k) || !self.rs_k.is_power_of_two() {
            return Err(PgmError::InvalidArgument(
                "rs_k must be a power of two in [2, 128]".into(),
            ));
        }
        if self.rs_n <= self.rs_k || self.rs_n > 255 {
            return Err(PgmError::InvalidArgument(
                "rs_n must be in [rs_k + 1, 255]".into(),
            ));
        }
        let group_size = 1u64 << self.tg_sqn_shift.min(32);
        if self.tg_sqn_shift > 31 || group_size < self.rs_n as u64 {
            return Err(PgmError::InvalidArgument(
                "tg_sqn_shift must cover all rs_n blocks of a transmission group".into(),
            ));
        }
        if self.rs_k > 223 {
            let h = self.h();
            if (h as f64) / (self.rs_k as f64) < 1.0 / (self.rs_k as f64 / 223.0) {
                return Err(PgmError::InvalidArgument(
                    "insufficient parity ratio for rs_k > 223".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Pad each block in a transmission group to the group's max length when
/// variable packet length is in effect, appending the true length as a
/// trailing 16-bit word, per the OPT_VAR_PKTLEN convention.
fn pad_group_varpkt(blocks: &[Bytes]) -> Vec<Bytes> {
    let max_len = blocks.iter().map(|b| b.len()).max().unwrap_or(0);
    blocks
        .iter()
        .map(|b| {
            let mut padded = BytesMut::with_capacity(max_len + 2);
            padded.extend_from_slice(b);
            padded.resize(max_len, 0);
            padded.extend_from_slice(&(b.len() as u16).to_be_bytes());
            padded.freeze()
        })
        .collect()
}

fn strip_varpkt(blocks: Vec<Bytes>) -> Result<Vec<Bytes>, PgmError> {
    blocks
        .into_iter()
        .map(|b| {
            if b.len() < 2 {
                return Err(PgmError::Malformed("var_pktlen block too short".into()));
            }
            let len = u16::from_be_bytes([b[b.len() - 2], b[b.len() - 1]]) as usize;
            if len > b.len() - 2 {
                return Err(PgmError::Malformed("var_pktlen trailing length out of range".into()));
            }
            Ok(b.slice(0..len))
        })
        .collect()
}

/// Encode `h` parity blocks for a transmission group of `k` original data
/// blocks (some of which may be missing when called for an on-demand
/// repair of an already-partial group held in the TXW).
pub fn encode_parity(
    codec: &dyn FecCodec,
    cfg: &FecConfig,
    group: &[Option<Bytes>],
    h: u32,
) -> Result<Vec<Bytes>, PgmError> {
    let present: Vec<Bytes> = group
        .iter()
        .cloned()
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| PgmError::Fatal("cannot encode parity for an incomplete group".into()))?;
    let blocks = if cfg.use_varpkt_len {
        pad_group_varpkt(&present)
    } else {
        present
    };
    codec.encode(&blocks, h as usize)
}

/// Reconstruct a transmission group's data blocks given erasures, using
/// the injected codec's systematic decode.
pub fn decode_group(
    codec: &dyn FecCodec,
    cfg: &FecConfig,
    blocks: &[Option<Bytes>],
) -> Result<Vec<Bytes>, PgmError> {
    let reconstructed = codec.decode(blocks, cfg.rs_k as usize)?;
    if cfg.use_varpkt_len {
        strip_varpkt(reconstructed)
    } else {
        Ok(reconstructed)
    }
}

/// Encode the parallel Reed–Solomon stripe over each group member's
/// OPT_FRAGMENT payload (or the "encoded null" sentinel for members with
/// no fragment option), per the design note on OPT_FRAGMENT-on-parity.
pub fn encode_fragment_stripe(
    codec: &dyn FecCodec,
    fragments: &[Option<OptFragment>],
    h: u32,
) -> Result<Vec<Bytes>, PgmError> {
    let blocks: Vec<Bytes> = fragments
        .iter()
        .map(|f| {
            let mut buf = BytesMut::with_capacity(OptFragment::PAYLOAD_LEN);
            match f {
                Some(frag) => frag.encode(&mut buf),
                None => buf.extend_from_slice(&OptFragment::null_sentinel()),
            }
            buf.freeze()
        })
        .collect();
    codec.encode(&blocks, h as usize)
}

/// Identify the transmission group a SQN belongs to and its base.
pub fn group_of(sqn: Sqn, tg_sqn_shift: u32) -> Sqn {
    sqn.tg_base(tg_sqn_shift)
}
