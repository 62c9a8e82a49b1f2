//! # Peer Table
//!
//! Per-sender state for a receiving transport: TSI identity, NLAs needed
//! to route NAKs and SPMRs, peer-reported FEC parameters, expiry, and the
//! peer's own RXW. Peers are created lazily on first downstream packet
//! from an unknown TSI and dropped by the timer engine once `expiry`
//! passes, per invariant #9.

use std::sync::Mutex;
use std::time::Duration;

use quanta::Instant;

use crate::rxw::{NakTiming, Rxw};
use crate::types::{Nla, Tsi};

/// Peer-reported FEC parameters, learned from a source's SPM OPT_PARITY_PRM.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerFecParams {
    pub parity_prm_tgs: Option<u32>,
    pub proactive: bool,
    pub on_demand: bool,
}

/// Mutable per-peer state, guarded by `peer.mutex` in the lock hierarchy
/// (acquired only after `transport.peers_lock`, never before).
pub struct PeerRxState {
    pub rxw: Rxw,
    pub fec: PeerFecParams,
    pub last_spm_sqn: Option<u32>,
    pub spm_trail: u32,
    pub spm_lead: u32,
}

/// One entry in the receive-side peer table.
pub struct Peer {
    pub tsi: Tsi,
    /// Unicast NLA to address NAKs/SPMRs to; `None` until learned from the
    /// first packet or an SPM.
    pub unicast_nla: Option<Nla>,
    pub group_nla: Option<Nla>,
    pub local_nla: Option<Nla>,
    pub expiry: Mutex<Instant>,
    /// `None` == armed/already sent; `Some` == waiting to fire.
    pub spmr_expiry: Mutex<Option<Instant>>,
    pub state: Mutex<PeerRxState>,
}

impl Peer {
    pub fn new(
        tsi: Tsi,
        unicast_nla: Option<Nla>,
        group_nla: Option<Nla>,
        local_nla: Option<Nla>,
        now: Instant,
        peer_expiry: Duration,
        spmr_expiry_ivl: Duration,
        rxw_sqns: u32,
        nak_timing: NakTiming,
    ) -> Self {
        Peer {
            tsi,
            unicast_nla,
            group_nla,
            local_nla,
            expiry: Mutex::new(now + peer_expiry),
            spmr_expiry: Mutex::new(Some(now + spmr_expiry_ivl)),
            state: Mutex::new(PeerRxState {
                rxw: Rxw::new(rxw_sqns, nak_timing),
                fec: PeerFecParams::default(),
                last_spm_sqn: None,
                spm_trail: 0,
                spm_lead: 0,
            }),
        }
    }

    pub fn touch_expiry(&self, now: Instant, peer_expiry: Duration) {
        *self.expiry.lock().unwrap() = now + peer_expiry;
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= *self.expiry.lock().unwrap()
    }

    /// Cancel our own pending SPMR because another peer multicast one, or
    /// because the source just answered with an SPM.
    pub fn cancel_spmr(&self) {
        *self.spmr_expiry.lock().unwrap() = None;
    }

    pub fn due_spmr(&self, now: Instant) -> bool {
        matches!(*self.spmr_expiry.lock().unwrap(), Some(t) if now >= t)
    }
}
