//! # Transmit Window (TXW)
//!
//! Ring buffer of sent TPDUs keyed by sequence number, with a coalescing
//! retransmit queue. Grounded on the same slab-backed pool idiom used for
//! packet buffering elsewhere in this codebase, specialised to the
//! strict-oldest-first eviction and SQN-indexed lookup the protocol needs.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;

use crate::error::PgmError;
use crate::types::Sqn;
use crate::wire::OptFragment;

/// One stored outgoing TPDU.
#[derive(Debug, Clone)]
pub struct TxwEntry {
    pub sqn: Sqn,
    pub payload: Bytes,
    /// Cached unfolded one's-complement partial sum, so an RDATA rebuild
    /// doesn't have to recompute the checksum over the full TSDU.
    pub data_checksum: u16,
    pub tg_base: Sqn,
    /// OPT_FRAGMENT header this TPDU was originally sent with, if any, so
    /// a later retransmit can rebuild the same option.
    pub fragment: Option<OptFragment>,
}

/// One pending retransmit request, coalesced at transmission-group
/// granularity for parity requests.
#[derive(Debug, Clone, Copy)]
struct RetransmitRequest {
    sqn: Sqn,
    is_parity: bool,
    /// For parity requests: number of parity blocks requested for this tg.
    rs_h: u32,
}

/// Ring buffer of the most recent `txw_sqns` outgoing TPDUs, plus the
/// sender's pending-retransmit queue.
pub struct Txw {
    capacity: usize,
    tg_sqn_shift: u32,
    entries: HashMap<u32, TxwEntry>,
    trail: Sqn,
    lead: Sqn,
    has_pushed: bool,
    retransmit_queue: VecDeque<RetransmitRequest>,
}

impl Txw {
    pub fn new(capacity: usize, tg_sqn_shift: u32) -> Self {
        Txw {
            capacity,
            tg_sqn_shift,
            entries: HashMap::with_capacity(capacity),
            trail: Sqn::ZERO,
            lead: Sqn(u32::MAX), // lead+1 == 0 so first push assigns SQN 0
            has_pushed: false,
            retransmit_queue: VecDeque::new(),
        }
    }

    pub fn trail(&self) -> Sqn {
        self.trail
    }

    pub fn lead(&self) -> Sqn {
        self.lead
    }

    pub fn next_lead(&self) -> Sqn {
        self.lead.next()
    }

    /// Append a new TPDU at `lead + 1`, evicting the trail entry if the
    /// window is full. Returns the assigned SQN.
    pub fn push(&mut self, payload: Bytes, data_checksum: u16, fragment: Option<OptFragment>) -> Sqn {
        let sqn = self.next_lead();
        let tg_base = sqn.tg_base(self.tg_sqn_shift);
        self.entries.insert(
            sqn.0,
            TxwEntry {
                sqn,
                payload,
                data_checksum,
                tg_base,
                fragment,
            },
        );
        self.lead = sqn;
        if !self.has_pushed {
            self.trail = sqn;
            self.has_pushed = true;
        }
        while self.entries.len() > self.capacity {
            self.entries.remove(&self.trail.0);
            self.trail = self.trail.next();
        }
        sqn
    }

    /// O(1) lookup of a previously sent TPDU, while `trail <= sqn <= lead`.
    pub fn peek(&self, sqn: Sqn) -> Result<&TxwEntry, PgmError> {
        if !self.has_pushed || sqn.serial_lt(self.trail) || self.lead.serial_lt(sqn) {
            return Err(PgmError::NotInWindow {
                sqn: sqn.0,
                trail: self.trail.0,
                lead: self.lead.0,
            });
        }
        self.entries.get(&sqn.0).ok_or(PgmError::NotInWindow {
            sqn: sqn.0,
            trail: self.trail.0,
            lead: self.lead.0,
        })
    }

    /// Enqueue a pending retransmit. Parity requests for the same
    /// transmission group merge, accumulating the requested parity count
    /// rather than duplicating the queue entry.
    pub fn retransmit_push(&mut self, sqn: Sqn, is_parity: bool, rs_h: u32) {
        if is_parity {
            let tg_base = sqn.tg_base(self.tg_sqn_shift);
            let already_pending = self.retransmit_queue.iter_mut().find(|r| {
                r.is_parity && r.sqn.tg_base(self.tg_sqn_shift) == tg_base
            });
            if let Some(existing) = already_pending {
                existing.rs_h = existing.rs_h.max(rs_h);
                return;
            }
            self.retransmit_queue.push_back(RetransmitRequest {
                sqn,
                is_parity,
                rs_h,
            });
        } else {
            if self.retransmit_queue.iter().any(|r| !r.is_parity && r.sqn == sqn) {
                return; // duplicate selective request already queued
            }
            self.retransmit_queue.push_back(RetransmitRequest {
                sqn,
                is_parity,
                rs_h,
            });
        }
    }

    /// Dequeue one pending retransmit, returning enough context for the
    /// caller to either resend the original bytes or drive the FEC encoder.
    pub fn retransmit_try_pop(&mut self) -> Option<(Sqn, Option<Bytes>, bool, u32)> {
        let req = self.retransmit_queue.pop_front()?;
        if req.is_parity {
            Some((req.sqn, None, true, req.rs_h))
        } else {
            let payload = self.entries.get(&req.sqn.0).map(|e| e.payload.clone());
            Some((req.sqn, payload, false, 0))
        }
    }

    pub fn pending_retransmits(&self) -> usize {
        self.retransmit_queue.len()
    }

    /// Collect every TXW entry belonging to the transmission group `tg_base`,
    /// in ascending offset order, for FEC parity assembly.
    pub fn group_entries(&self, tg_base: Sqn, k: u32) -> Vec<Option<&TxwEntry>> {
        (0..k)
            .map(|offset| self.entries.get(&tg_base.add(offset).0))
            .collect()
    }
}
