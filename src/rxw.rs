//! # Receive Window (RXW) and NAK State Machine
//!
//! Reassembles an in-order byte stream from out-of-order, possibly lossy,
//! fragmented arrivals. Each pending SQN walks the state machine
//! `BACK_OFF -> WAIT_NCF -> WAIT_DATA -> {HAVE_DATA, HAVE_PARITY, LOST}`,
//! cross-linked into one of three expiry-ordered queues so the timer
//! engine can always find the next thing to do in O(log n) without
//! scanning every outstanding SQN.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use quanta::Instant;

use crate::collab::RandomSource;
use crate::error::PgmError;
use crate::types::Sqn;
use crate::wire::OptFragment;

/// Per-entry NAK lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxwState {
    Placeholder,
    BackOff,
    WaitNcf,
    WaitData,
    HaveData,
    HaveParity,
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueKind {
    None,
    BackOff,
    WaitNcf,
    WaitData,
}

#[derive(Debug, Clone)]
struct RxwEntry {
    sqn: Sqn,
    state: RxwState,
    payload: Option<Bytes>,
    fragment: Option<OptFragment>,
    expiry: Option<Instant>,
    queue: QueueKind,
    nak_transmit_count: u32,
    ncf_retry_count: u32,
    data_retry_count: u32,
    t0: Instant,
}

/// Timing parameters governing the NAK state machine, mirroring the
/// `nak_bo_ivl` / `nak_rpt_ivl` / `nak_rdata_ivl` / retry-ceiling
/// configuration fields.
#[derive(Debug, Clone, Copy)]
pub struct NakTiming {
    pub nak_bo_ivl: Duration,
    pub nak_rpt_ivl: Duration,
    pub nak_rdata_ivl: Duration,
    pub nak_ncf_retries: u32,
    pub nak_data_retries: u32,
}

/// Outcome of inserting an ODATA/RDATA payload into the window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// First sighting of this SQN; committed directly.
    Accepted,
    /// SQN already held as HAVE_DATA/HAVE_PARITY.
    Duplicate,
    /// A parity block filled a hole formerly in WAIT_DATA/BACK_OFF/WAIT_NCF.
    Recovered,
}

/// Outcome of draining contiguous committed bytes from the window.
#[derive(Debug, Clone, Default)]
pub struct ReadOutcome {
    pub data: Bytes,
    /// SQNs silently skipped because they were sealed LOST.
    pub skipped_lost: Vec<Sqn>,
    /// Fragmented APDUs discarded because one member was LOST.
    pub apdu_lost: Vec<Sqn>,
    /// True if the scan stopped because of a gap (as opposed to the
    /// caller's buffer budget).
    pub hit_gap: bool,
}

enum ApduScan {
    Ready(Bytes, Vec<Sqn>),
    Lost(Vec<Sqn>),
    Pending,
}

pub struct Rxw {
    capacity: u32,
    timing: NakTiming,
    entries: std::collections::HashMap<u32, RxwEntry>,
    trail: Sqn,
    lead: Option<Sqn>,
    backoff_queue: BTreeMap<(Instant, u32), Sqn>,
    wait_ncf_queue: BTreeMap<(Instant, u32), Sqn>,
    wait_data_queue: BTreeMap<(Instant, u32), Sqn>,
}

impl Rxw {
    pub fn new(capacity: u32, timing: NakTiming) -> Self {
        Rxw {
            capacity,
            timing,
            entries: std::collections::HashMap::new(),
            trail: Sqn::ZERO,
            lead: None,
            backoff_queue: BTreeMap::new(),
            wait_ncf_queue: BTreeMap::new(),
            wait_data_queue: BTreeMap::new(),
        }
    }

    pub fn trail(&self) -> Sqn {
        self.trail
    }

    pub fn lead(&self) -> Option<Sqn> {
        self.lead
    }

    fn in_window(&self, sqn: Sqn) -> bool {
        if self.lead.is_none() {
            return true; // first packet ever: always accepted, seeds the window
        }
        !sqn.serial_lt(self.trail) && sqn.distance(self.trail) < self.capacity as i32
    }

    fn requeue(&mut self, sqn: Sqn, queue: QueueKind, expiry: Instant) {
        let entry = self.entries.get_mut(&sqn.0).expect("entry must exist to requeue");
        self.remove_from_queue(entry.queue, entry.expiry, sqn);
        entry.queue = queue;
        entry.expiry = Some(expiry);
        let key = (expiry, sqn.0);
        match queue {
            QueueKind::BackOff => {
                self.backoff_queue.insert(key, sqn);
            }
            QueueKind::WaitNcf => {
                self.wait_ncf_queue.insert(key, sqn);
            }
            QueueKind::WaitData => {
                self.wait_data_queue.insert(key, sqn);
            }
            QueueKind::None => {}
        }
    }

    fn remove_from_queue(&mut self, queue: QueueKind, expiry: Option<Instant>, sqn: Sqn) {
        let Some(expiry) = expiry else { return };
        let key = (expiry, sqn.0);
        match queue {
            QueueKind::BackOff => {
                self.backoff_queue.remove(&key);
            }
            QueueKind::WaitNcf => {
                self.wait_ncf_queue.remove(&key);
            }
            QueueKind::WaitData => {
                self.wait_data_queue.remove(&key);
            }
            QueueKind::None => {}
        }
    }

    fn create_placeholder(&mut self, sqn: Sqn, now: Instant, rng: &dyn RandomSource) {
        if self.entries.contains_key(&sqn.0) {
            return;
        }
        let bo_micros = self.timing.nak_bo_ivl.as_micros().max(1) as u32;
        let delay = Duration::from_micros(rng.uniform_u32(bo_micros).max(1) as u64);
        let expiry = now + delay;
        self.entries.insert(
            sqn.0,
            RxwEntry {
                sqn,
                state: RxwState::BackOff,
                payload: None,
                fragment: None,
                expiry: Some(expiry),
                queue: QueueKind::BackOff,
                nak_transmit_count: 0,
                ncf_retry_count: 0,
                data_retry_count: 0,
                t0: now,
            },
        );
        self.backoff_queue.insert((expiry, sqn.0), sqn);
    }

    /// Insert an ODATA/RDATA payload arriving at `sqn`. When `is_parity` is
    /// set this is a parity-reconstructed block substituted into the hole.
    pub fn insert_data(
        &mut self,
        sqn: Sqn,
        payload: Bytes,
        fragment: Option<OptFragment>,
        is_parity: bool,
        now: Instant,
        rng: &dyn RandomSource,
    ) -> Result<InsertOutcome, PgmError> {
        if !self.in_window(sqn) {
            return Err(PgmError::NotInWindow {
                sqn: sqn.0,
                trail: self.trail.0,
                lead: self.lead.unwrap_or(self.trail).0,
            });
        }

        if self.lead.is_none() {
            // First packet ever seen on this RXW: the window trail starts
            // at its SQN, per the peer-expiry scenario's "fresh peer" rule.
            self.trail = sqn;
            self.lead = Some(sqn);
        } else {
            let lead = self.lead.unwrap();
            if lead.serial_lt(sqn) {
                let mut gap = lead.next();
                while gap != sqn {
                    self.create_placeholder(gap, now, rng);
                    gap = gap.next();
                }
                self.lead = Some(sqn);
            }
        }

        let was_recovering = matches!(
            self.entries.get(&sqn.0).map(|e| e.state),
            Some(RxwState::BackOff) | Some(RxwState::WaitNcf) | Some(RxwState::WaitData)
        );

        if let Some(existing) = self.entries.get(&sqn.0) {
            if matches!(existing.state, RxwState::HaveData | RxwState::HaveParity) {
                return Ok(InsertOutcome::Duplicate);
            }
        }

        let state = if is_parity {
            RxwState::HaveParity
        } else {
            RxwState::HaveData
        };

        let entry = self.entries.entry(sqn.0).or_insert_with(|| RxwEntry {
            sqn,
            state,
            payload: None,
            fragment: None,
            expiry: None,
            queue: QueueKind::None,
            nak_transmit_count: 0,
            ncf_retry_count: 0,
            data_retry_count: 0,
            t0: now,
        });
        self.remove_from_queue(entry.queue, entry.expiry, sqn);
        entry.state = state;
        entry.payload = Some(payload);
        entry.fragment = fragment;
        entry.queue = QueueKind::None;
        entry.expiry = None;

        Ok(if was_recovering {
            InsertOutcome::Recovered
        } else {
            InsertOutcome::Accepted
        })
    }

    /// Pop every BACK_OFF entry whose `nak_rb_expiry` has passed, transition
    /// each to WAIT_NCF, and return the SQNs that need a NAK sent.
    pub fn poll_expired_backoff(&mut self, now: Instant) -> Vec<Sqn> {
        let due: Vec<Sqn> = self
            .backoff_queue
            .range(..=(now, u32::MAX))
            .map(|(_, sqn)| *sqn)
            .collect();
        for sqn in &due {
            self.backoff_queue.remove(&(
                self.entries.get(&sqn.0).and_then(|e| e.expiry).unwrap(),
                sqn.0,
            ));
            let rpt_expiry = now + self.timing.nak_rpt_ivl;
            if let Some(entry) = self.entries.get_mut(&sqn.0) {
                entry.state = RxwState::WaitNcf;
                entry.nak_transmit_count += 1;
                entry.queue = QueueKind::WaitNcf;
                entry.expiry = Some(rpt_expiry);
            }
            self.wait_ncf_queue.insert((rpt_expiry, sqn.0), *sqn);
        }
        due
    }

    /// NCF observed for `sqn`: WAIT_NCF -> WAIT_DATA.
    pub fn on_ncf(&mut self, sqn: Sqn, now: Instant) {
        if !matches!(self.entries.get(&sqn.0).map(|e| e.state), Some(RxwState::WaitNcf)) {
            return;
        }
        let expiry = now + self.timing.nak_rdata_ivl;
        self.requeue(sqn, QueueKind::WaitData, expiry);
        if let Some(entry) = self.entries.get_mut(&sqn.0) {
            entry.state = RxwState::WaitData;
        }
    }

    /// Pop every WAIT_NCF entry whose repeat timer expired. Entries whose
    /// retry ceiling is exceeded become LOST; the rest return to BACK_OFF.
    pub fn poll_expired_wait_ncf(&mut self, now: Instant, rng: &dyn RandomSource) -> (Vec<Sqn> /*lost*/, Vec<Sqn> /*retried*/) {
        let due: Vec<Sqn> = self
            .wait_ncf_queue
            .range(..=(now, u32::MAX))
            .map(|(_, sqn)| *sqn)
            .collect();
        let mut lost = Vec::new();
        let mut retried = Vec::new();
        for sqn in due {
            let expiry = self.entries.get(&sqn.0).and_then(|e| e.expiry).unwrap();
            self.wait_ncf_queue.remove(&(expiry, sqn.0));
            let exceeded = {
                let entry = self.entries.get_mut(&sqn.0).unwrap();
                entry.ncf_retry_count += 1;
                entry.ncf_retry_count > self.timing.nak_ncf_retries
            };
            if exceeded {
                let entry = self.entries.get_mut(&sqn.0).unwrap();
                entry.state = RxwState::Lost;
                entry.queue = QueueKind::None;
                entry.expiry = None;
                entry.payload = None;
                lost.push(sqn);
            } else {
                let bo_micros = self.timing.nak_bo_ivl.as_micros().max(1) as u32;
                let delay = Duration::from_micros(rng.uniform_u32(bo_micros).max(1) as u64);
                let new_expiry = now + delay;
                self.backoff_queue.insert((new_expiry, sqn.0), sqn);
                let entry = self.entries.get_mut(&sqn.0).unwrap();
                entry.state = RxwState::BackOff;
                entry.queue = QueueKind::BackOff;
                entry.expiry = Some(new_expiry);
                retried.push(sqn);
            }
        }
        (lost, retried)
    }

    /// Pop every WAIT_DATA entry whose RDATA timer expired, same
    /// lost-or-retry split as `poll_expired_wait_ncf`.
    pub fn poll_expired_wait_data(&mut self, now: Instant, rng: &dyn RandomSource) -> (Vec<Sqn>, Vec<Sqn>) {
        let due: Vec<Sqn> = self
            .wait_data_queue
            .range(..=(now, u32::MAX))
            .map(|(_, sqn)| *sqn)
            .collect();
        let mut lost = Vec::new();
        let mut retried = Vec::new();
        for sqn in due {
            let expiry = self.entries.get(&sqn.0).and_then(|e| e.expiry).unwrap();
            self.wait_data_queue.remove(&(expiry, sqn.0));
            let exceeded = {
                let entry = self.entries.get_mut(&sqn.0).unwrap();
                entry.data_retry_count += 1;
                entry.data_retry_count > self.timing.nak_data_retries
            };
            if exceeded {
                let entry = self.entries.get_mut(&sqn.0).unwrap();
                entry.state = RxwState::Lost;
                entry.queue = QueueKind::None;
                entry.expiry = None;
                entry.payload = None;
                lost.push(sqn);
            } else {
                let bo_micros = self.timing.nak_bo_ivl.as_micros().max(1) as u32;
                let delay = Duration::from_micros(rng.uniform_u32(bo_micros).max(1) as u64);
                let new_expiry = now + delay;
                self.backoff_queue.insert((new_expiry, sqn.0), sqn);
                let entry = self.entries.get_mut(&sqn.0).unwrap();
                entry.state = RxwState::BackOff;
                entry.queue = QueueKind::BackOff;
                entry.expiry = Some(new_expiry);
                retried.push(sqn);
            }
        }
        (lost, retried)
    }

    /// Mark a SQN LOST immediately (used when the peer's NLA is unknown
    /// and a NAK cannot be sent at all).
    pub fn mark_lost_unreachable(&mut self, sqn: Sqn, now: Instant) {
        let entry = self.entries.entry(sqn.0).or_insert_with(|| RxwEntry {
            sqn,
            state: RxwState::Lost,
            payload: None,
            fragment: None,
            expiry: None,
            queue: QueueKind::None,
            nak_transmit_count: 0,
            ncf_retry_count: 0,
            data_retry_count: 0,
            t0: now,
        });
        self.remove_from_queue(entry.queue, entry.expiry, sqn);
        entry.state = RxwState::Lost;
        entry.queue = QueueKind::None;
        entry.expiry = None;
        entry.payload = None;
    }

    /// Snapshot of committed payloads across a transmission group in
    /// ascending offset order, for FEC decode (`None` = not yet committed).
    pub fn group_snapshot(&self, tg_base: Sqn, n: u32) -> Vec<Option<Bytes>> {
        (0..n)
            .map(|offset| {
                self.entries.get(&tg_base.add(offset).0).and_then(|e| {
                    matches!(e.state, RxwState::HaveData | RxwState::HaveParity)
                        .then(|| e.payload.clone().unwrap())
                })
            })
            .collect()
    }

    /// Offsets within the first `k` (data) positions of the group that are
    /// still missing their block: candidates for FEC reconstruction.
    pub fn group_missing_data_offsets(&self, tg_base: Sqn, k: u32) -> Vec<u32> {
        (0..k)
            .filter(|&offset| {
                !matches!(
                    self.entries.get(&tg_base.add(offset).0).map(|e| e.state),
                    Some(RxwState::HaveData) | Some(RxwState::HaveParity)
                )
            })
            .collect()
    }

    /// The next absolute instant the timer engine must wake for this
    /// window: the tail (minimum-expiry) entry across all three queues.
    pub fn next_expiry(&self) -> Option<Instant> {
        let a = self.backoff_queue.keys().next().map(|(t, _)| *t);
        let b = self.wait_ncf_queue.keys().next().map(|(t, _)| *t);
        let c = self.wait_data_queue.keys().next().map(|(t, _)| *t);
        [a, b, c].into_iter().flatten().min()
    }

    fn scan_apdu(&self, frag: &OptFragment) -> ApduScan {
        let mut collected = BytesMut::new();
        let mut span = Vec::new();
        let mut sqn = frag.apdu_first_sqn;
        while (collected.len() as u32) < frag.frag_len {
            let Some(e) = self.entries.get(&sqn.0) else {
                return ApduScan::Pending;
            };
            span.push(sqn);
            match e.state {
                RxwState::HaveData | RxwState::HaveParity => {
                    collected.extend_from_slice(e.payload.as_ref().expect("have_data carries payload"));
                }
                RxwState::Lost => return ApduScan::Lost(span),
                _ => return ApduScan::Pending,
            }
            sqn = sqn.next();
        }
        collected.truncate(frag.frag_len as usize);
        ApduScan::Ready(collected.freeze(), span)
    }

    /// Scan from `trail` forward, returning contiguous committed bytes,
    /// skipping sealed LOST entries silently, and stopping at a gap, an
    /// incomplete fragmented APDU, or the caller's byte budget.
    pub fn read(&mut self, budget: usize) -> ReadOutcome {
        let mut out = BytesMut::new();
        let mut outcome = ReadOutcome::default();
        loop {
            if out.len() >= budget {
                break;
            }
            let Some(entry) = self.entries.get(&self.trail.0) else {
                outcome.hit_gap = true;
                break;
            };
            match entry.state {
                RxwState::Lost => {
                    outcome.skipped_lost.push(self.trail);
                    self.entries.remove(&self.trail.0);
                    self.trail = self.trail.next();
                }
                RxwState::HaveData | RxwState::HaveParity => {
                    if let Some(frag) = entry.fragment {
                        match self.scan_apdu(&frag) {
                            ApduScan::Ready(bytes, span) => {
                                out.extend_from_slice(&bytes);
                                for sqn in &span {
                                    self.entries.remove(&sqn.0);
                                }
                                self.trail = span.last().unwrap().next();
                            }
                            ApduScan::Lost(span) => {
                                outcome.apdu_lost.push(frag.apdu_first_sqn);
                                for sqn in &span {
                                    self.entries.remove(&sqn.0);
                                }
                                self.trail = span.last().unwrap().next();
                            }
                            ApduScan::Pending => {
                                outcome.hit_gap = true;
                                break;
                            }
                        }
                    } else {
                        let payload = entry.payload.clone().unwrap();
                        out.extend_from_slice(&payload);
                        self.entries.remove(&self.trail.0);
                        self.trail = self.trail.next();
                    }
                }
                _ => {
                    outcome.hit_gap = true;
                    break;
                }
            }
        }
        outcome.data = out.freeze();
        outcome
    }
}
