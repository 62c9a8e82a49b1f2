//! # Control Surface
//!
//! `TransportConfig` validates the configuration surface (§6) field by
//! field and freezes once `bind()` is called; `Transport` wires together
//! the TXW, peer table, timer schedule, and the injected collaborator
//! traits behind the lock hierarchy from §5/§5.1. The timer thread is the
//! only thread this crate spawns itself — send/recv are driven by
//! whatever thread the caller calls `Transport` methods from.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Select, Sender};
use quanta::Instant;

use crate::collab::{Clock, FecCodec, PacketIo, QuantaClock, RandomSource, RateLimiter, ThreadRandomSource};
use crate::error::{PgmError, PgmResult};
use crate::fec::{self, FecConfig};
use crate::parser::{decode_packet, PacketBody};
use crate::peer::Peer;
use crate::rxw::{InsertOutcome, NakTiming, ReadOutcome};
use crate::sender::{self, max_tsdu_fragment, segment_apdu, SendDescriptor};
use crate::receiver::{self, batch_naks};
use crate::stats::{ReceiverStats, SenderStats};
use crate::timer::SpmSchedule;
use crate::txw::Txw;
use crate::types::{Gsi, Nla, Sqn, Tsi};
use crate::wire::{pgm_checksum, OptParityPrm, PgmType};

/// Configuration surface (§6), validated eagerly and frozen once bound.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub max_tpdu: u16,
    pub hops: u8,
    pub spm_ambient_interval: Duration,
    pub spm_heartbeat_interval: Vec<Duration>,
    pub peer_expiry: Duration,
    pub spmr_expiry: Duration,
    pub txw_sqns: u32,
    pub rxw_sqns: u32,
    pub nak_bo_ivl: Duration,
    pub nak_rpt_ivl: Duration,
    pub nak_rdata_ivl: Duration,
    pub nak_data_retries: u32,
    pub nak_ncf_retries: u32,
    pub fec: Option<FecConfig>,
    pub passive_receiver: bool,
    bound: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            max_tpdu: 1500,
            hops: 16,
            spm_ambient_interval: Duration::from_secs(30),
            spm_heartbeat_interval: vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::ZERO,
            ],
            peer_expiry: Duration::from_secs(300),
            spmr_expiry: Duration::from_millis(250),
            txw_sqns: 8192,
            rxw_sqns: 8192,
            nak_bo_ivl: Duration::from_millis(50),
            nak_rpt_ivl: Duration::from_millis(200),
            nak_rdata_ivl: Duration::from_millis(200),
            nak_data_retries: 5,
            nak_ncf_retries: 2,
            fec: None,
            passive_receiver: false,
            bound: false,
        }
    }
}

impl TransportConfig {
    fn check_unbound(&self) -> PgmResult<()> {
        if self.bound {
            return Err(PgmError::InvalidArgument("transport already bound".into()));
        }
        Ok(())
    }

    pub fn set_max_tpdu(&mut self, max_tpdu: u16) -> PgmResult<()> {
        self.check_unbound()?;
        if (max_tpdu as usize) < crate::wire::PGM_HEADER_LEN + 20 {
            return Err(PgmError::InvalidArgument("max_tpdu too small for ip+pgm headers".into()));
        }
        self.max_tpdu = max_tpdu;
        Ok(())
    }

    pub fn set_hops(&mut self, hops: u8) -> PgmResult<()> {
        self.check_unbound()?;
        if hops == 0 {
            return Err(PgmError::InvalidArgument("hops must be >= 1".into()));
        }
        self.hops = hops;
        Ok(())
    }

    pub fn set_spm_ambient_interval(&mut self, interval: Duration) -> PgmResult<()> {
        self.check_unbound()?;
        self.spm_ambient_interval = interval;
        Ok(())
    }

    pub fn set_peer_expiry(&mut self, expiry: Duration) -> PgmResult<()> {
        self.check_unbound()?;
        if expiry < 2 * self.spm_ambient_interval {
            return Err(PgmError::InvalidArgument(
                "peer_expiry must be >= 2 * spm_ambient_interval".into(),
            ));
        }
        self.peer_expiry = expiry;
        Ok(())
    }

    pub fn set_spmr_expiry(&mut self, expiry: Duration) -> PgmResult<()> {
        self.check_unbound()?;
        if expiry >= self.spm_ambient_interval {
            return Err(PgmError::InvalidArgument(
                "spmr_expiry must be < spm_ambient_interval".into(),
            ));
        }
        self.spmr_expiry = expiry;
        Ok(())
    }

    pub fn set_window_sqns(&mut self, txw_sqns: u32, rxw_sqns: u32) -> PgmResult<()> {
        self.check_unbound()?;
        if txw_sqns == 0 || rxw_sqns == 0 || txw_sqns >= i32::MAX as u32 || rxw_sqns >= i32::MAX as u32 {
            return Err(PgmError::InvalidArgument("window sqns out of range".into()));
        }
        self.txw_sqns = txw_sqns;
        self.rxw_sqns = rxw_sqns;
        Ok(())
    }

    pub fn set_nak_timing(&mut self, timing: NakTiming) -> PgmResult<()> {
        self.check_unbound()?;
        self.nak_bo_ivl = timing.nak_bo_ivl;
        self.nak_rpt_ivl = timing.nak_rpt_ivl;
        self.nak_rdata_ivl = timing.nak_rdata_ivl;
        self.nak_data_retries = timing.nak_data_retries;
        self.nak_ncf_retries = timing.nak_ncf_retries;
        Ok(())
    }

    pub fn set_fec(&mut self, fec: FecConfig) -> PgmResult<()> {
        self.check_unbound()?;
        fec.validate()?;
        self.fec = Some(fec);
        Ok(())
    }

    pub fn set_passive_receiver(&mut self, passive: bool) -> PgmResult<()> {
        self.check_unbound()?;
        self.passive_receiver = passive;
        Ok(())
    }

    fn nak_timing(&self) -> NakTiming {
        NakTiming {
            nak_bo_ivl: self.nak_bo_ivl,
            nak_rpt_ivl: self.nak_rpt_ivl,
            nak_rdata_ivl: self.nak_rdata_ivl,
            nak_ncf_retries: self.nak_ncf_retries,
            nak_data_retries: self.nak_data_retries,
        }
    }
}

struct TimerState {
    spm_schedule: SpmSchedule,
    next_spm_sqn: u32,
}

/// A transport session endpoint: own TSI, TXW (sender side), peer table
/// (receiver side), timer state, and the injected collaborators.
pub struct Transport {
    pub tsi: Tsi,
    pub dport: u16,
    interface_nla: Nla,
    send_group_nla: Nla,
    config: TransportConfig,

    timer_state: Mutex<TimerState>,
    peers: RwLock<HashMap<Tsi, Arc<Peer>>>,
    txw: RwLock<Txw>,
    peers_waiting: Mutex<VecDeque<Tsi>>,

    send_mutex: Mutex<()>,
    send_router_alert_mutex: Mutex<()>,

    stats: Mutex<(SenderStats, ReceiverStats)>,

    packet_io: Arc<dyn PacketIo>,
    fec_codec: Option<Arc<dyn FecCodec>>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    clock: Arc<dyn Clock>,
    rng: Arc<dyn RandomSource>,

    /// Transmission groups (`tg_base`) a proactive parity set has already
    /// been emitted for, pruned as the TXW trail advances past them.
    parity_emitted: Mutex<HashSet<u32>>,

    rdata_tx: Sender<()>,
    rdata_rx: Receiver<()>,
    timer_tx: Sender<()>,
    timer_rx: Receiver<()>,
    waiting_tx: Sender<()>,
    waiting_rx: Receiver<()>,

    shutdown: Arc<AtomicBool>,
    timer_thread: Mutex<Option<JoinHandle<()>>>,
}

static REGISTRY: OnceLock<RwLock<Vec<Weak<Transport>>>> = OnceLock::new();

fn registry() -> &'static RwLock<Vec<Weak<Transport>>> {
    REGISTRY.get_or_init(|| RwLock::new(Vec::new()))
}

fn nla_v4_octets(nla: Nla) -> [u8; 4] {
    match nla.addr {
        IpAddr::V4(v4) => v4.octets(),
        IpAddr::V6(_) => [0, 0, 0, 0],
    }
}

impl Transport {
    /// Bind a transport: validates nothing further (setters already did),
    /// spawns the timer thread, and registers in the process-wide list.
    /// Blocks until the timer thread signals readiness (§9 bootstrap note).
    #[allow(clippy::too_many_arguments)]
    pub fn bind(
        mut config: TransportConfig,
        gsi: Gsi,
        source_port: u16,
        dport: u16,
        interface_nla: Nla,
        send_group_nla: Nla,
        packet_io: Arc<dyn PacketIo>,
        fec_codec: Option<Arc<dyn FecCodec>>,
        rate_limiter: Option<Arc<dyn RateLimiter>>,
    ) -> PgmResult<Arc<Transport>> {
        config.bound = true;
        let clock: Arc<dyn Clock> = Arc::new(QuantaClock::new());
        let rng: Arc<dyn RandomSource> = Arc::new(ThreadRandomSource);
        let now = clock.now();

        let (rdata_tx, rdata_rx) = bounded(1);
        let (timer_tx, timer_rx) = bounded(1);
        let (waiting_tx, waiting_rx) = bounded(1);
        let (ready_tx, ready_rx) = bounded::<()>(0);

        let tg_sqn_shift = config.fec.map(|f| f.tg_sqn_shift).unwrap_or(0);
        let spm_schedule = SpmSchedule::new(now, config.spm_ambient_interval, config.spm_heartbeat_interval.clone());

        let transport = Arc::new(Transport {
            tsi: Tsi::new(gsi, source_port),
            dport,
            interface_nla,
            send_group_nla,
            timer_state: Mutex::new(TimerState {
                spm_schedule,
                next_spm_sqn: 0,
            }),
            peers: RwLock::new(HashMap::new()),
            txw: RwLock::new(Txw::new(config.txw_sqns as usize, tg_sqn_shift)),
            peers_waiting: Mutex::new(VecDeque::new()),
            send_mutex: Mutex::new(()),
            send_router_alert_mutex: Mutex::new(()),
            stats: Mutex::new((SenderStats::default(), ReceiverStats::default())),
            packet_io,
            fec_codec,
            rate_limiter,
            clock,
            rng,
            parity_emitted: Mutex::new(HashSet::new()),
            rdata_tx,
            rdata_rx,
            timer_tx,
            timer_rx,
            waiting_tx,
            waiting_rx,
            shutdown: Arc::new(AtomicBool::new(false)),
            timer_thread: Mutex::new(None),
            config,
        });

        registry().write().unwrap().push(Arc::downgrade(&transport));

        let weak = Arc::downgrade(&transport);
        let shutdown = transport.shutdown.clone();
        let timer_rx_clone = transport.timer_rx.clone();
        let rdata_rx_clone = transport.rdata_rx.clone();
        let handle = std::thread::Builder::new()
            .name("pgm-timer".into())
            .spawn(move || {
                let _ = ready_tx.send(());
                timer_loop(weak, shutdown, timer_rx_clone, rdata_rx_clone);
            })
            .map_err(|e| PgmError::IoError(e.to_string()))?;
        *transport.timer_thread.lock().unwrap() = Some(handle);

        let _ = ready_rx.recv();
        Ok(transport)
    }

    /// Bounded-time drain: signals the timer thread to stop, gives it up
    /// to `timeout` to notice, then joins unconditionally (§9 note b).
    pub fn destroy(&self, timeout: Duration) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.timer_tx.try_send(());
        let deadline = self.clock.now() + timeout;
        while self.clock.now() < deadline {
            if let Some(handle) = self.timer_thread.lock().unwrap().as_ref() {
                if handle.is_finished() {
                    break;
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        if let Some(handle) = self.timer_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        registry().write().unwrap().retain(|w| w.strong_count() > 0);
    }

    fn path_nla(&self) -> Nla {
        self.interface_nla
    }

    /// Segment, frame, push into the TXW, and send an APDU's ODATA TPDUs.
    /// Returns the SQNs assigned, in order.
    pub fn send_apdu(&self, apdu: &[u8]) -> PgmResult<Vec<Sqn>> {
        if let Some(limiter) = &self.rate_limiter {
            limiter.check(apdu.len())?;
        }
        let max_frag = max_tsdu_fragment(self.config.max_tpdu as usize, self.config.fec.map(|f| f.use_varpkt_len).unwrap_or(false));
        let specs = segment_apdu(apdu.len(), max_frag);
        let multi = specs.len() > 1;

        let tg_sqn_shift = self.config.fec.map(|f| f.tg_sqn_shift).unwrap_or(0);
        let mut sqns = Vec::with_capacity(specs.len());
        let mut fragments = Vec::with_capacity(specs.len());
        let mut first_sqn = None;
        let mut touched_tgs: Vec<Sqn> = Vec::new();
        {
            let mut txw = self.txw.write().unwrap();
            for spec in &specs {
                let sqn = txw.next_lead();
                if first_sqn.is_none() {
                    first_sqn = Some(sqn);
                }
                let fragment = if multi {
                    Some(crate::wire::OptFragment {
                        apdu_first_sqn: first_sqn.unwrap(),
                        frag_off: spec.offset as u32,
                        frag_len: apdu.len() as u32,
                    })
                } else {
                    None
                };
                let payload = bytes::Bytes::copy_from_slice(&apdu[spec.offset..spec.offset + spec.len]);
                let checksum = pgm_checksum(&payload);
                let assigned = txw.push(payload, checksum, fragment);
                debug_assert_eq!(assigned, sqn);
                let tg_base = sqn.tg_base(tg_sqn_shift);
                if touched_tgs.last() != Some(&tg_base) {
                    touched_tgs.push(tg_base);
                }
                sqns.push(sqn);
                fragments.push(fragment);
            }
        }

        for (i, spec) in specs.iter().enumerate() {
            let bytes = sender::encode_data(
                self.tsi.gsi,
                self.tsi.source_port,
                self.dport,
                false,
                sqns[i],
                &apdu[spec.offset..spec.offset + spec.len],
                fragments[i],
                false,
            );
            self.emit(&bytes, self.send_group_nla, SendDescriptor::for_type(PgmType::Odata))?;
        }

        self.timer_state.lock().unwrap().spm_schedule.arm_heartbeat(self.clock.now());
        let mut stats = self.stats.lock().unwrap();
        stats.0.data_msgs_sent += specs.len() as u64;
        stats.0.data_bytes_sent += apdu.len() as u64;
        drop(stats);

        for tg_base in touched_tgs {
            self.maybe_emit_proactive_parity(tg_base)?;
        }
        Ok(sqns)
    }

    /// Emit `h` proactive parity TPDUs for `tg_base` once every one of its
    /// `rs_k` data slots has been filled, per-group at most once.
    fn maybe_emit_proactive_parity(&self, tg_base: Sqn) -> PgmResult<()> {
        let Some(cfg) = self.config.fec else { return Ok(()) };
        if !cfg.use_proactive_parity {
            return Ok(());
        }
        let Some(codec) = self.fec_codec.clone() else { return Ok(()) };

        {
            let mut emitted = self.parity_emitted.lock().unwrap();
            let trail = self.txw.read().unwrap().trail().tg_base(cfg.tg_sqn_shift);
            emitted.retain(|&b| !Sqn(b).serial_lt(trail));
            if !emitted.insert(tg_base.0) {
                return Ok(()); // already emitted for this group
            }
        }

        let group = {
            let txw = self.txw.read().unwrap();
            txw.group_entries(tg_base, cfg.rs_k)
        };
        if group.iter().any(|e| e.is_none()) {
            // Group isn't actually full yet (e.g. a short final APDU); a
            // later push that completes it will retry.
            self.parity_emitted.lock().unwrap().remove(&tg_base.0);
            return Ok(());
        }
        let data_blocks: Vec<Option<bytes::Bytes>> = group.iter().map(|e| e.map(|e| e.payload.clone())).collect();
        let parity = fec::encode_parity(codec.as_ref(), &cfg, &data_blocks, cfg.h())?;
        for (i, block) in parity.iter().enumerate() {
            let sqn = tg_base.add(cfg.rs_k + i as u32);
            let bytes = sender::encode_data(
                self.tsi.gsi,
                self.tsi.source_port,
                self.dport,
                false,
                sqn,
                block,
                None,
                true,
            );
            self.emit(&bytes, self.send_group_nla, SendDescriptor::for_type(PgmType::Odata))?;
        }
        self.stats.lock().unwrap().0.fec_repairs_sent += parity.len() as u64;
        Ok(())
    }

    /// Drain every pending retransmit request in the TXW, rebuilding and
    /// sending the RDATA (or a freshly-regenerated parity block) for each.
    fn drain_retransmits(&self) -> PgmResult<()> {
        loop {
            let popped = self.txw.write().unwrap().retransmit_try_pop();
            let Some((sqn, payload, is_parity, rs_h)) = popped else { break };
            if is_parity {
                self.retransmit_parity(sqn, rs_h)?;
            } else {
                let Some(payload) = payload else { continue }; // evicted since the NAK arrived
                let fragment = self.txw.read().unwrap().peek(sqn).ok().and_then(|e| e.fragment);
                let bytes = sender::encode_data(
                    self.tsi.gsi,
                    self.tsi.source_port,
                    self.dport,
                    true,
                    sqn,
                    &payload,
                    fragment,
                    false,
                );
                self.emit(&bytes, self.send_group_nla, SendDescriptor::for_type(PgmType::Rdata))?;
                self.stats.lock().unwrap().0.rdata_msgs_sent += 1;
            }
        }
        Ok(())
    }

    /// Regenerate the requested parity block(s) for `sqn`'s transmission
    /// group from the TXW's current contents and send them as RDATA.
    fn retransmit_parity(&self, sqn: Sqn, rs_h: u32) -> PgmResult<()> {
        let Some(cfg) = self.config.fec else { return Ok(()) };
        let Some(codec) = self.fec_codec.clone() else { return Ok(()) };
        let tg_base = sqn.tg_base(cfg.tg_sqn_shift);
        let offset = sqn.tg_offset(cfg.tg_sqn_shift);
        if offset < cfg.rs_k {
            return Ok(()); // requested sqn isn't actually a parity slot
        }
        let h = rs_h.max(offset - cfg.rs_k + 1).min(cfg.h());
        let group = {
            let txw = self.txw.read().unwrap();
            txw.group_entries(tg_base, cfg.rs_k)
        };
        if group.iter().any(|e| e.is_none()) {
            return Ok(()); // group incomplete; nothing to regenerate from
        }
        let data_blocks: Vec<Option<bytes::Bytes>> = group.iter().map(|e| e.map(|e| e.payload.clone())).collect();
        let parity = fec::encode_parity(codec.as_ref(), &cfg, &data_blocks, h)?;
        let index = (offset - cfg.rs_k) as usize;
        let Some(block) = parity.get(index) else { return Ok(()) };
        let bytes = sender::encode_data(
            self.tsi.gsi,
            self.tsi.source_port,
            self.dport,
            true,
            sqn,
            block,
            None,
            true,
        );
        self.emit(&bytes, self.send_group_nla, SendDescriptor::for_type(PgmType::Rdata))?;
        self.stats.lock().unwrap().0.fec_repairs_sent += 1;
        Ok(())
    }

    /// When a group member arrives for `tg_base`, check whether enough data
    /// and parity blocks are now present to reconstruct any still-missing
    /// data member, and if so substitute the reconstructed bytes into the
    /// holes. Returns whether any recovery happened.
    fn try_fec_recover(&self, peer: &Peer, cfg: FecConfig, tg_base: Sqn, now: Instant) -> PgmResult<bool> {
        let Some(codec) = self.fec_codec.clone() else { return Ok(false) };
        let mut state = peer.state.lock().unwrap();
        let missing = state.rxw.group_missing_data_offsets(tg_base, cfg.rs_k);
        if missing.is_empty() {
            return Ok(false);
        }
        let group = state.rxw.group_snapshot(tg_base, cfg.rs_n);
        if group.iter().filter(|b| b.is_some()).count() < cfg.rs_k as usize {
            return Ok(false); // not enough blocks arrived yet
        }
        let reconstructed = match fec::decode_group(codec.as_ref(), &cfg, &group) {
            Ok(r) => r,
            Err(_) => return Ok(false), // too many erasures for the codec to recover
        };
        for offset in missing {
            let sqn = tg_base.add(offset);
            let _ = state.rxw.insert_data(sqn, reconstructed[offset as usize].clone(), None, true, now, self.rng.as_ref());
        }
        drop(state);
        self.stats.lock().unwrap().1.fec_recoveries += 1;
        Ok(true)
    }

    fn emit(&self, bytes: &[u8], dst: Nla, descriptor: SendDescriptor) -> PgmResult<usize> {
        let _guard = if descriptor.router_alert {
            self.send_router_alert_mutex.lock().unwrap()
        } else {
            self.send_mutex.lock().unwrap()
        };
        self.packet_io.send_to(bytes, dst, descriptor.router_alert, descriptor.no_reply_expected)
    }

    fn get_or_create_peer(&self, tsi: Tsi, src: Nla, now: Instant) -> Arc<Peer> {
        if let Some(peer) = self.peers.read().unwrap().get(&tsi) {
            return peer.clone();
        }
        let mut peers = self.peers.write().unwrap();
        peers
            .entry(tsi)
            .or_insert_with(|| {
                Arc::new(Peer::new(
                    tsi,
                    Some(src),
                    Some(self.send_group_nla),
                    Some(self.interface_nla),
                    now,
                    self.config.peer_expiry,
                    self.config.spmr_expiry,
                    self.config.rxw_sqns,
                    self.config.nak_timing(),
                ))
            })
            .clone()
    }

    /// Apply a received datagram: parse, verify, route by pgm_type (§4.4).
    pub fn recv_packet(&self, raw: &[u8], src: Nla) -> PgmResult<()> {
        let now = self.clock.now();
        let parsed = match decode_packet(raw) {
            Ok(p) => p,
            Err(PgmError::ChecksumError) => {
                self.stats.lock().unwrap().1.cksum_errors += 1;
                return Err(PgmError::ChecksumError);
            }
            Err(e) => {
                self.stats.lock().unwrap().1.malformed += 1;
                return Err(e);
            }
        };

        if parsed.header.gsi == self.tsi.gsi && parsed.header.sport == self.tsi.source_port {
            // our own loopback copy of a multicast send; nothing to do.
            return Ok(());
        }

        let peer_tsi = Tsi::new(parsed.header.gsi, parsed.header.sport);

        match parsed.body {
            PacketBody::Odata { sqn, payload } | PacketBody::Rdata { sqn, payload } => {
                if parsed.header.dport != self.dport {
                    self.stats.lock().unwrap().1.packets_discarded += 1;
                    return Ok(());
                }
                let peer = self.get_or_create_peer(peer_tsi, src, now);
                peer.touch_expiry(now, self.config.peer_expiry);
                peer.cancel_spmr();
                let fragment = parsed.options.iter().find_map(|o| match o {
                    crate::wire::PgmOption::Fragment(f) => Some(*f),
                    _ => None,
                });
                let is_parity = parsed.is_parity();
                let outcome = {
                    let mut state = peer.state.lock().unwrap();
                    state.rxw.insert_data(sqn, payload, fragment, is_parity, now, self.rng.as_ref())
                };
                match outcome {
                    Ok(InsertOutcome::Accepted) | Ok(InsertOutcome::Recovered) => {
                        self.stats.lock().unwrap().1.data_msgs_received += 1;
                        self.wake_waiting(peer_tsi);
                        if let Some(cfg) = self.config.fec {
                            let tg_base = sqn.tg_base(cfg.tg_sqn_shift);
                            if self.try_fec_recover(&peer, cfg, tg_base, now)? {
                                self.wake_waiting(peer_tsi);
                            }
                        }
                    }
                    Ok(InsertOutcome::Duplicate) => {
                        self.stats.lock().unwrap().1.dup_datas += 1;
                    }
                    Err(_) => {
                        self.stats.lock().unwrap().1.packets_discarded += 1;
                    }
                }
            }
            PacketBody::Spm { spm_sqn, trail, lead, .. } => {
                let peer = self.get_or_create_peer(peer_tsi, src, now);
                peer.touch_expiry(now, self.config.peer_expiry);
                peer.cancel_spmr();
                let parity_prm = parsed.options.iter().find_map(|o| match o {
                    crate::wire::PgmOption::ParityPrm(p) => Some(*p),
                    _ => None,
                });
                let mut state = peer.state.lock().unwrap();
                receiver::apply_spm(&mut state, spm_sqn, trail, lead, parity_prm);
            }
            PacketBody::Ncf { sqn } => {
                let peer = self.get_or_create_peer(peer_tsi, src, now);
                let mut state = peer.state.lock().unwrap();
                state.rxw.on_ncf(sqn, now);
            }
            PacketBody::Nak { sqn, src_nla, grp_nla } => {
                let destined_to_us = crate::parser::nak_destined_to_source(
                    src_nla,
                    grp_nla,
                    parsed.header.dport,
                    self.interface_nla,
                    self.send_group_nla,
                    self.tsi.source_port,
                );
                if destined_to_us {
                    let is_parity = parsed.is_parity();
                    let rs_h = self.config.fec.map(|f| f.h()).unwrap_or(0);
                    let mut discarded = 0u64;
                    {
                        let mut txw = self.txw.write().unwrap();
                        for s in std::iter::once(sqn).chain(parsed.nak_list()) {
                            // Parity requests target a slot beyond the TXW's
                            // data entries, so only selective requests are
                            // checked against the window here.
                            if !is_parity && txw.peek(s).is_err() {
                                discarded += 1;
                                continue;
                            }
                            txw.retransmit_push(s, is_parity, rs_h);
                        }
                    }
                    if discarded > 0 {
                        self.stats.lock().unwrap().0.naks_discarded_not_in_window += discarded;
                    }
                    let mut stats = self.stats.lock().unwrap();
                    if is_parity {
                        stats.0.parity_naks_received += 1;
                    } else {
                        stats.0.selective_naks_received += 1;
                    }
                    drop(stats);
                    let _ = self.rdata_tx.try_send(());
                    let ncf = sender::encode_ncf(self.tsi.gsi, self.tsi.source_port, self.dport, sqn);
                    self.emit(&ncf, src, SendDescriptor::for_type(PgmType::Ncf))?;
                } else {
                    // NAK multicast by another receiver: suppress our own pending NAK for the same SQN.
                    if let Some(peer) = self.peers.read().unwrap().get(&peer_tsi) {
                        let mut state = peer.state.lock().unwrap();
                        state.rxw.on_ncf(sqn, now);
                    }
                }
            }
            PacketBody::Nnak { .. } => {
                // stats-only per §4.4.
            }
            PacketBody::Spmr => {
                let destined_to_us = parsed.header.dport == self.tsi.source_port;
                if destined_to_us {
                    self.emit_spm()?;
                } else if let Some(peer) = self.peers.read().unwrap().get(&peer_tsi) {
                    peer.cancel_spmr();
                }
            }
            PacketBody::Polr => {
                self.stats.lock().unwrap().1.packets_discarded += 1;
            }
        }
        Ok(())
    }

    fn wake_waiting(&self, tsi: Tsi) {
        let mut waiting = self.peers_waiting.lock().unwrap();
        if !waiting.contains(&tsi) {
            waiting.push_back(tsi);
        }
        let _ = self.waiting_tx.try_send(());
    }

    /// Drain contiguous committed bytes for one peer's stream.
    pub fn read_from(&self, tsi: &Tsi, budget: usize) -> PgmResult<ReadOutcome> {
        let peer = self.peers.read().unwrap().get(tsi).cloned().ok_or(PgmError::NotBound)?;
        let mut state = peer.state.lock().unwrap();
        Ok(state.rxw.read(budget))
    }

    fn emit_spm(&self) -> PgmResult<()> {
        let (spm_sqn, trail, lead) = {
            let mut timer_state = self.timer_state.lock().unwrap();
            let txw = self.txw.read().unwrap();
            let sqn = timer_state.next_spm_sqn;
            timer_state.next_spm_sqn = timer_state.next_spm_sqn.wrapping_add(1);
            (Sqn(sqn), txw.trail(), txw.lead())
        };
        let parity_prm = self.config.fec.map(|f| OptParityPrm {
            parity_prm_tgs: f.rs_k,
            proactive: f.use_proactive_parity,
            on_demand: f.use_ondemand_parity,
        });
        let path = self.path_nla();
        let bytes = sender::encode_spm(
            self.tsi.gsi,
            self.tsi.source_port,
            self.dport,
            spm_sqn,
            trail,
            lead,
            nla_v4_octets(path),
            path.port,
            parity_prm,
        );
        self.emit(&bytes, self.send_group_nla, SendDescriptor::for_type(PgmType::Spm))?;
        self.stats.lock().unwrap().0.spms_sent += 1;
        Ok(())
    }

    /// One iteration of timer-driven work: SPM cadence, per-peer NAK
    /// polling, SPMR firing, and peer expiry (§4.3).
    fn poll_once(&self) -> PgmResult<()> {
        let now = self.clock.now();
        let due_ambient = self.timer_state.lock().unwrap().spm_schedule.poll_ambient(now);
        let due_heartbeat = !due_ambient && self.timer_state.lock().unwrap().spm_schedule.poll_heartbeat(now);
        if due_ambient || due_heartbeat {
            self.emit_spm()?;
        }

        let expired_tsis: Vec<Tsi> = {
            let peers = self.peers.read().unwrap();
            peers.iter().filter(|(_, p)| p.is_expired(now)).map(|(t, _)| *t).collect()
        };
        if !expired_tsis.is_empty() {
            let mut peers = self.peers.write().unwrap();
            for tsi in expired_tsis {
                peers.remove(&tsi);
            }
        }

        let peer_snapshot: Vec<(Tsi, Arc<Peer>)> = self
            .peers
            .read()
            .unwrap()
            .iter()
            .map(|(t, p)| (*t, p.clone()))
            .collect();

        for (_tsi, peer) in peer_snapshot {
            if !self.config.passive_receiver && peer.due_spmr(now) {
                let spmr = sender::encode_spmr(self.tsi.gsi, self.tsi.source_port, self.dport);
                if let Some(unicast) = peer.unicast_nla {
                    self.emit(&spmr, unicast, SendDescriptor::for_type(PgmType::Spmr))?;
                }
                peer.cancel_spmr();
            }

            if self.config.passive_receiver {
                continue;
            }

            let (due_backoff, lost_ncf, lost_data) = {
                let mut state = peer.state.lock().unwrap();
                let due_backoff = state.rxw.poll_expired_backoff(now);
                let (lost_ncf, _) = state.rxw.poll_expired_wait_ncf(now, self.rng.as_ref());
                let (lost_data, _) = state.rxw.poll_expired_wait_data(now, self.rng.as_ref());
                (due_backoff, lost_ncf, lost_data)
            };

            if !lost_ncf.is_empty() {
                self.stats.lock().unwrap().1.naks_failed_ncf_retries_exceeded += lost_ncf.len() as u64;
            }
            if !lost_data.is_empty() {
                self.stats.lock().unwrap().1.naks_failed_data_retries_exceeded += lost_data.len() as u64;
            }

            if !due_backoff.is_empty() {
                let Some(unicast) = peer.unicast_nla else {
                    let mut state = peer.state.lock().unwrap();
                    for sqn in due_backoff {
                        state.rxw.mark_lost_unreachable(sqn, now);
                    }
                    self.stats.lock().unwrap().1.peer_unknown_nla_drops += 1;
                    continue;
                };
                for (primary, extra) in batch_naks(&due_backoff) {
                    let nak = receiver::encode_nak(
                        self.tsi.gsi,
                        self.tsi.source_port,
                        self.dport,
                        primary,
                        &extra,
                        nla_v4_octets(self.interface_nla),
                        self.interface_nla.port,
                        nla_v4_octets(self.send_group_nla),
                        self.send_group_nla.port,
                        false,
                    );
                    self.emit(&nak, unicast, SendDescriptor::for_type(PgmType::Nak))?;
                    self.stats.lock().unwrap().1.selective_naks_sent += 1;
                }
            }
        }
        Ok(())
    }

    fn next_wake(&self) -> Instant {
        let now = self.clock.now();
        let mut next = self.timer_state.lock().unwrap().spm_schedule.next_spm();
        for peer in self.peers.read().unwrap().values() {
            if let Ok(expiry) = peer.expiry.lock() {
                next = next.min(*expiry);
            }
            if let Ok(spmr) = peer.spmr_expiry.lock() {
                if let Some(t) = *spmr {
                    next = next.min(t);
                }
            }
            if let Ok(state) = peer.state.lock() {
                if let Some(t) = state.rxw.next_expiry() {
                    next = next.min(t);
                }
            }
        }
        next.max(now)
    }
}

/// The only background thread this crate spawns: on each wake (either the
/// SPM/NAK schedule's own timeout, or an early nudge from `rdata_tx` when a
/// NAK arrives) it drains any pending retransmits first, then runs the
/// regular timer-driven poll.
fn timer_loop(weak: Weak<Transport>, shutdown: Arc<AtomicBool>, timer_rx: Receiver<()>, rdata_rx: Receiver<()>) {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        let Some(transport) = weak.upgrade() else { return };
        let now = transport.clock.now();
        let wake_at = transport.next_wake();
        let timeout = if wake_at > now {
            wake_at - now
        } else {
            Duration::from_millis(1)
        };
        drop(transport);

        let mut select = Select::new();
        let timer_idx = select.recv(&timer_rx);
        let rdata_idx = select.recv(&rdata_rx);
        if let Ok(op) = select.select_timeout(timeout) {
            let idx = op.index();
            if idx == timer_idx {
                let _ = op.recv(&timer_rx);
            } else if idx == rdata_idx {
                let _ = op.recv(&rdata_rx);
            }
        }

        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        let Some(transport) = weak.upgrade() else { return };
        if let Err(err) = transport.drain_retransmits() {
            tracing::warn!(error = %err, "retransmit drain failed");
        }
        if let Err(err) = transport.poll_once() {
            tracing::warn!(error = %err, "timer poll failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    struct LoopbackIo {
        sent: StdMutex<Vec<(bytes::Bytes, Nla)>>,
    }

    impl PacketIo for LoopbackIo {
        fn send_to(&self, buf: &[u8], dst: Nla, _router_alert: bool, _no_reply_expected: bool) -> PgmResult<usize> {
            self.sent.lock().unwrap().push((bytes::Bytes::copy_from_slice(buf), dst));
            Ok(buf.len())
        }
        fn recv_from(&self, _buf: &mut [u8]) -> PgmResult<(usize, Nla)> {
            Err(PgmError::WouldBlock)
        }
    }

    fn nla(port: u16) -> Nla {
        Nla::new(IpAddr::V4(Ipv4Addr::new(239, 0, 0, 1)), port)
    }

    #[test]
    fn config_rejects_peer_expiry_below_twice_ambient() {
        let mut cfg = TransportConfig::default();
        cfg.spm_ambient_interval = Duration::from_secs(10);
        assert!(cfg.set_peer_expiry(Duration::from_secs(5)).is_err());
        assert!(cfg.set_peer_expiry(Duration::from_secs(30)).is_ok());
    }

    #[test]
    fn send_apdu_pushes_into_txw_and_emits_odata() {
        let io = Arc::new(LoopbackIo { sent: StdMutex::new(Vec::new()) });
        let cfg = TransportConfig::default();
        let transport = Transport::bind(
            cfg,
            Gsi([1, 2, 3, 4, 5, 6]),
            7000,
            7000,
            nla(7000),
            nla(7000),
            io.clone(),
            None,
            None,
        )
        .unwrap();

        let sqns = transport.send_apdu(b"hello world").unwrap();
        assert_eq!(sqns, vec![Sqn(0)]);
        assert_eq!(io.sent.lock().unwrap().len(), 1);
        transport.destroy(Duration::from_millis(50));
        let _ = AtomicUsize::new(0);
    }

    #[test]
    fn recv_odata_then_read_yields_payload() {
        let io = Arc::new(LoopbackIo { sent: StdMutex::new(Vec::new()) });
        let cfg = TransportConfig::default();
        let transport = Transport::bind(
            cfg,
            Gsi([9, 9, 9, 9, 9, 9]),
            7000,
            7000,
            nla(7000),
            nla(7000),
            io,
            None,
            None,
        )
        .unwrap();

        let remote_gsi = Gsi([1, 1, 1, 1, 1, 1]);
        let bytes = sender::encode_data(remote_gsi, 8000, 7000, false, Sqn(0), b"payload", None, false);
        transport.recv_packet(&bytes, nla(8000)).unwrap();

        let remote_tsi = Tsi::new(remote_gsi, 8000);
        let out = transport.read_from(&remote_tsi, 1024).unwrap();
        assert_eq!(&out.data[..], b"payload");
        transport.destroy(Duration::from_millis(50));
    }
}
