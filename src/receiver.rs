//! # Receiver Loop
//!
//! Pure logic — no I/O. Applies a parsed TPDU to a peer's RXW state,
//! advances SPM-reported trail/lead, and batches due NAKs into
//! OPT_NAK_LIST groups. The caller (`transport::Transport`) owns peer
//! resolution (by TSI), the injected `PacketIo`, and socket calls.

use bytes::{BufMut, Bytes, BytesMut};

use crate::peer::PeerRxState;
use crate::types::{Gsi, Sqn};
use crate::wire::{encode_options, pgm_checksum, OptParityPrm, PgmOption, PgmType, OPT_NAK_LIST_MAX_EXTRA, PGM_HEADER_LEN};

const CHECKSUM_FIELD_OFFSET: usize = 6;

/// Outcome of applying an SPM to a peer's tracked trail/lead/FEC params.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpmOutcome {
    Updated,
    Stale,
}

/// Apply an incoming SPM: advance trail/lead and learned FEC params only
/// if `spm_sqn` is newer than the last one seen (serial-order comparison).
pub fn apply_spm(
    state: &mut PeerRxState,
    spm_sqn: Sqn,
    trail: Sqn,
    lead: Sqn,
    parity_prm: Option<OptParityPrm>,
) -> SpmOutcome {
    if let Some(last) = state.last_spm_sqn {
        if !Sqn(last).serial_lt(spm_sqn) {
            return SpmOutcome::Stale;
        }
    }
    state.last_spm_sqn = Some(spm_sqn.0);
    state.spm_trail = trail.0;
    state.spm_lead = lead.0;
    if let Some(prm) = parity_prm {
        state.fec.parity_prm_tgs = Some(prm.parity_prm_tgs);
        state.fec.proactive = prm.proactive;
        state.fec.on_demand = prm.on_demand;
    }
    SpmOutcome::Updated
}

/// Split a set of NAK-due SQNs into OPT_NAK_LIST batches of at most 63
/// SQNs each (one primary plus up to 62 extra), per invariant #3.
pub fn batch_naks(due: &[Sqn]) -> Vec<(Sqn, Vec<Sqn>)> {
    let batch_size = OPT_NAK_LIST_MAX_EXTRA + 1;
    due.chunks(batch_size)
        .map(|chunk| (chunk[0], chunk[1..].to_vec()))
        .collect()
}

fn finalize_checksum(buf: &mut BytesMut) {
    buf[CHECKSUM_FIELD_OFFSET] = 0;
    buf[CHECKSUM_FIELD_OFFSET + 1] = 0;
    let sum = pgm_checksum(buf);
    buf[CHECKSUM_FIELD_OFFSET] = (sum >> 8) as u8;
    buf[CHECKSUM_FIELD_OFFSET + 1] = (sum & 0xFF) as u8;
}

/// Encode a (possibly batched) selective NAK, or a single parity NAK when
/// `is_parity` requests `rs_h` parity blocks for the transmission group
/// based at `primary_sqn`.
#[allow(clippy::too_many_arguments)]
pub fn encode_nak(
    gsi: Gsi,
    sport: u16,
    dport: u16,
    primary_sqn: Sqn,
    extra: &[Sqn],
    src_addr: [u8; 4],
    src_port: u16,
    grp_addr: [u8; 4],
    grp_port: u16,
    is_parity: bool,
) -> Bytes {
    let options: Vec<PgmOption> = if extra.is_empty() {
        Vec::new()
    } else {
        vec![PgmOption::NakList(extra.to_vec())]
    };
    let mut header = crate::wire::PgmHeader {
        sport,
        dport,
        pgm_type: PgmType::Nak,
        options: if options.is_empty() { 0 } else { crate::wire::opt_flags::OPT_PRESENT },
        checksum: 0,
        gsi,
        tsdu_length: 0,
    };
    if is_parity {
        header.options |= crate::wire::opt_flags::OPT_PARITY;
    }
    let mut buf = BytesMut::with_capacity(PGM_HEADER_LEN + 16);
    header.encode(&mut buf);
    buf.put_u32(primary_sqn.0);
    buf.put_slice(&src_addr);
    buf.put_u16(src_port);
    buf.put_slice(&grp_addr);
    buf.put_u16(grp_port);
    if !options.is_empty() {
        encode_options(&mut buf, &options);
    }
    finalize_checksum(&mut buf);
    buf.freeze()
}
