//! # Sender Loop
//!
//! Pure logic — no I/O. Segments APDUs into TPDUs, encodes ODATA/RDATA/NCF/
//! SPM/SPMR onto the wire, and decides which of the two send mutexes a
//! given packet type needs. The caller (`transport::Transport`) owns the
//! `Txw`, the injected `PacketIo`, and the actual socket calls; this module
//! never touches either.

use bytes::{BufMut, Bytes, BytesMut};

use crate::types::{Gsi, Sqn};
use crate::wire::{
    encode_options, pgm_checksum, OptFragment, OptParityPrm, PgmHeader, PgmOption, PgmType,
    PGM_HEADER_LEN,
};

const CHECKSUM_FIELD_OFFSET: usize = 6;
const OPT_LENGTH_HEADER_LEN: usize = 4;

/// Which of the two send mutexes (§5) a TPDU goes out through, and whether
/// the platform `PacketIo` should apply a no-reply-expected hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendDescriptor {
    pub router_alert: bool,
    pub no_reply_expected: bool,
}

impl SendDescriptor {
    /// Router alert is used for SPM, NAK, NCF, RDATA; plain send for ODATA
    /// and SPMR, per §4.5.
    pub fn for_type(pgm_type: PgmType) -> Self {
        let router_alert = matches!(pgm_type, PgmType::Spm | PgmType::Nak | PgmType::Ncf | PgmType::Rdata);
        SendDescriptor {
            router_alert,
            no_reply_expected: matches!(pgm_type, PgmType::Odata),
        }
    }
}

/// Maximum TSDU bytes a single TPDU can carry when fragmenting an APDU,
/// reserving room for the PGM header, OPT_LENGTH, and one OPT_FRAGMENT.
pub fn max_tsdu_fragment(max_tpdu: usize, use_varpkt_len: bool) -> usize {
    let reserved = PGM_HEADER_LEN
        + OPT_LENGTH_HEADER_LEN
        + 2 // opt_fragment tlv header (type, length)
        + OptFragment::PAYLOAD_LEN
        + if use_varpkt_len { 2 } else { 0 };
    max_tpdu.saturating_sub(reserved)
}

/// One fragment's placement within an APDU, before the first SQN is known
/// (assigned only once the TXW push happens, since fragments must be
/// pushed in order).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentSpec {
    pub offset: usize,
    pub len: usize,
}

/// Split an APDU of `apdu_len` bytes into one or more fragment placements.
/// A single fragment that fits in `max_tsdu_fragment` needs no OPT_FRAGMENT
/// at all.
pub fn segment_apdu(apdu_len: usize, max_tsdu_fragment: usize) -> Vec<FragmentSpec> {
    if apdu_len <= max_tsdu_fragment || max_tsdu_fragment == 0 {
        return vec![FragmentSpec { offset: 0, len: apdu_len }];
    }
    let mut specs = Vec::new();
    let mut offset = 0;
    while offset < apdu_len {
        let len = (apdu_len - offset).min(max_tsdu_fragment);
        specs.push(FragmentSpec { offset, len });
        offset += len;
    }
    specs
}

fn finalize_checksum(buf: &mut BytesMut) {
    buf[CHECKSUM_FIELD_OFFSET] = 0;
    buf[CHECKSUM_FIELD_OFFSET + 1] = 0;
    let sum = pgm_checksum(buf);
    buf[CHECKSUM_FIELD_OFFSET] = (sum >> 8) as u8;
    buf[CHECKSUM_FIELD_OFFSET + 1] = (sum & 0xFF) as u8;
}

fn common_header(gsi: Gsi, sport: u16, dport: u16, pgm_type: PgmType, tsdu_length: u16, has_options: bool) -> PgmHeader {
    PgmHeader {
        sport,
        dport,
        pgm_type,
        options: if has_options { crate::wire::opt_flags::OPT_PRESENT } else { 0 },
        checksum: 0,
        gsi,
        tsdu_length,
    }
}

/// Encode an ODATA (or RDATA, with `retransmit = true`) TPDU.
#[allow(clippy::too_many_arguments)]
pub fn encode_data(
    gsi: Gsi,
    sport: u16,
    dport: u16,
    retransmit: bool,
    sqn: Sqn,
    payload: &[u8],
    fragment: Option<OptFragment>,
    is_parity: bool,
) -> Bytes {
    let options: Vec<PgmOption> = fragment.into_iter().map(PgmOption::Fragment).collect();
    let mut header = common_header(
        gsi,
        sport,
        dport,
        if retransmit { PgmType::Rdata } else { PgmType::Odata },
        payload.len() as u16,
        !options.is_empty(),
    );
    if is_parity {
        header.options |= crate::wire::opt_flags::OPT_PARITY;
    }

    let mut buf = BytesMut::with_capacity(PGM_HEADER_LEN + 4 + payload.len());
    header.encode(&mut buf);
    buf.put_u32(sqn.0);
    buf.put_slice(payload);
    if !options.is_empty() {
        encode_options(&mut buf, &options);
    }
    finalize_checksum(&mut buf);
    buf.freeze()
}

/// Encode an NCF confirming a received NAK for `sqn`.
pub fn encode_ncf(gsi: Gsi, sport: u16, dport: u16, sqn: Sqn) -> Bytes {
    let header = common_header(gsi, sport, dport, PgmType::Ncf, 0, false);
    let mut buf = BytesMut::with_capacity(PGM_HEADER_LEN + 4);
    header.encode(&mut buf);
    buf.put_u32(sqn.0);
    finalize_checksum(&mut buf);
    buf.freeze()
}

/// Encode an ambient or heartbeat SPM advertising the current trail/lead.
pub fn encode_spm(
    gsi: Gsi,
    sport: u16,
    dport: u16,
    spm_sqn: Sqn,
    trail: Sqn,
    lead: Sqn,
    path_nla_octets: [u8; 4],
    path_nla_port: u16,
    parity_prm: Option<OptParityPrm>,
) -> Bytes {
    let options: Vec<PgmOption> = parity_prm.into_iter().map(PgmOption::ParityPrm).collect();
    let header = common_header(gsi, sport, dport, PgmType::Spm, 0, !options.is_empty());
    let mut buf = BytesMut::with_capacity(PGM_HEADER_LEN + 18);
    header.encode(&mut buf);
    buf.put_u32(spm_sqn.0);
    buf.put_u32(trail.0);
    buf.put_u32(lead.0);
    buf.put_slice(&path_nla_octets);
    buf.put_u16(path_nla_port);
    if !options.is_empty() {
        encode_options(&mut buf, &options);
    }
    finalize_checksum(&mut buf);
    buf.freeze()
}

/// Encode an SPMR (SPM request), body-empty per §6.
pub fn encode_spmr(gsi: Gsi, sport: u16, dport: u16) -> Bytes {
    let header = common_header(gsi, sport, dport, PgmType::Spmr, 0, false);
    let mut buf = BytesMut::with_capacity(PGM_HEADER_LEN);
    header.encode(&mut buf);
    finalize_checksum(&mut buf);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{decode_packet, PacketBody};
    use std::net::{IpAddr, Ipv4Addr};

    fn gsi() -> Gsi {
        Gsi::from_nla(&crate::types::Nla::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 7000))
    }

    #[test]
    fn single_fragment_when_apdu_fits() {
        let specs = segment_apdu(100, 1200);
        assert_eq!(specs, vec![FragmentSpec { offset: 0, len: 100 }]);
    }

    #[test]
    fn splits_oversized_apdu_into_fragments() {
        let specs = segment_apdu(2500, 1000);
        assert_eq!(specs.len(), 3);
        assert_eq!(specs[0], FragmentSpec { offset: 0, len: 1000 });
        assert_eq!(specs[2], FragmentSpec { offset: 2000, len: 500 });
    }

    #[test]
    fn encoded_odata_round_trips_through_parser() {
        let bytes = encode_data(gsi(), 7000, 7000, false, Sqn(42), b"hello", None, false);
        let parsed = decode_packet(&bytes).unwrap();
        match parsed.body {
            PacketBody::Odata { sqn, payload } => {
                assert_eq!(sqn, Sqn(42));
                assert_eq!(&payload[..], b"hello");
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn encoded_fragment_odata_carries_opt_fragment() {
        let frag = OptFragment {
            apdu_first_sqn: Sqn(10),
            frag_off: 0,
            frag_len: 2000,
        };
        let bytes = encode_data(gsi(), 7000, 7000, false, Sqn(10), &[0x41; 1000], Some(frag), false);
        let parsed = decode_packet(&bytes).unwrap();
        assert_eq!(parsed.options.len(), 1);
        match &parsed.options[0] {
            PgmOption::Fragment(f) => assert_eq!(f.frag_len, 2000),
            other => panic!("unexpected option {other:?}"),
        }
    }

    #[test]
    fn send_descriptor_routes_router_alert_correctly() {
        assert!(!SendDescriptor::for_type(PgmType::Odata).router_alert);
        assert!(SendDescriptor::for_type(PgmType::Rdata).router_alert);
        assert!(SendDescriptor::for_type(PgmType::Spm).router_alert);
        assert!(!SendDescriptor::for_type(PgmType::Spmr).router_alert);
    }

    #[test]
    fn spm_round_trips_through_parser() {
        let bytes = encode_spm(gsi(), 7000, 7000, Sqn(5), Sqn(0), Sqn(4), [10, 0, 0, 1], 7000, None);
        let parsed = decode_packet(&bytes).unwrap();
        match parsed.body {
            crate::parser::PacketBody::Spm { spm_sqn, trail, lead, .. } => {
                assert_eq!(spm_sqn, Sqn(5));
                assert_eq!(trail, Sqn(0));
                assert_eq!(lead, Sqn(4));
            }
            other => panic!("unexpected body {other:?}"),
        }
    }
}
