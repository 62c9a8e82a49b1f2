//! # Wire Codec
//!
//! PGM header, TLV option chain and checksum, encoded/decoded with
//! `bytes::{Buf, BufMut}` the same way the rest of this codebase's wire
//! formats are handled: fixed-width network-byte-order fields, a
//! `decode(&mut impl Buf) -> Result<Self, PgmError>` per type, bounds
//! checked against the remaining buffer rather than trusting length
//! fields blindly.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::PgmError;
use crate::types::{Gsi, Sqn};

/// Fixed PGM header length in bytes (sport, dport, type, options, checksum, gsi, tsdu_length).
pub const PGM_HEADER_LEN: usize = 16;

/// `options` byte flags in the PGM header.
pub mod opt_flags {
    pub const OPT_PRESENT: u8 = 0x01;
    pub const OPT_NETWORK: u8 = 0x02;
    pub const OPT_VAR_PKTLEN: u8 = 0x40;
    pub const OPT_PARITY: u8 = 0x80;
}

/// Option-chain TLV type codes. The high bit of the type byte (not part of
/// these constants) signals OPT_END when set on the wire.
pub mod opt_type {
    pub const OPT_LENGTH: u8 = 0x00;
    pub const OPT_FRAGMENT: u8 = 0x01;
    pub const OPT_NAK_LIST: u8 = 0x02;
    pub const OPT_PARITY_PRM: u8 = 0x08;
    pub const OPT_PARITY_GRP: u8 = 0x09;
}

const OPT_END_MASK: u8 = 0x80;
const OPT_TYPE_MASK: u8 = 0x7F;

/// Maximum additional SQNs an OPT_NAK_LIST may carry (the primary nak_sqn
/// plus up to 62 listed ones, for 63 total per invariant #3).
pub const OPT_NAK_LIST_MAX_EXTRA: usize = 62;

/// PGM packet type codes, matching the values used by reference PGM stacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PgmType {
    Spm = 0x00,
    Poll = 0x01,
    Polr = 0x02,
    Odata = 0x04,
    Rdata = 0x05,
    Nak = 0x08,
    Nnak = 0x09,
    Ncf = 0x0A,
    Spmr = 0x0C,
}

impl PgmType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x00 => PgmType::Spm,
            0x01 => PgmType::Poll,
            0x02 => PgmType::Polr,
            0x04 => PgmType::Odata,
            0x05 => PgmType::Rdata,
            0x08 => PgmType::Nak,
            0x09 => PgmType::Nnak,
            0x0A => PgmType::Ncf,
            0x0C => PgmType::Spmr,
            _ => return None,
        })
    }
}

/// The fixed 16-byte PGM header common to every TPDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PgmHeader {
    pub sport: u16,
    pub dport: u16,
    pub pgm_type: PgmType,
    pub options: u8,
    pub checksum: u16,
    pub gsi: Gsi,
    pub tsdu_length: u16,
}

impl PgmHeader {
    pub fn has_options(&self) -> bool {
        self.options & opt_flags::OPT_PRESENT != 0
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.sport);
        buf.put_u16(self.dport);
        buf.put_u8(self.pgm_type as u8);
        buf.put_u8(self.options);
        buf.put_u16(self.checksum);
        buf.put_slice(&self.gsi.0);
        buf.put_u16(self.tsdu_length);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, PgmError> {
        if buf.remaining() < PGM_HEADER_LEN {
            return Err(PgmError::Malformed("header truncated".into()));
        }
        let sport = buf.get_u16();
        let dport = buf.get_u16();
        let type_byte = buf.get_u8();
        let pgm_type = PgmType::from_u8(type_byte)
            .ok_or_else(|| PgmError::Malformed(format!("unknown pgm_type {type_byte:#04x}")))?;
        let options = buf.get_u8();
        let checksum = buf.get_u16();
        let mut gsi = [0u8; 6];
        buf.copy_to_slice(&mut gsi);
        let tsdu_length = buf.get_u16();
        Ok(PgmHeader {
            sport,
            dport,
            pgm_type,
            options,
            checksum,
            gsi: Gsi(gsi),
            tsdu_length,
        })
    }
}

/// One parsed OPT_FRAGMENT body: identifies the APDU a TPDU belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptFragment {
    pub apdu_first_sqn: Sqn,
    pub frag_off: u32,
    pub frag_len: u32,
}

impl OptFragment {
    /// Encoded payload length excluding the 2-byte TLV header: reserved(1)
    /// + first_sqn(4) + frag_off(4) + frag_len(4) + reserved(4) = 17 bytes,
    /// matching the parallel parity-stripe width the FEC path reserves for it.
    pub const PAYLOAD_LEN: usize = 17;

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(0); // reserved
        buf.put_u32(self.apdu_first_sqn.0);
        buf.put_u32(self.frag_off);
        buf.put_u32(self.frag_len);
        buf.put_u32(0); // reserved
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, PgmError> {
        if buf.remaining() < Self::PAYLOAD_LEN {
            return Err(PgmError::Malformed("opt_fragment truncated".into()));
        }
        let _reserved = buf.get_u8();
        let apdu_first_sqn = Sqn(buf.get_u32());
        let frag_off = buf.get_u32();
        let frag_len = buf.get_u32();
        let _reserved2 = buf.get_u32();
        Ok(OptFragment {
            apdu_first_sqn,
            frag_off,
            frag_len,
        })
    }

    /// The "encoded null" sentinel used when a group member has no
    /// OPT_FRAGMENT, so the parity stripe still has a fixed-width slot.
    pub fn null_sentinel() -> [u8; Self::PAYLOAD_LEN] {
        let mut buf = [0u8; Self::PAYLOAD_LEN];
        buf[0] = 0x01; // reserved bit marks "absent"
        buf
    }
}

/// Parity parameters advertised in an SPM's OPT_PARITY_PRM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptParityPrm {
    pub parity_prm_tgs: u32,
    pub proactive: bool,
    pub on_demand: bool,
}

impl OptParityPrm {
    pub const PAYLOAD_LEN: usize = 6;

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(0); // reserved
        buf.put_u32(self.parity_prm_tgs);
        let mut mode = 0u8;
        if self.proactive {
            mode |= 0x01;
        }
        if self.on_demand {
            mode |= 0x02;
        }
        buf.put_u8(mode);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, PgmError> {
        if buf.remaining() < Self::PAYLOAD_LEN {
            return Err(PgmError::Malformed("opt_parity_prm truncated".into()));
        }
        let _reserved = buf.get_u8();
        let parity_prm_tgs = buf.get_u32();
        let mode = buf.get_u8();
        Ok(OptParityPrm {
            parity_prm_tgs,
            proactive: mode & 0x01 != 0,
            on_demand: mode & 0x02 != 0,
        })
    }
}

/// One decoded option from the TLV chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PgmOption {
    Fragment(OptFragment),
    NakList(Vec<Sqn>),
    ParityPrm(OptParityPrm),
    ParityGrp { tg_sqn: Sqn },
}

/// Encode the OPT_LENGTH header, the supplied options, and terminate the
/// chain by setting the OPT_END bit on the final option's type byte.
pub fn encode_options(buf: &mut BytesMut, options: &[PgmOption]) {
    if options.is_empty() {
        return;
    }
    // OPT_LENGTH: type=0x00, length=4, total_length(u16). total_length is
    // filled in after we know the encoded size of the rest of the chain.
    let total_len_pos = buf.len() + 2;
    buf.put_u8(opt_type::OPT_LENGTH);
    buf.put_u8(4);
    buf.put_u16(0); // patched below

    let body_start = buf.len();
    for (i, opt) in options.iter().enumerate() {
        let is_last = i == options.len() - 1;
        encode_one_option(buf, opt, is_last);
    }
    let total_len = (buf.len() - body_start + 4) as u16;
    buf[total_len_pos..total_len_pos + 2].copy_from_slice(&total_len.to_be_bytes());
}

fn encode_one_option(buf: &mut BytesMut, opt: &PgmOption, is_last: bool) {
    let (base_type, len_byte) = match opt {
        PgmOption::Fragment(_) => (opt_type::OPT_FRAGMENT, 2 + OptFragment::PAYLOAD_LEN),
        PgmOption::NakList(extra) => (
            opt_type::OPT_NAK_LIST,
            2 + extra.len().min(OPT_NAK_LIST_MAX_EXTRA) * 4,
        ),
        PgmOption::ParityPrm(_) => (opt_type::OPT_PARITY_PRM, 2 + OptParityPrm::PAYLOAD_LEN),
        PgmOption::ParityGrp { .. } => (opt_type::OPT_PARITY_GRP, 2 + 5),
    };
    let type_byte = if is_last {
        base_type | OPT_END_MASK
    } else {
        base_type
    };
    buf.put_u8(type_byte);
    buf.put_u8(len_byte as u8);
    match opt {
        PgmOption::Fragment(frag) => frag.encode(buf),
        PgmOption::NakList(extra) => {
            for sqn in extra.iter().take(OPT_NAK_LIST_MAX_EXTRA) {
                buf.put_u32(sqn.0);
            }
        }
        PgmOption::ParityPrm(prm) => prm.encode(buf),
        PgmOption::ParityGrp { tg_sqn } => {
            buf.put_u8(0);
            buf.put_u32(tg_sqn.0);
        }
    }
}

/// Parse the TLV option chain starting immediately after OPT_LENGTH.
/// Bounds-checks every option's declared length against the remaining
/// buffer and stops at the option whose type byte has the OPT_END bit set.
pub fn decode_options(buf: &mut impl Buf) -> Result<Vec<PgmOption>, PgmError> {
    if buf.remaining() < 4 {
        return Err(PgmError::Malformed("option chain truncated".into()));
    }
    let opt_length_type = buf.get_u8();
    if opt_length_type & OPT_TYPE_MASK != opt_type::OPT_LENGTH {
        return Err(PgmError::Malformed("option chain missing OPT_LENGTH".into()));
    }
    let opt_length_len = buf.get_u8();
    if opt_length_len != 4 {
        return Err(PgmError::Malformed("OPT_LENGTH has wrong length".into()));
    }
    let total_length = buf.get_u16() as usize;
    if total_length < 4 {
        return Err(PgmError::Malformed("OPT_LENGTH total_length too small".into()));
    }
    let mut remaining_budget = total_length - 4;
    if buf.remaining() < remaining_budget {
        return Err(PgmError::Malformed("option chain exceeds tpdu".into()));
    }

    let mut options = Vec::new();
    loop {
        if buf.remaining() < 2 {
            return Err(PgmError::Malformed("option truncated".into()));
        }
        let type_byte = buf.get_u8();
        let opt_end = type_byte & OPT_END_MASK != 0;
        let opt_type = type_byte & OPT_TYPE_MASK;
        let len = buf.get_u8() as usize;
        if len < 2 {
            return Err(PgmError::Malformed("option length too small".into()));
        }
        let payload_len = len - 2;
        if buf.remaining() < payload_len || remaining_budget < len {
            return Err(PgmError::Malformed("option exceeds chain budget".into()));
        }
        remaining_budget -= len;

        match opt_type {
            opt_type::OPT_FRAGMENT => {
                options.push(PgmOption::Fragment(OptFragment::decode(buf)?));
            }
            opt_type::OPT_NAK_LIST => {
                if payload_len % 4 != 0 {
                    return Err(PgmError::Malformed("opt_nak_list misaligned".into()));
                }
                let count = payload_len / 4;
                if count > OPT_NAK_LIST_MAX_EXTRA {
                    return Err(PgmError::Malformed("opt_nak_list too long".into()));
                }
                let mut sqns = Vec::with_capacity(count);
                for _ in 0..count {
                    sqns.push(Sqn(buf.get_u32()));
                }
                options.push(PgmOption::NakList(sqns));
            }
            opt_type::OPT_PARITY_PRM => {
                options.push(PgmOption::ParityPrm(OptParityPrm::decode(buf)?));
            }
            opt_type::OPT_PARITY_GRP => {
                if payload_len < 5 {
                    return Err(PgmError::Malformed("opt_parity_grp truncated".into()));
                }
                let _reserved = buf.get_u8();
                let tg_sqn = Sqn(buf.get_u32());
                buf.advance(payload_len - 5);
                options.push(PgmOption::ParityGrp { tg_sqn });
            }
            other => {
                // Unknown option: skip its payload, keep parsing the chain.
                buf.advance(payload_len);
                tracing::trace!(opt_type = other, "skipping unrecognised option");
            }
        }

        if opt_end {
            break;
        }
    }
    Ok(options)
}

/// 16-bit ones-complement checksum over `data`, the header's checksum field
/// assumed to already be zeroed by the caller before this is computed.
pub fn pgm_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Verify a received TPDU's checksum. An all-zero checksum field is treated
/// as "unchecked" per the SPM exception in the wire format section.
pub fn verify_checksum(full_tpdu: &[u8], checksum_field_offset: usize) -> bool {
    if full_tpdu.len() < checksum_field_offset + 2 {
        return false;
    }
    let received = u16::from_be_bytes([
        full_tpdu[checksum_field_offset],
        full_tpdu[checksum_field_offset + 1],
    ]);
    if received == 0 {
        return true;
    }
    let mut scratch = BytesMut::from(full_tpdu);
    scratch[checksum_field_offset] = 0;
    scratch[checksum_field_offset + 1] = 0;
    pgm_checksum(&scratch) == received
}

/// A fully encoded TPDU ready for the packet I/O layer.
#[derive(Debug, Clone)]
pub struct Tpdu {
    pub header: PgmHeader,
    pub bytes: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn sample_header() -> PgmHeader {
        PgmHeader {
            sport: 7000,
            dport: 7000,
            pgm_type: PgmType::Odata,
            options: 0,
            checksum: 0,
            gsi: Gsi::from_nla(&crate::types::Nla::new(
                std::net::IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                7000,
            )),
            tsdu_length: 4,
        }
    }

    #[test]
    fn header_round_trips() {
        let header = sample_header();
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), PGM_HEADER_LEN);
        let mut cursor = &buf[..];
        let decoded = PgmHeader::decode(&mut cursor).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn header_rejects_unknown_type() {
        let mut buf = BytesMut::new();
        buf.put_u16(1);
        buf.put_u16(1);
        buf.put_u8(0x7F); // not a recognised pgm_type
        buf.put_u8(0);
        buf.put_u16(0);
        buf.put_slice(&[0u8; 6]);
        buf.put_u16(0);
        let mut cursor = &buf[..];
        assert!(PgmHeader::decode(&mut cursor).is_err());
    }

    #[test]
    fn checksum_detects_corruption() {
        let mut data = vec![0u8; 20];
        data[5] = 0xAB;
        let sum = pgm_checksum(&data);
        let mut with_sum = data.clone();
        with_sum[2] = (sum >> 8) as u8;
        with_sum[3] = (sum & 0xFF) as u8;
        assert!(verify_checksum(&with_sum, 2));
        with_sum[10] ^= 0xFF;
        assert!(!verify_checksum(&with_sum, 2));
    }

    #[test]
    fn zero_checksum_is_unchecked() {
        let data = vec![0u8; 20];
        assert!(verify_checksum(&data, 2));
    }

    #[test]
    fn options_round_trip_fragment_and_nak_list() {
        let opts = vec![
            PgmOption::Fragment(OptFragment {
                apdu_first_sqn: Sqn(100),
                frag_off: 0,
                frag_len: 2048,
            }),
            PgmOption::NakList(vec![Sqn(11), Sqn(12), Sqn(13)]),
        ];
        let mut buf = BytesMut::new();
        encode_options(&mut buf, &opts);
        let mut cursor = &buf[..];
        let decoded = decode_options(&mut cursor).unwrap();
        assert_eq!(decoded.len(), 2);
        match &decoded[0] {
            PgmOption::Fragment(f) => {
                assert_eq!(f.apdu_first_sqn, Sqn(100));
                assert_eq!(f.frag_len, 2048);
            }
            other => panic!("unexpected option {other:?}"),
        }
        match &decoded[1] {
            PgmOption::NakList(extra) => assert_eq!(extra.len(), 3),
            other => panic!("unexpected option {other:?}"),
        }
    }

    #[test]
    fn nak_list_rejects_over_62_extra_sqns() {
        // 63 extra SQNs: one past OPT_NAK_LIST_MAX_EXTRA, and still small
        // enough that payload_len (252) and the option's own u8 length
        // field (254) both stay within range, so decode_options actually
        // reaches the count check rather than failing on buffer bounds.
        let extra: Vec<Sqn> = (0..(OPT_NAK_LIST_MAX_EXTRA as u32 + 1)).map(Sqn).collect();
        let payload_len = extra.len() * 4;
        let opt_len = 2 + payload_len;
        assert!(opt_len <= u8::MAX as usize);
        let mut buf = BytesMut::new();
        buf.put_u8(opt_type::OPT_LENGTH);
        buf.put_u8(4);
        buf.put_u16((4 + opt_len) as u16);
        buf.put_u8(opt_type::OPT_NAK_LIST | OPT_END_MASK);
        buf.put_u8(opt_len as u8);
        for sqn in &extra {
            buf.put_u32(sqn.0);
        }
        let mut cursor = &buf[..];
        assert!(decode_options(&mut cursor).is_err());
    }
}
