//! # Packet Parser & Dispatcher
//!
//! Validates framing and checksum, decodes the packet-type-specific body
//! and the TLV option chain, and classifies the result for routing. The
//! routing table itself (§4.4) is applied by the receiver loop, which
//! holds the transport/peer context this module deliberately doesn't
//! need.

use bytes::{Buf, Bytes};
use std::net::{IpAddr, Ipv4Addr};

use crate::error::PgmError;
use crate::types::{Nla, Sqn};
use crate::wire::{decode_options, opt_flags, verify_checksum, PgmHeader, PgmOption, PGM_HEADER_LEN};

const CHECKSUM_FIELD_OFFSET: usize = 6;

/// Packet-type-specific body, decoded separately from the common header.
#[derive(Debug, Clone)]
pub enum PacketBody {
    Odata { sqn: Sqn, payload: Bytes },
    Rdata { sqn: Sqn, payload: Bytes },
    Spm { spm_sqn: Sqn, trail: Sqn, lead: Sqn, path_nla: Nla },
    Ncf { sqn: Sqn },
    Nak { sqn: Sqn, src_nla: Nla, grp_nla: Nla },
    Nnak { sqn: Sqn },
    Spmr,
    Polr,
}

/// A fully decoded TPDU: header, body, and option chain.
#[derive(Debug, Clone)]
pub struct ParsedPacket {
    pub header: PgmHeader,
    pub body: PacketBody,
    pub options: Vec<PgmOption>,
}

impl ParsedPacket {
    pub fn is_parity(&self) -> bool {
        self.header.options & opt_flags::OPT_PARITY != 0
    }

    pub fn nak_list(&self) -> Vec<Sqn> {
        self.options
            .iter()
            .find_map(|o| match o {
                PgmOption::NakList(list) => Some(list.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }
}

fn decode_nla(buf: &mut impl Buf) -> Result<Nla, PgmError> {
    if buf.remaining() < 6 {
        return Err(PgmError::Malformed("nla truncated".into()));
    }
    let mut octets = [0u8; 4];
    buf.copy_to_slice(&mut octets);
    let port = buf.get_u16();
    Ok(Nla::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
}

/// Decode a full TPDU: header, checksum verification, body, and options.
pub fn decode_packet(raw: &[u8]) -> Result<ParsedPacket, PgmError> {
    if raw.len() < PGM_HEADER_LEN {
        return Err(PgmError::Malformed("tpdu shorter than pgm header".into()));
    }
    if !verify_checksum(raw, CHECKSUM_FIELD_OFFSET) {
        return Err(PgmError::ChecksumError);
    }
    let mut cursor = raw;
    let header = PgmHeader::decode(&mut cursor)?;

    let body = match header.pgm_type {
        crate::wire::PgmType::Odata => {
            if cursor.remaining() < 4 {
                return Err(PgmError::Malformed("odata body truncated".into()));
            }
            let sqn = Sqn(cursor.get_u32());
            let tsdu_len = header.tsdu_length as usize;
            if cursor.remaining() < tsdu_len {
                return Err(PgmError::Malformed("odata tsdu truncated".into()));
            }
            let payload = Bytes::copy_from_slice(&cursor[..tsdu_len]);
            cursor.advance(tsdu_len);
            PacketBody::Odata { sqn, payload }
        }
        crate::wire::PgmType::Rdata => {
            if cursor.remaining() < 4 {
                return Err(PgmError::Malformed("rdata body truncated".into()));
            }
            let sqn = Sqn(cursor.get_u32());
            let tsdu_len = header.tsdu_length as usize;
            if cursor.remaining() < tsdu_len {
                return Err(PgmError::Malformed("rdata tsdu truncated".into()));
            }
            let payload = Bytes::copy_from_slice(&cursor[..tsdu_len]);
            cursor.advance(tsdu_len);
            PacketBody::Rdata { sqn, payload }
        }
        crate::wire::PgmType::Spm => {
            if cursor.remaining() < 12 {
                return Err(PgmError::Malformed("spm body truncated".into()));
            }
            let spm_sqn = Sqn(cursor.get_u32());
            let trail = Sqn(cursor.get_u32());
            let lead = Sqn(cursor.get_u32());
            let path_nla = decode_nla(&mut cursor)?;
            PacketBody::Spm {
                spm_sqn,
                trail,
                lead,
                path_nla,
            }
        }
        crate::wire::PgmType::Ncf => {
            if cursor.remaining() < 4 {
                return Err(PgmError::Malformed("ncf body truncated".into()));
            }
            PacketBody::Ncf { sqn: Sqn(cursor.get_u32()) }
        }
        crate::wire::PgmType::Nak => {
            if cursor.remaining() < 4 {
                return Err(PgmError::Malformed("nak body truncated".into()));
            }
            let sqn = Sqn(cursor.get_u32());
            let src_nla = decode_nla(&mut cursor)?;
            let grp_nla = decode_nla(&mut cursor)?;
            PacketBody::Nak { sqn, src_nla, grp_nla }
        }
        crate::wire::PgmType::Nnak => {
            if cursor.remaining() < 4 {
                return Err(PgmError::Malformed("nnak body truncated".into()));
            }
            PacketBody::Nnak { sqn: Sqn(cursor.get_u32()) }
        }
        crate::wire::PgmType::Spmr => PacketBody::Spmr,
        crate::wire::PgmType::Poll | crate::wire::PgmType::Polr => PacketBody::Polr,
    };

    let options = if header.has_options() {
        decode_options(&mut cursor)?
    } else {
        Vec::new()
    };

    Ok(ParsedPacket { header, body, options })
}

/// Acceptance predicate: is this NAK destined to us as the source?
pub fn nak_destined_to_source(
    nak_src_nla: Nla,
    nak_grp_nla: Nla,
    dport: u16,
    our_interface_nla: Nla,
    our_send_multiaddr: Nla,
    our_src_port_in_tsi: u16,
) -> bool {
    nak_src_nla == our_interface_nla && nak_grp_nla == our_send_multiaddr && dport == our_src_port_in_tsi
}

/// Acceptance predicate: is this downstream data addressed to us?
pub fn is_downstream_for_us(dport: u16, our_dport: u16) -> bool {
    dport == our_dport
}
