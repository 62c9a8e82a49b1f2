//! # Cumulative Stats Counters
//!
//! Per-transport sender/receiver counters, exposed from the control
//! surface as a JSON snapshot the same way the rest of this codebase's
//! stats structs derive `Serialize` rather than exporting a bespoke
//! metrics format.

use serde::Serialize;

/// Sender-side cumulative counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SenderStats {
    pub data_msgs_sent: u64,
    pub data_bytes_sent: u64,
    pub selective_naks_received: u64,
    pub parity_naks_received: u64,
    pub rdata_msgs_sent: u64,
    pub ncfs_sent: u64,
    pub spms_sent: u64,
    pub fec_repairs_sent: u64,
    pub naks_discarded_not_in_window: u64,
}

/// Receiver-side cumulative counters, named to match the retry-ceiling
/// and duplicate-detection invariants directly.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReceiverStats {
    pub data_msgs_received: u64,
    pub data_bytes_received: u64,
    pub dup_datas: u64,
    pub selective_naks_sent: u64,
    pub parity_naks_sent: u64,
    pub naks_failed_ncf_retries_exceeded: u64,
    pub naks_failed_data_retries_exceeded: u64,
    pub fec_recoveries: u64,
    pub apdu_lost: u64,
    pub packets_discarded: u64,
    pub malformed: u64,
    pub cksum_errors: u64,
    pub peer_unknown_nla_drops: u64,
    pub spmr_sent: u64,
}

/// Per-peer snapshot for monitoring, reconstructed on demand from a
/// `Peer` rather than kept live (avoids taking the peer lock on every
/// counter bump just to keep a duplicate copy in sync).
#[derive(Debug, Clone, Serialize)]
pub struct PeerStats {
    pub tsi: String,
    pub rxw_trail: u32,
    pub rxw_lead: Option<u32>,
}
