//! # Scenario tests: sender/receiver state machines through the wire format
//!
//! These exercise the pure-logic modules (`sender`, `receiver`, `txw`, `rxw`,
//! `fec`, `parser`) end to end without any actual socket I/O — "the network"
//! is simulated by hand, dropping or reordering encoded `Bytes` between a
//! sender-side `Txw` and a receiver-side `Rxw`, the same way the wire-level
//! roundtrips are driven in each module's own unit tests.

use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use pgm_core::collab::ThreadRandomSource;
use pgm_core::fec::{decode_group, encode_parity, FecConfig};
use pgm_core::parser::{decode_packet, PacketBody};
use pgm_core::receiver::{apply_spm, batch_naks, encode_nak};
use pgm_core::rxw::{InsertOutcome, NakTiming, Rxw};
use pgm_core::sender::{encode_data, max_tsdu_fragment, segment_apdu};
use pgm_core::txw::Txw;
use pgm_core::types::{Gsi, Nla, Sqn};

fn gsi() -> Gsi {
    Gsi::from_nla(&Nla::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 7000))
}

fn timing() -> NakTiming {
    NakTiming {
        nak_bo_ivl: Duration::from_millis(10),
        nak_rpt_ivl: Duration::from_millis(10),
        nak_rdata_ivl: Duration::from_millis(10),
        nak_ncf_retries: 2,
        nak_data_retries: 2,
    }
}

// ─── S1: two-fragment APDU, lossless ───────────────────────────────────────

#[test]
fn s1_fragmented_apdu_reassembles_losslessly() {
    let apdu = vec![0xABu8; 200];
    let max_frag = max_tsdu_fragment(140, false);
    let specs = segment_apdu(apdu.len(), max_frag);
    assert_eq!(specs.len(), 2, "200B apdu over a small tpdu should split in two");

    let mut txw = Txw::new(16, 4);
    let mut rxw = Rxw::new(16, timing());
    let rng = ThreadRandomSource;
    let now = quanta::Instant::now();

    let first_sqn = txw.next_lead();
    for spec in &specs {
        let chunk = Bytes::copy_from_slice(&apdu[spec.offset..spec.offset + spec.len]);
        let sqn = txw.push(chunk.clone(), 0, None);
        let frag = pgm_core::wire::OptFragment {
            apdu_first_sqn: first_sqn,
            frag_off: spec.offset as u32,
            frag_len: apdu.len() as u32,
        };
        let bytes = encode_data(gsi(), 7000, 7000, false, sqn, &chunk, Some(frag), false);
        let parsed = decode_packet(&bytes).unwrap();
        match parsed.body {
            PacketBody::Odata { sqn, payload } => {
                let fragment = parsed.options.iter().find_map(|o| match o {
                    pgm_core::wire::PgmOption::Fragment(f) => Some(*f),
                    _ => None,
                });
                rxw.insert_data(sqn, payload, fragment, false, now, &rng).unwrap();
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    let out = rxw.read(1024);
    assert_eq!(&out.data[..], &apdu[..]);
    assert!(!out.hit_gap);
    assert!(out.apdu_lost.is_empty());
}

// ─── S2: single packet lost, recovered via NAK + RDATA ─────────────────────

#[test]
fn s2_single_loss_recovered_via_nak_retransmit() {
    let mut txw = Txw::new(16, 4);
    let mut rxw = Rxw::new(16, timing());
    let rng = ThreadRandomSource;
    let t0 = quanta::Instant::now();

    let sqns: Vec<Sqn> = (0..3).map(|i| txw.push(Bytes::from(vec![i as u8; 4]), 0, None)).collect();

    // Deliver 0 and 2; drop 1.
    for &sqn in &[sqns[0], sqns[2]] {
        let entry = txw.peek(sqn).unwrap();
        rxw.insert_data(sqn, entry.payload.clone(), None, false, t0, &rng).unwrap();
    }
    let out = rxw.read(1024);
    assert_eq!(&out.data[..], &[0u8, 0, 0, 0]); // only sqn 0 is contiguous
    assert!(out.hit_gap);

    // Back-off expires -> NAK due for the gap at sqn 1.
    let t1 = t0 + Duration::from_millis(50);
    let due = rxw.poll_expired_backoff(t1);
    assert_eq!(due, vec![sqns[1]]);
    let batches = batch_naks(&due);
    assert_eq!(batches.len(), 1);
    let nak_bytes = encode_nak(
        gsi(), 7000, 7000, batches[0].0, &batches[0].1,
        [10, 0, 0, 1], 7000, [239, 0, 0, 1], 7000, false,
    );
    let parsed = decode_packet(&nak_bytes).unwrap();
    let nak_sqn = match parsed.body {
        PacketBody::Nak { sqn, .. } => sqn,
        other => panic!("unexpected body {other:?}"),
    };
    assert_eq!(nak_sqn, sqns[1]);

    // Sender side: NAK arrives, queues a retransmit, RDATA goes back out.
    txw.retransmit_push(nak_sqn, false, 0);
    let (resend_sqn, payload, is_parity, _) = txw.retransmit_try_pop().unwrap();
    assert_eq!(resend_sqn, sqns[1]);
    assert!(!is_parity);
    let rdata = encode_data(gsi(), 7000, 7000, true, resend_sqn, &payload.unwrap(), None, false);
    let parsed = decode_packet(&rdata).unwrap();
    match parsed.body {
        PacketBody::Rdata { sqn, payload } => {
            rxw.insert_data(sqn, payload, None, false, t1, &rng).unwrap();
        }
        other => panic!("unexpected body {other:?}"),
    }

    let out = rxw.read(1024);
    assert_eq!(&out.data[..], &[1u8, 1, 1, 1, 2, 2, 2, 2]);
    assert!(!out.hit_gap);
}

// ─── S3: burst loss exceeds retry ceiling -> sealed LOST ───────────────────

#[test]
fn s3_burst_loss_exceeding_retries_is_sealed_lost() {
    let mut rxw = Rxw::new(64, timing());
    let rng = ThreadRandomSource;
    let t0 = quanta::Instant::now();

    rxw.insert_data(Sqn(0), Bytes::from_static(b"x"), None, false, t0, &rng).unwrap();
    // Burst gap: sqns 1..=4 never arrive, sqn 5 does.
    rxw.insert_data(Sqn(5), Bytes::from_static(b"y"), None, false, t0, &rng).unwrap();

    let t1 = t0 + Duration::from_millis(50);
    let due = rxw.poll_expired_backoff(t1);
    assert_eq!(due.len(), 4);

    // nak_ncf_retries = 2: two more expiries push every gap SQN to LOST.
    let mut t = t1;
    for _ in 0..2 {
        t += Duration::from_millis(50);
        let _ = rxw.poll_expired_wait_ncf(t, &rng);
        t += Duration::from_millis(50);
        let _ = rxw.poll_expired_backoff(t);
    }
    t += Duration::from_millis(50);
    let (lost, _) = rxw.poll_expired_wait_ncf(t, &rng);
    assert_eq!(lost.len(), 4);

    let out = rxw.read(1024);
    assert_eq!(&out.data[..], b"xy");
    assert_eq!(out.skipped_lost.len(), 4);
}

// ─── S4: proactive parity recovers an erasure (k=4, n=6, h=2) ──────────────

struct XorParity;

impl pgm_core::collab::FecCodec for XorParity {
    fn encode(&self, data_blocks: &[Bytes], h: usize) -> Result<Vec<Bytes>, pgm_core::error::PgmError> {
        let len = data_blocks.iter().map(|b| b.len()).max().unwrap_or(0);
        let mut parity = vec![0u8; len];
        for block in data_blocks {
            for (i, byte) in block.iter().enumerate() {
                parity[i] ^= byte;
            }
        }
        Ok(std::iter::repeat(Bytes::from(parity)).take(h).collect())
    }

    fn decode(&self, blocks: &[Option<Bytes>], k: usize) -> Result<Vec<Bytes>, pgm_core::error::PgmError> {
        let missing: Vec<usize> = blocks[..k].iter().enumerate().filter(|(_, b)| b.is_none()).map(|(i, _)| i).collect();
        if missing.is_empty() {
            return Ok(blocks[..k].iter().map(|b| b.clone().unwrap()).collect());
        }
        let parity = blocks[k..].iter().flatten().next().unwrap();
        let mut recovered = parity.to_vec();
        for (i, b) in blocks[..k].iter().enumerate() {
            if i == missing[0] {
                continue;
            }
            if let Some(b) = b {
                for (j, byte) in b.iter().enumerate() {
                    recovered[j] ^= byte;
                }
            }
        }
        let mut out: Vec<Bytes> = blocks[..k].iter().map(|b| b.clone().unwrap_or_default()).collect();
        out[missing[0]] = Bytes::from(recovered);
        Ok(out)
    }
}

#[test]
fn s4_proactive_parity_recovers_erasure() {
    let codec = XorParity;
    let cfg = FecConfig {
        rs_n: 6,
        rs_k: 4,
        tg_sqn_shift: 2,
        use_proactive_parity: true,
        use_ondemand_parity: false,
        use_varpkt_len: false,
    };
    let data = vec![
        Some(Bytes::from_static(b"AAAA")),
        Some(Bytes::from_static(b"BBBB")),
        Some(Bytes::from_static(b"CCCC")),
        Some(Bytes::from_static(b"DDDD")),
    ];
    let parity = encode_parity(&codec, &cfg, &data, cfg.h()).unwrap();
    assert_eq!(parity.len(), cfg.h() as usize);

    // sqn 2 ("CCCC") was lost on the wire; only the first parity block made it.
    let mut with_erasure = data;
    with_erasure[2] = None;
    with_erasure.push(Some(parity[0].clone()));
    let reconstructed = decode_group(&codec, &cfg, &with_erasure).unwrap();

    // Feed the recovered block into the receive window as a parity-sourced insert.
    let mut rxw = Rxw::new(64, timing());
    let rng = ThreadRandomSource;
    let now = quanta::Instant::now();
    rxw.insert_data(Sqn(0), reconstructed[0].clone(), None, false, now, &rng).unwrap();
    rxw.insert_data(Sqn(1), reconstructed[1].clone(), None, false, now, &rng).unwrap();
    let outcome = rxw.insert_data(Sqn(2), reconstructed[2].clone(), None, true, now, &rng).unwrap();
    assert_eq!(outcome, InsertOutcome::Accepted); // sqn 2 was never seen before, so first sighting
    rxw.insert_data(Sqn(3), reconstructed[3].clone(), None, false, now, &rng).unwrap();

    let out = rxw.read(1024);
    assert_eq!(&out.data[..], b"AAAABBBBCCCCDDDD");
}

// ─── S5: OPT_NAK_LIST batches 10 gaps into one NAK ──────────────────────────

#[test]
fn s5_ten_gaps_batch_into_a_single_nak_list() {
    let due: Vec<Sqn> = (100..110u32).map(Sqn).collect();
    let batches = batch_naks(&due);
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].0, Sqn(100));
    assert_eq!(batches[0].1.len(), 9);

    let bytes = encode_nak(
        gsi(), 7000, 7000, batches[0].0, &batches[0].1,
        [10, 0, 0, 1], 7000, [239, 0, 0, 1], 7000, false,
    );
    let parsed = decode_packet(&bytes).unwrap();
    let mut listed = parsed.nak_list();
    listed.sort();
    assert_eq!(listed, (101..110u32).map(Sqn).collect::<Vec<_>>());
}

// ─── S6: peer expiry then a fresh peer replaces it ─────────────────────────

#[test]
fn s6_peer_expires_then_fresh_peer_created_for_same_tsi() {
    use pgm_core::peer::Peer;
    use pgm_core::types::Tsi;

    let now = quanta::Instant::now();
    let tsi = Tsi::new(gsi(), 7000);
    let peer = Peer::new(
        tsi, None, None, None, now,
        Duration::from_millis(100), Duration::from_millis(10), 64, timing(),
    );
    assert!(!peer.is_expired(now));
    let later = now + Duration::from_millis(150);
    assert!(peer.is_expired(later));

    // A fresh peer for the same TSI starts with an empty RXW trail again.
    let fresh = Peer::new(
        tsi, None, None, None, later,
        Duration::from_millis(100), Duration::from_millis(10), 64, timing(),
    );
    assert!(!fresh.is_expired(later));
    assert_eq!(fresh.state.lock().unwrap().rxw.trail(), Sqn::ZERO);

    // SPM application on the fresh peer's state starts clean too.
    let mut state = fresh.state.lock().unwrap();
    assert_eq!(apply_spm(&mut state, Sqn(5), Sqn(0), Sqn(4), None), pgm_core::receiver::SpmOutcome::Updated);
    assert_eq!(state.spm_lead, 4);
}

// ─── Duplicate handling after a successful insert ──────────────────────────

#[test]
fn duplicate_rdata_after_insert_is_reported_as_duplicate() {
    let mut rxw = Rxw::new(16, timing());
    let rng = ThreadRandomSource;
    let now = quanta::Instant::now();
    rxw.insert_data(Sqn(0), Bytes::from_static(b"a"), None, false, now, &rng).unwrap();
    let dup = rxw.insert_data(Sqn(0), Bytes::from_static(b"a-again"), None, false, now, &rng).unwrap();
    assert_eq!(dup, InsertOutcome::Duplicate);
}
