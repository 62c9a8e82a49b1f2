#![no_main]

use std::time::Duration;

use libfuzzer_sys::fuzz_target;
use pgm_core::collab::ThreadRandomSource;
use pgm_core::parser::{decode_packet, PacketBody};
use pgm_core::rxw::{NakTiming, Rxw};

/// Fuzz the receive window's state machine with arbitrary wire-format
/// bytes, each chunk treated as one TPDU.
///
/// This exercises `decode_packet` plus `Rxw::insert_data`/`read` against
/// attacker-controlled ODATA/RDATA bodies and OPT_FRAGMENT chains — the
/// window must never panic, regardless of how malformed or adversarial
/// the reassembly state becomes.
fuzz_target!(|data: &[u8]| {
    let timing = NakTiming {
        nak_bo_ivl: Duration::from_millis(10),
        nak_rpt_ivl: Duration::from_millis(10),
        nak_rdata_ivl: Duration::from_millis(10),
        nak_ncf_retries: 2,
        nak_data_retries: 2,
    };
    let mut rxw = Rxw::new(64, timing);
    let rng = ThreadRandomSource;
    let now = quanta::Instant::now();

    for chunk in data.chunks(64) {
        if let Ok(parsed) = decode_packet(chunk) {
            let (sqn, payload, is_parity) = match parsed.body {
                PacketBody::Odata { sqn, payload } => (sqn, payload, parsed.is_parity()),
                PacketBody::Rdata { sqn, payload } => (sqn, payload, parsed.is_parity()),
                _ => continue,
            };
            let fragment = parsed.options.iter().find_map(|o| match o {
                pgm_core::wire::PgmOption::Fragment(f) => Some(*f),
                _ => None,
            });
            let _ = rxw.insert_data(sqn, payload, fragment, is_parity, now, &rng);
            let _ = rxw.read(4096);
        }
    }
});
