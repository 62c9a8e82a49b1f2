#![no_main]

use libfuzzer_sys::fuzz_target;
use pgm_core::parser::decode_packet;

/// Fuzz the full TPDU decode pipeline: header, checksum, per-type body,
/// and the TLV option chain.
///
/// `decode_packet` must never panic on arbitrary input; malformed data
/// should only ever produce a `PgmError`.
fuzz_target!(|data: &[u8]| {
    let _ = decode_packet(data);
});
