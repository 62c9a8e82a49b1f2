#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use pgm_core::wire::{decode_options, PgmHeader};

/// Fuzz the header and TLV option chain decoders directly, below the
/// checksum/body dispatch that `fuzz_packet_decode` already covers.
///
/// Neither decoder may panic on arbitrary input; malformed data should
/// only ever produce a `PgmError`.
fuzz_target!(|data: &[u8]| {
    let mut header_buf = data;
    if let Ok(header) = PgmHeader::decode(&mut header_buf) {
        // Re-encode/decode must round-trip stably for any header that parsed.
        let mut buf = bytes::BytesMut::new();
        header.encode(&mut buf);
        let re = PgmHeader::decode(&mut buf.freeze()).expect("re-decode of a freshly encoded header must succeed");
        assert_eq!(re.sport, header.sport);
        assert_eq!(re.dport, header.dport);
        assert_eq!(re.pgm_type, header.pgm_type);
        assert_eq!(re.gsi, header.gsi);
        assert_eq!(re.tsdu_length, header.tsdu_length);
    }

    let mut options_buf = Bytes::copy_from_slice(data);
    let _ = decode_options(&mut options_buf);
});
