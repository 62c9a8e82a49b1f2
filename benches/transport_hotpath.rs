//! Hot-path benchmarks not already covered by `packet_latency`: the TLV
//! option chain, NAK batching/encoding, and FEC transmission-group framing
//! across payload sizes.

use std::net::{IpAddr, Ipv4Addr};

use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use pgm_core::collab::FecCodec;
use pgm_core::error::PgmError;
use pgm_core::fec::{decode_group, encode_parity, FecConfig};
use pgm_core::receiver::{batch_naks, encode_nak};
use pgm_core::types::{Gsi, Nla, Sqn};
use pgm_core::wire::{decode_options, encode_options, OptFragment, OptParityPrm, PgmOption};

fn gsi() -> Gsi {
    Gsi::from_nla(&Nla::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 7000))
}

// ─── TLV option chain ───────────────────────────────────────────────────────

fn bench_option_chain(c: &mut Criterion) {
    let options = vec![
        PgmOption::Fragment(OptFragment { apdu_first_sqn: Sqn(0), frag_off: 0, frag_len: 4000 }),
        PgmOption::ParityPrm(OptParityPrm { parity_prm_tgs: 32, proactive: true, on_demand: false }),
    ];

    let mut group = c.benchmark_group("wire_options");

    group.bench_function("encode_fragment_and_parity_prm", |b| {
        b.iter(|| {
            let mut buf = BytesMut::new();
            encode_options(&mut buf, black_box(&options));
            black_box(buf);
        });
    });

    let mut encoded = BytesMut::new();
    encode_options(&mut encoded, &options);
    let encoded = encoded.freeze();
    group.bench_function("decode_fragment_and_parity_prm", |b| {
        b.iter(|| {
            black_box(decode_options(&mut black_box(encoded.clone())).unwrap());
        });
    });

    group.finish();
}

// ─── NAK batching ────────────────────────────────────────────────────────────

fn bench_nak_batching(c: &mut Criterion) {
    let mut group = c.benchmark_group("nak");

    for n in [1usize, 10, 63, 200] {
        let due: Vec<Sqn> = (0..n as u32).map(Sqn).collect();
        group.throughput(Throughput::Elements(n as u64));
        group.bench_function(format!("batch_{n}_due"), |b| {
            b.iter(|| {
                black_box(batch_naks(black_box(&due)));
            });
        });
    }

    group.bench_function("encode_nak_with_62_extra", |b| {
        let extra: Vec<Sqn> = (1..63u32).map(Sqn).collect();
        b.iter(|| {
            black_box(encode_nak(
                gsi(), 7000, 7000, Sqn(0), black_box(&extra),
                [10, 0, 0, 1], 7000, [239, 0, 0, 1], 7000, false,
            ));
        });
    });

    group.finish();
}

// ─── FEC framing ─────────────────────────────────────────────────────────────

/// XOR parity stand-in, mirroring the one used in this crate's own FEC unit
/// tests — only the framing around the codec is under benchmark here.
struct XorCodec;

impl FecCodec for XorCodec {
    fn encode(&self, data_blocks: &[Bytes], h: usize) -> Result<Vec<Bytes>, PgmError> {
        let len = data_blocks.iter().map(|b| b.len()).max().unwrap_or(0);
        let mut parity = vec![0u8; len];
        for block in data_blocks {
            for (i, byte) in block.iter().enumerate() {
                parity[i] ^= byte;
            }
        }
        Ok(std::iter::repeat(Bytes::from(parity)).take(h).collect())
    }

    fn decode(&self, blocks: &[Option<Bytes>], k: usize) -> Result<Vec<Bytes>, PgmError> {
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

fn bench_fec_group(c: &mut Criterion) {
    let codec = XorCodec;
    let cfg = FecConfig {
        rs_n: 33,
        rs_k: 32,
        tg_sqn_shift: 5,
        use_proactive_parity: true,
        use_ondemand_parity: false,
        use_varpkt_len: false,
    };

    let mut group = c.benchmark_group("fec");

    for size in [200usize, 1200, 4000] {
        let data: Vec<Option<Bytes>> = (0..cfg.rs_k).map(|i| Some(Bytes::from(vec![i as u8; size]))).collect();
        group.throughput(Throughput::Bytes((size * cfg.rs_k as usize) as u64));

        group.bench_function(format!("encode_parity_{size}B_k32"), |b| {
            b.iter(|| {
                black_box(encode_parity(&codec, &cfg, black_box(&data), cfg.h()).unwrap());
            });
        });

        let parity = encode_parity(&codec, &cfg, &data, cfg.h()).unwrap();
        group.bench_function(format!("decode_group_one_erasure_{size}B_k32"), |b| {
            b.iter(|| {
                let mut with_erasure = data.clone();
                with_erasure[7] = None;
                with_erasure.push(Some(parity[0].clone()));
                black_box(decode_group(&codec, &cfg, black_box(&with_erasure)).unwrap());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_option_chain, bench_nak_batching, bench_fec_group);
criterion_main!(benches);
