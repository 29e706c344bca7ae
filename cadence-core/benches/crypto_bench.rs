//! Codec, hashing and signature benchmarks

use cadence_core::{NodeIdentity, SignedTransaction, TrackPlay, TrackPlays, Transaction, TxHash};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

const KEY: &str = "5de4111afa1a4b94908f83103eb1f1706367c2e68ca870fc3fb9a804cdab365a";

fn plays(n: usize) -> Transaction {
    Transaction::Plays(TrackPlays {
        plays: (0..n)
            .map(|i| TrackPlay {
                user_id: format!("user-{i}"),
                track_id: format!("track-{i}"),
                timestamp: 1_700_000_000 + i as i64,
                signature: "0x".to_string() + &"ab".repeat(65),
                city: "Berlin".to_string(),
                region: "Berlin".to_string(),
                country: "DE".to_string(),
            })
            .collect(),
    })
}

fn benchmark_codec(c: &mut Criterion) {
    let tx = SignedTransaction::unsigned("bench", plays(100));
    let bytes = tx.to_bytes().unwrap();

    c.bench_function("encode_100_plays", |b| {
        b.iter(|| black_box(black_box(&tx).to_bytes().unwrap()))
    });

    c.bench_function("decode_100_plays", |b| {
        b.iter(|| black_box(SignedTransaction::from_bytes(black_box(&bytes)).unwrap()))
    });

    c.bench_function("tx_hash_100_plays", |b| {
        b.iter(|| black_box(TxHash::of_bytes(black_box(&bytes))))
    });
}

fn benchmark_signing(c: &mut Criterion) {
    let identity = NodeIdentity::from_hex(KEY).unwrap();
    let transaction = plays(1);

    c.bench_function("sign_transaction", |b| {
        b.iter(|| {
            let signed = SignedTransaction::sign(&identity, "bench", black_box(transaction.clone())).unwrap();
            black_box(signed);
        })
    });
}

fn benchmark_recovery(c: &mut Criterion) {
    let identity = NodeIdentity::from_hex(KEY).unwrap();
    let signed = SignedTransaction::sign(&identity, "bench", plays(1)).unwrap();

    c.bench_function("recover_signer", |b| {
        b.iter(|| black_box(black_box(&signed).signer().unwrap()))
    });
}

criterion_group!(benches, benchmark_codec, benchmark_signing, benchmark_recovery);
criterion_main!(benches);
