use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::{json, Map};
use std::hint::black_box;
use std::time::Duration;
use tandem_collab::chunking::{self, Reassembler};
use tandem_collab::hub::LocalHub;
use tandem_collab::merge::{deep_merge, plan_merge};
use tandem_collab::protocol::{FieldKind, FieldMap, User, WhisperMessage};
use tandem_collab::window::WindowId;
use tokio::time::Instant;

fn field_update(len: usize) -> WhisperMessage {
    WhisperMessage::FieldUpdate {
        handle: "body".into(),
        kind: FieldKind::Value,
        value: json!("x".repeat(len)),
        window_id: WindowId::from("bench-window"),
    }
}

fn document(fields: usize) -> FieldMap {
    let mut map = Map::new();
    for i in 0..fields {
        map.insert(format!("field_{i}"), json!({ "text": format!("value {i}"), "rev": i }));
    }
    map
}

fn bench_whisper_encode(c: &mut Criterion) {
    let msg = field_update(256);

    c.bench_function("whisper_encode_256B", |b| {
        b.iter(|| {
            black_box(black_box(&msg).encode().unwrap());
        })
    });
}

fn bench_whisper_decode(c: &mut Criterion) {
    let (event, payload) = field_update(256).encode().unwrap();

    c.bench_function("whisper_decode_256B", |b| {
        b.iter(|| {
            black_box(WhisperMessage::decode(black_box(&event), black_box(&payload)).unwrap());
        })
    });
}

fn bench_window_id_generate(c: &mut Criterion) {
    c.bench_function("window_id_generate", |b| {
        b.iter(|| {
            black_box(WindowId::generate());
        })
    });
}

fn bench_chunk_split_64kb(c: &mut Criterion) {
    let (event, payload) = field_update(64 * 1024).encode().unwrap();

    c.bench_function("chunk_split_64KB", |b| {
        b.iter(|| {
            black_box(chunking::split(black_box(&event), black_box(&payload), 8_000, 6_000).unwrap());
        })
    });
}

fn bench_chunk_reassemble_64kb(c: &mut Criterion) {
    let (event, payload) = field_update(64 * 1024).encode().unwrap();
    let frames = chunking::split(&event, &payload, 8_000, 6_000).unwrap();

    c.bench_function("chunk_reassemble_64KB", |b| {
        b.iter(|| {
            let mut reassembler = Reassembler::new(Duration::from_secs(30));
            let now = Instant::now();
            // reverse order forces buffering of every piece
            for (event, payload) in frames.iter().rev() {
                if let Some(full) = reassembler.receive(event, payload, now).unwrap() {
                    black_box(full);
                }
            }
        })
    });
}

fn bench_plan_merge_200_fields(c: &mut Criterion) {
    let current = document(200);
    let mut incoming = document(200);
    for i in (0..200).step_by(4) {
        incoming.insert(format!("field_{i}"), json!({ "text": "changed" }));
    }
    let meta = FieldMap::new();

    c.bench_function("plan_merge_200_fields", |b| {
        b.iter(|| {
            black_box(plan_merge(
                black_box(&current),
                &meta,
                Some(black_box(&incoming)),
                Some(black_box(&incoming)),
                |_, handle| handle.ends_with('7'),
            ));
        })
    });
}

fn bench_deep_merge_nested(c: &mut Criterion) {
    let existing = json!({ "errors": { "title": ["required"], "slug": [] }, "collapsed": { "blocks": [1, 2, 3] } });
    let incoming = json!({ "errors": { "title": [] }, "collapsed": { "blocks": [1] }, "dirty": true });

    c.bench_function("deep_merge_nested", |b| {
        b.iter(|| {
            black_box(deep_merge(black_box(&existing), black_box(&incoming)));
        })
    });
}

fn bench_hub_fanout_20_members(c: &mut Criterion) {
    let hub = LocalHub::default();
    let mut members = Vec::new();
    for i in 0..20 {
        members.push(hub.join("collaboration.1.default", User::new(i, format!("User{i}"))));
    }
    let (event, payload) = field_update(256).encode().unwrap();

    c.bench_function("hub_fanout_20_members", |b| {
        b.iter(|| {
            use tandem_collab::transport::Transport;
            members[0].0.whisper(black_box(&event), black_box(&payload)).unwrap();
            for (_, rx) in members.iter_mut().skip(1) {
                while let Ok(e) = rx.try_recv() {
                    black_box(e);
                }
            }
        })
    });
}

criterion_group!(
    benches,
    bench_whisper_encode,
    bench_whisper_decode,
    bench_window_id_generate,
    bench_chunk_split_64kb,
    bench_chunk_reassemble_64kb,
    bench_plan_merge_200_fields,
    bench_deep_merge_nested,
    bench_hub_fanout_20_members,
);
criterion_main!(benches);
