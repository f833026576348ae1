//! Benchmarks for the wire codec
//!
//! Run with: cargo bench --bench packet_codec
//!
//! Covers the packets sent every frame (sync), once per match (start) and
//! periodically in the lobby (game info snapshots).

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fortress_lockstep::{
    Frame, GameInfoPlayer, GameInfoSnapshot, GameParams, InputRecord, LobbyMessage, Message,
    MatchRules, OutboundFrameBuffer, PlayerIndex, StartPacket, SyncPacket, KEY_PRESS, KEY_RELEASE,
};
use std::hint::black_box;
use std::net::{Ipv4Addr, SocketAddrV4};

/// A frame with `records` alternating press/release records.
fn busy_frame(records: usize) -> SyncPacket {
    SyncPacket {
        frame: Frame::new(1_234),
        seed: 0xDEAD_BEEF,
        records: (0..records)
            .map(|i| {
                let op = if i % 2 == 0 { KEY_PRESS } else { KEY_RELEASE };
                InputRecord::new(op, (i % 128) as u8)
            })
            .collect(),
    }
}

fn full_lobby() -> GameInfoSnapshot {
    let mut snapshot = GameInfoSnapshot::new(0x1000, 10);
    for (i, player) in snapshot.players.iter_mut().enumerate() {
        let address = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 10 + i as u8), 44_046);
        *player = GameInfoPlayer::new(0x1000 + i as u32, address, format!("player-{i}"));
    }
    snapshot
}

fn bench_sync_packet(c: &mut Criterion) {
    let mut group = c.benchmark_group("Sync packet");

    for records in [0, 4, 16, 64] {
        let packet = busy_frame(records);
        let bytes = packet.encode();
        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_with_input(BenchmarkId::new("encode", records), &packet, |b, packet| {
            b.iter(|| black_box(packet).encode());
        });
        group.bench_with_input(BenchmarkId::new("decode", records), &bytes, |b, bytes| {
            b.iter(|| SyncPacket::decode(black_box(bytes)));
        });
    }

    group.finish();
}

fn bench_frame_buffer(c: &mut Criterion) {
    let mut group = c.benchmark_group("Outbound frame buffer");

    for records in [4, 16, 64] {
        group.bench_with_input(BenchmarkId::new("fill", records), &records, |b, &records| {
            let mut buffer = OutboundFrameBuffer::new(512);
            b.iter(|| {
                buffer.reset();
                buffer.stamp(Frame::new(7), 42);
                for i in 0..records {
                    black_box(buffer.push(InputRecord::new(KEY_PRESS, i as u8)));
                }
                black_box(buffer.as_bytes().len())
            });
        });
    }

    group.finish();
}

fn bench_start_packet(c: &mut Criterion) {
    let packet = StartPacket {
        sender: PlayerIndex::HOST,
        params: GameParams {
            wave: 3,
            turbo: true,
            rules: MatchRules::DeathMatch(20),
        },
        seed: 99,
    };
    let bytes = packet.encode();

    c.bench_function("start packet encode", |b| b.iter(|| black_box(&packet).encode()));
    c.bench_function("start packet decode", |b| {
        b.iter(|| StartPacket::decode(black_box(&bytes)));
    });
}

fn bench_lobby_messages(c: &mut Criterion) {
    let mut group = c.benchmark_group("Lobby message");

    let info = LobbyMessage::GameInfo(full_lobby());
    let info_bytes = info.encode();
    group.throughput(Throughput::Bytes(info_bytes.len() as u64));
    group.bench_function("game info encode", |b| b.iter(|| black_box(&info).encode()));
    group.bench_function("game info decode", |b| {
        b.iter(|| LobbyMessage::decode(black_box(&info_bytes)));
    });

    let ping = LobbyMessage::Ping {
        reply: false,
        timestamp_ms: 123_456,
    }
    .encode();
    group.bench_function("classify and decode ping", |b| {
        b.iter(|| Message::decode(black_box(&ping)));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_sync_packet,
    bench_frame_buffer,
    bench_start_packet,
    bench_lobby_messages
);
criterion_main!(benches);
