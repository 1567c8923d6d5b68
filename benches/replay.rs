//! Replay and wire codec benchmarks
//!
//! Run with: cargo bench --bench replay

use std::sync::Arc;

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use pawn_netcode::config::{MovementConfig, NetcodeConfig};
use pawn_netcode::metrics::NetcodeMetrics;
use pawn_netcode::movement::input::QuantizedInput;
use pawn_netcode::movement::replay::replay_saved_moves;
use pawn_netcode::movement::simulator::{HoverSimulator, MovementSimulator};
use pawn_netcode::movement::{ClientPredictionState, KinematicSnapshot};
use pawn_netcode::net::protocol::{self, ClientMessage, ServerMessage};
use pawn_netcode::sim::{LoopbackSession, SessionConfig};
use pawn_netcode::util::math::{Quat, Vec3};
use rand::Rng;

const DT: f64 = 1.0 / 60.0;

fn random_input(rng: &mut impl Rng) -> QuantizedInput {
    QuantizedInput::new(
        rng.gen_range(-1.0..1.0),
        rng.gen_range(-1.0..1.0),
        rng.gen_range(-1.0..1.0),
        rng.gen_range(-1.0..1.0),
        rng.gen(),
    )
}

/// A client with `count` buffered moves and a correction for the oldest pending
fn corrected_client(
    count: usize,
    sim: &HoverSimulator,
) -> (ClientPredictionState, KinematicSnapshot) {
    let config = MovementConfig {
        max_saved_moves: count + 2,
        ..Default::default()
    };
    let mut client = ClientPredictionState::new(&config);
    let mut state = KinematicSnapshot::default();
    let mut rng = rand::thread_rng();

    for _ in 0..=count {
        let input = random_input(&mut rng);
        let dt = client.begin_move(input, DT, &state);
        state = sim.simulate(&state, &input, dt);
        client.finish_move(&state);
    }

    let first = client.saved_moves()[0].timestamp;
    let authoritative = KinematicSnapshot::at_rest(Vec3::new(10.0, 0.0, 0.0), Quat::IDENTITY);
    client.handle_ack_bad(first, &authoritative, &mut state);
    (client, state)
}

fn bench_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("replay");
    let sim = HoverSimulator::default();

    for count in [8, 32, 96] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("saved_moves", count), &count, |b, &count| {
            b.iter_batched(
                || corrected_client(count, &sim),
                |(mut client, mut state)| {
                    black_box(replay_saved_moves(&mut client, &mut state, &sim))
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    let mut rng = rand::thread_rng();

    let state = KinematicSnapshot::new(
        Vec3::new(1234.5, -678.9, 120.0),
        Quat::from_axis_angle(Vec3::UP, 0.7),
        Vec3::new(350.0, -20.0, 4.5),
        Vec3::new(0.0, 0.1, 0.6),
    );
    let server_move = ClientMessage::ServerMove {
        timestamp: 123.456,
        input: random_input(&mut rng),
        end_state: state,
    };
    let correction = ServerMessage::ClientAckBadMove {
        timestamp: 123.456,
        state,
    };

    group.bench_function("encode_server_move", |b| {
        b.iter(|| black_box(protocol::encode(black_box(&server_move))))
    });

    let bytes = protocol::encode(&server_move);
    group.throughput(Throughput::Bytes(bytes.len() as u64));
    group.bench_function("decode_server_move", |b| {
        b.iter(|| black_box(protocol::decode::<ClientMessage>(black_box(&bytes))))
    });

    let bytes = protocol::encode(&correction);
    group.bench_function("decode_correction", |b| {
        b.iter(|| black_box(protocol::decode::<ServerMessage>(black_box(&bytes))))
    });

    group.finish();
}

fn bench_session(c: &mut Criterion) {
    let mut group = c.benchmark_group("session");
    group.sample_size(30);

    for clients in [1, 16, 64] {
        let mut session = LoopbackSession::new(
            SessionConfig {
                clients,
                ..Default::default()
            },
            NetcodeConfig::default(),
            Arc::new(NetcodeMetrics::new()),
        );

        group.throughput(Throughput::Elements(clients as u64));
        group.bench_with_input(BenchmarkId::new("step", clients), &clients, |b, _| {
            b.iter(|| session.step())
        });
    }

    group.finish();
}

criterion_group!(benches, bench_replay, bench_codec, bench_session);
criterion_main!(benches);
