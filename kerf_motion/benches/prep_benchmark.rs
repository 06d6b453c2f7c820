//! Pipeline benchmarks: one executor pass plus one pulse tick, and the
//! status snapshot assembly. Both run on the simulation ports against a
//! continuously re-queued long move so the segment preparer always has
//! real work.

use criterion::{Criterion, criterion_group, criterion_main};

use kerf_common::axis::MAX_AXES;
use kerf_common::state::MachineState;
use kerf_motion::config::MachineConfig;
use kerf_motion::engine::MotionEngine;
use kerf_motion::planner::MoveData;

fn long_target(x: f32) -> [f32; MAX_AXES] {
    let mut t = [0.0; MAX_AXES];
    t[0] = x;
    t
}

fn bench_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("motion_pipeline");
    group.significance_level(0.01);
    group.sample_size(500);

    let (mut engine, _sim) = MotionEngine::with_sim(MachineConfig::default_xyz()).unwrap();
    let handle = engine.isr_handle();
    let feed = MoveData {
        feed_rate: 600.0,
        ..MoveData::default()
    };

    engine.buffer_line(&long_target(-180.0), &feed).unwrap();
    engine.cycle_start().unwrap();

    let mut toward_home = false;
    group.bench_function("exec_pass_plus_tick", |b| {
        b.iter(|| {
            if engine.state() == MachineState::Idle {
                // Bounce between the travel ends so the queue never drains
                // for more than one iteration.
                toward_home = !toward_home;
                let x = if toward_home { -1.0 } else { -180.0 };
                let _ = engine.buffer_line(&long_target(x), &feed);
                engine.auto_cycle_start();
            }
            engine.exec_rt_system();
            handle.tick();
        });
    });

    group.bench_function("status_snapshot", |b| {
        b.iter(|| engine.status_snapshot());
    });

    group.finish();
}

criterion_group!(benches, bench_pipeline);
criterion_main!(benches);
