// Benchmark for trajectory planning: jumps, synchronized lines and arcs
// Run with: cargo bench

use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::Arc;

use criterion::{Criterion, criterion_group, criterion_main};
use stage_sync::config::{Config, DeviceConfig};
use stage_sync::controller::ControllerKind;
use stage_sync::device::{Device, DeviceArena};
use stage_sync::planner::{ArcRequest, AxisScaleMapping, DeviceRoute, TrajectoryPlanner};

fn planner() -> TrajectoryPlanner {
    let config = Config::default();
    let mut devices: Vec<Device> = ['x', 'y']
        .into_iter()
        .map(|name| DeviceConfig::axis(name).build("stage", ControllerKind::Positioner))
        .collect();
    devices.push(Device::shutter('s', "shutter"));
    let arena = Arc::new(DeviceArena::new(devices).unwrap());
    let route = DeviceRoute {
        controller: "master".to_string(),
        buffered: true,
    };
    let routes = HashMap::from([('x', route.clone()), ('y', route.clone()), ('s', route)]);
    TrajectoryPlanner::new(config.planner, arena, routes, Arc::new(AxisScaleMapping::default()))
}

fn half_circle(accuracy: f64) -> ArcRequest {
    ArcRequest {
        devices: ['x', 'y'],
        radius: 50.0,
        center: (-50.0, 0.0),
        start_angle: 0.0,
        end_angle: PI,
        ccw: true,
        speed: 100.0,
        accuracy,
        time_accuracy: 0.03,
    }
}

fn bench_jump_and_line(c: &mut Criterion) {
    let planner = planner();
    let props = planner.default_properties();
    c.bench_function("plan 1k two-axis jumps", |b| {
        b.iter(|| {
            for i in 1..=1000 {
                let plan = planner.plan_jump(&['x', 'y'], &[i as f64 * 0.1, 50.0], &props).unwrap();
                assert_eq!(plan.segments.len(), 1);
            }
        });
    });

    let leads = props.clone().with_leads(true, true).with_shutter(true);
    c.bench_function("plan 1k lines with leads and shutter", |b| {
        b.iter(|| {
            for i in 1..=1000 {
                let plan = planner.plan_line(&['x', 'y'], &[i as f64 * 0.1, -20.0], &leads).unwrap();
                assert!(plan.lines.len() >= 2);
            }
        });
    });
}

fn bench_arc(c: &mut Criterion) {
    let planner = planner();
    let mut props = planner.default_properties();
    props.accuracy = 0.01;
    let coarse = half_circle(0.5);
    let mut fine = half_circle(0.001);
    fine.time_accuracy = 0.001;

    c.bench_function("discretize half circle (1µm)", |b| {
        b.iter(|| fine.discretize().unwrap().number_of_segments);
    });
    c.bench_function("plan half circle (0.5mm)", |b| {
        b.iter(|| planner.plan_arc(&coarse, &props).unwrap());
    });
    c.bench_function("plan half circle (1µm)", |b| {
        b.iter(|| planner.plan_arc(&fine, &props).unwrap());
    });
}

criterion_group!(benches, bench_jump_and_line, bench_arc);
criterion_main!(benches);
