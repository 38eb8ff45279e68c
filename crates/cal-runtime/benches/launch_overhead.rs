use std::sync::Arc;

use cal_runtime::driver::fake::FakeDriver;
use cal_runtime::{
    AllocFlags, BindingTable, Domain, Format, LaunchRequest, PollStrategy, Runtime, RuntimeConfig, Shape,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn setup() -> (Arc<FakeDriver>, Runtime) {
    let fake = Arc::new(FakeDriver::new().with_capacity(1024));
    let config = RuntimeConfig::default().with_poll(PollStrategy::Spin);
    let rt = Runtime::new(fake.clone(), config);
    (fake, rt)
}

fn benchmark_direct_binding(c: &mut Criterion) {
    let mut group = c.benchmark_group("launch_direct");

    for registers in [1usize, 4, 16].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(registers), registers, |b, &n| {
            let (fake, rt) = setup();
            let device = rt.device(0).unwrap();
            let names: Vec<String> = (0..n).map(|i| format!("o{i}")).collect();
            let image = rt.compile(&format!("il_ps_2_0\n{}\nend\n", names.join("\n"))).unwrap();
            let remotes: Vec<_> = names
                .iter()
                .map(|_| {
                    rt.allocate_remote(&device, Shape::new(64, 64), Format::Float32x1, AllocFlags::NONE)
                        .unwrap()
                })
                .collect();

            let mut bindings = BindingTable::new();
            for (name, remote) in names.iter().zip(&remotes) {
                bindings.bind_remote(name.as_str(), remote).unwrap();
            }

            b.iter(|| {
                let request = LaunchRequest::new(device.clone(), Domain::sized(64, 64)).with_bindings(bindings.clone());
                let completion = rt.run(&image, request).unwrap();
                fake.clear_calls();
                black_box(completion.remapped.len());
            });
        });
    }

    group.finish();
}

fn benchmark_copy_through(c: &mut Criterion) {
    let mut group = c.benchmark_group("launch_copy_through");

    for side in [16u32, 128, 512].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(side), side, |b, &side| {
            let (fake, rt) = setup();
            let device = rt.device(0).unwrap();
            let image = rt.compile("il_ps_2_0\ndcl_input i0\ndcl_output o0\nend\n").unwrap();
            let input = rt
                .allocate_remote(&device, Shape::new(side, side), Format::Float32x4, AllocFlags::NONE)
                .unwrap();
            let output = rt
                .allocate_remote(&device, Shape::new(side, side), Format::Float32x4, AllocFlags::NONE)
                .unwrap();

            let mut bindings = BindingTable::new();
            bindings.bind_copy_conventional("i0", &input).unwrap();
            bindings.bind_copy_conventional("o0", &output).unwrap();

            b.iter(|| {
                let request = LaunchRequest::new(device.clone(), Domain::sized(side, side)).with_bindings(bindings.clone());
                let completion = rt.run(&image, request).unwrap();
                fake.clear_calls();
                black_box(completion.copied_out.len());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_direct_binding, benchmark_copy_through);
criterion_main!(benches);
