//! Marshaling and round-trip invocation benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use lib_dispatch::lib_types::{ArgValue, RuntimeConfig, StreamId, RETURN_SIZE_LIMIT};
use lib_dispatch::{sink_fn, ArgList, InvocationRequest, Marshaler, ProxyTable, Runtime, SharedAddressSpace};
use std::sync::Arc;

sink_fn! {
    fn add(args, ret) {
        let _ = ret.put_u64(args.get(0).as_u64().wrapping_add(args.get(1).as_u64()));
    }
}

fn bench_marshal(c: &mut Criterion) {
    let mut group = c.benchmark_group("marshal");
    let proxies = ProxyTable::new(Arc::new(SharedAddressSpace));
    let handle = proxies.register(0x10_0000, 4096).unwrap();
    let marshaler = Marshaler::new(&proxies, RETURN_SIZE_LIMIT);

    for count in [1usize, 8, 19].iter() {
        let scalars: ArgList = (0..*count as u64).map(ArgValue::Unsigned).collect();
        group.bench_with_input(BenchmarkId::new("scalars", count), &scalars, |b, args| {
            b.iter(|| marshaler.marshal(black_box(args), 8));
        });

        let proxied: ArgList = (0..*count as u64)
            .map(|i| ArgValue::proxy_at(handle, i * 8))
            .collect();
        group.bench_with_input(BenchmarkId::new("proxies", count), &proxied, |b, args| {
            b.iter(|| marshaler.marshal(black_box(args), 8));
        });
    }

    group.finish();
}

fn bench_invoke(c: &mut Criterion) {
    let runtime = Runtime::new();
    runtime.register_function("add", add).unwrap();
    runtime.initialize(&RuntimeConfig::single_device(1)).unwrap();
    let stream = StreamId::new(0, 0);

    c.bench_function("invoke_round_trip", |b| {
        b.iter(|| {
            runtime
                .invoke(
                    InvocationRequest::new(stream, "add")
                        .arg(black_box(2u64))
                        .arg(black_box(3u64))
                        .result_capacity(8),
                )
                .and_then(|completion| completion.wait())
        });
    });

    runtime.finalize().unwrap();
}

criterion_group!(benches, bench_marshal, bench_invoke);
criterion_main!(benches);
