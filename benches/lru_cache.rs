use bytes::Bytes;
use criterion::{
    criterion_group, criterion_main, AxisScale, BenchmarkId, Criterion, PlotConfiguration,
    Throughput,
};
use tilestore::cache::BoundedLruCache;

fn lru_cache(c: &mut Criterion) {
    let plot_config = PlotConfiguration::default().summary_scale(AxisScale::Logarithmic);
    let mut group = c.benchmark_group("lru_cache");
    group.plot_config(plot_config);

    for object_size in [64usize, 4096, 65536] {
        let object = Bytes::from(vec![1u8; object_size]);
        let num_objects = 1024;
        // Half of the objects fit
        let cache = BoundedLruCache::new((object_size * num_objects / 2) as u64);
        let keys: Vec<String> = (0..num_objects).map(|i| format!("object_{i}")).collect();

        group.throughput(Throughput::Bytes((object_size * num_objects) as u64));
        group.bench_function(BenchmarkId::new("insert", object_size), |b| {
            b.iter(|| {
                for key in &keys {
                    cache.insert(key.as_str(), object.clone());
                }
            });
        });

        let mut buffer = vec![0u8; object_size];
        group.bench_function(BenchmarkId::new("read", object_size), |b| {
            b.iter(|| {
                keys.iter()
                    .filter(|key| cache.read(key, &mut buffer, 0).unwrap())
                    .count()
            });
        });
    }
    group.finish();
}

criterion_group!(benches, lru_cache);
criterion_main!(benches);
