//! Benchmarks for chart rendering and PNG encoding.
//!
//! Run with: cargo bench --package renderer --bench render_benchmarks

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::Rng;

use chart_common::{ChartKind, ChartSeries, Dataset, RenderOptions};
use renderer::{png, render_chart};

/// Random series with `labels` points per dataset.
fn generate_series(labels: usize, datasets: usize) -> ChartSeries {
    let mut rng = rand::thread_rng();
    let labels_vec = (0..labels).map(|i| format!("{:02}", i)).collect();
    let datasets = (0..datasets)
        .map(|d| {
            let values = (0..labels).map(|_| rng.gen_range(0.0..1000.0)).collect();
            Dataset::new(format!("{}", 1000 + d), values)
        })
        .collect();
    ChartSeries::new(labels_vec, datasets)
}

fn generate_rgba_data(width: usize, height: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let mut data = vec![0u8; width * height * 4];
    for chunk in data.chunks_mut(4) {
        chunk[0] = rng.gen();
        chunk[1] = rng.gen();
        chunk[2] = rng.gen();
        chunk[3] = 255;
    }
    data
}

fn bench_chart_kinds(c: &mut Criterion) {
    let mut group = c.benchmark_group("render_chart");
    let series = generate_series(30, 10);

    for kind in [ChartKind::Line, ChartKind::Area, ChartKind::Bar, ChartKind::StackedBar] {
        let options = RenderOptions::new(kind, 800, 400);
        group.bench_with_input(BenchmarkId::from_parameter(kind), &options, |b, options| {
            b.iter(|| render_chart(black_box(&series), black_box(options)))
        });
    }
    group.finish();
}

fn bench_chart_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("render_chart_size");
    let series = generate_series(24, 5);

    for (width, height) in [(400, 200), (800, 400), (1600, 800)] {
        group.throughput(Throughput::Elements((width * height) as u64));
        let options = RenderOptions::new(ChartKind::Line, width, height);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}x{}", width, height)),
            &options,
            |b, options| b.iter(|| render_chart(black_box(&series), black_box(options))),
        );
    }
    group.finish();
}

fn bench_png_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("png_encode");
    for size in [256usize, 512] {
        let pixels = generate_rgba_data(size, size);
        group.throughput(Throughput::Bytes(pixels.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &pixels, |b, pixels| {
            b.iter(|| png::encode_png(black_box(pixels), size as u32, size as u32))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_chart_kinds, bench_chart_sizes, bench_png_encoding);
criterion_main!(benches);
