//! Benchmark suite for the per-tick and per-response hot paths
//!
//! Measures aggregator folding (one call per device per tick), summary computation, and
//! NDJSON response decoding for streamed generations of increasing length.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use medidor::http_client::decode_generate_body;
use medidor::results::ResultAggregator;
use medidor::runner::Throughput as Tps;
use medidor::telemetry::{TelemetryAggregator, TelemetrySample};

fn sample(device: usize, i: usize) -> TelemetrySample {
    TelemetrySample {
        device,
        utilization_percent: (i % 100) as f64,
        vram_used_bytes: (i as u64) << 20,
        power_watts: 40.0 + (i % 300) as f64,
    }
}

fn ndjson_body(chunks: usize) -> String {
    let mut body = String::new();
    for i in 0..chunks {
        body.push_str(&format!(
            "{{\"model\":\"llama2\",\"response\":\"tok{i} \",\"done\":false}}\n"
        ));
    }
    body.push_str(
        "{\"model\":\"llama2\",\"response\":\"\",\"done\":true,\"eval_count\":512,\"eval_duration\":4000000000}\n",
    );
    body
}

fn benchmark_aggregator_record(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregator_record");

    for devices in [1usize, 4, 8] {
        group.throughput(Throughput::Elements(devices as u64));
        group.bench_with_input(BenchmarkId::from_parameter(devices), &devices, |b, &devices| {
            let mut aggregator = TelemetryAggregator::new(devices);
            let mut tick = 0usize;
            b.iter(|| {
                for device in 0..devices {
                    aggregator.record(black_box(&sample(device, tick)));
                }
                tick += 1;
            });
        });
    }

    group.finish();
}

fn benchmark_summarize_and_row(c: &mut Criterion) {
    let mut aggregator = TelemetryAggregator::new(8);
    for tick in 0..9_000 {
        for device in 0..8 {
            aggregator.record(&sample(device, tick));
        }
    }
    let schema = ResultAggregator::new(8, true);

    c.bench_function("summarize_8_devices_to_row", |b| {
        b.iter(|| {
            let stats = aggregator.summarize();
            let record = schema.record(
                medidor::results::ModelIdentity::new("llama2", "7B", "Q4_0"),
                Tps::TokensPerSecond(42.0),
                8,
                &stats,
            );
            black_box(schema.row(&record))
        });
    });
}

fn benchmark_ndjson_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("ndjson_decode");

    for chunks in [16usize, 256, 2048] {
        let body = ndjson_body(chunks);
        group.throughput(Throughput::Bytes(body.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(chunks), &body, |b, body| {
            b.iter(|| {
                let response = decode_generate_body(black_box(body)).unwrap();
                black_box(response)
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_aggregator_record,
    benchmark_summarize_and_row,
    benchmark_ndjson_decode
);
criterion_main!(benches);
