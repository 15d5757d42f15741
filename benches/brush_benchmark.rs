//! Stroke pipeline benchmarks

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use inkflow::brush::{
    BrushEngine, BrushSettings, OutlineConfig, PipelineConfig, RecorderConfig, SmoothingConfig,
    StrokeRecord, StrokeRecorder,
};
use inkflow::input::Sample;
use inkflow::layer::{Layer, LayerId};
use inkflow::render::{CpuBackend, RenderBackend, StrokeStyle};

fn generate_samples(count: usize) -> Vec<Sample> {
    (0..count)
        .map(|i| {
            let t = i as f64 / count as f64;
            Sample::new(
                t * 1000.0,
                (t * std::f64::consts::PI * 4.0).sin() * 100.0 + 500.0,
                0.3 + t * 0.4,
            )
            .at_time(i as u64)
        })
        .collect()
}

fn record(samples: &[Sample], settings: &BrushSettings) -> Option<StrokeRecord> {
    let (first, rest) = samples.split_first()?;
    let mut recorder = StrokeRecorder::new(RecorderConfig::default());
    recorder.start_stroke(*first, settings);
    for sample in rest {
        recorder.add_sample(*sample);
    }
    recorder.end_stroke()
}

fn benchmark_stroke_processing(c: &mut Criterion) {
    let mut group = c.benchmark_group("Stroke Processing");
    let settings = BrushSettings::default();
    let engine = BrushEngine::default();

    for count in [10, 50, 100, 500, 1000].iter() {
        let Some(stroke) = record(&generate_samples(*count), &settings) else {
            continue;
        };
        group.bench_with_input(BenchmarkId::new("process", count), &stroke, |b, stroke| {
            b.iter(|| engine.process(stroke))
        });
    }

    group.finish();
}

fn benchmark_pipeline_settings(c: &mut Criterion) {
    let mut group = c.benchmark_group("Pipeline Settings Impact");
    let Some(stroke) = record(&generate_samples(500), &BrushSettings::default()) else {
        return;
    };

    let default_engine = BrushEngine::default();
    group.bench_function("default", |b| b.iter(|| default_engine.process(&stroke)));

    // Smaller parts mean more meshes and more triangulation calls
    let small_parts = BrushEngine::new(
        SmoothingConfig::default(),
        OutlineConfig::default(),
        PipelineConfig {
            max_samples_per_part: 32,
            ..Default::default()
        },
    );
    group.bench_function("small_parts", |b| b.iter(|| small_parts.process(&stroke)));

    let smooth_caps = BrushEngine::new(
        SmoothingConfig::default(),
        OutlineConfig {
            circle_segments: 64,
            ..Default::default()
        },
        PipelineConfig::default(),
    );
    group.bench_function("fine_caps", |b| b.iter(|| smooth_caps.process(&stroke)));

    group.finish();
}

fn benchmark_cpu_raster(c: &mut Criterion) {
    let mut group = c.benchmark_group("CPU Raster");
    let engine = BrushEngine::default();

    for size in [4.0, 20.0, 80.0].iter() {
        let settings = BrushSettings {
            size: *size,
            ..Default::default()
        };
        let Some(stroke) = record(&generate_samples(200), &settings) else {
            continue;
        };
        let geometry = engine.process(&stroke);
        let style = StrokeStyle::from_record(&stroke);

        group.bench_with_input(BenchmarkId::new("draw_stroke", size), &geometry, |b, g| {
            let mut backend = CpuBackend::new();
            let mut layer = Layer::new(LayerId(1), 1024, 768);
            b.iter(|| backend.draw_stroke(&mut layer, g, &style))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_stroke_processing,
    benchmark_pipeline_settings,
    benchmark_cpu_raster
);
criterion_main!(benches);
