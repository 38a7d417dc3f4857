use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::prelude::*;

use haloscan::digitizer::{codes_to_voltages, RawBuffer};
use haloscan::processing::{DataProcessor, ProcessorConfig};
use haloscan::spectrum::{CombinedSpectrum, Rescaled, Spectrum};

fn benchmark(c: &mut Criterion) {
    let mut rng = rand::thread_rng();
    let n = 16_384usize;

    let mut codes = vec![0u16; n * 2];
    rng.fill(&mut codes[..]);

    c.bench_function("codes to voltages", |b| {
        b.iter(|| codes_to_voltages(black_box(&codes), black_box(0.4)))
    });

    let mut processor = DataProcessor::new(
        ProcessorConfig {
            samples_per_buffer: n,
            sample_rate_hz: 10e6,
            sub_spectra_averaging: 1,
            ..ProcessorConfig::default()
        },
        5e9,
    )
    .unwrap();
    let buffer = RawBuffer {
        index: 0,
        samples: codes_to_voltages(&codes, 0.4),
    };

    c.bench_function("buffer to raw spectrum", |b| {
        b.iter(|| processor.acquired_to_raw(black_box(&buffer)).unwrap())
    });

    let bins = n / 2;
    let freq_axis: Vec<f64> = (0..bins).map(|i| 5e9 + i as f64 * 100.0).collect();
    let powers: Vec<f64> = (0..bins).map(|_| rng.gen::<f64>() - 0.5).collect();
    let rescaled = Rescaled {
        spectrum: Spectrum::new(powers, freq_axis, 5e9),
        sigma: vec![1.0; bins],
    };
    let mut combined = CombinedSpectrum::default();

    c.bench_function("combine rescaled spectrum", |b| {
        b.iter(|| combined.add_rescaled(black_box(&rescaled)))
    });

    combined.add_rescaled(&rescaled);
    c.bench_function("rebin combined spectrum", |b| {
        b.iter(|| combined.rebin(black_box(10), black_box(3)))
    });
}

criterion_group!(benches, benchmark);
criterion_main!(benches);
