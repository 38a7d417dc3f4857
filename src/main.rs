use clap::Parser;
use tracing::{error, info};

use haloscan::args::{convert_filter, Args};
use haloscan::board::{SimBoard, SimTone};
use haloscan::digitizer::SampleClock;
use haloscan::fileio;
use haloscan::scan::{NullOscillator, ScanConfig, ScanRunner};
use haloscan::spectrum::Spectrum;

fn main() {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(convert_filter(args.verbose.log_level_filter()))
        .init();

    if let Err(e) = run(args) {
        error!(error = %e, "scan failed");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), haloscan::scan::ScanError> {
    if args.samples == 0 {
        return Err(haloscan::digitizer::ConfigError::ZeroSamples.into());
    }

    let mut board = SimBoard::new(0xD0D0).with_noise(args.sim_noise);
    if args.sim_tone > 0.0 {
        board = board.with_tone(SimTone {
            frequency_hz: args.sim_tone,
            amplitude_volts: args.sim_tone_amplitude,
        });
    }

    let snr = match (&args.snr_file, &args.snr_freqs_file) {
        (Some(powers), Some(freqs)) => fileio::load_snr(powers, freqs)?,
        _ => {
            info!("no SNR calibration given, using a unit curve over the scan band");
            unit_snr(&args)
        }
    };

    let cfg = ScanConfig {
        sample_rate_hz: args.sample_rate,
        samples_per_acquisition: args.samples,
        buffers_hint: args.buffers,
        input_range_volts: args.input_range,
        input_impedance_ohms: args.input_impedance,
        max_integration_time_secs: args.max_integration_time,
        sub_spectra_averaging: args.sub_spectra_averaging,
        min_spectra_per_step: args.min_spectra_per_step,
        step_size_mhz: args.step_size,
        num_steps: args.num_steps,
        target_coupling: args.target_coupling,
        start_freq_hz: args.start_freq,
        rebin_width: args.rebin_width,
        convolution_width: args.convolution_width,
        output_dir: args.output_dir.clone(),
        ..ScanConfig::default()
    };

    let mut runner = ScanRunner::new(board, NullOscillator::default(), snr, cfg)?;
    let run_dir = runner.run()?;
    info!(dir = %run_dir.display(), "results written");
    Ok(())
}

/// Flat unit SNR spanning every tuning of the scan, on the digitizer's bin
/// grid. Callers reject a zero sample count before building the curve.
fn unit_snr(args: &Args) -> Spectrum {
    let rate = SampleClock::closest_to(args.sample_rate).realized_hz();
    let buffers = if args.buffers == 0 {
        haloscan::digitizer::suggest_buffer_count(2, args.samples)
    } else {
        args.buffers
    };
    let samples_per_buffer = (args.samples / buffers.max(1)).max(2);
    let bin_width = rate / samples_per_buffer as f64;
    let scan_span = args.num_steps as f64 * args.step_size * 1e6 + rate / 2.0;
    let bins = (scan_span / bin_width).ceil() as usize + samples_per_buffer;
    let start = args.start_freq - rate / 4.0 - bin_width * samples_per_buffer as f64 / 4.0;
    let freq_axis: Vec<f64> = (0..bins).map(|i| start + i as f64 * bin_width).collect();
    Spectrum::new(vec![1.0; bins], freq_axis, args.start_freq)
}
