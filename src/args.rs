//! Argument parsing for running a scan from the command line

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Requested digitizer sample rate in Hz (realized rate may differ)
    #[clap(long, default_value_t = 10e6)]
    pub sample_rate: f64,
    /// Total samples per acquisition; split evenly across DMA buffers
    #[clap(long, default_value_t = 8_388_608)]
    pub samples: usize,
    /// DMA buffer count (0 picks one automatically for ~4 MB buffers)
    #[clap(long, default_value_t = 0)]
    pub buffers: usize,
    /// Full-scale input range in volts (snapped to 0.2, 0.4, 0.8 or 2)
    #[clap(long, default_value_t = 0.4)]
    pub input_range: f64,
    /// Input impedance in ohms (snapped to 50 or 1e6)
    #[clap(long, default_value_t = 50.0)]
    pub input_impedance: f64,

    /// Integration horizon per tuning, in seconds
    #[clap(long, default_value_t = 2.0)]
    pub max_integration_time: f64,
    /// Consecutive sub-spectra averaged before emission
    #[clap(long, default_value_t = 15)]
    pub sub_spectra_averaging: usize,
    /// Spectra required at a tuning before the agent may step
    #[clap(long, default_value_t = 13)]
    pub min_spectra_per_step: usize,
    /// LO step between tunings, in MHz
    #[clap(long, default_value_t = 0.1)]
    pub step_size: f64,
    /// Number of LO steps after the initial tuning
    #[clap(long, default_value_t = 50)]
    pub num_steps: usize,
    /// Target axion-photon coupling for the exclusion rescale
    #[clap(long, default_value_t = 6.5e-5)]
    pub target_coupling: f64,
    /// Starting LO frequency in Hz
    #[clap(long, default_value_t = 5e9)]
    pub start_freq: f64,

    /// SNR calibration powers (single-line CSV); unit SNR when omitted
    #[clap(long)]
    pub snr_file: Option<PathBuf>,
    /// SNR calibration frequency axis (single-line CSV)
    #[clap(long)]
    pub snr_freqs_file: Option<PathBuf>,

    /// Rebinning width in bins
    #[clap(long, default_value_t = 10)]
    pub rebin_width: usize,
    /// Flat convolution kernel width in rebinned bins
    #[clap(long, default_value_t = 3)]
    pub convolution_width: usize,

    /// Directory that receives the timestamped run directory
    #[clap(short, long, default_value = "output")]
    pub output_dir: PathBuf,

    /// Synthetic tone IF for the simulated board, in Hz (0 disables)
    #[clap(long, default_value_t = 0.0)]
    pub sim_tone: f64,
    /// Synthetic tone amplitude in volts
    #[clap(long, default_value_t = 0.05)]
    pub sim_tone_amplitude: f64,
    /// Synthetic uniform noise amplitude in volts
    #[clap(long, default_value_t = 1e-3)]
    pub sim_noise: f64,

    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
}

/// Match verbosity filter with tracing subscriber log levels
pub fn convert_filter(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    match filter {
        log::LevelFilter::Off => tracing_subscriber::filter::LevelFilter::OFF,
        log::LevelFilter::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        log::LevelFilter::Warn => tracing_subscriber::filter::LevelFilter::WARN,
        log::LevelFilter::Info => tracing_subscriber::filter::LevelFilter::INFO,
        log::LevelFilter::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
        log::LevelFilter::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
    }
}
