//! Scan runner: owns the inter-stage queues and synchronization flags,
//! sequences LO tuning steps, and delegates side effects (file output,
//! retuning) to collaborators.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};
use thiserror::Error;
use tracing::{info, warn};

use crate::board::{Board, BoardError};
use crate::decision::{Decision, DecisionAgent};
use crate::digitizer::{ConfigError, Digitizer, RawBuffer};
use crate::fileio;
use crate::processing::{DataProcessor, ProcessingError, ProcessorConfig};
use crate::spectrum::{CombinedSpectrum, Rescaled, Spectrum};

/// Bound on each inter-stage queue. Producers block (rather than drop) when
/// a consumer falls behind.
const QUEUE_CAPACITY: usize = 32;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("digitizer transport: {0}")]
    Board(#[from] BoardError),
    #[error("processing: {0}")]
    Processing(#[from] ProcessingError),
    #[error("file output: {0}")]
    Io(#[from] std::io::Error),
    #[error("file output: {0}")]
    Csv(#[from] csv::Error),
}

/// Flags shared by all four stages. Queue disconnection carries the
/// "acquisition complete and drained" edge; these carry pause requests and
/// the first fatal error.
#[derive(Debug, Default)]
pub struct SyncFlags {
    pause: AtomicBool,
    complete: AtomicBool,
    last_error: Mutex<Option<ScanError>>,
}

impl SyncFlags {
    pub fn request_pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
    }

    pub fn pause_requested(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }

    pub fn mark_complete(&self) {
        self.complete.store(true, Ordering::SeqCst);
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }

    /// Keep the first error and unblock every peer.
    pub fn record_error(&self, error: ScanError) {
        let mut slot = self.last_error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(error);
        }
        drop(slot);
        self.request_pause();
        self.mark_complete();
    }

    pub fn take_error(&self) -> Option<ScanError> {
        self.last_error.lock().unwrap().take()
    }
}

/// The instrument stepped between tunings. Kept behind a trait so the scan
/// logic stays testable without hardware.
pub trait LocalOscillator: Send {
    fn set_frequency_hz(&mut self, freq_hz: f64) -> Result<(), ScanError>;
}

/// Stand-in oscillator that just records the requested tuning.
#[derive(Debug, Default)]
pub struct NullOscillator {
    pub frequency_hz: f64,
}

impl LocalOscillator for NullOscillator {
    fn set_frequency_hz(&mut self, freq_hz: f64) -> Result<(), ScanError> {
        self.frequency_hz = freq_hz;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub sample_rate_hz: f64,
    pub samples_per_acquisition: usize,
    pub buffers_hint: usize,
    pub input_range_volts: f64,
    pub input_impedance_ohms: f64,

    /// Acquisition horizon per tuning, in seconds.
    pub max_integration_time_secs: f64,
    pub sub_spectra_averaging: usize,
    pub min_spectra_per_step: usize,
    pub step_size_mhz: f64,
    pub num_steps: usize,
    pub target_coupling: f64,
    pub decision_threshold: f64,
    pub start_freq_hz: f64,

    pub rebin_width: usize,
    pub convolution_width: usize,
    pub dc_trim_bins: usize,
    pub baseline_cutoff: f64,
    pub baseline_stopband_db: f64,

    pub output_dir: PathBuf,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 10e6,
            samples_per_acquisition: 8_388_608,
            buffers_hint: 0,
            input_range_volts: 0.4,
            input_impedance_ohms: 50.0,
            max_integration_time_secs: 2.0,
            sub_spectra_averaging: 15,
            min_spectra_per_step: 13,
            step_size_mhz: 0.1,
            num_steps: 50,
            target_coupling: 6.5e-5,
            decision_threshold: 0.0,
            start_freq_hz: 5e9,
            rebin_width: 10,
            convolution_width: 3,
            dc_trim_bins: 3,
            baseline_cutoff: 0.02,
            baseline_stopband_db: 40.0,
            output_dir: PathBuf::from("output"),
        }
    }
}

/// Sequences the acquisition / processing / saving / decision stages across
/// tuning steps.
pub struct ScanRunner<B: Board, L: LocalOscillator> {
    digitizer: Digitizer<B>,
    lo: L,
    processor: DataProcessor,
    agent: DecisionAgent,
    combined: CombinedSpectrum,
    cfg: ScanConfig,
    lo_freq_hz: f64,
    buffers_saved: usize,
}

impl<B: Board, L: LocalOscillator> ScanRunner<B, L> {
    /// Configure the digitizer and build the processing chain. The SNR
    /// calibration doubles as the decision agent's coupling-ratio curve.
    pub fn new(board: B, lo: L, snr: Spectrum, cfg: ScanConfig) -> Result<Self, ScanError> {
        let mut digitizer = Digitizer::new(board);
        let params = digitizer
            .configure(
                cfg.sample_rate_hz,
                cfg.samples_per_acquisition,
                cfg.buffers_hint,
                cfg.input_range_volts,
                cfg.input_impedance_ohms,
            )?
            .clone();

        let mut processor = DataProcessor::new(
            ProcessorConfig {
                samples_per_buffer: params.samples_per_buffer,
                sample_rate_hz: params.sample_rate_hz,
                sub_spectra_averaging: cfg.sub_spectra_averaging,
                target_coupling: cfg.target_coupling,
                dc_trim_bins: cfg.dc_trim_bins,
                baseline_cutoff: cfg.baseline_cutoff,
                baseline_stopband_db: cfg.baseline_stopband_db,
            },
            cfg.start_freq_hz,
        )?;
        processor.set_snr(snr.clone());

        let mut agent = DecisionAgent::new(snr, cfg.target_coupling);
        agent.threshold = cfg.decision_threshold;
        agent.min_shots = cfg.min_spectra_per_step;
        // A tuning is done once its own half-band is exclused.
        agent.window_half_width_hz = params.sample_rate_hz / 4.0;

        Ok(Self {
            digitizer,
            lo,
            processor,
            agent,
            combined: CombinedSpectrum::default(),
            lo_freq_hz: cfg.start_freq_hz,
            cfg,
            buffers_saved: 0,
        })
    }

    pub fn combined(&self) -> &CombinedSpectrum {
        &self.combined
    }

    pub fn lo_freq_hz(&self) -> f64 {
        self.lo_freq_hz
    }

    /// Run the full scan and return the run directory.
    pub fn run(&mut self) -> Result<PathBuf, ScanError> {
        let run_dir = fileio::create_run_directory(&self.cfg.output_dir)?;
        info!(dir = %run_dir.display(), "scan starting");
        self.combined.reset();
        self.lo.set_frequency_hz(self.lo_freq_hz)?;

        for step in 0..=self.cfg.num_steps {
            if step > 0 {
                let next = self.lo_freq_hz + self.cfg.step_size_mhz * 1e6;
                self.lo.set_frequency_hz(next)?;
                self.lo_freq_hz = next;
                self.processor.retune(next);
            }
            let decision = self.acquire_step(&run_dir, step)?;
            info!(step, lo_mhz = self.lo_freq_hz / 1e6, ?decision, "step finished");
            if decision == Decision::Stop {
                break;
            }
        }

        self.save_results(&run_dir)?;
        info!(dir = %run_dir.display(), "scan complete");
        Ok(run_dir)
    }

    /// Run the four stages at the current tuning until the decision agent
    /// ends the step or the integration horizon is reached.
    fn acquire_step(&mut self, run_dir: &Path, step: usize) -> Result<Decision, ScanError> {
        self.processor.reset_baselining();

        let params = self.digitizer.params()?.clone();
        let max_buffers = ((self.cfg.max_integration_time_secs * params.sample_rate_hz
            / params.samples_per_buffer as f64)
            .ceil() as usize)
            .max(1);
        let rebin_width = self.cfg.rebin_width;
        let convolution_width = self.cfg.convolution_width;
        let lo_freq_hz = self.lo_freq_hz;
        let save_start = self.buffers_saved;

        let flags = SyncFlags::default();
        let (raw_tx, raw_rx) = bounded::<RawBuffer>(QUEUE_CAPACITY);
        let (save_tx, save_rx) = bounded::<RawBuffer>(QUEUE_CAPACITY);
        let (spec_tx, spec_rx) = bounded::<Rescaled>(QUEUE_CAPACITY);

        let Self {
            digitizer,
            processor,
            agent,
            combined,
            ..
        } = self;

        let (decision, step_spectra, saved) = thread::scope(|s| {
            let flags = &flags;
            let acquisition = s.spawn(move || {
                match digitizer.run_acquisition(raw_tx, save_tx, flags, max_buffers) {
                    Ok(stats) => Some(stats),
                    Err(e) => {
                        flags.record_error(e);
                        None
                    }
                }
            });
            let saving = s.spawn(move || match saving_stage(save_rx, run_dir, save_start) {
                Ok(saved) => saved,
                Err(e) => {
                    flags.record_error(e);
                    0
                }
            });
            let processing = s.spawn(move || {
                if let Err(e) = processing_stage(processor, raw_rx, spec_tx) {
                    flags.record_error(e);
                }
            });

            let (decision, step_spectra) = decision_stage(
                agent,
                combined,
                spec_rx,
                flags,
                rebin_width,
                convolution_width,
                lo_freq_hz,
            );

            let _ = acquisition.join().expect("acquisition stage panicked");
            let saved = saving.join().expect("saving stage panicked");
            processing.join().expect("processing stage panicked");
            (decision, step_spectra, saved)
        });

        if let Some(error) = flags.take_error() {
            return Err(error);
        }

        self.buffers_saved += saved;
        fileio::save_spectra_log(
            &step_spectra,
            &run_dir.join(format!("step{step}_spectra.csv")),
        )?;
        Ok(decision)
    }

    fn save_results(&mut self, run_dir: &Path) -> Result<(), ScanError> {
        if self.combined.is_empty() {
            warn!("no spectra were combined, nothing to save");
            return Ok(());
        }
        fileio::save_combined_spectrum(&self.combined, &run_dir.join("combined_spectrum.csv"))?;
        let rebinned = self
            .combined
            .rebin(self.cfg.rebin_width, self.cfg.convolution_width);
        fileio::save_combined_spectrum(&rebinned, &run_dir.join("rebinned_spectrum.csv"))?;
        fileio::save_vector(self.agent.points(), &run_dir.join("exclusion_points.csv"))?;
        Ok(())
    }
}

/// Saving stage: drain raw buffers to `Buffer<N>.bin` dumps until the
/// acquisition side disconnects.
fn saving_stage(
    save_rx: Receiver<RawBuffer>,
    run_dir: &Path,
    start_index: usize,
) -> Result<usize, ScanError> {
    let mut saved = 0usize;
    for buffer in save_rx.iter() {
        let path = run_dir.join(format!("Buffer{}.bin", start_index + saved + 1));
        fileio::save_raw_buffer(&buffer, &path)?;
        saved += 1;
    }
    Ok(saved)
}

/// Processing stage: drain raw buffers through the FFT / baseline / rescale
/// chain, pushing rescaled spectra downstream.
fn processing_stage(
    processor: &mut DataProcessor,
    raw_rx: Receiver<RawBuffer>,
    spec_tx: Sender<Rescaled>,
) -> Result<usize, ScanError> {
    let mut emitted = 0usize;
    for buffer in raw_rx.iter() {
        let Some((primary, _image)) = processor.acquired_to_raw(&buffer)? else {
            continue;
        };
        processor.add_raw_to_running_average(&primary)?;
        processor.update_baseline()?;
        let processed = processor.raw_to_processed(&primary)?;
        let rescaled = processor.processed_to_rescaled(&processed)?;
        emitted += 1;
        if spec_tx.send(rescaled).is_err() {
            // Decision stage ended the step; stop cleanly.
            break;
        }
    }
    Ok(emitted)
}

/// Decision stage: fold rescaled spectra into the combined spectrum, rebin,
/// and consult the agent. A Step or Stop verdict pauses acquisition.
fn decision_stage(
    agent: &mut DecisionAgent,
    combined: &mut CombinedSpectrum,
    spec_rx: Receiver<Rescaled>,
    flags: &SyncFlags,
    rebin_width: usize,
    convolution_width: usize,
    lo_freq_hz: f64,
) -> (Decision, Vec<Spectrum>) {
    let mut spectra = Vec::new();
    let mut spectra_at_tuning = 0usize;
    let mut last = Decision::Continue;
    for rescaled in spec_rx.iter() {
        combined.add_rescaled(&rescaled);
        spectra_at_tuning += 1;
        spectra.push(rescaled.spectrum);

        let rebinned = combined.rebin(rebin_width, convolution_width);
        agent.set_targets(&rebinned.freq_axis);
        last = agent.get_decision(&rebinned.powers, spectra_at_tuning, lo_freq_hz);
        if last != Decision::Continue {
            flags.request_pause();
            break;
        }
    }
    (last, spectra)
}
