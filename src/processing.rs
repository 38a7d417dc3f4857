//! Processing core: FFT, sideband power spectra, artifact-bin interpolation,
//! rolling baseline estimation, and SNR rescaling.

use std::sync::Arc;

use num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use thiserror::Error;
use tracing::debug;

use crate::digitizer::RawBuffer;
use crate::filter::BaselineFilter;
use crate::spectrum::{closest_index, Rescaled, Spectrum};

/// Numerical precondition failures. Fatal for the current scan step.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    #[error("spectrum is empty")]
    EmptySpectrum,
    #[error("buffer holds {got} samples, FFT length is {expected}")]
    BufferLengthMismatch { expected: usize, got: usize },
    #[error("baseline holds {got} bins, spectrum holds {expected}")]
    BaselineSizeMismatch { expected: usize, got: usize },
    #[error("baseline update requested before any spectra were accumulated")]
    BaselineEmpty,
    #[error("SNR calibration does not cover the processed band")]
    SnrSpanMismatch,
    #[error("no SNR calibration loaded")]
    SnrMissing,
}

/// Static knobs for the processing chain.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub samples_per_buffer: usize,
    pub sample_rate_hz: f64,
    /// Spectra are averaged in groups of this size before emission.
    pub sub_spectra_averaging: usize,
    pub target_coupling: f64,
    /// Number of bins interpolated over at the DC end of the spectrum.
    pub dc_trim_bins: usize,
    /// Baseline filter stopband edge, in cycles per bin.
    pub baseline_cutoff: f64,
    pub baseline_stopband_db: f64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            samples_per_buffer: 1 << 14,
            sample_rate_hz: 10e6,
            sub_spectra_averaging: 1,
            target_coupling: 1.0,
            dc_trim_bins: 3,
            baseline_cutoff: 0.02,
            baseline_stopband_db: 40.0,
        }
    }
}

/// Takes voltage-domain buffers to rescaled spectra. Single-writer: only the
/// processing stage touches the averaging and baseline state.
pub struct DataProcessor {
    fft: Arc<dyn Fft<f64>>,
    scratch: Vec<Complex<f64>>,
    work: Vec<Complex<f64>>,
    cfg: ProcessorConfig,
    lo_freq_hz: f64,

    avg_primary: Vec<f64>,
    avg_image: Vec<f64>,
    avg_count: usize,

    pub bad_bins: Vec<usize>,
    pub dc_bins: Vec<usize>,

    baseline_filter: BaselineFilter,
    running_average: Vec<f64>,
    current_baseline: Vec<f64>,
    num_spectra: usize,

    snr: Option<Spectrum>,
    trimmed_snr: Spectrum,
}

impl std::fmt::Debug for DataProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataProcessor")
            .field("cfg", &self.cfg)
            .field("lo_freq_hz", &self.lo_freq_hz)
            .field("avg_count", &self.avg_count)
            .field("num_spectra", &self.num_spectra)
            .finish_non_exhaustive()
    }
}

impl DataProcessor {
    pub fn new(cfg: ProcessorConfig, lo_freq_hz: f64) -> Result<Self, crate::digitizer::ConfigError> {
        use crate::digitizer::ConfigError;
        if cfg.samples_per_buffer == 0 {
            return Err(ConfigError::ZeroSamples);
        }
        if cfg.samples_per_buffer % 2 != 0 {
            return Err(ConfigError::OddSamplesPerBuffer(cfg.samples_per_buffer));
        }
        let fft = FftPlanner::new().plan_fft_forward(cfg.samples_per_buffer);
        let scratch = vec![Complex::default(); fft.get_inplace_scratch_len()];
        let bins = cfg.samples_per_buffer / 2;
        let dc_bins: Vec<usize> = (0..cfg.dc_trim_bins.min(bins)).collect();
        let baseline_filter = BaselineFilter::chebyshev2(
            6,
            cfg.baseline_stopband_db,
            cfg.baseline_cutoff,
            1.0,
        );
        Ok(Self {
            fft,
            scratch,
            work: vec![Complex::default(); cfg.samples_per_buffer],
            avg_primary: vec![0.0; bins],
            avg_image: vec![0.0; bins],
            avg_count: 0,
            bad_bins: Vec::new(),
            dc_bins,
            baseline_filter,
            running_average: Vec::new(),
            current_baseline: Vec::new(),
            num_spectra: 0,
            snr: None,
            trimmed_snr: Spectrum::default(),
            cfg,
            lo_freq_hz,
        })
    }

    /// Rebuild the baseline filter. Order 6 is the nominal design; cutoff is
    /// in cycles per bin.
    pub fn set_filter_params(&mut self, order: usize, cutoff: f64, stopband_db: f64) {
        self.baseline_filter = BaselineFilter::chebyshev2(order, stopband_db, cutoff, 1.0);
    }

    pub fn filter_response(&self, points: usize) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        self.baseline_filter.response(points)
    }

    /// Move to a new LO tuning. The caller is responsible for resetting the
    /// baseline so tunings do not contaminate each other.
    pub fn retune(&mut self, lo_freq_hz: f64) {
        self.lo_freq_hz = lo_freq_hz;
        self.avg_primary.fill(0.0);
        self.avg_image.fill(0.0);
        self.avg_count = 0;
    }

    pub fn lo_freq_hz(&self) -> f64 {
        self.lo_freq_hz
    }

    pub fn set_snr(&mut self, snr: Spectrum) {
        self.snr = Some(snr);
    }

    pub fn num_spectra(&self) -> usize {
        self.num_spectra
    }

    pub fn current_baseline(&self) -> &[f64] {
        &self.current_baseline
    }

    fn bin_width_hz(&self) -> f64 {
        self.cfg.sample_rate_hz / self.cfg.samples_per_buffer as f64
    }

    /// Frequency label of primary-sideband bin `k`.
    fn freq_of_bin(&self, k: usize) -> f64 {
        let n = self.cfg.samples_per_buffer as f64;
        self.lo_freq_hz + (k as f64 - n / 4.0) * self.bin_width_hz()
    }

    /// FFT one buffer and fold its sideband powers into the sub-spectrum
    /// average. Returns the averaged (primary, image) pair every
    /// `sub_spectra_averaging` buffers, `None` otherwise.
    pub fn acquired_to_raw(
        &mut self,
        buffer: &RawBuffer,
    ) -> Result<Option<(Spectrum, Spectrum)>, ProcessingError> {
        let n = self.cfg.samples_per_buffer;
        if buffer.samples.len() != n {
            return Err(ProcessingError::BufferLengthMismatch {
                expected: n,
                got: buffer.samples.len(),
            });
        }
        self.work.copy_from_slice(&buffer.samples);
        self.fft.process_with_scratch(&mut self.work, &mut self.scratch);

        // The acquisition-side sign alternation moved physical DC to bin
        // N/2, so the primary sideband is X[N/2..] and the image mirrors it.
        let half = n / 2;
        for k in 0..half {
            self.avg_primary[k] += self.work[half + k].norm_sqr();
            self.avg_image[k] += self.work[half - k].norm_sqr();
        }
        self.avg_count += 1;
        if self.avg_count < self.cfg.sub_spectra_averaging {
            return Ok(None);
        }

        let scale = 1.0 / self.avg_count as f64;
        let mut primary: Vec<f64> = self.avg_primary.iter().map(|p| p * scale).collect();
        let mut image: Vec<f64> = self.avg_image.iter().map(|p| p * scale).collect();
        self.avg_primary.fill(0.0);
        self.avg_image.fill(0.0);
        self.avg_count = 0;

        self.remove_bad_bins(&mut primary);
        self.remove_bad_bins(&mut image);

        let freq_axis: Vec<f64> = (0..half).map(|k| self.freq_of_bin(k)).collect();
        let primary = Spectrum::new(primary, freq_axis.clone(), self.lo_freq_hz);
        let image = Spectrum::new(image, freq_axis, self.lo_freq_hz);
        Ok(Some((primary, image)))
    }

    /// Linearly interpolate across the masked artifact bins, copying the
    /// nearest clean value when a masked run touches either end.
    pub fn remove_bad_bins(&self, powers: &mut [f64]) {
        let mut mask: Vec<usize> = self
            .bad_bins
            .iter()
            .chain(self.dc_bins.iter())
            .copied()
            .filter(|&i| i < powers.len())
            .collect();
        mask.sort_unstable();
        mask.dedup();
        interpolate_over(powers, &mask);
    }

    /// Accumulate a raw spectrum into the rolling baseline average.
    pub fn add_raw_to_running_average(&mut self, raw: &Spectrum) -> Result<(), ProcessingError> {
        if raw.is_empty() {
            return Err(ProcessingError::EmptySpectrum);
        }
        if self.running_average.is_empty() {
            self.running_average = vec![0.0; raw.len()];
        }
        if self.running_average.len() != raw.len() {
            return Err(ProcessingError::BaselineSizeMismatch {
                expected: raw.len(),
                got: self.running_average.len(),
            });
        }
        for (acc, p) in self.running_average.iter_mut().zip(&raw.powers) {
            *acc += p;
        }
        self.num_spectra += 1;
        Ok(())
    }

    /// Low-pass the mean accumulated power into the current baseline.
    pub fn update_baseline(&mut self) -> Result<(), ProcessingError> {
        if self.num_spectra == 0 {
            return Err(ProcessingError::BaselineEmpty);
        }
        let mean: Vec<f64> = self
            .running_average
            .iter()
            .map(|p| p / self.num_spectra as f64)
            .collect();
        self.current_baseline = self.baseline_filter.filtfilt(&mean);
        Ok(())
    }

    /// Discard all baseline state. Called at the start of each LO tuning.
    pub fn reset_baselining(&mut self) {
        self.running_average.clear();
        self.current_baseline.clear();
        self.num_spectra = 0;
    }

    /// Divide out the baseline: dimensionless excess power with mean 0
    /// under the null hypothesis.
    pub fn raw_to_processed(&self, raw: &Spectrum) -> Result<Spectrum, ProcessingError> {
        if raw.is_empty() {
            return Err(ProcessingError::EmptySpectrum);
        }
        if self.current_baseline.len() != raw.len() {
            return Err(ProcessingError::BaselineSizeMismatch {
                expected: raw.len(),
                got: self.current_baseline.len(),
            });
        }
        let powers: Vec<f64> = raw
            .powers
            .iter()
            .zip(&self.current_baseline)
            .map(|(p, b)| p / b - 1.0)
            .collect();
        Ok(Spectrum::new(
            powers,
            raw.freq_axis.clone(),
            raw.true_center_freq,
        ))
    }

    /// Scale the processed excess by per-bin SNR over target coupling
    /// squared, and attach the per-bin standard deviation of the result.
    pub fn processed_to_rescaled(
        &mut self,
        processed: &Spectrum,
    ) -> Result<Rescaled, ProcessingError> {
        self.trim_snr_to_match(processed)?;
        let g2 = self.cfg.target_coupling * self.cfg.target_coupling;
        let averages = self.cfg.sub_spectra_averaging.max(1) as f64;
        let mut powers = Vec::with_capacity(processed.len());
        let mut sigma = Vec::with_capacity(processed.len());
        for (p, snr) in processed.powers.iter().zip(&self.trimmed_snr.powers) {
            let kappa = snr / g2;
            powers.push(p * kappa);
            // Per-bin deviation of the excess is 1/sqrt(M), scaled by the
            // same factor as the power.
            sigma.push(kappa / averages.sqrt());
        }
        Ok(Rescaled {
            spectrum: Spectrum::new(
                powers,
                processed.freq_axis.clone(),
                processed.true_center_freq,
            ),
            sigma,
        })
    }

    /// Slice the loaded SNR calibration to the frequency span of the given
    /// spectrum. Fails when the band is not covered.
    pub fn trim_snr_to_match(&mut self, spectrum: &Spectrum) -> Result<(), ProcessingError> {
        if spectrum.is_empty() {
            return Err(ProcessingError::EmptySpectrum);
        }
        let snr = self.snr.as_ref().ok_or(ProcessingError::SnrMissing)?;
        if snr.powers.is_empty() || snr.freq_axis.is_empty() {
            return Err(ProcessingError::EmptySpectrum);
        }
        let first = spectrum.freq_axis[0];
        let last = *spectrum.freq_axis.last().unwrap();
        let half_bin = spectrum.bin_width().abs() / 2.0;
        if snr.freq_axis[0] > first + half_bin || *snr.freq_axis.last().unwrap() < last - half_bin
        {
            return Err(ProcessingError::SnrSpanMismatch);
        }
        let lo = closest_index(&snr.freq_axis, first);
        let hi = closest_index(&snr.freq_axis, last);
        let trimmed = Spectrum::new(
            snr.powers[lo..=hi].to_vec(),
            snr.freq_axis[lo..=hi].to_vec(),
            snr.true_center_freq,
        );
        if trimmed.len() != spectrum.len() {
            debug!(
                trimmed = trimmed.len(),
                spectrum = spectrum.len(),
                "SNR grid does not match the processed grid"
            );
            return Err(ProcessingError::SnrSpanMismatch);
        }
        self.trimmed_snr = trimmed;
        Ok(())
    }

    /// Refresh the artifact mask from the accumulated mean spectrum: bins
    /// that stand above the local level by `multiplier` standard deviations
    /// in a moving window are flagged.
    pub fn refresh_bad_bins(&mut self, window: usize, multiplier: f64) {
        if self.num_spectra == 0 {
            return;
        }
        let mean: Vec<f64> = self
            .running_average
            .iter()
            .map(|p| p / self.num_spectra as f64)
            .collect();
        self.bad_bins = find_outliers(&mean, window, multiplier);
        debug!(count = self.bad_bins.len(), "bad bin mask refreshed");
    }
}

/// Mean and standard deviation of a slice. NaN for empty input.
pub fn vector_stats(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance =
        values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
    (mean, variance.sqrt())
}

/// Indices whose value exceeds the moving-window mean by `multiplier`
/// standard deviations.
pub fn find_outliers(values: &[f64], window: usize, multiplier: f64) -> Vec<usize> {
    let half = window / 2;
    let mut outliers = Vec::new();
    if values.len() <= window {
        return outliers;
    }
    for i in half..values.len() - half {
        let (mean, std_dev) = vector_stats(&values[i - half..=i + half]);
        if values[i] > mean + multiplier * std_dev {
            outliers.push(i);
        }
    }
    outliers
}

/// Replace the values at `mask` (sorted, deduplicated) by linear
/// interpolation between the nearest unmasked neighbours; runs touching an
/// end copy the nearest clean value.
pub fn interpolate_over(values: &mut [f64], mask: &[usize]) {
    let n = values.len();
    if n == 0 || mask.is_empty() {
        return;
    }
    let mut run = 0usize;
    while run < mask.len() {
        let start = mask[run];
        let mut stop = run;
        while stop + 1 < mask.len() && mask[stop + 1] == mask[stop] + 1 {
            stop += 1;
        }
        let end = mask[stop];

        let left = start.checked_sub(1);
        let right = if end + 1 < n { Some(end + 1) } else { None };
        match (left, right) {
            (Some(l), Some(r)) => {
                let span = (r - l) as f64;
                for i in start..=end {
                    let t = (i - l) as f64 / span;
                    values[i] = values[l] * (1.0 - t) + values[r] * t;
                }
            }
            (None, Some(r)) => {
                for i in start..=end {
                    values[i] = values[r];
                }
            }
            (Some(l), None) => {
                for i in start..=end {
                    values[i] = values[l];
                }
            }
            (None, None) => {}
        }
        run = stop + 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor(n: usize, averaging: usize) -> DataProcessor {
        DataProcessor::new(
            ProcessorConfig {
                samples_per_buffer: n,
                sample_rate_hz: 16e6,
                sub_spectra_averaging: averaging,
                target_coupling: 1.0,
                dc_trim_bins: 0,
                ..ProcessorConfig::default()
            },
            5e9,
        )
        .unwrap()
    }

    fn tone_buffer(n: usize, sample_rate: f64, if_freq: f64, amplitude: f64) -> RawBuffer {
        let samples: Vec<Complex<f64>> = (0..n)
            .map(|i| {
                let t = i as f64 / sample_rate;
                let phase = 2.0 * std::f64::consts::PI * if_freq * t;
                let sign = if i % 2 == 1 { -1.0 } else { 1.0 };
                Complex::new(sign * amplitude * phase.cos(), sign * amplitude * phase.sin())
            })
            .collect();
        RawBuffer { index: 0, samples }
    }

    #[test]
    fn odd_fft_length_is_rejected() {
        let err = DataProcessor::new(
            ProcessorConfig {
                samples_per_buffer: 4097,
                ..ProcessorConfig::default()
            },
            0.0,
        )
        .unwrap_err();
        assert_eq!(err, crate::digitizer::ConfigError::OddSamplesPerBuffer(4097));
    }

    #[test]
    fn tone_lands_on_the_expected_bin() {
        let n = 4096;
        let fs = 16e6;
        let mut proc = processor(n, 1);
        // IF of fs/4 + 1 MHz labels as lo + 1 MHz.
        let if_freq = fs / 4.0 + 1e6;
        let buffer = tone_buffer(n, fs, if_freq, 0.1);
        let (primary, _image) = proc.acquired_to_raw(&buffer).unwrap().unwrap();

        let peak = primary
            .powers
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap()
            .0;
        assert_eq!(peak, primary.closest_bin(5e9 + 1e6));
        assert_eq!(primary.len(), n / 2);
        // Frequency axis is strictly increasing.
        assert!(primary
            .freq_axis
            .windows(2)
            .all(|w| w[1] > w[0]));
    }

    #[test]
    fn image_sideband_mirrors_negative_frequencies() {
        let n = 4096;
        let fs = 16e6;
        let mut proc = processor(n, 1);
        let if_freq = fs / 4.0 + 1e6;
        // Conjugate tone: energy sits in the negative sideband.
        let mut buffer = tone_buffer(n, fs, if_freq, 0.1);
        for s in &mut buffer.samples {
            s.im = -s.im;
        }
        let (primary, image) = proc.acquired_to_raw(&buffer).unwrap().unwrap();

        let image_peak = image
            .powers
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap();
        assert_eq!(image_peak.0, image.closest_bin(5e9 + 1e6));
        let primary_at_peak = primary.powers[image_peak.0];
        assert!(primary_at_peak < image_peak.1 * 1e-3);
    }

    #[test]
    fn sub_spectra_are_averaged_before_emission() {
        let n = 256;
        let fs = 16e6;
        let mut proc = processor(n, 3);
        let buffer = tone_buffer(n, fs, fs / 8.0, 0.2);
        assert!(proc.acquired_to_raw(&buffer).unwrap().is_none());
        assert!(proc.acquired_to_raw(&buffer).unwrap().is_none());
        assert!(proc.acquired_to_raw(&buffer).unwrap().is_some());
        // Accumulator restarts after an emission.
        assert!(proc.acquired_to_raw(&buffer).unwrap().is_none());
    }

    #[test]
    fn baseline_reset_is_idempotent() {
        let mut proc = processor(256, 1);
        let raw = Spectrum::new(vec![1.0; 128], (0..128).map(|i| i as f64).collect(), 0.0);
        proc.reset_baselining();
        proc.add_raw_to_running_average(&raw).unwrap();
        proc.add_raw_to_running_average(&raw).unwrap();
        assert_eq!(proc.num_spectra(), 2);
        proc.reset_baselining();
        assert_eq!(proc.num_spectra(), 0);
        assert!(proc.current_baseline().is_empty());
        assert!(proc.running_average.is_empty());
    }

    #[test]
    fn constant_spectrum_yields_constant_baseline() {
        let mut proc = processor(256, 1);
        let raw = Spectrum::new(vec![4.0; 128], (0..128).map(|i| i as f64).collect(), 0.0);
        proc.add_raw_to_running_average(&raw).unwrap();
        proc.update_baseline().unwrap();
        for b in proc.current_baseline() {
            assert!((b - 4.0).abs() < 1e-9);
        }
        let processed = proc.raw_to_processed(&raw).unwrap();
        for p in processed.powers {
            assert!(p.abs() < 1e-9);
        }
    }

    #[test]
    fn baseline_size_mismatch_is_fatal() {
        let mut proc = processor(256, 1);
        let raw = Spectrum::new(vec![1.0; 128], (0..128).map(|i| i as f64).collect(), 0.0);
        proc.add_raw_to_running_average(&raw).unwrap();
        let shorter = Spectrum::new(vec![1.0; 64], (0..64).map(|i| i as f64).collect(), 0.0);
        assert!(matches!(
            proc.add_raw_to_running_average(&shorter),
            Err(ProcessingError::BaselineSizeMismatch { .. })
        ));
    }

    #[test]
    fn rescaling_applies_snr_over_coupling_squared() {
        let mut proc = DataProcessor::new(
            ProcessorConfig {
                samples_per_buffer: 16,
                sub_spectra_averaging: 4,
                target_coupling: 0.5,
                dc_trim_bins: 0,
                ..ProcessorConfig::default()
            },
            0.0,
        )
        .unwrap();
        let axis: Vec<f64> = (0..8).map(|i| 100.0 + i as f64).collect();
        proc.set_snr(Spectrum::new(vec![2.0; 8], axis.clone(), 0.0));
        let processed = Spectrum::new(vec![0.5; 8], axis, 0.0);
        let rescaled = proc.processed_to_rescaled(&processed).unwrap();
        // kappa = 2 / 0.25 = 8.
        for p in &rescaled.spectrum.powers {
            assert!((p - 4.0).abs() < 1e-12);
        }
        for s in &rescaled.sigma {
            assert!((s - 8.0 / 2.0).abs() < 1e-12);
        }
    }

    #[test]
    fn empty_snr_calibration_is_rejected() {
        let mut proc = processor(16, 1);
        let axis: Vec<f64> = (0..8).map(|i| 100.0 + i as f64).collect();
        let processed = Spectrum::new(vec![0.0; 8], axis.clone(), 0.0);

        proc.set_snr(Spectrum::default());
        assert_eq!(
            proc.processed_to_rescaled(&processed).unwrap_err(),
            ProcessingError::EmptySpectrum
        );

        // Powers without a frequency axis are just as unusable.
        proc.set_snr(Spectrum {
            powers: vec![1.0; 8],
            freq_axis: Vec::new(),
            true_center_freq: 0.0,
        });
        assert_eq!(
            proc.processed_to_rescaled(&processed).unwrap_err(),
            ProcessingError::EmptySpectrum
        );
    }

    #[test]
    fn snr_outside_band_fails() {
        let mut proc = processor(16, 1);
        let axis: Vec<f64> = (0..8).map(|i| 100.0 + i as f64).collect();
        proc.set_snr(Spectrum::new(vec![1.0; 4], vec![102.0, 103.0, 104.0, 105.0], 0.0));
        let processed = Spectrum::new(vec![0.0; 8], axis, 0.0);
        assert_eq!(
            proc.processed_to_rescaled(&processed).unwrap_err(),
            ProcessingError::SnrSpanMismatch
        );
    }

    #[test]
    fn interpolation_bridges_masked_runs() {
        let mut values = vec![1.0, 9.0, 9.0, 4.0, 9.0, 6.0];
        interpolate_over(&mut values, &[1, 2, 4]);
        assert!((values[1] - 2.0).abs() < 1e-12);
        assert!((values[2] - 3.0).abs() < 1e-12);
        assert!((values[4] - 5.0).abs() < 1e-12);
    }

    #[test]
    fn interpolation_copies_at_the_edges() {
        let mut values = vec![9.0, 9.0, 3.0, 9.0];
        interpolate_over(&mut values, &[0, 1, 3]);
        assert_eq!(values, vec![3.0, 3.0, 3.0, 3.0]);
    }

    #[test]
    fn refreshed_bad_bins_are_interpolated_away() {
        let mut proc = processor(256, 1);
        let mut powers = vec![1.0; 128];
        powers[40] = 80.0;
        let raw = Spectrum::new(powers, (0..128).map(|i| i as f64).collect(), 0.0);
        proc.add_raw_to_running_average(&raw).unwrap();
        proc.refresh_bad_bins(16, 3.0);
        assert_eq!(proc.bad_bins, vec![40]);

        let mut cleaned = raw.powers.clone();
        proc.remove_bad_bins(&mut cleaned);
        assert!((cleaned[40] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn outlier_scan_flags_spikes() {
        let mut values = vec![1.0; 64];
        values[20] = 50.0;
        let outliers = find_outliers(&values, 16, 3.0);
        assert_eq!(outliers, vec![20]);
    }
}
