//! Spectrum containers and the combine/rebin operations that merge rescaled
//! spectra from different LO tunings onto one wideband grid.

/// A power spectrum on a strictly increasing frequency axis. Powers are
/// nonnegative for raw and processed spectra; after SNR rescaling they are
/// dimensionless excesses and may be negative.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Spectrum {
    pub powers: Vec<f64>,
    pub freq_axis: Vec<f64>,
    pub true_center_freq: f64,
}

impl Spectrum {
    pub fn new(powers: Vec<f64>, freq_axis: Vec<f64>, true_center_freq: f64) -> Self {
        debug_assert_eq!(powers.len(), freq_axis.len());
        Self {
            powers,
            freq_axis,
            true_center_freq,
        }
    }

    pub fn len(&self) -> usize {
        self.powers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.powers.is_empty()
    }

    /// Grid spacing in Hz. Meaningful only for uniformly gridded spectra
    /// with at least two bins.
    pub fn bin_width(&self) -> f64 {
        if self.freq_axis.len() < 2 {
            return 0.0;
        }
        self.freq_axis[1] - self.freq_axis[0]
    }

    /// Index of the bin whose frequency is closest to `target_hz`.
    pub fn closest_bin(&self, target_hz: f64) -> usize {
        closest_index(&self.freq_axis, target_hz)
    }
}

/// Index of the element of a sorted axis closest to `target`.
pub fn closest_index(axis: &[f64], target: f64) -> usize {
    debug_assert!(!axis.is_empty());
    let upper = axis.partition_point(|&f| f < target);
    if upper == 0 {
        return 0;
    }
    if upper == axis.len() {
        return axis.len() - 1;
    }
    if (axis[upper] - target).abs() < (target - axis[upper - 1]).abs() {
        upper
    } else {
        upper - 1
    }
}

/// A rescaled spectrum together with its per-bin standard deviation, ready
/// for inverse-variance combination.
#[derive(Debug, Clone)]
pub struct Rescaled {
    pub spectrum: Spectrum,
    pub sigma: Vec<f64>,
}

/// Running inverse-variance-weighted mean of rescaled spectra on a global
/// grid. The bin width is frozen by the first contribution; bins with
/// `weight_sum == 0` are sentinel-empty.
#[derive(Debug, Clone, Default)]
pub struct CombinedSpectrum {
    pub powers: Vec<f64>,
    pub freq_axis: Vec<f64>,
    pub sigma_combined: Vec<f64>,
    pub weight_sum: Vec<f64>,
    pub bin_width: f64,
}

impl CombinedSpectrum {
    pub fn len(&self) -> usize {
        self.powers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.powers.is_empty()
    }

    /// Discard all contributions. Called at scan start.
    pub fn reset(&mut self) {
        *self = CombinedSpectrum::default();
    }

    /// Fold one rescaled spectrum into the running weighted mean. The grid
    /// extends (zero-filled) when the contribution reaches past either edge;
    /// source bins align to destination bins within half a bin width.
    pub fn add_rescaled(&mut self, rescaled: &Rescaled) {
        let spectrum = &rescaled.spectrum;
        debug_assert_eq!(spectrum.len(), rescaled.sigma.len());
        if spectrum.is_empty() {
            return;
        }
        if self.is_empty() {
            self.bin_width = spectrum.bin_width();
        }
        if self.freq_axis.is_empty() {
            self.freq_axis = spectrum.freq_axis.clone();
            let n = spectrum.len();
            self.powers = vec![0.0; n];
            self.sigma_combined = vec![0.0; n];
            self.weight_sum = vec![0.0; n];
        } else {
            let first = self.destination_bin(spectrum.freq_axis[0]);
            if first < 0 {
                self.grow_front((-first) as usize);
            }
            let last = self.destination_bin(*spectrum.freq_axis.last().unwrap());
            if last >= self.len() as isize {
                self.grow_back(last as usize - self.len() + 1);
            }
        }

        for i in 0..spectrum.len() {
            let j = self.destination_bin(spectrum.freq_axis[i]);
            debug_assert!(j >= 0 && (j as usize) < self.len());
            let j = j as usize;
            let weight = 1.0 / (rescaled.sigma[i] * rescaled.sigma[i]);
            self.weight_sum[j] += weight;
            self.powers[j] +=
                weight * (spectrum.powers[i] - self.powers[j]) / self.weight_sum[j];
            self.sigma_combined[j] = 1.0 / self.weight_sum[j].sqrt();
        }
    }

    fn destination_bin(&self, freq_hz: f64) -> isize {
        ((freq_hz - self.freq_axis[0]) / self.bin_width).round() as isize
    }

    fn grow_front(&mut self, count: usize) {
        let f0 = self.freq_axis[0];
        let mut axis = Vec::with_capacity(self.len() + count);
        for k in (1..=count).rev() {
            axis.push(f0 - k as f64 * self.bin_width);
        }
        axis.extend_from_slice(&self.freq_axis);
        self.freq_axis = axis;
        prepend_zeros(&mut self.powers, count);
        prepend_zeros(&mut self.sigma_combined, count);
        prepend_zeros(&mut self.weight_sum, count);
    }

    fn grow_back(&mut self, count: usize) {
        let last = *self.freq_axis.last().unwrap();
        for k in 1..=count {
            self.freq_axis.push(last + k as f64 * self.bin_width);
        }
        self.powers.extend(std::iter::repeat(0.0).take(count));
        self.sigma_combined.extend(std::iter::repeat(0.0).take(count));
        self.weight_sum.extend(std::iter::repeat(0.0).take(count));
    }

    /// Rebin into blocks of `rebin_width` bins (trailing partial block
    /// dropped), combining within each block by inverse variance, then
    /// convolve the power array with a flat kernel of `convolution_width`
    /// (the kernel shrinks near the edges). The rebinned frequency axis is
    /// the center of each block.
    pub fn rebin(&self, rebin_width: usize, convolution_width: usize) -> CombinedSpectrum {
        let rebin_width = rebin_width.max(1);
        let blocks = self.len() / rebin_width;
        let mut out = CombinedSpectrum {
            powers: Vec::with_capacity(blocks),
            freq_axis: Vec::with_capacity(blocks),
            sigma_combined: Vec::with_capacity(blocks),
            weight_sum: Vec::with_capacity(blocks),
            bin_width: self.bin_width * rebin_width as f64,
        };
        for block in 0..blocks {
            let start = block * rebin_width;
            let end = start + rebin_width;
            let mut weight = 0.0;
            let mut power = 0.0;
            for i in start..end {
                weight += self.weight_sum[i];
                power += self.weight_sum[i] * self.powers[i];
            }
            if weight > 0.0 {
                power /= weight;
            }
            out.powers.push(power);
            out.weight_sum.push(weight);
            out.sigma_combined
                .push(if weight > 0.0 { 1.0 / weight.sqrt() } else { 0.0 });
            out.freq_axis
                .push((self.freq_axis[start] + self.freq_axis[end - 1]) / 2.0);
        }
        if convolution_width > 1 {
            out.powers = convolve_flat(&out.powers, convolution_width);
        }
        out
    }
}

fn prepend_zeros(values: &mut Vec<f64>, count: usize) {
    let mut front = vec![0.0; count];
    front.extend_from_slice(values);
    *values = front;
}

/// Moving average with a flat kernel of `width`, shrinking the kernel at
/// the boundaries instead of padding.
pub fn convolve_flat(values: &[f64], width: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let lo = i.saturating_sub(width / 2);
        let hi = (i + (width - 1) / 2).min(n.saturating_sub(1));
        let window = &values[lo..=hi];
        out.push(window.iter().sum::<f64>() / window.len() as f64);
    }
    out
}
